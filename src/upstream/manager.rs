//! Upstream pool
//!
//! Keyed registry of upstream clients, constructed lazily on first use
//! through an injectable factory (tests substitute fakes here). A config
//! reload drives `reconcile`: clients whose upstream disappeared, was
//! disabled, or changed its fingerprint are closed and evicted; additions
//! stay lazy.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use super::http::HttpUpstream;
use super::stdio::StdioUpstream;
use super::UpstreamClient;
use crate::config::{NormalizedConfig, TransportKind};
use crate::error::{RouterError, RouterResult};

/// Builds a client for one upstream. The default implementation speaks
/// `rmcp`; tests plug in deterministic fakes.
pub trait UpstreamFactory: Send + Sync {
    fn build(&self, name: &str, cfg: &NormalizedConfig) -> RouterResult<Arc<dyn UpstreamClient>>;
}

pub struct RmcpUpstreamFactory;

impl UpstreamFactory for RmcpUpstreamFactory {
    fn build(&self, name: &str, cfg: &NormalizedConfig) -> RouterResult<Arc<dyn UpstreamClient>> {
        let upstream = cfg
            .upstreams
            .get(name)
            .ok_or_else(|| RouterError::BadRequest(format!("unknown upstream '{name}'")))?;
        match upstream.transport {
            TransportKind::Http => Ok(Arc::new(HttpUpstream::new(name, upstream)?)),
            TransportKind::Pipe => Ok(Arc::new(StdioUpstream::new(
                name,
                upstream,
                &cfg.sandbox.stdio,
            )?)),
        }
    }
}

struct ManagedEntry {
    client: Arc<dyn UpstreamClient>,
    fingerprint: String,
}

pub struct UpstreamManager {
    factory: Arc<dyn UpstreamFactory>,
    clients: Mutex<HashMap<String, ManagedEntry>>,
}

impl UpstreamManager {
    pub fn new(factory: Arc<dyn UpstreamFactory>) -> Self {
        Self {
            factory,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_default_factory() -> Self {
        Self::new(Arc::new(RmcpUpstreamFactory))
    }

    /// Return the client for `name`, constructing it from the caller's
    /// config snapshot on first use. A fingerprint mismatch (stale client
    /// surviving a reload race) closes the old client and rebuilds.
    pub async fn get(
        &self,
        name: &str,
        cfg: &NormalizedConfig,
    ) -> RouterResult<Arc<dyn UpstreamClient>> {
        let upstream = cfg
            .upstreams
            .get(name)
            .ok_or_else(|| RouterError::BadRequest(format!("unknown upstream '{name}'")))?;
        if !upstream.enabled {
            return Err(RouterError::BadRequest(format!("upstream '{name}' is disabled")));
        }
        let fingerprint = upstream.fingerprint();

        let mut clients = self.clients.lock().await;
        if let Some(entry) = clients.get(name) {
            if entry.fingerprint == fingerprint {
                return Ok(entry.client.clone());
            }
            let stale = clients.remove(name).map(|e| e.client);
            if let Some(stale) = stale {
                tokio::spawn(async move { stale.close().await });
            }
        }

        let client = self.factory.build(name, cfg)?;
        clients.insert(
            name.to_string(),
            ManagedEntry {
                client: client.clone(),
                fingerprint,
            },
        );
        Ok(client)
    }

    /// Apply a new config snapshot: close clients for upstreams that are
    /// gone, disabled, or changed. New upstreams are built on first use.
    pub async fn reconcile(&self, cfg: &NormalizedConfig) {
        let mut to_close = Vec::new();
        {
            let mut clients = self.clients.lock().await;
            let stale: Vec<String> = clients
                .iter()
                .filter(|(name, entry)| match cfg.upstreams.get(*name) {
                    None => true,
                    Some(upstream) => {
                        !upstream.enabled || upstream.fingerprint() != entry.fingerprint
                    }
                })
                .map(|(name, _)| name.clone())
                .collect();
            for name in stale {
                if let Some(entry) = clients.remove(&name) {
                    tracing::info!(upstream = %name, "closing upstream after config change");
                    to_close.push((name, entry.client));
                }
            }
        }

        let mut closing = JoinSet::new();
        for (_, client) in to_close {
            closing.spawn(async move { client.close().await });
        }
        while closing.join_next().await.is_some() {}
    }

    /// Drain every upstream concurrently and wait for completion.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<dyn UpstreamClient>> = {
            let mut clients = self.clients.lock().await;
            clients.drain().map(|(_, entry)| entry.client).collect()
        };
        let mut closing = JoinSet::new();
        for client in drained {
            closing.spawn(async move { client.close().await });
        }
        while closing.join_next().await.is_some() {}
    }

    /// Names with a live client; used by tests and reconcile assertions.
    pub async fn live_upstreams(&self) -> Vec<String> {
        let clients = self.clients.lock().await;
        let mut names: Vec<String> = clients.keys().cloned().collect();
        names.sort();
        names
    }
}
