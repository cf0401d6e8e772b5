//! Config snapshots and hot reload
//!
//! The live configuration is published as an atomic snapshot pointer with
//! a single writer (the reloader). Every operation captures one snapshot
//! up front and uses it for its whole lifetime; a reload mid-call never
//! changes the rules under an in-flight request.
//!
//! The watcher debounces filesystem events, re-parses and validates the
//! file, and only swaps the snapshot on success; a broken edit leaves the
//! last good config in place.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::NormalizedConfig;
use crate::upstream::manager::UpstreamManager;

const DEBOUNCE: Duration = Duration::from_millis(200);

/// Shared snapshot pointer. Readers get an `Arc` to a consistent snapshot;
/// the reloader is the only writer.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<NormalizedConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: NormalizedConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Capture the current snapshot.
    pub fn load(&self) -> Arc<NormalizedConfig> {
        self.inner.read().clone()
    }

    /// Publish a new snapshot. Reloader-only.
    pub fn store(&self, config: NormalizedConfig) {
        *self.inner.write() = Arc::new(config);
    }
}

/// Watch a config file and republish on change. The watcher lives until
/// the cancellation token fires; reload failures are logged and the last
/// good snapshot retained.
pub fn spawn_watcher(
    path: PathBuf,
    handle: ConfigHandle,
    manager: Arc<UpstreamManager>,
    ct: CancellationToken,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<()>();

    let watched = path.clone();
    let mut watcher: RecommendedWatcher =
        notify::recommended_watcher(move |result: Result<Event, notify::Error>| match result {
            Ok(event) => {
                if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    let _ = tx.send(());
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "config watcher error");
            }
        })?;
    watcher.watch(&watched, RecursiveMode::NonRecursive)?;
    tracing::info!(config = %path.display(), "watching config file for changes");

    tokio::spawn(async move {
        // Keep the watcher alive for the lifetime of the task.
        let _watcher = watcher;
        loop {
            tokio::select! {
                _ = ct.cancelled() => break,
                event = rx.recv() => {
                    if event.is_none() {
                        break;
                    }
                }
            }
            // Debounce: editors fire bursts of events per save.
            tokio::time::sleep(DEBOUNCE).await;
            while rx.try_recv().is_ok() {}

            reload(&path, &handle, &manager).await;
        }
    });

    Ok(())
}

/// One reload pass: parse, validate, publish, reconcile. Shared with tests.
pub async fn reload(path: &std::path::Path, handle: &ConfigHandle, manager: &UpstreamManager) {
    match NormalizedConfig::load(path) {
        Ok(config) => {
            tracing::info!(
                upstreams = config.upstreams.len(),
                "config reloaded, reconciling upstream connections"
            );
            handle.store(config);
            let snapshot = handle.load();
            manager.reconcile(&snapshot).await;
        }
        Err(err) => {
            tracing::warn!(error = %err, "config reload failed; keeping previous config");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::manager::UpstreamManager;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("router.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[tokio::test]
    async fn reload_publishes_new_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, r#"{"toolExposure": "hierarchical"}"#);

        let handle = ConfigHandle::new(NormalizedConfig::parse("{}").unwrap());
        let manager = UpstreamManager::with_default_factory();

        std::fs::write(
            &path,
            r#"{"mcpServers": {"demo": {"transport": "http", "url": "http://localhost/mcp"}}}"#,
        )
        .unwrap();
        reload(&path, &handle, &manager).await;

        assert!(handle.load().upstreams.contains_key("demo"));
    }

    #[tokio::test]
    async fn failed_reload_retains_last_good() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"{"mcpServers": {"demo": {"transport": "http", "url": "http://localhost/mcp"}}}"#,
        );

        let initial = NormalizedConfig::load(&path).unwrap();
        let handle = ConfigHandle::new(initial);
        let manager = UpstreamManager::with_default_factory();

        std::fs::write(&path, "{ this is not json").unwrap();
        reload(&path, &handle, &manager).await;

        // previous config still in place
        assert!(handle.load().upstreams.contains_key("demo"));
    }

    #[tokio::test]
    async fn snapshots_are_stable_for_in_flight_readers() {
        let handle = ConfigHandle::new(
            NormalizedConfig::parse(
                r#"{"mcpServers": {"old": {"transport": "http", "url": "http://a/mcp"}}}"#,
            )
            .unwrap(),
        );

        let captured = handle.load();
        handle.store(
            NormalizedConfig::parse(
                r#"{"mcpServers": {"new": {"transport": "http", "url": "http://b/mcp"}}}"#,
            )
            .unwrap(),
        );

        // the captured snapshot still sees the old world
        assert!(captured.upstreams.contains_key("old"));
        assert!(handle.load().upstreams.contains_key("new"));
    }
}
