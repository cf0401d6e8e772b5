//! Pipe front-end
//!
//! A single session over the process's own stdio. The principal comes
//! from a CLI-supplied token (or is anonymous); the session lives until
//! the downstream side closes the stream.

use rmcp::ServiceExt;

use crate::auth;
use crate::health::HealthHandle;
use crate::router::service::RouterService;
use crate::router::{RouterDeps, RouterEngine};

pub async fn serve(
    deps: RouterDeps,
    token: Option<String>,
    health: HealthHandle,
) -> anyhow::Result<()> {
    let cfg = deps.config.load();
    let principal = auth::principal_from_token(&cfg, token.as_deref())?;
    drop(cfg);

    let engine = RouterEngine::new(deps.clone(), principal);
    let service = RouterService::new(engine);

    tracing::info!("router serving on stdio");
    let running = service.serve(rmcp::transport::stdio()).await?;
    running.waiting().await?;
    tracing::info!("stdio session closed, shutting down");

    deps.manager.close_all().await;
    health.stop().await;
    Ok(())
}
