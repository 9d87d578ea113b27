use std::net::SocketAddr;
use std::sync::Arc;

use gatehouse_core::{GatewayConfig, SessionStore, TaskStore, WorkerPool};

mod dispatch;
mod http;

pub use http::app_router;

/// Shared handles for every request handler. All mutation goes through the
/// component methods; the state itself is cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub pool: WorkerPool,
    pub sessions: SessionStore,
    pub tasks: TaskStore,
    pub api_keys: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(
        pool: WorkerPool,
        sessions: SessionStore,
        tasks: TaskStore,
        config: &GatewayConfig,
    ) -> Self {
        Self {
            pool,
            sessions,
            tasks,
            api_keys: Arc::new(config.api_keys.clone()),
        }
    }
}

/// Serve the gateway until ctrl-c. The caller is responsible for draining
/// the worker pool after this returns.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "gatehouse listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}
