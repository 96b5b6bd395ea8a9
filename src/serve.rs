use std::{net::SocketAddr, sync::Arc};

use axum::{http::StatusCode, routing::get, Json, Router};
use tokio::{net::ToSocketAddrs, sync::oneshot::Sender, task::JoinHandle};
use tracing::info;

use crate::{
    collab::SessionManager,
    collab_endpoint::route_collab_to,
    collection_endpoint::route_collections_to,
    config::Config,
    environment_endpoint::route_environments_to,
    executor::{Executor, InFlight},
    request_endpoint::route_requests_to,
    state::AppState,
    store::DocumentStore,
};

pub struct ServerHandle {
    handle: JoinHandle<Result<(), String>>,
    close_tx: Sender<()>,
    addr: SocketAddr,
    state: AppState,
}

impl ServerHandle {
    /// Stops the collaboration sessions first so that open sockets end,
    /// then drains the HTTP server and closes the store.
    pub async fn shutdown(self) -> Result<(), String> {
        self.state.sessions.stop();
        self.close_tx
            .send(())
            .map_err(|_| "failed to send shutdown signal".to_string())?;
        let result = self.handle.await.unwrap_or_else(|e| Err(e.to_string()));
        self.state.store.close().await;
        info!("server stopped");
        result
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

pub fn app(state: AppState) -> Router {
    let health = Router::new().route("/health", get(health));
    let routes = route_collab_to(route_environments_to(route_requests_to(
        route_collections_to(health),
    )));
    routes.with_state(state)
}

pub async fn build_state(config: &Config) -> Result<AppState, String> {
    let store = DocumentStore::connect(&config.database_url)
        .await
        .map_err(|e| format!("cannot open store: {}", e))?;
    store
        .init()
        .await
        .map_err(|e| format!("cannot initialize store: {}", e))?;

    let executor = Executor::new(config.request_timeout())?;

    Ok(AppState {
        store,
        executor: Arc::new(executor),
        in_flight: InFlight::default(),
        sessions: Arc::new(SessionManager::start(config.session_options())),
        history_limit: config.history_limit,
    })
}

pub async fn serve<A: ToSocketAddrs>(config: &Config, addr: A) -> Result<ServerHandle, String> {
    let state = build_state(config).await?;
    let app = app(state.clone());

    let (close_tx, close_rx) = tokio::sync::oneshot::channel();

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("cannot listen: {}", e))?;
    let addr = listener
        .local_addr()
        .map_err(|e| format!("cannot get local address: {}", e))?;
    info!(%addr, "server listening");

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                _ = close_rx.await;
            })
            .await
            .map_err(|e| e.to_string())
    });

    Ok(ServerHandle {
        handle,
        close_tx,
        addr,
        state,
    })
}

async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}
