use std::{future::Future, sync::Arc};

use axum::{
    Json, Router,
    extract::State as AxumState,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::{
    deployment::{ServiceStatus, ServiceSupervisor},
    store::StateStore,
};

/// Serves the observable state of one service over HTTP.
pub struct StatusServer {
    supervisor: Arc<ServiceSupervisor>,
    store: StateStore,
}

fn internal_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
}

impl StatusServer {
    pub fn new(supervisor: Arc<ServiceSupervisor>, store: StateStore) -> Self {
        Self { supervisor, store }
    }

    async fn get_service(AxumState(server): AxumState<Arc<StatusServer>>) -> Json<ServiceStatus> {
        Json(server.supervisor.status())
    }

    async fn get_deployment(AxumState(server): AxumState<Arc<StatusServer>>) -> Response {
        let status = server.supervisor.status();
        if let Some(run) = status.current_run.or(status.last_run) {
            return Json(run).into_response();
        }
        match server.store.latest_run() {
            Ok(Some(run)) => Json(run).into_response(),
            Ok(None) => (StatusCode::NOT_FOUND, "no deployment has run".to_string()).into_response(),
            Err(err) => internal_error(err),
        }
    }

    async fn get_resources(AxumState(server): AxumState<Arc<StatusServer>>) -> Response {
        match server.store.load_state() {
            Ok(state) => Json(state).into_response(),
            Err(err) => internal_error(err),
        }
    }

    async fn cancel_deployment(AxumState(server): AxumState<Arc<StatusServer>>) -> impl IntoResponse {
        if server.supervisor.cancel().await {
            (StatusCode::ACCEPTED, "deployment cancelled; rolling back".to_string())
        } else {
            (StatusCode::NOT_FOUND, "no deployment in progress".to_string())
        }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/service", get(StatusServer::get_service))
            .route(
                "/deployment",
                get(StatusServer::get_deployment).delete(StatusServer::cancel_deployment),
            )
            .route("/resources", get(StatusServer::get_resources))
            .with_state(Arc::new(self))
    }

    /// Serves until `shutdown` resolves.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        if let Ok(address) = listener.local_addr() {
            info!(%address, service = %self.supervisor.service(), "serving deployment status");
        }
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimBalancer, SimCluster};

    async fn spawn_server(dir: &std::path::Path) -> (String, tokio::sync::oneshot::Sender<()>) {
        let supervisor = Arc::new(ServiceSupervisor::new(
            "web",
            None,
            Arc::new(SimCluster::new()),
            Arc::new(SimBalancer::new()),
        ));
        let store = StateStore::open(dir).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel();

        let server = StatusServer::new(supervisor, store);
        tokio::spawn(server.serve(listener, async move {
            let _ = stopped.await;
        }));
        (format!("http://{address}"), stop)
    }

    #[tokio::test]
    async fn reports_service_and_missing_deployment() {
        let dir = tempfile::tempdir().unwrap();
        let (base, _stop) = spawn_server(dir.path()).await;
        let client = reqwest::Client::new();

        let service: serde_json::Value = client
            .get(format!("{base}/service"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(service["service"], "web");

        let response = client.get(format!("{base}/deployment")).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 404);

        let response = client.delete(format!("{base}/deployment")).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 404);
    }

    #[tokio::test]
    async fn resources_come_from_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let (base, _stop) = spawn_server(dir.path()).await;

        let state: serde_json::Value = reqwest::get(format!("{base}/resources"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(state["resources"].as_object().unwrap().is_empty());
    }
}
