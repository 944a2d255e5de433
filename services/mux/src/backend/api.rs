//! Kubernetes API server discovery endpoints.

use std::sync::Arc;

use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{ClusterResolver, Manager};
use crate::server::ListenerAddress;

/// Kubernetes version reported by `/version`.
const KUBERNETES_MAJOR: &str = "1";
const KUBERNETES_MINOR: &str = "31";

/// Kubernetes `Status` object returned on failures.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub kind: String,
    pub api_version: String,
    pub status: String,
    pub message: String,
    pub reason: String,
    pub code: u16,
}

impl Status {
    fn failure(status: StatusCode, reason: &str, message: impl Into<String>) -> Self {
        Self {
            kind: "Status".to_string(),
            api_version: "v1".to_string(),
            status: "Failure".to_string(),
            message: message.into(),
            reason: reason.to_string(),
            code: status.as_u16(),
        }
    }
}

#[derive(Debug)]
struct ApiError(StatusCode, Status);

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self(
            StatusCode::NOT_FOUND,
            Status::failure(StatusCode::NOT_FOUND, "NotFound", message),
        )
    }

    fn service_unavailable(message: impl Into<String>) -> Self {
        Self(
            StatusCode::SERVICE_UNAVAILABLE,
            Status::failure(StatusCode::SERVICE_UNAVAILABLE, "ServiceUnavailable", message),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(self.1)).into_response()
    }
}

#[derive(Clone)]
struct ApiState {
    manager: Arc<dyn Manager>,
    resolver: ClusterResolver,
}

impl ApiState {
    async fn cluster(&self, listener: &ListenerAddress) -> Result<String, ApiError> {
        let cluster = self.resolver.resolve(&listener.0).await.map_err(|e| {
            debug!(address = %listener.0, error = %e, "Unable to resolve workload cluster");
            ApiError::not_found(e.to_string())
        })?;

        if !self.manager.has_resource_group(&cluster) {
            return Err(ApiError::service_unavailable(format!(
                "resource group for workload cluster {cluster} is not available"
            )));
        }

        Ok(cluster)
    }
}

/// Build the API server backend shared by all clusters.
pub fn api_server_handler(manager: Arc<dyn Manager>, resolver: ClusterResolver) -> Router {
    Router::new()
        .route("/version", get(version))
        .route("/api", get(api_versions))
        .route("/api/v1", get(api_resources))
        .route("/healthz", get(healthz))
        .fallback(not_found)
        .with_state(ApiState { manager, resolver })
}

async fn version(
    State(state): State<ApiState>,
    Extension(listener): Extension<ListenerAddress>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.cluster(&listener).await?;

    Ok(Json(json!({
        "major": KUBERNETES_MAJOR,
        "minor": KUBERNETES_MINOR,
        "gitVersion": format!("v{KUBERNETES_MAJOR}.{KUBERNETES_MINOR}.0"),
        "platform": format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
    })))
}

async fn api_versions(
    State(state): State<ApiState>,
    Extension(listener): Extension<ListenerAddress>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.cluster(&listener).await?;

    Ok(Json(json!({
        "kind": "APIVersions",
        "versions": ["v1"],
        "serverAddressByClientCIDRs": [
            { "clientCIDR": "0.0.0.0/0", "serverAddress": listener.0 }
        ],
    })))
}

async fn api_resources(
    State(state): State<ApiState>,
    Extension(listener): Extension<ListenerAddress>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.cluster(&listener).await?;

    let resources: Vec<_> = state
        .manager
        .api_resources()
        .into_iter()
        .map(|name| json!({ "name": name, "namespaced": name != "nodes" && name != "namespaces" }))
        .collect();

    Ok(Json(json!({
        "kind": "APIResourceList",
        "groupVersion": "v1",
        "resources": resources,
    })))
}

async fn healthz(
    State(state): State<ApiState>,
    Extension(listener): Extension<ListenerAddress>,
) -> Result<&'static str, ApiError> {
    state.cluster(&listener).await?;
    Ok("ok")
}

async fn not_found(
    State(state): State<ApiState>,
    Extension(listener): Extension<ListenerAddress>,
) -> ApiError {
    match state.cluster(&listener).await {
        Ok(cluster) => ApiError::not_found(format!(
            "the server could not find the requested resource in workload cluster {cluster}"
        )),
        Err(e) => e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryManager;
    use crate::registry::Registry;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use wklmux_networking::PortRange;

    async fn make_router() -> (Router, Arc<InMemoryManager>) {
        let registry = Registry::new("127.0.0.1", PortRange::new(20000, 20010).unwrap()).shared();
        registry.write().await.init_listener("wkl-1").unwrap();

        let manager = Arc::new(InMemoryManager::new());
        let router = api_server_handler(manager.clone(), ClusterResolver::new(registry));
        (router, manager)
    }

    fn request(uri: &str, listener: &str) -> Request<Body> {
        let mut req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        req.extensions_mut()
            .insert(ListenerAddress(listener.to_string()));
        req
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_version() {
        let (router, manager) = make_router().await;
        manager.add_resource_group("wkl-1");

        let resp = router
            .oneshot(request("/version", "127.0.0.1:20000"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["major"], "1");
    }

    #[tokio::test]
    async fn test_api_resources() {
        let (router, manager) = make_router().await;
        manager.add_resource_group("wkl-1");

        let resp = router
            .oneshot(request("/api/v1", "127.0.0.1:20000"))
            .await
            .unwrap();
        let body = json_body(resp).await;
        assert_eq!(body["kind"], "APIResourceList");
        assert!(body["resources"]
            .as_array()
            .unwrap()
            .iter()
            .any(|r| r["name"] == "pods"));
    }

    #[tokio::test]
    async fn test_unknown_listener() {
        let (router, _) = make_router().await;

        let resp = router
            .oneshot(request("/version", "127.0.0.1:20005"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let status: Status = serde_json::from_value(json_body(resp).await).unwrap();
        assert_eq!(status.kind, "Status");
        assert_eq!(status.reason, "NotFound");
    }

    #[tokio::test]
    async fn test_missing_resource_group() {
        let (router, _) = make_router().await;

        let resp = router
            .oneshot(request("/healthz", "127.0.0.1:20000"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
