//! etcd gRPC endpoint.
//!
//! Every call is answered with a trailers-only gRPC response. Calls for a
//! known cluster report `UNIMPLEMENTED`; calls that cannot be mapped to a
//! cluster report `NOT_FOUND`.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Extension, State};
use axum::http::Uri;
use axum::response::Response;
use axum::Router;
use tonic::Status;
use tracing::debug;

use super::{ClusterResolver, Manager};
use crate::server::ListenerAddress;

#[derive(Clone)]
struct EtcdState {
    manager: Arc<dyn Manager>,
    resolver: ClusterResolver,
}

/// Build the etcd backend shared by all clusters.
pub fn etcd_handler(manager: Arc<dyn Manager>, resolver: ClusterResolver) -> Router {
    Router::new()
        .fallback(handle_call)
        .with_state(EtcdState { manager, resolver })
}

async fn handle_call(
    State(state): State<EtcdState>,
    Extension(listener): Extension<ListenerAddress>,
    uri: Uri,
) -> Response {
    let method = uri.path();

    let cluster = match state.resolver.resolve(&listener.0).await {
        Ok(cluster) if state.manager.has_resource_group(&cluster) => cluster,
        Ok(cluster) => {
            return grpc_error_response(Status::not_found(format!(
                "resource group for workload cluster {cluster} is not available"
            )))
        }
        Err(e) => {
            debug!(address = %listener.0, error = %e, "Unable to resolve workload cluster");
            return grpc_error_response(Status::not_found(e.to_string()));
        }
    };

    debug!(cluster = %cluster, method = %method, "etcd call");
    grpc_error_response(Status::unimplemented(format!(
        "method {method} is not implemented for workload cluster {cluster}"
    )))
}

/// Build a trailers-only gRPC error response.
fn grpc_error_response(status: Status) -> Response {
    status.into_http().map(Body::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryManager;
    use crate::registry::Registry;
    use axum::http::header::CONTENT_TYPE;
    use axum::http::{Request, StatusCode, Version};
    use tower::ServiceExt;
    use wklmux_networking::PortRange;

    fn request(listener: &str) -> Request<Body> {
        let mut req = Request::builder()
            .uri("/etcdserverpb.KV/Range")
            .version(Version::HTTP_2)
            .header(CONTENT_TYPE, "application/grpc")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ListenerAddress(listener.to_string()));
        req
    }

    #[tokio::test]
    async fn test_grpc_status() {
        let registry = Registry::new("127.0.0.1", PortRange::new(20000, 20010).unwrap()).shared();
        registry.write().await.init_listener("wkl-1").unwrap();
        let manager = Arc::new(InMemoryManager::new());
        manager.add_resource_group("wkl-1");
        let router = etcd_handler(manager, ClusterResolver::new(registry));

        let resp = router
            .clone()
            .oneshot(request("127.0.0.1:20000"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["grpc-status"], "12");
        assert!(resp.headers()["grpc-message"]
            .to_str()
            .unwrap()
            .contains("wkl-1"));

        let resp = router.oneshot(request("127.0.0.1:20009")).await.unwrap();
        assert_eq!(resp.headers()["grpc-status"], "5");
    }

    #[tokio::test]
    async fn test_message_is_encoded() {
        let registry = Registry::new("127.0.0.1", PortRange::new(20000, 20010).unwrap()).shared();
        registry.write().await.init_listener("wkl-1").unwrap();
        let router = etcd_handler(Arc::new(InMemoryManager::new()), ClusterResolver::new(registry));

        let resp = router.oneshot(request("127.0.0.1:20000")).await.unwrap();
        assert_eq!(resp.headers()[CONTENT_TYPE], "application/grpc");
        assert_eq!(resp.headers()["grpc-status"], "5");
        let message = resp.headers()["grpc-message"].to_str().unwrap();
        assert!(message.contains("wkl-1%20is%20not%20available"), "{message}");
    }
}
