//! Request-level demultiplexing between the API server and etcd backends.
//!
//! Both protocols share one port per cluster. etcd clients speak gRPC, which
//! is always HTTP/2 with an `application/grpc` content type; everything else
//! is treated as Kubernetes API traffic.

use std::convert::Infallible;

use axum::body::{Body, HttpBody};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Request, Response, Version};
use axum::{BoxError, Router};
use tower::ServiceExt;
use tracing::trace;

/// Content type prefix used by gRPC requests.
const GRPC_CONTENT_TYPE: &str = "application/grpc";

/// Request extension carrying the `host:port` of the listener a request
/// arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerAddress(pub String);

/// Backend a request is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    ApiServer,
    Etcd,
}

/// Classify a request by protocol version and content type.
pub fn classify(version: Version, content_type: Option<&HeaderValue>) -> Protocol {
    let grpc = content_type
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with(GRPC_CONTENT_TYPE));

    if version == Version::HTTP_2 && grpc {
        Protocol::Etcd
    } else {
        Protocol::ApiServer
    }
}

/// Routes requests for every cluster to the API server or etcd backend.
#[derive(Clone)]
pub struct MixedHandler {
    api_server: Router,
    etcd: Router,
}

impl MixedHandler {
    pub fn new(api_server: Router, etcd: Router) -> Self {
        Self { api_server, etcd }
    }

    /// Dispatch a request that arrived on `listener`.
    pub async fn handle<B>(
        &self,
        mut req: Request<B>,
        listener: &str,
    ) -> Result<Response<Body>, Infallible>
    where
        B: HttpBody<Data = axum::body::Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        req.extensions_mut()
            .insert(ListenerAddress(listener.to_string()));

        let protocol = classify(req.version(), req.headers().get(CONTENT_TYPE));
        trace!(?protocol, path = %req.uri().path(), "Dispatching request");

        let req = req.map(Body::new);
        match protocol {
            Protocol::Etcd => self.etcd.clone().oneshot(req).await,
            Protocol::ApiServer => self.api_server.clone().oneshot(req).await,
        }
    }
}
