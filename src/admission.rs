//! Serves mutating admission reviews for a chain of webhook plugins.

use futures::future;
use hyper::{http, Body, Request, Response};
use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
    DynamicObject,
};
use std::{
    fmt,
    sync::Arc,
    task::{Context, Poll},
};
use tracing::{debug, info_span, trace, warn};

/// A webhook plugin.
///
/// Plugins see every admitted object and must allow (leaving the response
/// untouched) anything they do not handle.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn handle(&self, req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse;
}

/// An ordered set of plugins.
#[derive(Clone, Default)]
pub struct Registry {
    plugins: Vec<Arc<dyn Plugin>>,
}

/// Serves admission reviews over HTTP.
#[derive(Clone, Debug)]
pub struct Admission {
    registry: Arc<Registry>,
}

/// Failures serving an admission review.
///
/// Rejected reviews are not errors; they are answered with an invalid
/// response.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Body(#[from] hyper::Error),

    #[error("failed to encode admission review: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to build response: {0}")]
    Response(#[from] http::Error),
}

type Review = AdmissionReview<DynamicObject>;

// === impl Registry ===

impl Registry {
    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.register(plugin);
        self
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        tracing::info!(plugin = plugin.name(), "registered webhook plugin");
        self.plugins.push(plugin);
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Runs each plugin in registration order.
    ///
    /// The first plugin to deny or patch the object decides the response;
    /// otherwise the object is allowed unchanged.
    pub fn admit(&self, req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        for plugin in &self.plugins {
            let rsp = {
                let _span = info_span!("plugin", name = plugin.name()).entered();
                plugin.handle(req)
            };
            if !rsp.allowed || rsp.patch.is_some() {
                debug!(plugin = plugin.name(), allowed = rsp.allowed, "plugin responded");
                return rsp;
            }
        }
        AdmissionResponse::from(req)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|p| p.name()))
            .finish()
    }
}

// === impl Admission ===

impl Admission {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

impl hyper::service::Service<Request<Body>> for Admission {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        trace!(?req);
        if req.method() != http::Method::POST || req.uri().path() != "/" {
            return Box::pin(future::ready(
                Response::builder()
                    .status(http::StatusCode::NOT_FOUND)
                    .body(Body::empty())
                    .map_err(Into::into),
            ));
        }

        let registry = self.registry.clone();
        Box::pin(async move {
            let bytes = hyper::body::to_bytes(req.into_body()).await?;
            let review: Review = match serde_json::from_slice(&bytes) {
                Ok(review) => review,
                Err(error) => {
                    warn!(%error, "failed to parse request body");
                    return json_response(AdmissionResponse::invalid(error).into_review());
                }
            };
            trace!(?review);

            let req: Result<AdmissionRequest<DynamicObject>, _> = review.try_into();
            let rsp = match req {
                Ok(req) => {
                    let _span = info_span!(
                        "admit",
                        uid = %req.uid,
                        kind = %req.kind.kind,
                        ns = req.namespace.as_deref().unwrap_or_default(),
                        name = %req.name,
                    )
                    .entered();
                    registry.admit(&req)
                }
                Err(error) => {
                    warn!(%error, "invalid admission request");
                    AdmissionResponse::invalid(error)
                }
            };
            debug!(allowed = rsp.allowed, patched = rsp.patch.is_some());
            json_response(rsp.into_review())
        })
    }
}

fn json_response(rsp: Review) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp)?;
    Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .map_err(Into::into)
}
