//! Webhook contains the HTTP side of the admission and conversion webhooks.
//!
//! Requests are decoded here and handed to a handler function installed by the operator. Every
//! path through the admission handler ends in a well-formed `AdmissionReview`, except for
//! requests that cannot be decoded at all.

use std::sync::Arc;

use axum::http::{HeaderMap, header};
use futures::future::BoxFuture;

mod admission;
mod conversion;

pub use admission::{Decision, mutating_app, validating_app};
pub use conversion::{
    ConversionCall, ConversionRequest, ConversionResponse, ConversionResult, ConversionReview,
    conversion_app,
};

/// BoxError is the error type handler functions report.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// HandlerFn is the shape of the functions the routers dispatch to.
pub type HandlerFn<E, R> = Arc<dyn Fn(E) -> BoxFuture<'static, Result<R, BoxError>> + Send + Sync>;

/// State is shared by every request a router serves.
pub struct State<E, R> {
    handler: Option<HandlerFn<E, R>>,
}

impl<E, R> Default for State<E, R> {
    fn default() -> Self {
        Self { handler: None }
    }
}

impl<E, R> State<E, R> {
    /// New creates a State dispatching to `f`.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(E) -> BoxFuture<'static, Result<R, BoxError>> + Send + Sync + 'static,
    {
        Self {
            handler: Some(Arc::new(f)),
        }
    }

    /// Without_handler creates a State that answers every request with an error response.
    pub fn without_handler() -> Self {
        Self::default()
    }
}

/// Error is the error type for building responses.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The hook's response document could not be used.
    #[error("bad hook response: {0}")]
    Response(#[from] api::Error),
    /// The patch could not be encoded.
    #[error("patch error: {0}")]
    Patch(#[from] kube::core::admission::SerializePatchError),
}

/// Detect_configuration_and_webhook splits a request path into a configuration id and a webhook
/// id.
///
/// The first non-empty segment is the configuration id. The remaining non-empty segments, joined
/// with `/`, are the webhook id.
pub fn detect_configuration_and_webhook(path: &str) -> (String, String) {
    let mut parts = path.split('/').filter(|p| !p.is_empty());
    let configuration = parts.next().unwrap_or_default().to_string();
    let webhook = parts.collect::<Vec<_>>().join("/");
    (configuration, webhook)
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("application/json"))
}

fn count(kind: &'static str, outcome: &'static str) {
    metrics::counter!(
        "hook_operator_admission_requests_total",
        "kind" => kind,
        "outcome" => outcome,
    )
    .increment(1);
}
