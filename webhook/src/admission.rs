use std::sync::Arc;

use api::{AdmissionEvent, MutatingResponse, ValidatingResponse};
use axum::{
    Json, Router, extract,
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::post,
};
use kube::core::{
    DynamicObject, Status,
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::{Error, State, count, detect_configuration_and_webhook, is_json};

/// Decision is a hook's answer to an admission review.
pub trait Decision: Send + 'static {
    /// KIND names the webhook flavor in logs and metrics.
    const KIND: &'static str;

    /// Apply fills in `res` according to the decision.
    fn apply(self, res: AdmissionResponse) -> Result<AdmissionResponse, Error>;
}

fn forbid(mut res: AdmissionResponse, msg: Option<String>) -> AdmissionResponse {
    res.allowed = false;
    res.result = Status::failure(&msg.unwrap_or_default(), "Forbidden").with_code(403);
    res
}

impl Decision for ValidatingResponse {
    const KIND: &'static str = "validating";

    fn apply(self, mut res: AdmissionResponse) -> Result<AdmissionResponse, Error> {
        res.warnings = self.warnings.filter(|w| !w.is_empty());
        if !self.allowed {
            return Ok(forbid(res, self.message));
        }
        res.allowed = true;
        Ok(res)
    }
}

impl Decision for MutatingResponse {
    const KIND: &'static str = "mutating";

    fn apply(self, mut res: AdmissionResponse) -> Result<AdmissionResponse, Error> {
        res.warnings = self.warnings.clone().filter(|w| !w.is_empty());
        if !self.allowed {
            return Ok(forbid(res, self.message));
        }
        res.allowed = true;
        match self.patch_operations()? {
            Some(ops) => Ok(res.with_patch(ops)?),
            None => Ok(res),
        }
    }
}

type AdmissionState<D> = Arc<State<AdmissionEvent, D>>;

/// Mutating_app returns the router for mutating admission reviews.
pub fn mutating_app(state: State<AdmissionEvent, MutatingResponse>) -> Router {
    app(state)
}

/// Validating_app returns the router for validating admission reviews.
pub fn validating_app(state: State<AdmissionEvent, ValidatingResponse>) -> Router {
    app(state)
}

fn app<D: Decision>(state: State<AdmissionEvent, D>) -> Router {
    Router::new()
        .route("/{*path}", post(serve_review::<D>))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

async fn serve_review<D: Decision>(
    extract::State(srv): extract::State<AdmissionState<D>>,
    uri: Uri,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    if !is_json(&headers) {
        count(D::KIND, "unsupported_media_type");
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    }
    let (configuration_id, webhook_id) = detect_configuration_and_webhook(uri.path());
    info!(
        kind = D::KIND,
        configuration_id = %configuration_id,
        webhook_id = %webhook_id,
        "got AdmissionReview request"
    );

    let review: AdmissionReview<DynamicObject> = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(err) => {
            error!(kind = D::KIND, error = %err, "error parsing AdmissionReview");
            count(D::KIND, "bad_request");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "fail to parse AdmissionReview",
            )
                .into_response();
        }
    };
    let req: AdmissionRequest<DynamicObject> = match review.clone().try_into() {
        Ok(r) => r,
        Err(err) => {
            error!(kind = D::KIND, error = %err, "AdmissionReview has no request");
            count(D::KIND, "bad_request");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "fail to parse AdmissionReview",
            )
                .into_response();
        }
    };

    let res = AdmissionResponse::from(&req);
    let (res, outcome) = match &srv.handler {
        None => {
            warn!(kind = D::KIND, "AdmissionReview handler is not defined");
            (internal(res, "AdmissionReview handler is not defined"), "no_handler")
        }
        Some(f) => {
            let ev = AdmissionEvent {
                webhook_id,
                configuration_id,
                review,
            };
            match f(ev).await {
                Err(err) => {
                    warn!(kind = D::KIND, error = %err, "handler failed");
                    (internal(res, &err.to_string()), "error")
                }
                Ok(d) => {
                    let base = res.clone();
                    match d.apply(res) {
                        Ok(res) if res.allowed => (res, "allowed"),
                        Ok(res) => (res, "denied"),
                        Err(err) => {
                            error!(
                                kind = D::KIND,
                                error = %err,
                                "unable to build AdmissionResponse"
                            );
                            (internal(base, &err.to_string()), "bad_response")
                        }
                    }
                }
            }
        }
    };
    debug!(kind = D::KIND, uid = %res.uid, allowed = res.allowed, "responding");
    count(D::KIND, outcome);
    Json(res.into_review()).into_response()
}

fn internal(mut res: AdmissionResponse, msg: &str) -> AdmissionResponse {
    res.allowed = false;
    res.result = Status::failure(msg, "InternalError").with_code(500);
    res
}
