use std::sync::Arc;

use axum::{
    Json, Router, extract,
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::post,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::{State, count, is_json};

const KIND: &str = "conversion";

/// ConversionReview is the envelope of a CRD conversion request or response.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionReview {
    /// ApiVersion of the review, `apiextensions.k8s.io/v1`.
    pub api_version: String,
    /// Kind is always `ConversionReview`.
    pub kind: String,
    /// Request is set on the way in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<ConversionRequest>,
    /// Response is set on the way out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ConversionResponse>,
}

/// ConversionRequest asks for a set of objects to be converted.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionRequest {
    /// Uid is copied into the response.
    pub uid: String,
    /// DesiredApiVersion is the version every object must end up at.
    #[serde(rename = "desiredAPIVersion")]
    pub desired_api_version: String,
    /// Objects to convert. They may be at different versions.
    #[serde(default)]
    pub objects: Vec<Value>,
}

/// ConversionResult is the outcome of a conversion.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ConversionResult {
    /// Status is `Success` or `Failure`.
    pub status: String,
    /// Message explains a failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// ConversionResponse carries the converted objects back.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionResponse {
    /// Uid of the request.
    pub uid: String,
    /// Result of the conversion.
    pub result: ConversionResult,
    /// ConvertedObjects is in request order.
    #[serde(default)]
    pub converted_objects: Vec<Value>,
}

impl ConversionResponse {
    fn success(uid: String, converted_objects: Vec<Value>) -> Self {
        Self {
            uid,
            result: ConversionResult {
                status: "Success".into(),
                message: None,
            },
            converted_objects,
        }
    }

    fn failure<S: ToString>(uid: String, msg: S) -> Self {
        Self {
            uid,
            result: ConversionResult {
                status: "Failure".into(),
                message: Some(msg.to_string()),
            },
            converted_objects: Vec::new(),
        }
    }
}

/// ConversionCall is handed to the conversion handler function.
#[derive(Clone, Debug)]
pub struct ConversionCall {
    /// CrdName is taken from the request path.
    pub crd_name: String,
    /// Request is the decoded request.
    pub request: ConversionRequest,
}

/// Conversion_app returns the router for CRD conversion reviews, served at `/{crdName}`.
///
/// The handler function returns the converted objects. An error is reported as a failed
/// conversion carrying the error text.
pub fn conversion_app(state: State<ConversionCall, Vec<Value>>) -> Router {
    Router::new()
        .route("/{*path}", post(serve_conversion))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

async fn serve_conversion(
    extract::State(srv): extract::State<Arc<State<ConversionCall, Vec<Value>>>>,
    uri: Uri,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    if !is_json(&headers) {
        count(KIND, "unsupported_media_type");
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    }
    let crd_name = uri.path().trim_matches('/').to_string();

    let review: ConversionReview = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(err) => {
            error!(kind = KIND, error = %err, "error parsing ConversionReview");
            count(KIND, "bad_request");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "fail to parse ConversionReview",
            )
                .into_response();
        }
    };
    let Some(request) = review.request else {
        error!(kind = KIND, "ConversionReview has no request");
        count(KIND, "bad_request");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "fail to parse ConversionReview",
        )
            .into_response();
    };
    info!(
        crd_name = %crd_name,
        uid = %request.uid,
        desired_api_version = %request.desired_api_version,
        objects = request.objects.len(),
        "got ConversionReview request"
    );

    let uid = request.uid.clone();
    let (response, outcome) = match &srv.handler {
        None => {
            warn!(kind = KIND, "ConversionReview handler is not defined");
            (
                ConversionResponse::failure(uid, "ConversionReview handler is not defined"),
                "no_handler",
            )
        }
        Some(f) => match f(ConversionCall { crd_name, request }).await {
            Ok(objs) => (ConversionResponse::success(uid, objs), "converted"),
            Err(err) => {
                warn!(kind = KIND, error = %err, "conversion failed");
                (ConversionResponse::failure(uid, err), "failed")
            }
        },
    };
    count(KIND, outcome);
    Json(ConversionReview {
        api_version: review.api_version,
        kind: review.kind,
        request: None,
        response: Some(response),
    })
    .into_response()
}
