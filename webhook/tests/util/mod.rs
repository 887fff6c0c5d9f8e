#![allow(dead_code)]
use axum::{Router, body::Body};
use http::{Request, Response, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt; // for `oneshot`

/// Review returns an AdmissionReview for creating a ConfigMap.
pub fn review() -> Value {
    json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
            "kind": {"group": "", "version": "v1", "kind": "ConfigMap"},
            "resource": {"group": "", "version": "v1", "resource": "configmaps"},
            "name": "test",
            "namespace": "default",
            "operation": "CREATE",
            "object": {
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "test", "namespace": "default"},
            },
            "userInfo": {"username": "admin", "uid": "0", "groups": ["system:masters"]},
            "dryRun": false,
        },
    })
}

/// Post sends `body` to `path` and returns the response status and body.
pub async fn post(
    app: Router,
    path: &str,
    content_type: &str,
    body: Vec<u8>,
) -> (StatusCode, Vec<u8>) {
    let response: Response<Body> = app
        .oneshot(
            Request::post(path)
                .header("content-type", content_type)
                .body(Body::from(body))
                .expect("unable to build request"),
        )
        .await
        .expect("infallible");
    let status = response.status();
    let buf = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("error reading response body");
    (status, buf.to_vec())
}

/// Post_json sends `v` as JSON and decodes the reply as JSON.
pub async fn post_json(app: Router, path: &str, v: &Value) -> Value {
    let (status, buf) = post(
        app,
        path,
        "application/json",
        serde_json::to_vec(v).expect("JSON serialization failure"),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&buf));
    serde_json::from_slice(&buf).expect("error deserializing response")
}
