#![allow(dead_code)]
use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{Router, body::Body};
use futures::FutureExt;
use http::{Request, Response, StatusCode};
use serde_json::Value;
use tower::ServiceExt; // for `oneshot`

use controller::{
    executor::ProcessExecutor, manager::HookManager, runner::HookRunner,
    webhooks::WebhookManagers,
};
use webhook::{BoxError, ConversionCall, State};

/// Hook writes a shell hook at `dir/name` that prints `config` when asked for its
/// configuration and runs `body` otherwise.
pub fn hook(dir: &Path, name: &str, config: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::create_dir_all(path.parent().expect("has parent")).expect("mkdir");
    let script = format!(
        "#!/bin/sh\nif [ \"$1\" = \"--config\" ]; then\ncat <<'CONFIG'\n{config}\nCONFIG\nexit 0\nfi\n{body}\n"
    );
    std::fs::write(&path, script).expect("write hook");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    path
}

/// Runner loads the hooks under `dir/hooks` with real processes.
pub async fn runner(dir: &Path) -> Arc<HookRunner> {
    let mut m = HookManager::new(
        Arc::new(ProcessExecutor::default()),
        dir.join("hooks"),
        WebhookManagers::default(),
    );
    m.init().await.expect("hooks load");
    Arc::new(HookRunner::new(Arc::new(m), dir.join("tmp")))
}

pub fn validating(r: Arc<HookRunner>) -> Router {
    webhook::validating_app(State::new(move |ev: api::ValidatingEvent| {
        let r = Arc::clone(&r);
        async move { r.validate(ev).await.map_err(BoxError::from) }.boxed()
    }))
}

pub fn mutating(r: Arc<HookRunner>) -> Router {
    webhook::mutating_app(State::new(move |ev: api::MutatingEvent| {
        let r = Arc::clone(&r);
        async move { r.mutate(ev).await.map_err(BoxError::from) }.boxed()
    }))
}

pub fn conversion(r: Arc<HookRunner>) -> Router {
    webhook::conversion_app(State::new(move |call: ConversionCall| {
        let r = Arc::clone(&r);
        async move {
            r.convert(
                &call.crd_name,
                &call.request.desired_api_version,
                call.request.objects,
            )
            .await
            .map_err(BoxError::from)
        }
        .boxed()
    }))
}

/// Post_json sends `v` to `path` and decodes the reply, which must be a 200.
pub async fn post_json(app: Router, path: &str, v: &Value) -> Value {
    let response: Response<Body> = app
        .oneshot(
            Request::post(path)
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::to_vec(v).expect("JSON serialization failure"),
                ))
                .expect("unable to build request"),
        )
        .await
        .expect("infallible");
    let status = response.status();
    let buf = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("error reading response body");
    assert_eq!(status, StatusCode::OK, "{}", String::from_utf8_lossy(&buf));
    serde_json::from_slice(&buf).expect("error deserializing response")
}
