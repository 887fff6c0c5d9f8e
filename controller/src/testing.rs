//! Extras that only show up during tests.
#![allow(missing_docs)]
use std::{collections::BTreeMap, path::Path, sync::Mutex};

use futures::{FutureExt, future::BoxFuture};
use http::{Request, Response, StatusCode};
use kube::client::{Body, Client};
use serde_json::{Value, json};
use tower_test::mock::SendResponse;

use crate::executor::{ExecOutput, Executor};
use crate::prelude::*;

pub use assert_json_diff::assert_json_include;
pub use test_log::test;

pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

// We wrap tower_test::mock::Handle
type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

/// Step is one request the mock apiserver expects, in order.
#[derive(Clone, Debug)]
pub enum Step {
    /// A list by name. Answers with the object, if any.
    List(Option<Value>),
    /// A create. Echoes the object back.
    Create,
    /// A replace that must carry `resource_version` and `webhooks` entries.
    Replace {
        resource_version: String,
        webhooks: usize,
    },
    /// Any write, answered with `409 Conflict`.
    Conflict,
    /// A delete of the named object.
    Delete(String),
    /// A merge patch of the named CRD.
    Patch(String),
}

pub struct ApiServerVerifier {
    handle: ApiServerHandle,
}

impl ApiServerVerifier {
    pub fn new() -> (Client, Self) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");
        (mock_client, Self { handle })
    }

    #[inline]
    fn next_request(
        &mut self,
    ) -> impl Future<Output = Option<(Request<Body>, SendResponse<Response<Body>>)>> {
        self.handle.next_request()
    }

    /// Run answers `steps` in order.
    ///
    /// NB: If the code under test makes more calls than there are steps, it sees a
    /// `Service(Closed(()))` error. Await the returned handle with a timeout to catch
    /// calls that never came.
    pub fn run(mut self, steps: Vec<Step>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            for step in steps {
                let (request, send) = self.next_request().await.expect("service not called");
                let method = request.method().clone();
                let uri = request.uri().to_string();
                eprintln!("{method}\t{uri}");
                let body = request
                    .into_body()
                    .collect_bytes()
                    .await
                    .expect("body readable");
                let response = match step {
                    Step::List(obj) => {
                        assert_eq!(method, http::Method::GET, "unexpected method");
                        assert!(uri.contains("fieldSelector=metadata.name"), "unexpected query");
                        list(obj)
                    }
                    Step::Create => {
                        assert_eq!(method, http::Method::POST, "unexpected method");
                        assert!(uri.contains("fieldManager=hook-operator"), "unexpected query");
                        ok(body.to_vec())
                    }
                    Step::Replace {
                        resource_version,
                        webhooks,
                    } => {
                        assert_eq!(method, http::Method::PUT, "unexpected method");
                        let obj: Value = serde_json::from_slice(&body).expect("object is json");
                        assert_eq!(
                            obj["metadata"]["resourceVersion"],
                            json!(resource_version),
                            "update must carry the listed resourceVersion"
                        );
                        let n = obj["webhooks"].as_array().map(Vec::len).unwrap_or_default();
                        assert_eq!(n, webhooks, "unexpected webhooks");
                        ok(body.to_vec())
                    }
                    Step::Conflict => {
                        assert!(
                            matches!(method, http::Method::POST | http::Method::PUT),
                            "unexpected method"
                        );
                        status(StatusCode::CONFLICT, "Conflict")
                    }
                    Step::Delete(name) => {
                        assert_eq!(method, http::Method::DELETE, "unexpected method");
                        assert!(uri.contains(&format!("/{name}")), "unexpected path");
                        ok(serde_json::to_vec(&json!({
                            "apiVersion": "v1",
                            "kind": "Status",
                            "metadata": {},
                            "status": "Success",
                        }))
                        .expect("serializes"))
                    }
                    Step::Patch(name) => {
                        assert_eq!(method, http::Method::PATCH, "unexpected method");
                        assert!(
                            uri.starts_with(&format!(
                                "/apis/apiextensions.k8s.io/v1/customresourcedefinitions/{name}?"
                            )),
                            "unexpected path"
                        );
                        let patch: Value = serde_json::from_slice(&body).expect("patch is json");
                        assert_json_include!(
                            actual: patch,
                            expected: json!({"spec": {"conversion": {"strategy": "Webhook"}}})
                        );
                        ok(serde_json::to_vec(&crd(&name)).expect("serializes"))
                    }
                };
                send.send_response(response);
            }
        })
    }
}

fn ok(body: Vec<u8>) -> Response<Body> {
    Response::builder()
        .body(Body::from(body))
        .expect("valid response")
}

fn list(obj: Option<Value>) -> Response<Body> {
    let doc = json!({
        "apiVersion": "v1",
        "kind": "List",
        "metadata": { "resourceVersion": "1" },
        "items": obj.into_iter().collect::<Vec<_>>(),
    });
    ok(serde_json::to_vec(&doc).expect("serializes"))
}

fn status(code: StatusCode, reason: &str) -> Response<Body> {
    let err = json!({
        "apiVersion": "v1",
        "kind": "Status",
        "metadata": {},
        "code": code.as_u16(),
        "status": "Failure",
        "reason": reason,
        "message": reason.to_lowercase(),
    });
    Response::builder()
        .status(code)
        .body(Body::from(serde_json::to_vec(&err).expect("serializes")))
        .expect("valid response")
}

fn crd(name: &str) -> Value {
    let (plural, group) = name.split_once('.').expect("qualified crd name");
    json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": { "name": name },
        "spec": {
            "group": group,
            "names": { "kind": "Test", "plural": plural },
            "scope": "Namespaced",
            "versions": [],
        },
    })
}

/// FakeExecutor answers hook runs from a table instead of spawning processes.
///
/// Runs with `--config` get the configured document. Other runs call the responder, which may
/// write files named in the environment.
#[derive(Default)]
pub struct FakeExecutor {
    configs: BTreeMap<String, (i32, String)>,
    responder: Option<Box<dyn Fn(&Path, &BTreeMap<String, String>) -> i32 + Send + Sync>>,
    pub calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Config makes `path` print `doc` for `--config`.
    pub fn config<P: AsRef<Path>>(mut self, path: P, doc: &str) -> Self {
        self.configs.insert(
            path.as_ref().to_string_lossy().into_owned(),
            (0, doc.to_string()),
        );
        self
    }

    /// Failing makes `path` exit non-zero for `--config`.
    pub fn failing<P: AsRef<Path>>(mut self, path: P, stderr: &str) -> Self {
        self.configs.insert(
            path.as_ref().to_string_lossy().into_owned(),
            (1, stderr.to_string()),
        );
        self
    }

    /// Respond sets what happens on a non-config run.
    pub fn respond<F>(mut self, f: F) -> Self
    where
        F: Fn(&Path, &BTreeMap<String, String>) -> i32 + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(f));
        self
    }
}

impl Executor for FakeExecutor {
    fn run<'a>(
        &'a self,
        path: &'a Path,
        args: &'a [&'a str],
        env: &'a BTreeMap<String, String>,
    ) -> BoxFuture<'a, Result<ExecOutput>> {
        async move {
            let key = path.to_string_lossy().into_owned();
            self.calls
                .lock()
                .expect("lock")
                .push((key.clone(), args.iter().map(ToString::to_string).collect()));
            if args == ["--config"] {
                let (code, out) = self.configs.get(&key).cloned().unwrap_or_default();
                return Ok(if code == 0 {
                    ExecOutput {
                        stdout: out.into_bytes(),
                        code: Some(0),
                        ..Default::default()
                    }
                } else {
                    ExecOutput {
                        stderr: out.into_bytes(),
                        code: Some(code),
                        ..Default::default()
                    }
                });
            }
            let code = self.responder.as_ref().map(|f| f(path, env)).unwrap_or_default();
            Ok(ExecOutput {
                code: Some(code),
                ..Default::default()
            })
        }
        .boxed()
    }
}

/// Executables creates each of `names` as an executable script under `dir`.
pub fn executables(dir: &Path, names: &[&str]) {
    use std::os::unix::fs::PermissionsExt;
    for n in names {
        let p = dir.join(n);
        std::fs::create_dir_all(p.parent().expect("has parent")).expect("mkdir");
        std::fs::write(&p, "#!/bin/sh\n").expect("write");
        std::fs::set_permissions(&p, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    }
}
