use std::{os::unix::fs::PermissionsExt, sync::Arc};

use serde_json::{Value, json};
use test_log::test;

use api::BindingType;
use controller::{
    Error, executor::ProcessExecutor, manager::HookManager, runner::HookRunner,
    webhooks::WebhookManagers,
};
use util::{conversion, hook, mutating, post_json, runner, validating};

mod util;

fn admission_review() -> Value {
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
            "userInfo": {"username": "admin"},
            "dryRun": false,
        },
    })
}

const POLICY: &str = r#"configVersion: v1
kubernetesValidating:
- name: private-repo-policy.example.com
  rules:
  - apiGroups: [""]
    apiVersions: ["v1"]
    operations: ["CREATE"]
    resources: ["configmaps"]
"#;

#[test(tokio::test)]
async fn validating_hook_denies() {
    let dir = tempfile::tempdir().expect("tempdir");
    hook(
        &dir.path().join("hooks"),
        "policy.sh",
        POLICY,
        r#"grep -q '"binding":"private-repo-policy.example.com"' "$BINDING_CONTEXT_PATH" || exit 3
echo '{"allowed":false,"message":"only private images"}' > "$VALIDATING_RESPONSE_PATH""#,
    );
    let r = runner(dir.path()).await;

    let out = post_json(
        validating(r),
        "/hooks/private-repo-policy-example-com",
        &admission_review(),
    )
    .await;
    assert_eq!(out["response"]["allowed"], json!(false));
    assert_eq!(out["response"]["status"]["message"], json!("only private images"));
}

#[test(tokio::test)]
async fn failing_hook_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    hook(
        &dir.path().join("hooks"),
        "policy.sh",
        POLICY,
        "echo broken >&2\nexit 1",
    );
    let r = runner(dir.path()).await;

    let out = post_json(
        validating(r),
        "/hooks/private-repo-policy-example-com",
        &admission_review(),
    )
    .await;
    assert_eq!(out["response"]["allowed"], json!(false));
    let msg = out["response"]["status"]["message"]
        .as_str()
        .expect("has message");
    assert!(msg.contains("broken"), "{msg}");
}

#[test(tokio::test)]
async fn mutating_hook_patches() {
    let dir = tempfile::tempdir().expect("tempdir");
    hook(
        &dir.path().join("hooks"),
        "labels.sh",
        "configVersion: v1\nkubernetesMutating:\n- name: addLabels\n",
        r#"echo '{"allowed":true,"patch":[{"op":"add","path":"/metadata/labels","value":{"x":"y"}}]}' > "$ADMISSION_RESPONSE_PATH""#,
    );
    let r = runner(dir.path()).await;

    let out = post_json(mutating(r), "/hooks/add-labels", &admission_review()).await;
    assert_eq!(out["response"]["allowed"], json!(true));
    assert_eq!(out["response"]["patchType"], json!("JSONPatch"));
}

#[test(tokio::test)]
async fn conversion_hook_converts() {
    let dir = tempfile::tempdir().expect("tempdir");
    hook(
        &dir.path().join("hooks"),
        "convert.sh",
        r#"configVersion: v1
kubernetesCustomResourceConversion:
- name: alpha_to_beta
  crdName: crontabs.stable.example.com
  conversions:
  - fromVersion: stable.example.com/v1
    toVersion: stable.example.com/v2
"#,
        r#"echo '{"convertedObjects":[{"apiVersion":"stable.example.com/v2","kind":"CronTab","metadata":{"name":"a"}}]}' > "$CONVERSION_RESPONSE_PATH""#,
    );
    let r = runner(dir.path()).await;

    let out = post_json(
        conversion(r),
        "/crontabs.stable.example.com",
        &json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "ConversionReview",
            "request": {
                "uid": "0000-1111",
                "desiredAPIVersion": "stable.example.com/v2",
                "objects": [
                    {"apiVersion": "stable.example.com/v1", "kind": "CronTab", "metadata": {"name": "a"}},
                ],
            },
        }),
    )
    .await;
    assert_eq!(out["response"]["result"]["status"], json!("Success"));
    assert_eq!(
        out["response"]["convertedObjects"][0]["apiVersion"],
        json!("stable.example.com/v2")
    );
}

#[test(tokio::test)]
async fn startup_order_and_webhook_registration() {
    let dir = tempfile::tempdir().expect("tempdir");
    let hooks = dir.path().join("hooks");
    hook(&hooks, "late.sh", "configVersion: v1\nonStartup: 20\n", "exit 0");
    hook(&hooks, "early.sh", "configVersion: v1\nonStartup: 10\n", "exit 0");
    hook(&hooks, "nested/policy.sh", POLICY, "exit 0");
    std::fs::write(hooks.join("README.md"), "not a hook").expect("write");

    let mut m = HookManager::new(
        std::sync::Arc::new(ProcessExecutor::default()),
        &hooks,
        WebhookManagers::default(),
    );
    m.init().await.expect("hooks load");
    assert_eq!(m.hook_names().len(), 3);
    assert_eq!(
        m.get_hooks_in_order(BindingType::OnStartup).expect("ordered"),
        vec!["early.sh".to_string(), "late.sh".to_string()]
    );
    let ids: Vec<_> = m
        .webhooks()
        .validating
        .resources()
        .values()
        .flat_map(|r| r.webhook_ids().map(str::to_string).collect::<Vec<_>>())
        .collect();
    assert_eq!(ids, vec!["private-repo-policy-example-com".to_string()]);
}

#[test(tokio::test)]
async fn hooks_run_from_hooks_dir() {
    let dir = tempfile::tempdir().expect("tempdir");
    let hooks = dir.path().join("hooks");
    std::fs::create_dir_all(hooks.join("policy")).expect("mkdir");
    std::fs::write(hooks.join("policy/config.yaml"), POLICY).expect("write");
    std::fs::write(
        hooks.join("policy/deny.json"),
        r#"{"allowed":false,"message":"read from the hooks dir"}"#,
    )
    .expect("write");
    // Both the config and the response come from paths relative to the hooks dir.
    let script = hooks.join("policy/hook.sh");
    std::fs::write(
        &script,
        "#!/bin/sh\nif [ \"$1\" = \"--config\" ]; then\ncat policy/config.yaml\nexit 0\nfi\n\
         cat policy/deny.json > \"$VALIDATING_RESPONSE_PATH\"\n",
    )
    .expect("write hook");
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");

    let mut m = HookManager::new(
        Arc::new(ProcessExecutor {
            dir: Some(hooks.clone()),
        }),
        &hooks,
        WebhookManagers::default(),
    );
    m.init().await.expect("hooks load");
    let r = Arc::new(HookRunner::new(Arc::new(m), dir.path().join("tmp")));

    let out = post_json(
        validating(r),
        "/hooks/private-repo-policy-example-com",
        &admission_review(),
    )
    .await;
    assert_eq!(out["response"]["allowed"], json!(false));
    assert_eq!(
        out["response"]["status"]["message"],
        json!("read from the hooks dir")
    );
}

#[test(tokio::test)]
async fn bad_config_fails_init() {
    let dir = tempfile::tempdir().expect("tempdir");
    hook(
        &dir.path().join("hooks"),
        "bad.sh",
        "configVersion: v2\n",
        "exit 0",
    );
    let mut m = HookManager::new(
        std::sync::Arc::new(ProcessExecutor::default()),
        dir.path().join("hooks"),
        WebhookManagers::default(),
    );
    let err = m.init().await.expect_err("unknown configVersion");
    assert!(matches!(err, Error::HookConfig { .. }), "{err}");
    assert!(m.hook_names().is_empty());
}
