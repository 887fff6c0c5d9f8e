//! Runner executes hooks for the webhook servers and reads back their decisions.

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use api::{
    Artifact, ConversionEvent, ConversionRule, MutatingEvent, MutatingResponse, ValidatingEvent,
    ValidatingResponse,
};
use serde_json::Value;

use crate::{binding::BindingExecutionInfo, hook::Hook, manager::HookManager, prelude::*};

/// BINDING_CONTEXT_PATH names the file holding the binding contexts.
pub const BINDING_CONTEXT_PATH: &str = "BINDING_CONTEXT_PATH";
/// VALIDATING_RESPONSE_PATH names the file a validating hook writes its decision to.
pub const VALIDATING_RESPONSE_PATH: &str = "VALIDATING_RESPONSE_PATH";
/// ADMISSION_RESPONSE_PATH names the file a mutating hook writes its decision to.
pub const ADMISSION_RESPONSE_PATH: &str = "ADMISSION_RESPONSE_PATH";
/// CONVERSION_RESPONSE_PATH names the file a conversion hook writes its result to.
pub const CONVERSION_RESPONSE_PATH: &str = "CONVERSION_RESPONSE_PATH";

/// HookRunner runs the hook an admission or conversion request was routed to.
pub struct HookRunner {
    manager: Arc<HookManager>,
    tmp_dir: PathBuf,
    seq: AtomicU64,
}

impl HookRunner {
    pub fn new<P: Into<PathBuf>>(manager: Arc<HookManager>, tmp_dir: P) -> Self {
        Self {
            manager,
            tmp_dir: tmp_dir.into(),
            seq: AtomicU64::new(0),
        }
    }

    /// Validate runs the hook bound to the webhook the review was sent to.
    #[instrument(
        skip_all,
        fields(configuration_id = %ev.configuration_id, webhook_id = %ev.webhook_id)
    )]
    pub async fn validate(&self, ev: ValidatingEvent) -> Result<ValidatingResponse> {
        let mut routed = None;
        self.manager
            .handle_validating_event(&ev, |h, info| route(&mut routed, h, info));
        let (hook, info) = routed.ok_or_else(|| {
            Error::Unhandled(format!(
                "validating webhook {}/{}",
                ev.configuration_id, ev.webhook_id
            ))
        })?;
        let hook = self.hook(&hook)?;
        let res: ValidatingResponse = self
            .run(hook, &info, VALIDATING_RESPONSE_PATH, "validating")
            .await?;
        debug!(hook = %hook.name, response = %res.dump(), "validating hook done");
        Ok(res)
    }

    /// Mutate runs the hook bound to the webhook the review was sent to.
    #[instrument(
        skip_all,
        fields(configuration_id = %ev.configuration_id, webhook_id = %ev.webhook_id)
    )]
    pub async fn mutate(&self, ev: MutatingEvent) -> Result<MutatingResponse> {
        let mut routed = None;
        self.manager
            .handle_mutating_event(&ev, |h, info| route(&mut routed, h, info));
        let (hook, info) = routed.ok_or_else(|| {
            Error::Unhandled(format!(
                "mutating webhook {}/{}",
                ev.configuration_id, ev.webhook_id
            ))
        })?;
        let hook = self.hook(&hook)?;
        let res: MutatingResponse = self
            .run(hook, &info, ADMISSION_RESPONSE_PATH, "mutating")
            .await?;
        debug!(hook = %hook.name, response = %res.dump(), "mutating hook done");
        Ok(res)
    }

    /// Convert brings `objects` of `crd_name` to `desired_api_version`.
    ///
    /// Objects are grouped by their current version. Each group walks the conversion chain one
    /// rule at a time, running the hook that declared the rule. The result keeps request order.
    #[instrument(skip(self, objects), fields(count = objects.len()))]
    pub async fn convert(
        &self,
        crd_name: &str,
        desired_api_version: &str,
        objects: Vec<Value>,
    ) -> Result<Vec<Value>> {
        let mut batches: BTreeMap<String, Vec<(usize, Value)>> = BTreeMap::new();
        for (i, obj) in objects.into_iter().enumerate() {
            let v = obj
                .get("apiVersion")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            batches.entry(v).or_default().push((i, obj));
        }

        let mut out: HashMap<usize, Value> = HashMap::new();
        for (from, batch) in batches {
            let (idx, mut objs): (Vec<_>, Vec<_>) = batch.into_iter().unzip();
            if from != desired_api_version {
                let want = ConversionRule::new(from.as_str(), desired_api_version);
                let chain = self.manager.find_conversion_chain(crd_name, &want);
                if chain.is_empty() {
                    return Err(Error::Conversion {
                        crd: crd_name.to_string(),
                        message: format!("no conversion path for {want}"),
                    });
                }
                for rule in chain {
                    objs = self.convert_step(crd_name, rule, objs).await?;
                }
            }
            if objs.len() != idx.len() {
                return Err(Error::Conversion {
                    crd: crd_name.to_string(),
                    message: format!(
                        "hook returned {} objects for {} inputs",
                        objs.len(),
                        idx.len()
                    ),
                });
            }
            out.extend(idx.into_iter().zip(objs));
        }

        let mut keys: Vec<_> = out.keys().copied().collect();
        keys.sort_unstable();
        Ok(keys.into_iter().filter_map(|k| out.remove(&k)).collect())
    }

    async fn convert_step(
        &self,
        crd_name: &str,
        rule: ConversionRule,
        objects: Vec<Value>,
    ) -> Result<Vec<Value>> {
        let ev = ConversionEvent {
            crd_name: crd_name.to_string(),
            rule,
            objects,
        };
        let mut routed = None;
        self.manager
            .handle_conversion_event(&ev, |h, info| route(&mut routed, h, info));
        let (hook, info) = routed.ok_or_else(|| {
            Error::Unhandled(format!("conversion {} for {crd_name}", ev.rule))
        })?;
        let hook = self.hook(&hook)?;
        let res: api::ConversionResponse = self
            .run(hook, &info, CONVERSION_RESPONSE_PATH, "conversion")
            .await?;
        debug!(hook = %hook.name, rule = %ev.rule, response = %res.dump(), "conversion hook done");
        if let Some(message) = res.failed_message.filter(|m| !m.is_empty()) {
            return Err(Error::Conversion {
                crd: crd_name.to_string(),
                message,
            });
        }
        Ok(res.converted_objects.unwrap_or_default())
    }

    fn hook(&self, name: &str) -> Result<&Hook> {
        self.manager
            .get_hook(name)
            .ok_or_else(|| Error::Unhandled(format!("hook {name:?}")))
    }

    /// Run executes `hook` with `info` and reads the response file named by `var`.
    async fn run<R: Artifact>(
        &self,
        hook: &Hook,
        info: &BindingExecutionInfo,
        var: &str,
        kind: &'static str,
    ) -> Result<R> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let dir = self
            .tmp_dir
            .join(format!("{}-{seq}", sanitize(&hook.name)));
        tokio::fs::create_dir_all(&dir).await?;
        let context_path = dir.join("binding_context.json");
        let response_path = dir.join("response.json");
        tokio::fs::write(&context_path, serde_json::to_vec(&info.binding_context)?).await?;

        let env = BTreeMap::from([
            (
                BINDING_CONTEXT_PATH.to_string(),
                context_path.to_string_lossy().into_owned(),
            ),
            (var.to_string(), response_path.to_string_lossy().into_owned()),
        ]);
        let res = self.exec(hook, &env, &response_path, kind).await;
        if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
            warn!(?dir, error = %err, "unable to clean up hook files");
        }
        res
    }

    async fn exec<R: Artifact>(
        &self,
        hook: &Hook,
        env: &BTreeMap<String, String>,
        response_path: &std::path::Path,
        kind: &'static str,
    ) -> Result<R> {
        let out = self.manager.executor().run(&hook.path, &[], env).await?;
        if !out.success() {
            return Err(out.into_error(&hook.path));
        }
        let buf = match tokio::fs::read(response_path).await {
            Ok(buf) => buf,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        if buf.is_empty() {
            return Err(Error::NoResponse {
                hook: hook.name.clone(),
                kind,
            });
        }
        Ok(R::from_slice(&buf)?)
    }
}

fn route(
    slot: &mut Option<(String, BindingExecutionInfo)>,
    hook: &Hook,
    info: BindingExecutionInfo,
) {
    if info.is_empty() {
        return;
    }
    match slot {
        None => *slot = Some((hook.name.clone(), info)),
        Some((first, _)) => {
            warn!(hook = %hook.name, kept = %first, "more than one hook matched, ignoring");
        }
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}
