//! Hook holds a loaded hook and the runtime form of its bindings.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use api::{
    ConversionRule, HookConfig, WatchEventType,
    v1::{self, FieldSelector, NameSelector, NamespaceSelector},
};
use k8s_openapi::{
    api::admissionregistration::v1::{MutatingWebhook, ValidatingWebhook},
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use regex::Regex;
use strum::IntoEnumIterator;

use crate::{controllers::HookController, executor::Executor, prelude::*};

/// Labels is a set of log or metric labels.
pub type Labels = BTreeMap<String, String>;

/// BindingCommon is shared by every binding type.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BindingCommon {
    pub binding_name: String,
    pub include_snapshots_from: Vec<String>,
    pub group: String,
    pub allow_failure: bool,
    pub queue: Option<String>,
    pub log_labels: Labels,
    pub metric_labels: Labels,
}

/// WebhookMetadata holds the routing coordinates of a webhook.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WebhookMetadata {
    pub name: String,
    /// WebhookId is the URL-safe form of the binding name.
    pub webhook_id: String,
    /// ConfigurationId names the configuration object the webhook lives in.
    pub configuration_id: String,
}

/// WebhookConfig is a cluster webhook definition plus its routing metadata.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WebhookConfig<W> {
    pub webhook: W,
    pub metadata: WebhookMetadata,
}

/// AdmissionConfig is a validating or mutating binding.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AdmissionConfig<W> {
    pub common: BindingCommon,
    pub webhook: WebhookConfig<W>,
}

/// MutatingConfig is a `kubernetesMutating` binding.
pub type MutatingConfig = AdmissionConfig<MutatingWebhook>;
/// ValidatingConfig is a `kubernetesValidating` binding.
pub type ValidatingConfig = AdmissionConfig<ValidatingWebhook>;

/// ConversionConfig is a `kubernetesCustomResourceConversion` binding.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConversionConfig {
    pub common: BindingCommon,
    pub crd_name: String,
    /// Rules have group-qualified versions.
    pub rules: Vec<ConversionRule>,
}

/// MonitorConfig describes what the watch subsystem should observe for a kube binding.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MonitorConfig {
    /// MonitorId is `<hook>/<binding>/<index>`.
    pub monitor_id: String,
    pub api_version: String,
    pub kind: String,
    pub event_types: Vec<WatchEventType>,
    pub execute_on_synchronization: bool,
    pub name_selector: Option<NameSelector>,
    pub label_selector: Option<LabelSelector>,
    pub field_selector: Option<FieldSelector>,
    pub namespace: Option<NamespaceSelector>,
    pub jq_filter: Option<String>,
}

/// KubeConfig is a `kubernetes` binding.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KubeConfig {
    pub common: BindingCommon,
    pub monitor: MonitorConfig,
}

/// ScheduleConfig is a `schedule` binding.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScheduleConfig {
    pub common: BindingCommon,
    pub crontab: String,
}

/// HookBindings is the runtime form of a [`HookConfig`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HookBindings {
    pub on_startup: Option<f64>,
    pub schedule: Vec<ScheduleConfig>,
    pub kubernetes: Vec<KubeConfig>,
    pub validating: Vec<ValidatingConfig>,
    pub mutating: Vec<MutatingConfig>,
    pub conversion: Vec<ConversionConfig>,
}

impl HookBindings {
    /// New builds the bindings for hook `hook` and stamps log and metric labels on each one.
    pub fn new(hook: &str, cfg: &HookConfig) -> Self {
        let common = |name: &str, queue: Option<String>| {
            let log_labels = Labels::from([("hook".to_string(), hook.to_string())]);
            let mut metric_labels = Labels::from([
                ("hook".to_string(), hook.to_string()),
                ("binding".to_string(), name.to_string()),
            ]);
            if let Some(q) = queue {
                metric_labels.insert("queue".to_string(), q);
            }
            (log_labels, metric_labels)
        };

        let schedule = cfg
            .schedule
            .iter()
            .map(|b| {
                let (log_labels, metric_labels) =
                    common(&b.name, Some(b.queue.clone().unwrap_or_else(|| "main".into())));
                ScheduleConfig {
                    common: BindingCommon {
                        binding_name: b.name.clone(),
                        include_snapshots_from: b.include_snapshots_from.clone(),
                        group: b.group.clone(),
                        allow_failure: b.allow_failure,
                        queue: b.queue.clone(),
                        log_labels,
                        metric_labels,
                    },
                    crontab: b.crontab.clone(),
                }
            })
            .collect();

        let kubernetes = cfg
            .kubernetes
            .iter()
            .enumerate()
            .map(|(i, b)| {
                let (log_labels, metric_labels) =
                    common(&b.name, Some(b.queue.clone().unwrap_or_else(|| "main".into())));
                KubeConfig {
                    common: BindingCommon {
                        binding_name: b.name.clone(),
                        include_snapshots_from: b.include_snapshots_from.clone(),
                        group: b.group.clone(),
                        allow_failure: b.allow_failure,
                        queue: b.queue.clone(),
                        log_labels,
                        metric_labels,
                    },
                    monitor: MonitorConfig {
                        monitor_id: format!("{hook}/{}/{i}", b.name),
                        api_version: b.api_version.clone(),
                        kind: b.kind.clone(),
                        event_types: b
                            .execute_hook_on_event
                            .clone()
                            .unwrap_or_else(|| WatchEventType::iter().collect()),
                        execute_on_synchronization: b
                            .execute_hook_on_synchronization
                            .unwrap_or(true),
                        name_selector: b.name_selector.clone(),
                        label_selector: b.label_selector.clone(),
                        field_selector: b.field_selector.clone(),
                        namespace: b.namespace.clone(),
                        jq_filter: b.jq_filter.clone(),
                    },
                }
            })
            .collect();

        let admission = |b: &v1::AdmissionBinding| {
            let (log_labels, metric_labels) = common(&b.name, None);
            let metadata = WebhookMetadata {
                name: b.name.clone(),
                webhook_id: safe_url_string(&b.name),
                configuration_id: b
                    .configuration_id
                    .clone()
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| DEFAULT_CONFIGURATION_ID.to_string()),
            };
            let common = BindingCommon {
                binding_name: b.name.clone(),
                include_snapshots_from: b.include_snapshots_from.clone(),
                group: b.group.clone(),
                log_labels,
                metric_labels,
                ..Default::default()
            };
            (common, metadata)
        };

        let validating = cfg
            .kubernetes_validating
            .iter()
            .map(|b| {
                let (common, metadata) = admission(b);
                ValidatingConfig {
                    common,
                    webhook: WebhookConfig {
                        webhook: validating_webhook(b),
                        metadata,
                    },
                }
            })
            .collect();

        let mutating = cfg
            .kubernetes_mutating
            .iter()
            .map(|b| {
                let (common, metadata) = admission(b);
                MutatingConfig {
                    common,
                    webhook: WebhookConfig {
                        webhook: mutating_webhook(b),
                        metadata,
                    },
                }
            })
            .collect();

        let conversion = cfg
            .kubernetes_custom_resource_conversion
            .iter()
            .map(|b| {
                let (log_labels, metric_labels) = common(&b.name, None);
                ConversionConfig {
                    common: BindingCommon {
                        binding_name: b.name.clone(),
                        include_snapshots_from: b.include_snapshots_from.clone(),
                        group: b.group.clone(),
                        log_labels,
                        metric_labels,
                        ..Default::default()
                    },
                    crd_name: b.crd_name.clone(),
                    rules: b.conversions.clone(),
                }
            })
            .collect();

        Self {
            on_startup: cfg.on_startup,
            schedule,
            kubernetes,
            validating,
            mutating,
            conversion,
        }
    }
}

fn validating_webhook(b: &v1::AdmissionBinding) -> ValidatingWebhook {
    ValidatingWebhook {
        name: b.name.clone(),
        rules: Some(b.rules.clone()),
        failure_policy: b.failure_policy.clone(),
        side_effects: b.side_effects.clone().unwrap_or_else(|| "None".into()),
        timeout_seconds: b.timeout_seconds,
        object_selector: b.label_selector.clone(),
        namespace_selector: b.namespace.as_ref().and_then(|n| n.label_selector.clone()),
        match_conditions: (!b.match_conditions.is_empty()).then(|| b.match_conditions.clone()),
        ..Default::default()
    }
}

fn mutating_webhook(b: &v1::AdmissionBinding) -> MutatingWebhook {
    MutatingWebhook {
        name: b.name.clone(),
        rules: Some(b.rules.clone()),
        failure_policy: b.failure_policy.clone(),
        side_effects: b.side_effects.clone().unwrap_or_else(|| "None".into()),
        timeout_seconds: b.timeout_seconds,
        object_selector: b.label_selector.clone(),
        namespace_selector: b.namespace.as_ref().and_then(|n| n.label_selector.clone()),
        match_conditions: (!b.match_conditions.is_empty()).then(|| b.match_conditions.clone()),
        reinvocation_policy: b.reinvocation_policy.clone(),
        ..Default::default()
    }
}

static CAMEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("([a-z0-9])([A-Z])").expect("valid regex"));
static UNSAFE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[^a-z0-9/-]").expect("valid regex"));
static DASHES: LazyLock<Regex> = LazyLock::new(|| Regex::new("-+").expect("valid regex"));

/// Safe_url_string turns a binding name into something usable as a URL path.
///
/// Slashes are kept, so names with path-like structure survive a round trip through a webhook
/// path.
pub fn safe_url_string<S: AsRef<str>>(s: S) -> String {
    let s = CAMEL.replace_all(s.as_ref(), "$1-$2").to_lowercase();
    let s = UNSAFE.replace_all(&s, "-");
    DASHES.replace_all(&s, "-").into_owned()
}

/// Hook is a discovered, configured hook.
#[derive(Debug)]
pub struct Hook {
    /// Name is the hook's path relative to the hooks directory.
    pub name: String,
    pub path: PathBuf,
    pub config: HookConfig,
    pub bindings: HookBindings,
    pub controller: HookController,
}

impl Hook {
    /// New builds a hook and its controller. Bindings are not enabled.
    pub fn new(name: String, path: PathBuf, config: HookConfig) -> Self {
        let bindings = HookBindings::new(&name, &config);
        let controller = HookController::new(&name, &bindings);
        Self {
            name,
            path,
            config,
            bindings,
            controller,
        }
    }

    /// Load runs the hook at `path` with `--config` and builds a Hook from the output.
    #[instrument(skip(exec))]
    pub async fn load(exec: &dyn Executor, hooks_dir: &Path, path: PathBuf) -> Result<Self> {
        let name = hook_name(hooks_dir, &path);
        let env = BTreeMap::new();
        let out = exec.run(&path, &["--config"], &env).await?;
        if !out.success() {
            return Err(out.into_error(&path));
        }
        let config = HookConfig::load(&out.stdout).map_err(|source| Error::HookConfig {
            hook: name.clone(),
            source,
        })?;
        debug!(hook = %name, bindings = ?config.bindings(), "loaded hook config");
        Ok(Self::new(name, path, config))
    }

    /// Order returns the onStartup order, if the hook has one.
    pub fn order(&self, t: BindingType) -> Option<f64> {
        match t {
            BindingType::OnStartup => self.bindings.on_startup,
            _ => None,
        }
    }
}

fn hook_name(dir: &Path, path: &Path) -> String {
    path.strip_prefix(dir)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned()
}
