//! V1 is the `configVersion: v1` hook configuration document.

use std::{borrow::Cow, collections::BTreeSet, fmt};

use k8s_openapi::{
    api::admissionregistration::v1 as admissionregistration,
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use super::*;
use crate::events::WatchEventType;

/// VERSION is the only accepted value of `configVersion`.
pub const VERSION: &str = "v1";

/// HookConfig is what a hook prints to stdout when invoked with `--config`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = unique_binding_names))]
pub struct HookConfig {
    /// ConfigVersion must be "v1".
    pub config_version: String,
    /// OnStartup requests a run at startup. Hooks run in ascending order of this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_startup: Option<f64>,
    /// Schedule lists crontab bindings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[validate(nested)]
    pub schedule: Vec<ScheduleBinding>,
    /// Kubernetes lists object-watch bindings.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[validate(nested)]
    pub kubernetes: Vec<KubernetesBinding>,
    /// KubernetesValidating lists validating admission webhooks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[validate(nested)]
    pub kubernetes_validating: Vec<AdmissionBinding>,
    /// KubernetesMutating lists mutating admission webhooks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[validate(nested)]
    pub kubernetes_mutating: Vec<AdmissionBinding>,
    /// KubernetesCustomResourceConversion lists CRD conversion webhooks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[validate(nested)]
    pub kubernetes_custom_resource_conversion: Vec<ConversionBinding>,
}

impl HookConfig {
    /// Load parses and validates a configuration document.
    ///
    /// Both YAML and JSON are accepted.
    pub fn load(buf: &[u8]) -> Result<Self> {
        let mut cfg: HookConfig = serde_yaml::from_slice(buf)?;
        if cfg.config_version != VERSION {
            return Err(Error::ConfigVersion(cfg.config_version));
        }
        cfg.validate()?;
        for b in cfg.kubernetes_custom_resource_conversion.iter_mut() {
            let group = b.crd_group().to_string();
            b.conversions = b.conversions.iter().map(|r| r.qualified(&group)).collect();
        }
        Ok(cfg)
    }

    /// Bindings reports every binding type this configuration declares.
    pub fn bindings(&self) -> Vec<BindingType> {
        let mut out = Vec::new();
        if self.on_startup.is_some() {
            out.push(BindingType::OnStartup);
        }
        if !self.schedule.is_empty() {
            out.push(BindingType::Schedule);
        }
        if !self.kubernetes.is_empty() {
            out.push(BindingType::OnKubernetesEvent);
        }
        if !self.kubernetes_validating.is_empty() {
            out.push(BindingType::KubernetesValidating);
        }
        if !self.kubernetes_mutating.is_empty() {
            out.push(BindingType::KubernetesMutating);
        }
        if !self.kubernetes_custom_resource_conversion.is_empty() {
            out.push(BindingType::KubernetesConversion);
        }
        out
    }

    fn binding_names(&self) -> impl Iterator<Item = &str> {
        let s = self.schedule.iter().map(|b| b.name.as_str());
        let k = self.kubernetes.iter().map(|b| b.name.as_str());
        let v = self.kubernetes_validating.iter().map(|b| b.name.as_str());
        let m = self.kubernetes_mutating.iter().map(|b| b.name.as_str());
        let c = self
            .kubernetes_custom_resource_conversion
            .iter()
            .map(|b| b.name.as_str());
        s.chain(k).chain(v).chain(m).chain(c)
    }
}

fn unique_binding_names(cfg: &HookConfig) -> Result<(), ValidationError> {
    let mut seen = BTreeSet::new();
    for name in cfg.binding_names() {
        if !seen.insert(name) {
            return Err(ValidationError::new("duplicate_binding")
                .with_message(Cow::Owned(format!("binding name {name:?} is used twice"))));
        }
    }
    Ok(())
}

/// ScheduleBinding runs the hook on a crontab.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleBinding {
    /// Name is the binding name passed to the hook.
    #[validate(length(min = 1))]
    pub name: String,
    /// Crontab is the schedule, in crontab format.
    #[validate(length(min = 1))]
    pub crontab: String,
    /// AllowFailure keeps the queue going when the hook fails.
    #[serde(default)]
    pub allow_failure: bool,
    /// Queue names the task queue for the runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    /// Group combines bindings into one binding context.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    /// IncludeSnapshotsFrom names kubernetes bindings whose snapshots are passed along.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_snapshots_from: Vec<String>,
}

/// KubernetesBinding runs the hook when watched objects change.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesBinding {
    /// Name is the binding name passed to the hook.
    #[validate(length(min = 1))]
    pub name: String,
    /// ApiVersion of the watched kind.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    /// Kind to watch.
    #[validate(length(min = 1))]
    pub kind: String,
    /// ExecuteHookOnEvent filters watch events. All events are used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_hook_on_event: Option<Vec<WatchEventType>>,
    /// ExecuteHookOnSynchronization runs the hook with the initial object list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execute_hook_on_synchronization: Option<bool>,
    /// NameSelector restricts the watch to named objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_selector: Option<NameSelector>,
    /// LabelSelector restricts the watch by labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
    /// FieldSelector restricts the watch by fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_selector: Option<FieldSelector>,
    /// Namespace restricts the watch to some namespaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<NamespaceSelector>,
    /// JqFilter is applied to objects before they are handed to the hook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jq_filter: Option<String>,
    /// AllowFailure keeps the queue going when the hook fails.
    #[serde(default)]
    pub allow_failure: bool,
    /// Queue names the task queue for the runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    /// Group combines bindings into one binding context.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    /// IncludeSnapshotsFrom names kubernetes bindings whose snapshots are passed along.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_snapshots_from: Vec<String>,
}

/// NameSelector matches objects by name.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NameSelector {
    /// MatchNames lists the accepted names.
    #[serde(default)]
    pub match_names: Vec<String>,
}

/// FieldSelector matches objects by field values.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FieldSelector {
    /// MatchExpressions are ANDed together.
    #[serde(default)]
    pub match_expressions: Vec<FieldSelectorRequirement>,
}

/// FieldSelectorRequirement is a single field comparison.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FieldSelectorRequirement {
    /// Field is the field path, e.g. `metadata.name`.
    pub field: String,
    /// Operator is one of `=`, `==`, `!=`.
    pub operator: String,
    /// Value to compare against.
    pub value: String,
}

/// NamespaceSelector restricts bindings to a set of namespaces.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSelector {
    /// NameSelector matches namespaces by name. Only used by kubernetes bindings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_selector: Option<NameSelector>,
    /// LabelSelector matches namespaces by label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
}

/// AdmissionBinding declares a validating or mutating webhook.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionBinding {
    /// Name is the binding name and the name of the generated webhook.
    #[validate(length(min = 1))]
    pub name: String,
    /// ConfigurationId selects the configuration object the webhook is placed in.
    ///
    /// All webhooks of one hook are expected to use the same value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_id: Option<String>,
    /// Rules select the requests sent to the webhook.
    #[serde(default)]
    pub rules: Vec<admissionregistration::RuleWithOperations>,
    /// FailurePolicy is "Fail" or "Ignore".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<String>,
    /// SideEffects defaults to "None".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side_effects: Option<String>,
    /// TimeoutSeconds for the API server to wait on the webhook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,
    /// LabelSelector is used as the webhook's object selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
    /// Namespace is used as the webhook's namespace selector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<NamespaceSelector>,
    /// MatchConditions further filter requests with CEL expressions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_conditions: Vec<admissionregistration::MatchCondition>,
    /// ReinvocationPolicy is only meaningful for mutating webhooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reinvocation_policy: Option<String>,
    /// Group combines bindings into one binding context.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    /// IncludeSnapshotsFrom names kubernetes bindings whose snapshots are passed along.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_snapshots_from: Vec<String>,
}

/// ConversionBinding declares conversions for one CRD.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConversionBinding {
    /// Name is the binding name passed to the hook.
    #[validate(length(min = 1))]
    pub name: String,
    /// CrdName is the full CRD name, e.g. `crontabs.stable.example.com`.
    #[validate(custom(function = validate_crd_name))]
    pub crd_name: String,
    /// Conversions lists the single-step conversions this hook performs.
    #[validate(length(min = 1))]
    pub conversions: Vec<ConversionRule>,
    /// Group combines bindings into one binding context.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    /// IncludeSnapshotsFrom names kubernetes bindings whose snapshots are passed along.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_snapshots_from: Vec<String>,
}

impl ConversionBinding {
    /// Group returns the API group part of the CRD name.
    pub fn crd_group(&self) -> &str {
        self.crd_name
            .split_once('.')
            .map(|(_, g)| g)
            .unwrap_or_default()
    }
}

fn validate_crd_name(name: &str) -> Result<(), ValidationError> {
    match name.split_once('.') {
        Some((plural, group)) if !plural.is_empty() && !group.is_empty() => Ok(()),
        _ => Err(ValidationError::new("crd_name")
            .with_message(Cow::Owned(format!("{name:?} is not of the form plural.group")))),
    }
}

/// ConversionRule is a single conversion step between two API versions.
#[derive(
    Clone, Debug, Default, Deserialize, Eq, Hash, JsonSchema, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "camelCase")]
pub struct ConversionRule {
    /// FromVersion is the source apiVersion.
    pub from_version: String,
    /// ToVersion is the destination apiVersion.
    pub to_version: String,
}

impl ConversionRule {
    /// New builds a rule.
    pub fn new<A: Into<String>, B: Into<String>>(from: A, to: B) -> Self {
        Self {
            from_version: from.into(),
            to_version: to.into(),
        }
    }

    /// Qualified returns the rule with both versions prefixed by `group` if they lack one.
    pub fn qualified(&self, group: &str) -> Self {
        let q = |v: &str| {
            if v.contains('/') || group.is_empty() {
                v.to_string()
            } else {
                format!("{group}/{v}")
            }
        };
        Self {
            from_version: q(&self.from_version),
            to_version: q(&self.to_version),
        }
    }
}

impl fmt::Display for ConversionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from_version, self.to_version)
    }
}
