//! Binding contains what a hook is given when it runs.

use std::collections::BTreeMap;

use api::{BindingType, WatchEventType};
use kube::core::{DynamicObject, admission::AdmissionReview};
use serde::Serialize;
use serde_json::Value;

/// BindingContextMetadata is routing information that is not shown to the hook.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BindingContextMetadata {
    pub binding_type: Option<BindingType>,
    pub include_snapshots: Vec<String>,
    pub group: String,
}

/// BindingContext describes one reason for a hook run.
///
/// A list of these is written to the file named by `BINDING_CONTEXT_PATH`.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingContext {
    #[serde(skip)]
    pub metadata: BindingContextMetadata,
    pub binding: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watch_event: Option<WatchEventType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objects: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review: Option<AdmissionReview<DynamicObject>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_version: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub snapshots: BTreeMap<String, Vec<Value>>,
}

/// BindingExecutionInfo is the result of routing an event to a hook binding.
///
/// An info with no binding contexts means the event was not handled.
#[derive(Clone, Debug, Default)]
pub struct BindingExecutionInfo {
    pub binding_context: Vec<BindingContext>,
    pub allow_failure: bool,
    pub binding: String,
    pub include_snapshots: Vec<String>,
    pub group: String,
    pub queue: Option<String>,
    /// LogLabels are attached to the routing log events.
    pub log_labels: BTreeMap<String, String>,
    /// MetricLabels are attached to the routed-events counter.
    pub metric_labels: BTreeMap<String, String>,
}

impl BindingExecutionInfo {
    /// Is_empty reports whether there is nothing to run.
    pub fn is_empty(&self) -> bool {
        self.binding_context.is_empty()
    }
}
