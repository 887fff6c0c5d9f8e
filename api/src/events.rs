//! Events are the inbound triggers routed to hooks.

use kube::core::{DynamicObject, admission::AdmissionReview};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::v1::ConversionRule;

/// WatchEventType is the kind of change a watch reported.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
    strum::Display,
    strum::EnumIter,
    strum::EnumString,
)]
pub enum WatchEventType {
    /// The object was created.
    Added,
    /// The object was changed.
    Modified,
    /// The object was removed.
    Deleted,
}

/// KubeEventType distinguishes a single change from the initial listing.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, strum::Display)]
pub enum KubeEventType {
    /// One or more watch events.
    Event,
    /// The complete object list observed when a monitor starts.
    Synchronization,
}

/// KubeEvent is emitted by the watch subsystem for one monitor.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeEvent {
    /// MonitorId identifies the binding the watch was started for.
    pub monitor_id: String,
    /// Type of the event.
    #[serde(rename = "type")]
    pub type_: KubeEventType,
    /// WatchEvents describes each object in `objects`, in the same order.
    ///
    /// Empty for synchronization events.
    #[serde(default)]
    pub watch_events: Vec<WatchEventType>,
    /// Objects involved in the event.
    #[serde(default)]
    pub objects: Vec<Value>,
}

/// AdmissionEvent carries one admission review to the hook that registered the webhook.
#[derive(Clone, Debug)]
pub struct AdmissionEvent {
    /// WebhookId is the second half of the request path.
    pub webhook_id: String,
    /// ConfigurationId is the first segment of the request path.
    pub configuration_id: String,
    /// Review is the decoded request.
    pub review: AdmissionReview<DynamicObject>,
}

/// MutatingEvent is an [`AdmissionEvent`] delivered to a mutating webhook.
pub type MutatingEvent = AdmissionEvent;
/// ValidatingEvent is an [`AdmissionEvent`] delivered to a validating webhook.
pub type ValidatingEvent = AdmissionEvent;

/// ConversionEvent asks for objects of one CRD to be converted along one rule.
#[derive(Clone, Debug, PartialEq)]
pub struct ConversionEvent {
    /// CrdName is the full name of the CRD.
    pub crd_name: String,
    /// Rule is the conversion step being asked for.
    pub rule: ConversionRule,
    /// Objects to convert. All are at `rule.from_version`.
    pub objects: Vec<Value>,
}
