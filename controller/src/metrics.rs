//! Metrics contains the metric names and recording helpers for the controller.

use std::collections::BTreeMap;

use api::BindingType;
use metrics::Label;

/// ROUTED_EVENTS counts events handed to a hook.
pub const ROUTED_EVENTS: &str = "hook_operator_routed_events_total";

/// BUG_SIGNALS counts [`crate::Diagnostic`] reports.
pub const BUG_SIGNALS: &str = "hook_operator_bug_signals_total";

/// Describe registers descriptions for the controller's metrics.
pub fn describe() {
    metrics::describe_counter!(ROUTED_EVENTS, "events routed to a hook binding");
    metrics::describe_counter!(
        BUG_SIGNALS,
        "conditions that indicate a bug in the operator or a hook configuration"
    );
    metrics::describe_counter!(
        "hook_operator_admission_requests_total",
        "webhook requests served, by outcome"
    );
}

/// Routed records that an event was routed to a binding.
///
/// The binding's metric labels are attached as-is.
pub fn routed(binding_type: BindingType, labels: &BTreeMap<String, String>) {
    let mut l: Vec<Label> = labels
        .iter()
        .map(|(k, v)| Label::new(k.clone(), v.clone()))
        .collect();
    l.push(Label::new("binding_type", binding_type.to_string()));
    metrics::counter!(ROUTED_EVENTS, l).increment(1);
}
