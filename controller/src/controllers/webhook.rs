//! The webhook binding controller is shared by the mutating, validating and conversion binding
//! types. Each type plugs in through [`WebhookKind`].

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{Debug, Display},
};

use api::{ConversionEvent, ConversionRule, MutatingEvent, ValidatingEvent};

use crate::{
    binding::{BindingContext, BindingContextMetadata, BindingExecutionInfo},
    hook::{BindingCommon, ConversionConfig, MutatingConfig, ValidatingConfig},
    prelude::*,
    webhooks::{ConversionWebhookManager, MutatingWebhookManager, ValidatingWebhookManager},
};

/// WebhookKind describes one webhook binding type.
pub trait WebhookKind {
    const BINDING_TYPE: BindingType;
    /// SHARED_CONFIGURATION means all of a hook's bindings must use one configuration id.
    const SHARED_CONFIGURATION: bool;

    type Binding: Clone + Debug + Send + Sync;
    /// Key identifies a binding inside a configuration.
    type Key: Clone + Debug + Display + Ord + Send + Sync;
    type Event;
    type Manager;

    /// Coordinates lists the `(configuration id, key)` pairs the binding answers to.
    fn coordinates(b: &Self::Binding) -> Vec<(String, Self::Key)>;
    /// Event_coordinates is where the event was sent.
    fn event_coordinates(ev: &Self::Event) -> (String, Self::Key);
    fn common(b: &Self::Binding) -> &BindingCommon;
    /// Register tells the owning manager about the binding.
    fn register(m: &mut Self::Manager, b: &Self::Binding);
    /// Context builds the binding context for a matched event.
    fn context(b: &Self::Binding, key: &Self::Key, ev: &Self::Event) -> BindingContext;
}

/// Validating is the `kubernetesValidating` binding type.
#[derive(Clone, Copy, Debug, Default)]
pub struct Validating;

/// Mutating is the `kubernetesMutating` binding type.
#[derive(Clone, Copy, Debug, Default)]
pub struct Mutating;

/// Conversion is the `kubernetesCustomResourceConversion` binding type.
///
/// The configuration id is the CRD name and the key is the conversion rule.
#[derive(Clone, Copy, Debug, Default)]
pub struct Conversion;

impl WebhookKind for Validating {
    const BINDING_TYPE: BindingType = BindingType::KubernetesValidating;
    const SHARED_CONFIGURATION: bool = true;
    type Binding = ValidatingConfig;
    type Key = String;
    type Event = ValidatingEvent;
    type Manager = ValidatingWebhookManager;

    fn coordinates(b: &Self::Binding) -> Vec<(String, Self::Key)> {
        let m = &b.webhook.metadata;
        vec![(m.configuration_id.clone(), m.webhook_id.clone())]
    }

    fn event_coordinates(ev: &Self::Event) -> (String, Self::Key) {
        (ev.configuration_id.clone(), ev.webhook_id.clone())
    }

    fn common(b: &Self::Binding) -> &BindingCommon {
        &b.common
    }

    fn register(m: &mut Self::Manager, b: &Self::Binding) {
        m.add_webhook(&b.webhook);
    }

    fn context(b: &Self::Binding, _: &Self::Key, ev: &Self::Event) -> BindingContext {
        BindingContext {
            binding: b.common.binding_name.clone(),
            review: Some(ev.review.clone()),
            ..Default::default()
        }
    }
}

impl WebhookKind for Mutating {
    const BINDING_TYPE: BindingType = BindingType::KubernetesMutating;
    const SHARED_CONFIGURATION: bool = true;
    type Binding = MutatingConfig;
    type Key = String;
    type Event = MutatingEvent;
    type Manager = MutatingWebhookManager;

    fn coordinates(b: &Self::Binding) -> Vec<(String, Self::Key)> {
        let m = &b.webhook.metadata;
        vec![(m.configuration_id.clone(), m.webhook_id.clone())]
    }

    fn event_coordinates(ev: &Self::Event) -> (String, Self::Key) {
        (ev.configuration_id.clone(), ev.webhook_id.clone())
    }

    fn common(b: &Self::Binding) -> &BindingCommon {
        &b.common
    }

    fn register(m: &mut Self::Manager, b: &Self::Binding) {
        m.add_webhook(&b.webhook);
    }

    fn context(b: &Self::Binding, _: &Self::Key, ev: &Self::Event) -> BindingContext {
        BindingContext {
            binding: b.common.binding_name.clone(),
            review: Some(ev.review.clone()),
            ..Default::default()
        }
    }
}

impl WebhookKind for Conversion {
    const BINDING_TYPE: BindingType = BindingType::KubernetesConversion;
    const SHARED_CONFIGURATION: bool = false;
    type Binding = ConversionConfig;
    type Key = ConversionRule;
    type Event = ConversionEvent;
    type Manager = ConversionWebhookManager;

    fn coordinates(b: &Self::Binding) -> Vec<(String, Self::Key)> {
        b.rules
            .iter()
            .map(|r| (b.crd_name.clone(), r.clone()))
            .collect()
    }

    fn event_coordinates(ev: &Self::Event) -> (String, Self::Key) {
        (ev.crd_name.clone(), ev.rule.clone())
    }

    fn common(b: &Self::Binding) -> &BindingCommon {
        &b.common
    }

    fn register(m: &mut Self::Manager, b: &Self::Binding) {
        m.add_crd(b.crd_name.clone());
    }

    fn context(b: &Self::Binding, key: &Self::Key, ev: &Self::Event) -> BindingContext {
        BindingContext {
            binding: b.common.binding_name.clone(),
            from_version: Some(key.from_version.clone()),
            to_version: Some(key.to_version.clone()),
            objects: Some(ev.objects.clone()),
            ..Default::default()
        }
    }
}

/// WebhookBindingsController routes webhook events to one hook's bindings of kind `K`.
#[derive(Debug)]
pub struct WebhookBindingsController<K: WebhookKind> {
    hook: String,
    bindings: Vec<K::Binding>,
    /// Configuration_id is the id shared by all bindings, for kinds that share one.
    configuration_id: Option<String>,
    /// Links map coordinates to an index into `bindings`.
    links: BTreeMap<(String, K::Key), usize>,
}

impl<K: WebhookKind> WebhookBindingsController<K> {
    /// New returns a controller for `bindings`. Nothing is routed until [`Self::enable`].
    pub fn new<S: Into<String>>(hook: S, bindings: Vec<K::Binding>) -> Self {
        Self {
            hook: hook.into(),
            bindings,
            configuration_id: None,
            links: BTreeMap::new(),
        }
    }

    /// Configuration_id reports the shared configuration id, once enabled.
    pub fn configuration_id(&self) -> Option<&str> {
        self.configuration_id.as_deref()
    }

    /// Configuration_ids lists every configuration id the controller routes.
    pub fn configuration_ids(&self) -> BTreeSet<&str> {
        self.links.keys().map(|(c, _)| c.as_str()).collect()
    }

    /// Enable builds the link table and registers every binding with `manager`.
    ///
    /// For kinds with a shared configuration id, the first non-empty id wins. A binding
    /// declaring another id is reported as a [`Diagnostic`] and routed under the winning id.
    pub fn enable(&mut self, manager: &mut K::Manager) {
        self.links.clear();
        for (i, b) in self.bindings.iter().enumerate() {
            for (configuration_id, key) in K::coordinates(b) {
                let configuration_id = if K::SHARED_CONFIGURATION {
                    shared_id::<K>(&self.hook, &mut self.configuration_id, configuration_id)
                } else {
                    configuration_id
                };
                self.links.insert((configuration_id, key), i);
            }
            K::register(manager, b);
        }
        debug!(
            hook = %self.hook,
            binding_type = %K::BINDING_TYPE,
            links = self.links.len(),
            "bindings enabled"
        );
    }

    /// Disable stops routing. Unregistering webhooks from a running cluster is not supported,
    /// so this does nothing.
    // TODO: remove the links and drop the webhooks from the managers once bindings can be
    // reloaded at runtime.
    pub fn disable(&mut self) {}

    /// Can_handle reports whether `ev` was sent to one of this controller's bindings.
    pub fn can_handle(&self, ev: &K::Event) -> bool {
        let (configuration_id, key) = K::event_coordinates(ev);
        if K::SHARED_CONFIGURATION
            && self.configuration_id.as_deref() != Some(configuration_id.as_str())
        {
            return false;
        }
        self.links.contains_key(&(configuration_id, key))
    }

    /// Handle builds the execution info for `ev`.
    ///
    /// An event for unknown coordinates is reported as a [`Diagnostic`] and yields an empty info
    /// that does not allow failure.
    pub fn handle(&self, ev: &K::Event) -> BindingExecutionInfo {
        let (configuration_id, key) = K::event_coordinates(ev);
        let known = self.links.keys().any(|(c, _)| *c == configuration_id);
        let Some(b) = self
            .links
            .get(&(configuration_id.clone(), key.clone()))
            .and_then(|i| self.bindings.get(*i))
        else {
            let webhook_id = key.to_string();
            diagnose(if known {
                Diagnostic::UnknownWebhook {
                    binding_type: K::BINDING_TYPE,
                    configuration_id,
                    webhook_id,
                }
            } else {
                Diagnostic::UnknownConfiguration {
                    binding_type: K::BINDING_TYPE,
                    configuration_id,
                    webhook_id,
                }
            });
            return BindingExecutionInfo::default();
        };

        let common = K::common(b);
        let mut bc = K::context(b, &key, ev);
        bc.metadata = BindingContextMetadata {
            binding_type: Some(K::BINDING_TYPE),
            include_snapshots: common.include_snapshots_from.clone(),
            group: common.group.clone(),
        };
        BindingExecutionInfo {
            binding_context: vec![bc],
            allow_failure: common.allow_failure,
            binding: common.binding_name.clone(),
            include_snapshots: common.include_snapshots_from.clone(),
            group: common.group.clone(),
            queue: None,
            log_labels: common.log_labels.clone(),
            metric_labels: common.metric_labels.clone(),
        }
    }
}

fn shared_id<K: WebhookKind>(hook: &str, kept: &mut Option<String>, id: String) -> String {
    if id.is_empty() {
        return kept.clone().unwrap_or_default();
    }
    match kept {
        None => {
            *kept = Some(id.clone());
            id
        }
        Some(k) if *k == id => id,
        Some(k) => {
            diagnose(Diagnostic::InconsistentConfigurationId {
                hook: hook.to_string(),
                binding_type: K::BINDING_TYPE,
                kept: k.clone(),
                seen: id,
            });
            k.clone()
        }
    }
}
