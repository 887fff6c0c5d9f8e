//! Controllers route events to the bindings of a single hook.
//!
//! Every hook owns a [`HookController`], which holds one binding controller per binding type the
//! hook declared. The manager asks each hook's controller whether it can handle an event before
//! asking it to handle it.

use api::{ConversionEvent, KubeEvent, MutatingEvent, ValidatingEvent};

use crate::{
    binding::BindingExecutionInfo,
    hook::{HookBindings, MonitorConfig},
    webhooks::WebhookManagers,
};

mod kubernetes;
mod schedule;
mod webhook;

pub use kubernetes::KubeBindingsController;
pub use schedule::ScheduleBindingsController;
pub use webhook::{Conversion, Mutating, Validating, WebhookBindingsController, WebhookKind};

/// HookController is the per-hook set of binding controllers.
#[derive(Debug, Default)]
pub struct HookController {
    kube: Option<KubeBindingsController>,
    schedule: Option<ScheduleBindingsController>,
    validating: Option<WebhookBindingsController<Validating>>,
    mutating: Option<WebhookBindingsController<Mutating>>,
    conversion: Option<WebhookBindingsController<Conversion>>,
}

impl HookController {
    /// New builds controllers for the binding types `bindings` declares.
    pub fn new(hook: &str, bindings: &HookBindings) -> Self {
        Self {
            kube: (!bindings.kubernetes.is_empty())
                .then(|| KubeBindingsController::new(bindings.kubernetes.clone())),
            schedule: (!bindings.schedule.is_empty())
                .then(|| ScheduleBindingsController::new(bindings.schedule.clone())),
            validating: (!bindings.validating.is_empty())
                .then(|| WebhookBindingsController::new(hook, bindings.validating.clone())),
            mutating: (!bindings.mutating.is_empty())
                .then(|| WebhookBindingsController::new(hook, bindings.mutating.clone())),
            conversion: (!bindings.conversion.is_empty())
                .then(|| WebhookBindingsController::new(hook, bindings.conversion.clone())),
        }
    }

    /// Enable turns on routing for every binding and registers webhooks with `managers`.
    pub fn enable(&mut self, managers: &mut WebhookManagers) {
        if let Some(c) = &mut self.kube {
            c.enable();
        }
        if let Some(c) = &mut self.schedule {
            c.enable();
        }
        if let Some(c) = &mut self.validating {
            c.enable(&mut managers.validating);
        }
        if let Some(c) = &mut self.mutating {
            c.enable(&mut managers.mutating);
        }
        if let Some(c) = &mut self.conversion {
            c.enable(&mut managers.conversion);
        }
    }

    /// Disable turns off the webhook bindings. See [`WebhookBindingsController::disable`].
    pub fn disable(&mut self) {
        if let Some(c) = &mut self.validating {
            c.disable();
        }
        if let Some(c) = &mut self.mutating {
            c.disable();
        }
        if let Some(c) = &mut self.conversion {
            c.disable();
        }
    }

    /// Kube_monitors lists the watches the hook needs.
    pub fn kube_monitors(&self) -> Vec<&MonitorConfig> {
        self.kube
            .iter()
            .flat_map(KubeBindingsController::monitors)
            .collect()
    }

    /// Crontabs lists the schedules the hook needs.
    pub fn crontabs(&self) -> Vec<&str> {
        self.schedule
            .iter()
            .flat_map(ScheduleBindingsController::crontabs)
            .collect()
    }

    pub fn can_handle_kube_event(&self, ev: &KubeEvent) -> bool {
        self.kube.as_ref().is_some_and(|c| c.can_handle(ev))
    }

    pub fn handle_kube_event(&self, ev: &KubeEvent) -> Option<BindingExecutionInfo> {
        self.kube.as_ref().and_then(|c| c.handle(ev))
    }

    pub fn can_handle_schedule_event(&self, crontab: &str) -> bool {
        self.schedule.as_ref().is_some_and(|c| c.can_handle(crontab))
    }

    pub fn handle_schedule_event(&self, crontab: &str) -> Vec<BindingExecutionInfo> {
        self.schedule
            .as_ref()
            .map(|c| c.handle(crontab))
            .unwrap_or_default()
    }

    pub fn can_handle_validating_event(&self, ev: &ValidatingEvent) -> bool {
        self.validating.as_ref().is_some_and(|c| c.can_handle(ev))
    }

    pub fn handle_validating_event(&self, ev: &ValidatingEvent) -> BindingExecutionInfo {
        self.validating
            .as_ref()
            .map(|c| c.handle(ev))
            .unwrap_or_default()
    }

    pub fn can_handle_mutating_event(&self, ev: &MutatingEvent) -> bool {
        self.mutating.as_ref().is_some_and(|c| c.can_handle(ev))
    }

    pub fn handle_mutating_event(&self, ev: &MutatingEvent) -> BindingExecutionInfo {
        self.mutating
            .as_ref()
            .map(|c| c.handle(ev))
            .unwrap_or_default()
    }

    pub fn can_handle_conversion_event(&self, ev: &ConversionEvent) -> bool {
        self.conversion.as_ref().is_some_and(|c| c.can_handle(ev))
    }

    pub fn handle_conversion_event(&self, ev: &ConversionEvent) -> BindingExecutionInfo {
        self.conversion
            .as_ref()
            .map(|c| c.handle(ev))
            .unwrap_or_default()
    }
}
