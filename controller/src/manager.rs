//! Manager discovers hooks and routes events to them.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::Arc,
};

use api::{ConversionEvent, ConversionRule, KubeEvent, MutatingEvent, ValidatingEvent};

use crate::{
    binding::BindingExecutionInfo,
    chain::ChainStorage,
    executor::{Executor, find_executables},
    hook::{Hook, MonitorConfig},
    prelude::*,
    webhooks::WebhookManagers,
};

/// HookIndex is everything the manager knows about loaded hooks.
///
/// It is built once by [`HookManager::init`] and only read afterwards.
#[derive(Debug, Default)]
pub struct HookIndex {
    by_name: BTreeMap<String, Hook>,
    names_in_order: Vec<String>,
    by_binding: BTreeMap<BindingType, Vec<String>>,
    chains: ChainStorage,
}

impl HookIndex {
    fn insert(&mut self, hook: Hook) {
        for t in hook.config.bindings() {
            self.by_binding.entry(t).or_default().push(hook.name.clone());
        }
        for c in &hook.bindings.conversion {
            for r in &c.rules {
                self.chains.put(c.crd_name.clone(), r.clone());
            }
        }
        self.names_in_order.push(hook.name.clone());
        self.by_name.insert(hook.name.clone(), hook);
    }
}

/// HookManager owns the loaded hooks.
pub struct HookManager {
    executor: Arc<dyn Executor>,
    hooks_dir: PathBuf,
    index: HookIndex,
    webhooks: WebhookManagers,
}

impl HookManager {
    /// New returns a manager for the hooks under `hooks_dir`. Nothing is loaded until
    /// [`HookManager::init`].
    pub fn new<P: Into<PathBuf>>(
        executor: Arc<dyn Executor>,
        hooks_dir: P,
        webhooks: WebhookManagers,
    ) -> Self {
        Self {
            executor,
            hooks_dir: hooks_dir.into(),
            index: HookIndex::default(),
            webhooks,
        }
    }

    /// Executor returns the executor hooks are run with.
    pub fn executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.executor)
    }

    /// Init discovers and loads every hook, in path order.
    ///
    /// Any failure aborts the whole load and leaves the manager as it was.
    #[instrument(skip(self), fields(hooks_dir = ?self.hooks_dir))]
    pub async fn init(&mut self) -> Result<()> {
        let paths = find_executables(&self.hooks_dir)?;
        info!(count = paths.len(), "discovered hooks");

        let mut index = HookIndex::default();
        let mut webhooks = self.webhooks.cleared();
        for path in paths {
            let mut hook = Hook::load(self.executor.as_ref(), &self.hooks_dir, path).await?;
            hook.controller.enable(&mut webhooks);
            info!(hook = %hook.name, bindings = ?hook.config.bindings(), "hook loaded");
            index.insert(hook);
        }

        self.index = index;
        self.webhooks = webhooks;
        Ok(())
    }

    /// Disable_bindings turns off the webhook bindings of every hook.
    ///
    /// Registered webhooks stay with the managers, so their configuration objects can still be
    /// deleted afterwards.
    pub fn disable_bindings(&mut self) {
        for hook in self.index.by_name.values_mut() {
            hook.controller.disable();
        }
        debug!(hooks = self.index.by_name.len(), "bindings disabled");
    }

    /// Get_hook returns the hook called `name`.
    pub fn get_hook(&self, name: &str) -> Option<&Hook> {
        self.index.by_name.get(name)
    }

    /// Hook_names lists hook names in discovery order.
    pub fn hook_names(&self) -> &[String] {
        &self.index.names_in_order
    }

    /// Webhooks returns the webhook managers hooks registered with.
    pub fn webhooks(&self) -> &WebhookManagers {
        &self.webhooks
    }

    /// Get_hooks_in_order returns the names of the hooks bound to `t`, in discovery order.
    ///
    /// For [`BindingType::OnStartup`] the hooks are stably sorted by their declared order.
    pub fn get_hooks_in_order(&self, t: BindingType) -> Result<Vec<String>> {
        let names = self.index.by_binding.get(&t).cloned().unwrap_or_default();
        if t != BindingType::OnStartup {
            return Ok(names);
        }
        let mut ordered = names
            .into_iter()
            .map(|n| match self.get_hook(&n).and_then(|h| h.order(t)) {
                Some(o) => Ok((o, n)),
                None => Err(Error::StartupOrder(n)),
            })
            .collect::<Result<Vec<_>>>()?;
        ordered.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(ordered.into_iter().map(|(_, n)| n).collect())
    }

    fn hooks(&self, t: BindingType) -> impl Iterator<Item = &Hook> {
        self.index
            .by_binding
            .get(&t)
            .into_iter()
            .flatten()
            .filter_map(|n| self.index.by_name.get(n))
    }

    fn dispatch<F>(&self, t: BindingType, hook: &Hook, info: BindingExecutionInfo, cb: &mut F)
    where
        F: FnMut(&Hook, BindingExecutionInfo),
    {
        crate::metrics::routed(t, &info.metric_labels);
        debug!(
            hook = %hook.name,
            binding = %info.binding,
            binding_type = %t,
            labels = ?info.log_labels,
            contexts = info.binding_context.len(),
            "event routed"
        );
        cb(hook, info);
    }

    /// Handle_kube_event calls `cb` for each hook binding that wants `ev`.
    pub fn handle_kube_event<F>(&self, ev: &KubeEvent, mut cb: F)
    where
        F: FnMut(&Hook, BindingExecutionInfo),
    {
        let t = BindingType::OnKubernetesEvent;
        for hook in self.hooks(t) {
            if !hook.controller.can_handle_kube_event(ev) {
                continue;
            }
            if let Some(info) = hook.controller.handle_kube_event(ev) {
                self.dispatch(t, hook, info, &mut cb);
            }
        }
    }

    /// Handle_schedule_event calls `cb` for each binding using `crontab`.
    pub fn handle_schedule_event<F>(&self, crontab: &str, mut cb: F)
    where
        F: FnMut(&Hook, BindingExecutionInfo),
    {
        let t = BindingType::Schedule;
        for hook in self.hooks(t) {
            if !hook.controller.can_handle_schedule_event(crontab) {
                continue;
            }
            for info in hook.controller.handle_schedule_event(crontab) {
                self.dispatch(t, hook, info, &mut cb);
            }
        }
    }

    /// Handle_validating_event calls `cb` for the hook the review was sent to.
    pub fn handle_validating_event<F>(&self, ev: &ValidatingEvent, mut cb: F)
    where
        F: FnMut(&Hook, BindingExecutionInfo),
    {
        let t = BindingType::KubernetesValidating;
        for hook in self.hooks(t) {
            if hook.controller.can_handle_validating_event(ev) {
                let info = hook.controller.handle_validating_event(ev);
                self.dispatch(t, hook, info, &mut cb);
            }
        }
    }

    /// Handle_mutating_event calls `cb` for the hook the review was sent to.
    pub fn handle_mutating_event<F>(&self, ev: &MutatingEvent, mut cb: F)
    where
        F: FnMut(&Hook, BindingExecutionInfo),
    {
        let t = BindingType::KubernetesMutating;
        for hook in self.hooks(t) {
            if hook.controller.can_handle_mutating_event(ev) {
                let info = hook.controller.handle_mutating_event(ev);
                self.dispatch(t, hook, info, &mut cb);
            }
        }
    }

    /// Handle_conversion_event calls `cb` for the hooks declaring `ev.rule` for the CRD.
    pub fn handle_conversion_event<F>(&self, ev: &ConversionEvent, mut cb: F)
    where
        F: FnMut(&Hook, BindingExecutionInfo),
    {
        let t = BindingType::KubernetesConversion;
        for hook in self.hooks(t) {
            if hook.controller.can_handle_conversion_event(ev) {
                let info = hook.controller.handle_conversion_event(ev);
                self.dispatch(t, hook, info, &mut cb);
            }
        }
    }

    /// Find_conversion_chain returns the steps converting `rule.from_version` to
    /// `rule.to_version` for `crd_name`. Empty means the conversion is impossible.
    pub fn find_conversion_chain(
        &self,
        crd_name: &str,
        rule: &ConversionRule,
    ) -> Vec<ConversionRule> {
        self.index.chains.find_conversion_chain(crd_name, rule)
    }

    /// Kube_monitors lists the watches every hook needs, in discovery order.
    pub fn kube_monitors(&self) -> Vec<&MonitorConfig> {
        self.hooks(BindingType::OnKubernetesEvent)
            .flat_map(|h| h.controller.kube_monitors())
            .collect()
    }

    /// Crontabs lists the distinct schedules hooks need.
    pub fn crontabs(&self) -> BTreeSet<&str> {
        self.hooks(BindingType::Schedule)
            .flat_map(|h| h.controller.crontabs())
            .collect()
    }
}
