use std::collections::BTreeMap;

use api::{KubeEvent, KubeEventType};

use crate::{
    binding::{BindingContext, BindingContextMetadata, BindingExecutionInfo},
    hook::{KubeConfig, MonitorConfig},
    prelude::*,
};

/// KubeBindingsController routes watch events to one hook's `kubernetes` bindings.
#[derive(Debug, Default)]
pub struct KubeBindingsController {
    bindings: Vec<KubeConfig>,
    /// Links map monitor ids to an index into `bindings`.
    links: BTreeMap<String, usize>,
}

impl KubeBindingsController {
    pub fn new(bindings: Vec<KubeConfig>) -> Self {
        Self {
            bindings,
            links: BTreeMap::new(),
        }
    }

    /// Enable builds the link table.
    pub fn enable(&mut self) {
        self.links = self
            .bindings
            .iter()
            .enumerate()
            .map(|(i, b)| (b.monitor.monitor_id.clone(), i))
            .collect();
    }

    /// Monitors returns what should be watched for this hook.
    pub fn monitors(&self) -> impl Iterator<Item = &MonitorConfig> {
        self.bindings.iter().map(|b| &b.monitor)
    }

    pub fn can_handle(&self, ev: &KubeEvent) -> bool {
        self.links.contains_key(&ev.monitor_id)
    }

    /// Handle builds the execution info for `ev`, if the binding wants to run for it.
    ///
    /// Watch events of types the binding does not subscribe to are dropped. A synchronization
    /// is dropped if the binding turned it off.
    pub fn handle(&self, ev: &KubeEvent) -> Option<BindingExecutionInfo> {
        let Some(b) = self
            .links
            .get(&ev.monitor_id)
            .and_then(|i| self.bindings.get(*i))
        else {
            diagnose(Diagnostic::UnknownMonitor {
                monitor_id: ev.monitor_id.clone(),
            });
            return None;
        };
        let metadata = BindingContextMetadata {
            binding_type: Some(BindingType::OnKubernetesEvent),
            include_snapshots: b.common.include_snapshots_from.clone(),
            group: b.common.group.clone(),
        };

        let binding_context: Vec<_> = match ev.type_ {
            KubeEventType::Synchronization if b.monitor.execute_on_synchronization => {
                vec![BindingContext {
                    metadata,
                    binding: b.common.binding_name.clone(),
                    type_: Some(ev.type_.to_string()),
                    objects: Some(ev.objects.clone()),
                    ..Default::default()
                }]
            }
            KubeEventType::Synchronization => vec![],
            KubeEventType::Event => ev
                .objects
                .iter()
                .zip(&ev.watch_events)
                .filter(|(_, we)| b.monitor.event_types.contains(*we))
                .map(|(obj, we)| BindingContext {
                    metadata: metadata.clone(),
                    binding: b.common.binding_name.clone(),
                    type_: Some(ev.type_.to_string()),
                    watch_event: Some(*we),
                    object: Some(obj.clone()),
                    ..Default::default()
                })
                .collect(),
        };
        if binding_context.is_empty() {
            trace!(monitor_id = %ev.monitor_id, "nothing to run");
            return None;
        }

        Some(BindingExecutionInfo {
            binding_context,
            allow_failure: b.common.allow_failure,
            binding: b.common.binding_name.clone(),
            include_snapshots: b.common.include_snapshots_from.clone(),
            group: b.common.group.clone(),
            queue: b.common.queue.clone(),
            log_labels: b.common.log_labels.clone(),
            metric_labels: b.common.metric_labels.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hook::HookBindings, testing::test};
    use api::{HookConfig, WatchEventType};
    use serde_json::json;

    fn controller() -> KubeBindingsController {
        let cfg = HookConfig::load(
            br#"
configVersion: v1
kubernetes:
- name: pods
  kind: Pod
  executeHookOnEvent: [Added, Deleted]
  allowFailure: true
- name: nodes
  kind: Node
  executeHookOnSynchronization: false
"#,
        )
        .expect("valid config");
        let mut c = KubeBindingsController::new(HookBindings::new("hook.sh", &cfg).kubernetes);
        c.enable();
        c
    }

    #[test]
    fn events_are_filtered() {
        let c = controller();
        let ev = KubeEvent {
            monitor_id: "hook.sh/pods/0".into(),
            type_: KubeEventType::Event,
            watch_events: vec![
                WatchEventType::Added,
                WatchEventType::Modified,
                WatchEventType::Deleted,
            ],
            objects: vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})],
        };
        assert!(c.can_handle(&ev));
        let info = c.handle(&ev).expect("handled");
        assert!(info.allow_failure);
        assert_eq!(info.binding, "pods");
        let got: Vec<_> = info
            .binding_context
            .iter()
            .map(|bc| (bc.watch_event, bc.object.clone()))
            .collect();
        assert_eq!(
            got,
            vec![
                (Some(WatchEventType::Added), Some(json!({"n": 1}))),
                (Some(WatchEventType::Deleted), Some(json!({"n": 3}))),
            ]
        );
        assert_eq!(info.binding_context[0].type_.as_deref(), Some("Event"));

        let only_modified = KubeEvent {
            watch_events: vec![WatchEventType::Modified],
            objects: vec![json!({})],
            ..ev
        };
        assert!(c.handle(&only_modified).is_none());
    }

    #[test]
    fn synchronization() {
        let c = controller();
        let sync = |id: &str| KubeEvent {
            monitor_id: id.into(),
            type_: KubeEventType::Synchronization,
            watch_events: vec![],
            objects: vec![json!({"n": 1}), json!({"n": 2})],
        };
        let info = c.handle(&sync("hook.sh/pods/0")).expect("handled");
        assert_eq!(info.binding_context.len(), 1);
        let bc = &info.binding_context[0];
        assert_eq!(bc.type_.as_deref(), Some("Synchronization"));
        assert_eq!(bc.objects.as_ref().map(Vec::len), Some(2));
        assert_eq!(bc.metadata.binding_type, Some(BindingType::OnKubernetesEvent));

        assert!(c.handle(&sync("hook.sh/nodes/1")).is_none());
        assert!(!c.can_handle(&sync("other.sh/pods/0")));
        assert!(c.handle(&sync("other.sh/pods/0")).is_none());
    }
}
