use std::collections::BTreeMap;

use crate::{
    binding::{BindingContext, BindingContextMetadata, BindingExecutionInfo},
    hook::ScheduleConfig,
    prelude::*,
};

/// ScheduleBindingsController routes crontab ticks to one hook's `schedule` bindings.
#[derive(Debug, Default)]
pub struct ScheduleBindingsController {
    bindings: Vec<ScheduleConfig>,
    /// Links map a crontab to every binding using it.
    links: BTreeMap<String, Vec<usize>>,
}

impl ScheduleBindingsController {
    pub fn new(bindings: Vec<ScheduleConfig>) -> Self {
        Self {
            bindings,
            links: BTreeMap::new(),
        }
    }

    /// Enable builds the link table.
    pub fn enable(&mut self) {
        self.links.clear();
        for (i, b) in self.bindings.iter().enumerate() {
            self.links.entry(b.crontab.clone()).or_default().push(i);
        }
    }

    /// Crontabs lists the distinct crontabs in use.
    pub fn crontabs(&self) -> impl Iterator<Item = &str> {
        self.links.keys().map(String::as_str)
    }

    pub fn can_handle(&self, crontab: &str) -> bool {
        self.links.contains_key(crontab)
    }

    /// Handle returns one execution info per binding sharing `crontab`, in declaration order.
    pub fn handle(&self, crontab: &str) -> Vec<BindingExecutionInfo> {
        self.links
            .get(crontab)
            .into_iter()
            .flatten()
            .filter_map(|i| self.bindings.get(*i))
            .map(|b| BindingExecutionInfo {
                binding_context: vec![BindingContext {
                    metadata: BindingContextMetadata {
                        binding_type: Some(BindingType::Schedule),
                        include_snapshots: b.common.include_snapshots_from.clone(),
                        group: b.common.group.clone(),
                    },
                    binding: b.common.binding_name.clone(),
                    type_: Some("Schedule".into()),
                    ..Default::default()
                }],
                allow_failure: b.common.allow_failure,
                binding: b.common.binding_name.clone(),
                include_snapshots: b.common.include_snapshots_from.clone(),
                group: b.common.group.clone(),
                queue: b.common.queue.clone(),
                log_labels: b.common.log_labels.clone(),
                metric_labels: b.common.metric_labels.clone(),
            })
            .collect()
    }
}
