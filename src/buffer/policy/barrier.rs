//! Barrier policy: a single memory threshold.

use super::{lru_candidates, DumpPolicy, PolicyEvent, RegistryView};
use crate::common::BufferId;

/// Dumps least recently used buffers whenever usage exceeds the barrier,
/// until usage is back at or below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierDump {
    barrier: usize,
}

impl BarrierDump {
    pub const NAME: &'static str = "barrier";
    pub const PARAMS: &'static [&'static str] = &["barrier"];

    /// Create a barrier policy with a threshold in bytes.
    pub fn new(barrier: usize) -> Self {
        Self { barrier }
    }

    #[inline]
    pub fn barrier(&self) -> usize {
        self.barrier
    }
}

impl DumpPolicy for BarrierDump {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn target_bytes(&self, _event: PolicyEvent, view: &RegistryView<'_>) -> usize {
        view.in_memory_bytes().saturating_sub(self.barrier)
    }

    fn select_candidates(&self, view: &RegistryView<'_>, target_bytes: usize) -> Vec<BufferId> {
        lru_candidates(view, target_bytes)
    }

    fn param_names(&self) -> &'static [&'static str] {
        Self::PARAMS
    }

    fn param(&self, name: &str) -> Option<String> {
        (name == "barrier").then(|| self.barrier.to_string())
    }
}
