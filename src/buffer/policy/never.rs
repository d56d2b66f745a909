//! Never-dump policy.

use super::{DumpPolicy, PolicyEvent, RegistryView};
use crate::common::BufferId;

/// Disables eviction: buffers stay in memory until freed.
///
/// This is the manager's default policy.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverDump;

impl NeverDump {
    pub const NAME: &'static str = "never";
    pub const PARAMS: &'static [&'static str] = &[];
}

impl DumpPolicy for NeverDump {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn target_bytes(&self, _event: PolicyEvent, _view: &RegistryView<'_>) -> usize {
        0
    }

    fn select_candidates(&self, _view: &RegistryView<'_>, _target_bytes: usize) -> Vec<BufferId> {
        Vec::new()
    }
}
