//! Always-dump policy.

use super::{lru_candidates, DumpPolicy, PolicyEvent, RegistryView};
use crate::common::BufferId;

/// Dumps every buffer as soon as nobody holds it.
///
/// An unlock to zero pins, or installing the policy, asks for an unbounded
/// target, so no unpinned buffer stays in memory afterwards. Allocations and
/// explicit restores stay resident until their first unlock. Useful to test
/// consumers against the slowest possible access path.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysDump;

impl AlwaysDump {
    pub const NAME: &'static str = "always";
    pub const PARAMS: &'static [&'static str] = &[];
}

impl DumpPolicy for AlwaysDump {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn target_bytes(&self, event: PolicyEvent, view: &RegistryView<'_>) -> usize {
        match event {
            PolicyEvent::Unlocked(_) | PolicyEvent::Refresh
                if view.buffers().any(|b| b.is_evictable()) =>
            {
                usize::MAX
            }
            _ => 0,
        }
    }

    fn select_candidates(&self, view: &RegistryView<'_>, target_bytes: usize) -> Vec<BufferId> {
        lru_candidates(view, target_bytes)
    }
}
