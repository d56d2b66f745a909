//! Dump policy implementations.
//!
//! A [`DumpPolicy`] decides when memory pressure calls for dumping and
//! which unpinned buffers go first. The manager holds exactly one policy
//! and swaps it as a whole at runtime.
//!
//! Currently implements:
//! - [`NeverDump`] - Disables eviction
//! - [`AlwaysDump`] - Dumps every buffer as soon as it is unpinned
//! - [`BarrierDump`] - Keeps usage at or below a single threshold
//! - [`ValveDump`] - Hysteresis between a high and a low watermark

mod always;
mod barrier;
mod never;
mod valve;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::buffer::Buffer;
use crate::common::config::parse_byte_size;
use crate::common::{BufferId, Error, Result};

pub use always::AlwaysDump;
pub use barrier::BarrierDump;
pub use never::NeverDump;
pub use valve::ValveDump;

/// What made the manager consult the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyEvent {
    /// A buffer was allocated or adopted.
    Allocated(BufferId),
    /// A buffer grew.
    Reallocated(BufferId),
    /// A dumped buffer was brought back into memory.
    Restored(BufferId),
    /// A buffer's pin count dropped to zero.
    Unlocked(BufferId),
    /// A new policy was installed.
    Refresh,
}

/// Read-only view of the registry handed to policies.
///
/// Built while the manager holds its registry lock; policies must not
/// block inside their callbacks.
pub struct RegistryView<'a> {
    buffers: &'a HashMap<BufferId, Buffer>,
    in_memory: usize,
}

impl<'a> RegistryView<'a> {
    pub(crate) fn new(buffers: &'a HashMap<BufferId, Buffer>, in_memory: usize) -> Self {
        Self { buffers, in_memory }
    }

    /// Bytes resident or reserved in memory.
    #[inline]
    pub fn in_memory_bytes(&self) -> usize {
        self.in_memory
    }

    pub fn buffers(&self) -> impl Iterator<Item = &'a Buffer> + 'a {
        self.buffers.values()
    }

    pub fn get(&self, id: BufferId) -> Option<&'a Buffer> {
        self.buffers.get(&id)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

/// Strategy deciding which unpinned buffers to dump, and when.
///
/// Implementations are immutable once installed: reconfiguring a policy
/// means building a new one and handing it to
/// [`BufferManager::set_dump_policy`](crate::buffer::BufferManager::set_dump_policy).
pub trait DumpPolicy: Send + Sync + fmt::Debug {
    /// Short name, as accepted by [`from_name`].
    fn name(&self) -> &'static str;

    /// Bytes the manager should try to free after `event`. Zero means
    /// no dumping.
    fn target_bytes(&self, event: PolicyEvent, view: &RegistryView<'_>) -> usize;

    /// Buffers to dump, in order, to free at least `target_bytes`.
    ///
    /// Only evictable buffers may be proposed. The manager stops early once
    /// the target is met and skips entries that stopped being evictable.
    fn select_candidates(&self, view: &RegistryView<'_>, target_bytes: usize) -> Vec<BufferId>;

    /// Names of the parameters this policy was built from.
    fn param_names(&self) -> &'static [&'static str] {
        &[]
    }

    /// Current value of a parameter, formatted as a byte count.
    fn param(&self, _name: &str) -> Option<String> {
        None
    }
}

/// Evictable buffers, least recently used first, ties broken by larger
/// size, cut off once their sizes add up to `target_bytes`.
pub fn lru_candidates(view: &RegistryView<'_>, target_bytes: usize) -> Vec<BufferId> {
    let mut evictable: Vec<&Buffer> = view.buffers().filter(|b| b.is_evictable()).collect();
    evictable.sort_by(|a, b| {
        a.last_access()
            .cmp(&b.last_access())
            .then_with(|| b.size().cmp(&a.size()))
            .then_with(|| a.id().cmp(&b.id()))
    });

    let mut selected = Vec::new();
    let mut freed = 0usize;
    for buffer in evictable {
        if freed >= target_bytes {
            break;
        }
        freed = freed.saturating_add(buffer.size());
        selected.push(buffer.id());
    }
    selected
}

/// Build a policy from its name and string parameters.
///
/// Sizes accept the units understood by
/// [`parse_byte_size`](crate::common::config::parse_byte_size).
///
/// | name      | parameters                          |
/// |-----------|-------------------------------------|
/// | `never`   | none                                |
/// | `always`  | none                                |
/// | `barrier` | `barrier`                           |
/// | `valve`   | `high_watermark`, `low_watermark`   |
///
/// # Example
/// ```
/// use interchange_mem::buffer::policy;
///
/// let barrier = policy::from_name("barrier", &[("barrier", "10MB")]).unwrap();
/// assert_eq!(barrier.name(), "barrier");
/// assert!(policy::from_name("barrier", &[("banner", "nope")]).is_err());
/// ```
pub fn from_name(name: &str, params: &[(&str, &str)]) -> Result<Arc<dyn DumpPolicy>> {
    let accepted: &[&str] = match name {
        NeverDump::NAME => NeverDump::PARAMS,
        AlwaysDump::NAME => AlwaysDump::PARAMS,
        BarrierDump::NAME => BarrierDump::PARAMS,
        ValveDump::NAME => ValveDump::PARAMS,
        other => {
            return Err(Error::Configuration(format!(
                "unknown dump policy '{}'",
                other
            )))
        }
    };

    let mut sizes = HashMap::new();
    for &(key, value) in params {
        if !accepted.contains(&key) {
            return Err(Error::Configuration(format!(
                "policy '{}' has no parameter '{}'",
                name, key
            )));
        }
        sizes.insert(key, parse_byte_size(value)?);
    }
    let required = |key: &str| {
        sizes.get(key).copied().ok_or_else(|| {
            Error::Configuration(format!("policy '{}' requires parameter '{}'", name, key))
        })
    };

    let policy: Arc<dyn DumpPolicy> = match name {
        NeverDump::NAME => Arc::new(NeverDump),
        AlwaysDump::NAME => Arc::new(AlwaysDump),
        BarrierDump::NAME => Arc::new(BarrierDump::new(required("barrier")?)),
        _ => Arc::new(ValveDump::new(
            required("high_watermark")?,
            required("low_watermark")?,
        )?),
    };
    Ok(policy)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;

    use crate::buffer::buffer::Content;
    use crate::buffer::Buffer;
    use crate::common::BufferId;

    /// Registry of resident buffers given as `(id, size, last_access)`.
    pub fn registry(entries: &[(u64, usize, u64)]) -> HashMap<BufferId, Buffer> {
        entries
            .iter()
            .map(|&(id, size, tick)| {
                let id = BufferId::new(id);
                (id, Buffer::new(id, size, Content::Resident, Vec::new(), tick))
            })
            .collect()
    }

    pub fn usage(buffers: &HashMap<BufferId, Buffer>) -> usize {
        buffers.values().map(|b| b.size()).sum()
    }
}
