//! Valve policy: hysteresis between two watermarks.

use super::{lru_candidates, DumpPolicy, PolicyEvent, RegistryView};
use crate::common::{BufferId, Error, Result};

/// Starts dumping once usage exceeds the high watermark and keeps going
/// until usage is at or below the low watermark.
///
/// While usage sits within `[low, high]` nothing is dumped, so a drained
/// cycle is followed by a quiet period instead of one dump per allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValveDump {
    high: usize,
    low: usize,
}

impl ValveDump {
    pub const NAME: &'static str = "valve";
    pub const PARAMS: &'static [&'static str] = &["high_watermark", "low_watermark"];

    /// Create a valve policy.
    ///
    /// # Errors
    /// `Error::Configuration` unless `low < high`.
    pub fn new(high: usize, low: usize) -> Result<Self> {
        if low >= high {
            return Err(Error::Configuration(format!(
                "valve low watermark ({}) must be below the high watermark ({})",
                low, high
            )));
        }
        Ok(Self { high, low })
    }

    #[inline]
    pub fn high_watermark(&self) -> usize {
        self.high
    }

    #[inline]
    pub fn low_watermark(&self) -> usize {
        self.low
    }
}

impl DumpPolicy for ValveDump {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn target_bytes(&self, _event: PolicyEvent, view: &RegistryView<'_>) -> usize {
        let usage = view.in_memory_bytes();
        if usage > self.high {
            usage - self.low
        } else {
            0
        }
    }

    fn select_candidates(&self, view: &RegistryView<'_>, target_bytes: usize) -> Vec<BufferId> {
        lru_candidates(view, target_bytes)
    }

    fn param_names(&self) -> &'static [&'static str] {
        Self::PARAMS
    }

    fn param(&self, name: &str) -> Option<String> {
        match name {
            "high_watermark" => Some(self.high.to_string()),
            "low_watermark" => Some(self.low.to_string()),
            _ => None,
        }
    }
}
