//! Buffer identifier type.

use std::fmt;

/// Identifies a buffer registered with a [`BufferManager`].
///
/// Owners of large payloads hold only this identifier; the bytes themselves
/// belong to the manager and are reachable through a lock guard.
///
/// Ids are handed out sequentially and never reused by the same manager,
/// so a stale id can never alias a newer buffer.
///
/// # Example
/// ```
/// use interchange_mem::BufferId;
///
/// let id = BufferId::new(42);
/// assert_eq!(id.0, 42);
/// ```
///
/// [`BufferManager`]: crate::buffer::BufferManager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl BufferId {
    /// Create a new BufferId.
    #[inline]
    pub fn new(id: u64) -> Self {
        BufferId(id)
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_id_new() {
        let id = BufferId::new(10);
        assert_eq!(id.0, 10);
    }

    #[test]
    fn test_buffer_id_ordering() {
        assert!(BufferId::new(1) < BufferId::new(2));
        assert_eq!(BufferId::new(5), BufferId::new(5));
    }

    #[test]
    fn test_buffer_id_display() {
        assert_eq!(format!("{}", BufferId::new(42)), "Buffer(42)");
    }
}
