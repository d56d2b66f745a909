//! Error types for interchange-mem.

use thiserror::Error;

use crate::common::BufferId;

/// Convenient Result type alias.
///
/// Instead of writing `Result<T, Error>` everywhere, we can write `Result<T>`.
pub type Result<T> = std::result::Result<T, Error>;

/// All recoverable errors raised by the buffer manager.
///
/// Registry-integrity violations (double free, pin count underflow) are
/// programming errors and panic instead of showing up here.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the dump store.
    ///
    /// Returned by a direct `dump_buffer` call when the backing file cannot
    /// be written. The buffer stays in memory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The request cannot be satisfied even after asking the dump policy
    /// to free memory.
    #[error("out of memory: {requested} bytes requested, {in_memory} in memory, limit {limit:?}")]
    OutOfMemory {
        /// Bytes that were requested.
        requested: usize,
        /// Bytes in memory when the request failed.
        in_memory: usize,
        /// Configured memory limit, if any.
        limit: Option<usize>,
    },

    /// The buffer is pinned by at least one lock.
    ///
    /// Recoverable: release the locks and retry.
    #[error("{id} is in use ({pin_count} active pins)")]
    InUse {
        /// The pinned buffer.
        id: BufferId,
        /// Pin count at the time of the call.
        pin_count: u32,
    },

    /// A dumped buffer could not be reconstructed from its backing store.
    #[error("corrupted dump for {id}: {reason}")]
    CorruptedDump {
        /// The buffer whose dump is unusable.
        id: BufferId,
        /// What went wrong.
        reason: String,
    },

    /// Unrecognized configuration value.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A write lock could not get exclusive access under the configured wait.
    #[error("{0} is busy")]
    Busy(BufferId),

    /// The id is not registered with this manager.
    #[error("{0} is not managed by this buffer manager")]
    UnknownBuffer(BufferId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InUse {
            id: BufferId::new(3),
            pin_count: 2,
        };
        assert_eq!(format!("{}", err), "Buffer(3) is in use (2 active pins)");

        let err = Error::Busy(BufferId::new(7));
        assert_eq!(format!("{}", err), "Buffer(7) is busy");

        let err = Error::Configuration("unknown loading mode 'eager'".into());
        assert_eq!(
            format!("{}", err),
            "configuration error: unknown loading mode 'eager'"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err: Error = io_err.into();

        match err {
            Error::Io(_) => {}
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_result_type_alias() {
        fn might_fail() -> Result<u32> {
            Ok(42)
        }

        assert_eq!(might_fail().unwrap(), 42);
    }
}
