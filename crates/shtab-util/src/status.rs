//! Status taxonomy shared by every layer of the store.
//!
//! Every fallible operation returns one of these codes. Recoverable
//! conditions (missed lookups, duplicate inserts, drained queues) are
//! ordinary variants that callers branch on; `StateInvalid` marks an
//! internal invariant breach and is treated as fatal by the layers above.
//!
//! A handful of variants are control-flow signals rather than failures:
//! `Empty` is the internal hand-off between collector sub-steps,
//! `IterStop`/`IterFinish` steer visitor callbacks, and `NoGcData` tells
//! the caller the collector has nothing to do. They live here so the whole
//! taxonomy stays in one table, the way the wire-facing status codes do.

use thiserror::Error;

/// Status codes traversed across layers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Status {
    #[error("invalid argument: {0}")]
    ArgInvalid(&'static str),

    #[error("structure used before init")]
    Uninited,

    #[error("arena out of memory: requested {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("not found")]
    NotFound,

    #[error("already exists")]
    Existed,

    #[error("stored value does not match the expected value")]
    NotEqual,

    #[error("destroy with residual content")]
    NotEmpty,

    #[error("operation rejected by state guard")]
    NotReady,

    #[error("internal invariant breach: {0}")]
    StateInvalid(&'static str),

    #[error("unsupported value tag {0}")]
    Unsupported(u8),

    #[error("queue drained")]
    Empty,

    #[error("iteration stopped by visitor")]
    IterStop,

    #[error("iteration finished")]
    IterFinish,

    #[error("table modified since iterator init")]
    TableModified,

    #[error("no work for the collector")]
    NoGcData,

    #[error("init called a second time")]
    InitTwice,

    #[error("system call failed: {call} (errno {errno})")]
    Sys { call: &'static str, errno: i32 },
}

impl Status {
    /// Whether the code reports an expected, recoverable condition.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Status::NotFound
                | Status::Existed
                | Status::NotEqual
                | Status::Empty
                | Status::OutOfMemory { .. }
                | Status::TableModified
                | Status::NoGcData
        )
    }

    /// Whether the code indicates a bug rather than an environment issue.
    pub fn is_bug(&self) -> bool {
        matches!(self, Status::StateInvalid(_) | Status::IndexOutOfRange { .. })
    }
}

/// Result alias used throughout the store.
pub type Result<T> = std::result::Result<T, Status>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        assert!(Status::NotFound.is_recoverable());
        assert!(Status::OutOfMemory { requested: 64 }.is_recoverable());
        assert!(!Status::StateInvalid("x").is_recoverable());
    }

    #[test]
    fn bug_classification() {
        assert!(Status::StateInvalid("mark").is_bug());
        assert!(!Status::Existed.is_bug());
    }

    #[test]
    fn display_carries_context() {
        let s = Status::OutOfMemory { requested: 128 }.to_string();
        assert!(s.contains("128"));
    }
}
