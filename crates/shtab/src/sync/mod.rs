//! Cross-process synchronisation primitives.

pub mod robust;

pub use robust::{RobustGuard, RobustMutex, TryLock};
