//! The I/O scheduler: request containers, dispatch, lock recovery and the
//! per-family scheduler loop.

pub mod dispatch;
pub mod recovery;
pub mod request;
mod scheduler;

pub use dispatch::{Dispatcher, Placement};
pub use recovery::{reconcile_locks, RecoveryReport};
pub use scheduler::{FamilyScheduler, SHUTDOWN_TIMEOUT};
