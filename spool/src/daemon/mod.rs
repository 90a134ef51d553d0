//! The daemon shell: startup mutual exclusion, the client listener and
//! router, signal handling and the bounded shutdown sequence.

mod lockfile;
mod router;
mod shell;

pub use lockfile::StartupLock;
pub use router::Router;
pub use shell::{Daemon, DaemonError, DaemonOptions};
