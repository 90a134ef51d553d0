//! spool - local resource scheduler for removable-media object storage.
//!
//! This library implements the daemon side of an object store that keeps
//! its data on removable media: tape cartridges behind a SCSI media
//! changer, or plain POSIX directories. Client drivers send allocation,
//! release and format requests over a framed socket protocol; the
//! scheduler brokers a small pool of physical drives, mounts and unmounts
//! media, batches expensive medium flushes, and persists lifecycle state
//! (locks, statuses, usage statistics) through the [`dss`] gateway.
//!
//! # High-Level API
//!
//! The [`daemon`] module provides the daemon shell used by `spoold`:
//!
//! ```ignore
//! use spool::config::Settings;
//! use spool::daemon::{Daemon, DaemonOptions};
//!
//! let settings = Settings::load_from(config_path)?;
//! let daemon = Daemon::new(settings, DaemonOptions::default())?;
//! daemon.run().await?;
//! ```

pub mod changer;
pub mod config;
pub mod daemon;
pub mod device;
pub mod dss;
pub mod error;
pub mod logging;
pub mod mediafs;
pub mod protocol;
pub mod queue;
pub mod retry;
pub mod sched;
pub mod time;
pub mod tlc;
pub mod types;
pub mod worker;

/// Version of the spool library and daemon.
///
/// This is synchronized across all components in the workspace.
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
