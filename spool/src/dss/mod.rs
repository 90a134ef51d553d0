//! Gateway to the DSS, the relational metadata store.
//!
//! The DSS holds three tables: devices, media and locks. The daemon never
//! talks SQL here; it goes through the [`DssGateway`] trait, which a
//! production deployment backs with the relational store and tests back
//! with [`MemoryDss`]. The `dir` family also runs on [`MemoryDss`] when no
//! external store is configured.
//!
//! Locks are advisory, unique on (kind, id), and scoped by hostname+pid.
//! Only the holder may release one through [`DssGateway::unlock`]; startup
//! reconciliation uses [`DssGateway::force_unlock`] for rows whose owner
//! process is known to be gone.

mod gateway;
mod memory;
mod oplog;

pub use gateway::DssGateway;
pub use memory::MemoryDss;
pub use oplog::{OperationKind, OperationLog};
