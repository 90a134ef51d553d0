//! Media-changer adapters.
//!
//! A [`MediaChanger`] moves media between slots and drives and answers
//! element lookups. The tape family talks to the library through the TLC;
//! the dir family uses the no-op [`DummyChanger`]. Adapters are selected
//! by [`LibKind`] through [`open_changer`], one instance per scheduler.

mod dummy;
mod scsi;

pub use dummy::DummyChanger;
pub use scsi::ScsiChanger;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::error::OpResult;
use crate::types::{Family, LibKind};

/// Address of an element inside the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementAddr {
    /// A drive, by element number.
    Drive(u16),
    /// A storage slot, by element number.
    Slot(u16),
    /// Let the library pick (free-slot destination on unload).
    Unknown,
}

impl ElementAddr {
    pub fn is_drive(&self) -> bool {
        matches!(self, Self::Drive(_))
    }
}

/// Result of a drive lookup: where the drive is and what it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveLookup {
    pub addr: ElementAddr,
    pub loaded_medium: Option<String>,
}

/// Operations on the media changer.
#[async_trait]
pub trait MediaChanger: Send + Sync {
    /// Locates a drive by serial number.
    async fn drive_lookup(&self, serial: &str) -> OpResult<DriveLookup>;

    /// Locates a medium by barcode label.
    async fn media_lookup(&self, label: &str) -> OpResult<ElementAddr>;

    /// Moves a medium between two element addresses.
    async fn media_move(&self, from: ElementAddr, to: ElementAddr) -> OpResult<()>;

    /// Scans the library inventory.
    async fn scan(&self) -> OpResult<serde_json::Value>;
}

/// The changer kind serving a resource family.
pub fn lib_kind_for(family: Family) -> LibKind {
    match family {
        Family::Tape => LibKind::Scsi,
        Family::Rados => LibKind::Rados,
        Family::Dir => LibKind::Dummy,
    }
}

/// Opens the changer adapter for a family.
pub fn open_changer(family: Family, settings: &Settings) -> OpResult<Arc<dyn MediaChanger>> {
    match lib_kind_for(family) {
        LibKind::Scsi => Ok(Arc::new(ScsiChanger::new(
            settings.tlc.clone(),
            settings.scsi,
        ))),
        // The RADOS backend shares the dummy changer: pools need no
        // physical moves.
        LibKind::Rados | LibKind::Dummy => Ok(Arc::new(DummyChanger::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lib_kind_mapping() {
        assert_eq!(lib_kind_for(Family::Tape), LibKind::Scsi);
        assert_eq!(lib_kind_for(Family::Dir), LibKind::Dummy);
        assert_eq!(lib_kind_for(Family::Rados), LibKind::Rados);
    }

    #[test]
    fn test_element_addr_is_drive() {
        assert!(ElementAddr::Drive(3).is_drive());
        assert!(!ElementAddr::Slot(3).is_drive());
        assert!(!ElementAddr::Unknown.is_drive());
    }
}
