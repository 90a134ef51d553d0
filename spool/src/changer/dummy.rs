//! No-op changer for families without a physical library.

use async_trait::async_trait;
use serde_json::json;

use crate::error::OpResult;

use super::{DriveLookup, ElementAddr, MediaChanger};

/// Changer adapter where every medium is always reachable: directories
/// need no robot arm.
#[derive(Debug, Default)]
pub struct DummyChanger;

impl DummyChanger {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaChanger for DummyChanger {
    async fn drive_lookup(&self, _serial: &str) -> OpResult<DriveLookup> {
        Ok(DriveLookup {
            addr: ElementAddr::Unknown,
            loaded_medium: None,
        })
    }

    async fn media_lookup(&self, _label: &str) -> OpResult<ElementAddr> {
        Ok(ElementAddr::Unknown)
    }

    async fn media_move(&self, _from: ElementAddr, _to: ElementAddr) -> OpResult<()> {
        Ok(())
    }

    async fn scan(&self) -> OpResult<serde_json::Value> {
        Ok(json!([]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_operation_succeeds() {
        let changer = DummyChanger::new();
        assert_eq!(
            changer.drive_lookup("D0").await.unwrap().addr,
            ElementAddr::Unknown
        );
        assert_eq!(
            changer.media_lookup("m0").await.unwrap(),
            ElementAddr::Unknown
        );
        changer
            .media_move(ElementAddr::Unknown, ElementAddr::Unknown)
            .await
            .unwrap();
        assert_eq!(changer.scan().await.unwrap(), json!([]));
    }
}
