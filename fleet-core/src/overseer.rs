//! Overseer agent seam.
//!
//! The overseer is the external arbiter of which service provider is the
//! primary. The coordinator only polls it; it never elects itself. The
//! poll result carries the primary's address and the session-secret
//! identifier (ssid) the primary must hand to clients.

use async_trait::async_trait;

use crate::error::Result;

/// The overseer's current primary service-provider record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimarySp {
    /// `host:port` of the designated primary.
    pub address: String,
    /// Session-secret identifier minted for this primary's tenure.
    pub ssid: String,
}

/// Agent polling the external overseer.
#[async_trait]
pub trait Overseer: Send + Sync {
    /// Whether the overseer has ordered a fleet-wide shutdown.
    fn is_shutdown(&self) -> bool;

    /// The current primary, or None when the overseer has not designated one.
    async fn primary_sp(&self) -> Result<Option<PrimarySp>>;
}

/// Fixed-answer overseer for non-HA deployments: this instance is always
/// the primary, under a tenure-long ssid.
pub struct StaticOverseer {
    primary: PrimarySp,
}

impl StaticOverseer {
    pub fn new(address: impl Into<String>, ssid: impl Into<String>) -> Self {
        Self {
            primary: PrimarySp {
                address: address.into(),
                ssid: ssid.into(),
            },
        }
    }
}

#[async_trait]
impl Overseer for StaticOverseer {
    fn is_shutdown(&self) -> bool {
        false
    }

    async fn primary_sp(&self) -> Result<Option<PrimarySp>> {
        Ok(Some(self.primary.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_overseer_always_primary() {
        let overseer = StaticOverseer::new("10.0.0.1:6007", "ssid-1");
        assert!(!overseer.is_shutdown());
        let primary = overseer.primary_sp().await.unwrap().unwrap();
        assert_eq!(primary.address, "10.0.0.1:6007");
        assert_eq!(primary.ssid, "ssid-1");
    }
}
