//! Ordering configuration

use crate::error::{Error, Result};
use std::time::Duration;

/// Service name stamped on the first trace of every submitted message
pub const DEFAULT_INGRESS_NAME: &str = "ordod";

/// Timing and naming knobs for the ordering subsystem
#[derive(Debug, Clone, PartialEq)]
pub struct OrderingConfig {
    /// Lifetime of a document lease without renewal
    pub lease_ttl: Duration,
    /// How often held leases are renewed (must be shorter than `lease_ttl`)
    pub renew_interval: Duration,
    /// How often this node records a heartbeat
    pub heartbeat_interval: Duration,
    /// Nodes without a heartbeat inside this window are dead
    pub node_grace: Duration,
    /// Service name used in traces
    pub ingress_name: String,
}

impl OrderingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lease_ttl.is_zero() {
            return Err(Error::Configuration("lease TTL must be positive".into()));
        }
        if self.renew_interval >= self.lease_ttl {
            return Err(Error::Configuration(format!(
                "renew interval {:?} must be shorter than lease TTL {:?}",
                self.renew_interval, self.lease_ttl
            )));
        }
        if self.heartbeat_interval >= self.node_grace {
            return Err(Error::Configuration(format!(
                "heartbeat interval {:?} must be shorter than node grace {:?}",
                self.heartbeat_interval, self.node_grace
            )));
        }
        if self.ingress_name.is_empty() {
            return Err(Error::Configuration("ingress name cannot be empty".into()));
        }
        Ok(())
    }
}

impl Default for OrderingConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(60),
            renew_interval: Duration::from_secs(20),
            heartbeat_interval: Duration::from_secs(10),
            node_grace: Duration::from_secs(30),
            ingress_name: DEFAULT_INGRESS_NAME.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(OrderingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_renew_must_beat_ttl() {
        let config = OrderingConfig {
            renew_interval: Duration::from_secs(60),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }
}
