//! Endpoint resolution: which sidecar serves a volume.

use std::collections::BTreeMap;

use volrep_transport::EndpointId;

use crate::error::{ReplError, Result};
use crate::types::{ReplicationIntent, VolumeId};

/// Maps a volume of an intent to the endpoint its operations go to.
pub trait EndpointResolver: Send + Sync {
    /// Resolves the endpoint for `volume`.
    fn resolve(&self, intent: &ReplicationIntent, volume: &VolumeId) -> Result<EndpointId>;
}

/// Resolution from the class's explicit endpoint, then the driver table, then a default.
#[derive(Debug, Clone, Default)]
pub struct StaticEndpointResolver {
    drivers: BTreeMap<String, EndpointId>,
    default: Option<EndpointId>,
}

impl StaticEndpointResolver {
    /// Creates a resolver from a driver table and optional fallback.
    pub fn new(drivers: BTreeMap<String, EndpointId>, default: Option<EndpointId>) -> Self {
        Self { drivers, default }
    }

    /// Resolver sending everything to one endpoint.
    pub fn single(endpoint: EndpointId) -> Self {
        Self::new(BTreeMap::new(), Some(endpoint))
    }
}

impl EndpointResolver for StaticEndpointResolver {
    fn resolve(&self, intent: &ReplicationIntent, volume: &VolumeId) -> Result<EndpointId> {
        if let Some(endpoint) = &intent.class.endpoint {
            return Ok(endpoint.clone());
        }
        if let Some(endpoint) = self.drivers.get(&intent.class.driver) {
            return Ok(endpoint.clone());
        }
        self.default.clone().ok_or_else(|| ReplError::EndpointUnresolved {
            volume: volume.to_string(),
            msg: if intent.class.driver.is_empty() {
                "class names no driver and no default endpoint is configured".to_string()
            } else {
                format!("driver {:?} has no configured endpoint", intent.class.driver)
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DesiredRole;

    fn intent(driver: &str) -> ReplicationIntent {
        let mut intent = ReplicationIntent::for_volume("i", "v", DesiredRole::Primary);
        intent.class.driver = driver.to_string();
        intent
    }

    #[test]
    fn test_explicit_endpoint_wins() {
        let resolver = StaticEndpointResolver::single(EndpointId::new("default:1"));
        let mut i = intent("rbd");
        i.class.endpoint = Some(EndpointId::new("explicit:1"));
        assert_eq!(
            resolver.resolve(&i, &VolumeId::new("v")).unwrap(),
            EndpointId::new("explicit:1")
        );
    }

    #[test]
    fn test_driver_table_then_default() {
        let mut drivers = BTreeMap::new();
        drivers.insert("rbd".to_string(), EndpointId::new("rbd:1"));
        let resolver = StaticEndpointResolver::new(drivers, Some(EndpointId::new("default:1")));
        let v = VolumeId::new("v");
        assert_eq!(resolver.resolve(&intent("rbd"), &v).unwrap(), EndpointId::new("rbd:1"));
        assert_eq!(resolver.resolve(&intent("nfs"), &v).unwrap(), EndpointId::new("default:1"));
    }

    #[test]
    fn test_unresolved() {
        let resolver = StaticEndpointResolver::default();
        let err = resolver.resolve(&intent("nfs"), &VolumeId::new("v")).unwrap_err();
        assert!(matches!(err, ReplError::EndpointUnresolved { .. }));
    }
}
