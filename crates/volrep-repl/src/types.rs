//! Declared replication intents and the identifiers they reference.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use volrep_transport::EndpointId;

use crate::error::{ReplError, Result};

/// Identity of a replicated volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeId(String);

impl VolumeId {
    /// Wraps a volume identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Role an operator asks a volume to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredRole {
    /// Accepts writes; replicates to the peer.
    Primary,
    /// Receives replicated data from the peer.
    Secondary,
}

impl DesiredRole {
    /// The settled role that satisfies this desire.
    pub fn as_role(&self) -> ReplicationRole {
        match self {
            DesiredRole::Primary => ReplicationRole::Primary,
            DesiredRole::Secondary => ReplicationRole::Secondary,
        }
    }
}

/// Role of a volume as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationRole {
    /// Never observed.
    #[default]
    Unknown,
    /// Replication is not enabled.
    Disabled,
    /// Replication enabled, local replica is secondary.
    Secondary,
    /// Replication enabled, local replica is primary.
    Primary,
}

impl ReplicationRole {
    /// True when replication is enabled in either direction.
    pub fn is_enabled(&self) -> bool {
        matches!(self, ReplicationRole::Primary | ReplicationRole::Secondary)
    }
}

/// How the backend mirrors data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirroringMode {
    /// Periodic snapshot shipping.
    #[default]
    Snapshot,
    /// Continuous journal-based mirroring.
    Journal,
}

impl MirroringMode {
    fn as_str(&self) -> &'static str {
        match self {
            MirroringMode::Snapshot => "snapshot",
            MirroringMode::Journal => "journal",
        }
    }
}

/// Replication mode parameters.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationParams {
    /// Mirroring mode.
    pub mode: MirroringMode,
    /// Snapshot scheduling interval such as `5m` or `1h`.
    pub scheduling_interval: Option<String>,
    /// Backend-specific pass-through parameters.
    pub extra: BTreeMap<String, String>,
}

impl ReplicationParams {
    /// Checks the parameters without contacting a backend.
    pub fn validate(&self) -> Result<()> {
        if let Some(interval) = &self.scheduling_interval {
            if parse_interval(interval).is_none() {
                return Err(ReplError::Validation {
                    msg: format!("invalid scheduling interval {:?}, expected <n>[smhd]", interval),
                });
            }
            if self.mode == MirroringMode::Journal {
                return Err(ReplError::Validation {
                    msg: "scheduling interval is only valid in snapshot mode".to_string(),
                });
            }
        }
        if self.extra.keys().any(|k| k.is_empty()) {
            return Err(ReplError::Validation {
                msg: "empty parameter key".to_string(),
            });
        }
        Ok(())
    }

    /// Flattens into the parameter map sent to the driver.
    pub fn to_wire(&self) -> BTreeMap<String, String> {
        let mut map = self.extra.clone();
        map.insert("mirroringMode".to_string(), self.mode.as_str().to_string());
        if let Some(interval) = &self.scheduling_interval {
            map.insert("schedulingInterval".to_string(), interval.clone());
        }
        map
    }
}

/// Parses `<n>[smhd]` into a duration; zero is rejected.
pub fn parse_interval(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let unit = raw.chars().last()?;
    let value: u64 = raw[..raw.len() - unit.len_utf8()].parse().ok()?;
    if value == 0 {
        return None;
    }
    let secs = match unit {
        's' => value,
        'm' => value.checked_mul(60)?,
        'h' => value.checked_mul(3_600)?,
        'd' => value.checked_mul(86_400)?,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

/// Class reference: which driver serves the volume and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationClass {
    /// Class name.
    pub name: String,
    /// Driver name used for endpoint resolution.
    pub driver: String,
    /// Explicit endpoint overriding driver-based resolution.
    pub endpoint: Option<EndpointId>,
    /// Driver parameters merged into every request.
    pub parameters: BTreeMap<String, String>,
}

/// What an intent replicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationTarget {
    /// A single volume.
    Volume {
        /// The volume.
        volume_id: VolumeId,
    },
    /// A set of volumes converged together.
    Group {
        /// Group name.
        group_id: String,
        /// Member volumes.
        members: Vec<VolumeId>,
    },
}

impl ReplicationTarget {
    /// Member volumes in declaration order.
    pub fn volumes(&self) -> Vec<VolumeId> {
        match self {
            ReplicationTarget::Volume { volume_id } => vec![volume_id.clone()],
            ReplicationTarget::Group { members, .. } => members.clone(),
        }
    }

    /// True for volume groups.
    pub fn is_group(&self) -> bool {
        matches!(self, ReplicationTarget::Group { .. })
    }
}

/// Declared desired replication state for one volume or volume group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationIntent {
    /// Resource name, unique in the store.
    pub name: String,
    /// Volume or group this intent governs.
    pub target: ReplicationTarget,
    /// Desired role.
    pub desired_role: DesiredRole,
    /// Replication mode parameters.
    #[serde(default)]
    pub params: ReplicationParams,
    /// Permit role transitions despite unsafe peer state.
    #[serde(default)]
    pub force: bool,
    /// Request a resync of divergent replica data.
    #[serde(default)]
    pub resync: bool,
    /// Bumped by an operator to retry after a terminal failure.
    #[serde(default)]
    pub retry_nonce: u64,
    /// Driver/endpoint class.
    #[serde(default)]
    pub class: ReplicationClass,
}

impl ReplicationIntent {
    /// An intent for a single volume with default parameters.
    pub fn for_volume(name: &str, volume: &str, desired_role: DesiredRole) -> Self {
        Self {
            name: name.to_string(),
            target: ReplicationTarget::Volume {
                volume_id: VolumeId::new(volume),
            },
            desired_role,
            params: ReplicationParams::default(),
            force: false,
            resync: false,
            retry_nonce: 0,
            class: ReplicationClass::default(),
        }
    }

    /// Checks identifiers and parameters.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ReplError::Validation {
                msg: "intent name is empty".to_string(),
            });
        }
        match &self.target {
            ReplicationTarget::Volume { volume_id } => {
                if volume_id.as_str().is_empty() {
                    return Err(ReplError::Validation {
                        msg: "volume id is empty".to_string(),
                    });
                }
            }
            ReplicationTarget::Group { group_id, members } => {
                if group_id.is_empty() {
                    return Err(ReplError::Validation {
                        msg: "group id is empty".to_string(),
                    });
                }
                if members.is_empty() {
                    return Err(ReplError::Validation {
                        msg: format!("group {} has no members", group_id),
                    });
                }
                let mut seen = BTreeSet::new();
                for member in members {
                    if member.as_str().is_empty() {
                        return Err(ReplError::Validation {
                            msg: format!("group {} has an empty member id", group_id),
                        });
                    }
                    if !seen.insert(member) {
                        return Err(ReplError::Validation {
                            msg: format!("group {} lists {} twice", group_id, member),
                        });
                    }
                }
            }
        }
        self.params.validate()
    }

    /// Parameter map sent with every operation for this intent.
    pub fn wire_params(&self) -> BTreeMap<String, String> {
        let mut map = self.class.parameters.clone();
        map.extend(self.params.to_wire());
        map
    }
}
