//! Aggregate health for volume groups.
//!
//! A group is `Healthy` only when every member is; any member carrying an error makes it
//! `Degraded`. Members converge independently, so partial progress is kept. Volumes the
//! intent stops naming stay in the status as departing until their replication is
//! disabled, and keep the group from reporting `Healthy` meanwhile.

use crate::status::{GroupHealth, MemberFailure, ReplicationStatus, ResourceStatus};
use crate::types::{ReplicationIntent, VolumeId};

/// Health of a single member against the intent.
pub fn member_health(intent: &ReplicationIntent, generation: u64, status: &ReplicationStatus) -> GroupHealth {
    if status.last_error.is_some() {
        return GroupHealth::Degraded;
    }
    let resync_done = !intent.resync || status.resync_generation == Some(generation);
    if status.pending.is_none()
        && !status.state.is_transient()
        && status.current_role == intent.desired_role.as_role()
        && resync_done
    {
        GroupHealth::Healthy
    } else {
        GroupHealth::Progressing
    }
}

/// Recomputes `health` and `first_failure` of `status` from its members.
///
/// Members missing from the status map count as progressing. The reported failure is the
/// first member, in declaration order and then departing members, whose error is
/// terminal; if no error is terminal the first retryable one is reported.
pub fn aggregate(intent: &ReplicationIntent, generation: u64, status: &mut ResourceStatus) {
    let members = intent.target.volumes();
    let mut health = GroupHealth::Healthy;
    let mut first_terminal: Option<MemberFailure> = None;
    let mut first_retryable: Option<MemberFailure> = None;
    let mut note_failure = |volume: &VolumeId, member: &ReplicationStatus| {
        if let Some(error) = &member.last_error {
            let slot = if error.terminal {
                &mut first_terminal
            } else {
                &mut first_retryable
            };
            if slot.is_none() {
                *slot = Some(MemberFailure {
                    volume: volume.clone(),
                    error: error.clone(),
                });
            }
        }
    };

    for volume in &members {
        let member = match status.members.get(volume) {
            Some(member) => member,
            None => {
                health = health.max(GroupHealth::Progressing);
                continue;
            }
        };
        health = health.max(member_health(intent, generation, member));
        note_failure(volume, member);
    }

    let departing = status
        .members
        .iter()
        .filter(|(volume, member)| member.departing && !members.contains(volume));
    for (volume, member) in departing {
        let leaving = if member.last_error.is_some() {
            GroupHealth::Degraded
        } else {
            GroupHealth::Progressing
        };
        health = health.max(leaving);
        note_failure(volume, member);
    }

    status.health = health;
    status.first_failure = first_terminal.or(first_retryable);
}

/// Flags status entries for volumes the intent no longer names as departing and clears
/// the flag on volumes named again. Returns the volumes that just started departing.
pub fn mark_departing(intent: &ReplicationIntent, status: &mut ResourceStatus) -> Vec<VolumeId> {
    let members = intent.target.volumes();
    let mut started = Vec::new();
    for (volume, member) in status.members.iter_mut() {
        let declared = members.contains(volume);
        if declared && member.departing {
            member.departing = false;
        } else if !declared && !member.departing {
            member.departing = true;
            started.push(volume.clone());
        }
    }
    started
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{ErrorKind, OperationKind};
    use crate::status::LastError;
    use crate::types::{DesiredRole, ReplicationRole, ReplicationTarget};
    use chrono::Utc;

    fn group(members: &[&str]) -> ReplicationIntent {
        let mut intent = ReplicationIntent::for_volume("g", "unused", DesiredRole::Primary);
        intent.target = ReplicationTarget::Group {
            group_id: "g1".to_string(),
            members: members.iter().map(|m| VolumeId::new(*m)).collect(),
        };
        intent
    }

    fn primary() -> ReplicationStatus {
        ReplicationStatus {
            current_role: ReplicationRole::Primary,
            state: crate::status::VolumeState::Primary,
            ..Default::default()
        }
    }

    fn failed(terminal: bool, message: &str) -> ReplicationStatus {
        ReplicationStatus {
            current_role: ReplicationRole::Secondary,
            last_error: Some(LastError {
                operation: OperationKind::Promote,
                kind: if terminal {
                    ErrorKind::UnsafeOperation
                } else {
                    ErrorKind::Connection
                },
                message: message.to_string(),
                terminal,
                at: Utc::now(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_all_members_healthy() {
        let intent = group(&["a", "b"]);
        let mut status = ResourceStatus::default();
        status.members.insert(VolumeId::new("a"), primary());
        status.members.insert(VolumeId::new("b"), primary());
        aggregate(&intent, 1, &mut status);
        assert_eq!(status.health, GroupHealth::Healthy);
        assert!(status.first_failure.is_none());
    }

    #[test]
    fn test_missing_member_is_progressing() {
        let intent = group(&["a", "b"]);
        let mut status = ResourceStatus::default();
        status.members.insert(VolumeId::new("a"), primary());
        aggregate(&intent, 1, &mut status);
        assert_eq!(status.health, GroupHealth::Progressing);
    }

    #[test]
    fn test_degraded_reports_first_terminal_in_declaration_order() {
        let intent = group(&["c", "a", "b"]);
        let mut status = ResourceStatus::default();
        status.members.insert(VolumeId::new("a"), failed(true, "a failed"));
        status.members.insert(VolumeId::new("b"), failed(true, "b failed"));
        status.members.insert(VolumeId::new("c"), failed(false, "c retrying"));
        aggregate(&intent, 1, &mut status);

        assert_eq!(status.health, GroupHealth::Degraded);
        let failure = status.first_failure.unwrap();
        assert_eq!(failure.volume, VolumeId::new("a"));
        assert_eq!(failure.error.message, "a failed");
    }

    #[test]
    fn test_pending_resync_is_progressing() {
        let mut intent = group(&["a"]);
        intent.resync = true;
        let mut member = primary();
        assert_eq!(member_health(&intent, 2, &member), GroupHealth::Progressing);
        member.resync_generation = Some(2);
        assert_eq!(member_health(&intent, 2, &member), GroupHealth::Healthy);
    }

    #[test]
    fn test_removed_member_departs_until_readded() {
        let intent = group(&["a"]);
        let mut status = ResourceStatus::default();
        status.members.insert(VolumeId::new("a"), primary());
        status.members.insert(VolumeId::new("gone"), primary());

        assert_eq!(mark_departing(&intent, &mut status), vec![VolumeId::new("gone")]);
        assert!(mark_departing(&intent, &mut status).is_empty());
        assert_eq!(status.members.len(), 2);
        assert!(status.members[&VolumeId::new("gone")].departing);
        assert!(!status.members[&VolumeId::new("a")].departing);

        mark_departing(&group(&["a", "gone"]), &mut status);
        assert!(!status.members[&VolumeId::new("gone")].departing);
    }

    #[test]
    fn test_departing_member_holds_back_health() {
        let intent = group(&["a"]);
        let mut status = ResourceStatus::default();
        status.members.insert(VolumeId::new("a"), primary());
        status.members.insert(VolumeId::new("gone"), primary());
        mark_departing(&intent, &mut status);

        aggregate(&intent, 1, &mut status);
        assert_eq!(status.health, GroupHealth::Progressing);

        let mut stuck = failed(true, "disable refused");
        stuck.departing = true;
        status.members.insert(VolumeId::new("gone"), stuck);
        aggregate(&intent, 1, &mut status);
        assert_eq!(status.health, GroupHealth::Degraded);
        assert_eq!(status.first_failure.as_ref().unwrap().volume, VolumeId::new("gone"));

        status.members.remove(&VolumeId::new("gone"));
        aggregate(&intent, 1, &mut status);
        assert_eq!(status.health, GroupHealth::Healthy);
    }
}
