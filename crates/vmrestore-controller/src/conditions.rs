//! Progressing/Ready condition pairs
//!
//! Every step of a restore maps to exactly one [`RestorePhase`], and every
//! phase maps to one Progressing/Ready pair. Conditions are rebuilt from
//! the phase on each write, never patched field by field.

use vmrestore_common::crd::{Condition, ConditionStatus, ConditionType};

/// Condition reasons written by the controller
pub mod reasons {
    /// Restore entries have been recorded
    pub const INITIALIZING: &str = "Initializing";
    /// Claims are being created or bound
    pub const CREATING_CLAIMS: &str = "CreatingClaims";
    /// The storage layer rejected a claim
    pub const CLAIM_CREATION_FAILED: &str = "ClaimCreationFailed";
    /// The target still has a running instance
    pub const WAITING_FOR_TARGET: &str = "WaitingForTarget";
    /// Links and superseded DataVolumes are recorded; spec write pending
    pub const UPDATING_TARGET: &str = "UpdatingTarget";
    /// A DataVolume backing a restored claim failed
    pub const DATA_VOLUME_FAILED: &str = "DataVolumeFailed";
    /// Restore finished
    pub const COMPLETE: &str = "Complete";
    /// Snapshot or content missing, not ready, or malformed
    pub const INVALID_SNAPSHOT: &str = "InvalidSnapshot";
    /// A patch could not be applied to the new machine
    pub const INVALID_PATCH: &str = "InvalidPatch";
    /// Another restore holds the target's lock
    pub const TARGET_LOCKED: &str = "TargetLocked";
    /// The target this restore owned no longer exists
    pub const TARGET_DELETED: &str = "TargetDeleted";
}

/// The condition-visible phase of a restore
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RestorePhase {
    /// Restore entries written, nothing created yet
    Initializing,
    /// Claims created, waiting for them to bind
    CreatingClaims,
    /// Claim creation was rejected; retried on resync
    ClaimCreationFailed(String),
    /// Target has a running instance
    WaitingForTarget,
    /// Spec update is next
    UpdatingTarget,
    /// A linked DataVolume failed
    DataVolumeFailed(String),
    /// Done
    Complete,
    /// Snapshot/content unusable
    InvalidSnapshot(String),
    /// A patch failed to apply or renamed the machine
    InvalidPatch(String),
    /// Target locked by the named restore
    TargetLocked {
        /// Target machine
        target: String,
        /// Restore holding the lock
        holder: String,
    },
    /// Owned target is gone
    TargetDeleted(String),
}

impl RestorePhase {
    /// Machine-readable reason shared by both conditions
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Initializing => reasons::INITIALIZING,
            Self::CreatingClaims => reasons::CREATING_CLAIMS,
            Self::ClaimCreationFailed(_) => reasons::CLAIM_CREATION_FAILED,
            Self::WaitingForTarget => reasons::WAITING_FOR_TARGET,
            Self::UpdatingTarget => reasons::UPDATING_TARGET,
            Self::DataVolumeFailed(_) => reasons::DATA_VOLUME_FAILED,
            Self::Complete => reasons::COMPLETE,
            Self::InvalidSnapshot(_) => reasons::INVALID_SNAPSHOT,
            Self::InvalidPatch(_) => reasons::INVALID_PATCH,
            Self::TargetLocked { .. } => reasons::TARGET_LOCKED,
            Self::TargetDeleted(_) => reasons::TARGET_DELETED,
        }
    }

    /// (Progressing, Ready)
    pub fn flags(&self) -> (bool, bool) {
        match self {
            Self::Initializing
            | Self::CreatingClaims
            | Self::ClaimCreationFailed(_)
            | Self::UpdatingTarget => (true, false),
            Self::Complete => (false, true),
            Self::WaitingForTarget
            | Self::DataVolumeFailed(_)
            | Self::InvalidSnapshot(_)
            | Self::InvalidPatch(_)
            | Self::TargetLocked { .. }
            | Self::TargetDeleted(_) => (false, false),
        }
    }

    /// (Progressing message, Ready message)
    pub fn messages(&self) -> (String, String) {
        let both = |m: String| (m.clone(), m);
        match self {
            Self::Initializing => both("Initializing VirtualMachineRestore".to_string()),
            Self::CreatingClaims => (
                "Creating new PVCs".to_string(),
                "Waiting for new PVCs".to_string(),
            ),
            Self::ClaimCreationFailed(msg) => (msg.clone(), "Waiting for new PVCs".to_string()),
            Self::WaitingForTarget => both("Waiting for target to be ready".to_string()),
            Self::UpdatingTarget => (
                "Updating target spec".to_string(),
                "Waiting for target update".to_string(),
            ),
            Self::Complete => both("Operation complete".to_string()),
            Self::DataVolumeFailed(msg)
            | Self::InvalidSnapshot(msg)
            | Self::InvalidPatch(msg)
            | Self::TargetDeleted(msg) => both(msg.clone()),
            Self::TargetLocked { target, holder } => both(format!(
                "VirtualMachine {} is locked by restore {}",
                target, holder
            )),
        }
    }

    /// True for phases that deserve a Warning event
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::ClaimCreationFailed(_)
                | Self::DataVolumeFailed(_)
                | Self::InvalidSnapshot(_)
                | Self::InvalidPatch(_)
                | Self::TargetLocked { .. }
                | Self::TargetDeleted(_)
        )
    }
}

/// Build the condition pair for `phase`
///
/// A condition whose status did not change keeps its previous
/// `lastTransitionTime`, so rebuilding an unchanged phase yields a status
/// equal to the stored one and no write is issued.
pub fn conditions_for(phase: &RestorePhase, previous: &[Condition]) -> Vec<Condition> {
    let (progressing, ready) = phase.flags();
    let (progressing_msg, ready_msg) = phase.messages();

    [
        (ConditionType::Progressing, progressing, progressing_msg),
        (ConditionType::Ready, ready, ready_msg),
    ]
    .into_iter()
    .map(|(type_, flag, message)| {
        let mut condition =
            Condition::new(type_, ConditionStatus::from(flag), phase.reason(), message);
        if let Some(prev) = previous.iter().find(|c| c.is(type_)) {
            if prev.status == condition.status {
                condition.last_transition_time = prev.last_transition_time;
            }
        }
        condition
    })
    .collect()
}

/// Reason of the Progressing condition, if any
pub fn progressing_reason(conditions: &[Condition]) -> Option<&str> {
    conditions
        .iter()
        .find(|c| c.is(ConditionType::Progressing))
        .map(|c| c.reason.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(phase: RestorePhase) -> (Condition, Condition) {
        let conditions = conditions_for(&phase, &[]);
        (conditions[0].clone(), conditions[1].clone())
    }

    #[test]
    fn initializing_is_progressing_not_ready() {
        let (p, r) = pair(RestorePhase::Initializing);
        assert_eq!(p.type_, "Progressing");
        assert_eq!(p.status, ConditionStatus::True);
        assert_eq!(r.status, ConditionStatus::False);
        assert_eq!(p.message, "Initializing VirtualMachineRestore");
    }

    #[test]
    fn claim_and_update_messages() {
        let (p, r) = pair(RestorePhase::CreatingClaims);
        assert_eq!(p.message, "Creating new PVCs");
        assert_eq!(r.message, "Waiting for new PVCs");

        let (p, r) = pair(RestorePhase::UpdatingTarget);
        assert_eq!(p.message, "Updating target spec");
        assert_eq!(r.message, "Waiting for target update");
        assert_eq!(p.reason, reasons::UPDATING_TARGET);
    }

    #[test]
    fn complete_is_ready_not_progressing() {
        let (p, r) = pair(RestorePhase::Complete);
        assert_eq!(p.status, ConditionStatus::False);
        assert_eq!(r.status, ConditionStatus::True);
        assert_eq!(r.message, "Operation complete");
    }

    #[test]
    fn waiting_and_failures_are_both_false() {
        for phase in [
            RestorePhase::WaitingForTarget,
            RestorePhase::InvalidSnapshot("VMSnapshot default/snapshot does not exist".into()),
            RestorePhase::TargetLocked {
                target: "vm".into(),
                holder: "other".into(),
            },
            RestorePhase::TargetDeleted("gone".into()),
        ] {
            assert_eq!(phase.flags(), (false, false), "{phase:?}");
        }
        let (p, _) = pair(RestorePhase::InvalidSnapshot(
            "VMSnapshot default/snapshot does not exist".into(),
        ));
        assert_eq!(p.message, "VMSnapshot default/snapshot does not exist");
    }

    #[test]
    fn unchanged_status_keeps_transition_time() {
        let first = conditions_for(&RestorePhase::CreatingClaims, &[]);
        let mut old = first.clone();
        for c in &mut old {
            c.last_transition_time -= chrono::Duration::minutes(5);
        }
        let again = conditions_for(&RestorePhase::CreatingClaims, &old);
        assert_eq!(again, old);

        let moved = conditions_for(&RestorePhase::WaitingForTarget, &old);
        assert_ne!(
            moved[0].last_transition_time, old[0].last_transition_time,
            "Progressing flipped to False"
        );
        assert_eq!(moved[1].last_transition_time, old[1].last_transition_time);
    }

    #[test]
    fn error_phases_flagged_for_events() {
        assert!(RestorePhase::ClaimCreationFailed("quota".into()).is_error());
        assert!(!RestorePhase::CreatingClaims.is_error());
        assert!(!RestorePhase::Complete.is_error());
    }

    #[test]
    fn progressing_reason_lookup() {
        let conditions = conditions_for(&RestorePhase::UpdatingTarget, &[]);
        assert_eq!(progressing_reason(&conditions), Some(reasons::UPDATING_TARGET));
        assert_eq!(progressing_reason(&[]), None);
    }
}
