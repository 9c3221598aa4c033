//! Restore state classification
//!
//! The restore's position in the workflow is derived from persisted fields
//! only. [`classify`] picks the coarse state; [`determine_progress_step`]
//! picks the next step for an in-progress restore from observed cluster
//! state. Both are pure so each transition can be tested on its own.

use vmrestore_common::crd::VirtualMachineRestore;

use crate::conditions::{progressing_reason, reasons};

/// Coarse state of a restore
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestoreState {
    /// Deletion requested; no further work is done
    Deleting,
    /// `status.complete` is true; only the unlock guarantee applies
    Completed,
    /// No restore entries have been recorded yet
    Uninitialized,
    /// Entries recorded, working through provisioning and update
    InProgress,
}

/// Classify a restore from its persisted fields
pub fn classify(restore: &VirtualMachineRestore) -> RestoreState {
    if restore.metadata.deletion_timestamp.is_some() {
        return RestoreState::Deleting;
    }
    if restore.is_complete() {
        return RestoreState::Completed;
    }
    let Some(status) = restore.status.as_ref() else {
        return RestoreState::Uninitialized;
    };
    if !status.restores.is_empty() {
        return RestoreState::InProgress;
    }
    // A snapshot without disks records no entries; the Progressing reason
    // then tells whether initialization already happened.
    match progressing_reason(&status.conditions) {
        Some(
            reasons::INITIALIZING
            | reasons::CREATING_CLAIMS
            | reasons::CLAIM_CREATION_FAILED
            | reasons::WAITING_FOR_TARGET
            | reasons::UPDATING_TARGET
            | reasons::DATA_VOLUME_FAILED,
        ) => RestoreState::InProgress,
        _ => RestoreState::Uninitialized,
    }
}

/// Observed readiness of one restored claim
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimState {
    /// Claim has not been created
    Missing,
    /// Claim exists but is not usable yet
    Pending,
    /// Claim is bound, or waits for its first consumer
    Ready,
}

/// Everything [`determine_progress_step`] looks at
#[derive(Clone, Debug, Default)]
pub struct Observed {
    /// One entry per `status.restores` entry, same order
    pub claims: Vec<ClaimState>,
    /// Target carries this restore's last-restore annotation
    pub target_updated: bool,
    /// Target has a running instance
    pub target_running: bool,
    /// Links and superseded DataVolumes are persisted
    pub update_prepared: bool,
}

/// Next step for an in-progress restore
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressStep {
    /// Create the claims that are missing
    CreateClaims,
    /// Claims exist but are not bound; nothing to write
    WaitForClaims,
    /// The target is running; report and wait
    WaitForTarget,
    /// Record DataVolume links and superseded DataVolumes
    LinkDataVolumes,
    /// Write the restored spec to the target
    UpdateTarget,
    /// Delete superseded DataVolumes, mark complete, unlock
    Finalize,
}

/// Decide the next step from observed state
pub fn determine_progress_step(observed: &Observed) -> ProgressStep {
    if observed.target_updated {
        return ProgressStep::Finalize;
    }
    if observed.claims.iter().any(|c| *c == ClaimState::Missing) {
        return ProgressStep::CreateClaims;
    }
    if observed.claims.iter().any(|c| *c == ClaimState::Pending) {
        return ProgressStep::WaitForClaims;
    }
    if observed.target_running {
        return ProgressStep::WaitForTarget;
    }
    if !observed.update_prepared {
        return ProgressStep::LinkDataVolumes;
    }
    ProgressStep::UpdateTarget
}

/// True if the last status write recorded links and superseded DataVolumes
pub fn update_prepared(restore: &VirtualMachineRestore) -> bool {
    restore
        .status
        .as_ref()
        .and_then(|s| progressing_reason(&s.conditions))
        == Some(reasons::UPDATING_TARGET)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::{conditions_for, RestorePhase};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use vmrestore_common::crd::{
        TargetReference, VirtualMachineRestoreSpec, VirtualMachineRestoreStatus, VolumeRestore,
    };

    fn restore(status: Option<VirtualMachineRestoreStatus>) -> VirtualMachineRestore {
        VirtualMachineRestore {
            metadata: ObjectMeta {
                name: Some("restore".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid".to_string()),
                ..Default::default()
            },
            spec: VirtualMachineRestoreSpec {
                target: TargetReference {
                    api_group: Some("kubevirt.io".to_string()),
                    kind: "VirtualMachine".to_string(),
                    name: "vm".to_string(),
                },
                snapshot_name: "snapshot".to_string(),
                patches: vec![],
            },
            status,
        }
    }

    fn with_phase(phase: RestorePhase) -> VirtualMachineRestoreStatus {
        VirtualMachineRestoreStatus {
            complete: Some(false),
            conditions: conditions_for(&phase, &[]),
            ..Default::default()
        }
    }

    fn entry() -> VolumeRestore {
        VolumeRestore {
            volume_name: "disk1".to_string(),
            persistent_claim_name: "restore-uid-disk1".to_string(),
            snapshot_name: "vs-disk1".to_string(),
            data_volume_name: None,
        }
    }

    #[test]
    fn unset_status_is_uninitialized() {
        assert_eq!(classify(&restore(None)), RestoreState::Uninitialized);
    }

    #[test]
    fn validation_failure_before_init_stays_uninitialized() {
        let r = restore(Some(with_phase(RestorePhase::InvalidSnapshot(
            "VMSnapshot default/snapshot does not exist".into(),
        ))));
        assert_eq!(classify(&r), RestoreState::Uninitialized);

        let r = restore(Some(with_phase(RestorePhase::TargetLocked {
            target: "vm".into(),
            holder: "other".into(),
        })));
        assert_eq!(classify(&r), RestoreState::Uninitialized);
    }

    #[test]
    fn recorded_entries_mean_in_progress() {
        let mut status = with_phase(RestorePhase::InvalidSnapshot("gone".into()));
        status.restores = vec![entry()];
        assert_eq!(classify(&restore(Some(status))), RestoreState::InProgress);
    }

    #[test]
    fn diskless_restore_in_progress_after_init() {
        let r = restore(Some(with_phase(RestorePhase::Initializing)));
        assert_eq!(classify(&r), RestoreState::InProgress);
    }

    #[test]
    fn complete_and_deleting_win() {
        let mut status = with_phase(RestorePhase::Complete);
        status.complete = Some(true);
        assert_eq!(classify(&restore(Some(status.clone()))), RestoreState::Completed);

        let mut r = restore(Some(status));
        r.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert_eq!(classify(&r), RestoreState::Deleting);
    }

    #[test]
    fn step_order_follows_storage_then_target() {
        let mut observed = Observed {
            claims: vec![ClaimState::Ready, ClaimState::Missing],
            ..Default::default()
        };
        assert_eq!(determine_progress_step(&observed), ProgressStep::CreateClaims);

        observed.claims = vec![ClaimState::Ready, ClaimState::Pending];
        assert_eq!(determine_progress_step(&observed), ProgressStep::WaitForClaims);

        observed.claims = vec![ClaimState::Ready, ClaimState::Ready];
        observed.target_running = true;
        assert_eq!(determine_progress_step(&observed), ProgressStep::WaitForTarget);

        observed.target_running = false;
        assert_eq!(determine_progress_step(&observed), ProgressStep::LinkDataVolumes);

        observed.update_prepared = true;
        assert_eq!(determine_progress_step(&observed), ProgressStep::UpdateTarget);

        observed.target_updated = true;
        assert_eq!(determine_progress_step(&observed), ProgressStep::Finalize);
    }

    #[test]
    fn applied_target_finalizes_even_with_pending_claims() {
        let observed = Observed {
            claims: vec![ClaimState::Pending],
            target_updated: true,
            ..Default::default()
        };
        assert_eq!(determine_progress_step(&observed), ProgressStep::Finalize);
    }

    #[test]
    fn no_disks_goes_straight_to_link() {
        let observed = Observed::default();
        assert_eq!(determine_progress_step(&observed), ProgressStep::LinkDataVolumes);
    }

    #[test]
    fn update_prepared_reads_progressing_reason() {
        assert!(!update_prepared(&restore(None)));
        assert!(update_prepared(&restore(Some(with_phase(
            RestorePhase::UpdatingTarget
        )))));
        assert!(!update_prepared(&restore(Some(with_phase(
            RestorePhase::WaitingForTarget
        )))));
    }
}
