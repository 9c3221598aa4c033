//! VirtualMachineRestore Custom Resource Definition
//!
//! A restore rebuilds a machine (the original or a new one) from a
//! VirtualMachineSnapshot. All progress is recorded in `status` so the
//! controller can resume from any point after a restart.

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ConditionType};

/// Machine to restore onto
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetReference {
    /// API group of the target (kubevirt.io)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    /// Kind of the target (VirtualMachine)
    pub kind: String,
    /// Name of the target; it may not exist yet
    pub name: String,
}

/// Progress of one restored disk
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRestore {
    /// Volume name in the machine spec
    pub volume_name: String,
    /// Name of the claim created for this volume
    #[serde(alias = "persistentVolumeClaim")]
    pub persistent_claim_name: String,
    /// Provider VolumeSnapshot the claim is populated from
    #[serde(alias = "volumeSnapshotName")]
    pub snapshot_name: String,
    /// DataVolume managing the claim, once one is linked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume_name: Option<String>,
}

/// Status of a VirtualMachineRestore
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineRestoreStatus {
    /// One entry per restored disk, fixed at initialization
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restores: Vec<VolumeRestore>,

    /// When the restore completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_time: Option<DateTime<Utc>>,

    /// DataVolumes the restore superseded, deleted after the target is updated
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted_data_volumes: Vec<String>,

    /// Set to true when the restore has finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete: Option<bool>,

    /// Progressing and Ready conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl VirtualMachineRestoreStatus {
    /// Condition of type `type_`, if recorded
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.is(type_))
    }
}

/// Specification for a VirtualMachineRestore
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "snapshot.kubevirt.io",
    version = "v1alpha1",
    kind = "VirtualMachineRestore",
    plural = "virtualmachinerestores",
    shortname = "vmrestore",
    namespaced,
    status = "VirtualMachineRestoreStatus",
    printcolumn = r#"{"name":"TargetKind","type":"string","jsonPath":".spec.target.kind"}"#,
    printcolumn = r#"{"name":"TargetName","type":"string","jsonPath":".spec.target.name"}"#,
    printcolumn = r#"{"name":"Complete","type":"boolean","jsonPath":".status.complete"}"#,
    printcolumn = r#"{"name":"RestoreTime","type":"date","jsonPath":".status.restoreTime"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineRestoreSpec {
    /// Machine to restore onto
    pub target: TargetReference,

    /// VirtualMachineSnapshot to restore from
    #[serde(alias = "virtualMachineSnapshotName")]
    pub snapshot_name: String,

    /// RFC 6902 operations, one JSON object per entry, applied to a new machine
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<String>,
}

impl VirtualMachineRestore {
    /// True once `status.complete` is set
    pub fn is_complete(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.complete)
            .unwrap_or(false)
    }

    /// Identity written to the target's last-restore annotation
    ///
    /// Combines name and UID so a deleted and recreated restore with the
    /// same name is never mistaken for the one already applied.
    pub fn restore_id(&self) -> String {
        format!("{}-{}", self.name_any(), self.uid().unwrap_or_default())
    }

    /// Recorded per-volume entries
    pub fn restores(&self) -> &[VolumeRestore] {
        self.status
            .as_ref()
            .map(|s| s.restores.as_slice())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use crate::crd::ConditionStatus;

    fn parse_spec(yaml: &str) -> VirtualMachineRestoreSpec {
        serde_yaml::from_str(yaml).expect("parse spec")
    }

    #[test]
    fn spec_accepts_both_snapshot_field_names() {
        let spec = parse_spec(
            r#"
target:
  apiGroup: kubevirt.io
  kind: VirtualMachine
  name: new-vm
virtualMachineSnapshotName: snapshot
patches:
  - '{"op":"replace","path":"/metadata/name","value":"new-vm"}'
"#,
        );
        assert_eq!(spec.target.name, "new-vm");
        assert_eq!(spec.snapshot_name, "snapshot");
        assert_eq!(spec.patches.len(), 1);

        let spec = parse_spec(
            r#"
target:
  kind: VirtualMachine
  name: vm
snapshotName: snapshot
"#,
        );
        assert_eq!(spec.snapshot_name, "snapshot");
        assert!(spec.patches.is_empty());
        assert!(spec.target.api_group.is_none());
    }

    #[test]
    fn restore_id_combines_name_and_uid() {
        let restore = VirtualMachineRestore {
            metadata: ObjectMeta {
                name: Some("restore".to_string()),
                uid: Some("uid".to_string()),
                ..Default::default()
            },
            spec: parse_spec("target: {kind: VirtualMachine, name: vm}\nsnapshotName: s\n"),
            status: None,
        };
        assert_eq!(restore.restore_id(), "restore-uid");
        assert!(!restore.is_complete());
        assert!(restore.restores().is_empty());
    }

    #[test]
    fn status_condition_lookup() {
        let status = VirtualMachineRestoreStatus {
            complete: Some(true),
            conditions: vec![
                Condition::new(
                    ConditionType::Progressing,
                    ConditionStatus::False,
                    "Complete",
                    "Operation complete",
                ),
                Condition::new(
                    ConditionType::Ready,
                    ConditionStatus::True,
                    "Complete",
                    "Operation complete",
                ),
            ],
            ..Default::default()
        };
        assert_eq!(
            status.condition(ConditionType::Ready).map(|c| &c.status),
            Some(&ConditionStatus::True)
        );
        assert_eq!(
            status.condition(ConditionType::Progressing).map(|c| &c.status),
            Some(&ConditionStatus::False)
        );
        assert_eq!(
            status.condition(ConditionType::Ready).map(|c| c.reason.as_str()),
            Some("Complete")
        );
    }

    #[test]
    fn status_serializes_camel_case() {
        let status = VirtualMachineRestoreStatus {
            restores: vec![VolumeRestore {
                volume_name: "disk1".to_string(),
                persistent_claim_name: "restore-uid-disk1".to_string(),
                snapshot_name: "vs".to_string(),
                data_volume_name: None,
            }],
            deleted_data_volumes: vec!["dv1".to_string()],
            ..Default::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["restores"][0]["persistentClaimName"], "restore-uid-disk1");
        assert_eq!(value["deletedDataVolumes"][0], "dv1");
        assert!(value.get("complete").is_none());
    }
}
