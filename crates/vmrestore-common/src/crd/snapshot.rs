//! VirtualMachineSnapshot and VirtualMachineSnapshotContent
//!
//! Both are produced by the snapshot side and only read here. The content
//! holds the captured machine and one backup entry per disk.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::preserve_unknown_fields;
use super::types::Condition;
use super::virtual_machine::VirtualMachineSpec;

/// Reference to the machine a snapshot was taken of
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSourceReference {
    /// API group of the source (kubevirt.io)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    /// Kind of the source (VirtualMachine)
    pub kind: String,
    /// Name of the source
    pub name: String,
}

/// Specification for a VirtualMachineSnapshot
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "snapshot.kubevirt.io",
    version = "v1alpha1",
    kind = "VirtualMachineSnapshot",
    plural = "virtualmachinesnapshots",
    shortname = "vmsnapshot",
    namespaced,
    status = "VirtualMachineSnapshotStatus",
    printcolumn = r#"{"name":"SourceKind","type":"string","jsonPath":".spec.source.kind"}"#,
    printcolumn = r#"{"name":"SourceName","type":"string","jsonPath":".spec.source.name"}"#,
    printcolumn = r#"{"name":"ReadyToUse","type":"boolean","jsonPath":".status.readyToUse"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotSpec {
    /// Machine the snapshot was taken of
    pub source: SnapshotSourceReference,
}

/// Status of a VirtualMachineSnapshot
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotStatus {
    /// UID of the source machine at snapshot time
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "sourceUID")]
    pub source_uid: Option<String>,
    /// Name of the content object backing this snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_machine_snapshot_content_name: Option<String>,
    /// When the snapshot was taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,
    /// Whether the snapshot can be restored from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl VirtualMachineSnapshot {
    /// True once the snapshot reports `readyToUse`
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.ready_to_use)
            .unwrap_or(false)
    }

    /// Name of the content object, once the snapshot has one
    pub fn content_name(&self) -> Option<&str> {
        self.status
            .as_ref()?
            .virtual_machine_snapshot_content_name
            .as_deref()
    }
}

/// Machine captured in a snapshot content
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapturedVirtualMachine {
    /// Metadata of the machine at snapshot time
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Spec of the machine at snapshot time
    #[serde(default)]
    pub spec: VirtualMachineSpec,
}

/// What was captured
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    /// The captured machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub virtual_machine: Option<CapturedVirtualMachine>,
}

/// One captured disk
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeBackup {
    /// Name of the volume in the machine spec
    pub volume_name: String,
    /// The claim that backed the volume at snapshot time
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub persistent_volume_claim: PersistentVolumeClaim,
    /// Name of the provider VolumeSnapshot holding the data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_name: Option<String>,
}

/// Specification for a VirtualMachineSnapshotContent
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "snapshot.kubevirt.io",
    version = "v1alpha1",
    kind = "VirtualMachineSnapshotContent",
    plural = "virtualmachinesnapshotcontents",
    shortname = "vmsnapshotcontent",
    namespaced,
    status = "VirtualMachineSnapshotContentStatus",
    printcolumn = r#"{"name":"ReadyToUse","type":"boolean","jsonPath":".status.readyToUse"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotContentSpec {
    /// Snapshot this content belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_machine_snapshot_name: Option<String>,
    /// Captured source
    pub source: SourceSpec,
    /// One entry per captured disk
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_backups: Vec<VolumeBackup>,
}

/// Status of a VirtualMachineSnapshotContent
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSnapshotContentStatus {
    /// When the content was completed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,
    /// Whether every provider snapshot is usable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
}

impl VirtualMachineSnapshotContent {
    /// True once the content reports `readyToUse`
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.ready_to_use)
            .unwrap_or(false)
    }

    /// Backup entry for `volume_name`
    pub fn volume_backup(&self, volume_name: &str) -> Option<&VolumeBackup> {
        self.spec
            .volume_backups
            .iter()
            .find(|b| b.volume_name == volume_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;
    use serde_json::json;

    #[test]
    fn content_parses_backups_and_captured_machine() {
        let spec: VirtualMachineSnapshotContentSpec = serde_json::from_value(json!({
            "virtualMachineSnapshotName": "snapshot",
            "source": {
                "virtualMachine": {
                    "metadata": {"name": "vm", "labels": {"app": "db"}},
                    "spec": {"template": {"spec": {"volumes": [
                        {"name": "disk1", "persistentVolumeClaim": {"claimName": "pvc1"}}
                    ]}}}
                }
            },
            "volumeBackups": [{
                "volumeName": "disk1",
                "persistentVolumeClaim": {
                    "metadata": {"name": "pvc1"},
                    "spec": {"resources": {"requests": {"storage": "1Gi"}}}
                },
                "volumeSnapshotName": "vmsnapshot-disk1"
            }]
        }))
        .unwrap();

        let vm = spec.source.virtual_machine.as_ref().unwrap();
        assert_eq!(vm.metadata.name.as_deref(), Some("vm"));
        assert_eq!(vm.spec.template.as_ref().unwrap().spec.volumes.len(), 1);

        let content = VirtualMachineSnapshotContent::new("content", spec);
        let backup = content.volume_backup("disk1").unwrap();
        assert_eq!(backup.volume_snapshot_name.as_deref(), Some("vmsnapshot-disk1"));
        assert!(content.volume_backup("disk2").is_none());
        assert!(!content.is_ready());
    }

    #[test]
    fn snapshot_readiness_and_content_name() {
        let mut snapshot = VirtualMachineSnapshot::new(
            "snapshot",
            VirtualMachineSnapshotSpec {
                source: SnapshotSourceReference {
                    api_group: Some("kubevirt.io".to_string()),
                    kind: "VirtualMachine".to_string(),
                    name: "vm".to_string(),
                },
            },
        );
        assert!(!snapshot.is_ready());
        snapshot.status = Some(VirtualMachineSnapshotStatus {
            ready_to_use: Some(true),
            virtual_machine_snapshot_content_name: Some("content".to_string()),
            ..Default::default()
        });
        assert!(snapshot.is_ready());
        assert_eq!(snapshot.content_name(), Some("content"));
    }

    #[test]
    fn content_crd_preserves_captured_objects() {
        let crd = serde_json::to_value(VirtualMachineSnapshotContent::crd()).unwrap();
        let props = &crd["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]["spec"]
            ["properties"];
        assert_eq!(
            props["source"]["properties"]["virtualMachine"]["x-kubernetes-preserve-unknown-fields"],
            true
        );
    }
}
