//! Typed views of KubeVirt VirtualMachine and VirtualMachineInstance
//!
//! Only the fields the restore controller reads or rewrites are typed.
//! Everything else is carried through `extra` maps so that a machine read,
//! modified and written back loses nothing KubeVirt put there.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::kube_utils::HasApiResource;

/// KubeVirt VirtualMachine
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachine {
    /// Object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Machine specification
    #[serde(default)]
    pub spec: VirtualMachineSpec,
    /// Observed status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VirtualMachineStatus>,
}

impl HasApiResource for VirtualMachine {
    const API_VERSION: &'static str = "kubevirt.io/v1";
    const KIND: &'static str = "VirtualMachine";
}

impl VirtualMachine {
    /// Machine name, empty if unset
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Name of the restore holding the lock on this machine, if any
    pub fn restore_in_progress(&self) -> Option<&str> {
        self.status.as_ref()?.restore_in_progress.as_deref()
    }

    /// Value of an annotation on this machine
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.as_ref()?.get(key).map(String::as_str)
    }
}

/// VirtualMachine spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// DataVolumes created and owned by the machine
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_volume_templates: Vec<DataVolumeTemplate>,
    /// Template for the running instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<VirtualMachineInstanceTemplate>,
    /// Remaining fields (running, runStrategy, instancetype, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl VirtualMachineSpec {
    /// Volumes of the instance template
    pub fn volumes(&self) -> &[Volume] {
        self.template
            .as_ref()
            .map(|t| t.spec.volumes.as_slice())
            .unwrap_or_default()
    }
}

/// Entry of `spec.dataVolumeTemplates`
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeTemplate {
    /// Template metadata; `name` is the DataVolume name
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Remaining fields (spec, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl DataVolumeTemplate {
    /// DataVolume name, empty if unset
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }
}

/// `spec.template`
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceTemplate {
    /// Template metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,
    /// Instance spec
    #[serde(default)]
    pub spec: InstanceSpec,
}

/// `spec.template.spec`
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    /// Volumes attached to the instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    /// Remaining fields (domain, networks, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A volume of the instance template
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Volume name, matched against snapshot volume backups
    pub name: String,
    /// DataVolume-backed source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume: Option<DataVolumeSource>,
    /// Claim-backed source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PersistentVolumeClaimSource>,
    /// Other volume sources (containerDisk, cloudInitNoCloud, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// `volumes[].dataVolume`
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSource {
    /// DataVolume name
    pub name: String,
    /// Remaining fields (hotpluggable, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// `volumes[].persistentVolumeClaim`
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeClaimSource {
    /// Claim name
    pub claim_name: String,
    /// Mount read-only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    /// Remaining fields (hotpluggable, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// VirtualMachine status
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// Name of the restore that currently owns the machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_in_progress: Option<String>,
    /// Remaining status fields
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// KubeVirt VirtualMachineInstance, read only to learn whether a machine runs
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct VirtualMachineInstance {
    /// Object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
}

impl HasApiResource for VirtualMachineInstance {
    const API_VERSION: &'static str = "kubevirt.io/v1";
    const KIND: &'static str = "VirtualMachineInstance";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "apiVersion": "kubevirt.io/v1",
            "kind": "VirtualMachine",
            "metadata": {
                "name": "vm",
                "namespace": "default",
                "annotations": {"restore.kubevirt.io/lastRestoreUID": "restore-uid"}
            },
            "spec": {
                "runStrategy": "Halted",
                "dataVolumeTemplates": [
                    {"metadata": {"name": "dv1"}, "spec": {"storage": {}}}
                ],
                "template": {
                    "spec": {
                        "domain": {"devices": {"interfaces": [{"name": "default", "masquerade": {}}]}},
                        "volumes": [
                            {"name": "disk1", "dataVolume": {"name": "dv1"}},
                            {"name": "disk2", "persistentVolumeClaim": {"claimName": "pvc2"}},
                            {"name": "cloudinit", "cloudInitNoCloud": {"userData": "#cloud-config"}}
                        ]
                    }
                }
            },
            "status": {"restoreInProgress": "restore", "printableStatus": "Stopped"}
        })
    }

    #[test]
    fn parses_typed_fields() {
        let vm: VirtualMachine = serde_json::from_value(sample()).unwrap();
        assert_eq!(vm.restore_in_progress(), Some("restore"));
        assert_eq!(
            vm.annotation("restore.kubevirt.io/lastRestoreUID"),
            Some("restore-uid")
        );
        assert_eq!(vm.spec.data_volume_templates[0].name(), "dv1");
        let volumes = vm.spec.volumes();
        assert_eq!(volumes.len(), 3);
        assert_eq!(volumes[0].data_volume.as_ref().unwrap().name, "dv1");
        assert_eq!(
            volumes[1].persistent_volume_claim.as_ref().unwrap().claim_name,
            "pvc2"
        );
        assert!(volumes[2].extra.contains_key("cloudInitNoCloud"));
    }

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let vm: VirtualMachine = serde_json::from_value(sample()).unwrap();
        let back = serde_json::to_value(&vm).unwrap();
        assert_eq!(back["spec"]["runStrategy"], "Halted");
        assert_eq!(
            back["spec"]["template"]["spec"]["domain"]["devices"]["interfaces"][0]["name"],
            "default"
        );
        assert_eq!(back["status"]["printableStatus"], "Stopped");
        assert_eq!(back["spec"]["dataVolumeTemplates"][0]["spec"], json!({"storage": {}}));
    }

    #[test]
    fn machine_without_template_has_no_volumes() {
        let vm = VirtualMachine::default();
        assert!(vm.spec.volumes().is_empty());
        assert!(vm.restore_in_progress().is_none());
    }
}
