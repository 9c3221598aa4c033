//! Typed views of CDI DataVolumes and CSI VolumeSnapshots

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::kube_utils::HasApiResource;

/// CDI DataVolume
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DataVolume {
    /// Object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Spec, carried opaquely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<Value>,
    /// Observed status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<DataVolumeStatus>,
}

impl HasApiResource for DataVolume {
    const API_VERSION: &'static str = "cdi.kubevirt.io/v1beta1";
    const KIND: &'static str = "DataVolume";
}

impl DataVolume {
    /// True once CDI has given up populating the volume
    pub fn is_failed(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .is_some_and(|p| p == "Failed")
    }
}

/// DataVolume status
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeStatus {
    /// Phase (Pending, ImportInProgress, Succeeded, Failed, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Remaining status fields
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// CSI VolumeSnapshot
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct VolumeSnapshot {
    /// Object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Observed status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<VolumeSnapshotStatus>,
}

impl HasApiResource for VolumeSnapshot {
    const API_VERSION: &'static str = "snapshot.storage.k8s.io/v1";
    const KIND: &'static str = "VolumeSnapshot";
}

impl VolumeSnapshot {
    /// Size the provider reports a restored volume needs
    pub fn restore_size(&self) -> Option<&Quantity> {
        self.status.as_ref()?.restore_size.as_ref()
    }
}

/// VolumeSnapshot status
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotStatus {
    /// Whether the snapshot can be used as a data source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,
    /// Minimum size of a volume restored from the snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_size: Option<Quantity>,
    /// Remaining status fields
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failed_data_volume() {
        let dv: DataVolume = serde_json::from_value(json!({
            "metadata": {"name": "dv"},
            "status": {"phase": "Failed", "progress": "N/A"}
        }))
        .unwrap();
        assert!(dv.is_failed());

        let dv: DataVolume = serde_json::from_value(json!({
            "metadata": {"name": "dv"},
            "status": {"phase": "Succeeded"}
        }))
        .unwrap();
        assert!(!dv.is_failed());
        assert!(!DataVolume::default().is_failed());
    }

    #[test]
    fn volume_snapshot_restore_size() {
        let vs: VolumeSnapshot = serde_json::from_value(json!({
            "metadata": {"name": "vs"},
            "status": {"readyToUse": true, "restoreSize": "2Gi"}
        }))
        .unwrap();
        assert_eq!(vs.restore_size(), Some(&Quantity("2Gi".to_string())));
        assert!(VolumeSnapshot::default().restore_size().is_none());
    }
}
