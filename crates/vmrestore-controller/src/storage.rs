//! Per-volume storage provisioning
//!
//! Each captured disk is restored into a new claim whose name is a pure
//! function of the restore's UID and the volume name, so a repeated create
//! is an idempotent lookup. The claim is populated from the provider
//! VolumeSnapshot and sized to the larger of the snapshot's restore size
//! and the original claim's request.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, TypedLocalObjectReference,
    VolumeResourceRequirements,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use vmrestore_common::crd::{
    DataVolume, VirtualMachineRestore, VolumeBackup, VolumeRestore, VolumeSnapshot,
};
use vmrestore_common::kube_utils::HasApiResource;
use vmrestore_common::{quantity, Error, POPULATED_FOR_ANNOTATION, RESTORE_NAME_ANNOTATION};

use crate::state::ClaimState;

/// Resource key for storage requests
const STORAGE: &str = "storage";

/// Binding annotations set by the PV controller on the original claim
const BIND_ANNOTATIONS: [&str; 5] = [
    "pv.kubernetes.io/bind-completed",
    "pv.kubernetes.io/bound-by-controller",
    "volume.beta.kubernetes.io/storage-provisioner",
    "volume.kubernetes.io/storage-provisioner",
    "volume.kubernetes.io/selected-node",
];

/// Deterministic claim name for `volume_name` restored by `restore`
pub fn claim_name(restore: &VirtualMachineRestore, volume_name: &str) -> String {
    format!(
        "restore-{}-{}",
        restore.uid().unwrap_or_default(),
        volume_name
    )
}

/// One restore entry per captured disk, in content order
pub fn volume_restores(
    restore: &VirtualMachineRestore,
    backups: &[VolumeBackup],
) -> Result<Vec<VolumeRestore>, Error> {
    backups
        .iter()
        .map(|backup| {
            let snapshot_name = backup.volume_snapshot_name.clone().ok_or_else(|| {
                Error::validation_for(
                    restore.name_any(),
                    format!("volume {} has no VolumeSnapshot", backup.volume_name),
                )
            })?;
            Ok(VolumeRestore {
                volume_name: backup.volume_name.clone(),
                persistent_claim_name: claim_name(restore, &backup.volume_name),
                snapshot_name,
                data_volume_name: None,
            })
        })
        .collect()
}

/// Size for a restored claim: `max(restoreSize, original request)`
///
/// Either side may be unknown; if both are, the restore cannot proceed.
pub fn restore_size(
    volume_snapshot: &VolumeSnapshot,
    original: &PersistentVolumeClaim,
) -> Result<Quantity, Error> {
    let original_size = original
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get(STORAGE));

    match (volume_snapshot.restore_size(), original_size) {
        (Some(snapshot_size), Some(original_size)) => quantity::max(snapshot_size, original_size),
        (Some(size), None) | (None, Some(size)) => Ok(size.clone()),
        (None, None) => Err(Error::validation(format!(
            "cannot determine size for VolumeSnapshot {}",
            volume_snapshot.metadata.name.as_deref().unwrap_or_default()
        ))),
    }
}

/// Build the claim for `entry`, populated from `volume_snapshot`
pub fn build_claim(
    restore: &VirtualMachineRestore,
    entry: &VolumeRestore,
    backup: &VolumeBackup,
    volume_snapshot: &VolumeSnapshot,
) -> Result<PersistentVolumeClaim, Error> {
    let original = &backup.persistent_volume_claim;
    let size = restore_size(volume_snapshot, original)?;

    let mut annotations: BTreeMap<String, String> = original
        .metadata
        .annotations
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter(|(k, _)| !BIND_ANNOTATIONS.contains(&k.as_str()))
        .collect();
    annotations.insert(RESTORE_NAME_ANNOTATION.to_string(), restore.name_any());

    let original_spec = original.spec.clone().unwrap_or_default();
    let spec = PersistentVolumeClaimSpec {
        access_modes: original_spec.access_modes,
        storage_class_name: original_spec.storage_class_name,
        volume_mode: original_spec.volume_mode,
        resources: Some(VolumeResourceRequirements {
            requests: Some(BTreeMap::from([(STORAGE.to_string(), size)])),
            ..Default::default()
        }),
        data_source: Some(TypedLocalObjectReference {
            api_group: Some("snapshot.storage.k8s.io".to_string()),
            kind: VolumeSnapshot::KIND.to_string(),
            name: entry.snapshot_name.clone(),
        }),
        ..Default::default()
    };

    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(entry.persistent_claim_name.clone()),
            namespace: restore.namespace(),
            labels: original.metadata.labels.clone(),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    })
}

/// Readiness of an existing claim
///
/// A Pending claim whose class binds on first consumer is ready: it cannot
/// bind until the restored machine starts.
pub fn claim_state(claim: &PersistentVolumeClaim, class: Option<&StorageClass>) -> ClaimState {
    let phase = claim.status.as_ref().and_then(|s| s.phase.as_deref());
    match phase {
        Some("Bound") => ClaimState::Ready,
        Some("Pending") | None if waits_for_first_consumer(class) => ClaimState::Ready,
        _ => ClaimState::Pending,
    }
}

fn waits_for_first_consumer(class: Option<&StorageClass>) -> bool {
    class
        .and_then(|c| c.volume_binding_mode.as_deref())
        .is_some_and(|m| m == "WaitForFirstConsumer")
}

/// DataVolume already associated with `claim`, via annotation or owner
pub fn associated_data_volume(claim: &PersistentVolumeClaim) -> Option<String> {
    if let Some(name) = claim.annotations().get(POPULATED_FOR_ANNOTATION) {
        return Some(name.clone());
    }
    claim
        .owner_references()
        .iter()
        .find(|o| o.kind == DataVolume::KIND)
        .map(|o| o.name.clone())
}
