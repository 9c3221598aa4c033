//! Resource definitions used by the restore controller
//!
//! `VirtualMachineRestore`, `VirtualMachineSnapshot` and
//! `VirtualMachineSnapshotContent` are CRDs this project can install.
//! The remaining types are typed views over resources owned by KubeVirt,
//! CDI and the CSI snapshotter.

mod restore;
mod snapshot;
mod storage;
mod types;
mod virtual_machine;

pub use restore::{
    TargetReference, VirtualMachineRestore, VirtualMachineRestoreSpec,
    VirtualMachineRestoreStatus, VolumeRestore,
};
pub use snapshot::{
    CapturedVirtualMachine, SnapshotSourceReference, SourceSpec, VirtualMachineSnapshot,
    VirtualMachineSnapshotContent, VirtualMachineSnapshotContentSpec,
    VirtualMachineSnapshotContentStatus, VirtualMachineSnapshotSpec,
    VirtualMachineSnapshotStatus, VolumeBackup,
};
pub use storage::{DataVolume, DataVolumeStatus, VolumeSnapshot, VolumeSnapshotStatus};
pub use types::{Condition, ConditionStatus, ConditionType};
pub use virtual_machine::{
    DataVolumeSource, DataVolumeTemplate, InstanceSpec, PersistentVolumeClaimSource,
    VirtualMachine, VirtualMachineInstance, VirtualMachineInstanceTemplate, VirtualMachineSpec,
    VirtualMachineStatus, Volume,
};

/// Schema for fields whose content is defined by another project's API
///
/// Emits `x-kubernetes-preserve-unknown-fields: true` so the API server
/// stores whatever KubeVirt or Kubernetes put there.
pub(crate) fn preserve_unknown_fields(
    _gen: &mut schemars::gen::SchemaGenerator,
) -> schemars::schema::Schema {
    let mut schema = schemars::schema::SchemaObject {
        instance_type: Some(schemars::schema::InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    schemars::schema::Schema::Object(schema)
}
