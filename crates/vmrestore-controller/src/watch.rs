//! Secondary watch mappers
//!
//! Map changes to claims, machines, DataVolumes, storage classes and
//! snapshots onto the restores that depend on them. Restores are taken from
//! the controller's reflector store so no API call is made per event.

use std::sync::Arc;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::DynamicObject;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;

use vmrestore_common::crd::{VirtualMachineRestore, VirtualMachineSnapshot};
use vmrestore_common::RESTORE_NAME_ANNOTATION;

fn push_unique(
    refs: &mut Vec<ObjectRef<VirtualMachineRestore>>,
    name: &str,
    namespace: Option<&str>,
) {
    let mut object_ref = ObjectRef::new(name);
    if let Some(ns) = namespace {
        object_ref = object_ref.within(ns);
    }
    if !refs.contains(&object_ref) {
        refs.push(object_ref);
    }
}

fn pending_in<'a>(
    restores: &'a [Arc<VirtualMachineRestore>],
    namespace: Option<&'a str>,
) -> impl Iterator<Item = &'a Arc<VirtualMachineRestore>> + 'a {
    restores
        .iter()
        .filter(move |r| r.namespace().as_deref() == namespace && !r.is_complete())
}

/// Restore that created `claim`, from its annotation
pub fn restores_for_claim(claim: &PersistentVolumeClaim) -> Vec<ObjectRef<VirtualMachineRestore>> {
    let mut refs = Vec::new();
    if let Some(name) = claim.annotations().get(RESTORE_NAME_ANNOTATION) {
        push_unique(&mut refs, name, claim.namespace().as_deref());
    }
    refs
}

/// Restores affected by a machine or instance change
///
/// Covers the restore holding the machine's lock and every incomplete
/// restore that targets the machine by name.
pub fn restores_for_machine(
    machine: &DynamicObject,
    restores: &[Arc<VirtualMachineRestore>],
) -> Vec<ObjectRef<VirtualMachineRestore>> {
    let namespace = machine.namespace();
    let name = machine.name_any();
    let mut refs = Vec::new();

    let holder = machine
        .data
        .get("status")
        .and_then(|s| s.get("restoreInProgress"))
        .and_then(|h| h.as_str());
    if let Some(holder) = holder {
        push_unique(&mut refs, holder, namespace.as_deref());
    }
    for restore in pending_in(restores, namespace.as_deref()) {
        if restore.spec.target.name == name {
            push_unique(&mut refs, &restore.name_any(), namespace.as_deref());
        }
    }
    refs
}

/// Restores that link or supersede the DataVolume `data_volume`
pub fn restores_for_data_volume(
    data_volume: &DynamicObject,
    restores: &[Arc<VirtualMachineRestore>],
) -> Vec<ObjectRef<VirtualMachineRestore>> {
    let namespace = data_volume.namespace();
    let name = data_volume.name_any();
    let mut refs = Vec::new();

    for restore in pending_in(restores, namespace.as_deref()) {
        let Some(status) = restore.status.as_ref() else {
            continue;
        };
        let linked = status
            .restores
            .iter()
            .any(|r| r.data_volume_name.as_deref() == Some(name.as_str()));
        if linked || status.deleted_data_volumes.contains(&name) {
            push_unique(&mut refs, &restore.name_any(), namespace.as_deref());
        }
    }
    refs
}

/// Every incomplete restore; binding modes affect claim readiness everywhere
pub fn restores_for_storage_class(
    restores: &[Arc<VirtualMachineRestore>],
) -> Vec<ObjectRef<VirtualMachineRestore>> {
    restores
        .iter()
        .filter(|r| !r.is_complete())
        .map(|r| ObjectRef::from_obj(r.as_ref()))
        .collect()
}

/// Incomplete restores reading from `snapshot`
pub fn restores_for_snapshot(
    snapshot: &VirtualMachineSnapshot,
    restores: &[Arc<VirtualMachineRestore>],
) -> Vec<ObjectRef<VirtualMachineRestore>> {
    let namespace = snapshot.namespace();
    let name = snapshot.name_any();
    let mut refs = Vec::new();
    for restore in pending_in(restores, namespace.as_deref()) {
        if restore.spec.snapshot_name == name {
            push_unique(&mut refs, &restore.name_any(), namespace.as_deref());
        }
    }
    refs
}
