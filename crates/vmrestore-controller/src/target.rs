//! Restore target abstraction
//!
//! A restore either rewrites the machine it names or creates that machine
//! from the snapshot when it does not exist yet. [`Target`] is resolved once
//! per reconcile and gives both cases the same surface: lock, own, apply the
//! restored spec, and clean up superseded storage.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;
use tracing::{debug, info};

use vmrestore_common::crd::{
    CapturedVirtualMachine, PersistentVolumeClaimSource, VirtualMachine, VirtualMachineRestore,
    VirtualMachineSpec, VolumeRestore,
};
use vmrestore_common::kube_utils::HasApiResource;
use vmrestore_common::{Error, LAST_RESTORE_ANNOTATION};

use crate::client::KubeClient;

/// The machine a restore writes to
#[derive(Clone, Debug, PartialEq)]
pub enum Target {
    /// The machine exists; its spec is replaced
    Existing(VirtualMachine),
    /// The machine does not exist; it is created from the snapshot
    New {
        /// Name the machine will be created with
        name: String,
    },
}

impl Target {
    /// Resolve the target of `restore` by looking the machine up
    pub async fn resolve(
        client: &dyn KubeClient,
        namespace: &str,
        restore: &VirtualMachineRestore,
    ) -> Result<Self, Error> {
        let name = &restore.spec.target.name;
        Ok(match client.get_virtual_machine(namespace, name).await? {
            Some(vm) => Target::Existing(vm),
            None => Target::New { name: name.clone() },
        })
    }

    /// Machine name
    pub fn name(&self) -> &str {
        match self {
            Target::Existing(vm) => vm.name(),
            Target::New { name } => name,
        }
    }

    /// True if the machine exists
    pub fn exists(&self) -> bool {
        matches!(self, Target::Existing(_))
    }

    /// UID of the machine, once it exists
    pub fn uid(&self) -> Option<&str> {
        match self {
            Target::Existing(vm) => vm.metadata.uid.as_deref(),
            Target::New { .. } => None,
        }
    }

    /// Controller owner reference pointing at the machine
    ///
    /// None until the machine exists and has a UID.
    pub fn owner_reference(&self) -> Option<OwnerReference> {
        let Target::Existing(vm) = self else {
            return None;
        };
        Some(OwnerReference {
            api_version: VirtualMachine::API_VERSION.to_string(),
            kind: VirtualMachine::KIND.to_string(),
            name: vm.metadata.name.clone()?,
            uid: vm.metadata.uid.clone()?,
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }

    /// True if the machine carries `restore_id` as its last restore
    pub fn is_restored_by(&self, restore_id: &str) -> bool {
        match self {
            Target::Existing(vm) => vm.annotation(LAST_RESTORE_ANNOTATION) == Some(restore_id),
            Target::New { .. } => false,
        }
    }

    /// Take the lock for `restore_name`
    ///
    /// A no-op if the lock is already held by `restore_name` or the machine
    /// does not exist yet. Fails with [`Error::Conflict`] if another restore
    /// holds it.
    pub async fn lock(
        &mut self,
        client: &dyn KubeClient,
        namespace: &str,
        restore_name: &str,
    ) -> Result<(), Error> {
        let Target::Existing(vm) = self else {
            return Ok(());
        };
        match vm.restore_in_progress() {
            Some(holder) if holder == restore_name => Ok(()),
            Some(holder) => Err(Error::conflict(vm.name(), holder)),
            None => {
                let locked = client
                    .set_restore_in_progress(
                        namespace,
                        vm.name(),
                        vm.metadata.resource_version.clone(),
                        Some(restore_name.to_string()),
                    )
                    .await?;
                info!(vm = %vm.name(), restore = %restore_name, "locked target");
                *vm = locked;
                Ok(())
            }
        }
    }

    /// Release the lock if `restore_name` holds it
    ///
    /// Returns true if a write was made.
    pub async fn unlock(
        &mut self,
        client: &dyn KubeClient,
        namespace: &str,
        restore_name: &str,
    ) -> Result<bool, Error> {
        let Target::Existing(vm) = self else {
            return Ok(false);
        };
        if vm.restore_in_progress() != Some(restore_name) {
            return Ok(false);
        }
        let unlocked = client
            .set_restore_in_progress(
                namespace,
                vm.name(),
                vm.metadata.resource_version.clone(),
                None,
            )
            .await?;
        info!(vm = %vm.name(), restore = %restore_name, "unlocked target");
        *vm = unlocked;
        Ok(true)
    }

    /// DataVolumes the machine owns now that `restored` no longer references
    ///
    /// Always empty for a machine this restore creates.
    pub fn superseded_data_volumes(&self, restored: &VirtualMachineSpec) -> Vec<String> {
        let Target::Existing(vm) = self else {
            return Vec::new();
        };
        vm.spec
            .data_volume_templates
            .iter()
            .map(|t| t.name())
            .filter(|name| !restored.data_volume_templates.iter().any(|t| t.name() == *name))
            .map(str::to_string)
            .collect()
    }

    /// Check that the restored spec can be written to this target
    ///
    /// Existing machines take the spec as is. A new machine must survive
    /// `spec.patches`; the patch or validation error is returned otherwise.
    pub fn check_restored_spec(
        &self,
        restore: &VirtualMachineRestore,
        captured: &CapturedVirtualMachine,
        spec: &VirtualMachineSpec,
    ) -> Result<(), Error> {
        match self {
            Target::Existing(_) => Ok(()),
            Target::New { .. } => build_new_machine(restore, captured, spec.clone()).map(drop),
        }
    }

    /// Write the restored spec and the last-restore annotation
    ///
    /// An existing machine is replaced using its observed resourceVersion; a
    /// new one is built from the captured machine, patched, created, and
    /// locked for `restore` right away.
    pub async fn apply_restored_spec(
        &self,
        client: &dyn KubeClient,
        restore: &VirtualMachineRestore,
        captured: &CapturedVirtualMachine,
        spec: VirtualMachineSpec,
    ) -> Result<(), Error> {
        let namespace = restore.namespace().unwrap_or_default();
        match self {
            Target::Existing(vm) => {
                let mut updated = vm.clone();
                updated.spec = spec;
                updated
                    .metadata
                    .annotations
                    .get_or_insert_with(BTreeMap::new)
                    .insert(LAST_RESTORE_ANNOTATION.to_string(), restore.restore_id());
                client.replace_virtual_machine(&namespace, &updated).await?;
                info!(vm = %self.name(), "updated target spec");
                Ok(())
            }
            Target::New { .. } => {
                let vm = build_new_machine(restore, captured, spec)?;
                match client.create_virtual_machine(&namespace, &vm).await {
                    Ok(created) => {
                        info!(vm = %self.name(), "created target");
                        let mut created = Target::Existing(created);
                        created.lock(client, &namespace, &restore.name_any()).await
                    }
                    Err(e) if e.is_already_exists() => {
                        debug!(vm = %self.name(), "target already created");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Delete superseded DataVolumes; missing ones count as deleted
    pub async fn cleanup(
        client: &dyn KubeClient,
        namespace: &str,
        names: &[String],
    ) -> Result<(), Error> {
        for name in names {
            client.delete_data_volume(namespace, name).await?;
            debug!(data_volume = %name, "deleted superseded DataVolume");
        }
        Ok(())
    }
}

/// Captured spec with every restored volume pointing at its new storage
///
/// A volume backed by a DataVolume template gets the template and the
/// reference renamed to the linked DataVolume (the claim name until one is
/// linked). A DataVolume reference without a template becomes a claim
/// reference. Claim volumes point at the restored claim. Volumes without a
/// restore entry are left alone.
pub fn restored_spec(captured: &VirtualMachineSpec, restores: &[VolumeRestore]) -> VirtualMachineSpec {
    let mut spec = captured.clone();
    let Some(template) = spec.template.as_mut() else {
        return spec;
    };

    for volume in template.spec.volumes.iter_mut() {
        let Some(entry) = restores.iter().find(|r| r.volume_name == volume.name) else {
            continue;
        };

        if let Some(source) = volume.data_volume.as_mut() {
            let new_name = entry
                .data_volume_name
                .clone()
                .unwrap_or_else(|| entry.persistent_claim_name.clone());
            let template = spec
                .data_volume_templates
                .iter_mut()
                .find(|t| t.name() == source.name);
            match template {
                Some(template) => {
                    template.metadata.name = Some(new_name.clone());
                    source.name = new_name;
                }
                None => {
                    volume.data_volume = None;
                    volume.persistent_volume_claim = Some(PersistentVolumeClaimSource {
                        claim_name: entry.persistent_claim_name.clone(),
                        ..Default::default()
                    });
                }
            }
        } else if let Some(source) = volume.persistent_volume_claim.as_mut() {
            source.claim_name = entry.persistent_claim_name.clone();
        }
    }
    spec
}

/// True if the captured volume `volume_name` is backed by a DataVolume template
pub fn uses_data_volume_template(captured: &VirtualMachineSpec, volume_name: &str) -> bool {
    captured
        .volumes()
        .iter()
        .filter(|v| v.name == volume_name)
        .filter_map(|v| v.data_volume.as_ref())
        .any(|dv| captured.data_volume_templates.iter().any(|t| t.name() == dv.name))
}

/// Build the machine a restore creates, with `spec.patches` applied
///
/// Patches are RFC 6902 operations, one JSON object per entry, applied in
/// order to the whole object. A patch may not rename the machine.
pub fn build_new_machine(
    restore: &VirtualMachineRestore,
    captured: &CapturedVirtualMachine,
    spec: VirtualMachineSpec,
) -> Result<VirtualMachine, Error> {
    let name = restore.spec.target.name.clone();
    let mut annotations = captured.metadata.annotations.clone().unwrap_or_default();
    annotations.insert(LAST_RESTORE_ANNOTATION.to_string(), restore.restore_id());

    let vm = VirtualMachine {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: restore.namespace(),
            labels: captured.metadata.labels.clone(),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec,
        status: None,
    };
    if restore.spec.patches.is_empty() {
        return Ok(vm);
    }

    let mut value = serde_json::to_value(&vm)
        .map_err(|e| Error::serialization_for_kind(VirtualMachine::KIND, e.to_string()))?;
    for (index, raw) in restore.spec.patches.iter().enumerate() {
        let operation: json_patch::PatchOperation =
            serde_json::from_str(raw).map_err(|e| Error::patch(index, e.to_string()))?;
        json_patch::patch(&mut value, &[operation])
            .map_err(|e| Error::patch(index, e.to_string()))?;
    }
    let patched: VirtualMachine = serde_json::from_value(value)
        .map_err(|e| Error::serialization_for_kind(VirtualMachine::KIND, e.to_string()))?;

    if patched.metadata.name.as_deref() != Some(name.as_str()) {
        return Err(Error::validation_for_field(
            restore.name_any(),
            "spec.patches",
            format!(
                "patches rename the machine to {:?}, expected {}",
                patched.name(),
                name
            ),
        ));
    }
    Ok(patched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockKubeClient;
    use serde_json::json;
    use vmrestore_common::crd::{TargetReference, VirtualMachineRestoreSpec, VirtualMachineStatus};

    fn restore(target: &str, patches: Vec<String>) -> VirtualMachineRestore {
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
                    name: target.to_string(),
                },
                snapshot_name: "snapshot".to_string(),
                patches,
            },
            status: None,
        }
    }

    fn captured() -> CapturedVirtualMachine {
        serde_json::from_value(json!({
            "metadata": {
                "name": "vm",
                "labels": {"app": "db"},
                "annotations": {"owner": "team-a"}
            },
            "spec": {
                "running": false,
                "dataVolumeTemplates": [
                    {"metadata": {"name": "vm-root"}, "spec": {"storage": {}}}
                ],
                "template": {
                    "spec": {
                        "domain": {
                            "devices": {
                                "interfaces": [{"name": "default", "macAddress": "00:00:5e:00:53:00"}]
                            }
                        },
                        "volumes": [
                            {"name": "disk1", "dataVolume": {"name": "vm-root"}},
                            {"name": "disk2", "persistentVolumeClaim": {"claimName": "vm-data"}},
                            {"name": "disk3", "dataVolume": {"name": "imported"}},
                            {"name": "cloudinit", "cloudInitNoCloud": {"userData": "#cloud-config"}}
                        ]
                    }
                }
            }
        }))
        .unwrap()
    }

    fn entry(volume: &str, data_volume: Option<&str>) -> VolumeRestore {
        VolumeRestore {
            volume_name: volume.to_string(),
            persistent_claim_name: format!("restore-uid-{volume}"),
            snapshot_name: format!("vs-{volume}"),
            data_volume_name: data_volume.map(str::to_string),
        }
    }

    fn existing(holder: Option<&str>) -> VirtualMachine {
        let mut vm = VirtualMachine {
            metadata: ObjectMeta {
                name: Some("vm".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("vm-uid".to_string()),
                resource_version: Some("10".to_string()),
                ..Default::default()
            },
            spec: captured().spec,
            status: None,
        };
        vm.status = Some(VirtualMachineStatus {
            restore_in_progress: holder.map(str::to_string),
            ..Default::default()
        });
        vm
    }

    fn volume_names(spec: &VirtualMachineSpec) -> Vec<(String, Option<String>, Option<String>)> {
        spec.template
            .as_ref()
            .unwrap()
            .spec
            .volumes
            .iter()
            .map(|v| {
                (
                    v.name.clone(),
                    v.data_volume.as_ref().map(|d| d.name.clone()),
                    v.persistent_volume_claim.as_ref().map(|p| p.claim_name.clone()),
                )
            })
            .collect()
    }

    #[test]
    fn restored_spec_rewrites_volume_references() {
        let restores = vec![
            entry("disk1", Some("restore-uid-disk1")),
            entry("disk2", None),
            entry("disk3", None),
        ];
        let spec = restored_spec(&captured().spec, &restores);

        assert_eq!(
            volume_names(&spec),
            vec![
                ("disk1".into(), Some("restore-uid-disk1".into()), None),
                ("disk2".into(), None, Some("restore-uid-disk2".into())),
                ("disk3".into(), None, Some("restore-uid-disk3".into())),
                ("cloudinit".into(), None, None),
            ]
        );
        assert_eq!(spec.data_volume_templates[0].name(), "restore-uid-disk1");
        assert!(spec.template.as_ref().unwrap().spec.volumes[3]
            .extra
            .contains_key("cloudInitNoCloud"));
        assert_eq!(spec.extra["running"], json!(false));
    }

    #[test]
    fn volumes_without_entries_are_untouched() {
        let spec = restored_spec(&captured().spec, &[]);
        assert_eq!(spec, captured().spec);
    }

    #[test]
    fn template_backed_volume_detection() {
        let spec = captured().spec;
        assert!(uses_data_volume_template(&spec, "disk1"));
        assert!(!uses_data_volume_template(&spec, "disk2"));
        assert!(!uses_data_volume_template(&spec, "disk3"));
    }

    #[test]
    fn superseded_data_volumes_are_the_replaced_templates() {
        let target = Target::Existing(existing(None));
        let restored = restored_spec(&captured().spec, &[entry("disk1", Some("restore-uid-disk1"))]);
        assert_eq!(target.superseded_data_volumes(&restored), vec!["vm-root".to_string()]);

        let unchanged = captured().spec;
        assert!(target.superseded_data_volumes(&unchanged).is_empty());
    }

    #[test]
    fn new_target_supersedes_nothing() {
        let target = Target::New { name: "new-vm".into() };
        let restored = restored_spec(&captured().spec, &[entry("disk1", None)]);
        assert!(target.superseded_data_volumes(&restored).is_empty());
        assert!(target.owner_reference().is_none());
        assert!(!target.is_restored_by("restore-uid"));
    }

    #[test]
    fn owner_reference_points_at_machine() {
        let owner = Target::Existing(existing(None)).owner_reference().unwrap();
        assert_eq!(owner.api_version, "kubevirt.io/v1");
        assert_eq!(owner.kind, "VirtualMachine");
        assert_eq!(owner.name, "vm");
        assert_eq!(owner.uid, "vm-uid");
        assert_eq!(owner.controller, Some(true));
        assert_eq!(owner.block_owner_deletion, Some(true));
    }

    #[test]
    fn new_machine_with_name_and_mac_patches() {
        let r = restore(
            "new-vm",
            vec![
                r#"{"op": "replace", "path": "/metadata/name", "value": "new-vm"}"#.to_string(),
                r#"{"op": "replace", "path": "/spec/template/spec/domain/devices/interfaces/0/macAddress", "value": "00:00:5e:00:53:01"}"#.to_string(),
            ],
        );
        let vm = build_new_machine(&r, &captured(), captured().spec).unwrap();

        assert_eq!(vm.metadata.name.as_deref(), Some("new-vm"));
        assert_eq!(vm.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(vm.annotation(LAST_RESTORE_ANNOTATION), Some("restore-uid"));
        assert_eq!(vm.annotation("owner"), Some("team-a"));
        assert_eq!(vm.metadata.labels.as_ref().unwrap()["app"], "db");
        let domain = &vm.spec.template.as_ref().unwrap().spec.extra["domain"];
        assert_eq!(
            domain["devices"]["interfaces"][0]["macAddress"],
            json!("00:00:5e:00:53:01")
        );
    }

    #[test]
    fn patch_renaming_machine_is_rejected() {
        let r = restore(
            "new-vm",
            vec![r#"{"op": "replace", "path": "/metadata/name", "value": "other"}"#.to_string()],
        );
        assert!(matches!(
            build_new_machine(&r, &captured(), captured().spec),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn only_new_targets_check_patches() {
        let r = restore(
            "vm",
            vec![r#"{"op": "replace", "path": "/metadata/name", "value": "other"}"#.to_string()],
        );
        let spec = captured().spec;

        let current = Target::Existing(existing(Some("restore")));
        assert!(current.check_restored_spec(&r, &captured(), &spec).is_ok());

        let new = Target::New { name: "vm".into() };
        assert!(matches!(
            new.check_restored_spec(&r, &captured(), &spec),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn malformed_patch_reports_index() {
        let r = restore(
            "new-vm",
            vec![
                r#"{"op": "add", "path": "/metadata/labels/x", "value": "y"}"#.to_string(),
                "not json".to_string(),
            ],
        );
        assert!(matches!(
            build_new_machine(&r, &captured(), captured().spec),
            Err(Error::Patch { index: 1, .. })
        ));

        let r = restore(
            "new-vm",
            vec![r#"{"op": "remove", "path": "/spec/missing"}"#.to_string()],
        );
        assert!(matches!(
            build_new_machine(&r, &captured(), captured().spec),
            Err(Error::Patch { index: 0, .. })
        ));
    }

    #[tokio::test]
    async fn lock_held_by_other_restore_conflicts() {
        let mut client = MockKubeClient::new();
        client.expect_set_restore_in_progress().never();
        let mut target = Target::Existing(existing(Some("other")));

        let err = target.lock(&client, "default", "restore").await.unwrap_err();
        assert!(matches!(err, Error::Conflict { ref holder, .. } if holder == "other"));
    }

    #[tokio::test]
    async fn lock_is_taken_with_observed_version() {
        let mut client = MockKubeClient::new();
        client
            .expect_set_restore_in_progress()
            .withf(|ns, name, rv, holder| {
                ns == "default"
                    && name == "vm"
                    && rv.as_deref() == Some("10")
                    && holder.as_deref() == Some("restore")
            })
            .times(1)
            .returning(|_, _, _, _| Ok(existing(Some("restore"))));
        let mut target = Target::Existing(existing(None));

        target.lock(&client, "default", "restore").await.unwrap();
        match &target {
            Target::Existing(vm) => assert_eq!(vm.restore_in_progress(), Some("restore")),
            Target::New { .. } => panic!("expected an existing target"),
        }

        // Already held: no second write
        target.lock(&client, "default", "restore").await.unwrap();
    }

    #[tokio::test]
    async fn unlock_only_clears_own_lock() {
        let mut client = MockKubeClient::new();
        client.expect_set_restore_in_progress().never();
        let mut target = Target::Existing(existing(Some("other")));
        assert!(!target.unlock(&client, "default", "restore").await.unwrap());

        let mut target = Target::New { name: "vm".into() };
        assert!(!target.unlock(&client, "default", "restore").await.unwrap());
    }

    #[tokio::test]
    async fn existing_target_is_replaced_with_annotation() {
        let mut client = MockKubeClient::new();
        client
            .expect_replace_virtual_machine()
            .withf(|ns, vm| {
                ns == "default"
                    && vm.metadata.resource_version.as_deref() == Some("10")
                    && vm.annotation(LAST_RESTORE_ANNOTATION) == Some("restore-uid")
            })
            .times(1)
            .returning(|_, vm| Ok(vm.clone()));
        let target = Target::Existing(existing(Some("restore")));
        let r = restore("vm", vec![]);

        target
            .apply_restored_spec(&client, &r, &captured(), captured().spec)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn created_target_is_locked_immediately() {
        let mut client = MockKubeClient::new();
        client
            .expect_create_virtual_machine()
            .withf(|ns, vm| ns == "default" && vm.name() == "new-vm")
            .times(1)
            .returning(|_, vm| {
                let mut created = vm.clone();
                created.metadata.uid = Some("new-vm-uid".to_string());
                created.metadata.resource_version = Some("1".to_string());
                Ok(created)
            });
        client
            .expect_set_restore_in_progress()
            .withf(|ns, name, rv, holder| {
                ns == "default"
                    && name == "new-vm"
                    && rv.as_deref() == Some("1")
                    && holder.as_deref() == Some("restore")
            })
            .times(1)
            .returning(|_, _, _, _| {
                let mut vm = existing(Some("restore"));
                vm.metadata.name = Some("new-vm".to_string());
                Ok(vm)
            });
        let target = Target::New { name: "new-vm".into() };
        let r = restore("new-vm", vec![]);

        target
            .apply_restored_spec(&client, &r, &captured(), captured().spec)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn creating_existing_new_target_is_idempotent() {
        let mut client = MockKubeClient::new();
        client
            .expect_create_virtual_machine()
            .times(1)
            .returning(|_, _| {
                Err(Error::from(kube::Error::Api(kube::core::ErrorResponse {
                    status: "Failure".into(),
                    message: "already exists".into(),
                    reason: "AlreadyExists".into(),
                    code: 409,
                })))
            });
        let target = Target::New { name: "new-vm".into() };
        let r = restore("new-vm", vec![]);

        target
            .apply_restored_spec(&client, &r, &captured(), captured().spec)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn cleanup_deletes_each_name() {
        let mut client = MockKubeClient::new();
        client
            .expect_delete_data_volume()
            .withf(|ns, name| ns == "default" && (name == "dv-a" || name == "dv-b"))
            .times(2)
            .returning(|_, _| Ok(()));

        Target::cleanup(&client, "default", &["dv-a".to_string(), "dv-b".to_string()])
            .await
            .unwrap();
    }
}
