//! Kubernetes access for the restore reconciler
//!
//! [`KubeClient`] is the seam between the reconciler and the API server so
//! reconcile flows can be driven against a mock. Writes to objects other
//! controllers also touch (the target machine, restored claims) carry the
//! observed `resourceVersion`, so a concurrent change surfaces as a 409
//! instead of being overwritten.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::Client;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use vmrestore_common::crd::{
    DataVolume, VirtualMachine, VirtualMachineInstance, VirtualMachineRestore,
    VirtualMachineRestoreStatus, VirtualMachineSnapshot, VirtualMachineSnapshotContent,
    VolumeSnapshot,
};
use vmrestore_common::kube_utils::{from_dynamic, ignore_not_found, to_dynamic, HasApiResource};
use vmrestore_common::{Error, FIELD_MANAGER};

/// Trait abstracting Kubernetes client operations for VirtualMachineRestore
///
/// Lookups return `Ok(None)` for objects that do not exist.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a VirtualMachineSnapshot
    async fn get_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineSnapshot>, Error>;

    /// Get a VirtualMachineSnapshotContent
    async fn get_snapshot_content(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineSnapshotContent>, Error>;

    /// Get a provider VolumeSnapshot
    async fn get_volume_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VolumeSnapshot>, Error>;

    /// Get a VirtualMachine
    async fn get_virtual_machine(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachine>, Error>;

    /// Create a VirtualMachine
    async fn create_virtual_machine(
        &self,
        namespace: &str,
        vm: &VirtualMachine,
    ) -> Result<VirtualMachine, Error>;

    /// Replace a VirtualMachine; `vm` carries the observed resourceVersion
    async fn replace_virtual_machine(
        &self,
        namespace: &str,
        vm: &VirtualMachine,
    ) -> Result<VirtualMachine, Error>;

    /// Set or clear `status.restoreInProgress` on a VirtualMachine
    ///
    /// Returns the machine as written so a following write in the same
    /// reconcile uses the new resourceVersion.
    async fn set_restore_in_progress(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        holder: Option<String>,
    ) -> Result<VirtualMachine, Error>;

    /// True if a VirtualMachineInstance of this name exists
    async fn virtual_machine_instance_exists(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<bool, Error>;

    /// Get a PersistentVolumeClaim
    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error>;

    /// Create a PersistentVolumeClaim
    async fn create_claim(&self, namespace: &str, claim: &PersistentVolumeClaim)
        -> Result<(), Error>;

    /// Set one annotation on a claim
    async fn annotate_claim(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        key: &str,
        value: &str,
    ) -> Result<(), Error>;

    /// Get a StorageClass
    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>, Error>;

    /// Get a DataVolume
    async fn get_data_volume(&self, namespace: &str, name: &str)
        -> Result<Option<DataVolume>, Error>;

    /// Delete a DataVolume; a missing one counts as deleted
    async fn delete_data_volume(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Write the status of a VirtualMachineRestore
    async fn patch_restore_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &VirtualMachineRestoreStatus,
    ) -> Result<(), Error>;

    /// Write the owner references of a VirtualMachineRestore
    async fn set_restore_owner(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        owners: Vec<OwnerReference>,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn dynamic<T: HasApiResource>(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &T::api_resource())
    }

    async fn get_dynamic<T>(&self, namespace: &str, name: &str) -> Result<Option<T>, Error>
    where
        T: DeserializeOwned + HasApiResource,
    {
        let api = self.dynamic::<T>(namespace);
        match ignore_not_found(api.get(name).await)? {
            Some(obj) => Ok(Some(from_dynamic(obj)?)),
            None => Ok(None),
        }
    }
}

fn versioned(resource_version: Option<String>, body: serde_json::Value) -> serde_json::Value {
    let mut patch = body;
    if let (Some(rv), Some(map)) = (resource_version, patch.as_object_mut()) {
        let metadata = map.entry("metadata").or_insert_with(|| json!({}));
        if let Some(metadata) = metadata.as_object_mut() {
            metadata.insert("resourceVersion".to_string(), rv.into());
        }
    }
    patch
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineSnapshot>, Error> {
        let api: Api<VirtualMachineSnapshot> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.get(name).await)
    }

    async fn get_snapshot_content(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachineSnapshotContent>, Error> {
        let api: Api<VirtualMachineSnapshotContent> =
            Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.get(name).await)
    }

    async fn get_volume_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VolumeSnapshot>, Error> {
        self.get_dynamic(namespace, name).await
    }

    async fn get_virtual_machine(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VirtualMachine>, Error> {
        self.get_dynamic(namespace, name).await
    }

    async fn create_virtual_machine(
        &self,
        namespace: &str,
        vm: &VirtualMachine,
    ) -> Result<VirtualMachine, Error> {
        let api = self.dynamic::<VirtualMachine>(namespace);
        let created = api.create(&PostParams::default(), &to_dynamic(vm)?).await?;
        from_dynamic(created)
    }

    async fn replace_virtual_machine(
        &self,
        namespace: &str,
        vm: &VirtualMachine,
    ) -> Result<VirtualMachine, Error> {
        let name = vm
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::internal("VirtualMachine has no name"))?;
        let api = self.dynamic::<VirtualMachine>(namespace);
        let replaced = api
            .replace(name, &PostParams::default(), &to_dynamic(vm)?)
            .await?;
        from_dynamic(replaced)
    }

    async fn set_restore_in_progress(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        holder: Option<String>,
    ) -> Result<VirtualMachine, Error> {
        debug!(vm = %name, holder = ?holder, "updating restore lock");
        let api = self.dynamic::<VirtualMachine>(namespace);
        let patch = versioned(
            resource_version,
            json!({ "status": { "restoreInProgress": holder } }),
        );
        let patched = api
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        from_dynamic(patched)
    }

    async fn virtual_machine_instance_exists(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<bool, Error> {
        let api = self.dynamic::<VirtualMachineInstance>(namespace);
        Ok(ignore_not_found(api.get(name).await)?.is_some())
    }

    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.get(name).await)
    }

    async fn create_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<(), Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), claim).await?;
        Ok(())
    }

    async fn annotate_claim(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        key: &str,
        value: &str,
    ) -> Result<(), Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let patch = versioned(
            resource_version,
            json!({ "metadata": { "annotations": { key: value } } }),
        );
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>, Error> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        ignore_not_found(api.get(name).await)
    }

    async fn get_data_volume(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DataVolume>, Error> {
        self.get_dynamic(namespace, name).await
    }

    async fn delete_data_volume(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api = self.dynamic::<DataVolume>(namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)?;
        Ok(())
    }

    async fn patch_restore_status(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        status: &VirtualMachineRestoreStatus,
    ) -> Result<(), Error> {
        let api: Api<VirtualMachineRestore> = Api::namespaced(self.client.clone(), namespace);
        let patch = versioned(resource_version, json!({ "status": status }));
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_restore_owner(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        owners: Vec<OwnerReference>,
    ) -> Result<(), Error> {
        let api: Api<VirtualMachineRestore> = Api::namespaced(self.client.clone(), namespace);
        let patch = versioned(
            resource_version,
            json!({ "metadata": { "ownerReferences": owners } }),
        );
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_version_is_added_to_metadata() {
        let patch = versioned(
            Some("42".to_string()),
            json!({ "metadata": { "annotations": { "a": "b" } } }),
        );
        assert_eq!(
            patch,
            json!({ "metadata": { "annotations": { "a": "b" }, "resourceVersion": "42" } })
        );
    }

    #[test]
    fn status_patch_gains_metadata() {
        let patch = versioned(Some("7".to_string()), json!({ "status": { "complete": true } }));
        assert_eq!(patch["metadata"]["resourceVersion"], "7");
        assert_eq!(patch["status"]["complete"], true);
    }

    #[test]
    fn no_resource_version_leaves_patch_alone() {
        let body = json!({ "status": { "restoreInProgress": null } });
        assert_eq!(versioned(None, body.clone()), body);
    }
}
