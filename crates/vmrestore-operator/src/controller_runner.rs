//! Controller runner - wires the restore reconciler to its watches
//!
//! The restore controller watches restores directly and maps changes on
//! claims, machines, instances, DataVolumes, storage classes and snapshots
//! back onto the restores that depend on them.

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::DynamicObject;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};

use vmrestore_common::crd::{
    DataVolume, VirtualMachine, VirtualMachineInstance, VirtualMachineRestore,
    VirtualMachineSnapshot,
};
use vmrestore_common::kube_utils::HasApiResource;
use vmrestore_controller::watch::{
    restores_for_claim, restores_for_data_volume, restores_for_machine, restores_for_snapshot,
    restores_for_storage_class,
};
use vmrestore_controller::{error_policy, reconcile, Context};

use crate::config::Cli;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Api for a namespaced typed resource, scoped to `namespace` when set
fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Api for a foreign kind accessed dynamically
fn scoped_dynamic<T: HasApiResource>(client: &Client, namespace: Option<&str>) -> Api<DynamicObject> {
    let ar = T::api_resource();
    match namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &ar),
        None => Api::all_with(client.clone(), &ar),
    }
}

/// Run the restore controller until a shutdown signal is received
pub async fn run(client: Client, cli: &Cli) {
    let namespace = cli.namespace.as_deref();
    let ctx = Arc::new(
        Context::builder(client.clone())
            .resync(cli.resync())
            .build(),
    );

    let controller = Controller::new(
        scoped::<VirtualMachineRestore>(&client, namespace),
        watcher_config(),
    );
    let store = controller.store();
    let machine_store = store.clone();
    let instance_store = store.clone();
    let data_volume_store = store.clone();
    let class_store = store.clone();
    let snapshot_store = store;

    tracing::info!(
        namespace = namespace.unwrap_or("<all>"),
        concurrency = cli.concurrency,
        resync_secs = cli.resync_secs,
        "starting VirtualMachineRestore controller"
    );

    controller
        .with_config(ControllerConfig::default().concurrency(cli.concurrency))
        .watches(
            scoped::<PersistentVolumeClaim>(&client, namespace),
            watcher_config(),
            |claim| restores_for_claim(&claim),
        )
        .watches_with(
            scoped_dynamic::<VirtualMachine>(&client, namespace),
            VirtualMachine::api_resource(),
            watcher_config(),
            move |machine| restores_for_machine(&machine, &machine_store.state()),
        )
        .watches_with(
            scoped_dynamic::<VirtualMachineInstance>(&client, namespace),
            VirtualMachineInstance::api_resource(),
            watcher_config(),
            move |instance| restores_for_machine(&instance, &instance_store.state()),
        )
        .watches_with(
            scoped_dynamic::<DataVolume>(&client, namespace),
            DataVolume::api_resource(),
            watcher_config(),
            move |dv| restores_for_data_volume(&dv, &data_volume_store.state()),
        )
        .watches(
            Api::<StorageClass>::all(client.clone()),
            watcher_config(),
            move |_class| restores_for_storage_class(&class_store.state()),
        )
        .watches(
            scoped::<VirtualMachineSnapshot>(&client, namespace),
            watcher_config(),
            move |snapshot| restores_for_snapshot(&snapshot, &snapshot_store.state()),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("VirtualMachineRestore"))
        .await;

    tracing::info!("restore controller stopped");
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::warn!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
