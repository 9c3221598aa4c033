//! VirtualMachineRestore reconciler
//!
//! Each invocation classifies the restore from persisted status, observes the
//! claims and target it depends on, and advances the restore by one step.
//! At most one write to the restore itself is made per invocation; the
//! resulting watch event (or the periodic resync) drives the next step.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use vmrestore_common::crd::{
    CapturedVirtualMachine, VirtualMachine, VirtualMachineRestore, VirtualMachineRestoreStatus,
    VirtualMachineSnapshotContent,
};
use vmrestore_common::events::{actions, reasons as event_reasons, EventPublisher, KubeEventPublisher};
use vmrestore_common::kube_utils::{controller_owner, HasApiResource};
use vmrestore_common::{Error, FIELD_MANAGER, POPULATED_FOR_ANNOTATION};

use crate::client::{KubeClient, KubeClientImpl};
use crate::conditions::{conditions_for, RestorePhase};
use crate::state::{
    classify, determine_progress_step, update_prepared, ClaimState, Observed, ProgressStep,
    RestoreState,
};
use crate::storage::{associated_data_volume, build_claim, claim_state, volume_restores};
use crate::target::{restored_spec, uses_data_volume_template, Target};
use crate::{
    DEFAULT_RESYNC_SECS, REQUEUE_API_CONFLICT_SECS, REQUEUE_ERROR_SECS, REQUEUE_LOCKED_SECS,
    REQUEUE_OWNER_SECS,
};

/// Shared context for the VirtualMachineRestore controller
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client)
///     .resync(Duration::from_secs(30))
///     .build();
/// ```
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Event publisher for restore events
    pub events: Arc<dyn EventPublisher>,
    /// Requeue interval while waiting on external state
    pub resync: Duration,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with a mock client and no events
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>) -> Self {
        Self {
            kube,
            events: Arc::new(vmrestore_common::events::NoopEventPublisher),
            resync: Duration::from_secs(DEFAULT_RESYNC_SECS),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    events: Option<Arc<dyn EventPublisher>>,
    resync: Duration,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            events: None,
            resync: Duration::from_secs(DEFAULT_RESYNC_SECS),
        }
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set the periodic resync interval
    pub fn resync(mut self, resync: Duration) -> Self {
        self.resync = resync;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            events: self
                .events
                .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(self.client.clone(), FIELD_MANAGER))),
            resync: self.resync,
        }
    }
}

/// Snapshot data a restore reads from
struct Source {
    content: VirtualMachineSnapshotContent,
    captured: CapturedVirtualMachine,
}

/// Reconcile a VirtualMachineRestore
#[instrument(skip(restore, ctx), fields(restore = %restore.name_any()))]
pub async fn reconcile(
    restore: Arc<VirtualMachineRestore>,
    ctx: Arc<Context>,
) -> Result<Action, Error> {
    let name = restore.name_any();
    let namespace = restore.namespace().unwrap_or_default();
    let state = classify(&restore);
    debug!(?state, "reconciling restore");

    match state {
        RestoreState::Deleting => {
            // The lock, if any, stays on the target
            debug!("restore is being deleted");
            return Ok(Action::await_change());
        }
        RestoreState::Completed => return ensure_unlocked(&restore, &ctx, &namespace).await,
        RestoreState::Uninitialized | RestoreState::InProgress => {}
    }

    let source = match load_source(&restore, &ctx, &namespace).await {
        Ok(source) => source,
        Err(Error::Validation { message, .. }) => {
            warn!(%message, "snapshot not usable");
            report(&restore, &ctx, RestorePhase::InvalidSnapshot(message)).await?;
            return Ok(Action::requeue(ctx.resync));
        }
        Err(e) => return Err(e),
    };

    let mut target = Target::resolve(ctx.kube.as_ref(), &namespace, &restore).await?;

    let owner = controller_owner(restore.metadata.owner_references.as_deref())
        .filter(|o| o.kind == VirtualMachine::KIND);
    match (owner, target.uid()) {
        (Some(owner), Some(uid)) if owner.uid != uid => {
            return target_deleted(&restore, &ctx, &target).await;
        }
        (Some(_), None) => return target_deleted(&restore, &ctx, &target).await,
        (None, Some(_)) => {
            if let Some(owner) = target.owner_reference() {
                info!(vm = %target.name(), "setting restore owner");
                ctx.kube
                    .set_restore_owner(&namespace, &name, restore.resource_version(), vec![owner])
                    .await?;
            }
            return Ok(Action::requeue(Duration::from_secs(REQUEUE_OWNER_SECS)));
        }
        _ => {}
    }

    if let Err(e) = target.lock(ctx.kube.as_ref(), &namespace, &name).await {
        return match e {
            Error::Conflict { target, holder } => {
                info!(vm = %target, %holder, "target locked by another restore");
                report(&restore, &ctx, RestorePhase::TargetLocked { target, holder }).await?;
                Ok(Action::requeue(Duration::from_secs(REQUEUE_LOCKED_SECS)))
            }
            e => Err(e),
        };
    }

    if state == RestoreState::Uninitialized {
        return initialize(&restore, &ctx, &source).await;
    }
    progress(&restore, &ctx, &namespace, &source, &target).await
}

/// Error policy for the controller
///
/// Optimistic-concurrency conflicts are retried quickly since the next read
/// will see the newer object.
pub fn error_policy(restore: Arc<VirtualMachineRestore>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_api_conflict() {
        debug!(restore = %restore.name_any(), "write conflicted, retrying");
        return Action::requeue(Duration::from_secs(REQUEUE_API_CONFLICT_SECS));
    }
    if error.is_retryable() {
        warn!(
            %error,
            restore = %restore.name_any(),
            context = error.context().unwrap_or_default(),
            "reconciliation failed, retrying"
        );
    } else {
        error!(
            ?error,
            restore = %restore.name_any(),
            "reconciliation failed"
        );
    }
    Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
}

async fn load_source(
    restore: &VirtualMachineRestore,
    ctx: &Context,
    namespace: &str,
) -> Result<Source, Error> {
    let snapshot_name = &restore.spec.snapshot_name;
    let invalid = |msg: String| Error::validation_for(restore.name_any(), msg);

    let snapshot = ctx
        .kube
        .get_snapshot(namespace, snapshot_name)
        .await?
        .ok_or_else(|| invalid(format!("VMSnapshot {namespace}/{snapshot_name} does not exist")))?;
    if !snapshot.is_ready() {
        return Err(invalid(format!("VMSnapshot {namespace}/{snapshot_name} not ready")));
    }
    let content_name = snapshot
        .content_name()
        .ok_or_else(|| invalid(format!("VMSnapshot {namespace}/{snapshot_name} has no content")))?;

    let content = ctx
        .kube
        .get_snapshot_content(namespace, content_name)
        .await?
        .ok_or_else(|| {
            invalid(format!("VMSnapshotContent {namespace}/{content_name} does not exist"))
        })?;
    if !content.is_ready() {
        return Err(invalid(format!("VMSnapshotContent {namespace}/{content_name} not ready")));
    }
    let captured = content.spec.source.virtual_machine.clone().ok_or_else(|| {
        invalid(format!("VMSnapshotContent {namespace}/{content_name} has no VirtualMachine"))
    })?;

    Ok(Source { content, captured })
}

async fn target_deleted(
    restore: &VirtualMachineRestore,
    ctx: &Context,
    target: &Target,
) -> Result<Action, Error> {
    warn!(vm = %target.name(), "owned target no longer exists");
    let message = format!("VirtualMachine {} no longer exists", target.name());
    report(restore, ctx, RestorePhase::TargetDeleted(message)).await?;
    Ok(Action::await_change())
}

async fn ensure_unlocked(
    restore: &VirtualMachineRestore,
    ctx: &Context,
    namespace: &str,
) -> Result<Action, Error> {
    let mut target = Target::resolve(ctx.kube.as_ref(), namespace, restore).await?;
    target
        .unlock(ctx.kube.as_ref(), namespace, &restore.name_any())
        .await?;
    Ok(Action::await_change())
}

async fn initialize(
    restore: &VirtualMachineRestore,
    ctx: &Context,
    source: &Source,
) -> Result<Action, Error> {
    let restores = match volume_restores(restore, &source.content.spec.volume_backups) {
        Ok(restores) => restores,
        Err(Error::Validation { message, .. }) => {
            report(restore, ctx, RestorePhase::InvalidSnapshot(message)).await?;
            return Ok(Action::requeue(ctx.resync));
        }
        Err(e) => return Err(e),
    };
    info!(volumes = restores.len(), "initializing restore");

    let mut status = restore.status.clone().unwrap_or_default();
    status.restores = restores;
    status.complete = Some(false);
    status.conditions = conditions_for(&RestorePhase::Initializing, &status.conditions);
    write_status(restore, ctx, status).await?;
    Ok(Action::requeue(ctx.resync))
}

async fn progress(
    restore: &VirtualMachineRestore,
    ctx: &Context,
    namespace: &str,
    source: &Source,
    target: &Target,
) -> Result<Action, Error> {
    let entries = restore.restores();
    let backups = &source.content.spec.volume_backups;
    if entries.len() != backups.len() {
        return Err(Error::internal_with_context(
            "reconciler",
            format!(
                "restore records {} volumes but the snapshot has {}",
                entries.len(),
                backups.len()
            ),
        ));
    }

    let mut claims = Vec::with_capacity(entries.len());
    let mut observed = Observed {
        target_updated: target.is_restored_by(&restore.restore_id()),
        update_prepared: update_prepared(restore),
        ..Default::default()
    };
    for entry in entries {
        let claim = ctx
            .kube
            .get_claim(namespace, &entry.persistent_claim_name)
            .await?;
        observed.claims.push(observe_claim(ctx, claim.as_ref()).await?);
        claims.push(claim);
    }
    if target.exists() && !observed.target_updated {
        observed.target_running = ctx
            .kube
            .virtual_machine_instance_exists(namespace, target.name())
            .await?;
    }

    let step = determine_progress_step(&observed);
    debug!(?step, "restore in progress");

    match step {
        ProgressStep::CreateClaims => create_claims(restore, ctx, namespace, source, &observed).await,
        ProgressStep::WaitForClaims => Ok(Action::requeue(ctx.resync)),
        ProgressStep::WaitForTarget => {
            report(restore, ctx, RestorePhase::WaitingForTarget).await?;
            Ok(Action::requeue(ctx.resync))
        }
        ProgressStep::LinkDataVolumes => {
            link_data_volumes(restore, ctx, namespace, source, target, &claims).await
        }
        ProgressStep::UpdateTarget => {
            let spec = restored_spec(&source.captured.spec, entries);
            match target
                .apply_restored_spec(ctx.kube.as_ref(), restore, &source.captured, spec)
                .await
            {
                Ok(()) => Ok(Action::requeue(ctx.resync)),
                Err(e) => invalid_machine(restore, ctx, e).await,
            }
        }
        ProgressStep::Finalize => finalize(restore, ctx, namespace, target).await,
    }
}

async fn observe_claim(
    ctx: &Context,
    claim: Option<&PersistentVolumeClaim>,
) -> Result<ClaimState, Error> {
    let Some(claim) = claim else {
        return Ok(ClaimState::Missing);
    };
    let bound = claim.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Bound");
    let class_name = claim.spec.as_ref().and_then(|s| s.storage_class_name.as_deref());
    let class = match class_name {
        Some(class_name) if !bound => ctx.kube.get_storage_class(class_name).await?,
        _ => None,
    };
    Ok(claim_state(claim, class.as_ref()))
}

async fn create_claims(
    restore: &VirtualMachineRestore,
    ctx: &Context,
    namespace: &str,
    source: &Source,
    observed: &Observed,
) -> Result<Action, Error> {
    for (entry, state) in restore.restores().iter().zip(&observed.claims) {
        if *state != ClaimState::Missing {
            continue;
        }
        let backup = source
            .content
            .volume_backup(&entry.volume_name)
            .ok_or_else(|| {
                Error::internal_with_context(
                    "storage",
                    format!("no volume backup for {}", entry.volume_name),
                )
            })?;

        let Some(volume_snapshot) = ctx
            .kube
            .get_volume_snapshot(namespace, &entry.snapshot_name)
            .await?
        else {
            let message = format!("VolumeSnapshot {namespace}/{} does not exist", entry.snapshot_name);
            report(restore, ctx, RestorePhase::ClaimCreationFailed(message)).await?;
            return Ok(Action::requeue(ctx.resync));
        };

        let claim = match build_claim(restore, entry, backup, &volume_snapshot) {
            Ok(claim) => claim,
            Err(Error::Validation { message, .. }) => {
                report(restore, ctx, RestorePhase::ClaimCreationFailed(message)).await?;
                return Ok(Action::requeue(ctx.resync));
            }
            Err(e) => return Err(e),
        };

        match ctx.kube.create_claim(namespace, &claim).await {
            Ok(()) => {
                info!(claim = %entry.persistent_claim_name, volume = %entry.volume_name, "created claim")
            }
            Err(e) if e.is_already_exists() => {
                debug!(claim = %entry.persistent_claim_name, "claim already exists")
            }
            Err(e) => {
                warn!(claim = %entry.persistent_claim_name, error = %e, "claim creation failed");
                let message = format!("failed to create PVC {}: {}", entry.persistent_claim_name, e);
                report(restore, ctx, RestorePhase::ClaimCreationFailed(message)).await?;
                return Ok(Action::requeue(ctx.resync));
            }
        }
    }

    report(restore, ctx, RestorePhase::CreatingClaims).await?;
    Ok(Action::requeue(ctx.resync))
}

async fn link_data_volumes(
    restore: &VirtualMachineRestore,
    ctx: &Context,
    namespace: &str,
    source: &Source,
    target: &Target,
    claims: &[Option<PersistentVolumeClaim>],
) -> Result<Action, Error> {
    let mut entries = restore.restores().to_vec();

    for (entry, claim) in entries.iter_mut().zip(claims) {
        let Some(claim) = claim else {
            continue;
        };
        let associated = associated_data_volume(claim);
        let linked = entry
            .data_volume_name
            .clone()
            .or_else(|| associated.clone())
            .or_else(|| {
                uses_data_volume_template(&source.captured.spec, &entry.volume_name)
                    .then(|| entry.persistent_claim_name.clone())
            });
        let Some(data_volume) = linked else {
            continue;
        };

        if let Some(dv) = ctx.kube.get_data_volume(namespace, &data_volume).await? {
            if dv.is_failed() {
                let message = format!("DataVolume {namespace}/{data_volume} has failed");
                warn!(%data_volume, "linked DataVolume failed");
                report(restore, ctx, RestorePhase::DataVolumeFailed(message)).await?;
                return Ok(Action::requeue(ctx.resync));
            }
        }

        if associated.is_none() {
            ctx.kube
                .annotate_claim(
                    namespace,
                    &entry.persistent_claim_name,
                    claim.resource_version(),
                    POPULATED_FOR_ANNOTATION,
                    &data_volume,
                )
                .await?;
            debug!(claim = %entry.persistent_claim_name, %data_volume, "linked claim to DataVolume");
        }
        entry.data_volume_name = Some(data_volume);
    }

    let spec = restored_spec(&source.captured.spec, &entries);
    if let Err(e) = target.check_restored_spec(restore, &source.captured, &spec) {
        return invalid_machine(restore, ctx, e).await;
    }
    let superseded = target.superseded_data_volumes(&spec);

    let mut status = restore.status.clone().unwrap_or_default();
    status.restores = entries;
    status.deleted_data_volumes = superseded;
    status.conditions = conditions_for(&RestorePhase::UpdatingTarget, &status.conditions);
    write_status(restore, ctx, status).await?;
    Ok(Action::requeue(ctx.resync))
}

/// Report a restored machine that patches broke; other errors propagate
async fn invalid_machine(
    restore: &VirtualMachineRestore,
    ctx: &Context,
    error: Error,
) -> Result<Action, Error> {
    match error {
        e @ (Error::Patch { .. } | Error::Validation { .. }) => {
            warn!(error = %e, "restored machine is invalid");
            report(restore, ctx, RestorePhase::InvalidPatch(e.to_string())).await?;
            Ok(Action::await_change())
        }
        e => Err(e),
    }
}

async fn finalize(
    restore: &VirtualMachineRestore,
    ctx: &Context,
    namespace: &str,
    target: &Target,
) -> Result<Action, Error> {
    let superseded = restore
        .status
        .as_ref()
        .map(|s| s.deleted_data_volumes.as_slice())
        .unwrap_or_default();
    Target::cleanup(ctx.kube.as_ref(), namespace, superseded).await?;

    let mut status = restore.status.clone().unwrap_or_default();
    status.complete = Some(true);
    status.restore_time = Some(Utc::now());
    status.conditions = conditions_for(&RestorePhase::Complete, &status.conditions);
    write_status(restore, ctx, status).await?;
    info!(vm = %target.name(), "restore complete");

    ctx.events
        .publish(
            &restore.object_ref(&()),
            EventType::Normal,
            event_reasons::RESTORE_COMPLETE,
            actions::RESTORE,
            Some(format!(
                "Successfully completed VirtualMachineRestore {}",
                restore.name_any()
            )),
        )
        .await;

    let mut target = target.clone();
    target
        .unlock(ctx.kube.as_ref(), namespace, &restore.name_any())
        .await?;
    Ok(Action::await_change())
}

/// Record `phase` in the restore's conditions
///
/// Error phases also emit a Warning event when the status changes.
async fn report(
    restore: &VirtualMachineRestore,
    ctx: &Context,
    phase: RestorePhase,
) -> Result<(), Error> {
    let mut status = restore.status.clone().unwrap_or_default();
    status.complete.get_or_insert(false);
    status.conditions = conditions_for(&phase, &status.conditions);

    let written = write_status(restore, ctx, status).await?;
    if written && phase.is_error() {
        let (message, _) = phase.messages();
        ctx.events
            .publish(
                &restore.object_ref(&()),
                EventType::Warning,
                event_reasons::RESTORE_ERROR,
                actions::RECONCILE,
                Some(message),
            )
            .await;
    }
    Ok(())
}

/// Write `status` unless it equals the stored one; returns true if written
async fn write_status(
    restore: &VirtualMachineRestore,
    ctx: &Context,
    status: VirtualMachineRestoreStatus,
) -> Result<bool, Error> {
    if restore.status.as_ref() == Some(&status) {
        debug!("status unchanged");
        return Ok(false);
    }
    ctx.kube
        .patch_restore_status(
            &restore.namespace().unwrap_or_default(),
            &restore.name_any(),
            restore.resource_version(),
            &status,
        )
        .await?;
    Ok(true)
}
