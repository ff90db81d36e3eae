//! Driver-facing operations scheduled by the snapshot reconciler
//!
//! Both run on the operation registry, never on a queue worker:
//!
//! * create: cut the backend snapshot, record its creation time, create the
//!   content for it and point the snapshot at that content
//! * check: for a snapshot bound to content, ask the driver whether the
//!   snapshot is usable and publish readiness and size

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolume};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use lattice_common::crd::{
    CsiVolumeSnapshotSource, DeletionPolicy, VolumeSnapshot, VolumeSnapshotClass,
    VolumeSnapshotContent, VolumeSnapshotContentSpec,
};
use lattice_common::events::{actions, reasons, Warning};
use lattice_common::retry::{with_retries, RetryConfig};
use lattice_common::{Error, Result};
use tracing::{debug, error, info, warn};

use super::Context;
use crate::binding::{content_name_for, is_bound};
use crate::class::get_snapshot_class;
use crate::credentials::{get_credentials, get_secret_reference};
use crate::source::get_volume;

/// Everything a driver create call needs
struct CreateInputs {
    class: VolumeSnapshotClass,
    volume: PersistentVolume,
    content_name: String,
    credentials: BTreeMap<String, String>,
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

fn time_from_nanos(nanos: i64) -> Time {
    Time(DateTime::<Utc>::from_timestamp_nanos(nanos))
}

impl Context {
    fn bounded_retry(&self) -> RetryConfig {
        RetryConfig::fixed(
            self.config.create_content_retry_count,
            self.config.create_content_retry_interval(),
        )
    }

    async fn get_create_inputs(&self, snapshot: &VolumeSnapshot) -> Result<CreateInputs> {
        let class_name = snapshot.class_name().ok_or_else(|| {
            Error::validation_for_field(
                snapshot.key(),
                "spec.snapshotClassName",
                format!(
                    "failed to take snapshot {} without a snapshot class",
                    snapshot.name_any()
                ),
            )
        })?;
        let class = get_snapshot_class(self.api.as_ref(), class_name).await?;
        let volume = get_volume(self.api.as_ref(), snapshot).await?;

        let content_name = snapshot
            .content_name()
            .map(str::to_string)
            .unwrap_or_else(|| content_name_for(snapshot));

        let parameters = class.parameters.clone().unwrap_or_default();
        let secret = get_secret_reference(&parameters, &content_name, Some(snapshot))?;
        let credentials = get_credentials(self.api.as_ref(), secret.as_ref()).await?;

        Ok(CreateInputs {
            class,
            volume,
            content_name,
            credentials,
        })
    }

    /// Cut the backend snapshot and create its content
    pub(crate) async fn create_snapshot_operation(
        &self,
        snapshot: &VolumeSnapshot,
    ) -> Result<VolumeSnapshot> {
        let key = snapshot.key();
        let inputs = self.get_create_inputs(snapshot).await.map_err(|e| {
            Error::validation_for(
                &key,
                format!(
                    "failed to get input parameters to create snapshot {}: {}",
                    snapshot.name_any(),
                    e
                ),
            )
        })?;
        let parameters = inputs.class.parameters.clone().unwrap_or_default();

        let created = self
            .handler
            .create(snapshot, &inputs.volume, &parameters, &inputs.credentials)
            .await
            .map_err(|e| {
                let message = format!(
                    "failed to take snapshot of the volume, {}: {}",
                    inputs.volume.name_any(),
                    e
                );
                driver_failure(&key, &e, message)
            })?;
        let creation_time = if created.creation_time == 0 {
            now_nanos()
        } else {
            created.creation_time
        };
        info!(
            snapshot = %key,
            handle = %created.snapshot_handle,
            size_bytes = created.size_bytes,
            "driver created snapshot"
        );

        let retry = self.bounded_retry();
        let ctx: &Context = self;
        let (ready, size) = (created.ready_to_use, created.size_bytes);
        let updated = with_retries(&retry, "update snapshot status", move || {
            ctx.update_snapshot_status(snapshot, ready, creation_time, size, false)
        })
        .await
        .map_err(|e| match e {
            Error::ControllerUpdate { .. } => e,
            other => Error::controller_update(&key, other.to_string()),
        })?;

        let content = VolumeSnapshotContent::new(
            &inputs.content_name,
            VolumeSnapshotContentSpec {
                csi_volume_snapshot_source: Some(CsiVolumeSnapshotSource {
                    driver: created.driver.clone(),
                    snapshot_handle: created.snapshot_handle.clone(),
                    creation_time: Some(creation_time),
                    restore_size: Some(created.size_bytes),
                }),
                volume_snapshot_ref: Some(snapshot_reference(&updated)),
                persistent_volume_ref: Some(volume_reference(&inputs.volume)),
                snapshot_class_name: Some(inputs.class.name_any()),
                deletion_policy: Some(
                    inputs
                        .class
                        .deletion_policy
                        .clone()
                        .unwrap_or(DeletionPolicy::Delete),
                ),
            },
        );

        let created_content = with_retries(&retry, "create snapshot content", || {
            let api = self.api.clone();
            let content = content.clone();
            async move {
                match api.create_content(&content).await {
                    Ok(_) => Ok(()),
                    Err(e) if e.is_already_exists() => {
                        debug!(content = %content.name_any(), "content already exists");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
        })
        .await;
        if let Err(e) = created_content {
            let message = format!(
                "Error creating volume snapshot content object for snapshot {}: {}.",
                key, e
            );
            error!(snapshot = %key, error = %e, "failed to create content");
            self.events
                .publish(
                    &updated.object_ref(&()),
                    Warning::new(
                        reasons::CREATE_SNAPSHOT_CONTENT_FAILED,
                        actions::CREATE,
                        message,
                    ),
                )
                .await;
            return Err(Error::controller_update(&key, e.to_string()));
        }

        self.bind_and_update_snapshot(&content, &updated).await
    }

    /// Refresh readiness of a snapshot bound to `content`
    pub(crate) async fn check_bound_snapshot_status(
        &self,
        snapshot: &VolumeSnapshot,
        content: &VolumeSnapshotContent,
    ) -> Result<VolumeSnapshot> {
        let key = snapshot.key();
        let (ready, creation_time, size) = if snapshot.spec.source.is_none() {
            debug!(
                snapshot = %key,
                content = %content.name_any(),
                "checking pre-bound snapshot"
            );
            let status = self.handler.status(content).await.map_err(|e| {
                let message = format!(
                    "failed to check snapshot status {} with error {}",
                    snapshot.name_any(),
                    e
                );
                driver_failure(&key, &e, message)
            })?;
            (status.ready_to_use, status.creation_time, status.size_bytes)
        } else {
            let inputs = self.get_create_inputs(snapshot).await.map_err(|e| {
                Error::validation_for(
                    &key,
                    format!(
                        "failed to get input parameters to create snapshot {}: {}",
                        snapshot.name_any(),
                        e
                    ),
                )
            })?;
            let parameters = inputs.class.parameters.clone().unwrap_or_default();
            let created = self
                .handler
                .create(snapshot, &inputs.volume, &parameters, &inputs.credentials)
                .await
                .map_err(|e| {
                    let message = format!(
                        "failed to check snapshot status {} with error {}",
                        snapshot.name_any(),
                        e
                    );
                    driver_failure(&key, &e, message)
                })?;
            (created.ready_to_use, created.creation_time, created.size_bytes)
        };
        let creation_time = if creation_time == 0 {
            now_nanos()
        } else {
            creation_time
        };

        let bound = is_bound(snapshot, content);
        let updated = self
            .update_snapshot_status(snapshot, ready, creation_time, size, bound)
            .await?;
        self.update_content_size(content, size).await?;
        Ok(updated)
    }

    /// Merge driver-reported state into the live snapshot's status
    ///
    /// Readiness is only recorded for a bound pair and clears any recorded
    /// error; the creation time is written once. A positive size replaces
    /// whatever size was recorded before.
    async fn update_snapshot_status(
        &self,
        snapshot: &VolumeSnapshot,
        ready: bool,
        creation_time: i64,
        size: i64,
        bound: bool,
    ) -> Result<VolumeSnapshot> {
        let key = snapshot.key();
        let live = self
            .api
            .get_snapshot(&snapshot.namespace().unwrap_or_default(), &snapshot.name_any())
            .await?
            .ok_or_else(|| Error::not_found("VolumeSnapshot", &key))?;

        let mut updated = live.clone();
        let status = updated.status.get_or_insert_with(Default::default);
        let mut changed = false;
        if bound && ready && !status.ready_to_use {
            status.ready_to_use = true;
            status.error = None;
            changed = true;
        }
        if status.creation_time.is_none() {
            status.creation_time = Some(time_from_nanos(creation_time));
            changed = true;
        }
        let size_changed = status
            .restore_size
            .as_ref()
            .map_or(true, |q| q.0 != size.to_string());
        if size > 0 && size_changed {
            status.restore_size = Some(Quantity(size.to_string()));
            changed = true;
        }
        if !changed {
            return Ok(live);
        }

        let persisted = self
            .api
            .update_snapshot_status(&updated)
            .await
            .map_err(|e| Error::controller_update(&key, e.to_string()))?;
        if let Err(e) = self.snapshots.upsert(&persisted) {
            warn!(snapshot = %key, error = %e, "failed to refresh snapshot cache");
        }
        debug!(snapshot = %key, ready = persisted.is_ready(), "updated snapshot status");
        Ok(persisted)
    }

    /// Record a newly reported restore size on the content
    async fn update_content_size(
        &self,
        content: &VolumeSnapshotContent,
        size: i64,
    ) -> Result<()> {
        if size <= 0 {
            return Ok(());
        }
        let name = content.name_any();
        let live = self.api.get_content(&name).await?.unwrap_or_else(|| content.clone());
        let Some(csi) = live.spec.csi_volume_snapshot_source.as_ref() else {
            return Ok(());
        };
        if csi.restore_size == Some(size) {
            return Ok(());
        }

        let mut updated = live.clone();
        if let Some(csi) = updated.spec.csi_volume_snapshot_source.as_mut() {
            csi.restore_size = Some(size);
        }
        let persisted = self
            .api
            .update_content(&updated)
            .await
            .map_err(|e| Error::controller_update(&name, e.to_string()))?;
        if let Err(e) = self.contents.upsert(&persisted) {
            warn!(content = %name, error = %e, "failed to refresh content cache");
        }
        Ok(())
    }
}

/// Re-describe a driver failure without changing whether it is retryable
fn driver_failure(key: &str, cause: &Error, message: String) -> Error {
    Error::Driver {
        object: key.to_string(),
        message,
        retryable: cause.is_retryable(),
    }
}

/// Reference from a content to the snapshot it was created for
fn snapshot_reference(snapshot: &VolumeSnapshot) -> ObjectReference {
    ObjectReference {
        api_version: Some(VolumeSnapshot::api_version(&()).to_string()),
        kind: Some(VolumeSnapshot::kind(&()).to_string()),
        namespace: snapshot.namespace(),
        name: Some(snapshot.name_any()),
        uid: snapshot.uid(),
        resource_version: snapshot.resource_version(),
        ..Default::default()
    }
}

fn volume_reference(volume: &PersistentVolume) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("PersistentVolume".to_string()),
        name: Some(volume.name_any()),
        uid: volume.uid(),
        resource_version: volume.resource_version(),
        ..Default::default()
    }
}
