//! Snapshot-side reconciler

use std::sync::Arc;

use kube::ResourceExt;
use lattice_common::crd::{VolumeSnapshot, VolumeSnapshotContent, VOLUME_SNAPSHOT_FINALIZER};
use lattice_common::error::{is_retryable_status_error, DRIVER_RETRY_MSG};
use lattice_common::events::reasons;
use lattice_common::kube_utils::{
    add_finalizer, has_finalizer, is_being_deleted, remove_finalizer,
};
use lattice_common::{Error, Result};
use tracing::{debug, info, instrument, warn};

use super::Context;
use crate::binding::{check_and_bind, find_matching_content, is_bound};
use crate::operations::ScheduleOutcome;
use crate::source::is_volume_being_created_from_snapshot;

impl Context {
    /// One pass of the snapshot state machine
    #[instrument(skip(self, snapshot), fields(snapshot = %snapshot.key()))]
    pub(crate) async fn sync_snapshot(self: &Arc<Self>, snapshot: &VolumeSnapshot) -> Result<()> {
        let guarded = has_finalizer(&snapshot.metadata, VOLUME_SNAPSHOT_FINALIZER);
        let deleting = is_being_deleted(&snapshot.metadata);

        if deleting
            && guarded
            && !is_volume_being_created_from_snapshot(self.api.as_ref(), snapshot).await?
        {
            return self.remove_snapshot_finalizer(snapshot).await;
        }
        if !deleting && !guarded {
            return self.add_snapshot_finalizer(snapshot).await;
        }

        if snapshot.is_ready() {
            self.sync_ready_snapshot(snapshot).await
        } else {
            self.sync_unready_snapshot(snapshot).await
        }
    }

    /// Health check of a snapshot already reported ready
    async fn sync_ready_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<()> {
        let Some(content_name) = snapshot.content_name() else {
            return self
                .update_error_status(
                    snapshot,
                    reasons::SNAPSHOT_LOST,
                    "Bound snapshot has lost reference to VolumeSnapshotContent".to_string(),
                )
                .await;
        };
        let Some(content) = self.contents.get(content_name) else {
            return self
                .update_error_status(
                    snapshot,
                    reasons::SNAPSHOT_CONTENT_MISSING,
                    "VolumeSnapshotContent is missing".to_string(),
                )
                .await;
        };
        if !is_bound(snapshot, &content) {
            return self
                .update_error_status(
                    snapshot,
                    reasons::SNAPSHOT_MISBOUND,
                    "VolumeSnapshotContent is not bound to the VolumeSnapshot correctly"
                        .to_string(),
                )
                .await;
        }
        Ok(())
    }

    /// Provisioning pass of a snapshot not yet ready
    async fn sync_unready_snapshot(self: &Arc<Self>, snapshot: &VolumeSnapshot) -> Result<()> {
        let key = snapshot.key();

        if let Some(content_name) = snapshot.content_name() {
            let Some(content) = self.contents.get(content_name) else {
                self.update_error_status(
                    snapshot,
                    reasons::SNAPSHOT_CONTENT_MISSING,
                    "VolumeSnapshotContent is missing".to_string(),
                )
                .await?;
                return Err(Error::not_found(
                    "VolumeSnapshotContent",
                    format!("{} (bound to snapshot {})", content_name, key),
                ));
            };

            let bound = check_and_bind(self.api.as_ref(), &self.contents, snapshot, &content).await;
            let content = match bound {
                Ok(content) => content,
                Err(e) => {
                    self.update_error_status(
                        snapshot,
                        reasons::SNAPSHOT_BIND_FAILED,
                        format!("Snapshot failed to bind VolumeSnapshotContent, {}", e),
                    )
                    .await?;
                    return Err(Error::validation_for(
                        &key,
                        format!(
                            "snapshot {} is bound, but VolumeSnapshotContent {} is not bound \
                             to the VolumeSnapshot correctly, {}",
                            key,
                            content.name_any(),
                            e
                        ),
                    ));
                }
            };

            self.schedule_check(snapshot, content);
            return Ok(());
        }

        if let Some(content) = find_matching_content(&self.contents, snapshot) {
            debug!(content = %content.name_any(), "found content reserved for snapshot");
            self.bind_and_update_snapshot(&content, snapshot).await?;
            return Ok(());
        }

        let retryable = snapshot
            .status_error()
            .map_or(true, is_retryable_status_error);
        if !retryable {
            debug!("snapshot carries a terminal error, not creating");
            return Ok(());
        }
        self.schedule_create(snapshot);
        Ok(())
    }

    fn schedule_create(self: &Arc<Self>, snapshot: &VolumeSnapshot) {
        let name = format!("create-{}[{}]", snapshot.key(), snapshot.uid().unwrap_or_default());
        let ctx = self.clone();
        let target = snapshot.clone();
        let outcome = self.operations.run(name, async move {
            match ctx.create_snapshot_operation(&target).await {
                Ok(_) => Ok(()),
                Err(e) => {
                    ctx.update_error_status(
                        &target,
                        reasons::SNAPSHOT_CREATION_FAILED,
                        creation_failure_message(&e),
                    )
                    .await?;
                    Err(e)
                }
            }
        });
        if outcome == ScheduleOutcome::Started {
            info!("scheduled snapshot creation");
        }
    }

    fn schedule_check(
        self: &Arc<Self>,
        snapshot: &VolumeSnapshot,
        content: VolumeSnapshotContent,
    ) {
        let name = format!("check-{}[{}]", snapshot.key(), snapshot.uid().unwrap_or_default());
        let ctx = self.clone();
        let target = snapshot.clone();
        self.operations.run(name, async move {
            match ctx.check_bound_snapshot_status(&target, &content).await {
                Ok(updated) => {
                    if let Err(e) = ctx.snapshots.upsert(&updated) {
                        warn!(
                            snapshot = %updated.key(),
                            error = %e,
                            "failed to refresh snapshot cache"
                        );
                    }
                    Ok(())
                }
                Err(e) => {
                    ctx.update_error_status(
                        &target,
                        reasons::SNAPSHOT_CHECK_AND_UPDATE_FAILED,
                        format!("Failed to check and update snapshot: {}", e),
                    )
                    .await?;
                    Err(e)
                }
            }
        });
    }

    /// Point the live snapshot at `content`
    pub(crate) async fn bind_and_update_snapshot(
        &self,
        content: &VolumeSnapshotContent,
        snapshot: &VolumeSnapshot,
    ) -> Result<VolumeSnapshot> {
        let key = snapshot.key();
        let live = self
            .api
            .get_snapshot(&snapshot.namespace().unwrap_or_default(), &snapshot.name_any())
            .await?
            .ok_or_else(|| Error::not_found("VolumeSnapshot", &key))?;

        let content_name = content.name_any();
        if live.content_name() == Some(content_name.as_str()) {
            debug!(
                snapshot = %key,
                content = %content_name,
                "snapshot already points at content"
            );
            return Ok(live);
        }

        let mut updated = live;
        updated.spec.snapshot_content_name = Some(content_name.clone());
        let persisted = self
            .api
            .update_snapshot(&updated)
            .await
            .map_err(|e| Error::controller_update(&key, e.to_string()))?;
        if let Err(e) = self.snapshots.upsert(&persisted) {
            warn!(snapshot = %key, error = %e, "failed to refresh snapshot cache");
        }
        info!(snapshot = %key, content = %content_name, "bound snapshot to content");
        Ok(persisted)
    }

    async fn add_snapshot_finalizer(&self, snapshot: &VolumeSnapshot) -> Result<()> {
        let mut updated = snapshot.clone();
        add_finalizer(&mut updated.metadata, VOLUME_SNAPSHOT_FINALIZER);
        let persisted = self.api.update_snapshot(&updated).await?;
        self.snapshots.upsert(&persisted)?;
        debug!("added snapshot finalizer");
        Ok(())
    }

    async fn remove_snapshot_finalizer(&self, snapshot: &VolumeSnapshot) -> Result<()> {
        let mut updated = snapshot.clone();
        remove_finalizer(&mut updated.metadata, VOLUME_SNAPSHOT_FINALIZER);
        let persisted = self.api.update_snapshot(&updated).await?;
        self.snapshots.upsert(&persisted)?;
        info!("removed snapshot finalizer");
        Ok(())
    }
}

/// Status message for a failed create operation
///
/// Driver failures that may clear on their own are marked so the next pass
/// schedules creation again. Persistence failures already carry their marker.
fn creation_failure_message(e: &Error) -> String {
    match e {
        Error::Driver {
            retryable: true, ..
        } => format!("Failed to create snapshot: {}: {}", DRIVER_RETRY_MSG, e),
        _ => format!("Failed to create snapshot: {}", e),
    }
}
