//! Content-side reconciler

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::ResourceExt;
use lattice_common::crd::{DeletionPolicy, VolumeSnapshotContent, VOLUME_SNAPSHOT_CONTENT_FINALIZER};
use lattice_common::events::{actions, reasons};
use lattice_common::kube_utils::{add_finalizer, has_finalizer, is_being_deleted, remove_finalizer};
use lattice_common::{Error, Result};
use tracing::{debug, info, instrument, warn};

use super::Context;
use crate::binding::is_bound;
use crate::class::get_snapshot_class;
use crate::credentials::{get_credentials, get_secret_reference};
use crate::operations::ScheduleOutcome;

impl Context {
    /// One pass of the content state machine
    #[instrument(skip(self, content), fields(content = %content.name_any()))]
    pub(crate) async fn sync_content(
        self: &Arc<Self>,
        content: &VolumeSnapshotContent,
    ) -> Result<()> {
        let guarded = has_finalizer(&content.metadata, VOLUME_SNAPSHOT_CONTENT_FINALIZER);
        let deleting = is_being_deleted(&content.metadata);

        if deleting && guarded && !self.is_content_in_use(content).await? {
            return self.remove_content_finalizer(content).await;
        }
        if !deleting && !guarded {
            return self.add_content_finalizer(content).await;
        }

        let Some(reference) = content.spec.volume_snapshot_ref.as_ref() else {
            debug!("content is not bound to any snapshot");
            self.content_warning(
                content,
                reasons::SNAPSHOT_CONTENT_NOT_BOUND,
                actions::RECONCILE,
                "VolumeSnapshotContent is not bound to any VolumeSnapshot",
            )
            .await;
            return Ok(());
        };

        let ref_uid = reference.uid.as_deref().unwrap_or_default();
        if ref_uid.is_empty() {
            debug!("content is reserved for a snapshot that has not bound yet");
            return Ok(());
        }

        let snapshot_key = content.snapshot_key().unwrap_or_default();
        let snapshot = self
            .snapshots
            .get(&snapshot_key)
            .filter(|s| s.uid().as_deref() == Some(ref_uid));
        if snapshot.is_none() {
            debug!(snapshot = %snapshot_key, "bound snapshot is gone or was recreated");
            self.apply_deletion_policy(content).await;
        }
        Ok(())
    }

    /// Whether a live snapshot is bound to `content`
    async fn is_content_in_use(&self, content: &VolumeSnapshotContent) -> Result<bool> {
        let Some(reference) = content.spec.volume_snapshot_ref.as_ref() else {
            return Ok(false);
        };
        let name = reference.name.as_deref().unwrap_or_default();
        let namespace = reference.namespace.as_deref().unwrap_or_default();
        if name.is_empty() {
            return Ok(false);
        }
        let Some(snapshot) = self.api.get_snapshot(namespace, name).await? else {
            return Ok(false);
        };
        Ok(is_bound(&snapshot, content))
    }

    async fn add_content_finalizer(&self, content: &VolumeSnapshotContent) -> Result<()> {
        let mut updated = content.clone();
        add_finalizer(&mut updated.metadata, VOLUME_SNAPSHOT_CONTENT_FINALIZER);
        let persisted = self.api.update_content(&updated).await?;
        self.contents.upsert(&persisted)?;
        debug!("added content finalizer");
        Ok(())
    }

    async fn remove_content_finalizer(&self, content: &VolumeSnapshotContent) -> Result<()> {
        let mut updated = content.clone();
        remove_finalizer(&mut updated.metadata, VOLUME_SNAPSHOT_CONTENT_FINALIZER);
        let persisted = self.api.update_content(&updated).await?;
        self.contents.upsert(&persisted)?;
        info!("removed content finalizer");
        Ok(())
    }

    /// Act on an orphaned content according to its deletion policy
    async fn apply_deletion_policy(self: &Arc<Self>, content: &VolumeSnapshotContent) {
        match content.deletion_policy() {
            DeletionPolicy::Retain => {
                debug!("deletion policy is Retain, nothing to do");
            }
            DeletionPolicy::Delete => {
                let name = format!(
                    "delete-{}[{}]",
                    content.name_any(),
                    content.uid().unwrap_or_default()
                );
                let ctx = self.clone();
                let target = content.clone();
                if let ScheduleOutcome::Started = self
                    .operations
                    .run(name, async move { ctx.delete_content_operation(&target).await })
                {
                    info!("scheduled backend snapshot deletion");
                }
            }
            DeletionPolicy::Unsupported(policy) => {
                warn!(policy = %policy, "unrecognized deletion policy");
                self.content_warning(
                    content,
                    reasons::SNAPSHOT_UNKNOWN_DELETION_POLICY,
                    actions::DELETE,
                    "Volume Snapshot Content has unrecognized deletion policy",
                )
                .await;
            }
        }
    }

    /// Delete the backend snapshot, then the content object
    async fn delete_content_operation(&self, content: &VolumeSnapshotContent) -> Result<()> {
        let mut credentials = BTreeMap::new();
        if let Some(class_name) = content.class_name() {
            // the class may be gone by now; delete without credentials then
            if let Ok(class) = get_snapshot_class(self.api.as_ref(), class_name).await {
                let parameters = class.parameters.unwrap_or_default();
                let secret = get_secret_reference(&parameters, &content.name_any(), None)?;
                credentials = get_credentials(self.api.as_ref(), secret.as_ref()).await?;
            }
        }

        if let Err(e) = self.handler.delete(content, &credentials).await {
            self.content_warning(
                content,
                reasons::SNAPSHOT_DELETE_ERROR,
                actions::DELETE,
                "Failed to delete snapshot",
            )
            .await;
            return Err(Error::driver(
                content.name_any(),
                format!("failed to delete snapshot {}, err: {}", content.name_any(), e),
            ));
        }

        match self.api.delete_content(&content.name_any()).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                self.content_warning(
                    content,
                    reasons::SNAPSHOT_CONTENT_OBJECT_DELETE_ERROR,
                    actions::DELETE,
                    "Failed to delete snapshot content API object",
                )
                .await;
                return Err(Error::internal_with_context(
                    "delete",
                    format!(
                        "failed to delete VolumeSnapshotContent {} from API server: {}",
                        content.name_any(),
                        e
                    ),
                ));
            }
        }
        info!(content = %content.name_any(), "deleted backend snapshot and content");
        Ok(())
    }
}
