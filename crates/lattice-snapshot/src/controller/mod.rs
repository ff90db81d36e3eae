//! Snapshot binding controller
//!
//! Two queues, one per kind, feed a fixed pool of workers. Each worker
//! resolves its key against the API server, then hands the live object to
//! the content-side ([`content`]) or snapshot-side ([`snapshot`]) reconciler.
//! Driver calls never happen on a worker: the reconcilers schedule them as
//! named operations ([`create`]) on the [`OperationRegistry`].
//!
//! Neither side assumes the other ran first. The empty-UID reservation on a
//! content and the UID comparison on orphan detection are what keep the two
//! loops consistent without any cross-object lock.

mod content;
mod create;
mod snapshot;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use k8s_openapi::api::storage::v1::VolumeError;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use lattice_common::crd::{VolumeSnapshot, VolumeSnapshotClass, VolumeSnapshotContent};
use lattice_common::events::{actions, reasons, EventPublisher, NoopEventPublisher, Warning};
use lattice_common::kube_utils::is_being_deleted;
use lattice_common::{Error, Result};
use tracing::{debug, error, info, instrument, warn};

use crate::api::SnapshotApi;
use crate::cache::{split_key, ObjectCache};
use crate::class::{get_snapshot_class, set_default_snapshot_class};
use crate::config::ControllerConfig;
use crate::driver::{DriverHandler, SnapshotDriver};
use crate::operations::OperationRegistry;
use crate::queue::WorkQueue;

/// Shared state of one controller instance
///
/// Everything a reconcile pass touches hangs off this struct; nothing is
/// process-global, so several instances can run side by side in one test.
pub struct Context {
    /// Persistence boundary
    pub api: Arc<dyn SnapshotApi>,
    /// Driver wrapper
    pub handler: DriverHandler,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Runtime settings
    pub config: ControllerConfig,
    /// Mirror of VolumeSnapshots keyed `namespace/name`
    pub snapshots: ObjectCache<VolumeSnapshot>,
    /// Mirror of VolumeSnapshotContents keyed by name
    pub contents: ObjectCache<VolumeSnapshotContent>,
    /// Keys of snapshots to reconcile
    pub snapshot_queue: WorkQueue,
    /// Keys of contents to reconcile
    pub content_queue: WorkQueue,
    /// In-flight driver operations
    pub operations: OperationRegistry,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(
        api: Arc<dyn SnapshotApi>,
        driver: Arc<dyn SnapshotDriver>,
        config: ControllerConfig,
    ) -> ContextBuilder {
        ContextBuilder::new(api, driver, config)
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```text
/// let ctx = Context::builder(api, driver, config)
///     .events(publisher)
///     .build();
/// ```
pub struct ContextBuilder {
    api: Arc<dyn SnapshotApi>,
    driver: Arc<dyn SnapshotDriver>,
    config: ControllerConfig,
    events: Option<Arc<dyn EventPublisher>>,
    operations: Option<OperationRegistry>,
    snapshot_queue: Option<WorkQueue>,
    content_queue: Option<WorkQueue>,
}

impl ContextBuilder {
    fn new(
        api: Arc<dyn SnapshotApi>,
        driver: Arc<dyn SnapshotDriver>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            api,
            driver,
            config,
            events: None,
            operations: None,
            snapshot_queue: None,
            content_queue: None,
        }
    }

    /// Set the event publisher (defaults to a no-op publisher)
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the operation registry (primarily for testing backoff)
    pub fn operations(mut self, operations: OperationRegistry) -> Self {
        self.operations = Some(operations);
        self
    }

    /// Override both work queues
    pub fn queues(mut self, snapshot_queue: WorkQueue, content_queue: WorkQueue) -> Self {
        self.snapshot_queue = Some(snapshot_queue);
        self.content_queue = Some(content_queue);
        self
    }

    /// Build the Context
    pub fn build(self) -> Arc<Context> {
        let handler = DriverHandler::new(
            self.driver,
            self.config.driver_timeout(),
            self.config.snapshot_name_prefix.clone(),
            self.config.snapshot_name_uuid_length,
        );
        Arc::new(Context {
            api: self.api,
            handler,
            events: self
                .events
                .unwrap_or_else(|| Arc::new(NoopEventPublisher)),
            config: self.config,
            snapshots: ObjectCache::new(),
            contents: ObjectCache::new(),
            snapshot_queue: self
                .snapshot_queue
                .unwrap_or_else(|| WorkQueue::new("snapshot")),
            content_queue: self
                .content_queue
                .unwrap_or_else(|| WorkQueue::new("content")),
            operations: self.operations.unwrap_or_default(),
        })
    }
}

/// Apply the requeue policy to the outcome of one key
fn settle(queue: &WorkQueue, key: &str, result: Result<()>) {
    match result {
        Ok(()) => queue.forget(key),
        Err(e) if e.is_conflict() => {
            // the write that raced us produces its own watch event
            debug!(
                queue = queue.name(),
                key = %key,
                error = %e,
                "version conflict, waiting for next event"
            );
            queue.forget(key);
        }
        Err(e) => {
            warn!(queue = queue.name(), key = %key, error = %e, "reconcile failed, requeueing");
            queue.add_rate_limited(key);
        }
    }
}

type Caught = std::result::Result<Result<()>, Box<dyn std::any::Any + Send>>;

fn caught(key: &str, outcome: Caught) -> Result<()> {
    outcome.unwrap_or_else(|_| {
        Err(Error::internal_with_context(
            "worker",
            format!("reconcile of {} panicked", key),
        ))
    })
}

impl Context {
    /// Pop snapshot keys until the queue shuts down
    pub async fn run_snapshot_worker(self: Arc<Self>) {
        while let Some(key) = self.snapshot_queue.get().await {
            let outcome = AssertUnwindSafe(self.process_snapshot_key(&key))
                .catch_unwind()
                .await;
            settle(&self.snapshot_queue, &key, caught(&key, outcome));
            self.snapshot_queue.done(&key);
        }
        debug!("snapshot worker stopped");
    }

    /// Pop content keys until the queue shuts down
    pub async fn run_content_worker(self: Arc<Self>) {
        while let Some(key) = self.content_queue.get().await {
            let outcome = AssertUnwindSafe(self.process_content_key(&key))
                .catch_unwind()
                .await;
            settle(&self.content_queue, &key, caught(&key, outcome));
            self.content_queue.done(&key);
        }
        debug!("content worker stopped");
    }

    /// Reconcile the snapshot stored under `key`
    #[instrument(skip(self, key), fields(snapshot = %key))]
    pub async fn process_snapshot_key(self: &Arc<Self>, key: &str) -> Result<()> {
        let (namespace, name) = split_key(key);
        match self
            .api
            .get_snapshot(namespace.unwrap_or_default(), name)
            .await?
        {
            Some(live) if is_being_deleted(&live.metadata) => {
                if !self.may_release(&live).await? {
                    return Ok(());
                }
                self.update_snapshot(live).await
            }
            Some(live) => {
                let Some(snapshot) = self.check_and_update_snapshot_class(live).await? else {
                    return Ok(());
                };
                self.update_snapshot(snapshot).await
            }
            None => {
                let Some(last) = self.snapshots.delete(key) else {
                    debug!("snapshot already gone");
                    return Ok(());
                };
                info!("snapshot deleted");
                if let Some(content_name) = last.content_name() {
                    self.content_queue.add(content_name);
                }
                Ok(())
            }
        }
    }

    /// Reconcile the content stored under `key`
    #[instrument(skip(self, key), fields(content = %key))]
    pub async fn process_content_key(self: &Arc<Self>, key: &str) -> Result<()> {
        match self.api.get_content(key).await? {
            Some(live) => {
                if !self.is_driver_match(&live).await {
                    debug!("content belongs to another driver, skipping");
                    return Ok(());
                }
                if !self.contents.upsert(&live)? {
                    return Ok(());
                }
                self.sync_content(&live).await
            }
            None => {
                let Some(last) = self.contents.delete(key) else {
                    debug!("content already gone");
                    return Ok(());
                };
                info!("content deleted");
                if let Some(snapshot_key) = last.snapshot_key() {
                    self.snapshot_queue.add(snapshot_key);
                }
                Ok(())
            }
        }
    }

    async fn update_snapshot(self: &Arc<Self>, snapshot: VolumeSnapshot) -> Result<()> {
        if !self.snapshots.upsert(&snapshot)? {
            return Ok(());
        }
        self.sync_snapshot(&snapshot).await
    }

    /// Whether this controller's driver owns `content`
    async fn is_driver_match(&self, content: &VolumeSnapshotContent) -> bool {
        let Some(csi) = content.spec.csi_volume_snapshot_source.as_ref() else {
            return false;
        };
        if csi.driver != self.config.driver_name {
            return false;
        }
        let Some(class_name) = content.class_name() else {
            return true;
        };
        match self.api.get_class(class_name).await {
            Ok(Some(class)) => class.snapshotter == self.config.driver_name,
            Ok(None) => true,
            Err(e) => {
                debug!(
                    content = %content.name_any(),
                    error = %e,
                    "class lookup failed, matching on driver only"
                );
                true
            }
        }
    }

    /// Resolve the snapshot's class, filling in the default when unnamed
    ///
    /// Returns `None` when the class belongs to another driver or could not
    /// be resolved; resolution failures are recorded on the snapshot status.
    async fn check_and_update_snapshot_class(
        &self,
        snapshot: VolumeSnapshot,
    ) -> Result<Option<VolumeSnapshot>> {
        let (class, snapshot) = match snapshot.class_name() {
            Some(name) => match get_snapshot_class(self.api.as_ref(), name).await {
                Ok(class) => (class, snapshot),
                Err(e) => {
                    self.update_error_status(
                        &snapshot,
                        reasons::GET_SNAPSHOT_CLASS_FAILED,
                        format!("Failed to get snapshot class with error {}", e),
                    )
                    .await?;
                    return Ok(None);
                }
            },
            None => match set_default_snapshot_class(
                self.api.as_ref(),
                &snapshot,
                &self.config.driver_name,
            )
            .await
            {
                Ok((class, updated)) => {
                    if let Err(e) = self.snapshots.upsert(&updated) {
                        warn!(
                            snapshot = %updated.key(),
                            error = %e,
                            "failed to refresh snapshot cache"
                        );
                    }
                    (class, updated)
                }
                Err(e) => {
                    self.update_error_status(
                        &snapshot,
                        reasons::SET_DEFAULT_SNAPSHOT_CLASS_FAILED,
                        format!("Failed to set default snapshot class with error {}", e),
                    )
                    .await?;
                    return Ok(None);
                }
            },
        };

        if !self.handles_class(&class) {
            debug!(
                snapshot = %snapshot.key(),
                class = %class.name_any(),
                snapshotter = %class.snapshotter,
                "snapshot class is handled by another driver, skipping"
            );
            return Ok(None);
        }
        Ok(Some(snapshot))
    }

    /// Whether a snapshot being deleted is ours to release
    ///
    /// A class that no longer exists does not block the release; only a class
    /// that names another driver does.
    async fn may_release(&self, snapshot: &VolumeSnapshot) -> Result<bool> {
        let Some(name) = snapshot.class_name() else {
            return Ok(true);
        };
        match self.api.get_class(name).await? {
            Some(class) if !self.handles_class(&class) => {
                debug!(
                    snapshot = %snapshot.key(),
                    class = %name,
                    "deleted snapshot belongs to another driver, skipping"
                );
                Ok(false)
            }
            Some(_) => Ok(true),
            None => {
                debug!(
                    snapshot = %snapshot.key(),
                    class = %name,
                    "releasing snapshot of a deleted class"
                );
                Ok(true)
            }
        }
    }

    fn handles_class(&self, class: &VolumeSnapshotClass) -> bool {
        class.snapshotter == self.config.driver_name
    }

    /// Record `message` as the snapshot's error and mark it not ready
    ///
    /// The write goes against the live object. A status already carrying the
    /// same message is left untouched and no event is published.
    async fn update_error_status(
        &self,
        snapshot: &VolumeSnapshot,
        reason: &str,
        message: String,
    ) -> Result<()> {
        let Some(snapshot) = self
            .api
            .get_snapshot(&snapshot.namespace().unwrap_or_default(), &snapshot.name_any())
            .await?
        else {
            debug!(snapshot = %snapshot.key(), "snapshot gone, dropping error status");
            return Ok(());
        };
        if snapshot
            .status_error()
            .and_then(|e| e.message.as_deref())
            == Some(message.as_str())
        {
            debug!(snapshot = %snapshot.key(), "error status already set");
            return Ok(());
        }

        let mut updated = snapshot.clone();
        let status = updated.status.get_or_insert_with(Default::default);
        status.error = Some(VolumeError {
            time: Some(Time(chrono::Utc::now())),
            message: Some(message.clone()),
        });
        status.ready_to_use = false;

        let persisted = self.api.update_snapshot_status(&updated).await?;
        if let Err(e) = self.snapshots.upsert(&persisted) {
            warn!(snapshot = %persisted.key(), error = %e, "failed to refresh snapshot cache");
        }
        error!(snapshot = %snapshot.key(), reason, message = %message, "snapshot error");
        self.events
            .publish(
                &persisted.object_ref(&()),
                Warning::new(reason, actions::RECONCILE, message),
            )
            .await;
        Ok(())
    }

    /// Publish a warning on a content object
    async fn content_warning(
        &self,
        content: &VolumeSnapshotContent,
        reason: &str,
        action: &str,
        message: &str,
    ) {
        self.events
            .publish(&content.object_ref(&()), Warning::new(reason, action, message))
            .await;
    }
}
