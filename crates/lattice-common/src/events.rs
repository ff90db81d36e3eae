//! Warning events on snapshot objects
//!
//! The controller only ever reports trouble, so the sink takes a [`Warning`]
//! rather than a free-form event. They show up under
//! `kubectl describe volumesnapshot` and `kubectl get events`.
//!
//! Publishing never fails from the caller's point of view. A rejected event is
//! logged and dropped so it cannot stall reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// A warning raised against one object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Warning {
    /// Machine-readable reason, one of [`reasons`]
    pub reason: String,
    /// Step that failed, one of [`actions`]
    pub action: String,
    /// Human-readable detail
    pub note: String,
}

impl Warning {
    /// Build a warning from a reason, an action and a note
    pub fn new(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            reason: reason.to_string(),
            action: action.to_string(),
            note: note.into(),
        }
    }
}

impl From<Warning> for Event {
    fn from(warning: Warning) -> Self {
        Event {
            type_: EventType::Warning,
            reason: warning.reason,
            note: Some(warning.note),
            action: warning.action,
            secondary: None,
        }
    }
}

/// Sink for controller warnings
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Attach `warning` to the object behind `regarding`
    async fn publish(&self, regarding: &ObjectReference, warning: Warning);
}

/// Writes warnings to the cluster through the kube event recorder
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// `component` is reported as the event source, for example
    /// `csi-snapshotter hostpath.csi.k8s.io`. The pod name, when the
    /// downward API provides `POD_NAME`, is reported as the instance.
    pub fn new(client: Client, component: &str) -> Self {
        let reporter = Reporter {
            controller: component.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, regarding: &ObjectReference, warning: Warning) {
        let reason = warning.reason.clone();
        if let Err(e) = self.recorder.publish(&warning.into(), regarding).await {
            warn!(
                object = regarding.name.as_deref().unwrap_or_default(),
                reason = %reason,
                error = %e,
                "dropping event the apiserver rejected"
            );
        }
    }
}

/// Discards every warning
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _regarding: &ObjectReference, _warning: Warning) {}
}

/// Event reasons, shown in the REASON column
pub mod reasons {
    // Content side
    /// Content references a snapshot that never completed its bind
    pub const SNAPSHOT_CONTENT_NOT_BOUND: &str = "SnapshotContentNotBound";
    /// Content carries a deletion policy this controller does not know
    pub const SNAPSHOT_UNKNOWN_DELETION_POLICY: &str = "SnapshotUnknownDeletionPolicy";
    /// Backend snapshot could not be deleted
    pub const SNAPSHOT_DELETE_ERROR: &str = "SnapshotDeleteError";
    /// Content object could not be removed after backend deletion
    pub const SNAPSHOT_CONTENT_OBJECT_DELETE_ERROR: &str = "SnapshotContentObjectDeleteError";

    // Request side
    /// Ready snapshot lost its content reference
    pub const SNAPSHOT_LOST: &str = "SnapshotLost";
    /// Referenced content does not exist
    pub const SNAPSHOT_CONTENT_MISSING: &str = "SnapshotContentMissing";
    /// Referenced content is bound to another snapshot
    pub const SNAPSHOT_MISBOUND: &str = "SnapshotMisbound";
    /// Binding the snapshot to its content failed
    pub const SNAPSHOT_BIND_FAILED: &str = "SnapshotBindFailed";
    /// Backend snapshot creation failed
    pub const SNAPSHOT_CREATION_FAILED: &str = "SnapshotCreationFailed";
    /// Content object could not be created after the backend snapshot was cut
    pub const CREATE_SNAPSHOT_CONTENT_FAILED: &str = "CreateSnapshotContentFailed";
    /// Status refresh from the driver failed
    pub const SNAPSHOT_CHECK_AND_UPDATE_FAILED: &str = "SnapshotCheckandUpdateFailed";
    /// Named snapshot class could not be resolved
    pub const GET_SNAPSHOT_CLASS_FAILED: &str = "GetSnapshotClassFailed";
    /// No unique default snapshot class could be chosen
    pub const SET_DEFAULT_SNAPSHOT_CLASS_FAILED: &str = "SetDefaultSnapshotClassFailed";
}

/// Event actions, shown in the ACTION column
pub mod actions {
    /// A reconcile pass
    pub const RECONCILE: &str = "Reconcile";
    /// Cutting a backend snapshot
    pub const CREATE: &str = "Create";
    /// Removing a backend snapshot or content object
    pub const DELETE: &str = "Delete";
}
