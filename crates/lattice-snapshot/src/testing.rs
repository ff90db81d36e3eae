//! In-memory doubles for reconcile tests
//!
//! [`FakeApi`] behaves like a small API server: every write bumps a global
//! resourceVersion, updates carrying a stale version fail with a conflict,
//! creates of a taken name fail with already-exists, and deleting an object
//! that still has finalizers only stamps its deletionTimestamp. It also
//! watches the content deletion guard and counts every removal of the guard
//! while a live snapshot is still bound to that content.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ObjectReference, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimStatus, Secret, TypedLocalObjectReference,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::ByteString;
use kube::ResourceExt;
use lattice_common::crd::{
    CsiVolumeSnapshotSource, DeletionPolicy, VolumeSnapshot, VolumeSnapshotClass,
    VolumeSnapshotContent, VolumeSnapshotContentSpec, VolumeSnapshotSpec,
    IS_DEFAULT_SNAPSHOT_CLASS_ANNOTATION, VOLUME_SNAPSHOT_CONTENT_FINALIZER,
    VOLUME_SNAPSHOT_FINALIZER,
};
use lattice_common::events::{EventPublisher, Warning};
use lattice_common::kube_utils::{has_finalizer, is_being_deleted};
use lattice_common::{Error, Result, PVC_KIND};
use parking_lot::Mutex;

use crate::api::SnapshotApi;
use crate::binding::is_bound;

pub const DRIVER: &str = "hostpath.csi.k8s.io";
pub const NAMESPACE: &str = "default";

#[derive(Default)]
struct State {
    version: u64,
    snapshots: BTreeMap<String, VolumeSnapshot>,
    contents: BTreeMap<String, VolumeSnapshotContent>,
    classes: BTreeMap<String, VolumeSnapshotClass>,
    claims: BTreeMap<String, PersistentVolumeClaim>,
    volumes: BTreeMap<String, PersistentVolume>,
    storage_classes: BTreeMap<String, StorageClass>,
    secrets: BTreeMap<String, Secret>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

fn ns_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

fn check_version(kind: &str, name: &str, stored: &ObjectMeta, incoming: &ObjectMeta) -> Result<()> {
    if stored.resource_version != incoming.resource_version {
        return Err(Error::conflict(kind, name));
    }
    Ok(())
}

/// In-memory [`SnapshotApi`]
#[derive(Default)]
pub struct FakeApi {
    state: Mutex<State>,
    content_creates: AtomicUsize,
    guard_violations: AtomicUsize,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_snapshot(&self, mut snapshot: VolumeSnapshot) -> VolumeSnapshot {
        let mut state = self.state.lock();
        snapshot.metadata.resource_version = Some(state.next_version());
        state.snapshots.insert(snapshot.key(), snapshot.clone());
        snapshot
    }

    pub fn insert_content(&self, mut content: VolumeSnapshotContent) -> VolumeSnapshotContent {
        let mut state = self.state.lock();
        content.metadata.resource_version = Some(state.next_version());
        state.contents.insert(content.name_any(), content.clone());
        content
    }

    pub fn insert_class(&self, class: VolumeSnapshotClass) {
        self.state.lock().classes.insert(class.name_any(), class);
    }

    pub fn insert_claim(&self, claim: PersistentVolumeClaim) {
        let key = ns_key(&claim.namespace().unwrap_or_default(), &claim.name_any());
        self.state.lock().claims.insert(key, claim);
    }

    pub fn insert_volume(&self, volume: PersistentVolume) {
        self.state.lock().volumes.insert(volume.name_any(), volume);
    }

    pub fn insert_storage_class(&self, class: StorageClass) {
        self.state.lock().storage_classes.insert(class.name_any(), class);
    }

    pub fn insert_secret(&self, secret: Secret) {
        let key = ns_key(&secret.namespace().unwrap_or_default(), &secret.name_any());
        self.state.lock().secrets.insert(key, secret);
    }

    pub fn snapshot(&self, namespace: &str, name: &str) -> Option<VolumeSnapshot> {
        self.state.lock().snapshots.get(&ns_key(namespace, name)).cloned()
    }

    pub fn content(&self, name: &str) -> Option<VolumeSnapshotContent> {
        self.state.lock().contents.get(name).cloned()
    }

    pub fn contents(&self) -> Vec<VolumeSnapshotContent> {
        self.state.lock().contents.values().cloned().collect()
    }

    /// User-initiated delete of a snapshot
    pub fn delete_snapshot(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock();
        let key = ns_key(namespace, name);
        let Some(snapshot) = state.snapshots.get(&key) else {
            return;
        };
        if snapshot.finalizers().is_empty() {
            state.snapshots.remove(&key);
            return;
        }
        let version = state.next_version();
        if let Some(snapshot) = state.snapshots.get_mut(&key) {
            snapshot.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            snapshot.metadata.resource_version = Some(version);
        }
    }

    /// Overwrite a content bypassing the version check, as another writer would
    pub fn force_update_content(&self, content: VolumeSnapshotContent) {
        let mut state = self.state.lock();
        let previous = state.contents.get(&content.name_any()).cloned();
        let mut content = content;
        content.metadata.resource_version = Some(state.next_version());
        if let Some(previous) = previous {
            self.audit_guard(&state, &previous, &content);
        }
        state.contents.insert(content.name_any(), content);
    }

    /// Attempts made through [`SnapshotApi::create_content`], failed ones included
    pub fn content_creates(&self) -> usize {
        self.content_creates.load(Ordering::SeqCst)
    }

    /// Times the content guard was dropped while a bound snapshot was still live
    pub fn guard_violations(&self) -> usize {
        self.guard_violations.load(Ordering::SeqCst)
    }

    /// Panic if two contents claim the same snapshot name and UID
    pub fn assert_unique_binding(&self) {
        let state = self.state.lock();
        let mut seen: BTreeMap<(String, String, String), String> = BTreeMap::new();
        for content in state.contents.values() {
            let Some(r) = content.spec.volume_snapshot_ref.as_ref() else {
                continue;
            };
            let uid = r.uid.clone().unwrap_or_default();
            if uid.is_empty() {
                continue;
            }
            let key = (
                r.namespace.clone().unwrap_or_default(),
                r.name.clone().unwrap_or_default(),
                uid,
            );
            if let Some(other) = seen.insert(key.clone(), content.name_any()) {
                panic!(
                    "contents {} and {} are both bound to {:?}",
                    other,
                    content.name_any(),
                    key
                );
            }
        }
    }

    fn audit_guard(
        &self,
        state: &State,
        previous: &VolumeSnapshotContent,
        next: &VolumeSnapshotContent,
    ) {
        let dropped = has_finalizer(&previous.metadata, VOLUME_SNAPSHOT_CONTENT_FINALIZER)
            && !has_finalizer(&next.metadata, VOLUME_SNAPSHOT_CONTENT_FINALIZER);
        if !dropped {
            return;
        }
        let still_bound = state.snapshots.values().any(|s| is_bound(s, next));
        if still_bound {
            self.guard_violations.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl SnapshotApi for FakeApi {
    async fn get_snapshot(&self, namespace: &str, name: &str) -> Result<Option<VolumeSnapshot>> {
        Ok(self.snapshot(namespace, name))
    }

    async fn list_snapshots(&self, _label_selector: &str) -> Result<Vec<VolumeSnapshot>> {
        Ok(self.state.lock().snapshots.values().cloned().collect())
    }

    async fn update_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot> {
        let mut state = self.state.lock();
        let key = snapshot.key();
        let stored = state
            .snapshots
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found("VolumeSnapshot", &key))?;
        check_version("VolumeSnapshot", &key, &stored.metadata, &snapshot.metadata)?;

        let mut next = snapshot.clone();
        next.status = stored.status;
        next.metadata.uid = stored.metadata.uid;
        next.metadata.deletion_timestamp = stored.metadata.deletion_timestamp;
        next.metadata.resource_version = Some(state.next_version());
        if is_being_deleted(&next.metadata) && next.finalizers().is_empty() {
            state.snapshots.remove(&key);
        } else {
            state.snapshots.insert(key, next.clone());
        }
        Ok(next)
    }

    async fn update_snapshot_status(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot> {
        let mut state = self.state.lock();
        let key = snapshot.key();
        let stored = state
            .snapshots
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found("VolumeSnapshot", &key))?;
        check_version("VolumeSnapshot", &key, &stored.metadata, &snapshot.metadata)?;

        let mut next = stored;
        next.status = snapshot.status.clone();
        next.metadata.resource_version = Some(state.next_version());
        state.snapshots.insert(key, next.clone());
        Ok(next)
    }

    async fn get_content(&self, name: &str) -> Result<Option<VolumeSnapshotContent>> {
        Ok(self.content(name))
    }

    async fn list_contents(&self, _label_selector: &str) -> Result<Vec<VolumeSnapshotContent>> {
        Ok(self.contents())
    }

    async fn create_content(
        &self,
        content: &VolumeSnapshotContent,
    ) -> Result<VolumeSnapshotContent> {
        self.content_creates.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        let name = content.name_any();
        if state.contents.contains_key(&name) {
            return Err(Error::already_exists("VolumeSnapshotContent", &name));
        }
        let mut created = content.clone();
        created.metadata.uid = Some(format!("content-uid-{}", state.version + 1));
        created.metadata.resource_version = Some(state.next_version());
        state.contents.insert(name, created.clone());
        Ok(created)
    }

    async fn update_content(
        &self,
        content: &VolumeSnapshotContent,
    ) -> Result<VolumeSnapshotContent> {
        let mut state = self.state.lock();
        let name = content.name_any();
        let stored = state
            .contents
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::not_found("VolumeSnapshotContent", &name))?;
        check_version("VolumeSnapshotContent", &name, &stored.metadata, &content.metadata)?;

        let mut next = content.clone();
        next.metadata.uid = stored.metadata.uid.clone();
        next.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
        next.metadata.resource_version = Some(state.next_version());
        self.audit_guard(&state, &stored, &next);
        if is_being_deleted(&next.metadata) && next.finalizers().is_empty() {
            state.contents.remove(&name);
        } else {
            state.contents.insert(name, next.clone());
        }
        Ok(next)
    }

    async fn delete_content(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let Some(content) = state.contents.get(name) else {
            return Err(Error::not_found("VolumeSnapshotContent", name));
        };
        if content.finalizers().is_empty() {
            state.contents.remove(name);
            return Ok(());
        }
        let version = state.next_version();
        if let Some(content) = state.contents.get_mut(name) {
            content.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
            content.metadata.resource_version = Some(version);
        }
        Ok(())
    }

    async fn get_class(&self, name: &str) -> Result<Option<VolumeSnapshotClass>> {
        Ok(self.state.lock().classes.get(name).cloned())
    }

    async fn list_classes(&self) -> Result<Vec<VolumeSnapshotClass>> {
        Ok(self.state.lock().classes.values().cloned().collect())
    }

    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.state.lock().claims.get(&ns_key(namespace, name)).cloned())
    }

    async fn list_claims(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>> {
        Ok(self
            .state
            .lock()
            .claims
            .values()
            .filter(|c| c.namespace().as_deref() == Some(namespace))
            .cloned()
            .collect())
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.state.lock().volumes.get(name).cloned())
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        Ok(self.state.lock().storage_classes.get(name).cloned())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        Ok(self.state.lock().secrets.get(&ns_key(namespace, name)).cloned())
    }
}

/// One published event
#[derive(Clone, Debug)]
pub struct RecordedEvent {
    pub object: String,
    pub reason: String,
    pub action: String,
    pub note: String,
}

/// [`EventPublisher`] that keeps every event in memory
#[derive(Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventPublisher {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, reason: &str) -> usize {
        self.events.lock().iter().filter(|e| e.reason == reason).count()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(&self, regarding: &ObjectReference, warning: Warning) {
        self.events.lock().push(RecordedEvent {
            object: regarding.name.clone().unwrap_or_default(),
            reason: warning.reason,
            action: warning.action,
            note: warning.note,
        });
    }
}

// Fixtures

pub fn snapshot_class(
    name: &str,
    snapshotter: &str,
    default: bool,
    policy: Option<DeletionPolicy>,
) -> VolumeSnapshotClass {
    let mut class = VolumeSnapshotClass {
        snapshotter: snapshotter.to_string(),
        deletion_policy: policy,
        ..Default::default()
    };
    class.metadata.name = Some(name.to_string());
    if default {
        class.metadata.annotations = Some(BTreeMap::from([(
            IS_DEFAULT_SNAPSHOT_CLASS_ANNOTATION.to_string(),
            "true".to_string(),
        )]));
    }
    class
}

pub fn storage_class(name: &str, provisioner: &str) -> StorageClass {
    StorageClass {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        provisioner: provisioner.to_string(),
        ..Default::default()
    }
}

/// Claim bound to `volume` with the given storage class
pub fn bound_claim(name: &str, volume: &str, storage_class: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            volume_name: Some(volume.to_string()),
            storage_class_name: Some(storage_class.to_string()),
            ..Default::default()
        }),
        status: Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".to_string()),
            ..Default::default()
        }),
    }
}

pub fn volume(name: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            uid: Some(format!("{}-uid", name)),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn secret(name: &str, data: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

/// Snapshot of `claim` in the default namespace
pub fn dynamic_snapshot(name: &str, uid: &str, class: Option<&str>, claim: &str) -> VolumeSnapshot {
    let mut snapshot = VolumeSnapshot::new(
        name,
        VolumeSnapshotSpec {
            source: Some(TypedLocalObjectReference {
                api_group: None,
                kind: PVC_KIND.to_string(),
                name: claim.to_string(),
            }),
            snapshot_class_name: class.map(str::to_string),
            ..Default::default()
        },
    );
    snapshot.metadata.namespace = Some(NAMESPACE.to_string());
    snapshot.metadata.uid = Some(uid.to_string());
    snapshot
}

/// Snapshot naming `content` up front
pub fn prebound_snapshot(name: &str, uid: &str, class: &str, content: &str) -> VolumeSnapshot {
    let mut snapshot = VolumeSnapshot::new(
        name,
        VolumeSnapshotSpec {
            snapshot_content_name: Some(content.to_string()),
            snapshot_class_name: Some(class.to_string()),
            ..Default::default()
        },
    );
    snapshot.metadata.namespace = Some(NAMESPACE.to_string());
    snapshot.metadata.uid = Some(uid.to_string());
    snapshot
}

/// Content on this driver referencing snapshot `ref_name` with `ref_uid`
pub fn content(
    name: &str,
    ref_name: &str,
    ref_uid: &str,
    class: &str,
    policy: DeletionPolicy,
) -> VolumeSnapshotContent {
    VolumeSnapshotContent::new(
        name,
        VolumeSnapshotContentSpec {
            csi_volume_snapshot_source: Some(CsiVolumeSnapshotSource {
                driver: DRIVER.to_string(),
                snapshot_handle: format!("handle-{}", name),
                creation_time: Some(1_700_000_000_000_000_000),
                restore_size: Some(1024),
            }),
            volume_snapshot_ref: Some(ObjectReference {
                name: Some(ref_name.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                uid: Some(ref_uid.to_string()),
                ..Default::default()
            }),
            snapshot_class_name: Some(class.to_string()),
            deletion_policy: Some(policy),
            ..Default::default()
        },
    )
}

/// Add the snapshot guard the controller would have set
pub fn guarded_snapshot(mut snapshot: VolumeSnapshot) -> VolumeSnapshot {
    snapshot
        .finalizers_mut()
        .push(VOLUME_SNAPSHOT_FINALIZER.to_string());
    snapshot
}

/// Add the content guard the controller would have set
pub fn guarded_content(mut content: VolumeSnapshotContent) -> VolumeSnapshotContent {
    content
        .finalizers_mut()
        .push(VOLUME_SNAPSHOT_CONTENT_FINALIZER.to_string());
    content
}
