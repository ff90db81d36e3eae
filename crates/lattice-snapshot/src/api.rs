//! Persistence boundary
//!
//! [`SnapshotApi`] is every read and write the controller makes against the
//! API server. Updates carry the object's resourceVersion and fail with
//! [`Error::Conflict`] when the stored object has moved on; creates of an
//! existing name fail with [`Error::AlreadyExists`].

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Secret};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use lattice_common::crd::{VolumeSnapshot, VolumeSnapshotClass, VolumeSnapshotContent};
use lattice_common::{Error, Result};

#[cfg(test)]
use mockall::automock;

/// Trait abstracting Kubernetes API operations used by the snapshot controller
///
/// Allows the reconcilers to run against an in-memory store in tests while
/// using the real API server in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SnapshotApi: Send + Sync {
    /// Get a VolumeSnapshot
    async fn get_snapshot(&self, namespace: &str, name: &str) -> Result<Option<VolumeSnapshot>>;

    /// List VolumeSnapshots in all namespaces matching `label_selector` (empty = all)
    async fn list_snapshots(&self, label_selector: &str) -> Result<Vec<VolumeSnapshot>>;

    /// Replace a VolumeSnapshot's metadata and spec
    async fn update_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot>;

    /// Replace a VolumeSnapshot's status
    async fn update_snapshot_status(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot>;

    /// Get a VolumeSnapshotContent
    async fn get_content(&self, name: &str) -> Result<Option<VolumeSnapshotContent>>;

    /// List VolumeSnapshotContents matching `label_selector` (empty = all)
    async fn list_contents(&self, label_selector: &str) -> Result<Vec<VolumeSnapshotContent>>;

    /// Create a VolumeSnapshotContent
    async fn create_content(&self, content: &VolumeSnapshotContent)
        -> Result<VolumeSnapshotContent>;

    /// Replace a VolumeSnapshotContent
    async fn update_content(&self, content: &VolumeSnapshotContent)
        -> Result<VolumeSnapshotContent>;

    /// Delete a VolumeSnapshotContent
    async fn delete_content(&self, name: &str) -> Result<()>;

    /// Get a VolumeSnapshotClass
    async fn get_class(&self, name: &str) -> Result<Option<VolumeSnapshotClass>>;

    /// List every VolumeSnapshotClass
    async fn list_classes(&self) -> Result<Vec<VolumeSnapshotClass>>;

    /// Get a PersistentVolumeClaim
    async fn get_claim(&self, namespace: &str, name: &str)
        -> Result<Option<PersistentVolumeClaim>>;

    /// List PersistentVolumeClaims in a namespace
    async fn list_claims(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>>;

    /// Get a PersistentVolume
    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>>;

    /// Get a StorageClass
    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>>;

    /// Get a Secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
}

/// Map a kube error onto the controller's typed store errors
fn store_error(kind: &str, name: &str, err: kube::Error) -> Error {
    match &err {
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            Error::already_exists(kind, name)
        }
        kube::Error::Api(ae) if ae.code == 409 => Error::conflict(kind, name),
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(kind, name),
        _ => err.into(),
    }
}

async fn get_opt<K>(api: &Api<K>, name: &str) -> Result<Option<K>>
where
    K: Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn list_params(label_selector: &str) -> ListParams {
    if label_selector.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(label_selector)
    }
}

/// Real Kubernetes client implementation
pub struct KubeSnapshotApi {
    client: Client,
}

impl KubeSnapshotApi {
    /// Create a new KubeSnapshotApi wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn snapshots(&self, namespace: &str) -> Api<VolumeSnapshot> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn contents(&self) -> Api<VolumeSnapshotContent> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl SnapshotApi for KubeSnapshotApi {
    async fn get_snapshot(&self, namespace: &str, name: &str) -> Result<Option<VolumeSnapshot>> {
        get_opt(&self.snapshots(namespace), name).await
    }

    async fn list_snapshots(&self, label_selector: &str) -> Result<Vec<VolumeSnapshot>> {
        let api: Api<VolumeSnapshot> = Api::all(self.client.clone());
        Ok(api.list(&list_params(label_selector)).await?.items)
    }

    async fn update_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot> {
        let namespace = snapshot.namespace().unwrap_or_default();
        let name = snapshot.name_any();
        self.snapshots(&namespace)
            .replace(&name, &PostParams::default(), snapshot)
            .await
            .map_err(|e| store_error("VolumeSnapshot", &snapshot.key(), e))
    }

    async fn update_snapshot_status(&self, snapshot: &VolumeSnapshot) -> Result<VolumeSnapshot> {
        let namespace = snapshot.namespace().unwrap_or_default();
        let name = snapshot.name_any();
        let body = serde_json::to_vec(snapshot)
            .map_err(|e| Error::serialization_for_kind("VolumeSnapshot", e.to_string()))?;
        self.snapshots(&namespace)
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| store_error("VolumeSnapshot", &snapshot.key(), e))
    }

    async fn get_content(&self, name: &str) -> Result<Option<VolumeSnapshotContent>> {
        get_opt(&self.contents(), name).await
    }

    async fn list_contents(&self, label_selector: &str) -> Result<Vec<VolumeSnapshotContent>> {
        Ok(self.contents().list(&list_params(label_selector)).await?.items)
    }

    async fn create_content(
        &self,
        content: &VolumeSnapshotContent,
    ) -> Result<VolumeSnapshotContent> {
        self.contents()
            .create(&PostParams::default(), content)
            .await
            .map_err(|e| store_error("VolumeSnapshotContent", &content.name_any(), e))
    }

    async fn update_content(
        &self,
        content: &VolumeSnapshotContent,
    ) -> Result<VolumeSnapshotContent> {
        let name = content.name_any();
        self.contents()
            .replace(&name, &PostParams::default(), content)
            .await
            .map_err(|e| store_error("VolumeSnapshotContent", &name, e))
    }

    async fn delete_content(&self, name: &str) -> Result<()> {
        self.contents()
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| store_error("VolumeSnapshotContent", name, e))
    }

    async fn get_class(&self, name: &str) -> Result<Option<VolumeSnapshotClass>> {
        let api: Api<VolumeSnapshotClass> = Api::all(self.client.clone());
        get_opt(&api, name).await
    }

    async fn list_classes(&self) -> Result<Vec<VolumeSnapshotClass>> {
        let api: Api<VolumeSnapshotClass> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        get_opt(&api, name).await
    }

    async fn list_claims(&self, namespace: &str) -> Result<Vec<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        get_opt(&api, name).await
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        get_opt(&api, name).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        get_opt(&api, name).await
    }
}
