//! Snapshot driver boundary
//!
//! [`SnapshotDriver`] is the backend a CSI sidecar plugs in. The controller
//! never calls it directly: [`DriverHandler`] derives the backend snapshot
//! name, strips reserved parameters and bounds every call with a timeout.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::ResourceExt;
use lattice_common::crd::{VolumeSnapshot, VolumeSnapshotContent};
use lattice_common::{Error, Result};
use tracing::debug;

use crate::credentials::remove_prefixed_parameters;

#[cfg(test)]
use mockall::automock;

/// What a driver reports after cutting a snapshot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedSnapshot {
    /// Driver that owns the snapshot
    pub driver: String,
    /// Opaque backend handle
    pub snapshot_handle: String,
    /// Creation time in nanoseconds since the epoch; 0 when unknown
    pub creation_time: i64,
    /// Restore size in bytes
    pub size_bytes: i64,
    /// Whether the snapshot is usable for restore yet
    pub ready_to_use: bool,
}

/// What a driver reports when asked about an existing snapshot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotStatus {
    /// Whether the snapshot is usable for restore
    pub ready_to_use: bool,
    /// Creation time in nanoseconds since the epoch; 0 when unknown
    pub creation_time: i64,
    /// Restore size in bytes
    pub size_bytes: i64,
}

/// A CSI snapshot backend
///
/// Every call must be safe to repeat: create with the same name returns the
/// existing snapshot, delete of a missing handle succeeds.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SnapshotDriver: Send + Sync {
    /// Cut a snapshot of `volume` named `name`
    async fn create_snapshot(
        &self,
        name: &str,
        volume: &PersistentVolume,
        parameters: &BTreeMap<String, String>,
        credentials: &BTreeMap<String, String>,
    ) -> Result<CreatedSnapshot>;

    /// Delete the snapshot identified by `snapshot_handle`
    async fn delete_snapshot(
        &self,
        snapshot_handle: &str,
        credentials: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Report the state of the snapshot identified by `snapshot_handle`
    async fn get_status(&self, snapshot_handle: &str) -> Result<SnapshotStatus>;
}

/// Backend snapshot name for a request UID
///
/// With `uuid_length` set, dashes are stripped from the UID and it is cut to
/// that many characters.
pub fn make_snapshot_name(prefix: &str, uid: &str, uuid_length: Option<usize>) -> Result<String> {
    if uid.is_empty() {
        return Err(Error::validation(
            "Corrupted snapshot object, it is missing UID",
        ));
    }
    match uuid_length {
        None => Ok(format!("{}-{}", prefix, uid)),
        Some(len) => {
            let compact: String = uid.chars().filter(|c| *c != '-').collect();
            let cut: String = compact.chars().take(len).collect();
            Ok(format!("{}-{}", prefix, cut))
        }
    }
}

/// Controller-side wrapper around a [`SnapshotDriver`]
#[derive(Clone)]
pub struct DriverHandler {
    driver: Arc<dyn SnapshotDriver>,
    timeout: Duration,
    name_prefix: String,
    uuid_length: Option<usize>,
}

impl DriverHandler {
    /// Wrap `driver`, bounding each call by `timeout`
    pub fn new(
        driver: Arc<dyn SnapshotDriver>,
        timeout: Duration,
        name_prefix: impl Into<String>,
        uuid_length: Option<usize>,
    ) -> Self {
        Self {
            driver,
            timeout,
            name_prefix: name_prefix.into(),
            uuid_length,
        }
    }

    async fn bounded<T>(
        &self,
        object: &str,
        call: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::driver(
                object,
                format!("{} timed out after {:?}", call, self.timeout),
            )),
        }
    }

    /// Cut (or re-confirm) the backend snapshot for `snapshot`
    pub async fn create(
        &self,
        snapshot: &VolumeSnapshot,
        volume: &PersistentVolume,
        parameters: &BTreeMap<String, String>,
        credentials: &BTreeMap<String, String>,
    ) -> Result<CreatedSnapshot> {
        let uid = snapshot.uid().unwrap_or_default();
        let name = make_snapshot_name(&self.name_prefix, &uid, self.uuid_length)?;
        let parameters = remove_prefixed_parameters(parameters)?;
        debug!(
            snapshot = %snapshot.key(),
            backend_name = %name,
            volume = %volume.name_any(),
            "calling driver create"
        );
        self.bounded(
            &snapshot.key(),
            "CreateSnapshot",
            self.driver
                .create_snapshot(&name, volume, &parameters, credentials),
        )
        .await
    }

    /// Delete the backend snapshot recorded in `content`
    pub async fn delete(
        &self,
        content: &VolumeSnapshotContent,
        credentials: &BTreeMap<String, String>,
    ) -> Result<()> {
        let handle = require_handle(content)?;
        debug!(content = %content.name_any(), handle = %handle, "calling driver delete");
        self.bounded(
            &content.name_any(),
            "DeleteSnapshot",
            self.driver.delete_snapshot(handle, credentials),
        )
        .await
    }

    /// Ask the backend about the snapshot recorded in `content`
    pub async fn status(&self, content: &VolumeSnapshotContent) -> Result<SnapshotStatus> {
        let handle = require_handle(content)?;
        self.bounded(
            &content.name_any(),
            "GetSnapshotStatus",
            self.driver.get_status(handle),
        )
        .await
    }
}

fn require_handle(content: &VolumeSnapshotContent) -> Result<&str> {
    content
        .spec
        .csi_volume_snapshot_source
        .as_ref()
        .map(|csi| csi.snapshot_handle.as_str())
        .ok_or_else(|| {
            Error::validation_for_field(
                content.name_any(),
                "spec.csiVolumeSnapshotSource",
                "CSISnapshot not defined in spec",
            )
        })
}
