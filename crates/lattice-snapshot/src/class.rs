//! Snapshot class resolution
//!
//! A snapshot either names its class or gets the single default class whose
//! snapshotter matches both the source claim's provisioner and this
//! controller's driver.

use kube::ResourceExt;
use lattice_common::crd::{VolumeSnapshot, VolumeSnapshotClass};
use lattice_common::{Error, Result};
use tracing::{info, warn};

use crate::api::SnapshotApi;
use crate::source::get_storage_class;

/// Fetch the class called `name`; a missing class is an error
pub async fn get_snapshot_class(api: &dyn SnapshotApi, name: &str) -> Result<VolumeSnapshotClass> {
    match api.get_class(name).await {
        Ok(Some(class)) => Ok(class),
        Ok(None) => Err(Error::validation(format!(
            "failed to retrieve snapshot class {} from the API server: not found",
            name
        ))),
        Err(e) => Err(Error::internal_with_context(
            "class",
            format!("failed to retrieve snapshot class {} from the API server: {}", name, e),
        )),
    }
}

/// Pick the one default class serving `provisioner` through `driver_name`
pub fn choose_default_class(
    classes: Vec<VolumeSnapshotClass>,
    provisioner: &str,
    driver_name: &str,
) -> Result<VolumeSnapshotClass> {
    let mut defaults: Vec<VolumeSnapshotClass> = classes
        .into_iter()
        .filter(|c| c.is_default() && c.snapshotter == provisioner && c.snapshotter == driver_name)
        .collect();
    match defaults.len() {
        0 => Err(Error::validation("cannot find default snapshot class")),
        1 => Ok(defaults.remove(0)),
        n => Err(Error::validation(format!(
            "{} default snapshot classes were found",
            n
        ))),
    }
}

/// Resolve the default class for an unnamed snapshot and record it on the snapshot
///
/// Returns the class and the snapshot copy carrying its name. Persisting the
/// name is best-effort: on failure the local copy is still returned so the
/// current pass can proceed.
pub async fn set_default_snapshot_class(
    api: &dyn SnapshotApi,
    snapshot: &VolumeSnapshot,
    driver_name: &str,
) -> Result<(VolumeSnapshotClass, VolumeSnapshot)> {
    let storage_class = get_storage_class(api, snapshot).await?;
    let classes = api.list_classes().await?;
    let class = choose_default_class(classes, &storage_class.provisioner, driver_name)?;

    let mut updated = snapshot.clone();
    updated.spec.snapshot_class_name = Some(class.name_any());
    let updated = match api.update_snapshot(&updated).await {
        Ok(persisted) => {
            info!(
                snapshot = %snapshot.key(),
                class = %class.name_any(),
                "set default snapshot class"
            );
            persisted
        }
        Err(e) => {
            warn!(
                snapshot = %snapshot.key(),
                error = %e,
                "updating default snapshot class failed, continuing with local copy"
            );
            updated
        }
    };
    Ok((class, updated))
}
