//! Snapshot to content binding
//!
//! A content is bound when its `volumeSnapshotRef` names the snapshot by
//! namespace, name and UID and the snapshot's `snapshotContentName` names the
//! content back. The UID in the reference is the compare-and-set point: a
//! content reserved for a snapshot carries an empty UID until the snapshot
//! side fills it in.

use kube::ResourceExt;
use lattice_common::crd::{VolumeSnapshot, VolumeSnapshotContent};
use lattice_common::{Error, Result};
use tracing::{debug, warn};

use crate::api::SnapshotApi;
use crate::cache::ObjectCache;

/// Prefix of controller-created content names
pub const CONTENT_NAME_PREFIX: &str = "snapcontent-";

/// Name of the content the controller creates for `snapshot`
pub fn content_name_for(snapshot: &VolumeSnapshot) -> String {
    format!("{}{}", CONTENT_NAME_PREFIX, snapshot.uid().unwrap_or_default())
}

/// Whether `snapshot` and `content` point at each other
pub fn is_bound(snapshot: &VolumeSnapshot, content: &VolumeSnapshotContent) -> bool {
    let Some(r) = content.spec.volume_snapshot_ref.as_ref() else {
        return false;
    };
    r.name.as_deref() == Some(snapshot.name_any().as_str())
        && r.namespace.as_deref().unwrap_or_default() == snapshot.namespace().unwrap_or_default()
        && r.uid.as_deref().unwrap_or_default() == snapshot.uid().unwrap_or_default()
        && snapshot.content_name() == Some(content.name_any().as_str())
}

fn mismatch(snapshot: &VolumeSnapshot, content: &VolumeSnapshotContent) -> Error {
    Error::validation_for_field(
        snapshot.key(),
        "spec.volumeSnapshotRef",
        format!(
            "Could not bind snapshot {} and content {}, the VolumeSnapshotRef does not match",
            snapshot.name_any(),
            content.name_any()
        ),
    )
}

/// Bind `content` to `snapshot` if its reference allows it
///
/// A reference naming another snapshot, or the same name with another UID,
/// is rejected. A content already bound to this UID with a class is returned
/// as is unless its class differs from the snapshot's. Otherwise the UID and
/// class are written into the content and the cache is refreshed.
pub async fn check_and_bind(
    api: &dyn SnapshotApi,
    contents: &ObjectCache<VolumeSnapshotContent>,
    snapshot: &VolumeSnapshot,
    content: &VolumeSnapshotContent,
) -> Result<VolumeSnapshotContent> {
    let Some(reference) = content.spec.volume_snapshot_ref.as_ref() else {
        return Err(mismatch(snapshot, content));
    };
    if reference.name.as_deref() != Some(snapshot.name_any().as_str()) {
        return Err(mismatch(snapshot, content));
    }
    let ref_uid = reference.uid.as_deref().unwrap_or_default();
    let snapshot_uid = snapshot.uid().unwrap_or_default();
    if !ref_uid.is_empty() && ref_uid != snapshot_uid {
        return Err(mismatch(snapshot, content));
    }

    if !ref_uid.is_empty() {
        if let Some(content_class) = content.class_name() {
            if let Some(wanted) = snapshot.class_name() {
                if wanted != content_class {
                    return Err(Error::validation_for_field(
                        snapshot.key(),
                        "spec.snapshotClassName",
                        format!(
                            "Could not bind snapshot {} and content {}, snapshot class {} does not match content class {}",
                            snapshot.name_any(),
                            content.name_any(),
                            wanted,
                            content_class
                        ),
                    ));
                }
            }
            debug!(
                snapshot = %snapshot.key(),
                content = %content.name_any(),
                "content already bound"
            );
            return Ok(content.clone());
        }
    }

    let class = snapshot.class_name().ok_or_else(|| {
        Error::validation_for_field(
            snapshot.key(),
            "spec.snapshotClassName",
            format!(
                "Could not bind snapshot {} and content {}, the snapshot has no class",
                snapshot.name_any(),
                content.name_any()
            ),
        )
    })?;

    let mut bound = content.clone();
    if let Some(r) = bound.spec.volume_snapshot_ref.as_mut() {
        r.uid = Some(snapshot_uid);
    }
    bound.spec.snapshot_class_name = Some(class.to_string());
    let persisted = api.update_content(&bound).await?;
    if let Err(e) = contents.upsert(&persisted) {
        warn!(content = %persisted.name_any(), error = %e, "failed to refresh content cache");
    }
    debug!(
        snapshot = %snapshot.key(),
        content = %persisted.name_any(),
        "bound content to snapshot"
    );
    Ok(persisted)
}

/// Content already reserved for `snapshot` by namespace, name, UID and class
pub fn find_matching_content(
    contents: &ObjectCache<VolumeSnapshotContent>,
    snapshot: &VolumeSnapshot,
) -> Option<VolumeSnapshotContent> {
    let name = snapshot.name_any();
    let namespace = snapshot.namespace().unwrap_or_default();
    let uid = snapshot.uid().unwrap_or_default();
    let class = snapshot.class_name()?;

    let mut matches: Vec<VolumeSnapshotContent> = contents
        .list()
        .into_iter()
        .filter(|content| {
            content.spec.volume_snapshot_ref.as_ref().is_some_and(|r| {
                r.name.as_deref() == Some(name.as_str())
                    && r.namespace.as_deref().unwrap_or_default() == namespace
                    && r.uid.as_deref().unwrap_or_default() == uid
            }) && content.class_name() == Some(class)
        })
        .collect();
    matches.sort_by_key(|c| c.name_any());
    if matches.len() > 1 {
        warn!(
            snapshot = %snapshot.key(),
            count = matches.len(),
            "multiple contents reference the same snapshot"
        );
    }
    matches.into_iter().next()
}
