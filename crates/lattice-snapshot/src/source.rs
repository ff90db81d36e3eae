//! Source volume lookups
//!
//! A dynamic snapshot names a PersistentVolumeClaim; the driver needs the
//! bound PersistentVolume and default class selection needs the claim's
//! StorageClass. The deletion guard on a snapshot also asks whether some
//! claim is still being restored from it.

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;
use lattice_common::crd::{VolumeSnapshot, SNAPSHOT_GROUP};
use lattice_common::{Error, Result, PVC_KIND};

use crate::api::SnapshotApi;

const PVC_PHASE_BOUND: &str = "Bound";
const PVC_PHASE_PENDING: &str = "Pending";
const SNAPSHOT_KIND: &str = "VolumeSnapshot";

/// Claim named by `snapshot.spec.source`
pub async fn get_claim(
    api: &dyn SnapshotApi,
    snapshot: &VolumeSnapshot,
) -> Result<PersistentVolumeClaim> {
    let key = snapshot.key();
    let source = snapshot.spec.source.as_ref().ok_or_else(|| {
        Error::validation_for_field(&key, "spec.source", "the snapshot source is not specified")
    })?;
    if source.kind != PVC_KIND {
        return Err(Error::validation_for_field(
            &key,
            "spec.source.kind",
            format!(
                "the snapshot source is not the right type. Expected {}, Got {}",
                PVC_KIND, source.kind
            ),
        ));
    }
    if source.name.is_empty() {
        return Err(Error::validation_for_field(
            &key,
            "spec.source.name",
            format!("the PVC name is not specified in snapshot {}", key),
        ));
    }
    if let Some(group) = source.api_group.as_deref().filter(|g| !g.is_empty()) {
        return Err(Error::validation_for_field(
            &key,
            "spec.source.apiGroup",
            format!(
                "the snapshot source does not have the right APIGroup. Expected empty string, Got {}",
                group
            ),
        ));
    }

    let namespace = snapshot.namespace().unwrap_or_default();
    match api.get_claim(&namespace, &source.name).await {
        Ok(Some(claim)) => Ok(claim),
        Ok(None) => Err(Error::validation_for(
            &key,
            format!("failed to retrieve PVC {} from the API server: not found", source.name),
        )),
        Err(e) => Err(Error::internal_with_context(
            "source",
            format!("failed to retrieve PVC {} from the API server: {}", source.name, e),
        )),
    }
}

/// Volume the source claim is bound to
pub async fn get_volume(
    api: &dyn SnapshotApi,
    snapshot: &VolumeSnapshot,
) -> Result<PersistentVolume> {
    let claim = get_claim(api, snapshot).await?;
    volume_for_claim(api, snapshot, &claim).await
}

async fn volume_for_claim(
    api: &dyn SnapshotApi,
    snapshot: &VolumeSnapshot,
    claim: &PersistentVolumeClaim,
) -> Result<PersistentVolume> {
    let phase = claim.status.as_ref().and_then(|s| s.phase.as_deref());
    let volume_name = claim
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.as_deref())
        .filter(|n| !n.is_empty());
    let (Some(PVC_PHASE_BOUND), Some(volume_name)) = (phase, volume_name) else {
        return Err(Error::validation_for(
            snapshot.key(),
            format!(
                "the PVC {} is not yet bound to a PV, will not attempt to take a snapshot",
                claim.name_any()
            ),
        ));
    };

    match api.get_volume(volume_name).await {
        Ok(Some(volume)) => Ok(volume),
        Ok(None) => Err(Error::validation_for(
            snapshot.key(),
            format!("failed to retrieve PV {} from the API server: not found", volume_name),
        )),
        Err(e) => Err(Error::internal_with_context(
            "source",
            format!("failed to retrieve PV {} from the API server: {}", volume_name, e),
        )),
    }
}

/// StorageClass of the source claim, falling back to the bound volume's
pub async fn get_storage_class(
    api: &dyn SnapshotApi,
    snapshot: &VolumeSnapshot,
) -> Result<StorageClass> {
    let claim = get_claim(api, snapshot).await?;
    let mut class_name = claim
        .spec
        .as_ref()
        .and_then(|s| s.storage_class_name.clone())
        .unwrap_or_default();
    if class_name.is_empty() {
        if let Ok(volume) = volume_for_claim(api, snapshot, &claim).await {
            class_name = volume
                .spec
                .and_then(|s| s.storage_class_name)
                .unwrap_or_default();
        }
    }
    if class_name.is_empty() {
        return Err(Error::validation_for(
            snapshot.key(),
            "cannot figure out the snapshot class automatically, please specify one in snapshot spec",
        ));
    }
    api.get_storage_class(&class_name).await?.ok_or_else(|| {
        Error::validation_for(
            snapshot.key(),
            format!("failed to retrieve storage class {} from the API server", class_name),
        )
    })
}

/// Whether a claim in the snapshot's namespace is still being restored from it
pub async fn is_volume_being_created_from_snapshot(
    api: &dyn SnapshotApi,
    snapshot: &VolumeSnapshot,
) -> Result<bool> {
    let namespace = snapshot.namespace().unwrap_or_default();
    let name = snapshot.name_any();
    let claims = api.list_claims(&namespace).await?;
    Ok(claims.iter().any(|claim| {
        let restores_this = claim
            .spec
            .as_ref()
            .and_then(|s| s.data_source.as_ref())
            .is_some_and(|ds| {
                ds.name == name
                    && ds.kind == SNAPSHOT_KIND
                    && ds.api_group.as_deref() == Some(SNAPSHOT_GROUP)
            });
        let pending =
            claim.status.as_ref().and_then(|s| s.phase.as_deref()) == Some(PVC_PHASE_PENDING);
        restores_this && pending
    }))
}
