//! VolumeSnapshot Custom Resource Definition
//!
//! The user-facing, namespaced request for a point-in-time copy of a
//! PersistentVolumeClaim. Either `source` names the claim to snapshot
//! (dynamic provisioning) or `snapshotContentName` names existing content
//! (pre-bound provisioning).

use k8s_openapi::api::core::v1::TypedLocalObjectReference;
use k8s_openapi::api::storage::v1::VolumeError;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Status of a VolumeSnapshot
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotStatus {
    /// When the backend cut the snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<Time>,

    /// Minimum size of a volume restored from this snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_size: Option<Quantity>,

    /// True once the snapshot is cut, bound and usable for restore
    #[serde(default)]
    pub ready_to_use: bool,

    /// Last error observed while creating or checking the snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<VolumeError>,
}

/// Specification for a VolumeSnapshot
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "snapshot.storage.k8s.io",
    version = "v1alpha1",
    kind = "VolumeSnapshot",
    plural = "volumesnapshots",
    shortname = "vs",
    namespaced,
    derive = "PartialEq",
    status = "VolumeSnapshotStatus",
    printcolumn = r#"{"name":"Content","type":"string","jsonPath":".spec.snapshotContentName"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.readyToUse"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSpec {
    /// Claim to snapshot; only consulted for dynamic provisioning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<TypedLocalObjectReference>,

    /// Content this snapshot is (or will be) bound to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_content_name: Option<String>,

    /// Governing VolumeSnapshotClass; the default class is filled in when empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_class_name: Option<String>,
}

impl VolumeSnapshot {
    /// Cache and queue key: `namespace/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Bound content name, or `None` when unset or empty
    pub fn content_name(&self) -> Option<&str> {
        self.spec
            .snapshot_content_name
            .as_deref()
            .filter(|n| !n.is_empty())
    }

    /// Class name, or `None` when unset or empty
    pub fn class_name(&self) -> Option<&str> {
        self.spec
            .snapshot_class_name
            .as_deref()
            .filter(|n| !n.is_empty())
    }

    /// Whether the status reports the snapshot as usable
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.ready_to_use)
    }

    /// Recorded error, if any
    pub fn status_error(&self) -> Option<&VolumeError> {
        self.status.as_ref().and_then(|s| s.error.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_wire_format() {
        let snap: VolumeSnapshot = serde_json::from_value(json!({
            "apiVersion": "snapshot.storage.k8s.io/v1alpha1",
            "kind": "VolumeSnapshot",
            "metadata": {"name": "snap-1", "namespace": "default", "uid": "u-1"},
            "spec": {
                "source": {"kind": "PersistentVolumeClaim", "name": "data"},
                "snapshotClassName": "fast"
            },
            "status": {"readyToUse": true, "restoreSize": "10Gi"}
        }))
        .expect("parse snapshot");

        assert_eq!(snap.key(), "default/snap-1");
        assert_eq!(snap.class_name(), Some("fast"));
        assert_eq!(snap.content_name(), None);
        assert!(snap.is_ready());
        assert_eq!(
            snap.spec.source.as_ref().map(|s| s.kind.as_str()),
            Some("PersistentVolumeClaim")
        );
    }

    #[test]
    fn test_empty_names_are_unset() {
        let snap = VolumeSnapshot::new(
            "s",
            VolumeSnapshotSpec {
                snapshot_content_name: Some(String::new()),
                snapshot_class_name: Some(String::new()),
                ..Default::default()
            },
        );
        assert_eq!(snap.content_name(), None);
        assert_eq!(snap.class_name(), None);
        assert!(!snap.is_ready());
        assert!(snap.status_error().is_none());
    }
}
