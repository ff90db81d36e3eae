//! VolumeSnapshotContent Custom Resource Definition
//!
//! The cluster-scoped, backend-facing record of a snapshot handle. Bound to
//! one VolumeSnapshot through `volumeSnapshotRef`; an empty UID in that
//! reference means the content is reserved but not yet bound.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// What happens to the backend snapshot once its VolumeSnapshot is gone
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum DeletionPolicy {
    /// Keep the backend snapshot and the content object
    #[default]
    Retain,
    /// Delete the backend snapshot, then the content object
    Delete,
    /// Any other value written by a user
    Unsupported(String),
}

impl DeletionPolicy {
    fn as_str(&self) -> &str {
        match self {
            Self::Retain => "Retain",
            Self::Delete => "Delete",
            Self::Unsupported(s) => s,
        }
    }
}

impl std::fmt::Display for DeletionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for DeletionPolicy {
    fn from(s: &str) -> Self {
        match s {
            "Retain" => Self::Retain,
            "Delete" => Self::Delete,
            other => Self::Unsupported(other.to_string()),
        }
    }
}

impl Serialize for DeletionPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DeletionPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from(s.as_str()))
    }
}

/// Backend fields reported by a CSI snapshot driver
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CsiVolumeSnapshotSource {
    /// Driver that owns the snapshot
    pub driver: String,

    /// Opaque backend identifier
    pub snapshot_handle: String,

    /// Creation time in nanoseconds since the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<i64>,

    /// Restore size in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_size: Option<i64>,
}

/// Specification for a VolumeSnapshotContent
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "snapshot.storage.k8s.io",
    version = "v1alpha1",
    kind = "VolumeSnapshotContent",
    plural = "volumesnapshotcontents",
    shortname = "vsc",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Snapshot","type":"string","jsonPath":".spec.volumeSnapshotRef.name"}"#,
    printcolumn = r#"{"name":"Policy","type":"string","jsonPath":".spec.deletionPolicy"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotContentSpec {
    /// CSI backend fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csi_volume_snapshot_source: Option<CsiVolumeSnapshotSource>,

    /// Snapshot this content is bound to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_ref: Option<ObjectReference>,

    /// Volume the snapshot was cut from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_ref: Option<ObjectReference>,

    /// Class the snapshot was created with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_class_name: Option<String>,

    /// Backend cleanup policy; absent means Retain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub deletion_policy: Option<DeletionPolicy>,
}

impl VolumeSnapshotContent {
    /// Cache and queue key: the bare name
    pub fn key(&self) -> String {
        self.name_any()
    }

    /// Effective deletion policy
    pub fn deletion_policy(&self) -> DeletionPolicy {
        self.spec.deletion_policy.clone().unwrap_or_default()
    }

    /// Class name, or `None` when unset or empty
    pub fn class_name(&self) -> Option<&str> {
        self.spec
            .snapshot_class_name
            .as_deref()
            .filter(|n| !n.is_empty())
    }

    /// `namespace/name` of the referenced snapshot
    pub fn snapshot_key(&self) -> Option<String> {
        let r = self.spec.volume_snapshot_ref.as_ref()?;
        Some(format!(
            "{}/{}",
            r.namespace.as_deref().unwrap_or_default(),
            r.name.as_deref().unwrap_or_default()
        ))
    }

    /// Backend handle, if the CSI source is populated
    pub fn snapshot_handle(&self) -> Option<&str> {
        self.spec
            .csi_volume_snapshot_source
            .as_ref()
            .map(|s| s.snapshot_handle.as_str())
    }
}
