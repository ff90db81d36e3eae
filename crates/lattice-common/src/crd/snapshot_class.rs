//! VolumeSnapshotClass resource
//!
//! Cluster-scoped parameter set for a snapshotter. Unlike most CRDs its
//! fields sit at the top level rather than under `spec`, so the `Resource`
//! impl is written by hand instead of derived.

use std::borrow::Cow;
use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::ClusterResourceScope;
use kube::Resource;
use serde::{Deserialize, Serialize};

use super::{DeletionPolicy, SNAPSHOT_GROUP, SNAPSHOT_VERSION};

/// Annotation marking a class as the default for its snapshotter
pub const IS_DEFAULT_SNAPSHOT_CLASS_ANNOTATION: &str =
    "snapshot.storage.kubernetes.io/is-default-class";

/// A VolumeSnapshotClass
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotClass {
    /// Standard object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// Driver name this class applies to
    #[serde(default)]
    pub snapshotter: String,

    /// Opaque driver parameters, plus reserved `csi.storage.k8s.io/` keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<BTreeMap<String, String>>,

    /// Policy given to content created with this class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<DeletionPolicy>,
}

impl VolumeSnapshotClass {
    /// Whether the default-class annotation is set to "true"
    pub fn is_default(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(IS_DEFAULT_SNAPSHOT_CLASS_ANNOTATION))
            .is_some_and(|v| v == "true")
    }
}

impl Resource for VolumeSnapshotClass {
    type DynamicType = ();
    type Scope = ClusterResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        "VolumeSnapshotClass".into()
    }

    fn group(_: &()) -> Cow<'_, str> {
        SNAPSHOT_GROUP.into()
    }

    fn version(_: &()) -> Cow<'_, str> {
        SNAPSHOT_VERSION.into()
    }

    fn plural(_: &()) -> Cow<'_, str> {
        "volumesnapshotclasses".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
