//! Custom resources for volume snapshots
//!
//! Typed definitions of the snapshot.storage.k8s.io/v1alpha1 kinds the
//! snapshot controller reconciles.

mod snapshot_class;
mod snapshot_content;
mod volume_snapshot;

pub use snapshot_class::{VolumeSnapshotClass, IS_DEFAULT_SNAPSHOT_CLASS_ANNOTATION};
pub use snapshot_content::{
    CsiVolumeSnapshotSource, DeletionPolicy, VolumeSnapshotContent, VolumeSnapshotContentSpec,
};
pub use volume_snapshot::{VolumeSnapshot, VolumeSnapshotSpec, VolumeSnapshotStatus};

/// API group of all snapshot kinds
pub const SNAPSHOT_GROUP: &str = "snapshot.storage.k8s.io";

/// API version served for all snapshot kinds
pub const SNAPSHOT_VERSION: &str = "v1alpha1";

/// Finalizer guarding a VolumeSnapshot while a restore from it is pending
pub const VOLUME_SNAPSHOT_FINALIZER: &str =
    "snapshot.storage.kubernetes.io/volumesnapshot-protection";

/// Finalizer guarding a VolumeSnapshotContent while a snapshot is bound to it
pub const VOLUME_SNAPSHOT_CONTENT_FINALIZER: &str =
    "snapshot.storage.kubernetes.io/volumesnapshotcontent-protection";
