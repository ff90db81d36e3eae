//! Common types for the snapshot controller: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod leader_election;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the core PersistentVolumeClaim kind (the empty group)
pub const CORE_API_GROUP: &str = "";

/// Kind a VolumeSnapshot source must reference
pub const PVC_KIND: &str = "PersistentVolumeClaim";
