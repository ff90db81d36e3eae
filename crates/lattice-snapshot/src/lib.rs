//! Volume snapshot controller for CSI drivers
//!
//! Binds VolumeSnapshots to VolumeSnapshotContents and drives a
//! [`SnapshotDriver`] to cut and delete backend snapshots. A driver sidecar
//! embeds it by implementing [`SnapshotDriver`] and calling [`runner::run`].
//!
//! Related crates:
//! - `lattice-common`: CRDs, errors, events, retry and leader election

pub mod api;
pub mod binding;
pub mod cache;
pub mod class;
pub mod config;
pub mod controller;
pub mod credentials;
pub mod driver;
pub mod operations;
pub mod queue;
pub mod runner;
pub mod source;

#[cfg(test)]
mod testing;

pub use api::{KubeSnapshotApi, SnapshotApi};
pub use config::ControllerConfig;
pub use controller::{Context, ContextBuilder};
pub use driver::{CreatedSnapshot, DriverHandler, SnapshotDriver, SnapshotStatus};
pub use runner::run;

// Re-export common error types
pub use lattice_common::{Error, Result};
