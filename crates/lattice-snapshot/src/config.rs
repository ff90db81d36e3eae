//! Controller configuration
//!
//! [`ControllerConfig`] is a `clap::Args` group so a driver sidecar can
//! flatten it into its own command line. Every flag can also be supplied
//! through the environment.

use std::time::Duration;

use clap::Args;
use lattice_common::{Error, Result};

/// Runtime settings for the snapshot controller
#[derive(Args, Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Name of the CSI driver this controller serves
    #[arg(long, env = "SNAPSHOT_DRIVER_NAME")]
    pub driver_name: String,

    /// Worker tasks per queue
    #[arg(long, env = "SNAPSHOT_WORKERS", default_value_t = 10)]
    pub workers: usize,

    /// Seconds between full re-enqueues of every cached object
    #[arg(long, env = "SNAPSHOT_RESYNC_PERIOD_SECS", default_value_t = 60)]
    pub resync_period_secs: u64,

    /// Attempts for the status write and content create after a backend snapshot is cut
    #[arg(long, env = "SNAPSHOT_CREATE_CONTENT_RETRY_COUNT", default_value_t = 5)]
    pub create_content_retry_count: u32,

    /// Seconds between those attempts
    #[arg(long, env = "SNAPSHOT_CREATE_CONTENT_RETRY_INTERVAL_SECS", default_value_t = 10)]
    pub create_content_retry_interval_secs: u64,

    /// Timeout for a single driver call
    #[arg(long, env = "SNAPSHOT_DRIVER_TIMEOUT_SECS", default_value_t = 10)]
    pub driver_timeout_secs: u64,

    /// Prefix of backend snapshot names
    #[arg(long, env = "SNAPSHOT_NAME_PREFIX", default_value = "snapshot")]
    pub snapshot_name_prefix: String,

    /// Truncate the UID in backend snapshot names to this many characters (dashes removed)
    #[arg(long, env = "SNAPSHOT_NAME_UUID_LENGTH")]
    pub snapshot_name_uuid_length: Option<usize>,

    /// Run only while holding the leader lease
    #[arg(long, env = "SNAPSHOT_LEADER_ELECTION", default_value_t = false)]
    pub leader_election: bool,

    /// Namespace of the leader lease
    #[arg(long, env = "POD_NAMESPACE", default_value = "kube-system")]
    pub leader_election_namespace: String,

    /// Holder identity written to the lease
    #[arg(long, env = "POD_NAME")]
    pub leader_election_identity: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            driver_name: String::new(),
            workers: 10,
            resync_period_secs: 60,
            create_content_retry_count: 5,
            create_content_retry_interval_secs: 10,
            driver_timeout_secs: 10,
            snapshot_name_prefix: "snapshot".to_string(),
            snapshot_name_uuid_length: None,
            leader_election: false,
            leader_election_namespace: "kube-system".to_string(),
            leader_election_identity: None,
        }
    }
}

impl ControllerConfig {
    /// Config for the given driver with every other setting at its default
    pub fn for_driver(driver_name: impl Into<String>) -> Self {
        Self {
            driver_name: driver_name.into(),
            ..Default::default()
        }
    }

    /// Reject settings the controller cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.driver_name.is_empty() {
            return Err(Error::validation_for_field(
                "config",
                "driver_name",
                "driver name must not be empty",
            ));
        }
        if self.workers == 0 {
            return Err(Error::validation_for_field(
                "config",
                "workers",
                "at least one worker is required",
            ));
        }
        if self.create_content_retry_count == 0 {
            return Err(Error::validation_for_field(
                "config",
                "create_content_retry_count",
                "retry count must be at least 1",
            ));
        }
        if self.snapshot_name_uuid_length == Some(0) {
            return Err(Error::validation_for_field(
                "config",
                "snapshot_name_uuid_length",
                "uuid length must be positive",
            ));
        }
        Ok(())
    }

    /// Resync period as a duration
    pub fn resync_period(&self) -> Duration {
        Duration::from_secs(self.resync_period_secs)
    }

    /// Interval between bounded create retries
    pub fn create_content_retry_interval(&self) -> Duration {
        Duration::from_secs(self.create_content_retry_interval_secs)
    }

    /// Per-call driver timeout
    pub fn driver_timeout(&self) -> Duration {
        Duration::from_secs(self.driver_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        config: ControllerConfig,
    }

    #[test]
    fn flags_default_like_the_struct() {
        let cli = Cli::try_parse_from(["test", "--driver-name", "hostpath.csi.k8s.io"])
            .expect("parse");
        let expected = ControllerConfig {
            leader_election_namespace: cli.config.leader_election_namespace.clone(),
            leader_election_identity: cli.config.leader_election_identity.clone(),
            ..ControllerConfig::for_driver("hostpath.csi.k8s.io")
        };
        assert_eq!(cli.config, expected);
        assert_eq!(cli.config.resync_period(), Duration::from_secs(60));
        assert_eq!(cli.config.driver_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "test",
            "--driver-name",
            "d",
            "--workers",
            "2",
            "--snapshot-name-uuid-length",
            "8",
            "--leader-election",
        ])
        .expect("parse");
        assert_eq!(cli.config.workers, 2);
        assert_eq!(cli.config.snapshot_name_uuid_length, Some(8));
        assert!(cli.config.leader_election);
    }

    #[test]
    fn validate_rejects_unusable_settings() {
        assert!(ControllerConfig::default().validate().is_err());
        assert!(ControllerConfig::for_driver("d").validate().is_ok());

        let config = ControllerConfig {
            workers: 0,
            ..ControllerConfig::for_driver("d")
        };
        assert!(config.validate().is_err());

        let config = ControllerConfig {
            snapshot_name_uuid_length: Some(0),
            ..ControllerConfig::for_driver("d")
        };
        assert!(config.validate().is_err());
    }
}
