//! Leader election using Kubernetes Leases
//!
//! Several snapshot controller replicas may run for one driver. Only the
//! holder of the coordination.k8s.io/v1 Lease runs the reconcile loops; the
//! others block in [`LeaderElector::acquire`].
//!
//! Every write carries the resourceVersion that was read, so a replica that
//! loses a race gets 409 Conflict and simply waits for the next round.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::retry::jittered;
use crate::{Error, Result};

/// Prefix of the lease name; the sanitized driver name is appended
pub const LEADER_LEASE_PREFIX: &str = "external-snapshotter-leader";

const LEASE_DURATION: Duration = Duration::from_secs(15);
/// Renewal gives up after this long without a successful write
pub const RENEW_DEADLINE: Duration = Duration::from_secs(10);
const RENEW_INTERVAL: Duration = Duration::from_secs(5);
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Lease name for a driver, with characters Kubernetes rejects replaced by `-`
pub fn lease_name_for_driver(driver: &str) -> String {
    let sanitized: String = driver
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("{}-{}", LEADER_LEASE_PREFIX, sanitized)
}

/// What to do with the lease observed on a given round
#[derive(Debug, Clone, PartialEq, Eq)]
enum LeaseAction {
    /// No lease exists yet
    Create,
    /// We hold it; bump renewTime
    Renew,
    /// Someone else held it but let it expire
    TakeOver {
        /// Transition counter to write
        transitions: i32,
    },
    /// Held by another live replica
    Wait,
}

fn decide(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseAction {
    let Some(lease) = lease else {
        return LeaseAction::Create;
    };
    let spec = lease.spec.as_ref();
    if spec.and_then(|s| s.holder_identity.as_deref()) == Some(identity) {
        return LeaseAction::Renew;
    }
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration = spec.and_then(|s| s.lease_duration_seconds);
    let expired = match (renew_time, duration) {
        (Some(rt), Some(secs)) => now > rt.0 + chrono::Duration::seconds(i64::from(secs)),
        _ => true,
    };
    if expired {
        LeaseAction::TakeOver {
            transitions: spec.and_then(|s| s.lease_transitions).unwrap_or(0) + 1,
        }
    } else {
        LeaseAction::Wait
    }
}

/// Campaigns for one Lease on behalf of this replica
pub struct LeaderElector {
    leases: Api<Lease>,
    lease_name: String,
    identity: String,
    holding: AtomicBool,
}

impl LeaderElector {
    /// Elector for `lease_name` in `namespace`, campaigning as `identity`
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            leases: Api::namespaced(client, namespace),
            lease_name: lease_name.to_string(),
            identity: identity.to_string(),
            holding: AtomicBool::new(false),
        }
    }

    /// Whether the last round left this replica as holder
    pub fn is_leader(&self) -> bool {
        self.holding.load(Ordering::SeqCst)
    }

    /// Retry every few seconds until the lease is ours
    ///
    /// The returned guard renews in the background; await
    /// [`LeaderGuard::lost`] to learn when the lease slipped away.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(identity = %self.identity, lease = %self.lease_name, "campaigning for lease");
        loop {
            match self.round().await {
                Ok(true) => break,
                Ok(false) => debug!(identity = %self.identity, "lease held elsewhere"),
                Err(e) => warn!(identity = %self.identity, error = %e, "lease round failed"),
            }
            tokio::time::sleep(jittered(RETRY_INTERVAL)).await;
        }
        info!(identity = %self.identity, lease = %self.lease_name, "lease acquired");
        self.holding.store(true, Ordering::SeqCst);

        let (lost_tx, lost_rx) = oneshot::channel();
        let renewal = tokio::spawn(Arc::clone(&self).keep_renewed(lost_tx));
        LeaderGuard {
            elector: self,
            renewal,
            lost: Some(lost_rx),
        }
    }

    /// One read-decide-write round; `Ok(true)` means we hold the lease afterwards
    async fn round(&self) -> Result<bool> {
        let now = Utc::now();
        let existing = match self.leases.get(&self.lease_name).await {
            Ok(lease) => Some(lease),
            Err(kube::Error::Api(e)) if e.code == 404 => None,
            Err(e) => return Err(e.into()),
        };

        let written = match decide(existing.as_ref(), &self.identity, now) {
            LeaseAction::Wait => return Ok(false),
            LeaseAction::Create => {
                self.leases
                    .create(&PostParams::default(), &self.lease_for(None, now, 0))
                    .await
            }
            LeaseAction::Renew => {
                let mut renewed = existing.unwrap_or_default();
                if let Some(spec) = renewed.spec.as_mut() {
                    spec.renew_time = Some(MicroTime(now));
                }
                self.leases
                    .replace(&self.lease_name, &PostParams::default(), &renewed)
                    .await
            }
            LeaseAction::TakeOver { transitions } => {
                let version = existing
                    .and_then(|l| l.metadata.resource_version)
                    .ok_or_else(|| {
                        Error::internal_with_context(
                            "leader-election",
                            "lease has no resourceVersion",
                        )
                    })?;
                self.leases
                    .replace(
                        &self.lease_name,
                        &PostParams::default(),
                        &self.lease_for(Some(version), now, transitions),
                    )
                    .await
            }
        };

        match written {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "lost a lease write race");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn lease_for(
        &self,
        resource_version: Option<String>,
        now: DateTime<Utc>,
        transitions: i32,
    ) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    /// Renew until another holder appears or [`RENEW_DEADLINE`] passes without a successful write
    async fn keep_renewed(self: Arc<Self>, lost: oneshot::Sender<()>) {
        let mut last_renewed = Instant::now();
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;
            match self.round().await {
                Ok(true) => last_renewed = Instant::now(),
                Ok(false) => {
                    warn!(identity = %self.identity, "lease taken by another holder");
                    break;
                }
                Err(e) if last_renewed.elapsed() < RENEW_DEADLINE => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        "lease renewal failed, will retry"
                    );
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "lease renewal deadline passed");
                    break;
                }
            }
        }
        self.holding.store(false, Ordering::SeqCst);
        let _ = lost.send(());
    }
}

/// Held while this replica leads; dropping it stops renewal
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal: JoinHandle<()>,
    lost: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Resolves once renewal has given up
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost.take() {
            let _ = rx.await;
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal.abort();
        self.elector.holding.store(false, Ordering::SeqCst);
        debug!(identity = %self.elector.identity, "stopped renewing lease");
    }
}
