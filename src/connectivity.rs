use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use rand::Rng;
use tokio::net::lookup_host;
use tokio::process::Command;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use crate::config::{NetworkConfig, PolicyParams};

/// Well-known hostnames for the Phase 1 DNS check; two lookups are raced
/// and the first success wins.
const DNS_PROBE_HOSTS: [&str; 2] = ["google.com:443", "cloudflare.com:443"];

const RECOVERY_ACTION_TIMEOUT: Duration = Duration::from_secs(20);

/// Basic-connectivity signals (interface addresses, DNS). Trait so tests
/// can script phase outcomes.
pub trait LinkProbe: Send + Sync {
    /// At least one non-loopback interface holds a non-link-local address.
    fn has_global_address(&self) -> BoxFuture<'_, bool>;
    /// At least one well-known hostname resolves.
    fn dns_resolves(&self) -> BoxFuture<'_, bool>;
}

/// One cloud-reachability attempt. Returns the HTTP status, or `None` on a
/// transport error. Retry policy lives in the manager, not here.
pub trait CloudProbe: Send + Sync {
    fn head(&self) -> BoxFuture<'_, Option<u16>>;
}

/// Staged network recovery actions, least to most disruptive. Modeled as a
/// capability interface so the staged-recovery policy is testable with a
/// fake implementation.
pub trait NetworkRecovery: Send + Sync {
    fn reapply_interface(&self) -> BoxFuture<'_, std::io::Result<()>>;
    fn bring_up(&self) -> BoxFuture<'_, std::io::Result<()>>;
    fn reload_manager(&self) -> BoxFuture<'_, std::io::Result<()>>;
}

/// OS implementation of `LinkProbe`: `ip -o addr` for addresses, tokio's
/// resolver for DNS.
pub struct OsLinkProbe;

impl LinkProbe for OsLinkProbe {
    fn has_global_address(&self) -> BoxFuture<'_, bool> {
        async {
            // scope global excludes loopback and link-local in one pass
            let output = Command::new("ip")
                .args(["-o", "addr", "show", "scope", "global"])
                .output()
                .await;
            match output {
                Ok(out) if out.status.success() => {
                    let text = String::from_utf8_lossy(&out.stdout);
                    let found = text
                        .lines()
                        .any(|line| line.contains(" inet ") || line.contains(" inet6 "));
                    trace!(found, "Interface address scan");
                    found
                }
                Ok(out) => {
                    warn!(status = ?out.status, "ip addr scan failed");
                    false
                }
                Err(e) => {
                    warn!(error = %e, "Could not run ip addr scan");
                    false
                }
            }
        }
        .boxed()
    }

    fn dns_resolves(&self) -> BoxFuture<'_, bool> {
        async {
            let lookups = DNS_PROBE_HOSTS
                .iter()
                .map(|host| {
                    async move {
                        match lookup_host(*host).await {
                            Ok(mut addrs) => addrs.next().ok_or(()),
                            Err(_) => Err(()),
                        }
                    }
                    .boxed()
                })
                .collect::<Vec<_>>();
            match futures::future::select_ok(lookups).await {
                Ok((addr, _)) => {
                    trace!(%addr, "DNS probe resolved");
                    true
                }
                Err(()) => {
                    debug!("Neither DNS probe hostname resolved");
                    false
                }
            }
        }
        .boxed()
    }
}

/// HEAD probe against the cloud service, bounded by the per-attempt timeout.
pub struct HttpCloudProbe {
    client: Arc<reqwest::Client>,
    url: String,
    attempt_timeout: Duration,
}

impl HttpCloudProbe {
    pub fn new(client: Arc<reqwest::Client>, url: String, attempt_timeout: Duration) -> Self {
        HttpCloudProbe {
            client,
            url,
            attempt_timeout,
        }
    }
}

impl CloudProbe for HttpCloudProbe {
    fn head(&self) -> BoxFuture<'_, Option<u16>> {
        async {
            let request = self
                .client
                .head(&self.url)
                .timeout(self.attempt_timeout)
                .send();
            match request.await {
                Ok(response) => Some(response.status().as_u16()),
                Err(e) => {
                    debug!(error = %e, "Cloud HEAD probe transport error");
                    None
                }
            }
        }
        .boxed()
    }
}

/// Recovery actions issued through NetworkManager's CLI.
pub struct NmcliRecovery {
    device: String,
    connection: String,
}

impl NmcliRecovery {
    pub fn new(network: &NetworkConfig) -> Self {
        NmcliRecovery {
            device: network.wifi_device.clone(),
            connection: network.wifi_connection.clone(),
        }
    }

    async fn run(program: &str, args: &[&str]) -> std::io::Result<()> {
        let status = timeout(
            RECOVERY_ACTION_TIMEOUT,
            Command::new(program).args(args).status(),
        )
        .await
        .map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::TimedOut, "recovery command timed out")
        })??;
        if status.success() {
            Ok(())
        } else {
            Err(std::io::Error::other(format!(
                "{program} exited with {status}"
            )))
        }
    }
}

impl NetworkRecovery for NmcliRecovery {
    fn reapply_interface(&self) -> BoxFuture<'_, std::io::Result<()>> {
        async { Self::run("nmcli", &["device", "reapply", &self.device]).await }.boxed()
    }

    fn bring_up(&self) -> BoxFuture<'_, std::io::Result<()>> {
        async { Self::run("nmcli", &["connection", "up", &self.connection]).await }.boxed()
    }

    fn reload_manager(&self) -> BoxFuture<'_, std::io::Result<()>> {
        async { Self::run("systemctl", &["restart", "NetworkManager"]).await }.boxed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecoveryStage {
    Reapply,
    BringUp,
    Reload,
}

/// Staged two-phase connectivity establishment. Phase 1 (addresses + DNS)
/// must succeed before any cloud probe is attempted; while Phase 1 keeps
/// failing, recovery actions fire at configured failure counts, at most one
/// in flight at a time. Transient failures are logged, never propagated.
pub struct ConnectivityManager {
    link: Arc<dyn LinkProbe>,
    cloud: Arc<dyn CloudProbe>,
    recovery: Arc<dyn NetworkRecovery>,
    policy: PolicyParams,
}

impl ConnectivityManager {
    pub fn new(
        link: Arc<dyn LinkProbe>,
        cloud: Arc<dyn CloudProbe>,
        recovery: Arc<dyn NetworkRecovery>,
        policy: PolicyParams,
    ) -> Self {
        ConnectivityManager {
            link,
            cloud,
            recovery,
            policy,
        }
    }

    /// Run both phases to completion. Returns `true` once the cloud is
    /// reachable, `false` when the overall timeout elapses or the probe
    /// budget is exhausted. The timeout aborts whatever probe is in flight.
    pub async fn wait_until_connected(&self) -> bool {
        match timeout(self.policy.overall_timeout(), self.run_phases()).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    timeout_secs = self.policy.overall_timeout_secs,
                    "Connectivity not established within overall timeout"
                );
                false
            }
        }
    }

    async fn run_phases(&self) -> bool {
        self.wait_for_basic_connectivity().await;
        // drop back to the short interval now the expensive part is done
        sleep(self.policy.post_phase1_interval()).await;
        self.probe_cloud_with_retries().await
    }

    /// Phase 1: poll until an address and DNS are both present, issuing
    /// staged recovery actions along the way. Only the overall timeout
    /// bounds this loop.
    async fn wait_for_basic_connectivity(&self) {
        let mut failures: u32 = 0;
        let mut interval = self.policy.initial_interval();

        loop {
            let has_address = self.link.has_global_address().await;
            let dns_ok = if has_address {
                self.link.dns_resolves().await
            } else {
                false
            };

            if has_address && dns_ok {
                info!(failures, "Basic connectivity established (IP + DNS)");
                return;
            }

            failures += 1;
            debug!(failures, has_address, dns_ok, "Basic connectivity not yet present");

            if let Some(stage) = self.recovery_stage_for(failures) {
                self.run_recovery(stage).await;
            }

            if failures > self.policy.backoff_growth_after {
                interval = interval
                    .mul_f64(self.policy.backoff_factor)
                    .min(self.policy.max_interval());
            }
            sleep(with_jitter(interval)).await;
        }
    }

    fn recovery_stage_for(&self, failures: u32) -> Option<RecoveryStage> {
        if failures == self.policy.recovery_reapply_after {
            Some(RecoveryStage::Reapply)
        } else if failures == self.policy.recovery_bring_up_after {
            Some(RecoveryStage::BringUp)
        } else if failures == self.policy.recovery_reload_after {
            Some(RecoveryStage::Reload)
        } else {
            None
        }
    }

    /// Run one staged recovery action to completion. Awaiting here is what
    /// keeps recovery actions from overlapping: the next poll cycle cannot
    /// start until the action (bounded by its own timeout) has finished.
    async fn run_recovery(&self, stage: RecoveryStage) {
        info!(?stage, "Issuing network recovery action");
        let result = match stage {
            RecoveryStage::Reapply => self.recovery.reapply_interface().await,
            RecoveryStage::BringUp => self.recovery.bring_up().await,
            RecoveryStage::Reload => self.recovery.reload_manager().await,
        };
        match result {
            Ok(()) => info!(?stage, "Recovery action completed"),
            Err(e) => warn!(?stage, error = %e, "Recovery action failed"),
        }
    }

    /// Phase 2: HEAD the cloud service. 2xx and the cold-start redirect
    /// codes count as success. Retries are front-loaded with longer waits
    /// while the service may still be waking up.
    async fn probe_cloud_with_retries(&self) -> bool {
        for attempt in 1..=self.policy.probe_attempts {
            match self.cloud.head().await {
                Some(status) if probe_status_ok(status) => {
                    info!(status, attempt, "Cloud service reachable");
                    return true;
                }
                Some(status) => {
                    warn!(status, attempt, "Cloud probe rejected");
                }
                None => {
                    warn!(attempt, "Cloud probe failed (transport)");
                }
            }
            if attempt < self.policy.probe_attempts {
                sleep(self.policy.probe_wait(attempt)).await;
            }
        }
        error!(
            attempts = self.policy.probe_attempts,
            "Cloud service unreachable after all probe attempts"
        );
        false
    }
}

fn probe_status_ok(status: u16) -> bool {
    (200..300).contains(&status) || status == 302
}

/// Spread concurrent rebooting units out a little (+/-10%). The floor keeps
/// a zero-length interval from busy-spinning the poll loop.
fn with_jitter(base: Duration) -> Duration {
    let factor = rand::rng().random_range(0.9..1.1);
    base.mul_f64(factor).max(Duration::from_millis(10))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn acceptable_probe_statuses() {
        assert!(probe_status_ok(200));
        assert!(probe_status_ok(204));
        assert!(probe_status_ok(302));
        assert!(!probe_status_ok(301));
        assert!(!probe_status_ok(404));
        assert!(!probe_status_ok(500));
    }

    struct ScriptedLink {
        succeed_after: u32,
        calls: AtomicU32,
    }

    impl LinkProbe for ScriptedLink {
        fn has_global_address(&self) -> BoxFuture<'_, bool> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { n >= self.succeed_after }.boxed()
        }
        fn dns_resolves(&self) -> BoxFuture<'_, bool> {
            async { true }.boxed()
        }
    }

    struct CountingCloud {
        status: u16,
        calls: Arc<AtomicU32>,
    }

    impl CloudProbe for CountingCloud {
        fn head(&self) -> BoxFuture<'_, Option<u16>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let status = self.status;
            async move { Some(status) }.boxed()
        }
    }

    pub(crate) struct RecordingRecovery {
        pub reapplies: AtomicU32,
        pub bring_ups: AtomicU32,
        pub reloads: AtomicU32,
    }

    impl RecordingRecovery {
        pub(crate) fn new() -> Self {
            RecordingRecovery {
                reapplies: AtomicU32::new(0),
                bring_ups: AtomicU32::new(0),
                reloads: AtomicU32::new(0),
            }
        }
    }

    impl NetworkRecovery for RecordingRecovery {
        fn reapply_interface(&self) -> BoxFuture<'_, std::io::Result<()>> {
            self.reapplies.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }.boxed()
        }
        fn bring_up(&self) -> BoxFuture<'_, std::io::Result<()>> {
            self.bring_ups.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }.boxed()
        }
        fn reload_manager(&self) -> BoxFuture<'_, std::io::Result<()>> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }.boxed()
        }
    }

    fn fast_policy() -> PolicyParams {
        let mut policy = PolicyParams::default();
        policy.initial_interval_secs = 0;
        policy.max_interval_secs = 0;
        policy.post_phase1_interval_secs = 0;
        policy.probe_early_wait_secs = 0;
        policy.probe_late_wait_secs = 0;
        policy.overall_timeout_secs = 5;
        policy
    }

    #[tokio::test]
    async fn cloud_probe_waits_for_phase1() {
        let cloud_calls = Arc::new(AtomicU32::new(0));
        let manager = ConnectivityManager::new(
            Arc::new(ScriptedLink {
                succeed_after: 3,
                calls: AtomicU32::new(0),
            }),
            Arc::new(CountingCloud {
                status: 200,
                calls: cloud_calls.clone(),
            }),
            Arc::new(RecordingRecovery::new()),
            fast_policy(),
        );

        assert!(manager.wait_until_connected().await);
        // exactly one probe, issued only after phase 1 came up
        assert_eq!(cloud_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn persistent_500_exhausts_the_probe_budget() {
        let cloud_calls = Arc::new(AtomicU32::new(0));
        let manager = ConnectivityManager::new(
            Arc::new(ScriptedLink {
                succeed_after: 1,
                calls: AtomicU32::new(0),
            }),
            Arc::new(CountingCloud {
                status: 500,
                calls: cloud_calls.clone(),
            }),
            Arc::new(RecordingRecovery::new()),
            fast_policy(),
        );

        assert!(!manager.wait_until_connected().await);
        assert_eq!(cloud_calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn redirect_counts_as_reachable() {
        let manager = ConnectivityManager::new(
            Arc::new(ScriptedLink {
                succeed_after: 1,
                calls: AtomicU32::new(0),
            }),
            Arc::new(CountingCloud {
                status: 302,
                calls: Arc::new(AtomicU32::new(0)),
            }),
            Arc::new(RecordingRecovery::new()),
            fast_policy(),
        );
        assert!(manager.wait_until_connected().await);
    }

    #[tokio::test]
    async fn recovery_actions_fire_in_stage_order() {
        let recovery = Arc::new(RecordingRecovery::new());
        let manager = ConnectivityManager::new(
            // phase 1 comes up just after the reload stage has fired
            Arc::new(ScriptedLink {
                succeed_after: 20,
                calls: AtomicU32::new(0),
            }),
            Arc::new(CountingCloud {
                status: 204,
                calls: Arc::new(AtomicU32::new(0)),
            }),
            recovery.clone(),
            fast_policy(),
        );

        assert!(manager.wait_until_connected().await);
        assert_eq!(recovery.reapplies.load(Ordering::SeqCst), 1);
        assert_eq!(recovery.bring_ups.load(Ordering::SeqCst), 1);
        assert_eq!(recovery.reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn overall_timeout_caps_the_wait() {
        struct NeverLink;
        impl LinkProbe for NeverLink {
            fn has_global_address(&self) -> BoxFuture<'_, bool> {
                async { false }.boxed()
            }
            fn dns_resolves(&self) -> BoxFuture<'_, bool> {
                async { false }.boxed()
            }
        }

        let mut policy = fast_policy();
        // nonzero interval so the wait loop parks in sleep and the outer
        // timeout gets a chance to fire
        policy.initial_interval_secs = 1;
        policy.max_interval_secs = 1;
        policy.overall_timeout_secs = 1;
        let manager = ConnectivityManager::new(
            Arc::new(NeverLink),
            Arc::new(CountingCloud {
                status: 200,
                calls: Arc::new(AtomicU32::new(0)),
            }),
            Arc::new(RecordingRecovery::new()),
            policy,
        );
        assert!(!manager.wait_until_connected().await);
    }
}
