//! Waiting for the control plane to show what we created.
//!
//! Convergence means every expected network is listed and has at least one
//! subnet attached. The wait is a deadline-bounded poll loop: each listing
//! query is itself bounded by the deadline, and queries are spaced at least
//! one poll interval apart.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::time::Duration;

use netfuzz_common::{NamingScheme, ResourceIndex};
use tokio::time::Instant;

use crate::client::NetworkRow;
use crate::error::HarnessError;
use crate::signal::AbortToken;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Floor for the poll interval so a bad config cannot hammer the API.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Source of network listings.
pub trait NetworkLister {
    fn list_networks(&self) -> impl Future<Output = Result<Vec<NetworkRow>, HarnessError>> + Send;
}

/// The session's networks as seen in one listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvergenceSnapshot {
    /// Only rows whose name belongs to this session's naming scheme and
    /// expected index set.
    pub networks: BTreeMap<ResourceIndex, NetworkRow>,
    /// Rows that were listed but are not ours.
    pub ignored: usize,
}

impl ConvergenceSnapshot {
    pub fn from_rows(
        rows: Vec<NetworkRow>,
        naming: &NamingScheme,
        expected: &BTreeSet<ResourceIndex>,
    ) -> Self {
        let mut snapshot = Self::default();
        for row in rows {
            match naming.parse_network(&row.name) {
                Some(index) if expected.contains(&index) => {
                    snapshot.networks.insert(index, row);
                }
                _ => snapshot.ignored += 1,
            }
        }
        snapshot
    }

    /// Expected indices that are absent or have no subnet yet.
    pub fn missing(&self, expected: &BTreeSet<ResourceIndex>) -> Vec<ResourceIndex> {
        expected
            .iter()
            .filter(|index| !self.networks.get(index).is_some_and(NetworkRow::has_subnet))
            .copied()
            .collect()
    }

    pub fn is_converged(&self, expected: &BTreeSet<ResourceIndex>) -> bool {
        self.missing(expected).is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ConvergenceWatcher {
    naming: NamingScheme,
    timeout: Duration,
    poll_interval: Duration,
}

impl ConvergenceWatcher {
    pub fn new(naming: NamingScheme, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            naming,
            timeout,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Poll until every expected index is present with a subnet.
    ///
    /// Fails with [`HarnessError::ConvergenceTimeout`] once the deadline
    /// passes, abandoning any query still in flight, and with
    /// [`HarnessError::Interrupted`] if `abort` fires first.
    pub async fn await_convergence<L: NetworkLister>(
        &self,
        lister: &L,
        expected: &[ResourceIndex],
        abort: &AbortToken,
    ) -> Result<ConvergenceSnapshot, HarnessError> {
        let expected: BTreeSet<ResourceIndex> = expected.iter().copied().collect();
        let deadline = Instant::now() + self.timeout;
        let mut missing: Vec<ResourceIndex> = expected.iter().copied().collect();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let attempt_started = Instant::now();

            let listed = tokio::select! {
                biased;
                _ = abort.aborted() => return Err(HarnessError::Interrupted),
                listed = tokio::time::timeout_at(deadline, lister.list_networks()) => listed,
            };

            match listed {
                Err(_elapsed) => return Err(self.timed_out(missing)),
                Ok(Ok(rows)) => {
                    let snapshot = ConvergenceSnapshot::from_rows(rows, &self.naming, &expected);
                    missing = snapshot.missing(&expected);
                    if missing.is_empty() {
                        tracing::info!(
                            attempt,
                            networks = snapshot.networks.len(),
                            ignored = snapshot.ignored,
                            "resources converged"
                        );
                        return Ok(snapshot);
                    }
                    tracing::debug!(attempt, missing = missing.len(), "not converged yet");
                }
                Ok(Err(e)) => {
                    tracing::warn!(attempt, error = %e, "network listing failed, retrying");
                }
            }

            let next = attempt_started + self.poll_interval;
            let wake = next.min(deadline);
            tokio::select! {
                biased;
                _ = abort.aborted() => return Err(HarnessError::Interrupted),
                _ = tokio::time::sleep_until(wake) => {}
            }
            if wake >= deadline {
                return Err(self.timed_out(missing));
            }
        }
    }

    fn timed_out(&self, missing: Vec<ResourceIndex>) -> HarnessError {
        tracing::error!(
            timeout_ms = self.timeout.as_millis() as u64,
            missing = missing.len(),
            "convergence timed out"
        );
        HarnessError::ConvergenceTimeout {
            timeout: self.timeout,
            missing,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    fn row(name: &str, subnets: &str) -> NetworkRow {
        NetworkRow {
            name: name.into(),
            subnets: subnets.into(),
        }
    }

    fn ids(v: &[u32]) -> Vec<ResourceIndex> {
        v.iter().copied().map(ResourceIndex).collect()
    }

    /// Replays canned listings, repeating the last one forever.
    struct ScriptedLister {
        responses: Mutex<Vec<Result<Vec<NetworkRow>, HarnessError>>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedLister {
        fn new(responses: Vec<Result<Vec<NetworkRow>, HarnessError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl NetworkLister for ScriptedLister {
        fn list_networks(&self) -> impl Future<Output = Result<Vec<NetworkRow>, HarnessError>> + Send {
            async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                let mut responses = self.responses.lock().unwrap();
                if responses.len() > 1 {
                    responses.remove(0)
                } else {
                    match responses.first() {
                        Some(Ok(rows)) => Ok(rows.clone()),
                        _ => Err(HarnessError::Query {
                            kind: netfuzz_common::CommandKind::ListNetworks,
                            detail: "scripted failure".into(),
                        }),
                    }
                }
            }
        }
    }

    fn watcher(timeout_ms: u64, poll_ms: u64) -> ConvergenceWatcher {
        ConvergenceWatcher::new(
            NamingScheme::default(),
            Duration::from_millis(timeout_ms),
            Duration::from_millis(poll_ms),
        )
    }

    #[tokio::test]
    async fn converges_once_every_network_has_a_subnet() {
        let lister = ScriptedLister::new(vec![
            Ok(vec![row("net1", "")]),
            Ok(vec![row("net1", "a 10.0.1.0/24"), row("net2", "")]),
            Ok(vec![row("net1", "a 10.0.1.0/24"), row("net2", "b 10.0.2.0/24")]),
        ]);
        let snapshot = watcher(5_000, 50)
            .await_convergence(&lister, &ids(&[1, 2]), &AbortToken::new())
            .await
            .unwrap();
        assert_eq!(lister.calls(), 3);
        assert_eq!(snapshot.networks.len(), 2);
        assert!(snapshot.networks[&ResourceIndex(2)].has_subnet());
    }

    #[tokio::test]
    async fn foreign_networks_do_not_count() {
        // `public` and `net9` have subnets but are not ours; net2 is missing.
        let lister = ScriptedLister::new(vec![Ok(vec![
            row("public", "x 172.24.4.0/24"),
            row("net9", "y 10.0.9.0/24"),
            row("net1", "a 10.0.1.0/24"),
        ])]);
        let err = watcher(300, 50)
            .await_convergence(&lister, &ids(&[1, 2]), &AbortToken::new())
            .await
            .unwrap_err();
        match err {
            HarnessError::ConvergenceTimeout { missing, .. } => assert_eq!(missing, ids(&[2])),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn snapshot_filters_and_counts_ignored_rows() {
        let expected: BTreeSet<_> = ids(&[1, 2]).into_iter().collect();
        let snapshot = ConvergenceSnapshot::from_rows(
            vec![row("net1", "a"), row("public", "b"), row("net3", "c"), row("net2", "")],
            &NamingScheme::default(),
            &expected,
        );
        assert_eq!(snapshot.networks.len(), 2);
        assert_eq!(snapshot.ignored, 2);
        assert_eq!(snapshot.missing(&expected), ids(&[2]));
        assert!(!snapshot.is_converged(&expected));
    }

    #[tokio::test]
    async fn timeout_fires_at_deadline_not_before() {
        let lister = ScriptedLister::new(vec![Ok(vec![row("net1", "")])]);
        let started = std::time::Instant::now();
        let err = watcher(400, 50)
            .await_convergence(&lister, &ids(&[1]), &AbortToken::new())
            .await
            .unwrap_err();
        let elapsed = started.elapsed();
        assert!(matches!(err, HarnessError::ConvergenceTimeout { .. }), "{err}");
        assert!(elapsed >= Duration::from_millis(400), "fired early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1_500), "fired late: {elapsed:?}");
    }

    #[tokio::test]
    async fn hung_query_is_abandoned_at_deadline() {
        let mut lister = ScriptedLister::new(vec![Ok(vec![])]);
        lister.delay = Duration::from_secs(60);
        let started = std::time::Instant::now();
        let err = watcher(300, 50)
            .await_convergence(&lister, &ids(&[1, 2]), &AbortToken::new())
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        match err {
            HarnessError::ConvergenceTimeout { missing, .. } => assert_eq!(missing, ids(&[1, 2])),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn polls_are_spaced_by_the_interval() {
        let lister = ScriptedLister::new(vec![Ok(vec![])]);
        let _ = watcher(500, 200)
            .await_convergence(&lister, &ids(&[1]), &AbortToken::new())
            .await;
        // t = 0, 200, 400 ms; never a tight loop.
        assert!(lister.calls() <= 4, "too many polls: {}", lister.calls());
        assert!(lister.calls() >= 2);
    }

    #[tokio::test]
    async fn failed_queries_are_retried() {
        let lister = ScriptedLister::new(vec![
            Err(HarnessError::Query {
                kind: netfuzz_common::CommandKind::ListNetworks,
                detail: "503".into(),
            }),
            Ok(vec![row("net1", "a")]),
        ]);
        let snapshot = watcher(2_000, 50)
            .await_convergence(&lister, &ids(&[1]), &AbortToken::new())
            .await
            .unwrap();
        assert_eq!(snapshot.networks.len(), 1);
        assert_eq!(lister.calls(), 2);
    }

    #[tokio::test]
    async fn abort_interrupts_the_wait() {
        let lister = ScriptedLister::new(vec![Ok(vec![])]);
        let abort = AbortToken::new();
        let trigger = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.abort();
        });
        let started = std::time::Instant::now();
        let err = watcher(30_000, 50)
            .await_convergence(&lister, &ids(&[1]), &abort)
            .await
            .unwrap_err();
        assert!(err.is_interrupt());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn poll_interval_has_a_floor() {
        let w = watcher(1_000, 0);
        assert_eq!(w.poll_interval, MIN_POLL_INTERVAL);
    }
}
