//! One fuzzing session: provision, verify, loop, tear down.
//!
//! ```text
//! Initializing ─► Provisioning ─► Converging ─┬─► Completed
//!                                    ▲        │
//!                                    └ Looping ◄┘
//! any state ──(abort / error)──► TearingDown ─► Aborted | Completed
//! ```
//!
//! Teardown runs at most once per session, covers every index whose creation
//! was attempted, and never observes the abort token: a second interrupt
//! while deleting must not leave resources behind.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use netfuzz_common::{CommandKind, ConfigError, Credentials, ResourceIndex};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use crate::agents::resolve_agents;
use crate::batch::BatchOutcome;
use crate::client::{Agent, ControlPlaneClient};
use crate::config::FuzzConfig;
use crate::convergence::ConvergenceWatcher;
use crate::error::{fmt_indices, HarnessError};
use crate::runner::CommandRunner;
use crate::signal::AbortToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    Provisioning,
    Converging,
    Looping,
    TearingDown,
    Completed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

/// What the delete batches did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub indices: Vec<ResourceIndex>,
    pub subnet_failures: Vec<ResourceIndex>,
    pub network_failures: Vec<ResourceIndex>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.subnet_failures.is_empty() && self.network_failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub status: SessionState,
    /// Verification rounds that converged.
    pub rounds: u32,
    pub created: Vec<ResourceIndex>,
    pub teardown: Option<TeardownReport>,
    /// Human-readable problems, fatal or not.
    pub failures: Vec<String>,
}

impl SessionReport {
    fn new() -> Self {
        Self {
            status: SessionState::Initializing,
            rounds: 0,
            created: Vec::new(),
            teardown: None,
            failures: Vec::new(),
        }
    }
}

/// A session that ended in error. Teardown has already run.
#[derive(Debug, Error)]
#[error("session failed after {} round(s)", .report.rounds)]
pub struct SessionFailure {
    #[source]
    pub error: HarnessError,
    pub report: SessionReport,
}

pub struct ResourceSession {
    config: FuzzConfig,
    client: ControlPlaneClient,
    watcher: ConvergenceWatcher,
    abort: AbortToken,
    state: watch::Sender<SessionState>,
    teardown_started: AtomicBool,
    attempted: Mutex<BTreeSet<ResourceIndex>>,
}

impl ResourceSession {
    pub fn new(
        config: FuzzConfig,
        credentials: Arc<Credentials>,
        abort: AbortToken,
    ) -> Result<Self, ConfigError> {
        let runner = CommandRunner::new(&config.client, credentials)?;
        let client = ControlPlaneClient::new(runner, config.templates.clone(), config.template_context());
        let watcher = ConvergenceWatcher::new(
            config.naming.clone(),
            config.convergence_timeout,
            config.poll_interval,
        );
        let (state, _rx) = watch::channel(SessionState::Initializing);
        Ok(Self {
            config,
            client,
            watcher,
            abort,
            state,
            teardown_started: AtomicBool::new(false),
            attempted: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn config(&self) -> &FuzzConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Drive the session to a terminal state.
    ///
    /// Teardown (unless `keep`) has always happened by the time this returns,
    /// whichever way the session ended. An interrupt is not an error: it
    /// yields `Ok` with status [`SessionState::Aborted`].
    pub async fn run(&self) -> Result<SessionReport, SessionFailure> {
        let mut report = SessionReport::new();
        let mut outcome = self.drive(&mut report).await;

        if let Err(e) = &outcome {
            if e.is_interrupt() {
                tracing::warn!(state = ?self.state(), "interrupted");
            } else {
                tracing::error!(state = ?self.state(), error = %e, "round failed");
                report.failures.push(e.to_string());
            }
        }

        if self.config.keep {
            let attempted = self.attempted_indices();
            if !attempted.is_empty() {
                tracing::info!(indices = %fmt_indices(&attempted), "keeping resources, skipping teardown");
            }
        } else if let Some(teardown) = self.teardown().await {
            if !teardown.is_clean() {
                let failure = teardown_failure(&teardown);
                report.failures.push(failure.to_string());
                if outcome.is_ok() {
                    outcome = Err(failure);
                }
            }
            report.teardown = Some(teardown);
        }

        let status = if self.abort.is_aborted() {
            SessionState::Aborted
        } else {
            SessionState::Completed
        };
        self.set_state(status);
        report.status = status;
        tracing::info!(status = ?status, rounds = report.rounds, "session finished");

        match outcome {
            Err(error) if !error.is_interrupt() => Err(SessionFailure { error, report }),
            _ => Ok(report),
        }
    }

    /// Delete every attempted subnet, then every attempted network.
    ///
    /// Runs at most once; later calls return `None`, as do sessions with
    /// `keep` set or nothing to delete.
    pub async fn teardown(&self) -> Option<TeardownReport> {
        if self.config.keep {
            return None;
        }
        if self.teardown_started.swap(true, Ordering::SeqCst) {
            tracing::debug!("teardown already started");
            return None;
        }

        let indices = self.attempted_indices();
        if indices.is_empty() {
            tracing::info!("nothing was created, skipping teardown");
            return None;
        }

        self.set_state(SessionState::TearingDown);
        tracing::info!(count = indices.len(), "tearing down");

        // No abort token: deletes always run to completion.
        let subnets = self.client.batch(CommandKind::DeleteSubnet, &indices, None, None).await;
        let networks = self.client.batch(CommandKind::DeleteNetwork, &indices, None, None).await;

        let report = TeardownReport {
            indices,
            subnet_failures: subnets.failed_indices(),
            network_failures: networks.failed_indices(),
        };
        if report.is_clean() {
            tracing::info!("teardown complete");
        } else {
            tracing::warn!(
                subnets = %fmt_indices(&report.subnet_failures),
                networks = %fmt_indices(&report.network_failures),
                "teardown left failures"
            );
        }
        Some(report)
    }

    async fn drive(&self, report: &mut SessionReport) -> Result<(), HarnessError> {
        self.set_state(SessionState::Initializing);
        tracing::info!(
            count = self.config.count,
            encap = %self.config.encapsulation,
            bridge = %self.config.bridge,
            oneshot = self.config.oneshot,
            agents = %self.config.agents,
            "starting session"
        );
        self.checkpoint()?;
        // A hung agent-list must not outlive an interrupt; dropping the query kills it.
        let agents = tokio::select! {
            biased;
            _ = self.abort.aborted() => return Err(HarnessError::Interrupted),
            agents = resolve_agents(&self.client, &self.config.agents) => agents?,
        };

        let indices = self.config.indices();
        self.provision(&indices, &agents, report).await?;

        let mut round = 0u32;
        loop {
            round += 1;
            self.set_state(SessionState::Converging);
            tracing::info!(round, "verifying resources");
            self.watcher
                .await_convergence(&self.client, &indices, &self.abort)
                .await?;
            report.rounds = round;

            let last = self.config.oneshot || self.config.rounds.is_some_and(|limit| round >= limit);
            if last {
                self.pause(self.config.wait).await?;
                return Ok(());
            }

            self.set_state(SessionState::Looping);
            self.pause(self.config.wait.max(self.config.poll_interval)).await?;
        }
    }

    async fn provision(
        &self,
        indices: &[ResourceIndex],
        agents: &[Agent],
        report: &mut SessionReport,
    ) -> Result<(), HarnessError> {
        self.checkpoint()?;
        self.set_state(SessionState::Provisioning);
        self.attempted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(indices.iter().copied());

        let networks = self
            .client
            .batch(CommandKind::CreateNetwork, indices, None, Some(&self.abort))
            .await;
        self.checkpoint()?;
        ensure_success(&networks)?;

        let subnets = self
            .client
            .batch(CommandKind::CreateSubnet, indices, None, Some(&self.abort))
            .await;
        self.checkpoint()?;
        ensure_success(&subnets)?;
        report.created = indices.to_vec();

        for agent in agents {
            let scheduled = self
                .client
                .batch(CommandKind::ScheduleNetwork, indices, Some(&agent.id), Some(&self.abort))
                .await;
            self.checkpoint()?;
            if !scheduled.is_success() {
                let failed = scheduled.failed_indices();
                tracing::warn!(
                    agent = %agent.id,
                    indices = %fmt_indices(&failed),
                    "scheduling onto DHCP agent failed"
                );
                report.failures.push(format!(
                    "scheduling onto agent {} failed for {}",
                    agent.id,
                    fmt_indices(&failed)
                ));
            }
        }
        Ok(())
    }

    async fn pause(&self, delay: Duration) -> Result<(), HarnessError> {
        self.checkpoint()?;
        if delay.is_zero() {
            return Ok(());
        }
        tracing::debug!(delay_ms = delay.as_millis() as u64, "pausing");
        tokio::select! {
            biased;
            _ = self.abort.aborted() => Err(HarnessError::Interrupted),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn checkpoint(&self) -> Result<(), HarnessError> {
        if self.abort.is_aborted() {
            return Err(HarnessError::Interrupted);
        }
        Ok(())
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "session state");
        }
    }

    fn attempted_indices(&self) -> Vec<ResourceIndex> {
        self.attempted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }
}

fn ensure_success(outcome: &BatchOutcome) -> Result<(), HarnessError> {
    if outcome.is_success() {
        return Ok(());
    }
    Err(HarnessError::OperationFailure {
        kind: outcome.kind,
        failed: outcome.failed_indices(),
        attempted: outcome.len(),
    })
}

fn teardown_failure(teardown: &TeardownReport) -> HarnessError {
    let (kind, failed) = if teardown.network_failures.is_empty() {
        (CommandKind::DeleteSubnet, teardown.subnet_failures.clone())
    } else {
        (CommandKind::DeleteNetwork, teardown.network_failures.clone())
    };
    HarnessError::OperationFailure {
        kind,
        failed,
        attempted: teardown.indices.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FuzzConfigInput;

    fn session(input: FuzzConfigInput) -> ResourceSession {
        let config = input.resolve().unwrap();
        ResourceSession::new(config, Arc::new(Credentials::default()), AbortToken::new()).unwrap()
    }

    #[test]
    fn starts_initializing() {
        let s = session(FuzzConfigInput::default());
        assert_eq!(s.state(), SessionState::Initializing);
        assert!(!s.state().is_terminal());
        assert!(SessionState::Aborted.is_terminal());
    }

    #[test]
    fn invalid_client_is_rejected() {
        let config = FuzzConfigInput::default().resolve().unwrap();
        let mut bad = config.clone();
        bad.client = "'unterminated".into();
        assert!(ResourceSession::new(bad, Arc::new(Credentials::default()), AbortToken::new()).is_err());
    }

    #[tokio::test]
    async fn teardown_without_attempts_is_skipped() {
        let s = session(FuzzConfigInput::default());
        assert!(s.teardown().await.is_none());
        // The once-flag is spent even when there was nothing to delete.
        assert!(s.teardown().await.is_none());
        assert_eq!(s.state(), SessionState::Initializing);
    }

    #[tokio::test]
    async fn aborted_before_start_creates_nothing() {
        let config = FuzzConfigInput {
            client: Some("/nonexistent/netfuzz-client".into()),
            ..Default::default()
        }
        .resolve()
        .unwrap();
        let abort = AbortToken::new();
        abort.abort();
        let s = ResourceSession::new(config, Arc::new(Credentials::default()), abort).unwrap();
        let report = s.run().await.unwrap();
        assert_eq!(report.status, SessionState::Aborted);
        assert!(report.created.is_empty());
        assert!(report.teardown.is_none());
        assert_eq!(s.state(), SessionState::Aborted);
    }

    #[test]
    fn report_serializes_status_in_snake_case() {
        let mut report = SessionReport::new();
        report.status = SessionState::TearingDown;
        report.created = vec![ResourceIndex(1)];
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "tearing_down");
        assert_eq!(json["created"][0], 1);
        assert!(json["teardown"].is_null());
    }

    #[test]
    fn teardown_failure_prefers_network_failures() {
        let report = TeardownReport {
            indices: vec![ResourceIndex(1), ResourceIndex(2)],
            subnet_failures: vec![ResourceIndex(1)],
            network_failures: vec![ResourceIndex(2)],
        };
        let err = teardown_failure(&report).to_string();
        assert!(err.starts_with("delete-network failed for 1 of 2"), "{err}");
    }
}
