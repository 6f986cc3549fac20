//! Fan-out/fan-in over resource indices.
//!
//! Every operation in a batch is launched before any is awaited, then all of
//! them are joined. One index failing never cancels its siblings: the harness
//! wants to hear about every resource, not just the first failure.

use std::time::Instant;

use futures::future::join_all;
use netfuzz_common::{CommandKind, ResourceIndex};

use crate::client::{CommandTemplate, TemplateContext};
use crate::runner::{CommandRunner, OperationResult};
use crate::signal::AbortToken;

/// Results of one batch, in ascending index order.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub kind: CommandKind,
    pub results: Vec<OperationResult>,
}

impl BatchOutcome {
    /// `true` iff every operation succeeded (vacuously for an empty batch).
    pub fn is_success(&self) -> bool {
        self.results.iter().all(OperationResult::is_success)
    }

    pub fn indices(&self) -> Vec<ResourceIndex> {
        self.results.iter().filter_map(|r| r.index).collect()
    }

    pub fn failed_indices(&self) -> Vec<ResourceIndex> {
        self.results
            .iter()
            .filter(|r| !r.is_success())
            .filter_map(|r| r.index)
            .collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = &OperationResult> {
        self.results.iter().filter(|r| !r.is_success())
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// One fan-out round of a single command kind.
pub struct Batch<'a> {
    runner: &'a CommandRunner,
    kind: CommandKind,
}

impl<'a> Batch<'a> {
    pub fn new(runner: &'a CommandRunner, kind: CommandKind) -> Self {
        Self { runner, kind }
    }

    /// Launch `template` once per index, wait for all, report in index order.
    ///
    /// When `abort` is given and fires, in-flight children are killed; they
    /// are still joined and reported as cancelled.
    pub async fn run_all(
        &self,
        indices: &[ResourceIndex],
        template: &CommandTemplate,
        context: &TemplateContext,
        agent: Option<&str>,
        abort: Option<&AbortToken>,
    ) -> BatchOutcome {
        let mut indices = indices.to_vec();
        indices.sort_unstable();
        indices.dedup();

        let started = Instant::now();
        tracing::debug!(kind = %self.kind, count = indices.len(), "launching batch");

        // Launch everything first.
        let handles: Vec<_> = indices
            .iter()
            .map(|&index| {
                let args = template.render(&context.vars(index, agent));
                self.runner.launch(Some(index), self.kind, args, true)
            })
            .collect();

        let mut results = match abort {
            Some(abort) => join_all(handles.into_iter().map(|h| h.wait_or_abort(abort))).await,
            None => join_all(handles.into_iter().map(|h| h.wait())).await,
        };
        results.sort_by_key(|r| r.index);

        let outcome = BatchOutcome {
            kind: self.kind,
            results,
        };

        for failure in outcome.failures() {
            tracing::warn!(
                kind = %self.kind,
                index = ?failure.index.map(|i| i.0),
                status = %failure.status,
                error = failure.error_line(),
                "operation failed"
            );
        }
        tracing::info!(
            kind = %self.kind,
            total = outcome.len(),
            failed = outcome.failed_indices().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "batch finished"
        );

        outcome
    }
}
