use std::time::Duration;

use netfuzz_common::{CommandKind, ConfigError, ResourceIndex};
use thiserror::Error;

/// Everything that can end a fuzzing round.
///
/// Per-index command failures are data in a [`BatchOutcome`](crate::batch::BatchOutcome);
/// they only become an error when the session decides a batch is fatal.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no DHCP agent matches {filter}")]
    AgentLookup { filter: String },
    #[error("{kind} failed for {} of {attempted} indices: {}", .failed.len(), fmt_indices(.failed))]
    OperationFailure {
        kind: CommandKind,
        failed: Vec<ResourceIndex>,
        attempted: usize,
    },
    #[error("resources did not converge within {timeout:?}; still missing: {}", fmt_indices(.missing))]
    ConvergenceTimeout {
        timeout: Duration,
        missing: Vec<ResourceIndex>,
    },
    #[error("{kind} query failed: {detail}")]
    Query { kind: CommandKind, detail: String },
    #[error("interrupted")]
    Interrupted,
}

impl HarnessError {
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}

/// Render indices as `1, 2, 5`.
pub fn fmt_indices(indices: &[ResourceIndex]) -> String {
    if indices.is_empty() {
        return "none".into();
    }
    indices
        .iter()
        .map(ResourceIndex::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
