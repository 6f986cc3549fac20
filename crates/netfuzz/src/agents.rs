//! DHCP agent resolution.
//!
//! Networks can be explicitly scheduled onto DHCP agents. Which agents is an
//! operator choice: all of them, one by id, or the one on a given host.

use std::fmt;

use serde::Serialize;

use crate::client::{Agent, ControlPlaneClient};
use crate::error::HarnessError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum AgentSelection {
    /// Leave scheduling to the control plane.
    #[default]
    None,
    All,
    Id(String),
    Host(String),
}

impl AgentSelection {
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Extra `agent-list` arguments for server-side filtering.
    pub fn filter_args(&self) -> Vec<String> {
        match self {
            Self::None | Self::All => Vec::new(),
            Self::Id(id) => vec!["--id".into(), id.clone()],
            Self::Host(host) => vec!["--host".into(), host.clone()],
        }
    }

    /// Client-side filter, in case the client ignores the flags.
    pub fn matches(&self, agent: &Agent) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::Id(id) => agent.id == *id,
            Self::Host(host) => agent.host == *host,
        }
    }
}

impl fmt::Display for AgentSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::All => f.write_str("all agents"),
            Self::Id(id) => write!(f, "id {id}"),
            Self::Host(host) => write!(f, "host {host}"),
        }
    }
}

/// Look up the agents to schedule networks onto.
///
/// Returns an empty list without querying when no selection is configured.
/// A selection that matches nothing is [`HarnessError::AgentLookup`].
pub async fn resolve_agents(
    client: &ControlPlaneClient,
    selection: &AgentSelection,
) -> Result<Vec<Agent>, HarnessError> {
    if selection.is_none() {
        return Ok(Vec::new());
    }

    let agents: Vec<Agent> = client
        .list_agents(&selection.filter_args())
        .await?
        .into_iter()
        .filter(|agent| selection.matches(agent))
        .collect();

    if agents.is_empty() {
        return Err(HarnessError::AgentLookup {
            filter: selection.to_string(),
        });
    }

    for agent in &agents {
        tracing::info!(id = %agent.id, host = %agent.host, "using DHCP agent");
    }
    Ok(agents)
}
