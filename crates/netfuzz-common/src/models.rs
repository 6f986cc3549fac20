//! Resource naming and command classification.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical index of one network/subnet pair, `1..=N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceIndex(pub u32);

impl ResourceIndex {
    /// Indices `1..=count`.
    pub fn range(count: u32) -> Vec<ResourceIndex> {
        (1..=count).map(ResourceIndex).collect()
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ResourceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of control-plane operation an external command performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    CreateNetwork,
    CreateSubnet,
    DeleteNetwork,
    DeleteSubnet,
    ScheduleNetwork,
    ListNetworks,
    ListAgents,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateNetwork => "create-network",
            Self::CreateSubnet => "create-subnet",
            Self::DeleteNetwork => "delete-network",
            Self::DeleteSubnet => "delete-subnet",
            Self::ScheduleNetwork => "schedule-network",
            Self::ListNetworks => "list-networks",
            Self::ListAgents => "list-agents",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a session names the resources it owns.
///
/// Listings are filtered through [`NamingScheme::parse_network`] so that
/// pre-existing networks are never counted as this session's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingScheme {
    pub network_prefix: String,
    pub subnet_prefix: String,
}

impl Default for NamingScheme {
    fn default() -> Self {
        Self {
            network_prefix: "net".into(),
            subnet_prefix: "sub".into(),
        }
    }
}

impl NamingScheme {
    pub fn network_name(&self, index: ResourceIndex) -> String {
        format!("{}{}", self.network_prefix, index.0)
    }

    pub fn subnet_name(&self, index: ResourceIndex) -> String {
        format!("{}{}", self.subnet_prefix, index.0)
    }

    /// Recover the index from a network name, if it belongs to this scheme.
    ///
    /// `net07` does not match: names are generated without padding.
    pub fn parse_network(&self, name: &str) -> Option<ResourceIndex> {
        let digits = name.strip_prefix(self.network_prefix.as_str())?;
        if digits.is_empty() || digits.starts_with('0') || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(ResourceIndex)
    }
}
