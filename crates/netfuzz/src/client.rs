//! Control-plane client commands.
//!
//! The exact client syntax is configuration: each [`CommandKind`] maps to a
//! [`CommandTemplate`] such as `net-delete {network}`. Templates are split into
//! words with shell rules *before* placeholders are filled in, so a value with
//! spaces or quotes always stays a single argument.

use std::future::Future;

use netfuzz_common::{CommandKind, ConfigError, NamingScheme, ResourceIndex};
use serde::Deserialize;

use crate::batch::{Batch, BatchOutcome};
use crate::convergence::NetworkLister;
use crate::error::HarnessError;
use crate::runner::{CommandRunner, OperationResult};
use crate::signal::AbortToken;

/// Placeholders a template may use.
pub const PLACEHOLDERS: &[&str] = &["index", "network", "subnet", "encap", "bridge", "cidr", "agent"];

pub const DEFAULT_CREATE_NETWORK: &str = "net-create --provider:network_type={encap} \
     --provider:segmentation_id={index} --provider:physical_network={bridge} {network}";
pub const DEFAULT_CREATE_SUBNET: &str = "subnet-create --name {subnet} {network} {cidr}";
pub const DEFAULT_DELETE_NETWORK: &str = "net-delete {network}";
pub const DEFAULT_DELETE_SUBNET: &str = "subnet-delete {subnet}";
pub const DEFAULT_SCHEDULE_NETWORK: &str = "dhcp-agent-network-add {agent} {network}";
pub const DEFAULT_LIST_NETWORKS: &str = "net-list -f csv --quote none -c name -c subnets";
pub const DEFAULT_LIST_AGENTS: &str =
    "agent-list -f csv --quote none -c id -c host --agent_type='DHCP agent'";

// ── Templates ───────────────────────────────────────────────────────

/// A pre-split command line with `{placeholder}` slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    source: String,
    words: Vec<String>,
}

impl CommandTemplate {
    pub fn parse(source: &str) -> Result<Self, ConfigError> {
        let words = shlex::split(source)
            .ok_or_else(|| ConfigError::Invalid(format!("unbalanced quotes in template {source:?}")))?;
        for word in &words {
            for name in placeholders(word) {
                if !PLACEHOLDERS.contains(&name) {
                    return Err(ConfigError::Invalid(format!(
                        "unknown placeholder {{{name}}} in template {source:?}"
                    )));
                }
            }
        }
        Ok(Self {
            source: source.to_string(),
            words,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Fill placeholders. Unset placeholders expand to an empty string.
    pub fn render(&self, vars: &[(&str, String)]) -> Vec<String> {
        self.words
            .iter()
            .map(|word| {
                let mut out = String::with_capacity(word.len());
                let mut rest = word.as_str();
                while let Some(open) = rest.find('{') {
                    out.push_str(&rest[..open]);
                    let after = &rest[open + 1..];
                    match after.find('}') {
                        Some(close) if is_placeholder_name(&after[..close]) => {
                            let name = &after[..close];
                            if let Some((_, value)) = vars.iter().find(|(k, _)| *k == name) {
                                out.push_str(value);
                            }
                            rest = &after[close + 1..];
                        }
                        _ => {
                            out.push('{');
                            rest = after;
                        }
                    }
                }
                out.push_str(rest);
                out
            })
            .collect()
    }
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_lowercase() || b == b'_')
}

fn placeholders(word: &str) -> Vec<&str> {
    let mut names = Vec::new();
    let mut rest = word;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) if is_placeholder_name(&after[..close]) => {
                names.push(&after[..close]);
                rest = &after[close + 1..];
            }
            _ => rest = after,
        }
    }
    names
}

/// Template overrides as written in the config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TemplatesInput {
    pub create_network: Option<String>,
    pub create_subnet: Option<String>,
    pub delete_network: Option<String>,
    pub delete_subnet: Option<String>,
    pub schedule_network: Option<String>,
    pub list_networks: Option<String>,
    pub list_agents: Option<String>,
}

impl TemplatesInput {
    pub fn resolve(self) -> Result<CommandTemplates, ConfigError> {
        let parse = |value: Option<String>, default: &str| {
            CommandTemplate::parse(value.as_deref().unwrap_or(default))
        };
        Ok(CommandTemplates {
            create_network: parse(self.create_network, DEFAULT_CREATE_NETWORK)?,
            create_subnet: parse(self.create_subnet, DEFAULT_CREATE_SUBNET)?,
            delete_network: parse(self.delete_network, DEFAULT_DELETE_NETWORK)?,
            delete_subnet: parse(self.delete_subnet, DEFAULT_DELETE_SUBNET)?,
            schedule_network: parse(self.schedule_network, DEFAULT_SCHEDULE_NETWORK)?,
            list_networks: parse(self.list_networks, DEFAULT_LIST_NETWORKS)?,
            list_agents: parse(self.list_agents, DEFAULT_LIST_AGENTS)?,
        })
    }
}

/// One parsed template per command kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplates {
    pub create_network: CommandTemplate,
    pub create_subnet: CommandTemplate,
    pub delete_network: CommandTemplate,
    pub delete_subnet: CommandTemplate,
    pub schedule_network: CommandTemplate,
    pub list_networks: CommandTemplate,
    pub list_agents: CommandTemplate,
}

impl CommandTemplates {
    pub fn get(&self, kind: CommandKind) -> &CommandTemplate {
        match kind {
            CommandKind::CreateNetwork => &self.create_network,
            CommandKind::CreateSubnet => &self.create_subnet,
            CommandKind::DeleteNetwork => &self.delete_network,
            CommandKind::DeleteSubnet => &self.delete_subnet,
            CommandKind::ScheduleNetwork => &self.schedule_network,
            CommandKind::ListNetworks => &self.list_networks,
            CommandKind::ListAgents => &self.list_agents,
        }
    }
}

/// Values substituted into per-index templates.
#[derive(Debug, Clone)]
pub struct TemplateContext {
    pub naming: NamingScheme,
    pub encapsulation: String,
    pub bridge: String,
    /// CIDR with `%` standing in for the index, e.g. `10.0.%.0/24`.
    pub cidr_template: String,
}

impl TemplateContext {
    pub fn cidr(&self, index: ResourceIndex) -> String {
        self.cidr_template.replace('%', &index.to_string())
    }

    pub fn vars(&self, index: ResourceIndex, agent: Option<&str>) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            ("index", index.to_string()),
            ("network", self.naming.network_name(index)),
            ("subnet", self.naming.subnet_name(index)),
            ("encap", self.encapsulation.clone()),
            ("bridge", self.bridge.clone()),
            ("cidr", self.cidr(index)),
        ];
        if let Some(agent) = agent {
            vars.push(("agent", agent.to_string()));
        }
        vars
    }
}

// ── Output parsing ──────────────────────────────────────────────────

/// One row of a `net-list` listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRow {
    pub name: String,
    /// Raw subnet column; empty when the network has no subnet yet.
    pub subnets: String,
}

impl NetworkRow {
    pub fn has_subnet(&self) -> bool {
        !self.subnets.trim().is_empty()
    }
}

/// Split unquoted CSV output into `(first, rest)` columns, skipping the header.
pub fn parse_csv_pairs(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once(',') {
            Some((first, rest)) => (first.trim().to_string(), rest.trim().to_string()),
            None => (line.to_string(), String::new()),
        })
        .collect()
}

// ── Client ──────────────────────────────────────────────────────────

/// A DHCP agent as reported by `agent-list`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Agent {
    pub id: String,
    pub host: String,
}

/// Runner + templates + naming: everything needed to talk to the control plane.
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    runner: CommandRunner,
    templates: CommandTemplates,
    context: TemplateContext,
}

impl ControlPlaneClient {
    pub fn new(runner: CommandRunner, templates: CommandTemplates, context: TemplateContext) -> Self {
        Self {
            runner,
            templates,
            context,
        }
    }

    pub fn runner(&self) -> &CommandRunner {
        &self.runner
    }

    pub fn context(&self) -> &TemplateContext {
        &self.context
    }

    /// Run `kind` for every index concurrently.
    ///
    /// `abort` should only be passed for creation work; teardown must run to
    /// completion regardless of interrupts.
    pub async fn batch(
        &self,
        kind: CommandKind,
        indices: &[ResourceIndex],
        agent: Option<&str>,
        abort: Option<&AbortToken>,
    ) -> BatchOutcome {
        Batch::new(&self.runner, kind)
            .run_all(indices, self.templates.get(kind), &self.context, agent, abort)
            .await
    }

    async fn query(&self, kind: CommandKind, extra: &[String]) -> Result<OperationResult, HarnessError> {
        let mut args = self.templates.get(kind).render(&[]);
        args.extend(extra.iter().cloned());
        let result = self.runner.launch(None, kind, args, true).wait().await;
        if !result.is_success() {
            return Err(HarnessError::Query {
                kind,
                detail: format!("{} ({})", result.status, result.error_line()),
            });
        }
        Ok(result)
    }

    /// List DHCP agents, passing `filter` through to the client.
    pub async fn list_agents(&self, filter: &[String]) -> Result<Vec<Agent>, HarnessError> {
        let result = self.query(CommandKind::ListAgents, filter).await?;
        Ok(parse_csv_pairs(&result.stdout)
            .into_iter()
            .map(|(id, host)| Agent { id, host })
            .collect())
    }
}

impl NetworkLister for ControlPlaneClient {
    fn list_networks(&self) -> impl Future<Output = Result<Vec<NetworkRow>, HarnessError>> + Send {
        async move {
            let result = self.query(CommandKind::ListNetworks, &[]).await?;
            Ok(parse_csv_pairs(&result.stdout)
                .into_iter()
                .map(|(name, subnets)| NetworkRow { name, subnets })
                .collect())
        }
    }
}
