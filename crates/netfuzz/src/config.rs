//! Harness configuration.
//!
//! Layered: built-in defaults, then an optional TOML file, then CLI flags.
//! Every layer produces a [`FuzzConfigInput`] of optional fields; the merged
//! input is validated once by [`FuzzConfigInput::resolve`].
//!
//! ```toml
//! count = 10
//! encapsulation = "gre"
//! cidr_template = "10.10.%.0/24"
//! rounds = 50
//!
//! [agents]
//! host = "network-node-1"
//!
//! [convergence]
//! timeout_secs = 45
//!
//! [templates]
//! delete_network = "net-delete --force {network}"
//! ```

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use netfuzz_common::{ConfigError, NamingScheme, ResourceIndex};
use serde::Deserialize;

use crate::agents::AgentSelection;
use crate::client::{CommandTemplates, TemplateContext, TemplatesInput};
use crate::convergence::{DEFAULT_POLL_INTERVAL, DEFAULT_TIMEOUT};

pub const DEFAULT_COUNT: u32 = 5;
pub const DEFAULT_BRIDGE: &str = "ph-eth1";
pub const DEFAULT_CIDR_TEMPLATE: &str = "10.0.%.0/24";
pub const DEFAULT_CLIENT: &str = "neutron";
pub const DEFAULT_OPENRC: &str = "openrc";
/// Highest usable 802.1Q VLAN id.
pub const MAX_VLAN_ID: u32 = 4094;

/// Overlay technology requested at network creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encapsulation {
    #[default]
    Vlan,
    Gre,
    Vxlan,
    Flat,
}

impl Encapsulation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vlan => "vlan",
            Self::Gre => "gre",
            Self::Vxlan => "vxlan",
            Self::Flat => "flat",
        }
    }
}

impl fmt::Display for Encapsulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encapsulation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vlan" => Ok(Self::Vlan),
            "gre" => Ok(Self::Gre),
            "vxlan" => Ok(Self::Vxlan),
            "flat" => Ok(Self::Flat),
            other => Err(ConfigError::Invalid(format!(
                "unknown encapsulation {other:?} (expected vlan, gre, vxlan or flat)"
            ))),
        }
    }
}

// ── Input (all optional) ────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FuzzConfigInput {
    pub count: Option<u32>,
    pub encapsulation: Option<String>,
    pub bridge: Option<String>,
    pub cidr_template: Option<String>,
    pub keep: Option<bool>,
    pub oneshot: Option<bool>,
    pub wait_secs: Option<f64>,
    pub rounds: Option<u32>,
    pub boot: Option<u32>,
    pub ping: Option<bool>,
    pub client: Option<String>,
    pub openrc: Option<PathBuf>,
    pub agents: AgentsInput,
    pub convergence: ConvergenceInput,
    pub naming: Option<NamingScheme>,
    pub templates: TemplatesInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentsInput {
    pub all: Option<bool>,
    pub id: Option<String>,
    pub host: Option<String>,
}

impl AgentsInput {
    fn is_set(&self) -> bool {
        self.all.unwrap_or(false) || self.id.is_some() || self.host.is_some()
    }

    fn resolve(self) -> Result<AgentSelection, ConfigError> {
        let all = self.all.unwrap_or(false);
        let chosen = [all, self.id.is_some(), self.host.is_some()]
            .iter()
            .filter(|set| **set)
            .count();
        if chosen > 1 {
            return Err(ConfigError::Invalid(
                "agent selection options all, id and host are mutually exclusive".into(),
            ));
        }
        Ok(match (all, self.id, self.host) {
            (true, _, _) => AgentSelection::All,
            (_, Some(id), _) => AgentSelection::Id(non_empty("agent id", id)?),
            (_, _, Some(host)) => AgentSelection::Host(non_empty("agent host", host)?),
            _ => AgentSelection::None,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConvergenceInput {
    pub timeout_secs: Option<f64>,
    pub poll_interval_ms: Option<u64>,
}

impl FuzzConfigInput {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        toml::from_str(input).map_err(|e| ConfigError::Invalid(format!("invalid config TOML: {e}")))
    }

    /// Layer `overrides` on top of `self`; any field set in `overrides` wins.
    pub fn merge(self, overrides: FuzzConfigInput) -> Self {
        let t = overrides.templates;
        let base_t = self.templates;
        Self {
            count: overrides.count.or(self.count),
            encapsulation: overrides.encapsulation.or(self.encapsulation),
            bridge: overrides.bridge.or(self.bridge),
            cidr_template: overrides.cidr_template.or(self.cidr_template),
            keep: overrides.keep.or(self.keep),
            oneshot: overrides.oneshot.or(self.oneshot),
            wait_secs: overrides.wait_secs.or(self.wait_secs),
            rounds: overrides.rounds.or(self.rounds),
            boot: overrides.boot.or(self.boot),
            ping: overrides.ping.or(self.ping),
            client: overrides.client.or(self.client),
            openrc: overrides.openrc.or(self.openrc),
            agents: if overrides.agents.is_set() {
                overrides.agents
            } else {
                self.agents
            },
            convergence: ConvergenceInput {
                timeout_secs: overrides
                    .convergence
                    .timeout_secs
                    .or(self.convergence.timeout_secs),
                poll_interval_ms: overrides
                    .convergence
                    .poll_interval_ms
                    .or(self.convergence.poll_interval_ms),
            },
            naming: overrides.naming.or(self.naming),
            templates: TemplatesInput {
                create_network: t.create_network.or(base_t.create_network),
                create_subnet: t.create_subnet.or(base_t.create_subnet),
                delete_network: t.delete_network.or(base_t.delete_network),
                delete_subnet: t.delete_subnet.or(base_t.delete_subnet),
                schedule_network: t.schedule_network.or(base_t.schedule_network),
                list_networks: t.list_networks.or(base_t.list_networks),
                list_agents: t.list_agents.or(base_t.list_agents),
            },
        }
    }

    /// Apply defaults and validate.
    pub fn resolve(self) -> Result<FuzzConfig, ConfigError> {
        let count = self.count.unwrap_or(DEFAULT_COUNT);
        if count == 0 {
            return Err(ConfigError::Invalid("network count must be at least 1".into()));
        }

        let encapsulation = match self.encapsulation {
            Some(s) => s.parse()?,
            None => Encapsulation::default(),
        };
        if encapsulation == Encapsulation::Vlan && count > MAX_VLAN_ID {
            return Err(ConfigError::Invalid(format!(
                "{count} networks exceed the VLAN id range 1-{MAX_VLAN_ID}"
            )));
        }

        let bridge = non_empty(
            "bridge device",
            self.bridge.unwrap_or_else(|| DEFAULT_BRIDGE.into()),
        )?;

        let cidr_template = self
            .cidr_template
            .unwrap_or_else(|| DEFAULT_CIDR_TEMPLATE.into());
        validate_cidr_template(&cidr_template, count)?;

        let wait = seconds("wait", self.wait_secs.unwrap_or(0.0))?;

        let timeout = match self.convergence.timeout_secs {
            Some(secs) => seconds("convergence timeout", secs)?,
            None => DEFAULT_TIMEOUT,
        };
        if timeout.is_zero() {
            return Err(ConfigError::Invalid("convergence timeout must be positive".into()));
        }
        let poll_interval = self
            .convergence
            .poll_interval_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_POLL_INTERVAL);

        if self.rounds == Some(0) {
            return Err(ConfigError::Invalid("rounds must be at least 1".into()));
        }

        let client = non_empty("client", self.client.unwrap_or_else(|| DEFAULT_CLIENT.into()))?;

        Ok(FuzzConfig {
            count,
            encapsulation,
            bridge,
            cidr_template,
            keep: self.keep.unwrap_or(false),
            oneshot: self.oneshot.unwrap_or(false),
            wait,
            rounds: self.rounds,
            boot: self.boot.unwrap_or(0),
            ping: self.ping.unwrap_or(false),
            agents: self.agents.resolve()?,
            client,
            openrc: self.openrc.unwrap_or_else(|| PathBuf::from(DEFAULT_OPENRC)),
            convergence_timeout: timeout,
            poll_interval,
            naming: self.naming.unwrap_or_default(),
            templates: self.templates.resolve()?,
        })
    }
}

fn non_empty(what: &str, value: String) -> Result<String, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Invalid(format!("{what} must not be empty")));
    }
    Ok(trimmed.to_string())
}

fn seconds(what: &str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| ConfigError::Invalid(format!("{what} must be a non-negative number of seconds, got {secs}")))
}

/// The template must yield a valid CIDR for both the first and last index.
fn validate_cidr_template(template: &str, count: u32) -> Result<(), ConfigError> {
    if !template.contains('%') {
        return Err(ConfigError::Invalid(format!(
            "CIDR template {template:?} has no % placeholder; every subnet would collide"
        )));
    }
    for index in [1, count] {
        let cidr = template.replace('%', &index.to_string());
        let valid = cidr.split_once('/').is_some_and(|(addr, prefix)| {
            match (addr.parse::<IpAddr>(), prefix.parse::<u8>()) {
                (Ok(IpAddr::V4(_)), Ok(p)) => p <= 32,
                (Ok(IpAddr::V6(_)), Ok(p)) => p <= 128,
                _ => false,
            }
        });
        if !valid {
            return Err(ConfigError::Invalid(format!(
                "CIDR template {template:?} yields invalid {cidr:?} for index {index}"
            )));
        }
    }
    Ok(())
}

// ── Resolved ────────────────────────────────────────────────────────

/// Validated harness configuration.
#[derive(Debug, Clone)]
pub struct FuzzConfig {
    pub count: u32,
    pub encapsulation: Encapsulation,
    pub bridge: String,
    pub cidr_template: String,
    /// Leave resources behind for inspection.
    pub keep: bool,
    /// Run a single round.
    pub oneshot: bool,
    /// Pause after each round.
    pub wait: Duration,
    /// Round limit in loop mode; `None` loops until interrupted.
    pub rounds: Option<u32>,
    pub boot: u32,
    pub ping: bool,
    pub agents: AgentSelection,
    pub client: String,
    pub openrc: PathBuf,
    pub convergence_timeout: Duration,
    pub poll_interval: Duration,
    pub naming: NamingScheme,
    pub templates: CommandTemplates,
}

impl FuzzConfig {
    pub fn indices(&self) -> Vec<ResourceIndex> {
        ResourceIndex::range(self.count)
    }

    pub fn template_context(&self) -> TemplateContext {
        TemplateContext {
            naming: self.naming.clone(),
            encapsulation: self.encapsulation.to_string(),
            bridge: self.bridge.clone(),
            cidr_template: self.cidr_template.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_cli_documentation() {
        let cfg = FuzzConfigInput::default().resolve().unwrap();
        assert_eq!(cfg.count, 5);
        assert_eq!(cfg.encapsulation, Encapsulation::Vlan);
        assert_eq!(cfg.bridge, "ph-eth1");
        assert_eq!(cfg.cidr_template, "10.0.%.0/24");
        assert_eq!(cfg.wait, Duration::ZERO);
        assert_eq!(cfg.convergence_timeout, Duration::from_secs(30));
        assert_eq!(cfg.client, "neutron");
        assert_eq!(cfg.openrc, PathBuf::from("openrc"));
        assert!(!cfg.keep && !cfg.oneshot);
        assert_eq!(cfg.rounds, None);
        assert!(cfg.agents.is_none());
        assert_eq!(cfg.indices().len(), 5);
    }

    #[test]
    fn parse_toml_config() {
        let toml = r#"
            count = 3
            encapsulation = "GRE"
            cidr_template = "192.168.%.0/24"
            wait_secs = 1.5
            rounds = 4

            [agents]
            host = "node-1"

            [convergence]
            timeout_secs = 10
            poll_interval_ms = 250

            [naming]
            network_prefix = "fz-net"

            [templates]
            delete_network = "net-delete --force {network}"
        "#;
        let cfg = FuzzConfigInput::from_toml_str(toml).unwrap().resolve().unwrap();
        assert_eq!(cfg.count, 3);
        assert_eq!(cfg.encapsulation, Encapsulation::Gre);
        assert_eq!(cfg.wait, Duration::from_millis(1500));
        assert_eq!(cfg.rounds, Some(4));
        assert_eq!(cfg.agents, AgentSelection::Host("node-1".into()));
        assert_eq!(cfg.convergence_timeout, Duration::from_secs(10));
        assert_eq!(cfg.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.naming.network_prefix, "fz-net");
        assert_eq!(cfg.naming.subnet_prefix, "sub");
        assert_eq!(cfg.templates.delete_network.source(), "net-delete --force {network}");
    }

    #[test]
    fn overrides_win_field_by_field() {
        let file = FuzzConfigInput::from_toml_str(
            "count = 8\nbridge = \"br-file\"\n[agents]\nall = true\n[convergence]\ntimeout_secs = 12\n",
        )
        .unwrap();
        let cli = FuzzConfigInput {
            count: Some(2),
            agents: AgentsInput {
                host: Some("node-9".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let cfg = file.merge(cli).resolve().unwrap();
        assert_eq!(cfg.count, 2);
        assert_eq!(cfg.bridge, "br-file");
        assert_eq!(cfg.agents, AgentSelection::Host("node-9".into()));
        assert_eq!(cfg.convergence_timeout, Duration::from_secs(12));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let cases: Vec<FuzzConfigInput> = vec![
            FuzzConfigInput { count: Some(0), ..Default::default() },
            FuzzConfigInput { count: Some(5000), ..Default::default() },
            FuzzConfigInput { encapsulation: Some("token-ring".into()), ..Default::default() },
            FuzzConfigInput { cidr_template: Some("10.0.0.0/24".into()), ..Default::default() },
            FuzzConfigInput { cidr_template: Some("10.0.%.0/24".into()), count: Some(300), ..Default::default() },
            FuzzConfigInput { wait_secs: Some(-1.0), ..Default::default() },
            FuzzConfigInput { rounds: Some(0), ..Default::default() },
            FuzzConfigInput { bridge: Some("  ".into()), ..Default::default() },
            FuzzConfigInput {
                convergence: ConvergenceInput { timeout_secs: Some(0.0), ..Default::default() },
                ..Default::default()
            },
            FuzzConfigInput {
                agents: AgentsInput { all: Some(true), host: Some("n".into()), ..Default::default() },
                ..Default::default()
            },
        ];
        for (i, input) in cases.into_iter().enumerate() {
            assert!(input.resolve().is_err(), "case {i} should be rejected");
        }
    }

    #[test]
    fn gre_allows_more_than_the_vlan_range() {
        let cfg = FuzzConfigInput {
            count: Some(5000),
            encapsulation: Some("gre".into()),
            cidr_template: Some("10.%.0.0/16".into()),
            ..Default::default()
        };
        // 10.5000.0.0 is not an address.
        assert!(cfg.resolve().is_err());

        let cfg = FuzzConfigInput {
            count: Some(5000),
            encapsulation: Some("gre".into()),
            cidr_template: Some("fd00:%::/64".into()),
            ..Default::default()
        };
        assert!(cfg.resolve().is_ok());
    }

    #[test]
    fn empty_toml_is_default() {
        let input = FuzzConfigInput::from_toml_str("  \n").unwrap();
        assert!(input.count.is_none());
        assert!(FuzzConfigInput::from_toml_str("count = \"five\"").is_err());
    }
}
