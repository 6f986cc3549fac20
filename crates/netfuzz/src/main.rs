//! netfuzz
//!
//! Repeatedly provisions networks and subnets on a network control plane and
//! checks that they all show up.
//!
//! - Credentials come from an openrc file, resolved like a shell would
//! - Networks are created in one concurrent batch, then subnets in another
//! - The listing is polled until every network has its subnet, or a timeout
//! - Ctrl-C (or SIGTERM) stops the run and deletes what was created

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{ArgGroup, Parser};
use netfuzz::client::TemplatesInput;
use netfuzz::config::{AgentsInput, ConvergenceInput};
use netfuzz::{AbortToken, FuzzConfigInput, ResourceSession, SessionReport, SignalGate};
use netfuzz_common::CredentialResolver;
use tracing_subscriber::EnvFilter;

/// Network control-plane provisioning fuzzer.
#[derive(Parser, Debug)]
#[command(name = "netfuzz", version, about = "Network control-plane provisioning fuzzer")]
#[command(group(ArgGroup::new("agent").args(["all", "uuid", "node"])))]
struct Cli {
    /// Number of networks to create [default: 5].
    nets: Option<u32>,

    /// Keep the resources instead of deleting them at exit.
    #[arg(short, long)]
    keep: bool,

    /// Ping instances after boot (not supported).
    #[arg(short, long)]
    ping: bool,

    /// Run a single round instead of looping until interrupted.
    #[arg(short, long)]
    oneshot: bool,

    /// Seconds to pause after each round [default: 0].
    #[arg(short, long)]
    wait: Option<f64>,

    /// Instances to boot per network (not supported).
    #[arg(short, long)]
    boot: Option<u32>,

    /// Schedule networks onto every DHCP agent.
    #[arg(short, long)]
    all: bool,

    /// Schedule networks onto the DHCP agent with this id.
    #[arg(short, long)]
    uuid: Option<String>,

    /// Schedule networks onto the DHCP agent on this host.
    #[arg(short, long)]
    node: Option<String>,

    /// Physical network / bridge device [default: ph-eth1].
    #[arg(short, long)]
    dev: Option<String>,

    /// Encapsulation: vlan, gre, vxlan or flat [default: vlan].
    #[arg(short, long)]
    encap: Option<String>,

    /// Subnet CIDR template; `%` is replaced by the index [default: 10.0.%.0/24].
    #[arg(short, long)]
    mask: Option<String>,

    /// Credentials file [default: openrc].
    #[arg(long)]
    openrc: Option<PathBuf>,

    /// TOML config file. Command-line flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Control-plane client program [default: neutron].
    #[arg(long)]
    client: Option<String>,

    /// Stop looping after this many rounds.
    #[arg(long)]
    rounds: Option<u32>,

    /// Convergence timeout in seconds [default: 30].
    #[arg(long)]
    timeout: Option<f64>,

    /// Delay between listing queries in milliseconds [default: 1000].
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Print the session report as JSON on stdout.
    #[arg(long, default_value_t = false)]
    json: bool,
}

impl Cli {
    fn overrides(&self) -> FuzzConfigInput {
        FuzzConfigInput {
            count: self.nets,
            encapsulation: self.encap.clone(),
            bridge: self.dev.clone(),
            cidr_template: self.mask.clone(),
            keep: self.keep.then_some(true),
            oneshot: self.oneshot.then_some(true),
            wait_secs: self.wait,
            rounds: self.rounds,
            boot: self.boot,
            ping: self.ping.then_some(true),
            client: self.client.clone(),
            openrc: self.openrc.clone(),
            agents: AgentsInput {
                all: self.all.then_some(true),
                id: self.uuid.clone(),
                host: self.node.clone(),
            },
            convergence: ConvergenceInput {
                timeout_secs: self.timeout,
                poll_interval_ms: self.poll_interval,
            },
            naming: None,
            templates: TemplatesInput::default(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let file = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            FuzzConfigInput::from_toml_str(&text)?
        }
        None => FuzzConfigInput::default(),
    };
    let config = file.merge(cli.overrides()).resolve()?;

    if config.boot > 0 {
        tracing::warn!(boot = config.boot, "booting instances is not supported, ignoring --boot");
    }
    if config.ping {
        tracing::warn!("pinging instances is not supported, ignoring --ping");
    }

    let credentials = CredentialResolver::new()
        .with_process_env()
        .resolve(&config.openrc)
        .with_context(|| format!("loading credentials from {}", config.openrc.display()))?;
    tracing::info!(
        openrc = %config.openrc.display(),
        entries = credentials.len(),
        "credentials loaded"
    );

    let abort = AbortToken::new();
    let gate = SignalGate::install(abort.clone()).context("installing signal handlers")?;
    let session = ResourceSession::new(config, Arc::new(credentials), abort)?;

    let result = session.run().await;
    drop(gate);

    match result {
        Ok(report) => print_report(&report, cli.json),
        Err(failure) => {
            print_report(&failure.report, cli.json)?;
            Err(failure.into())
        }
    }
}

fn print_report(report: &SessionReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn short_flags_match_the_classic_tool() {
        let cli = Cli::parse_from(["netfuzz", "-k", "-o", "-w", "2", "-d", "br-ex", "-e", "gre", "-m", "10.1.%.0/24", "-n", "node-1", "12"]);
        let cfg = FuzzConfigInput::default().merge(cli.overrides()).resolve().unwrap();
        assert_eq!(cfg.count, 12);
        assert!(cfg.keep && cfg.oneshot);
        assert_eq!(cfg.wait, std::time::Duration::from_secs(2));
        assert_eq!(cfg.bridge, "br-ex");
        assert_eq!(cfg.encapsulation.as_str(), "gre");
        assert_eq!(cfg.cidr_template, "10.1.%.0/24");
        assert_eq!(cfg.agents, netfuzz::agents::AgentSelection::Host("node-1".into()));
    }

    #[test]
    fn agent_flags_are_mutually_exclusive() {
        assert!(Cli::try_parse_from(["netfuzz", "-a", "-u", "abc"]).is_err());
        assert!(Cli::try_parse_from(["netfuzz", "-u", "abc", "-n", "node"]).is_err());
    }

    #[test]
    fn unset_flags_do_not_override_the_file() {
        let file = FuzzConfigInput::from_toml_str("keep = true\ncount = 7\n").unwrap();
        let cli = Cli::parse_from(["netfuzz"]);
        let cfg = file.merge(cli.overrides()).resolve().unwrap();
        assert!(cfg.keep);
        assert_eq!(cfg.count, 7);
    }
}
