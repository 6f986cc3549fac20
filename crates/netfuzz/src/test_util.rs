//! A scriptable stand-in for the control-plane client, for tests.
//!
//! [`FakeControlPlane`] writes a POSIX `sh` script that understands the
//! default command templates and keeps networks and subnets as files in a
//! private state directory. Every invocation is logged to `calls.log` as a
//! `start ...` line and an `end ...` line, so tests can check ordering.
//!
//! Behaviour is steered with marker files:
//! - `fail-<cmd>` / `fail-<cmd>-<subject>` make a command exit 1,
//! - `delay-<cmd>` / `delay-<cmd>-<subject>` hold the number of seconds to sleep,
//! - `stall` makes subnet-create succeed without attaching the subnet.
//!
//! The subject is the resource the command acts on: the network name for
//! net-create, net-delete and dhcp-agent-network-add, the subnet name for
//! subnet-create and subnet-delete.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

use netfuzz_common::Credentials;

/// Monotonically increasing counter for generating unique test resource names.
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Whether a POSIX shell is available to run [`FakeControlPlane`].
pub fn sh_available() -> bool {
    Command::new("sh")
        .args(["-c", "true"])
        .status()
        .is_ok_and(|s| s.success())
}

/// Generates a unique name with the given prefix.
///
/// Combines the prefix, process ID, and an atomic counter to avoid
/// collisions when tests run in parallel.
pub fn unique_name(prefix: &str) -> String {
    let seq = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{:x}-{}", prefix, std::process::id(), seq)
}

const SCRIPT: &str = r#"#!/bin/sh
state="$FAKE_STATE"
cmd="$1"
[ $# -gt 0 ] && shift
args="$*"

case "$cmd" in
    subnet-create|dhcp-agent-network-add) subject="$2" ;;
    net-create) for arg in "$@"; do subject="$arg"; done ;;
    *) subject="$1" ;;
esac

echo "start $cmd $args" >> "$state/calls.log"

if [ -f "$state/delay-$cmd" ]; then sleep "$(cat "$state/delay-$cmd")"; fi
if [ -f "$state/delay-$cmd-$subject" ]; then sleep "$(cat "$state/delay-$cmd-$subject")"; fi

status=0
if [ -f "$state/fail-$cmd" ] || [ -f "$state/fail-$cmd-$subject" ]; then
    echo "fake: $cmd $subject refused" >&2
    status=1
else
    case "$cmd" in
    net-create)
        if [ -e "$state/net/$subject" ]; then
            echo "network $subject already exists" >&2
            status=1
        else
            : > "$state/net/$subject"
            echo "Created a new network: $subject"
        fi ;;
    subnet-create)
        name="$2"; net="$3"; cidr="$4"
        if [ ! -e "$state/net/$net" ]; then
            echo "network $net not found" >&2
            status=1
        else
            echo "$net $cidr" > "$state/sub/$name"
            [ -e "$state/stall" ] || echo "$name $cidr" >> "$state/net/$net"
            echo "Created a new subnet: $name"
        fi ;;
    subnet-delete)
        if [ ! -e "$state/sub/$1" ]; then
            echo "subnet $1 not found" >&2
            status=1
        else
            net=$(cut -d' ' -f1 < "$state/sub/$1")
            rm -f "$state/sub/$1"
            if [ -e "$state/net/$net" ]; then
                grep -v "^$1 " "$state/net/$net" > "$state/tmp.$$"
                mv "$state/tmp.$$" "$state/net/$net"
            fi
        fi ;;
    net-delete)
        if [ ! -e "$state/net/$1" ]; then
            echo "network $1 not found" >&2
            status=1
        else
            rm -f "$state/net/$1"
        fi ;;
    net-list)
        echo "name,subnets"
        for f in "$state"/net/*; do
            [ -f "$f" ] || continue
            echo "$(basename "$f"),$(tr '\n' ' ' < "$f" | sed 's/ *$//')"
        done ;;
    agent-list)
        want_id=""; want_host=""
        while [ $# -gt 0 ]; do
            case "$1" in
                --id) want_id="$2"; [ $# -gt 1 ] && shift ;;
                --host) want_host="$2"; [ $# -gt 1 ] && shift ;;
            esac
            shift
        done
        echo "id,host"
        if [ -f "$state/agents.csv" ]; then
            while IFS=, read -r id host; do
                [ -n "$want_id" ] && [ "$id" != "$want_id" ] && continue
                [ -n "$want_host" ] && [ "$host" != "$want_host" ] && continue
                echo "$id,$host"
            done < "$state/agents.csv"
        fi ;;
    dhcp-agent-network-add)
        if [ ! -e "$state/net/$2" ]; then
            echo "network $2 not found" >&2
            status=1
        else
            echo "$1 $2" >> "$state/scheduled"
        fi ;;
    *)
        echo "fake: unknown command $cmd" >&2
        status=2 ;;
    esac
fi

echo "end $cmd $args" >> "$state/calls.log"
exit $status
"#;

/// One line of the fake client's call log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub started: bool,
    pub command: String,
    pub args: String,
}

/// Temporary fake control plane. The state directory is removed on drop.
pub struct FakeControlPlane {
    root: PathBuf,
}

impl FakeControlPlane {
    pub fn new() -> io::Result<Self> {
        let root = std::env::temp_dir().join(unique_name("netfuzz"));
        fs::create_dir_all(root.join("net"))?;
        fs::create_dir_all(root.join("sub"))?;
        fs::write(root.join("client.sh"), SCRIPT)?;
        fs::write(root.join("calls.log"), "")?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Client program string for [`FuzzConfigInput::client`](crate::config::FuzzConfigInput::client).
    pub fn client(&self) -> String {
        let script = self.root.join("client.sh").display().to_string();
        match shlex::try_quote(&script) {
            Ok(quoted) => format!("sh {quoted}"),
            Err(_) => format!("sh {script}"),
        }
    }

    /// Child environment: `PATH` plus the state directory.
    pub fn credentials(&self) -> Credentials {
        let path = std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".into());
        [
            ("PATH".to_string(), path),
            ("FAKE_STATE".to_string(), self.root.display().to_string()),
        ]
        .into_iter()
        .collect()
    }

    pub fn calls(&self) -> Vec<Call> {
        fs::read_to_string(self.root.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .filter_map(|line| {
                let (marker, rest) = line.split_once(' ')?;
                let (command, args) = rest.split_once(' ').unwrap_or((rest, ""));
                Some(Call {
                    started: marker == "start",
                    command: command.to_string(),
                    args: args.to_string(),
                })
            })
            .collect()
    }

    /// Number of times `command` was started.
    pub fn count(&self, command: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.started && c.command == command)
            .count()
    }

    /// Make `command` fail, for one subject or for all of them.
    pub fn fail_on(&self, command: &str, subject: Option<&str>) -> io::Result<()> {
        fs::write(self.marker("fail", command, subject), "")
    }

    pub fn delay(&self, command: &str, subject: Option<&str>, secs: f64) -> io::Result<()> {
        fs::write(self.marker("delay", command, subject), format!("{secs}\n"))
    }

    /// Subnets get created but never show up in the network listing.
    pub fn stall_subnets(&self) -> io::Result<()> {
        fs::write(self.root.join("stall"), "")
    }

    pub fn add_agent(&self, id: &str, host: &str) -> io::Result<()> {
        let path = self.root.join("agents.csv");
        let mut agents = fs::read_to_string(&path).unwrap_or_default();
        agents.push_str(&format!("{id},{host}\n"));
        fs::write(path, agents)
    }

    /// A pre-existing network with a subnet that the session does not own.
    pub fn add_foreign_network(&self, name: &str) -> io::Result<()> {
        fs::write(self.root.join("net").join(name), "foreign-sub 172.24.4.0/24\n")
    }

    pub fn networks(&self) -> Vec<String> {
        self.list_dir("net")
    }

    pub fn subnets(&self) -> Vec<String> {
        self.list_dir("sub")
    }

    /// `(agent, network)` pairs from dhcp-agent-network-add.
    pub fn scheduled(&self) -> Vec<(String, String)> {
        fs::read_to_string(self.root.join("scheduled"))
            .unwrap_or_default()
            .lines()
            .filter_map(|line| line.split_once(' '))
            .map(|(agent, net)| (agent.to_string(), net.to_string()))
            .collect()
    }

    fn marker(&self, kind: &str, command: &str, subject: Option<&str>) -> PathBuf {
        match subject {
            Some(subject) => self.root.join(format!("{kind}-{command}-{subject}")),
            None => self.root.join(format!("{kind}-{command}")),
        }
    }

    fn list_dir(&self, dir: &str) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.root.join(dir))
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}

impl Drop for FakeControlPlane {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}
