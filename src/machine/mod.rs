//! Machines that scenarios run on
//!
//! A machine is a disposable container playing one role in a scenario
//! (running checkbox locally, hosting the service, driving it remotely...).
//! Each backend implements [`MachineProvider`]; [`factory::MachineFactory`]
//! picks the implementation for a configuration.

pub mod docker;
pub mod factory;
pub mod install;
pub mod lxd;
pub mod shell;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::common::{Error, Result};
use crate::session::{ExecuteResult, InteractiveSession};

pub use factory::{MachineFactory, ProviderFactory};

/// Where scenarios expect their launcher on the launching machine
pub const DEFAULT_LAUNCHER_PATH: &str = "/home/ubuntu/launcher.checkbox";

/// Environment every command on a machine runs with
pub const BASE_ENV: [(&str, &str); 3] = [
    ("PYTHONUNBUFFERED", "1"),
    ("DISABLE_URWID_ESCAPE_CODES", "1"),
    ("XDG_RUNTIME_DIR", "/run/user/1000"),
];

/// How checkbox is exercised in a scenario, and the role a machine plays
///
/// A mode needs machines for each of its [`Mode::roles`]; roles and modes
/// share the same names.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Local,
    Remote,
    Service,
    Controller,
    Agent,
}

impl Mode {
    pub const ALL: [Mode; 5] = [
        Mode::Local,
        Mode::Remote,
        Mode::Service,
        Mode::Controller,
        Mode::Agent,
    ];

    /// Machine roles needed to run in this mode, launching machine first
    pub fn roles(&self) -> &'static [Mode] {
        match self {
            Mode::Local => &[Mode::Local],
            Mode::Remote => &[Mode::Remote, Mode::Service],
            Mode::Controller => &[Mode::Controller, Mode::Agent],
            Mode::Service => &[Mode::Service],
            Mode::Agent => &[Mode::Agent],
        }
    }

    /// Whether a machine in this role runs the checkbox service or agent
    pub fn hosts_service(&self) -> bool {
        matches!(self, Mode::Service | Mode::Agent)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Local => "local",
            Mode::Remote => "remote",
            Mode::Service => "service",
            Mode::Controller => "controller",
            Mode::Agent => "agent",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Mode::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| Error::Config(format!("unknown mode '{}'", s)))
    }
}

/// Where checkbox comes from on a machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    /// Strictly confined snap (installed in devmode)
    Snap,
    /// Classic snap
    ClassicSnap,
    /// Debian packages from a PPA
    Ppa,
    /// A checkout of the checkbox sources
    Source,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Snap => write!(f, "snap"),
            Origin::ClassicSnap => write!(f, "classic-snap"),
            Origin::Ppa => write!(f, "ppa"),
            Origin::Source => write!(f, "source"),
        }
    }
}

/// Container runtime used to create machines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Lxd,
    Docker,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Lxd => write!(f, "lxd"),
            Backend::Docker => write!(f, "docker"),
        }
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lxd" => Ok(Backend::Lxd),
            "docker" => Ok(Backend::Docker),
            other => Err(Error::Config(format!(
                "unknown runtime backend '{}' (expected lxd or docker)",
                other
            ))),
        }
    }
}

/// A file or directory copied from the host onto a machine at setup
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct Transfer {
    pub src: PathBuf,
    pub dest: String,
}

/// Description of the machines playing one role
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct MachineConfig {
    /// Set from the `[machines.<role>]` key
    #[serde(skip)]
    pub role: Mode,

    pub origin: Origin,

    /// PPA name, source checkout path or local `.snap` file
    #[serde(default)]
    pub uri: Option<String>,

    /// Snap channel risk level
    #[serde(default = "default_risk")]
    pub risk: String,

    /// OS releases to run on, in order
    pub releases: Vec<String>,

    /// Snap name
    #[serde(default = "default_snap_name")]
    pub name: String,

    /// Release to snap track overrides
    #[serde(default)]
    pub track_map: BTreeMap<String, String>,

    /// Risk of the checkbox runtime snap to install first, if any
    #[serde(default)]
    pub core_risk: Option<String>,

    /// Extra LXD profiles
    #[serde(default)]
    pub profiles: Vec<String>,

    /// Extra commands run at the end of provisioning
    #[serde(default)]
    pub setup: Vec<String>,

    /// Extra files copied at provisioning
    #[serde(default)]
    pub transfer: Vec<Transfer>,

    /// Container image override
    #[serde(default)]
    pub image: Option<String>,
}

fn default_risk() -> String {
    "stable".to_string()
}

fn default_snap_name() -> String {
    "checkbox".to_string()
}

const RISKS: [&str; 4] = ["stable", "candidate", "beta", "edge"];

impl MachineConfig {
    /// Minimal configuration for a role, mostly useful in tests
    pub fn new(role: Mode, origin: Origin, releases: &[&str]) -> Self {
        Self {
            role,
            origin,
            uri: None,
            risk: default_risk(),
            releases: releases.iter().map(|r| r.to_string()).collect(),
            name: default_snap_name(),
            track_map: BTreeMap::new(),
            core_risk: None,
            profiles: Vec::new(),
            setup: Vec::new(),
            transfer: Vec::new(),
            image: None,
        }
    }

    pub fn with_uri(mut self, uri: &str) -> Self {
        self.uri = Some(uri.to_string());
        self
    }

    /// Check the configuration is complete and coherent
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| {
            Err(Error::Config(format!(
                "machine '{}' ({}): {}",
                self.role, self.origin, reason
            )))
        };

        if self.releases.is_empty() {
            return invalid("at least one release is required".to_string());
        }
        if let Some(r) = self.releases.iter().find(|r| !is_valid_release(r)) {
            return invalid(format!("invalid release name '{}'", r));
        }
        if self.name.trim().is_empty() {
            return invalid("snap name cannot be empty".to_string());
        }

        match self.origin {
            Origin::Ppa | Origin::Source if self.uri_str().is_empty() => {
                return invalid(format!("origin '{}' requires a uri", self.origin));
            }
            Origin::Snap | Origin::ClassicSnap => {
                for risk in std::iter::once(&self.risk).chain(self.core_risk.iter()) {
                    if !RISKS.contains(&risk.as_str()) {
                        return invalid(format!(
                            "unknown risk '{}' (expected one of {})",
                            risk,
                            RISKS.join(", ")
                        ));
                    }
                }
            }
            _ => {}
        }

        Ok(())
    }

    pub fn uri_str(&self) -> &str {
        self.uri.as_deref().map(str::trim).unwrap_or_default()
    }
}

fn is_valid_release(release: &str) -> bool {
    !release.is_empty()
        && release
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
}

/// Lifecycle of a machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Created,
    Provisioned,
    Ready,
    TornDown,
    Failed,
}

/// A machine instance owned by its provider
#[derive(Debug, Clone)]
pub struct Machine {
    pub id: Uuid,
    pub name: String,
    pub role: Mode,
    pub release: String,
    pub backend: Backend,
    pub state: MachineState,
}

impl Machine {
    pub fn new(config: &MachineConfig, release: &str, backend: Backend) -> Self {
        let id = Uuid::new_v4();
        let short = id.simple().to_string();
        let name = format!(
            "metabox-{}-{}-{}-{}",
            config.role,
            release.replace('.', "-"),
            config.origin,
            &short[..8]
        );
        Self {
            id,
            name,
            role: config.role,
            release: release.to_string(),
            backend,
            state: MachineState::Created,
        }
    }

    /// Move to provisioning, refusing machines that were already set up
    pub fn begin_setup(&self) -> Result<()> {
        if self.state != MachineState::Created {
            return Err(Error::Internal(format!(
                "setup called on {} in state {:?}",
                self.name, self.state
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A machine backend
///
/// Every method except [`MachineProvider::setup`] may only be called on a
/// machine that was set up successfully, apart from the teardown methods
/// which must cope with partially provisioned machines.
#[async_trait]
pub trait MachineProvider: Send + Sync {
    fn machine(&self) -> &Machine;

    fn machine_mut(&mut self) -> &mut Machine;

    /// Provision the machine and return once it accepts commands
    async fn setup(&mut self) -> Result<()>;

    /// Write `contents` to `path` on the machine, creating parent directories
    async fn put(&self, path: &str, contents: &[u8]) -> Result<()>;

    /// Run a shell command to completion
    async fn execute(&self, cmd: &str, timeout: Duration) -> Result<ExecuteResult>;

    /// Start a shell command attached to a terminal-like session
    async fn interactive(
        &self,
        cmd: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<InteractiveSession>;

    /// Shell command running the checkbox CLI with `args`
    fn program_command(&self, args: &str) -> String;

    fn launcher_path(&self) -> String {
        DEFAULT_LAUNCHER_PATH.to_string()
    }

    /// Start the checkbox service (service and agent roles)
    async fn start_service(&self) -> Result<()>;

    /// Network address other machines reach this one at
    async fn address(&self) -> Result<String>;

    /// Bring the machine back to its freshly provisioned state
    async fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    /// Command a person can run to get a shell on the machine after teardown
    /// kept it (stopped, not deleted)
    fn connecting_command(&self) -> String;

    async fn stop(&mut self) -> Result<()>;

    async fn destroy(&mut self) -> Result<()>;

    /// Stop the machine and, when `dispose` is set, delete it
    ///
    /// When disposing, a failure to stop is ignored as long as the machine
    /// could be deleted. On success the machine is `TornDown`.
    async fn cleanup(&mut self, dispose: bool) -> Result<()> {
        let stopped = self.stop().await;
        if dispose {
            if let Err(e) = &stopped {
                tracing::debug!(machine = %self.machine(), error = %e, "Stop failed, deleting anyway");
            }
            self.destroy().await?;
        } else {
            stopped?;
        }
        self.machine_mut().state = MachineState::TornDown;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_roles() {
        assert_eq!(Mode::Local.roles(), &[Mode::Local]);
        assert_eq!(Mode::Remote.roles(), &[Mode::Remote, Mode::Service]);
        assert_eq!(Mode::Controller.roles(), &[Mode::Controller, Mode::Agent]);
        assert!(Mode::Service.hosts_service());
        assert!(!Mode::Remote.hosts_service());
        assert_eq!("agent".parse::<Mode>().unwrap(), Mode::Agent);
        assert!("cloud".parse::<Mode>().is_err());
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("Docker".parse::<Backend>().unwrap(), Backend::Docker);
        assert!("podman".parse::<Backend>().unwrap_err().is_configuration());
    }

    #[test]
    fn test_validate() {
        let config = MachineConfig::new(Mode::Local, Origin::Snap, &["jammy"]);
        assert!(config.validate().is_ok());

        let mut bad_risk = config.clone();
        bad_risk.risk = "nightly".into();
        assert!(bad_risk.validate().is_err());

        let no_releases = MachineConfig::new(Mode::Local, Origin::Snap, &[]);
        assert!(no_releases.validate().is_err());

        let ppa = MachineConfig::new(Mode::Remote, Origin::Ppa, &["focal"]);
        assert!(ppa.validate().is_err());
        assert!(ppa.with_uri("ppa:checkbox-dev/ppa").validate().is_ok());

        let bad_release = MachineConfig::new(Mode::Local, Origin::Snap, &["Jammy Jellyfish"]);
        assert!(bad_release.validate().is_err());
    }

    #[test]
    fn test_machine_names_are_unique() {
        let config = MachineConfig::new(Mode::Service, Origin::ClassicSnap, &["jammy"]);
        let a = Machine::new(&config, "jammy", Backend::Lxd);
        let b = Machine::new(&config, "jammy", Backend::Lxd);
        assert!(a.name.starts_with("metabox-service-jammy-classic-snap-"));
        assert_ne!(a.name, b.name);
        assert_eq!(a.state, MachineState::Created);
        assert!(a.begin_setup().is_ok());
    }
}
