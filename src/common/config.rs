//! Configuration file handling

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use super::paths::config_path;
use super::Result;
use crate::machine::{Backend, MachineConfig, Mode};

/// Main configuration structure
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Container runtime settings
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Scenario execution settings
    #[serde(default)]
    pub run: RunConfig,

    /// Timeout settings
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Machine descriptions keyed by the role they play
    #[serde(default)]
    pub machines: BTreeMap<Mode, MachineConfig>,
}

/// Container runtime settings
#[derive(Debug, Deserialize, Default)]
pub struct RuntimeConfig {
    /// Backend used for from-source machines
    #[serde(default)]
    pub backend: Backend,
}

/// How machines are shared between scenarios
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MachinePolicy {
    /// Fresh machines for every scenario variant
    #[default]
    PerScenario,
    /// Machines are reset to their provisioned snapshot and reused
    Pooled,
}

/// Scenario execution settings
#[derive(Debug, Deserialize)]
pub struct RunConfig {
    /// Maximum number of scenario variants running at once
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Machine reuse policy
    #[serde(default)]
    pub machine_policy: MachinePolicy,

    /// Delete machines at teardown (otherwise they are only stopped)
    #[serde(default = "default_dispose")]
    pub dispose: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            machine_policy: MachinePolicy::default(),
            dispose: default_dispose(),
        }
    }
}

fn default_parallelism() -> usize {
    1
}
fn default_dispose() -> bool {
    true
}

/// Timeout settings in seconds
#[derive(Debug, Clone, Deserialize)]
pub struct Timeouts {
    /// Upper bound for provisioning one machine
    #[serde(default = "default_provision")]
    pub provision_secs: u64,

    /// Default timeout for `assert_printed`
    #[serde(default = "default_expect")]
    pub expect_secs: f64,

    /// Default observation window for `assert_not_printed`
    #[serde(default = "default_not_printed")]
    pub not_printed_secs: f64,

    /// Timeout for the program to terminate on `assert_ret_code`
    #[serde(default = "default_wait")]
    pub wait_secs: f64,

    /// Upper bound for a graceful teardown before forcing destruction
    #[serde(default = "default_cleanup")]
    pub cleanup_secs: u64,

    /// Timeout for one `lxc` or `docker` invocation
    #[serde(default = "default_command")]
    pub command_secs: u64,

    /// Timeout for one provisioning command inside a machine
    #[serde(default = "default_setup_command")]
    pub setup_command_secs: u64,

    /// How long a machine may take to boot, or its service to come up
    #[serde(default = "default_boot")]
    pub boot_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            provision_secs: default_provision(),
            expect_secs: default_expect(),
            not_printed_secs: default_not_printed(),
            wait_secs: default_wait(),
            cleanup_secs: default_cleanup(),
            command_secs: default_command(),
            setup_command_secs: default_setup_command(),
            boot_secs: default_boot(),
        }
    }
}

fn default_provision() -> u64 {
    1800
}
fn default_expect() -> f64 {
    60.0
}
fn default_not_printed() -> f64 {
    5.0
}
fn default_wait() -> f64 {
    600.0
}
fn default_cleanup() -> u64 {
    300
}
fn default_command() -> u64 {
    300
}
fn default_setup_command() -> u64 {
    1200
}
fn default_boot() -> u64 {
    300
}

impl Timeouts {
    pub fn provision(&self) -> Duration {
        Duration::from_secs(self.provision_secs)
    }

    pub fn expect(&self) -> Duration {
        secs_f64(self.expect_secs)
    }

    pub fn not_printed(&self) -> Duration {
        secs_f64(self.not_printed_secs)
    }

    pub fn wait(&self) -> Duration {
        secs_f64(self.wait_secs)
    }

    pub fn cleanup(&self) -> Duration {
        Duration::from_secs(self.cleanup_secs)
    }

    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub fn setup_command(&self) -> Duration {
        Duration::from_secs(self.setup_command_secs)
    }

    pub fn boot(&self) -> Duration {
        Duration::from_secs(self.boot_secs)
    }
}

/// Convert user supplied seconds, clamping negative and NaN values to zero
pub fn secs_f64(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::ZERO
    }
}

impl Config {
    /// Load configuration from `path`, or from the default config file
    ///
    /// Returns default configuration if no path is given and the default
    /// file doesn't exist
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match config_path() {
                Some(p) if p.exists() => p,
                _ => return Ok(Self::default()),
            },
        };

        let content = std::fs::read_to_string(&path).map_err(|e| super::Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(content).map_err(|e| super::Error::ConfigParse(e.to_string()))?;

        for (mode, machine) in config.machines.iter_mut() {
            machine.role = *mode;
            machine.validate()?;
        }

        if config.run.parallelism == 0 {
            return Err(super::Error::Config(
                "run.parallelism must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }

    /// Get the machine configuration for a role
    pub fn machine(&self, role: Mode) -> Option<&MachineConfig> {
        self.machines.get(&role)
    }
}
