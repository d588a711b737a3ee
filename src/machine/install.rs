//! Installation plans
//!
//! An [`InstallPlan`] lists what has to happen on a fresh machine for
//! checkbox to be usable, depending on where checkbox comes from. Backends
//! carry the plan out in their own way (pushing vs bind-mounting the source
//! tree, for example).

use std::path::{Path, PathBuf};

use super::{MachineConfig, Mode, Origin, Transfer};
use crate::common::{Error, Result};

/// Where a source checkout lives on machines
pub const SOURCE_DIR: &str = "/home/ubuntu/checkbox";

/// systemd unit running checkbox from a source install
pub const SOURCE_SERVICE_UNIT: &str = "checkbox-ng.service";

const PROVIDERS: [&str; 3] = ["base", "resource", "certification-client"];

/// Checkbox runtime snap for a release
pub fn core_snap(release: &str) -> Option<&'static str> {
    match base_release(release) {
        "xenial" => Some("checkbox"),
        "bionic" => Some("checkbox18"),
        "focal" => Some("checkbox20"),
        "jammy" => Some("checkbox22"),
        "noble" => Some("checkbox24"),
        _ => None,
    }
}

/// Default checkbox snap track for a release
pub fn default_track(release: &str) -> Option<&'static str> {
    match base_release(release) {
        "xenial" => Some("16.04"),
        "bionic" => Some("18.04"),
        "focal" => Some("20.04"),
        "jammy" => Some("22.04"),
        "noble" => Some("24.04"),
        _ => None,
    }
}

/// Release name without the `-daily` image suffix
pub fn base_release(release: &str) -> &str {
    release.strip_suffix("-daily").unwrap_or(release)
}

/// A file generated at setup time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFile {
    pub path: String,
    pub contents: String,
    /// Owned by root rather than the ubuntu user
    pub privileged: bool,
}

/// Steps turning a fresh machine into one that runs checkbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    /// Source checkout to place at [`SOURCE_DIR`]
    pub source_tree: Option<PathBuf>,
    /// Host files and directories to copy
    pub transfers: Vec<Transfer>,
    /// Shell commands, in order
    pub commands: Vec<String>,
    /// systemd unit files, written after the commands
    pub files: Vec<GeneratedFile>,
    /// Commands enabling the service, run after the unit files are in place
    pub service_commands: Vec<String>,
    /// Command invoking the checkbox CLI
    pub program: String,
    /// systemd unit of the checkbox service, when this role runs one
    pub service_unit: Option<String>,
}

impl InstallPlan {
    /// Work out the plan for one machine of `config` running `release`
    pub fn for_machine(config: &MachineConfig, release: &str) -> Result<Self> {
        let mut plan = match config.origin {
            Origin::Snap | Origin::ClassicSnap => Self::snap(config, release)?,
            Origin::Ppa => Self::ppa(config),
            Origin::Source => Self::source(config),
        };
        plan.transfers.extend(config.transfer.iter().cloned());
        plan.commands.extend(config.setup.iter().cloned());
        Ok(plan)
    }

    fn empty(program: String) -> Self {
        Self {
            source_tree: None,
            transfers: Vec::new(),
            commands: Vec::new(),
            files: Vec::new(),
            service_commands: Vec::new(),
            program,
            service_unit: None,
        }
    }

    fn snap(config: &MachineConfig, release: &str) -> Result<Self> {
        let mut plan = Self::empty(format!("{}.checkbox-cli", config.name));

        if let Some(risk) = &config.core_risk {
            let core = core_snap(release).ok_or_else(|| {
                Error::Config(format!("no checkbox runtime snap known for release '{}'", release))
            })?;
            plan.commands.push(format!(
                "sudo snap install {} --channel=latest/{}",
                core, risk
            ));
        }

        let confinement = match config.origin {
            Origin::ClassicSnap => "classic",
            _ => "devmode",
        };

        let uri = config.uri_str();
        if uri.ends_with(".snap") {
            let file_name = Path::new(uri)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| format!("{}.snap", config.name));
            let dest = format!("/home/ubuntu/{}", file_name);
            plan.transfers.push(Transfer {
                src: PathBuf::from(uri),
                dest: dest.clone(),
            });
            plan.commands.push(format!(
                "sudo snap install {} --{} --dangerous",
                dest, confinement
            ));
        } else {
            let track = match config.track_map.get(release) {
                Some(track) => track.as_str(),
                None => default_track(release).ok_or_else(|| {
                    Error::Config(format!(
                        "no snap track known for release '{}', add it to track_map",
                        release
                    ))
                })?,
            };
            plan.commands.push(format!(
                "sudo snap install {} --channel={}/{} --{}",
                config.name, track, config.risk, confinement
            ));
        }

        if config.role.hosts_service() {
            plan.service_unit = Some(format!("snap.{}.service.service", config.name));
        }
        Ok(plan)
    }

    fn ppa(config: &MachineConfig) -> Self {
        let mut plan = Self::empty("checkbox-cli".to_string());
        // Explicit setup commands replace the package installation
        if config.setup.is_empty() {
            let package = if config.role == Mode::Remote {
                "checkbox-ng"
            } else {
                "canonical-certification-client"
            };
            plan.commands = vec![
                format!("sudo add-apt-repository -y {}", config.uri_str()),
                "sudo apt-get update".to_string(),
                format!(
                    "sudo apt-get install -y --no-install-recommends {}",
                    package
                ),
            ];
        }
        if config.role.hosts_service() {
            plan.service_unit = Some(SOURCE_SERVICE_UNIT.to_string());
        }
        plan
    }

    fn source(config: &MachineConfig) -> Self {
        let root = PathBuf::from(config.uri_str());
        let mut plan = Self::empty("checkbox-cli".to_string());
        plan.source_tree = Some(root.clone());

        for provider in PROVIDERS {
            let dest = format!("/var/tmp/checkbox-providers/{}", provider);
            plan.transfers.push(Transfer {
                src: root.join("providers").join(provider),
                dest,
            });
        }

        plan.commands = vec![
            "sudo bash -c 'chmod +x /var/tmp/checkbox-providers/base/bin/*'".to_string(),
            "sudo bash -c 'chmod +x /var/tmp/checkbox-providers/resource/bin/*'".to_string(),
            format!(
                "bash -c 'cd {}/checkbox-ng && sudo python3 -m pip install -e .'",
                SOURCE_DIR
            ),
            format!(
                "bash -c 'cd {}/checkbox-support && sudo python3 -m pip install -e .'",
                SOURCE_DIR
            ),
        ];

        // The controller only ever runs `checkbox-cli control`
        let subcommand = match config.role {
            Mode::Agent => Some("run-agent"),
            Mode::Service | Mode::Remote => Some("service"),
            Mode::Local | Mode::Controller => None,
        };
        if let Some(subcommand) = subcommand {
            plan.files.push(GeneratedFile {
                path: format!("/usr/lib/systemd/system/{}", SOURCE_SERVICE_UNIT),
                contents: service_unit_file(subcommand),
                privileged: true,
            });
            plan.service_commands = vec![
                "sudo systemctl daemon-reload".to_string(),
                format!("sudo systemctl enable {} --now", SOURCE_SERVICE_UNIT),
            ];
            plan.service_unit = Some(SOURCE_SERVICE_UNIT.to_string());
        }

        plan
    }
}

fn service_unit_file(subcommand: &str) -> String {
    format!(
        "[Unit]
Description=Checkbox Remote Service
Wants=network.target

[Service]
ExecStart=/usr/local/bin/checkbox-cli {}
SyslogIdentifier=checkbox-ng.service
Environment=\"XDG_CACHE_HOME=/var/cache/\"
Restart=on-failure
TimeoutStopSec=30
Type=simple

[Install]
WantedBy=multi-user.target
",
        subcommand
    )
}
