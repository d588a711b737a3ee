//! Docker machines for from-source installs
//!
//! Each machine gets its own compose document in a scratch directory. The
//! source tree is bind-mounted rather than copied, and once provisioned the
//! container is committed to an image so that a reset recreates it clean.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

use super::install::{InstallPlan, SOURCE_DIR};
use super::shell::{self, args, quote};
use super::{Backend, Machine, MachineConfig, MachineProvider, MachineState, BASE_ENV};
use crate::common::config::Timeouts;
use crate::common::{Error, Result};
use crate::session::{ExecuteResult, InteractiveSession};

const DOCKER: &str = "docker";

/// Tools the stock Ubuntu images lack for a source install
const BOOTSTRAP: &str =
    "apt-get update && DEBIAN_FRONTEND=noninteractive apt-get install -y sudo python3-pip";

/// Grace period for the service to start listening
const SERVICE_STARTUP: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
struct ComposeFile {
    services: BTreeMap<String, ComposeService>,
}

#[derive(Debug, Serialize)]
struct ComposeService {
    image: String,
    container_name: String,
    command: Vec<String>,
    entrypoint: String,
    environment: Vec<String>,
    volumes: Vec<String>,
}

/// A machine backed by a Docker container
pub struct DockerProvider {
    machine: Machine,
    config: MachineConfig,
    plan: InstallPlan,
    image: String,
    workdir: Option<tempfile::TempDir>,
    committed: bool,
    timeouts: Timeouts,
}

impl DockerProvider {
    pub fn new(
        config: &MachineConfig,
        release: &str,
        plan: InstallPlan,
        timeouts: &Timeouts,
    ) -> Self {
        let image = config
            .image
            .clone()
            .unwrap_or_else(|| format!("ubuntu:{}", super::install::base_release(release)));
        Self {
            machine: Machine::new(config, release, Backend::Docker),
            config: config.clone(),
            plan,
            image,
            workdir: None,
            committed: false,
            timeouts: timeouts.clone(),
        }
    }

    fn name(&self) -> &str {
        &self.machine.name
    }

    fn provisioned_image(&self) -> String {
        format!("{}-provisioned", self.name())
    }

    fn compose(&self, image: &str) -> ComposeFile {
        let mut volumes = Vec::new();
        if let Some(tree) = &self.plan.source_tree {
            volumes.push(format!("{}:{}", tree.display(), SOURCE_DIR));
        }
        let mut services = BTreeMap::new();
        services.insert(
            self.name().to_string(),
            ComposeService {
                image: image.to_string(),
                container_name: self.name().to_string(),
                command: args(["sleep", "infinity"]),
                entrypoint: String::new(),
                environment: vec!["HOME=/home/ubuntu".to_string()],
                volumes,
            },
        );
        ComposeFile { services }
    }

    fn compose_path(&self) -> Result<PathBuf> {
        self.workdir
            .as_ref()
            .map(|d| d.path().join("docker-compose.yaml"))
            .ok_or_else(|| Error::Internal(format!("{} has no compose file yet", self.name())))
    }

    fn write_compose(&self, image: &str) -> Result<PathBuf> {
        let path = self.compose_path()?;
        let yaml = serde_yaml::to_string(&self.compose(image))
            .map_err(|e| Error::Internal(format!("Failed to serialize compose file: {}", e)))?;
        std::fs::write(&path, yaml)?;
        Ok(path)
    }

    async fn compose_cmd(&self, extra: &[&str]) -> Result<ExecuteResult> {
        let path = self.compose_path()?;
        let mut a = args(["compose", "-f"]);
        a.push(path.to_string_lossy().to_string());
        a.extend(args(extra));
        self.docker(&a).await
    }

    async fn docker(&self, a: &[String]) -> Result<ExecuteResult> {
        shell::run_checked(DOCKER, a, self.timeouts.command())
            .await
            .map_err(|e| Error::provisioning(self.name(), e))
    }

    fn exec_args(&self, cmd: &str, env: &BTreeMap<String, String>, interactive: bool) -> Vec<String> {
        let mut a = args(["exec"]);
        if interactive {
            a.push("-i".to_string());
        }
        for (k, v) in BASE_ENV.iter().copied().chain(env.iter().map(|(k, v)| (k.as_str(), v.as_str()))) {
            a.push("-e".to_string());
            a.push(format!("{}={}", k, v));
        }
        a.push(self.name().to_string());
        if interactive {
            // script(1) gives the program a pseudo-terminal
            a.extend(args(["script", "-qfec", cmd, "/dev/null"]));
        } else {
            a.extend(args(["bash", "-lc", cmd]));
        }
        a
    }

    async fn copy_in(&self, src: &Path, dest: &str) -> Result<()> {
        let parent = Path::new(dest)
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|| "/".to_string());
        self.docker(&args(["exec", self.name(), "mkdir", "-p", parent.as_str()]))
            .await?;
        let target = format!("{}:{}", self.name(), dest);
        let src = src.to_string_lossy().to_string();
        self.docker(&args(["cp", src.as_str(), target.as_str()]))
            .await?;
        Ok(())
    }

    async fn provision(&mut self) -> Result<()> {
        self.workdir = Some(tempfile::tempdir()?);
        self.write_compose(&self.image)?;
        tracing::info!(machine = %self.machine, image = %self.image, "Starting container");
        self.compose_cmd(&["up", "-d"]).await?;

        let mut commands = Vec::new();
        if self.config.image.is_none() {
            commands.push(BOOTSTRAP.to_string());
        }
        commands.extend(self.plan.commands.iter().cloned());

        for transfer in &self.plan.transfers {
            self.copy_in(&transfer.src, &transfer.dest).await?;
        }
        // systemd units are skipped, start_service runs the program directly
        for cmd in &commands {
            tracing::info!(machine = %self.machine, command = %cmd, "Running setup command");
            let result = self.execute(cmd, self.timeouts.setup_command()).await?;
            if !result.success() {
                return Err(Error::provisioning(
                    self.name(),
                    format!("'{}' exited with code {}\n{}", cmd, result.exit_code, result.combined),
                ));
            }
        }
        self.machine.state = MachineState::Provisioned;

        let snapshot = self.provisioned_image();
        self.docker(&args(["commit", self.name(), snapshot.as_str()]))
            .await?;
        self.committed = true;
        self.write_compose(&snapshot)?;
        Ok(())
    }
}

#[async_trait]
impl MachineProvider for DockerProvider {
    fn machine(&self) -> &Machine {
        &self.machine
    }

    fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    async fn setup(&mut self) -> Result<()> {
        self.machine.begin_setup()?;
        shell::require(DOCKER)?;

        // A setup cut short by a timeout leaves the container behind
        self.machine.state = MachineState::Failed;
        if let Err(e) = self.provision().await {
            self.machine.state = MachineState::Failed;
            return Err(e);
        }
        self.machine.state = MachineState::Ready;
        tracing::info!(machine = %self.machine, "Provisioned");
        Ok(())
    }

    async fn put(&self, path: &str, contents: &[u8]) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new()?;
        tmp.write_all(contents)?;
        tmp.flush()?;
        self.copy_in(tmp.path(), path)
            .await
            .map_err(|e| Error::session_io(self.name(), e))
    }

    async fn execute(&self, cmd: &str, timeout: Duration) -> Result<ExecuteResult> {
        shell::run(DOCKER, &self.exec_args(cmd, &BTreeMap::new(), false), timeout).await
    }

    async fn interactive(
        &self,
        cmd: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<InteractiveSession> {
        tracing::info!(machine = %self.machine, command = %cmd, "Starting interactive session");
        let mut command = Command::new(DOCKER);
        command.args(self.exec_args(cmd, env, true));
        InteractiveSession::spawn(self.name(), command)
    }

    fn program_command(&self, args: &str) -> String {
        format!("{} {}", self.plan.program, args).trim_end().to_string()
    }

    async fn start_service(&self) -> Result<()> {
        let subcommand = if self.config.role == super::Mode::Agent {
            "run-agent"
        } else {
            "service"
        };
        // No systemd in the container, the service runs detached
        let cmd = format!(
            "rm -rf /var/tmp/checkbox-ng/sessions/* ; {}",
            self.program_command(subcommand)
        );
        self.docker(&args(["exec", "-d", self.name(), "bash", "-lc", cmd.as_str()]))
            .await?;
        tokio::time::sleep(SERVICE_STARTUP).await;
        Ok(())
    }

    async fn address(&self) -> Result<String> {
        let result = self
            .docker(&args([
                "inspect",
                "-f",
                "{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}",
                self.name(),
            ]))
            .await?;
        let address = result.stdout.trim();
        if address.is_empty() {
            return Err(Error::provisioning(self.name(), "container has no IP address"));
        }
        Ok(address.to_string())
    }

    async fn reset(&mut self) -> Result<()> {
        tracing::debug!(machine = %self.machine, "Recreating container from provisioned image");
        self.compose_cmd(&["up", "-d", "--force-recreate"]).await?;
        Ok(())
    }

    fn connecting_command(&self) -> String {
        let name = quote(self.name());
        format!("docker start {name} && docker exec -it {name} bash")
    }

    async fn stop(&mut self) -> Result<()> {
        if self.workdir.is_none() {
            return Ok(());
        }
        let result = shell::run(DOCKER, &args(["stop", self.name()]), self.timeouts.command()).await?;
        if !result.success() && !result.stderr.contains("No such container") {
            return Err(Error::Teardown {
                machine: self.name().to_string(),
                reason: result.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    async fn destroy(&mut self) -> Result<()> {
        if self.workdir.is_none() {
            return Ok(());
        }
        let result = shell::run(DOCKER, &args(["rm", "-f", self.name()]), self.timeouts.command()).await?;
        if !result.success() && !result.stderr.contains("No such container") {
            return Err(Error::Teardown {
                machine: self.name().to_string(),
                reason: result.stderr.trim().to_string(),
            });
        }
        if self.committed {
            let image = self.provisioned_image();
            let result = shell::run(DOCKER, &args(["rmi", image.as_str()]), self.timeouts.command()).await?;
            if !result.success() {
                tracing::warn!(machine = %self.machine, image = %image, "Failed to remove image: {}", result.stderr.trim());
            }
            self.committed = false;
        }
        Ok(())
    }
}
