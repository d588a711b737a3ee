//! LXD container machines, driven through the `lxc` CLI

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::Instant;

use super::install::{InstallPlan, SOURCE_DIR};
use super::shell::{self, args, quote};
use super::{Backend, Machine, MachineConfig, MachineProvider, MachineState, BASE_ENV};
use crate::common::config::Timeouts;
use crate::common::{Error, Result};
use crate::session::{ExecuteResult, InteractiveSession};

const LXC: &str = "lxc";

/// Snapshot taken once provisioning is complete
const SNAPSHOT: &str = "provisioned";

const CLOUD_INIT_POLL: Duration = Duration::from_secs(5);
const SYSTEMD_POLL: Duration = Duration::from_secs(1);

/// Image for a release, `-daily` releases come from the daily remote
pub fn image_for(release: &str) -> String {
    match release.strip_suffix("-daily") {
        Some(base) => format!("ubuntu-daily:{}", base),
        None => format!("ubuntu:{}", release),
    }
}

/// A machine backed by an LXD container
pub struct LxdProvider {
    machine: Machine,
    config: MachineConfig,
    plan: InstallPlan,
    timeouts: Timeouts,
}

impl LxdProvider {
    pub fn new(
        config: &MachineConfig,
        release: &str,
        plan: InstallPlan,
        timeouts: &Timeouts,
    ) -> Self {
        Self {
            machine: Machine::new(config, release, Backend::Lxd),
            config: config.clone(),
            plan,
            timeouts: timeouts.clone(),
        }
    }

    fn name(&self) -> &str {
        &self.machine.name
    }

    /// `lxc exec` arguments running `cmd` as the ubuntu user in a login shell
    fn exec_args(&self, cmd: &str, env: &BTreeMap<String, String>, interactive: bool) -> Vec<String> {
        let mut a = args(["exec", self.name()]);
        if interactive {
            a.push("--force-interactive".to_string());
        }
        a.extend(args(["--", "sudo", "--user", "ubuntu", "--login", "env"]));
        a.extend(BASE_ENV.iter().map(|(k, v)| format!("{}={}", k, v)));
        a.extend(env.iter().map(|(k, v)| format!("{}={}", k, v)));
        a.extend(args(["bash", "-c", cmd]));
        a
    }

    async fn lxc(&self, a: &[String]) -> Result<ExecuteResult> {
        shell::run_checked(LXC, a, self.timeouts.command())
            .await
            .map_err(|e| Error::provisioning(self.name(), e))
    }

    /// Run a provisioning command, failing on a non-zero exit code
    async fn setup_command(&self, cmd: &str) -> Result<()> {
        tracing::info!(machine = %self.machine, command = %cmd, "Running setup command");
        let result = self.execute(cmd, self.timeouts.setup_command()).await?;
        if !result.success() {
            return Err(Error::provisioning(
                self.name(),
                format!(
                    "'{}' exited with code {}\n{}",
                    cmd, result.exit_code, result.combined
                ),
            ));
        }
        Ok(())
    }

    async fn wait_cloud_init(&self) -> Result<()> {
        let deadline = Instant::now() + self.timeouts.boot();
        while Instant::now() < deadline {
            tokio::time::sleep(CLOUD_INIT_POLL).await;
            let result = shell::run(
                LXC,
                &args(["exec", self.name(), "--", "cloud-init", "status", "--long"]),
                self.timeouts.command(),
            )
            .await?;
            if result.stdout.contains("status: done") {
                return Ok(());
            }
            if !result.success() {
                return Err(Error::provisioning(
                    self.name(),
                    format!("cloud-init failed: {}", result.combined.trim()),
                ));
            }
        }
        Err(Error::provisioning(
            self.name(),
            "timed out waiting for cloud-init",
        ))
    }

    /// Copy a host directory into the container, owned by the ubuntu user
    async fn push_dir(&self, src: &Path, dest: &str) -> Result<()> {
        if !src.is_dir() {
            return Err(Error::provisioning(
                self.name(),
                format!("'{}' is not a directory", src.display()),
            ));
        }
        self.lxc(&args(["exec", self.name(), "--", "mkdir", "-p", dest]))
            .await?;
        let pipeline = format!(
            "tar -C {} -cf - . | {} exec {} -- tar -C {} -xf -",
            quote(&src.to_string_lossy()),
            LXC,
            quote(self.name()),
            quote(dest)
        );
        let copy = args(["-c", pipeline.as_str()]);
        shell::run_checked("sh", &copy, self.timeouts.setup_command())
            .await
            .map_err(|e| Error::provisioning(self.name(), e))?;
        self.lxc(&args([
            "exec",
            self.name(),
            "--",
            "chown",
            "-R",
            "ubuntu:ubuntu",
            dest,
        ]))
        .await?;
        Ok(())
    }

    async fn push_file(&self, src: &Path, dest: &str, privileged: bool) -> Result<()> {
        let target = format!("{}{}", self.name(), dest);
        let (uid, gid) = if privileged { ("0", "0") } else { ("1000", "1000") };
        let src = src.to_string_lossy().to_string();
        self.lxc(&args([
            "file",
            "push",
            src.as_str(),
            target.as_str(),
            "--create-dirs",
            "--uid",
            uid,
            "--gid",
            gid,
        ]))
        .await?;
        Ok(())
    }

    async fn write_file(&self, dest: &str, contents: &[u8], privileged: bool) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new()?;
        tmp.write_all(contents)?;
        tmp.flush()?;
        self.push_file(tmp.path(), dest, privileged).await
    }

    async fn provision(&mut self) -> Result<()> {
        let image = self
            .config
            .image
            .clone()
            .unwrap_or_else(|| image_for(&self.machine.release));
        tracing::info!(machine = %self.machine, image = %image, "Launching container");

        let mut launch = args(["launch", image.as_str(), self.name(), "--profile", "default"]);
        for profile in &self.config.profiles {
            launch.push("--profile".to_string());
            launch.push(profile.clone());
        }
        self.lxc(&launch).await?;

        self.wait_cloud_init().await?;
        tracing::debug!(machine = %self.machine, "cloud-init done");

        if let Some(tree) = &self.plan.source_tree {
            self.push_dir(tree, SOURCE_DIR).await?;
        }
        for transfer in &self.plan.transfers {
            if transfer.src.is_dir() {
                self.push_dir(&transfer.src, &transfer.dest).await?;
            } else {
                self.push_file(&transfer.src, &transfer.dest, false).await?;
            }
        }
        for cmd in &self.plan.commands {
            self.setup_command(cmd).await?;
        }
        for file in &self.plan.files {
            self.write_file(&file.path, file.contents.as_bytes(), file.privileged)
                .await?;
        }
        for cmd in &self.plan.service_commands {
            self.setup_command(cmd).await?;
        }
        self.machine.state = MachineState::Provisioned;

        self.lxc(&args(["stop", self.name()])).await?;
        self.lxc(&args(["snapshot", self.name(), SNAPSHOT])).await?;
        self.lxc(&args(["start", self.name()])).await?;
        if self.config.role.hosts_service() {
            self.wait_systemd().await?;
        }
        Ok(())
    }

    /// Wait for systemd to finish booting after a (re)start
    async fn wait_systemd(&self) -> Result<()> {
        let deadline = Instant::now() + self.timeouts.boot();
        while Instant::now() < deadline {
            let result = shell::run(
                LXC,
                &args(["exec", self.name(), "--", "systemctl", "is-system-running"]),
                self.timeouts.command(),
            )
            .await?;
            if matches!(result.stdout.trim(), "running" | "degraded" | "starting") {
                return Ok(());
            }
            tokio::time::sleep(SYSTEMD_POLL).await;
        }
        Err(Error::provisioning(self.name(), "systemd did not become ready"))
    }

    /// Whether the container was ever launched
    fn launched(&self) -> bool {
        self.machine.state != MachineState::Created
    }
}

#[async_trait]
impl MachineProvider for LxdProvider {
    fn machine(&self) -> &Machine {
        &self.machine
    }

    fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    async fn setup(&mut self) -> Result<()> {
        self.machine.begin_setup()?;
        shell::require(LXC)?;

        // From here on teardown has to consider the container to exist
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
        self.write_file(path, contents, false)
            .await
            .map_err(|e| Error::session_io(self.name(), e))
    }

    async fn execute(&self, cmd: &str, timeout: Duration) -> Result<ExecuteResult> {
        shell::run(LXC, &self.exec_args(cmd, &BTreeMap::new(), false), timeout).await
    }

    async fn interactive(
        &self,
        cmd: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<InteractiveSession> {
        tracing::info!(machine = %self.machine, command = %cmd, "Starting interactive session");
        let mut command = Command::new(LXC);
        command.args(self.exec_args(cmd, env, true));
        InteractiveSession::spawn(self.name(), command)
    }

    fn program_command(&self, args: &str) -> String {
        format!("{} {}", self.plan.program, args).trim_end().to_string()
    }

    async fn start_service(&self) -> Result<()> {
        let unit = self.plan.service_unit.as_deref().ok_or_else(|| {
            Error::provisioning(self.name(), "this machine does not run the checkbox service")
        })?;
        self.lxc(&args([
            "exec",
            self.name(),
            "--",
            "systemctl",
            "restart",
            unit,
        ]))
        .await?;
        let deadline = Instant::now() + self.timeouts.boot();
        while Instant::now() < deadline {
            let result = shell::run(
                LXC,
                &args(["exec", self.name(), "--", "systemctl", "is-active", unit]),
                self.timeouts.command(),
            )
            .await?;
            if result.stdout.trim() == "active" {
                return Ok(());
            }
            tokio::time::sleep(SYSTEMD_POLL).await;
        }
        Err(Error::provisioning(
            self.name(),
            format!("{} did not become active", unit),
        ))
    }

    async fn address(&self) -> Result<String> {
        let result = self
            .lxc(&args(["list", self.name(), "--format", "json"]))
            .await?;
        parse_address(&result.stdout, self.name())
    }

    async fn reset(&mut self) -> Result<()> {
        tracing::debug!(machine = %self.machine, "Restoring snapshot");
        self.lxc(&args(["stop", self.name(), "--force"])).await?;
        self.lxc(&args(["restore", self.name(), SNAPSHOT])).await?;
        self.lxc(&args(["start", self.name()])).await?;
        if self.config.role.hosts_service() {
            self.wait_systemd().await?;
        }
        Ok(())
    }

    fn connecting_command(&self) -> String {
        format!(
            "lxc start {name} && lxc exec {name} -- sudo --user ubuntu --login",
            name = self.name()
        )
    }

    async fn stop(&mut self) -> Result<()> {
        if !self.launched() {
            return Ok(());
        }
        let result = shell::run(LXC, &args(["stop", self.name(), "--force"]), self.timeouts.command()).await?;
        if !result.success() && !is_already_gone(&result.stderr) {
            return Err(Error::Teardown {
                machine: self.name().to_string(),
                reason: result.stderr.trim().to_string(),
            });
        }
        tracing::debug!(machine = %self.machine, "Stopped");
        Ok(())
    }

    async fn destroy(&mut self) -> Result<()> {
        if !self.launched() {
            return Ok(());
        }
        let result =
            shell::run(LXC, &args(["delete", self.name(), "--force"]), self.timeouts.command()).await?;
        if !result.success() && !result.stderr.contains("not found") {
            return Err(Error::Teardown {
                machine: self.name().to_string(),
                reason: result.stderr.trim().to_string(),
            });
        }
        tracing::debug!(machine = %self.machine, "Deleted");
        Ok(())
    }
}

fn is_already_gone(stderr: &str) -> bool {
    stderr.contains("already stopped") || stderr.contains("not found")
}

/// First IPv4 address of `eth0` in `lxc list --format json` output
fn parse_address(json: &str, name: &str) -> Result<String> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    value
        .as_array()
        .and_then(|list| list.iter().find(|c| c["name"] == name))
        .and_then(|c| c["state"]["network"]["eth0"]["addresses"].as_array())
        .and_then(|addresses| {
            addresses
                .iter()
                .find(|a| a["family"] == "inet")
                .and_then(|a| a["address"].as_str())
        })
        .map(str::to_string)
        .ok_or_else(|| Error::provisioning(name, "container has no IPv4 address on eth0"))
}
