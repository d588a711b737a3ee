//! Scenario steps
//!
//! Each step is one [`Action`]. Steps run in order against the machines of
//! a scenario variant through a [`StepContext`], which also owns the program
//! session started by the last `start` step.

use serde::Deserialize;
use std::fmt;

use crate::common::config::{secs_f64, Timeouts};
use crate::common::{Error, Result};
use crate::keys::{Key, Signal};
use crate::machine::shell::quote;
use crate::machine::{MachineProvider, Mode};
use crate::session::{InteractiveSession, Pattern};

use super::Scenario;

/// A single step in a scenario
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case", deny_unknown_fields)]
pub enum Action {
    /// Start checkbox the way the scenario's mode requires
    Start,
    /// Wait for checkbox to terminate and check its return code
    AssertRetCode { code: i32 },
    /// Wait until checkbox prints something
    AssertPrinted {
        pattern: String,
        /// Treat `pattern` as a regular expression
        #[serde(default)]
        regex: bool,
        /// Seconds to wait (default from configuration)
        timeout: Option<f64>,
    },
    /// Check checkbox does not print something
    AssertNotPrinted {
        pattern: String,
        #[serde(default)]
        regex: bool,
        /// Seconds to watch the output (default from configuration)
        timeout: Option<f64>,
    },
    /// Press a key
    SendKey { key: Key },
    /// Type text (sent as-is, add "\n" to submit)
    SendText { text: String },
    /// Pause
    Sleep { secs: f64 },
    /// Write a file on a machine (the launching machine by default)
    Put {
        path: String,
        content: String,
        role: Option<Mode>,
    },
    /// Run a shell command on one machine, or on every machine of the variant
    RunCmd { cmd: String, role: Option<Mode> },
    /// Deliver a signal to checkbox
    Signal { signal: Signal },
}

impl Action {
    /// Compile the pattern of an assertion step
    pub fn pattern(&self) -> Result<Option<Pattern>> {
        match self {
            Action::AssertPrinted { pattern, regex, .. }
            | Action::AssertNotPrinted { pattern, regex, .. } => {
                if *regex {
                    Pattern::regex(pattern).map(Some)
                } else {
                    Ok(Some(Pattern::exact(pattern.as_str())))
                }
            }
            _ => Ok(None),
        }
    }

    /// Execute this step
    pub async fn apply(&self, ctx: &mut StepContext<'_>) -> Result<()> {
        match self {
            Action::Start => ctx.start().await,

            Action::AssertRetCode { code } => {
                let timeout = ctx.timeouts.wait();
                let result = ctx.session()?.wait(timeout).await?;
                if result.exit_code != *code {
                    return Err(Error::Assertion(format!(
                        "expected return code {}, got {}",
                        code, result.exit_code
                    )));
                }
                Ok(())
            }

            Action::AssertPrinted { timeout, .. } => {
                let pattern = self.pattern()?.ok_or_else(|| Error::Internal("no pattern".into()))?;
                let timeout = timeout.map(secs_f64).unwrap_or_else(|| ctx.timeouts.expect());
                ctx.session()?.expect(&pattern, timeout).await
            }

            Action::AssertNotPrinted { timeout, .. } => {
                let pattern = self.pattern()?.ok_or_else(|| Error::Internal("no pattern".into()))?;
                let window = timeout
                    .map(secs_f64)
                    .unwrap_or_else(|| ctx.timeouts.not_printed());
                ctx.session()?.expect_not(&pattern, window).await
            }

            Action::SendKey { key } => ctx.session()?.send(key.bytes()).await,

            Action::SendText { text } => ctx.session()?.send(text.as_bytes()).await,

            Action::Sleep { secs } => {
                tokio::time::sleep(secs_f64(*secs)).await;
                Ok(())
            }

            Action::Put {
                path,
                content,
                role,
            } => {
                let machine = match role {
                    Some(role) => ctx.machine(*role)?,
                    None => ctx.launching()?,
                };
                machine.put(path, content.as_bytes()).await
            }

            Action::RunCmd { cmd, role } => {
                let targets: Vec<&dyn MachineProvider> = match role {
                    Some(role) => vec![ctx.machine(*role)?],
                    None => ctx.machines.iter().map(|m| &**m).collect(),
                };
                let timeout = ctx.timeouts.wait();
                for machine in targets {
                    tracing::info!(machine = %machine.machine(), command = %cmd, "Running command");
                    let result = machine.execute(cmd, timeout).await?;
                    if !result.success() {
                        return Err(Error::CommandFailed {
                            command: cmd.clone(),
                            code: result.exit_code,
                            stderr: crate::common::tail(&result.combined, 2000),
                        });
                    }
                }
                Ok(())
            }

            Action::Signal { signal } => ctx.session()?.signal(*signal),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Start => write!(f, "start"),
            Action::AssertRetCode { code } => write!(f, "assert return code {}", code),
            Action::AssertPrinted { pattern, .. } => write!(f, "assert printed '{}'", pattern),
            Action::AssertNotPrinted { pattern, .. } => {
                write!(f, "assert not printed '{}'", pattern)
            }
            Action::SendKey { key } => write!(f, "send key {}", key),
            Action::SendText { text } => write!(f, "send text {:?}", text),
            Action::Sleep { secs } => write!(f, "sleep {}s", secs),
            Action::Put { path, .. } => write!(f, "put {}", path),
            Action::RunCmd { cmd, .. } => write!(f, "run {:?}", cmd),
            Action::Signal { signal } => write!(f, "signal {:?}", signal),
        }
    }
}

/// State shared by the steps of one scenario variant
pub struct StepContext<'a> {
    pub scenario: &'a Scenario,
    pub mode: Mode,
    /// Machines in the order of `mode.roles()`
    pub machines: &'a [Box<dyn MachineProvider>],
    pub timeouts: &'a Timeouts,
    session: Option<InteractiveSession>,
}

impl<'a> StepContext<'a> {
    pub fn new(
        scenario: &'a Scenario,
        mode: Mode,
        machines: &'a [Box<dyn MachineProvider>],
        timeouts: &'a Timeouts,
    ) -> Self {
        Self {
            scenario,
            mode,
            machines,
            timeouts,
            session: None,
        }
    }

    /// The running program's session
    pub fn session(&mut self) -> Result<&mut InteractiveSession> {
        self.session.as_mut().ok_or(Error::SessionNotStarted)
    }

    /// Take the session out, leaving none behind
    pub fn take_session(&mut self) -> Option<InteractiveSession> {
        self.session.take()
    }

    /// Machine playing `role` in this variant
    pub fn machine(&self, role: Mode) -> Result<&'a dyn MachineProvider> {
        self.machines
            .iter()
            .find(|m| m.machine().role == role)
            .map(|m| &**m)
            .ok_or_else(|| {
                Error::Config(format!(
                    "{} mode has no {} machine",
                    self.mode, role
                ))
            })
    }

    /// Machine checkbox is launched on
    pub fn launching(&self) -> Result<&'a dyn MachineProvider> {
        self.machine(self.mode.roles()[0])
    }

    async fn start(&mut self) -> Result<()> {
        if let Some(mut previous) = self.session.take() {
            // The previous run gets the usual wait timeout before it is killed
            let result = previous.wait(self.timeouts.wait()).await?;
            tracing::debug!(exit_code = result.exit_code, "Previous program finished");
        }

        let machine = self.launching()?;
        let launcher = match &self.scenario.launcher {
            Some(text) => {
                let path = machine.launcher_path();
                machine.put(&path, text.as_bytes()).await?;
                quote(&path)
            }
            None => String::new(),
        };

        let args = match self.mode {
            Mode::Local => launcher,
            Mode::Remote | Mode::Controller => {
                let partner = self.machine(self.mode.roles()[1])?;
                partner.start_service().await?;
                let address = partner.address().await?;
                let verb = if self.mode == Mode::Remote {
                    "remote"
                } else {
                    "control"
                };
                format!("{} {} {}", verb, address, launcher)
            }
            Mode::Service => "service".to_string(),
            Mode::Agent => "run-agent".to_string(),
        };

        let cmd = machine.program_command(args.trim_end());
        let session = machine
            .interactive(&cmd, &self.scenario.environment)
            .await?;
        self.session = Some(session);
        Ok(())
    }
}
