//! Scenario runner
//!
//! Drives every planned variant through provisioning, its steps and
//! teardown, running independent variants concurrently.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};

use crate::common::config::{Config, MachinePolicy, Timeouts};
use crate::common::{tail, Error, Result};
use crate::machine::{MachineConfig, MachineProvider, MachineState, Mode, ProviderFactory};

use super::report::{Outcome, RunReport, RunSummary};
use super::{Action, Plan, Scenario, StepContext, TagFilter, Variant};

/// Characters of program output kept in a report
const OUTPUT_TAIL_CHARS: usize = 2000;

/// Settings shared by every variant of a run
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub filter: TagFilter,
    pub parallelism: usize,
    pub dispose: bool,
    pub policy: MachinePolicy,
    pub timeouts: Timeouts,
}

impl RunSettings {
    pub fn from_config(config: &Config, filter: TagFilter) -> Self {
        Self {
            filter,
            parallelism: config.run.parallelism,
            dispose: config.run.dispose,
            policy: config.run.machine_policy,
            timeouts: config.timeouts.clone(),
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from_config(&Config::default(), TagFilter::default())
    }
}

type Pool = HashMap<(Mode, String), Vec<Box<dyn MachineProvider>>>;

struct Inner {
    factory: Arc<dyn ProviderFactory>,
    machines: BTreeMap<Mode, MachineConfig>,
    settings: RunSettings,
    pool: Mutex<Pool>,
}

/// Runs scenarios against machines created by a [`ProviderFactory`]
#[derive(Clone)]
pub struct ScenarioRunner {
    inner: Arc<Inner>,
}

impl ScenarioRunner {
    pub fn new(
        factory: Arc<dyn ProviderFactory>,
        machines: BTreeMap<Mode, MachineConfig>,
        settings: RunSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                machines,
                settings,
                pool: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.inner.settings
    }

    /// Validate the machine configuration and expand scenarios into variants
    ///
    /// Fails without provisioning anything when a machine configuration is
    /// unusable or when a tag filter matches nothing.
    pub fn plan(&self, scenarios: Vec<Scenario>) -> Result<Plan> {
        for config in self.inner.machines.values() {
            self.inner.factory.check(config)?;
        }

        let scenarios: Vec<Arc<Scenario>> = scenarios.into_iter().map(Arc::new).collect();
        let filter = &self.inner.settings.filter;
        let plan = Plan::build(&scenarios, &self.inner.machines, filter);

        if plan.is_empty() && !filter.is_empty() {
            tracing::warn!("No match found");
            return Err(Error::Config(
                "no scenario matches the given tags".to_string(),
            ));
        }
        Ok(plan)
    }

    /// Run every selected variant and collect their reports
    pub async fn run(&self, scenarios: Vec<Scenario>) -> Result<RunSummary> {
        let started = Instant::now();
        let plan = self.plan(scenarios)?;
        tracing::info!(
            variants = plan.variants.len(),
            skipped = plan.skipped.len(),
            parallelism = self.inner.settings.parallelism,
            "Starting run"
        );

        let semaphore = Arc::new(Semaphore::new(self.inner.settings.parallelism.max(1)));
        let mut handles = Vec::with_capacity(plan.variants.len());
        for variant in plan.variants {
            let runner = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let placeholder = RunReport::new(
                &variant.scenario.name,
                variant.mode,
                variant.releases.clone(),
                variant.scenario.effective_steps().len(),
            );
            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                runner.run_variant(variant).await
            });
            handles.push((placeholder, handle));
        }

        let mut reports = Vec::new();
        for (mut placeholder, handle) in handles {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    tracing::error!(scenario = %placeholder.scenario, error = %e, "Scenario task died");
                    placeholder.fail(Outcome::Errored, format!("scenario task failed: {}", e));
                    reports.push(placeholder);
                }
            }
        }
        for skipped in plan.skipped {
            tracing::info!(scenario = %skipped.scenario.name, mode = %skipped.mode, reason = %skipped.reason, "Skipped");
            reports.push(RunReport::skipped(
                &skipped.scenario.name,
                skipped.mode,
                skipped.reason,
            ));
        }

        self.drain_pool().await;

        Ok(RunSummary {
            reports,
            duration_ms: started.elapsed().as_millis(),
        })
    }

    async fn run_variant(&self, variant: Variant) -> RunReport {
        let started = Instant::now();
        let label = variant.label();
        let steps = variant.scenario.effective_steps();
        let mut report = RunReport::new(
            &variant.scenario.name,
            variant.mode,
            variant.releases.clone(),
            steps.len(),
        );
        tracing::info!(scenario = %label, "Running scenario");

        let mut machines = Vec::new();
        match self.acquire_machines(&variant, &mut machines).await {
            Ok(()) => self.execute(&variant, &steps, &machines, &mut report).await,
            Err(e) => {
                tracing::error!(scenario = %label, error = %e, "Provisioning failed");
                report.fail(Outcome::Errored, e.to_string());
            }
        }

        if report.outcome != Outcome::Passed && !self.inner.settings.dispose {
            for machine in &machines {
                tracing::warn!(
                    scenario = %label,
                    machine = %machine.machine(),
                    "Machine kept for inspection, connect with: {}",
                    machine.connecting_command()
                );
            }
        }

        let reusable = report.outcome == Outcome::Passed;
        for failure in self.release_machines(machines, reusable).await {
            report.fail(Outcome::Errored, failure);
        }

        report.duration_ms = started.elapsed().as_millis();
        match report.outcome {
            Outcome::Passed => tracing::info!(scenario = %label, "PASSED"),
            outcome => tracing::warn!(
                scenario = %label,
                failures = ?report.failures,
                "{}", outcome
            ),
        }
        report
    }

    /// Get one ready machine per role of the variant
    ///
    /// Machines are pushed as soon as they exist so a partially provisioned
    /// machine is still torn down.
    async fn acquire_machines(
        &self,
        variant: &Variant,
        machines: &mut Vec<Box<dyn MachineProvider>>,
    ) -> Result<()> {
        let timeout = self.inner.settings.timeouts.provision();

        for (role, release) in variant.mode.roles().iter().zip(&variant.releases) {
            if let Some(machine) = self.take_pooled(*role, release).await {
                tracing::debug!(machine = %machine.machine(), "Reusing pooled machine");
                machines.push(machine);
                continue;
            }

            let config = self
                .inner
                .machines
                .get(role)
                .ok_or_else(|| Error::Internal(format!("no {} machine configured", role)))?;
            let mut machine = self.inner.factory.create(config, release)?;

            tracing::info!(machine = %machine.machine(), "Provisioning");
            let setup = tokio::time::timeout(timeout, machine.setup()).await;
            let name = machine.machine().name.clone();
            machines.push(machine);
            match setup {
                Ok(result) => result?,
                Err(_) => return Err(Error::timeout(&format!("Provisioning {}", name), timeout)),
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        variant: &Variant,
        steps: &[Action],
        machines: &[Box<dyn MachineProvider>],
        report: &mut RunReport,
    ) {
        let label = variant.label();
        let mut ctx = StepContext::new(
            &variant.scenario,
            variant.mode,
            machines,
            &self.inner.settings.timeouts,
        );

        for (index, step) in steps.iter().enumerate() {
            let step_num = index + 1;
            tracing::debug!(scenario = %label, step = step_num, action = %step, "Step");
            report.steps_run = step_num;

            if let Err(e) = step.apply(&mut ctx).await {
                let outcome = if e.is_assertion() {
                    Outcome::Failed
                } else {
                    Outcome::Errored
                };
                tracing::warn!(scenario = %label, step = step_num, error = %e, "Step failed");
                report.fail(outcome, format!("Step {} ({}): {}", step_num, step, e));
                break;
            }
        }

        if let Some(mut session) = ctx.take_session() {
            // Stops the program if it is still running
            if let Err(e) = session.wait(Duration::ZERO).await {
                tracing::debug!(scenario = %label, error = %e, "Could not reap program");
            }
            if report.outcome != Outcome::Passed {
                report.output_tail = tail(&session.output(), OUTPUT_TAIL_CHARS);
            }
        }
    }

    /// Return machines to the pool or tear them down
    ///
    /// Returns the teardown failures.
    async fn release_machines(
        &self,
        machines: Vec<Box<dyn MachineProvider>>,
        reusable: bool,
    ) -> Vec<String> {
        let mut failures = Vec::new();
        for mut machine in machines {
            if reusable && self.pooled() && machine.machine().state == MachineState::Ready {
                match self.reset(&mut machine).await {
                    Ok(()) => {
                        let key = (machine.machine().role, machine.machine().release.clone());
                        self.inner.pool.lock().await.entry(key).or_default().push(machine);
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(machine = %machine.machine(), error = %e, "Reset failed, tearing down");
                    }
                }
            }
            if let Err(e) = self.teardown(&mut machine).await {
                failures.push(e.to_string());
            }
        }
        failures
    }

    async fn reset(&self, machine: &mut Box<dyn MachineProvider>) -> Result<()> {
        let timeout = self.inner.settings.timeouts.cleanup();
        match tokio::time::timeout(timeout, machine.reset()).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(&format!("Resetting {}", machine.machine()), timeout)),
        }
    }

    /// Tear a machine down, escalating to `destroy` if cleanup hangs, or fails
    /// while disposing
    async fn teardown(&self, machine: &mut Box<dyn MachineProvider>) -> Result<()> {
        let timeout = self.inner.settings.timeouts.cleanup();
        let dispose = self.inner.settings.dispose;
        let name = machine.machine().to_string();

        let reason = match tokio::time::timeout(timeout, machine.cleanup(dispose)).await {
            Ok(Ok(())) => {
                tracing::debug!(machine = %name, dispose, "Torn down");
                return Ok(());
            }
            // A machine kept for inspection is only destroyed when cleanup hangs
            Ok(Err(e)) if !dispose => {
                return Err(Error::Teardown {
                    machine: name,
                    reason: e.to_string(),
                })
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("cleanup timed out after {}s", timeout.as_secs()),
        };
        tracing::warn!(machine = %name, reason = %reason, "Cleanup failed, destroying");

        match tokio::time::timeout(timeout, machine.destroy()).await {
            Ok(Ok(())) => {
                machine.machine_mut().state = MachineState::TornDown;
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Teardown {
                machine: name,
                reason: format!("{}; destroy failed: {}", reason, e),
            }),
            Err(_) => Err(Error::Teardown {
                machine: name,
                reason: format!("{}; destroy timed out", reason),
            }),
        }
    }

    fn pooled(&self) -> bool {
        self.inner.settings.policy == MachinePolicy::Pooled
    }

    async fn take_pooled(&self, role: Mode, release: &str) -> Option<Box<dyn MachineProvider>> {
        if !self.pooled() {
            return None;
        }
        self.inner
            .pool
            .lock()
            .await
            .get_mut(&(role, release.to_string()))
            .and_then(Vec::pop)
    }

    /// Tear down every machine left in the pool
    async fn drain_pool(&self) {
        let pooled: Vec<Box<dyn MachineProvider>> = {
            let mut pool = self.inner.pool.lock().await;
            pool.drain().flat_map(|(_, machines)| machines).collect()
        };
        for mut machine in pooled {
            if let Err(e) = self.teardown(&mut machine).await {
                tracing::error!(error = %e, "Pooled machine teardown failed");
            }
        }
    }
}
