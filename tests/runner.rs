//! Scenario runner tests
//!
//! These run scenarios against "machines" that are just temporary
//! directories on the host: commands run through `sh` and the checkbox
//! program is replaced by a small shell script, so the whole runner
//! (planning, steps, classification and teardown) is exercised without
//! LXD or Docker.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metabox::common::config::{MachinePolicy, Timeouts};
use metabox::machine::shell::{self, quote};
use metabox::machine::{
    Backend, Machine, MachineConfig, MachineFactory, MachineProvider, MachineState, Mode, Origin,
};
use metabox::scenario::{Outcome, RunSettings, Scenario, ScenarioRunner, TagFilter};
use metabox::session::{ExecuteResult, InteractiveSession};
use metabox::{Error, ProviderFactory, Result};

#[derive(Default)]
struct Counters {
    created: AtomicUsize,
    cleaned: AtomicUsize,
    resets: AtomicUsize,
    services: AtomicUsize,
    destroyed: AtomicUsize,
}

impl Counters {
    fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn cleaned(&self) -> usize {
        self.cleaned.load(Ordering::SeqCst)
    }

    fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }
}

/// Ways a host machine can misbehave
#[derive(Default, Clone, Copy)]
struct Faults {
    fail_setup: bool,
    hang_setup: bool,
    hang_cleanup: bool,
    fail_stop: bool,
}

const LAUNCHER: &str = "/launcher.checkbox";
const FOREVER: Duration = Duration::from_secs(3600);

/// A machine living in a temporary directory
struct HostProvider {
    machine: Machine,
    dir: tempfile::TempDir,
    program: String,
    faults: Faults,
    counters: Arc<Counters>,
}

impl HostProvider {
    fn host_path(&self, path: &str) -> PathBuf {
        self.dir.path().join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl MachineProvider for HostProvider {
    fn machine(&self) -> &Machine {
        &self.machine
    }

    fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    async fn setup(&mut self) -> Result<()> {
        self.machine.begin_setup()?;
        if self.faults.hang_setup {
            self.machine.state = MachineState::Failed;
            tokio::time::sleep(FOREVER).await;
        }
        if self.faults.fail_setup {
            self.machine.state = MachineState::Failed;
            return Err(Error::provisioning(&self.machine.name, "image not found"));
        }
        std::fs::write(self.dir.path().join("program.sh"), &self.program)?;
        self.machine.state = MachineState::Ready;
        Ok(())
    }

    async fn put(&self, path: &str, contents: &[u8]) -> Result<()> {
        let target = self.host_path(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(target, contents)?;
        Ok(())
    }

    async fn execute(&self, cmd: &str, timeout: Duration) -> Result<ExecuteResult> {
        let cmd = format!("cd {} && {}", quote(&self.dir.path().display().to_string()), cmd);
        shell::run("sh", &["-c".to_string(), cmd], timeout).await
    }

    async fn interactive(
        &self,
        cmd: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<InteractiveSession> {
        let mut command = tokio::process::Command::new("sh");
        command
            .arg("-c")
            .arg(cmd)
            .current_dir(self.dir.path())
            .envs(env);
        InteractiveSession::spawn(&self.machine.name, command)
    }

    fn program_command(&self, args: &str) -> String {
        let script = self.dir.path().join("program.sh");
        let launcher = self.host_path(LAUNCHER).display().to_string();
        let args = args.replace(LAUNCHER, &quote(&launcher));
        format!("sh {} {}", quote(&script.display().to_string()), args)
    }

    fn launcher_path(&self) -> String {
        LAUNCHER.to_string()
    }

    async fn start_service(&self) -> Result<()> {
        self.counters.services.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn address(&self) -> Result<String> {
        Ok("127.0.0.1".to_string())
    }

    async fn reset(&mut self) -> Result<()> {
        self.counters.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn connecting_command(&self) -> String {
        format!("cd {}", self.dir.path().display())
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    async fn destroy(&mut self) -> Result<()> {
        self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cleanup(&mut self, _dispose: bool) -> Result<()> {
        self.counters.cleaned.fetch_add(1, Ordering::SeqCst);
        if self.faults.hang_cleanup {
            tokio::time::sleep(FOREVER).await;
        }
        if self.faults.fail_stop {
            return Err(Error::Teardown {
                machine: self.machine.name.clone(),
                reason: "stop failed".to_string(),
            });
        }
        self.machine.state = MachineState::TornDown;
        Ok(())
    }
}

struct HostFactory {
    program: String,
    faults: Faults,
    counters: Arc<Counters>,
}

impl HostFactory {
    fn new(program: &str) -> Self {
        Self::with_faults(program, Faults::default())
    }

    fn with_faults(program: &str, faults: Faults) -> Self {
        Self {
            program: program.to_string(),
            faults,
            counters: Arc::new(Counters::default()),
        }
    }
}

impl ProviderFactory for HostFactory {
    fn check(&self, config: &MachineConfig) -> Result<()> {
        config.validate()
    }

    fn create(&self, config: &MachineConfig, release: &str) -> Result<Box<dyn MachineProvider>> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(HostProvider {
            machine: Machine::new(config, release, Backend::Lxd),
            dir: tempfile::tempdir()?,
            program: self.program.clone(),
            faults: self.faults,
            counters: Arc::clone(&self.counters),
        }))
    }
}

fn machines(roles: &[Mode]) -> BTreeMap<Mode, MachineConfig> {
    roles
        .iter()
        .map(|&role| (role, MachineConfig::new(role, Origin::Snap, &["jammy"])))
        .collect()
}

fn settings() -> RunSettings {
    RunSettings {
        filter: TagFilter::default(),
        parallelism: 2,
        dispose: true,
        policy: MachinePolicy::PerScenario,
        timeouts: Timeouts {
            expect_secs: 5.0,
            not_printed_secs: 0.3,
            wait_secs: 5.0,
            cleanup_secs: 5,
            ..Timeouts::default()
        },
    }
}

fn scenarios(yaml: &str) -> Vec<Scenario> {
    Scenario::parse_all(yaml, Path::new("inline.yaml")).unwrap()
}

fn runner(factory: &Arc<HostFactory>, roles: &[Mode], settings: RunSettings) -> ScenarioRunner {
    ScenarioRunner::new(factory.clone(), machines(roles), settings)
}

const PRINTS_HELLO: &str = r#"
name: basic.hello
modes: [local]
steps:
  - action: assert_printed
    pattern: hello
  - action: assert_ret_code
    code: 0
"#;

#[tokio::test]
async fn test_passing_scenario_is_cleaned_up_once() {
    let factory = Arc::new(HostFactory::new("echo hello\n"));
    let summary = runner(&factory, &[Mode::Local], settings())
        .run(scenarios(PRINTS_HELLO))
        .await
        .unwrap();

    assert_eq!(summary.reports.len(), 1);
    let report = &summary.reports[0];
    assert_eq!(report.outcome, Outcome::Passed, "{:?}", report.failures);
    assert_eq!(report.steps_run, 3);
    assert_eq!(report.steps_total, 3);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(factory.counters.created(), 1);
    assert_eq!(factory.counters.cleaned(), 1);
}

#[tokio::test]
async fn test_failed_assertion_is_cleaned_up_once() {
    let factory = Arc::new(HostFactory::new("echo something else\n"));
    let yaml = r#"
name: basic.missing
modes: [local]
steps:
  - action: assert_printed
    pattern: hello
    timeout: 0.5
  - action: assert_ret_code
    code: 0
"#;
    let summary = runner(&factory, &[Mode::Local], settings())
        .run(scenarios(yaml))
        .await
        .unwrap();

    let report = &summary.reports[0];
    assert_eq!(report.outcome, Outcome::Failed);
    // start + the failing assertion, the rest is skipped
    assert_eq!(report.steps_run, 2);
    assert!(report.failures[0].contains("hello"));
    assert!(report.output_tail.contains("something else"));
    assert_eq!(summary.exit_code(), 1);
    assert_eq!(factory.counters.cleaned(), 1);
}

#[tokio::test]
async fn test_provisioning_error_is_cleaned_up_once() {
    let factory = Arc::new(HostFactory::with_faults(
        "echo hello\n",
        Faults {
            fail_setup: true,
            ..Faults::default()
        },
    ));
    let summary = runner(&factory, &[Mode::Local], settings())
        .run(scenarios(PRINTS_HELLO))
        .await
        .unwrap();

    let report = &summary.reports[0];
    assert_eq!(report.outcome, Outcome::Errored);
    assert_eq!(report.steps_run, 0);
    assert!(report.failures[0].contains("image not found"));
    assert_eq!(summary.exit_code(), 1);
    assert_eq!(factory.counters.created(), 1);
    assert_eq!(factory.counters.cleaned(), 1);
}

#[tokio::test]
async fn test_session_error_is_errored() {
    let factory = Arc::new(HostFactory::new("echo hello\n"));
    let yaml = r#"
name: basic.nostart
modes: [local]
steps:
  - action: assert_printed
    pattern: hello
  - action: start
"#;
    // An explicit start later in the list means none is inserted first
    let summary = runner(&factory, &[Mode::Local], settings())
        .run(scenarios(yaml))
        .await
        .unwrap();

    let report = &summary.reports[0];
    assert_eq!(report.outcome, Outcome::Errored);
    assert!(report.failures[0].contains("start"));
    assert_eq!(factory.counters.cleaned(), 1);
}

const EXPECTS_ONE: &str = r#"
name: return-code.one
modes: [local]
steps:
  - action: assert_ret_code
    code: 1
"#;

#[tokio::test]
async fn test_ret_code_passes_on_matching_exit() {
    let factory = Arc::new(HostFactory::new("echo 'job-a failed'\necho 'job-b passed'\nexit 1\n"));
    let summary = runner(&factory, &[Mode::Local], settings())
        .run(scenarios(EXPECTS_ONE))
        .await
        .unwrap();
    assert_eq!(summary.reports[0].outcome, Outcome::Passed);
}

#[tokio::test]
async fn test_ret_code_fails_on_other_exit() {
    let factory = Arc::new(HostFactory::new("exit 0\n"));
    let summary = runner(&factory, &[Mode::Local], settings())
        .run(scenarios(EXPECTS_ONE))
        .await
        .unwrap();
    let report = &summary.reports[0];
    assert_eq!(report.outcome, Outcome::Failed);
    assert!(report.failures[0].contains("expected return code 1, got 0"));
}

#[tokio::test]
async fn test_unsupported_mode_is_skipped() {
    let factory = Arc::new(HostFactory::new("echo hello\n"));
    let summary = runner(&factory, &[Mode::Remote, Mode::Service], settings())
        .run(scenarios(PRINTS_HELLO))
        .await
        .unwrap();

    assert_eq!(summary.reports.len(), 1);
    assert_eq!(summary.reports[0].outcome, Outcome::Skipped);
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(factory.counters.created(), 0);
}

#[tokio::test]
async fn test_remote_mode_starts_service_first() {
    let factory = Arc::new(HostFactory::new("echo \"args: $*\"\n"));
    let yaml = r#"
name: remote.args
modes: [remote]
launcher: |
  [launcher]
  launcher_version = 1
steps:
  - action: assert_printed
    pattern: "args: remote 127.0.0.1 "
"#;
    let summary = runner(&factory, &[Mode::Remote, Mode::Service], settings())
        .run(scenarios(yaml))
        .await
        .unwrap();

    let report = &summary.reports[0];
    assert_eq!(report.outcome, Outcome::Passed, "{:?}", report.failures);
    assert_eq!(report.releases, vec!["jammy", "jammy"]);
    assert_eq!(factory.counters.services.load(Ordering::SeqCst), 1);
    assert_eq!(factory.counters.created(), 2);
    assert_eq!(factory.counters.cleaned(), 2);
}

#[tokio::test]
async fn test_launcher_and_input_reach_the_program() {
    let factory = Arc::new(HostFactory::new(
        "cat \"$1\"\nread answer\necho \"answer: $answer\"\n",
    ));
    let yaml = r#"
name: launcher.input
modes: [local]
launcher: |
  [launcher]
  launcher_version = 1
steps:
  - action: assert_printed
    pattern: "launcher_version = 1"
  - action: send_text
    text: "yes\n"
  - action: assert_printed
    pattern: 'answer: y.s'
    regex: true
  - action: assert_not_printed
    pattern: Traceback
  - action: assert_ret_code
    code: 0
"#;
    let summary = runner(&factory, &[Mode::Local], settings())
        .run(scenarios(yaml))
        .await
        .unwrap();
    let report = &summary.reports[0];
    assert_eq!(report.outcome, Outcome::Passed, "{:?}", report.failures);
}

#[tokio::test]
async fn test_repeated_start_lets_each_run_finish() {
    let factory = Arc::new(HostFactory::new(
        "sleep 0.5\necho run >> runs.txt\necho \"runs: $(wc -l < runs.txt | tr -d ' ')\"\nexit 1\n",
    ));
    let yaml = r#"
name: restart.resume
modes: [local]
steps:
  - action: start
  - action: start
  - action: start
  - action: assert_printed
    pattern: "runs: 3"
  - action: assert_ret_code
    code: 1
"#;
    let summary = runner(&factory, &[Mode::Local], settings())
        .run(scenarios(yaml))
        .await
        .unwrap();
    let report = &summary.reports[0];
    assert_eq!(report.outcome, Outcome::Passed, "{:?} {}", report.failures, report.output_tail);
}

#[tokio::test]
async fn test_closed_input_is_errored_and_stops_the_scenario() {
    let factory = Arc::new(HostFactory::new("exit 0\n"));
    let yaml = r#"
name: session.closed
modes: [local]
steps:
  - action: assert_ret_code
    code: 0
  - action: send_text
    text: "too late\n"
  - action: assert_printed
    pattern: never
"#;
    let summary = runner(&factory, &[Mode::Local], settings())
        .run(scenarios(yaml))
        .await
        .unwrap();

    let report = &summary.reports[0];
    assert_eq!(report.outcome, Outcome::Errored);
    // start, assert_ret_code, then the failing send_text
    assert_eq!(report.steps_run, 3);
    assert_eq!(report.steps_total, 4);
    assert!(report.failures[0].contains("input is closed"), "{:?}", report.failures);
    assert_eq!(factory.counters.cleaned(), 1);
}

#[tokio::test]
async fn test_run_cmd_prepares_the_machine() {
    let factory = Arc::new(HostFactory::new("cat tree/a/marker\n"));
    let yaml = r#"
name: run-cmd.tree
modes: [local]
steps:
  - action: run_cmd
    cmd: mkdir -p tree/a && echo made > tree/a/marker
  - action: start
  - action: assert_printed
    pattern: made
---
name: run-cmd.broken
modes: [local]
steps:
  - action: run_cmd
    cmd: exit 3
  - action: start
"#;
    let summary = runner(&factory, &[Mode::Local], settings())
        .run(scenarios(yaml))
        .await
        .unwrap();

    let tree = summary.reports.iter().find(|r| r.scenario == "run-cmd.tree").unwrap();
    assert_eq!(tree.outcome, Outcome::Passed, "{:?}", tree.failures);

    let broken = summary.reports.iter().find(|r| r.scenario == "run-cmd.broken").unwrap();
    assert_eq!(broken.outcome, Outcome::Errored);
    assert_eq!(broken.steps_run, 1);
    assert!(broken.failures[0].contains("code 3"), "{:?}", broken.failures);
}

#[tokio::test]
async fn test_provisioning_timeout_is_errored_and_torn_down() {
    let factory = Arc::new(HostFactory::with_faults(
        "echo hello\n",
        Faults {
            hang_setup: true,
            ..Faults::default()
        },
    ));
    let mut settings = settings();
    settings.timeouts.provision_secs = 1;
    let summary = runner(&factory, &[Mode::Local], settings)
        .run(scenarios(PRINTS_HELLO))
        .await
        .unwrap();

    let report = &summary.reports[0];
    assert_eq!(report.outcome, Outcome::Errored);
    assert_eq!(report.steps_run, 0);
    assert!(report.failures[0].contains("timed out"), "{:?}", report.failures);
    assert_eq!(factory.counters.created(), 1);
    assert_eq!(factory.counters.cleaned(), 1);
}

#[tokio::test]
async fn test_hanging_cleanup_escalates_to_destroy_once() {
    let factory = Arc::new(HostFactory::with_faults(
        "echo hello\n",
        Faults {
            hang_cleanup: true,
            ..Faults::default()
        },
    ));
    let mut settings = settings();
    settings.timeouts.cleanup_secs = 1;
    let summary = runner(&factory, &[Mode::Local], settings)
        .run(scenarios(PRINTS_HELLO))
        .await
        .unwrap();

    let report = &summary.reports[0];
    assert_eq!(report.outcome, Outcome::Passed, "{:?}", report.failures);
    assert_eq!(factory.counters.cleaned(), 1);
    assert_eq!(factory.counters.destroyed(), 1);
}

#[tokio::test]
async fn test_failed_cleanup_keeps_machine_without_dispose() {
    let faults = Faults {
        fail_stop: true,
        ..Faults::default()
    };

    let kept = Arc::new(HostFactory::with_faults("echo hello\n", faults));
    let settings_kept = RunSettings {
        dispose: false,
        ..settings()
    };
    let summary = runner(&kept, &[Mode::Local], settings_kept)
        .run(scenarios(PRINTS_HELLO))
        .await
        .unwrap();
    let report = &summary.reports[0];
    assert_eq!(report.outcome, Outcome::Errored);
    assert!(report.failures[0].contains("stop failed"), "{:?}", report.failures);
    assert_eq!(kept.counters.destroyed(), 0);

    let disposed = Arc::new(HostFactory::with_faults("echo hello\n", faults));
    let summary = runner(&disposed, &[Mode::Local], settings())
        .run(scenarios(PRINTS_HELLO))
        .await
        .unwrap();
    assert_eq!(summary.reports[0].outcome, Outcome::Passed);
    assert_eq!(disposed.counters.destroyed(), 1);
}

#[tokio::test]
async fn test_tag_filter_selects_variants() {
    let factory = Arc::new(HostFactory::new("echo hello\n"));
    let yaml = r#"
name: first
tags: [basic, return-code]
modes: [local]
steps:
  - action: assert_printed
    pattern: hello
---
name: second
tags: [installation]
modes: [local]
steps:
  - action: assert_printed
    pattern: hello
"#;
    let settings = RunSettings {
        filter: TagFilter::new(["installation".to_string()], Vec::new()),
        ..settings()
    };
    let summary = runner(&factory, &[Mode::Local], settings)
        .run(scenarios(yaml))
        .await
        .unwrap();

    assert_eq!(summary.reports.len(), 1);
    assert_eq!(summary.reports[0].scenario, "second");
}

#[tokio::test]
async fn test_tag_filter_without_match_aborts() {
    let factory = Arc::new(HostFactory::new("echo hello\n"));
    let settings = RunSettings {
        filter: TagFilter::new(["nothing-has-this".to_string()], Vec::new()),
        ..settings()
    };
    let err = runner(&factory, &[Mode::Local], settings)
        .run(scenarios(PRINTS_HELLO))
        .await
        .unwrap_err();
    assert!(err.is_configuration());
    assert_eq!(factory.counters.created(), 0);
}

#[tokio::test]
async fn test_pooled_machines_are_reused() {
    let factory = Arc::new(HostFactory::new("echo hello\n"));
    let yaml = r#"
name: pool.one
modes: [local]
steps:
  - action: assert_printed
    pattern: hello
---
name: pool.two
modes: [local]
steps:
  - action: assert_printed
    pattern: hello
"#;
    let settings = RunSettings {
        parallelism: 1,
        policy: MachinePolicy::Pooled,
        ..settings()
    };
    let summary = runner(&factory, &[Mode::Local], settings)
        .run(scenarios(yaml))
        .await
        .unwrap();

    assert!(summary.success());
    assert_eq!(factory.counters.created(), 1);
    assert_eq!(factory.counters.resets.load(Ordering::SeqCst), 2);
    assert_eq!(factory.counters.cleaned(), 1);
}

#[tokio::test]
async fn test_unsupported_backend_aborts_before_provisioning() {
    let factory = Arc::new(MachineFactory::new(Backend::Docker));
    let runner = ScenarioRunner::new(factory, machines(&[Mode::Local]), settings());

    let err = runner.run(scenarios(PRINTS_HELLO)).await.unwrap_err();
    assert!(matches!(err, Error::UnsupportedBackend { .. }));
    assert!(err.is_configuration());
}
