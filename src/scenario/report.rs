//! Run results

use colored::Colorize;
use serde::Serialize;
use std::fmt;

use crate::machine::Mode;

/// How a scenario variant ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    /// Every step succeeded
    Passed,
    /// An assertion did not hold
    Failed,
    /// Provisioning, a session or an action broke
    Errored,
    /// The configuration offers no machines for the mode
    Skipped,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Passed => "PASSED",
            Outcome::Failed => "FAILED",
            Outcome::Errored => "ERRORED",
            Outcome::Skipped => "SKIPPED",
        };
        write!(f, "{}", s)
    }
}

/// Result of one scenario variant
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub scenario: String,
    pub mode: Mode,
    pub releases: Vec<String>,
    pub outcome: Outcome,
    pub steps_run: usize,
    pub steps_total: usize,
    pub failures: Vec<String>,
    /// End of the program's output
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output_tail: String,
    pub duration_ms: u128,
}

impl RunReport {
    pub fn new(scenario: &str, mode: Mode, releases: Vec<String>, steps_total: usize) -> Self {
        Self {
            scenario: scenario.to_string(),
            mode,
            releases,
            outcome: Outcome::Passed,
            steps_run: 0,
            steps_total,
            failures: Vec::new(),
            output_tail: String::new(),
            duration_ms: 0,
        }
    }

    pub fn skipped(scenario: &str, mode: Mode, reason: String) -> Self {
        let mut report = Self::new(scenario, mode, Vec::new(), 0);
        report.outcome = Outcome::Skipped;
        report.failures.push(reason);
        report
    }

    /// Record why the variant did not pass
    ///
    /// The first non-passing outcome sticks; later failures (e.g. from
    /// teardown) are only added to the list.
    pub fn fail(&mut self, outcome: Outcome, reason: impl Into<String>) {
        if self.outcome == Outcome::Passed {
            self.outcome = outcome;
        }
        self.failures.push(reason.into());
    }

    pub fn label(&self) -> String {
        if self.releases.is_empty() {
            format!("{} [{}]", self.scenario, self.mode)
        } else {
            format!("{} [{} {}]", self.scenario, self.mode, self.releases.join("/"))
        }
    }
}

/// Results of a whole run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub reports: Vec<RunReport>,
    pub duration_ms: u128,
}

impl RunSummary {
    pub fn count(&self, outcome: Outcome) -> usize {
        self.reports.iter().filter(|r| r.outcome == outcome).count()
    }

    /// No variant failed or errored
    pub fn success(&self) -> bool {
        self.count(Outcome::Failed) == 0 && self.count(Outcome::Errored) == 0
    }

    /// Process exit status for the run
    pub fn exit_code(&self) -> i32 {
        if self.success() {
            0
        } else {
            1
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Print a human readable summary to stdout
    pub fn print(&self) {
        println!("\n{}", "Results:".cyan());

        for report in &self.reports {
            let mark = match report.outcome {
                Outcome::Passed => "✓".green(),
                Outcome::Failed => "✗".red(),
                Outcome::Errored => "!".red().bold(),
                Outcome::Skipped => "-".yellow(),
            };
            println!(
                "  {} {} {} {}",
                mark,
                report.label().white(),
                report.outcome.to_string().bold(),
                format!(
                    "({}/{} steps, {:.1}s)",
                    report.steps_run,
                    report.steps_total,
                    report.duration_ms as f64 / 1000.0
                )
                .dimmed()
            );
            for failure in &report.failures {
                println!("      {}", failure.dimmed());
            }
            if report.outcome != Outcome::Passed && !report.output_tail.is_empty() {
                for line in report.output_tail.lines() {
                    println!("      | {}", line.dimmed());
                }
            }
        }

        let totals = format!(
            "{} passed, {} failed, {} errored, {} skipped in {:.1}s",
            self.count(Outcome::Passed),
            self.count(Outcome::Failed),
            self.count(Outcome::Errored),
            self.count(Outcome::Skipped),
            self.duration_ms as f64 / 1000.0
        );
        if self.success() {
            println!("\n{} {}\n", "✓".green().bold(), totals.green().bold());
        } else {
            println!("\n{} {}\n", "✗".red().bold(), totals.red().bold());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(outcomes: &[Outcome]) -> RunSummary {
        let reports = outcomes
            .iter()
            .map(|&o| {
                let mut r = RunReport::new("s", Mode::Local, vec!["jammy".into()], 1);
                if o != Outcome::Passed {
                    r.fail(o, "boom");
                }
                r
            })
            .collect();
        RunSummary {
            reports,
            duration_ms: 10,
        }
    }

    #[test]
    fn test_exit_code() {
        assert_eq!(summary(&[Outcome::Passed, Outcome::Skipped]).exit_code(), 0);
        assert_eq!(summary(&[Outcome::Passed, Outcome::Failed]).exit_code(), 1);
        assert_eq!(summary(&[Outcome::Errored]).exit_code(), 1);
        assert_eq!(summary(&[]).exit_code(), 0);
    }

    #[test]
    fn test_first_failure_sticks() {
        let mut report = RunReport::new("s", Mode::Remote, vec![], 3);
        report.fail(Outcome::Failed, "pattern missing");
        report.fail(Outcome::Errored, "teardown failed");
        assert_eq!(report.outcome, Outcome::Failed);
        assert_eq!(report.failures.len(), 2);
    }

    #[test]
    fn test_json_shape() {
        let json = summary(&[Outcome::Failed]).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let report = &value["reports"][0];
        assert_eq!(report["outcome"], "FAILED");
        assert_eq!(report["mode"], "local");
        assert_eq!(report["releases"][0], "jammy");
        assert!(report.get("output_tail").is_none());
    }

    #[test]
    fn test_labels() {
        let report = RunReport::skipped("a.b", Mode::Remote, "no service machine".into());
        assert_eq!(report.label(), "a.b [remote]");
        let report = RunReport::new("a.b", Mode::Remote, vec!["focal".into(), "jammy".into()], 0);
        assert_eq!(report.label(), "a.b [remote focal/jammy]");
    }
}
