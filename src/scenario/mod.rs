//! Scenario definitions
//!
//! Scenarios are written in YAML, one or more documents per file:
//!
//! ```yaml
//! name: basic.run-all
//! tags: [smoke]
//! modes: [local, remote]
//! launcher: |
//!   [launcher]
//!   launcher_version = 1
//! steps:
//!   - action: start
//!   - action: assert_printed
//!     pattern: "Select test plan"
//!   - action: send_key
//!     key: enter
//!   - action: assert_ret_code
//!     code: 0
//! ```
//!
//! A scenario expands into one [`Variant`] per supported mode and per
//! combination of configured releases for that mode's roles.

pub mod action;
pub mod report;
pub mod runner;

use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::common::{Error, Result};
use crate::machine::{MachineConfig, Mode, Origin};

pub use action::{Action, StepContext};
pub use report::{Outcome, RunReport, RunSummary};
pub use runner::{RunSettings, ScenarioRunner};

/// A named sequence of steps run against one or more machines
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Launcher file contents passed to checkbox
    #[serde(default)]
    pub launcher: Option<String>,

    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Modes the scenario supports
    #[serde(default = "default_modes")]
    pub modes: Vec<Mode>,

    /// Per-role release restriction, intersected with the configuration
    #[serde(default)]
    pub releases: BTreeMap<Mode, Vec<String>>,

    /// Checkbox origins the scenario can run against (all when empty)
    #[serde(default)]
    pub origins: Vec<Origin>,

    /// Extra environment for the checkbox process
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    pub steps: Vec<Action>,

    #[serde(skip)]
    pub origin: Option<PathBuf>,
}

fn default_modes() -> Vec<Mode> {
    vec![Mode::Local, Mode::Remote]
}

impl Scenario {
    /// Parse every YAML document in `content`
    ///
    /// `origin` names the source in error messages.
    pub fn parse_all(content: &str, origin: &Path) -> Result<Vec<Scenario>> {
        let parse_error = |reason: String| Error::ScenarioParse {
            path: origin.display().to_string(),
            reason,
        };

        let mut scenarios = Vec::new();
        for document in serde_yaml::Deserializer::from_str(content) {
            let value = serde_yaml::Value::deserialize(document)
                .map_err(|e| parse_error(e.to_string()))?;
            if value.is_null() {
                continue;
            }
            let mut scenario: Scenario =
                serde_yaml::from_value(value).map_err(|e| parse_error(e.to_string()))?;
            scenario.origin = Some(origin.to_path_buf());
            scenario.validate().map_err(|e| parse_error(e.to_string()))?;
            scenarios.push(scenario);
        }
        Ok(scenarios)
    }

    /// Load all scenarios from a YAML file
    pub fn load_file(path: &Path) -> Result<Vec<Scenario>> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::parse_all(&content, path)
    }

    /// Load scenarios from files and directories
    ///
    /// Directories are searched recursively for `*.yaml` and `*.yml` files
    /// in name order. Scenario names must be unique across all sources.
    pub fn load_paths(paths: &[PathBuf]) -> Result<Vec<Scenario>> {
        let mut files = Vec::new();
        for path in paths {
            if path.is_dir() {
                collect_yaml_files(path, &mut files)?;
            } else {
                files.push(path.clone());
            }
        }

        let mut scenarios = Vec::new();
        let mut seen = BTreeMap::new();
        for file in files {
            for scenario in Self::load_file(&file)? {
                if let Some(first) = seen.insert(scenario.name.clone(), file.clone()) {
                    return Err(Error::ScenarioParse {
                        path: file.display().to_string(),
                        reason: format!(
                            "scenario '{}' is already defined in {}",
                            scenario.name,
                            first.display()
                        ),
                    });
                }
                scenarios.push(scenario);
            }
        }
        Ok(scenarios)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("scenario name is empty".into()));
        }
        if self.modes.is_empty() {
            return Err(Error::Config(format!("scenario '{}' has no modes", self.name)));
        }
        for (index, step) in self.steps.iter().enumerate() {
            step.pattern().map_err(|e| {
                Error::Config(format!("step {}: {}", index + 1, e))
            })?;
        }
        Ok(())
    }

    /// Steps to execute, with a leading `start` when none is given
    pub fn effective_steps(&self) -> Vec<Action> {
        if self.steps.iter().any(|s| matches!(s, Action::Start)) {
            self.steps.clone()
        } else {
            std::iter::once(Action::Start)
                .chain(self.steps.iter().cloned())
                .collect()
        }
    }

    /// Declared tags plus the dot-separated parts of the name
    pub fn implicit_tags(&self) -> BTreeSet<String> {
        let mut tags = self.tags.clone();
        tags.extend(
            self.name
                .split('.')
                .filter(|part| !part.is_empty())
                .map(str::to_string),
        );
        tags
    }

    /// Releases this scenario runs on for `role`
    ///
    /// The configured releases, narrowed by the scenario's own restriction
    /// for that role if it has one.
    pub fn releases_for(&self, config: &MachineConfig) -> Vec<String> {
        match self.releases.get(&config.role) {
            Some(allowed) => config
                .releases
                .iter()
                .filter(|r| allowed.contains(r))
                .cloned()
                .collect(),
            None => config.releases.clone(),
        }
    }

    /// Whether the scenario runs on machines installed from `origin`
    pub fn supports_origin(&self, origin: Origin) -> bool {
        self.origins.is_empty() || self.origins.contains(&origin)
    }
}

fn collect_yaml_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();

    for path in entries {
        if path.is_dir() {
            collect_yaml_files(&path, files)?;
        } else if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        ) {
            files.push(path);
        }
    }
    Ok(())
}

/// Include/exclude tag selection
#[derive(Debug, Clone, Default)]
pub struct TagFilter {
    pub include: BTreeSet<String>,
    pub exclude: BTreeSet<String>,
}

impl TagFilter {
    pub fn new<I, E>(include: I, exclude: E) -> Self
    where
        I: IntoIterator<Item = String>,
        E: IntoIterator<Item = String>,
    {
        Self {
            include: include.into_iter().collect(),
            exclude: exclude.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }

    /// True when `tags` meets an include tag (or there are none) and no
    /// exclude tag
    pub fn admits(&self, tags: &BTreeSet<String>) -> bool {
        let included = self.include.is_empty() || !self.include.is_disjoint(tags);
        included && self.exclude.is_disjoint(tags)
    }

    /// Scenarios whose declared tags pass the filter
    pub fn select<'a>(&self, scenarios: &'a [Scenario]) -> Vec<&'a Scenario> {
        scenarios.iter().filter(|s| self.admits(&s.tags)).collect()
    }
}

/// One concrete execution of a scenario
#[derive(Debug, Clone)]
pub struct Variant {
    pub scenario: Arc<Scenario>,
    pub mode: Mode,
    /// One release per role, in the order of `mode.roles()`
    pub releases: Vec<String>,
}

impl Variant {
    /// Tags a filter is matched against
    pub fn tags(&self) -> BTreeSet<String> {
        let mut tags = self.scenario.implicit_tags();
        tags.insert(self.mode.to_string());
        tags.extend(self.releases.iter().cloned());
        tags
    }

    pub fn label(&self) -> String {
        format!("{} [{} {}]", self.scenario.name, self.mode, self.releases.join("/"))
    }
}

/// A scenario mode that cannot run with the configured machines
#[derive(Debug, Clone)]
pub struct Skipped {
    pub scenario: Arc<Scenario>,
    pub mode: Mode,
    pub reason: String,
}

/// Variants to run and to report as skipped
#[derive(Debug, Default)]
pub struct Plan {
    pub variants: Vec<Variant>,
    pub skipped: Vec<Skipped>,
}

impl Plan {
    /// Expand scenarios against the machine configuration
    pub fn build(
        scenarios: &[Arc<Scenario>],
        machines: &BTreeMap<Mode, MachineConfig>,
        filter: &TagFilter,
    ) -> Self {
        let mut plan = Plan::default();

        for scenario in scenarios {
            for &mode in &scenario.modes {
                let configs: Option<Vec<&MachineConfig>> =
                    mode.roles().iter().map(|role| machines.get(role)).collect();

                let Some(configs) = configs else {
                    let missing: Vec<&str> = mode
                        .roles()
                        .iter()
                        .filter(|r| !machines.contains_key(*r))
                        .map(|r| r.as_str())
                        .collect();
                    plan.skip(
                        scenario,
                        mode,
                        filter,
                        format!("no {} machine configured", missing.join("/")),
                    );
                    continue;
                };

                let unsupported = configs.iter().find(|c| !scenario.supports_origin(c.origin));
                if let Some(config) = unsupported {
                    plan.skip(
                        scenario,
                        mode,
                        filter,
                        format!("{} machine is installed from {}", config.role, config.origin),
                    );
                    continue;
                }

                let mut combinations: Vec<Vec<String>> = vec![Vec::new()];
                for config in &configs {
                    let releases = scenario.releases_for(config);
                    if releases.is_empty() {
                        plan.skip(
                            scenario,
                            mode,
                            filter,
                            format!("no configured {} release is allowed", config.role),
                        );
                        combinations.clear();
                        break;
                    }
                    combinations = combinations
                        .into_iter()
                        .flat_map(|prefix| {
                            releases.iter().map(move |release| {
                                let mut next = prefix.clone();
                                next.push(release.clone());
                                next
                            })
                        })
                        .collect();
                }

                for releases in combinations {
                    let variant = Variant {
                        scenario: Arc::clone(scenario),
                        mode,
                        releases,
                    };
                    if filter.admits(&variant.tags()) {
                        plan.variants.push(variant);
                    }
                }
            }
        }
        plan
    }

    /// Record a mode that cannot run, unless the filter leaves it out anyway
    fn skip(&mut self, scenario: &Arc<Scenario>, mode: Mode, filter: &TagFilter, reason: String) {
        let mut tags = scenario.implicit_tags();
        tags.insert(mode.to_string());
        if filter.admits(&tags) {
            self.skipped.push(Skipped {
                scenario: Arc::clone(scenario),
                mode,
                reason,
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty() && self.skipped.is_empty()
    }
}
