//! CLI command definitions
//!
//! Defines the clap commands for the metabox CLI.

use clap::Subcommand;
use std::path::PathBuf;

use crate::machine::Backend;

#[derive(Subcommand)]
pub enum Commands {
    /// Run scenarios
    Run {
        /// Scenario files or directories of *.yaml / *.yml files
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Configuration file (default: ~/.config/metabox/config.toml)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Only run variants carrying this tag (repeatable)
        #[arg(long = "tag", short = 't')]
        tags: Vec<String>,

        /// Skip variants carrying this tag (repeatable)
        #[arg(long = "exclude-tag", short = 'x')]
        exclude_tags: Vec<String>,

        /// Backend for machines built from source
        #[arg(long, env = "METABOX_RUNTIME")]
        runtime: Option<Backend>,

        /// Number of variants to run at the same time
        #[arg(long, short = 'j')]
        parallel: Option<usize>,

        /// Keep machines (stopped) after the run for inspection
        #[arg(long)]
        do_not_dispose: bool,

        /// Reuse machines across scenarios
        #[arg(long)]
        pooled: bool,

        /// Print the results as JSON
        #[arg(long)]
        json: bool,

        /// Also log to a file (default location when no file is given)
        #[arg(long, num_args = 0..=1)]
        log_file: Option<Option<PathBuf>>,
    },

    /// List the variants a run would execute, without provisioning
    List {
        /// Scenario files or directories of *.yaml / *.yml files
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Configuration file (default: ~/.config/metabox/config.toml)
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Only list variants carrying this tag (repeatable)
        #[arg(long = "tag", short = 't')]
        tags: Vec<String>,

        /// Skip variants carrying this tag (repeatable)
        #[arg(long = "exclude-tag", short = 'x')]
        exclude_tags: Vec<String>,
    },

    /// Add an unknown job to every persisted checkbox session
    CorruptSession {
        /// Directory holding the sessions
        #[arg(long, default_value = crate::common::paths::CHECKBOX_SESSIONS_DIR)]
        root: PathBuf,
    },
}

impl Commands {
    /// Log file requested on the command line, resolving the default
    pub fn log_file(&self) -> Option<PathBuf> {
        match self {
            Commands::Run {
                log_file: Some(file),
                ..
            } => file.clone().or_else(crate::common::logging::default_log_file),
            _ => None,
        }
    }
}
