//! metabox - end-to-end scenario runner for checkbox
//!
//! Provisions disposable LXD or Docker machines, installs checkbox on them
//! and drives it through scripted interactive scenarios.

use clap::Parser;
use metabox::commands::Commands;
use metabox::common::logging;
use metabox::cli;

#[derive(Parser)]
#[command(name = "metabox", about = "Run checkbox scenarios in disposable machines")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Kept alive until exit so the log file gets flushed
    let _guard = match cli.command.log_file() {
        Some(path) => match logging::init_with_log_file(&path) {
            Ok(guard) => Some(guard),
            Err(e) => {
                eprintln!("Error: cannot open log file {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => {
            logging::init_cli();
            None
        }
    };

    let code = match cli::dispatch(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    };

    drop(_guard);
    std::process::exit(code);
}
