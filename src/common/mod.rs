//! Common utilities shared by the CLI and the library

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;

pub use error::{Error, Result};

/// Keep at most the last `max_chars` characters of `text`
///
/// Used to attach a readable slice of program output to reports.
pub fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        text.to_string()
    } else {
        let skip = count - max_chars;
        format!("...{}", text.chars().skip(skip).collect::<String>())
    }
}
