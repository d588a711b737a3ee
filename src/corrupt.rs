//! Session corruption for resume testing
//!
//! Checkbox persists each session as a gzip-compressed JSON document named
//! `session` inside the session's directory. [`SessionCorruptor`] adds a job
//! id that cannot exist to the list of jobs the session still wants to run,
//! so a later resume has to cope with an unknown job.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::common::paths;
use crate::common::{Error, Result};

/// The job id appended to corrupted sessions
pub const INVALID_JOB_ID: &str = "@ invalid id - intentionally corrupted session";

/// File name of a persisted session
const SESSION_FILE: &str = "session";

/// Corrupts every persisted session below a directory
#[derive(Debug, Clone)]
pub struct SessionCorruptor {
    root: PathBuf,
}

impl Default for SessionCorruptor {
    fn default() -> Self {
        Self::new(paths::sessions_dir())
    }
}

impl SessionCorruptor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All session files below the root, in path order
    pub fn find_sessions(&self) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        if self.root.is_dir() {
            walk(&self.root, &mut found)?;
        }
        found.sort();
        Ok(found)
    }

    /// Corrupt every session below the root and return their paths
    pub fn corrupt_all(&self) -> Result<Vec<PathBuf>> {
        let sessions = self.find_sessions()?;
        if sessions.is_empty() {
            tracing::warn!(root = %self.root.display(), "No session found");
        }
        for path in &sessions {
            corrupt_file(path)?;
            tracing::info!(session = %path.display(), "Corrupted session");
        }
        Ok(sessions)
    }
}

fn walk(dir: &Path, found: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk(&path, found)?;
        } else if path.file_name().is_some_and(|name| name == SESSION_FILE) {
            found.push(path);
        }
    }
    Ok(())
}

/// Append [`INVALID_JOB_ID`] to one session file
///
/// The file is replaced atomically; everything but the job list is written
/// back unchanged, key order included.
pub fn corrupt_file(path: &Path) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidSession {
        path: path.display().to_string(),
        reason: reason.to_string(),
    };

    let compressed = std::fs::read(path).map_err(|e| Error::FileRead {
        path: path.display().to_string(),
        error: e.to_string(),
    })?;
    let mut json = String::new();
    GzDecoder::new(compressed.as_slice())
        .read_to_string(&mut json)
        .map_err(|e| invalid(&format!("not gzip-compressed text: {}", e)))?;

    let mut document: Value =
        serde_json::from_str(&json).map_err(|e| invalid(&format!("not JSON: {}", e)))?;
    document
        .get_mut("session")
        .and_then(|session| session.get_mut("desired_job_list"))
        .and_then(Value::as_array_mut)
        .ok_or_else(|| invalid("no session.desired_job_list array"))?
        .push(Value::String(INVALID_JOB_ID.to_string()));

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(serde_json::to_string(&document)?.as_bytes())?;
    let compressed = encoder.finish()?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&compressed)?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}
