//! Append-only audit log for rotation and issuance events.
//!
//! Format: `2026-10-19T10:30:00Z | phase_advanced | ca_type=host | from=init | to=update_clients`

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;

pub const AUDIT_FILENAME: &str = "rotation-audit.log";

/// Default audit log location under the keyturn log directory.
pub fn default_audit_path() -> PathBuf {
    keyturn_common::paths::keyturn_log_dir().join(AUDIT_FILENAME)
}

/// Optional audit sink. A sink without a path only logs through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    path: Option<PathBuf>,
}

impl AuditLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record an event. Write failures are logged, never propagated.
    pub fn record(&self, event: &str, fields: &[(&str, &str)]) {
        let Some(path) = &self.path else {
            tracing::debug!(event, "Audit event (no audit file configured)");
            return;
        };
        if let Err(e) = append_entry_to(path, event, fields) {
            tracing::warn!(error = %e, event, path = %path.display(), "Failed to write audit entry");
        }
    }

    /// Full log contents, empty when unset or not yet written.
    pub fn read(&self) -> Result<String, std::io::Error> {
        match &self.path {
            Some(path) if path.exists() => std::fs::read_to_string(path),
            _ => Ok(String::new()),
        }
    }
}

/// Append one line to the log at `path`, creating it if needed.
pub fn append_entry_to(
    path: &Path,
    event: &str,
    fields: &[(&str, &str)],
) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut line = format!("{} | {event}", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"));
    for (key, value) in fields {
        line.push_str(&format!(" | {key}={value}"));
    }
    line.push('\n');

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())?;

    tracing::debug!(event, "Audit log entry written");
    Ok(())
}
