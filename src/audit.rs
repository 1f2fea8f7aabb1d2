//! Audit trail of logins, commits and server lifecycle events.
//!
//! Separate from diagnostic `tracing` output: each event is one JSON line in
//! the audit file, and the most recent events are kept in memory for admin
//! consoles and tests.

use crate::core::{DbError, Invid, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

const RECENT_CAPACITY: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditKind {
    NormalLogin,
    BadPass,
    NormalLogout,
    AbnormalLogout,
    AdminConnect,
    Commit,
    Dump,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub at: DateTime<Utc>,
    pub kind: AuditKind,
    pub actor: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<Invid>,
}

impl AuditEvent {
    pub fn new(at: DateTime<Utc>, kind: AuditKind, message: impl Into<String>) -> Self {
        Self {
            at,
            kind,
            actor: None,
            message: message.into(),
            objects: Vec::new(),
        }
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn objects(mut self, objects: Vec<Invid>) -> Self {
        self.objects = objects;
        self
    }
}

#[derive(Default)]
struct AuditInner {
    writer: Option<BufWriter<File>>,
    recent: VecDeque<AuditEvent>,
    closed: bool,
}

#[derive(Default)]
pub struct AuditLog {
    inner: Mutex<AuditInner>,
}

impl AuditLog {
    /// Audit log that only keeps recent events in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Append to (or create) a JSON-lines audit file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .map_err(|e| DbError::IoError(format!("Failed to open audit log: {}", e)))?;
        Ok(Self {
            inner: Mutex::new(AuditInner {
                writer: Some(BufWriter::new(file)),
                ..Default::default()
            }),
        })
    }

    fn inner(&self) -> MutexGuard<'_, AuditInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record an event. Write failures are logged, never returned: losing an
    /// audit line must not fail the operation being audited.
    pub fn record(&self, event: AuditEvent) {
        let mut inner = self.inner();
        if inner.closed {
            warn!(kind = ?event.kind, "audit event after close dropped from file");
        } else if let Some(writer) = inner.writer.as_mut() {
            let written = serde_json::to_string(&event)
                .map_err(|e| e.to_string())
                .and_then(|line| {
                    writeln!(writer, "{}", line)
                        .and_then(|_| writer.flush())
                        .map_err(|e| e.to_string())
                });
            if let Err(e) = written {
                warn!(error = %e, "failed to write audit event");
            }
        }
        if inner.recent.len() == RECENT_CAPACITY {
            inner.recent.pop_front();
        }
        inner.recent.push_back(event);
    }

    /// Most recent events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let inner = self.inner();
        let skip = inner.recent.len().saturating_sub(limit);
        inner.recent.iter().skip(skip).cloned().collect()
    }

    pub fn events_of(&self, kind: AuditKind) -> Vec<AuditEvent> {
        self.inner()
            .recent
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Flush and close the file. Later events are kept in memory only.
    pub fn close(&self) {
        let mut inner = self.inner();
        if let Some(mut writer) = inner.writer.take() {
            if let Err(e) = writer.flush() {
                warn!(error = %e, "failed to flush audit log");
            }
        }
        inner.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_recent_keeps_order() {
        let log = AuditLog::in_memory();
        log.record(AuditEvent::new(Utc::now(), AuditKind::NormalLogin, "alice logged in").actor("alice"));
        log.record(AuditEvent::new(Utc::now(), AuditKind::BadPass, "bad login for bob"));
        let recent = log.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].kind, AuditKind::NormalLogin);
        assert_eq!(log.recent(1)[0].kind, AuditKind::BadPass);
        assert_eq!(log.events_of(AuditKind::BadPass).len(), 1);
    }

    #[test]
    fn test_json_lines_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("audit.log");
        let log = AuditLog::open(&path).unwrap();
        log.record(AuditEvent::new(Utc::now(), AuditKind::Commit, "1 object").objects(vec![Invid::new(3, 1)]));
        log.record(AuditEvent::new(Utc::now(), AuditKind::Shutdown, "bye"));
        log.close();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: AuditEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.kind, AuditKind::Commit);
        assert!(lines[1].contains("\"shutdown\""));
    }
}
