//! Audit trail of a run.
//!
//! Sinks are fire-and-forget: a failure to store an event is logged and never
//! interrupts the run.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use recert_core::{AuditConfig, RecertError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind of an [`AuditEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    RunStart,
    RunEnd,
    ScanComplete,
    CheckComplete,
    GroupComplete,
    PrCreated,
    PrSkipped,
    PrError,
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuditEventType::RunStart => "run_start",
            AuditEventType::RunEnd => "run_end",
            AuditEventType::ScanComplete => "scan_complete",
            AuditEventType::CheckComplete => "check_complete",
            AuditEventType::GroupComplete => "group_complete",
            AuditEventType::PrCreated => "pr_created",
            AuditEventType::PrSkipped => "pr_skipped",
            AuditEventType::PrError => "pr_error",
        };
        f.write_str(name)
    }
}

/// A single audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
    pub event_type: AuditEventType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub details: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    /// Store `event`. Must not fail the caller.
    fn record(&self, event: &AuditEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _event: &AuditEvent) {}
}

/// Emits every event as a `tracing` info event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) {
        tracing::info!(
            run_id = %event.run_id,
            event_type = %event.event_type,
            details = %event.details,
            error = event.error.as_deref().unwrap_or_default(),
            "audit: {}",
            event.message
        );
    }
}

/// Appends one JSON object per line to `<directory>/audit-<YYYY-MM-DD>.log`.
///
/// The date comes from the event timestamp. Writes from concurrent units are
/// serialized by an internal lock.
#[derive(Debug)]
pub struct JsonlAuditSink {
    directory: PathBuf,
    lock: Mutex<()>,
}

impl JsonlAuditSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            lock: Mutex::new(()),
        }
    }

    /// File that receives events stamped at `timestamp`.
    pub fn path_for(&self, timestamp: DateTime<Utc>) -> PathBuf {
        self.directory
            .join(format!("audit-{}.log", timestamp.format("%Y-%m-%d")))
    }

    fn append(&self, event: &AuditEvent) -> Result<(), RecertError> {
        let line = serde_json::to_string(event)?;
        // A poisoned lock only means another writer panicked mid-append.
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        std::fs::create_dir_all(&self.directory)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(event.timestamp))?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, event: &AuditEvent) {
        if let Err(e) = self.append(event) {
            tracing::error!(
                error = %e,
                directory = %self.directory.display(),
                "failed to store audit event"
            );
        }
    }
}

/// Sink selected by `[audit]`: [`JsonlAuditSink`] for `storage = "file"`,
/// [`TracingAuditSink`] for `storage = "log"`, and [`NullAuditSink`] when
/// auditing is disabled.
pub fn from_config(config: &AuditConfig) -> Arc<dyn AuditSink> {
    match (config.enabled, config.storage.as_str()) {
        (false, _) => Arc::new(NullAuditSink),
        (true, "log") => Arc::new(TracingAuditSink),
        (true, _) => Arc::new(JsonlAuditSink::new(&config.directory)),
    }
}

/// Stamps events with the run id and repository before handing them to a sink.
#[derive(Clone)]
pub struct Auditor {
    sink: Arc<dyn AuditSink>,
    run_id: Uuid,
    repository: Option<String>,
}

impl Auditor {
    pub fn new(sink: Arc<dyn AuditSink>, run_id: Uuid, repository: Option<String>) -> Self {
        Self {
            sink,
            run_id,
            repository,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn emit(&self, event_type: AuditEventType, message: impl Into<String>, details: Value) {
        self.emit_at(Utc::now(), event_type, message, details, None);
    }

    pub fn emit_error(
        &self,
        event_type: AuditEventType,
        message: impl Into<String>,
        details: Value,
        error: &impl fmt::Display,
    ) {
        self.emit_at(Utc::now(), event_type, message, details, Some(error.to_string()));
    }

    fn emit_at(
        &self,
        timestamp: DateTime<Utc>,
        event_type: AuditEventType,
        message: impl Into<String>,
        details: Value,
        error: Option<String>,
    ) {
        self.sink.record(&AuditEvent {
            timestamp,
            run_id: self.run_id,
            event_type,
            message: message.into(),
            details,
            error,
            repository: self.repository.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn event(timestamp: DateTime<Utc>, event_type: AuditEventType) -> AuditEvent {
        AuditEvent {
            timestamp,
            run_id: Uuid::nil(),
            event_type,
            message: "scanned files".into(),
            details: json!({ "count": 3 }),
            error: None,
            repository: None,
        }
    }

    #[test]
    fn jsonl_sink_appends_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlAuditSink::new(dir.path().join("audit"));
        let when = Utc.with_ymd_and_hms(2025, 3, 4, 10, 0, 0).unwrap();

        sink.record(&event(when, AuditEventType::RunStart));
        sink.record(&event(when, AuditEventType::ScanComplete));

        let path = dir.path().join("audit").join("audit-2025-03-04.log");
        assert_eq!(sink.path_for(when), path);
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: AuditEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.event_type, AuditEventType::ScanComplete);
        assert_eq!(parsed.details["count"], 3);
        assert!(!lines[0].contains("\"error\""));
    }

    #[test]
    fn event_type_serializes_snake_case() {
        let value = serde_json::to_value(AuditEventType::PrSkipped).unwrap();
        assert_eq!(value, "pr_skipped");
        assert_eq!(AuditEventType::CheckComplete.to_string(), "check_complete");
    }

    #[test]
    fn unwritable_directory_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "not a directory").unwrap();
        let sink = JsonlAuditSink::new(blocker.join("audit"));
        sink.record(&event(Utc::now(), AuditEventType::RunEnd));
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn log_storage_emits_through_tracing() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuditConfig {
            enabled: true,
            storage: "log".into(),
            directory: dir.path().join("audit").to_string_lossy().into_owned(),
        };
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let auditor = Auditor::new(from_config(&config), Uuid::new_v4(), None);
            auditor.emit(AuditEventType::ScanComplete, "scanned 3 file(s)", json!({ "count": 3 }));
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("audit: scanned 3 file(s)"), "{output}");
        assert!(output.contains("event_type=scan_complete"), "{output}");
        assert!(!dir.path().join("audit").exists());
    }

    #[test]
    fn disabled_config_discards_events() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuditConfig {
            enabled: false,
            storage: "file".into(),
            directory: dir.path().join("audit").to_string_lossy().into_owned(),
        };
        let auditor = Auditor::new(from_config(&config), Uuid::new_v4(), None);
        auditor.emit(AuditEventType::RunStart, "run started", Value::Null);
        assert!(!dir.path().join("audit").exists());
    }
}
