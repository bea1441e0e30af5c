//! Execution audit trail
//!
//! One append-only record per call attempt, plus session bracket events.
//! Sinks are fire-and-forget: a sink that cannot record must swallow the
//! problem itself, so auditing can never fail an orchestration.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

/// How an attempt was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptKind {
    Primary,
    Retry,
    Fallback,
}

impl std::fmt::Display for AttemptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptKind::Primary => write!(f, "primary"),
            AttemptKind::Retry => write!(f, "retry"),
            AttemptKind::Fallback => write!(f, "fallback"),
        }
    }
}

/// Append-only record of a single module call attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    pub module: String,
    pub resource: String,
    pub attempt_kind: AttemptKind,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub error_message: Option<String>,
    pub input_hash: String,
    pub output_hash: Option<String>,
    pub quality_score: Option<f64>,
}

/// Session lifecycle event kept by the in-memory sink
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub session_id: Uuid,
    pub at: DateTime<Utc>,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    Started {
        key: String,
        modules: Vec<String>,
    },
    Ended {
        success: bool,
        completed: Vec<String>,
        failed: Vec<String>,
    },
}

/// Audit sink contract
///
/// Implementations persist wherever they like (relational store, log
/// pipeline); recording is best-effort by construction and must not block
/// the caller on failures.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_execution(&self, record: &ExecutionRecord);

    async fn record_session_start(&self, session_id: Uuid, key: &str, modules: &[String]);

    async fn record_session_end(
        &self,
        session_id: Uuid,
        success: bool,
        completed: &[String],
        failed: &[String],
    );
}

/// In-memory sink for tests and ad-hoc inspection
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<ExecutionRecord>>,
    sessions: Mutex<Vec<SessionEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_records(&self) -> MutexGuard<'_, Vec<ExecutionRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| {
            warn!("Audit record mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.lock_records().clone()
    }

    pub fn records_for_module(&self, module: &str) -> Vec<ExecutionRecord> {
        self.lock_records()
            .iter()
            .filter(|r| r.module == module)
            .cloned()
            .collect()
    }

    pub fn session_events(&self) -> Vec<SessionEvent> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record_execution(&self, record: &ExecutionRecord) {
        self.lock_records().push(record.clone());
    }

    async fn record_session_start(&self, session_id: Uuid, key: &str, modules: &[String]) {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(SessionEvent {
                session_id,
                at: Utc::now(),
                kind: SessionEventKind::Started {
                    key: key.to_string(),
                    modules: modules.to_vec(),
                },
            });
    }

    async fn record_session_end(
        &self,
        session_id: Uuid,
        success: bool,
        completed: &[String],
        failed: &[String],
    ) {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(SessionEvent {
                session_id,
                at: Utc::now(),
                kind: SessionEventKind::Ended {
                    success,
                    completed: completed.to_vec(),
                    failed: failed.to_vec(),
                },
            });
    }
}

/// Log-only sink; the default when no external sink is wired in
#[derive(Default)]
pub struct TracingAuditSink;

impl TracingAuditSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record_execution(&self, record: &ExecutionRecord) {
        info!(
            session = %record.session_id,
            module = %record.module,
            resource = %record.resource,
            attempt = record.attempt,
            kind = %record.attempt_kind,
            success = record.success,
            error = record.error_message.as_deref().unwrap_or(""),
            "execution recorded"
        );
    }

    async fn record_session_start(&self, session_id: Uuid, key: &str, modules: &[String]) {
        info!(session = %session_id, key, ?modules, "session started");
    }

    async fn record_session_end(
        &self,
        session_id: Uuid,
        success: bool,
        completed: &[String],
        failed: &[String],
    ) {
        info!(
            session = %session_id,
            success,
            completed = completed.len(),
            failed = failed.len(),
            "session ended"
        );
    }
}

/// Stable content hash of a JSON value, for input/output audit fields
pub fn content_hash(value: &Value) -> String {
    let mut hasher = DefaultHasher::new();
    value.to_string().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
