//! Durable overflow queue. Rate-limited requests are persisted (redacted)
//! and replayed later by the drainer through the normal router + resilience
//! stack.

use gantry_config::QueueSettings;
use gantry_core::{ChatCompletionRequest, GatewayError, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use uuid::Uuid;

const TRUNCATION_MARKER: &str = "…[truncated]";

/// A queued job ready for replay.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: String,
    pub request_id: String,
    pub request: ChatCompletionRequest,
    pub attempts: u32,
}

/// SQLite-backed overflow queue.
pub struct OverflowQueue {
    db: Arc<Mutex<Connection>>,
    settings: QueueSettings,
}

impl OverflowQueue {
    /// Open or create the queue database at the given path.
    pub fn open(path: &Path, settings: QueueSettings) -> Result<Self> {
        info!(?path, "opening overflow queue");

        let conn = Connection::open(path).map_err(|e| GatewayError::Queue(e.to_string()))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;

            CREATE TABLE IF NOT EXISTS overflow_jobs (
                job_id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                redacted_payload TEXT NOT NULL,
                enqueued_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'queued'
            );

            CREATE INDEX IF NOT EXISTS idx_overflow_request
                ON overflow_jobs(request_id, enqueued_at);
            ",
        )
        .map_err(|e| GatewayError::Queue(e.to_string()))?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            settings,
        })
    }

    /// In-memory queue for tests.
    pub fn open_in_memory(settings: QueueSettings) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| GatewayError::Queue(e.to_string()))?;
        conn.execute_batch(
            "CREATE TABLE overflow_jobs (
                job_id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                redacted_payload TEXT NOT NULL,
                enqueued_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'queued'
            );",
        )
        .map_err(|e| GatewayError::Queue(e.to_string()))?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            settings,
        })
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    /// Persist a rejected request for later replay. Long message contents
    /// are truncated and tool payloads dropped before anything touches
    /// disk. A duplicate `request_id` inside the idempotency window returns
    /// the existing job id instead of inserting again.
    pub fn enqueue(&self, request_id: &str, request: &ChatCompletionRequest) -> Result<String> {
        let redacted = self.redact(request);
        let payload =
            serde_json::to_string(&redacted).map_err(|e| GatewayError::Queue(e.to_string()))?;
        let now = Self::now();
        let window_start = now - self.settings.idempotency_window_secs as i64;

        let db = self.db.lock();

        let existing: Option<String> = db
            .query_row(
                "SELECT job_id FROM overflow_jobs
                 WHERE request_id = ?1 AND enqueued_at > ?2 AND status IN ('queued', 'replaying')
                 LIMIT 1",
                rusqlite::params![request_id, window_start],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                e => Err(GatewayError::Queue(e.to_string())),
            })?;
        if let Some(job_id) = existing {
            info!(request_id, job_id = %job_id, "duplicate enqueue within idempotency window");
            return Ok(job_id);
        }

        let job_id = format!("job_{}", Uuid::new_v4().simple());
        db.execute(
            "INSERT INTO overflow_jobs (job_id, request_id, redacted_payload, enqueued_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![job_id, request_id, payload, now],
        )
        .map_err(|e| GatewayError::Queue(e.to_string()))?;

        info!(request_id, job_id = %job_id, "request queued for later replay");
        Ok(job_id)
    }

    /// Strip what must not be persisted: long contents and tool payloads.
    fn redact(&self, request: &ChatCompletionRequest) -> ChatCompletionRequest {
        let mut redacted = request.clone();
        redacted.tools = None;
        for message in &mut redacted.messages {
            message.tool_calls = None;
            if let Some(ref content) = message.content
                && content.chars().count() > self.settings.redact_over_chars
            {
                let truncated: String =
                    content.chars().take(self.settings.redact_over_chars).collect();
                message.content = Some(format!("{truncated}{TRUNCATION_MARKER}"));
            }
        }
        redacted
    }

    /// Pop up to `limit` queued jobs, marking them as replaying.
    pub fn next_batch(&self, limit: usize) -> Result<Vec<QueuedJob>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare(
                "SELECT job_id, request_id, redacted_payload, attempts FROM overflow_jobs
                 WHERE status = 'queued' ORDER BY enqueued_at ASC LIMIT ?1",
            )
            .map_err(|e| GatewayError::Queue(e.to_string()))?;

        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                ))
            })
            .map_err(|e| GatewayError::Queue(e.to_string()))?;

        let mut jobs = Vec::new();
        for row in rows {
            let (job_id, request_id, payload, attempts) =
                row.map_err(|e| GatewayError::Queue(e.to_string()))?;
            match serde_json::from_str::<ChatCompletionRequest>(&payload) {
                Ok(request) => jobs.push(QueuedJob {
                    job_id,
                    request_id,
                    request,
                    attempts,
                }),
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "dropping unreadable queued job");
                    db.execute(
                        "UPDATE overflow_jobs SET status = 'failed' WHERE job_id = ?1",
                        [&job_id],
                    )
                    .map_err(|e| GatewayError::Queue(e.to_string()))?;
                }
            }
        }

        for job in &jobs {
            db.execute(
                "UPDATE overflow_jobs SET status = 'replaying' WHERE job_id = ?1",
                [&job.job_id],
            )
            .map_err(|e| GatewayError::Queue(e.to_string()))?;
        }

        Ok(jobs)
    }

    /// Mark a replayed job complete.
    pub fn mark_done(&self, job_id: &str) -> Result<()> {
        self.set_status(job_id, "done")
    }

    /// Record a failed replay attempt. Once attempts reach the configured
    /// maximum the job is marked failed; otherwise it goes back to queued.
    pub fn record_failure(&self, job_id: &str) -> Result<()> {
        let db = self.db.lock();
        db.execute(
            "UPDATE overflow_jobs SET attempts = attempts + 1,
                 status = CASE WHEN attempts + 1 >= ?2 THEN 'failed' ELSE 'queued' END
             WHERE job_id = ?1",
            rusqlite::params![job_id, self.settings.max_attempts],
        )
        .map_err(|e| GatewayError::Queue(e.to_string()))?;
        Ok(())
    }

    fn set_status(&self, job_id: &str, status: &str) -> Result<()> {
        let db = self.db.lock();
        db.execute(
            "UPDATE overflow_jobs SET status = ?2 WHERE job_id = ?1",
            rusqlite::params![job_id, status],
        )
        .map_err(|e| GatewayError::Queue(e.to_string()))?;
        Ok(())
    }

    /// Number of jobs waiting for replay.
    pub fn depth(&self) -> Result<u64> {
        let db = self.db.lock();
        db.query_row(
            "SELECT COUNT(*) FROM overflow_jobs WHERE status = 'queued'",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as u64)
        .map_err(|e| GatewayError::Queue(e.to_string()))
    }

    #[cfg(test)]
    fn status_of(&self, job_id: &str) -> String {
        let db = self.db.lock();
        db.query_row(
            "SELECT status FROM overflow_jobs WHERE job_id = ?1",
            [job_id],
            |row| row.get(0),
        )
        .unwrap()
    }
}
