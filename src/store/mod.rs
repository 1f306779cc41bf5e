//! Durable job store backed by SQLite.
//!
//! The store is the only shared mutable resource in the system. Workers
//! coordinate exclusively through [`JobStore::claim_next`], which runs the
//! eligible-select/mark-owned pair inside a `BEGIN IMMEDIATE` transaction
//! so that two concurrent claims can never win the same job.

pub mod job;

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::Row;

use crate::error::{QueueError, Result};

pub use job::{Job, JobState, NewJob, Resolution};

/// Config key for the default attempt ceiling applied at enqueue time.
pub const CONFIG_MAX_RETRIES: &str = "max_retries";
/// Config key for the exponent base of the retry backoff delay.
pub const CONFIG_BACKOFF_BASE: &str = "backoff_base";

const DEFAULT_MAX_RETRIES: i64 = 3;
const DEFAULT_BACKOFF_BASE: &str = "2";

const JOBS_SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS jobs (
    id           TEXT PRIMARY KEY,
    command      TEXT NOT NULL,
    state        TEXT NOT NULL DEFAULT 'pending',
    attempts     INTEGER NOT NULL DEFAULT 0,
    max_retries  INTEGER NOT NULL DEFAULT 3,
    priority     INTEGER NOT NULL DEFAULT 0,
    created_at   INTEGER NOT NULL,
    run_at       INTEGER NOT NULL,
    started_at   INTEGER,
    completed_at INTEGER,
    updated_at   INTEGER NOT NULL,
    locked_by    TEXT,
    locked_at    INTEGER,
    stdout       TEXT,
    stderr       TEXT
)";

const CONFIG_SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS config (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)";

/// Handle to the durable job and config tables.
///
/// Cheap to clone via the inner pool; constructed once at startup and
/// passed explicitly to the worker pool and every command.
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (or create) the SQLite database at `path` and apply the schema.
    pub async fn connect(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(JOBS_SCHEMA).execute(&self.pool).await?;
        sqlx::query(CONFIG_SCHEMA).execute(&self.pool).await?;
        sqlx::query("INSERT OR IGNORE INTO config (key, value) VALUES (?, ?)")
            .bind(CONFIG_MAX_RETRIES)
            .bind(DEFAULT_MAX_RETRIES.to_string())
            .execute(&self.pool)
            .await?;
        sqlx::query("INSERT OR IGNORE INTO config (key, value) VALUES (?, ?)")
            .bind(CONFIG_BACKOFF_BASE)
            .bind(DEFAULT_BACKOFF_BASE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Job Operations
    // =========================================================================

    /// Insert a new job in `pending` state.
    ///
    /// `max_retries` falls back to the `max_retries` config key when the
    /// caller does not supply one. Fails with [`QueueError::DuplicateId`]
    /// if the id is already taken.
    pub async fn enqueue(&self, new: NewJob) -> Result<Job> {
        let max_retries = match new.max_retries {
            Some(m) => m,
            None => self
                .config_get(CONFIG_MAX_RETRIES)
                .await?
                .parse()
                .unwrap_or(DEFAULT_MAX_RETRIES),
        };

        let now = Utc::now();
        let run_at = now + chrono::Duration::seconds(new.delay_secs);

        let result = sqlx::query(
            "INSERT INTO jobs (id, command, state, attempts, max_retries, priority, \
                               created_at, updated_at, run_at) \
             VALUES (?, ?, ?, 0, ?, ?, ?, ?, ?)",
        )
        .bind(&new.id)
        .bind(&new.command)
        .bind(JobState::Pending.to_string())
        .bind(max_retries)
        .bind(new.priority)
        .bind(ms(now))
        .bind(ms(now))
        .bind(ms(run_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(Job {
                id: new.id,
                command: new.command,
                state: JobState::Pending,
                attempts: 0,
                max_retries,
                priority: new.priority,
                created_at: now,
                run_at,
                started_at: None,
                completed_at: None,
                updated_at: now,
                locked_by: None,
                locked_at: None,
                stdout: None,
                stderr: None,
            }),
            Err(e) if is_unique_violation(&e) => Err(QueueError::DuplicateId(new.id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically claim the next eligible job for `worker_id`.
    ///
    /// Eligible jobs are `pending` or `failed` rows whose `run_at` has
    /// passed and that carry no lock, plus `processing` rows whose lock is
    /// older than `stale_after` (a crashed worker's abandoned claim). The
    /// winner is the highest priority, ties broken by earliest creation.
    ///
    /// Returns `Ok(None)` both when nothing is eligible and when another
    /// claimant holds the write lock; contention is not an error.
    pub async fn claim_next(&self, worker_id: &str, stale_after: Duration) -> Result<Option<Job>> {
        let now = Utc::now();
        let now_ms = ms(now);
        let stale_cutoff = now_ms - stale_after.as_millis() as i64;

        let mut conn = self.pool.acquire().await?;

        // IMMEDIATE takes the write lock up front, serializing the
        // select/update pair against concurrent claimants.
        if let Err(e) = sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await {
            if is_busy(&e) {
                return Ok(None);
            }
            return Err(e.into());
        }

        match claim_in_tx(&mut *conn, worker_id, now_ms, stale_cutoff).await {
            Ok(claimed) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(claimed)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                match &e {
                    QueueError::Store(sql) if is_busy(sql) => Ok(None),
                    _ => Err(e),
                }
            }
        }
    }

    /// Atomically write the outcome of an execution attempt.
    ///
    /// Always releases the lock. `completed_at` is stamped when entering a
    /// terminal state; `run_at` is only overwritten when the resolution
    /// schedules a retry. Transitions to `processing` are the claim
    /// protocol's job, never resolve's.
    pub async fn resolve(&self, id: &str, resolution: Resolution) -> Result<()> {
        debug_assert!(resolution.state != JobState::Processing);

        let now_ms = ms(Utc::now());
        let terminal = matches!(resolution.state, JobState::Completed | JobState::Dead);

        let result = sqlx::query(
            "UPDATE jobs SET \
                 state = ?, \
                 attempts = ?, \
                 stdout = ?, \
                 stderr = ?, \
                 run_at = COALESCE(?, run_at), \
                 completed_at = CASE WHEN ? THEN ? ELSE completed_at END, \
                 updated_at = ?, \
                 locked_by = NULL, \
                 locked_at = NULL \
             WHERE id = ?",
        )
        .bind(resolution.state.to_string())
        .bind(resolution.attempts)
        .bind(&resolution.stdout)
        .bind(&resolution.stderr)
        .bind(resolution.run_at.map(ms))
        .bind(terminal)
        .bind(now_ms)
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::JobNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Fetch a single job by id.
    pub async fn job(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    /// List jobs, most recently updated first, optionally filtered by state.
    pub async fn jobs_by_state(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        let rows = match state {
            Some(state) => {
                sqlx::query("SELECT * FROM jobs WHERE state = ? ORDER BY updated_at DESC")
                    .bind(state.to_string())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM jobs ORDER BY updated_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(job_from_row).collect()
    }

    /// Job counts per state.
    pub async fn counts_by_state(&self) -> Result<Vec<(JobState, i64)>> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS count FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in &rows {
            let state: String = row.try_get("state").map_err(QueueError::Store)?;
            let count: i64 = row.try_get("count").map_err(QueueError::Store)?;
            counts.push((parse_state(&state)?, count));
        }
        Ok(counts)
    }

    /// Average wall-clock duration of completed jobs, in seconds.
    pub async fn average_duration_secs(&self) -> Result<Option<f64>> {
        let avg: Option<f64> = sqlx::query_scalar(
            "SELECT AVG((completed_at - started_at) / 1000.0) FROM jobs \
             WHERE state = 'completed' AND started_at IS NOT NULL AND completed_at IS NOT NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(avg)
    }

    /// Move a dead-letter job back to `pending` with a fresh attempt budget.
    ///
    /// Only acts on jobs currently in `dead`; anything else is reported as
    /// not found and left untouched.
    pub async fn retry_dead(&self, id: &str) -> Result<()> {
        let now_ms = ms(Utc::now());
        let result = sqlx::query(
            "UPDATE jobs SET \
                 state = 'pending', \
                 attempts = 0, \
                 run_at = ?, \
                 updated_at = ?, \
                 locked_by = NULL, \
                 locked_at = NULL \
             WHERE id = ? AND state = 'dead'",
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::JobNotFound(id.to_string()));
        }
        Ok(())
    }

    // =========================================================================
    // Config Operations
    // =========================================================================

    pub async fn config_get(&self, key: &str) -> Result<String> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        value.ok_or_else(|| QueueError::ConfigKeyNotFound(key.to_string()))
    }

    /// Update an existing config key. Unknown keys are rejected, not
    /// inserted.
    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        let result = sqlx::query("UPDATE config SET value = ? WHERE key = ?")
            .bind(value)
            .bind(key)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::ConfigKeyNotFound(key.to_string()));
        }
        Ok(())
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT key, value FROM config ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let key: String = row.try_get("key").map_err(QueueError::Store)?;
            let value: String = row.try_get("value").map_err(QueueError::Store)?;
            entries.push((key, value));
        }
        Ok(entries)
    }
}

/// Select and lock the winner inside an already-open IMMEDIATE transaction.
async fn claim_in_tx(
    conn: &mut SqliteConnection,
    worker_id: &str,
    now_ms: i64,
    stale_cutoff: i64,
) -> Result<Option<Job>> {
    let row = sqlx::query(
        "SELECT * FROM jobs \
         WHERE ((state = 'pending' OR state = 'failed') \
                AND run_at <= ? AND locked_by IS NULL) \
            OR (state = 'processing' AND locked_at <= ?) \
         ORDER BY priority DESC, created_at ASC \
         LIMIT 1",
    )
    .bind(now_ms)
    .bind(stale_cutoff)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let mut job = job_from_row(&row)?;
    let rescue = job.state == JobState::Processing;
    if rescue {
        tracing::warn!(
            job_id = %job.id,
            previous_owner = ?job.locked_by,
            "Rescuing stale job"
        );
    }

    // A rescue re-acquires an attempt already counted as started; only a
    // fresh attempt stamps started_at.
    let started_ms = if rescue {
        job.started_at.map(ms)
    } else {
        Some(now_ms)
    };

    sqlx::query(
        "UPDATE jobs SET \
             state = 'processing', \
             locked_by = ?, \
             locked_at = ?, \
             started_at = ?, \
             updated_at = ? \
         WHERE id = ?",
    )
    .bind(worker_id)
    .bind(now_ms)
    .bind(started_ms)
    .bind(now_ms)
    .bind(&job.id)
    .execute(&mut *conn)
    .await?;

    job.state = JobState::Processing;
    job.locked_by = Some(worker_id.to_string());
    job.locked_at = Some(from_ms(now_ms));
    job.updated_at = from_ms(now_ms);
    if !rescue {
        job.started_at = Some(from_ms(now_ms));
    }
    Ok(Some(job))
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let state: String = row.try_get("state").map_err(QueueError::Store)?;
    Ok(Job {
        id: row.try_get("id").map_err(QueueError::Store)?,
        command: row.try_get("command").map_err(QueueError::Store)?,
        state: parse_state(&state)?,
        attempts: row.try_get("attempts").map_err(QueueError::Store)?,
        max_retries: row.try_get("max_retries").map_err(QueueError::Store)?,
        priority: row.try_get("priority").map_err(QueueError::Store)?,
        created_at: from_ms(row.try_get("created_at").map_err(QueueError::Store)?),
        run_at: from_ms(row.try_get("run_at").map_err(QueueError::Store)?),
        started_at: opt_ms(row.try_get("started_at").map_err(QueueError::Store)?),
        completed_at: opt_ms(row.try_get("completed_at").map_err(QueueError::Store)?),
        updated_at: from_ms(row.try_get("updated_at").map_err(QueueError::Store)?),
        locked_by: row.try_get("locked_by").map_err(QueueError::Store)?,
        locked_at: opt_ms(row.try_get("locked_at").map_err(QueueError::Store)?),
        stdout: row.try_get("stdout").map_err(QueueError::Store)?,
        stderr: row.try_get("stderr").map_err(QueueError::Store)?,
    })
}

fn parse_state(raw: &str) -> Result<JobState> {
    raw.parse()
        .map_err(|e: String| QueueError::Internal(format!("corrupt state column: {}", e)))
}

fn ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ms(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::UNIX_EPOCH)
}

fn opt_ms(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.map(from_ms)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let code = db.code();
            code.as_deref() == Some("5")
                || code.as_deref() == Some("6")
                || db.message().contains("database is locked")
        }
        _ => false,
    }
}
