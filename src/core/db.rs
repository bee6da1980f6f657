use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::job::{EventType, Job, JobEvent, JobState, StateFields};
use super::permission::{PermissionOracle, Role, User};
use super::repository::JobRepository;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    role TEXT NOT NULL DEFAULT 'User',
    visible_gpus TEXT NOT NULL DEFAULT '[]',
    CHECK (role IN ('Admin', 'User'))
);

CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    command TEXT NOT NULL,
    working_dir TEXT NOT NULL,
    image TEXT,
    container_args TEXT NOT NULL DEFAULT '[]',
    env TEXT NOT NULL DEFAULT '{}',
    requested_gpus TEXT NOT NULL DEFAULT 'CPU',
    gpu_memory_limit_mb INTEGER,
    priority INTEGER NOT NULL DEFAULT 100,
    state TEXT NOT NULL DEFAULT 'Pending',
    submitted_at INTEGER NOT NULL,
    started_at INTEGER,
    finished_at INTEGER,
    pid INTEGER,
    stdout_path TEXT,
    stderr_path TEXT,
    stdout_snippet TEXT,
    stderr_snippet TEXT,
    updated_at INTEGER NOT NULL,
    CHECK (state IN ('Pending', 'Running', 'Success', 'Failed', 'Cancelled'))
);

-- GPU assignments (Vec<u32> -> table, `slot` keeps request order)
CREATE TABLE IF NOT EXISTS job_gpu_assignments (
    job_id INTEGER NOT NULL,
    gpu_index INTEGER NOT NULL,
    slot INTEGER NOT NULL,
    PRIMARY KEY (job_id, gpu_index),
    FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
);

-- Append-only audit trail
CREATE TABLE IF NOT EXISTS job_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    old_state TEXT,
    new_state TEXT,
    reason TEXT,
    gpu_ids TEXT,
    FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE,
    CHECK (event_type IN ('Created', 'StateTransition'))
);

CREATE INDEX IF NOT EXISTS idx_jobs_pending
    ON jobs(state, priority DESC, submitted_at ASC, id ASC);
CREATE INDEX IF NOT EXISTS idx_job_events_job_id ON job_events(job_id);
"#;

type Conn = PooledConnection<SqliteConnectionManager>;

/// Pooled SQLite handle. Implements both [`JobRepository`] and
/// [`PermissionOracle`].
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
    db_path: PathBuf,
}

impl Database {
    /// Create a new database connection pool
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create database directory {}", parent.display())
            })?;
        }

        let manager = SqliteConnectionManager::file(&db_path).with_init(|conn| {
            conn.execute("PRAGMA foreign_keys = ON", [])?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; PRAGMA busy_timeout = 5000;",
            )?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(10)
            .min_idle(Some(2))
            .build(manager)
            .context("Failed to create connection pool")?;

        let db = Self {
            pool: Arc::new(pool),
            db_path,
        };

        db.initialize_schema()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> Result<Conn> {
        self.pool
            .get()
            .context("Failed to get connection from pool")
    }

    pub fn initialize_schema(&self) -> Result<()> {
        self.conn()?
            .execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")
    }

    /// Health check - verify database connectivity
    pub fn health_check(&self) -> Result<()> {
        self.conn()?
            .query_row("SELECT 1", [], |_| Ok(()))
            .context("Database health check failed")
    }

    /// Insert or replace a user record
    pub fn insert_user(&self, user: &User) -> Result<()> {
        let visible = serde_json::to_string(&user.visible_gpus)?;
        self.conn()?
            .execute(
                "INSERT INTO users (id, username, role, visible_gpus) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET username = ?2, role = ?3, visible_gpus = ?4",
                params![user.id, user.username, user.role.to_string(), visible],
            )
            .context("Failed to insert user")?;
        Ok(())
    }

    pub fn get_user(&self, id: u32) -> Result<Option<User>> {
        self.conn()?
            .query_row(
                "SELECT id, username, role, visible_gpus FROM users WHERE id = ?1",
                params![id],
                row_to_user,
            )
            .optional()
            .context("Failed to get user")
    }

    /// All events for a job in insertion order
    pub fn get_job_events(&self, job_id: u32) -> Result<Vec<JobEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, job_id, event_type, timestamp, old_state, new_state, reason, gpu_ids
                 FROM job_events
                 WHERE job_id = ?1
                 ORDER BY id ASC",
            )
            .context("Failed to prepare events query")?;

        let events = stmt
            .query_map(params![job_id], row_to_event)
            .context("Failed to query events")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect events")?;
        Ok(events)
    }

    fn query_jobs(&self, sql: &str, state: JobState) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).context("Failed to prepare jobs query")?;
        let mut jobs = stmt
            .query_map(params![state.to_string()], row_to_job)
            .context("Failed to query jobs")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect jobs")?;

        for job in &mut jobs {
            job.gpu_ids = load_gpu_ids(&conn, job.id)?;
        }
        Ok(jobs)
    }
}

impl JobRepository for Database {
    fn insert(&self, job: &Job) -> Result<u32> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;

        let now = Utc::now();
        let submitted_at = job.submitted_at.unwrap_or(now);
        tx.execute(
            "INSERT INTO jobs (
                user_id, name, command, working_dir, image, container_args, env,
                requested_gpus, gpu_memory_limit_mb, priority, state, submitted_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                job.user_id,
                job.name,
                job.command,
                job.working_dir.to_string_lossy().into_owned(),
                job.image,
                serde_json::to_string(&job.container_args)?,
                serde_json::to_string(&job.env)?,
                job.requested_gpus,
                memory_limit_column(job.gpu_memory_limit_mb)?,
                job.priority,
                JobState::Pending.to_string(),
                to_millis(&submitted_at),
                to_millis(&now),
            ],
        )
        .context("Failed to insert job")?;

        let id = u32::try_from(tx.last_insert_rowid())
            .map_err(|_| anyhow!("Job id overflowed u32"))?;
        insert_event(&tx, &JobEvent::created(id))?;

        tx.commit().context("Failed to commit transaction")?;
        tracing::debug!("Inserted job {}", id);
        Ok(id)
    }

    fn get(&self, id: u32) -> Result<Option<Job>> {
        let conn = self.conn()?;
        let job = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], row_to_job)
            .optional()
            .context("Failed to get job")?;

        match job {
            Some(mut job) => {
                job.gpu_ids = load_gpu_ids(&conn, id)?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    fn list_pending(&self) -> Result<Vec<Job>> {
        self.query_jobs(
            "SELECT * FROM jobs WHERE state = ?1
             ORDER BY priority DESC, submitted_at ASC, id ASC",
            JobState::Pending,
        )
    }

    fn list_running(&self) -> Result<Vec<Job>> {
        self.query_jobs(
            "SELECT * FROM jobs WHERE state = ?1 ORDER BY id ASC",
            JobState::Running,
        )
    }

    fn compare_and_set_state(
        &self,
        id: u32,
        expected: JobState,
        new: JobState,
        fields: &StateFields,
    ) -> Result<usize> {
        if !expected.can_transition_to(new) {
            anyhow::bail!("Illegal state transition for job {}: {} -> {}", id, expected, new);
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;

        let logs = fields.logs.as_ref();
        let rows = tx
            .execute(
                "UPDATE jobs SET
                    state = ?1,
                    started_at = COALESCE(?2, started_at),
                    finished_at = COALESCE(?3, finished_at),
                    stdout_path = COALESCE(?4, stdout_path),
                    stderr_path = COALESCE(?5, stderr_path),
                    stdout_snippet = COALESCE(?6, stdout_snippet),
                    stderr_snippet = COALESCE(?7, stderr_snippet),
                    updated_at = ?8
                 WHERE id = ?9 AND state = ?10",
                params![
                    new.to_string(),
                    fields.started_at.as_ref().map(to_millis),
                    fields.finished_at.as_ref().map(to_millis),
                    logs.and_then(|l| l.stdout_path.as_ref())
                        .map(|p| p.to_string_lossy().into_owned()),
                    logs.and_then(|l| l.stderr_path.as_ref())
                        .map(|p| p.to_string_lossy().into_owned()),
                    logs.map(|l| l.stdout_snippet.as_str()),
                    logs.map(|l| l.stderr_snippet.as_str()),
                    to_millis(&Utc::now()),
                    id,
                    expected.to_string(),
                ],
            )
            .context("Failed to update job state")?;

        if rows == 0 {
            return Ok(0);
        }

        if let Some(gpu_ids) = &fields.gpu_ids {
            replace_gpu_ids(&tx, id, gpu_ids)?;
        }
        let event = JobEvent::state_transition(id, expected, new, fields.reason.clone())
            .with_gpus(fields.gpu_ids.clone());
        insert_event(&tx, &event)?;

        tx.commit().context("Failed to commit transaction")?;
        Ok(rows)
    }

    fn set_pid(&self, id: u32, pid: u32) -> Result<()> {
        let rows = self
            .conn()?
            .execute(
                "UPDATE jobs SET pid = ?1, updated_at = ?2 WHERE id = ?3",
                params![pid, to_millis(&Utc::now()), id],
            )
            .context("Failed to record pid")?;
        if rows == 0 {
            anyhow::bail!("Job {} not found while recording pid", id);
        }
        Ok(())
    }

    fn save(&self, job: &Job) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;

        let current: Option<String> = tx
            .query_row(
                "SELECT state FROM jobs WHERE id = ?1",
                params![job.id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read job state")?;
        let Some(current) = current else {
            anyhow::bail!("Job {} not found", job.id);
        };
        let current = current
            .parse::<JobState>()
            .with_context(|| format!("Job {} has unknown state '{}'", job.id, current))?;
        if current != job.state && !current.can_transition_to(job.state) {
            anyhow::bail!(
                "Illegal state transition for job {}: {} -> {}",
                job.id,
                current,
                job.state
            );
        }

        let rows = tx
            .execute(
                "UPDATE jobs SET
                    user_id = ?1, name = ?2, command = ?3, working_dir = ?4, image = ?5,
                    container_args = ?6, env = ?7, requested_gpus = ?8,
                    gpu_memory_limit_mb = ?9, priority = ?10, state = ?11,
                    started_at = ?12, finished_at = ?13, pid = ?14,
                    stdout_path = ?15, stderr_path = ?16,
                    stdout_snippet = ?17, stderr_snippet = ?18, updated_at = ?19
                 WHERE id = ?20",
                params![
                    job.user_id,
                    job.name,
                    job.command,
                    job.working_dir.to_string_lossy().into_owned(),
                    job.image,
                    serde_json::to_string(&job.container_args)?,
                    serde_json::to_string(&job.env)?,
                    job.requested_gpus,
                    memory_limit_column(job.gpu_memory_limit_mb)?,
                    job.priority,
                    job.state.to_string(),
                    job.started_at.as_ref().map(to_millis),
                    job.finished_at.as_ref().map(to_millis),
                    job.pid,
                    job.stdout_path
                        .as_ref()
                        .map(|p| p.to_string_lossy().into_owned()),
                    job.stderr_path
                        .as_ref()
                        .map(|p| p.to_string_lossy().into_owned()),
                    job.stdout_snippet,
                    job.stderr_snippet,
                    to_millis(&Utc::now()),
                    job.id,
                ],
            )
            .context("Failed to save job")?;
        if rows == 0 {
            anyhow::bail!("Job {} not found", job.id);
        }
        replace_gpu_ids(&tx, job.id, &job.gpu_ids)?;

        tx.commit().context("Failed to commit transaction")?;
        Ok(())
    }
}

impl PermissionOracle for Database {
    fn is_admin(&self, user_id: u32) -> Result<bool> {
        Ok(self.get_user(user_id)?.is_some_and(|u| u.is_admin()))
    }

    fn visible_gpu_ids(&self, user_id: u32) -> Result<BTreeSet<u32>> {
        Ok(self
            .get_user(user_id)?
            .map(|u| u.visible_gpus)
            .unwrap_or_default())
    }
}

fn load_gpu_ids(conn: &Connection, job_id: u32) -> Result<Vec<u32>> {
    let mut stmt = conn
        .prepare("SELECT gpu_index FROM job_gpu_assignments WHERE job_id = ?1 ORDER BY slot")
        .context("Failed to prepare GPU query")?;
    let ids = stmt
        .query_map(params![job_id], |row| row.get(0))
        .context("Failed to query GPU assignments")?
        .collect::<Result<Vec<u32>, _>>()
        .context("Failed to collect GPU assignments")?;
    Ok(ids)
}

fn replace_gpu_ids(tx: &rusqlite::Transaction<'_>, job_id: u32, gpu_ids: &[u32]) -> Result<()> {
    tx.execute(
        "DELETE FROM job_gpu_assignments WHERE job_id = ?1",
        params![job_id],
    )
    .context("Failed to clear GPU assignments")?;
    for (slot, gpu_index) in gpu_ids.iter().enumerate() {
        tx.execute(
            "INSERT INTO job_gpu_assignments (job_id, gpu_index, slot) VALUES (?1, ?2, ?3)",
            params![job_id, gpu_index, slot as i64],
        )
        .context("Failed to insert GPU assignment")?;
    }
    Ok(())
}

fn insert_event(tx: &rusqlite::Transaction<'_>, event: &JobEvent) -> Result<()> {
    let gpu_ids = event
        .gpu_ids
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    tx.execute(
        "INSERT INTO job_events (job_id, event_type, timestamp, old_state, new_state, reason, gpu_ids)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.job_id,
            event.event_type.to_string(),
            to_millis(&event.timestamp),
            event.old_state.as_ref().map(|s| s.to_string()),
            event.new_state.as_ref().map(|s| s.to_string()),
            event.reason,
            gpu_ids,
        ],
    )
    .context("Failed to insert event")?;
    Ok(())
}

fn memory_limit_column(mb: Option<u64>) -> Result<Option<i64>> {
    mb.map(i64::try_from)
        .transpose()
        .context("gpu_memory_limit_mb does not fit in a database integer")
}

fn to_millis(time: &DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn conversion_error<E>(column: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
}

/// Convert a database row to a Job. GPU ids are loaded separately.
fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    let working_dir: String = row.get("working_dir")?;
    let container_args: String = row.get("container_args")?;
    let env: String = row.get("env")?;
    let gpu_memory_limit_mb: Option<i64> = row.get("gpu_memory_limit_mb")?;
    let state: String = row.get("state")?;
    let submitted_at: i64 = row.get("submitted_at")?;
    let started_at: Option<i64> = row.get("started_at")?;
    let finished_at: Option<i64> = row.get("finished_at")?;
    let stdout_path: Option<String> = row.get("stdout_path")?;
    let stderr_path: Option<String> = row.get("stderr_path")?;

    Ok(Job {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        name: row.get("name")?,
        command: row.get("command")?,
        working_dir: PathBuf::from(working_dir),
        image: row.get("image")?,
        container_args: serde_json::from_str(&container_args).map_err(|e| conversion_error(0, e))?,
        env: serde_json::from_str(&env).map_err(|e| conversion_error(0, e))?,
        requested_gpus: row.get("requested_gpus")?,
        gpu_memory_limit_mb: gpu_memory_limit_mb
            .map(u64::try_from)
            .transpose()
            .map_err(|e| conversion_error(0, e))?,
        priority: row.get("priority")?,
        state: state.parse::<JobState>().map_err(|e| conversion_error(0, e))?,
        submitted_at: Some(from_millis(submitted_at)),
        started_at: started_at.map(from_millis),
        finished_at: finished_at.map(from_millis),
        pid: row.get("pid")?,
        gpu_ids: Vec::new(),
        stdout_path: stdout_path.map(PathBuf::from),
        stderr_path: stderr_path.map(PathBuf::from),
        stdout_snippet: row.get("stdout_snippet")?,
        stderr_snippet: row.get("stderr_snippet")?,
    })
}

fn row_to_event(row: &Row) -> rusqlite::Result<JobEvent> {
    let event_type: String = row.get("event_type")?;
    let timestamp: i64 = row.get("timestamp")?;
    let old_state: Option<String> = row.get("old_state")?;
    let new_state: Option<String> = row.get("new_state")?;
    let gpu_ids: Option<String> = row.get("gpu_ids")?;

    Ok(JobEvent {
        id: Some(row.get("id")?),
        job_id: row.get("job_id")?,
        event_type: event_type
            .parse::<EventType>()
            .map_err(|e| conversion_error(0, e))?,
        timestamp: from_millis(timestamp),
        old_state: old_state
            .map(|s| s.parse::<JobState>())
            .transpose()
            .map_err(|e| conversion_error(0, e))?,
        new_state: new_state
            .map(|s| s.parse::<JobState>())
            .transpose()
            .map_err(|e| conversion_error(0, e))?,
        reason: row.get("reason")?,
        gpu_ids: gpu_ids
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|e| conversion_error(0, e))?,
    })
}

fn row_to_user(row: &Row) -> rusqlite::Result<User> {
    let role: String = row.get("role")?;
    let visible: String = row.get("visible_gpus")?;
    Ok(User {
        id: row.get("id")?,
        username: row.get("username")?,
        role: role.parse::<Role>().map_err(|e| conversion_error(0, e))?,
        visible_gpus: serde_json::from_str(&visible).map_err(|e| conversion_error(0, e))?,
    })
}
