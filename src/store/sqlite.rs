use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::cluster::NodeHeartbeat;
use crate::error::{Result, SchedulerError};
use crate::scheduler::{Job, LogResult, Trigger, TriggerLog, TriggerStatus};
use crate::store::{liveness_cutoff, ClusterRegistry, TriggerStore};

/// SQLite-backed store.
///
/// Timestamps are stored as epoch milliseconds so range scans compare
/// integers. Several processes may open the same file; WAL mode plus a busy
/// timeout lets their conditional updates serialize inside SQLite.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

const JOB_COLUMNS: &str = "id, namespace, name, payload, enabled, timeout_ms, max_retry_count, \
     route_strategy, run_count, created_at, updated_at";

const TRIGGER_COLUMNS: &str = "t.id, t.job_id, t.namespace, t.name, t.schedule, t.start_time, \
     t.end_time, t.next_fire_time, t.last_fire_time, t.misfire_threshold_ms, t.misfire_policy, \
     t.owner, t.version, t.status, t.consecutive_failures, t.manual_fire, t.created_at, t.updated_at";

const LOG_COLUMNS: &str = "id, trigger_id, job_id, namespace, node_id, fire_time, start_time, \
     end_time, outcome, misfire, manual, exit_code, output, error, retry_count";

const NODE_COLUMNS: &str =
    "node_id, namespace, instance_name, last_heartbeat, load_weight, standby, started_at";

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            namespace TEXT NOT NULL,
            name TEXT NOT NULL,
            payload TEXT NOT NULL,          -- JSON, tagged by kind
            enabled INTEGER NOT NULL DEFAULT 1,
            timeout_ms INTEGER,
            max_retry_count INTEGER NOT NULL DEFAULT 0,
            route_strategy TEXT NOT NULL DEFAULT '{"strategy":"any"}',
            run_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS triggers (
            id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            namespace TEXT NOT NULL,
            name TEXT NOT NULL,
            schedule TEXT NOT NULL,         -- JSON: {kind: cron|fixed_interval, ...}
            start_time INTEGER NOT NULL,
            end_time INTEGER,
            next_fire_time INTEGER,
            last_fire_time INTEGER,
            misfire_threshold_ms INTEGER,
            misfire_policy TEXT NOT NULL DEFAULT 'fire_once',
            owner TEXT,
            version INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'normal',
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            manual_fire INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_triggers_due
            ON triggers(namespace, status, next_fire_time);
        CREATE INDEX IF NOT EXISTS idx_triggers_owner ON triggers(owner);

        CREATE TABLE IF NOT EXISTS trigger_logs (
            id TEXT PRIMARY KEY,
            trigger_id TEXT NOT NULL,
            job_id TEXT NOT NULL,
            namespace TEXT NOT NULL,
            node_id TEXT NOT NULL,
            fire_time INTEGER NOT NULL,
            start_time INTEGER NOT NULL,
            end_time INTEGER,
            outcome TEXT NOT NULL,
            misfire INTEGER NOT NULL DEFAULT 0,
            manual INTEGER NOT NULL DEFAULT 0,
            exit_code INTEGER,
            output TEXT,
            error TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_logs_trigger ON trigger_logs(trigger_id, start_time);

        CREATE TABLE IF NOT EXISTS nodes (
            node_id TEXT PRIMARY KEY,
            namespace TEXT NOT NULL,
            instance_name TEXT NOT NULL,
            last_heartbeat INTEGER NOT NULL,
            load_weight REAL NOT NULL DEFAULT 1.0,
            standby INTEGER NOT NULL DEFAULT 0,
            started_at INTEGER NOT NULL
        );

        PRAGMA foreign_keys = ON;
        "#,
    )?;
    Ok(())
}

fn millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn conversion_err(
    idx: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

fn uuid_col(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s).map_err(|e| conversion_err(idx, e))
}

fn json_col<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_err(idx, e))
}

fn text_col<T: FromStr<Err = String>>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    s.parse().map_err(|e: String| conversion_err(idx, e))
}

fn time_col(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    row.get::<_, i64>(idx).map(from_millis)
}

fn opt_time_col(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(from_millis))
}

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    Ok(Job {
        id: uuid_col(row, 0)?,
        namespace: row.get(1)?,
        name: row.get(2)?,
        payload: json_col(row, 3)?,
        enabled: row.get(4)?,
        timeout_ms: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
        max_retry_count: row.get::<_, i64>(6)? as u32,
        route_strategy: json_col(row, 7)?,
        run_count: row.get::<_, i64>(8)? as u64,
        created_at: time_col(row, 9)?,
        updated_at: time_col(row, 10)?,
    })
}

fn row_to_trigger(row: &Row) -> rusqlite::Result<Trigger> {
    Ok(Trigger {
        id: uuid_col(row, 0)?,
        job_id: uuid_col(row, 1)?,
        namespace: row.get(2)?,
        name: row.get(3)?,
        schedule: json_col(row, 4)?,
        start_time: time_col(row, 5)?,
        end_time: opt_time_col(row, 6)?,
        next_fire_time: opt_time_col(row, 7)?,
        last_fire_time: opt_time_col(row, 8)?,
        misfire_threshold_ms: row.get::<_, Option<i64>>(9)?.map(|v| v as u64),
        misfire_policy: text_col(row, 10)?,
        owner: row.get(11)?,
        version: row.get::<_, i64>(12)? as u64,
        status: text_col(row, 13)?,
        consecutive_failures: row.get::<_, i64>(14)? as u32,
        manual_fire: row.get(15)?,
        created_at: time_col(row, 16)?,
        updated_at: time_col(row, 17)?,
    })
}

fn row_to_log(row: &Row) -> rusqlite::Result<TriggerLog> {
    Ok(TriggerLog {
        id: uuid_col(row, 0)?,
        trigger_id: uuid_col(row, 1)?,
        job_id: uuid_col(row, 2)?,
        namespace: row.get(3)?,
        node_id: row.get(4)?,
        fire_time: time_col(row, 5)?,
        start_time: time_col(row, 6)?,
        end_time: opt_time_col(row, 7)?,
        outcome: text_col(row, 8)?,
        misfire: row.get(9)?,
        manual: row.get(10)?,
        exit_code: row.get(11)?,
        output: row.get(12)?,
        error: row.get(13)?,
        retry_count: row.get::<_, i64>(14)? as u32,
    })
}

fn row_to_node(row: &Row) -> rusqlite::Result<NodeHeartbeat> {
    Ok(NodeHeartbeat {
        node_id: row.get(0)?,
        namespace: row.get(1)?,
        instance_name: row.get(2)?,
        last_heartbeat: time_col(row, 3)?,
        load_weight: row.get(4)?,
        standby: row.get(5)?,
        started_at: time_col(row, 6)?,
    })
}

/// Maps "no row updated" to the matching not-found error.
fn expect_trigger_row(changed: usize, trigger_id: Uuid) -> Result<()> {
    if changed == 0 {
        return Err(SchedulerError::TriggerNotFound(trigger_id));
    }
    Ok(())
}

#[async_trait]
impl TriggerStore for SqliteStore {
    async fn ping(&self) -> Result<()> {
        self.conn.lock().query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    async fn insert_job(&self, job: &Job) -> Result<()> {
        let payload = serde_json::to_string(&job.payload)?;
        let route = serde_json::to_string(&job.route_strategy)?;
        self.conn.lock().execute(
            "INSERT INTO jobs (id, namespace, name, payload, enabled, timeout_ms, max_retry_count,
                route_strategy, run_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                job.id.to_string(),
                job.namespace,
                job.name,
                payload,
                job.enabled,
                job.timeout_ms.map(|v| v as i64),
                job.max_retry_count as i64,
                route,
                job.run_count as i64,
                millis(job.created_at),
                millis(job.updated_at),
            ],
        )?;
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let payload = serde_json::to_string(&job.payload)?;
        let route = serde_json::to_string(&job.route_strategy)?;
        // run_count belongs to the workers and is never overwritten here.
        let changed = self.conn.lock().execute(
            "UPDATE jobs SET name = ?2, payload = ?3, enabled = ?4, timeout_ms = ?5,
                max_retry_count = ?6, route_strategy = ?7, updated_at = ?8
             WHERE id = ?1",
            params![
                job.id.to_string(),
                job.name,
                payload,
                job.enabled,
                job.timeout_ms.map(|v| v as i64),
                job.max_retry_count as i64,
                route,
                millis(Utc::now()),
            ],
        )?;
        if changed == 0 {
            return Err(SchedulerError::JobNotFound(job.id));
        }
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let conn = self.conn.lock();
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [id.to_string()],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    async fn list_jobs(&self, namespace: &str) -> Result<Vec<Job>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE namespace = ?1 ORDER BY created_at"
        ))?;
        let jobs = stmt
            .query_map([namespace], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    async fn set_job_enabled(&self, id: Uuid, enabled: bool) -> Result<()> {
        let changed = self.conn.lock().execute(
            "UPDATE jobs SET enabled = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), enabled, millis(Utc::now())],
        )?;
        if changed == 0 {
            return Err(SchedulerError::JobNotFound(id));
        }
        Ok(())
    }

    async fn delete_job(&self, id: Uuid) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM triggers WHERE job_id = ?1", [id.to_string()])?;
        let changed = tx.execute("DELETE FROM jobs WHERE id = ?1", [id.to_string()])?;
        if changed == 0 {
            return Err(SchedulerError::JobNotFound(id));
        }
        tx.commit()?;
        Ok(())
    }

    async fn increment_run_count(&self, id: Uuid) -> Result<u64> {
        let count = self
            .conn
            .lock()
            .query_row(
                "UPDATE jobs SET run_count = run_count + 1 WHERE id = ?1 RETURNING run_count",
                [id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        count
            .map(|c| c as u64)
            .ok_or(SchedulerError::JobNotFound(id))
    }

    async fn insert_trigger(&self, trigger: &Trigger) -> Result<()> {
        let schedule = serde_json::to_string(&trigger.schedule)?;
        let conn = self.conn.lock();
        let job_exists = conn
            .query_row(
                "SELECT 1 FROM jobs WHERE id = ?1",
                [trigger.job_id.to_string()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !job_exists {
            return Err(SchedulerError::JobNotFound(trigger.job_id));
        }
        conn.execute(
            "INSERT INTO triggers (id, job_id, namespace, name, schedule, start_time, end_time,
                next_fire_time, last_fire_time, misfire_threshold_ms, misfire_policy, owner,
                version, status, consecutive_failures, manual_fire, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                trigger.id.to_string(),
                trigger.job_id.to_string(),
                trigger.namespace,
                trigger.name,
                schedule,
                millis(trigger.start_time),
                trigger.end_time.map(millis),
                trigger.next_fire_time.map(millis),
                trigger.last_fire_time.map(millis),
                trigger.misfire_threshold_ms.map(|v| v as i64),
                trigger.misfire_policy.to_string(),
                trigger.owner,
                trigger.version as i64,
                trigger.status.to_string(),
                trigger.consecutive_failures as i64,
                trigger.manual_fire,
                millis(trigger.created_at),
                millis(trigger.updated_at),
            ],
        )?;
        Ok(())
    }

    async fn get_trigger(&self, id: Uuid) -> Result<Option<Trigger>> {
        let conn = self.conn.lock();
        let trigger = conn
            .query_row(
                &format!("SELECT {TRIGGER_COLUMNS} FROM triggers t WHERE t.id = ?1"),
                [id.to_string()],
                row_to_trigger,
            )
            .optional()?;
        Ok(trigger)
    }

    async fn list_triggers(&self, namespace: &str) -> Result<Vec<Trigger>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers t WHERE t.namespace = ?1 ORDER BY t.created_at"
        ))?;
        let triggers = stmt
            .query_map([namespace], row_to_trigger)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(triggers)
    }

    async fn find_due_triggers(
        &self,
        namespace: &str,
        before: DateTime<Utc>,
    ) -> Result<Vec<Trigger>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers t JOIN jobs j ON j.id = t.job_id
             WHERE t.namespace = ?1 AND t.status = 'normal' AND j.enabled = 1
               AND t.next_fire_time IS NOT NULL AND t.next_fire_time <= ?2
             ORDER BY t.next_fire_time"
        ))?;
        let triggers = stmt
            .query_map(params![namespace, millis(before)], row_to_trigger)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(triggers)
    }

    async fn claim(
        &self,
        trigger_id: Uuid,
        node_id: &str,
        expected_owner: Option<&str>,
        expected_version: u64,
        stale_after: Duration,
    ) -> Result<bool> {
        // `IS` matches NULL against NULL, which `=` does not.
        let changed = self.conn.lock().execute(
            "UPDATE triggers SET owner = ?2, version = version + 1, updated_at = ?3
             WHERE id = ?1 AND owner IS ?4 AND version = ?5
               AND (owner IS NULL OR owner = ?2 OR NOT EXISTS (
                    SELECT 1 FROM nodes
                    WHERE nodes.node_id = triggers.owner AND nodes.last_heartbeat > ?6))",
            params![
                trigger_id.to_string(),
                node_id,
                millis(Utc::now()),
                expected_owner,
                expected_version as i64,
                millis(liveness_cutoff(stale_after)),
            ],
        )?;
        Ok(changed == 1)
    }

    async fn release(&self, trigger_id: Uuid, node_id: &str) -> Result<bool> {
        let changed = self.conn.lock().execute(
            "UPDATE triggers SET owner = NULL, updated_at = ?3 WHERE id = ?1 AND owner = ?2",
            params![trigger_id.to_string(), node_id, millis(Utc::now())],
        )?;
        Ok(changed == 1)
    }

    async fn release_all(&self, node_id: &str) -> Result<usize> {
        let changed = self.conn.lock().execute(
            "UPDATE triggers SET owner = NULL, updated_at = ?2 WHERE owner = ?1",
            params![node_id, millis(Utc::now())],
        )?;
        Ok(changed)
    }

    async fn update_next_fire_time(
        &self,
        trigger_id: Uuid,
        next: Option<DateTime<Utc>>,
        last_fire: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let changed = self.conn.lock().execute(
            "UPDATE triggers SET next_fire_time = ?2, last_fire_time = ?3, manual_fire = 0,
                updated_at = ?4
             WHERE id = ?1",
            params![
                trigger_id.to_string(),
                next.map(millis),
                last_fire.map(millis),
                millis(Utc::now()),
            ],
        )?;
        expect_trigger_row(changed, trigger_id)
    }

    async fn set_trigger_status(&self, trigger_id: Uuid, status: TriggerStatus) -> Result<()> {
        let changed = self.conn.lock().execute(
            "UPDATE triggers SET status = ?2, updated_at = ?3,
                consecutive_failures = CASE WHEN ?2 = 'normal' THEN 0 ELSE consecutive_failures END
             WHERE id = ?1",
            params![trigger_id.to_string(), status.to_string(), millis(Utc::now())],
        )?;
        expect_trigger_row(changed, trigger_id)
    }

    async fn request_fire(&self, trigger_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let changed = self.conn.lock().execute(
            "UPDATE triggers SET next_fire_time = ?2, manual_fire = 1, updated_at = ?3 WHERE id = ?1",
            params![trigger_id.to_string(), millis(at), millis(Utc::now())],
        )?;
        expect_trigger_row(changed, trigger_id)
    }

    async fn record_outcome(&self, trigger_id: Uuid, success: bool) -> Result<u32> {
        let failures = self
            .conn
            .lock()
            .query_row(
                "UPDATE triggers
                 SET consecutive_failures = CASE WHEN ?2 THEN 0 ELSE consecutive_failures + 1 END
                 WHERE id = ?1
                 RETURNING consecutive_failures",
                params![trigger_id.to_string(), success],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        failures
            .map(|f| f as u32)
            .ok_or(SchedulerError::TriggerNotFound(trigger_id))
    }

    async fn append_log(&self, entry: &TriggerLog) -> Result<Uuid> {
        self.conn.lock().execute(
            "INSERT INTO trigger_logs (id, trigger_id, job_id, namespace, node_id, fire_time,
                start_time, end_time, outcome, misfire, manual, exit_code, output, error, retry_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                entry.id.to_string(),
                entry.trigger_id.to_string(),
                entry.job_id.to_string(),
                entry.namespace,
                entry.node_id,
                millis(entry.fire_time),
                millis(entry.start_time),
                entry.end_time.map(millis),
                entry.outcome.to_string(),
                entry.misfire,
                entry.manual,
                entry.exit_code,
                entry.output,
                entry.error,
                entry.retry_count as i64,
            ],
        )?;
        Ok(entry.id)
    }

    async fn finalize_log(&self, log_id: Uuid, result: &LogResult) -> Result<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE trigger_logs SET outcome = ?2, end_time = ?3, exit_code = ?4, output = ?5,
                error = ?6, retry_count = ?7
             WHERE id = ?1 AND outcome = 'running'",
            params![
                log_id.to_string(),
                result.outcome.to_string(),
                millis(result.end_time),
                result.exit_code,
                result.output,
                result.error,
                result.retry_count as i64,
            ],
        )?;
        if changed == 1 {
            return Ok(());
        }
        let exists = conn
            .query_row(
                "SELECT 1 FROM trigger_logs WHERE id = ?1",
                [log_id.to_string()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !exists {
            return Err(SchedulerError::StoreUnavailable(format!(
                "log entry {log_id} missing"
            )));
        }
        tracing::warn!(log_id = %log_id, "Log entry already finalized");
        Ok(())
    }

    async fn list_logs(&self, trigger_id: Option<Uuid>, limit: usize) -> Result<Vec<TriggerLog>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {LOG_COLUMNS} FROM trigger_logs
             WHERE ?1 IS NULL OR trigger_id = ?1
             ORDER BY start_time DESC
             LIMIT ?2"
        ))?;
        let logs = stmt
            .query_map(
                params![trigger_id.map(|id| id.to_string()), limit as i64],
                row_to_log,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(logs)
    }

    async fn fail_running_logs(
        &self,
        node_id: Option<&str>,
        started_before: DateTime<Utc>,
        error: &str,
    ) -> Result<usize> {
        let failed = self.conn.lock().execute(
            "UPDATE trigger_logs SET outcome = 'failure', end_time = ?3, error = ?4
             WHERE outcome = 'running' AND start_time < ?2 AND (?1 IS NULL OR node_id = ?1)",
            params![node_id, millis(started_before), millis(Utc::now()), error],
        )?;
        Ok(failed)
    }

    async fn purge_logs(&self, before: DateTime<Utc>) -> Result<usize> {
        let purged = self.conn.lock().execute(
            "DELETE FROM trigger_logs WHERE outcome != 'running' AND start_time < ?1",
            [millis(before)],
        )?;
        Ok(purged)
    }
}

#[async_trait]
impl ClusterRegistry for SqliteStore {
    async fn heartbeat(&self, node: &NodeHeartbeat) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO nodes (node_id, namespace, instance_name, last_heartbeat, load_weight,
                standby, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(node_id) DO UPDATE SET
                last_heartbeat = excluded.last_heartbeat,
                load_weight = excluded.load_weight,
                standby = excluded.standby",
            params![
                node.node_id,
                node.namespace,
                node.instance_name,
                millis(node.last_heartbeat),
                node.load_weight,
                node.standby,
                millis(node.started_at),
            ],
        )?;
        Ok(())
    }

    async fn list_live_nodes(
        &self,
        namespace: &str,
        stale_after: Duration,
    ) -> Result<Vec<NodeHeartbeat>> {
        let cutoff = liveness_cutoff(stale_after);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE namespace = ?1 AND last_heartbeat > ?2"
        ))?;
        let nodes = stmt
            .query_map(params![namespace, millis(cutoff)], row_to_node)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }

    async fn list_nodes(&self, namespace: &str) -> Result<Vec<NodeHeartbeat>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes WHERE namespace = ?1 ORDER BY instance_name"
        ))?;
        let nodes = stmt
            .query_map([namespace], row_to_node)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT namespace FROM nodes UNION SELECT namespace FROM jobs ORDER BY 1")?;
        let namespaces = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(namespaces)
    }

    async fn remove_node(&self, node_id: &str) -> Result<()> {
        self.conn
            .lock()
            .execute("DELETE FROM nodes WHERE node_id = ?1", [node_id])?;
        Ok(())
    }
}
