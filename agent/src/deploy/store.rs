//! Metadata store for agent state and deployment history
//!
//! SQLite-backed persistence for supervised agent records and an
//! append-only deployment log. The public surface never propagates I/O
//! errors: reads degrade to empty results and writes to a `false`
//! return, with the fault logged. In-memory supervisor state stays
//! authoritative for the current process lifetime either way.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Durable snapshot of one supervised agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,
    pub status: String,
    pub checksum: Option<String>,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub config_path: String,
    pub start_time: Option<String>,
    pub restart_count: u32,
    pub last_health_check: Option<String>,
    pub health_status: String,
    pub error_message: Option<String>,
    pub stdout_log: Option<String>,
    pub stderr_log: Option<String>,
    pub exit_code: Option<i32>,
    /// Free-form JSON blob
    pub metadata: Option<serde_json::Value>,
    pub updated_at: String,
}

impl AgentRecord {
    /// Blank record for a freshly registered agent
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: "discovered".to_string(),
            checksum: None,
            port: None,
            pid: None,
            config_path: String::new(),
            start_time: None,
            restart_count: 0,
            last_health_check: None,
            health_status: "unknown".to_string(),
            error_message: None,
            stdout_log: None,
            stderr_log: None,
            exit_code: None,
            metadata: None,
            updated_at: Utc::now().to_rfc3339(),
        }
    }
}

/// One row of the append-only deployment log
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentEvent {
    pub id: i64,
    pub agent_name: String,
    pub checksum: Option<String>,
    pub action: String,
    pub timestamp: String,
    pub result: String,
    pub duration_ms: i64,
    pub error: Option<String>,
}

/// Aggregate view over the store
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub agents_by_status: HashMap<String, u64>,
    pub total_history_rows: u64,
    pub failures_last_24h: u64,
}

/// Store handle with thread-safe connection access
#[derive(Clone)]
pub struct MetadataStore {
    conn: Arc<Mutex<Connection>>,
}

impl MetadataStore {
    /// Open or create the store at the default location
    /// (~/.local/share/harbor/deployments.db or platform equivalent)
    pub fn open() -> Result<Self> {
        Self::open_at(Self::default_path()?)
    }

    /// Open or create the store at a specific path. Unlike the query
    /// methods, opening can fail hard: a store the operator pointed at
    /// a bad location is a config problem worth surfacing at startup.
    pub fn open_at(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;

        tracing::info!("Metadata store opened at {:?}", path);
        Ok(store)
    }

    /// In-memory store, used by tests and ephemeral runs
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn default_path() -> Result<PathBuf> {
        let data = dirs::data_dir().context("Could not determine data directory")?;
        Ok(data.join("harbor").join("deployments.db"))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                name TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                checksum TEXT,
                port INTEGER,
                pid INTEGER,
                config_path TEXT NOT NULL,
                start_time TEXT,
                restart_count INTEGER NOT NULL DEFAULT 0,
                last_health_check TEXT,
                health_status TEXT NOT NULL DEFAULT 'unknown',
                error_message TEXT,
                stdout_log TEXT,
                stderr_log TEXT,
                exit_code INTEGER,
                metadata TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_agents_checksum ON agents(checksum);
            CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status);

            CREATE TABLE IF NOT EXISTS deployment_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_name TEXT NOT NULL,
                checksum TEXT,
                action TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                result TEXT NOT NULL,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_history_agent
            ON deployment_history(agent_name, timestamp DESC);

            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            INSERT OR IGNORE INTO schema_version (version) VALUES (1);
            "#,
        )?;
        Ok(())
    }

    /// Insert or update an agent record by name. Returns false (logged)
    /// when persistence failed; prior state is left intact.
    pub fn upsert_agent(&self, record: &AgentRecord) -> bool {
        match self.try_upsert_agent(record) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to persist agent '{}': {}", record.name, e);
                false
            }
        }
    }

    fn try_upsert_agent(&self, record: &AgentRecord) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let metadata = record
            .metadata
            .as_ref()
            .map(|v| v.to_string());
        tx.execute(
            r#"
            INSERT INTO agents (
                name, status, checksum, port, pid, config_path, start_time,
                restart_count, last_health_check, health_status, error_message,
                stdout_log, stderr_log, exit_code, metadata, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            ON CONFLICT(name) DO UPDATE SET
                status = excluded.status,
                checksum = excluded.checksum,
                port = excluded.port,
                pid = excluded.pid,
                config_path = excluded.config_path,
                start_time = excluded.start_time,
                restart_count = excluded.restart_count,
                last_health_check = excluded.last_health_check,
                health_status = excluded.health_status,
                error_message = excluded.error_message,
                stdout_log = excluded.stdout_log,
                stderr_log = excluded.stderr_log,
                exit_code = excluded.exit_code,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at
            "#,
            params![
                record.name,
                record.status,
                record.checksum,
                record.port,
                record.pid,
                record.config_path,
                record.start_time,
                record.restart_count,
                record.last_health_check,
                record.health_status,
                record.error_message,
                record.stdout_log,
                record.stderr_log,
                record.exit_code,
                metadata,
                record.updated_at,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Point lookup by agent name
    pub fn get_agent(&self, name: &str) -> Option<AgentRecord> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row(
                "SELECT * FROM agents WHERE name = ?1",
                params![name],
                row_to_record,
            )
            .optional();
        match result {
            Ok(record) => record,
            Err(e) => {
                tracing::error!("Failed to read agent '{}': {}", name, e);
                None
            }
        }
    }

    /// Point lookup by package checksum, the deployment idempotency key
    pub fn get_agent_by_checksum(&self, checksum: &str) -> Option<AgentRecord> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row(
                "SELECT * FROM agents WHERE checksum = ?1 LIMIT 1",
                params![checksum],
                row_to_record,
            )
            .optional();
        match result {
            Ok(record) => record,
            Err(e) => {
                tracing::error!("Failed to read agent by checksum: {}", e);
                None
            }
        }
    }

    /// List agents, optionally filtered by status
    pub fn list_agents(&self, status: Option<&str>) -> Vec<AgentRecord> {
        match self.try_list_agents(status) {
            Ok(records) => records,
            Err(e) => {
                tracing::error!("Failed to list agents: {}", e);
                Vec::new()
            }
        }
    }

    fn try_list_agents(&self, status: Option<&str>) -> Result<Vec<AgentRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut records = Vec::new();
        match status {
            Some(status) => {
                let mut stmt =
                    conn.prepare("SELECT * FROM agents WHERE status = ?1 ORDER BY name")?;
                let rows = stmt.query_map(params![status], row_to_record)?;
                for row in rows {
                    records.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare("SELECT * FROM agents ORDER BY name")?;
                let rows = stmt.query_map([], row_to_record)?;
                for row in rows {
                    records.push(row?);
                }
            }
        }
        Ok(records)
    }

    /// Remove an agent record (explicit un-deploy). Returns whether a
    /// row was deleted.
    pub fn delete_agent(&self, name: &str) -> bool {
        let conn = self.conn.lock().unwrap();
        match conn.execute("DELETE FROM agents WHERE name = ?1", params![name]) {
            Ok(n) => n > 0,
            Err(e) => {
                tracing::error!("Failed to delete agent '{}': {}", name, e);
                false
            }
        }
    }

    /// Append one deployment-history row
    pub fn record_deployment(
        &self,
        agent_name: &str,
        checksum: Option<&str>,
        action: &str,
        result: &str,
        duration_ms: i64,
        error: Option<&str>,
    ) -> bool {
        let conn = self.conn.lock().unwrap();
        let outcome = conn.execute(
            r#"
            INSERT INTO deployment_history
                (agent_name, checksum, action, timestamp, result, duration_ms, error)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                agent_name,
                checksum,
                action,
                Utc::now().to_rfc3339(),
                result,
                duration_ms,
                error,
            ],
        );
        match outcome {
            Ok(_) => true,
            Err(e) => {
                tracing::error!("Failed to record deployment for '{}': {}", agent_name, e);
                false
            }
        }
    }

    /// Retrieve history rows, most recent first, bounded by `limit`.
    /// When `agent_name` is given only that agent's rows are returned.
    pub fn get_history(&self, agent_name: Option<&str>, limit: usize) -> Vec<DeploymentEvent> {
        match self.try_get_history(agent_name, limit) {
            Ok(events) => events,
            Err(e) => {
                tracing::error!("Failed to read deployment history: {}", e);
                Vec::new()
            }
        }
    }

    fn try_get_history(
        &self,
        agent_name: Option<&str>,
        limit: usize,
    ) -> Result<Vec<DeploymentEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut events = Vec::new();
        match agent_name {
            Some(name) => {
                let mut stmt = conn.prepare(
                    "SELECT id, agent_name, checksum, action, timestamp, result, duration_ms, error
                     FROM deployment_history WHERE agent_name = ?1
                     ORDER BY id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![name, limit as i64], row_to_event)?;
                for row in rows {
                    events.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, agent_name, checksum, action, timestamp, result, duration_ms, error
                     FROM deployment_history ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit as i64], row_to_event)?;
                for row in rows {
                    events.push(row?);
                }
            }
        }
        Ok(events)
    }

    /// Aggregate statistics: per-status agent counts, history volume,
    /// and failures in the trailing 24 hours.
    pub fn stats(&self) -> StoreStats {
        match self.try_stats() {
            Ok(stats) => stats,
            Err(e) => {
                tracing::error!("Failed to compute store stats: {}", e);
                StoreStats {
                    agents_by_status: HashMap::new(),
                    total_history_rows: 0,
                    failures_last_24h: 0,
                }
            }
        }
    }

    fn try_stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock().unwrap();

        let mut agents_by_status = HashMap::new();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM agents GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            agents_by_status.insert(status, count);
        }

        let total_history_rows: u64 =
            conn.query_row("SELECT COUNT(*) FROM deployment_history", [], |row| {
                row.get(0)
            })?;

        // RFC 3339 UTC strings compare lexicographically in time order
        let cutoff = (Utc::now() - chrono::Duration::hours(24)).to_rfc3339();
        let failures_last_24h: u64 = conn.query_row(
            "SELECT COUNT(*) FROM deployment_history
             WHERE result = 'failure' AND timestamp >= ?1",
            params![cutoff],
            |row| row.get(0),
        )?;

        Ok(StoreStats {
            agents_by_status,
            total_history_rows,
            failures_last_24h,
        })
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<AgentRecord> {
    let metadata: Option<String> = row.get("metadata")?;
    Ok(AgentRecord {
        name: row.get("name")?,
        status: row.get("status")?,
        checksum: row.get("checksum")?,
        port: row.get("port")?,
        pid: row.get("pid")?,
        config_path: row.get("config_path")?,
        start_time: row.get("start_time")?,
        restart_count: row.get("restart_count")?,
        last_health_check: row.get("last_health_check")?,
        health_status: row.get("health_status")?,
        error_message: row.get("error_message")?,
        stdout_log: row.get("stdout_log")?,
        stderr_log: row.get("stderr_log")?,
        exit_code: row.get("exit_code")?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<DeploymentEvent> {
    Ok(DeploymentEvent {
        id: row.get(0)?,
        agent_name: row.get(1)?,
        checksum: row.get(2)?,
        action: row.get(3)?,
        timestamp: row.get(4)?,
        result: row.get(5)?,
        duration_ms: row.get(6)?,
        error: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, status: &str) -> AgentRecord {
        AgentRecord {
            name: name.to_string(),
            status: status.to_string(),
            checksum: None,
            port: None,
            pid: None,
            config_path: format!("/tmp/{}/agent.toml", name),
            start_time: None,
            restart_count: 0,
            last_health_check: None,
            health_status: "unknown".to_string(),
            error_message: None,
            stdout_log: None,
            stderr_log: None,
            exit_code: None,
            metadata: None,
            updated_at: Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let store = MetadataStore::open_in_memory().unwrap();
        assert!(store.upsert_agent(&record("a", "discovered")));

        let mut updated = record("a", "running");
        updated.port = Some(8101);
        updated.pid = Some(4242);
        assert!(store.upsert_agent(&updated));

        let fetched = store.get_agent("a").unwrap();
        assert_eq!(fetched.status, "running");
        assert_eq!(fetched.port, Some(8101));
        assert_eq!(fetched.pid, Some(4242));
    }

    #[test]
    fn test_get_missing_is_none() {
        let store = MetadataStore::open_in_memory().unwrap();
        assert!(store.get_agent("nope").is_none());
    }

    #[test]
    fn test_checksum_lookup() {
        let store = MetadataStore::open_in_memory().unwrap();
        let mut rec = record("a", "discovered");
        rec.checksum = Some("abc123".to_string());
        store.upsert_agent(&rec);

        assert_eq!(store.get_agent_by_checksum("abc123").unwrap().name, "a");
        assert!(store.get_agent_by_checksum("missing").is_none());
    }

    #[test]
    fn test_list_filtered_by_status() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.upsert_agent(&record("a", "running"));
        store.upsert_agent(&record("b", "stopped"));
        store.upsert_agent(&record("c", "running"));

        assert_eq!(store.list_agents(None).len(), 3);
        let running = store.list_agents(Some("running"));
        assert_eq!(running.len(), 2);
        assert!(running.iter().all(|r| r.status == "running"));
    }

    #[test]
    fn test_history_most_recent_first_with_limit() {
        let store = MetadataStore::open_in_memory().unwrap();
        for i in 0..5 {
            store.record_deployment("a", None, "start", "success", i, None);
        }
        store.record_deployment("b", None, "deploy", "failure", 0, Some("boom"));

        let all = store.get_history(None, 3);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].agent_name, "b");
        assert!(all[0].id > all[1].id && all[1].id > all[2].id);

        let only_a = store.get_history(Some("a"), 10);
        assert_eq!(only_a.len(), 5);
        assert!(only_a.iter().all(|e| e.agent_name == "a"));
    }

    #[test]
    fn test_stats() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.upsert_agent(&record("a", "running"));
        store.upsert_agent(&record("b", "failed"));
        store.record_deployment("b", None, "start", "failure", 12, Some("crash"));
        store.record_deployment("a", None, "start", "success", 40, None);

        let stats = store.stats();
        assert_eq!(stats.agents_by_status.get("running"), Some(&1));
        assert_eq!(stats.agents_by_status.get("failed"), Some(&1));
        assert_eq!(stats.total_history_rows, 2);
        assert_eq!(stats.failures_last_24h, 1);
    }

    #[test]
    fn test_delete_agent() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.upsert_agent(&record("a", "stopped"));
        assert!(store.delete_agent("a"));
        assert!(!store.delete_agent("a"));
        assert!(store.get_agent("a").is_none());
    }

    #[test]
    fn test_metadata_blob_roundtrip() {
        let store = MetadataStore::open_in_memory().unwrap();
        let mut rec = record("a", "discovered");
        rec.metadata = Some(serde_json::json!({"tier": 2, "tags": ["x"]}));
        store.upsert_agent(&rec);

        let fetched = store.get_agent("a").unwrap();
        assert_eq!(fetched.metadata.unwrap()["tier"], 2);
    }
}
