//! Database layer for config versions and the audit log
//!
//! SQLite, single file, zero network dependencies. Version rows are only ever
//! inserted; `UNIQUE(config_id, version)` is the last line of defence against
//! two writers claiming the same version number.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::{EngineError, EngineResult};
use crate::types::{AuditAction, AuditRecord, Config, ConfigFilter, ConfigPayload, Scope};

/// Initialize the database with schema
pub fn init_db(path: &Path) -> EngineResult<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| EngineError::Storage(format!("Failed to create {:?}: {}", parent, e)))?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(PRAGMAS)?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;
PRAGMA foreign_keys = ON;
"#;

const SCHEMA: &str = r#"
-- Config versions: one immutable row per (config_id, version)
CREATE TABLE IF NOT EXISTS config_versions (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    config_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    name TEXT NOT NULL,
    scope TEXT NOT NULL,
    scope_id TEXT,
    enabled INTEGER NOT NULL,
    deleted_at TEXT,
    payload_json TEXT NOT NULL,
    payload_hash TEXT NOT NULL,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(config_id, version)
);

CREATE INDEX IF NOT EXISTS idx_versions_scope ON config_versions(scope, scope_id);
CREATE INDEX IF NOT EXISTS idx_versions_config ON config_versions(config_id, version);

-- Audit log: append-only, hash-chained per config
CREATE TABLE IF NOT EXISTS audit_log (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    config_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    action TEXT NOT NULL,
    previous_version INTEGER,
    new_version INTEGER NOT NULL,
    diff_json TEXT NOT NULL,
    reason TEXT,
    created_at TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    previous_hash TEXT,
    signature TEXT NOT NULL,
    agent_pubkey TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_config ON audit_log(config_id, seq);

-- Predictions: canonical classification outputs
CREATE TABLE IF NOT EXISTS predictions (
    id TEXT PRIMARY KEY,
    config_id TEXT NOT NULL,
    config_version INTEGER NOT NULL,
    contact_id TEXT,
    channel TEXT NOT NULL,
    text TEXT NOT NULL,
    label TEXT NOT NULL,
    score REAL NOT NULL,
    confidence REAL NOT NULL,
    raw_response_json TEXT NOT NULL,
    derived_json TEXT NOT NULL,
    model_provider TEXT NOT NULL,
    processing_time_ms INTEGER NOT NULL,
    sampled INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_predictions_contact ON predictions(contact_id, created_at);
CREATE INDEX IF NOT EXISTS idx_predictions_config ON predictions(config_id, created_at);

-- Feedback: human corrections, one prediction each
CREATE TABLE IF NOT EXISTS feedback (
    id TEXT PRIMARY KEY,
    prediction_id TEXT NOT NULL REFERENCES predictions(id),
    config_id TEXT NOT NULL,
    user_label TEXT NOT NULL,
    user_confidence REAL,
    user_id TEXT NOT NULL,
    review_status TEXT NOT NULL DEFAULT 'pending',
    reviewed_by TEXT,
    reviewed_at TEXT,
    included_in_training INTEGER NOT NULL DEFAULT 0,
    training_batch_id TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_feedback_config ON feedback(config_id, review_status);
CREATE INDEX IF NOT EXISTS idx_feedback_prediction ON feedback(prediction_id);
"#;

/// Shared handle over one SQLite connection.
///
/// The mutex only guards the connection itself; callers own any higher-level
/// critical sections (see `VersionStore`).
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> EngineResult<Self> {
        let conn = init_db(path)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> EngineResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::Storage("database lock poisoned".to_string()))
    }

    /// Run a closure against the connection
    pub fn with_conn<F, T>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&Connection) -> EngineResult<T>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run a closure inside a transaction; commits on Ok, rolls back on Err
    pub fn with_tx<F, T>(&self, f: F) -> EngineResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> EngineResult<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

pub fn to_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub fn parse_ts(raw: &str) -> EngineResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| EngineError::Storage(format!("bad timestamp '{}': {}", raw, e)))
}

pub fn parse_opt_ts(raw: Option<String>) -> EngineResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

// ============================================================================
// CONFIG VERSIONS
// ============================================================================

const CONFIG_COLUMNS: &str = "config_id, version, name, scope, scope_id, enabled, deleted_at, \
                              payload_json, payload_hash, created_by, created_at";

/// Raw row before JSON/timestamp decoding
struct ConfigRow {
    config_id: String,
    version: u32,
    name: String,
    scope: String,
    scope_id: Option<String>,
    enabled: bool,
    deleted_at: Option<String>,
    payload_json: String,
    payload_hash: String,
    created_by: String,
    created_at: String,
}

impl ConfigRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            config_id: row.get(0)?,
            version: row.get(1)?,
            name: row.get(2)?,
            scope: row.get(3)?,
            scope_id: row.get(4)?,
            enabled: row.get(5)?,
            deleted_at: row.get(6)?,
            payload_json: row.get(7)?,
            payload_hash: row.get(8)?,
            created_by: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_config(self) -> EngineResult<Config> {
        let scope: Scope = self
            .scope
            .parse()
            .map_err(|_| EngineError::Storage(format!("bad scope '{}' in storage", self.scope)))?;
        let payload: ConfigPayload = serde_json::from_str(&self.payload_json)?;
        Ok(Config {
            config_id: self.config_id,
            version: self.version,
            name: self.name,
            scope,
            scope_id: self.scope_id,
            enabled: self.enabled,
            deleted_at: parse_opt_ts(self.deleted_at)?,
            payload,
            payload_hash: self.payload_hash,
            created_by: self.created_by,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

fn collect_configs(rows: Vec<ConfigRow>) -> EngineResult<Vec<Config>> {
    rows.into_iter().map(ConfigRow::into_config).collect()
}

/// Append one version row. `payload_json` is stored verbatim.
pub fn insert_version(tx: &Transaction<'_>, config: &Config, payload_json: &str) -> EngineResult<()> {
    let result = tx.execute(
        r#"
        INSERT INTO config_versions (config_id, version, name, scope, scope_id, enabled,
                                     deleted_at, payload_json, payload_hash, created_by, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            config.config_id,
            config.version,
            config.name,
            config.scope.as_str(),
            config.scope_id,
            config.enabled,
            config.deleted_at.as_ref().map(to_ts),
            payload_json,
            config.payload_hash,
            config.created_by,
            to_ts(&config.created_at),
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(EngineError::Conflict {
                config_id: config.config_id.clone(),
                expected: config.version.saturating_sub(1),
                actual: config.version,
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Stored payload JSON for an exact version (used for byte-exact rollback)
pub fn get_payload_json(conn: &Connection, config_id: &str, version: u32) -> EngineResult<Option<String>> {
    let json = conn
        .query_row(
            "SELECT payload_json FROM config_versions WHERE config_id = ?1 AND version = ?2",
            params![config_id, version],
            |row| row.get(0),
        )
        .optional()?;
    Ok(json)
}

/// Highest version for a config, deleted or not
pub fn latest_version(conn: &Connection, config_id: &str) -> EngineResult<Option<Config>> {
    let sql = format!(
        "SELECT {} FROM config_versions WHERE config_id = ?1 ORDER BY version DESC LIMIT 1",
        CONFIG_COLUMNS
    );
    let row = conn
        .query_row(&sql, [config_id], ConfigRow::from_row)
        .optional()?;
    row.map(ConfigRow::into_config).transpose()
}

pub fn get_version(conn: &Connection, config_id: &str, version: u32) -> EngineResult<Option<Config>> {
    let sql = format!(
        "SELECT {} FROM config_versions WHERE config_id = ?1 AND version = ?2",
        CONFIG_COLUMNS
    );
    let row = conn
        .query_row(&sql, params![config_id, version], ConfigRow::from_row)
        .optional()?;
    row.map(ConfigRow::into_config).transpose()
}

/// All versions, oldest first
pub fn list_versions(conn: &Connection, config_id: &str) -> EngineResult<Vec<Config>> {
    let sql = format!(
        "SELECT {} FROM config_versions WHERE config_id = ?1 ORDER BY version ASC",
        CONFIG_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([config_id], ConfigRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    collect_configs(rows)
}

/// Newest config at (scope, scope_id) whose latest version is enabled and not deleted.
///
/// Ties between configs at the same scope go to the most recently written one.
pub fn latest_active_at_scope(
    conn: &Connection,
    scope: Scope,
    scope_id: Option<&str>,
) -> EngineResult<Option<Config>> {
    let sql = format!(
        r#"
        SELECT {} FROM config_versions v
        JOIN (
            SELECT config_id AS cid, MAX(version) AS max_version
            FROM config_versions
            WHERE scope = ?1 AND scope_id IS ?2
            GROUP BY config_id
        ) latest ON latest.cid = v.config_id AND latest.max_version = v.version
        WHERE v.enabled = 1 AND v.deleted_at IS NULL
        ORDER BY v.seq DESC
        LIMIT 1
        "#,
        CONFIG_COLUMNS
            .split(", ")
            .map(|c| format!("v.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let row = conn
        .query_row(&sql, params![scope.as_str(), scope_id], ConfigRow::from_row)
        .optional()?;
    row.map(ConfigRow::into_config).transpose()
}

/// Latest version of every config matching the filter
pub fn list_latest(conn: &Connection, filter: &ConfigFilter) -> EngineResult<Vec<Config>> {
    let sql = format!(
        r#"
        SELECT {} FROM config_versions v
        JOIN (
            SELECT config_id AS cid, MAX(version) AS max_version
            FROM config_versions GROUP BY config_id
        ) latest ON latest.cid = v.config_id AND latest.max_version = v.version
        WHERE (?1 IS NULL OR v.scope = ?1)
          AND (?2 IS NULL OR v.scope_id = ?2)
          AND (?3 = 1 OR v.deleted_at IS NULL)
        ORDER BY v.scope, v.scope_id, v.name
        "#,
        CONFIG_COLUMNS
            .split(", ")
            .map(|c| format!("v.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(
            params![
                filter.scope.map(|s| s.as_str()),
                filter.scope_id,
                filter.include_deleted,
            ],
            ConfigRow::from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    collect_configs(rows)
}

// ============================================================================
// AUDIT LOG
// ============================================================================

const AUDIT_COLUMNS: &str = "seq, config_id, user_id, action, previous_version, new_version, \
                             diff_json, reason, created_at, content_hash, previous_hash, \
                             signature, agent_pubkey";

pub fn insert_audit(tx: &Transaction<'_>, record: &AuditRecord) -> EngineResult<i64> {
    tx.execute(
        r#"
        INSERT INTO audit_log (config_id, user_id, action, previous_version, new_version,
                               diff_json, reason, created_at, content_hash, previous_hash,
                               signature, agent_pubkey)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
        params![
            record.config_id,
            record.user_id,
            record.action.as_str(),
            record.previous_version,
            record.new_version,
            serde_json::to_string(&record.diff)?,
            record.reason,
            to_ts(&record.created_at),
            record.content_hash,
            record.previous_hash,
            record.signature,
            record.agent_pubkey,
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

/// Hash of the newest audit record for chain linking
pub fn latest_audit_hash(conn: &Connection, config_id: &str) -> EngineResult<Option<String>> {
    let hash = conn
        .query_row(
            "SELECT content_hash FROM audit_log WHERE config_id = ?1 ORDER BY seq DESC LIMIT 1",
            [config_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(hash)
}

/// Audit records for a config, oldest first
pub fn audit_for(conn: &Connection, config_id: &str) -> EngineResult<Vec<AuditRecord>> {
    let sql = format!(
        "SELECT {} FROM audit_log WHERE config_id = ?1 ORDER BY seq ASC",
        AUDIT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([config_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<u32>>(4)?,
                row.get::<_, u32>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, Option<String>>(10)?,
                row.get::<_, String>(11)?,
                row.get::<_, String>(12)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(
            |(seq, config_id, user_id, action, previous_version, new_version, diff_json, reason,
              created_at, content_hash, previous_hash, signature, agent_pubkey)| {
                Ok(AuditRecord {
                    seq,
                    config_id,
                    user_id,
                    action: action.parse::<AuditAction>()?,
                    previous_version,
                    new_version,
                    diff: serde_json::from_str(&diff_json)?,
                    reason,
                    created_at: parse_ts(&created_at)?,
                    content_hash,
                    previous_hash,
                    signature,
                    agent_pubkey,
                })
            },
        )
        .collect()
}
