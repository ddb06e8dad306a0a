//! Database broker for serialized state access (The Thin Waist).
//!
//! All mutations of control-plane state go through the broker: it serializes
//! access per database file, runs the closure against a configured
//! connection, and appends a structured audit event to `audit.events.jsonl`.
//! The audit log is the single source for the tenant timeline (C10).

use crate::core::context::OpContext;
use crate::core::db;
use crate::core::error::ChangeOpsError;
use crate::core::time;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

pub const AUDIT_LOG_NAME: &str = "audit.events.jsonl";

/// Entity classes surfaced on the timeline.
pub const ENTITY_CHANGE: &str = "change";
pub const ENTITY_DRAFT: &str = "draft";
pub const ENTITY_PROMOTION_INTENT: &str = "promotion-intent";
pub const ENTITY_PULL_DOWN: &str = "pull-down";

/// Audit event for a brokered operation or a domain timeline entry.
///
/// Broker-level events record `op`/`db_id`/`status`; domain events written by
/// subsystems additionally carry `entity_type`/`entity_id`/`event_type` and an
/// optional diff summary, which is what the timeline query surfaces.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuditEvent {
    #[serde(default = "default_audit_schema_version")]
    pub schema_version: String,
    #[serde(default)]
    pub request_id: String,
    /// ISO-like timestamp (seconds since epoch + 'Z')
    pub ts: String,
    /// Unique event identifier (ULID)
    pub event_id: String,
    pub tenant_id: String,
    pub actor: String,
    #[serde(default)]
    pub actor_kind: String,
    /// Tenant-context source ("header" or "system").
    #[serde(default)]
    pub source: String,
    /// Operation name (e.g., "draft.install", "promotion.execute")
    pub op: String,
    /// Database identifier (file name), empty for domain events.
    #[serde(default)]
    pub db_id: String,
    /// Operation status ("success" or "error")
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_summary: Option<JsonValue>,
}

/// Broker providing serialized access to subsystem databases.
pub struct DbBroker {
    audit_log_path: PathBuf,
}

impl DbBroker {
    pub fn new(root: &Path) -> Self {
        Self {
            audit_log_path: root.join(AUDIT_LOG_NAME),
        }
    }

    pub fn audit_log_path(&self) -> &Path {
        &self.audit_log_path
    }

    /// Execute a closure with a serialized connection to the specified DB,
    /// attributing the operation to the calling context.
    pub fn with_conn<F, R>(
        &self,
        db_path: &Path,
        ctx: &OpContext,
        op_name: &str,
        f: F,
    ) -> Result<R, ChangeOpsError>
    where
        F: FnOnce(&Connection) -> Result<R, ChangeOpsError>,
    {
        let source = match ctx.tenant.source {
            crate::core::context::TenantSource::Header => "header",
            crate::core::context::TenantSource::System => "system",
        };
        self.run_with_conn(
            db_path,
            ctx.tenant_id(),
            &ctx.actor.id,
            &format!("{:?}", ctx.actor.kind).to_lowercase(),
            source,
            op_name,
            f,
        )
    }

    /// Initialization path: no tenant context yet, attributed to the system.
    pub fn with_system_conn<F, R>(
        &self,
        db_path: &Path,
        op_name: &str,
        f: F,
    ) -> Result<R, ChangeOpsError>
    where
        F: FnOnce(&Connection) -> Result<R, ChangeOpsError>,
    {
        self.run_with_conn(db_path, "", "changeops", "system", "system", op_name, f)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_with_conn<F, R>(
        &self,
        db_path: &Path,
        tenant_id: &str,
        actor: &str,
        actor_kind: &str,
        source: &str,
        op_name: &str,
        f: F,
    ) -> Result<R, ChangeOpsError>
    where
        F: FnOnce(&Connection) -> Result<R, ChangeOpsError>,
    {
        // Serialize operations per database path instead of globally.
        // Same-DB safety with cross-DB parallelism.
        let db_lock = get_db_lock(db_path)?;
        let _lock = db_lock
            .lock()
            .map_err(|_| ChangeOpsError::InvariantViolation("DbBroker lock poisoned".into()))?;

        let db_id = db_path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let conn = db::db_connect(&db_path.to_string_lossy())?;

        let result = f(&conn);

        let status = if result.is_ok() { "success" } else { "error" };
        self.append_event(AuditEvent {
            schema_version: default_audit_schema_version(),
            request_id: time::new_event_id(),
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            tenant_id: tenant_id.to_string(),
            actor: actor.to_string(),
            actor_kind: actor_kind.to_string(),
            source: source.to_string(),
            op: op_name.to_string(),
            db_id,
            status: status.to_string(),
            entity_type: None,
            entity_id: None,
            event_type: None,
            diff_summary: None,
        })?;

        result
    }

    /// Append a domain timeline event (draft installed, promotion executed, …).
    pub fn emit_entity_event(
        &self,
        ctx: &OpContext,
        entity_type: &str,
        entity_id: &str,
        event_type: &str,
        diff_summary: Option<JsonValue>,
    ) -> Result<(), ChangeOpsError> {
        let source = match ctx.tenant.source {
            crate::core::context::TenantSource::Header => "header",
            crate::core::context::TenantSource::System => "system",
        };
        self.append_event(AuditEvent {
            schema_version: default_audit_schema_version(),
            request_id: time::new_event_id(),
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            tenant_id: ctx.tenant_id().to_string(),
            actor: ctx.actor.id.clone(),
            actor_kind: format!("{:?}", ctx.actor.kind).to_lowercase(),
            source: source.to_string(),
            op: event_type.to_string(),
            db_id: String::new(),
            status: "success".to_string(),
            entity_type: Some(entity_type.to_string()),
            entity_id: Some(entity_id.to_string()),
            event_type: Some(event_type.to_string()),
            diff_summary,
        })
    }

    fn append_event(&self, ev: AuditEvent) -> Result<(), ChangeOpsError> {
        use std::fs::OpenOptions;
        use std::io::Write;

        let audit_lock = get_audit_lock();
        let _audit_guard = audit_lock
            .lock()
            .map_err(|_| ChangeOpsError::InvariantViolation("Audit lock poisoned".into()))?;

        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_log_path)
            .map_err(ChangeOpsError::IoError)?;

        let line = serde_json::to_string(&ev)
            .map_err(|e| ChangeOpsError::InvariantViolation(format!("audit encode: {}", e)))?;
        writeln!(f, "{}", line).map_err(ChangeOpsError::IoError)?;
        Ok(())
    }

    /// Read the full audit log. Used by the timeline query and `audit verify`.
    pub fn read_events(&self) -> Result<Vec<AuditEvent>, ChangeOpsError> {
        if !self.audit_log_path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.audit_log_path).map_err(ChangeOpsError::IoError)?;
        let mut events = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let ev: AuditEvent = serde_json::from_str(line).map_err(|e| {
                ChangeOpsError::InvariantViolation(format!("corrupt audit line: {}", e))
            })?;
            events.push(ev);
        }
        Ok(events)
    }
}

fn db_lock_map() -> &'static Mutex<HashMap<PathBuf, Arc<Mutex<()>>>> {
    static DB_LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    DB_LOCKS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn get_db_lock(db_path: &Path) -> Result<Arc<Mutex<()>>, ChangeOpsError> {
    let key = db_path.to_path_buf();
    let mut map = db_lock_map()
        .lock()
        .map_err(|_| ChangeOpsError::InvariantViolation("Db lock map poisoned".into()))?;
    Ok(map
        .entry(key)
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone())
}

fn get_audit_lock() -> &'static Mutex<()> {
    static AUDIT_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    AUDIT_LOCK.get_or_init(|| Mutex::new(()))
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "broker",
        "version": "1.0.0",
        "description": "State mutation broker and audit log (The Thin Waist)",
        "commands": [
            { "name": "audit", "description": "Show the mutation audit log" },
            { "name": "verify", "description": "Verify audit log integrity" }
        ],
        "envelope": {
            "schema_version": "1.0.0",
            "fields": [
                "schema_version",
                "request_id",
                "event_id",
                "ts",
                "tenant_id",
                "actor",
                "actor_kind",
                "source",
                "op",
                "db_id",
                "status",
                "entity_type",
                "entity_id",
                "event_type",
                "diff_summary"
            ]
        },
        "storage": [AUDIT_LOG_NAME]
    })
}

fn default_audit_schema_version() -> String {
    "1.0.0".to_string()
}
