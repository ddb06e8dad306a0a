//! Database connection and initialization utilities.
//!
//! Low-level connection primitives plus per-subsystem initialization.
//! Subsystems own their schemas (see `core::schemas`); initialization runs in
//! parallel at startup via `rayon::scope`.
//!
//! - WAL mode for concurrent readers
//! - Foreign keys enforced
//! - 5-second busy timeout for lock contention

use crate::core::broker::DbBroker;
use crate::core::error::ChangeOpsError;
use crate::core::schemas;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Establish a SQLite connection with the standard pragmas.
///
/// Do not call directly for state mutations; go through `DbBroker::with_conn`
/// so the write is serialized and audited.
pub fn db_connect(db_path: &str) -> Result<Connection, ChangeOpsError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(ChangeOpsError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(ChangeOpsError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(ChangeOpsError::RusqliteError)?;
    Ok(conn)
}

pub fn graph_db_path(root: &Path) -> PathBuf {
    root.join(schemas::GRAPH_DB_NAME)
}

pub fn package_db_path(root: &Path) -> PathBuf {
    root.join(schemas::PACKAGE_DB_NAME)
}

pub fn draft_db_path(root: &Path) -> PathBuf {
    root.join(schemas::DRAFT_DB_NAME)
}

pub fn workflow_db_path(root: &Path) -> PathBuf {
    root.join(schemas::WORKFLOW_DB_NAME)
}

pub fn trigger_db_path(root: &Path) -> PathBuf {
    root.join(schemas::TRIGGER_DB_NAME)
}

pub fn promotion_db_path(root: &Path) -> PathBuf {
    root.join(schemas::PROMOTION_DB_NAME)
}

fn initialize(
    root: &Path,
    db_path: &Path,
    op: &str,
    statements: &[&str],
) -> Result<(), ChangeOpsError> {
    std::fs::create_dir_all(root).map_err(ChangeOpsError::IoError)?;
    let broker = DbBroker::new(root);
    broker.with_system_conn(db_path, op, |conn| {
        for stmt in statements {
            conn.execute(stmt, [])?;
        }
        Ok(())
    })
}

pub fn initialize_graph_db(root: &Path) -> Result<(), ChangeOpsError> {
    initialize(
        root,
        &graph_db_path(root),
        "graph.init",
        &[
            schemas::GRAPH_DB_SCHEMA_TENANTS,
            schemas::GRAPH_DB_SCHEMA_CHANGES,
            schemas::GRAPH_DB_SCHEMA_NODES,
            schemas::GRAPH_DB_SCHEMA_EDGES,
            schemas::GRAPH_DB_INDEX_NODES_KIND,
            schemas::GRAPH_DB_INDEX_EDGES_SRC,
        ],
    )
}

pub fn initialize_package_db(root: &Path) -> Result<(), ChangeOpsError> {
    initialize(
        root,
        &package_db_path(root),
        "package.init",
        &[
            schemas::PACKAGE_DB_SCHEMA_ENVIRONMENTS,
            schemas::PACKAGE_DB_SCHEMA_ENV_STATE,
            schemas::PACKAGE_DB_SCHEMA_OVERRIDES,
            schemas::PACKAGE_DB_INDEX_OVERRIDES_MODULE,
        ],
    )
}

pub fn initialize_draft_db(root: &Path) -> Result<(), ChangeOpsError> {
    initialize(
        root,
        &draft_db_path(root),
        "draft.init",
        &[
            schemas::DRAFT_DB_SCHEMA_DRAFTS,
            schemas::DRAFT_DB_SCHEMA_VERSIONS,
            schemas::DRAFT_DB_SCHEMA_VARIANTS,
            schemas::DRAFT_DB_INDEX_DRAFTS_PROJECT,
            schemas::DRAFT_DB_INDEX_VARIANTS_BATCH,
        ],
    )
}

pub fn initialize_workflow_db(root: &Path) -> Result<(), ChangeOpsError> {
    initialize(
        root,
        &workflow_db_path(root),
        "workflow.init",
        &[
            schemas::WORKFLOW_DB_SCHEMA_DEFINITIONS,
            schemas::WORKFLOW_DB_SCHEMA_STEPS,
            schemas::WORKFLOW_DB_SCHEMA_EXECUTIONS,
            schemas::WORKFLOW_DB_SCHEMA_STEP_EXECUTIONS,
            schemas::WORKFLOW_DB_INDEX_STEPS_DEFINITION,
            schemas::WORKFLOW_DB_INDEX_STEP_EXECUTIONS,
        ],
    )
}

pub fn initialize_trigger_db(root: &Path) -> Result<(), ChangeOpsError> {
    initialize(
        root,
        &trigger_db_path(root),
        "trigger.init",
        &[
            schemas::TRIGGER_DB_SCHEMA_TRIGGERS,
            schemas::TRIGGER_DB_SCHEMA_INTENTS,
            schemas::TRIGGER_DB_INDEX_INTENTS_STATUS,
            schemas::TRIGGER_DB_INDEX_INTENTS_KEY,
            schemas::TRIGGER_DB_INDEX_TRIGGERS_TYPE,
        ],
    )
}

pub fn initialize_promotion_db(root: &Path) -> Result<(), ChangeOpsError> {
    initialize(
        root,
        &promotion_db_path(root),
        "promotion.init",
        &[
            schemas::PROMOTION_DB_SCHEMA_INTENTS,
            schemas::PROMOTION_DB_INDEX_PROJECT,
        ],
    )
}

/// Initialize every subsystem database in parallel.
pub fn initialize_all(root: &Path) -> Result<(), ChangeOpsError> {
    let init_errors: Mutex<Vec<ChangeOpsError>> = Mutex::new(Vec::new());
    rayon::scope(|s| {
        let errs = &init_errors;
        s.spawn(|_| {
            if let Err(e) = initialize_graph_db(root) {
                errs.lock().unwrap().push(e);
            }
        });
        s.spawn(|_| {
            if let Err(e) = initialize_package_db(root) {
                errs.lock().unwrap().push(e);
            }
        });
        s.spawn(|_| {
            if let Err(e) = initialize_draft_db(root) {
                errs.lock().unwrap().push(e);
            }
        });
        s.spawn(|_| {
            if let Err(e) = initialize_workflow_db(root) {
                errs.lock().unwrap().push(e);
            }
        });
        s.spawn(|_| {
            if let Err(e) = initialize_trigger_db(root) {
                errs.lock().unwrap().push(e);
            }
        });
        s.spawn(|_| {
            if let Err(e) = initialize_promotion_db(root) {
                errs.lock().unwrap().push(e);
            }
        });
    });
    let errs = init_errors.into_inner().unwrap();
    if let Some(e) = errs.into_iter().next() {
        return Err(e);
    }
    Ok(())
}
