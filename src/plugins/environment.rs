//! Environments and installed package baselines.
//!
//! Each project carries a dev/test/prod pipeline. The installed baseline per
//! environment (`EnvPackageState`) is the materialized package the projector,
//! the promotion machine, and the override composer all read. Baseline writes
//! are optimistic: callers pass the row version they read and lose with
//! `CONFLICT` if someone got there first.

use crate::core::broker::DbBroker;
use crate::core::context::OpContext;
use crate::core::db;
use crate::core::error::ChangeOpsError;
use crate::core::package::{self, Package};
use crate::core::store::Store;
use crate::core::time;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

pub const ENV_DEV: &str = "dev";
pub const ENV_TEST: &str = "test";
pub const ENV_PROD: &str = "prod";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Environment {
    pub id: String,
    pub tenant_id: String,
    pub project_id: String,
    pub name: String,
    pub is_default: bool,
    pub requires_promotion_approval: bool,
    pub created_at: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EnvPackageState {
    pub environment_id: String,
    pub tenant_id: String,
    pub package_key: String,
    pub package_version: String,
    pub checksum: String,
    pub package: Package,
    /// Where the baseline came from: "draft-install" or "promotion".
    pub source: String,
    pub installed_at: String,
    pub row_version: i64,
}

pub struct EnvironmentStore<'a> {
    store: &'a Store,
    broker: DbBroker,
}

impl<'a> EnvironmentStore<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self {
            store,
            broker: DbBroker::new(&store.root),
        }
    }

    fn db_path(&self) -> std::path::PathBuf {
        db::package_db_path(&self.store.root)
    }

    /// Create the standard dev/test/prod pipeline for a project. Dev is the
    /// default target; prod requires promotion approval. Idempotent.
    pub fn ensure_pipeline(
        &self,
        ctx: &OpContext,
        project_id: &str,
    ) -> Result<Vec<Environment>, ChangeOpsError> {
        let project = project_id.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "environment.ensure", |conn| {
                for (name, is_default, requires_approval) in [
                    (ENV_DEV, true, false),
                    (ENV_TEST, false, false),
                    (ENV_PROD, false, true),
                ] {
                    let exists: Option<String> = conn
                        .query_row(
                            "SELECT id FROM environments
                             WHERE tenant_id = ?1 AND project_id = ?2 AND name = ?3",
                            params![ctx.tenant_id(), project, name],
                            |row| row.get(0),
                        )
                        .optional()?;
                    if exists.is_none() {
                        conn.execute(
                            "INSERT INTO environments
                             (id, tenant_id, project_id, name, is_default, requires_promotion_approval, created_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                            params![
                                time::new_event_id(),
                                ctx.tenant_id(),
                                project,
                                name,
                                is_default as i64,
                                requires_approval as i64,
                                time::now_epoch_z()
                            ],
                        )?;
                    }
                }
                list_environments(conn, ctx.tenant_id(), Some(&project))
            })
    }

    pub fn list(
        &self,
        ctx: &OpContext,
        project_id: Option<&str>,
    ) -> Result<Vec<Environment>, ChangeOpsError> {
        let project = project_id.map(|s| s.to_string());
        self.broker
            .with_conn(&self.db_path(), ctx, "environment.list", |conn| {
                list_environments(conn, ctx.tenant_id(), project.as_deref())
            })
    }

    pub fn get(&self, ctx: &OpContext, environment_id: &str) -> Result<Environment, ChangeOpsError> {
        let id = environment_id.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "environment.get", |conn| {
                read_environment(conn, ctx.tenant_id(), &id)?
                    .ok_or_else(|| ChangeOpsError::NotFound(format!("environment '{}' not found", id)))
            })
    }

    /// Default environment for a project (dev unless reconfigured).
    pub fn default_for_project(
        &self,
        ctx: &OpContext,
        project_id: &str,
    ) -> Result<Environment, ChangeOpsError> {
        let envs = self.ensure_pipeline(ctx, project_id)?;
        envs.into_iter()
            .find(|e| e.is_default)
            .ok_or_else(|| {
                ChangeOpsError::InvariantViolation(format!(
                    "project '{}' has no default environment",
                    project_id
                ))
            })
    }

    pub fn baseline(
        &self,
        ctx: &OpContext,
        environment_id: &str,
    ) -> Result<Option<EnvPackageState>, ChangeOpsError> {
        let id = environment_id.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "environment.baseline.get", |conn| {
                read_baseline(conn, ctx.tenant_id(), &id)
            })
    }

    /// Install a package as the environment's new baseline.
    ///
    /// `expected_row_version` is `None` for a first install and otherwise the
    /// row version the caller read; a mismatch is a `CONFLICT` and nothing is
    /// written.
    pub fn install_baseline(
        &self,
        ctx: &OpContext,
        environment_id: &str,
        package: &Package,
        source: &str,
        expected_row_version: Option<i64>,
    ) -> Result<EnvPackageState, ChangeOpsError> {
        let id = environment_id.to_string();
        let source = source.to_string();
        let checksum = package::checksum(package)?;
        let package_json = serde_json::to_string(package)
            .map_err(|e| ChangeOpsError::InvariantViolation(format!("package encode: {}", e)))?;
        let package_key = package.package_key.clone();
        let package_version = package.version.clone();

        self.broker
            .with_conn(&self.db_path(), ctx, "environment.baseline.install", |conn| {
                if read_environment(conn, ctx.tenant_id(), &id)?.is_none() {
                    return Err(ChangeOpsError::NotFound(format!(
                        "environment '{}' not found",
                        id
                    )));
                }
                let existing = read_baseline(conn, ctx.tenant_id(), &id)?;
                let now = time::now_epoch_z();
                match existing {
                    Some(state) => {
                        if let Some(expected) = expected_row_version {
                            if expected != state.row_version {
                                return Err(ChangeOpsError::Conflict(format!(
                                    "baseline for '{}' is at version {}, expected {}",
                                    id, state.row_version, expected
                                )));
                            }
                        } else {
                            return Err(ChangeOpsError::Conflict(format!(
                                "baseline for '{}' already exists; re-preview and pass its version",
                                id
                            )));
                        }
                        conn.execute(
                            "UPDATE env_package_state
                             SET package_key = ?1, package_version = ?2, checksum = ?3, package = ?4,
                                 source = ?5, installed_at = ?6, row_version = ?7
                             WHERE tenant_id = ?8 AND environment_id = ?9",
                            params![
                                package_key,
                                package_version,
                                checksum,
                                package_json,
                                source,
                                now,
                                state.row_version + 1,
                                ctx.tenant_id(),
                                id
                            ],
                        )?;
                    }
                    None => {
                        conn.execute(
                            "INSERT INTO env_package_state
                             (environment_id, tenant_id, package_key, package_version, checksum,
                              package, source, installed_at, row_version)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)",
                            params![
                                id,
                                ctx.tenant_id(),
                                package_key,
                                package_version,
                                checksum,
                                package_json,
                                source,
                                now
                            ],
                        )?;
                    }
                }
                read_baseline(conn, ctx.tenant_id(), &id)?.ok_or_else(|| {
                    ChangeOpsError::InvariantViolation(format!(
                        "baseline for '{}' vanished mid-install",
                        id
                    ))
                })
            })
    }
}

fn environment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Environment> {
    Ok(Environment {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        project_id: row.get(2)?,
        name: row.get(3)?,
        is_default: row.get::<_, i64>(4)? != 0,
        requires_promotion_approval: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
    })
}

fn list_environments(
    conn: &Connection,
    tenant_id: &str,
    project_id: Option<&str>,
) -> Result<Vec<Environment>, ChangeOpsError> {
    let mut sql = "SELECT id, tenant_id, project_id, name, is_default, requires_promotion_approval, created_at
         FROM environments WHERE tenant_id = ?1".to_string();
    if project_id.is_some() {
        sql.push_str(" AND project_id = ?2");
    }
    sql.push_str(" ORDER BY project_id, name");
    let mut stmt = conn.prepare(&sql)?;
    let rows = match project_id {
        Some(project) => stmt
            .query_map(params![tenant_id, project], environment_from_row)?
            .collect::<Result<Vec<_>, _>>()?,
        None => stmt
            .query_map(params![tenant_id], environment_from_row)?
            .collect::<Result<Vec<_>, _>>()?,
    };
    Ok(rows)
}

fn read_environment(
    conn: &Connection,
    tenant_id: &str,
    id: &str,
) -> Result<Option<Environment>, ChangeOpsError> {
    conn.query_row(
        "SELECT id, tenant_id, project_id, name, is_default, requires_promotion_approval, created_at
         FROM environments WHERE tenant_id = ?1 AND id = ?2",
        params![tenant_id, id],
        environment_from_row,
    )
    .optional()
    .map_err(ChangeOpsError::RusqliteError)
}

fn read_baseline(
    conn: &Connection,
    tenant_id: &str,
    environment_id: &str,
) -> Result<Option<EnvPackageState>, ChangeOpsError> {
    let row = conn
        .query_row(
            "SELECT environment_id, tenant_id, package_key, package_version, checksum, package,
                    source, installed_at, row_version
             FROM env_package_state WHERE tenant_id = ?1 AND environment_id = ?2",
            params![tenant_id, environment_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, i64>(8)?,
                ))
            },
        )
        .optional()?;
    let Some((
        environment_id,
        tenant_id,
        package_key,
        package_version,
        checksum,
        package_json,
        source,
        installed_at,
        row_version,
    )) = row
    else {
        return Ok(None);
    };
    let package: Package = serde_json::from_str(&package_json).map_err(|e| {
        ChangeOpsError::InvariantViolation(format!("corrupt baseline package: {}", e))
    })?;
    Ok(Some(EnvPackageState {
        environment_id,
        tenant_id,
        package_key,
        package_version,
        checksum,
        package,
        source,
        installed_at,
        row_version,
    }))
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "environment",
        "version": "1.0.0",
        "description": "Project environments and installed package baselines",
        "commands": [
            { "name": "ensure", "parameters": ["project_id"] },
            { "name": "list", "parameters": ["project_id"] },
            { "name": "baseline", "parameters": ["environment_id"] }
        ],
        "storage": ["package.db"]
    })
}
