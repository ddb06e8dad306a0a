//! Tenant registry and change records.
//!
//! Tenants are the isolation boundary for everything else; changes are the
//! governance anchors that governed writes reference by id. A workflow
//! definition may only activate while its linked change is `ready` or
//! `merged`.

use crate::core::broker::{DbBroker, ENTITY_CHANGE};
use crate::core::context::OpContext;
use crate::core::db;
use crate::core::error::ChangeOpsError;
use crate::core::store::Store;
use crate::core::time;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub created_at: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Draft,
    Ready,
    Merged,
}

impl ChangeStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Ready => "ready",
            Self::Merged => "merged",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ChangeOpsError> {
        match raw {
            "draft" => Ok(Self::Draft),
            "ready" => Ok(Self::Ready),
            "merged" => Ok(Self::Merged),
            other => Err(ChangeOpsError::InvariantViolation(format!(
                "unknown change status '{}'",
                other
            ))),
        }
    }

    /// Governed activations require the change to be past review.
    pub fn allows_activation(&self) -> bool {
        matches!(self, Self::Ready | Self::Merged)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub id: String,
    pub tenant_id: String,
    pub title: String,
    pub status: ChangeStatus,
    pub created_by: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

pub struct TenantStore<'a> {
    store: &'a Store,
    broker: DbBroker,
}

impl<'a> TenantStore<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self {
            store,
            broker: DbBroker::new(&store.root),
        }
    }

    fn db_path(&self) -> std::path::PathBuf {
        db::graph_db_path(&self.store.root)
    }

    /// Tenant creation sits above the tenant middleware; any context may call
    /// it, but the id must be fresh.
    pub fn add_tenant(&self, ctx: &OpContext, id: &str, name: &str) -> Result<Tenant, ChangeOpsError> {
        let tenant_id = id.to_string();
        let tenant_name = name.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "tenant.add", |conn| {
                let exists: Option<String> = conn
                    .query_row(
                        "SELECT id FROM tenants WHERE id = ?1",
                        params![tenant_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                if exists.is_some() {
                    return Err(ChangeOpsError::StateInvalid(format!(
                        "tenant '{}' already exists",
                        tenant_id
                    )));
                }
                let created_at = time::now_epoch_z();
                conn.execute(
                    "INSERT INTO tenants (id, name, created_at) VALUES (?1, ?2, ?3)",
                    params![tenant_id, tenant_name, created_at],
                )?;
                Ok(Tenant {
                    id: tenant_id.clone(),
                    name: tenant_name.clone(),
                    created_at,
                })
            })
    }

    pub fn list_tenants(&self, ctx: &OpContext) -> Result<Vec<Tenant>, ChangeOpsError> {
        self.broker
            .with_conn(&self.db_path(), ctx, "tenant.list", |conn| {
                let mut stmt =
                    conn.prepare("SELECT id, name, created_at FROM tenants ORDER BY id")?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(Tenant {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            created_at: row.get(2)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
    }

    pub fn add_change(&self, ctx: &OpContext, title: &str) -> Result<ChangeRecord, ChangeOpsError> {
        let id = time::new_event_id();
        let change_title = title.to_string();
        let created_by = ctx.actor.id.clone();
        self.broker
            .with_conn(&self.db_path(), ctx, "change.add", |conn| {
                conn.execute(
                    "INSERT INTO changes (id, tenant_id, title, status, created_by, created_at)
                     VALUES (?1, ?2, ?3, 'draft', ?4, ?5)",
                    params![
                        id,
                        ctx.tenant_id(),
                        change_title,
                        created_by,
                        time::now_epoch_z()
                    ],
                )?;
                Ok(())
            })?;
        self.broker
            .emit_entity_event(ctx, ENTITY_CHANGE, &id, "change.created", None)?;
        self.get_change(ctx, &id)
    }

    pub fn get_change(&self, ctx: &OpContext, change_id: &str) -> Result<ChangeRecord, ChangeOpsError> {
        let id = change_id.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "change.get", |conn| {
                let row = conn
                    .query_row(
                        "SELECT id, tenant_id, title, status, created_by, created_at, updated_at
                         FROM changes WHERE tenant_id = ?1 AND id = ?2",
                        params![ctx.tenant_id(), id],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, String>(1)?,
                                row.get::<_, String>(2)?,
                                row.get::<_, String>(3)?,
                                row.get::<_, String>(4)?,
                                row.get::<_, String>(5)?,
                                row.get::<_, Option<String>>(6)?,
                            ))
                        },
                    )
                    .optional()?;
                let Some((id, tenant_id, title, status_raw, created_by, created_at, updated_at)) =
                    row
                else {
                    return Err(ChangeOpsError::NotFound(format!(
                        "change '{}' not found",
                        id
                    )));
                };
                Ok(ChangeRecord {
                    id,
                    tenant_id,
                    title,
                    status: ChangeStatus::parse(&status_raw)?,
                    created_by,
                    created_at,
                    updated_at,
                })
            })
    }

    pub fn set_change_status(
        &self,
        ctx: &OpContext,
        change_id: &str,
        status: ChangeStatus,
    ) -> Result<ChangeRecord, ChangeOpsError> {
        let current = self.get_change(ctx, change_id)?;
        ctx.ensure_tenant(&current.tenant_id)?;
        // Forward-only: draft → ready → merged.
        let legal = matches!(
            (current.status, status),
            (ChangeStatus::Draft, ChangeStatus::Ready) | (ChangeStatus::Ready, ChangeStatus::Merged)
        );
        if !legal {
            return Err(ChangeOpsError::StateInvalid(format!(
                "change '{}' cannot move {} -> {}",
                change_id,
                current.status.as_str(),
                status.as_str()
            )));
        }
        let id = change_id.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "change.status", |conn| {
                conn.execute(
                    "UPDATE changes SET status = ?1, updated_at = ?2
                     WHERE tenant_id = ?3 AND id = ?4",
                    params![status.as_str(), time::now_epoch_z(), ctx.tenant_id(), id],
                )?;
                Ok(())
            })?;
        self.broker.emit_entity_event(
            ctx,
            ENTITY_CHANGE,
            change_id,
            &format!("change.{}", status.as_str()),
            None,
        )?;
        self.get_change(ctx, change_id)
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "tenant",
        "version": "1.0.0",
        "description": "Tenant registry and governance change records",
        "commands": [
            { "name": "add", "parameters": ["id", "name"] },
            { "name": "list", "parameters": [] },
            { "name": "change-add", "parameters": ["title"] },
            { "name": "change-ready", "parameters": ["id"] },
            { "name": "change-merge", "parameters": ["id"] }
        ],
        "storage": ["graph.db"]
    })
}
