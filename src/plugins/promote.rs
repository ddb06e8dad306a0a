//! Promotion state machine: governed moves of a package baseline from one
//! environment to another.
//!
//! ```text
//! draft ── preview ──▶ previewed ── approve ──▶ approved ── execute ──▶ executed
//!   │                    │                         │
//!   └───── reject ───────┴─────────── reject ──────┴──▶ rejected
//! ```
//!
//! All transitions are forward-only except `reject`, which is terminal from
//! any non-terminal state. Execute installs the source baseline into the
//! target under optimistic versioning and recomposes overrides; a conflict
//! flips the intent to `rejected` with the error recorded and touches
//! nothing else.

use crate::core::broker::{DbBroker, ENTITY_PROMOTION_INTENT, ENTITY_PULL_DOWN};
use crate::core::context::OpContext;
use crate::core::db;
use crate::core::diff::{self, PackageDiff};
use crate::core::error::ChangeOpsError;
use crate::core::package::Package;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::compose::OverrideStore;
use crate::plugins::environment::EnvironmentStore;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PromotionStatus {
    Draft,
    Previewed,
    Approved,
    Executed,
    Rejected,
}

impl PromotionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Previewed => "previewed",
            Self::Approved => "approved",
            Self::Executed => "executed",
            Self::Rejected => "rejected",
        }
    }

    fn parse(raw: &str) -> Result<Self, ChangeOpsError> {
        match raw {
            "draft" => Ok(Self::Draft),
            "previewed" => Ok(Self::Previewed),
            "approved" => Ok(Self::Approved),
            "executed" => Ok(Self::Executed),
            "rejected" => Ok(Self::Rejected),
            other => Err(ChangeOpsError::InvariantViolation(format!(
                "unknown promotion status '{}'",
                other
            ))),
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Executed | Self::Rejected)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PromotionIntent {
    pub id: String,
    pub tenant_id: String,
    pub project_id: String,
    pub from_environment_id: String,
    pub to_environment_id: String,
    pub status: PromotionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<PackageDiff>,
    /// Target baseline row version captured at preview; execute's optimistic
    /// expectation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_row_version: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_id: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    pub version: i64,
}

pub struct PromotionMachine {
    store: Store,
    broker: DbBroker,
}

impl PromotionMachine {
    pub fn new(store: &Store) -> Self {
        Self {
            store: store.clone(),
            broker: DbBroker::new(&store.root),
        }
    }

    fn db_path(&self) -> std::path::PathBuf {
        db::promotion_db_path(&self.store.root)
    }

    /// Create a promotion intent. Governed write; both environments must
    /// belong to the project and differ.
    pub fn create(
        &self,
        ctx: &OpContext,
        project_id: &str,
        from_environment_id: &str,
        to_environment_id: &str,
    ) -> Result<PromotionIntent, ChangeOpsError> {
        let change_id = ctx.require_governance("promotion.create")?.to_string();
        if from_environment_id == to_environment_id {
            return Err(ChangeOpsError::InvariantViolation(
                "promotion source and target environments must differ".to_string(),
            ));
        }
        let env_store = EnvironmentStore::new(&self.store);
        for env_id in [from_environment_id, to_environment_id] {
            let env = env_store.get(ctx, env_id)?;
            ctx.ensure_tenant(&env.tenant_id)?;
            if env.project_id != project_id {
                return Err(ChangeOpsError::InvariantViolation(format!(
                    "environment '{}' does not belong to project '{}'",
                    env_id, project_id
                )));
            }
        }

        let id = time::new_event_id();
        let project = project_id.to_string();
        let from_env = from_environment_id.to_string();
        let to_env = to_environment_id.to_string();
        let created_by = ctx.actor.id.clone();
        self.broker
            .with_conn(&self.db_path(), ctx, "promotion.create", |conn| {
                conn.execute(
                    "INSERT INTO promotion_intents
                     (id, tenant_id, project_id, from_environment_id, to_environment_id, status,
                      created_by, change_id, created_at, version)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'draft', ?6, ?7, ?8, 1)",
                    params![
                        id,
                        ctx.tenant_id(),
                        project,
                        from_env,
                        to_env,
                        created_by,
                        change_id,
                        time::now_epoch_z()
                    ],
                )?;
                Ok(())
            })?;
        self.broker.emit_entity_event(
            ctx,
            ENTITY_PROMOTION_INTENT,
            &id,
            "promotion.created",
            None,
        )?;
        self.get(ctx, &id)
    }

    pub fn get(&self, ctx: &OpContext, intent_id: &str) -> Result<PromotionIntent, ChangeOpsError> {
        let id = intent_id.to_string();
        let intent = self
            .broker
            .with_conn(&self.db_path(), ctx, "promotion.get", |conn| {
                read_intent(conn, ctx.tenant_id(), &id)
            })?
            .ok_or_else(|| {
                ChangeOpsError::NotFound(format!("promotion intent '{}' not found", id))
            })?;
        ctx.ensure_tenant(&intent.tenant_id)?;
        Ok(intent)
    }

    pub fn list(
        &self,
        ctx: &OpContext,
        project_id: Option<&str>,
    ) -> Result<Vec<PromotionIntent>, ChangeOpsError> {
        let project = project_id.map(|s| s.to_string());
        self.broker
            .with_conn(&self.db_path(), ctx, "promotion.list", |conn| {
                let mut sql =
                    String::from("SELECT id FROM promotion_intents WHERE tenant_id = ?1");
                if project.is_some() {
                    sql.push_str(" AND project_id = ?2");
                }
                sql.push_str(" ORDER BY created_at DESC, id DESC");
                let mut stmt = conn.prepare(&sql)?;
                let ids: Vec<String> = match &project {
                    Some(p) => stmt
                        .query_map(params![ctx.tenant_id(), p], |row| row.get(0))?
                        .collect::<Result<_, _>>()?,
                    None => stmt
                        .query_map(params![ctx.tenant_id()], |row| row.get(0))?
                        .collect::<Result<_, _>>()?,
                };
                let mut intents = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(intent) = read_intent(conn, ctx.tenant_id(), &id)? {
                        intents.push(intent);
                    }
                }
                Ok(intents)
            })
    }

    /// Preview: compute and store the source→target baseline diff.
    pub fn preview(&self, ctx: &OpContext, intent_id: &str) -> Result<PromotionIntent, ChangeOpsError> {
        let intent = self.get(ctx, intent_id)?;
        if !matches!(intent.status, PromotionStatus::Draft | PromotionStatus::Previewed) {
            return Err(ChangeOpsError::StateInvalid(format!(
                "promotion '{}' is {}, preview requires draft or previewed",
                intent_id,
                intent.status.as_str()
            )));
        }

        let delta = self.environment_diff(ctx, &intent.from_environment_id, &intent.to_environment_id)?;
        let diff_json = serde_json::to_string(&delta)
            .map_err(|e| ChangeOpsError::InvariantViolation(format!("diff encode: {}", e)))?;
        // Capture the target baseline version now; execute expects it to
        // still hold.
        let env_store = EnvironmentStore::new(&self.store);
        let target_row_version = env_store
            .baseline(ctx, &intent.to_environment_id)?
            .map(|b| b.row_version);
        let id = intent_id.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "promotion.preview", |conn| {
                conn.execute(
                    "UPDATE promotion_intents SET status = 'previewed', diff = ?1,
                     target_row_version = ?2, updated_at = ?3, version = version + 1
                     WHERE tenant_id = ?4 AND id = ?5",
                    params![
                        diff_json,
                        target_row_version,
                        time::now_epoch_z(),
                        ctx.tenant_id(),
                        id
                    ],
                )?;
                Ok(())
            })?;
        self.broker.emit_entity_event(
            ctx,
            ENTITY_PROMOTION_INTENT,
            intent_id,
            "promotion.previewed",
            Some(serde_json::to_value(&delta.summary).unwrap_or(JsonValue::Null)),
        )?;
        self.get(ctx, intent_id)
    }

    /// Approve: honors the target's approval flag; self-approval by the
    /// creator is an invariant violation.
    pub fn approve(&self, ctx: &OpContext, intent_id: &str) -> Result<PromotionIntent, ChangeOpsError> {
        let intent = self.get(ctx, intent_id)?;
        if intent.status != PromotionStatus::Previewed {
            return Err(ChangeOpsError::StateInvalid(format!(
                "promotion '{}' is {}, approve requires previewed",
                intent_id,
                intent.status.as_str()
            )));
        }
        let env_store = EnvironmentStore::new(&self.store);
        let target = env_store.get(ctx, &intent.to_environment_id)?;
        if target.requires_promotion_approval && ctx.actor.id == intent.created_by {
            return Err(ChangeOpsError::InvariantViolation(format!(
                "promotion '{}' cannot be approved by its creator '{}'",
                intent_id, intent.created_by
            )));
        }

        let id = intent_id.to_string();
        let approver = ctx.actor.id.clone();
        self.broker
            .with_conn(&self.db_path(), ctx, "promotion.approve", |conn| {
                conn.execute(
                    "UPDATE promotion_intents SET status = 'approved', approved_by = ?1,
                     updated_at = ?2, version = version + 1 WHERE tenant_id = ?3 AND id = ?4",
                    params![approver, time::now_epoch_z(), ctx.tenant_id(), id],
                )?;
                Ok(())
            })?;
        self.broker.emit_entity_event(
            ctx,
            ENTITY_PROMOTION_INTENT,
            intent_id,
            "promotion.approved",
            None,
        )?;
        self.get(ctx, intent_id)
    }

    /// Execute: install the source baseline into the target environment and
    /// recompose overrides. The baseline write is the single atomic step; a
    /// conflict rejects the intent with the error and leaves no partial
    /// state.
    pub fn execute(&self, ctx: &OpContext, intent_id: &str) -> Result<PromotionIntent, ChangeOpsError> {
        let intent = self.get(ctx, intent_id)?;
        if intent.status != PromotionStatus::Approved {
            return Err(ChangeOpsError::StateInvalid(format!(
                "promotion '{}' is {}, execute requires approved",
                intent_id,
                intent.status.as_str()
            )));
        }

        let env_store = EnvironmentStore::new(&self.store);
        let source = env_store
            .baseline(ctx, &intent.from_environment_id)?
            .ok_or_else(|| {
                ChangeOpsError::StateInvalid(format!(
                    "source environment '{}' has no installed baseline",
                    intent.from_environment_id
                ))
            })?;
        let install = env_store.install_baseline(
            ctx,
            &intent.to_environment_id,
            &source.package,
            "promotion",
            intent.target_row_version,
        );

        match install {
            Ok(installed) => {
                let override_store = OverrideStore::new(&self.store);
                let forms = override_store.compose_module(
                    ctx,
                    &intent.to_environment_id,
                    &installed.package_key,
                )?;
                let composition_errors: usize =
                    forms.iter().map(|f| f.composition_errors.len()).sum();
                let result = serde_json::json!({
                    "packageKey": installed.package_key,
                    "checksum": installed.checksum,
                    "baselineRowVersion": installed.row_version,
                    "compositionErrors": composition_errors,
                });
                let result_json = result.to_string();
                let id = intent_id.to_string();
                self.broker
                    .with_conn(&self.db_path(), ctx, "promotion.execute", |conn| {
                        conn.execute(
                            "UPDATE promotion_intents SET status = 'executed', result = ?1,
                             updated_at = ?2, version = version + 1
                             WHERE tenant_id = ?3 AND id = ?4",
                            params![result_json, time::now_epoch_z(), ctx.tenant_id(), id],
                        )?;
                        Ok(())
                    })?;
                let diff_summary = intent
                    .diff
                    .as_ref()
                    .map(|d| serde_json::to_value(&d.summary).unwrap_or(JsonValue::Null));
                self.broker.emit_entity_event(
                    ctx,
                    ENTITY_PROMOTION_INTENT,
                    intent_id,
                    "promotion.executed",
                    diff_summary,
                )?;
                self.get(ctx, intent_id)
            }
            Err(ChangeOpsError::Conflict(message)) => {
                let id = intent_id.to_string();
                let error = message.clone();
                self.broker
                    .with_conn(&self.db_path(), ctx, "promotion.execute", |conn| {
                        conn.execute(
                            "UPDATE promotion_intents SET status = 'rejected', error = ?1,
                             updated_at = ?2, version = version + 1
                             WHERE tenant_id = ?3 AND id = ?4",
                            params![error, time::now_epoch_z(), ctx.tenant_id(), id],
                        )?;
                        Ok(())
                    })?;
                self.broker.emit_entity_event(
                    ctx,
                    ENTITY_PROMOTION_INTENT,
                    intent_id,
                    "promotion.rejected",
                    None,
                )?;
                Err(ChangeOpsError::Conflict(message))
            }
            Err(other) => Err(other),
        }
    }

    /// Reject: terminal from any non-terminal state.
    pub fn reject(&self, ctx: &OpContext, intent_id: &str, reason: Option<&str>) -> Result<PromotionIntent, ChangeOpsError> {
        let intent = self.get(ctx, intent_id)?;
        if intent.status.is_terminal() {
            return Err(ChangeOpsError::StateInvalid(format!(
                "promotion '{}' is already {}",
                intent_id,
                intent.status.as_str()
            )));
        }
        let id = intent_id.to_string();
        let reason = reason.map(|s| s.to_string());
        self.broker
            .with_conn(&self.db_path(), ctx, "promotion.reject", |conn| {
                conn.execute(
                    "UPDATE promotion_intents SET status = 'rejected', error = ?1, updated_at = ?2,
                     version = version + 1 WHERE tenant_id = ?3 AND id = ?4",
                    params![reason, time::now_epoch_z(), ctx.tenant_id(), id],
                )?;
                Ok(())
            })?;
        self.broker.emit_entity_event(
            ctx,
            ENTITY_PROMOTION_INTENT,
            intent_id,
            "promotion.rejected",
            None,
        )?;
        self.get(ctx, intent_id)
    }

    /// Refresh a lower environment from a higher one without the approval
    /// machine: copy the source baseline into the target under optimistic
    /// versioning. Governed write; the usual route for syncing dev after a
    /// prod promotion.
    pub fn pull_down(
        &self,
        ctx: &OpContext,
        from_environment_id: &str,
        to_environment_id: &str,
    ) -> Result<crate::plugins::environment::EnvPackageState, ChangeOpsError> {
        ctx.require_governance("promotion.pull_down")?;
        if from_environment_id == to_environment_id {
            return Err(ChangeOpsError::InvariantViolation(
                "pull-down source and target environments must differ".to_string(),
            ));
        }
        let env_store = EnvironmentStore::new(&self.store);
        let source = env_store.baseline(ctx, from_environment_id)?.ok_or_else(|| {
            ChangeOpsError::StateInvalid(format!(
                "source environment '{}' has no installed baseline",
                from_environment_id
            ))
        })?;
        let target = env_store.baseline(ctx, to_environment_id)?;
        let installed = env_store.install_baseline(
            ctx,
            to_environment_id,
            &source.package,
            "pull-down",
            target.map(|b| b.row_version),
        )?;
        self.broker.emit_entity_event(
            ctx,
            ENTITY_PULL_DOWN,
            to_environment_id,
            "environment.pulled_down",
            None,
        )?;
        Ok(installed)
    }

    /// Diff between two environments' installed baselines. Missing baselines
    /// diff as empty packages.
    pub fn environment_diff(
        &self,
        ctx: &OpContext,
        from_environment_id: &str,
        to_environment_id: &str,
    ) -> Result<PackageDiff, ChangeOpsError> {
        let env_store = EnvironmentStore::new(&self.store);
        let source = env_store.baseline(ctx, from_environment_id)?;
        let target = env_store.baseline(ctx, to_environment_id)?;
        let source_key = source
            .as_ref()
            .map(|s| s.package_key.clone())
            .or_else(|| target.as_ref().map(|t| t.package_key.clone()))
            .unwrap_or_default();
        let source_package = source
            .map(|s| s.package)
            .unwrap_or_else(|| Package::empty(&source_key));
        let target_package = target
            .map(|t| t.package)
            .unwrap_or_else(|| Package::empty(&source_key));
        Ok(diff::diff(&source_package, &target_package))
    }

    /// Lightweight drift report: for every environment of a project, whether
    /// its baseline checksum differs from the default environment's latest
    /// install.
    pub fn environment_drift(
        &self,
        ctx: &OpContext,
        project_id: &str,
    ) -> Result<BTreeMap<String, bool>, ChangeOpsError> {
        let env_store = EnvironmentStore::new(&self.store);
        let environments = env_store.list(ctx, Some(project_id))?;
        let reference = environments
            .iter()
            .find(|e| e.is_default)
            .map(|e| env_store.baseline(ctx, &e.id))
            .transpose()?
            .flatten();
        let reference_checksum = reference.map(|b| b.checksum);

        let mut report = BTreeMap::new();
        for env in environments {
            let baseline = env_store.baseline(ctx, &env.id)?;
            let has_drift = match (&reference_checksum, baseline) {
                (Some(reference), Some(baseline)) => baseline.checksum != *reference,
                (Some(_), None) => true,
                (None, Some(_)) => true,
                (None, None) => false,
            };
            report.insert(env.id, has_drift);
        }
        Ok(report)
    }
}

fn read_intent(
    conn: &Connection,
    tenant_id: &str,
    id: &str,
) -> Result<Option<PromotionIntent>, ChangeOpsError> {
    let row = conn
        .query_row(
            "SELECT id, tenant_id, project_id, from_environment_id, to_environment_id, status,
                    diff, target_row_version, result, error, created_by, approved_by, change_id,
                    created_at, updated_at, version
             FROM promotion_intents WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<i64>>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, String>(10)?,
                    row.get::<_, Option<String>>(11)?,
                    row.get::<_, Option<String>>(12)?,
                    row.get::<_, String>(13)?,
                    row.get::<_, Option<String>>(14)?,
                    row.get::<_, i64>(15)?,
                ))
            },
        )
        .optional()?;
    let Some((id, tenant_id, project_id, from_environment_id, to_environment_id, status_raw, diff_json, target_row_version, result_json, error, created_by, approved_by, change_id, created_at, updated_at, version)) =
        row
    else {
        return Ok(None);
    };
    Ok(Some(PromotionIntent {
        id,
        tenant_id,
        project_id,
        from_environment_id,
        to_environment_id,
        status: PromotionStatus::parse(&status_raw)?,
        diff: diff_json
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|e| {
                    ChangeOpsError::InvariantViolation(format!("corrupt promotion diff: {}", e))
                })
            })
            .transpose()?,
        target_row_version,
        result: result_json
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|e| {
                    ChangeOpsError::InvariantViolation(format!("corrupt promotion result: {}", e))
                })
            })
            .transpose()?,
        error,
        created_by,
        approved_by,
        change_id,
        created_at,
        updated_at,
        version,
    }))
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "promotion",
        "version": "1.0.0",
        "description": "Governed baseline promotion between environments",
        "commands": [
            { "name": "create", "parameters": ["project", "from", "to"] },
            { "name": "preview", "parameters": ["id"] },
            { "name": "approve", "parameters": ["id"] },
            { "name": "execute", "parameters": ["id"] },
            { "name": "reject", "parameters": ["id", "reason"] },
            { "name": "pull-down", "parameters": ["from", "to"] },
            { "name": "diff", "parameters": ["from", "to"] },
            { "name": "drift", "parameters": ["project"] }
        ],
        "storage": ["promotion.db"]
    })
}
