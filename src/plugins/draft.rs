//! Draft engine: prompt-to-package drafts with version history, variants,
//! and streaming preview.
//!
//! A draft is the mutable working copy of a package, bound to a project and
//! a target environment. Every mutation appends to an append-only version
//! log (dense, 1-based) and never rewrites an existing version. Generation
//! runs a producer/validate/repair loop with a bounded repair budget;
//! preview computes the diff against the environment baseline; install
//! writes the baseline under optimistic versioning and recomposes overrides.
//!
//! Streaming surfaces are lazy event sequences over a bounded
//! `std::sync::mpsc` channel: the generator thread pushes stage events, the
//! consumer drains them, cancellation closes the stream with an `error`
//! event carrying `"canceled"`.

use crate::core::broker::{DbBroker, ENTITY_DRAFT};
use crate::core::context::OpContext;
use crate::core::db;
use crate::core::diff::{self, PackageDiff, PlanOp};
use crate::core::error::{ChangeOpsError, ValidationIssue};
use crate::core::package::{self, DraftPatchOp, Field, Package};
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::compose::OverrideStore;
use crate::plugins::environment::EnvironmentStore;
use crate::plugins::producer::{PackageProducer, ProduceRequest};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread;

/// Repair budget for one generation: the producer sees its own validation
/// fallout at most this many times.
pub const MAX_REPAIR_ROUNDS: u32 = 3;

const STREAM_CHANNEL_BOUND: usize = 64;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    Draft,
    Previewed,
    Installed,
    Discarded,
}

impl DraftStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Previewed => "previewed",
            Self::Installed => "installed",
            Self::Discarded => "discarded",
        }
    }

    fn parse(raw: &str) -> Result<Self, ChangeOpsError> {
        match raw {
            "draft" => Ok(Self::Draft),
            "previewed" => Ok(Self::Previewed),
            "installed" => Ok(Self::Installed),
            "discarded" => Ok(Self::Discarded),
            other => Err(ChangeOpsError::InvariantViolation(format!(
                "unknown draft status '{}'",
                other
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VersionReason {
    Create,
    Refine,
    Patch,
    Restore,
    CreateVariant,
    AdoptVariant,
}

impl VersionReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Refine => "refine",
            Self::Patch => "patch",
            Self::Restore => "restore",
            Self::CreateVariant => "create_variant",
            Self::AdoptVariant => "adopt_variant",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Draft {
    pub id: String,
    pub tenant_id: String,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<String>,
    pub status: DraftStatus,
    pub prompt: String,
    pub package: Package,
    pub checksum: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_preview_diff: Option<PackageDiff>,
    pub last_preview_errors: Vec<ValidationIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    /// Optimistic row version; bumped on every write.
    pub version: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DraftVersion {
    pub draft_id: String,
    pub version_number: i64,
    pub reason: VersionReason,
    pub package: Package,
    pub checksum: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_diff: Option<PackageDiff>,
    pub preview_errors: Vec<ValidationIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    pub created_at: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DraftVariant {
    pub id: String,
    pub tenant_id: String,
    pub project_id: String,
    pub batch_id: String,
    pub variant_index: usize,
    pub prompt: String,
    pub package: Package,
    pub checksum: String,
    pub created_at: String,
}

/// Outcome of one generation (or repair) pipeline run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepairResult {
    pub package: Package,
    pub checksum: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<PackageDiff>,
    pub validation_errors: Vec<ValidationIssue>,
    /// Producer rounds consumed, including the initial generation.
    pub attempts: u32,
    pub success: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstallResult {
    pub environment_id: String,
    pub package_key: String,
    pub checksum: String,
    pub baseline_row_version: i64,
    pub plan: Vec<PlanOp>,
    pub composition_errors: Vec<ValidationIssue>,
}

pub struct DraftEngine {
    store: Store,
    broker: DbBroker,
    producer: Arc<dyn PackageProducer>,
}

impl DraftEngine {
    pub fn new(store: &Store, producer: Arc<dyn PackageProducer>) -> Self {
        Self {
            store: store.clone(),
            broker: DbBroker::new(&store.root),
            producer,
        }
    }

    fn db_path(&self) -> std::path::PathBuf {
        db::draft_db_path(&self.store.root)
    }

    // --- Generation pipeline ---

    /// Run producer → validate → repair, up to [`MAX_REPAIR_ROUNDS`] repair
    /// rounds. Validation errors are recovered locally; every other error
    /// kind aborts and surfaces.
    fn run_pipeline(
        &self,
        prompt: &str,
        app_name: Option<&str>,
        seed: Option<Package>,
        mut observer: Option<&mut dyn FnMut(StreamEvent)>,
        tokens: bool,
    ) -> Result<RepairResult, ChangeOpsError> {
        let mut request = ProduceRequest::new(prompt, app_name);
        request.seed = seed;

        let mut emit = |event: StreamEvent| {
            if let Some(observer) = observer.as_deref_mut() {
                observer(event);
            }
        };

        emit(StreamEvent::stage(StreamStage::Generation));
        let mut candidate = if tokens {
            let mut sink_events: Vec<StreamEvent> = Vec::new();
            let produced = self.producer.produce_with_tokens(&request, &mut |token| {
                sink_events.push(StreamEvent::token(token));
            })?;
            for event in sink_events {
                emit(event);
            }
            produced
        } else {
            self.producer.produce(&request)?
        };

        let mut issues = package::validate(&candidate);
        let mut attempts: u32 = 1;
        emit(StreamEvent::stage(StreamStage::Validation).with_payload(serde_json::json!({
            "errors": issues.len()
        })));

        let mut round: u32 = 0;
        while !issues.is_empty() && round < MAX_REPAIR_ROUNDS {
            round += 1;
            emit(
                StreamEvent::stage(StreamStage::Repair)
                    .with_payload(serde_json::json!({ "round": round })),
            );
            request.seed = Some(candidate);
            request.issues = issues.clone();
            candidate = self.producer.produce(&request)?;
            issues = package::validate(&candidate);
            attempts += 1;
        }

        Ok(RepairResult {
            checksum: package::checksum(&candidate)?,
            package: candidate,
            diff: None,
            validation_errors: issues.clone(),
            attempts,
            success: issues.is_empty(),
        })
    }

    /// Generate a new draft from a prompt. The draft lands in `draft` status
    /// with version 1 (`create`) regardless of residual validation errors;
    /// install is what refuses broken packages.
    pub fn generate(
        &self,
        ctx: &OpContext,
        project_id: &str,
        environment_id: Option<&str>,
        prompt: &str,
        app_name: Option<&str>,
    ) -> Result<(Draft, RepairResult), ChangeOpsError> {
        let result = self.run_pipeline(prompt, app_name, None, None, false)?;

        let env_id = match environment_id {
            Some(id) => Some(id.to_string()),
            None => {
                let env_store = EnvironmentStore::new(&self.store);
                Some(env_store.default_for_project(ctx, project_id)?.id)
            }
        };

        let draft_id = time::new_event_id();
        let now = time::now_epoch_z();
        let package_json = encode(&result.package)?;
        let errors_json = encode(&result.validation_errors)?;
        let project = project_id.to_string();
        let prompt_owned = prompt.to_string();
        let created_by = ctx.actor.id.clone();
        let checksum = result.checksum.clone();

        self.broker
            .with_conn(&self.db_path(), ctx, "draft.generate", |conn| {
                conn.execute(
                    "INSERT INTO drafts
                     (id, tenant_id, project_id, environment_id, status, prompt, package, checksum,
                      last_preview_errors, created_by, created_at, updated_at, version)
                     VALUES (?1, ?2, ?3, ?4, 'draft', ?5, ?6, ?7, ?8, ?9, ?10, ?10, 1)",
                    params![
                        draft_id,
                        ctx.tenant_id(),
                        project,
                        env_id,
                        prompt_owned,
                        package_json,
                        checksum,
                        errors_json,
                        created_by,
                        now
                    ],
                )?;
                append_version(
                    conn,
                    ctx,
                    &draft_id,
                    VersionReason::Create,
                    &package_json,
                    &checksum,
                    None,
                    &errors_json,
                )?;
                Ok(())
            })?;

        self.broker
            .emit_entity_event(ctx, ENTITY_DRAFT, &draft_id, "draft.generated", None)?;
        Ok((self.get(ctx, &draft_id)?, result))
    }

    pub fn get(&self, ctx: &OpContext, draft_id: &str) -> Result<Draft, ChangeOpsError> {
        let id = draft_id.to_string();
        let draft = self
            .broker
            .with_conn(&self.db_path(), ctx, "draft.get", |conn| {
                read_draft(conn, ctx.tenant_id(), &id)
            })?
            .ok_or_else(|| ChangeOpsError::NotFound(format!("draft '{}' not found", id)))?;
        ctx.ensure_tenant(&draft.tenant_id)?;
        Ok(draft)
    }

    pub fn list(&self, ctx: &OpContext, project_id: Option<&str>) -> Result<Vec<Draft>, ChangeOpsError> {
        let project = project_id.map(|s| s.to_string());
        self.broker
            .with_conn(&self.db_path(), ctx, "draft.list", |conn| {
                let mut sql = String::from(
                    "SELECT id FROM drafts WHERE tenant_id = ?1",
                );
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
                let mut drafts = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(draft) = read_draft(conn, ctx.tenant_id(), &id)? {
                        drafts.push(draft);
                    }
                }
                Ok(drafts)
            })
    }

    /// Re-run generation seeded with the current package and a new prompt.
    /// Appends a `refine` version; existing versions are never touched.
    pub fn refine(
        &self,
        ctx: &OpContext,
        draft_id: &str,
        prompt: &str,
        expected_version: Option<i64>,
    ) -> Result<(Draft, RepairResult), ChangeOpsError> {
        let draft = self.get(ctx, draft_id)?;
        require_mutable(&draft)?;

        let result = self.run_pipeline(prompt, None, Some(draft.package.clone()), None, false)?;
        let package_json = encode(&result.package)?;
        let errors_json = encode(&result.validation_errors)?;
        let checksum = result.checksum.clone();
        let id = draft_id.to_string();
        let prompt_owned = prompt.to_string();

        self.broker
            .with_conn(&self.db_path(), ctx, "draft.refine", |conn| {
                update_draft_package(
                    conn,
                    ctx,
                    &id,
                    &prompt_owned,
                    &package_json,
                    &checksum,
                    &errors_json,
                    expected_version,
                )?;
                append_version(
                    conn,
                    ctx,
                    &id,
                    VersionReason::Refine,
                    &package_json,
                    &checksum,
                    None,
                    &errors_json,
                )?;
                Ok(())
            })?;
        self.broker
            .emit_entity_event(ctx, ENTITY_DRAFT, draft_id, "draft.refined", None)?;
        Ok((self.get(ctx, draft_id)?, result))
    }

    /// Apply an explicit patch batch, all-or-nothing. A failing op rejects
    /// the whole batch, leaves the draft untouched, and appends no version.
    pub fn patch(
        &self,
        ctx: &OpContext,
        draft_id: &str,
        ops: &[DraftPatchOp],
        expected_version: Option<i64>,
    ) -> Result<Draft, ChangeOpsError> {
        let draft = self.get(ctx, draft_id)?;
        require_mutable(&draft)?;

        let patched = package::apply_ops(&draft.package, ops)?;
        let checksum = package::checksum(&patched)?;
        let package_json = encode(&patched)?;
        let errors_json = encode(&Vec::<ValidationIssue>::new())?;
        let id = draft_id.to_string();
        let prompt = draft.prompt.clone();

        self.broker
            .with_conn(&self.db_path(), ctx, "draft.patch", |conn| {
                update_draft_package(
                    conn,
                    ctx,
                    &id,
                    &prompt,
                    &package_json,
                    &checksum,
                    &errors_json,
                    expected_version,
                )?;
                append_version(
                    conn,
                    ctx,
                    &id,
                    VersionReason::Patch,
                    &package_json,
                    &checksum,
                    None,
                    &errors_json,
                )?;
                Ok(())
            })?;
        self.broker
            .emit_entity_event(ctx, ENTITY_DRAFT, draft_id, "draft.patched", None)?;
        self.get(ctx, draft_id)
    }

    /// Compute the diff against the target environment's baseline and stash
    /// it with the validation errors. Transitions `draft → previewed`;
    /// idempotent when the checksum has not moved.
    pub fn preview(&self, ctx: &OpContext, draft_id: &str) -> Result<Draft, ChangeOpsError> {
        let draft = self.get(ctx, draft_id)?;
        require_mutable(&draft)?;

        let env_id = self.target_environment(ctx, &draft)?;
        let env_store = EnvironmentStore::new(&self.store);
        let baseline = env_store.baseline(ctx, &env_id)?;
        let baseline_package = baseline
            .as_ref()
            .map(|b| b.package.clone())
            .unwrap_or_else(|| Package::empty(&draft.package.package_key));

        let preview_diff = diff::diff(&baseline_package, &draft.package);
        let issues = package::validate(&draft.package);

        let diff_json = encode(&preview_diff)?;
        let errors_json = encode(&issues)?;
        let id = draft_id.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "draft.preview", |conn| {
                conn.execute(
                    "UPDATE drafts SET status = 'previewed', last_preview_diff = ?1,
                     last_preview_errors = ?2, updated_at = ?3, version = version + 1
                     WHERE tenant_id = ?4 AND id = ?5",
                    params![diff_json, errors_json, time::now_epoch_z(), ctx.tenant_id(), id],
                )?;
                Ok(())
            })?;
        self.broker.emit_entity_event(
            ctx,
            ENTITY_DRAFT,
            draft_id,
            "draft.previewed",
            Some(serde_json::to_value(&preview_diff.summary).unwrap_or(JsonValue::Null)),
        )?;
        self.get(ctx, draft_id)
    }

    /// Install the draft's package as the environment baseline. Governed
    /// write; refuses drafts with residual validation errors or a status
    /// outside `{draft, previewed}`. A baseline conflict surfaces as
    /// `CONFLICT` and the caller re-previews.
    pub fn install(
        &self,
        ctx: &OpContext,
        draft_id: &str,
    ) -> Result<(Draft, InstallResult), ChangeOpsError> {
        ctx.require_governance("draft.install")?;
        let draft = self.get(ctx, draft_id)?;
        require_mutable(&draft)?;

        let issues = package::validate(&draft.package);
        if !issues.is_empty() {
            return Err(ChangeOpsError::Validation(issues));
        }
        if !draft.last_preview_errors.is_empty() {
            return Err(ChangeOpsError::Validation(draft.last_preview_errors.clone()));
        }

        let env_id = self.target_environment(ctx, &draft)?;
        let env_store = EnvironmentStore::new(&self.store);
        let baseline = env_store.baseline(ctx, &env_id)?;
        let baseline_package = baseline.as_ref().map(|b| b.package.clone());
        let expected_row_version = baseline.as_ref().map(|b| b.row_version);

        let plan = diff::project(&draft.package, baseline_package.as_ref());
        let installed = env_store.install_baseline(
            ctx,
            &env_id,
            &draft.package,
            "draft-install",
            expected_row_version,
        )?;

        // Recompose tenant overrides against the new baseline; drift shows up
        // as composition errors, not as an install failure.
        let override_store = OverrideStore::new(&self.store);
        let forms = override_store.compose_module(ctx, &env_id, &draft.package.package_key)?;
        let composition_errors: Vec<ValidationIssue> = forms
            .into_iter()
            .flat_map(|f| f.composition_errors)
            .collect();

        let id = draft_id.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "draft.install", |conn| {
                conn.execute(
                    "UPDATE drafts SET status = 'installed', updated_at = ?1, version = version + 1
                     WHERE tenant_id = ?2 AND id = ?3",
                    params![time::now_epoch_z(), ctx.tenant_id(), id],
                )?;
                Ok(())
            })?;
        let diff_summary = draft
            .last_preview_diff
            .as_ref()
            .map(|d| serde_json::to_value(&d.summary).unwrap_or(JsonValue::Null));
        self.broker
            .emit_entity_event(ctx, ENTITY_DRAFT, draft_id, "draft.installed", diff_summary)?;

        let result = InstallResult {
            environment_id: env_id,
            package_key: installed.package_key.clone(),
            checksum: installed.checksum.clone(),
            baseline_row_version: installed.row_version,
            plan,
            composition_errors,
        };
        Ok((self.get(ctx, draft_id)?, result))
    }

    /// Terminal and irreversible.
    pub fn discard(&self, ctx: &OpContext, draft_id: &str) -> Result<Draft, ChangeOpsError> {
        let draft = self.get(ctx, draft_id)?;
        if draft.status == DraftStatus::Discarded {
            return Err(ChangeOpsError::StateInvalid(format!(
                "draft '{}' is already discarded",
                draft_id
            )));
        }
        let id = draft_id.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "draft.discard", |conn| {
                conn.execute(
                    "UPDATE drafts SET status = 'discarded', updated_at = ?1, version = version + 1
                     WHERE tenant_id = ?2 AND id = ?3",
                    params![time::now_epoch_z(), ctx.tenant_id(), id],
                )?;
                Ok(())
            })?;
        self.broker
            .emit_entity_event(ctx, ENTITY_DRAFT, draft_id, "draft.discarded", None)?;
        self.get(ctx, draft_id)
    }

    pub fn list_versions(
        &self,
        ctx: &OpContext,
        draft_id: &str,
    ) -> Result<Vec<DraftVersion>, ChangeOpsError> {
        self.get(ctx, draft_id)?;
        let id = draft_id.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "draft.versions", |conn| {
                read_versions(conn, ctx.tenant_id(), &id)
            })
    }

    pub fn get_version(
        &self,
        ctx: &OpContext,
        draft_id: &str,
        version_number: i64,
    ) -> Result<DraftVersion, ChangeOpsError> {
        let versions = self.list_versions(ctx, draft_id)?;
        versions
            .into_iter()
            .find(|v| v.version_number == version_number)
            .ok_or_else(|| {
                ChangeOpsError::NotFound(format!(
                    "draft '{}' has no version {}",
                    draft_id, version_number
                ))
            })
    }

    /// Copy version `n`'s package back into the draft and append a `restore`
    /// version whose checksum equals version `n`'s.
    pub fn restore_version(
        &self,
        ctx: &OpContext,
        draft_id: &str,
        version_number: i64,
    ) -> Result<Draft, ChangeOpsError> {
        let draft = self.get(ctx, draft_id)?;
        require_mutable(&draft)?;
        let version = self.get_version(ctx, draft_id, version_number)?;

        let package_json = encode(&version.package)?;
        let errors_json = encode(&version.preview_errors)?;
        let checksum = version.checksum.clone();
        let id = draft_id.to_string();
        let prompt = draft.prompt.clone();

        self.broker
            .with_conn(&self.db_path(), ctx, "draft.restore", |conn| {
                update_draft_package(
                    conn,
                    ctx,
                    &id,
                    &prompt,
                    &package_json,
                    &checksum,
                    &errors_json,
                    None,
                )?;
                append_version(
                    conn,
                    ctx,
                    &id,
                    VersionReason::Restore,
                    &package_json,
                    &checksum,
                    None,
                    &errors_json,
                )?;
                Ok(())
            })?;
        self.broker
            .emit_entity_event(ctx, ENTITY_DRAFT, draft_id, "draft.restored", None)?;
        self.get(ctx, draft_id)
    }

    pub fn diff_versions(
        &self,
        ctx: &OpContext,
        draft_id: &str,
        from: i64,
        to: i64,
    ) -> Result<PackageDiff, ChangeOpsError> {
        let a = self.get_version(ctx, draft_id, from)?;
        let b = self.get_version(ctx, draft_id, to)?;
        Ok(diff::diff(&a.package, &b.package))
    }

    // --- Variants ---

    /// Produce `count` independent candidate packages for a prompt. Each
    /// variant is a deterministic elaboration of the base candidate.
    pub fn generate_multi(
        &self,
        ctx: &OpContext,
        project_id: &str,
        prompt: &str,
        count: usize,
    ) -> Result<Vec<DraftVariant>, ChangeOpsError> {
        let count = count.clamp(1, 8);
        let batch_id = time::new_event_id();
        let mut variants = Vec::with_capacity(count);

        for index in 0..count {
            let base = self
                .producer
                .produce(&ProduceRequest::new(prompt, None))?;
            let candidate = variant_candidate(base, index);
            let checksum = package::checksum(&candidate)?;
            let variant = DraftVariant {
                id: time::new_event_id(),
                tenant_id: ctx.tenant_id().to_string(),
                project_id: project_id.to_string(),
                batch_id: batch_id.clone(),
                variant_index: index,
                prompt: prompt.to_string(),
                package: candidate,
                checksum,
                created_at: time::now_epoch_z(),
            };
            let package_json = encode(&variant.package)?;
            let row = variant.clone();
            self.broker
                .with_conn(&self.db_path(), ctx, "draft.generate_multi", |conn| {
                    conn.execute(
                        "INSERT INTO draft_variants
                         (id, tenant_id, project_id, batch_id, variant_index, prompt, package,
                          checksum, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        params![
                            row.id,
                            row.tenant_id,
                            row.project_id,
                            row.batch_id,
                            row.variant_index as i64,
                            row.prompt,
                            package_json,
                            row.checksum,
                            row.created_at
                        ],
                    )?;
                    Ok(())
                })?;
            variants.push(variant);
        }
        Ok(variants)
    }

    pub fn get_variant(&self, ctx: &OpContext, variant_id: &str) -> Result<DraftVariant, ChangeOpsError> {
        let id = variant_id.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "draft.variant.get", |conn| {
                let row = conn
                    .query_row(
                        "SELECT id, tenant_id, project_id, batch_id, variant_index, prompt, package,
                                checksum, created_at
                         FROM draft_variants WHERE tenant_id = ?1 AND id = ?2",
                        params![ctx.tenant_id(), id],
                        variant_from_row,
                    )
                    .optional()?;
                row.transpose()?
                    .ok_or_else(|| ChangeOpsError::NotFound(format!("variant '{}' not found", id)))
            })
    }

    pub fn diff_variants(
        &self,
        ctx: &OpContext,
        variant_a: &str,
        variant_b: &str,
    ) -> Result<PackageDiff, ChangeOpsError> {
        let a = self.get_variant(ctx, variant_a)?;
        let b = self.get_variant(ctx, variant_b)?;
        Ok(diff::diff(&a.package, &b.package))
    }

    /// Adopt a variant into an existing draft (`adopt_variant` version) or a
    /// new draft (`create_variant` as version 1).
    pub fn adopt_variant(
        &self,
        ctx: &OpContext,
        variant_id: &str,
        draft_id: Option<&str>,
    ) -> Result<Draft, ChangeOpsError> {
        let variant = self.get_variant(ctx, variant_id)?;
        let package_json = encode(&variant.package)?;
        let errors_json = encode(&package::validate(&variant.package))?;

        match draft_id {
            Some(existing_id) => {
                let draft = self.get(ctx, existing_id)?;
                require_mutable(&draft)?;
                let id = existing_id.to_string();
                let prompt = variant.prompt.clone();
                let checksum = variant.checksum.clone();
                self.broker
                    .with_conn(&self.db_path(), ctx, "draft.adopt_variant", |conn| {
                        update_draft_package(
                            conn, ctx, &id, &prompt, &package_json, &checksum, &errors_json, None,
                        )?;
                        append_version(
                            conn,
                            ctx,
                            &id,
                            VersionReason::AdoptVariant,
                            &package_json,
                            &checksum,
                            None,
                            &errors_json,
                        )?;
                        Ok(())
                    })?;
                self.broker.emit_entity_event(
                    ctx,
                    ENTITY_DRAFT,
                    existing_id,
                    "draft.variant_adopted",
                    None,
                )?;
                self.get(ctx, existing_id)
            }
            None => {
                let draft_id = time::new_event_id();
                let now = time::now_epoch_z();
                let created_by = ctx.actor.id.clone();
                let env_store = EnvironmentStore::new(&self.store);
                let env_id = env_store.default_for_project(ctx, &variant.project_id)?.id;
                let row = variant.clone();
                let new_id = draft_id.clone();
                self.broker
                    .with_conn(&self.db_path(), ctx, "draft.create_variant", |conn| {
                        conn.execute(
                            "INSERT INTO drafts
                             (id, tenant_id, project_id, environment_id, status, prompt, package,
                              checksum, last_preview_errors, created_by, created_at, updated_at, version)
                             VALUES (?1, ?2, ?3, ?4, 'draft', ?5, ?6, ?7, ?8, ?9, ?10, ?10, 1)",
                            params![
                                new_id,
                                ctx.tenant_id(),
                                row.project_id,
                                env_id,
                                row.prompt,
                                package_json,
                                row.checksum,
                                errors_json,
                                created_by,
                                now
                            ],
                        )?;
                        append_version(
                            conn,
                            ctx,
                            &new_id,
                            VersionReason::CreateVariant,
                            &package_json,
                            &row.checksum,
                            None,
                            &errors_json,
                        )?;
                        Ok(())
                    })?;
                self.broker.emit_entity_event(
                    ctx,
                    ENTITY_DRAFT,
                    &draft_id,
                    "draft.variant_adopted",
                    None,
                )?;
                self.get(ctx, &draft_id)
            }
        }
    }

    // --- Streaming ---

    /// Streaming preview: generation, validation, repair, projection, diff,
    /// complete. The `complete` event carries the final [`RepairResult`]
    /// with the diff attached. Cancellation closes the stream with an
    /// `error` event carrying `"canceled"`.
    pub fn preview_stream(
        &self,
        ctx: &OpContext,
        project_id: &str,
        prompt: &str,
        app_name: Option<&str>,
        with_tokens: bool,
        cancel: Arc<AtomicBool>,
    ) -> Receiver<StreamEvent> {
        let (tx, rx) = sync_channel::<StreamEvent>(STREAM_CHANNEL_BOUND);
        let store = self.store.clone();
        let producer = Arc::clone(&self.producer);
        let ctx = ctx.clone();
        let project = project_id.to_string();
        let prompt = prompt.to_string();
        let app_name = app_name.map(|s| s.to_string());

        thread::spawn(move || {
            let engine = DraftEngine::new(&store, producer);
            run_preview_stream(
                &engine, &ctx, &project, &prompt, app_name.as_deref(), with_tokens, &cancel, &tx,
                None,
            );
        });
        rx
    }

    /// Multi-variant stream: per-variant pipelines multiplexed onto one
    /// channel, every event tagged with `variant_index`. `complete` arrives
    /// for each variant exactly once, in any order.
    pub fn generate_multi_stream(
        &self,
        ctx: &OpContext,
        project_id: &str,
        prompt: &str,
        count: usize,
        cancel: Arc<AtomicBool>,
    ) -> Receiver<StreamEvent> {
        let count = count.clamp(1, 8);
        let (tx, rx) = sync_channel::<StreamEvent>(STREAM_CHANNEL_BOUND);

        for index in 0..count {
            let store = self.store.clone();
            let producer = Arc::clone(&self.producer);
            let ctx = ctx.clone();
            let project = project_id.to_string();
            let prompt = prompt.to_string();
            let cancel = Arc::clone(&cancel);
            let tx = tx.clone();
            thread::spawn(move || {
                let engine = DraftEngine::new(&store, producer);
                run_preview_stream(
                    &engine,
                    &ctx,
                    &project,
                    &prompt,
                    None,
                    false,
                    &cancel,
                    &tx,
                    Some(index),
                );
            });
        }
        rx
    }

    fn target_environment(&self, ctx: &OpContext, draft: &Draft) -> Result<String, ChangeOpsError> {
        match &draft.environment_id {
            Some(id) => Ok(id.clone()),
            None => {
                let env_store = EnvironmentStore::new(&self.store);
                Ok(env_store.default_for_project(ctx, &draft.project_id)?.id)
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_preview_stream(
    engine: &DraftEngine,
    ctx: &OpContext,
    project_id: &str,
    prompt: &str,
    app_name: Option<&str>,
    with_tokens: bool,
    cancel: &AtomicBool,
    tx: &SyncSender<StreamEvent>,
    variant_index: Option<usize>,
) {
    let send = |event: StreamEvent| {
        let event = match variant_index {
            Some(index) => event.with_variant(index),
            None => event,
        };
        // A dropped receiver ends the stream; nothing left to notify.
        let _ = tx.send(event);
    };

    let canceled = || cancel.load(Ordering::SeqCst);
    if canceled() {
        send(StreamEvent::error("canceled"));
        return;
    }

    let mut staged: Vec<StreamEvent> = Vec::new();
    let pipeline = engine.run_pipeline(
        prompt,
        app_name,
        None,
        Some(&mut |event| staged.push(event)),
        with_tokens,
    );
    for event in staged {
        send(event);
    }

    let mut result = match pipeline {
        Ok(result) => result,
        Err(e) => {
            send(StreamEvent::error(&e.to_string()));
            return;
        }
    };
    if canceled() {
        send(StreamEvent::error("canceled"));
        return;
    }

    // Projection and diff run against the project's default environment.
    let env_store = EnvironmentStore::new(&engine.store);
    let baseline_package = env_store
        .default_for_project(ctx, project_id)
        .and_then(|env| env_store.baseline(ctx, &env.id))
        .ok()
        .flatten()
        .map(|state| state.package);

    let plan = diff::project(&result.package, baseline_package.as_ref());
    send(
        StreamEvent::stage(StreamStage::Projection)
            .with_payload(serde_json::json!({ "operations": plan.len() })),
    );
    if canceled() {
        send(StreamEvent::error("canceled"));
        return;
    }

    let baseline = baseline_package
        .unwrap_or_else(|| Package::empty(&result.package.package_key));
    let preview_diff = diff::diff(&baseline, &result.package);
    send(
        StreamEvent::stage(StreamStage::Diff).with_payload(
            serde_json::to_value(&preview_diff.summary).unwrap_or(JsonValue::Null),
        ),
    );
    result.diff = Some(preview_diff);

    if canceled() {
        send(StreamEvent::error("canceled"));
        return;
    }
    send(
        StreamEvent::stage(StreamStage::Complete)
            .with_payload(serde_json::to_value(&result).unwrap_or(JsonValue::Null)),
    );
}

/// Deterministic variant elaboration: each index applies a different
/// alternative shape to the base candidate.
fn variant_candidate(mut package: Package, index: usize) -> Package {
    match index % 4 {
        0 => {}
        1 => {
            for rt in &mut package.record_types {
                if rt.field("status").is_none() {
                    rt.fields.push(Field::new("status", "string"));
                }
            }
        }
        2 => {
            let keys: Vec<String> = package.record_types.iter().map(|rt| rt.key.clone()).collect();
            for key in keys {
                if !package.sla_policies.iter().any(|s| s.record_type_key == key) {
                    package.sla_policies.push(crate::core::package::SlaPolicy {
                        record_type_key: key,
                        duration_minutes: 240,
                    });
                }
            }
        }
        _ => {
            for rt in &mut package.record_types {
                if rt.field("notes").is_none() {
                    rt.fields.push(Field::new("notes", "text"));
                }
            }
        }
    }
    package
}

// --- Stream events and frames ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamStage {
    Generation,
    Validation,
    Repair,
    Projection,
    Diff,
    Complete,
    Error,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub stage: StreamStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<JsonValue>,
}

impl StreamEvent {
    pub fn stage(stage: StreamStage) -> Self {
        Self {
            stage,
            variant_index: None,
            token: None,
            payload: None,
        }
    }

    pub fn token(token: &str) -> Self {
        Self {
            stage: StreamStage::Generation,
            variant_index: None,
            token: Some(token.to_string()),
            payload: None,
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            stage: StreamStage::Error,
            variant_index: None,
            token: None,
            payload: Some(serde_json::json!({ "message": message })),
        }
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_variant(mut self, index: usize) -> Self {
        self.variant_index = Some(index);
        self
    }
}

/// Wire framing for stream events: `data: <json>\n\n` per event.
pub mod frames {
    use super::StreamEvent;
    use crate::core::error::ChangeOpsError;
    use std::io::Write;

    pub fn write_frame<W: Write>(writer: &mut W, event: &StreamEvent) -> std::io::Result<()> {
        let body = serde_json::to_string(event)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(writer, "data: {}", body)?;
        writeln!(writer)
    }

    /// Frame parser for stream consumers. Lenient by default (malformed
    /// frames are dropped); strict mode raises on the first malformed frame.
    pub struct FrameParser {
        strict: bool,
    }

    impl FrameParser {
        pub fn new(strict: bool) -> Self {
            Self { strict }
        }

        pub fn parse(&self, input: &str) -> Result<Vec<StreamEvent>, ChangeOpsError> {
            let mut events = Vec::new();
            for line in input.lines() {
                let line = line.trim_end_matches('\r');
                if line.is_empty() {
                    continue;
                }
                let parsed = line
                    .strip_prefix("data: ")
                    .and_then(|body| serde_json::from_str::<StreamEvent>(body).ok());
                match parsed {
                    Some(event) => events.push(event),
                    None => {
                        if self.strict {
                            return Err(ChangeOpsError::validation(
                                "MALFORMED_FRAME",
                                format!("unparseable stream frame: '{}'", line),
                            ));
                        }
                    }
                }
            }
            Ok(events)
        }
    }
}

// --- Row plumbing ---

fn encode<T: Serialize>(value: &T) -> Result<String, ChangeOpsError> {
    serde_json::to_string(value)
        .map_err(|e| ChangeOpsError::InvariantViolation(format!("encode: {}", e)))
}

fn require_mutable(draft: &Draft) -> Result<(), ChangeOpsError> {
    match draft.status {
        DraftStatus::Draft | DraftStatus::Previewed => Ok(()),
        other => Err(ChangeOpsError::StateInvalid(format!(
            "draft '{}' is {}, expected draft or previewed",
            draft.id,
            other.as_str()
        ))),
    }
}

#[allow(clippy::too_many_arguments)]
fn update_draft_package(
    conn: &Connection,
    ctx: &OpContext,
    draft_id: &str,
    prompt: &str,
    package_json: &str,
    checksum: &str,
    errors_json: &str,
    expected_version: Option<i64>,
) -> Result<(), ChangeOpsError> {
    let changed = match expected_version {
        Some(expected) => conn.execute(
            "UPDATE drafts SET prompt = ?1, package = ?2, checksum = ?3, last_preview_errors = ?4,
             last_preview_diff = NULL, updated_at = ?5, version = version + 1
             WHERE tenant_id = ?6 AND id = ?7 AND version = ?8",
            params![
                prompt,
                package_json,
                checksum,
                errors_json,
                time::now_epoch_z(),
                ctx.tenant_id(),
                draft_id,
                expected
            ],
        )?,
        None => conn.execute(
            "UPDATE drafts SET prompt = ?1, package = ?2, checksum = ?3, last_preview_errors = ?4,
             last_preview_diff = NULL, updated_at = ?5, version = version + 1
             WHERE tenant_id = ?6 AND id = ?7",
            params![
                prompt,
                package_json,
                checksum,
                errors_json,
                time::now_epoch_z(),
                ctx.tenant_id(),
                draft_id
            ],
        )?,
    };
    if changed == 0 {
        return Err(ChangeOpsError::Conflict(format!(
            "draft '{}' moved since it was read; refresh and retry",
            draft_id
        )));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn append_version(
    conn: &Connection,
    ctx: &OpContext,
    draft_id: &str,
    reason: VersionReason,
    package_json: &str,
    checksum: &str,
    diff_json: Option<&str>,
    errors_json: &str,
) -> Result<i64, ChangeOpsError> {
    let next: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version_number), 0) + 1 FROM draft_versions
         WHERE tenant_id = ?1 AND draft_id = ?2",
        params![ctx.tenant_id(), draft_id],
        |row| row.get(0),
    )?;
    conn.execute(
        "INSERT INTO draft_versions
         (draft_id, tenant_id, version_number, reason, package, checksum, preview_diff,
          preview_errors, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            draft_id,
            ctx.tenant_id(),
            next,
            reason.as_str(),
            package_json,
            checksum,
            diff_json,
            errors_json,
            ctx.actor.id,
            time::now_epoch_z()
        ],
    )?;
    Ok(next)
}

fn read_draft(
    conn: &Connection,
    tenant_id: &str,
    draft_id: &str,
) -> Result<Option<Draft>, ChangeOpsError> {
    let row = conn
        .query_row(
            "SELECT id, tenant_id, project_id, environment_id, status, prompt, package, checksum,
                    last_preview_diff, last_preview_errors, created_by, created_at, updated_at, version
             FROM drafts WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, draft_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, Option<String>>(10)?,
                    row.get::<_, String>(11)?,
                    row.get::<_, String>(12)?,
                    row.get::<_, i64>(13)?,
                ))
            },
        )
        .optional()?;
    let Some((
        id,
        tenant_id,
        project_id,
        environment_id,
        status_raw,
        prompt,
        package_json,
        checksum,
        diff_json,
        errors_json,
        created_by,
        created_at,
        updated_at,
        version,
    )) = row
    else {
        return Ok(None);
    };

    Ok(Some(Draft {
        id,
        tenant_id,
        project_id,
        environment_id,
        status: DraftStatus::parse(&status_raw)?,
        prompt,
        package: decode(&package_json, "draft package")?,
        checksum,
        last_preview_diff: diff_json
            .map(|raw| decode(&raw, "preview diff"))
            .transpose()?,
        last_preview_errors: errors_json
            .map(|raw| decode(&raw, "preview errors"))
            .transpose()?
            .unwrap_or_default(),
        created_by,
        created_at,
        updated_at,
        version,
    }))
}

fn read_versions(
    conn: &Connection,
    tenant_id: &str,
    draft_id: &str,
) -> Result<Vec<DraftVersion>, ChangeOpsError> {
    let mut stmt = conn.prepare(
        "SELECT draft_id, version_number, reason, package, checksum, preview_diff, preview_errors,
                created_by, created_at
         FROM draft_versions WHERE tenant_id = ?1 AND draft_id = ?2 ORDER BY version_number",
    )?;
    let rows: Vec<(
        String,
        i64,
        String,
        String,
        String,
        Option<String>,
        Option<String>,
        Option<String>,
        String,
    )> = stmt
        .query_map(params![tenant_id, draft_id], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
            ))
        })?
        .collect::<Result<_, _>>()?;

    let mut versions = Vec::with_capacity(rows.len());
    for (draft_id, version_number, reason_raw, package_json, checksum, diff_json, errors_json, created_by, created_at) in
        rows
    {
        versions.push(DraftVersion {
            draft_id,
            version_number,
            reason: parse_reason(&reason_raw)?,
            package: decode(&package_json, "version package")?,
            checksum,
            preview_diff: diff_json.map(|raw| decode(&raw, "version diff")).transpose()?,
            preview_errors: errors_json
                .map(|raw| decode(&raw, "version errors"))
                .transpose()?
                .unwrap_or_default(),
            created_by,
            created_at,
        });
    }
    Ok(versions)
}

fn variant_from_row(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<Result<DraftVariant, ChangeOpsError>> {
    let package_json: String = row.get(6)?;
    let variant_index: i64 = row.get(4)?;
    Ok((|| {
        Ok(DraftVariant {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            project_id: row.get(2)?,
            batch_id: row.get(3)?,
            variant_index: variant_index as usize,
            prompt: row.get(5)?,
            package: decode(&package_json, "variant package")?,
            checksum: row.get(7)?,
            created_at: row.get(8)?,
        })
    })())
}

fn parse_reason(raw: &str) -> Result<VersionReason, ChangeOpsError> {
    match raw {
        "create" => Ok(VersionReason::Create),
        "refine" => Ok(VersionReason::Refine),
        "patch" => Ok(VersionReason::Patch),
        "restore" => Ok(VersionReason::Restore),
        "create_variant" => Ok(VersionReason::CreateVariant),
        "adopt_variant" => Ok(VersionReason::AdoptVariant),
        other => Err(ChangeOpsError::InvariantViolation(format!(
            "unknown version reason '{}'",
            other
        ))),
    }
}

fn decode<T: for<'de> Deserialize<'de>>(raw: &str, what: &str) -> Result<T, ChangeOpsError> {
    serde_json::from_str(raw)
        .map_err(|e| ChangeOpsError::InvariantViolation(format!("corrupt {}: {}", what, e)))
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "draft",
        "version": "1.0.0",
        "description": "Prompt-to-package drafts with versions, variants, and streaming preview",
        "commands": [
            { "name": "generate", "parameters": ["project", "prompt", "app_name"] },
            { "name": "refine", "parameters": ["id", "prompt"] },
            { "name": "patch", "parameters": ["id", "ops"] },
            { "name": "preview", "parameters": ["id"] },
            { "name": "install", "parameters": ["id"] },
            { "name": "discard", "parameters": ["id"] },
            { "name": "versions", "parameters": ["id"] },
            { "name": "restore", "parameters": ["id", "version"] },
            { "name": "generate-multi", "parameters": ["project", "prompt", "count"] },
            { "name": "adopt-variant", "parameters": ["variant", "draft"] }
        ],
        "storage": ["draft.db"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip_and_lenient_drop() {
        let event = StreamEvent::stage(StreamStage::Diff)
            .with_payload(serde_json::json!({"added": 1, "removed": 0, "modified": 0}));
        let mut buffer = Vec::new();
        frames::write_frame(&mut buffer, &event).unwrap();
        let raw = String::from_utf8(buffer).unwrap();
        assert!(raw.starts_with("data: "));
        assert!(raw.ends_with("\n\n"));

        let input = format!("{}garbage line\ndata: not json\n", raw);
        let parsed = frames::FrameParser::new(false).parse(&input).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0], event);

        let err = frames::FrameParser::new(true).parse(&input).unwrap_err();
        assert!(matches!(err, ChangeOpsError::Validation(_)));
    }

    #[test]
    fn variant_candidates_differ_deterministically() {
        let base = Package::empty("vibe.app");
        let mut base = {
            let mut p = base;
            p.record_types.push(crate::core::package::RecordType {
                key: "ticket".to_string(),
                name: "Ticket".to_string(),
                base_type: None,
                fields: vec![Field::new("name", "string").required()],
            });
            p
        };
        base.version = "0.1.0".to_string();

        let v0 = variant_candidate(base.clone(), 0);
        let v1 = variant_candidate(base.clone(), 1);
        let v2 = variant_candidate(base.clone(), 2);
        assert_ne!(
            package::checksum(&v0).unwrap(),
            package::checksum(&v1).unwrap()
        );
        assert!(v1.record_type("ticket").unwrap().field("status").is_some());
        assert_eq!(v2.sla_policies.len(), 1);

        // Same index, same elaboration.
        let v1_again = variant_candidate(base, 1);
        assert_eq!(
            package::checksum(&v1).unwrap(),
            package::checksum(&v1_again).unwrap()
        );
    }

    #[test]
    fn status_and_reason_parse_round_trip() {
        for status in [
            DraftStatus::Draft,
            DraftStatus::Previewed,
            DraftStatus::Installed,
            DraftStatus::Discarded,
        ] {
            assert_eq!(DraftStatus::parse(status.as_str()).unwrap(), status);
        }
        for reason in [
            VersionReason::Create,
            VersionReason::Refine,
            VersionReason::Patch,
            VersionReason::Restore,
            VersionReason::CreateVariant,
            VersionReason::AdoptVariant,
        ] {
            assert_eq!(parse_reason(reason.as_str()).unwrap(), reason);
        }
    }
}
