//! Override composer.
//!
//! Tenants customize installed modules through typed overrides, never
//! free-form diffs. Composition layers the active overrides of a module onto
//! the baseline form derived from its installed package, in deterministic
//! order: `(created_at ASC, id ASC)`. Ids are ULIDs, so the id tiebreak is
//! itself creation-ordered.
//!
//! The required-invariant is absolute: a baseline-required field can never
//! compose to `effective_required = false`. Violations are rejected at
//! activation and again after composition, so a baseline change that
//! invalidates an active override surfaces as a composition error without
//! auto-retiring the override.

use crate::core::broker::DbBroker;
use crate::core::context::OpContext;
use crate::core::db;
use crate::core::error::{ChangeOpsError, ValidationIssue};
use crate::core::package::Package;
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::environment::EnvironmentStore;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverrideStatus {
    Draft,
    Active,
    Retired,
}

impl OverrideStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Retired => "retired",
        }
    }

    fn parse(raw: &str) -> Result<Self, ChangeOpsError> {
        match raw {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "retired" => Ok(Self::Retired),
            other => Err(ChangeOpsError::InvariantViolation(format!(
                "unknown override status '{}'",
                other
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverrideType {
    Workflow,
    Form,
    Rule,
    Config,
}

impl OverrideType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::Form => "form",
            Self::Rule => "rule",
            Self::Config => "config",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ChangeOpsError> {
        match raw {
            "workflow" => Ok(Self::Workflow),
            "form" => Ok(Self::Form),
            "rule" => Ok(Self::Rule),
            "config" => Ok(Self::Config),
            other => Err(ChangeOpsError::InvariantViolation(format!(
                "unknown override type '{}'",
                other
            ))),
        }
    }
}

/// Typed override operations. Decoded from JSON at the boundary; downstream
/// code only sees this enum.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OverrideOp {
    MoveField {
        field_id: String,
        to_section_id: String,
    },
    ToggleRequired {
        field_id: String,
        value: bool,
    },
    ToggleReadOnly {
        field_id: String,
        value: bool,
    },
    ToggleVisible {
        field_id: String,
        value: bool,
    },
    ChangeSection {
        section_id: String,
        title: String,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModuleOverride {
    pub id: String,
    pub tenant_id: String,
    pub installed_module_id: String,
    pub override_type: OverrideType,
    pub target_ref: String,
    pub patch: Vec<OverrideOp>,
    pub version: i64,
    pub status: OverrideStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_id: Option<String>,
    pub created_by: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

// --- Baseline form model ---

pub const MAIN_SECTION_ID: &str = "main";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BaselineSection {
    pub id: String,
    pub title: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EffectiveField {
    pub id: String,
    pub section_id: String,
    pub baseline_required: bool,
    pub effective_required: bool,
    pub read_only: bool,
    pub visible: bool,
}

/// Effective form for one record type after composition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EffectiveForm {
    pub target_ref: String,
    pub sections: Vec<BaselineSection>,
    pub fields: Vec<EffectiveField>,
    /// Overrides that no longer apply cleanly against the current baseline.
    pub composition_errors: Vec<ValidationIssue>,
}

/// Derive the baseline form for a record type of an installed package:
/// a single main section holding every field, required flags from the model.
fn baseline_form(package: &Package, target_ref: &str) -> Result<EffectiveForm, ChangeOpsError> {
    let rt = package.record_type(target_ref).ok_or_else(|| {
        ChangeOpsError::NotFound(format!(
            "record type '{}' not found in installed package '{}'",
            target_ref, package.package_key
        ))
    })?;
    Ok(EffectiveForm {
        target_ref: target_ref.to_string(),
        sections: vec![BaselineSection {
            id: MAIN_SECTION_ID.to_string(),
            title: "Main".to_string(),
        }],
        fields: rt
            .fields
            .iter()
            .map(|f| EffectiveField {
                id: f.name.clone(),
                section_id: MAIN_SECTION_ID.to_string(),
                baseline_required: f.required,
                effective_required: f.required,
                read_only: false,
                visible: true,
            })
            .collect(),
        composition_errors: Vec::new(),
    })
}

/// Validate an override patch against a baseline form. Used at activation;
/// the same checks run during composition so baseline drift is reported.
fn validate_patch(form: &EffectiveForm, patch: &[OverrideOp]) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    if patch.is_empty() {
        issues.push(ValidationIssue::new(
            "EMPTY_PATCH",
            "override patch carries no operations",
        ));
    }
    for op in patch {
        match op {
            OverrideOp::MoveField {
                field_id,
                to_section_id,
            } => {
                if !form.fields.iter().any(|f| f.id == *field_id) {
                    issues.push(unknown_field(field_id, &form.target_ref));
                }
                if !form.sections.iter().any(|s| s.id == *to_section_id) {
                    issues.push(ValidationIssue::new(
                        "UNKNOWN_SECTION",
                        format!("section '{}' does not exist on '{}'", to_section_id, form.target_ref),
                    ));
                }
            }
            OverrideOp::ToggleRequired { field_id, value } => {
                match form.fields.iter().find(|f| f.id == *field_id) {
                    None => issues.push(unknown_field(field_id, &form.target_ref)),
                    Some(field) if field.baseline_required && !*value => {
                        issues.push(ValidationIssue::new(
                            "REQUIRED_INVARIANT",
                            format!(
                                "field '{}' is baseline-required and cannot be made optional",
                                field_id
                            ),
                        ));
                    }
                    Some(_) => {}
                }
            }
            OverrideOp::ToggleReadOnly { field_id, .. }
            | OverrideOp::ToggleVisible { field_id, .. } => {
                if !form.fields.iter().any(|f| f.id == *field_id) {
                    issues.push(unknown_field(field_id, &form.target_ref));
                }
            }
            OverrideOp::ChangeSection { section_id, .. } => {
                if !form.sections.iter().any(|s| s.id == *section_id) {
                    issues.push(ValidationIssue::new(
                        "UNKNOWN_SECTION",
                        format!("section '{}' does not exist on '{}'", section_id, form.target_ref),
                    ));
                }
            }
        }
    }
    issues
}

fn unknown_field(field_id: &str, target_ref: &str) -> ValidationIssue {
    ValidationIssue::new(
        "UNKNOWN_FIELD",
        format!("field '{}' does not exist on '{}'", field_id, target_ref),
    )
}

fn apply_patch(form: &mut EffectiveForm, override_id: &str, patch: &[OverrideOp]) {
    let drift = validate_patch(form, patch);
    if !drift.is_empty() {
        // Baseline changed under an active override: record, do not apply,
        // do not retire.
        for mut issue in drift {
            issue.details = Some(serde_json::json!({ "overrideId": override_id }));
            form.composition_errors.push(issue);
        }
        return;
    }
    for op in patch {
        match op {
            OverrideOp::MoveField {
                field_id,
                to_section_id,
            } => {
                if let Some(field) = form.fields.iter_mut().find(|f| f.id == *field_id) {
                    field.section_id = to_section_id.clone();
                }
            }
            OverrideOp::ToggleRequired { field_id, value } => {
                if let Some(field) = form.fields.iter_mut().find(|f| f.id == *field_id) {
                    field.effective_required = *value;
                }
            }
            OverrideOp::ToggleReadOnly { field_id, value } => {
                if let Some(field) = form.fields.iter_mut().find(|f| f.id == *field_id) {
                    field.read_only = *value;
                }
            }
            OverrideOp::ToggleVisible { field_id, value } => {
                if let Some(field) = form.fields.iter_mut().find(|f| f.id == *field_id) {
                    field.visible = *value;
                }
            }
            OverrideOp::ChangeSection { section_id, title } => {
                if let Some(section) = form.sections.iter_mut().find(|s| s.id == *section_id) {
                    section.title = title.clone();
                }
            }
        }
    }
}

/// Layer overrides onto a baseline form. Pure; the store wrapper below feeds
/// it sorted rows. The compiled result is rejected if any baseline-required
/// field ended up optional.
pub fn compose(
    package: &Package,
    target_ref: &str,
    overrides: &[ModuleOverride],
) -> Result<EffectiveForm, ChangeOpsError> {
    let mut form = baseline_form(package, target_ref)?;
    let mut ordered: Vec<&ModuleOverride> = overrides
        .iter()
        .filter(|o| o.status == OverrideStatus::Active && o.target_ref == target_ref)
        .collect();
    ordered.sort_by(|a, b| {
        (a.created_at.as_str(), a.id.as_str()).cmp(&(b.created_at.as_str(), b.id.as_str()))
    });

    for module_override in ordered {
        apply_patch(&mut form, &module_override.id, &module_override.patch);
    }

    for field in &form.fields {
        if field.baseline_required && !field.effective_required {
            return Err(ChangeOpsError::InvariantViolation(format!(
                "composed form '{}' weakens required field '{}'",
                target_ref, field.id
            )));
        }
    }
    Ok(form)
}

// --- Store wrapper ---

pub struct OverrideStore<'a> {
    store: &'a Store,
    broker: DbBroker,
}

impl<'a> OverrideStore<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self {
            store,
            broker: DbBroker::new(&store.root),
        }
    }

    fn db_path(&self) -> std::path::PathBuf {
        db::package_db_path(&self.store.root)
    }

    pub fn create(
        &self,
        ctx: &OpContext,
        installed_module_id: &str,
        override_type: OverrideType,
        target_ref: &str,
        patch: Vec<OverrideOp>,
    ) -> Result<ModuleOverride, ChangeOpsError> {
        let id = time::new_event_id();
        let patch_json = serde_json::to_string(&patch)
            .map_err(|e| ChangeOpsError::InvariantViolation(format!("patch encode: {}", e)))?;
        let module = installed_module_id.to_string();
        let target = target_ref.to_string();
        let created_by = ctx.actor.id.clone();
        self.broker
            .with_conn(&self.db_path(), ctx, "override.create", |conn| {
                conn.execute(
                    "INSERT INTO overrides
                     (id, tenant_id, installed_module_id, override_type, target_ref, patch,
                      version, status, created_by, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, 'draft', ?7, ?8)",
                    params![
                        id,
                        ctx.tenant_id(),
                        module,
                        override_type.as_str(),
                        target,
                        patch_json,
                        created_by,
                        time::now_epoch_z()
                    ],
                )?;
                Ok(())
            })?;
        self.get(ctx, &id)
    }

    pub fn get(&self, ctx: &OpContext, override_id: &str) -> Result<ModuleOverride, ChangeOpsError> {
        let id = override_id.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "override.get", |conn| {
                let row = conn
                    .query_row(
                        "SELECT id, tenant_id, installed_module_id, override_type, target_ref,
                                patch, version, status, change_id, created_by, created_at, updated_at
                         FROM overrides WHERE tenant_id = ?1 AND id = ?2",
                        params![ctx.tenant_id(), id],
                        override_from_row,
                    )
                    .optional()?;
                row.ok_or_else(|| ChangeOpsError::NotFound(format!("override '{}' not found", id)))?
            })
    }

    pub fn list_for_module(
        &self,
        ctx: &OpContext,
        installed_module_id: &str,
        status: Option<OverrideStatus>,
    ) -> Result<Vec<ModuleOverride>, ChangeOpsError> {
        let module = installed_module_id.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "override.list", |conn| {
                let mut sql = "SELECT id, tenant_id, installed_module_id, override_type, target_ref,
                        patch, version, status, change_id, created_by, created_at, updated_at
                 FROM overrides WHERE tenant_id = ?1 AND installed_module_id = ?2"
                    .to_string();
                if status.is_some() {
                    sql.push_str(" AND status = ?3");
                }
                sql.push_str(" ORDER BY created_at, id");
                let mut stmt = conn.prepare(&sql)?;
                let rows = match status {
                    Some(s) => stmt
                        .query_map(
                            params![ctx.tenant_id(), module, s.as_str()],
                            override_from_row,
                        )?
                        .collect::<Result<Vec<_>, _>>()?,
                    None => stmt
                        .query_map(params![ctx.tenant_id(), module], override_from_row)?
                        .collect::<Result<Vec<_>, _>>()?,
                };
                rows.into_iter().collect::<Result<Vec<_>, _>>()
            })
    }

    /// Activate a draft override. Governed write: validates the patch against
    /// the module's current baseline in the given environment.
    pub fn activate(
        &self,
        ctx: &OpContext,
        override_id: &str,
        environment_id: &str,
    ) -> Result<ModuleOverride, ChangeOpsError> {
        let change_id = ctx.require_governance("override.activate")?.to_string();
        let module_override = self.get(ctx, override_id)?;
        ctx.ensure_tenant(&module_override.tenant_id)?;
        if module_override.status != OverrideStatus::Draft {
            return Err(ChangeOpsError::StateInvalid(format!(
                "override '{}' is {}, only draft overrides can activate",
                override_id,
                module_override.status.as_str()
            )));
        }

        let env_store = EnvironmentStore::new(self.store);
        let baseline = env_store.baseline(ctx, environment_id)?.ok_or_else(|| {
            ChangeOpsError::NotFound(format!(
                "environment '{}' has no installed baseline",
                environment_id
            ))
        })?;
        let form = baseline_form(&baseline.package, &module_override.target_ref)?;
        let issues = validate_patch(&form, &module_override.patch);
        if !issues.is_empty() {
            return Err(ChangeOpsError::Validation(issues));
        }

        let id = override_id.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "override.activate", |conn| {
                conn.execute(
                    "UPDATE overrides SET status = 'active', change_id = ?1, version = version + 1,
                     updated_at = ?2 WHERE tenant_id = ?3 AND id = ?4",
                    params![change_id, time::now_epoch_z(), ctx.tenant_id(), id],
                )?;
                Ok(())
            })?;
        self.get(ctx, override_id)
    }

    pub fn retire(&self, ctx: &OpContext, override_id: &str) -> Result<ModuleOverride, ChangeOpsError> {
        ctx.require_governance("override.retire")?;
        let module_override = self.get(ctx, override_id)?;
        if module_override.status == OverrideStatus::Retired {
            return Ok(module_override);
        }
        let id = override_id.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "override.retire", |conn| {
                conn.execute(
                    "UPDATE overrides SET status = 'retired', version = version + 1, updated_at = ?1
                     WHERE tenant_id = ?2 AND id = ?3",
                    params![time::now_epoch_z(), ctx.tenant_id(), id],
                )?;
                Ok(())
            })?;
        self.get(ctx, override_id)
    }

    /// Compose every record type of a module's installed baseline with its
    /// active overrides. Returns the effective forms; composition errors ride
    /// on each form rather than failing the whole pass.
    pub fn compose_module(
        &self,
        ctx: &OpContext,
        environment_id: &str,
        installed_module_id: &str,
    ) -> Result<Vec<EffectiveForm>, ChangeOpsError> {
        let env_store = EnvironmentStore::new(self.store);
        let baseline = env_store.baseline(ctx, environment_id)?.ok_or_else(|| {
            ChangeOpsError::NotFound(format!(
                "environment '{}' has no installed baseline",
                environment_id
            ))
        })?;
        let overrides = self.list_for_module(ctx, installed_module_id, Some(OverrideStatus::Active))?;
        let mut forms = Vec::new();
        for rt in &baseline.package.record_types {
            forms.push(compose(&baseline.package, &rt.key, &overrides)?);
        }
        Ok(forms)
    }
}

fn override_from_row(
    row: &rusqlite::Row<'_>,
) -> rusqlite::Result<Result<ModuleOverride, ChangeOpsError>> {
    let patch_json: String = row.get(5)?;
    let type_raw: String = row.get(3)?;
    let status_raw: String = row.get(7)?;
    Ok((|| {
        let patch: Vec<OverrideOp> = serde_json::from_str(&patch_json).map_err(|e| {
            ChangeOpsError::InvariantViolation(format!("corrupt override patch: {}", e))
        })?;
        Ok(ModuleOverride {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            installed_module_id: row.get(2)?,
            override_type: OverrideType::parse(&type_raw)?,
            target_ref: row.get(4)?,
            patch,
            version: row.get(6)?,
            status: OverrideStatus::parse(&status_raw)?,
            change_id: row.get(8)?,
            created_by: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    })())
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "override",
        "version": "1.0.0",
        "description": "Typed tenant overrides layered onto installed module baselines",
        "commands": [
            { "name": "create", "parameters": ["module", "type", "target", "patch"] },
            { "name": "activate", "parameters": ["id", "environment"] },
            { "name": "retire", "parameters": ["id"] },
            { "name": "compose", "parameters": ["environment", "module"] }
        ],
        "storage": ["package.db"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::package::{Field, RecordType};

    fn installed_package() -> Package {
        let mut package = Package::empty("vibe.helpdesk");
        package.record_types.push(RecordType {
            key: "ticket".to_string(),
            name: "Ticket".to_string(),
            base_type: None,
            fields: vec![
                Field::new("name", "string").required(),
                Field::new("priority", "string").required(),
                Field::new("notes", "text"),
            ],
        });
        package
    }

    fn active_override(id: &str, created_at: &str, patch: Vec<OverrideOp>) -> ModuleOverride {
        ModuleOverride {
            id: id.to_string(),
            tenant_id: "t1".to_string(),
            installed_module_id: "vibe.helpdesk".to_string(),
            override_type: OverrideType::Form,
            target_ref: "ticket".to_string(),
            patch,
            version: 1,
            status: OverrideStatus::Active,
            change_id: Some("chg-1".to_string()),
            created_by: "u1".to_string(),
            created_at: created_at.to_string(),
            updated_at: None,
        }
    }

    #[test]
    fn composition_applies_overrides_in_creation_order() {
        let package = installed_package();
        let overrides = vec![
            active_override(
                "02",
                "200Z",
                vec![OverrideOp::ToggleVisible {
                    field_id: "notes".to_string(),
                    value: true,
                }],
            ),
            active_override(
                "01",
                "100Z",
                vec![OverrideOp::ToggleVisible {
                    field_id: "notes".to_string(),
                    value: false,
                }],
            ),
        ];
        // Later override wins regardless of slice order.
        let form = compose(&package, "ticket", &overrides).unwrap();
        let notes = form.fields.iter().find(|f| f.id == "notes").unwrap();
        assert!(notes.visible);
    }

    #[test]
    fn required_invariant_survives_composition() {
        let package = installed_package();
        let overrides = vec![active_override(
            "01",
            "100Z",
            vec![OverrideOp::ToggleRequired {
                field_id: "priority".to_string(),
                value: false,
            }],
        )];
        // The weakening op is caught by patch validation and recorded as a
        // composition error; the compiled form keeps the field required.
        let form = compose(&package, "ticket", &overrides).unwrap();
        let priority = form.fields.iter().find(|f| f.id == "priority").unwrap();
        assert!(priority.effective_required);
        assert!(form
            .composition_errors
            .iter()
            .any(|i| i.code == "REQUIRED_INVARIANT"));
    }

    #[test]
    fn activation_validation_rejects_weakening_and_unknowns() {
        let package = installed_package();
        let form = baseline_form(&package, "ticket").unwrap();

        let issues = validate_patch(
            &form,
            &[OverrideOp::ToggleRequired {
                field_id: "priority".to_string(),
                value: false,
            }],
        );
        assert!(issues.iter().any(|i| i.code == "REQUIRED_INVARIANT"));

        let issues = validate_patch(
            &form,
            &[OverrideOp::MoveField {
                field_id: "ghost".to_string(),
                to_section_id: "missing".to_string(),
            }],
        );
        let codes: Vec<&str> = issues.iter().map(|i| i.code.as_str()).collect();
        assert!(codes.contains(&"UNKNOWN_FIELD"));
        assert!(codes.contains(&"UNKNOWN_SECTION"));
    }

    #[test]
    fn baseline_drift_marks_errors_without_applying() {
        let package = installed_package();
        let overrides = vec![active_override(
            "01",
            "100Z",
            vec![OverrideOp::ToggleReadOnly {
                field_id: "legacy_field".to_string(),
                value: true,
            }],
        )];
        let form = compose(&package, "ticket", &overrides).unwrap();
        assert!(form
            .composition_errors
            .iter()
            .any(|i| i.code == "UNKNOWN_FIELD"));
        assert!(form.fields.iter().all(|f| !f.read_only));
    }
}
