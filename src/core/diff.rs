//! Package diff and environment projection.
//!
//! `diff(a, b)` produces a structured record-type delta: added and removed
//! record types plus field-level modifications computed as a name-keyed
//! symmetric difference. The delta carries enough payload that
//! `apply(a, diff(a, b))` reconstructs `b` field-for-field; a field whose
//! definition changed in place travels as a remove of the old name plus an
//! add of the new definition.
//!
//! The projector turns a package into an ordered plan of operations against
//! an environment's installed baseline, record types before the entities
//! that reference them.

use crate::core::package::{Field, Package, RecordType};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AddedRecordType {
    pub key: String,
    pub field_count: usize,
    pub record_type: RecordType,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemovedRecordType {
    pub key: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BaseTypeChange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModifiedRecordType {
    pub key: String,
    pub added_fields: Vec<Field>,
    pub removed_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_type_changed: Option<BaseTypeChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_changed: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
}

impl DiffSummary {
    pub fn is_zero(&self) -> bool {
        self.added == 0 && self.removed == 0 && self.modified == 0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackageDiff {
    pub added_record_types: Vec<AddedRecordType>,
    pub removed_record_types: Vec<RemovedRecordType>,
    pub modified_record_types: Vec<ModifiedRecordType>,
    pub summary: DiffSummary,
}

/// Structured delta from `a` to `b` over record types.
pub fn diff(a: &Package, b: &Package) -> PackageDiff {
    let mut result = PackageDiff::default();

    for rt in &b.record_types {
        if a.record_type(&rt.key).is_none() {
            result.added_record_types.push(AddedRecordType {
                key: rt.key.clone(),
                field_count: rt.fields.len(),
                record_type: rt.clone(),
            });
        }
    }

    for rt in &a.record_types {
        if b.record_type(&rt.key).is_none() {
            result
                .removed_record_types
                .push(RemovedRecordType { key: rt.key.clone() });
        }
    }

    for before in &a.record_types {
        let Some(after) = b.record_type(&before.key) else {
            continue;
        };
        let mut added_fields: Vec<Field> = Vec::new();
        let mut removed_fields: Vec<String> = Vec::new();

        for field in &after.fields {
            match before.field(&field.name) {
                None => added_fields.push(field.clone()),
                Some(existing) if existing != field => {
                    // In-place definition change: remove old, add new.
                    removed_fields.push(field.name.clone());
                    added_fields.push(field.clone());
                }
                Some(_) => {}
            }
        }
        for field in &before.fields {
            if after.field(&field.name).is_none() {
                removed_fields.push(field.name.clone());
            }
        }

        let base_type_changed = if before.base_type != after.base_type {
            Some(BaseTypeChange {
                from: before.base_type.clone(),
                to: after.base_type.clone(),
            })
        } else {
            None
        };
        let name_changed = if before.name != after.name {
            Some(after.name.clone())
        } else {
            None
        };

        if !added_fields.is_empty()
            || !removed_fields.is_empty()
            || base_type_changed.is_some()
            || name_changed.is_some()
        {
            result.modified_record_types.push(ModifiedRecordType {
                key: before.key.clone(),
                added_fields,
                removed_fields,
                base_type_changed,
                name_changed,
            });
        }
    }

    result.summary = DiffSummary {
        added: result.added_record_types.len(),
        removed: result.removed_record_types.len(),
        modified: result.modified_record_types.len(),
    };
    result
}

/// Reconstruct the target of a diff: `apply(a, diff(a, b))` equals `b`
/// over record types.
pub fn apply(a: &Package, delta: &PackageDiff) -> Package {
    let mut result = a.clone();

    result
        .record_types
        .retain(|rt| !delta.removed_record_types.iter().any(|r| r.key == rt.key));

    for added in &delta.added_record_types {
        result.record_types.push(added.record_type.clone());
    }

    for modified in &delta.modified_record_types {
        let Some(rt) = result.record_type_mut(&modified.key) else {
            continue;
        };
        rt.fields
            .retain(|f| !modified.removed_fields.contains(&f.name));
        for field in &modified.added_fields {
            rt.fields.retain(|f| f.name != field.name);
            rt.fields.push(field.clone());
        }
        if let Some(change) = &modified.base_type_changed {
            rt.base_type = change.to.clone();
        }
        if let Some(name) = &modified.name_changed {
            rt.name = name.clone();
        }
    }

    result
}

// --- Projector ---

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Create,
    Update,
    Remove,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanEntity {
    RecordType,
    SlaPolicy,
    AssignmentRule,
    Workflow,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanOp {
    pub action: PlanAction,
    pub entity: PlanEntity,
    pub key: String,
}

/// Project a package onto an environment's installed baseline as an ordered
/// operation plan. Record types land before the workflows, SLAs, and rules
/// that reference them; removals run dependents-first so a record type is
/// never dropped while something still points at it.
pub fn project(package: &Package, baseline: Option<&Package>) -> Vec<PlanOp> {
    let empty = Package::empty(&package.package_key);
    let base = baseline.unwrap_or(&empty);
    let mut plan = Vec::new();

    for rt in &package.record_types {
        let action = if base.record_type(&rt.key).is_some() {
            PlanAction::Update
        } else {
            PlanAction::Create
        };
        plan.push(PlanOp {
            action,
            entity: PlanEntity::RecordType,
            key: rt.key.clone(),
        });
    }

    for sla in &package.sla_policies {
        let exists = base
            .sla_policies
            .iter()
            .any(|s| s.record_type_key == sla.record_type_key);
        plan.push(PlanOp {
            action: if exists { PlanAction::Update } else { PlanAction::Create },
            entity: PlanEntity::SlaPolicy,
            key: sla.record_type_key.clone(),
        });
    }

    for rule in &package.assignment_rules {
        let exists = base.assignment_rules.iter().any(|r| {
            r.record_type_key == rule.record_type_key && r.strategy_type == rule.strategy_type
        });
        plan.push(PlanOp {
            action: if exists { PlanAction::Update } else { PlanAction::Create },
            entity: PlanEntity::AssignmentRule,
            key: rule.record_type_key.clone(),
        });
    }

    for wf in &package.workflows {
        let exists = base.workflows.iter().any(|w| w.key == wf.key);
        plan.push(PlanOp {
            action: if exists { PlanAction::Update } else { PlanAction::Create },
            entity: PlanEntity::Workflow,
            key: wf.key.clone(),
        });
    }

    // Removals: dependents first, record types last.
    for sla in &base.sla_policies {
        if !package
            .sla_policies
            .iter()
            .any(|s| s.record_type_key == sla.record_type_key)
        {
            plan.push(PlanOp {
                action: PlanAction::Remove,
                entity: PlanEntity::SlaPolicy,
                key: sla.record_type_key.clone(),
            });
        }
    }
    for rule in &base.assignment_rules {
        if !package.assignment_rules.iter().any(|r| {
            r.record_type_key == rule.record_type_key && r.strategy_type == rule.strategy_type
        }) {
            plan.push(PlanOp {
                action: PlanAction::Remove,
                entity: PlanEntity::AssignmentRule,
                key: rule.record_type_key.clone(),
            });
        }
    }
    for wf in &base.workflows {
        if !package.workflows.iter().any(|w| w.key == wf.key) {
            plan.push(PlanOp {
                action: PlanAction::Remove,
                entity: PlanEntity::Workflow,
                key: wf.key.clone(),
            });
        }
    }
    for rt in &base.record_types {
        if package.record_type(&rt.key).is_none() {
            plan.push(PlanOp {
                action: PlanAction::Remove,
                entity: PlanEntity::RecordType,
                key: rt.key.clone(),
            });
        }
    }

    plan
}
