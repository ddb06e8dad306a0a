//! Package model, validation, and deterministic checksum.
//!
//! A [`Package`] is the canonical value object describing an application:
//! record types, SLA policies, assignment rules, workflows, and roles.
//! Entities reference each other by key, never by pointer, so cyclic shapes
//! (self-based record types, workflows over their own record type) stay
//! representable and validation walks them iteratively.
//!
//! The checksum is SHA-256 over a canonical serialization: keys sorted at
//! every level, arrays sorted by their stable entity key, absent optionals
//! dropped. Two semantically equal packages hash identically regardless of
//! input ordering.

use crate::core::error::{ChangeOpsError, ValidationIssue};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Key of the record type this field points at, for reference fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl Field {
    pub fn new(name: &str, field_type: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type: field_type.to_string(),
            required: false,
            default: None,
            reference: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordType {
    pub key: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_type: Option<String>,
    #[serde(default)]
    pub fields: Vec<Field>,
}

impl RecordType {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SlaPolicy {
    pub record_type_key: String,
    pub duration_minutes: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentRule {
    pub record_type_key: String,
    pub strategy_type: String,
    #[serde(default = "default_assignment_config")]
    pub config: AssignmentConfig,
}

fn default_assignment_config() -> AssignmentConfig {
    AssignmentConfig {
        group_key: None,
        user_id: None,
        field: None,
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackageWorkflowStep {
    pub name: String,
    pub step_type: String,
    pub ordering: u32,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackageWorkflow {
    pub key: String,
    pub name: String,
    pub record_type_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_event: Option<String>,
    #[serde(default)]
    pub steps: Vec<PackageWorkflowStep>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub key: String,
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub package_key: String,
    /// Semver string for the package as a whole.
    pub version: String,
    #[serde(default)]
    pub record_types: Vec<RecordType>,
    #[serde(default)]
    pub sla_policies: Vec<SlaPolicy>,
    #[serde(default)]
    pub assignment_rules: Vec<AssignmentRule>,
    #[serde(default)]
    pub workflows: Vec<PackageWorkflow>,
    #[serde(default)]
    pub roles: Vec<Role>,
}

impl Package {
    pub fn empty(package_key: &str) -> Self {
        Self {
            package_key: package_key.to_string(),
            version: "0.1.0".to_string(),
            record_types: Vec::new(),
            sla_policies: Vec::new(),
            assignment_rules: Vec::new(),
            workflows: Vec::new(),
            roles: Vec::new(),
        }
    }

    pub fn record_type(&self, key: &str) -> Option<&RecordType> {
        self.record_types.iter().find(|rt| rt.key == key)
    }

    pub fn record_type_mut(&mut self, key: &str) -> Option<&mut RecordType> {
        self.record_types.iter_mut().find(|rt| rt.key == key)
    }
}

// --- Validation ---

/// Validate all package invariants. Returns the full issue list so the
/// repair loop can address everything in one producer round.
pub fn validate(package: &Package) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if package.package_key.trim().is_empty() {
        issues.push(ValidationIssue::new(
            "EMPTY_PACKAGE_KEY",
            "package key must not be empty",
        ));
    }

    let mut keys: HashSet<&str> = HashSet::new();
    for rt in &package.record_types {
        if !keys.insert(rt.key.as_str()) {
            issues.push(ValidationIssue::for_record_type(
                "DUPLICATE_RECORD_TYPE",
                format!("record type key '{}' is not unique", rt.key),
                &rt.key,
            ));
        }
        let mut field_names: HashSet<&str> = HashSet::new();
        for field in &rt.fields {
            if !field_names.insert(field.name.as_str()) {
                issues.push(ValidationIssue::for_record_type(
                    "DUPLICATE_FIELD",
                    format!("field '{}' repeated on record type '{}'", field.name, rt.key),
                    &rt.key,
                ));
            }
        }
    }

    // Base types resolve by key within the package; the chain is walked
    // iteratively with a visited set (flat keys, no structural recursion).
    for rt in &package.record_types {
        let Some(base) = rt.base_type.as_deref() else {
            continue;
        };
        if package.record_type(base).is_none() {
            let mut issue = ValidationIssue::for_record_type(
                "UNKNOWN_BASE_TYPE",
                format!("record type '{}' extends unknown base '{}'", rt.key, base),
                &rt.key,
            );
            issue.base_type_key = Some(base.to_string());
            issues.push(issue);
            continue;
        }
        let mut visited: HashSet<&str> = HashSet::new();
        visited.insert(rt.key.as_str());
        let mut cursor = Some(base);
        while let Some(current) = cursor {
            if !visited.insert(current) {
                let mut issue = ValidationIssue::for_record_type(
                    "BASE_TYPE_CYCLE",
                    format!("base type chain of '{}' revisits '{}'", rt.key, current),
                    &rt.key,
                );
                issue.base_type_key = Some(current.to_string());
                issues.push(issue);
                break;
            }
            cursor = package
                .record_type(current)
                .and_then(|next| next.base_type.as_deref());
        }
    }

    for sla in &package.sla_policies {
        if package.record_type(&sla.record_type_key).is_none() {
            issues.push(ValidationIssue::for_record_type(
                "UNKNOWN_RECORD_TYPE",
                format!("SLA policy targets unknown record type '{}'", sla.record_type_key),
                &sla.record_type_key,
            ));
        }
    }

    for rule in &package.assignment_rules {
        if package.record_type(&rule.record_type_key).is_none() {
            issues.push(ValidationIssue::for_record_type(
                "UNKNOWN_RECORD_TYPE",
                format!(
                    "assignment rule targets unknown record type '{}'",
                    rule.record_type_key
                ),
                &rule.record_type_key,
            ));
        }
    }

    let mut workflow_keys: HashSet<&str> = HashSet::new();
    for wf in &package.workflows {
        if !workflow_keys.insert(wf.key.as_str()) {
            issues.push(ValidationIssue::new(
                "DUPLICATE_WORKFLOW",
                format!("workflow key '{}' is not unique", wf.key),
            ));
        }
        if package.record_type(&wf.record_type_key).is_none() {
            issues.push(ValidationIssue::for_record_type(
                "UNKNOWN_RECORD_TYPE",
                format!(
                    "workflow '{}' targets unknown record type '{}'",
                    wf.key, wf.record_type_key
                ),
                &wf.record_type_key,
            ));
        }
        let mut orderings: HashSet<u32> = HashSet::new();
        for step in &wf.steps {
            if !orderings.insert(step.ordering) {
                issues.push(ValidationIssue::new(
                    "DUPLICATE_STEP_ORDERING",
                    format!(
                        "workflow '{}' repeats step ordering {}",
                        wf.key, step.ordering
                    ),
                ));
            }
        }
    }

    issues
}

// --- Canonical form and checksum ---

/// Canonical serialization: arrays sorted by stable entity key, object keys
/// sorted lexicographically (serde_json's default map is ordered), absent
/// optionals dropped by the serde attributes on the model.
pub fn canonical(package: &Package) -> Result<String, ChangeOpsError> {
    let mut sorted = package.clone();
    sorted.record_types.sort_by(|a, b| a.key.cmp(&b.key));
    for rt in &mut sorted.record_types {
        rt.fields.sort_by(|a, b| a.name.cmp(&b.name));
    }
    sorted
        .sla_policies
        .sort_by(|a, b| a.record_type_key.cmp(&b.record_type_key));
    sorted.assignment_rules.sort_by(|a, b| {
        (a.record_type_key.as_str(), a.strategy_type.as_str())
            .cmp(&(b.record_type_key.as_str(), b.strategy_type.as_str()))
    });
    sorted.workflows.sort_by(|a, b| a.key.cmp(&b.key));
    for wf in &mut sorted.workflows {
        wf.steps.sort_by_key(|s| s.ordering);
    }
    sorted.roles.sort_by(|a, b| a.key.cmp(&b.key));

    // Round-trip through Value so object keys come out of the ordered map
    // lexicographically, independent of struct field declaration order.
    let value = serde_json::to_value(&sorted)
        .map_err(|e| ChangeOpsError::InvariantViolation(format!("canonical encode: {}", e)))?;
    serde_json::to_string(&value)
        .map_err(|e| ChangeOpsError::InvariantViolation(format!("canonical encode: {}", e)))
}

/// SHA-256 of the canonical form, hex encoded.
pub fn checksum(package: &Package) -> Result<String, ChangeOpsError> {
    let canonical_form = canonical(package)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical_form.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    Ok(out)
}

// --- Draft patch algebra ---

/// Explicit typed patch operations accepted by the draft engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DraftPatchOp {
    AddField {
        record_type_key: String,
        field: Field,
    },
    RenameField {
        record_type_key: String,
        from: String,
        to: String,
    },
    RemoveField {
        record_type_key: String,
        field_name: String,
    },
    SetSla {
        record_type_key: String,
        duration_minutes: u64,
    },
    SetAssignmentGroup {
        record_type_key: String,
        group_key: String,
    },
}

/// Apply a patch batch all-or-nothing: the first failing op rejects the whole
/// batch and the input package is returned untouched to the caller.
pub fn apply_ops(package: &Package, ops: &[DraftPatchOp]) -> Result<Package, ChangeOpsError> {
    let mut patched = package.clone();
    for op in ops {
        apply_one(&mut patched, op).map_err(|issue| ChangeOpsError::Validation(vec![issue]))?;
    }
    let issues = validate(&patched);
    if !issues.is_empty() {
        return Err(ChangeOpsError::Validation(issues));
    }
    Ok(patched)
}

fn apply_one(package: &mut Package, op: &DraftPatchOp) -> Result<(), ValidationIssue> {
    match op {
        DraftPatchOp::AddField {
            record_type_key,
            field,
        } => {
            let rt = require_record_type(package, record_type_key)?;
            if rt.field(&field.name).is_some() {
                return Err(ValidationIssue::for_record_type(
                    "FIELD_EXISTS",
                    format!("field '{}' already exists on '{}'", field.name, record_type_key),
                    record_type_key,
                ));
            }
            rt.fields.push(field.clone());
            Ok(())
        }
        DraftPatchOp::RenameField {
            record_type_key,
            from,
            to,
        } => {
            let rt = require_record_type(package, record_type_key)?;
            if rt.field(to).is_some() {
                return Err(ValidationIssue::for_record_type(
                    "FIELD_EXISTS",
                    format!("field '{}' already exists on '{}'", to, record_type_key),
                    record_type_key,
                ));
            }
            let Some(field) = rt.fields.iter_mut().find(|f| f.name == *from) else {
                return Err(unknown_field(record_type_key, from));
            };
            field.name = to.clone();
            Ok(())
        }
        DraftPatchOp::RemoveField {
            record_type_key,
            field_name,
        } => {
            let rt = require_record_type(package, record_type_key)?;
            let Some(field) = rt.field(field_name) else {
                return Err(unknown_field(record_type_key, field_name));
            };
            // Required is absolute: no patch may weaken it, including removal.
            if field.required {
                return Err(ValidationIssue::for_record_type(
                    "REQUIRED_FIELD_REMOVED",
                    format!(
                        "field '{}' on '{}' is required and cannot be removed",
                        field_name, record_type_key
                    ),
                    record_type_key,
                ));
            }
            rt.fields.retain(|f| f.name != *field_name);
            Ok(())
        }
        DraftPatchOp::SetSla {
            record_type_key,
            duration_minutes,
        } => {
            require_record_type(package, record_type_key)?;
            if let Some(existing) = package
                .sla_policies
                .iter_mut()
                .find(|s| s.record_type_key == *record_type_key)
            {
                existing.duration_minutes = *duration_minutes;
            } else {
                package.sla_policies.push(SlaPolicy {
                    record_type_key: record_type_key.clone(),
                    duration_minutes: *duration_minutes,
                });
            }
            Ok(())
        }
        DraftPatchOp::SetAssignmentGroup {
            record_type_key,
            group_key,
        } => {
            require_record_type(package, record_type_key)?;
            if let Some(existing) = package
                .assignment_rules
                .iter_mut()
                .find(|r| r.record_type_key == *record_type_key)
            {
                existing.strategy_type = "group".to_string();
                existing.config = AssignmentConfig {
                    group_key: Some(group_key.clone()),
                    user_id: None,
                    field: None,
                };
            } else {
                package.assignment_rules.push(AssignmentRule {
                    record_type_key: record_type_key.clone(),
                    strategy_type: "group".to_string(),
                    config: AssignmentConfig {
                        group_key: Some(group_key.clone()),
                        user_id: None,
                        field: None,
                    },
                });
            }
            Ok(())
        }
    }
}

fn require_record_type<'a>(
    package: &'a mut Package,
    key: &str,
) -> Result<&'a mut RecordType, ValidationIssue> {
    if package.record_type(key).is_none() {
        return Err(ValidationIssue::for_record_type(
            "UNKNOWN_RECORD_TYPE",
            format!("record type '{}' does not exist", key),
            key,
        ));
    }
    Ok(package.record_type_mut(key).unwrap())
}

fn unknown_field(record_type_key: &str, field_name: &str) -> ValidationIssue {
    ValidationIssue::for_record_type(
        "UNKNOWN_FIELD",
        format!("field '{}' does not exist on '{}'", field_name, record_type_key),
        record_type_key,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn helpdesk() -> Package {
        let mut package = Package::empty("vibe.helpdesk");
        package.record_types.push(RecordType {
            key: "ticket".to_string(),
            name: "Ticket".to_string(),
            base_type: None,
            fields: vec![
                Field::new("name", "string").required(),
                Field::new("priority", "string").required(),
                Field::new("description", "text"),
            ],
        });
        package.sla_policies.push(SlaPolicy {
            record_type_key: "ticket".to_string(),
            duration_minutes: 240,
        });
        package
    }

    #[test]
    fn checksum_is_invariant_under_reordering() {
        let package = helpdesk();
        let mut shuffled = package.clone();
        shuffled.record_types[0].fields.reverse();
        shuffled.sla_policies.reverse();
        assert_eq!(checksum(&package).unwrap(), checksum(&shuffled).unwrap());
    }

    #[test]
    fn checksum_changes_on_structural_change() {
        let package = helpdesk();
        let mut other = package.clone();
        other.record_types[0]
            .fields
            .push(Field::new("status", "string"));
        assert_ne!(checksum(&package).unwrap(), checksum(&other).unwrap());
    }

    #[test]
    fn canonical_drops_absent_optionals() {
        let package = helpdesk();
        let canonical_form = canonical(&package).unwrap();
        assert!(!canonical_form.contains("baseType"));
        assert!(!canonical_form.contains("null"));
    }

    #[test]
    fn validate_catches_duplicates_and_unknown_references() {
        let mut package = helpdesk();
        package.record_types.push(RecordType {
            key: "ticket".to_string(),
            name: "Ticket Again".to_string(),
            base_type: None,
            fields: vec![],
        });
        package.sla_policies.push(SlaPolicy {
            record_type_key: "asset".to_string(),
            duration_minutes: 60,
        });
        let issues = validate(&package);
        let codes: Vec<&str> = issues.iter().map(|i| i.code.as_str()).collect();
        assert!(codes.contains(&"DUPLICATE_RECORD_TYPE"));
        assert!(codes.contains(&"UNKNOWN_RECORD_TYPE"));
    }

    #[test]
    fn validate_walks_base_type_cycles_without_recursing() {
        let mut package = Package::empty("vibe.cyclic");
        package.record_types.push(RecordType {
            key: "a".to_string(),
            name: "A".to_string(),
            base_type: Some("b".to_string()),
            fields: vec![],
        });
        package.record_types.push(RecordType {
            key: "b".to_string(),
            name: "B".to_string(),
            base_type: Some("a".to_string()),
            fields: vec![],
        });
        let issues = validate(&package);
        assert!(issues.iter().any(|i| i.code == "BASE_TYPE_CYCLE"));

        // Self-base is the tightest cycle.
        let mut package = Package::empty("vibe.selfbase");
        package.record_types.push(RecordType {
            key: "node".to_string(),
            name: "Node".to_string(),
            base_type: Some("node".to_string()),
            fields: vec![],
        });
        let issues = validate(&package);
        assert!(issues.iter().any(|i| i.code == "BASE_TYPE_CYCLE"));
    }

    #[test]
    fn patch_batch_is_all_or_nothing() {
        let package = helpdesk();
        let ops = vec![
            DraftPatchOp::AddField {
                record_type_key: "ticket".to_string(),
                field: Field::new("status", "string"),
            },
            DraftPatchOp::RemoveField {
                record_type_key: "ticket".to_string(),
                field_name: "priority".to_string(),
            },
        ];
        let err = apply_ops(&package, &ops).unwrap_err();
        match err {
            ChangeOpsError::Validation(issues) => {
                assert_eq!(issues[0].code, "REQUIRED_FIELD_REMOVED");
            }
            other => panic!("expected validation error, got {other}"),
        }
        // Input untouched; the successful first op did not leak.
        assert!(package.record_type("ticket").unwrap().field("status").is_none());
    }

    #[test]
    fn patch_ops_apply_in_order() {
        let package = helpdesk();
        let ops = vec![
            DraftPatchOp::AddField {
                record_type_key: "ticket".to_string(),
                field: Field::new("status", "string"),
            },
            DraftPatchOp::RenameField {
                record_type_key: "ticket".to_string(),
                from: "status".to_string(),
                to: "state".to_string(),
            },
            DraftPatchOp::SetSla {
                record_type_key: "ticket".to_string(),
                duration_minutes: 120,
            },
            DraftPatchOp::SetAssignmentGroup {
                record_type_key: "ticket".to_string(),
                group_key: "support-l1".to_string(),
            },
        ];
        let patched = apply_ops(&package, &ops).unwrap();
        let rt = patched.record_type("ticket").unwrap();
        assert!(rt.field("state").is_some());
        assert!(rt.field("status").is_none());
        assert_eq!(patched.sla_policies[0].duration_minutes, 120);
        assert_eq!(
            patched.assignment_rules[0].config.group_key.as_deref(),
            Some("support-l1")
        );
    }

    #[test]
    fn patch_serde_round_trips_tagged_ops() {
        let raw = r#"[{"op":"remove_field","record_type_key":"ticket","field_name":"priority"}]"#;
        let ops: Vec<DraftPatchOp> = serde_json::from_str(raw).unwrap();
        assert!(matches!(&ops[0], DraftPatchOp::RemoveField { field_name, .. } if field_name == "priority"));
    }
}
