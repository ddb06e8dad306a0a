//! Package producer boundary.
//!
//! The draft engine consumes candidate packages through [`PackageProducer`];
//! the LLM sits behind this trait out of tree. The shipped [`RuleProducer`]
//! is a deterministic prompt-to-package generator: the same prompt always
//! yields the same package, which is what makes draft checksums stable
//! across regenerations and keeps the test surface reproducible.

use crate::core::error::{ChangeOpsError, ValidationIssue};
use crate::core::package::{
    AssignmentConfig, AssignmentRule, Field, Package, RecordType, SlaPolicy,
};
use std::collections::HashSet;

/// Request handed to the producer for one generation round.
#[derive(Debug, Clone)]
pub struct ProduceRequest {
    pub prompt: String,
    pub app_name: Option<String>,
    /// Previous candidate, present on refine and repair rounds.
    pub seed: Option<Package>,
    /// Validation issues from the previous round, present on repair rounds.
    pub issues: Vec<ValidationIssue>,
}

impl ProduceRequest {
    pub fn new(prompt: &str, app_name: Option<&str>) -> Self {
        Self {
            prompt: prompt.to_string(),
            app_name: app_name.map(|s| s.to_string()),
            seed: None,
            issues: Vec::new(),
        }
    }
}

/// Candidate-package source. Implementations must be deterministic per
/// request when seeded; failures surface as `PRODUCER_ERROR`.
pub trait PackageProducer: Send + Sync {
    fn produce(&self, request: &ProduceRequest) -> Result<Package, ChangeOpsError>;

    /// Token-streaming variant for the streaming preview surface. The default
    /// emits one token per generated record-type key, then delegates.
    fn produce_with_tokens(
        &self,
        request: &ProduceRequest,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<Package, ChangeOpsError> {
        let package = self.produce(request)?;
        for rt in &package.record_types {
            on_token(&rt.key);
        }
        Ok(package)
    }
}

const PACKAGE_KEY_PREFIX: &str = "vibe.";

/// Nouns recognized as record types, with their singular keys.
const ENTITY_NOUNS: &[(&str, &str)] = &[
    ("tickets", "ticket"),
    ("ticket", "ticket"),
    ("incidents", "incident"),
    ("incident", "incident"),
    ("requests", "request"),
    ("request", "request"),
    ("orders", "order"),
    ("order", "order"),
    ("tasks", "task"),
    ("task", "task"),
    ("cases", "case"),
    ("case", "case"),
    ("assets", "asset"),
    ("asset", "asset"),
    ("customers", "customer"),
    ("customer", "customer"),
    ("employees", "employee"),
    ("employee", "employee"),
    ("approvals", "approval_item"),
];

/// Words recognized as fields on every detected record type.
const FIELD_NOUNS: &[(&str, &str)] = &[
    ("priority", "string"),
    ("status", "string"),
    ("severity", "string"),
    ("category", "string"),
    ("description", "text"),
    ("assignee", "string"),
    ("owner", "string"),
    ("due", "datetime"),
    ("deadline", "datetime"),
    ("impact", "string"),
];

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "with", "for", "of", "to", "in", "on", "by", "app",
    "application", "system", "that", "tracks", "track", "manage", "manages", "managing",
    "simple", "basic", "new",
];

/// Deterministic rule-based producer.
///
/// Tokenizes the prompt, maps known entity nouns to record types and known
/// field nouns to fields, and derives the package key from the app name or
/// the first remaining domain word. Repair rounds prune whatever the
/// validator rejected instead of regenerating.
pub struct RuleProducer;

impl RuleProducer {
    fn slug(raw: &str) -> String {
        let mut out = String::with_capacity(raw.len());
        for ch in raw.chars() {
            if ch.is_ascii_alphanumeric() {
                out.push(ch.to_ascii_lowercase());
            } else if (ch == ' ' || ch == '-' || ch == '_') && !out.ends_with('_') {
                out.push('_');
            }
        }
        out.trim_matches('_').to_string()
    }

    fn tokenize(prompt: &str) -> Vec<String> {
        prompt
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_ascii_lowercase())
            .collect()
    }

    fn build(&self, request: &ProduceRequest) -> Package {
        let tokens = Self::tokenize(&request.prompt);

        let mut record_keys: Vec<String> = Vec::new();
        let mut field_specs: Vec<(&str, &str)> = Vec::new();
        let mut domain_word: Option<String> = None;

        for token in &tokens {
            if let Some((_, key)) = ENTITY_NOUNS.iter().find(|(noun, _)| noun == token) {
                if !record_keys.iter().any(|k| k == key) {
                    record_keys.push((*key).to_string());
                }
                continue;
            }
            if let Some(spec) = FIELD_NOUNS.iter().find(|(noun, _)| noun == token) {
                if !field_specs.iter().any(|(name, _)| name == &spec.0) {
                    field_specs.push(*spec);
                }
                continue;
            }
            if domain_word.is_none() && !STOPWORDS.contains(&token.as_str()) {
                domain_word = Some(token.clone());
            }
        }

        let slug = request
            .app_name
            .as_deref()
            .map(Self::slug)
            .filter(|s| !s.is_empty())
            .or(domain_word)
            .unwrap_or_else(|| "app".to_string());

        let mut package = Package::empty(&format!("{}{}", PACKAGE_KEY_PREFIX, slug));

        if record_keys.is_empty() {
            record_keys.push("record".to_string());
        }
        for key in &record_keys {
            let mut fields = vec![Field::new("name", "string").required()];
            for (name, field_type) in &field_specs {
                fields.push(Field::new(name, field_type).required());
            }
            if !field_specs.iter().any(|(name, _)| *name == "description") {
                fields.push(Field::new("description", "text"));
            }
            package.record_types.push(RecordType {
                key: key.clone(),
                name: title_case(key),
                base_type: None,
                fields,
            });
        }

        if tokens.iter().any(|t| t == "sla" || t == "slas" || t == "deadline") {
            for key in &record_keys {
                package.sla_policies.push(SlaPolicy {
                    record_type_key: key.clone(),
                    duration_minutes: 240,
                });
            }
        }
        if tokens.iter().any(|t| t == "team" || t == "group" || t == "queue") {
            for key in &record_keys {
                package.assignment_rules.push(AssignmentRule {
                    record_type_key: key.clone(),
                    strategy_type: "group".to_string(),
                    config: AssignmentConfig {
                        group_key: Some(format!("{}_queue", key)),
                        user_id: None,
                        field: None,
                    },
                });
            }
        }

        package
    }

    /// Repair a seeded candidate by removing what the validator rejected:
    /// duplicate entities and danglers referencing unknown record types.
    fn repair(&self, seed: &Package, issues: &[ValidationIssue]) -> Package {
        let mut repaired = seed.clone();
        let flagged: HashSet<&str> = issues
            .iter()
            .filter_map(|i| i.record_type_key.as_deref())
            .collect();

        let mut seen: HashSet<String> = HashSet::new();
        repaired.record_types.retain(|rt| seen.insert(rt.key.clone()));
        for rt in &mut repaired.record_types {
            let mut seen_fields: HashSet<String> = HashSet::new();
            rt.fields.retain(|f| seen_fields.insert(f.name.clone()));
            if let Some(base) = rt.base_type.clone() {
                let base_unknown = issues.iter().any(|i| {
                    i.code == "UNKNOWN_BASE_TYPE" || i.code == "BASE_TYPE_CYCLE"
                }) && flagged.contains(rt.key.as_str());
                if base_unknown || base == rt.key {
                    rt.base_type = None;
                }
            }
        }

        let keys: HashSet<String> = repaired.record_types.iter().map(|rt| rt.key.clone()).collect();
        repaired
            .sla_policies
            .retain(|s| keys.contains(&s.record_type_key));
        repaired
            .assignment_rules
            .retain(|r| keys.contains(&r.record_type_key));
        repaired.workflows.retain(|w| keys.contains(&w.record_type_key));

        let mut seen_wf: HashSet<String> = HashSet::new();
        repaired.workflows.retain(|w| seen_wf.insert(w.key.clone()));

        repaired
    }
}

impl PackageProducer for RuleProducer {
    fn produce(&self, request: &ProduceRequest) -> Result<Package, ChangeOpsError> {
        if request.prompt.trim().is_empty() {
            return Err(ChangeOpsError::Producer(
                "empty prompt: nothing to generate from".to_string(),
            ));
        }
        if !request.issues.is_empty() {
            if let Some(seed) = &request.seed {
                return Ok(self.repair(seed, &request.issues));
            }
        }
        let mut package = self.build(request);
        // Refinement keeps the seed's identity and folds new structure in.
        if let Some(seed) = &request.seed {
            package.package_key = seed.package_key.clone();
            for rt in &seed.record_types {
                if package.record_type(&rt.key).is_none() {
                    package.record_types.push(rt.clone());
                } else if let Some(merged) = package.record_type_mut(&rt.key) {
                    for field in &rt.fields {
                        if merged.field(&field.name).is_none() {
                            merged.fields.push(field.clone());
                        }
                    }
                }
            }
            for sla in &seed.sla_policies {
                if !package
                    .sla_policies
                    .iter()
                    .any(|s| s.record_type_key == sla.record_type_key)
                {
                    package.sla_policies.push(sla.clone());
                }
            }
            for rule in &seed.assignment_rules {
                if !package.assignment_rules.iter().any(|r| {
                    r.record_type_key == rule.record_type_key
                        && r.strategy_type == rule.strategy_type
                }) {
                    package.assignment_rules.push(rule.clone());
                }
            }
            for wf in &seed.workflows {
                if !package.workflows.iter().any(|w| w.key == wf.key) {
                    package.workflows.push(wf.clone());
                }
            }
        }
        Ok(package)
    }

    fn produce_with_tokens(
        &self,
        request: &ProduceRequest,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<Package, ChangeOpsError> {
        for token in RuleProducer::tokenize(&request.prompt) {
            on_token(&token);
        }
        self.produce(request)
    }
}

fn title_case(raw: &str) -> String {
    raw.split('_')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::package;

    #[test]
    fn helpdesk_prompt_yields_stable_package() {
        let producer = RuleProducer;
        let request = ProduceRequest::new("A helpdesk with tickets and priority", None);
        let first = producer.produce(&request).unwrap();
        let second = producer.produce(&request).unwrap();

        assert_eq!(first.package_key, "vibe.helpdesk");
        let ticket = first.record_type("ticket").expect("ticket record type");
        assert!(ticket.field("priority").is_some());
        assert_eq!(
            package::checksum(&first).unwrap(),
            package::checksum(&second).unwrap()
        );
    }

    #[test]
    fn app_name_wins_over_domain_word() {
        let producer = RuleProducer;
        let request = ProduceRequest::new("A helpdesk with tickets", Some("Support Desk"));
        let package = producer.produce(&request).unwrap();
        assert_eq!(package.package_key, "vibe.support_desk");
    }

    #[test]
    fn repair_round_prunes_rejected_structure() {
        let producer = RuleProducer;
        let mut seed = Package::empty("vibe.broken");
        seed.record_types.push(RecordType {
            key: "ticket".to_string(),
            name: "Ticket".to_string(),
            base_type: None,
            fields: vec![Field::new("name", "string")],
        });
        seed.record_types.push(RecordType {
            key: "ticket".to_string(),
            name: "Ticket Again".to_string(),
            base_type: None,
            fields: vec![],
        });
        seed.sla_policies.push(SlaPolicy {
            record_type_key: "asset".to_string(),
            duration_minutes: 60,
        });

        let issues = crate::core::package::validate(&seed);
        assert!(!issues.is_empty());

        let mut request = ProduceRequest::new("broken", None);
        request.seed = Some(seed);
        request.issues = issues;
        let repaired = producer.produce(&request).unwrap();
        assert!(crate::core::package::validate(&repaired).is_empty());
    }

    #[test]
    fn streaming_emits_prompt_tokens() {
        let producer = RuleProducer;
        let request = ProduceRequest::new("helpdesk tickets", None);
        let mut tokens = Vec::new();
        producer
            .produce_with_tokens(&request, &mut |t| tokens.push(t.to_string()))
            .unwrap();
        assert_eq!(tokens, vec!["helpdesk".to_string(), "tickets".to_string()]);
    }
}
