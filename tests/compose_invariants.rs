use changeops::core::context::{ActorKind, OpContext};
use changeops::core::db;
use changeops::core::error::ChangeOpsError;
use changeops::core::store::Store;
use changeops::plugins::compose::{
    OverrideOp, OverrideStatus, OverrideStore, OverrideType,
};
use changeops::plugins::draft::DraftEngine;
use changeops::plugins::producer::RuleProducer;
use std::sync::Arc;
use tempfile::tempdir;

const PROMPT: &str = "A helpdesk with tickets and priority";

/// Install the helpdesk package into dev; returns the environment id.
fn setup(root: &std::path::Path) -> (Store, OpContext, String) {
    let store = Store::new(root.to_path_buf());
    db::initialize_all(&store.root).expect("db init");
    let ctx = OpContext::new("t1", "u1", ActorKind::User).with_change("chg-1");

    let engine = DraftEngine::new(&store, Arc::new(RuleProducer));
    let (draft, _) = engine
        .generate(&ctx, "P1", None, PROMPT, None)
        .expect("generate");
    let (_, install) = engine.install(&ctx, &draft.id).expect("install");
    (store, ctx, install.environment_id)
}

#[test]
fn override_lifecycle_with_activation_validation() {
    let tmp = tempdir().expect("tempdir");
    let (store, ctx, env_id) = setup(tmp.path());
    let overrides = OverrideStore::new(&store);

    let created = overrides
        .create(
            &ctx,
            "vibe.helpdesk",
            OverrideType::Form,
            "ticket",
            vec![OverrideOp::ToggleReadOnly {
                field_id: "description".to_string(),
                value: true,
            }],
        )
        .expect("create");
    assert_eq!(created.status, OverrideStatus::Draft);
    assert_eq!(created.version, 1);

    let activated = overrides
        .activate(&ctx, &created.id, &env_id)
        .expect("activate");
    assert_eq!(activated.status, OverrideStatus::Active);
    assert_eq!(activated.change_id.as_deref(), Some("chg-1"));

    // Active overrides cannot re-activate.
    assert!(matches!(
        overrides.activate(&ctx, &created.id, &env_id),
        Err(ChangeOpsError::StateInvalid(_))
    ));

    let retired = overrides.retire(&ctx, &created.id).expect("retire");
    assert_eq!(retired.status, OverrideStatus::Retired);
}

#[test]
fn activation_requires_governance_and_valid_patch() {
    let tmp = tempdir().expect("tempdir");
    let (store, ctx, env_id) = setup(tmp.path());
    let overrides = OverrideStore::new(&store);

    let created = overrides
        .create(
            &ctx,
            "vibe.helpdesk",
            OverrideType::Form,
            "ticket",
            vec![OverrideOp::ToggleRequired {
                field_id: "priority".to_string(),
                value: false,
            }],
        )
        .expect("create");

    let ungoverned = OpContext::new("t1", "u1", ActorKind::User);
    assert!(matches!(
        overrides.activate(&ungoverned, &created.id, &env_id),
        Err(ChangeOpsError::GovernanceRequired(_))
    ));

    // Weakening a baseline-required field is rejected at activation.
    let err = overrides.activate(&ctx, &created.id, &env_id).unwrap_err();
    match err {
        ChangeOpsError::Validation(issues) => {
            assert!(issues.iter().any(|i| i.code == "REQUIRED_INVARIANT"));
        }
        other => panic!("expected validation error, got {other}"),
    }

    // Unknown fields are rejected too.
    let ghost = overrides
        .create(
            &ctx,
            "vibe.helpdesk",
            OverrideType::Form,
            "ticket",
            vec![OverrideOp::ToggleVisible {
                field_id: "no_such_field".to_string(),
                value: false,
            }],
        )
        .expect("create ghost");
    let err = overrides.activate(&ctx, &ghost.id, &env_id).unwrap_err();
    match err {
        ChangeOpsError::Validation(issues) => {
            assert!(issues.iter().any(|i| i.code == "UNKNOWN_FIELD"));
        }
        other => panic!("expected validation error, got {other}"),
    }
}

#[test]
fn composition_layers_active_overrides_deterministically() {
    let tmp = tempdir().expect("tempdir");
    let (store, ctx, env_id) = setup(tmp.path());
    let overrides = OverrideStore::new(&store);

    let first = overrides
        .create(
            &ctx,
            "vibe.helpdesk",
            OverrideType::Form,
            "ticket",
            vec![OverrideOp::ToggleVisible {
                field_id: "description".to_string(),
                value: false,
            }],
        )
        .expect("first");
    let second = overrides
        .create(
            &ctx,
            "vibe.helpdesk",
            OverrideType::Form,
            "ticket",
            vec![
                OverrideOp::ToggleVisible {
                    field_id: "description".to_string(),
                    value: true,
                },
                OverrideOp::ToggleReadOnly {
                    field_id: "description".to_string(),
                    value: true,
                },
            ],
        )
        .expect("second");
    overrides.activate(&ctx, &first.id, &env_id).expect("activate first");
    overrides.activate(&ctx, &second.id, &env_id).expect("activate second");

    let forms = overrides
        .compose_module(&ctx, &env_id, "vibe.helpdesk")
        .expect("compose");
    let ticket_form = forms.iter().find(|f| f.target_ref == "ticket").expect("form");
    let description = ticket_form
        .fields
        .iter()
        .find(|f| f.id == "description")
        .expect("field");
    // The later override wins the visibility battle and adds read-only.
    assert!(description.visible);
    assert!(description.read_only);
    assert!(ticket_form.composition_errors.is_empty());

    // Draft overrides never compose.
    let draft_only = overrides
        .create(
            &ctx,
            "vibe.helpdesk",
            OverrideType::Form,
            "ticket",
            vec![OverrideOp::ToggleVisible {
                field_id: "priority".to_string(),
                value: false,
            }],
        )
        .expect("draft override");
    assert_eq!(draft_only.status, OverrideStatus::Draft);
    let forms = overrides
        .compose_module(&ctx, &env_id, "vibe.helpdesk")
        .expect("compose again");
    let ticket_form = forms.iter().find(|f| f.target_ref == "ticket").expect("form");
    let priority = ticket_form.fields.iter().find(|f| f.id == "priority").expect("field");
    assert!(priority.visible);
}

#[test]
fn required_fields_stay_required_after_composition() {
    let tmp = tempdir().expect("tempdir");
    let (store, ctx, env_id) = setup(tmp.path());
    let overrides = OverrideStore::new(&store);

    overrides
        .create(
            &ctx,
            "vibe.helpdesk",
            OverrideType::Form,
            "ticket",
            vec![OverrideOp::MoveField {
                field_id: "priority".to_string(),
                to_section_id: "main".to_string(),
            }],
        )
        .and_then(|o| overrides.activate(&ctx, &o.id, &env_id))
        .expect("benign override");

    let forms = overrides
        .compose_module(&ctx, &env_id, "vibe.helpdesk")
        .expect("compose");
    for form in &forms {
        for field in &form.fields {
            if field.baseline_required {
                assert!(field.effective_required, "required invariant on {}", field.id);
            }
        }
    }
}

#[test]
fn baseline_drift_surfaces_as_composition_errors() {
    let tmp = tempdir().expect("tempdir");
    let (store, ctx, env_id) = setup(tmp.path());
    let overrides = OverrideStore::new(&store);

    let against_description = overrides
        .create(
            &ctx,
            "vibe.helpdesk",
            OverrideType::Form,
            "ticket",
            vec![OverrideOp::ToggleReadOnly {
                field_id: "description".to_string(),
                value: true,
            }],
        )
        .expect("create");
    overrides
        .activate(&ctx, &against_description.id, &env_id)
        .expect("activate");

    // The baseline moves underneath: a new install drops the description
    // field.
    let engine = DraftEngine::new(&store, Arc::new(RuleProducer));
    let (draft, _) = engine
        .generate(&ctx, "P1", None, PROMPT, None)
        .expect("generate replacement");
    let ops = vec![changeops::core::package::DraftPatchOp::RemoveField {
        record_type_key: "ticket".to_string(),
        field_name: "description".to_string(),
    }];
    engine.patch(&ctx, &draft.id, &ops, None).expect("drop description");
    let (_, install) = engine.install(&ctx, &draft.id).expect("reinstall");
    assert!(
        install
            .composition_errors
            .iter()
            .any(|i| i.code == "UNKNOWN_FIELD"),
        "recompose on install reports the drift"
    );

    // The override is still active; drift does not auto-retire.
    let unchanged = overrides
        .list_for_module(&ctx, "vibe.helpdesk", Some(OverrideStatus::Active))
        .expect("list");
    assert_eq!(unchanged.len(), 1);
}
