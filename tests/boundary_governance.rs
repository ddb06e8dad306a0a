use changeops::core::context::{
    ActorKind, Capability, CapabilityProfile, OpContext, TenantSource, resolve_module_path,
};
use changeops::core::db;
use changeops::core::error::ChangeOpsError;
use changeops::core::store::Store;
use changeops::plugins::draft::DraftEngine;
use changeops::plugins::producer::RuleProducer;
use changeops::plugins::tenant::TenantStore;
use changeops::plugins::timeline::Timeline;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

#[test]
fn module_boundary_rejects_every_escape_shape() {
    let root = Path::new("/srv/modules/helpdesk");
    let escapes = [
        "/etc/passwd",
        "/srv/modules/helpdesk/../other",
        "..",
        "../",
        "../sibling",
        "a/../../b",
        "a/b/../../../c",
        "./../x",
        "forms/../../../../etc/shadow",
    ];
    for requested in escapes {
        let result = resolve_module_path(root, requested);
        assert!(
            matches!(result, Err(ChangeOpsError::ModuleBoundaryEscape(_))),
            "'{}' must be rejected",
            requested
        );
    }

    let allowed = ["forms/ticket.json", "./nested/./file.txt", "."];
    for requested in allowed {
        let resolved = resolve_module_path(root, requested).expect("inside boundary");
        assert!(resolved.starts_with(root));
    }
}

#[test]
fn capability_profiles_gate_tokens() {
    assert!(CapabilityProfile::CodeModuleDefault
        .require(&[Capability::FsRead, Capability::FsWrite, Capability::CmdRun])
        .is_ok());
    assert!(matches!(
        CapabilityProfile::CodeModuleDefault.require(&[Capability::NetOut]),
        Err(ChangeOpsError::CapabilityDenied(_))
    ));

    assert!(CapabilityProfile::WorkflowModuleDefault
        .require(&[Capability::FsRead, Capability::NetOut])
        .is_ok());
    assert!(matches!(
        CapabilityProfile::WorkflowModuleDefault.require(&[Capability::CmdRun]),
        Err(ChangeOpsError::CapabilityDenied(_))
    ));

    assert!(CapabilityProfile::ReadOnly.require(&[Capability::FsRead]).is_ok());
    for denied in [Capability::FsWrite, Capability::CmdRun, Capability::NetOut] {
        assert!(matches!(
            CapabilityProfile::ReadOnly.require(&[denied]),
            Err(ChangeOpsError::CapabilityDenied(_))
        ));
    }

    assert!(CapabilityProfile::parse("READ_ONLY").is_ok());
    assert!(CapabilityProfile::parse("ROOT").is_err());
}

#[test]
fn error_taxonomy_maps_to_cli_exit_codes() {
    let cases: Vec<(ChangeOpsError, i32)> = vec![
        (ChangeOpsError::validation("X", "validation"), 1),
        (ChangeOpsError::InvariantViolation("x".into()), 1),
        (ChangeOpsError::StateInvalid("x".into()), 1),
        (ChangeOpsError::GovernanceRequired("x".into()), 2),
        (ChangeOpsError::CapabilityDenied("x".into()), 2),
        (ChangeOpsError::ModuleBoundaryEscape("x".into()), 2),
        (ChangeOpsError::Conflict("x".into()), 3),
        (ChangeOpsError::NotFound("x".into()), 4),
        (ChangeOpsError::Producer("x".into()), 4),
    ];
    for (error, expected) in cases {
        assert_eq!(error.exit_code(), expected, "{error}");
    }
}

#[test]
fn tenant_context_is_enforced_on_entities() {
    let ctx = OpContext::new("t1", "u1", ActorKind::User);
    assert!(ctx.ensure_tenant("t1").is_ok());
    assert!(matches!(
        ctx.ensure_tenant("t2"),
        Err(ChangeOpsError::InvariantViolation(_))
    ));

    let system = OpContext::system("t1");
    assert_eq!(system.tenant.source, TenantSource::System);
    assert!(system.ensure_tenant("t1").is_ok());
}

#[test]
fn governed_writes_fail_closed_without_change_id() {
    let ctx = OpContext::new("t1", "u1", ActorKind::User);
    for operation in ["draft.install", "override.activate", "workflow.activate", "promotion.create"] {
        assert!(matches!(
            ctx.require_governance(operation),
            Err(ChangeOpsError::GovernanceRequired(_))
        ));
    }
    let governed = ctx.with_change("chg-9");
    assert_eq!(governed.require_governance("draft.install").unwrap(), "chg-9");
}

#[test]
fn timeline_is_tenant_scoped_and_reverse_chronological() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::new(tmp.path().to_path_buf());
    db::initialize_all(&store.root).expect("db init");

    let ctx_a = OpContext::new("t1", "u1", ActorKind::User).with_change("chg-1");
    let ctx_b = OpContext::new("t2", "u2", ActorKind::User).with_change("chg-2");
    let engine = DraftEngine::new(&store, Arc::new(RuleProducer));

    let (draft_a, _) = engine
        .generate(&ctx_a, "P1", None, "A helpdesk with tickets", None)
        .expect("tenant a draft");
    engine.preview(&ctx_a, &draft_a.id).expect("preview");
    engine.install(&ctx_a, &draft_a.id).expect("install");
    engine
        .generate(&ctx_b, "P9", None, "An orderdesk with orders", None)
        .expect("tenant b draft");

    let timeline = Timeline::new(&store);
    let entries = timeline.query(&ctx_a, None, 50).expect("timeline");
    assert!(!entries.is_empty());
    assert!(entries.iter().all(|e| e.tenant_id == "t1"));
    // Newest first: the install event precedes the generate event in the
    // returned order.
    let install_pos = entries
        .iter()
        .position(|e| e.event_type == "draft.installed")
        .expect("install event");
    let generate_pos = entries
        .iter()
        .position(|e| e.event_type == "draft.generated")
        .expect("generate event");
    assert!(install_pos < generate_pos);

    // Preview events carry the diff summary.
    let preview = entries
        .iter()
        .find(|e| e.event_type == "draft.previewed")
        .expect("preview event");
    let summary = preview.diff_summary.as_ref().expect("summary attached");
    assert_eq!(summary["added"], 1);

    // Entity filter narrows to draft events only.
    let drafts_only = timeline.query(&ctx_a, Some("draft"), 50).expect("filtered");
    assert!(drafts_only.iter().all(|e| e.entity_type == "draft"));

    let verify = timeline.verify().expect("verify");
    assert!(verify.ordered);
    assert!(verify.entity_events >= 4);
}

#[test]
fn change_records_move_forward_only() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::new(tmp.path().to_path_buf());
    db::initialize_all(&store.root).expect("db init");
    let ctx = OpContext::new("t1", "u1", ActorKind::User).with_change("bootstrap");

    let tenants = TenantStore::new(&store);
    let change = tenants.add_change(&ctx, "ship the helpdesk").expect("add");
    assert!(!change.status.allows_activation());

    // Draft cannot jump straight to merged.
    assert!(matches!(
        tenants.set_change_status(&ctx, &change.id, changeops::plugins::tenant::ChangeStatus::Merged),
        Err(ChangeOpsError::StateInvalid(_))
    ));

    let ready = tenants
        .set_change_status(&ctx, &change.id, changeops::plugins::tenant::ChangeStatus::Ready)
        .expect("ready");
    assert!(ready.status.allows_activation());
    let merged = tenants
        .set_change_status(&ctx, &change.id, changeops::plugins::tenant::ChangeStatus::Merged)
        .expect("merge");
    assert!(merged.status.allows_activation());

    // Merged is final.
    assert!(matches!(
        tenants.set_change_status(&ctx, &change.id, changeops::plugins::tenant::ChangeStatus::Ready),
        Err(ChangeOpsError::StateInvalid(_))
    ));
}

#[test]
fn tenant_registry_rejects_duplicates() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::new(tmp.path().to_path_buf());
    db::initialize_all(&store.root).expect("db init");
    let ctx = OpContext::new("t1", "admin", ActorKind::User);

    let tenants = TenantStore::new(&store);
    tenants.add_tenant(&ctx, "acme", "Acme Corp").expect("add");
    assert!(matches!(
        tenants.add_tenant(&ctx, "acme", "Acme Again"),
        Err(ChangeOpsError::StateInvalid(_))
    ));
    let all = tenants.list_tenants(&ctx).expect("list");
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].name, "Acme Corp");
}
