use changeops::core::context::{ActorKind, OpContext};
use changeops::core::db;
use changeops::core::error::ChangeOpsError;
use changeops::core::package::DraftPatchOp;
use changeops::core::store::Store;
use changeops::plugins::draft::{
    DraftEngine, DraftStatus, StreamStage, VersionReason,
};
use changeops::plugins::environment::EnvironmentStore;
use changeops::plugins::producer::RuleProducer;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tempfile::tempdir;

const HELPDESK_PROMPT: &str = "A helpdesk with tickets and priority";

fn setup(root: &std::path::Path) -> (Store, DraftEngine, OpContext) {
    let store = Store::new(root.to_path_buf());
    db::initialize_all(&store.root).expect("db init");
    let engine = DraftEngine::new(&store, Arc::new(RuleProducer));
    let ctx = OpContext::new("t1", "u1", ActorKind::User).with_change("chg-1");
    (store, engine, ctx)
}

#[test]
fn generate_preview_install_happy_path() {
    let tmp = tempdir().expect("tempdir");
    let (store, engine, ctx) = setup(tmp.path());

    let (draft, result) = engine
        .generate(&ctx, "P1", None, HELPDESK_PROMPT, None)
        .expect("generate");
    assert!(result.success);
    assert_eq!(result.attempts, 1);
    assert_eq!(draft.status, DraftStatus::Draft);
    assert_eq!(draft.package.package_key, "vibe.helpdesk");
    let ticket = draft.package.record_type("ticket").expect("ticket type");
    assert!(ticket.field("priority").is_some());

    // Same prompt, same checksum: the producer is seeded/deterministic.
    let (second, _) = engine
        .generate(&ctx, "P1", None, HELPDESK_PROMPT, None)
        .expect("second generate");
    assert_eq!(draft.checksum, second.checksum);

    let previewed = engine.preview(&ctx, &draft.id).expect("preview");
    assert_eq!(previewed.status, DraftStatus::Previewed);
    let delta = previewed.last_preview_diff.as_ref().expect("diff stored");
    assert_eq!(delta.summary.added, 1);
    assert_eq!(delta.added_record_types[0].key, "ticket");
    assert!(delta.added_record_types[0].field_count > 0);

    let (installed, install_result) = engine.install(&ctx, &draft.id).expect("install");
    assert_eq!(installed.status, DraftStatus::Installed);

    let env_store = EnvironmentStore::new(&store);
    let baseline = env_store
        .baseline(&ctx, &install_result.environment_id)
        .expect("baseline read")
        .expect("baseline installed");
    assert_eq!(baseline.checksum, installed.checksum);
    assert_eq!(baseline.package_key, "vibe.helpdesk");
    assert_eq!(baseline.source, "draft-install");
}

#[test]
fn install_requires_governance_and_valid_status() {
    let tmp = tempdir().expect("tempdir");
    let (_store, engine, ctx) = setup(tmp.path());
    let ungoverned = OpContext::new("t1", "u1", ActorKind::User);

    let (draft, _) = engine
        .generate(&ctx, "P1", None, HELPDESK_PROMPT, None)
        .expect("generate");

    let denied = engine.install(&ungoverned, &draft.id);
    assert!(matches!(denied, Err(ChangeOpsError::GovernanceRequired(_))));

    let discarded = engine.discard(&ctx, &draft.id).expect("discard");
    assert_eq!(discarded.status, DraftStatus::Discarded);
    let after_discard = engine.install(&ctx, &draft.id);
    assert!(matches!(after_discard, Err(ChangeOpsError::StateInvalid(_))));

    // Discard is terminal and not repeatable.
    assert!(matches!(
        engine.discard(&ctx, &draft.id),
        Err(ChangeOpsError::StateInvalid(_))
    ));
}

#[test]
fn removing_a_required_field_rejects_batch_and_appends_nothing() {
    let tmp = tempdir().expect("tempdir");
    let (_store, engine, ctx) = setup(tmp.path());
    let (draft, _) = engine
        .generate(&ctx, "P1", None, HELPDESK_PROMPT, None)
        .expect("generate");

    let before_versions = engine.list_versions(&ctx, &draft.id).expect("versions");
    let ops = vec![DraftPatchOp::RemoveField {
        record_type_key: "ticket".to_string(),
        field_name: "priority".to_string(),
    }];
    let err = engine.patch(&ctx, &draft.id, &ops, None).unwrap_err();
    match err {
        ChangeOpsError::Validation(issues) => {
            assert_eq!(issues[0].code, "REQUIRED_FIELD_REMOVED");
        }
        other => panic!("expected validation error, got {other}"),
    }

    let unchanged = engine.get(&ctx, &draft.id).expect("reload");
    assert_eq!(unchanged.checksum, draft.checksum);
    let after_versions = engine.list_versions(&ctx, &draft.id).expect("versions");
    assert_eq!(before_versions.len(), after_versions.len());
}

#[test]
fn version_log_is_dense_and_append_only() {
    let tmp = tempdir().expect("tempdir");
    let (_store, engine, ctx) = setup(tmp.path());
    let (draft, _) = engine
        .generate(&ctx, "P1", None, HELPDESK_PROMPT, None)
        .expect("generate");

    engine
        .refine(&ctx, &draft.id, "A helpdesk with tickets, priority and assets", None)
        .expect("refine");
    let ops = vec![DraftPatchOp::SetSla {
        record_type_key: "ticket".to_string(),
        duration_minutes: 120,
    }];
    engine.patch(&ctx, &draft.id, &ops, None).expect("patch");

    let versions = engine.list_versions(&ctx, &draft.id).expect("versions");
    let numbers: Vec<i64> = versions.iter().map(|v| v.version_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(versions[0].reason, VersionReason::Create);
    assert_eq!(versions[1].reason, VersionReason::Refine);
    assert_eq!(versions[2].reason, VersionReason::Patch);

    // The current draft checksum always has a backing version.
    let current = engine.get(&ctx, &draft.id).expect("reload");
    assert!(versions.iter().any(|v| v.checksum == current.checksum));
}

#[test]
fn restore_is_idempotent_and_appends_each_time() {
    let tmp = tempdir().expect("tempdir");
    let (_store, engine, ctx) = setup(tmp.path());
    let (draft, _) = engine
        .generate(&ctx, "P1", None, HELPDESK_PROMPT, None)
        .expect("generate");
    engine
        .refine(&ctx, &draft.id, "A helpdesk with tickets and severity", None)
        .expect("refine");

    let version_one = engine.get_version(&ctx, &draft.id, 1).expect("version 1");

    engine.restore_version(&ctx, &draft.id, 1).expect("restore once");
    engine.restore_version(&ctx, &draft.id, 1).expect("restore twice");

    let versions = engine.list_versions(&ctx, &draft.id).expect("versions");
    assert_eq!(versions.len(), 4);
    assert_eq!(versions[2].reason, VersionReason::Restore);
    assert_eq!(versions[3].reason, VersionReason::Restore);
    assert_eq!(versions[2].checksum, version_one.checksum);
    assert_eq!(versions[3].checksum, version_one.checksum);

    let current = engine.get(&ctx, &draft.id).expect("reload");
    assert_eq!(current.checksum, version_one.checksum);
}

#[test]
fn concurrent_refinement_loses_on_stale_version() {
    let tmp = tempdir().expect("tempdir");
    let (_store, engine, ctx) = setup(tmp.path());
    let (draft, _) = engine
        .generate(&ctx, "P1", None, HELPDESK_PROMPT, None)
        .expect("generate");

    // First writer wins with the version it read.
    engine
        .refine(&ctx, &draft.id, "helpdesk with tickets and status", Some(draft.version))
        .expect("first refine");
    // Second writer raced on the same snapshot and must observe CONFLICT.
    let stale = engine.refine(&ctx, &draft.id, "helpdesk with tickets and impact", Some(draft.version));
    assert!(matches!(stale, Err(ChangeOpsError::Conflict(_))));

    // Retrying against the newest version succeeds.
    let fresh = engine.get(&ctx, &draft.id).expect("reload");
    engine
        .refine(&ctx, &draft.id, "helpdesk with tickets and impact", Some(fresh.version))
        .expect("retry refine");
}

#[test]
fn variants_generate_adopt_and_diff() {
    let tmp = tempdir().expect("tempdir");
    let (_store, engine, ctx) = setup(tmp.path());

    let variants = engine
        .generate_multi(&ctx, "P1", HELPDESK_PROMPT, 3)
        .expect("generate multi");
    assert_eq!(variants.len(), 3);
    assert_eq!(variants[0].variant_index, 0);
    assert_ne!(variants[0].checksum, variants[1].checksum);

    let delta = engine
        .diff_variants(&ctx, &variants[0].id, &variants[1].id)
        .expect("variant diff");
    assert_eq!(delta.summary.modified, 1);

    // Adopt into a brand-new draft: version 1, reason create_variant.
    let adopted = engine
        .adopt_variant(&ctx, &variants[1].id, None)
        .expect("adopt into new draft");
    let versions = engine.list_versions(&ctx, &adopted.id).expect("versions");
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].reason, VersionReason::CreateVariant);
    assert_eq!(adopted.checksum, variants[1].checksum);

    // Adopt into an existing draft: appends adopt_variant.
    let (existing, _) = engine
        .generate(&ctx, "P1", None, HELPDESK_PROMPT, None)
        .expect("generate base");
    let updated = engine
        .adopt_variant(&ctx, &variants[2].id, Some(&existing.id))
        .expect("adopt into existing");
    let versions = engine.list_versions(&ctx, &existing.id).expect("versions");
    assert_eq!(versions.last().unwrap().reason, VersionReason::AdoptVariant);
    assert_eq!(updated.checksum, variants[2].checksum);
}

#[test]
fn preview_stream_emits_monotone_stages_with_final_result() {
    let tmp = tempdir().expect("tempdir");
    let (_store, engine, ctx) = setup(tmp.path());
    let cancel = Arc::new(AtomicBool::new(false));

    let rx = engine.preview_stream(&ctx, "P1", HELPDESK_PROMPT, None, true, cancel);
    let events: Vec<_> = rx.iter().collect();

    let stages: Vec<StreamStage> = events
        .iter()
        .filter(|e| e.token.is_none())
        .map(|e| e.stage)
        .collect();
    assert_eq!(
        stages,
        vec![
            StreamStage::Generation,
            StreamStage::Validation,
            StreamStage::Projection,
            StreamStage::Diff,
            StreamStage::Complete,
        ]
    );

    // Token events ride the generation stage.
    assert!(events.iter().any(|e| e.token.is_some()));

    let complete = events.last().expect("complete event");
    let payload = complete.payload.as_ref().expect("repair result payload");
    assert_eq!(payload["success"], true);
    assert_eq!(payload["package"]["packageKey"], "vibe.helpdesk");
    assert!(payload["diff"]["summary"]["added"].as_u64().unwrap() >= 1);
}

#[test]
fn canceled_stream_closes_with_canceled_error() {
    let tmp = tempdir().expect("tempdir");
    let (_store, engine, ctx) = setup(tmp.path());
    let cancel = Arc::new(AtomicBool::new(true));

    let rx = engine.preview_stream(&ctx, "P1", HELPDESK_PROMPT, None, false, cancel);
    let events: Vec<_> = rx.iter().collect();
    let last = events.last().expect("at least one event");
    assert_eq!(last.stage, StreamStage::Error);
    assert_eq!(last.payload.as_ref().unwrap()["message"], "canceled");
}

#[test]
fn multi_variant_stream_completes_each_variant_exactly_once() {
    let tmp = tempdir().expect("tempdir");
    let (_store, engine, ctx) = setup(tmp.path());
    let cancel = Arc::new(AtomicBool::new(false));

    let rx = engine.generate_multi_stream(&ctx, "P1", HELPDESK_PROMPT, 3, cancel);
    let events: Vec<_> = rx.iter().collect();

    for index in 0..3usize {
        let completes = events
            .iter()
            .filter(|e| e.stage == StreamStage::Complete && e.variant_index == Some(index))
            .count();
        assert_eq!(completes, 1, "variant {} completes exactly once", index);
    }
    // Every event is tagged with its variant.
    assert!(events.iter().all(|e| e.variant_index.is_some()));
}

#[test]
fn tenant_isolation_on_drafts() {
    let tmp = tempdir().expect("tempdir");
    let (_store, engine, ctx) = setup(tmp.path());
    let other = OpContext::new("t2", "u2", ActorKind::User);

    let (draft, _) = engine
        .generate(&ctx, "P1", None, HELPDESK_PROMPT, None)
        .expect("generate");

    assert!(matches!(
        engine.get(&other, &draft.id),
        Err(ChangeOpsError::NotFound(_))
    ));
    let listed = engine.list(&other, None).expect("list other tenant");
    assert!(listed.is_empty());
}
