use changeops::core::context::{ActorKind, OpContext};
use changeops::core::db;
use changeops::core::error::ChangeOpsError;
use changeops::core::store::Store;
use changeops::plugins::draft::DraftEngine;
use changeops::plugins::environment::EnvironmentStore;
use changeops::plugins::producer::RuleProducer;
use changeops::plugins::promote::{PromotionMachine, PromotionStatus};
use std::sync::Arc;
use tempfile::tempdir;

const PROMPT: &str = "A helpdesk with tickets and priority";

struct Pipeline {
    store: Store,
    creator: OpContext,
    approver: OpContext,
    dev_id: String,
    prod_id: String,
}

/// Install a generated package into dev and return the environment ids.
fn setup(root: &std::path::Path) -> Pipeline {
    let store = Store::new(root.to_path_buf());
    db::initialize_all(&store.root).expect("db init");
    let creator = OpContext::new("t1", "creator", ActorKind::User).with_change("chg-1");
    let approver = OpContext::new("t1", "approver", ActorKind::User).with_change("chg-1");

    let engine = DraftEngine::new(&store, Arc::new(RuleProducer));
    let (draft, _) = engine
        .generate(&creator, "P1", None, PROMPT, None)
        .expect("generate");
    engine.preview(&creator, &draft.id).expect("preview");
    engine.install(&creator, &draft.id).expect("install");

    let env_store = EnvironmentStore::new(&store);
    let environments = env_store.list(&creator, Some("P1")).expect("environments");
    let dev_id = environments.iter().find(|e| e.name == "dev").unwrap().id.clone();
    let prod_id = environments.iter().find(|e| e.name == "prod").unwrap().id.clone();

    Pipeline {
        store,
        creator,
        approver,
        dev_id,
        prod_id,
    }
}

#[test]
fn promotion_happy_path_with_separate_approver() {
    let tmp = tempdir().expect("tempdir");
    let p = setup(tmp.path());
    let machine = PromotionMachine::new(&p.store);

    let intent = machine
        .create(&p.creator, "P1", &p.dev_id, &p.prod_id)
        .expect("create");
    assert_eq!(intent.status, PromotionStatus::Draft);

    let previewed = machine.preview(&p.creator, &intent.id).expect("preview");
    assert_eq!(previewed.status, PromotionStatus::Previewed);
    let delta = previewed.diff.as_ref().expect("diff stored");
    // Prod is empty: promoting dev removes nothing and adds the ticket type.
    assert_eq!(delta.summary.removed, 1);

    // Prod requires approval; the creator cannot self-approve.
    let selfie = machine.approve(&p.creator, &intent.id);
    assert!(matches!(selfie, Err(ChangeOpsError::InvariantViolation(_))));

    let approved = machine.approve(&p.approver, &intent.id).expect("approve");
    assert_eq!(approved.status, PromotionStatus::Approved);
    assert_eq!(approved.approved_by.as_deref(), Some("approver"));

    let executed = machine.execute(&p.creator, &intent.id).expect("execute");
    assert_eq!(executed.status, PromotionStatus::Executed);
    let result = executed.result.as_ref().expect("result recorded");
    assert_eq!(result["packageKey"], "vibe.helpdesk");

    // Dev and prod baselines are now identical.
    let delta = machine
        .environment_diff(&p.creator, &p.dev_id, &p.prod_id)
        .expect("env diff");
    assert_eq!(delta.summary.added, 0);
    assert_eq!(delta.summary.removed, 0);
    assert_eq!(delta.summary.modified, 0);

    let env_store = EnvironmentStore::new(&p.store);
    let prod_baseline = env_store
        .baseline(&p.creator, &p.prod_id)
        .expect("read")
        .expect("installed");
    assert_eq!(prod_baseline.source, "promotion");
}

#[test]
fn transitions_are_forward_only() {
    let tmp = tempdir().expect("tempdir");
    let p = setup(tmp.path());
    let machine = PromotionMachine::new(&p.store);

    let intent = machine
        .create(&p.creator, "P1", &p.dev_id, &p.prod_id)
        .expect("create");

    // Approve and execute both need their predecessor state.
    assert!(matches!(
        machine.approve(&p.approver, &intent.id),
        Err(ChangeOpsError::StateInvalid(_))
    ));
    assert!(matches!(
        machine.execute(&p.creator, &intent.id),
        Err(ChangeOpsError::StateInvalid(_))
    ));

    machine.preview(&p.creator, &intent.id).expect("preview");
    machine.approve(&p.approver, &intent.id).expect("approve");
    machine.execute(&p.creator, &intent.id).expect("execute");

    // Executed is terminal.
    assert!(matches!(
        machine.reject(&p.creator, &intent.id, None),
        Err(ChangeOpsError::StateInvalid(_))
    ));
    assert!(matches!(
        machine.preview(&p.creator, &intent.id),
        Err(ChangeOpsError::StateInvalid(_))
    ));
}

#[test]
fn reject_is_terminal_from_any_non_terminal_state() {
    let tmp = tempdir().expect("tempdir");
    let p = setup(tmp.path());
    let machine = PromotionMachine::new(&p.store);

    // From draft.
    let intent = machine
        .create(&p.creator, "P1", &p.dev_id, &p.prod_id)
        .expect("create");
    let rejected = machine
        .reject(&p.creator, &intent.id, Some("scope changed"))
        .expect("reject from draft");
    assert_eq!(rejected.status, PromotionStatus::Rejected);
    assert_eq!(rejected.error.as_deref(), Some("scope changed"));

    // From approved.
    let intent = machine
        .create(&p.creator, "P1", &p.dev_id, &p.prod_id)
        .expect("create second");
    machine.preview(&p.creator, &intent.id).expect("preview");
    machine.approve(&p.approver, &intent.id).expect("approve");
    let rejected = machine
        .reject(&p.approver, &intent.id, None)
        .expect("reject from approved");
    assert_eq!(rejected.status, PromotionStatus::Rejected);

    // Rejected is terminal.
    assert!(matches!(
        machine.reject(&p.creator, &intent.id, None),
        Err(ChangeOpsError::StateInvalid(_))
    ));
}

#[test]
fn governance_and_environment_checks_on_create() {
    let tmp = tempdir().expect("tempdir");
    let p = setup(tmp.path());
    let machine = PromotionMachine::new(&p.store);

    let ungoverned = OpContext::new("t1", "creator", ActorKind::User);
    assert!(matches!(
        machine.create(&ungoverned, "P1", &p.dev_id, &p.prod_id),
        Err(ChangeOpsError::GovernanceRequired(_))
    ));

    assert!(matches!(
        machine.create(&p.creator, "P1", &p.dev_id, &p.dev_id),
        Err(ChangeOpsError::InvariantViolation(_))
    ));

    // Environments must belong to the named project.
    let env_store = EnvironmentStore::new(&p.store);
    env_store.ensure_pipeline(&p.creator, "P2").expect("other project");
    let other_envs = env_store.list(&p.creator, Some("P2")).expect("list");
    let other_dev = &other_envs.iter().find(|e| e.name == "dev").unwrap().id;
    assert!(matches!(
        machine.create(&p.creator, "P1", &p.dev_id, other_dev),
        Err(ChangeOpsError::InvariantViolation(_))
    ));
}

#[test]
fn execute_conflict_rejects_intent_without_partial_state() {
    let tmp = tempdir().expect("tempdir");
    let p = setup(tmp.path());
    let machine = PromotionMachine::new(&p.store);
    let env_store = EnvironmentStore::new(&p.store);

    let intent = machine
        .create(&p.creator, "P1", &p.dev_id, &p.prod_id)
        .expect("create");
    machine.preview(&p.creator, &intent.id).expect("preview");
    machine.approve(&p.approver, &intent.id).expect("approve");

    // Someone installs into prod between approve and execute.
    let dev_baseline = env_store
        .baseline(&p.creator, &p.dev_id)
        .expect("read")
        .expect("dev baseline");
    env_store
        .install_baseline(&p.creator, &p.prod_id, &dev_baseline.package, "draft-install", None)
        .expect("concurrent install");

    let result = machine.execute(&p.creator, &intent.id);
    assert!(matches!(result, Err(ChangeOpsError::Conflict(_))));

    let after = machine.get(&p.creator, &intent.id).expect("reload");
    assert_eq!(after.status, PromotionStatus::Rejected);
    assert!(after.error.is_some());

    // The concurrent install is untouched.
    let prod_baseline = env_store
        .baseline(&p.creator, &p.prod_id)
        .expect("read")
        .expect("still installed");
    assert_eq!(prod_baseline.source, "draft-install");
    assert_eq!(prod_baseline.row_version, 1);
}

#[test]
fn pull_down_refreshes_lower_environment_without_approval() {
    let tmp = tempdir().expect("tempdir");
    let p = setup(tmp.path());
    let machine = PromotionMachine::new(&p.store);

    // Promote dev → prod through the full machine first.
    let intent = machine
        .create(&p.creator, "P1", &p.dev_id, &p.prod_id)
        .expect("create");
    machine.preview(&p.creator, &intent.id).expect("preview");
    machine.approve(&p.approver, &intent.id).expect("approve");
    machine.execute(&p.creator, &intent.id).expect("execute");

    // Pull prod back down into dev; no approval round-trip needed.
    let baseline = machine
        .pull_down(&p.creator, &p.prod_id, &p.dev_id)
        .expect("pull down");
    assert_eq!(baseline.source, "pull-down");
    assert_eq!(baseline.environment_id, p.dev_id);

    let ungoverned = OpContext::new("t1", "creator", ActorKind::User);
    assert!(matches!(
        machine.pull_down(&ungoverned, &p.prod_id, &p.dev_id),
        Err(ChangeOpsError::GovernanceRequired(_))
    ));
    assert!(matches!(
        machine.pull_down(&p.creator, &p.dev_id, &p.dev_id),
        Err(ChangeOpsError::InvariantViolation(_))
    ));
}

#[test]
fn drift_report_tracks_baseline_divergence() {
    let tmp = tempdir().expect("tempdir");
    let p = setup(tmp.path());
    let machine = PromotionMachine::new(&p.store);

    // Dev installed, test/prod empty: both drift from the default env.
    let report = machine.environment_drift(&p.creator, "P1").expect("drift");
    assert_eq!(report.len(), 3);
    assert_eq!(report[&p.dev_id], false);
    assert_eq!(report[&p.prod_id], true);

    // After promoting to prod, prod converges.
    let intent = machine
        .create(&p.creator, "P1", &p.dev_id, &p.prod_id)
        .expect("create");
    machine.preview(&p.creator, &intent.id).expect("preview");
    machine.approve(&p.approver, &intent.id).expect("approve");
    machine.execute(&p.creator, &intent.id).expect("execute");

    let report = machine.environment_drift(&p.creator, "P1").expect("drift after");
    assert_eq!(report[&p.prod_id], false);
}
