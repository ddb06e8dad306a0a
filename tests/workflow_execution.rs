use changeops::core::context::{ActorKind, OpContext};
use changeops::core::db;
use changeops::core::error::ChangeOpsError;
use changeops::core::store::Store;
use changeops::plugins::tenant::{ChangeStatus, TenantStore};
use changeops::plugins::workflow::{
    DefinitionStatus, ExecutionStatus, ResumeOutcome, StepExecutionStatus, StepType,
    WorkflowEngine,
};
use serde_json::json;
use tempfile::tempdir;

fn setup(root: &std::path::Path) -> (Store, WorkflowEngine, OpContext) {
    let store = Store::new(root.to_path_buf());
    db::initialize_all(&store.root).expect("db init");
    let engine = WorkflowEngine::new(&store);
    let ctx = OpContext::new("t1", "u1", ActorKind::User);
    (store, engine, ctx)
}

/// Open a change, mark it ready, and return a context governed by it.
fn governed(store: &Store, ctx: &OpContext) -> OpContext {
    let tenants = TenantStore::new(store);
    let base = ctx.clone().with_change("bootstrap");
    // Changes are created under governance-free context; only their id matters.
    let change = tenants.add_change(&base, "workflow rollout").expect("change");
    tenants
        .set_change_status(&base, &change.id, ChangeStatus::Ready)
        .expect("ready");
    ctx.clone().with_change(&change.id)
}

#[test]
fn decision_branching_runs_only_the_selected_leg() {
    let tmp = tempdir().expect("tempdir");
    let (store, engine, ctx) = setup(tmp.path());
    let gov = governed(&store, &ctx);

    let definition = engine
        .create_definition(&gov, "triage", "record", None)
        .expect("definition");
    engine
        .add_step(
            &gov,
            &definition.id,
            StepType::Decision,
            json!({
                "field": "severity",
                "operator": "equals",
                "value": "high",
                "onTrueStepIndex": 2,
                "onFalseStepIndex": 3
            }),
            None,
        )
        .expect("decision step");
    engine
        .add_step(
            &gov,
            &definition.id,
            StepType::Notification,
            json!({ "channel": "email", "recipient": "ops@example.test", "body": "fyi" }),
            None,
        )
        .expect("notify step");
    engine
        .add_step(
            &gov,
            &definition.id,
            StepType::Assignment,
            json!({ "assigneeType": "group", "groupKey": "oncall" }),
            None,
        )
        .expect("assign step");
    engine
        .add_step(
            &gov,
            &definition.id,
            StepType::Notification,
            json!({ "channel": "email", "recipient": "requester@example.test", "body": "rejected" }),
            None,
        )
        .expect("reject step");
    engine.activate(&gov, &definition.id).expect("activate");

    let execution = engine
        .start_execution(&ctx, &definition.id, "intent-1", json!({ "severity": "high" }))
        .expect("execute");
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let steps = engine
        .list_step_executions(&ctx, &execution.id)
        .expect("step executions");
    assert_eq!(steps[0].status, StepExecutionStatus::Completed);
    assert_eq!(steps[1].status, StepExecutionStatus::Pending, "leg 1 skipped");
    assert_eq!(steps[2].status, StepExecutionStatus::Completed);
    assert_eq!(steps[3].status, StepExecutionStatus::Pending, "leg 3 skipped");

    assert_eq!(steps[0].output.as_ref().unwrap()["targetStepIndex"], 2);
    assert_eq!(
        steps[2].output.as_ref().unwrap()["assignedGroup"],
        "oncall"
    );
    // Outputs accumulate under step_{orderIndex} keys.
    assert_eq!(execution.accumulated_input["step_0"]["result"], true);
    assert_eq!(execution.accumulated_input["step_2"]["assignedGroup"], "oncall");

    // The false branch picks the other leg.
    let execution = engine
        .start_execution(&ctx, &definition.id, "intent-2", json!({ "severity": "low" }))
        .expect("execute false branch");
    assert_eq!(execution.status, ExecutionStatus::Completed);
    let steps = engine
        .list_step_executions(&ctx, &execution.id)
        .expect("step executions");
    assert_eq!(steps[2].status, StepExecutionStatus::Pending);
    assert_eq!(steps[3].status, StepExecutionStatus::Completed);
}

#[test]
fn approval_pauses_then_resumes_or_fails() {
    let tmp = tempdir().expect("tempdir");
    let (store, engine, ctx) = setup(tmp.path());
    let gov = governed(&store, &ctx);

    let definition = engine
        .create_definition(&gov, "signoff", "manual", None)
        .expect("definition");
    engine
        .add_step(
            &gov,
            &definition.id,
            StepType::Approval,
            json!({ "autoApprove": false }),
            None,
        )
        .expect("approval step");
    engine
        .add_step(
            &gov,
            &definition.id,
            StepType::Notification,
            json!({ "channel": "email", "recipient": "ops@example.test", "body": "approved" }),
            None,
        )
        .expect("notify step");
    engine.activate(&gov, &definition.id).expect("activate");

    // Approved path.
    let execution = engine
        .start_execution(&ctx, &definition.id, "intent-1", json!({ "request": "deploy" }))
        .expect("execute");
    assert_eq!(execution.status, ExecutionStatus::Paused);
    let paused_step = execution.paused_at_step_id.clone().expect("paused step id");

    let steps = engine
        .list_step_executions(&ctx, &execution.id)
        .expect("steps");
    assert_eq!(steps[0].status, StepExecutionStatus::AwaitingApproval);
    assert_eq!(steps[0].id, paused_step);

    let resumed = engine
        .resume(&ctx, &execution.id, &paused_step, ResumeOutcome::Approved)
        .expect("resume approved");
    assert_eq!(resumed.status, ExecutionStatus::Completed);
    let steps = engine
        .list_step_executions(&ctx, &execution.id)
        .expect("steps after resume");
    assert_eq!(steps[0].status, StepExecutionStatus::Completed);
    assert_eq!(steps[1].status, StepExecutionStatus::Completed);
    assert_eq!(resumed.accumulated_input["step_0"]["approved"], true);

    // Rejected path.
    let execution = engine
        .start_execution(&ctx, &definition.id, "intent-2", json!({}))
        .expect("execute again");
    let paused_step = execution.paused_at_step_id.clone().expect("paused step id");
    let rejected = engine
        .resume(&ctx, &execution.id, &paused_step, ResumeOutcome::Rejected)
        .expect("resume rejected");
    assert_eq!(rejected.status, ExecutionStatus::Failed);
    let steps = engine
        .list_step_executions(&ctx, &execution.id)
        .expect("steps after reject");
    assert_eq!(steps[0].status, StepExecutionStatus::Failed);
    assert_eq!(steps[1].status, StepExecutionStatus::Pending);
}

#[test]
fn resume_validates_pause_state_and_step_identity() {
    let tmp = tempdir().expect("tempdir");
    let (store, engine, ctx) = setup(tmp.path());
    let gov = governed(&store, &ctx);

    let definition = engine
        .create_definition(&gov, "signoff", "manual", None)
        .expect("definition");
    engine
        .add_step(
            &gov,
            &definition.id,
            StepType::Approval,
            json!({ "autoApprove": false }),
            None,
        )
        .expect("approval step");
    engine.activate(&gov, &definition.id).expect("activate");

    let execution = engine
        .start_execution(&ctx, &definition.id, "intent-1", json!({}))
        .expect("execute");
    let paused_step = execution.paused_at_step_id.clone().expect("paused");

    // Wrong step execution id.
    let wrong = engine.resume(&ctx, &execution.id, "not-the-step", ResumeOutcome::Approved);
    assert!(matches!(wrong, Err(ChangeOpsError::InvariantViolation(_))));

    // Wrong tenant.
    let other = OpContext::new("t2", "u2", ActorKind::User);
    let cross = engine.resume(&other, &execution.id, &paused_step, ResumeOutcome::Approved);
    assert!(matches!(cross, Err(ChangeOpsError::NotFound(_))));

    // Completed executions refuse resume.
    engine
        .resume(&ctx, &execution.id, &paused_step, ResumeOutcome::Approved)
        .expect("resume");
    let again = engine.resume(&ctx, &execution.id, &paused_step, ResumeOutcome::Approved);
    assert!(matches!(again, Err(ChangeOpsError::InvariantViolation(_))));
}

#[test]
fn direct_execution_without_intent_fails_closed() {
    let tmp = tempdir().expect("tempdir");
    let (store, engine, ctx) = setup(tmp.path());
    let gov = governed(&store, &ctx);

    let definition = engine
        .create_definition(&gov, "auto", "manual", None)
        .expect("definition");
    engine
        .add_step(
            &gov,
            &definition.id,
            StepType::Approval,
            json!({ "autoApprove": true }),
            None,
        )
        .expect("step");
    engine.activate(&gov, &definition.id).expect("activate");

    let no_intent = engine.start_execution(&ctx, &definition.id, "", json!({}));
    assert!(matches!(no_intent, Err(ChangeOpsError::InvariantViolation(_))));
    let blank_intent = engine.start_execution(&ctx, &definition.id, "   ", json!({}));
    assert!(matches!(blank_intent, Err(ChangeOpsError::InvariantViolation(_))));
}

#[test]
fn activation_gates_on_change_state_and_decision_validation() {
    let tmp = tempdir().expect("tempdir");
    let (store, engine, ctx) = setup(tmp.path());
    let tenants = TenantStore::new(&store);

    // Draft change: activation refused.
    let base = ctx.clone().with_change("bootstrap");
    let change = tenants.add_change(&base, "not ready yet").expect("change");
    let gov_draft = ctx.clone().with_change(&change.id);
    let definition = engine
        .create_definition(&gov_draft, "gated", "manual", None)
        .expect("definition");
    engine
        .add_step(
            &gov_draft,
            &definition.id,
            StepType::Approval,
            json!({ "autoApprove": true }),
            None,
        )
        .expect("step");
    let refused = engine.activate(&gov_draft, &definition.id);
    assert!(matches!(refused, Err(ChangeOpsError::StateInvalid(_))));

    // Ready change but broken decision step: validation error.
    tenants
        .set_change_status(&base, &change.id, ChangeStatus::Ready)
        .expect("ready");
    let broken = engine
        .create_definition(&gov_draft, "broken", "manual", None)
        .expect("definition");
    engine
        .add_step(
            &gov_draft,
            &broken.id,
            StepType::Decision,
            json!({
                "field": "x",
                "operator": "truthy",
                "onTrueStepIndex": 0,
                "onFalseStepIndex": 7
            }),
            None,
        )
        .expect("decision step");
    let err = engine.activate(&gov_draft, &broken.id).unwrap_err();
    match err {
        ChangeOpsError::Validation(issues) => {
            assert!(issues.iter().any(|i| i.code == "DECISION_TARGET_UNKNOWN"));
        }
        other => panic!("expected validation error, got {other}"),
    }

    // Ungoverned activation fails closed.
    let refused = engine.activate(&ctx, &definition.id);
    assert!(matches!(refused, Err(ChangeOpsError::GovernanceRequired(_))));

    // Governed + ready + valid steps activates; retired definitions refuse execution.
    let activated = engine.activate(&gov_draft, &definition.id).expect("activate");
    assert_eq!(activated.status, DefinitionStatus::Active);
    engine.retire(&gov_draft, &definition.id).expect("retire");
    let refused = engine.start_execution(&ctx, &definition.id, "intent-1", json!({}));
    assert!(matches!(refused, Err(ChangeOpsError::StateInvalid(_))));
}

#[test]
fn no_step_executes_twice_across_pause_and_resume() {
    let tmp = tempdir().expect("tempdir");
    let (store, engine, ctx) = setup(tmp.path());
    let gov = governed(&store, &ctx);

    let definition = engine
        .create_definition(&gov, "chain", "manual", None)
        .expect("definition");
    engine
        .add_step(
            &gov,
            &definition.id,
            StepType::Notification,
            json!({ "channel": "email", "recipient": "a@example.test", "body": "first" }),
            None,
        )
        .expect("step 0");
    engine
        .add_step(
            &gov,
            &definition.id,
            StepType::Approval,
            json!({ "autoApprove": false }),
            None,
        )
        .expect("step 1");
    engine
        .add_step(
            &gov,
            &definition.id,
            StepType::Notification,
            json!({ "channel": "email", "recipient": "b@example.test", "body": "last" }),
            None,
        )
        .expect("step 2");
    engine.activate(&gov, &definition.id).expect("activate");

    let execution = engine
        .start_execution(&ctx, &definition.id, "intent-1", json!({}))
        .expect("execute");
    let paused_step = execution.paused_at_step_id.clone().expect("paused");
    let resumed = engine
        .resume(&ctx, &execution.id, &paused_step, ResumeOutcome::Approved)
        .expect("resume");
    assert_eq!(resumed.status, ExecutionStatus::Completed);

    // Step 0 ran before the pause and kept its original output; resume
    // continued at index 2 without re-running anything.
    let steps = engine
        .list_step_executions(&ctx, &resumed.id)
        .expect("steps");
    assert_eq!(steps.len(), 3);
    assert!(steps.iter().all(|s| s.status == StepExecutionStatus::Completed));
    assert_eq!(steps[0].output.as_ref().unwrap()["body"], "first");
    assert_eq!(steps[2].output.as_ref().unwrap()["body"], "last");
    let keys: Vec<&String> = resumed
        .accumulated_input
        .as_object()
        .unwrap()
        .keys()
        .filter(|k| k.starts_with("step_"))
        .collect();
    assert_eq!(keys.len(), 3);
}
