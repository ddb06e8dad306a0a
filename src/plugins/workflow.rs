//! Workflow engine: definition lifecycle and deterministic execution.
//!
//! Execution is an index-based loop over the definition's steps, sorted by
//! `order_index` (dense, 0-based). Step outputs merge into the accumulated
//! input under `step_{order_index}` keys. Decision steps jump to explicit
//! branch targets; approval steps pause the execution until an external
//! resume. A definition activates only while its linked change is ready or
//! merged and every decision step carries two in-range branch targets.
//!
//! Executions are created exclusively by the intent dispatcher: every
//! execution carries a non-empty `intent_id`, and any path that tries to
//! start one without it fails closed.

use crate::core::broker::DbBroker;
use crate::core::context::OpContext;
use crate::core::db;
use crate::core::error::{ChangeOpsError, ValidationIssue};
use crate::core::store::Store;
use crate::core::time;
use crate::plugins::tenant::TenantStore;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    Draft,
    Active,
    Retired,
}

impl DefinitionStatus {
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
                "unknown definition status '{}'",
                other
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Assignment,
    Approval,
    Notification,
    Decision,
}

impl StepType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Assignment => "assignment",
            Self::Approval => "approval",
            Self::Notification => "notification",
            Self::Decision => "decision",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ChangeOpsError> {
        match raw {
            "assignment" => Ok(Self::Assignment),
            "approval" => Ok(Self::Approval),
            "notification" => Ok(Self::Notification),
            "decision" => Ok(Self::Decision),
            other => Err(ChangeOpsError::InvariantViolation(format!(
                "unknown step type '{}'",
                other
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

impl ExecutionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Result<Self, ChangeOpsError> {
        match raw {
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ChangeOpsError::InvariantViolation(format!(
                "unknown execution status '{}'",
                other
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepExecutionStatus {
    Pending,
    AwaitingApproval,
    Completed,
    Failed,
}

impl StepExecutionStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Result<Self, ChangeOpsError> {
        match raw {
            "pending" => Ok(Self::Pending),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ChangeOpsError::InvariantViolation(format!(
                "unknown step execution status '{}'",
                other
            ))),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResumeOutcome {
    Approved,
    Rejected,
}

// --- Typed step configs ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssigneeKind {
    User,
    Group,
    Field,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentConfig {
    pub assignee_type: AssigneeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalConfig {
    #[serde(default)]
    pub auto_approve: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationConfig {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_field: Option<String>,
    pub body: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOperator {
    Equals,
    NotEquals,
    Truthy,
    Falsy,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DecisionConfig {
    pub field: String,
    pub operator: DecisionOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
    pub on_true_step_index: i64,
    pub on_false_step_index: i64,
}

/// Step config decoded at the boundary by step type; downstream execution
/// only sees the typed variant.
#[derive(Debug, Clone, PartialEq)]
pub enum StepConfig {
    Assignment(AssignmentConfig),
    Approval(ApprovalConfig),
    Notification(NotificationConfig),
    Decision(DecisionConfig),
}

pub fn decode_step_config(step_type: StepType, raw: &JsonValue) -> Result<StepConfig, ChangeOpsError> {
    let result = match step_type {
        StepType::Assignment => serde_json::from_value(raw.clone()).map(StepConfig::Assignment),
        StepType::Approval => serde_json::from_value(raw.clone()).map(StepConfig::Approval),
        StepType::Notification => serde_json::from_value(raw.clone()).map(StepConfig::Notification),
        StepType::Decision => serde_json::from_value(raw.clone()).map(StepConfig::Decision),
    };
    result.map_err(|e| {
        ChangeOpsError::validation(
            "INVALID_STEP_CONFIG",
            format!("{} step config does not decode: {}", step_type.as_str(), e),
        )
    })
}

// --- Entities ---

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub trigger_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_config: Option<JsonValue>,
    pub status: DefinitionStatus,
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_id: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowStep {
    pub id: String,
    pub tenant_id: String,
    pub workflow_definition_id: String,
    pub step_type: StepType,
    pub config: JsonValue,
    pub order_index: i64,
    pub created_at: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowExecution {
    pub id: String,
    pub tenant_id: String,
    pub workflow_definition_id: String,
    pub intent_id: String,
    pub status: ExecutionStatus,
    pub input: JsonValue,
    pub accumulated_input: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at_step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    pub version: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowStepExecution {
    pub id: String,
    pub tenant_id: String,
    pub execution_id: String,
    pub step_id: String,
    pub order_index: i64,
    pub status: StepExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<String>,
}

pub struct WorkflowEngine {
    store: Store,
    broker: DbBroker,
}

impl WorkflowEngine {
    pub fn new(store: &Store) -> Self {
        Self {
            store: store.clone(),
            broker: DbBroker::new(&store.root),
        }
    }

    fn db_path(&self) -> std::path::PathBuf {
        db::workflow_db_path(&self.store.root)
    }

    // --- Definition lifecycle ---

    pub fn create_definition(
        &self,
        ctx: &OpContext,
        name: &str,
        trigger_type: &str,
        trigger_config: Option<JsonValue>,
    ) -> Result<WorkflowDefinition, ChangeOpsError> {
        let change_id = ctx.require_governance("workflow.create")?.to_string();
        let id = time::new_event_id();
        let def_name = name.to_string();
        let trigger = trigger_type.to_string();
        let config_json = trigger_config.map(|v| v.to_string());
        self.broker
            .with_conn(&self.db_path(), ctx, "workflow.create", |conn| {
                conn.execute(
                    "INSERT INTO workflow_definitions
                     (id, tenant_id, name, trigger_type, trigger_config, status, version, change_id, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'draft', 1, ?6, ?7)",
                    params![
                        id,
                        ctx.tenant_id(),
                        def_name,
                        trigger,
                        config_json,
                        change_id,
                        time::now_epoch_z()
                    ],
                )?;
                Ok(())
            })?;
        self.get_definition(ctx, &id)
    }

    pub fn get_definition(
        &self,
        ctx: &OpContext,
        definition_id: &str,
    ) -> Result<WorkflowDefinition, ChangeOpsError> {
        let id = definition_id.to_string();
        let definition = self
            .broker
            .with_conn(&self.db_path(), ctx, "workflow.get", |conn| {
                read_definition(conn, ctx.tenant_id(), &id)
            })?
            .ok_or_else(|| {
                ChangeOpsError::NotFound(format!("workflow definition '{}' not found", id))
            })?;
        ctx.ensure_tenant(&definition.tenant_id)?;
        Ok(definition)
    }

    pub fn list_definitions(
        &self,
        ctx: &OpContext,
        status: Option<DefinitionStatus>,
    ) -> Result<Vec<WorkflowDefinition>, ChangeOpsError> {
        self.broker
            .with_conn(&self.db_path(), ctx, "workflow.list", |conn| {
                let mut sql = String::from(
                    "SELECT id FROM workflow_definitions WHERE tenant_id = ?1",
                );
                if status.is_some() {
                    sql.push_str(" AND status = ?2");
                }
                sql.push_str(" ORDER BY created_at DESC, id DESC");
                let mut stmt = conn.prepare(&sql)?;
                let ids: Vec<String> = match status {
                    Some(s) => stmt
                        .query_map(params![ctx.tenant_id(), s.as_str()], |row| row.get(0))?
                        .collect::<Result<_, _>>()?,
                    None => stmt
                        .query_map(params![ctx.tenant_id()], |row| row.get(0))?
                        .collect::<Result<_, _>>()?,
                };
                let mut definitions = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(def) = read_definition(conn, ctx.tenant_id(), &id)? {
                        definitions.push(def);
                    }
                }
                Ok(definitions)
            })
    }

    /// Append a step. `order_index` defaults to the next dense index.
    pub fn add_step(
        &self,
        ctx: &OpContext,
        definition_id: &str,
        step_type: StepType,
        config: JsonValue,
        order_index: Option<i64>,
    ) -> Result<WorkflowStep, ChangeOpsError> {
        ctx.require_governance("workflow.add_step")?;
        let definition = self.get_definition(ctx, definition_id)?;
        if definition.status != DefinitionStatus::Draft {
            return Err(ChangeOpsError::StateInvalid(format!(
                "workflow definition '{}' is {}, steps attach to drafts only",
                definition_id,
                definition.status.as_str()
            )));
        }
        // Config must decode for its type before it is stored.
        decode_step_config(step_type, &config)?;

        let id = time::new_event_id();
        let def_id = definition_id.to_string();
        let config_json = config.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "workflow.add_step", |conn| {
                let next: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(order_index) + 1, 0) FROM workflow_steps
                     WHERE tenant_id = ?1 AND workflow_definition_id = ?2",
                    params![ctx.tenant_id(), def_id],
                    |row| row.get(0),
                )?;
                let index = order_index.unwrap_or(next);
                let taken: Option<i64> = conn
                    .query_row(
                        "SELECT order_index FROM workflow_steps
                         WHERE tenant_id = ?1 AND workflow_definition_id = ?2 AND order_index = ?3",
                        params![ctx.tenant_id(), def_id, index],
                        |row| row.get(0),
                    )
                    .optional()?;
                if taken.is_some() {
                    return Err(ChangeOpsError::InvariantViolation(format!(
                        "order index {} already taken on definition '{}'",
                        index, def_id
                    )));
                }
                conn.execute(
                    "INSERT INTO workflow_steps
                     (id, tenant_id, workflow_definition_id, step_type, config, order_index, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        id,
                        ctx.tenant_id(),
                        def_id,
                        step_type.as_str(),
                        config_json,
                        index,
                        time::now_epoch_z()
                    ],
                )?;
                Ok(())
            })?;
        let steps = self.list_steps(ctx, definition_id)?;
        steps
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| ChangeOpsError::InvariantViolation("step vanished after insert".into()))
    }

    pub fn list_steps(
        &self,
        ctx: &OpContext,
        definition_id: &str,
    ) -> Result<Vec<WorkflowStep>, ChangeOpsError> {
        let def_id = definition_id.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "workflow.steps", |conn| {
                read_steps(conn, ctx.tenant_id(), &def_id)
            })
    }

    /// Validate a definition for activation: dense 0-based ordering and
    /// well-formed decision branches pointing at existing indexes.
    pub fn validate_for_activation(steps: &[WorkflowStep]) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        if steps.is_empty() {
            issues.push(ValidationIssue::new(
                "NO_STEPS",
                "definition has no steps to execute",
            ));
            return issues;
        }
        for (position, step) in steps.iter().enumerate() {
            if step.order_index != position as i64 {
                issues.push(ValidationIssue::new(
                    "ORDER_NOT_DENSE",
                    format!(
                        "step '{}' has order index {}, expected {}",
                        step.id, step.order_index, position
                    ),
                ));
            }
        }
        let count = steps.len() as i64;
        for step in steps {
            if step.step_type != StepType::Decision {
                continue;
            }
            match decode_step_config(StepType::Decision, &step.config) {
                Err(_) => {
                    issues.push(ValidationIssue::new(
                        "DECISION_BRANCH_MISSING",
                        format!(
                            "decision step {} must carry onTrueStepIndex and onFalseStepIndex",
                            step.order_index
                        ),
                    ));
                }
                Ok(StepConfig::Decision(config)) => {
                    for target in [config.on_true_step_index, config.on_false_step_index] {
                        if target < 0 || target >= count {
                            issues.push(ValidationIssue::new(
                                "DECISION_TARGET_UNKNOWN",
                                format!(
                                    "decision step {} targets index {}, definition has {} steps",
                                    step.order_index, target, count
                                ),
                            ));
                        }
                    }
                }
                Ok(_) => unreachable!("decision decode yields decision config"),
            }
        }
        issues
    }

    /// Activate a definition. The linked change must be ready or merged and
    /// every decision step must validate.
    pub fn activate(
        &self,
        ctx: &OpContext,
        definition_id: &str,
    ) -> Result<WorkflowDefinition, ChangeOpsError> {
        let change_id = ctx.require_governance("workflow.activate")?.to_string();
        let definition = self.get_definition(ctx, definition_id)?;
        if definition.status != DefinitionStatus::Draft {
            return Err(ChangeOpsError::StateInvalid(format!(
                "workflow definition '{}' is {}, only drafts activate",
                definition_id,
                definition.status.as_str()
            )));
        }

        let tenant_store = TenantStore::new(&self.store);
        let change = tenant_store.get_change(ctx, &change_id)?;
        if !change.status.allows_activation() {
            return Err(ChangeOpsError::StateInvalid(format!(
                "change '{}' is not ready or merged; definition cannot activate",
                change_id
            )));
        }

        let steps = self.list_steps(ctx, definition_id)?;
        let issues = Self::validate_for_activation(&steps);
        if !issues.is_empty() {
            return Err(ChangeOpsError::Validation(issues));
        }

        let id = definition_id.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "workflow.activate", |conn| {
                conn.execute(
                    "UPDATE workflow_definitions SET status = 'active', change_id = ?1,
                     version = version + 1, updated_at = ?2 WHERE tenant_id = ?3 AND id = ?4",
                    params![change_id, time::now_epoch_z(), ctx.tenant_id(), id],
                )?;
                Ok(())
            })?;
        self.get_definition(ctx, definition_id)
    }

    pub fn retire(
        &self,
        ctx: &OpContext,
        definition_id: &str,
    ) -> Result<WorkflowDefinition, ChangeOpsError> {
        ctx.require_governance("workflow.retire")?;
        let definition = self.get_definition(ctx, definition_id)?;
        if definition.status == DefinitionStatus::Retired {
            return Ok(definition);
        }
        let id = definition_id.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "workflow.retire", |conn| {
                conn.execute(
                    "UPDATE workflow_definitions SET status = 'retired', version = version + 1,
                     updated_at = ?1 WHERE tenant_id = ?2 AND id = ?3",
                    params![time::now_epoch_z(), ctx.tenant_id(), id],
                )?;
                Ok(())
            })?;
        self.get_definition(ctx, definition_id)
    }

    // --- Execution ---

    /// Create and run an execution. Only the intent dispatcher calls this:
    /// a blank `intent_id` fails closed.
    pub fn start_execution(
        &self,
        ctx: &OpContext,
        definition_id: &str,
        intent_id: &str,
        input: JsonValue,
    ) -> Result<WorkflowExecution, ChangeOpsError> {
        if intent_id.trim().is_empty() {
            return Err(ChangeOpsError::InvariantViolation(
                "workflow executions require an intent id; direct execution is forbidden"
                    .to_string(),
            ));
        }
        let definition = self.get_definition(ctx, definition_id)?;
        if definition.status != DefinitionStatus::Active {
            return Err(ChangeOpsError::StateInvalid(format!(
                "workflow definition '{}' is {}, only active definitions execute",
                definition_id,
                definition.status.as_str()
            )));
        }
        let steps = self.list_steps(ctx, definition_id)?;
        let issues = Self::validate_for_activation(&steps);
        if !issues.is_empty() {
            return Err(ChangeOpsError::Validation(issues));
        }

        let execution_id = time::new_event_id();
        let def_id = definition_id.to_string();
        let intent = intent_id.to_string();
        let input_json = input.to_string();
        let accumulated = ensure_object(input);
        let accumulated_json = accumulated.to_string();

        self.broker
            .with_conn(&self.db_path(), ctx, "workflow.execute", |conn| {
                conn.execute(
                    "INSERT INTO workflow_executions
                     (id, tenant_id, workflow_definition_id, intent_id, status, input,
                      accumulated_input, started_at, version)
                     VALUES (?1, ?2, ?3, ?4, 'running', ?5, ?6, ?7, 1)",
                    params![
                        execution_id,
                        ctx.tenant_id(),
                        def_id,
                        intent,
                        input_json,
                        accumulated_json,
                        time::now_epoch_z()
                    ],
                )?;
                for step in &steps {
                    conn.execute(
                        "INSERT INTO workflow_step_executions
                         (id, tenant_id, execution_id, step_id, order_index, status)
                         VALUES (?1, ?2, ?3, ?4, ?5, 'pending')",
                        params![
                            time::new_event_id(),
                            ctx.tenant_id(),
                            execution_id,
                            step.id,
                            step.order_index
                        ],
                    )?;
                }
                run_loop(conn, ctx, &execution_id, &steps, accumulated, 0)?;
                Ok(())
            })?;
        self.get_execution(ctx, &execution_id)
    }

    /// Resume a paused execution at its awaiting approval step.
    pub fn resume(
        &self,
        ctx: &OpContext,
        execution_id: &str,
        step_execution_id: &str,
        outcome: ResumeOutcome,
    ) -> Result<WorkflowExecution, ChangeOpsError> {
        let execution = self.get_execution(ctx, execution_id)?;
        ctx.ensure_tenant(&execution.tenant_id)?;
        if execution.status != ExecutionStatus::Paused {
            return Err(ChangeOpsError::InvariantViolation(format!(
                "execution '{}' is {}, resume requires paused",
                execution_id,
                execution.status.as_str()
            )));
        }
        if execution.paused_at_step_id.as_deref() != Some(step_execution_id) {
            return Err(ChangeOpsError::InvariantViolation(format!(
                "step execution '{}' is not where execution '{}' paused",
                step_execution_id, execution_id
            )));
        }

        let steps = self.list_steps(ctx, &execution.workflow_definition_id)?;
        let exec_id = execution_id.to_string();
        let step_exec_id = step_execution_id.to_string();
        let accumulated = execution.accumulated_input.clone();

        self.broker
            .with_conn(&self.db_path(), ctx, "workflow.resume", |conn| {
                let paused_index: i64 = conn.query_row(
                    "SELECT order_index FROM workflow_step_executions
                     WHERE tenant_id = ?1 AND id = ?2",
                    params![ctx.tenant_id(), step_exec_id],
                    |row| row.get(0),
                )?;

                match outcome {
                    ResumeOutcome::Approved => {
                        let output = serde_json::json!({ "approved": true });
                        finish_step(
                            conn,
                            ctx,
                            &step_exec_id,
                            StepExecutionStatus::Completed,
                            &output,
                        )?;
                        let mut accumulated = ensure_object(accumulated);
                        merge_step_output(&mut accumulated, paused_index, output);
                        conn.execute(
                            "UPDATE workflow_executions SET status = 'running',
                             paused_at_step_id = NULL, accumulated_input = ?1,
                             version = version + 1 WHERE tenant_id = ?2 AND id = ?3",
                            params![accumulated.to_string(), ctx.tenant_id(), exec_id],
                        )?;
                        run_loop(conn, ctx, &exec_id, &steps, accumulated, paused_index + 1)?;
                    }
                    ResumeOutcome::Rejected => {
                        let output = serde_json::json!({ "approved": false });
                        finish_step(
                            conn,
                            ctx,
                            &step_exec_id,
                            StepExecutionStatus::Failed,
                            &output,
                        )?;
                        fail_execution(conn, ctx, &exec_id, "approval rejected")?;
                    }
                }
                Ok(())
            })?;
        self.get_execution(ctx, execution_id)
    }

    pub fn get_execution(
        &self,
        ctx: &OpContext,
        execution_id: &str,
    ) -> Result<WorkflowExecution, ChangeOpsError> {
        let id = execution_id.to_string();
        let execution = self
            .broker
            .with_conn(&self.db_path(), ctx, "workflow.execution.get", |conn| {
                read_execution(conn, ctx.tenant_id(), &id)
            })?
            .ok_or_else(|| ChangeOpsError::NotFound(format!("execution '{}' not found", id)))?;
        ctx.ensure_tenant(&execution.tenant_id)?;
        Ok(execution)
    }

    pub fn list_executions(
        &self,
        ctx: &OpContext,
        definition_id: Option<&str>,
    ) -> Result<Vec<WorkflowExecution>, ChangeOpsError> {
        let def = definition_id.map(|s| s.to_string());
        self.broker
            .with_conn(&self.db_path(), ctx, "workflow.execution.list", |conn| {
                let mut sql = String::from(
                    "SELECT id FROM workflow_executions WHERE tenant_id = ?1",
                );
                if def.is_some() {
                    sql.push_str(" AND workflow_definition_id = ?2");
                }
                sql.push_str(" ORDER BY started_at DESC, id DESC");
                let mut stmt = conn.prepare(&sql)?;
                let ids: Vec<String> = match &def {
                    Some(d) => stmt
                        .query_map(params![ctx.tenant_id(), d], |row| row.get(0))?
                        .collect::<Result<_, _>>()?,
                    None => stmt
                        .query_map(params![ctx.tenant_id()], |row| row.get(0))?
                        .collect::<Result<_, _>>()?,
                };
                let mut executions = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(execution) = read_execution(conn, ctx.tenant_id(), &id)? {
                        executions.push(execution);
                    }
                }
                Ok(executions)
            })
    }

    pub fn list_step_executions(
        &self,
        ctx: &OpContext,
        execution_id: &str,
    ) -> Result<Vec<WorkflowStepExecution>, ChangeOpsError> {
        self.get_execution(ctx, execution_id)?;
        let id = execution_id.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "workflow.execution.steps", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, tenant_id, execution_id, step_id, order_index, status, output, executed_at
                     FROM workflow_step_executions
                     WHERE tenant_id = ?1 AND execution_id = ?2 ORDER BY order_index",
                )?;
                let rows = stmt
                    .query_map(params![ctx.tenant_id(), id], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, Option<String>>(6)?,
                            row.get::<_, Option<String>>(7)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                let mut step_executions = Vec::with_capacity(rows.len());
                for (id, tenant_id, execution_id, step_id, order_index, status_raw, output_json, executed_at) in rows {
                    step_executions.push(WorkflowStepExecution {
                        id,
                        tenant_id,
                        execution_id,
                        step_id,
                        order_index,
                        status: StepExecutionStatus::parse(&status_raw)?,
                        output: output_json
                            .map(|raw| {
                                serde_json::from_str(&raw).map_err(|e| {
                                    ChangeOpsError::InvariantViolation(format!(
                                        "corrupt step output: {}",
                                        e
                                    ))
                                })
                            })
                            .transpose()?,
                        executed_at,
                    });
                }
                Ok(step_executions)
            })
    }
}

// --- Execution loop ---

/// The index-based loop. `steps` is sorted dense; `index` is both the array
/// position and the `order_index`. Returns when the execution completes,
/// pauses, or fails.
///
/// A decision jump selects a branch leg: the targeted step runs and the
/// execution completes after it, unless that step is itself a decision
/// (which jumps again) or an approval (which pauses; resume continues at
/// the next index).
fn run_loop(
    conn: &Connection,
    ctx: &OpContext,
    execution_id: &str,
    steps: &[WorkflowStep],
    mut accumulated: JsonValue,
    mut index: i64,
) -> Result<(), ChangeOpsError> {
    let mut on_branch_leg = false;
    loop {
        if index == steps.len() as i64 {
            conn.execute(
                "UPDATE workflow_executions SET status = 'completed', accumulated_input = ?1,
                 finished_at = ?2, version = version + 1 WHERE tenant_id = ?3 AND id = ?4",
                params![
                    accumulated.to_string(),
                    time::now_epoch_z(),
                    ctx.tenant_id(),
                    execution_id
                ],
            )?;
            return Ok(());
        }
        let Some(step) = steps.get(index as usize) else {
            fail_execution(
                conn,
                ctx,
                execution_id,
                &format!("jump to unknown step index {}", index),
            )?;
            return Ok(());
        };

        let step_execution_id = step_execution_id_for(conn, ctx, execution_id, &step.id)?;
        let outcome = execute_step(step, &accumulated);
        match outcome {
            Err(message) => {
                conn.execute(
                    "UPDATE workflow_step_executions SET status = 'failed', output = ?1,
                     executed_at = ?2 WHERE tenant_id = ?3 AND id = ?4",
                    params![
                        serde_json::json!({ "error": message }).to_string(),
                        time::now_epoch_z(),
                        ctx.tenant_id(),
                        step_execution_id
                    ],
                )?;
                fail_execution(conn, ctx, execution_id, &message)?;
                return Ok(());
            }
            Ok(StepOutcome::Pause) => {
                conn.execute(
                    "UPDATE workflow_step_executions SET status = 'awaiting_approval'
                     WHERE tenant_id = ?1 AND id = ?2",
                    params![ctx.tenant_id(), step_execution_id],
                )?;
                conn.execute(
                    "UPDATE workflow_executions SET status = 'paused', paused_at_step_id = ?1,
                     accumulated_input = ?2, version = version + 1
                     WHERE tenant_id = ?3 AND id = ?4",
                    params![
                        step_execution_id,
                        accumulated.to_string(),
                        ctx.tenant_id(),
                        execution_id
                    ],
                )?;
                return Ok(());
            }
            Ok(StepOutcome::Continue { output, next }) => {
                finish_step(
                    conn,
                    ctx,
                    &step_execution_id,
                    StepExecutionStatus::Completed,
                    &output,
                )?;
                merge_step_output(&mut accumulated, step.order_index, output);
                match next {
                    Some(target) => {
                        index = target;
                        on_branch_leg = true;
                    }
                    None if on_branch_leg => {
                        // End of a branch leg.
                        index = steps.len() as i64;
                    }
                    None => index += 1,
                }
            }
        }
    }
}

enum StepOutcome {
    Continue {
        output: JsonValue,
        /// Explicit jump target for decision steps.
        next: Option<i64>,
    },
    Pause,
}

fn execute_step(step: &WorkflowStep, accumulated: &JsonValue) -> Result<StepOutcome, String> {
    let config = decode_step_config(step.step_type, &step.config)
        .map_err(|e| format!("step {} config invalid: {}", step.order_index, e))?;
    match config {
        StepConfig::Assignment(config) => {
            let (assigned_to, assigned_group) = match config.assignee_type {
                AssigneeKind::User => (
                    Some(config.user_id.ok_or_else(|| {
                        format!("step {} assigns to user but has no userId", step.order_index)
                    })?),
                    None,
                ),
                AssigneeKind::Group => (
                    None,
                    Some(config.group_key.ok_or_else(|| {
                        format!("step {} assigns to group but has no groupKey", step.order_index)
                    })?),
                ),
                AssigneeKind::Field => {
                    let field = config.field.ok_or_else(|| {
                        format!("step {} assigns by field but has no field", step.order_index)
                    })?;
                    let value = lookup(accumulated, &field).ok_or_else(|| {
                        format!(
                            "step {} assignment field '{}' not present in input",
                            step.order_index, field
                        )
                    })?;
                    (Some(value.as_str().unwrap_or_default().to_string()), None)
                }
            };
            Ok(StepOutcome::Continue {
                output: serde_json::json!({
                    "assignedTo": assigned_to,
                    "assignedGroup": assigned_group,
                }),
                next: None,
            })
        }
        StepConfig::Approval(config) => {
            if config.auto_approve {
                Ok(StepOutcome::Continue {
                    output: serde_json::json!({ "approved": true }),
                    next: None,
                })
            } else {
                Ok(StepOutcome::Pause)
            }
        }
        StepConfig::Notification(config) => {
            let recipient = match (&config.recipient, &config.recipient_field) {
                (Some(recipient), _) => recipient.clone(),
                (None, Some(field)) => lookup(accumulated, field)
                    .and_then(|v| v.as_str().map(|s| s.to_string()))
                    .unwrap_or_default(),
                (None, None) => String::new(),
            };
            Ok(StepOutcome::Continue {
                output: serde_json::json!({
                    "channel": config.channel,
                    "recipient": recipient,
                    "body": config.body,
                }),
                next: None,
            })
        }
        StepConfig::Decision(config) => {
            let value = lookup(accumulated, &config.field);
            let result = evaluate_decision(&config, value.as_ref());
            let target = if result {
                config.on_true_step_index
            } else {
                config.on_false_step_index
            };
            Ok(StepOutcome::Continue {
                output: serde_json::json!({
                    "result": result,
                    "targetStepIndex": target,
                }),
                next: Some(target),
            })
        }
    }
}

fn evaluate_decision(config: &DecisionConfig, value: Option<&JsonValue>) -> bool {
    match config.operator {
        DecisionOperator::Equals => match (value, config.value.as_ref()) {
            (Some(v), Some(expected)) => v == expected,
            _ => false,
        },
        DecisionOperator::NotEquals => match (value, config.value.as_ref()) {
            (Some(v), Some(expected)) => v != expected,
            _ => true,
        },
        DecisionOperator::Truthy => value.map(is_truthy).unwrap_or(false),
        DecisionOperator::Falsy => !value.map(is_truthy).unwrap_or(false),
    }
}

fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(a) => !a.is_empty(),
        JsonValue::Object(_) => true,
    }
}

/// Top-level lookup into the accumulated input.
fn lookup(accumulated: &JsonValue, field: &str) -> Option<JsonValue> {
    accumulated.get(field).cloned()
}

fn merge_step_output(accumulated: &mut JsonValue, order_index: i64, output: JsonValue) {
    if let Some(map) = accumulated.as_object_mut() {
        map.insert(format!("step_{}", order_index), output);
    }
}

fn ensure_object(value: JsonValue) -> JsonValue {
    if value.is_object() {
        value
    } else {
        serde_json::json!({ "value": value })
    }
}

fn step_execution_id_for(
    conn: &Connection,
    ctx: &OpContext,
    execution_id: &str,
    step_id: &str,
) -> Result<String, ChangeOpsError> {
    conn.query_row(
        "SELECT id FROM workflow_step_executions
         WHERE tenant_id = ?1 AND execution_id = ?2 AND step_id = ?3",
        params![ctx.tenant_id(), execution_id, step_id],
        |row| row.get(0),
    )
    .map_err(ChangeOpsError::RusqliteError)
}

fn finish_step(
    conn: &Connection,
    ctx: &OpContext,
    step_execution_id: &str,
    status: StepExecutionStatus,
    output: &JsonValue,
) -> Result<(), ChangeOpsError> {
    conn.execute(
        "UPDATE workflow_step_executions SET status = ?1, output = ?2, executed_at = ?3
         WHERE tenant_id = ?4 AND id = ?5",
        params![
            status.as_str(),
            output.to_string(),
            time::now_epoch_z(),
            ctx.tenant_id(),
            step_execution_id
        ],
    )?;
    Ok(())
}

fn fail_execution(
    conn: &Connection,
    ctx: &OpContext,
    execution_id: &str,
    error: &str,
) -> Result<(), ChangeOpsError> {
    conn.execute(
        "UPDATE workflow_executions SET status = 'failed', error = ?1, finished_at = ?2,
         version = version + 1 WHERE tenant_id = ?3 AND id = ?4",
        params![error, time::now_epoch_z(), ctx.tenant_id(), execution_id],
    )?;
    Ok(())
}

// --- Row plumbing ---

fn read_definition(
    conn: &Connection,
    tenant_id: &str,
    id: &str,
) -> Result<Option<WorkflowDefinition>, ChangeOpsError> {
    let row = conn
        .query_row(
            "SELECT id, tenant_id, name, trigger_type, trigger_config, status, version, change_id,
                    created_at, updated_at
             FROM workflow_definitions WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, Option<String>>(9)?,
                ))
            },
        )
        .optional()?;
    let Some((id, tenant_id, name, trigger_type, config_json, status_raw, version, change_id, created_at, updated_at)) =
        row
    else {
        return Ok(None);
    };
    Ok(Some(WorkflowDefinition {
        id,
        tenant_id,
        name,
        trigger_type,
        trigger_config: config_json
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|e| {
                    ChangeOpsError::InvariantViolation(format!("corrupt trigger config: {}", e))
                })
            })
            .transpose()?,
        status: DefinitionStatus::parse(&status_raw)?,
        version,
        change_id,
        created_at,
        updated_at,
    }))
}

fn read_steps(
    conn: &Connection,
    tenant_id: &str,
    definition_id: &str,
) -> Result<Vec<WorkflowStep>, ChangeOpsError> {
    let mut stmt = conn.prepare(
        "SELECT id, tenant_id, workflow_definition_id, step_type, config, order_index, created_at
         FROM workflow_steps WHERE tenant_id = ?1 AND workflow_definition_id = ?2
         ORDER BY order_index ASC",
    )?;
    let rows = stmt
        .query_map(params![tenant_id, definition_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let mut steps = Vec::with_capacity(rows.len());
    for (id, tenant_id, workflow_definition_id, type_raw, config_json, order_index, created_at) in rows {
        steps.push(WorkflowStep {
            id,
            tenant_id,
            workflow_definition_id,
            step_type: StepType::parse(&type_raw)?,
            config: serde_json::from_str(&config_json).map_err(|e| {
                ChangeOpsError::InvariantViolation(format!("corrupt step config: {}", e))
            })?,
            order_index,
            created_at,
        });
    }
    Ok(steps)
}

fn read_execution(
    conn: &Connection,
    tenant_id: &str,
    id: &str,
) -> Result<Option<WorkflowExecution>, ChangeOpsError> {
    let row = conn
        .query_row(
            "SELECT id, tenant_id, workflow_definition_id, intent_id, status, input,
                    accumulated_input, paused_at_step_id, error, started_at, finished_at, version
             FROM workflow_executions WHERE tenant_id = ?1 AND id = ?2",
            params![tenant_id, id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, Option<String>>(10)?,
                    row.get::<_, i64>(11)?,
                ))
            },
        )
        .optional()?;
    let Some((id, tenant_id, workflow_definition_id, intent_id, status_raw, input_json, accumulated_json, paused_at_step_id, error, started_at, finished_at, version)) =
        row
    else {
        return Ok(None);
    };
    Ok(Some(WorkflowExecution {
        id,
        tenant_id,
        workflow_definition_id,
        intent_id,
        status: ExecutionStatus::parse(&status_raw)?,
        input: serde_json::from_str(&input_json)
            .map_err(|e| ChangeOpsError::InvariantViolation(format!("corrupt input: {}", e)))?,
        accumulated_input: serde_json::from_str(&accumulated_json).map_err(|e| {
            ChangeOpsError::InvariantViolation(format!("corrupt accumulated input: {}", e))
        })?,
        paused_at_step_id,
        error,
        started_at,
        finished_at,
        version,
    }))
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "workflow",
        "version": "1.0.0",
        "description": "Workflow definitions and deterministic index-based execution",
        "commands": [
            { "name": "create", "parameters": ["name", "trigger_type"] },
            { "name": "add-step", "parameters": ["definition", "type", "config"] },
            { "name": "activate", "parameters": ["definition"] },
            { "name": "retire", "parameters": ["definition"] },
            { "name": "executions", "parameters": ["definition"] },
            { "name": "resume", "parameters": ["execution", "step", "outcome"] }
        ],
        "storage": ["workflow.db"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(order_index: i64, step_type: StepType, config: JsonValue) -> WorkflowStep {
        WorkflowStep {
            id: format!("step-{}", order_index),
            tenant_id: "t1".to_string(),
            workflow_definition_id: "wf-1".to_string(),
            step_type,
            config,
            order_index,
            created_at: "0Z".to_string(),
        }
    }

    #[test]
    fn decision_steps_require_both_branches_in_range() {
        let steps = vec![
            step(
                0,
                StepType::Decision,
                serde_json::json!({
                    "field": "severity",
                    "operator": "equals",
                    "value": "high",
                    "onTrueStepIndex": 1,
                    "onFalseStepIndex": 9
                }),
            ),
            step(
                1,
                StepType::Notification,
                serde_json::json!({ "channel": "email", "body": "hi" }),
            ),
        ];
        let issues = WorkflowEngine::validate_for_activation(&steps);
        assert!(issues.iter().any(|i| i.code == "DECISION_TARGET_UNKNOWN"));

        let steps_missing_branch = vec![step(
            0,
            StepType::Decision,
            serde_json::json!({ "field": "x", "operator": "truthy", "onTrueStepIndex": 0 }),
        )];
        let issues = WorkflowEngine::validate_for_activation(&steps_missing_branch);
        assert!(issues.iter().any(|i| i.code == "DECISION_BRANCH_MISSING"));
    }

    #[test]
    fn activation_rejects_sparse_ordering() {
        let steps = vec![
            step(
                0,
                StepType::Notification,
                serde_json::json!({ "channel": "email", "body": "a" }),
            ),
            step(
                2,
                StepType::Notification,
                serde_json::json!({ "channel": "email", "body": "b" }),
            ),
        ];
        let issues = WorkflowEngine::validate_for_activation(&steps);
        assert!(issues.iter().any(|i| i.code == "ORDER_NOT_DENSE"));
    }

    #[test]
    fn decision_operators_evaluate() {
        let config = DecisionConfig {
            field: "severity".to_string(),
            operator: DecisionOperator::Equals,
            value: Some(serde_json::json!("high")),
            on_true_step_index: 2,
            on_false_step_index: 3,
        };
        assert!(evaluate_decision(&config, Some(&serde_json::json!("high"))));
        assert!(!evaluate_decision(&config, Some(&serde_json::json!("low"))));
        assert!(!evaluate_decision(&config, None));

        let truthy = DecisionConfig {
            field: "flag".to_string(),
            operator: DecisionOperator::Truthy,
            value: None,
            on_true_step_index: 1,
            on_false_step_index: 2,
        };
        assert!(evaluate_decision(&truthy, Some(&serde_json::json!(true))));
        assert!(evaluate_decision(&truthy, Some(&serde_json::json!("x"))));
        assert!(!evaluate_decision(&truthy, Some(&serde_json::json!(""))));
        assert!(!evaluate_decision(&truthy, None));
    }

    #[test]
    fn step_outputs_merge_under_order_index_keys() {
        let mut accumulated = serde_json::json!({ "severity": "high" });
        merge_step_output(
            &mut accumulated,
            0,
            serde_json::json!({ "result": true, "targetStepIndex": 2 }),
        );
        assert_eq!(accumulated["step_0"]["result"], true);
        assert_eq!(accumulated["severity"], "high");
    }

    #[test]
    fn assignment_resolution_by_field_lookup() {
        let step = step(
            0,
            StepType::Assignment,
            serde_json::json!({ "assigneeType": "field", "field": "requested_by" }),
        );
        let accumulated = serde_json::json!({ "requested_by": "u42" });
        match execute_step(&step, &accumulated).unwrap() {
            StepOutcome::Continue { output, next } => {
                assert_eq!(output["assignedTo"], "u42");
                assert!(next.is_none());
            }
            StepOutcome::Pause => panic!("assignment does not pause"),
        }

        let missing = serde_json::json!({});
        assert!(execute_step(&step, &missing).is_err());
    }
}
