//! ChangeOps: a multi-tenant control plane for application packages.
//!
//! **ChangeOps turns prompts into typed, versioned application packages and
//! promotes them through governed environments.**
//!
//! Humans and agents describe an application; the draft engine materializes
//! it as a package (record types, workflows, SLA policies, assignment rules,
//! roles), previews the delta against a target environment, and installs it
//! as that environment's baseline. Promotion moves baselines along the
//! DEV→TEST→PROD pipeline under change control. Alongside, the workflow
//! engine executes multi-step stateful processes fed exclusively by durable
//! execution intents.
//!
//! # Core Principles
//!
//! - **Tenant-isolated**: every operation carries a tenant context and no
//!   query crosses it
//! - **Deterministic**: canonical checksums, dense version logs, index-based
//!   execution
//! - **Governed**: writes on governed entities require a change id and land
//!   in the audit log
//! - **Intent-driven**: triggers emit intents, the dispatcher executes them
//!   exactly once per idempotency key
//!
//! # Crate Structure
//!
//! - [`core`]: fundamental types and the control plane (store, broker,
//!   context, package, diff, graph)
//! - [`plugins`]: subsystem implementations (draft, compose, workflow,
//!   trigger, promote, environment, tenant, timeline)

pub mod core;
pub mod plugins;

use crate::core::context::{ActorKind, CapabilityProfile, OpContext, resolve_module_path};
use crate::core::diff::PackageDiff;
use crate::core::error::ChangeOpsError;
use crate::core::package::DraftPatchOp;
use crate::core::store::{Store, StoreConfig, find_project_root};
use crate::core::time::command_envelope;
use crate::core::{broker, db, graph};
use crate::plugins::draft::{DraftEngine, frames};
use crate::plugins::producer::RuleProducer;
use crate::plugins::promote::PromotionMachine;
use crate::plugins::tenant::{ChangeStatus, TenantStore};
use crate::plugins::timeline::Timeline;
use crate::plugins::trigger::{
    Dispatcher, RecordEvent, SchedulePoller, TriggerConfig, TriggerHub, TriggerStatus, TriggerType,
};
use crate::plugins::workflow::{
    DefinitionStatus, ResumeOutcome, StepType, WorkflowEngine,
};
use crate::plugins::{compose, environment};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::Value as JsonValue;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

#[derive(Parser, Debug)]
#[clap(
    name = "changeops",
    version = env!("CARGO_PKG_VERSION"),
    about = "The ChangeOps control plane",
    disable_version_flag = true
)]
struct Cli {
    /// Tenant id (falls back to CHANGEOPS_TENANT_ID).
    #[clap(long, global = true)]
    tenant: Option<String>,
    /// Acting principal id (falls back to CHANGEOPS_ACTOR_ID).
    #[clap(long, global = true)]
    actor: Option<String>,
    /// Actor kind: user, system, or agent.
    #[clap(long, global = true, default_value = "user")]
    actor_kind: String,
    /// Governance change id (falls back to CHANGEOPS_CHANGE_ID).
    #[clap(long, global = true)]
    change: Option<String>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bootstrap a ChangeOps project in the current directory
    Init {
        /// Directory to initialize (defaults to the current working directory).
        #[clap(short, long)]
        dir: Option<PathBuf>,
    },
    /// Show version information
    Version,
    /// Tenant registry (above tenant middleware)
    Tenant(TenantCli),
    /// Governance change records
    Change(ChangeCli),
    /// Prompt-to-package drafts
    Draft(DraftCli),
    /// Workflow definitions and executions
    Workflow(WorkflowCli),
    /// Triggers, intents, dispatcher, schedule poller
    Trigger(TriggerCli),
    /// Tenant overrides on installed modules
    Override(OverrideCli),
    /// Promotion intents between environments
    Promote(PromoteCli),
    /// Environments, baselines, env diff and drift
    Env(EnvCli),
    /// Configuration-item graph (nodes and edges)
    Graph(GraphCli),
    /// Tenant timeline from the audit log
    Timeline {
        #[clap(long)]
        entity_type: Option<String>,
        #[clap(long, default_value_t = 50)]
        limit: usize,
    },
    /// Audit log integrity
    Audit(AuditCli),
    /// Subsystem schemas for agent discovery
    Schema {
        #[clap(long)]
        subsystem: Option<String>,
    },
    /// Capability profile and module boundary checks
    Boundary(BoundaryCli),
    /// Cross-tenant shared package catalog
    Primitives(PrimitivesCli),
}

#[derive(clap::Args, Debug)]
struct TenantCli {
    #[clap(subcommand)]
    command: TenantCommand,
}

#[derive(Subcommand, Debug)]
enum TenantCommand {
    /// Register a tenant
    Add {
        #[clap(long)]
        id: String,
        #[clap(long)]
        name: String,
    },
    /// List tenants
    List,
}

#[derive(clap::Args, Debug)]
struct ChangeCli {
    #[clap(subcommand)]
    command: ChangeCommand,
}

#[derive(Subcommand, Debug)]
enum ChangeCommand {
    /// Open a change record
    Add {
        #[clap(long)]
        title: String,
    },
    /// Mark a change ready for activation
    Ready {
        #[clap(long)]
        id: String,
    },
    /// Mark a change merged
    Merge {
        #[clap(long)]
        id: String,
    },
    /// Show a change record
    Show {
        #[clap(long)]
        id: String,
    },
}

#[derive(clap::Args, Debug)]
struct DraftCli {
    #[clap(subcommand)]
    command: DraftCommand,
}

#[derive(Subcommand, Debug)]
enum DraftCommand {
    /// Generate a draft from a prompt
    Generate {
        #[clap(long)]
        project: String,
        #[clap(long)]
        prompt: String,
        #[clap(long)]
        app_name: Option<String>,
        #[clap(long)]
        environment: Option<String>,
    },
    /// List drafts
    List {
        #[clap(long)]
        project: Option<String>,
    },
    /// Show one draft
    Show {
        #[clap(long)]
        id: String,
    },
    /// Re-generate seeded with the current package
    Refine {
        #[clap(long)]
        id: String,
        #[clap(long)]
        prompt: String,
        #[clap(long)]
        expected_version: Option<i64>,
    },
    /// Apply explicit patch operations (JSON array)
    Patch {
        #[clap(long)]
        id: String,
        #[clap(long)]
        ops: String,
    },
    /// Diff against the target environment baseline
    Preview {
        #[clap(long)]
        id: String,
    },
    /// Install the package as the environment baseline
    Install {
        #[clap(long)]
        id: String,
    },
    /// Discard the draft (terminal)
    Discard {
        #[clap(long)]
        id: String,
    },
    /// Version history, or one version with --number
    Versions {
        #[clap(long)]
        id: String,
        #[clap(long)]
        number: Option<i64>,
    },
    /// Restore a version (appends, never rewrites)
    Restore {
        #[clap(long)]
        id: String,
        #[clap(long)]
        version: i64,
    },
    /// Diff two versions
    DiffVersions {
        #[clap(long)]
        id: String,
        #[clap(long)]
        from: i64,
        #[clap(long)]
        to: i64,
    },
    /// Generate k independent candidate packages
    GenerateMulti {
        #[clap(long)]
        project: String,
        #[clap(long)]
        prompt: String,
        #[clap(long, default_value_t = 3)]
        count: usize,
        /// Stream stage events as SSE frames instead of waiting
        #[clap(long)]
        stream: bool,
    },
    /// Diff two variants
    DiffVariants {
        #[clap(long)]
        a: String,
        #[clap(long)]
        b: String,
    },
    /// Adopt a variant into a draft (new draft when --draft is omitted)
    AdoptVariant {
        #[clap(long)]
        variant: String,
        #[clap(long)]
        draft: Option<String>,
    },
    /// Streaming preview as SSE frames on stdout
    PreviewStream {
        #[clap(long)]
        project: String,
        #[clap(long)]
        prompt: String,
        #[clap(long)]
        app_name: Option<String>,
        /// Also emit producer tokens
        #[clap(long)]
        tokens: bool,
    },
    /// Parse SSE frames from stdin back into events (strictness from config)
    ConsumeStream,
}

#[derive(clap::Args, Debug)]
struct WorkflowCli {
    #[clap(subcommand)]
    command: WorkflowCommand,
}

#[derive(Subcommand, Debug)]
enum WorkflowCommand {
    /// Create a draft definition
    Create {
        #[clap(long)]
        name: String,
        #[clap(long)]
        trigger_type: String,
        #[clap(long)]
        trigger_config: Option<String>,
    },
    /// List definitions
    List {
        #[clap(long)]
        status: Option<String>,
    },
    /// Append a step to a draft definition
    AddStep {
        #[clap(long)]
        definition: String,
        #[clap(long = "type")]
        step_type: String,
        #[clap(long)]
        config: String,
        #[clap(long)]
        order: Option<i64>,
    },
    /// List a definition's steps
    Steps {
        #[clap(long)]
        definition: String,
    },
    /// Activate a draft definition (change must be ready or merged)
    Activate {
        #[clap(long)]
        definition: String,
    },
    /// Retire a definition
    Retire {
        #[clap(long)]
        definition: String,
    },
    /// List executions
    Executions {
        #[clap(long)]
        definition: Option<String>,
    },
    /// Show one execution
    Execution {
        #[clap(long)]
        id: String,
    },
    /// Show an execution's step executions
    ExecutionSteps {
        #[clap(long)]
        id: String,
    },
    /// Resume a paused execution
    Resume {
        #[clap(long)]
        execution: String,
        #[clap(long)]
        step: String,
        /// approved or rejected
        #[clap(long)]
        outcome: String,
    },
}

#[derive(clap::Args, Debug)]
struct TriggerCli {
    #[clap(subcommand)]
    command: TriggerCommand,
}

#[derive(Subcommand, Debug)]
enum TriggerCommand {
    /// Create a trigger (config is the tagged JSON variant)
    Create {
        #[clap(long)]
        definition: String,
        #[clap(long)]
        config: String,
    },
    /// List triggers
    List {
        #[clap(long = "type")]
        trigger_type: Option<String>,
    },
    /// Enable a trigger
    Enable {
        #[clap(long)]
        id: String,
    },
    /// Disable a trigger
    Disable {
        #[clap(long)]
        id: String,
    },
    /// Fire a manual trigger
    Fire {
        #[clap(long)]
        id: String,
        #[clap(long, default_value = "{}")]
        payload: String,
    },
    /// Ingest a record event
    RecordEvent {
        #[clap(long)]
        record_type: String,
        #[clap(long)]
        event: String,
        #[clap(long)]
        event_id: String,
        #[clap(long)]
        after: String,
        #[clap(long)]
        before: Option<String>,
    },
    /// List intents
    Intents {
        #[clap(long)]
        status: Option<String>,
    },
    /// Recover stale intents and drain pending ones once
    Dispatch,
    /// Run the schedule poller (single pass with --once)
    Poll {
        #[clap(long)]
        once: bool,
    },
}

#[derive(clap::Args, Debug)]
struct OverrideCli {
    #[clap(subcommand)]
    command: OverrideCommand,
}

#[derive(Subcommand, Debug)]
enum OverrideCommand {
    /// Create a draft override (patch is the typed op list, JSON)
    Create {
        #[clap(long)]
        module: String,
        #[clap(long = "type")]
        override_type: String,
        #[clap(long)]
        target: String,
        #[clap(long)]
        patch: String,
    },
    /// List a module's overrides
    List {
        #[clap(long)]
        module: String,
        #[clap(long)]
        status: Option<String>,
    },
    /// Activate a draft override against an environment baseline
    Activate {
        #[clap(long)]
        id: String,
        #[clap(long)]
        environment: String,
    },
    /// Retire an override
    Retire {
        #[clap(long)]
        id: String,
    },
    /// Compose effective forms for a module in an environment
    Compose {
        #[clap(long)]
        environment: String,
        #[clap(long)]
        module: String,
    },
}

#[derive(clap::Args, Debug)]
struct PromoteCli {
    #[clap(subcommand)]
    command: PromoteCommand,
}

#[derive(Subcommand, Debug)]
enum PromoteCommand {
    /// Create a promotion intent
    Create {
        #[clap(long)]
        project: String,
        #[clap(long)]
        from: String,
        #[clap(long)]
        to: String,
    },
    /// List promotion intents
    List {
        #[clap(long)]
        project: Option<String>,
    },
    /// Show one intent
    Show {
        #[clap(long)]
        id: String,
    },
    /// Compute and store the source→target diff
    Preview {
        #[clap(long)]
        id: String,
    },
    /// Approve a previewed intent
    Approve {
        #[clap(long)]
        id: String,
    },
    /// Execute an approved intent
    Execute {
        #[clap(long)]
        id: String,
    },
    /// Reject (terminal from any non-terminal state)
    Reject {
        #[clap(long)]
        id: String,
        #[clap(long)]
        reason: Option<String>,
    },
    /// Refresh a lower environment from a higher one (no approval machine)
    PullDown {
        #[clap(long)]
        from: String,
        #[clap(long)]
        to: String,
    },
}

#[derive(clap::Args, Debug)]
struct EnvCli {
    #[clap(subcommand)]
    command: EnvCommand,
}

#[derive(Subcommand, Debug)]
enum EnvCommand {
    /// Ensure the dev/test/prod pipeline for a project
    Ensure {
        #[clap(long)]
        project: String,
    },
    /// List environments
    List {
        #[clap(long)]
        project: Option<String>,
    },
    /// Show an environment's installed baseline
    Baseline {
        #[clap(long)]
        environment: String,
    },
    /// Diff two environments' baselines
    Diff {
        #[clap(long)]
        from: String,
        #[clap(long)]
        to: String,
        /// Render a colored summary instead of JSON
        #[clap(long)]
        pretty: bool,
    },
    /// Drift report for a project's environments
    Drift {
        #[clap(long)]
        project: String,
    },
}

#[derive(clap::Args, Debug)]
struct GraphCli {
    #[clap(subcommand)]
    command: GraphCommand,
}

#[derive(Subcommand, Debug)]
enum GraphCommand {
    /// Create or update a node
    NodeUpsert {
        #[clap(long)]
        id: String,
        #[clap(long)]
        kind: String,
        #[clap(long, default_value = "{}")]
        properties: String,
        #[clap(long)]
        expected_version: Option<i64>,
    },
    /// Show a node
    NodeGet {
        #[clap(long)]
        id: String,
    },
    /// List nodes with cursor paging
    NodeList {
        #[clap(long)]
        kind: Option<String>,
        #[clap(long)]
        cursor: Option<String>,
        #[clap(long, default_value_t = 50)]
        limit: usize,
    },
    /// Delete a node and its edges
    NodeDelete {
        #[clap(long)]
        id: String,
        #[clap(long)]
        expected_version: Option<i64>,
    },
    /// Create or update an edge between two nodes
    EdgeUpsert {
        #[clap(long)]
        id: String,
        #[clap(long)]
        src: String,
        #[clap(long)]
        dst: String,
        #[clap(long)]
        kind: String,
        #[clap(long, default_value = "{}")]
        properties: String,
        #[clap(long)]
        expected_version: Option<i64>,
    },
    /// List edges with cursor paging
    EdgeList {
        #[clap(long)]
        cursor: Option<String>,
        #[clap(long, default_value_t = 50)]
        limit: usize,
    },
    /// Delete an edge
    EdgeDelete {
        #[clap(long)]
        id: String,
        #[clap(long)]
        expected_version: Option<i64>,
    },
}

#[derive(clap::Args, Debug)]
struct AuditCli {
    #[clap(subcommand)]
    command: AuditCommand,
}

#[derive(Subcommand, Debug)]
enum AuditCommand {
    /// Verify audit log integrity
    Verify,
}

#[derive(clap::Args, Debug)]
struct BoundaryCli {
    #[clap(subcommand)]
    command: BoundaryCommand,
}

#[derive(Subcommand, Debug)]
enum BoundaryCommand {
    /// Validate a module-scoped path request
    Check {
        #[clap(long)]
        module_root: PathBuf,
        #[clap(long)]
        path: String,
        /// Capability profile to check required capabilities against
        #[clap(long, default_value = "CODE_MODULE_DEFAULT")]
        profile: String,
        /// Required capability tokens (FS_READ, FS_WRITE, CMD_RUN, NET_OUT)
        #[clap(long = "require")]
        required: Vec<String>,
    },
}

#[derive(clap::Args, Debug)]
struct PrimitivesCli {
    #[clap(subcommand)]
    command: PrimitivesCommand,
}

#[derive(Subcommand, Debug)]
enum PrimitivesCommand {
    /// List package keys installed anywhere on this control plane
    Shared,
}

fn print_json(value: &JsonValue) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string()));
}

fn print_ok<T: serde::Serialize>(cmd: &str, key: &str, value: &T) {
    let payload = serde_json::json!({ key: serde_json::to_value(value).unwrap_or(JsonValue::Null) });
    print_json(&command_envelope(cmd, "ok", payload));
}

fn actor_kind(raw: &str) -> Result<ActorKind, ChangeOpsError> {
    match raw {
        "user" => Ok(ActorKind::User),
        "system" => Ok(ActorKind::System),
        "agent" => Ok(ActorKind::Agent),
        other => Err(ChangeOpsError::InvariantViolation(format!(
            "unknown actor kind '{}'",
            other
        ))),
    }
}

fn build_context(cli: &Cli) -> Result<OpContext, ChangeOpsError> {
    let tenant = match cli
        .tenant
        .clone()
        .or_else(|| std::env::var("CHANGEOPS_TENANT_ID").ok())
    {
        Some(tenant) => tenant,
        // The tenant registry sits above the tenant middleware.
        None if matches!(cli.command, Command::Tenant(_)) => {
            return Ok(OpContext::system("control-plane"));
        }
        None => {
            return Err(ChangeOpsError::InvariantViolation(
                "tenant id missing: pass --tenant or set CHANGEOPS_TENANT_ID".to_string(),
            ));
        }
    };
    let actor = cli
        .actor
        .clone()
        .or_else(|| std::env::var("CHANGEOPS_ACTOR_ID").ok())
        .unwrap_or_else(|| "unknown".to_string());
    let mut ctx = OpContext::new(&tenant, &actor, actor_kind(&cli.actor_kind)?);
    if let Some(change) = cli
        .change
        .clone()
        .or_else(|| std::env::var("CHANGEOPS_CHANGE_ID").ok())
    {
        ctx = ctx.with_change(&change);
    }
    Ok(ctx)
}

fn init_project(dir: Option<PathBuf>) -> Result<(), ChangeOpsError> {
    let target_dir = match dir {
        Some(d) => d,
        None => std::env::current_dir()?,
    };
    let root = target_dir.join(".changeops");
    fs::create_dir_all(root.join("data")).map_err(ChangeOpsError::IoError)?;
    let config_path = root.join("config.toml");
    if !config_path.exists() {
        fs::write(
            &config_path,
            "# ChangeOps runtime configuration\n\
             dispatcher_concurrency = 4\n\
             schedule_tick_secs = 60\n\
             intent_recovery_horizon_secs = 300\n\
             strict_frames = false\n",
        )
        .map_err(ChangeOpsError::IoError)?;
    }
    db::initialize_all(&root.join("data"))?;
    println!("init: ok target={}", target_dir.display());
    println!("init: status=ready");
    Ok(())
}

fn parse_json(raw: &str, what: &str) -> Result<JsonValue, ChangeOpsError> {
    serde_json::from_str(raw)
        .map_err(|e| ChangeOpsError::validation("BAD_JSON", format!("{}: {}", what, e)))
}

pub fn run() -> Result<(), ChangeOpsError> {
    let cli = Cli::parse();
    let current_dir = std::env::current_dir()?;

    match &cli.command {
        Command::Version => {
            println!("v{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Command::Init { dir } => {
            return init_project(dir.clone());
        }
        _ => {}
    }

    let project_root = find_project_root(&current_dir)?;
    let config = StoreConfig::load(&project_root);
    let store = Store::open(&project_root)?;
    db::initialize_all(&store.root)?;
    let ctx = build_context(&cli)?;

    match cli.command {
        Command::Version | Command::Init { .. } => unreachable!(),
        Command::Tenant(tenant_cli) => run_tenant(&store, &ctx, tenant_cli)?,
        Command::Change(change_cli) => run_change(&store, &ctx, change_cli)?,
        Command::Draft(draft_cli) => run_draft(&store, &ctx, &config, draft_cli)?,
        Command::Workflow(workflow_cli) => run_workflow(&store, &ctx, workflow_cli)?,
        Command::Trigger(trigger_cli) => run_trigger(&store, &ctx, &config, trigger_cli)?,
        Command::Override(override_cli) => run_override(&store, &ctx, override_cli)?,
        Command::Promote(promote_cli) => run_promote(&store, &ctx, promote_cli)?,
        Command::Env(env_cli) => run_env(&store, &ctx, env_cli)?,
        Command::Graph(graph_cli) => run_graph(&store, &ctx, graph_cli)?,
        Command::Timeline { entity_type, limit } => {
            let timeline = Timeline::new(&store);
            let entries = timeline.query(&ctx, entity_type.as_deref(), limit)?;
            print_ok("timeline.query", "entries", &entries);
        }
        Command::Audit(audit_cli) => match audit_cli.command {
            AuditCommand::Verify => {
                let timeline = Timeline::new(&store);
                let report = timeline.verify()?;
                if !report.ordered {
                    return Err(ChangeOpsError::InvariantViolation(
                        "audit log timestamps run backwards".to_string(),
                    ));
                }
                print_ok("audit.verify", "report", &report);
            }
        },
        Command::Schema { subsystem } => {
            let schemas = vec![
                broker::schema(),
                plugins::draft::schema(),
                plugins::compose::schema(),
                plugins::workflow::schema(),
                plugins::trigger::schema(),
                plugins::promote::schema(),
                plugins::environment::schema(),
                plugins::tenant::schema(),
                plugins::timeline::schema(),
            ];
            let filtered: Vec<JsonValue> = schemas
                .into_iter()
                .filter(|s| {
                    subsystem
                        .as_deref()
                        .is_none_or(|name| s["name"] == name)
                })
                .collect();
            print_ok("schema", "subsystems", &filtered);
        }
        Command::Boundary(boundary_cli) => match boundary_cli.command {
            BoundaryCommand::Check {
                module_root,
                path,
                profile,
                required,
            } => {
                let profile = CapabilityProfile::parse(&profile)?;
                let required = parse_capabilities(&required)?;
                profile.require(&required)?;
                let resolved = resolve_module_path(&module_root, &path)?;
                print_ok(
                    "boundary.check",
                    "resolved",
                    &serde_json::json!({
                        "path": resolved.to_string_lossy(),
                        "profile": profile,
                    }),
                );
            }
        },
        Command::Primitives(primitives_cli) => match primitives_cli.command {
            PrimitivesCommand::Shared => {
                let catalog = shared_primitives(&store)?;
                print_ok("primitives.shared", "packages", &catalog);
            }
        },
    }
    Ok(())
}

fn parse_capabilities(raw: &[String]) -> Result<Vec<crate::core::context::Capability>, ChangeOpsError> {
    use crate::core::context::Capability;
    raw.iter()
        .map(|token| match token.as_str() {
            "FS_READ" => Ok(Capability::FsRead),
            "FS_WRITE" => Ok(Capability::FsWrite),
            "CMD_RUN" => Ok(Capability::CmdRun),
            "NET_OUT" => Ok(Capability::NetOut),
            other => Err(ChangeOpsError::NotFound(format!(
                "unknown capability token '{}'",
                other
            ))),
        })
        .collect()
}

/// Cross-tenant catalog of installed package keys. Read-only; rides the
/// system connection because it deliberately spans tenants.
fn shared_primitives(store: &Store) -> Result<Vec<JsonValue>, ChangeOpsError> {
    let broker = broker::DbBroker::new(&store.root);
    broker.with_system_conn(&db::package_db_path(&store.root), "primitives.shared", |conn| {
        let mut stmt = conn.prepare(
            "SELECT package_key, COUNT(*) AS installs, MAX(installed_at) AS latest
             FROM env_package_state GROUP BY package_key ORDER BY package_key",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(serde_json::json!({
                    "packageKey": row.get::<_, String>(0)?,
                    "installs": row.get::<_, i64>(1)?,
                    "latestInstallAt": row.get::<_, String>(2)?,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

fn run_tenant(store: &Store, ctx: &OpContext, cli: TenantCli) -> Result<(), ChangeOpsError> {
    let tenants = TenantStore::new(store);
    match cli.command {
        TenantCommand::Add { id, name } => {
            let tenant = tenants.add_tenant(ctx, &id, &name)?;
            print_ok("tenant.add", "tenant", &tenant);
        }
        TenantCommand::List => {
            let all = tenants.list_tenants(ctx)?;
            print_ok("tenant.list", "tenants", &all);
        }
    }
    Ok(())
}

fn run_change(store: &Store, ctx: &OpContext, cli: ChangeCli) -> Result<(), ChangeOpsError> {
    let tenants = TenantStore::new(store);
    match cli.command {
        ChangeCommand::Add { title } => {
            let change = tenants.add_change(ctx, &title)?;
            print_ok("change.add", "change", &change);
        }
        ChangeCommand::Ready { id } => {
            let change = tenants.set_change_status(ctx, &id, ChangeStatus::Ready)?;
            print_ok("change.ready", "change", &change);
        }
        ChangeCommand::Merge { id } => {
            let change = tenants.set_change_status(ctx, &id, ChangeStatus::Merged)?;
            print_ok("change.merge", "change", &change);
        }
        ChangeCommand::Show { id } => {
            let change = tenants.get_change(ctx, &id)?;
            print_ok("change.show", "change", &change);
        }
    }
    Ok(())
}

fn run_draft(
    store: &Store,
    ctx: &OpContext,
    config: &StoreConfig,
    cli: DraftCli,
) -> Result<(), ChangeOpsError> {
    let engine = DraftEngine::new(store, Arc::new(RuleProducer));
    match cli.command {
        DraftCommand::Generate {
            project,
            prompt,
            app_name,
            environment,
        } => {
            let (draft, result) = engine.generate(
                ctx,
                &project,
                environment.as_deref(),
                &prompt,
                app_name.as_deref(),
            )?;
            print_json(&command_envelope(
                "draft.generate",
                "ok",
                serde_json::json!({ "draft": draft, "result": result }),
            ));
        }
        DraftCommand::List { project } => {
            let drafts = engine.list(ctx, project.as_deref())?;
            print_ok("draft.list", "drafts", &drafts);
        }
        DraftCommand::Show { id } => {
            let draft = engine.get(ctx, &id)?;
            print_ok("draft.show", "draft", &draft);
        }
        DraftCommand::Refine {
            id,
            prompt,
            expected_version,
        } => {
            let (draft, result) = engine.refine(ctx, &id, &prompt, expected_version)?;
            print_json(&command_envelope(
                "draft.refine",
                "ok",
                serde_json::json!({ "draft": draft, "result": result }),
            ));
        }
        DraftCommand::Patch { id, ops } => {
            let ops: Vec<DraftPatchOp> = serde_json::from_str(&ops)
                .map_err(|e| ChangeOpsError::validation("BAD_PATCH", format!("{}", e)))?;
            let draft = engine.patch(ctx, &id, &ops, None)?;
            print_ok("draft.patch", "draft", &draft);
        }
        DraftCommand::Preview { id } => {
            let draft = engine.preview(ctx, &id)?;
            print_ok("draft.preview", "draft", &draft);
        }
        DraftCommand::Install { id } => {
            let (draft, result) = engine.install(ctx, &id)?;
            print_json(&command_envelope(
                "draft.install",
                "ok",
                serde_json::json!({ "draft": draft, "result": result }),
            ));
        }
        DraftCommand::Discard { id } => {
            let draft = engine.discard(ctx, &id)?;
            print_ok("draft.discard", "draft", &draft);
        }
        DraftCommand::Versions { id, number } => match number {
            Some(n) => {
                let version = engine.get_version(ctx, &id, n)?;
                print_ok("draft.version", "version", &version);
            }
            None => {
                let versions = engine.list_versions(ctx, &id)?;
                print_ok("draft.versions", "versions", &versions);
            }
        },
        DraftCommand::Restore { id, version } => {
            let draft = engine.restore_version(ctx, &id, version)?;
            print_ok("draft.restore", "draft", &draft);
        }
        DraftCommand::DiffVersions { id, from, to } => {
            let delta: PackageDiff = engine.diff_versions(ctx, &id, from, to)?;
            print_ok("draft.diff_versions", "diff", &delta);
        }
        DraftCommand::GenerateMulti {
            project,
            prompt,
            count,
            stream,
        } => {
            if stream {
                let cancel = Arc::new(AtomicBool::new(false));
                let rx = engine.generate_multi_stream(ctx, &project, &prompt, count, cancel);
                let mut stdout = std::io::stdout();
                for event in rx {
                    frames::write_frame(&mut stdout, &event).map_err(ChangeOpsError::IoError)?;
                }
            } else {
                let variants = engine.generate_multi(ctx, &project, &prompt, count)?;
                print_ok("draft.generate_multi", "variants", &variants);
            }
        }
        DraftCommand::DiffVariants { a, b } => {
            let delta = engine.diff_variants(ctx, &a, &b)?;
            print_ok("draft.diff_variants", "diff", &delta);
        }
        DraftCommand::AdoptVariant { variant, draft } => {
            let adopted = engine.adopt_variant(ctx, &variant, draft.as_deref())?;
            print_ok("draft.adopt_variant", "draft", &adopted);
        }
        DraftCommand::PreviewStream {
            project,
            prompt,
            app_name,
            tokens,
        } => {
            let cancel = Arc::new(AtomicBool::new(false));
            let rx = engine.preview_stream(
                ctx,
                &project,
                &prompt,
                app_name.as_deref(),
                tokens,
                cancel,
            );
            let mut stdout = std::io::stdout();
            for event in rx {
                frames::write_frame(&mut stdout, &event).map_err(ChangeOpsError::IoError)?;
            }
        }
        DraftCommand::ConsumeStream => {
            use std::io::Read;
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .map_err(ChangeOpsError::IoError)?;
            let parser = frames::FrameParser::new(config.strict_frames);
            let events = parser.parse(&input)?;
            print_ok("draft.consume_stream", "events", &events);
        }
    }
    Ok(())
}

fn run_workflow(store: &Store, ctx: &OpContext, cli: WorkflowCli) -> Result<(), ChangeOpsError> {
    let engine = WorkflowEngine::new(store);
    match cli.command {
        WorkflowCommand::Create {
            name,
            trigger_type,
            trigger_config,
        } => {
            let config = trigger_config
                .map(|raw| parse_json(&raw, "trigger config"))
                .transpose()?;
            let definition = engine.create_definition(ctx, &name, &trigger_type, config)?;
            print_ok("workflow.create", "definition", &definition);
        }
        WorkflowCommand::List { status } => {
            let status = status
                .map(|raw| match raw.as_str() {
                    "draft" => Ok(DefinitionStatus::Draft),
                    "active" => Ok(DefinitionStatus::Active),
                    "retired" => Ok(DefinitionStatus::Retired),
                    other => Err(ChangeOpsError::NotFound(format!(
                        "unknown definition status '{}'",
                        other
                    ))),
                })
                .transpose()?;
            let definitions = engine.list_definitions(ctx, status)?;
            print_ok("workflow.list", "definitions", &definitions);
        }
        WorkflowCommand::AddStep {
            definition,
            step_type,
            config,
            order,
        } => {
            let step_type = StepType::parse(&step_type)?;
            let config = parse_json(&config, "step config")?;
            let step = engine.add_step(ctx, &definition, step_type, config, order)?;
            print_ok("workflow.add_step", "step", &step);
        }
        WorkflowCommand::Steps { definition } => {
            let steps = engine.list_steps(ctx, &definition)?;
            print_ok("workflow.steps", "steps", &steps);
        }
        WorkflowCommand::Activate { definition } => {
            let activated = engine.activate(ctx, &definition)?;
            print_ok("workflow.activate", "definition", &activated);
        }
        WorkflowCommand::Retire { definition } => {
            let retired = engine.retire(ctx, &definition)?;
            print_ok("workflow.retire", "definition", &retired);
        }
        WorkflowCommand::Executions { definition } => {
            let executions = engine.list_executions(ctx, definition.as_deref())?;
            print_ok("workflow.executions", "executions", &executions);
        }
        WorkflowCommand::Execution { id } => {
            let execution = engine.get_execution(ctx, &id)?;
            print_ok("workflow.execution", "execution", &execution);
        }
        WorkflowCommand::ExecutionSteps { id } => {
            let steps = engine.list_step_executions(ctx, &id)?;
            print_ok("workflow.execution_steps", "steps", &steps);
        }
        WorkflowCommand::Resume {
            execution,
            step,
            outcome,
        } => {
            let outcome = match outcome.as_str() {
                "approved" => ResumeOutcome::Approved,
                "rejected" => ResumeOutcome::Rejected,
                other => {
                    return Err(ChangeOpsError::InvariantViolation(format!(
                        "unknown resume outcome '{}'",
                        other
                    )));
                }
            };
            let resumed = engine.resume(ctx, &execution, &step, outcome)?;
            print_ok("workflow.resume", "execution", &resumed);
        }
    }
    Ok(())
}

fn run_trigger(
    store: &Store,
    ctx: &OpContext,
    config: &StoreConfig,
    cli: TriggerCli,
) -> Result<(), ChangeOpsError> {
    let hub = TriggerHub::new(store);
    match cli.command {
        TriggerCommand::Create {
            definition,
            config: raw,
        } => {
            let trigger_config: TriggerConfig = serde_json::from_str(&raw)
                .map_err(|e| ChangeOpsError::validation("BAD_TRIGGER_CONFIG", format!("{}", e)))?;
            let trigger = hub.create_trigger(ctx, &definition, trigger_config)?;
            print_ok("trigger.create", "trigger", &trigger);
        }
        TriggerCommand::List { trigger_type } => {
            let trigger_type = trigger_type
                .map(|raw| TriggerType::parse(&raw))
                .transpose()?;
            let triggers = hub.list_triggers(ctx, trigger_type)?;
            print_ok("trigger.list", "triggers", &triggers);
        }
        TriggerCommand::Enable { id } => {
            let trigger = hub.set_trigger_status(ctx, &id, TriggerStatus::Active)?;
            print_ok("trigger.enable", "trigger", &trigger);
        }
        TriggerCommand::Disable { id } => {
            let trigger = hub.set_trigger_status(ctx, &id, TriggerStatus::Disabled)?;
            print_ok("trigger.disable", "trigger", &trigger);
        }
        TriggerCommand::Fire { id, payload } => {
            let payload = parse_json(&payload, "payload")?;
            let intent = hub.fire_manual(ctx, &id, payload)?;
            print_ok("trigger.fire", "intent", &intent);
        }
        TriggerCommand::RecordEvent {
            record_type,
            event,
            event_id,
            after,
            before,
        } => {
            let record_event = RecordEvent {
                record_type,
                event,
                event_id,
                before: before.map(|raw| parse_json(&raw, "before")).transpose()?,
                after: parse_json(&after, "after")?,
            };
            let intents = hub.ingest_record_event(ctx, &record_event)?;
            print_ok("trigger.record_event", "intents", &intents);
        }
        TriggerCommand::Intents { status } => {
            let status = status
                .map(|raw| match raw.as_str() {
                    "pending" => Ok(crate::plugins::trigger::IntentStatus::Pending),
                    "dispatched" => Ok(crate::plugins::trigger::IntentStatus::Dispatched),
                    "failed" => Ok(crate::plugins::trigger::IntentStatus::Failed),
                    "duplicate" => Ok(crate::plugins::trigger::IntentStatus::Duplicate),
                    other => Err(ChangeOpsError::NotFound(format!(
                        "unknown intent status '{}'",
                        other
                    ))),
                })
                .transpose()?;
            let intents = hub.list_intents(ctx, status)?;
            print_ok("trigger.intents", "intents", &intents);
        }
        TriggerCommand::Dispatch => {
            let dispatcher = Dispatcher::new(store, config);
            let recovered = dispatcher.recover()?;
            let mut report = dispatcher.dispatch_pending()?;
            report.recovered = recovered;
            print_ok("trigger.dispatch", "report", &report);
        }
        TriggerCommand::Poll { once } => {
            let mut poller = SchedulePoller::new(store, config);
            if once {
                let fired = poller.run_once(crate::core::time::now_epoch_secs())?;
                print_ok("trigger.poll", "fired", &fired);
            } else {
                let stop = AtomicBool::new(false);
                poller.run(&stop)?;
            }
        }
    }
    Ok(())
}

fn run_override(store: &Store, ctx: &OpContext, cli: OverrideCli) -> Result<(), ChangeOpsError> {
    let overrides = compose::OverrideStore::new(store);
    match cli.command {
        OverrideCommand::Create {
            module,
            override_type,
            target,
            patch,
        } => {
            let override_type = compose::OverrideType::parse(&override_type)?;
            let patch: Vec<compose::OverrideOp> = serde_json::from_str(&patch)
                .map_err(|e| ChangeOpsError::validation("BAD_PATCH", format!("{}", e)))?;
            let created = overrides.create(ctx, &module, override_type, &target, patch)?;
            print_ok("override.create", "override", &created);
        }
        OverrideCommand::List { module, status } => {
            let status = status
                .map(|raw| match raw.as_str() {
                    "draft" => Ok(compose::OverrideStatus::Draft),
                    "active" => Ok(compose::OverrideStatus::Active),
                    "retired" => Ok(compose::OverrideStatus::Retired),
                    other => Err(ChangeOpsError::NotFound(format!(
                        "unknown override status '{}'",
                        other
                    ))),
                })
                .transpose()?;
            let rows = overrides.list_for_module(ctx, &module, status)?;
            print_ok("override.list", "overrides", &rows);
        }
        OverrideCommand::Activate { id, environment } => {
            let activated = overrides.activate(ctx, &id, &environment)?;
            print_ok("override.activate", "override", &activated);
        }
        OverrideCommand::Retire { id } => {
            let retired = overrides.retire(ctx, &id)?;
            print_ok("override.retire", "override", &retired);
        }
        OverrideCommand::Compose {
            environment,
            module,
        } => {
            let forms = overrides.compose_module(ctx, &environment, &module)?;
            print_ok("override.compose", "forms", &forms);
        }
    }
    Ok(())
}

fn run_promote(store: &Store, ctx: &OpContext, cli: PromoteCli) -> Result<(), ChangeOpsError> {
    let machine = PromotionMachine::new(store);
    match cli.command {
        PromoteCommand::Create { project, from, to } => {
            let intent = machine.create(ctx, &project, &from, &to)?;
            print_ok("promotion.create", "intent", &intent);
        }
        PromoteCommand::List { project } => {
            let intents = machine.list(ctx, project.as_deref())?;
            print_ok("promotion.list", "intents", &intents);
        }
        PromoteCommand::Show { id } => {
            let intent = machine.get(ctx, &id)?;
            print_ok("promotion.show", "intent", &intent);
        }
        PromoteCommand::Preview { id } => {
            let intent = machine.preview(ctx, &id)?;
            print_ok("promotion.preview", "intent", &intent);
        }
        PromoteCommand::Approve { id } => {
            let intent = machine.approve(ctx, &id)?;
            print_ok("promotion.approve", "intent", &intent);
        }
        PromoteCommand::Execute { id } => {
            let intent = machine.execute(ctx, &id)?;
            print_ok("promotion.execute", "intent", &intent);
        }
        PromoteCommand::Reject { id, reason } => {
            let intent = machine.reject(ctx, &id, reason.as_deref())?;
            print_ok("promotion.reject", "intent", &intent);
        }
        PromoteCommand::PullDown { from, to } => {
            let baseline = machine.pull_down(ctx, &from, &to)?;
            print_ok("promotion.pull_down", "baseline", &baseline);
        }
    }
    Ok(())
}

fn run_env(store: &Store, ctx: &OpContext, cli: EnvCli) -> Result<(), ChangeOpsError> {
    let environments = environment::EnvironmentStore::new(store);
    let machine = PromotionMachine::new(store);
    match cli.command {
        EnvCommand::Ensure { project } => {
            let envs = environments.ensure_pipeline(ctx, &project)?;
            print_ok("env.ensure", "environments", &envs);
        }
        EnvCommand::List { project } => {
            let envs = environments.list(ctx, project.as_deref())?;
            print_ok("env.list", "environments", &envs);
        }
        EnvCommand::Baseline { environment } => {
            let baseline = environments.baseline(ctx, &environment)?;
            print_ok("env.baseline", "baseline", &baseline);
        }
        EnvCommand::Diff { from, to, pretty } => {
            let delta = machine.environment_diff(ctx, &from, &to)?;
            if pretty {
                render_diff(&delta);
            } else {
                print_ok("env.diff", "diff", &delta);
            }
        }
        EnvCommand::Drift { project } => {
            let report = machine.environment_drift(ctx, &project)?;
            print_ok("env.drift", "drift", &report);
        }
    }
    Ok(())
}

fn run_graph(store: &Store, ctx: &OpContext, cli: GraphCli) -> Result<(), ChangeOpsError> {
    let graph_store = graph::GraphStore::new(store);
    match cli.command {
        GraphCommand::NodeUpsert {
            id,
            kind,
            properties,
            expected_version,
        } => {
            let properties = parse_json(&properties, "properties")?;
            let node = graph_store.upsert_node(ctx, &id, &kind, properties, expected_version)?;
            print_ok("graph.node.upsert", "node", &node);
        }
        GraphCommand::NodeGet { id } => {
            let node = graph_store.get_node(ctx, &id)?;
            print_ok("graph.node.get", "node", &node);
        }
        GraphCommand::NodeList {
            kind,
            cursor,
            limit,
        } => {
            let page = graph_store.list_nodes(ctx, kind.as_deref(), cursor.as_deref(), limit)?;
            print_ok("graph.node.list", "page", &page);
        }
        GraphCommand::NodeDelete {
            id,
            expected_version,
        } => {
            graph_store.delete_node(ctx, &id, expected_version)?;
            print_ok("graph.node.delete", "deleted", &id);
        }
        GraphCommand::EdgeUpsert {
            id,
            src,
            dst,
            kind,
            properties,
            expected_version,
        } => {
            let properties = parse_json(&properties, "properties")?;
            let edge =
                graph_store.upsert_edge(ctx, &id, &src, &dst, &kind, properties, expected_version)?;
            print_ok("graph.edge.upsert", "edge", &edge);
        }
        GraphCommand::EdgeList { cursor, limit } => {
            let page = graph_store.list_edges(ctx, cursor.as_deref(), limit)?;
            print_ok("graph.edge.list", "page", &page);
        }
        GraphCommand::EdgeDelete {
            id,
            expected_version,
        } => {
            graph_store.delete_edge(ctx, &id, expected_version)?;
            print_ok("graph.edge.delete", "deleted", &id);
        }
    }
    Ok(())
}

fn render_diff(delta: &PackageDiff) {
    for added in &delta.added_record_types {
        println!(
            "{} {} ({} fields)",
            "+".green(),
            added.key.green(),
            added.field_count
        );
    }
    for removed in &delta.removed_record_types {
        println!("{} {}", "-".red(), removed.key.red());
    }
    for modified in &delta.modified_record_types {
        println!("{} {}", "~".yellow(), modified.key.yellow());
        for field in &modified.added_fields {
            println!("    {} {}", "+".green(), field.name);
        }
        for field in &modified.removed_fields {
            println!("    {} {}", "-".red(), field);
        }
    }
    println!(
        "summary: +{} -{} ~{}",
        delta.summary.added, delta.summary.removed, delta.summary.modified
    );
}
