// src/core/schemas.rs
// Centralized database schema definitions for ChangeOps subsystems.
//
// Every entity row carries tenant_id and an optimistic row version where the
// entity is writable. Timestamps are epoch-seconds strings with a Z suffix
// (see core::time). JSON columns hold canonical serde_json output.

// --- Graph (tenants, changes, configuration-item nodes/edges) ---
pub const GRAPH_DB_NAME: &str = "graph.db";

pub const GRAPH_DB_SCHEMA_TENANTS: &str = "
    CREATE TABLE IF NOT EXISTS tenants (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
";

pub const GRAPH_DB_SCHEMA_CHANGES: &str = "
    CREATE TABLE IF NOT EXISTS changes (
        id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        title TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'draft',
        created_by TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT,
        PRIMARY KEY (tenant_id, id)
    )
";

pub const GRAPH_DB_SCHEMA_NODES: &str = "
    CREATE TABLE IF NOT EXISTS nodes (
        id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        properties TEXT NOT NULL DEFAULT '{}',
        version INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT,
        PRIMARY KEY (tenant_id, id)
    )
";

pub const GRAPH_DB_SCHEMA_EDGES: &str = "
    CREATE TABLE IF NOT EXISTS edges (
        id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        src_id TEXT NOT NULL,
        dst_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        properties TEXT NOT NULL DEFAULT '{}',
        version INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL,
        updated_at TEXT,
        PRIMARY KEY (tenant_id, id)
    )
";

pub const GRAPH_DB_INDEX_NODES_KIND: &str =
    "CREATE INDEX IF NOT EXISTS idx_nodes_kind ON nodes(tenant_id, kind)";
pub const GRAPH_DB_INDEX_EDGES_SRC: &str =
    "CREATE INDEX IF NOT EXISTS idx_edges_src ON edges(tenant_id, src_id)";

// --- Package (environments, installed baselines, overrides) ---
pub const PACKAGE_DB_NAME: &str = "package.db";

pub const PACKAGE_DB_SCHEMA_ENVIRONMENTS: &str = "
    CREATE TABLE IF NOT EXISTS environments (
        id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        project_id TEXT NOT NULL,
        name TEXT NOT NULL,
        is_default INTEGER NOT NULL DEFAULT 0,
        requires_promotion_approval INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        PRIMARY KEY (tenant_id, id),
        UNIQUE (tenant_id, project_id, name)
    )
";

pub const PACKAGE_DB_SCHEMA_ENV_STATE: &str = "
    CREATE TABLE IF NOT EXISTS env_package_state (
        environment_id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        package_key TEXT NOT NULL,
        package_version TEXT NOT NULL,
        checksum TEXT NOT NULL,
        package TEXT NOT NULL,
        source TEXT NOT NULL,
        installed_at TEXT NOT NULL,
        row_version INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (tenant_id, environment_id)
    )
";

pub const PACKAGE_DB_SCHEMA_OVERRIDES: &str = "
    CREATE TABLE IF NOT EXISTS overrides (
        id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        installed_module_id TEXT NOT NULL,
        override_type TEXT NOT NULL,
        target_ref TEXT NOT NULL,
        patch TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 1,
        status TEXT NOT NULL DEFAULT 'draft',
        change_id TEXT,
        created_by TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT,
        PRIMARY KEY (tenant_id, id)
    )
";

pub const PACKAGE_DB_INDEX_OVERRIDES_MODULE: &str =
    "CREATE INDEX IF NOT EXISTS idx_overrides_module
     ON overrides(tenant_id, installed_module_id, status)";

// --- Draft ---
pub const DRAFT_DB_NAME: &str = "draft.db";

pub const DRAFT_DB_SCHEMA_DRAFTS: &str = "
    CREATE TABLE IF NOT EXISTS drafts (
        id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        project_id TEXT NOT NULL,
        environment_id TEXT,
        status TEXT NOT NULL DEFAULT 'draft',
        prompt TEXT NOT NULL,
        package TEXT NOT NULL,
        checksum TEXT NOT NULL,
        last_preview_diff TEXT,
        last_preview_errors TEXT,
        created_by TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (tenant_id, id)
    )
";

pub const DRAFT_DB_SCHEMA_VERSIONS: &str = "
    CREATE TABLE IF NOT EXISTS draft_versions (
        draft_id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        version_number INTEGER NOT NULL,
        reason TEXT NOT NULL,
        package TEXT NOT NULL,
        checksum TEXT NOT NULL,
        preview_diff TEXT,
        preview_errors TEXT,
        created_by TEXT,
        created_at TEXT NOT NULL,
        PRIMARY KEY (tenant_id, draft_id, version_number)
    )
";

pub const DRAFT_DB_SCHEMA_VARIANTS: &str = "
    CREATE TABLE IF NOT EXISTS draft_variants (
        id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        project_id TEXT NOT NULL,
        batch_id TEXT NOT NULL,
        variant_index INTEGER NOT NULL,
        prompt TEXT NOT NULL,
        package TEXT NOT NULL,
        checksum TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (tenant_id, id)
    )
";

pub const DRAFT_DB_INDEX_DRAFTS_PROJECT: &str =
    "CREATE INDEX IF NOT EXISTS idx_drafts_project ON drafts(tenant_id, project_id)";
pub const DRAFT_DB_INDEX_VARIANTS_BATCH: &str =
    "CREATE INDEX IF NOT EXISTS idx_variants_batch ON draft_variants(tenant_id, batch_id)";

// --- Workflow ---
pub const WORKFLOW_DB_NAME: &str = "workflow.db";

pub const WORKFLOW_DB_SCHEMA_DEFINITIONS: &str = "
    CREATE TABLE IF NOT EXISTS workflow_definitions (
        id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        name TEXT NOT NULL,
        trigger_type TEXT NOT NULL,
        trigger_config TEXT,
        status TEXT NOT NULL DEFAULT 'draft',
        version INTEGER NOT NULL DEFAULT 1,
        change_id TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT,
        PRIMARY KEY (tenant_id, id)
    )
";

pub const WORKFLOW_DB_SCHEMA_STEPS: &str = "
    CREATE TABLE IF NOT EXISTS workflow_steps (
        id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        workflow_definition_id TEXT NOT NULL,
        step_type TEXT NOT NULL,
        config TEXT NOT NULL DEFAULT '{}',
        order_index INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (tenant_id, id),
        UNIQUE (tenant_id, workflow_definition_id, order_index)
    )
";

pub const WORKFLOW_DB_SCHEMA_EXECUTIONS: &str = "
    CREATE TABLE IF NOT EXISTS workflow_executions (
        id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        workflow_definition_id TEXT NOT NULL,
        intent_id TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'running',
        input TEXT NOT NULL DEFAULT '{}',
        accumulated_input TEXT NOT NULL DEFAULT '{}',
        paused_at_step_id TEXT,
        error TEXT,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        version INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (tenant_id, id)
    )
";

pub const WORKFLOW_DB_SCHEMA_STEP_EXECUTIONS: &str = "
    CREATE TABLE IF NOT EXISTS workflow_step_executions (
        id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        execution_id TEXT NOT NULL,
        step_id TEXT NOT NULL,
        order_index INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        output TEXT,
        executed_at TEXT,
        PRIMARY KEY (tenant_id, id)
    )
";

pub const WORKFLOW_DB_INDEX_STEPS_DEFINITION: &str =
    "CREATE INDEX IF NOT EXISTS idx_steps_definition
     ON workflow_steps(tenant_id, workflow_definition_id, order_index)";
pub const WORKFLOW_DB_INDEX_STEP_EXECUTIONS: &str =
    "CREATE INDEX IF NOT EXISTS idx_step_executions
     ON workflow_step_executions(tenant_id, execution_id, order_index)";

// --- Trigger ---
pub const TRIGGER_DB_NAME: &str = "trigger.db";

pub const TRIGGER_DB_SCHEMA_TRIGGERS: &str = "
    CREATE TABLE IF NOT EXISTS workflow_triggers (
        id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        workflow_definition_id TEXT NOT NULL,
        trigger_type TEXT NOT NULL,
        trigger_config TEXT NOT NULL DEFAULT '{}',
        status TEXT NOT NULL DEFAULT 'active',
        created_at TEXT NOT NULL,
        updated_at TEXT,
        PRIMARY KEY (tenant_id, id)
    )
";

pub const TRIGGER_DB_SCHEMA_INTENTS: &str = "
    CREATE TABLE IF NOT EXISTS execution_intents (
        id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        trigger_id TEXT,
        workflow_definition_id TEXT NOT NULL,
        trigger_type TEXT NOT NULL,
        trigger_payload TEXT NOT NULL DEFAULT '{}',
        idempotency_key TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        execution_id TEXT,
        error TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT,
        PRIMARY KEY (tenant_id, id)
    )
";

pub const TRIGGER_DB_INDEX_INTENTS_STATUS: &str =
    "CREATE INDEX IF NOT EXISTS idx_intents_status ON execution_intents(status, created_at)";
pub const TRIGGER_DB_INDEX_INTENTS_KEY: &str =
    "CREATE INDEX IF NOT EXISTS idx_intents_key ON execution_intents(tenant_id, idempotency_key)";
pub const TRIGGER_DB_INDEX_TRIGGERS_TYPE: &str =
    "CREATE INDEX IF NOT EXISTS idx_triggers_type ON workflow_triggers(tenant_id, trigger_type, status)";

// --- Promotion ---
pub const PROMOTION_DB_NAME: &str = "promotion.db";

pub const PROMOTION_DB_SCHEMA_INTENTS: &str = "
    CREATE TABLE IF NOT EXISTS promotion_intents (
        id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        project_id TEXT NOT NULL,
        from_environment_id TEXT NOT NULL,
        to_environment_id TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'draft',
        diff TEXT,
        target_row_version INTEGER,
        result TEXT,
        error TEXT,
        created_by TEXT NOT NULL,
        approved_by TEXT,
        change_id TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT,
        version INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (tenant_id, id)
    )
";

pub const PROMOTION_DB_INDEX_PROJECT: &str =
    "CREATE INDEX IF NOT EXISTS idx_promotions_project
     ON promotion_intents(tenant_id, project_id, status)";
