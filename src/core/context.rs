//! Tenant & governance boundary.
//!
//! Every inbound operation is parameterized by an [`OpContext`]: the tenant
//! context, the acting principal, and the governance reference. The context is
//! immutable within an operation. This module owns the three fail-closed
//! gates the rest of the control plane leans on:
//!
//! - tenant scoping (`ensure_tenant`): any mismatch between the outer tenant
//!   and an entity's tenant id is an `INVARIANT_VIOLATION`;
//! - governed writes (`require_governance`): mutations of overrides, workflow
//!   definitions, package installs, and promotions need a change id;
//! - capability profiles and the module path boundary for filesystem-scoped
//!   operations.

use crate::core::error::ChangeOpsError;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

/// Where the tenant id came from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TenantSource {
    /// Supplied by the caller (`x-tenant-id` header / `--tenant` flag).
    Header,
    /// Internal control-plane task (dispatcher, poller).
    System,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: String,
    pub source: TenantSource,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    User,
    System,
    Agent,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub kind: ActorKind,
}

/// Governance reference for writes on governed entities.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Governance {
    pub change_id: Option<String>,
}

/// The per-operation context bundle. Constructed once at the boundary and
/// passed by reference; never mutated mid-operation.
#[derive(Debug, Clone)]
pub struct OpContext {
    pub tenant: TenantContext,
    pub actor: Actor,
    pub governance: Governance,
}

impl OpContext {
    pub fn new(tenant_id: &str, actor_id: &str, actor_kind: ActorKind) -> Self {
        Self {
            tenant: TenantContext {
                tenant_id: tenant_id.to_string(),
                source: TenantSource::Header,
            },
            actor: Actor {
                id: actor_id.to_string(),
                kind: actor_kind,
            },
            governance: Governance::default(),
        }
    }

    /// Context for internal control-plane tasks acting on behalf of a tenant.
    pub fn system(tenant_id: &str) -> Self {
        Self {
            tenant: TenantContext {
                tenant_id: tenant_id.to_string(),
                source: TenantSource::System,
            },
            actor: Actor {
                id: "changeops".to_string(),
                kind: ActorKind::System,
            },
            governance: Governance::default(),
        }
    }

    pub fn with_change(mut self, change_id: &str) -> Self {
        self.governance.change_id = Some(change_id.to_string());
        self
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant.tenant_id
    }

    /// Fail closed on any entity whose tenant differs from the context tenant.
    pub fn ensure_tenant(&self, entity_tenant_id: &str) -> Result<(), ChangeOpsError> {
        if entity_tenant_id != self.tenant.tenant_id {
            return Err(ChangeOpsError::InvariantViolation(format!(
                "entity tenant '{}' does not match context tenant '{}'",
                entity_tenant_id, self.tenant.tenant_id
            )));
        }
        Ok(())
    }

    /// Governed writes require a change id.
    pub fn require_governance(&self, operation: &str) -> Result<&str, ChangeOpsError> {
        self.governance
            .change_id
            .as_deref()
            .ok_or_else(|| {
                ChangeOpsError::GovernanceRequired(format!(
                    "'{}' writes a governed entity and requires a change id",
                    operation
                ))
            })
    }
}

/// Capability tokens granted to a module execution context.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    #[serde(rename = "FS_READ")]
    FsRead,
    #[serde(rename = "FS_WRITE")]
    FsWrite,
    #[serde(rename = "CMD_RUN")]
    CmdRun,
    #[serde(rename = "NET_OUT")]
    NetOut,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token = match self {
            Self::FsRead => "FS_READ",
            Self::FsWrite => "FS_WRITE",
            Self::CmdRun => "CMD_RUN",
            Self::NetOut => "NET_OUT",
        };
        write!(f, "{}", token)
    }
}

/// Named capability bundles. A request declares the capabilities it needs and
/// the profile either covers them or the call dies with `CAPABILITY_DENIED`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityProfile {
    #[serde(rename = "CODE_MODULE_DEFAULT")]
    CodeModuleDefault,
    #[serde(rename = "WORKFLOW_MODULE_DEFAULT")]
    WorkflowModuleDefault,
    #[serde(rename = "READ_ONLY")]
    ReadOnly,
}

impl CapabilityProfile {
    pub fn tokens(&self) -> &'static [Capability] {
        match self {
            Self::CodeModuleDefault => &[
                Capability::FsRead,
                Capability::FsWrite,
                Capability::CmdRun,
            ],
            Self::WorkflowModuleDefault => &[Capability::FsRead, Capability::NetOut],
            Self::ReadOnly => &[Capability::FsRead],
        }
    }

    pub fn require(&self, required: &[Capability]) -> Result<(), ChangeOpsError> {
        let granted = self.tokens();
        for cap in required {
            if !granted.contains(cap) {
                return Err(ChangeOpsError::CapabilityDenied(format!(
                    "profile {:?} lacks {}",
                    self, cap
                )));
            }
        }
        Ok(())
    }

    pub fn parse(name: &str) -> Result<Self, ChangeOpsError> {
        match name {
            "CODE_MODULE_DEFAULT" => Ok(Self::CodeModuleDefault),
            "WORKFLOW_MODULE_DEFAULT" => Ok(Self::WorkflowModuleDefault),
            "READ_ONLY" => Ok(Self::ReadOnly),
            other => Err(ChangeOpsError::NotFound(format!(
                "unknown capability profile '{}'",
                other
            ))),
        }
    }
}

/// Validate a module-scoped path request against its module root.
///
/// Rejected when the requested path is absolute, still contains `..` after
/// normalization, or resolves outside `module_root_path`. Returns the
/// normalized absolute path on success.
pub fn resolve_module_path(
    module_root_path: &Path,
    requested: &str,
) -> Result<PathBuf, ChangeOpsError> {
    let requested_path = Path::new(requested);
    if requested_path.is_absolute() {
        return Err(ChangeOpsError::ModuleBoundaryEscape(format!(
            "absolute path '{}' not allowed inside module root",
            requested
        )));
    }

    let mut normalized: Vec<&str> = Vec::new();
    for component in requested_path.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| {
                    ChangeOpsError::ModuleBoundaryEscape(format!(
                        "non-utf8 path component in '{}'",
                        requested
                    ))
                })?;
                normalized.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                // Popping is not enough: a request that ever needs `..` is
                // treated as an escape attempt, matching the boundary contract.
                return Err(ChangeOpsError::ModuleBoundaryEscape(format!(
                    "path '{}' contains parent-directory traversal",
                    requested
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ChangeOpsError::ModuleBoundaryEscape(format!(
                    "path '{}' escapes module root",
                    requested
                )));
            }
        }
    }

    let mut resolved = module_root_path.to_path_buf();
    for part in &normalized {
        resolved.push(part);
    }

    let root_str = module_root_path.to_string_lossy();
    let resolved_str = resolved.to_string_lossy();
    let inside = resolved == module_root_path
        || resolved_str.starts_with(&format!("{}/", root_str.trim_end_matches('/')));
    if !inside {
        return Err(ChangeOpsError::ModuleBoundaryEscape(format!(
            "path '{}' resolves outside module root '{}'",
            requested, root_str
        )));
    }
    Ok(resolved)
}
