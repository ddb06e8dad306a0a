//! Graph store: storage-agnostic CRUD for configuration-item nodes and edges.
//!
//! Minimal read/write surface: `get`, `list(cursor, limit)`,
//! `upsert(expected_version)`, `delete(expected_version)`. No traversal, no
//! query language. Tenant id is explicit on every call; pagination cursors
//! are opaque to callers (internally a monotone offset); `expected_version`
//! mismatches raise `CONFLICT`; edge writes require both endpoints to exist
//! within the same tenant.

use crate::core::broker::DbBroker;
use crate::core::context::OpContext;
use crate::core::db;
use crate::core::error::ChangeOpsError;
use crate::core::store::Store;
use crate::core::time;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub id: String,
    pub tenant_id: String,
    pub kind: String,
    pub properties: JsonValue,
    pub version: i64,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GraphEdge {
    pub id: String,
    pub tenant_id: String,
    pub src_id: String,
    pub dst_id: String,
    pub kind: String,
    pub properties: JsonValue,
    pub version: i64,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// One page of results plus the cursor for the next page, if any.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

const CURSOR_PREFIX: &str = "gc_";

fn encode_cursor(offset: u64) -> String {
    format!("{}{}", CURSOR_PREFIX, offset)
}

fn decode_cursor(cursor: Option<&str>) -> Result<u64, ChangeOpsError> {
    match cursor {
        None => Ok(0),
        Some(raw) => raw
            .strip_prefix(CURSOR_PREFIX)
            .and_then(|rest| rest.parse::<u64>().ok())
            .ok_or_else(|| {
                ChangeOpsError::InvariantViolation(format!("malformed cursor '{}'", raw))
            }),
    }
}

pub struct GraphStore<'a> {
    store: &'a Store,
    broker: DbBroker,
}

impl<'a> GraphStore<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self {
            store,
            broker: DbBroker::new(&store.root),
        }
    }

    fn db_path(&self) -> std::path::PathBuf {
        db::graph_db_path(&self.store.root)
    }

    pub fn get_node(
        &self,
        ctx: &OpContext,
        node_id: &str,
    ) -> Result<Option<GraphNode>, ChangeOpsError> {
        let id = node_id.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "graph.node.get", |conn| {
                read_node(conn, ctx.tenant_id(), &id)
            })
    }

    pub fn list_nodes(
        &self,
        ctx: &OpContext,
        kind: Option<&str>,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<GraphNode>, ChangeOpsError> {
        let offset = decode_cursor(cursor)?;
        let limit = limit.clamp(1, 500);
        let kind = kind.map(|s| s.to_string());
        self.broker
            .with_conn(&self.db_path(), ctx, "graph.node.list", |conn| {
                use rusqlite::types::ToSql;

                let mut sql = "SELECT id, tenant_id, kind, properties, version, created_at, updated_at
                     FROM nodes WHERE tenant_id = ?".to_string();
                let tenant = ctx.tenant_id().to_string();
                let limit_plus = (limit + 1) as i64;
                let offset_sql = offset as i64;
                let mut bind: Vec<&dyn ToSql> = vec![&tenant];
                if let Some(k) = &kind {
                    sql.push_str(" AND kind = ?");
                    bind.push(k);
                }
                sql.push_str(" ORDER BY id LIMIT ? OFFSET ?");
                bind.push(&limit_plus);
                bind.push(&offset_sql);

                let mut stmt = conn.prepare(&sql)?;
                let mut items: Vec<GraphNode> = stmt
                    .query_map(&bind[..], node_from_row)?
                    .collect::<Result<_, _>>()?;
                let next_cursor = if items.len() > limit {
                    items.truncate(limit);
                    Some(encode_cursor(offset + limit as u64))
                } else {
                    None
                };
                Ok(Page { items, next_cursor })
            })
    }

    pub fn upsert_node(
        &self,
        ctx: &OpContext,
        node_id: &str,
        kind: &str,
        properties: JsonValue,
        expected_version: Option<i64>,
    ) -> Result<GraphNode, ChangeOpsError> {
        let id = node_id.to_string();
        let kind = kind.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "graph.node.upsert", |conn| {
                let existing = read_node(conn, ctx.tenant_id(), &id)?;
                let now = time::now_epoch_z();
                match existing {
                    Some(node) => {
                        check_expected_version("node", &id, node.version, expected_version)?;
                        let next = node.version + 1;
                        conn.execute(
                            "UPDATE nodes SET kind = ?1, properties = ?2, version = ?3, updated_at = ?4
                             WHERE tenant_id = ?5 AND id = ?6",
                            params![
                                kind,
                                properties.to_string(),
                                next,
                                now,
                                ctx.tenant_id(),
                                id
                            ],
                        )?;
                    }
                    None => {
                        if let Some(expected) = expected_version {
                            return Err(ChangeOpsError::Conflict(format!(
                                "node '{}' does not exist but expected version {}",
                                id, expected
                            )));
                        }
                        conn.execute(
                            "INSERT INTO nodes (id, tenant_id, kind, properties, version, created_at)
                             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                            params![id, ctx.tenant_id(), kind, properties.to_string(), now],
                        )?;
                    }
                }
                read_node(conn, ctx.tenant_id(), &id)?.ok_or_else(|| {
                    ChangeOpsError::InvariantViolation(format!("node '{}' vanished mid-upsert", id))
                })
            })
    }

    pub fn delete_node(
        &self,
        ctx: &OpContext,
        node_id: &str,
        expected_version: Option<i64>,
    ) -> Result<(), ChangeOpsError> {
        let id = node_id.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "graph.node.delete", |conn| {
                let node = read_node(conn, ctx.tenant_id(), &id)?.ok_or_else(|| {
                    ChangeOpsError::NotFound(format!("node '{}' not found", id))
                })?;
                check_expected_version("node", &id, node.version, expected_version)?;
                conn.execute(
                    "DELETE FROM edges WHERE tenant_id = ?1 AND (src_id = ?2 OR dst_id = ?2)",
                    params![ctx.tenant_id(), id],
                )?;
                conn.execute(
                    "DELETE FROM nodes WHERE tenant_id = ?1 AND id = ?2",
                    params![ctx.tenant_id(), id],
                )?;
                Ok(())
            })
    }

    pub fn get_edge(
        &self,
        ctx: &OpContext,
        edge_id: &str,
    ) -> Result<Option<GraphEdge>, ChangeOpsError> {
        let id = edge_id.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "graph.edge.get", |conn| {
                read_edge(conn, ctx.tenant_id(), &id)
            })
    }

    pub fn list_edges(
        &self,
        ctx: &OpContext,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<GraphEdge>, ChangeOpsError> {
        let offset = decode_cursor(cursor)?;
        let limit = limit.clamp(1, 500);
        self.broker
            .with_conn(&self.db_path(), ctx, "graph.edge.list", |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, tenant_id, src_id, dst_id, kind, properties, version, created_at, updated_at
                     FROM edges WHERE tenant_id = ?1 ORDER BY id LIMIT ?2 OFFSET ?3",
                )?;
                let mut items: Vec<GraphEdge> = stmt
                    .query_map(
                        params![ctx.tenant_id(), (limit + 1) as i64, offset as i64],
                        edge_from_row,
                    )?
                    .collect::<Result<_, _>>()?;
                let next_cursor = if items.len() > limit {
                    items.truncate(limit);
                    Some(encode_cursor(offset + limit as u64))
                } else {
                    None
                };
                Ok(Page { items, next_cursor })
            })
    }

    pub fn upsert_edge(
        &self,
        ctx: &OpContext,
        edge_id: &str,
        src_id: &str,
        dst_id: &str,
        kind: &str,
        properties: JsonValue,
        expected_version: Option<i64>,
    ) -> Result<GraphEdge, ChangeOpsError> {
        let id = edge_id.to_string();
        let src = src_id.to_string();
        let dst = dst_id.to_string();
        let kind = kind.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "graph.edge.upsert", |conn| {
                // Both endpoints must exist within the calling tenant.
                for endpoint in [&src, &dst] {
                    if read_node(conn, ctx.tenant_id(), endpoint)?.is_none() {
                        return Err(ChangeOpsError::InvariantViolation(format!(
                            "edge endpoint '{}' does not exist in tenant '{}'",
                            endpoint,
                            ctx.tenant_id()
                        )));
                    }
                }

                let existing = read_edge(conn, ctx.tenant_id(), &id)?;
                let now = time::now_epoch_z();
                match existing {
                    Some(edge) => {
                        check_expected_version("edge", &id, edge.version, expected_version)?;
                        conn.execute(
                            "UPDATE edges SET src_id = ?1, dst_id = ?2, kind = ?3, properties = ?4,
                             version = ?5, updated_at = ?6 WHERE tenant_id = ?7 AND id = ?8",
                            params![
                                src,
                                dst,
                                kind,
                                properties.to_string(),
                                edge.version + 1,
                                now,
                                ctx.tenant_id(),
                                id
                            ],
                        )?;
                    }
                    None => {
                        if let Some(expected) = expected_version {
                            return Err(ChangeOpsError::Conflict(format!(
                                "edge '{}' does not exist but expected version {}",
                                id, expected
                            )));
                        }
                        conn.execute(
                            "INSERT INTO edges (id, tenant_id, src_id, dst_id, kind, properties, version, created_at)
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
                            params![id, ctx.tenant_id(), src, dst, kind, properties.to_string(), now],
                        )?;
                    }
                }
                read_edge(conn, ctx.tenant_id(), &id)?.ok_or_else(|| {
                    ChangeOpsError::InvariantViolation(format!("edge '{}' vanished mid-upsert", id))
                })
            })
    }

    pub fn delete_edge(
        &self,
        ctx: &OpContext,
        edge_id: &str,
        expected_version: Option<i64>,
    ) -> Result<(), ChangeOpsError> {
        let id = edge_id.to_string();
        self.broker
            .with_conn(&self.db_path(), ctx, "graph.edge.delete", |conn| {
                let edge = read_edge(conn, ctx.tenant_id(), &id)?.ok_or_else(|| {
                    ChangeOpsError::NotFound(format!("edge '{}' not found", id))
                })?;
                check_expected_version("edge", &id, edge.version, expected_version)?;
                conn.execute(
                    "DELETE FROM edges WHERE tenant_id = ?1 AND id = ?2",
                    params![ctx.tenant_id(), id],
                )?;
                Ok(())
            })
    }
}

fn check_expected_version(
    entity: &str,
    id: &str,
    actual: i64,
    expected: Option<i64>,
) -> Result<(), ChangeOpsError> {
    if let Some(expected) = expected {
        if expected != actual {
            return Err(ChangeOpsError::Conflict(format!(
                "{} '{}' is at version {}, expected {}",
                entity, id, actual, expected
            )));
        }
    }
    Ok(())
}

fn node_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GraphNode> {
    let properties: String = row.get(3)?;
    Ok(GraphNode {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        kind: row.get(2)?,
        properties: serde_json::from_str(&properties).unwrap_or(JsonValue::Null),
        version: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn edge_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<GraphEdge> {
    let properties: String = row.get(5)?;
    Ok(GraphEdge {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        src_id: row.get(2)?,
        dst_id: row.get(3)?,
        kind: row.get(4)?,
        properties: serde_json::from_str(&properties).unwrap_or(JsonValue::Null),
        version: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn read_node(
    conn: &Connection,
    tenant_id: &str,
    id: &str,
) -> Result<Option<GraphNode>, ChangeOpsError> {
    conn.query_row(
        "SELECT id, tenant_id, kind, properties, version, created_at, updated_at
         FROM nodes WHERE tenant_id = ?1 AND id = ?2",
        params![tenant_id, id],
        node_from_row,
    )
    .optional()
    .map_err(ChangeOpsError::RusqliteError)
}

fn read_edge(
    conn: &Connection,
    tenant_id: &str,
    id: &str,
) -> Result<Option<GraphEdge>, ChangeOpsError> {
    conn.query_row(
        "SELECT id, tenant_id, src_id, dst_id, kind, properties, version, created_at, updated_at
         FROM edges WHERE tenant_id = ?1 AND id = ?2",
        params![tenant_id, id],
        edge_from_row,
    )
    .optional()
    .map_err(ChangeOpsError::RusqliteError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trip_and_malformed_rejection() {
        assert_eq!(decode_cursor(None).unwrap(), 0);
        assert_eq!(decode_cursor(Some(&encode_cursor(40))).unwrap(), 40);
        assert!(decode_cursor(Some("offset:40")).is_err());
    }
}
