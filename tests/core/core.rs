use changeops::core::broker::{AuditEvent, DbBroker};
use changeops::core::context::{ActorKind, OpContext};
use changeops::core::db;
use changeops::core::error::ChangeOpsError;
use changeops::core::graph::GraphStore;
use changeops::core::package::{self, Field, Package, RecordType};
use changeops::core::store::Store;
use std::fs;
use tempfile::tempdir;

fn open_store(root: &std::path::Path) -> Store {
    let store = Store::new(root.to_path_buf());
    db::initialize_all(&store.root).expect("db init");
    store
}

#[test]
fn db_and_broker_round_trip_and_audit() {
    let tmp = tempdir().expect("tempdir");
    let store = open_store(tmp.path());
    let db_path = db::graph_db_path(&store.root);
    assert!(db_path.exists());

    let conn = db::db_connect(&db_path.to_string_lossy()).expect("db connect");
    let fk_on: i64 = conn
        .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
        .expect("pragma foreign_keys");
    assert_eq!(fk_on, 1);

    let broker = DbBroker::new(&store.root);
    let ctx = OpContext::new("t1", "tester", ActorKind::User);
    broker
        .with_conn(&db_path, &ctx, "tenant.insert", |conn| {
            conn.execute(
                "INSERT INTO tenants (id, name, created_at) VALUES ('t1', 'Tenant One', '0Z')",
                [],
            )
            .map_err(ChangeOpsError::RusqliteError)?;
            Ok(())
        })
        .expect("broker success path");

    let result: Result<(), ChangeOpsError> = broker.with_conn(&db_path, &ctx, "tenant.fail", |_| {
        Err(ChangeOpsError::InvariantViolation("intentional".to_string()))
    });
    assert!(result.is_err());

    let audit_path = store.root.join("audit.events.jsonl");
    assert!(audit_path.exists());
    let events: Vec<AuditEvent> = fs::read_to_string(&audit_path)
        .expect("read audit")
        .lines()
        .map(|line| serde_json::from_str(line).expect("valid audit event json"))
        .collect();
    assert!(events.iter().any(|ev| ev.status == "success"));
    assert!(events.iter().any(|ev| ev.status == "error"));
    assert!(
        events
            .iter()
            .filter(|ev| ev.op.starts_with("tenant."))
            .all(|ev| ev.tenant_id == "t1" && ev.actor == "tester")
    );

    let schema = changeops::core::broker::schema();
    assert_eq!(schema["name"], "broker");
    assert_eq!(schema["envelope"]["schema_version"], "1.0.0");
}

#[test]
fn graph_store_crud_with_optimistic_versioning() {
    let tmp = tempdir().expect("tempdir");
    let store = open_store(tmp.path());
    let graph = GraphStore::new(&store);
    let ctx = OpContext::new("t1", "tester", ActorKind::User);

    let node = graph
        .upsert_node(&ctx, "srv-1", "server", serde_json::json!({"os": "linux"}), None)
        .expect("insert node");
    assert_eq!(node.version, 1);

    let updated = graph
        .upsert_node(
            &ctx,
            "srv-1",
            "server",
            serde_json::json!({"os": "linux", "ram": 64}),
            Some(1),
        )
        .expect("update with matching version");
    assert_eq!(updated.version, 2);

    let stale = graph.upsert_node(&ctx, "srv-1", "server", serde_json::json!({}), Some(1));
    assert!(matches!(stale, Err(ChangeOpsError::Conflict(_))));

    // Upsert against a missing node with an expected version is a conflict.
    let ghost = graph.upsert_node(&ctx, "ghost", "server", serde_json::json!({}), Some(3));
    assert!(matches!(ghost, Err(ChangeOpsError::Conflict(_))));

    let fetched = graph.get_node(&ctx, "srv-1").expect("get").expect("exists");
    assert_eq!(fetched.properties["ram"], 64);

    graph
        .delete_node(&ctx, "srv-1", Some(2))
        .expect("delete with matching version");
    assert!(graph.get_node(&ctx, "srv-1").expect("get").is_none());
}

#[test]
fn graph_edges_require_same_tenant_endpoints() {
    let tmp = tempdir().expect("tempdir");
    let store = open_store(tmp.path());
    let graph = GraphStore::new(&store);
    let ctx = OpContext::new("t1", "tester", ActorKind::User);
    let other = OpContext::new("t2", "tester", ActorKind::User);

    graph
        .upsert_node(&ctx, "a", "service", serde_json::json!({}), None)
        .expect("node a");
    graph
        .upsert_node(&other, "b", "service", serde_json::json!({}), None)
        .expect("node b in other tenant");

    // Endpoint exists only in the other tenant.
    let cross = graph.upsert_edge(&ctx, "e1", "a", "b", "depends_on", serde_json::json!({}), None);
    assert!(matches!(cross, Err(ChangeOpsError::InvariantViolation(_))));

    graph
        .upsert_node(&ctx, "b", "service", serde_json::json!({}), None)
        .expect("node b");
    let edge = graph
        .upsert_edge(&ctx, "e1", "a", "b", "depends_on", serde_json::json!({}), None)
        .expect("edge within tenant");
    assert_eq!(edge.version, 1);

    // Deleting a node removes its edges.
    graph.delete_node(&ctx, "a", None).expect("delete node");
    assert!(graph.get_edge(&ctx, "e1").expect("get edge").is_none());
}

#[test]
fn graph_listing_pages_with_opaque_cursor_and_tenant_scope() {
    let tmp = tempdir().expect("tempdir");
    let store = open_store(tmp.path());
    let graph = GraphStore::new(&store);
    let ctx = OpContext::new("t1", "tester", ActorKind::User);
    let other = OpContext::new("t2", "tester", ActorKind::User);

    for i in 0..7 {
        graph
            .upsert_node(&ctx, &format!("n{}", i), "ci", serde_json::json!({}), None)
            .expect("insert");
    }
    graph
        .upsert_node(&other, "foreign", "ci", serde_json::json!({}), None)
        .expect("insert foreign");

    let first = graph
        .list_nodes(&ctx, Some("ci"), None, 3)
        .expect("first page");
    assert_eq!(first.items.len(), 3);
    let cursor = first.next_cursor.expect("more pages");

    let second = graph
        .list_nodes(&ctx, Some("ci"), Some(&cursor), 3)
        .expect("second page");
    assert_eq!(second.items.len(), 3);

    let third = graph
        .list_nodes(&ctx, Some("ci"), second.next_cursor.as_deref(), 3)
        .expect("third page");
    assert_eq!(third.items.len(), 1);
    assert!(third.next_cursor.is_none());

    // No page leaks another tenant's nodes.
    let mut seen: Vec<String> = Vec::new();
    seen.extend(first.items.iter().map(|n| n.id.clone()));
    seen.extend(second.items.iter().map(|n| n.id.clone()));
    seen.extend(third.items.iter().map(|n| n.id.clone()));
    assert_eq!(seen.len(), 7);
    assert!(!seen.contains(&"foreign".to_string()));

    let malformed = graph.list_nodes(&ctx, None, Some("not-a-cursor"), 3);
    assert!(malformed.is_err());
}

#[test]
fn checksum_determinism_across_field_reordering() {
    let mut package = Package::empty("vibe.itsm");
    package.record_types.push(RecordType {
        key: "incident".to_string(),
        name: "Incident".to_string(),
        base_type: None,
        fields: vec![
            Field::new("name", "string").required(),
            Field::new("impact", "string"),
            Field::new("urgency", "string"),
        ],
    });
    package.record_types.push(RecordType {
        key: "problem".to_string(),
        name: "Problem".to_string(),
        base_type: Some("incident".to_string()),
        fields: vec![Field::new("name", "string").required()],
    });

    let mut shuffled = package.clone();
    shuffled.record_types.reverse();
    shuffled.record_types[1].fields.reverse();

    assert_eq!(
        package::checksum(&package).expect("checksum"),
        package::checksum(&shuffled).expect("checksum shuffled")
    );

    // Any structural change moves the checksum.
    let mut changed = package.clone();
    changed.record_types[0].fields[1].required = true;
    assert_ne!(
        package::checksum(&package).expect("checksum"),
        package::checksum(&changed).expect("checksum changed")
    );
}
