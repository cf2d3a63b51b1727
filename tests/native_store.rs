//! Native Store Tests
//!
//! Collection tree and document behavior through brokers:
//! - copyCollection yields an isomorphic tree with fresh ids
//! - removeCollection removes every descendant
//! - value index lookups follow document stores and removals
//! - binary mutations are journaled
//! - state survives a restart

use std::collections::BTreeSet;
use std::sync::Arc;

use tempfile::TempDir;
use xmlstore::config::DatabaseConfig;
use xmlstore::dom::{NodeId, QName, XmlNode};
use xmlstore::index::{AtomicValue, Comparison, IndexConfig, IndexRule, IndexType, ReindexMode};
use xmlstore::pool::{Broker, BrokerPool, InstanceManager};
use xmlstore::security::{Subject, DBA_GROUP};
use xmlstore::txn::{read_journal, JournalRecord};
use xmlstore::StorageError;

// =============================================================================
// Test Utilities
// =============================================================================

fn config(temp: &TempDir) -> DatabaseConfig {
    let mut config = DatabaseConfig::new(temp.path());
    config.sync_period_ms = 0;
    config
}

fn admin() -> Subject {
    Subject::new("admin", &[DBA_GROUP])
}

fn run<T>(pool: &Arc<BrokerPool>, f: impl FnOnce(&Broker) -> T) -> T {
    let broker = pool.acquire(&admin()).unwrap();
    let out = f(&broker);
    pool.release(&broker).unwrap();
    out
}

fn record(id: &str, title: &str) -> Vec<XmlNode> {
    vec![XmlNode::element("test")
        .attr("id", id)
        .text_child("title", title)]
}

/// Every (relative path, content) pair below `root`, plus all ids seen.
fn snapshot(broker: &Broker, root: &str) -> (BTreeSet<(String, String)>, BTreeSet<u32>, BTreeSet<u32>) {
    let mut entries = BTreeSet::new();
    let mut collection_ids = BTreeSet::new();
    let mut document_ids = BTreeSet::new();
    let mut stack = vec![root.to_string()];

    while let Some(path) = stack.pop() {
        let collection = broker.get_collection(&path).unwrap().unwrap();
        collection_ids.insert(collection.id);
        let relative = path[root.len()..].to_string();
        entries.insert((format!("{}/", relative), String::new()));

        let listing = broker.list_collection(&path).unwrap();
        for doc in listing.documents {
            let doc_path = format!("{}/{}", path, doc.name);
            document_ids.insert(broker.get_document(&doc_path).unwrap().unwrap().id);
            let content = broker.get_xml_resource(&doc_path).unwrap();
            let text: String = content.iter().map(|n| n.string_value()).collect();
            entries.insert((format!("{}/{}", relative, doc.name), text));
        }
        for child in listing.collections {
            stack.push(format!("{}/{}", path, child));
        }
    }
    (entries, collection_ids, document_ids)
}

fn build_tree(broker: &Broker) {
    broker.get_or_create_collection("/db/src/a/b").unwrap();
    broker.get_or_create_collection("/db/src/c").unwrap();
    broker.store_xml_resource("/db/src", "one.xml", &record("1", "one")).unwrap();
    broker.store_xml_resource("/db/src/a", "two.xml", &record("2", "two")).unwrap();
    broker.store_xml_resource("/db/src/a/b", "three.xml", &record("3", "three")).unwrap();
    broker.store_xml_resource("/db/src/c", "four.xml", &record("4", "four")).unwrap();
}

// =============================================================================
// Copy
// =============================================================================

/// The copy has the same shape and content, and none of the source's ids.
#[test]
fn test_copy_collection_is_isomorphic_with_fresh_ids() {
    let temp = TempDir::new().unwrap();
    let manager = InstanceManager::new();
    let pool = manager.configure("test", config(&temp)).unwrap();

    run(&pool, |broker| {
        build_tree(broker);
        broker.get_or_create_collection("/db/dst").unwrap();
        let (before_entries, before_cols, before_docs) = snapshot(broker, "/db/src");

        let copy = broker.copy_collection("/db/src", "/db/dst", "copy").unwrap();
        assert_eq!(copy.path, "/db/dst/copy");

        let (src_entries, src_cols, src_docs) = snapshot(broker, "/db/src");
        let (dst_entries, dst_cols, dst_docs) = snapshot(broker, "/db/dst/copy");

        assert_eq!(src_entries, before_entries, "source must be untouched");
        assert_eq!(src_cols, before_cols);
        assert_eq!(src_docs, before_docs);
        assert_eq!(dst_entries, src_entries);
        assert_eq!(dst_docs.len(), 4);
        assert!(dst_cols.is_disjoint(&src_cols));
        assert!(dst_docs.is_disjoint(&src_docs));
    });
}

/// Copy or move onto the source's own ancestor fails and leaves the tree as it was.
#[test]
fn test_copy_and_move_onto_ancestor_rejected() {
    let temp = TempDir::new().unwrap();
    let manager = InstanceManager::new();
    let pool = manager.configure("test", config(&temp)).unwrap();

    run(&pool, |broker| {
        build_tree(broker);
        let (before, _, _) = snapshot(broker, "/db/src");

        let err = broker.copy_collection("/db/src/a/b", "/db/src", "a").unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
        let err = broker.move_collection("/db/src/a/b", "/db/src", "a").unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));

        let (after, _, _) = snapshot(broker, "/db/src");
        assert_eq!(after, before);
    });
}

/// Copying onto an existing sibling replaces its content with the source's.
#[test]
fn test_copy_onto_existing_collection_replaces_it() {
    let temp = TempDir::new().unwrap();
    let manager = InstanceManager::new();
    let pool = manager.configure("test", config(&temp)).unwrap();

    run(&pool, |broker| {
        build_tree(broker);
        broker.copy_collection("/db/src/a", "/db/src", "c").unwrap();

        let (copied, _, _) = snapshot(broker, "/db/src/c");
        let (source, _, _) = snapshot(broker, "/db/src/a");
        assert_eq!(copied, source);
        assert!(broker.get_document("/db/src/c/four.xml").unwrap().is_none());
    });
}

// =============================================================================
// Removal
// =============================================================================

/// Every descendant collection and document is gone afterwards.
#[test]
fn test_remove_collection_removes_descendants() {
    let temp = TempDir::new().unwrap();
    let manager = InstanceManager::new();
    let pool = manager.configure("test", config(&temp)).unwrap();

    run(&pool, |broker| {
        build_tree(broker);
        broker.remove_collection("/db/src").unwrap();

        for path in ["/db/src", "/db/src/a", "/db/src/a/b", "/db/src/c"] {
            assert!(broker.get_collection(path).unwrap().is_none(), "{} still present", path);
        }
        for path in ["/db/src/one.xml", "/db/src/a/two.xml", "/db/src/a/b/three.xml", "/db/src/c/four.xml"] {
            assert!(broker.get_document(path).unwrap().is_none(), "{} still present", path);
        }
        let stats = broker.store().stats().unwrap();
        assert_eq!(stats.documents, 0);
        assert_eq!(stats.collections, 1);
    });
}

// =============================================================================
// Value Index
// =============================================================================

/// Integer value under /test/@id: found after store, gone after removal.
#[test]
fn test_typed_value_find_then_remove() {
    let temp = TempDir::new().unwrap();
    let manager = InstanceManager::new();
    let pool = manager.configure("test", config(&temp)).unwrap();

    run(&pool, |broker| {
        broker.get_or_create_collection("/db/test").unwrap();
        let rules = vec![IndexRule::path("/test/@id", IndexType::Integer).unwrap()];
        broker.set_index_config("/db/test", Some(IndexConfig::new(rules))).unwrap();
        let doc = broker.store_xml_resource("/db/test", "d.xml", &record("42", "x")).unwrap();

        let found = broker.find("/db/test", Comparison::Eq, None, &AtomicValue::Integer(42)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found.node_ids(doc.id), vec!["1.1".parse::<NodeId>().unwrap()]);

        let range = broker.find("/db/test", Comparison::Gt, None, &AtomicValue::Integer(40)).unwrap();
        assert_eq!(range.len(), 1);
        let titles = broker.find_elements("/db/test", &QName::element("title")).unwrap();
        assert_eq!(titles.len(), 1);

        broker.remove_xml_resource("/db/test/d.xml").unwrap();
        let found = broker.find("/db/test", Comparison::Eq, None, &AtomicValue::Integer(42)).unwrap();
        assert!(found.is_empty());
        assert_eq!(broker.store().value_index().store().len().unwrap(), 0);
    });
}

/// Results come back in document order across several matches.
#[test]
fn test_find_returns_document_order() {
    let temp = TempDir::new().unwrap();
    let manager = InstanceManager::new();
    let pool = manager.configure("test", config(&temp)).unwrap();

    run(&pool, |broker| {
        broker.get_or_create_collection("/db/items").unwrap();
        let rules = vec![IndexRule::path("//item", IndexType::String).unwrap()];
        broker.set_index_config("/db/items", Some(IndexConfig::new(rules))).unwrap();
        let content = vec![XmlNode::element("list")
            .text_child("item", "red")
            .text_child("item", "blue")
            .text_child("item", "red")];
        let doc = broker.store_xml_resource("/db/items", "l.xml", &content).unwrap();

        let found = broker
            .find("/db/items", Comparison::Eq, None, &AtomicValue::string("red"))
            .unwrap();
        let ids: Vec<String> = found.node_ids(doc.id).iter().map(|n| n.to_string()).collect();
        assert_eq!(ids, vec!["1.1", "1.3"]);
    });
}

/// A repair reindex rebuilds exactly what was there.
#[test]
fn test_repair_reindex_is_stable() {
    let temp = TempDir::new().unwrap();
    let manager = InstanceManager::new();
    let pool = manager.configure("test", config(&temp)).unwrap();

    run(&pool, |broker| {
        broker.get_or_create_collection("/db/test").unwrap();
        let rules = vec![IndexRule::path("/test/@id", IndexType::Integer).unwrap()];
        broker.set_index_config("/db/test", Some(IndexConfig::new(rules))).unwrap();
        for i in 0..5 {
            broker
                .store_xml_resource("/db/test", &format!("d{}.xml", i), &record(&i.to_string(), "t"))
                .unwrap();
        }
        let keys_before = broker.store().value_index().store().len().unwrap();

        let report = broker.reindex_collection("/db/test", ReindexMode::Repair).unwrap();
        assert_eq!(report.documents, 5);
        assert_eq!(broker.store().value_index().store().len().unwrap(), keys_before);
        for i in 0..5 {
            let found = broker.find("/db/test", Comparison::Eq, None, &AtomicValue::Integer(i)).unwrap();
            assert_eq!(found.len(), 1);
        }
    });
}

// =============================================================================
// Journal and Binary Resources
// =============================================================================

/// Binary store and collection removal leave journal records behind.
#[test]
fn test_binary_mutations_are_journaled() {
    let temp = TempDir::new().unwrap();
    let manager = InstanceManager::new();
    let pool = manager.configure("test", config(&temp)).unwrap();

    run(&pool, |broker| {
        broker.get_or_create_collection("/db/bin").unwrap();
        let doc = broker
            .store_binary_resource("/db/bin", "blob.dat", b"payload", "application/octet-stream")
            .unwrap();
        assert_eq!(doc.metadata.content_length, 7);
        assert_eq!(broker.get_binary_resource("/db/bin/blob.dat").unwrap(), b"payload");
        broker.remove_collection("/db/bin").unwrap();
    });
    manager.stop("test", false).unwrap();

    let entries = read_journal(&temp.path().join("journal").join("journal.log")).unwrap();
    assert!(entries
        .iter()
        .any(|e| matches!(&e.record, JournalRecord::StoreBinary { path, .. } if path.ends_with("blob.dat"))));
    assert!(entries
        .iter()
        .any(|e| matches!(e.record, JournalRecord::RenameBinaryDir { .. })));
    let lsns: Vec<u64> = entries.iter().map(|e| e.lsn).collect();
    assert!(lsns.windows(2).all(|w| w[0] < w[1]));
}

// =============================================================================
// Restart
// =============================================================================

/// Collections, documents and index keys survive stop and reconfigure.
#[test]
fn test_state_survives_restart() {
    let temp = TempDir::new().unwrap();
    let manager = InstanceManager::new();

    let pool = manager.configure("test", config(&temp)).unwrap();
    run(&pool, |broker| {
        broker.get_or_create_collection("/db/test").unwrap();
        let rules = vec![IndexRule::path("/test/@id", IndexType::Integer).unwrap()];
        broker.set_index_config("/db/test", Some(IndexConfig::new(rules))).unwrap();
        broker.store_xml_resource("/db/test", "d.xml", &record("7", "kept")).unwrap();
    });
    manager.stop("test", false).unwrap();

    let pool = manager.configure("test", config(&temp)).unwrap();
    run(&pool, |broker| {
        let content = broker.get_xml_resource("/db/test/d.xml").unwrap();
        assert_eq!(content, record("7", "kept"));
        let found = broker.find("/db/test", Comparison::Eq, None, &AtomicValue::Integer(7)).unwrap();
        assert_eq!(found.len(), 1);

        let fresh = broker.store_xml_resource("/db/test", "e.xml", &record("8", "new")).unwrap();
        let old = broker.get_document("/db/test/d.xml").unwrap().unwrap();
        assert_ne!(fresh.id, old.id);
    });
}
