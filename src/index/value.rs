//! Native value index
//!
//! Node values are batched per document in a worker and merged into the
//! shared `values` store on flush. Each key holds one record made of
//! per-document segments (see `segment`); flushing appends the current
//! document's segment without reading the record, removal reads the record,
//! drops or filters that document's segment and writes the rest back.
//!
//! Failure policy for a batch: a read-only store stops the flush and leaves
//! the unwritten keys pending so a later flush can retry. Any other per-key
//! failure is logged and counted and the batch moves on; the damage is
//! repaired by the next reindex.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::btree::{BTreeStore, IndexQuery};
use crate::dom::{NodeId, NodePath, QName, StoredNode};
use crate::errors::{StorageError, StorageResult};
use crate::observability::{log_event_with_fields, Event, Logger, MetricsRegistry};

use super::atomic::{atomize, AtomicValue, IndexType};
use super::config::IndexConfig;
use super::key::{collection_prefix, typed_prefix, value_key, IndexScope, ValueKey};
use super::matcher::TermMatcher;
use super::node_set::{DocumentSet, NodeProxy, NodeSet};
use super::segment::{encode_segment, segments};
use super::watchdog::Watchdog;
use super::{IndexSink, ReindexMode};

pub const FILE_NAME: &str = "values";

/// Value comparison for `find`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Neq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl Comparison {
    fn to_query(self, key: Vec<u8>) -> IndexQuery {
        match self {
            Comparison::Eq => IndexQuery::Eq(key),
            Comparison::Neq => IndexQuery::Neq(key),
            Comparison::Lt => IndexQuery::Lt(key),
            Comparison::LtEq => IndexQuery::Leq(key),
            Comparison::Gt => IndexQuery::Gt(key),
            Comparison::GtEq => IndexQuery::Geq(key),
        }
    }
}

/// What a query returns for a matched node when a context set is given
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultAxis {
    /// The matched node, if it lies inside (or is) a context node
    SelfNode,
    /// The nearest context node that is the match or one of its ancestors
    Ancestor,
}

/// One distinct key value seen by `scan_index_keys`
#[derive(Debug, Clone, PartialEq)]
pub struct ValueOccurrences {
    pub value: AtomicValue,
    pub occurrences: usize,
    pub documents: Vec<u32>,
}

/// Outcome of a flush or remove batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub keys_written: usize,
    pub keys_failed: usize,
}

pub struct NativeValueIndex {
    db: BTreeStore,
    case_sensitive: bool,
    metrics: Arc<MetricsRegistry>,
}

impl NativeValueIndex {
    pub fn open(dir: &Path, case_sensitive: bool, metrics: Arc<MetricsRegistry>) -> StorageResult<Self> {
        Ok(Self {
            db: BTreeStore::open(dir, FILE_NAME)?,
            case_sensitive,
            metrics,
        })
    }

    pub fn in_memory(case_sensitive: bool, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            db: BTreeStore::in_memory(FILE_NAME),
            case_sensitive,
            metrics,
        }
    }

    pub fn store(&self) -> &BTreeStore {
        &self.db
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    /// A batching worker for one document
    pub fn worker(&self, doc_id: u32, collection_id: u32, config: Option<IndexConfig>) -> ValueIndexWorker<'_> {
        ValueIndexWorker {
            index: self,
            doc_id,
            collection_id,
            config,
            mode: ReindexMode::Store,
            whole_document: false,
            pending: BTreeMap::new(),
        }
    }

    /// Remove every key of a collection.
    pub fn drop_collection(&self, collection_id: u32) -> StorageResult<usize> {
        let removed = self.db.remove_prefix(&collection_prefix(collection_id))?;
        log_event_with_fields(
            Event::IndexDrop,
            &[
                ("collection", &collection_id.to_string()),
                ("index", FILE_NAME),
                ("keys", &removed.to_string()),
            ],
        );
        Ok(removed)
    }

    /// Cut one document's segments out of every key of its collection.
    pub fn drop_document(&self, collection_id: u32, doc_id: u32) -> StorageResult<usize> {
        let keys = self.db.keys_with_prefix(&collection_prefix(collection_id))?;
        let mut changed = 0;
        for key in keys {
            match self.filter_record(&key, doc_id, None) {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e @ StorageError::ReadOnly(_)) => return Err(e),
                Err(e) => {
                    self.metrics.add_index_key_failures(1);
                    Logger::error(
                        "VALUE_INDEX_DROP_KEY_FAILED",
                        &[("doc", &doc_id.to_string()), ("error", &e.to_string())],
                    );
                }
            }
        }
        Ok(changed)
    }

    /// Drop or filter `doc_id`'s segment in one record. `removed` must be
    /// sorted; None drops the whole segment. An emptied record is deleted.
    fn filter_record(&self, key: &[u8], doc_id: u32, removed: Option<&[NodeId]>) -> StorageResult<bool> {
        let mut changed = false;
        self.db.rewrite(key, |data| {
            let mut out = Vec::with_capacity(data.len());
            for segment in segments(data) {
                let segment = segment?;
                if segment.doc_id != doc_id {
                    out.extend_from_slice(segment.as_bytes());
                    continue;
                }
                changed = true;
                if let Some(removed) = removed {
                    let kept: Vec<NodeId> = segment
                        .node_ids()?
                        .into_iter()
                        .filter(|id| removed.binary_search(id).is_err())
                        .collect();
                    if !kept.is_empty() {
                        encode_segment(doc_id, &kept, &mut out);
                    }
                }
            }
            Ok(if out.is_empty() { None } else { Some(out) })
        })?;
        Ok(changed)
    }

    fn normalize(&self, value: &AtomicValue) -> AtomicValue {
        if self.case_sensitive {
            value.clone()
        } else {
            value.clone().fold_case()
        }
    }

    /// Nodes whose value under `qname` (generic scope if None) compares
    /// to `value` as requested.
    #[allow(clippy::too_many_arguments)]
    pub fn find(
        &self,
        watchdog: &Watchdog,
        comparison: Comparison,
        docs: &DocumentSet,
        context: Option<&NodeSet>,
        axis: ResultAxis,
        qname: Option<&QName>,
        value: &AtomicValue,
    ) -> StorageResult<NodeSet> {
        let scope = IndexScope::from(qname);
        let mut result = NodeSet::new();
        self.find_in_scope(watchdog, comparison, docs, context, axis, &scope, value, &mut result)?;
        Ok(result)
    }

    /// `find` over the generic scope and every qname the documents' collections index.
    pub fn find_all(
        &self,
        watchdog: &Watchdog,
        comparison: Comparison,
        docs: &DocumentSet,
        context: Option<&NodeSet>,
        axis: ResultAxis,
        value: &AtomicValue,
    ) -> StorageResult<NodeSet> {
        let mut result = NodeSet::new();
        for scope in all_scopes(docs) {
            self.find_in_scope(watchdog, comparison, docs, context, axis, &scope, value, &mut result)?;
        }
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn find_in_scope(
        &self,
        watchdog: &Watchdog,
        comparison: Comparison,
        docs: &DocumentSet,
        context: Option<&NodeSet>,
        axis: ResultAxis,
        scope: &IndexScope,
        value: &AtomicValue,
        result: &mut NodeSet,
    ) -> StorageResult<()> {
        let value = self.normalize(value);
        for collection_id in docs.collection_ids() {
            watchdog.proceed()?;
            let prefix = typed_prefix(collection_id, scope, value.index_type());
            let query = comparison.to_query(value_key(collection_id, scope, &value));
            self.db.query(&prefix, &query, |_, data| {
                watchdog.proceed()?;
                collect_nodes(data, docs, context, axis, watchdog, result)?;
                Ok(true)
            })?;
        }
        Ok(())
    }

    /// Nodes whose string key satisfies `matcher`.
    #[allow(clippy::too_many_arguments)]
    pub fn match_values(
        &self,
        watchdog: &Watchdog,
        docs: &DocumentSet,
        context: Option<&NodeSet>,
        axis: ResultAxis,
        matcher: &TermMatcher,
        qname: Option<&QName>,
    ) -> StorageResult<NodeSet> {
        let mut result = NodeSet::new();
        let scope = IndexScope::from(qname);
        self.match_in_scope(watchdog, docs, context, axis, matcher, &scope, &mut result)?;
        Ok(result)
    }

    pub fn match_all(
        &self,
        watchdog: &Watchdog,
        docs: &DocumentSet,
        context: Option<&NodeSet>,
        axis: ResultAxis,
        matcher: &TermMatcher,
    ) -> StorageResult<NodeSet> {
        let mut result = NodeSet::new();
        for scope in all_scopes(docs) {
            self.match_in_scope(watchdog, docs, context, axis, matcher, &scope, &mut result)?;
        }
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn match_in_scope(
        &self,
        watchdog: &Watchdog,
        docs: &DocumentSet,
        context: Option<&NodeSet>,
        axis: ResultAxis,
        matcher: &TermMatcher,
        scope: &IndexScope,
        result: &mut NodeSet,
    ) -> StorageResult<()> {
        let matcher = if self.case_sensitive {
            matcher.clone()
        } else {
            matcher.clone().fold_case()
        };
        // Keys are lowercased in a case-insensitive index; only narrow when
        // bytes compare the same way the matcher does.
        let start = if self.case_sensitive { matcher.scan_start() } else { None };

        for collection_id in docs.collection_ids() {
            watchdog.proceed()?;
            let prefix = typed_prefix(collection_id, scope, IndexType::String);
            let query = match &start {
                Some(s) => {
                    let mut from = prefix.clone();
                    from.extend_from_slice(s.as_bytes());
                    IndexQuery::TruncRight(from)
                }
                None => IndexQuery::All,
            };
            self.db.query(&prefix, &query, |key, data| {
                watchdog.proceed()?;
                let decoded = ValueKey::decode(key)?;
                let term = decoded.value.as_str().unwrap_or_default();
                if matcher.matches(term) {
                    collect_nodes(data, docs, context, axis, watchdog, result)?;
                }
                Ok(true)
            })?;
        }
        Ok(())
    }

    /// Distinct values starting at `start` with their occurrence counts.
    ///
    /// String scans take `start` as a prefix, other types scan upward from
    /// it. `qnames` selects the scope: None for generic, an empty slice for
    /// every indexed qname of the document set.
    pub fn scan_index_keys(
        &self,
        watchdog: &Watchdog,
        docs: &DocumentSet,
        context: Option<&NodeSet>,
        qnames: Option<&[QName]>,
        start: &AtomicValue,
    ) -> StorageResult<Vec<ValueOccurrences>> {
        let start = self.normalize(start);
        let scopes: Vec<IndexScope> = match qnames {
            None => vec![IndexScope::Generic],
            Some([]) => docs.indexed_qnames().cloned().map(IndexScope::QName).collect(),
            Some(list) => list.iter().cloned().map(IndexScope::QName).collect(),
        };

        let mut by_value: BTreeMap<AtomicValue, (usize, std::collections::BTreeSet<u32>)> = BTreeMap::new();
        for collection_id in docs.collection_ids() {
            for scope in &scopes {
                watchdog.proceed()?;
                let prefix = typed_prefix(collection_id, scope, start.index_type());
                let from = value_key(collection_id, scope, &start);
                let query = if start.index_type() == IndexType::String {
                    IndexQuery::TruncRight(from)
                } else {
                    IndexQuery::Geq(from)
                };
                self.db.query(&prefix, &query, |key, data| {
                    watchdog.proceed()?;
                    let value = ValueKey::decode(key)?.value;
                    for segment in segments(data) {
                        let segment = segment?;
                        if !docs.contains(segment.doc_id) {
                            continue;
                        }
                        let count = match context {
                            None => segment.count as usize,
                            Some(ctx) => {
                                if !ctx.contains_doc(segment.doc_id) {
                                    continue;
                                }
                                segment
                                    .node_ids()?
                                    .iter()
                                    .filter(|id| ctx.has_ancestor_or_self(segment.doc_id, id))
                                    .count()
                            }
                        };
                        if count > 0 {
                            let entry = by_value.entry(value.clone()).or_default();
                            entry.0 += count;
                            entry.1.insert(segment.doc_id);
                        }
                    }
                    Ok(true)
                })?;
            }
        }
        Ok(by_value
            .into_iter()
            .map(|(value, (occurrences, documents))| ValueOccurrences {
                value,
                occurrences,
                documents: documents.into_iter().collect(),
            })
            .collect())
    }

    pub fn sync(&self) -> StorageResult<bool> {
        self.db.sync()
    }
}

fn all_scopes(docs: &DocumentSet) -> Vec<IndexScope> {
    let mut scopes = vec![IndexScope::Generic];
    scopes.extend(docs.indexed_qnames().cloned().map(IndexScope::QName));
    scopes
}

/// Decode a record and add its nodes that pass the document and context filters.
fn collect_nodes(
    data: &[u8],
    docs: &DocumentSet,
    context: Option<&NodeSet>,
    axis: ResultAxis,
    watchdog: &Watchdog,
    result: &mut NodeSet,
) -> StorageResult<()> {
    for segment in segments(data) {
        let segment = segment?;
        let doc_id = segment.doc_id;
        if !docs.contains(doc_id) {
            continue;
        }
        if let Some(ctx) = context {
            if !ctx.contains_doc(doc_id) {
                continue;
            }
        }
        let before = result.len();
        for node_id in segment.node_ids()? {
            match (context, axis) {
                (None, _) => {
                    result.add(NodeProxy::new(doc_id, node_id));
                }
                (Some(ctx), ResultAxis::Ancestor) => {
                    if let Some(ancestor) = ctx.nearest_ancestor_or_self(doc_id, &node_id) {
                        result.add(ancestor.clone());
                    }
                }
                (Some(ctx), ResultAxis::SelfNode) => {
                    if ctx.has_ancestor_or_self(doc_id, &node_id) {
                        result.add(NodeProxy::new(doc_id, node_id));
                    }
                }
            }
        }
        watchdog.add_results(result.len() - before);
    }
    Ok(())
}

type PendingKey = (IndexScope, AtomicValue);

/// Batches one document's index changes until `flush` or `remove`.
pub struct ValueIndexWorker<'a> {
    index: &'a NativeValueIndex,
    doc_id: u32,
    collection_id: u32,
    config: Option<IndexConfig>,
    mode: ReindexMode,
    /// Removals queue the whole-segment marker instead of single nodes
    whole_document: bool,
    /// None marks every node of the document under the key for removal
    pending: BTreeMap<PendingKey, Option<Vec<NodeId>>>,
}

impl<'a> ValueIndexWorker<'a> {
    pub fn doc_id(&self) -> u32 {
        self.doc_id
    }

    pub fn pending_keys(&self) -> usize {
        self.pending.len()
    }

    /// Removals from now on drop the document's entire segment under each
    /// key they touch, rather than the individual nodes.
    pub fn remove_whole_segments(&mut self) {
        self.whole_document = true;
    }

    /// Queue `content` of `node_id` under `scope`.
    ///
    /// With `remove` set the key is instead marked for removal of the whole
    /// document segment, unless nodes are already queued under it.
    pub fn store_value(
        &mut self,
        scope: IndexScope,
        index_type: IndexType,
        node_id: &NodeId,
        content: &str,
        remove: bool,
    ) {
        let Some(value) = self.atomize(index_type, node_id, content) else {
            return;
        };
        let key = (scope, value);
        if remove {
            self.pending.entry(key).or_insert(None);
            return;
        }
        if let Some(ids) = self.pending.entry(key).or_insert_with(|| Some(Vec::new())) {
            ids.push(node_id.clone());
        }
    }

    /// Queue removal of exactly this node under `scope`.
    pub fn mark_removed(&mut self, scope: IndexScope, index_type: IndexType, node_id: &NodeId, content: &str) {
        let Some(value) = self.atomize(index_type, node_id, content) else {
            return;
        };
        if let Some(ids) = self.pending.entry((scope, value)).or_insert_with(|| Some(Vec::new())) {
            ids.push(node_id.clone());
        }
    }

    fn atomize(&self, index_type: IndexType, node_id: &NodeId, content: &str) -> Option<AtomicValue> {
        let value = atomize(index_type, content, self.index.case_sensitive);
        if value.is_none() {
            Logger::trace(
                "VALUE_INDEX_VALUE_SKIPPED",
                &[
                    ("doc", &self.doc_id.to_string()),
                    ("node", &node_id.to_string()),
                    ("type", &format!("{:?}", index_type)),
                ],
            );
        }
        value
    }

    fn configured(&self, node: &StoredNode, path: &NodePath) -> Vec<(IndexScope, IndexType)> {
        match (&self.config, node.name()) {
            (Some(config), Some(name)) => config.rules_for(name, path),
            _ => Vec::new(),
        }
    }

    /// Append one segment per pending key.
    pub fn flush_pending(&mut self) -> StorageResult<FlushReport> {
        if self.pending.is_empty() {
            return Ok(FlushReport::default());
        }
        let mut report = FlushReport::default();
        let keys: Vec<PendingKey> = self.pending.keys().cloned().collect();
        for pending_key in keys {
            let Some(Some(mut ids)) = self.pending.get(&pending_key).cloned() else {
                self.pending.remove(&pending_key);
                continue;
            };
            ids.sort();
            ids.dedup();
            let (scope, value) = &pending_key;
            let key = value_key(self.collection_id, scope, value);
            let mut segment = Vec::new();
            encode_segment(self.doc_id, &ids, &mut segment);
            match self.index.db.append(key, &segment) {
                Ok(()) => {
                    report.keys_written += 1;
                    self.pending.remove(&pending_key);
                }
                Err(e @ StorageError::ReadOnly(_)) => {
                    Logger::warn(
                        "VALUE_INDEX_FLUSH_READ_ONLY",
                        &[
                            ("doc", &self.doc_id.to_string()),
                            ("pending", &self.pending.len().to_string()),
                        ],
                    );
                    self.record(&report);
                    return Err(e);
                }
                Err(e) => {
                    report.keys_failed += 1;
                    Logger::error(
                        "VALUE_INDEX_FLUSH_KEY_FAILED",
                        &[
                            ("doc", &self.doc_id.to_string()),
                            ("error", &e.to_string()),
                            ("value", &value.to_string()),
                        ],
                    );
                }
            }
        }
        self.pending.clear();
        self.record(&report);
        log_event_with_fields(
            Event::IndexFlush,
            &[
                ("doc", &self.doc_id.to_string()),
                ("failed", &report.keys_failed.to_string()),
                ("keys", &report.keys_written.to_string()),
            ],
        );
        Ok(report)
    }

    /// Rewrite every pending key without this document's queued nodes.
    pub fn remove(&mut self) -> StorageResult<FlushReport> {
        let mut report = FlushReport::default();
        let pending = std::mem::take(&mut self.pending);
        for ((scope, value), ids) in &pending {
            let key = value_key(self.collection_id, scope, value);
            let filter = ids.as_ref().map(|ids| {
                let mut ids = ids.clone();
                ids.sort();
                ids.dedup();
                ids
            });
            match self.index.filter_record(&key, self.doc_id, filter.as_deref()) {
                Ok(true) => report.keys_written += 1,
                Ok(false) => {}
                Err(e) => {
                    report.keys_failed += 1;
                    Logger::error(
                        "VALUE_INDEX_REMOVE_KEY_FAILED",
                        &[
                            ("doc", &self.doc_id.to_string()),
                            ("error", &e.to_string()),
                            ("value", &value.to_string()),
                        ],
                    );
                }
            }
        }
        self.record(&report);
        Ok(report)
    }

    fn record(&self, report: &FlushReport) {
        self.index.metrics.increment_index_flushes();
        self.index.metrics.add_index_keys_written(report.keys_written as u64);
        self.index.metrics.add_index_key_failures(report.keys_failed as u64);
    }
}

impl IndexSink for ValueIndexWorker<'_> {
    fn name(&self) -> &'static str {
        FILE_NAME
    }

    fn set_mode(&mut self, mode: ReindexMode) {
        self.mode = mode;
    }

    fn store_element(&mut self, node: &StoredNode, path: &NodePath, content: &str) {
        for (scope, index_type) in self.configured(node, path) {
            self.store_value(scope, index_type, &node.node_id, content, false);
        }
    }

    fn store_attribute(&mut self, node: &StoredNode, path: &NodePath, value: &str) {
        for (scope, index_type) in self.configured(node, path) {
            self.store_value(scope, index_type, &node.node_id, value, false);
        }
    }

    fn remove_node(&mut self, node: &StoredNode, path: &NodePath, content: &str) {
        let whole = self.whole_document;
        for (scope, index_type) in self.configured(node, path) {
            if whole {
                self.store_value(scope, index_type, &node.node_id, content, true);
            } else {
                self.mark_removed(scope, index_type, &node.node_id, content);
            }
        }
    }

    fn flush(&mut self) -> StorageResult<()> {
        match self.mode {
            ReindexMode::Remove => self.remove().map(|_| ()),
            ReindexMode::Store | ReindexMode::Repair => self.flush_pending().map(|_| ()),
        }
    }

    fn drop_document(&mut self) -> StorageResult<()> {
        self.pending.clear();
        self.index.drop_document(self.collection_id, self.doc_id).map(|_| ())
    }
}
