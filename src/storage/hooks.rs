//! Collection and document lifecycle hooks
//!
//! Hooks are registered once when the instance is configured. A `before_*`
//! callback returning an error aborts the operation before anything is
//! changed; `after_*` callbacks are notifications.

use std::sync::Arc;

use crate::errors::StorageResult;
use crate::security::Subject;

use super::collection::Collection;
use super::document::DocumentRecord;

#[allow(unused_variables)]
pub trait CollectionHook: Send + Sync {
    fn before_create(&self, subject: &Subject, path: &str) -> StorageResult<()> {
        Ok(())
    }

    fn after_create(&self, subject: &Subject, collection: &Collection) {}

    fn before_copy(&self, subject: &Subject, source: &str, target: &str) -> StorageResult<()> {
        Ok(())
    }

    fn after_copy(&self, subject: &Subject, source: &str, collection: &Collection) {}

    fn before_move(&self, subject: &Subject, source: &str, target: &str) -> StorageResult<()> {
        Ok(())
    }

    fn after_move(&self, subject: &Subject, source: &str, collection: &Collection) {}

    fn before_delete(&self, subject: &Subject, path: &str) -> StorageResult<()> {
        Ok(())
    }

    fn after_delete(&self, subject: &Subject, path: &str) {}
}

#[allow(unused_variables)]
pub trait DocumentHook: Send + Sync {
    fn before_create(&self, subject: &Subject, path: &str) -> StorageResult<()> {
        Ok(())
    }

    fn after_create(&self, subject: &Subject, document: &DocumentRecord) {}

    /// An existing document is about to be replaced or edited.
    fn before_update(&self, subject: &Subject, document: &DocumentRecord) -> StorageResult<()> {
        Ok(())
    }

    fn after_update(&self, subject: &Subject, document: &DocumentRecord) {}

    fn before_copy(&self, subject: &Subject, source: &DocumentRecord, target: &str) -> StorageResult<()> {
        Ok(())
    }

    fn after_copy(&self, subject: &Subject, source: &str, document: &DocumentRecord) {}

    fn before_move(&self, subject: &Subject, source: &DocumentRecord, target: &str) -> StorageResult<()> {
        Ok(())
    }

    fn after_move(&self, subject: &Subject, source: &str, document: &DocumentRecord) {}

    fn before_delete(&self, subject: &Subject, document: &DocumentRecord) -> StorageResult<()> {
        Ok(())
    }

    fn after_delete(&self, subject: &Subject, path: &str) {}
}

/// The fixed hook list of an instance
#[derive(Clone, Default)]
pub struct HookSet {
    collection: Vec<Arc<dyn CollectionHook>>,
    document: Vec<Arc<dyn DocumentHook>>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection_hook(mut self, hook: Arc<dyn CollectionHook>) -> Self {
        self.collection.push(hook);
        self
    }

    pub fn with_document_hook(mut self, hook: Arc<dyn DocumentHook>) -> Self {
        self.document.push(hook);
        self
    }

    pub fn collection_hooks(&self) -> &[Arc<dyn CollectionHook>] {
        &self.collection
    }

    pub fn document_hooks(&self) -> &[Arc<dyn DocumentHook>] {
        &self.document
    }

    /// Run a `before_*` callback on every collection hook, stopping at the first error.
    pub(crate) fn before_collection<F>(&self, f: F) -> StorageResult<()>
    where
        F: Fn(&dyn CollectionHook) -> StorageResult<()>,
    {
        self.collection.iter().try_for_each(|h| f(h.as_ref()))
    }

    pub(crate) fn after_collection<F>(&self, f: F)
    where
        F: Fn(&dyn CollectionHook),
    {
        self.collection.iter().for_each(|h| f(h.as_ref()));
    }

    pub(crate) fn before_document<F>(&self, f: F) -> StorageResult<()>
    where
        F: Fn(&dyn DocumentHook) -> StorageResult<()>,
    {
        self.document.iter().try_for_each(|h| f(h.as_ref()))
    }

    pub(crate) fn after_document<F>(&self, f: F)
    where
        F: Fn(&dyn DocumentHook),
    {
        self.document.iter().for_each(|h| f(h.as_ref()));
    }
}
