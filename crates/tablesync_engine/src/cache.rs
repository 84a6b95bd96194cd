//! Cache of server table resources.

use parking_lot::RwLock;
use std::collections::HashMap;
use tablesync_protocol::{SyncTag, TableResource};
use tracing::debug;

/// What to do with a cached resource after observing a newer tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDecision {
    /// The cached resource is current.
    Keep,
    /// Only the data ETag moved; update it in place.
    MergeDataETag,
    /// The cached resource is stale; drop it.
    Evict,
}

/// Decides whether a cached resource survives a tag observation.
pub trait InvalidationPolicy: Send + Sync {
    /// Compares a cached resource with a freshly observed tag.
    fn decide(&self, cached: &TableResource, observed: &SyncTag) -> CacheDecision;
}

/// Evicts on any schema or properties ETag mismatch.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvictOnMismatch;

impl InvalidationPolicy for EvictOnMismatch {
    fn decide(&self, cached: &TableResource, observed: &SyncTag) -> CacheDecision {
        if cached.schema_etag != observed.schema_etag
            || cached.properties_etag != observed.properties_etag
        {
            CacheDecision::Evict
        } else if cached.data_etag != observed.data_etag {
            CacheDecision::MergeDataETag
        } else {
            CacheDecision::Keep
        }
    }
}

/// Table resources keyed by table id, owned by one synchronizer.
pub struct ResourceCache {
    entries: RwLock<HashMap<String, TableResource>>,
    policy: Box<dyn InvalidationPolicy>,
}

impl ResourceCache {
    /// Creates an empty cache with the default policy.
    pub fn new() -> Self {
        Self::with_policy(EvictOnMismatch)
    }

    /// Creates an empty cache with a custom policy.
    pub fn with_policy(policy: impl InvalidationPolicy + 'static) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            policy: Box::new(policy),
        }
    }

    /// Returns a copy of the cached resource.
    pub fn get(&self, table_id: &str) -> Option<TableResource> {
        self.entries.read().get(table_id).cloned()
    }

    /// Caches a resource, replacing any previous one.
    pub fn insert(&self, resource: TableResource) {
        self.entries
            .write()
            .insert(resource.table_id.clone(), resource);
    }

    /// Replaces the whole cache with a fresh listing.
    pub fn replace_all(&self, resources: impl IntoIterator<Item = TableResource>) {
        let mut entries = self.entries.write();
        entries.clear();
        for resource in resources {
            entries.insert(resource.table_id.clone(), resource);
        }
    }

    /// Drops a cached resource.
    pub fn evict(&self, table_id: &str) -> Option<TableResource> {
        self.entries.write().remove(table_id)
    }

    /// Applies an observed tag to the cached resource of a table.
    pub fn observe(&self, table_id: &str, observed: &SyncTag) -> Option<CacheDecision> {
        let mut entries = self.entries.write();
        let cached = entries.get_mut(table_id)?;
        let decision = self.policy.decide(cached, observed);
        match decision {
            CacheDecision::Keep => {}
            CacheDecision::MergeDataETag => {
                cached.data_etag = observed.data_etag.clone();
            }
            CacheDecision::Evict => {
                entries.remove(table_id);
            }
        }
        debug!(table_id, ?decision, "observed table tag");
        Some(decision)
    }

    /// Number of cached resources.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for ResourceCache {
    fn default() -> Self {
        Self::new()
    }
}
