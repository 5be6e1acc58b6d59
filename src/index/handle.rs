//! Shared handle to a group's current compiled index.
//!
//! This module provides:
//! - Atomic replacement of the index without blocking readers
//! - A decision cache for request matches
//! - A generation counter bumped on every replacement

use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use quick_cache::sync::Cache;
use url::Url;

use super::{ActivationFlags, RequestMatch, ResourceKind, RuleIndex};

/// One loaded index, as published through an [`IndexHandle`].
pub struct IndexSnapshot {
    index: Box<dyn RuleIndex>,
}

impl IndexSnapshot {
    pub fn new(index: Box<dyn RuleIndex>) -> Self {
        Self { index }
    }
}

impl Deref for IndexSnapshot {
    type Target = dyn RuleIndex;

    fn deref(&self) -> &Self::Target {
        self.index.as_ref()
    }
}

fn cache_key(url: &Url, initiator: Option<&Url>, kind: ResourceKind) -> u64 {
    let mut hasher = ahash::AHasher::default();
    url.as_str().hash(&mut hasher);
    initiator.map(Url::as_str).hash(&mut hasher);
    kind.hash(&mut hasher);
    hasher.finish()
}

/// Holds the current index of one rule group.
///
/// Readers that loaded a snapshot keep using it while a rebuild swaps in a
/// new one; the old index is dropped once the last reader releases it.
pub struct IndexHandle {
    inner: ArcSwapOption<IndexSnapshot>,
    cache: Option<Cache<u64, RequestMatch>>,
    cache_capacity: usize,
    generation: AtomicU64,
}

impl IndexHandle {
    /// Create an empty handle. A capacity of zero disables the decision cache.
    pub fn new(cache_capacity: usize) -> Self {
        let cache = if cache_capacity > 0 {
            Some(Cache::new(cache_capacity))
        } else {
            None
        };
        Self {
            inner: ArcSwapOption::empty(),
            cache,
            cache_capacity,
            generation: AtomicU64::new(0),
        }
    }

    /// Replace the current index and invalidate cached decisions.
    pub fn store(&self, index: Option<Box<dyn RuleIndex>>) {
        self.inner.store(index.map(|i| Arc::new(IndexSnapshot::new(i))));
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.clear_cache();
    }

    /// The current index, if one has been built.
    pub fn load(&self) -> Option<Arc<IndexSnapshot>> {
        self.inner.load_full()
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.load().is_some()
    }

    /// Checksum of the current index, empty when there is none.
    pub fn checksum(&self) -> String {
        match &*self.inner.load() {
            Some(index) => index.checksum().to_string(),
            None => String::new(),
        }
    }

    /// Match a request with caching. Without an index nothing matches.
    pub fn find_request_match(
        &self,
        url: &Url,
        initiator: Option<&Url>,
        kind: ResourceKind,
    ) -> RequestMatch {
        let key = cache_key(url, initiator, kind);

        if let Some(ref cache) = self.cache {
            if let Some(result) = cache.get(&key) {
                return result;
            }
        }

        let result = match &*self.inner.load() {
            Some(index) => index.find_request_match(url, initiator, kind),
            None => RequestMatch::NoMatch,
        };

        if let Some(ref cache) = self.cache {
            cache.insert(key, result);
        }
        result
    }

    pub fn activations(&self, url: &Url) -> ActivationFlags {
        match &*self.inner.load() {
            Some(index) => index.activations(url),
            None => ActivationFlags::empty(),
        }
    }

    /// Drop every cached decision.
    pub fn clear_cache(&self) {
        if let Some(ref cache) = self.cache {
            cache.clear();
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        match self.cache {
            Some(ref cache) => CacheStats {
                capacity: self.cache_capacity,
                len: cache.len(),
                enabled: true,
            },
            None => CacheStats {
                capacity: 0,
                len: 0,
                enabled: false,
            },
        }
    }

    /// Get the current generation (incremented on each replacement).
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for IndexHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexHandle")
            .field("checksum", &self.checksum())
            .field("generation", &self.generation())
            .finish()
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    /// Maximum cache capacity.
    pub capacity: usize,
    /// Current number of entries in the cache.
    pub len: usize,
    /// Whether caching is enabled.
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{combined_checksum, DomainIndexBuilder, IndexBytes, RuleBuffer, RuleIndexBuilder};
    use crate::source::SourceId;

    fn build(rules: &str) -> Box<dyn RuleIndex> {
        let buffers = vec![RuleBuffer {
            source_id: SourceId(1),
            checksum: crate::index::sha256_hex(rules.as_bytes()),
            rules: Arc::from(rules),
        }];
        let checksum = combined_checksum(&buffers);
        let builder = DomainIndexBuilder;
        let bytes = builder.build(&checksum, &buffers).unwrap();
        builder.load(IndexBytes::Owned(bytes), &checksum).unwrap()
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_empty_handle_matches_nothing() {
        let handle = IndexHandle::new(16);
        assert!(!handle.is_loaded());
        assert_eq!(handle.checksum(), "");
        assert_eq!(
            handle.find_request_match(&url("https://ads.example.com/"), None, ResourceKind::Image),
            RequestMatch::NoMatch
        );
    }

    #[test]
    fn test_cache_hit() {
        let handle = IndexHandle::new(16);
        handle.store(Some(build("||ads.example.com^\n")));
        let target = url("https://ads.example.com/a.png");

        let _ = handle.find_request_match(&target, None, ResourceKind::Image);
        assert_eq!(handle.cache_stats().len, 1);
        let _ = handle.find_request_match(&target, None, ResourceKind::Image);
        assert_eq!(handle.cache_stats().len, 1);
        let _ = handle.find_request_match(&target, None, ResourceKind::Script);
        assert_eq!(handle.cache_stats().len, 2);
    }

    #[test]
    fn test_store_swaps_and_clears_cache() {
        let handle = IndexHandle::new(16);
        let target = url("https://ads.example.com/a.png");

        handle.store(Some(build("||ads.example.com^\n")));
        assert_eq!(handle.generation(), 1);
        assert_eq!(
            handle.find_request_match(&target, None, ResourceKind::Image),
            RequestMatch::Blocked
        );

        // A reader holding the old snapshot keeps it alive across the swap
        let old = handle.load().unwrap();
        handle.store(Some(build("||other.example.com^\n")));
        assert_eq!(handle.generation(), 2);
        assert_eq!(handle.cache_stats().len, 0);
        assert_eq!(
            handle.find_request_match(&target, None, ResourceKind::Image),
            RequestMatch::NoMatch
        );
        assert_eq!(old.rule_count(), 1);
        assert_eq!(
            old.find_request_match(&target, None, ResourceKind::Image),
            RequestMatch::Blocked
        );
    }

    #[test]
    fn test_no_cache() {
        let handle = IndexHandle::new(0);
        handle.store(Some(build("||ads.example.com^\n")));
        let _ = handle.find_request_match(&url("https://ads.example.com/"), None, ResourceKind::Image);
        let stats = handle.cache_stats();
        assert!(!stats.enabled);
        assert_eq!(stats.len, 0);
    }
}
