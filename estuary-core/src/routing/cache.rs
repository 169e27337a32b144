//! Route cache: a bounded window-TinyLFU cache over routing decisions.
//!
//! Only the selected entry index is memoized; `Route::apply` re-runs on
//! every hit because the parameter bindings (and the negotiated produces
//! type) depend on the request. Routes in the ambiguous set are never
//! written back, so predicate-sensitive dispatch is never memoized.
use std::sync::Arc;

use moka::sync::Cache;

use super::{
    context::{RouteFingerprint, RoutingContext},
    router::{Routed, Router},
};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("invalid route cache spec: {0}")]
pub struct CacheSpecError(String);

/// Caffeine-style cache spec string: comma-separated `key=value` pairs.
/// Recognized keys: `maximum_size`, `initial_capacity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteCacheSpec {
    pub maximum_size: u64,
    pub initial_capacity: Option<usize>,
}

impl RouteCacheSpec {
    pub fn parse(spec: &str) -> Result<Self, CacheSpecError> {
        let mut maximum_size = None;
        let mut initial_capacity = None;
        for part in spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| CacheSpecError(spec.to_string()))?;
            match key.trim() {
                "maximum_size" => {
                    maximum_size = Some(
                        value
                            .trim()
                            .parse::<u64>()
                            .map_err(|_| CacheSpecError(spec.to_string()))?,
                    );
                }
                "initial_capacity" => {
                    initial_capacity = Some(
                        value
                            .trim()
                            .parse::<usize>()
                            .map_err(|_| CacheSpecError(spec.to_string()))?,
                    );
                }
                _ => return Err(CacheSpecError(spec.to_string())),
            }
        }
        let maximum_size = maximum_size.ok_or_else(|| CacheSpecError(spec.to_string()))?;
        Ok(Self {
            maximum_size,
            initial_capacity,
        })
    }

    fn build<V: Clone + Send + Sync + 'static>(&self) -> Cache<RouteFingerprint, V> {
        let mut builder = Cache::builder().max_capacity(self.maximum_size);
        if let Some(initial) = self.initial_capacity {
            builder = builder.initial_capacity(initial);
        }
        builder.build()
    }
}

/// Memoized outcome of a `find`.
#[derive(Debug, Clone)]
enum FindOutcome {
    Found(usize),
    NotFound,
}

/// A router fronted by the route cache. `None` spec disables caching
/// entirely and every call falls through to the inner router.
pub struct CachedRouter<V> {
    router: Router<V>,
    find_cache: Option<Cache<RouteFingerprint, FindOutcome>>,
    find_all_cache: Option<Cache<RouteFingerprint, Arc<Vec<usize>>>>,
}

impl<V> CachedRouter<V> {
    pub fn new(router: Router<V>, spec: Option<&RouteCacheSpec>) -> Self {
        let (find_cache, find_all_cache) = match spec {
            Some(spec) => (Some(spec.build()), Some(spec.build())),
            None => (None, None),
        };
        Self {
            router,
            find_cache,
            find_all_cache,
        }
    }

    pub fn inner(&self) -> &Router<V> {
        &self.router
    }

    fn fingerprint(&self, ctx: &RoutingContext<'_>) -> RouteFingerprint {
        // with predicate-bearing routes in the table, otherwise-identical
        // fingerprints can route differently on the query string
        ctx.fingerprint(self.router.has_ambiguous())
    }

    pub fn find(&self, ctx: &RoutingContext<'_>) -> Option<Routed<'_, V>> {
        let Some(cache) = &self.find_cache else {
            return self.router.find(ctx);
        };
        let fingerprint = self.fingerprint(ctx);
        match cache.get(&fingerprint) {
            Some(FindOutcome::Found(index)) => {
                if let Some(routed) = self.router.apply_entry(index, ctx) {
                    if routed.result.is_matched() {
                        return Some(routed);
                    }
                }
                // the memoized route no longer applies to this request
                // (should not happen for cacheable routes); recompute
            }
            Some(FindOutcome::NotFound) => return None,
            None => {}
        }

        let found = self.router.find(ctx);
        // while an ambiguous route's path overlaps this request, neither a
        // selection nor a miss may be memoized: a fingerprint-equal request
        // could still route into (or out of) the predicate route
        if !self.router.ambiguous_overlaps(ctx) {
            match &found {
                Some(routed) => {
                    if routed.result.is_matched() && !self.router.is_ambiguous(routed.index) {
                        cache.insert(fingerprint, FindOutcome::Found(routed.index));
                    }
                }
                None => {
                    cache.insert(fingerprint, FindOutcome::NotFound);
                }
            }
        }
        found
    }

    /// `find_all` memoizes the matched index list and re-applies each route
    /// at serve time to recover per-request results.
    pub fn find_all(&self, ctx: &RoutingContext<'_>) -> Vec<Routed<'_, V>> {
        let Some(cache) = &self.find_all_cache else {
            return self.router.find_all(ctx);
        };
        let fingerprint = self.fingerprint(ctx);
        if let Some(indices) = cache.get(&fingerprint) {
            return indices
                .iter()
                .filter_map(|&i| self.router.apply_entry(i, ctx))
                .filter(|r| r.result.is_matched())
                .collect();
        }

        let all = self.router.find_all(ctx);
        let cacheable = all.iter().all(|r| !self.router.is_ambiguous(r.index))
            && !self.router.ambiguous_overlaps(ctx);
        if cacheable {
            cache.insert(fingerprint, Arc::new(all.iter().map(|r| r.index).collect()));
        }
        all
    }
}
