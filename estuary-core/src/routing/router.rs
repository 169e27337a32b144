//! The composite router: trie sub-routers over trie-eligible registration
//! runs, sequential sub-routers over the rest, queried in registration
//! order with score-based selection.
use std::collections::HashMap;

use tracing::warn;

use super::{
    context::{RoutingContext, RoutingResult, RoutingScore},
    route::{MethodSet, Route, RouteKey},
    trie::RoutingTrie,
};

/// A selected route: the route, the per-request result, and the bound value.
#[derive(Debug)]
pub struct Routed<'a, V> {
    pub route: &'a Route,
    pub result: RoutingResult,
    pub value: &'a V,
    /// Registration index; stable identity for the cache layer.
    pub index: usize,
}

struct RouteEntry<V> {
    route: Route,
    value: V,
}

enum Group {
    Trie(RoutingTrie<usize>),
    Sequential(Vec<usize>),
}

/// Called at build time for each pair of routes with identical dimensions.
pub type DuplicateCallback = Box<dyn Fn(&Route, &Route) + Send + Sync>;

pub struct Router<V> {
    entries: Vec<RouteEntry<V>>,
    groups: Vec<Group>,
    /// Indices whose selection must never be memoized.
    ambiguous: Vec<bool>,
    has_ambiguous: bool,
}

impl<V> Router<V> {
    pub fn builder() -> RouterBuilder<V> {
        RouterBuilder::new()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any registered route carries dynamic predicates; controls how
    /// much of the request participates in the cache fingerprint.
    pub fn has_ambiguous(&self) -> bool {
        self.has_ambiguous
    }

    pub fn is_ambiguous(&self, index: usize) -> bool {
        self.ambiguous.get(index).copied().unwrap_or(true)
    }

    /// Whether any ambiguous route's path dimension covers this request.
    /// While such a route overlaps, memoizing a selection (or a miss) could
    /// shadow predicate-sensitive dispatch.
    pub fn ambiguous_overlaps(&self, ctx: &RoutingContext<'_>) -> bool {
        self.has_ambiguous
            && self
                .entries
                .iter()
                .enumerate()
                .any(|(i, e)| self.ambiguous[i] && e.route.pattern().match_path(ctx.path()).is_some())
    }

    /// Re-apply one entry to a request; used by the cache hit path to
    /// recompute the per-request result.
    pub fn apply_entry(&self, index: usize, ctx: &RoutingContext<'_>) -> Option<Routed<'_, V>> {
        let entry = self.entries.get(index)?;
        let result = entry.route.apply(ctx)?;
        Some(Routed {
            route: &entry.route,
            result,
            value: &entry.value,
            index,
        })
    }

    /// Select the best-scoring candidate, or `None` when nothing (not even
    /// a deferred candidate) covers the request path.
    ///
    /// Candidates are visited most-complex-first within each group; a
    /// strictly greater score replaces the current best, so earlier
    /// candidates win ties. A `HIGHEST`-scoring candidate short-circuits.
    pub fn find(&self, ctx: &RoutingContext<'_>) -> Option<Routed<'_, V>> {
        let mut best: Option<Routed<'_, V>> = None;
        for group in &self.groups {
            match group {
                Group::Trie(trie) => {
                    let mut candidates: Vec<usize> =
                        trie.search(ctx.path()).into_iter().copied().collect();
                    candidates.sort_by(|&a, &b| {
                        self.entries[b]
                            .route
                            .complexity()
                            .cmp(&self.entries[a].route.complexity())
                            .then(a.cmp(&b))
                    });
                    for index in candidates {
                        if self.consider(index, ctx, &mut best) {
                            return best;
                        }
                    }
                }
                Group::Sequential(indices) => {
                    for &index in indices {
                        if self.consider(index, ctx, &mut best) {
                            return best;
                        }
                    }
                }
            }
        }
        best
    }

    /// Evaluate one candidate against the running best; returns true to
    /// short-circuit.
    fn consider<'a>(
        &'a self,
        index: usize,
        ctx: &RoutingContext<'_>,
        best: &mut Option<Routed<'a, V>>,
    ) -> bool {
        let entry = &self.entries[index];
        let Some(result) = entry.route.apply(ctx) else {
            return false;
        };
        let shortcut = result.is_matched() && result.score == RoutingScore::HIGHEST;
        let better = match best {
            Some(current) => result.score > current.result.score,
            None => true,
        };
        if better {
            *best = Some(Routed {
                route: &entry.route,
                result,
                value: &entry.value,
                index,
            });
        }
        shortcut && better
    }

    /// Every fully matching candidate in registration order. Synthesized
    /// fallback entries are excluded.
    pub fn find_all(&self, ctx: &RoutingContext<'_>) -> Vec<Routed<'_, V>> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.route.is_fallback())
            .filter_map(|(index, entry)| {
                let result = entry.route.apply(ctx)?;
                result.is_matched().then_some(Routed {
                    route: &entry.route,
                    result,
                    value: &entry.value,
                    index,
                })
            })
            .collect()
    }

    /// Union of the method sets of every route whose path dimension covers
    /// the request; backs the `allow` header on 405 responses.
    pub fn allowed_methods(&self, ctx: &RoutingContext<'_>) -> MethodSet {
        let mut out = MethodSet::default();
        for entry in &self.entries {
            if entry.route.is_fallback() {
                continue;
            }
            if entry.route.pattern().match_path(ctx.path()).is_some() {
                for m in entry.route.methods().iter() {
                    out.insert(m);
                }
            }
        }
        out
    }
}

pub struct RouterBuilder<V> {
    routes: Vec<(Route, V)>,
    fallback: Option<V>,
    on_duplicate: Option<DuplicateCallback>,
}

impl<V> RouterBuilder<V> {
    fn new() -> Self {
        Self {
            routes: Vec::new(),
            fallback: None,
            on_duplicate: None,
        }
    }

    pub fn route(mut self, route: Route, value: V) -> Self {
        self.routes.push((route, value));
        self
    }

    /// Value bound to the synthesized trailing-slash entries (§ fallback
    /// semantics: lower precedence than any explicit match).
    pub fn fallback(mut self, value: V) -> Self {
        self.fallback = Some(value);
        self
    }

    pub fn on_duplicate(mut self, callback: DuplicateCallback) -> Self {
        self.on_duplicate = Some(callback);
        self
    }
}

impl<V: Clone> RouterBuilder<V> {
    pub fn build(self) -> Router<V> {
        let RouterBuilder {
            mut routes,
            fallback,
            on_duplicate,
        } = self;

        // duplicate detection over explicit routes; predicate-bearing
        // routes may legitimately share every other dimension
        let mut seen: HashMap<RouteKey, usize> = HashMap::new();
        for (i, (route, _)) in routes.iter().enumerate() {
            match seen.get(&route.key()) {
                Some(&first) => {
                    let (prev, _) = &routes[first];
                    if route.is_cacheable() && prev.is_cacheable() {
                        match &on_duplicate {
                            Some(cb) => cb(prev, route),
                            None => warn!(
                                route = %route.pattern().canonical(),
                                "duplicate route registered; earlier registration wins ties"
                            ),
                        }
                    }
                }
                None => {
                    seen.insert(route.key(), i);
                }
            }
        }

        // trailing-slash fallback synthesis, appended after all explicit
        // routes so it can never win a tie
        if let Some(fallback_value) = fallback {
            let mut synthesized = Vec::new();
            for (route, _) in &routes {
                let Some(path) = route.pattern().exact_path() else {
                    continue;
                };
                if path.len() > 1 && path.ends_with('/') {
                    let stripped = &path[..path.len() - 1];
                    if let Ok(builder) = Route::builder().path(stripped) {
                        if let Ok(synth) = builder.fallback().build() {
                            synthesized.push((synth, fallback_value.clone()));
                        }
                    }
                }
            }
            routes.extend(synthesized);
        }

        let entries: Vec<RouteEntry<V>> = routes
            .into_iter()
            .map(|(route, value)| RouteEntry { route, value })
            .collect();

        // ambiguity: a non-cacheable route taints every same-key route
        let mut by_key: HashMap<RouteKey, Vec<usize>> = HashMap::new();
        for (i, entry) in entries.iter().enumerate() {
            by_key.entry(entry.route.key()).or_default().push(i);
        }
        let mut ambiguous = vec![false; entries.len()];
        for indices in by_key.values() {
            if indices.iter().any(|&i| !entries[i].route.is_cacheable()) {
                for &i in indices {
                    ambiguous[i] = true;
                }
            }
        }
        let has_ambiguous = ambiguous.iter().any(|&a| a);

        // group consecutive registration runs by trie eligibility
        let mut groups: Vec<Group> = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            match entry.route.pattern().trie_path() {
                Some(trie_path) => {
                    if let Some(Group::Trie(trie)) = groups.last_mut() {
                        trie.insert(&trie_path, i);
                    } else {
                        let mut trie = RoutingTrie::default();
                        trie.insert(&trie_path, i);
                        groups.push(Group::Trie(trie));
                    }
                }
                None => {
                    if let Some(Group::Sequential(indices)) = groups.last_mut() {
                        indices.push(i);
                    } else {
                        groups.push(Group::Sequential(vec![i]));
                    }
                }
            }
        }

        Router {
            entries,
            groups,
            ambiguous,
            has_ambiguous,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use http::{HeaderMap, Method};

    use super::*;
    use crate::routing::context::RoutingStatus;

    fn get_ctx<'r>(method: &'r Method, path: &'r str, headers: &'r HeaderMap) -> RoutingContext<'r> {
        RoutingContext::new(method, path, path, None, headers)
    }

    fn router(routes: &[(&str, &str)]) -> Router<String> {
        let mut b = Router::builder();
        for (pattern, tag) in routes {
            b = b.route(Route::of(Method::GET, pattern).unwrap(), tag.to_string());
        }
        b.build()
    }

    #[test]
    fn literal_wins_over_template() {
        let r = router(&[("/users/{id}", "param"), ("/users/new", "literal")]);
        let method = Method::GET;
        let headers = HeaderMap::new();

        let routed = r.find(&get_ctx(&method, "/users/new", &headers)).unwrap();
        assert_eq!(routed.value, "literal");

        let routed = r.find(&get_ctx(&method, "/users/42", &headers)).unwrap();
        assert_eq!(routed.value, "param");
        assert_eq!(routed.result.params.get("id"), Some("42"));
    }

    #[test]
    fn find_agrees_with_best_of_find_all() {
        let r = router(&[
            ("/a/{x}", "t1"),
            ("/a/b", "t2"),
            ("regex:^/a/(?P<x>[0-9]+)$", "t3"),
        ]);
        let method = Method::GET;
        let headers = HeaderMap::new();
        for path in ["/a/b", "/a/42", "/a/zzz", "/nothing"] {
            let ctx = get_ctx(&method, path, &headers);
            let found = r.find(&ctx);
            let all = r.find_all(&ctx);
            match found {
                Some(best) => {
                    assert!(best.result.is_matched());
                    // the best of find_all under the selection ordering:
                    // score, then complexity, then registration order
                    let expect = all
                        .iter()
                        .max_by(|a, b| {
                            a.result
                                .score
                                .cmp(&b.result.score)
                                .then(a.route.complexity().cmp(&b.route.complexity()))
                                .then(b.index.cmp(&a.index))
                        })
                        .unwrap();
                    assert_eq!(best.value, expect.value, "path {path}");
                }
                None => assert!(all.is_empty(), "path {path}"),
            }
        }
    }

    #[test]
    fn find_is_pure() {
        let r = router(&[("/x/{a}", "t")]);
        let method = Method::GET;
        let headers = HeaderMap::new();
        let ctx = get_ctx(&method, "/x/1", &headers);
        let first = r.find(&ctx).map(|r| (r.index, r.result.params.clone()));
        let second = r.find(&ctx).map(|r| (r.index, r.result.params.clone()));
        assert_eq!(first, second);
    }

    #[test]
    fn registration_order_breaks_ties() {
        let r = router(&[("/same/{a}", "first"), ("/same/{b}", "second")]);
        let method = Method::GET;
        let headers = HeaderMap::new();
        let routed = r.find(&get_ctx(&method, "/same/x", &headers)).unwrap();
        assert_eq!(routed.value, "first");
    }

    #[test]
    fn method_not_allowed_surfaces_when_nothing_matches_better() {
        let mut b = Router::builder();
        b = b.route(Route::of(Method::POST, "/items").unwrap(), "post".to_string());
        let r = b.build();
        let method = Method::GET;
        let headers = HeaderMap::new();
        let routed = r.find(&get_ctx(&method, "/items", &headers)).unwrap();
        assert_eq!(routed.result.status, RoutingStatus::MethodNotAllowed);

        let allowed = r.allowed_methods(&get_ctx(&method, "/items", &headers));
        assert!(allowed.contains(&Method::POST));
        assert!(!allowed.contains(&Method::GET));
    }

    #[test]
    fn sequential_and_trie_runs_compose() {
        let r = router(&[
            ("/files/*.txt", "glob"),   // sequential
            ("/files/readme.txt", "exact"), // trie
        ]);
        let method = Method::GET;
        let headers = HeaderMap::new();
        // both match at HIGHEST; the earlier registration run shortcuts
        let routed = r.find(&get_ctx(&method, "/files/readme.txt", &headers)).unwrap();
        assert_eq!(routed.value, "glob");
        let routed = r.find(&get_ctx(&method, "/files/notes.txt", &headers)).unwrap();
        assert_eq!(routed.value, "glob");
    }

    #[test]
    fn duplicate_detection_invokes_callback() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let _router = Router::builder()
            .route(Route::of(Method::GET, "/dup").unwrap(), 1u8)
            .route(Route::of(Method::GET, "/dup").unwrap(), 2u8)
            .on_duplicate(Box::new(move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            }))
            .build();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn trailing_slash_entry_bound_to_fallback() {
        let r = Router::builder()
            .route(Route::of(Method::GET, "/docs/").unwrap(), "docs".to_string())
            .fallback("fallback".to_string())
            .build();
        let method = Method::GET;
        let headers = HeaderMap::new();

        let routed = r.find(&get_ctx(&method, "/docs/", &headers)).unwrap();
        assert_eq!(routed.value, "docs");

        let routed = r.find(&get_ctx(&method, "/docs", &headers)).unwrap();
        assert_eq!(routed.value, "fallback");
        assert!(routed.route.is_fallback());

        // explicit route beats the synthesized entry
        let r = Router::builder()
            .route(Route::of(Method::GET, "/docs/").unwrap(), "docs".to_string())
            .route(Route::of(Method::GET, "/docs").unwrap(), "explicit".to_string())
            .fallback("fallback".to_string())
            .build();
        let routed = r.find(&get_ctx(&method, "/docs", &headers)).unwrap();
        assert_eq!(routed.value, "explicit");
    }

    #[test]
    fn predicate_routes_marked_ambiguous() {
        use crate::routing::predicate::RoutePredicate;
        let plain = Route::of(Method::GET, "/v").unwrap();
        let predicated = Route::builder()
            .methods([Method::GET])
            .path("/v")
            .unwrap()
            .param_predicate(RoutePredicate::parse("version=2").unwrap())
            .build()
            .unwrap();
        let r = Router::builder()
            .route(predicated, "v2".to_string())
            .route(plain, "v1".to_string())
            .build();
        assert!(r.has_ambiguous());
        // the predicated route taints the same-key plain route too
        assert!(r.is_ambiguous(0));
        assert!(r.is_ambiguous(1));
    }
}
