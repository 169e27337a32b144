//! The [`Route`] value: one immutable matching rule over an HTTP request.
use http::Method;
use mime::Mime;

use super::{
    context::{RoutingContext, RoutingResult, RoutingScore, RoutingStatus, QUALITY_MAX},
    pattern::{PathPattern, PatternError},
    predicate::RoutePredicate,
};

/// Small set over the registered method tokens; empty means "any method".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MethodSet(u16);

const KNOWN_METHODS: &[Method] = &[
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::OPTIONS,
    Method::PATCH,
    Method::TRACE,
    Method::CONNECT,
];

impl MethodSet {
    fn bit(method: &Method) -> Option<u16> {
        KNOWN_METHODS
            .iter()
            .position(|m| m == method)
            .map(|i| 1 << i)
    }

    pub fn insert(&mut self, method: &Method) {
        if let Some(bit) = Self::bit(method) {
            self.0 |= bit;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, method: &Method) -> bool {
        match Self::bit(method) {
            Some(bit) => self.0 & bit != 0,
            None => false,
        }
    }

    /// Method dimension check. HEAD is served by GET routes that do not
    /// declare HEAD themselves.
    pub fn matches(&self, method: &Method) -> bool {
        if self.is_empty() || self.contains(method) {
            return true;
        }
        *method == Method::HEAD && self.contains(&Method::GET)
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static Method> + '_ {
        KNOWN_METHODS
            .iter()
            .enumerate()
            .filter(move |(i, _)| self.0 & (1 << i) != 0)
            .map(|(_, m)| m)
    }
}

impl FromIterator<Method> for MethodSet {
    fn from_iter<T: IntoIterator<Item = Method>>(iter: T) -> Self {
        let mut set = MethodSet::default();
        for m in iter {
            set.insert(&m);
        }
        set
    }
}

/// Identity of a route's non-predicate dimensions. Routes sharing a key are
/// duplicates of each other (modulo predicates); a non-cacheable route
/// taints every same-key route for caching.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    path: String,
    methods: MethodSet,
    consumes: Vec<String>,
    produces: Vec<String>,
}

/// One immutable matching rule: path pattern, method set, media-type
/// dimensions, and dynamic predicates, plus the precomputed complexity used
/// for candidate ordering.
#[derive(Debug, Clone)]
pub struct Route {
    pattern: PathPattern,
    methods: MethodSet,
    consumes: Vec<Mime>,
    produces: Vec<Mime>,
    params_predicates: Vec<RoutePredicate>,
    headers_predicates: Vec<RoutePredicate>,
    complexity: u32,
    fallback: bool,
}

impl Route {
    pub fn builder() -> RouteBuilder {
        RouteBuilder::default()
    }

    /// Shorthand for a single-method route over a bare path pattern.
    pub fn of(method: Method, pattern: &str) -> Result<Self, PatternError> {
        Route::builder().methods([method]).path(pattern)?.build()
    }

    pub fn pattern(&self) -> &PathPattern {
        &self.pattern
    }

    pub fn methods(&self) -> &MethodSet {
        &self.methods
    }

    pub fn complexity(&self) -> u32 {
        self.complexity
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// A route with dynamic predicates routes differently for requests with
    /// an identical routing fingerprint, so its selection is never memoized.
    pub fn is_cacheable(&self) -> bool {
        self.params_predicates.is_empty() && self.headers_predicates.is_empty()
    }

    pub fn key(&self) -> RouteKey {
        RouteKey {
            path: self.pattern.canonical(),
            methods: self.methods,
            consumes: self.consumes.iter().map(|m| m.essence_str().to_string()).collect(),
            produces: self.produces.iter().map(|m| m.essence_str().to_string()).collect(),
        }
    }

    /// Apply the route to a request, per the matching rules: path, method,
    /// consumes, produces, then predicates. Dimensional failures after a
    /// path match yield deferred results so dispatch can answer with the
    /// right status; predicate failures are plain non-matches.
    pub fn apply(&self, ctx: &RoutingContext<'_>) -> Option<RoutingResult> {
        let params = self.pattern.match_path(ctx.path())?;

        if !self.methods.matches(ctx.method()) {
            return Some(RoutingResult::deferred(
                RoutingStatus::MethodNotAllowed,
                RoutingScore::LOWEST,
                params,
            ));
        }

        if !self.consumes.is_empty() {
            let consumed = ctx
                .content_type()
                .is_some_and(|ct| self.consumes.iter().any(|c| c.essence_str() == ct.essence_str()));
            if !consumed {
                return Some(RoutingResult::deferred(
                    RoutingStatus::UnsupportedMediaType,
                    RoutingScore {
                        method: true,
                        consumes: false,
                        produces: false,
                        quality: 0,
                    },
                    params,
                ));
            }
        }

        let (quality, negotiated) = match negotiate(ctx.accept(), &self.produces) {
            Some(out) => out,
            None => {
                return Some(RoutingResult::deferred(
                    RoutingStatus::NotAcceptable,
                    RoutingScore {
                        method: true,
                        consumes: true,
                        produces: false,
                        quality: 0,
                    },
                    params,
                ));
            }
        };

        if ctx.match_params_predicates && !self.params_predicates.is_empty() {
            let query_params = ctx.query_params();
            if !self
                .params_predicates
                .iter()
                .all(|p| p.matches_params(&query_params))
            {
                return None;
            }
        }
        if ctx.match_headers_predicates
            && !self
                .headers_predicates
                .iter()
                .all(|p| p.matches_headers(ctx.headers()))
        {
            return None;
        }

        Some(RoutingResult::matched(
            RoutingScore {
                method: true,
                consumes: true,
                produces: true,
                quality,
            },
            params,
            negotiated,
        ))
    }
}

/// Accept negotiation. Returns `None` when the produces set and the accept
/// list are both non-empty yet disjoint. An exact (non-wildcard) accept
/// entry keeps its full quality; a wildcard match is docked one point so a
/// wildcard can never produce the `HIGHEST` score.
fn negotiate(accept: &[(Mime, u16)], produces: &[Mime]) -> Option<(u16, Option<Mime>)> {
    if produces.is_empty() {
        return Some((QUALITY_MAX, None));
    }
    if accept.is_empty() {
        return Some((QUALITY_MAX, Some(produces[0].clone())));
    }
    for (entry, q) in accept {
        for produce in produces {
            if accept_matches(entry, produce) {
                let exact = entry.type_() != mime::STAR && entry.subtype() != mime::STAR;
                let quality = if exact { *q } else { q.saturating_sub(1) };
                return Some((quality, Some(produce.clone())));
            }
        }
    }
    None
}

fn accept_matches(entry: &Mime, produce: &Mime) -> bool {
    if entry.type_() == mime::STAR {
        return true;
    }
    if entry.type_() != produce.type_() {
        return false;
    }
    entry.subtype() == mime::STAR || entry.subtype() == produce.subtype()
}

/// Complexity is a pure function of the declared dimensions. The path kind
/// dominates (an exact path is more specific than a template, which beats
/// globs and regexes, which beat prefixes); each additional constrained
/// dimension adds one.
fn compute_complexity(
    pattern: &PathPattern,
    consumes: &[Mime],
    produces: &[Mime],
    params_predicates: &[RoutePredicate],
    headers_predicates: &[RoutePredicate],
    fallback: bool,
) -> u32 {
    if fallback {
        return 0;
    }
    let path_weight: u32 = match pattern {
        PathPattern::Exact(_) => 5,
        PathPattern::Parameterized { .. } => 4,
        PathPattern::Glob { .. } => 3,
        PathPattern::Regex { .. } => 3,
        PathPattern::Prefix(_) => 2,
    };
    let mut c = path_weight << 3;
    c += u32::from(!consumes.is_empty());
    c += u32::from(!produces.is_empty());
    c += u32::from(!params_predicates.is_empty());
    c += u32::from(!headers_predicates.is_empty());
    c
}

#[derive(Debug, Default)]
pub struct RouteBuilder {
    pattern: Option<PathPattern>,
    methods: MethodSet,
    consumes: Vec<Mime>,
    produces: Vec<Mime>,
    params_predicates: Vec<RoutePredicate>,
    headers_predicates: Vec<RoutePredicate>,
    fallback: bool,
}

impl RouteBuilder {
    pub fn path(mut self, pattern: &str) -> Result<Self, PatternError> {
        self.pattern = Some(PathPattern::parse(pattern)?);
        Ok(self)
    }

    pub fn methods<I: IntoIterator<Item = Method>>(mut self, methods: I) -> Self {
        for m in methods {
            self.methods.insert(&m);
        }
        self
    }

    pub fn consumes<I: IntoIterator<Item = Mime>>(mut self, consumes: I) -> Self {
        self.consumes.extend(consumes);
        self
    }

    pub fn produces<I: IntoIterator<Item = Mime>>(mut self, produces: I) -> Self {
        self.produces.extend(produces);
        self
    }

    pub fn param_predicate(mut self, predicate: RoutePredicate) -> Self {
        self.params_predicates.push(predicate);
        self
    }

    pub fn header_predicate(mut self, predicate: RoutePredicate) -> Self {
        self.headers_predicates.push(predicate);
        self
    }

    /// Mark as a synthesized fallback entry; fallback routes always lose to
    /// explicit matches.
    pub fn fallback(mut self) -> Self {
        self.fallback = true;
        self
    }

    pub fn build(self) -> Result<Route, PatternError> {
        let pattern = self
            .pattern
            .ok_or_else(|| PatternError::MissingLeadingSlash(String::new()))?;
        let complexity = compute_complexity(
            &pattern,
            &self.consumes,
            &self.produces,
            &self.params_predicates,
            &self.headers_predicates,
            self.fallback,
        );
        Ok(Route {
            pattern,
            methods: self.methods,
            consumes: self.consumes,
            produces: self.produces,
            params_predicates: self.params_predicates,
            headers_predicates: self.headers_predicates,
            complexity,
            fallback: self.fallback,
        })
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderMap;

    use super::*;

    fn ctx<'r>(
        method: &'r Method,
        path: &'r str,
        headers: &'r HeaderMap,
    ) -> RoutingContext<'r> {
        RoutingContext::new(method, path, path, None, headers)
    }

    #[test]
    fn exact_beats_template_by_complexity() {
        let literal = Route::of(Method::GET, "/users/new").unwrap();
        let template = Route::of(Method::GET, "/users/{id}").unwrap();
        assert!(literal.complexity() > template.complexity());
    }

    #[test]
    fn complexity_is_pure() {
        let a = Route::builder()
            .methods([Method::POST])
            .path("/items")
            .unwrap()
            .consumes([mime::APPLICATION_JSON])
            .build()
            .unwrap();
        let b = Route::builder()
            .methods([Method::POST])
            .path("/items")
            .unwrap()
            .consumes([mime::APPLICATION_JSON])
            .build()
            .unwrap();
        assert_eq!(a.complexity(), b.complexity());
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn method_mismatch_is_deferred_not_absent() {
        let route = Route::of(Method::POST, "/items").unwrap();
        let method = Method::GET;
        let headers = HeaderMap::new();
        let result = route.apply(&ctx(&method, "/items", &headers)).unwrap();
        assert_eq!(result.status, RoutingStatus::MethodNotAllowed);
        assert_eq!(result.score, RoutingScore::LOWEST);
    }

    #[test]
    fn head_served_by_get_route() {
        let route = Route::of(Method::GET, "/items").unwrap();
        let method = Method::HEAD;
        let headers = HeaderMap::new();
        let result = route.apply(&ctx(&method, "/items", &headers)).unwrap();
        assert!(result.is_matched());
    }

    #[test]
    fn consumes_mismatch_is_unsupported_media_type() {
        let route = Route::builder()
            .methods([Method::POST])
            .path("/items")
            .unwrap()
            .consumes([mime::APPLICATION_JSON])
            .build()
            .unwrap();
        let method = Method::POST;

        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, "text/plain".parse().unwrap());
        let result = route.apply(&ctx(&method, "/items", &headers)).unwrap();
        assert_eq!(result.status, RoutingStatus::UnsupportedMediaType);

        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            "application/json; charset=utf-8".parse().unwrap(),
        );
        let result = route.apply(&ctx(&method, "/items", &headers)).unwrap();
        assert!(result.is_matched());
    }

    #[test]
    fn produces_negotiation() {
        let route = Route::builder()
            .methods([Method::GET])
            .path("/data")
            .unwrap()
            .produces([mime::APPLICATION_JSON, mime::TEXT_PLAIN])
            .build()
            .unwrap();
        let method = Method::GET;

        // no accept header: vacuous exact preference, first produce wins
        let headers = HeaderMap::new();
        let result = route.apply(&ctx(&method, "/data", &headers)).unwrap();
        assert_eq!(result.score, RoutingScore::HIGHEST);
        assert_eq!(result.negotiated.as_ref().unwrap().essence_str(), "application/json");

        // exact preference
        let mut headers = HeaderMap::new();
        headers.insert(http::header::ACCEPT, "text/plain".parse().unwrap());
        let result = route.apply(&ctx(&method, "/data", &headers)).unwrap();
        assert_eq!(result.score, RoutingScore::HIGHEST);
        assert_eq!(result.negotiated.as_ref().unwrap().essence_str(), "text/plain");

        // wildcard match never reaches HIGHEST
        let mut headers = HeaderMap::new();
        headers.insert(http::header::ACCEPT, "*/*".parse().unwrap());
        let result = route.apply(&ctx(&method, "/data", &headers)).unwrap();
        assert!(result.is_matched());
        assert!(result.score < RoutingScore::HIGHEST);

        // disjoint accept
        let mut headers = HeaderMap::new();
        headers.insert(http::header::ACCEPT, "image/png".parse().unwrap());
        let result = route.apply(&ctx(&method, "/data", &headers)).unwrap();
        assert_eq!(result.status, RoutingStatus::NotAcceptable);
    }

    #[test]
    fn predicate_failure_is_non_match() {
        let route = Route::builder()
            .methods([Method::GET])
            .path("/v")
            .unwrap()
            .param_predicate(RoutePredicate::parse("version=2").unwrap())
            .build()
            .unwrap();
        assert!(!route.is_cacheable());

        let method = Method::GET;
        let headers = HeaderMap::new();
        let ctx_no = RoutingContext::new(&method, "/v", "/v", Some("version=1"), &headers);
        assert!(route.apply(&ctx_no).is_none());
        let ctx_yes = RoutingContext::new(&method, "/v", "/v", Some("version=2"), &headers);
        assert!(route.apply(&ctx_yes).unwrap().is_matched());
    }
}
