//! The routing subsystem.
//!
//! Given the method, path, content-type, and accept set of a request, select
//! at most one registered service and compute the path-parameter bindings.
//!
//! # Structure
//!
//! - [`Route`]: one immutable matching rule (path pattern, method set,
//!   consumes/produces, predicates) with a precomputed complexity.
//! - [`RoutingTrie`]: prefix tree over trie-eligible path patterns,
//!   returning a candidate leaf set per path.
//! - [`Router`]: composite of trie and sequential sub-routers built from
//!   registration runs; `find` selects the best-scoring candidate, `find_all`
//!   returns every match in registration order.
//! - [`CachedRouter`]: the window-TinyLFU route cache, bypassed for
//!   ambiguous (predicate-bearing) routes.
//! - [`ServiceEndpoint`] / [`DecoratorBinding`]: what routes resolve to.
//! - [`VirtualHost`]: one host's tables plus its catch-all fallback.
//!
//! # Matching
//!
//! A route matches iff the method, path, consumes, produces, and predicate
//! dimensions all hold. Failing the method, consumes, or produces dimension
//! after a path match yields a low-scoring *deferred* candidate so dispatch
//! can answer 405/415/406 instead of 404; failing a predicate is a plain
//! non-match. Candidates compare by the `(method, consumes, produces,
//! quality)` score tuple, most-complex-first, earlier registration winning
//! ties.
pub mod cache;
pub mod context;
pub mod endpoint;
pub mod pattern;
pub mod predicate;
pub mod route;
pub mod router;
pub mod trie;
pub mod vhost;

pub use cache::{CacheSpecError, CachedRouter, RouteCacheSpec};
pub use context::{
    parse_query, PathParams, RouteFingerprint, RoutingContext, RoutingResult, RoutingScore,
    RoutingStatus,
};
pub use endpoint::{
    AggregationStrategy, BoundParams, DecoratorBinding, EndpointOptions, ParamSource, ParamSpec,
    ScalarType, ScalarValue, ServiceEndpoint,
};
pub use pattern::{PathPattern, PatternError};
pub use predicate::{PredicateOp, RoutePredicate};
pub use route::{MethodSet, Route, RouteBuilder, RouteKey};
pub use router::{Routed, Router, RouterBuilder};
pub use trie::RoutingTrie;
pub use vhost::{VirtualHost, VirtualHostBuilder, VirtualHosts};
