//! Per-request routing inputs and outputs.
//!
//! A [`RoutingContext`] is constructed once per request from the decoded
//! header record and borrowed by every candidate route during matching. The
//! winning route's [`RoutingResult`] carries the path-parameter bindings,
//! the score used for tie-breaking, and the negotiated produces type.
use http::{header, HeaderMap, Method};
use mime::Mime;
use percent_encoding::percent_decode_str;

/// Path-parameter bindings produced by a route match.
///
/// Kept as an ordered pair list: routes bind a handful of parameters at
/// most, and insertion order is meaningful for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams(Vec<(String, String)>);

impl PathParams {
    pub fn insert(&mut self, name: String, value: String) {
        self.0.push((name, value));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Produces-negotiation quality, in thousandths.
pub const QUALITY_MAX: u16 = 1000;

/// Match score compared lexicographically across dimensions.
///
/// Each flag is true when the dimension is satisfied (vacuously true for an
/// unconstrained dimension). `quality` encodes the produces negotiation: an
/// exact (or vacuous) preference scores [`QUALITY_MAX`]; a wildcard accept
/// entry is docked one point so it can never reach [`RoutingScore::HIGHEST`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RoutingScore {
    pub method: bool,
    pub consumes: bool,
    pub produces: bool,
    pub quality: u16,
}

impl RoutingScore {
    pub const HIGHEST: RoutingScore = RoutingScore {
        method: true,
        consumes: true,
        produces: true,
        quality: QUALITY_MAX,
    };

    pub const LOWEST: RoutingScore = RoutingScore {
        method: false,
        consumes: false,
        produces: false,
        quality: 0,
    };
}

/// Outcome of applying one route to one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStatus {
    Matched,
    /// Path matched but the method did not; kept as the lowest-scoring
    /// candidate so dispatch can answer 405 instead of 404.
    MethodNotAllowed,
    /// Path and method matched but the request content-type is not consumed.
    UnsupportedMediaType,
    /// Path, method, and content-type matched but no accept entry overlaps
    /// the produces set.
    NotAcceptable,
}

#[derive(Debug, Clone)]
pub struct RoutingResult {
    pub status: RoutingStatus,
    pub score: RoutingScore,
    pub params: PathParams,
    /// The produces type selected by accept negotiation, when any.
    pub negotiated: Option<Mime>,
}

impl Default for RoutingResult {
    /// A vacuous match with no bindings; what fallback dispatch carries.
    fn default() -> Self {
        Self::matched(RoutingScore::LOWEST, PathParams::default(), None)
    }
}

impl RoutingResult {
    pub fn matched(score: RoutingScore, params: PathParams, negotiated: Option<Mime>) -> Self {
        Self {
            status: RoutingStatus::Matched,
            score,
            params,
            negotiated,
        }
    }

    pub fn deferred(status: RoutingStatus, score: RoutingScore, params: PathParams) -> Self {
        Self {
            status,
            score,
            params,
            negotiated: None,
        }
    }

    pub fn is_matched(&self) -> bool {
        self.status == RoutingStatus::Matched
    }
}

/// Immutable routing view over one request.
pub struct RoutingContext<'r> {
    method: &'r Method,
    /// Percent-decoded path used for matching.
    path: &'r str,
    /// Original request path, preserved for handlers and redirects.
    original_path: &'r str,
    query: Option<&'r str>,
    headers: &'r HeaderMap,
    content_type: Option<Mime>,
    /// Parsed accept entries, highest q first. Empty when no accept header.
    accept: Vec<(Mime, u16)>,
    /// Whether param/header predicate dimensions participate in matching;
    /// the cache layer re-applies routes with both enabled.
    pub match_params_predicates: bool,
    pub match_headers_predicates: bool,
}

impl<'r> RoutingContext<'r> {
    pub fn new(
        method: &'r Method,
        decoded_path: &'r str,
        original_path: &'r str,
        query: Option<&'r str>,
        headers: &'r HeaderMap,
    ) -> Self {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<Mime>().ok());
        let accept = parse_accept(headers);
        Self {
            method,
            path: decoded_path,
            original_path,
            query,
            headers,
            content_type,
            accept,
            match_params_predicates: true,
            match_headers_predicates: true,
        }
    }

    pub fn method(&self) -> &Method {
        self.method
    }

    pub fn path(&self) -> &str {
        self.path
    }

    pub fn original_path(&self) -> &str {
        self.original_path
    }

    pub fn query(&self) -> Option<&str> {
        self.query
    }

    pub fn headers(&self) -> &HeaderMap {
        self.headers
    }

    pub fn content_type(&self) -> Option<&Mime> {
        self.content_type.as_ref()
    }

    pub fn accept(&self) -> &[(Mime, u16)] {
        &self.accept
    }

    /// Decoded query parameters, in document order.
    pub fn query_params(&self) -> Vec<(String, String)> {
        self.query.map(parse_query).unwrap_or_default()
    }

    /// Canonical cache key over the dimensions that determine routing.
    ///
    /// The query string participates only when `include_query` is set, i.e.
    /// when the route table contains predicate-bearing routes.
    pub fn fingerprint(&self, include_query: bool) -> RouteFingerprint {
        RouteFingerprint {
            method: self.method.clone(),
            path: self.path.to_string(),
            content_type: self.content_type.as_ref().map(|m| m.essence_str().to_string()),
            accept: self
                .accept
                .iter()
                .map(|(m, q)| format!("{m};q={q}"))
                .collect::<Vec<_>>()
                .join(","),
            query: if include_query {
                self.query.map(|q| q.to_string())
            } else {
                None
            },
        }
    }
}

/// Owned, hashable form of the routing-relevant request dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteFingerprint {
    method: Method,
    path: String,
    content_type: Option<String>,
    accept: String,
    query: Option<String>,
}

fn parse_accept(headers: &HeaderMap) -> Vec<(Mime, u16)> {
    let mut out = Vec::new();
    for value in headers.get_all(header::ACCEPT) {
        let Ok(value) = value.to_str() else { continue };
        for entry in value.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let Ok(mime) = entry.parse::<Mime>() else {
                continue;
            };
            let quality = mime
                .get_param("q")
                .and_then(|q| q.as_str().parse::<f32>().ok())
                .map(|q| (q.clamp(0.0, 1.0) * QUALITY_MAX as f32) as u16)
                .unwrap_or(QUALITY_MAX);
            out.push((mime, quality));
        }
    }
    // stable: equal-q entries keep document order
    out.sort_by(|a, b| b.1.cmp(&a.1));
    out
}

/// Decode an `application/x-www-form-urlencoded` style string (also the
/// query-string syntax): `+` is space, `%xx` percent-decodes, keys without
/// `=` get an empty value.
pub fn parse_query(input: &str) -> Vec<(String, String)> {
    input
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = match pair.split_once('=') {
                Some((k, v)) => (k, v),
                None => (pair, ""),
            };
            (decode_component(k), decode_component(v))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let plus_decoded = raw.replace('+', " ");
    percent_decode_str(&plus_decoded)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or(plus_decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_orders_lexicographically() {
        let matched = RoutingScore {
            method: true,
            consumes: true,
            produces: true,
            quality: 500,
        };
        let not_acceptable = RoutingScore {
            method: true,
            consumes: true,
            produces: false,
            quality: 0,
        };
        let method_miss = RoutingScore::LOWEST;
        assert!(RoutingScore::HIGHEST > matched);
        assert!(matched > not_acceptable);
        assert!(not_acceptable > method_miss);
    }

    #[test]
    fn accept_entries_sorted_by_quality() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            "text/html;q=0.5, application/json, */*;q=0.1".parse().unwrap(),
        );
        let accept = parse_accept(&headers);
        assert_eq!(accept.len(), 3);
        assert_eq!(accept[0].0.essence_str(), "application/json");
        assert_eq!(accept[0].1, QUALITY_MAX);
        assert_eq!(accept[1].0.essence_str(), "text/html");
        assert_eq!(accept[2].0.essence_str(), "*/*");
    }

    #[test]
    fn query_decoding() {
        let params = parse_query("name=J%C3%BCrgen&tag=a+b&flag");
        assert_eq!(
            params,
            vec![
                ("name".to_string(), "Jürgen".to_string()),
                ("tag".to_string(), "a b".to_string()),
                ("flag".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn fingerprint_ignores_query_unless_asked() {
        let method = Method::GET;
        let headers = HeaderMap::new();
        let a = RoutingContext::new(&method, "/x", "/x", Some("a=1"), &headers);
        let b = RoutingContext::new(&method, "/x", "/x", Some("a=2"), &headers);
        assert_eq!(a.fingerprint(false), b.fingerprint(false));
        assert_ne!(a.fingerprint(true), b.fingerprint(true));
    }
}
