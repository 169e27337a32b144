//! Query-parameter and header predicates.
//!
//! A predicate constrains one named value with an operator. Routes carrying
//! predicates are "ambiguous" for caching purposes: two requests with the
//! same routing fingerprint may still route differently.
use http::HeaderMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateOp {
    Exists,
    NotExists,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("invalid predicate: {0}")]
pub struct PredicateParseError(String);

/// One `name <op> value` constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePredicate {
    name: String,
    op: PredicateOp,
    value: Option<String>,
}

impl RoutePredicate {
    pub fn new(name: impl Into<String>, op: PredicateOp, value: Option<String>) -> Self {
        Self {
            name: name.into(),
            op,
            value,
        }
    }

    /// Parse the compact form: `name` (exists), `!name` (absent),
    /// `name=value`, `name!=value`, `name>value`, `name>=value`,
    /// `name<value`, `name<=value`.
    pub fn parse(spec: &str) -> Result<Self, PredicateParseError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(PredicateParseError(spec.to_string()));
        }
        if let Some(name) = spec.strip_prefix('!') {
            if name.is_empty() || name.contains(|c| "=<>!".contains(c)) {
                return Err(PredicateParseError(spec.to_string()));
            }
            return Ok(Self::new(name, PredicateOp::NotExists, None));
        }
        for (token, op) in [
            ("!=", PredicateOp::Ne),
            (">=", PredicateOp::Ge),
            ("<=", PredicateOp::Le),
            (">", PredicateOp::Gt),
            ("<", PredicateOp::Lt),
            ("=", PredicateOp::Eq),
        ] {
            if let Some((name, value)) = spec.split_once(token) {
                if name.is_empty() {
                    return Err(PredicateParseError(spec.to_string()));
                }
                return Ok(Self::new(name, op, Some(value.to_string())));
            }
        }
        Ok(Self::new(spec, PredicateOp::Exists, None))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluate against decoded query parameters (multimap semantics: any
    /// occurrence satisfying the comparison wins).
    pub fn matches_params(&self, params: &[(String, String)]) -> bool {
        let mut found = params.iter().filter(|(n, _)| n == &self.name).peekable();
        match self.op {
            PredicateOp::Exists => found.peek().is_some(),
            PredicateOp::NotExists => found.peek().is_none(),
            _ => found.any(|(_, v)| self.compare(v)),
        }
    }

    /// Evaluate against request headers.
    pub fn matches_headers(&self, headers: &HeaderMap) -> bool {
        let mut found = headers
            .get_all(self.name.as_str())
            .iter()
            .filter_map(|v| v.to_str().ok())
            .peekable();
        match self.op {
            PredicateOp::Exists => found.peek().is_some(),
            PredicateOp::NotExists => found.peek().is_none(),
            _ => found.any(|v| self.compare(v)),
        }
    }

    fn compare(&self, actual: &str) -> bool {
        let Some(expected) = self.value.as_deref() else {
            return false;
        };
        let ordering = match (actual.parse::<f64>(), expected.parse::<f64>()) {
            (Ok(a), Ok(e)) => a.partial_cmp(&e),
            _ => Some(actual.cmp(expected)),
        };
        let Some(ordering) = ordering else {
            return false;
        };
        match self.op {
            PredicateOp::Eq => ordering.is_eq(),
            PredicateOp::Ne => ordering.is_ne(),
            PredicateOp::Gt => ordering.is_gt(),
            PredicateOp::Ge => ordering.is_ge(),
            PredicateOp::Lt => ordering.is_lt(),
            PredicateOp::Le => ordering.is_le(),
            PredicateOp::Exists | PredicateOp::NotExists => unreachable!(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parse_forms() {
        assert_eq!(
            RoutePredicate::parse("version").unwrap(),
            RoutePredicate::new("version", PredicateOp::Exists, None)
        );
        assert_eq!(
            RoutePredicate::parse("!beta").unwrap(),
            RoutePredicate::new("beta", PredicateOp::NotExists, None)
        );
        assert_eq!(
            RoutePredicate::parse("v!=2").unwrap(),
            RoutePredicate::new("v", PredicateOp::Ne, Some("2".to_string()))
        );
        assert_eq!(
            RoutePredicate::parse("v>=2").unwrap(),
            RoutePredicate::new("v", PredicateOp::Ge, Some("2".to_string()))
        );
        assert!(RoutePredicate::parse("=x").is_err());
    }

    #[test]
    fn numeric_comparison_preferred() {
        let p = RoutePredicate::parse("v>9").unwrap();
        // lexicographically "10" < "9"; numerically 10 > 9
        assert!(p.matches_params(&params(&[("v", "10")])));
        assert!(!p.matches_params(&params(&[("v", "3")])));
    }

    #[test]
    fn multimap_any_occurrence_wins() {
        let p = RoutePredicate::parse("tag=beta").unwrap();
        assert!(p.matches_params(&params(&[("tag", "alpha"), ("tag", "beta")])));
        assert!(!p.matches_params(&params(&[("tag", "alpha")])));
    }

    #[test]
    fn header_predicates() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-version", "2".parse().unwrap());
        assert!(RoutePredicate::parse("x-api-version=2")
            .unwrap()
            .matches_headers(&headers));
        assert!(RoutePredicate::parse("!x-internal").unwrap().matches_headers(&headers));
        assert!(!RoutePredicate::parse("x-internal").unwrap().matches_headers(&headers));
    }
}
