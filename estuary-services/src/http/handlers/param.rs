//! Parameter binding and scalar coercion.
//!
//! Declared parameters (see `ParamSpec`) are resolved from the route's path
//! bindings, the decoded query string, request headers, and — when
//! aggregation produced one — the form-encoded body. A form value overrides
//! a query value of the same name.
use estuary_core::{
    http::error::DispatchError,
    routing::{BoundParams, ParamSource, ParamSpec, PathParams, ScalarType, ScalarValue},
};
use http::HeaderMap;

pub struct ParamBinder;

impl ParamBinder {
    /// Bind and coerce every declared parameter. Missing required
    /// parameters and coercion failures surface as `BadRequest`.
    pub fn bind(
        specs: &[ParamSpec],
        path: &PathParams,
        query: &[(String, String)],
        headers: &HeaderMap,
        form: Option<&[(String, String)]>,
    ) -> Result<BoundParams, DispatchError> {
        let mut bound = BoundParams::default();
        for spec in specs {
            let raw: Option<String> = match spec.source {
                ParamSource::Path => path.get(&spec.name).map(|v| v.to_string()),
                ParamSource::Query => lookup(form, query, &spec.name),
                ParamSource::Header => headers
                    .get(spec.name.as_str())
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.to_string()),
                ParamSource::Form => form.and_then(|form| {
                    form.iter()
                        .find(|(n, _)| n == &spec.name)
                        .map(|(_, v)| v.clone())
                }),
            };
            let raw = match raw {
                Some(raw) => raw,
                None => match (&spec.default, spec.required) {
                    (Some(default), _) => default.clone(),
                    (None, true) => {
                        return Err(DispatchError::BadRequest(format!(
                            "missing parameter `{}`",
                            spec.name
                        )));
                    }
                    (None, false) => continue,
                },
            };
            let value = coerce(&raw, &spec.ty).map_err(|reason| {
                DispatchError::BadRequest(format!(
                    "parameter `{}`: {reason}: `{raw}`",
                    spec.name
                ))
            })?;
            bound.insert(spec.name.clone(), value);
        }
        Ok(bound)
    }
}

/// Query-sourced lookup with body-overrides-query semantics.
fn lookup(
    form: Option<&[(String, String)]>,
    query: &[(String, String)],
    name: &str,
) -> Option<String> {
    if let Some(form) = form {
        if let Some((_, v)) = form.iter().find(|(n, _)| n == name) {
            return Some(v.clone());
        }
    }
    query
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.clone())
}

fn coerce(raw: &str, ty: &ScalarType) -> Result<ScalarValue, &'static str> {
    match ty {
        ScalarType::I32 => raw
            .parse()
            .map(ScalarValue::I32)
            .map_err(|_| "expected a 32-bit integer"),
        ScalarType::I64 => raw
            .parse()
            .map(ScalarValue::I64)
            .map_err(|_| "expected a 64-bit integer"),
        ScalarType::U32 => raw
            .parse()
            .map(ScalarValue::U32)
            .map_err(|_| "expected an unsigned 32-bit integer"),
        ScalarType::U64 => raw
            .parse()
            .map(ScalarValue::U64)
            .map_err(|_| "expected an unsigned 64-bit integer"),
        ScalarType::F32 => raw
            .parse()
            .map(ScalarValue::F32)
            .map_err(|_| "expected a 32-bit float"),
        ScalarType::F64 => raw
            .parse()
            .map(ScalarValue::F64)
            .map_err(|_| "expected a 64-bit float"),
        ScalarType::Bool => match raw {
            "1" => Ok(ScalarValue::Bool(true)),
            "0" => Ok(ScalarValue::Bool(false)),
            _ if raw.eq_ignore_ascii_case("true") => Ok(ScalarValue::Bool(true)),
            _ if raw.eq_ignore_ascii_case("false") => Ok(ScalarValue::Bool(false)),
            _ => Err("expected a boolean"),
        },
        ScalarType::String => Ok(ScalarValue::String(raw.to_string())),
        ScalarType::Enum(allowed) => {
            if allowed.iter().any(|a| a == raw) {
                Ok(ScalarValue::String(raw.to_string()))
            } else {
                Err("value not in the allowed set")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn pairs(input: &[(&str, &str)]) -> Vec<(String, String)> {
        input
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn binds_from_all_sources() {
        let mut path = PathParams::default();
        path.insert("id".to_string(), "42".to_string());
        let query = pairs(&[("page", "3")]);
        let mut headers = HeaderMap::new();
        headers.insert("x-tenant", "acme".parse().unwrap());
        let form = pairs(&[("name", "alice")]);

        let specs = vec![
            ParamSpec::path("id", ScalarType::I64),
            ParamSpec::query("page", ScalarType::U32),
            ParamSpec::header("x-tenant", ScalarType::String),
            ParamSpec::form("name", ScalarType::String),
        ];
        let bound =
            ParamBinder::bind(&specs, &path, &query, &headers, Some(&form)).unwrap();
        assert_eq!(bound.get("id").unwrap().as_i64(), Some(42));
        assert_eq!(bound.get("page").unwrap().as_i64(), Some(3));
        assert_eq!(bound.get("x-tenant").unwrap().as_str(), Some("acme"));
        assert_eq!(bound.get("name").unwrap().as_str(), Some("alice"));
    }

    #[test]
    fn body_overrides_query() {
        let specs = vec![ParamSpec::query("mode", ScalarType::String)];
        let query = pairs(&[("mode", "from-query")]);
        let form = pairs(&[("mode", "from-body")]);
        let bound = ParamBinder::bind(
            &specs,
            &PathParams::default(),
            &query,
            &HeaderMap::new(),
            Some(&form),
        )
        .unwrap();
        assert_eq!(bound.get("mode").unwrap().as_str(), Some("from-body"));
    }

    #[test]
    fn missing_required_is_bad_request() {
        let specs = vec![ParamSpec::query("needed", ScalarType::String).required()];
        let err = ParamBinder::bind(
            &specs,
            &PathParams::default(),
            &[],
            &HeaderMap::new(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, DispatchError::BadRequest(_)));
    }

    #[test]
    fn optional_missing_is_absent_default_fills() {
        let specs = vec![
            ParamSpec::query("absent", ScalarType::I32),
            ParamSpec::query("limit", ScalarType::I32).default_value("10"),
        ];
        let bound = ParamBinder::bind(
            &specs,
            &PathParams::default(),
            &[],
            &HeaderMap::new(),
            None,
        )
        .unwrap();
        assert!(!bound.contains("absent"));
        assert_eq!(bound.get("limit").unwrap().as_i64(), Some(10));
    }

    #[test]
    fn coercion_failure_is_bad_request() {
        let specs = vec![ParamSpec::query("n", ScalarType::I32)];
        let query = pairs(&[("n", "not-a-number")]);
        let err = ParamBinder::bind(
            &specs,
            &PathParams::default(),
            &query,
            &HeaderMap::new(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, DispatchError::BadRequest(_)));
    }

    #[test]
    fn enum_values_validated() {
        let allowed: Arc<[String]> = vec!["asc".to_string(), "desc".to_string()].into();
        let specs = vec![ParamSpec::query("sort", ScalarType::Enum(allowed))];
        let ok = pairs(&[("sort", "desc")]);
        let bound = ParamBinder::bind(
            &specs,
            &PathParams::default(),
            &ok,
            &HeaderMap::new(),
            None,
        )
        .unwrap();
        assert_eq!(bound.get("sort").unwrap().as_str(), Some("desc"));

        let bad = pairs(&[("sort", "sideways")]);
        assert!(ParamBinder::bind(
            &specs,
            &PathParams::default(),
            &bad,
            &HeaderMap::new(),
            None,
        )
        .is_err());
    }

    #[test]
    fn bool_coercion_forms() {
        let specs = vec![ParamSpec::query("flag", ScalarType::Bool)];
        for (raw, want) in [("true", true), ("FALSE", false), ("1", true), ("0", false)] {
            let query = pairs(&[("flag", raw)]);
            let bound = ParamBinder::bind(
                &specs,
                &PathParams::default(),
                &query,
                &HeaderMap::new(),
                None,
            )
            .unwrap();
            assert_eq!(bound.get("flag").unwrap().as_bool(), Some(want), "{raw}");
        }
    }
}
