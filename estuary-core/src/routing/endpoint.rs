//! Service and decorator bindings: what a route resolves to.
//!
//! A [`ServiceEndpoint`] pairs a handler with its per-route overrides and
//! declared parameters. Parameter declarations replace the original
//! annotation-driven reflection: registration code lists each parameter's
//! source, scalar type, and default explicitly, and the binder coerces at
//! request time.
use std::{collections::HashMap, sync::Arc, time::Duration};

use crate::http::handler::{Decorator, ServiceHandler};

/// When the dispatcher buffers the request body before invoking a handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AggregationStrategy {
    #[default]
    None,
    Always,
    OnlyForFormData,
}

/// Scalar types a declared parameter may coerce to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScalarType {
    I32,
    I64,
    U32,
    U64,
    F32,
    F64,
    Bool,
    String,
    /// Closed string set; coercion fails for values outside it.
    Enum(Arc<[String]>),
}

/// A coerced parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    String(String),
}

impl ScalarValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ScalarValue::I32(v) => Some(i64::from(*v)),
            ScalarValue::I64(v) => Some(*v),
            ScalarValue::U32(v) => Some(i64::from(*v)),
            ScalarValue::U64(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::F32(v) => Some(f64::from(*v)),
            ScalarValue::F64(v) => Some(*v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScalarValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScalarValue::String(v) => Some(v),
            _ => None,
        }
    }
}

/// Where a declared parameter's raw value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSource {
    Path,
    Query,
    Header,
    Form,
}

/// One declared handler parameter.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub source: ParamSource,
    pub ty: ScalarType,
    /// Missing required parameters are a `BadRequest`; optional parameters
    /// fall back to `default` or stay absent.
    pub required: bool,
    pub default: Option<String>,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, source: ParamSource, ty: ScalarType) -> Self {
        Self {
            name: name.into(),
            source,
            ty,
            required: false,
            default: None,
        }
    }

    pub fn path(name: impl Into<String>, ty: ScalarType) -> Self {
        Self::new(name, ParamSource::Path, ty).required()
    }

    pub fn query(name: impl Into<String>, ty: ScalarType) -> Self {
        Self::new(name, ParamSource::Query, ty)
    }

    pub fn header(name: impl Into<String>, ty: ScalarType) -> Self {
        Self::new(name, ParamSource::Header, ty)
    }

    pub fn form(name: impl Into<String>, ty: ScalarType) -> Self {
        Self::new(name, ParamSource::Form, ty)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self.required = false;
        self
    }
}

/// Parameters after coercion, keyed by declared name.
#[derive(Debug, Clone, Default)]
pub struct BoundParams(HashMap<String, ScalarValue>);

impl BoundParams {
    pub fn insert(&mut self, name: String, value: ScalarValue) {
        self.0.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<&ScalarValue> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Per-route overrides of the server-wide defaults, plus declarations the
/// dispatcher consumes at build time.
#[derive(Debug, Clone, Default)]
pub struct EndpointOptions {
    pub request_timeout: Option<Duration>,
    pub max_request_length: Option<u64>,
    pub verbose_responses: Option<bool>,
    pub aggregation: AggregationStrategy,
    pub params: Vec<ParamSpec>,
}

/// A handler bound to one route, with its resolved options.
#[derive(Clone)]
pub struct ServiceEndpoint {
    handler: Arc<dyn ServiceHandler + Send + Sync>,
    options: EndpointOptions,
}

impl ServiceEndpoint {
    pub fn new(handler: Arc<dyn ServiceHandler + Send + Sync>) -> Self {
        Self {
            handler,
            options: EndpointOptions::default(),
        }
    }

    /// The aggregation strategy is finalized from the declarations: a
    /// declared form parameter upgrades `None` to `OnlyForFormData`.
    pub fn with_options(mut self, mut options: EndpointOptions) -> Self {
        if options.aggregation == AggregationStrategy::None
            && options
                .params
                .iter()
                .any(|p| p.source == ParamSource::Form)
        {
            options.aggregation = AggregationStrategy::OnlyForFormData;
        }
        self.options = options;
        self
    }

    pub fn handler(&self) -> &Arc<dyn ServiceHandler + Send + Sync> {
        &self.handler
    }

    pub fn options(&self) -> &EndpointOptions {
        &self.options
    }
}

impl std::fmt::Debug for ServiceEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceEndpoint")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// A decorator bound to its own route; `order` is the registration index
/// that fixes its position in the dispatch chain.
#[derive(Clone)]
pub struct DecoratorBinding {
    pub decorator: Arc<dyn Decorator + Send + Sync>,
    pub order: usize,
}

impl std::fmt::Debug for DecoratorBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoratorBinding")
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}
