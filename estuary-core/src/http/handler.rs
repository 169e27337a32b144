//! Handler, decorator, and dispatch-chain contracts.
//!
//! Services and decorators are stored type-erased in the server's immutable
//! configuration graph (`Arc<dyn ...>`); their returned futures stay on the
//! reactor thread, so they are local-boxed rather than `Send`. The current
//! request is always threaded explicitly through the chain as a
//! [`RequestContext`] parameter rather than kept in task-local state.
use std::{
    any::Any,
    cell::RefCell,
    collections::{HashMap, VecDeque},
    future::Future,
    rc::Rc,
    sync::Arc,
};

use bytes::Bytes;
use futures_util::future::LocalBoxFuture;
use mime::Mime;

use super::{
    body::RequestBody,
    error::DispatchError,
    HttpRequest, HttpResponse,
};
use crate::routing::{BoundParams, PathParams};

pub type HandlerFuture = LocalBoxFuture<'static, Result<HttpResponse, DispatchError>>;

/// A user-supplied request handler bound to one route.
pub trait ServiceHandler {
    fn invoke(&self, request: HttpRequest, ctx: RequestContext) -> HandlerFuture;
}

/// A cross-cutting filter selected per request by its own route.
///
/// A decorator forwards by calling [`DispatchChain::proceed`], short-circuits
/// by returning a response without doing so, and may transform either the
/// request on the way in or the response on the way out.
pub trait Decorator {
    fn decorate(
        &self,
        request: HttpRequest,
        ctx: RequestContext,
        chain: DispatchChain,
    ) -> HandlerFuture;

    /// Inspect an error flowing back through the chain; returning a response
    /// replaces the error.
    fn handle_error(&self, _ctx: &RequestContext, _err: &DispatchError) -> Option<HttpResponse> {
        None
    }
}

/// The per-request ordered queue of decorators terminated by the selected
/// service, drained front-to-back.
pub struct DispatchChain {
    decorators: VecDeque<Arc<dyn Decorator + Send + Sync>>,
    service: Arc<dyn ServiceHandler + Send + Sync>,
}

impl DispatchChain {
    pub fn new(
        decorators: Vec<Arc<dyn Decorator + Send + Sync>>,
        service: Arc<dyn ServiceHandler + Send + Sync>,
    ) -> Self {
        Self {
            decorators: decorators.into(),
            service,
        }
    }

    /// Dequeue and invoke the next entry.
    pub fn proceed(mut self, request: HttpRequest, ctx: RequestContext) -> HandlerFuture {
        match self.decorators.pop_front() {
            Some(decorator) => decorator.decorate(request, ctx, self),
            None => self.service.invoke(request, ctx),
        }
    }

    pub fn remaining(&self) -> usize {
        self.decorators.len()
    }
}

/// Build a [`ServiceHandler`] from an async closure.
pub fn service_fn<F, Fut>(f: F) -> ServiceFn<F>
where
    F: Fn(HttpRequest, RequestContext) -> Fut,
    Fut: Future<Output = Result<HttpResponse, DispatchError>> + 'static,
{
    ServiceFn(f)
}

pub struct ServiceFn<F>(F);

impl<F, Fut> ServiceHandler for ServiceFn<F>
where
    F: Fn(HttpRequest, RequestContext) -> Fut,
    Fut: Future<Output = Result<HttpResponse, DispatchError>> + 'static,
{
    fn invoke(&self, request: HttpRequest, ctx: RequestContext) -> HandlerFuture {
        Box::pin((self.0)(request, ctx))
    }
}

/// Build a [`Decorator`] from an async closure.
pub fn decorator_fn<F, Fut>(f: F) -> DecoratorFn<F>
where
    F: Fn(HttpRequest, RequestContext, DispatchChain) -> Fut,
    Fut: Future<Output = Result<HttpResponse, DispatchError>> + 'static,
{
    DecoratorFn(f)
}

pub struct DecoratorFn<F>(F);

impl<F, Fut> Decorator for DecoratorFn<F>
where
    F: Fn(HttpRequest, RequestContext, DispatchChain) -> Fut,
    Fut: Future<Output = Result<HttpResponse, DispatchError>> + 'static,
{
    fn decorate(
        &self,
        request: HttpRequest,
        ctx: RequestContext,
        chain: DispatchChain,
    ) -> HandlerFuture {
        Box::pin((self.0)(request, ctx, chain))
    }
}

/// Send-able snapshot of a request handed to a blocking handler.
pub struct AggregatedRequest {
    pub parts: http::request::Parts,
    pub body: Bytes,
    pub params: PathParams,
    pub bound: BoundParams,
}

/// Build a handler that runs on the runtime's blocking thread pool.
///
/// The body is aggregated first (blocking handlers cannot pull a local body
/// stream from another thread), then the closure runs off-reactor.
pub fn blocking_service_fn<F>(f: F) -> BlockingServiceFn<F>
where
    F: Fn(AggregatedRequest) -> Result<HttpResponse, DispatchError> + Clone + Send + 'static,
{
    BlockingServiceFn(f)
}

pub struct BlockingServiceFn<F>(F);

impl<F> ServiceHandler for BlockingServiceFn<F>
where
    F: Fn(AggregatedRequest) -> Result<HttpResponse, DispatchError> + Clone + Send + 'static,
{
    fn invoke(&self, request: HttpRequest, ctx: RequestContext) -> HandlerFuture {
        let f = self.0.clone();
        Box::pin(async move {
            let (parts, mut body) = request.into_parts();
            let data = body.aggregate(ctx.max_request_length()).await?;
            let aggregated = AggregatedRequest {
                parts,
                body: data,
                params: ctx.params().clone(),
                bound: ctx.bound_params(),
            };
            monoio::spawn_blocking(move || f(aggregated))
                .await
                .map_err(|err| DispatchError::Internal(crate::AnyError::msg(format!("{err:?}"))))?
        })
    }
}

/// Per-request context threaded through the dispatch chain.
///
/// Cheap to clone; decorators and the service observe the same attribute
/// bag and completion hooks.
#[derive(Clone)]
pub struct RequestContext {
    inner: Rc<ContextInner>,
}

struct ContextInner {
    request_id: u64,
    params: PathParams,
    query: Option<String>,
    negotiated_produces: Option<Mime>,
    max_request_length: u64,
    verbose_responses: bool,
    /// Set when the request resolved to a synthesized trailing-slash entry.
    fallback_match: bool,
    attrs: RefCell<HashMap<&'static str, Rc<dyn Any>>>,
    completion_hooks: RefCell<Vec<Box<dyn FnOnce()>>>,
    bound: RefCell<BoundParams>,
}

impl RequestContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request_id: u64,
        params: PathParams,
        query: Option<String>,
        negotiated_produces: Option<Mime>,
        max_request_length: u64,
        verbose_responses: bool,
        fallback_match: bool,
    ) -> Self {
        Self {
            inner: Rc::new(ContextInner {
                request_id,
                params,
                query,
                negotiated_produces,
                max_request_length,
                verbose_responses,
                fallback_match,
                attrs: RefCell::new(HashMap::new()),
                completion_hooks: RefCell::new(Vec::new()),
                bound: RefCell::new(BoundParams::default()),
            }),
        }
    }

    /// Bare context for requests that failed before routing.
    pub fn unrouted(request_id: u64) -> Self {
        Self::new(request_id, PathParams::default(), None, None, 0, false, false)
    }

    pub fn request_id(&self) -> u64 {
        self.inner.request_id
    }

    pub fn params(&self) -> &PathParams {
        &self.inner.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.inner.params.get(name)
    }

    pub fn query(&self) -> Option<&str> {
        self.inner.query.as_deref()
    }

    pub fn negotiated_produces(&self) -> Option<&Mime> {
        self.inner.negotiated_produces.as_ref()
    }

    pub fn max_request_length(&self) -> u64 {
        self.inner.max_request_length
    }

    pub fn verbose_responses(&self) -> bool {
        self.inner.verbose_responses
    }

    pub fn is_fallback_match(&self) -> bool {
        self.inner.fallback_match
    }

    /// Attribute bag for cross-decorator passing.
    pub fn set_attr(&self, key: &'static str, value: Rc<dyn Any>) {
        self.inner.attrs.borrow_mut().insert(key, value);
    }

    pub fn attr(&self, key: &str) -> Option<Rc<dyn Any>> {
        self.inner.attrs.borrow().get(key).cloned()
    }

    /// Register a hook invoked once when the response completes.
    pub fn on_complete(&self, hook: impl FnOnce() + 'static) {
        self.inner.completion_hooks.borrow_mut().push(Box::new(hook));
    }

    /// Fire completion hooks; the protocol service calls this after the
    /// response is written. Idempotent (hooks drain).
    pub fn run_completion_hooks(&self) {
        let hooks: Vec<_> = self.inner.completion_hooks.borrow_mut().drain(..).collect();
        for hook in hooks {
            hook();
        }
    }

    /// Coerced parameters, populated by the binder before the handler runs.
    pub fn set_bound_params(&self, bound: BoundParams) {
        *self.inner.bound.borrow_mut() = bound;
    }

    pub fn bound_params(&self) -> BoundParams {
        self.inner.bound.borrow().clone()
    }

    pub fn scalar(&self, name: &str) -> Option<crate::routing::ScalarValue> {
        self.inner.bound.borrow().get(name).cloned()
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.inner.request_id)
            .field("params", &self.inner.params)
            .finish_non_exhaustive()
    }
}

/// Construct an empty-request shell around a body, for tests and adapters.
pub fn request_from_body(body: RequestBody) -> HttpRequest {
    http::Request::new(body)
}
