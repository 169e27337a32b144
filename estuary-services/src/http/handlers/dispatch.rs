//! Request dispatch: virtual-host selection, routing, decorator chain
//! assembly, and terminal error rendering.
//!
//! This is the innermost element of the connection-facing handler chain.
//! Every request-scoped failure is rendered to a response here; the
//! connection loop never sees a dispatch error.
use std::{convert::Infallible, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use estuary_core::{
    config::ServerOptions,
    http::{
        error::DispatchError,
        handler::{DispatchChain, RequestContext},
        HttpHandler, HttpRequest, HttpResponse, ResponseWithContinue,
    },
    routing::{RoutingContext, RoutingStatus, VirtualHosts},
};
use futures::FutureExt;
use http::{header, HeaderValue, Method};
use percent_encoding::percent_decode_str;
use service_async::{AsyncMakeService, MakeService, Param};
use tracing::{debug, error};

use super::{aggregate::RequestAggregator, param::ParamBinder};
use crate::http::ingress::RequestIdent;

/// Server-wide dispatch defaults; per-route endpoint options override them.
#[derive(Debug, Clone)]
pub struct DispatchDefaults {
    pub request_timeout: Option<Duration>,
    pub max_request_length: u64,
    pub verbose_responses: bool,
}

impl From<&ServerOptions> for DispatchDefaults {
    fn from(options: &ServerOptions) -> Self {
        Self {
            request_timeout: options.request_timeout,
            max_request_length: options.max_request_length,
            verbose_responses: options.verbose_responses,
        }
    }
}

/// Terminal handler: routes a request into the selected virtual host's
/// dispatch chain.
pub struct DispatchHandler {
    hosts: Arc<VirtualHosts>,
    defaults: DispatchDefaults,
}

impl DispatchHandler {
    pub fn new(hosts: Arc<VirtualHosts>, defaults: DispatchDefaults) -> Self {
        Self { hosts, defaults }
    }

    /// Factory for use at the bottom of a service stack.
    pub fn factory(hosts: Arc<VirtualHosts>, defaults: DispatchDefaults) -> DispatchHandlerFactory {
        DispatchHandlerFactory { hosts, defaults }
    }

    async fn dispatch(&self, mut request: HttpRequest) -> HttpResponse {
        let ident = request
            .extensions()
            .get::<RequestIdent>()
            .copied()
            .unwrap_or(RequestIdent {
                request_id: 0,
                stream_id: 0,
            });

        let authority = match request.uri().host() {
            Some(host) => Some(host.to_string()),
            None => request
                .headers()
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string()),
        };
        let host = self.hosts.select(authority.as_deref()).clone();

        let raw_path = request.uri().path().to_string();
        let decoded_path = match percent_decode_str(&raw_path).decode_utf8() {
            Ok(path) => path.into_owned(),
            Err(_) => {
                return DispatchError::BadRequest("malformed percent-encoding in path".into())
                    .to_response(self.defaults.verbose_responses);
            }
        };
        let query = request.uri().query().map(|q| q.to_string());
        let method = request.method().clone();

        // routing happens in its own scope: the context borrows the request
        // headers, and everything selected is cloned out of the tables
        let (endpoint, result, is_fallback, decorators) = {
            let ctx = RoutingContext::new(
                &method,
                &decoded_path,
                &raw_path,
                query.as_deref(),
                request.headers(),
            );
            let routed = host.router().find(&ctx);
            let (endpoint, result, is_fallback) = match routed {
                Some(routed) if routed.result.is_matched() => (
                    routed.value.clone(),
                    routed.result,
                    routed.route.is_fallback(),
                ),
                Some(routed) => {
                    let err = match routed.result.status {
                        RoutingStatus::MethodNotAllowed => DispatchError::MethodNotAllowed,
                        RoutingStatus::UnsupportedMediaType => {
                            DispatchError::UnsupportedMediaType
                        }
                        RoutingStatus::NotAcceptable => DispatchError::NotAcceptable,
                        RoutingStatus::Matched => unreachable!("matched handled above"),
                    };
                    let allow = allow_header(&host, &ctx, &err);
                    debug!(
                        path = %decoded_path,
                        status = ?routed.result.status,
                        "dimensional route miss"
                    );
                    let mut response = err.to_response(self.defaults.verbose_responses);
                    if let Some(allow) = allow {
                        response.headers_mut().insert(header::ALLOW, allow);
                    }
                    return response;
                }
                None => (host.fallback().clone(), Default::default(), false),
            };
            let decorators: Vec<_> = host
                .decorators()
                .find_all(&ctx)
                .into_iter()
                .map(|routed| routed.value.decorator.clone())
                .collect();
            (endpoint, result, is_fallback, decorators)
        };

        let options = endpoint.options();
        let timeout = options.request_timeout.or(self.defaults.request_timeout);
        let max_request_length = options
            .max_request_length
            .unwrap_or(self.defaults.max_request_length);
        let verbose = options
            .verbose_responses
            .unwrap_or(self.defaults.verbose_responses);

        let ctx = RequestContext::new(
            ident.request_id,
            result.params,
            query.clone(),
            result.negotiated,
            max_request_length,
            verbose,
            is_fallback,
        );

        let chain = DispatchChain::new(decorators.clone(), endpoint.handler().clone());
        let strategy = options.aggregation;
        let specs = options.params.clone();
        let serve_ctx = ctx.clone();
        let serve = async move {
            let aggregated =
                RequestAggregator::aggregate(&mut request, strategy, max_request_length).await?;
            if !specs.is_empty() {
                let form = aggregated
                    .as_ref()
                    .and_then(|body| RequestAggregator::form_params(&request, body));
                let query_params = serve_ctx
                    .query()
                    .map(estuary_core::routing::parse_query)
                    .unwrap_or_default();
                let bound = ParamBinder::bind(
                    &specs,
                    serve_ctx.params(),
                    &query_params,
                    request.headers(),
                    form.as_deref(),
                )?;
                serve_ctx.set_bound_params(bound);
            }
            chain.proceed(request, serve_ctx).await
        };

        // handler panics are caught here and never unwind past dispatch
        let guarded = AssertUnwindSafe(serve).catch_unwind();
        let outcome = match timeout {
            Some(timeout) => match monoio::time::timeout(timeout, guarded).await {
                Ok(inner) => inner,
                Err(_) => Ok(Err(DispatchError::RequestTimeout)),
            },
            None => guarded.await,
        };
        let outcome = match outcome {
            Ok(result) => result,
            Err(panic) => {
                error!("handler panicked: {panic:?}");
                Err(DispatchError::Internal(anyhow::anyhow!(
                    "handler panic: {panic:?}"
                )))
            }
        };

        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                // the exception-handler chain: decorators inspect in chain
                // order, the default renderer terminates
                let intercepted = decorators
                    .iter()
                    .find_map(|d| d.handle_error(&ctx, &err));
                match intercepted {
                    Some(response) => response,
                    None => err.to_response(verbose),
                }
            }
        };
        ctx.run_completion_hooks();
        response
    }
}

fn allow_header(
    host: &estuary_core::routing::VirtualHost,
    ctx: &RoutingContext<'_>,
    err: &DispatchError,
) -> Option<HeaderValue> {
    if !matches!(err, DispatchError::MethodNotAllowed) {
        return None;
    }
    let methods = host.router().inner().allowed_methods(ctx);
    let mut names: Vec<&str> = methods.iter().map(Method::as_str).collect();
    if names.is_empty() {
        return None;
    }
    if names.contains(&Method::GET.as_str()) && !names.contains(&Method::HEAD.as_str()) {
        names.push(Method::HEAD.as_str());
    }
    HeaderValue::from_str(&names.join(", ")).ok()
}

impl<CX> HttpHandler<CX> for DispatchHandler {
    type Error = Infallible;

    async fn handle(
        &self,
        request: HttpRequest,
        _ctx: CX,
    ) -> Result<ResponseWithContinue, Self::Error> {
        let response = self.dispatch(request).await;
        Ok((response, true))
    }
}

/// Factory carrying the immutable configuration graph; each worker makes
/// its own (cheap, `Arc`-shared) handler from it.
pub struct DispatchHandlerFactory {
    hosts: Arc<VirtualHosts>,
    defaults: DispatchDefaults,
}

impl DispatchHandlerFactory {
    pub fn from_param<C>(config: &C) -> Self
    where
        C: Param<Arc<VirtualHosts>> + Param<DispatchDefaults>,
    {
        Self {
            hosts: config.param(),
            defaults: config.param(),
        }
    }
}

impl MakeService for DispatchHandlerFactory {
    type Service = DispatchHandler;
    type Error = Infallible;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(DispatchHandler {
            hosts: self.hosts.clone(),
            defaults: self.defaults.clone(),
        })
    }
}

impl AsyncMakeService for DispatchHandlerFactory {
    type Service = DispatchHandler;
    type Error = Infallible;

    async fn make_via_ref(
        &self,
        _old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(DispatchHandler {
            hosts: self.hosts.clone(),
            defaults: self.defaults.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;
    use estuary_core::{
        http::{
            body::ResponseBody,
            handler::{decorator_fn, service_fn},
            RequestBody,
        },
        routing::{
            EndpointOptions, ParamSpec, Route, ScalarType, ServiceEndpoint, VirtualHost,
            VirtualHosts,
        },
    };
    use http::StatusCode;
    use mime::Mime;

    use super::*;

    fn defaults() -> DispatchDefaults {
        DispatchDefaults {
            request_timeout: None,
            max_request_length: 1024 * 1024,
            verbose_responses: false,
        }
    }

    fn text(body: &'static str) -> ServiceEndpoint {
        ServiceEndpoint::new(Arc::new(service_fn(move |_req, _ctx| async move {
            Ok(http::Response::new(ResponseBody::from(body)))
        })))
    }

    fn handler(host: VirtualHost) -> DispatchHandler {
        DispatchHandler::new(Arc::new(VirtualHosts::new(vec![host])), defaults())
    }

    fn get(path: &str) -> HttpRequest {
        let mut request = http::Request::new(RequestBody::Empty);
        *request.uri_mut() = path.parse().unwrap();
        request
    }

    async fn body_text(handler: &DispatchHandler, request: HttpRequest) -> (StatusCode, String) {
        let (response, _) = handler.handle(request, ()).await.unwrap();
        let status = response.status();
        let body = response.into_body().into_bytes();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[monoio::test]
    async fn literal_route_beats_template_and_binds_params() {
        let by_id = ServiceEndpoint::new(Arc::new(service_fn(|_req, ctx| async move {
            Ok(http::Response::new(ResponseBody::from(format!(
                "user {}",
                ctx.param("id").unwrap_or("?")
            ))))
        })));
        let host = VirtualHost::builder("default")
            .service(Route::of(Method::GET, "/users/{id}").unwrap(), by_id)
            .service(Route::of(Method::GET, "/users/new").unwrap(), text("create form"))
            .build()
            .unwrap();
        let handler = handler(host);

        let (status, body) = body_text(&handler, get("/users/new")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "create form");

        let (status, body) = body_text(&handler, get("/users/42")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "user 42");
    }

    #[monoio::test]
    async fn consumes_mismatch_is_415_match_serves() {
        let route = Route::builder()
            .methods([Method::POST])
            .path("/items")
            .unwrap()
            .consumes(["application/json".parse::<Mime>().unwrap()])
            .build()
            .unwrap();
        let host = VirtualHost::builder("default")
            .service(route, text("created"))
            .build()
            .unwrap();
        let handler = handler(host);

        let mut request = http::Request::new(RequestBody::full(Bytes::from_static(b"x")));
        *request.uri_mut() = "/items".parse().unwrap();
        *request.method_mut() = Method::POST;
        request
            .headers_mut()
            .insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());
        let (status, _) = body_text(&handler, request).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let mut request =
            http::Request::new(RequestBody::full(Bytes::from_static(b"{\"x\":1}")));
        *request.uri_mut() = "/items".parse().unwrap();
        *request.method_mut() = Method::POST;
        request
            .headers_mut()
            .insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        let (status, body) = body_text(&handler, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "created");
    }

    #[monoio::test]
    async fn decorator_chain_order_follows_registration() {
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::default();

        let o1 = order.clone();
        let logging = Arc::new(decorator_fn(move |req, ctx, chain| {
            let o1 = o1.clone();
            async move {
                o1.lock().unwrap().push("logging");
                chain.proceed(req, ctx).await
            }
        }));
        let o2 = order.clone();
        let auth = Arc::new(decorator_fn(move |req, ctx, chain| {
            let o2 = o2.clone();
            async move {
                o2.lock().unwrap().push("auth");
                chain.proceed(req, ctx).await
            }
        }));
        let o3 = order.clone();
        let service = ServiceEndpoint::new(Arc::new(service_fn(move |_req, _ctx| {
            let o3 = o3.clone();
            async move {
                o3.lock().unwrap().push("service");
                Ok(http::Response::new(ResponseBody::from("api")))
            }
        })));

        let host = VirtualHost::builder("default")
            .service(Route::of(Method::GET, "/api/**").unwrap(), service)
            .decorator(Route::of(Method::GET, "prefix:/").unwrap(), logging)
            .decorator(Route::of(Method::GET, "prefix:/api").unwrap(), auth)
            .build()
            .unwrap();
        let handler = handler(host);

        let (status, _) = body_text(&handler, get("/api/users/1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(*order.lock().unwrap(), vec!["logging", "auth", "service"]);

        // outside /api only the logging decorator matches, and nothing is
        // routed, so the fallback answers 404 through the chain
        order.lock().unwrap().clear();
        let (status, _) = body_text(&handler, get("/other")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(*order.lock().unwrap(), vec!["logging"]);
    }

    #[monoio::test]
    async fn method_miss_gets_405_with_allow() {
        let host = VirtualHost::builder("default")
            .service(Route::of(Method::POST, "/items").unwrap(), text("created"))
            .build()
            .unwrap();
        let handler = handler(host);
        let (response, _) = handler.handle(get("/items"), ()).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "POST");
    }

    #[monoio::test]
    async fn unrouted_path_is_404() {
        let host = VirtualHost::builder("default")
            .service(Route::of(Method::GET, "/known").unwrap(), text("ok"))
            .build()
            .unwrap();
        let handler = handler(host);
        let (status, _) = body_text(&handler, get("/unknown")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[monoio::test]
    async fn trailing_slash_fallback_redirects() {
        let host = VirtualHost::builder("default")
            .service(Route::of(Method::GET, "/docs/").unwrap(), text("docs"))
            .build()
            .unwrap();
        let handler = handler(host);
        let (response, _) = handler.handle(get("/docs"), ()).await.unwrap();
        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(response.headers()[header::LOCATION], "/docs/");
    }

    #[monoio::test]
    async fn decorator_error_hook_intercepts() {
        struct Teapot;
        impl estuary_core::http::handler::Decorator for Teapot {
            fn decorate(
                &self,
                request: HttpRequest,
                ctx: RequestContext,
                chain: DispatchChain,
            ) -> estuary_core::http::handler::HandlerFuture {
                chain.proceed(request, ctx)
            }
            fn handle_error(
                &self,
                _ctx: &RequestContext,
                err: &DispatchError,
            ) -> Option<HttpResponse> {
                matches!(err, DispatchError::NotFound).then(|| {
                    http::Response::builder()
                        .status(StatusCode::IM_A_TEAPOT)
                        .body(ResponseBody::Empty)
                        .unwrap()
                })
            }
        }

        let host = VirtualHost::builder("default")
            .decorator(Route::of(Method::GET, "prefix:/").unwrap(), Arc::new(Teapot))
            .build()
            .unwrap();
        let handler = handler(host);
        let (status, _) = body_text(&handler, get("/missing")).await;
        assert_eq!(status, StatusCode::IM_A_TEAPOT);
    }

    #[monoio::test]
    async fn handler_panic_renders_500() {
        let panicking = ServiceEndpoint::new(Arc::new(service_fn(|_req, _ctx| async {
            panic!("boom");
            #[allow(unreachable_code)]
            Ok(http::Response::new(ResponseBody::Empty))
        })));
        let host = VirtualHost::builder("default")
            .service(Route::of(Method::GET, "/explode").unwrap(), panicking)
            .build()
            .unwrap();
        let handler = handler(host);
        let (status, _) = body_text(&handler, get("/explode")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[monoio::test]
    async fn bound_params_reach_the_handler() {
        let endpoint = ServiceEndpoint::new(Arc::new(service_fn(|_req, ctx| async move {
            let page = ctx.scalar("page").and_then(|v| v.as_i64()).unwrap_or(-1);
            Ok(http::Response::new(ResponseBody::from(format!("page={page}"))))
        })))
        .with_options(EndpointOptions {
            params: vec![ParamSpec::query("page", ScalarType::I32).default_value("1")],
            ..Default::default()
        });
        let host = VirtualHost::builder("default")
            .service(Route::of(Method::GET, "/list").unwrap(), endpoint)
            .build()
            .unwrap();
        let handler = handler(host);

        let (_, body) = body_text(&handler, get("/list?page=5")).await;
        assert_eq!(body, "page=5");
        let (_, body) = body_text(&handler, get("/list")).await;
        assert_eq!(body, "page=1");
    }

    #[monoio::test(timer_enabled = true)]
    async fn request_timeout_maps_to_503() {
        let slow = ServiceEndpoint::new(Arc::new(service_fn(|_req, _ctx| async {
            monoio::time::sleep(Duration::from_secs(5)).await;
            Ok(http::Response::new(ResponseBody::Empty))
        })));
        let host = VirtualHost::builder("default")
            .service(Route::of(Method::GET, "/slow").unwrap(), slow)
            .build()
            .unwrap();
        let mut defaults = defaults();
        defaults.request_timeout = Some(Duration::from_millis(5));
        let handler = DispatchHandler::new(Arc::new(VirtualHosts::new(vec![host])), defaults);
        let (status, _) = body_text(&handler, get("/slow")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
