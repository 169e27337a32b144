//! Virtual hosts: one route table (service router, decorator router, and
//! fallback endpoint) per host, plus the host set with exact-name selection.
//!
//! Name resolution beyond exact `:authority` lookup (wildcards, ports, SNI)
//! happens outside the core; the dispatcher only asks the set for the
//! selected host's tables.
use std::{collections::HashMap, sync::Arc};

use http::{header, HeaderValue, StatusCode};

use super::{
    cache::{CacheSpecError, CachedRouter, RouteCacheSpec},
    endpoint::{DecoratorBinding, ServiceEndpoint},
    route::Route,
    router::{DuplicateCallback, Router},
};
use crate::http::{
    body::ResponseBody,
    error::DispatchError,
    handler::{Decorator, RequestContext, ServiceHandler},
    HttpRequest,
};

/// The default fallback service: synthesized trailing-slash matches are
/// answered with a permanent redirect to the slashed path; anything else is
/// a plain not-found.
struct DefaultFallback;

impl ServiceHandler for DefaultFallback {
    fn invoke(
        &self,
        request: HttpRequest,
        ctx: RequestContext,
    ) -> crate::http::handler::HandlerFuture {
        Box::pin(async move {
            if !ctx.is_fallback_match() {
                return Err(DispatchError::NotFound);
            }
            let mut location = format!("{}/", request.uri().path());
            if let Some(query) = request.uri().query() {
                location.push('?');
                location.push_str(query);
            }
            let mut response = http::Response::builder()
                .status(StatusCode::PERMANENT_REDIRECT)
                .body(ResponseBody::Empty)
                .expect("static response build");
            if let Ok(value) = HeaderValue::from_str(&location) {
                response.headers_mut().insert(header::LOCATION, value);
            }
            Ok(response)
        })
    }
}

/// One virtual host's immutable routing tables.
pub struct VirtualHost {
    name: String,
    router: CachedRouter<ServiceEndpoint>,
    decorators: Router<DecoratorBinding>,
    fallback: ServiceEndpoint,
}

impl VirtualHost {
    pub fn builder(name: impl Into<String>) -> VirtualHostBuilder {
        VirtualHostBuilder {
            name: name.into(),
            services: Vec::new(),
            decorators: Vec::new(),
            fallback: None,
            cache_spec: None,
            on_duplicate: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn router(&self) -> &CachedRouter<ServiceEndpoint> {
        &self.router
    }

    pub fn decorators(&self) -> &Router<DecoratorBinding> {
        &self.decorators
    }

    /// The catch-all endpoint used when the primary router has no match.
    pub fn fallback(&self) -> &ServiceEndpoint {
        &self.fallback
    }
}

impl std::fmt::Debug for VirtualHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualHost")
            .field("name", &self.name)
            .field("services", &self.router.inner().len())
            .field("decorators", &self.decorators.len())
            .finish()
    }
}

pub struct VirtualHostBuilder {
    name: String,
    services: Vec<(Route, ServiceEndpoint)>,
    decorators: Vec<(Route, Arc<dyn Decorator + Send + Sync>)>,
    fallback: Option<ServiceEndpoint>,
    cache_spec: Option<String>,
    on_duplicate: Option<DuplicateCallback>,
}

impl VirtualHostBuilder {
    pub fn service(mut self, route: Route, endpoint: ServiceEndpoint) -> Self {
        self.services.push((route, endpoint));
        self
    }

    pub fn decorator(mut self, route: Route, decorator: Arc<dyn Decorator + Send + Sync>) -> Self {
        self.decorators.push((route, decorator));
        self
    }

    /// Replace the default fallback (redirect-or-404) endpoint.
    pub fn fallback(mut self, endpoint: ServiceEndpoint) -> Self {
        self.fallback = Some(endpoint);
        self
    }

    /// Caffeine-style spec string; `None` leaves the cache disabled.
    pub fn route_cache(mut self, spec: Option<String>) -> Self {
        self.cache_spec = spec;
        self
    }

    pub fn on_duplicate(mut self, callback: DuplicateCallback) -> Self {
        self.on_duplicate = Some(callback);
        self
    }

    pub fn build(self) -> Result<VirtualHost, CacheSpecError> {
        let fallback = self
            .fallback
            .unwrap_or_else(|| ServiceEndpoint::new(Arc::new(DefaultFallback)));

        let mut router_builder = Router::builder().fallback(fallback.clone());
        if let Some(cb) = self.on_duplicate {
            router_builder = router_builder.on_duplicate(cb);
        }
        for (route, endpoint) in self.services {
            router_builder = router_builder.route(route, endpoint);
        }
        let router = router_builder.build();

        let mut decorator_builder = Router::builder();
        for (order, (route, decorator)) in self.decorators.into_iter().enumerate() {
            decorator_builder =
                decorator_builder.route(route, DecoratorBinding { decorator, order });
        }
        let decorators = decorator_builder.build();

        let cache_spec = match self.cache_spec {
            Some(spec) => Some(RouteCacheSpec::parse(&spec)?),
            None => None,
        };

        Ok(VirtualHost {
            name: self.name,
            router: CachedRouter::new(router, cache_spec.as_ref()),
            decorators,
            fallback,
        })
    }
}

/// All virtual hosts of one server, with the default host at index zero.
pub struct VirtualHosts {
    hosts: Vec<Arc<VirtualHost>>,
    by_name: HashMap<String, usize>,
}

impl VirtualHosts {
    /// The first host is the default.
    pub fn new(hosts: Vec<VirtualHost>) -> Self {
        let hosts: Vec<Arc<VirtualHost>> = hosts.into_iter().map(Arc::new).collect();
        let by_name = hosts
            .iter()
            .enumerate()
            .map(|(i, h)| (h.name().to_string(), i))
            .collect();
        Self { hosts, by_name }
    }

    pub fn default_host(&self) -> &Arc<VirtualHost> {
        &self.hosts[0]
    }

    /// Exact-name selection with fallback to the default host.
    pub fn select(&self, authority: Option<&str>) -> &Arc<VirtualHost> {
        authority
            .and_then(|name| {
                // ignore an explicit port for name selection
                let name = name.rsplit_once(':').map_or(name, |(host, port)| {
                    if port.chars().all(|c| c.is_ascii_digit()) {
                        host
                    } else {
                        name
                    }
                });
                self.by_name.get(name)
            })
            .map(|&i| &self.hosts[i])
            .unwrap_or_else(|| self.default_host())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<VirtualHost>> {
        self.hosts.iter()
    }
}
