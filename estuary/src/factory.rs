//! Preconstructed service-stack factory.
use std::{fmt::Debug, sync::Arc};

use estuary_core::{
    config::{ClientAddressSource, ServerOptions},
    listener::{AcceptedAddr, AcceptedStream},
    routing::VirtualHosts,
};
use estuary_services::{
    common::{ContextService, PanicGuard},
    http::{
        detect::H2Detect,
        handlers::{ClientAddrHandler, ConnectionReuseHandler, DispatchDefaults, DispatchHandler},
        ConnectionOptions, HttpCoreService,
    },
};
use service_async::{stack::FactoryStack, MakeService, Param, Service};

use crate::context::EmptyContext;

/// Everything the stack layers extract their parameters from.
#[derive(Clone)]
pub struct ServerConfig {
    pub options: Arc<ServerOptions>,
    pub hosts: Arc<VirtualHosts>,
}

impl Param<ConnectionOptions> for ServerConfig {
    fn param(&self) -> ConnectionOptions {
        ConnectionOptions::from(&*self.options)
    }
}

impl Param<Vec<ClientAddressSource>> for ServerConfig {
    fn param(&self) -> Vec<ClientAddressSource> {
        self.options.client_address_sources.clone()
    }
}

/// Compose the full connection-serving stack: context insertion, HTTP/2
/// preface detection, the core HTTP service, and the handler chain ending
/// in the dispatch handler.
pub fn server_factory(
    config: ServerConfig,
) -> impl MakeService<
    Service = impl Service<(AcceptedStream, AcceptedAddr), Response = (), Error = impl Debug>
                  + 'static,
    Error = impl Debug,
> + Send
       + Sync
       + 'static {
    let hosts = config.hosts.clone();
    let defaults = DispatchDefaults::from(&*config.options);
    FactoryStack::new(config)
        .replace(DispatchHandler::factory(hosts, defaults))
        .push(ClientAddrHandler::layer())
        .push(ConnectionReuseHandler::layer())
        .push(HttpCoreService::layer())
        .push(H2Detect::layer())
        .push(ContextService::<EmptyContext, _>::layer())
        .push(PanicGuard::layer())
        .into_inner()
}
