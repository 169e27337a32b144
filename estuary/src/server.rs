//! Worker threads, the accept loop, and graceful shutdown.
use std::{cell::Cell, fmt::Debug, future::Future, rc::Rc, sync::Arc, time::Duration};

use anyhow::Result;
use estuary_core::{
    config::{RuntimeConfig, ServerOptions},
    listener::{AcceptedAddr, AcceptedStream, Listener, ListenerBuilder},
};
use monoio::io::stream::Stream;
use service_async::{MakeService, Service};
use tracing::{error, info, warn};

use crate::{config::Config, demo, factory::{server_factory, ServerConfig}};

/// Spawn the configured workers and block until they exit. Each worker is
/// pinned to its own runtime; a connection never leaves the reactor thread
/// that accepted it.
pub fn run(config: Config) -> Result<()> {
    let mut handles = Vec::new();
    for (name, service_config) in config.servers {
        let options = Arc::new(service_config.server.options);
        let hosts = Arc::new(demo::demo_hosts(&options)?);
        let listener_builder = Arc::new(ListenerBuilder::try_from(service_config.listener)?);
        let factory = Arc::new(server_factory(ServerConfig {
            options: options.clone(),
            hosts,
        }));

        for worker_id in 0..config.runtime.worker_threads {
            let factory = factory.clone();
            let listener_builder = listener_builder.clone();
            let options = options.clone();
            let runtime_config = config.runtime.clone();
            let name = name.clone();
            let handle = std::thread::Builder::new()
                .name(format!("estuary-worker-{worker_id}"))
                .spawn(move || {
                    info!(server = %name, worker_id, "worker starting");
                    worker_main(runtime_config, factory, listener_builder, options);
                })?;
            handles.push(handle);
        }
    }
    for handle in handles {
        let _ = handle.join();
    }
    Ok(())
}

fn worker_main<F, S>(
    runtime_config: RuntimeConfig,
    factory: Arc<F>,
    listener_builder: Arc<ListenerBuilder>,
    options: Arc<ServerOptions>,
) where
    F: MakeService<Service = S>,
    F::Error: Debug,
    S: Service<(AcceptedStream, AcceptedAddr), Response = ()> + 'static,
    S::Error: Debug,
{
    let mut runtime = match monoio::RuntimeBuilder::<monoio::FusionDriver>::new()
        .enable_timer()
        .with_entries(runtime_config.entries)
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("runtime build failed: {e:?}");
            return;
        }
    };
    runtime.block_on(serve(
        factory,
        listener_builder,
        options,
        std::future::pending::<()>(),
    ));
}

/// Accept connections until `shutdown` resolves, then drain per the
/// graceful-shutdown settings and return.
pub async fn serve<F, S>(
    factory: Arc<F>,
    listener_builder: Arc<ListenerBuilder>,
    options: Arc<ServerOptions>,
    shutdown: impl Future<Output = ()>,
) where
    F: MakeService<Service = S>,
    F::Error: Debug,
    S: Service<(AcceptedStream, AcceptedAddr), Response = ()> + 'static,
    S::Error: Debug,
{
    let svc = match factory.make() {
        Ok(svc) => Rc::new(svc),
        Err(e) => {
            error!("fail to build the service chain: {e:?}");
            return;
        }
    };
    let mut listener = match listener_builder.build() {
        Ok(listener) => listener,
        Err(e) => {
            error!("fail to build listener: {e:?}");
            return;
        }
    };

    let active: Rc<Cell<usize>> = Rc::new(Cell::new(0));
    let mut shutdown = std::pin::pin!(shutdown);
    loop {
        monoio::select! {
            _ = &mut shutdown => {
                info!("server is notified to stop");
                break;
            }
            accept_opt = listener.next() => {
                let accept = match accept_opt {
                    Some(accept) => accept,
                    None => {
                        info!("listener is closed, serve stopped");
                        return;
                    }
                };
                match accept {
                    Ok(accept) => {
                        if let Some(max) = options.max_connections {
                            if active.get() >= max {
                                warn!("connection limit reached, rejecting accept");
                                continue;
                            }
                        }
                        active.set(active.get() + 1);
                        let svc = svc.clone();
                        let active = active.clone();
                        monoio::spawn(async move {
                            match svc.call(accept).await {
                                Ok(_) => {
                                    tracing::debug!("connection complete");
                                }
                                Err(e) => {
                                    error!("connection error: {e:?}");
                                }
                            }
                            active.set(active.get() - 1);
                        });
                    }
                    Err(e) => warn!("accept connection failed: {e:?}"),
                }
            }
        }
    }

    drain(&mut listener, active, options.graceful_shutdown.normalized()).await;
}

/// Stop accepting, then wait for in-flight connections: up to the quiet
/// period for the count to settle at zero, force-closing at the timeout.
async fn drain(
    _listener: &mut Listener,
    active: Rc<Cell<usize>>,
    shutdown: estuary_core::config::GracefulShutdown,
) {
    const TICK: Duration = Duration::from_millis(100);
    let deadline = std::time::Instant::now() + shutdown.timeout;
    let mut settled: Option<std::time::Instant> = None;
    loop {
        let now = std::time::Instant::now();
        if now >= deadline {
            if active.get() > 0 {
                warn!(active = active.get(), "graceful shutdown timed out, force closing");
            }
            return;
        }
        if active.get() == 0 {
            let since = settled.get_or_insert(now);
            if now.duration_since(*since) >= shutdown.quiet_period {
                info!("drained, shutting down");
                return;
            }
        } else {
            settled = None;
        }
        monoio::time::sleep(TICK).await;
    }
}
