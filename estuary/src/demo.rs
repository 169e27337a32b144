//! The demo route table served by the binary.
//!
//! Services and their parameters are registered through explicit builder
//! calls; the config file only carries server options.
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use estuary_core::{
    config::ServerOptions,
    http::{body::ResponseBody, handler::decorator_fn, handler::service_fn},
    routing::{
        EndpointOptions, ParamSpec, Route, ScalarType, ServiceEndpoint, VirtualHost, VirtualHosts,
    },
};
use http::Method;
use tracing::info;

pub fn demo_hosts(options: &ServerOptions) -> Result<VirtualHosts> {
    let health = ServiceEndpoint::new(Arc::new(service_fn(|_req, _ctx| async {
        Ok(http::Response::new(ResponseBody::from("ok")))
    })));

    let hello = ServiceEndpoint::new(Arc::new(service_fn(|_req, ctx| async move {
        let name = ctx
            .scalar("name")
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .unwrap_or_else(|| "world".to_string());
        Ok(http::Response::new(ResponseBody::from(format!(
            "Hello, {name}!\n"
        ))))
    })))
    .with_options(EndpointOptions {
        params: vec![ParamSpec::path("name", ScalarType::String)],
        ..Default::default()
    });

    let echo = ServiceEndpoint::new(Arc::new(service_fn(|req, _ctx| async move {
        let (_, mut body) = req.into_parts();
        let data = body.aggregate(0).await?;
        Ok(http::Response::new(ResponseBody::from(Bytes::from(
            data.to_vec(),
        ))))
    })));

    let greet = ServiceEndpoint::new(Arc::new(service_fn(|_req, ctx| async move {
        let name = ctx
            .scalar("name")
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .unwrap_or_default();
        let count = ctx.scalar("count").and_then(|v| v.as_i64()).unwrap_or(1);
        let mut out = String::new();
        for _ in 0..count {
            out.push_str(&format!("Greetings, {name}!\n"));
        }
        Ok(http::Response::new(ResponseBody::from(out)))
    })))
    .with_options(EndpointOptions {
        params: vec![
            ParamSpec::form("name", ScalarType::String).required(),
            ParamSpec::query("count", ScalarType::I32).default_value("1"),
        ],
        ..Default::default()
    });

    let access_log = Arc::new(decorator_fn(|req, ctx, chain| {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        async move {
            let request_id = ctx.request_id();
            let out = chain.proceed(req, ctx).await;
            match &out {
                Ok(response) => {
                    info!(request_id, %method, path, status = %response.status(), "served")
                }
                Err(err) => info!(request_id, %method, path, %err, "failed"),
            }
            out
        }
    }));

    let host = VirtualHost::builder("default")
        .service(Route::of(Method::GET, "/healthz")?, health)
        .service(Route::of(Method::GET, "/hello/{name}")?, hello)
        .service(Route::of(Method::POST, "/echo")?, echo)
        .service(
            Route::builder()
                .methods([Method::POST])
                .path("/greet")?
                .consumes([mime::APPLICATION_WWW_FORM_URLENCODED])
                .build()?,
            greet,
        )
        .decorator(Route::builder().path("prefix:/")?.build()?, access_log)
        .route_cache(options.route_cache_spec.clone())
        .build()?;

    Ok(VirtualHosts::new(vec![host]))
}
