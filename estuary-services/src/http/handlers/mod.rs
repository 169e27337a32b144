//! HTTP request handlers: dispatch into routed services plus the
//! cross-cutting per-request concerns around it.
pub mod aggregate;
pub mod client_addr;
pub mod connection_persistence;
pub mod dispatch;
pub mod param;

pub use aggregate::RequestAggregator;
pub use client_addr::ClientAddrHandler;
pub use connection_persistence::ConnectionReuseHandler;
pub use dispatch::{DispatchDefaults, DispatchHandler, DispatchHandlerFactory};
pub use param::ParamBinder;
