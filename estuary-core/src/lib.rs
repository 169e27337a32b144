//! Core abstractions for the Estuary HTTP server: the routing subsystem
//! (routes, trie, composite router, route cache, decorator tables), the
//! handler and dispatch-chain contracts, the error model, server
//! configuration types, and listener plumbing.
//!
//! Protocol services (HTTP/1 loop, HTTP/2 ingress) live in
//! `estuary-services`; this crate only defines what they route into.

#[macro_use]
mod error;
pub use error::{AnyError, AnyResult};

pub mod config;
pub mod context;
pub mod http;
pub mod listener;
pub mod routing;
