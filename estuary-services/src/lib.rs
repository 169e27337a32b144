//! Protocol and dispatch services for the Estuary HTTP server.
//!
//! The crate provides the pieces between the transport and user handlers:
//! the per-connection HTTP service, the HTTP/2 ingress state machine, the
//! dispatch handler that routes into services through decorator chains, and
//! the generic middlewares the binary composes into a service stack.

pub type AnyError = anyhow::Error;

pub mod common;
pub mod http;
