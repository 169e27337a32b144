//! HTTP protocol handling and services.
//!
//! - [`core`]: the per-connection service (HTTP/1 loop, HTTP/2 frame
//!   driver).
//! - [`ingress`]: the frame-level HTTP/2 request ingress state machine.
//! - [`handlers`]: request handlers, with [`handlers::dispatch`] as the
//!   terminal element routing into user services.
//! - [`detect`]: HTTP/2 preface detection for cleartext connections.
use http::HeaderValue;
use serde::{Deserialize, Serialize};

pub use self::core::{ConnectionOptions, HttpCoreService, HttpServerTimeout};
pub mod handlers;

pub mod core;
pub mod detect;
pub mod ingress;
pub mod util;

pub(crate) const CLOSE: &str = "close";
pub(crate) const KEEPALIVE: &str = "Keep-Alive";
#[allow(clippy::declare_interior_mutable_const)]
pub(crate) const CLOSE_VALUE: HeaderValue = HeaderValue::from_static(CLOSE);
#[allow(clippy::declare_interior_mutable_const)]
pub(crate) const KEEPALIVE_VALUE: HeaderValue = HeaderValue::from_static(KEEPALIVE);
pub use util::generate_response;

#[derive(Debug, Copy, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpVersion {
    Http2,
    Http11,
    #[default]
    Auto,
}
