//! Typed connection-context keys.
//!
//! The context struct itself is app-defined with `certain_map` (see the
//! binary crate); this module only provides the keys the framework services
//! read and write.
pub mod keys;

pub use keys::{PeerAddr, RemoteAddr};
