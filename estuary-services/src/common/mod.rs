//! Generic services: context seeding and panic containment.
mod context;
mod panic;

pub use context::ContextService;
pub use panic::{PanicGuard, PanicGuardError};
