//! Connection-task panic containment.
//!
//! The dispatch layer already catches handler panics per request; this
//! wrapper is the outer line of defense, turning a panic anywhere in the
//! protocol plumbing into a per-connection error instead of a dead worker.
use std::{any::Any, panic::AssertUnwindSafe};

use futures::FutureExt;
use service_async::{
    layer::{layer_fn, FactoryLayer},
    AsyncMakeService, MakeService, Service,
};

pub struct PanicGuard<S> {
    inner: S,
}

#[derive(thiserror::Error, Debug)]
pub enum PanicGuardError<E> {
    #[error("service error: {0:?}")]
    Service(E),
    #[error("service panicked: {0}")]
    Panicked(String),
}

/// Extract a printable message from a panic payload. `panic!` with a
/// format string yields a `String`, a bare literal a `&'static str`;
/// anything else is opaque.
fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "non-string panic payload".to_string(),
        },
    }
}

impl<R, S> Service<R> for PanicGuard<S>
where
    S: Service<R>,
{
    type Response = S::Response;
    type Error = PanicGuardError<S::Error>;

    async fn call(&self, req: R) -> Result<Self::Response, Self::Error> {
        AssertUnwindSafe(self.inner.call(req))
            .catch_unwind()
            .await
            .map_err(|payload| PanicGuardError::Panicked(panic_message(payload)))?
            .map_err(PanicGuardError::Service)
    }
}

impl<F> PanicGuard<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self> {
        layer_fn(|_: &C, inner| PanicGuard { inner })
    }
}

impl<F: MakeService> MakeService for PanicGuard<F> {
    type Service = PanicGuard<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(PanicGuard {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
        })
    }
}

impl<F: AsyncMakeService> AsyncMakeService for PanicGuard<F> {
    type Service = PanicGuard<F::Service>;
    type Error = F::Error;

    async fn make_via_ref(
        &self,
        old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(PanicGuard {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner)).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Exploder;
    impl Service<&'static str> for Exploder {
        type Response = ();
        type Error = std::convert::Infallible;

        async fn call(&self, req: &'static str) -> Result<Self::Response, Self::Error> {
            panic!("{req}");
        }
    }

    #[monoio::test]
    async fn panic_becomes_error_with_message() {
        let guard = PanicGuard { inner: Exploder };
        match guard.call("kaboom").await {
            Err(PanicGuardError::Panicked(message)) => assert!(message.contains("kaboom")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
