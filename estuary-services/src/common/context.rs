//! Connection-context seeding.
//!
//! Sits at the top of the service stack and seeds a fresh typed context for
//! every accepted connection, with the peer address already set; downstream
//! handlers read it through `ParamRef<PeerAddr>` and extend it through
//! `ParamSet`.
use std::marker::PhantomData;

use estuary_core::{context::PeerAddr, listener::AcceptedAddr};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    AsyncMakeService, MakeService, ParamSet, Service,
};

pub struct ContextService<CX, T> {
    pub inner: T,
    _context: PhantomData<fn() -> CX>,
}

impl<R, T, CX> Service<(R, AcceptedAddr)> for ContextService<CX, T>
where
    T: Service<(R, CX::Transformed)>,
    CX: Default + ParamSet<PeerAddr>,
{
    type Response = T::Response;
    type Error = T::Error;

    async fn call(&self, (req, addr): (R, AcceptedAddr)) -> Result<Self::Response, Self::Error> {
        let ctx = CX::default().param_set(PeerAddr(addr));
        self.inner.call((req, ctx)).await
    }
}

impl<CX, F> ContextService<CX, F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self> {
        layer_fn(|_: &C, inner| ContextService {
            inner,
            _context: PhantomData,
        })
    }
}

impl<CX, F: MakeService> MakeService for ContextService<CX, F> {
    type Service = ContextService<CX, F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(ContextService {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
            _context: PhantomData,
        })
    }
}

impl<CX, F: AsyncMakeService> AsyncMakeService for ContextService<CX, F> {
    type Service = ContextService<CX, F::Service>;
    type Error = F::Error;

    async fn make_via_ref(
        &self,
        old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(ContextService {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner)).await?,
            _context: PhantomData,
        })
    }
}
