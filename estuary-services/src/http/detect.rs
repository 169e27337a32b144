//! HTTP/2 preface detection.
//!
//! [`H2Detect`] sniffs the first bytes of a cleartext connection for the
//! client connection preface and forwards `(is_h2, io, ctx)` to the inner
//! service, with the sniffed bytes replayed in front of the stream.
use std::io::{self, Cursor};

use monoio::{
    buf::IoBufMut,
    io::{AsyncReadRent, PrefixedReadIo},
};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    AsyncMakeService, MakeService, Service,
};

const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// The sniffed stream: whatever was read for classification, replayed ahead
/// of the remaining bytes.
pub type SniffedIo<IO> = PrefixedReadIo<IO, Cursor<Vec<u8>>>;

#[derive(Clone)]
pub struct H2Detect<T> {
    inner: T,
}

#[derive(thiserror::Error, Debug)]
pub enum H2DetectError<E> {
    #[error("preface read failed: {0}")]
    Io(#[from] io::Error),
    #[error("inner service error: {0:?}")]
    Inner(E),
}

impl<T, IO, CX> Service<(IO, CX)> for H2Detect<T>
where
    IO: AsyncReadRent,
    T: Service<(bool, SniffedIo<IO>, CX)>,
{
    type Response = T::Response;
    type Error = H2DetectError<T::Error>;

    async fn call(&self, (io, cx): (IO, CX)) -> Result<Self::Response, Self::Error> {
        let (is_h2, io) = sniff_preface(io).await?;
        self.inner
            .call((is_h2, io, cx))
            .await
            .map_err(H2DetectError::Inner)
    }
}

/// Read up to one preface worth of bytes, bailing out at the first byte
/// that diverges. EOF short of the full preface is not HTTP/2 either.
async fn sniff_preface<IO: AsyncReadRent>(mut io: IO) -> io::Result<(bool, SniffedIo<IO>)> {
    let want = PREFACE.len();
    let mut sniffed: Vec<u8> = Vec::with_capacity(want);
    let mut diverged = false;
    while sniffed.len() < want && !diverged {
        let vacant = sniffed.len()..want;
        let (read, owned) = io.read(sniffed.slice_mut(vacant)).await;
        sniffed = owned.into_inner();
        if read? == 0 {
            break;
        }
        diverged = sniffed[..] != PREFACE[..sniffed.len()];
    }
    let is_h2 = !diverged && sniffed.len() == want;
    Ok((is_h2, PrefixedReadIo::new(io, Cursor::new(sniffed))))
}

impl<F> H2Detect<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self> {
        layer_fn(|_: &C, inner| H2Detect { inner })
    }
}

impl<F: MakeService> MakeService for H2Detect<F> {
    type Service = H2Detect<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(H2Detect {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
        })
    }
}

impl<F: AsyncMakeService> AsyncMakeService for H2Detect<F> {
    type Service = H2Detect<F::Service>;
    type Error = F::Error;

    async fn make_via_ref(
        &self,
        old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(H2Detect {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner)).await?,
        })
    }
}
