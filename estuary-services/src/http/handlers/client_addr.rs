//! Client address resolution.
//!
//! Consults the configured sources in order (`forwarded`,
//! `x-forwarded-for`, proxy protocol, peer address) and publishes the first
//! hit as `RemoteAddr` in the connection context for downstream handlers.
use std::net::{IpAddr, SocketAddr};

use estuary_core::{
    config::ClientAddressSource,
    context::{PeerAddr, RemoteAddr},
    http::{HttpHandler, HttpRequest, ResponseWithContinue},
    listener::AcceptedAddr,
};
use http::HeaderMap;
use service_async::{
    layer::{layer_fn, FactoryLayer},
    AsyncMakeService, MakeService, Param, ParamRef, ParamSet,
};

#[derive(Clone)]
pub struct ClientAddrHandler<H> {
    sources: Vec<ClientAddressSource>,
    inner: H,
}

impl<H, CX> HttpHandler<CX> for ClientAddrHandler<H>
where
    CX: ParamRef<PeerAddr> + ParamSet<Option<RemoteAddr>>,
    H: HttpHandler<CX::Transformed>,
{
    type Error = H::Error;

    async fn handle(
        &self,
        request: HttpRequest,
        ctx: CX,
    ) -> Result<ResponseWithContinue, Self::Error> {
        let remote = self.resolve(request.headers(), &ctx);
        let ctx = ctx.param_set(remote);
        self.inner.handle(request, ctx).await
    }
}

impl<H> ClientAddrHandler<H> {
    fn resolve<CX: ParamRef<PeerAddr>>(
        &self,
        headers: &HeaderMap,
        ctx: &CX,
    ) -> Option<RemoteAddr> {
        for source in &self.sources {
            let addr = match source {
                ClientAddressSource::Forwarded => headers
                    .get(http::header::FORWARDED)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_forwarded),
                ClientAddressSource::XForwardedFor => headers
                    .get("x-forwarded-for")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.split(',').next())
                    .and_then(|v| parse_address(v.trim())),
                // transport-level; when enabled it arrives through the
                // listener, not through headers
                ClientAddressSource::ProxyProtocol => None,
                ClientAddressSource::Peer => {
                    let peer = ParamRef::<PeerAddr>::param_ref(ctx);
                    return Some(RemoteAddr(peer.0.clone()));
                }
            };
            if let Some(addr) = addr {
                return Some(RemoteAddr(AcceptedAddr::from(addr)));
            }
        }
        None
    }
}

/// First `for=` element of an RFC 7239 `forwarded` header.
fn parse_forwarded(value: &str) -> Option<SocketAddr> {
    let element = value.split(',').next()?;
    for pair in element.split(';') {
        let Some((key, val)) = pair.trim().split_once('=') else {
            continue;
        };
        if key.eq_ignore_ascii_case("for") {
            return parse_address(val.trim().trim_matches('"'));
        }
    }
    None
}

/// Accepts `ip`, `ip:port`, `[v6]`, and `[v6]:port` forms; a missing port
/// becomes zero.
fn parse_address(raw: &str) -> Option<SocketAddr> {
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Some(addr);
    }
    let bare = raw.strip_prefix('[').and_then(|r| r.strip_suffix(']')).unwrap_or(raw);
    bare.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, 0)).ok()
}

impl<F> ClientAddrHandler<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self>
    where
        C: Param<Vec<ClientAddressSource>>,
    {
        layer_fn(|c: &C, inner| ClientAddrHandler {
            sources: c.param(),
            inner,
        })
    }
}

impl<F: MakeService> MakeService for ClientAddrHandler<F> {
    type Service = ClientAddrHandler<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(ClientAddrHandler {
            sources: self.sources.clone(),
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
        })
    }
}

impl<F: AsyncMakeService> AsyncMakeService for ClientAddrHandler<F> {
    type Service = ClientAddrHandler<F::Service>;
    type Error = F::Error;

    async fn make_via_ref(
        &self,
        old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(ClientAddrHandler {
            sources: self.sources.clone(),
            inner: self.inner.make_via_ref(old.map(|o| &o.inner)).await?,
        })
    }
}
