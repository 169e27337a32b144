//! HTTP/1 connection persistence.
//!
//! Each protocol version carries its own default: HTTP/1.0 closes unless
//! the client opted in, HTTP/1.1 persists unless either side opts out, and
//! HTTP/2 multiplexes so the connection outlives any single request. The
//! handler normalizes the hop-by-hop `connection` header away before
//! dispatch and re-stamps the response according to the decision.
use estuary_core::http::{HttpHandler, HttpRequest, HttpResponse, ResponseWithContinue};
use http::{HeaderMap, Version};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    AsyncMakeService, MakeService,
};
use tracing::debug;

use crate::http::{CLOSE, CLOSE_VALUE, KEEPALIVE, KEEPALIVE_VALUE};

/// How the protocol version treats connection reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Persistence {
    /// HTTP/1.0: close by default, keep-alive on request.
    OptIn,
    /// HTTP/1.1: keep alive by default, close on request.
    OptOut,
    /// HTTP/2: reuse is the protocol's own business.
    Multiplexed,
    /// HTTP/0.9 and anything unrecognized: serve once.
    SingleShot,
}

impl Persistence {
    fn of(version: Version) -> Self {
        match version {
            Version::HTTP_10 => Persistence::OptIn,
            Version::HTTP_11 => Persistence::OptOut,
            Version::HTTP_2 => Persistence::Multiplexed,
            _ => Persistence::SingleShot,
        }
    }
}

/// Whether the client asked for the connection to stay open, given the
/// version's default. `connection` is a comma-separated token list.
fn client_wants_keepalive(policy: Persistence, headers: &HeaderMap) -> bool {
    let mut tokens = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim);
    match policy {
        Persistence::OptIn => tokens.any(|t| t.eq_ignore_ascii_case(KEEPALIVE)),
        Persistence::OptOut => !tokens.any(|t| t.eq_ignore_ascii_case(CLOSE)),
        Persistence::Multiplexed => true,
        Persistence::SingleShot => false,
    }
}

/// Handler managing connection reuse across HTTP versions.
#[derive(Clone)]
pub struct ConnectionReuseHandler<H> {
    inner: H,
}

impl<H> ConnectionReuseHandler<H> {
    pub fn new(inner: H) -> Self {
        Self { inner }
    }
}

impl<H, CX> HttpHandler<CX> for ConnectionReuseHandler<H>
where
    H: HttpHandler<CX>,
{
    type Error = H::Error;

    async fn handle(
        &self,
        mut request: HttpRequest,
        ctx: CX,
    ) -> Result<ResponseWithContinue, Self::Error> {
        let policy = Persistence::of(request.version());
        let keepalive = client_wants_keepalive(policy, request.headers());
        debug!(?policy, keepalive, "connection persistence");

        // downstream handlers never see the hop-by-hop header, and an
        // HTTP/1.0 request is dispatched as 1.1
        request.headers_mut().remove(http::header::CONNECTION);
        if policy == Persistence::OptIn {
            *request.version_mut() = Version::HTTP_11;
        }

        let (mut response, served_more) = self.inner.handle(request, ctx).await?;

        let cont = match policy {
            Persistence::Multiplexed => true,
            Persistence::SingleShot => false,
            Persistence::OptIn | Persistence::OptOut => served_more && keepalive,
        };
        stamp_response(&mut response, policy, cont);
        Ok((response, cont))
    }
}

fn stamp_response(response: &mut HttpResponse, policy: Persistence, cont: bool) {
    response.headers_mut().remove(http::header::CONNECTION);
    match policy {
        Persistence::OptIn => {
            // restore the downgraded version and advertise reuse only when
            // both sides agreed
            *response.version_mut() = Version::HTTP_10;
            if cont {
                response
                    .headers_mut()
                    .insert(http::header::CONNECTION, KEEPALIVE_VALUE);
            }
        }
        Persistence::OptOut => {
            if !cont {
                response
                    .headers_mut()
                    .insert(http::header::CONNECTION, CLOSE_VALUE);
            }
        }
        Persistence::Multiplexed | Persistence::SingleShot => {}
    }
}

// ConnectionReuseHandler is a handler and a MakeService.
impl<F: MakeService> MakeService for ConnectionReuseHandler<F> {
    type Service = ConnectionReuseHandler<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(ConnectionReuseHandler {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner))?,
        })
    }
}

impl<F: AsyncMakeService> AsyncMakeService for ConnectionReuseHandler<F> {
    type Service = ConnectionReuseHandler<F::Service>;
    type Error = F::Error;

    async fn make_via_ref(
        &self,
        old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(ConnectionReuseHandler {
            inner: self.inner.make_via_ref(old.map(|o| &o.inner)).await?,
        })
    }
}

impl<F> ConnectionReuseHandler<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self> {
        layer_fn(|_: &C, inner| Self { inner })
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use estuary_core::http::{body::ResponseBody, RequestBody};

    use super::*;

    /// Records the version the inner handler observed.
    struct VersionProbe;
    impl<CX> HttpHandler<CX> for VersionProbe {
        type Error = Infallible;
        async fn handle(
            &self,
            request: HttpRequest,
            _ctx: CX,
        ) -> Result<ResponseWithContinue, Self::Error> {
            assert!(request.headers().get(http::header::CONNECTION).is_none());
            let mut response = HttpResponse::new(ResponseBody::Empty);
            response.headers_mut().insert(
                "x-seen-version",
                format!("{:?}", request.version()).parse().unwrap(),
            );
            Ok((response, true))
        }
    }

    fn request(version: Version, connection: Option<&'static str>) -> HttpRequest {
        let mut request = http::Request::new(RequestBody::Empty);
        *request.version_mut() = version;
        if let Some(value) = connection {
            request
                .headers_mut()
                .insert(http::header::CONNECTION, value.parse().unwrap());
        }
        request
    }

    #[monoio::test]
    async fn http11_defaults_to_keepalive() {
        let handler = ConnectionReuseHandler::new(VersionProbe);
        let (response, cont) = handler.handle(request(Version::HTTP_11, None), ()).await.unwrap();
        assert!(cont);
        assert!(response.headers().get(http::header::CONNECTION).is_none());
    }

    #[monoio::test]
    async fn http11_close_token_honored() {
        let handler = ConnectionReuseHandler::new(VersionProbe);
        // `close` hides in a token list
        let (response, cont) = handler
            .handle(request(Version::HTTP_11, Some("te, close")), ())
            .await
            .unwrap();
        assert!(!cont);
        assert_eq!(response.headers()[http::header::CONNECTION], "close");
    }

    #[monoio::test]
    async fn http10_requires_explicit_keepalive() {
        let handler = ConnectionReuseHandler::new(VersionProbe);
        let (response, cont) = handler
            .handle(request(Version::HTTP_10, Some("Keep-Alive")), ())
            .await
            .unwrap();
        assert!(cont);
        assert_eq!(response.version(), Version::HTTP_10);
        assert_eq!(response.headers()[http::header::CONNECTION], "Keep-Alive");

        let (_, cont) = handler.handle(request(Version::HTTP_10, None), ()).await.unwrap();
        assert!(!cont);
    }

    #[monoio::test]
    async fn http10_is_dispatched_as_http11() {
        let handler = ConnectionReuseHandler::new(VersionProbe);
        let (response, _) = handler
            .handle(request(Version::HTTP_10, Some("Keep-Alive")), ())
            .await
            .unwrap();
        // dispatch saw 1.1, the stamped response went back to 1.0
        assert_eq!(response.headers()["x-seen-version"], "HTTP/1.1");
        assert_eq!(response.version(), Version::HTTP_10);
    }

    #[monoio::test]
    async fn http2_always_persists() {
        let handler = ConnectionReuseHandler::new(VersionProbe);
        let (_, cont) = handler.handle(request(Version::HTTP_2, None), ()).await.unwrap();
        assert!(cont);
    }
}
