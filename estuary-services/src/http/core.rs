//! Core HTTP connection service.
//!
//! [`HttpCoreService`] accepts classified connections and drives them to
//! completion: HTTP/1 connections through monoio-http's request decoder and
//! response encoder with keep-alive handling, HTTP/2 connections through
//! the frame-level ingress state machine (see
//! [`crate::http::ingress`]) via [`HttpCoreService::h2_serve`]. The HTTP/2
//! wire codec itself is an external collaborator behind
//! [`Http2FrameIo`]; the raw-stream `Service` entry point only speaks
//! HTTP/1 and closes preface-detected HTTP/2 connections when no codec is
//! wired.
use std::{
    convert::Infallible,
    fmt::Debug,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use estuary_core::{
    config::ServerOptions,
    http::{
        body::{BodyError, RequestBody},
        HttpAccept, HttpHandler, HttpResponse,
    },
};
use futures::{stream::FuturesUnordered, StreamExt};
use http::StatusCode;
use monoio::io::{sink::SinkExt, stream::Stream, AsyncReadRent, AsyncWriteRent, Split, Splitable};
use monoio_http::{
    common::body::{Body, HttpBody},
    h1::codec::{
        decoder::{FillPayload, RequestDecoder},
        encoder::GenericEncoder,
    },
};
use service_async::{
    layer::{layer_fn, FactoryLayer},
    AsyncMakeService, MakeService, Param, Service,
};
use tracing::{debug, error, info, warn};

use super::{
    generate_response,
    ingress::{
        frame::{Http2ErrorCode, Http2FrameIo, OutboundFrame},
        Http2Ingress, IngressOptions, NewRequest, RequestIdent,
    },
};

/// Timeout settings for the HTTP/1 side of the server.
///
/// - `keepalive_timeout`: close the connection when no byte arrives within
///   it between requests.
/// - `read_header_timeout`: cap on reading one full header block.
/// - `read_body_timeout`: cap on receiving one full request body.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HttpServerTimeout {
    pub keepalive_timeout: Option<Duration>,
    pub read_header_timeout: Option<Duration>,
    pub read_body_timeout: Option<Duration>,
}

impl Default for HttpServerTimeout {
    fn default() -> Self {
        const DEFAULT_KEEPALIVE_SEC: u64 = 75;
        Self {
            keepalive_timeout: Some(Duration::from_secs(DEFAULT_KEEPALIVE_SEC)),
            read_header_timeout: None,
            read_body_timeout: None,
        }
    }
}

/// Per-connection limits and lifecycle knobs resolved from [`ServerOptions`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub http_timeout: HttpServerTimeout,
    pub h1_max_initial_line: usize,
    pub h1_max_header_size: usize,
    pub max_request_length: u64,
    pub max_requests_per_connection: Option<usize>,
    pub max_connection_age: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub ping_interval: Option<Duration>,
    /// `None` disables the post-response auto-abort.
    pub auto_abort_delay: Option<Duration>,
    pub ingress: IngressOptions,
}

impl From<&ServerOptions> for ConnectionOptions {
    fn from(options: &ServerOptions) -> Self {
        Self {
            http_timeout: HttpServerTimeout {
                keepalive_timeout: options.idle_timeout,
                ..Default::default()
            },
            h1_max_initial_line: options.http1.max_initial_line,
            h1_max_header_size: options.http1.max_header_size,
            max_request_length: options.max_request_length,
            max_requests_per_connection: options.max_requests_per_connection,
            max_connection_age: options.max_connection_age,
            idle_timeout: options.idle_timeout,
            ping_interval: options.ping_interval,
            auto_abort_delay: u64::try_from(options.request_auto_abort_delay_millis)
                .ok()
                .map(Duration::from_millis),
            ingress: IngressOptions::from(options),
        }
    }
}

/// Core HTTP connection handler; generic over the request handler chain.
#[derive(Clone)]
pub struct HttpCoreService<H> {
    handler_chain: H,
    options: ConnectionOptions,
}

impl<H> HttpCoreService<H> {
    pub fn new(handler_chain: H, options: ConnectionOptions) -> Self {
        Self {
            handler_chain,
            options,
        }
    }

    async fn h1_svc<S, CX, Err>(&self, stream: S, ctx: CX)
    where
        CX: Clone,
        H: HttpHandler<CX, Error = Err>,
        Err: Debug,
        S: Split + AsyncReadRent + AsyncWriteRent,
    {
        let (reader, writer) = stream.into_split();
        let mut decoder = RequestDecoder::new(reader);
        let mut encoder = GenericEncoder::new(writer);
        decoder.set_timeout(self.options.http_timeout.keepalive_timeout);

        let age_deadline = self.options.max_connection_age.map(|d| Instant::now() + d);
        let mut served = 0usize;

        loop {
            // decode request with header timeout
            let decoded = match self.options.http_timeout.read_header_timeout {
                Some(header_timeout) => {
                    match monoio::time::timeout(header_timeout, decoder.next()).await {
                        Ok(inner) => inner,
                        Err(_) => {
                            info!("connection decode http header timed out");
                            break;
                        }
                    }
                }
                None => decoder.next().await,
            };

            let req = match decoded {
                Some(Ok(req)) => req,
                Some(Err(err)) => {
                    warn!("decode request header failed: {err}");
                    break;
                }
                None => {
                    debug!("connection closed");
                    break;
                }
            };

            served += 1;

            if self.h1_over_limits(&req) {
                let _ = encoder
                    .send_and_flush(generate_response::<HttpBody>(
                        StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                        true,
                    ))
                    .await;
                break;
            }

            // read the body to completion before dispatch; h1 framing does
            // not allow interleaving the next request before it is drained
            let req = HttpBody::request(req);
            let (parts, mut h1_body) = req.into_parts();
            let limit = self.options.max_request_length;
            let collect = async {
                let mut buf = BytesMut::new();
                loop {
                    match h1_body.next_data().await {
                        None => break Ok(buf.freeze()),
                        Some(Ok(data)) => {
                            buf.extend_from_slice(&data);
                            if limit > 0 && buf.len() as u64 > limit {
                                break Err(BodyError::ContentTooLarge);
                            }
                        }
                        Some(Err(err)) => {
                            warn!("h1 body read failed: {err:?}");
                            break Err(BodyError::Closed);
                        }
                    }
                }
            };
            let (fill, collected) = futures::join!(decoder.fill_payload(), collect);
            if let Err(err) = fill {
                warn!("error when decode request body: {err}");
                break;
            }
            let body = match collected {
                Ok(data) => RequestBody::full(data),
                Err(BodyError::ContentTooLarge) => {
                    let _ = encoder
                        .send_and_flush(generate_response::<HttpBody>(
                            StatusCode::PAYLOAD_TOO_LARGE,
                            true,
                        ))
                        .await;
                    break;
                }
                Err(_) => break,
            };

            let mut request = http::Request::from_parts(parts, body);
            request.extensions_mut().insert(RequestIdent {
                request_id: served as u64,
                stream_id: 0,
            });

            let (response, mut cont) = match self.handler_chain.handle(request, ctx.clone()).await
            {
                Ok(out) => out,
                Err(err) => {
                    error!("error when processing request: {err:?}");
                    (
                        generate_response::<estuary_core::http::body::ResponseBody>(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            true,
                        ),
                        false,
                    )
                }
            };

            if let Some(max) = self.options.max_requests_per_connection {
                cont &= served < max;
            }
            if let Some(deadline) = age_deadline {
                cont &= Instant::now() < deadline;
            }

            let response = into_h1_response(response);
            match self.options.http_timeout.read_body_timeout {
                None => {
                    if let Err(e) = encoder.send_and_flush(response).await {
                        warn!("error when encode and write response: {e}");
                        break;
                    }
                }
                Some(body_timeout) => {
                    match monoio::time::timeout(body_timeout, encoder.send_and_flush(response))
                        .await
                    {
                        Err(_) => {
                            info!("connection write timed out");
                            break;
                        }
                        Ok(Err(e)) => {
                            warn!("error when encode and write response: {e}");
                            break;
                        }
                        _ => (),
                    }
                }
            }

            if !cont {
                break;
            }
        }
    }

    fn h1_over_limits<B>(&self, req: &http::Request<B>) -> bool {
        // request-line: method + uri + version + separators
        let line = req.method().as_str().len() + uri_len(req.uri()) + 12;
        if line > self.options.h1_max_initial_line {
            return true;
        }
        let header_size: usize = req
            .headers()
            .iter()
            .map(|(name, value)| name.as_str().len() + value.len() + 4)
            .sum();
        header_size > self.options.h1_max_header_size
    }

    /// Drive one HTTP/2 connection over a classified-frame transport.
    ///
    /// The select loop mirrors the h1 side's structure: inbound frames feed
    /// the ingress, dispatched responses come back through a local
    /// `FuturesUnordered`, window releases turn into WINDOW_UPDATEs, and
    /// one timer arm multiplexes idle timeout, keep-alive PING, and max
    /// connection age.
    pub async fn h2_serve<IO, CX, Err>(&self, mut io: IO, ctx: CX)
    where
        IO: Http2FrameIo,
        CX: Clone,
        H: HttpHandler<CX, Error = Err>,
        Err: Debug,
    {
        let (mut ingress, mut releases) = Http2Ingress::new(self.options.ingress.clone());
        let mut dispatch = FuturesUnordered::new();
        let mut aborts = FuturesUnordered::new();

        let started = Instant::now();
        let mut last_activity = Instant::now();
        let mut last_ping = started;
        let mut peer_gone = false;

        loop {
            let now = Instant::now();
            let idle_deadline = self.options.idle_timeout.map(|d| last_activity + d);
            let ping_deadline = self
                .options
                .ping_interval
                .map(|d| last_activity.max(last_ping) + d);
            let age_deadline = self.options.max_connection_age.map(|d| started + d);
            let wake = [idle_deadline, ping_deadline, age_deadline]
                .into_iter()
                .flatten()
                .min();
            let sleep = wake
                .map(|t| t.saturating_duration_since(now))
                .unwrap_or(Duration::from_secs(3600));

            monoio::select! {
                maybe_frame = io.read_frame() => {
                    last_activity = Instant::now();
                    match maybe_frame {
                        Some(Ok(frame)) => match ingress.on_frame(frame) {
                            Ok(effects) => {
                                for frame in effects.frames {
                                    if io.write_frame(frame).await.is_err() {
                                        ingress.close_all(BodyError::Closed);
                                        return;
                                    }
                                }
                                if effects.peer_goaway {
                                    peer_gone = true;
                                }
                                if let Some(NewRequest { stream_id, request, handle }) =
                                    effects.request
                                {
                                    let ctx = ctx.clone();
                                    dispatch.push(async move {
                                        let out =
                                            self.handler_chain.handle(request, ctx).await;
                                        (out, stream_id, handle)
                                    });
                                }
                            }
                            Err(conn_err) => {
                                warn!("connection error: {conn_err}");
                                let _ = io
                                    .write_frame(OutboundFrame::GoAway {
                                        last_stream_id: 0,
                                        error_code: conn_err.code,
                                        debug_data: bytes::Bytes::from_static(
                                            conn_err.reason.as_bytes(),
                                        ),
                                    })
                                    .await;
                                ingress.close_all(BodyError::Closed);
                                return;
                            }
                        },
                        Some(Err(err)) => {
                            warn!("frame read failed: {err}");
                            ingress.close_all(BodyError::Closed);
                            return;
                        }
                        None => {
                            ingress.close_all(BodyError::Closed);
                            return;
                        }
                    }
                }
                Some((out, stream_id, handle)) = dispatch.next() => {
                    let response: HttpResponse = match out {
                        Ok((response, _)) => response,
                        Err(err) => {
                            error!("handler chain returned error: {err:?}");
                            generate_response(StatusCode::INTERNAL_SERVER_ERROR, false)
                        }
                    };
                    // a request torn down before any response frame (413,
                    // reset, cancel) must stay silent
                    let skip = {
                        let request = handle.borrow();
                        request.is_closed()
                            && !request.response_started
                            && request.close_reason().is_some()
                    };
                    if !skip {
                        handle.borrow_mut().response_started = true;
                        let (parts, body) = response.into_parts();
                        let payload = body.into_bytes();
                        let headers_frame = OutboundFrame::Headers {
                            stream_id,
                            status: parts.status,
                            headers: parts.headers,
                            end_stream: payload.is_empty(),
                        };
                        if io.write_frame(headers_frame).await.is_err() {
                            ingress.close_all(BodyError::Closed);
                            return;
                        }
                        if !payload.is_empty()
                            && io
                                .write_frame(OutboundFrame::Data {
                                    stream_id,
                                    payload,
                                    end_stream: true,
                                })
                                .await
                                .is_err()
                        {
                            ingress.close_all(BodyError::Closed);
                            return;
                        }
                    }
                    if ingress.on_response_complete(stream_id) {
                        if let Some(delay) = self.options.auto_abort_delay {
                            aborts.push(async move {
                                monoio::time::sleep(delay).await;
                                stream_id
                            });
                        }
                    }
                }
                Some(stream_id) = aborts.next() => {
                    for frame in ingress.abort_reading(stream_id) {
                        if io.write_frame(frame).await.is_err() {
                            ingress.close_all(BodyError::Closed);
                            return;
                        }
                    }
                }
                Some((stream_id, released)) = releases.recv() => {
                    for frame in ingress.on_window_release(stream_id, released) {
                        if io.write_frame(frame).await.is_err() {
                            ingress.close_all(BodyError::Closed);
                            return;
                        }
                    }
                }
                _ = monoio::time::sleep(sleep) => {
                    let now = Instant::now();
                    if idle_deadline.is_some_and(|t| now >= t) {
                        info!("connection idle timeout");
                        let _ = io
                            .write_frame(OutboundFrame::GoAway {
                                last_stream_id: 0,
                                error_code: Http2ErrorCode::NoError,
                                debug_data: bytes::Bytes::new(),
                            })
                            .await;
                        ingress.close_all(BodyError::Cancelled);
                        return;
                    }
                    if age_deadline.is_some_and(|t| now >= t) {
                        if let Some(goaway) = ingress.begin_drain(Http2ErrorCode::NoError) {
                            debug!("connection reached max age, draining");
                            if io.write_frame(goaway).await.is_err() {
                                ingress.close_all(BodyError::Closed);
                                return;
                            }
                        }
                    }
                    if ping_deadline.is_some_and(|t| now >= t) {
                        last_ping = now;
                        if io
                            .write_frame(OutboundFrame::Ping {
                                payload: [0; 8],
                                ack: false,
                            })
                            .await
                            .is_err()
                        {
                            ingress.close_all(BodyError::Closed);
                            return;
                        }
                    }
                }
                else => {
                    break;
                }
            }

            if (ingress.is_draining() || peer_gone)
                && dispatch.is_empty()
                && !ingress.has_streams()
            {
                debug!("drained, closing connection");
                return;
            }
        }
    }
}

fn uri_len(uri: &http::Uri) -> usize {
    uri.path().len() + uri.query().map(|q| q.len() + 1).unwrap_or(0)
}

fn into_h1_response(response: HttpResponse) -> http::Response<HttpBody> {
    use monoio_http::common::body::FixedBody;

    let (mut parts, body) = response.into_parts();
    let payload = body.into_bytes();
    parts.headers.insert(
        http::header::CONTENT_LENGTH,
        http::HeaderValue::from(payload.len()),
    );
    let body = HttpBody::fixed_body(if payload.is_empty() {
        None
    } else {
        Some(payload)
    });
    http::Response::from_parts(parts, body)
}

impl<H, Stream, CX, Err> Service<HttpAccept<Stream, CX>> for HttpCoreService<H>
where
    CX: Clone,
    H: HttpHandler<CX, Error = Err>,
    Err: Debug,
    Stream: Split + AsyncReadRent + AsyncWriteRent + Unpin + 'static,
{
    type Response = ();
    type Error = Infallible;

    async fn call(
        &self,
        incoming_stream: HttpAccept<Stream, CX>,
    ) -> Result<Self::Response, Self::Error> {
        let (use_h2, stream, ctx) = incoming_stream;
        if use_h2 {
            // serving h2 over a raw stream needs a frame codec wired in
            // front of `h2_serve`
            warn!("HTTP/2 preface received but no frame codec is configured; closing");
            drop(stream);
            return Ok(());
        }
        self.h1_svc(stream, ctx).await;
        Ok(())
    }
}

// HttpCoreService is a Service and a MakeService.
impl<F: MakeService> MakeService for HttpCoreService<F> {
    type Service = HttpCoreService<F::Service>;
    type Error = F::Error;

    fn make_via_ref(&self, old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        Ok(HttpCoreService {
            handler_chain: self
                .handler_chain
                .make_via_ref(old.map(|o| &o.handler_chain))?,
            options: self.options.clone(),
        })
    }
}

impl<F: AsyncMakeService> AsyncMakeService for HttpCoreService<F> {
    type Service = HttpCoreService<F::Service>;
    type Error = F::Error;

    async fn make_via_ref(
        &self,
        old: Option<&Self::Service>,
    ) -> Result<Self::Service, Self::Error> {
        Ok(HttpCoreService {
            handler_chain: self
                .handler_chain
                .make_via_ref(old.map(|o| &o.handler_chain))
                .await?,
            options: self.options.clone(),
        })
    }
}

impl<F> HttpCoreService<F> {
    pub fn layer<C>() -> impl FactoryLayer<C, F, Factory = Self>
    where
        C: Param<ConnectionOptions>,
    {
        layer_fn(|c: &C, inner| Self::new(inner, c.param()))
    }
}
