//! HTTP/2 request ingress.
//!
//! [`Http2Ingress`] is the frame-level state machine between the wire codec
//! and the router: it validates HEADERS, feeds DATA into back-pressured
//! body streams under inbound flow control, and funnels RST_STREAM,
//! transport close, and idle timeout into one idempotent per-request close
//! path. It is synchronous and owns no I/O; the connection driver in
//! [`crate::http::core`] feeds it frames and writes out the effects, which
//! keeps the machine directly testable.
//!
//! Single-stream failures produce stream-local effects (an error response,
//! an RST); only connection-compromising conditions surface as
//! [`ConnectionError`] and GOAWAY the connection.
pub mod flow;
pub mod frame;
pub mod request;

use std::{
    collections::{HashMap, VecDeque},
    rc::Rc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use estuary_core::{
    config::ServerOptions,
    http::{
        body::{BodyError, BodyStream, Chunk},
        HttpRequest, RequestBody,
    },
};
use http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use local_sync::mpsc::unbounded::{channel, Rx, Tx};
use tracing::{debug, warn};

use self::{
    flow::InboundFlowController,
    frame::{
        DataFrame, HeadersFrame, Http2ErrorCode, InboundFrame, OutboundFrame, PseudoHeaders,
        StreamId,
    },
    request::{DecodedHttpRequest, RequestHandle, StreamEntry, StreamState},
};

/// Request identity attached to the request's extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestIdent {
    pub request_id: u64,
    pub stream_id: StreamId,
}

/// Resolved ingress limits, extracted from [`ServerOptions`].
#[derive(Debug, Clone)]
pub struct IngressOptions {
    pub max_request_length: u64,
    pub max_streams: u32,
    pub max_header_list_size: u32,
    pub max_reset_frames: usize,
    pub reset_frames_window: Duration,
    pub max_requests: Option<usize>,
    pub initial_connection_window: u32,
    pub initial_stream_window: u32,
}

impl From<&ServerOptions> for IngressOptions {
    fn from(options: &ServerOptions) -> Self {
        Self {
            max_request_length: options.max_request_length,
            max_streams: options.http2.max_streams_per_connection,
            max_header_list_size: options.http2.max_header_list_size,
            max_reset_frames: options.http2.max_reset_frames_per_window,
            reset_frames_window: options.http2.reset_frames_window,
            max_requests: options.max_requests_per_connection,
            initial_connection_window: options.http2.initial_connection_window,
            initial_stream_window: options.http2.initial_stream_window,
        }
    }
}

/// A condition that compromises the whole connection.
#[derive(thiserror::Error, Debug)]
#[error("connection error ({code:?}): {reason}")]
pub struct ConnectionError {
    pub code: Http2ErrorCode,
    pub reason: &'static str,
}

impl ConnectionError {
    fn protocol(reason: &'static str) -> Self {
        Self {
            code: Http2ErrorCode::ProtocolError,
            reason,
        }
    }
}

/// A request surfaced to the dispatcher.
#[derive(Debug)]
pub struct NewRequest {
    pub stream_id: StreamId,
    pub request: HttpRequest,
    pub handle: RequestHandle,
}

/// What one frame did: frames to write, and possibly a request to dispatch.
#[derive(Debug, Default)]
pub struct FrameEffects {
    pub frames: Vec<OutboundFrame>,
    pub request: Option<NewRequest>,
    /// Peer sent GOAWAY; finish in-flight streams and stop.
    pub peer_goaway: bool,
}

impl FrameEffects {
    fn frames(frames: Vec<OutboundFrame>) -> Self {
        Self {
            frames,
            ..Default::default()
        }
    }
}

/// Released window bytes flowing back from consumed body chunks.
pub type WindowReleases = Rx<(StreamId, usize)>;

pub struct Http2Ingress {
    options: IngressOptions,
    streams: HashMap<StreamId, StreamEntry>,
    flow: InboundFlowController,
    release_tx: Tx<(StreamId, usize)>,
    next_request_id: u64,
    accepted_requests: usize,
    highest_stream: StreamId,
    draining: bool,
    /// Streams we reset ourselves; in-flight DATA for them is returned to
    /// flow control instead of being treated as a protocol error.
    recently_reset: VecDeque<StreamId>,
    reset_times: VecDeque<Instant>,
}

const RECENTLY_RESET_CAP: usize = 64;

impl Http2Ingress {
    pub fn new(options: IngressOptions) -> (Self, WindowReleases) {
        let (release_tx, release_rx) = channel();
        let flow = InboundFlowController::new(
            options.initial_connection_window,
            options.initial_stream_window,
        );
        (
            Self {
                options,
                streams: HashMap::new(),
                flow,
                release_tx,
                next_request_id: 0,
                accepted_requests: 0,
                highest_stream: 0,
                draining: false,
                recently_reset: VecDeque::new(),
                reset_times: VecDeque::new(),
            },
            release_rx,
        )
    }

    pub fn active_streams(&self) -> usize {
        self.streams
            .values()
            .filter(|e| !e.handle.borrow().is_closed())
            .count()
    }

    pub fn has_streams(&self) -> bool {
        !self.streams.is_empty()
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Stop accepting new streams and tell the peer; used by graceful
    /// shutdown, max connection age, and the request-per-connection cap.
    pub fn begin_drain(&mut self, code: Http2ErrorCode) -> Option<OutboundFrame> {
        if self.draining {
            return None;
        }
        self.draining = true;
        Some(OutboundFrame::GoAway {
            last_stream_id: self.highest_stream,
            error_code: code,
            debug_data: Bytes::new(),
        })
    }

    pub fn on_frame(&mut self, frame: InboundFrame) -> Result<FrameEffects, ConnectionError> {
        match frame {
            InboundFrame::Headers(headers) => self.on_headers(headers),
            InboundFrame::Data(data) => self.on_data(data),
            InboundFrame::RstStream {
                stream_id,
                error_code,
            } => self.on_rst_stream(stream_id, error_code),
            InboundFrame::Ping { payload, ack } => {
                if ack {
                    Ok(FrameEffects::default())
                } else {
                    Ok(FrameEffects::frames(vec![OutboundFrame::Ping {
                        payload,
                        ack: true,
                    }]))
                }
            }
            InboundFrame::GoAway { error_code, .. } => {
                debug!(error_code, "peer sent GOAWAY");
                Ok(FrameEffects {
                    peer_goaway: true,
                    ..Default::default()
                })
            }
            InboundFrame::PushPromise { .. } => {
                Err(ConnectionError::protocol("PUSH_PROMISE from client"))
            }
            // outbound window and settings belong to the codec
            InboundFrame::WindowUpdate { .. }
            | InboundFrame::Settings { .. }
            | InboundFrame::Priority { .. } => Ok(FrameEffects::default()),
        }
    }

    /// Body bytes consumed by the handler; may produce WINDOW_UPDATEs.
    pub fn on_window_release(&mut self, stream_id: StreamId, len: usize) -> Vec<OutboundFrame> {
        self.flow.on_release(stream_id, len)
    }

    /// Response fully written. Returns `true` when the reading side is
    /// still open and the auto-abort timer should be scheduled.
    pub fn on_response_complete(&mut self, stream_id: StreamId) -> bool {
        let state = match self.streams.get(&stream_id) {
            Some(entry) => entry.handle.borrow().state(),
            None => return false,
        };
        match state {
            StreamState::Open => {
                if let Some(entry) = self.streams.get(&stream_id) {
                    entry.handle.borrow_mut().half_close();
                }
                true
            }
            StreamState::Closed => {
                self.remove_stream(stream_id);
                false
            }
            StreamState::Aborted => {
                // reading side is already torn down; in-flight DATA is
                // returned to flow control via the recently-reset set
                self.remove_stream(stream_id);
                self.note_reset(stream_id);
                false
            }
            StreamState::HalfClosed => false,
        }
    }

    /// Auto-abort: tear down the reading side of a request whose response
    /// completed a while ago. Tells the peer to stop sending.
    pub fn abort_reading(&mut self, stream_id: StreamId) -> Vec<OutboundFrame> {
        let closed = match self.streams.get(&stream_id) {
            Some(entry) => entry.handle.borrow().is_closed(),
            None => return Vec::new(),
        };
        if closed {
            self.remove_stream(stream_id);
            return Vec::new();
        }
        if let Some(mut entry) = self.streams.remove(&stream_id) {
            entry.close(Some(BodyError::Cancelled));
        }
        self.flow.on_stream_closed(stream_id);
        self.note_reset(stream_id);
        vec![OutboundFrame::RstStream {
            stream_id,
            error_code: Http2ErrorCode::NoError,
        }]
    }

    /// Transport-level stream close.
    pub fn on_stream_closed(&mut self, stream_id: StreamId) {
        if let Some(mut entry) = self.streams.remove(&stream_id) {
            if entry.close(Some(BodyError::Closed)) {
                debug!(stream_id, "stream closed while open");
            }
            self.flow.on_stream_closed(stream_id);
        }
    }

    /// Connection teardown: idle timeout, transport loss, fatal error.
    pub fn close_all(&mut self, reason: BodyError) {
        let ids: Vec<StreamId> = self.streams.keys().copied().collect();
        for stream_id in ids {
            if let Some(mut entry) = self.streams.remove(&stream_id) {
                entry.close(Some(reason.clone()));
            }
            self.flow.on_stream_closed(stream_id);
        }
    }

    fn on_headers(&mut self, frame: HeadersFrame) -> Result<FrameEffects, ConnectionError> {
        let stream_id = frame.stream_id;

        // subsequent HEADERS on a live stream are trailers
        if self.streams.contains_key(&stream_id) {
            return self.on_trailers(frame);
        }
        if stream_id <= self.highest_stream {
            return Err(ConnectionError::protocol("HEADERS on old stream"));
        }
        self.highest_stream = stream_id;

        if self.draining || self.active_streams() >= self.options.max_streams as usize {
            // the peer may already have DATA in flight for the stream
            self.note_reset(stream_id);
            return Ok(FrameEffects::frames(vec![OutboundFrame::RstStream {
                stream_id,
                error_code: Http2ErrorCode::RefusedStream,
            }]));
        }

        if header_list_size(&frame.pseudo, &frame.headers) > self.options.max_header_list_size as usize
        {
            return Ok(self.reject(
                stream_id,
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
                frame.end_stream,
            ));
        }

        let Some(raw_method) = frame.pseudo.method.as_deref() else {
            return Ok(self.reject(stream_id, StatusCode::BAD_REQUEST, frame.end_stream));
        };
        let Ok(method) = Method::from_bytes(raw_method.as_bytes()) else {
            return Ok(self.reject(stream_id, StatusCode::METHOD_NOT_ALLOWED, frame.end_stream));
        };
        if method == Method::CONNECT && frame.pseudo.protocol.is_none() {
            return Ok(self.reject(stream_id, StatusCode::METHOD_NOT_ALLOWED, frame.end_stream));
        }

        if !content_length_valid(&frame.headers) {
            return Ok(self.reject(stream_id, StatusCode::BAD_REQUEST, frame.end_stream));
        }

        let mut headers = frame.headers;
        let mut frames = Vec::new();
        if let Some(expect) = headers.remove(header::EXPECT) {
            if expect
                .as_bytes()
                .eq_ignore_ascii_case(b"100-continue")
            {
                frames.push(OutboundFrame::Headers {
                    stream_id,
                    status: StatusCode::CONTINUE,
                    headers: HeaderMap::new(),
                    end_stream: false,
                });
            } else {
                return Ok(self.reject(
                    stream_id,
                    StatusCode::EXPECTATION_FAILED,
                    frame.end_stream,
                ));
            }
        }

        self.next_request_id += 1;
        let request_id = self.next_request_id;
        self.accepted_requests += 1;

        let (body, sender) = if frame.end_stream {
            (RequestBody::Empty, None)
        } else {
            let (sender, stream) = BodyStream::channel();
            (RequestBody::Streamed(stream), Some(sender))
        };

        let mut request = http::Request::new(body);
        *request.method_mut() = method;
        *request.uri_mut() = build_uri(&frame.pseudo);
        *request.version_mut() = http::Version::HTTP_2;
        *request.headers_mut() = headers;
        request.extensions_mut().insert(RequestIdent {
            request_id,
            stream_id,
        });

        let handle: RequestHandle = Rc::new(
            DecodedHttpRequest::new(
                stream_id,
                request_id,
                self.options.max_request_length,
                frame.end_stream,
            )
            .into(),
        );
        self.streams
            .insert(stream_id, StreamEntry::new(handle.clone(), sender));

        // request-per-connection cap: serve this one, then drain
        if let Some(max) = self.options.max_requests {
            if self.accepted_requests >= max {
                if let Some(goaway) = self.begin_drain(Http2ErrorCode::NoError) {
                    frames.push(goaway);
                }
            }
        }

        Ok(FrameEffects {
            frames,
            request: Some(NewRequest {
                stream_id,
                request,
                handle,
            }),
            peer_goaway: false,
        })
    }

    fn on_trailers(&mut self, frame: HeadersFrame) -> Result<FrameEffects, ConnectionError> {
        let stream_id = frame.stream_id;
        if !frame.end_stream {
            return Err(ConnectionError::protocol("trailers without END_STREAM"));
        }
        let Some(entry) = self.streams.get_mut(&stream_id) else {
            return Err(ConnectionError::protocol("trailers on unknown stream"));
        };
        let state = entry.handle.borrow().state();
        match state {
            StreamState::Open | StreamState::HalfClosed => {
                entry.send_trailers(frame.headers);
                entry.close(None);
                Ok(FrameEffects::default())
            }
            StreamState::Aborted => {
                entry.close(None);
                Ok(FrameEffects::default())
            }
            StreamState::Closed => Err(ConnectionError {
                code: Http2ErrorCode::InternalError,
                reason: "trailers after inbound close",
            }),
        }
    }

    fn on_data(&mut self, frame: DataFrame) -> Result<FrameEffects, ConnectionError> {
        let stream_id = frame.stream_id;
        let flow_len = frame.flow_len();

        if !self.streams.contains_key(&stream_id) {
            if self.recently_reset.contains(&stream_id) {
                // we tore the stream down; hand the bytes straight back
                self.flow
                    .on_receive(stream_id, flow_len)
                    .map_err(|v| ConnectionError {
                        code: v.code(),
                        reason: "inbound window exceeded",
                    })?;
                return Ok(FrameEffects::frames(self.flow.on_release(stream_id, flow_len)));
            }
            return Err(ConnectionError::protocol("DATA on unknown stream"));
        }

        self.flow
            .on_receive(stream_id, flow_len)
            .map_err(|v| ConnectionError {
                code: v.code(),
                reason: "inbound window exceeded",
            })?;

        let state = self
            .streams
            .get(&stream_id)
            .map(|e| e.handle.borrow().state())
            .expect("checked above");
        if matches!(state, StreamState::Closed | StreamState::Aborted) {
            // a closed request ignores further DATA
            return Ok(FrameEffects::frames(self.flow.on_release(stream_id, flow_len)));
        }

        if frame.payload.is_empty() {
            let frames = if flow_len > 0 {
                self.flow.on_release(stream_id, flow_len)
            } else {
                Vec::new()
            };
            if frame.end_stream {
                if let Some(entry) = self.streams.get_mut(&stream_id) {
                    entry.close(None);
                }
            }
            return Ok(FrameEffects::frames(frames));
        }

        let (exceeds, response_started) = {
            let entry = self.streams.get_mut(&stream_id).expect("checked above");
            let mut request = entry.handle.borrow_mut();
            request.transferred_bytes += frame.payload.len() as u64;
            (request.exceeds_length(), request.response_started)
        };
        if exceeds {
            if !response_started {
                let mut frames = self.flow.on_release(stream_id, flow_len);
                if let Some(mut entry) = self.streams.remove(&stream_id) {
                    entry.close(Some(BodyError::ContentTooLarge));
                }
                self.flow.on_stream_closed(stream_id);
                self.note_reset(stream_id);
                frames.extend(error_response_frames(
                    stream_id,
                    StatusCode::PAYLOAD_TOO_LARGE,
                ));
                frames.push(OutboundFrame::RstStream {
                    stream_id,
                    error_code: Http2ErrorCode::Cancel,
                });
                return Ok(FrameEffects::frames(frames));
            }
            // response already in flight: abort quietly
            if let Some(entry) = self.streams.get_mut(&stream_id) {
                entry.handle.borrow_mut().abort();
                entry.close_body(BodyError::ContentTooLarge);
            }
            return Ok(FrameEffects::frames(self.flow.on_release(stream_id, flow_len)));
        }

        let release = self.release_hook(stream_id);
        let chunk = Chunk::with_release(frame.payload, flow_len, release);
        let delivered = self
            .streams
            .get(&stream_id)
            .and_then(|entry| entry.body())
            .map(|sender| sender.send_data(chunk).is_ok())
            .unwrap_or(false);
        if !delivered {
            // reader is gone; stop the peer without hurting the connection
            warn!(stream_id, "body write failed, cancelling stream");
            if let Some(mut entry) = self.streams.remove(&stream_id) {
                entry.close(Some(BodyError::Cancelled));
            }
            self.flow.on_stream_closed(stream_id);
            self.note_reset(stream_id);
            return Ok(FrameEffects::frames(vec![OutboundFrame::RstStream {
                stream_id,
                error_code: Http2ErrorCode::Cancel,
            }]));
        }

        if frame.end_stream {
            if let Some(entry) = self.streams.get_mut(&stream_id) {
                entry.close(None);
            }
        }
        Ok(FrameEffects::default())
    }

    fn on_rst_stream(
        &mut self,
        stream_id: StreamId,
        error_code: u32,
    ) -> Result<FrameEffects, ConnectionError> {
        let now = Instant::now();
        self.reset_times.push_back(now);
        while let Some(&front) = self.reset_times.front() {
            if now.duration_since(front) > self.options.reset_frames_window {
                self.reset_times.pop_front();
            } else {
                break;
            }
        }
        if self.reset_times.len() > self.options.max_reset_frames {
            return Err(ConnectionError {
                code: Http2ErrorCode::EnhanceYourCalm,
                reason: "RST_STREAM flood",
            });
        }

        if let Some(mut entry) = self.streams.remove(&stream_id) {
            debug!(stream_id, error_code, "stream reset by peer");
            entry.close(Some(BodyError::Reset));
            self.flow.on_stream_closed(stream_id);
        }
        Ok(FrameEffects::default())
    }

    fn reject(
        &mut self,
        stream_id: StreamId,
        status: StatusCode,
        end_stream: bool,
    ) -> FrameEffects {
        let mut frames = error_response_frames(stream_id, status);
        if !end_stream {
            // more frames are coming for a stream we never registered
            frames.push(OutboundFrame::RstStream {
                stream_id,
                error_code: Http2ErrorCode::Cancel,
            });
            self.note_reset(stream_id);
        }
        FrameEffects::frames(frames)
    }

    fn release_hook(&self, stream_id: StreamId) -> Rc<dyn Fn(usize)> {
        let tx = self.release_tx.clone();
        Rc::new(move |len| {
            let _ = tx.send((stream_id, len));
        })
    }

    fn remove_stream(&mut self, stream_id: StreamId) {
        self.streams.remove(&stream_id);
        self.flow.on_stream_closed(stream_id);
    }

    fn note_reset(&mut self, stream_id: StreamId) {
        if self.recently_reset.len() >= RECENTLY_RESET_CAP {
            self.recently_reset.pop_front();
        }
        self.recently_reset.push_back(stream_id);
    }
}

fn header_list_size(pseudo: &PseudoHeaders, headers: &HeaderMap) -> usize {
    // RFC 7540 §6.5.2: 32 octets of overhead per entry
    const ENTRY_OVERHEAD: usize = 32;
    let pseudo_size = [
        pseudo.method.as_deref(),
        pseudo.scheme.as_deref(),
        pseudo.authority.as_deref(),
        pseudo.path.as_deref(),
        pseudo.protocol.as_deref(),
    ]
    .into_iter()
    .flatten()
    .map(|v| v.len() + ENTRY_OVERHEAD)
    .sum::<usize>();
    pseudo_size
        + headers
            .iter()
            .map(|(name, value)| name.as_str().len() + value.len() + ENTRY_OVERHEAD)
            .sum::<usize>()
}

fn content_length_valid(headers: &HeaderMap) -> bool {
    let mut seen: Option<u64> = None;
    for value in headers.get_all(header::CONTENT_LENGTH) {
        let Some(parsed) = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
        else {
            return false;
        };
        if let Some(previous) = seen {
            if previous != parsed {
                return false;
            }
        }
        seen = Some(parsed);
    }
    true
}

fn build_uri(pseudo: &PseudoHeaders) -> Uri {
    let path = pseudo.path.as_deref().unwrap_or("/");
    let mut builder = Uri::builder().path_and_query(path);
    if let Some(authority) = pseudo.authority.as_deref() {
        builder = builder
            .authority(authority)
            .scheme(pseudo.scheme.as_deref().unwrap_or("http"));
    }
    builder
        .build()
        .unwrap_or_else(|_| Uri::from_static("/"))
}

/// Status-line-only error response: plain text content type, end of stream.
fn error_response_frames(stream_id: StreamId, status: StatusCode) -> Vec<OutboundFrame> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    vec![OutboundFrame::Headers {
        stream_id,
        status,
        headers,
        end_stream: true,
    }]
}

#[cfg(test)]
mod tests;
