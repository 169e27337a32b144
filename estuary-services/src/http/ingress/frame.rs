//! Classified HTTP/2 frames and the codec boundary.
//!
//! The wire codec (HPACK, CONTINUATION merging, frame-size enforcement) is
//! an external collaborator: it hands the ingress already-classified frames
//! through [`Http2FrameIo`] and accepts [`OutboundFrame`]s back. The
//! in-memory [`ChannelFrameIo`] implements the same contract over
//! same-thread channels and backs the ingress test suites.
use std::{future::Future, io};

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use local_sync::mpsc::unbounded::{channel, Rx, Tx};

pub type StreamId = u32;

/// RFC 7540 §7 error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Http2ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl From<Http2ErrorCode> for u32 {
    fn from(code: Http2ErrorCode) -> Self {
        code as u32
    }
}

/// Pseudo-header fields of a HEADERS frame, kept optional so the ingress
/// can validate them itself (a missing `:method` is a request error, not a
/// codec error).
#[derive(Debug, Clone, Default)]
pub struct PseudoHeaders {
    pub method: Option<String>,
    pub scheme: Option<String>,
    pub authority: Option<String>,
    pub path: Option<String>,
    /// RFC 8441 extended CONNECT protocol.
    pub protocol: Option<String>,
}

#[derive(Debug)]
pub struct HeadersFrame {
    pub stream_id: StreamId,
    pub pseudo: PseudoHeaders,
    pub headers: HeaderMap,
    pub end_stream: bool,
}

#[derive(Debug)]
pub struct DataFrame {
    pub stream_id: StreamId,
    pub payload: Bytes,
    /// Padding bytes, already stripped by the codec but still owed to flow
    /// control.
    pub padding: usize,
    pub end_stream: bool,
}

impl DataFrame {
    /// The flow-controlled length of the frame.
    pub fn flow_len(&self) -> usize {
        self.payload.len() + self.padding
    }
}

/// Inbound frames, post-classification.
#[derive(Debug)]
pub enum InboundFrame {
    Headers(HeadersFrame),
    Data(DataFrame),
    RstStream {
        stream_id: StreamId,
        error_code: u32,
    },
    Ping {
        payload: [u8; 8],
        ack: bool,
    },
    /// Peer grew our send window; response writing is the codec's concern,
    /// so the ingress accepts and ignores it.
    WindowUpdate {
        stream_id: StreamId,
        increment: u32,
    },
    /// Applied by the codec; surfaced only for completeness.
    Settings {
        ack: bool,
    },
    GoAway {
        last_stream_id: StreamId,
        error_code: u32,
    },
    /// Inbound push is always a protocol error on a server.
    PushPromise {
        stream_id: StreamId,
    },
    /// Accepted and ignored beyond the codec.
    Priority {
        stream_id: StreamId,
    },
}

/// Outbound frames the ingress asks the codec to write.
#[derive(Debug, PartialEq)]
pub enum OutboundFrame {
    Headers {
        stream_id: StreamId,
        status: StatusCode,
        headers: HeaderMap,
        end_stream: bool,
    },
    Data {
        stream_id: StreamId,
        payload: Bytes,
        end_stream: bool,
    },
    RstStream {
        stream_id: StreamId,
        error_code: Http2ErrorCode,
    },
    WindowUpdate {
        /// Zero addresses the connection window.
        stream_id: StreamId,
        increment: u32,
    },
    Ping {
        payload: [u8; 8],
        ack: bool,
    },
    GoAway {
        last_stream_id: StreamId,
        error_code: Http2ErrorCode,
        debug_data: Bytes,
    },
}

/// The codec boundary: one classified frame in, one frame out.
pub trait Http2FrameIo {
    fn read_frame(&mut self) -> impl Future<Output = Option<io::Result<InboundFrame>>>;
    fn write_frame(&mut self, frame: OutboundFrame) -> impl Future<Output = io::Result<()>>;
}

/// Same-thread channel transport implementing [`Http2FrameIo`]; the peer
/// half injects inbound frames and observes outbound ones.
pub struct ChannelFrameIo {
    rx: Rx<io::Result<InboundFrame>>,
    tx: Tx<OutboundFrame>,
}

/// Test/driver half of a [`ChannelFrameIo`].
pub struct ChannelFramePeer {
    pub tx: Tx<io::Result<InboundFrame>>,
    pub rx: Rx<OutboundFrame>,
}

impl ChannelFrameIo {
    pub fn pair() -> (Self, ChannelFramePeer) {
        let (in_tx, in_rx) = channel();
        let (out_tx, out_rx) = channel();
        (
            Self {
                rx: in_rx,
                tx: out_tx,
            },
            ChannelFramePeer {
                tx: in_tx,
                rx: out_rx,
            },
        )
    }
}

impl Http2FrameIo for ChannelFrameIo {
    async fn read_frame(&mut self) -> Option<io::Result<InboundFrame>> {
        self.rx.recv().await
    }

    async fn write_frame(&mut self, frame: OutboundFrame) -> io::Result<()> {
        self.tx
            .send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "frame peer gone"))
    }
}
