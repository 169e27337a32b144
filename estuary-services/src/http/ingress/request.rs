//! Per-stream request state.
use std::{cell::RefCell, rc::Rc};

use estuary_core::http::body::{BodyError, BodySender};
use http::HeaderMap;

use super::frame::StreamId;

/// Inbound lifecycle of one decoded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Headers received, body may still arrive.
    Open,
    /// Response completed while the peer may still send; the reading side
    /// auto-aborts after the configured delay.
    HalfClosed,
    /// Reading side torn down; further DATA is returned to flow control.
    Aborted,
    /// Inbound side complete (END_STREAM, reset, or error). Terminal; close
    /// is idempotent.
    Closed,
}

/// The ingress-side record of one stream's request.
///
/// Shared between the stream map and the connection driver via
/// [`RequestHandle`]; all access stays on the connection's reactor thread.
#[derive(Debug)]
pub struct DecodedHttpRequest {
    pub stream_id: StreamId,
    pub request_id: u64,
    state: StreamState,
    pub transferred_bytes: u64,
    pub max_request_length: u64,
    /// Set by the driver when response frames start flowing; gates the
    /// over-length handling between "413 + RST" and "silent abort".
    pub response_started: bool,
    close_reason: Option<BodyError>,
}

pub type RequestHandle = Rc<RefCell<DecodedHttpRequest>>;

impl DecodedHttpRequest {
    /// `end_stream` at HEADERS closes the inbound side at birth; that is
    /// the request's one close.
    pub fn new(
        stream_id: StreamId,
        request_id: u64,
        max_request_length: u64,
        end_stream: bool,
    ) -> Self {
        Self {
            stream_id,
            request_id,
            state: if end_stream {
                StreamState::Closed
            } else {
                StreamState::Open
            },
            transferred_bytes: 0,
            max_request_length,
            response_started: false,
            close_reason: None,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// Over-length check; `0` means unlimited.
    pub fn exceeds_length(&self) -> bool {
        self.max_request_length > 0 && self.transferred_bytes > self.max_request_length
    }

    /// Response done, inbound still open; the auto-abort timer owns the
    /// stream now.
    pub fn half_close(&mut self) {
        if self.state == StreamState::Open {
            self.state = StreamState::HalfClosed;
        }
    }

    /// Tear down the reading side but keep an in-progress response alive.
    pub fn abort(&mut self) {
        if matches!(self.state, StreamState::Open | StreamState::HalfClosed) {
            self.state = StreamState::Aborted;
        }
    }

    /// Idempotent close; returns whether this call performed the close.
    pub fn close(&mut self, reason: Option<BodyError>) -> bool {
        if self.state == StreamState::Closed {
            return false;
        }
        self.state = StreamState::Closed;
        self.close_reason = reason;
        true
    }

    pub fn close_reason(&self) -> Option<&BodyError> {
        self.close_reason.as_ref()
    }
}

/// A stream map entry: the request record plus its body feed.
pub struct StreamEntry {
    pub handle: RequestHandle,
    body: Option<BodySender>,
}

impl StreamEntry {
    pub fn new(handle: RequestHandle, body: Option<BodySender>) -> Self {
        Self { handle, body }
    }

    pub fn body(&self) -> Option<&BodySender> {
        self.body.as_ref()
    }

    pub fn send_trailers(&self, trailers: HeaderMap) -> bool {
        match &self.body {
            Some(sender) => {
                sender.send_trailers(trailers);
                true
            }
            None => false,
        }
    }

    /// Fail and drop the body feed without closing the request record;
    /// used when the reading side aborts under an in-progress response.
    pub fn close_body(&mut self, err: BodyError) {
        if let Some(sender) = self.body.take() {
            sender.fail(err);
        }
    }

    /// Close the entry: mark the request closed and finish (or fail) the
    /// body stream. Safe to call more than once.
    pub fn close(&mut self, reason: Option<BodyError>) -> bool {
        let closed = self.handle.borrow_mut().close(reason.clone());
        if let Some(sender) = self.body.take() {
            if let Some(err) = reason {
                sender.fail(err);
            }
            // dropping the sender completes the stream
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_is_idempotent() {
        let mut request = DecodedHttpRequest::new(1, 1, 0, false);
        assert!(request.close(Some(BodyError::Reset)));
        assert!(!request.close(None));
        assert_eq!(request.close_reason(), Some(&BodyError::Reset));
        assert!(request.is_closed());
    }

    #[test]
    fn end_stream_at_headers_closes_at_birth() {
        let mut request = DecodedHttpRequest::new(3, 1, 0, true);
        assert_eq!(request.state(), StreamState::Closed);
        assert!(!request.close(None));
    }

    #[test]
    fn abort_only_from_live_states() {
        let mut request = DecodedHttpRequest::new(1, 1, 0, false);
        request.abort();
        assert_eq!(request.state(), StreamState::Aborted);
        request.close(None);
        request.abort();
        assert_eq!(request.state(), StreamState::Closed);
    }
}
