//! Inbound flow control.
//!
//! The controller tracks window consumption for the connection and each
//! stream. Receiving DATA consumes window; the handler consuming a body
//! chunk releases it. WINDOW_UPDATE frames are emitted once the released,
//! un-acknowledged amount crosses half the initial window, which batches
//! updates without starving the peer.
use std::collections::HashMap;

use super::frame::{Http2ErrorCode, OutboundFrame, StreamId};

#[derive(Debug, Default)]
struct WindowState {
    /// Bytes received and not yet released by the consumer.
    outstanding: u64,
    /// Bytes released and not yet advertised via WINDOW_UPDATE.
    unadvertised: u64,
}

#[derive(Debug)]
pub struct InboundFlowController {
    connection: WindowState,
    streams: HashMap<StreamId, WindowState>,
    connection_window: u32,
    stream_window: u32,
}

/// Connection-fatal flow violation.
#[derive(thiserror::Error, Debug)]
#[error("inbound flow window exceeded on stream {stream_id}")]
pub struct FlowViolation {
    pub stream_id: StreamId,
}

impl FlowViolation {
    pub fn code(&self) -> Http2ErrorCode {
        Http2ErrorCode::FlowControlError
    }
}

impl InboundFlowController {
    pub fn new(connection_window: u32, stream_window: u32) -> Self {
        Self {
            connection: WindowState::default(),
            streams: HashMap::new(),
            connection_window,
            stream_window,
        }
    }

    /// Account for a received DATA frame (payload + padding).
    pub fn on_receive(&mut self, stream_id: StreamId, len: usize) -> Result<(), FlowViolation> {
        let len = len as u64;
        let conn = &mut self.connection;
        conn.outstanding += len;
        if conn.outstanding > u64::from(self.connection_window) {
            return Err(FlowViolation { stream_id: 0 });
        }
        let stream = self.streams.entry(stream_id).or_default();
        stream.outstanding += len;
        if stream.outstanding > u64::from(self.stream_window) {
            return Err(FlowViolation { stream_id });
        }
        Ok(())
    }

    /// Release consumed bytes back and collect any due WINDOW_UPDATEs.
    pub fn on_release(&mut self, stream_id: StreamId, len: usize) -> Vec<OutboundFrame> {
        let len = u64::from(len as u32);
        let mut out = Vec::new();

        let conn = &mut self.connection;
        conn.outstanding = conn.outstanding.saturating_sub(len);
        conn.unadvertised += len;
        if conn.unadvertised >= u64::from(self.connection_window / 2).max(1) {
            out.push(OutboundFrame::WindowUpdate {
                stream_id: 0,
                increment: conn.unadvertised as u32,
            });
            conn.unadvertised = 0;
        }

        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.outstanding = stream.outstanding.saturating_sub(len);
            stream.unadvertised += len;
            if stream.unadvertised >= u64::from(self.stream_window / 2).max(1) {
                out.push(OutboundFrame::WindowUpdate {
                    stream_id,
                    increment: stream.unadvertised as u32,
                });
                stream.unadvertised = 0;
            }
        }
        out
    }

    /// Forget a finished stream. Its connection-window share must already
    /// have been released by the dropped body chunks.
    pub fn on_stream_closed(&mut self, stream_id: StreamId) {
        self.streams.remove(&stream_id);
    }

    #[cfg(test)]
    fn connection_outstanding(&self) -> u64 {
        self.connection.outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_emitted_at_half_window() {
        let mut flow = InboundFlowController::new(1000, 100);
        flow.on_receive(1, 60).unwrap();

        // below both half-windows: stream half is 50, so 40 is quiet for
        // the connection (half 500) but not yet for the stream
        let frames = flow.on_release(1, 40);
        assert!(frames.is_empty());

        let frames = flow.on_release(1, 20);
        assert_eq!(
            frames,
            vec![OutboundFrame::WindowUpdate {
                stream_id: 1,
                increment: 60,
            }]
        );
        assert_eq!(flow.connection_outstanding(), 0);
    }

    #[test]
    fn connection_update_independent_of_streams() {
        let mut flow = InboundFlowController::new(100, 1000);
        for sid in [1, 3, 5] {
            flow.on_receive(sid, 20).unwrap();
        }
        let mut frames = Vec::new();
        for sid in [1, 3, 5] {
            frames.extend(flow.on_release(sid, 20));
        }
        // 60 released ≥ half the 100-byte connection window exactly once
        assert!(frames.iter().any(|f| matches!(
            f,
            OutboundFrame::WindowUpdate { stream_id: 0, increment } if *increment >= 50
        )));
    }

    #[test]
    fn violation_is_fatal() {
        let mut flow = InboundFlowController::new(100, 50);
        assert!(flow.on_receive(1, 40).is_ok());
        assert!(flow.on_receive(1, 20).is_err());
    }
}
