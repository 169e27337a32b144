//! Request and response body plumbing.
//!
//! A streamed request body is a same-thread channel fed by the protocol
//! ingress. Each [`Chunk`] carries an optional window-release hook: the
//! HTTP/2 flow controller only issues WINDOW_UPDATE for bytes whose chunk
//! has actually been consumed (dropped) by the handler, which is what gives
//! the body stream back-pressure.
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use http::HeaderMap;
use local_sync::mpsc::unbounded::{channel, Rx, Tx};

/// Hook invoked with the number of bytes released back to flow control.
pub type WindowRelease = Rc<dyn Fn(usize)>;

/// One body payload, retained from a DATA frame.
pub struct Chunk {
    data: Bytes,
    release: Option<(WindowRelease, usize)>,
}

impl Chunk {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            release: None,
        }
    }

    /// The release hook fires with the frame's flow-controlled length
    /// (payload + padding), which may exceed `data.len()`.
    pub fn with_release(data: Bytes, flow_len: usize, release: WindowRelease) -> Self {
        Self {
            data,
            release: Some((release, flow_len)),
        }
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Consume the chunk, releasing its window immediately.
    pub fn into_bytes(mut self) -> Bytes {
        if let Some((f, n)) = self.release.take() {
            f(n);
        }
        std::mem::take(&mut self.data)
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if let Some((f, n)) = self.release.take() {
            f(n);
        }
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk").field("len", &self.data.len()).finish()
    }
}

/// Why a body stream ended abnormally.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BodyError {
    #[error("stream reset by peer")]
    Reset,
    #[error("request cancelled")]
    Cancelled,
    #[error("content too large")]
    ContentTooLarge,
    #[error("closed stream")]
    Closed,
}

enum BodyItem {
    Data(Chunk),
    Trailers(HeaderMap),
}

/// Producing side of a streamed body, owned by the protocol ingress.
pub struct BodySender {
    tx: Tx<Result<BodyItem, BodyError>>,
}

impl BodySender {
    /// Returns `Err` when the reading side is gone; the chunk is dropped,
    /// which still releases its window.
    pub fn send_data(&self, chunk: Chunk) -> Result<(), BodyError> {
        self.tx
            .send(Ok(BodyItem::Data(chunk)))
            .map_err(|_| BodyError::Closed)
    }

    pub fn send_trailers(&self, trailers: HeaderMap) {
        let _ = self.tx.send(Ok(BodyItem::Trailers(trailers)));
    }

    pub fn fail(&self, err: BodyError) {
        let _ = self.tx.send(Err(err));
    }
}

/// Consuming side of a streamed body.
pub struct BodyStream {
    rx: Rx<Result<BodyItem, BodyError>>,
    trailers: Option<HeaderMap>,
    failed: Option<BodyError>,
}

impl BodyStream {
    pub fn channel() -> (BodySender, BodyStream) {
        let (tx, rx) = channel();
        (
            BodySender { tx },
            BodyStream {
                rx,
                trailers: None,
                failed: None,
            },
        )
    }

    /// Next data chunk; `None` means the body completed normally. Trailers
    /// are captured aside and available via [`BodyStream::trailers`] after
    /// completion.
    pub async fn next_data(&mut self) -> Option<Result<Chunk, BodyError>> {
        if let Some(err) = &self.failed {
            return Some(Err(err.clone()));
        }
        loop {
            match self.rx.recv().await {
                Some(Ok(BodyItem::Data(chunk))) => return Some(Ok(chunk)),
                Some(Ok(BodyItem::Trailers(t))) => {
                    self.trailers = Some(t);
                    continue;
                }
                Some(Err(e)) => {
                    self.failed = Some(e.clone());
                    return Some(Err(e));
                }
                None => return None,
            }
        }
    }

    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }
}

impl std::fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyStream").finish_non_exhaustive()
    }
}

/// Request body as seen by handlers.
#[derive(Debug)]
pub enum RequestBody {
    Empty,
    Full(Bytes),
    Streamed(BodyStream),
}

impl RequestBody {
    pub fn full(data: Bytes) -> Self {
        if data.is_empty() {
            Self::Empty
        } else {
            Self::Full(data)
        }
    }

    /// Buffer the body to completion, replacing `self` with the aggregated
    /// form. `limit == 0` means unlimited.
    pub async fn aggregate(&mut self, limit: u64) -> Result<Bytes, BodyError> {
        match self {
            RequestBody::Empty => Ok(Bytes::new()),
            RequestBody::Full(data) => Ok(data.clone()),
            RequestBody::Streamed(stream) => {
                let mut buf = BytesMut::new();
                while let Some(item) = stream.next_data().await {
                    let chunk = item?;
                    if limit > 0 && (buf.len() + chunk.len()) as u64 > limit {
                        return Err(BodyError::ContentTooLarge);
                    }
                    buf.extend_from_slice(&chunk.into_bytes());
                }
                let data = buf.freeze();
                *self = RequestBody::full(data.clone());
                Ok(data)
            }
        }
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        Self::Empty
    }
}

/// Response body; responses are rendered from buffered bytes.
#[derive(Debug, Clone, Default)]
pub enum ResponseBody {
    #[default]
    Empty,
    Full(Bytes),
}

impl ResponseBody {
    pub fn len(&self) -> usize {
        match self {
            ResponseBody::Empty => 0,
            ResponseBody::Full(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            ResponseBody::Empty => Bytes::new(),
            ResponseBody::Full(b) => b,
        }
    }
}

impl From<Bytes> for ResponseBody {
    fn from(value: Bytes) -> Self {
        if value.is_empty() {
            Self::Empty
        } else {
            Self::Full(value)
        }
    }
}

impl From<&'static str> for ResponseBody {
    fn from(value: &'static str) -> Self {
        Bytes::from_static(value.as_bytes()).into()
    }
}

impl From<String> for ResponseBody {
    fn from(value: String) -> Self {
        Bytes::from(value).into()
    }
}
