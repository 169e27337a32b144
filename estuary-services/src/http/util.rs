use bytes::Bytes;
use estuary_core::http::body::ResponseBody;
use http::{HeaderValue, Response, StatusCode};
use monoio_http::common::body::{FixedBody, HttpBody};

use crate::http::CLOSE_VALUE;

/// Bodies a canned response can be rendered into.
pub trait CannedBody {
    fn canned(data: Option<Bytes>) -> Self;
}

impl CannedBody for ResponseBody {
    fn canned(data: Option<Bytes>) -> Self {
        match data {
            Some(data) => ResponseBody::from(data),
            None => ResponseBody::Empty,
        }
    }
}

impl CannedBody for HttpBody {
    fn canned(data: Option<Bytes>) -> Self {
        HttpBody::fixed_body(data)
    }
}

/// Build an empty response with the given status; `close_conn` stamps a
/// `connection: close` header for the HTTP/1 side.
pub fn generate_response<B: CannedBody>(status: StatusCode, close_conn: bool) -> Response<B> {
    let mut builder = Response::builder().status(status);
    let headers = builder.headers_mut().expect("fresh builder");
    if close_conn {
        headers.insert(http::header::CONNECTION, CLOSE_VALUE);
    }
    headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(0usize));
    builder
        .body(B::canned(None))
        .expect("static response build")
}
