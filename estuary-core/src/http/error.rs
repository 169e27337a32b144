//! The dispatch error model.
//!
//! Errors thread through the dispatch chain as values; nothing unwinds past
//! the dispatch boundary. Decorators may intercept a [`DispatchError`] via
//! their `handle_error` hook; whatever reaches the end of the chain is
//! rendered by [`DispatchError::to_response`].
use http::{header, HeaderValue, StatusCode};

use super::{
    body::{BodyError, ResponseBody},
    HttpResponse,
};
use crate::AnyError;

/// Why a request was cancelled before completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelKind {
    /// RST_STREAM received from the peer.
    Reset,
    /// Transport-level connection loss.
    ConnectionClosed,
    /// Connection idle timeout fired.
    IdleTimeout,
}

impl std::fmt::Display for CancelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelKind::Reset => write!(f, "stream reset"),
            CancelKind::ConnectionClosed => write!(f, "connection closed"),
            CancelKind::IdleTimeout => write!(f, "idle timeout"),
        }
    }
}

/// Request-scoped error surfaced by routing, ingress, or handlers.
///
/// Every variant maps to one response status; none of them tears down the
/// connection.
#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("not acceptable")]
    NotAcceptable,
    #[error("unsupported media type")]
    UnsupportedMediaType,
    #[error("no route matched")]
    NotFound,
    #[error("content too large")]
    PayloadTooLarge,
    #[error("unsupported expectation")]
    ExpectationFailed,
    #[error("request timed out")]
    RequestTimeout,
    #[error("request cancelled: {0}")]
    Cancelled(CancelKind),
    #[error("internal error: {0}")]
    Internal(#[from] AnyError),
}

impl From<BodyError> for DispatchError {
    fn from(err: BodyError) -> Self {
        match err {
            BodyError::ContentTooLarge => DispatchError::PayloadTooLarge,
            BodyError::Reset => DispatchError::Cancelled(CancelKind::Reset),
            BodyError::Cancelled | BodyError::Closed => {
                DispatchError::Cancelled(CancelKind::ConnectionClosed)
            }
        }
    }
}

/// Non-standard status used for requests the client abandoned.
const CLIENT_CLOSED_REQUEST: u16 = 499;

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DispatchError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            DispatchError::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
            DispatchError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            DispatchError::NotFound => StatusCode::NOT_FOUND,
            DispatchError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            DispatchError::ExpectationFailed => StatusCode::EXPECTATION_FAILED,
            DispatchError::RequestTimeout => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::Cancelled(_) => {
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST)
            }
            DispatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render the error as a plain-text response. Detail beyond the status
    /// line is only included when `verbose` is set.
    pub fn to_response(&self, verbose: bool) -> HttpResponse {
        let status = self.status();
        let body = if verbose {
            format!("{}\n{}", status, self)
        } else {
            status.to_string()
        };
        let mut response = http::Response::builder()
            .status(status)
            .body(ResponseBody::from(body))
            .expect("static response build");
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}

/// Service-stack errors that know how to render themselves as a response.
///
/// Returning `None` means the error is fatal for the connection and must
/// propagate to the connection loop instead.
pub trait HttpError {
    fn to_response(&self) -> Option<HttpResponse>;
}

impl HttpError for DispatchError {
    fn to_response(&self) -> Option<HttpResponse> {
        Some(DispatchError::to_response(self, false))
    }
}
