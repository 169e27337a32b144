//! HTTP handler contracts shared by the protocol services and user code.
//!
//! The connection-facing side mirrors the service stack model: protocol
//! services drive a chain of [`HttpHandler`]s, each wrapping an inner one.
//! The request-facing side is the dispatch contract: user services implement
//! [`ServiceHandler`], cross-cutting filters implement [`Decorator`], and a
//! per-request [`DispatchChain`] walks decorators front-to-back into the
//! selected service.
use std::future::Future;

pub mod body;
pub mod error;
pub mod handler;

pub use body::{BodyError, BodySender, BodyStream, Chunk, RequestBody, ResponseBody};
pub use error::{CancelKind, DispatchError, HttpError};
pub use handler::{
    decorator_fn, service_fn, AggregatedRequest, Decorator, DispatchChain, RequestContext,
    ServiceHandler,
};

pub type HttpRequest = http::Request<RequestBody>;
pub type HttpResponse = http::Response<ResponseBody>;

/// Accepted connection triple: (is_h2, io, connection context).
pub type HttpAccept<Stream, CX> = (bool, Stream, CX);

/// Response paired with whether the connection may serve another request.
pub type ResponseWithContinue = (HttpResponse, bool);

/// Connection-level handler chain element.
///
/// Implementors wrap an inner `HttpHandler` and transform the request, the
/// response, or both; the innermost element is the dispatch handler that
/// routes into user services.
pub trait HttpHandler<CX> {
    type Error;

    fn handle(
        &self,
        request: HttpRequest,
        ctx: CX,
    ) -> impl Future<Output = Result<ResponseWithContinue, Self::Error>>;
}
