//! Request aggregation: buffer-to-completion for handlers that declared a
//! need for the full body or for form data.
use bytes::Bytes;
use estuary_core::{
    http::{error::DispatchError, HttpRequest},
    routing::{parse_query, AggregationStrategy},
};
use mime::Mime;

pub struct RequestAggregator;

impl RequestAggregator {
    pub fn should_aggregate(strategy: AggregationStrategy, content_type: Option<&Mime>) -> bool {
        match strategy {
            AggregationStrategy::None => false,
            AggregationStrategy::Always => true,
            AggregationStrategy::OnlyForFormData => content_type.is_some_and(|m| {
                m.essence_str() == mime::APPLICATION_WWW_FORM_URLENCODED.essence_str()
            }),
        }
    }

    /// Buffer the body in place when the strategy demands it. Returns the
    /// aggregated bytes, `None` when aggregation did not fire.
    pub async fn aggregate(
        request: &mut HttpRequest,
        strategy: AggregationStrategy,
        limit: u64,
    ) -> Result<Option<Bytes>, DispatchError> {
        let content_type = request
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<Mime>().ok());
        if !Self::should_aggregate(strategy, content_type.as_ref()) {
            return Ok(None);
        }
        let data = request.body_mut().aggregate(limit).await?;
        Ok(Some(data))
    }

    /// Decode form parameters out of an aggregated body when the request is
    /// form-encoded.
    pub fn form_params(request: &HttpRequest, body: &Bytes) -> Option<Vec<(String, String)>> {
        let content_type = request
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<Mime>().ok())?;
        if content_type.essence_str() != mime::APPLICATION_WWW_FORM_URLENCODED.essence_str() {
            return None;
        }
        let text = std::str::from_utf8(body).ok()?;
        Some(parse_query(text))
    }
}
