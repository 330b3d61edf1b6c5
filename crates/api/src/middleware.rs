use axum::{
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;

use conductor_observability::CorrelationContext;

use crate::context::{CORRELATION_HEADER, RequestCorrelation};

/// Resolve the request's correlation id, run the handler inside its scope
/// and echo it back on the response.
pub async fn correlation_middleware(
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let correlation = RequestCorrelation::from_header(
        req.headers()
            .get(CORRELATION_HEADER)
            .and_then(|v| v.to_str().ok()),
    );
    let id = correlation.id().clone();
    let from_caller = correlation.from_caller();
    req.extensions_mut().insert(correlation);

    let span = tracing::info_span!(
        "request",
        method = %req.method(),
        path = %req.uri().path(),
        correlation_id = %id,
        correlation_from_caller = from_caller,
    );

    let mut response = CorrelationContext::scope(id.clone(), next.run(req))
        .instrument(span)
        .await;

    if let Ok(value) = HeaderValue::from_str(id.as_str()) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}
