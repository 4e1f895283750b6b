use axum::{body::Body, http::Request, middleware::Next, response::Response};
use chrono::Utc;
use std::time::Instant;

#[derive(Copy, Clone)]
pub struct RequestStart(pub Instant);

/// Server clock at request receipt, epoch seconds. Every event recorded
/// for this request carries this timestamp, client-supplied times are
/// never used.
#[derive(Copy, Clone)]
pub struct ReceivedAt(pub i64);

pub async fn record_request_start(mut request: Request<Body>, next: Next) -> Response {
    request.extensions_mut().insert(RequestStart(Instant::now()));
    request
        .extensions_mut()
        .insert(ReceivedAt(Utc::now().timestamp()));
    next.run(request).await
}
