use axum::{
    extract::{ConnectInfo, Path, RawQuery, State},
    http::{header, header::HeaderMap, StatusCode},
    response::IntoResponse,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use super::middleware::{ReceivedAt, RequestStart};
use crate::analytics::query::utm_from_url;
use crate::analytics::recorder::{self, EventCapture};
use crate::analytics::GeoIpService;
use crate::auth::IdentityResolver;
use crate::config::AnalyticsConfig;
use crate::fanout::{FanoutEvent, FanoutHandle};
use crate::models::EventKind;
use crate::storage::Storage;

pub struct RedirectState {
    pub storage: Arc<dyn Storage>,
    pub geoip: GeoIpService,
    pub fanout: FanoutHandle,
    pub identity: Arc<IdentityResolver>,
    pub analytics: AnalyticsConfig,
}

/// Resolve an alias and redirect to its target URL.
pub async fn redirect(
    State(state): State<Arc<RedirectState>>,
    Path(alias): Path<String>,
    Extension(RequestStart(request_start)): Extension<RequestStart>,
    Extension(ReceivedAt(received_at)): Extension<ReceivedAt>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> impl IntoResponse {
    let handler_start = Instant::now();

    // Get link with lookup metadata
    let lookup = match state.storage.link_with_metadata(&alias).await {
        Ok(lookup) => lookup,
        Err(err) => {
            tracing::error!(alias = %alias, error = %err, "link lookup failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response();
        }
    };

    let cache_hit = lookup.metadata.cache_hit;
    let db_time_ms = lookup
        .metadata
        .db_duration
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    // Missing, deactivated and expired all answer the same way so callers
    // cannot probe which aliases exist.
    let link = match lookup.link {
        Some(link) if link.is_resolvable(received_at) => link,
        _ => return (StatusCode::NOT_FOUND, "Link not found or expired").into_response(),
    };

    if let Err(err) = state.storage.increment_clicks(&alias, 1).await {
        tracing::warn!(alias = %alias, error = %err, "failed to buffer click increment");
    }

    // Record the click off the request path, the redirect never waits on it.
    if state.analytics.enabled {
        let user_id = state.identity.resolve(&headers);
        let capture = EventCapture::from_request(
            &headers,
            addr.ip(),
            query.as_deref(),
            received_at,
            user_id,
            &state.analytics,
        );
        recorder::record_detached(
            Arc::clone(&state.storage),
            state.geoip.clone(),
            state.fanout.clone(),
            capture,
            EventKind::Click,
            Some(link.id),
            Some(alias.clone()),
            state.analytics.session_timeout_secs,
        );
    }

    let handler_time = handler_start.elapsed();
    let total_time = request_start.elapsed();

    // Create headers with tracing info
    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        "x-hoplink-cache-hit",
        if cache_hit { "true" } else { "false" }.parse().unwrap(),
    );
    response_headers.insert(
        "x-hoplink-timing-total-ms",
        total_time.as_millis().to_string().parse().unwrap(),
    );
    response_headers.insert(
        "x-hoplink-timing-db-ms",
        db_time_ms.to_string().parse().unwrap(),
    );
    response_headers.insert(
        "x-hoplink-timing-handler-ms",
        handler_time.as_millis().to_string().parse().unwrap(),
    );

    // Redirect with the link's own status. axum's Redirect helpers answer
    // 307/308, which changes caching semantics, so the response is built
    // by hand.
    let location = match header::HeaderValue::from_str(&link.target_url) {
        Ok(location) => location,
        Err(_) => {
            tracing::error!(alias = %alias, "stored target URL is not a valid Location value");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response();
        }
    };
    response_headers.insert(header::LOCATION, location);

    (link.redirect_mode().status(), response_headers).into_response()
}

/// Body posted by the tracking snippet for a page visit.
#[derive(Debug, Deserialize)]
pub struct VisitPayload {
    pub page_url: String,
    pub referrer: Option<String>,
    pub device_id: Option<String>,
    pub screen_width: Option<i64>,
    pub screen_height: Option<i64>,
    pub device_memory: Option<f64>,
    pub platform: Option<String>,
    pub timezone: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TrackResponse {
    pub recorded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_session: Option<bool>,
}

impl TrackResponse {
    fn not_recorded() -> Self {
        TrackResponse {
            recorded: false,
            device_id: None,
            session_id: None,
            new_session: None,
        }
    }
}

/// Record a page visit posted by the tracking snippet.
///
/// Unlike clicks this records inline, the snippet wants the device and
/// session ids back so it can carry them across page loads.
pub async fn track_visit(
    State(state): State<Arc<RedirectState>>,
    Extension(ReceivedAt(received_at)): Extension<ReceivedAt>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<VisitPayload>,
) -> impl IntoResponse {
    if !state.analytics.enabled {
        return (StatusCode::ACCEPTED, Json(TrackResponse::not_recorded())).into_response();
    }

    let user_id = state.identity.resolve(&headers);
    let mut capture =
        EventCapture::from_request(&headers, addr.ip(), None, received_at, user_id, &state.analytics);
    apply_payload(&mut capture, payload);

    match recorder::record(
        state.storage.as_ref(),
        &state.geoip,
        capture,
        EventKind::Visit,
        None,
        state.analytics.session_timeout_secs,
    )
    .await
    {
        Ok((outcome, event)) => {
            state
                .fanout
                .publish(FanoutEvent::new(EventKind::Visit, None, None, &outcome, &event));
            (
                StatusCode::ACCEPTED,
                Json(TrackResponse {
                    recorded: true,
                    device_id: Some(outcome.device_key),
                    session_id: Some(outcome.session_id),
                    new_session: Some(outcome.new_session),
                }),
            )
                .into_response()
        }
        Err(err) => {
            // Visitor tracking is best effort, a storage failure never
            // fails the request.
            tracing::error!(error = %err, "failed to record visit");
            (StatusCode::ACCEPTED, Json(TrackResponse::not_recorded())).into_response()
        }
    }
}

/// Body fields win over whatever the headers carried. The snippet reads
/// these straight off the browser, headers are the fallback path.
fn apply_payload(capture: &mut EventCapture, payload: VisitPayload) {
    capture.utm = utm_from_url(&payload.page_url);
    capture.page_url = Some(payload.page_url);

    if payload.referrer.as_deref().is_some_and(|r| !r.is_empty()) {
        capture.referrer = payload.referrer;
    }
    if payload.device_id.as_deref().is_some_and(|d| !d.is_empty()) {
        capture.signals.client_device_id = payload.device_id;
    }
    if let Some(w) = payload.screen_width {
        capture.signals.screen_width = Some(w.to_string());
    }
    if let Some(h) = payload.screen_height {
        capture.signals.screen_height = Some(h.to_string());
    }
    if let Some(m) = payload.device_memory {
        capture.signals.device_memory = Some(m.to_string());
    }
    if payload.platform.is_some() {
        capture.signals.platform = payload.platform;
    }
    if payload.timezone.is_some() {
        capture.signals.timezone = payload.timezone;
    }
    if payload.language.is_some() {
        capture.signals.language = payload.language;
    }
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    #[derive(Serialize)]
    struct HealthResponse {
        status: String,
    }

    Json(HealthResponse {
        status: "OK".to_string(),
    })
}
