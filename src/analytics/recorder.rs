//! Event recording pipeline: capture request signals, enrich them, then
//! hand the event to storage for device and session resolution.

use std::net::IpAddr;
use std::sync::Arc;

use axum::http::HeaderMap;
use tracing::warn;

use crate::analytics::geoip::{self, GeoIpService};
use crate::analytics::ip_extractor::{anonymize_ip, extract_client_ip};
use crate::analytics::query::{parse_utm, referrer_domain};
use crate::analytics::ua::parse_user_agent;
use crate::config::AnalyticsConfig;
use crate::fanout::{FanoutEvent, FanoutHandle};
use crate::fingerprint::DeviceSignals;
use crate::models::{EventKind, GeoLocation, NewDevice, NewEvent, RecordOutcome, UtmParams};
use crate::storage::{Storage, StorageError};

/// Everything lifted off a request before the response goes out. Owns its
/// data so recording can continue on a detached task.
#[derive(Debug, Clone)]
pub struct EventCapture {
    pub signals: DeviceSignals,
    pub user_id: Option<String>,
    pub ip: Option<IpAddr>,
    pub geo_hint: GeoLocation,
    pub referrer: Option<String>,
    pub utm: UtmParams,
    pub page_url: Option<String>,
    /// Server clock at request receipt, epoch seconds. Client timestamps
    /// are never trusted.
    pub occurred_at: i64,
}

impl EventCapture {
    pub fn from_request(
        headers: &HeaderMap,
        socket_ip: IpAddr,
        query: Option<&str>,
        received_at: i64,
        user_id: Option<String>,
        config: &AnalyticsConfig,
    ) -> Self {
        let ip = extract_client_ip(headers, socket_ip, config);
        let ip = if config.ip_anonymization {
            anonymize_ip(ip)
        } else {
            ip
        };

        let signals = DeviceSignals::from_headers(headers, Some(&ip.to_string()));
        let referrer = headers
            .get("referer")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .filter(|s| !s.is_empty());

        EventCapture {
            signals,
            user_id,
            ip: Some(ip),
            geo_hint: geoip::from_edge_headers(headers),
            referrer,
            utm: parse_utm(query),
            page_url: None,
            occurred_at: received_at,
        }
    }
}

/// Enrich a capture and persist it. Returns the resolution outcome along
/// with the enriched event for downstream fan-out.
pub async fn record(
    storage: &dyn Storage,
    geoip: &GeoIpService,
    capture: EventCapture,
    kind: EventKind,
    link_id: Option<i64>,
    session_timeout_secs: i64,
) -> Result<(RecordOutcome, NewEvent), StorageError> {
    let ua_info = capture
        .signals
        .user_agent
        .as_deref()
        .map(parse_user_agent)
        .unwrap_or_default();

    let geo = if capture.geo_hint.is_empty() {
        capture
            .ip
            .map(|ip| geoip.lookup(ip))
            .unwrap_or_default()
    } else {
        capture.geo_hint.clone()
    };

    let ip_str = capture.ip.map(|ip| ip.to_string());

    let device = NewDevice {
        fingerprint: capture.signals.fingerprint(),
        client_id: capture.signals.client_device_id.clone(),
        user_id: capture.user_id.clone(),
        user_agent: capture.signals.user_agent.clone(),
        browser: ua_info.browser.clone(),
        device_type: ua_info.device_type.clone(),
        screen_width: capture.signals.screen_width_i64(),
        screen_height: capture.signals.screen_height_i64(),
        device_memory: capture.signals.device_memory_f64(),
        platform: capture.signals.platform.clone(),
        timezone: capture.signals.timezone.clone(),
        language: capture.signals.language.clone(),
        ip: ip_str.clone(),
    };

    let event = NewEvent {
        kind,
        link_id,
        occurred_at: capture.occurred_at,
        user_id: capture.user_id,
        ip: ip_str,
        user_agent: capture.signals.user_agent.clone(),
        browser: ua_info.browser,
        os: ua_info.os,
        device_type: ua_info.device_type,
        geo,
        referrer: capture.referrer.clone(),
        referrer_domain: capture.referrer.as_deref().and_then(referrer_domain),
        utm: capture.utm,
        page_url: capture.page_url,
    };

    let outcome = storage
        .record_event(&device, &event, session_timeout_secs)
        .await?;
    Ok((outcome, event))
}

/// Record an event on a detached task and publish it to the fan-out queue.
/// Failures are logged and contained, the caller's response is already on
/// its way out.
pub fn record_detached(
    storage: Arc<dyn Storage>,
    geoip: GeoIpService,
    fanout: FanoutHandle,
    capture: EventCapture,
    kind: EventKind,
    link_id: Option<i64>,
    alias: Option<String>,
    session_timeout_secs: i64,
) {
    tokio::spawn(async move {
        match record(
            storage.as_ref(),
            &geoip,
            capture,
            kind,
            link_id,
            session_timeout_secs,
        )
        .await
        {
            Ok((outcome, event)) => {
                fanout.publish(FanoutEvent::new(kind, alias, link_id, &outcome, &event));
            }
            Err(e) => {
                warn!(kind = kind.as_str(), "failed to record event: {}", e);
            }
        }
    });
}
