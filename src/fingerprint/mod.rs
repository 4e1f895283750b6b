use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

/// Signals that feed the device fingerprint. Values stay in their captured
/// string form so the same signal hashes identically whether it arrived as a
/// header or a tracking payload field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceSignals {
    pub user_agent: Option<String>,
    pub screen_width: Option<String>,
    pub screen_height: Option<String>,
    pub device_memory: Option<String>,
    pub platform: Option<String>,
    pub timezone: Option<String>,
    pub language: Option<String>,
    pub ip: Option<String>,
    /// Client-supplied device id, the last fingerprint component and also
    /// part of the identity key in its own right.
    pub client_device_id: Option<String>,
}

const SIGNAL_DELIMITER: &str = "|";

impl DeviceSignals {
    /// Capture signals from request headers. Custom `x-` headers are set by
    /// the tracking snippet; the client-hint fallbacks cover plain redirects.
    pub fn from_headers(headers: &HeaderMap, ip: Option<&str>) -> Self {
        DeviceSignals {
            user_agent: header_str(headers, "user-agent"),
            screen_width: header_str(headers, "x-screen-width"),
            screen_height: header_str(headers, "x-screen-height"),
            device_memory: header_str(headers, "x-device-memory")
                .or_else(|| header_str(headers, "device-memory")),
            platform: header_str(headers, "x-platform")
                .or_else(|| header_str(headers, "sec-ch-ua-platform").map(strip_quotes)),
            timezone: header_str(headers, "x-timezone"),
            language: header_str(headers, "accept-language"),
            ip: ip.map(|s| s.to_string()),
            client_device_id: header_str(headers, "x-device-id"),
        }
    }

    /// SHA-256 over the signals in fixed order, joined with a fixed
    /// delimiter. Absent signals are skipped entirely, so a device that never
    /// reports screen size hashes the same on every request.
    pub fn fingerprint(&self) -> String {
        let parts: Vec<&str> = [
            self.user_agent.as_deref(),
            self.screen_width.as_deref(),
            self.screen_height.as_deref(),
            self.device_memory.as_deref(),
            self.platform.as_deref(),
            self.timezone.as_deref(),
            self.language.as_deref(),
            self.ip.as_deref(),
            self.client_device_id.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect();

        let mut hasher = Sha256::new();
        hasher.update(parts.join(SIGNAL_DELIMITER).as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn screen_width_i64(&self) -> Option<i64> {
        self.screen_width.as_deref().and_then(|s| s.parse().ok())
    }

    pub fn screen_height_i64(&self) -> Option<i64> {
        self.screen_height.as_deref().and_then(|s| s.parse().ok())
    }

    pub fn device_memory_f64(&self) -> Option<f64> {
        self.device_memory.as_deref().and_then(|s| s.parse().ok())
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn strip_quotes(value: String) -> String {
    value.trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let signals = DeviceSignals {
            user_agent: Some("Mozilla/5.0".to_string()),
            screen_width: Some("1920".to_string()),
            screen_height: Some("1080".to_string()),
            device_memory: Some("8".to_string()),
            platform: Some("macOS".to_string()),
            timezone: Some("Europe/Berlin".to_string()),
            language: Some("de-DE".to_string()),
            ip: Some("203.0.113.7".to_string()),
            client_device_id: None,
        };
        assert_eq!(signals.fingerprint(), signals.fingerprint());
        assert_eq!(signals.fingerprint().len(), 64);
        assert!(signals
            .fingerprint()
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_fingerprint_changes_with_any_signal() {
        let base = DeviceSignals {
            user_agent: Some("Mozilla/5.0".to_string()),
            ip: Some("203.0.113.7".to_string()),
            ..Default::default()
        };
        let other_ua = DeviceSignals {
            user_agent: Some("curl/8.0".to_string()),
            ..base.clone()
        };
        let other_ip = DeviceSignals {
            ip: Some("203.0.113.8".to_string()),
            ..base.clone()
        };
        let with_client_id = DeviceSignals {
            client_device_id: Some("dev-1".to_string()),
            ..base.clone()
        };
        assert_ne!(base.fingerprint(), other_ua.fingerprint());
        assert_ne!(base.fingerprint(), other_ip.fingerprint());
        assert_ne!(base.fingerprint(), with_client_id.fingerprint());
    }

    #[test]
    fn test_absent_signals_are_skipped_not_empty() {
        // Skipping absent signals means only present values are joined, so a
        // delimiter embedded in one signal lines up with two adjacent ones.
        let joined = DeviceSignals {
            user_agent: Some("a|b".to_string()),
            ..Default::default()
        };
        let split = DeviceSignals {
            user_agent: Some("a".to_string()),
            platform: Some("b".to_string()),
            ..Default::default()
        };
        let empty_slot = DeviceSignals {
            user_agent: Some("a".to_string()),
            screen_width: Some("".to_string()),
            platform: Some("b".to_string()),
            ..Default::default()
        };
        assert_eq!(joined.fingerprint(), split.fingerprint());
        // An explicit empty string still occupies a slot; only `None` skips.
        assert_ne!(split.fingerprint(), empty_slot.fingerprint());
    }

    #[test]
    fn test_from_headers_captures_and_trims() {
        let mut headers = HeaderMap::new();
        headers.insert("user-agent", HeaderValue::from_static("Mozilla/5.0"));
        headers.insert("x-screen-width", HeaderValue::from_static(" 1920 "));
        headers.insert("x-screen-height", HeaderValue::from_static("1080"));
        headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"Linux\""));
        headers.insert("x-timezone", HeaderValue::from_static("UTC"));
        headers.insert("accept-language", HeaderValue::from_static("en-US,en;q=0.9"));
        headers.insert("x-device-id", HeaderValue::from_static("dev-42"));

        let signals = DeviceSignals::from_headers(&headers, Some("198.51.100.4"));
        assert_eq!(signals.user_agent.as_deref(), Some("Mozilla/5.0"));
        assert_eq!(signals.screen_width.as_deref(), Some("1920"));
        assert_eq!(signals.screen_width_i64(), Some(1920));
        assert_eq!(signals.platform.as_deref(), Some("Linux"));
        assert_eq!(signals.ip.as_deref(), Some("198.51.100.4"));
        assert_eq!(signals.client_device_id.as_deref(), Some("dev-42"));
        assert_eq!(signals.device_memory, None);
    }

    #[test]
    fn test_empty_header_values_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert("x-timezone", HeaderValue::from_static("  "));
        let signals = DeviceSignals::from_headers(&headers, None);
        assert_eq!(signals.timezone, None);
        assert_eq!(signals.ip, None);
    }
}
