//! User agent classification via woothee.

use woothee::parser::Parser;

const UNKNOWN: &str = "UNKNOWN";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserAgentInfo {
    pub browser: Option<String>,
    pub os: Option<String>,
    pub device_type: Option<String>,
}

/// Parse a user agent string into browser, OS and a coarse device type
/// (`mobile`, `tablet`, `bot` or `desktop`).
pub fn parse_user_agent(ua: &str) -> UserAgentInfo {
    let parser = Parser::new();
    let Some(result) = parser.parse(ua) else {
        return UserAgentInfo::default();
    };

    let browser = (result.name != UNKNOWN).then(|| result.name.to_string());
    let os = (result.os != UNKNOWN).then(|| result.os.to_string());
    let device_type = match result.category {
        "smartphone" | "mobilephone" => Some("mobile".to_string()),
        "tablet" => Some("tablet".to_string()),
        "crawler" => Some("bot".to_string()),
        UNKNOWN => None,
        _ => Some("desktop".to_string()),
    };

    UserAgentInfo {
        browser,
        os,
        device_type,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desktop_chrome() {
        let info = parse_user_agent(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        );
        assert_eq!(info.browser.as_deref(), Some("Chrome"));
        assert_eq!(info.device_type.as_deref(), Some("desktop"));
        assert!(info.os.is_some());
    }

    #[test]
    fn test_iphone_safari_is_mobile() {
        let info = parse_user_agent(
            "Mozilla/5.0 (iPhone; CPU iPhone OS 16_0 like Mac OS X) AppleWebKit/605.1.15 \
             (KHTML, like Gecko) Version/16.0 Mobile/15E148 Safari/604.1",
        );
        assert_eq!(info.browser.as_deref(), Some("Safari"));
        assert_eq!(info.device_type.as_deref(), Some("mobile"));
    }

    #[test]
    fn test_crawler_is_bot() {
        let info = parse_user_agent(
            "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
        );
        assert_eq!(info.device_type.as_deref(), Some("bot"));
    }

    #[test]
    fn test_unparseable_yields_nothing() {
        let info = parse_user_agent("not a real user agent");
        assert!(info.browser.is_none());
        assert!(info.device_type.is_none());
    }
}
