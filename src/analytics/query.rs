//! Attribution parsing: UTM parameters from query strings and the domain
//! portion of referrer URLs.

use crate::models::UtmParams;

/// Pull the five standard UTM parameters out of a raw query string. The
/// first occurrence of each key wins, empty values count as absent.
pub fn parse_utm(query: Option<&str>) -> UtmParams {
    let mut utm = UtmParams::default();
    let Some(query) = query else {
        return utm;
    };

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        let slot = match key.as_ref() {
            "utm_source" => &mut utm.source,
            "utm_medium" => &mut utm.medium,
            "utm_campaign" => &mut utm.campaign,
            "utm_term" => &mut utm.term,
            "utm_content" => &mut utm.content,
            _ => continue,
        };
        if slot.is_none() {
            let value = value.trim();
            if !value.is_empty() {
                *slot = Some(value.to_string());
            }
        }
    }

    utm
}

/// UTM parameters embedded in a full page URL. Relative or unparseable
/// URLs yield no attribution.
pub fn utm_from_url(url: &str) -> UtmParams {
    match url::Url::parse(url) {
        Ok(parsed) => parse_utm(parsed.query()),
        Err(_) => UtmParams::default(),
    }
}

/// Extract the host from a referrer URL, dropping scheme, path, query and
/// port. Schemeless referrers are retried as http. Returns `None` when no
/// host can be found.
pub fn referrer_domain(referrer: &str) -> Option<String> {
    let referrer = referrer.trim();
    if referrer.is_empty() {
        return None;
    }

    let parsed = url::Url::parse(referrer)
        .ok()
        .filter(|u| u.has_host())
        .or_else(|| url::Url::parse(&format!("http://{referrer}")).ok())?;

    parsed.host_str().map(|h| h.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_utm_all_fields() {
        let utm = parse_utm(Some(
            "utm_source=newsletter&utm_medium=email&utm_campaign=spring%20sale\
             &utm_term=shoes&utm_content=cta+button",
        ));
        assert_eq!(utm.source.as_deref(), Some("newsletter"));
        assert_eq!(utm.medium.as_deref(), Some("email"));
        assert_eq!(utm.campaign.as_deref(), Some("spring sale"));
        assert_eq!(utm.term.as_deref(), Some("shoes"));
        assert_eq!(utm.content.as_deref(), Some("cta button"));
    }

    #[test]
    fn test_parse_utm_ignores_other_params_and_empty_values() {
        let utm = parse_utm(Some("ref=abc&utm_source=&utm_medium=social"));
        assert_eq!(utm.source, None);
        assert_eq!(utm.medium.as_deref(), Some("social"));
        assert_eq!(utm.campaign, None);
    }

    #[test]
    fn test_parse_utm_first_occurrence_wins() {
        let utm = parse_utm(Some("utm_source=first&utm_source=second"));
        assert_eq!(utm.source.as_deref(), Some("first"));
    }

    #[test]
    fn test_parse_utm_no_query() {
        assert_eq!(parse_utm(None), UtmParams::default());
    }

    #[test]
    fn test_utm_from_url() {
        let utm = utm_from_url("https://shop.example/sale?utm_source=ad&utm_medium=cpc#hero");
        assert_eq!(utm.source.as_deref(), Some("ad"));
        assert_eq!(utm.medium.as_deref(), Some("cpc"));

        assert_eq!(utm_from_url("https://shop.example/sale"), UtmParams::default());
        assert_eq!(utm_from_url("not a url"), UtmParams::default());
    }

    #[test]
    fn test_referrer_domain_standard_urls() {
        assert_eq!(
            referrer_domain("https://news.ycombinator.com/item?id=1").as_deref(),
            Some("news.ycombinator.com")
        );
        assert_eq!(
            referrer_domain("http://WWW.Example.com:8080/path").as_deref(),
            Some("www.example.com")
        );
        assert_eq!(
            referrer_domain("android-app://com.twitter.android").as_deref(),
            Some("com.twitter.android")
        );
    }

    #[test]
    fn test_referrer_domain_without_scheme() {
        assert_eq!(referrer_domain("example.com/page").as_deref(), Some("example.com"));
    }

    #[test]
    fn test_referrer_domain_ipv6() {
        assert_eq!(
            referrer_domain("http://[2001:db8::1]:8080/x").as_deref(),
            Some("[2001:db8::1]")
        );
    }

    #[test]
    fn test_referrer_domain_empty() {
        assert_eq!(referrer_domain(""), None);
        assert_eq!(referrer_domain("   "), None);
    }

    #[test]
    fn test_malformed_escapes_pass_through() {
        let utm = parse_utm(Some("utm_source=100%25done&utm_medium=bad%2"));
        assert_eq!(utm.source.as_deref(), Some("100%done"));
        assert_eq!(utm.medium.as_deref(), Some("bad%2"));
    }
}
