//! Target URL validation and proxied-link construction.

use serde::Deserialize;
use url::Url;

use crate::error::{ProxyError, Result};
use super::ProxyOptions;

/// Query string of `GET <proxy_path>`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyQuery {
    pub url: Option<String>,
    pub hide_referer: Option<String>,
    pub remove_cookies: Option<String>,
}

impl ProxyQuery {
    pub fn options(&self) -> ProxyOptions {
        ProxyOptions {
            hide_referer: parse_flag(self.hide_referer.as_deref()),
            remove_cookies: parse_flag(self.remove_cookies.as_deref()),
        }
    }
}

/// JSON body of `POST <proxy_path>`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyForm {
    pub url: Option<String>,
    pub hide_referer: bool,
    pub remove_cookies: bool,
}

impl ProxyForm {
    pub fn options(&self) -> ProxyOptions {
        ProxyOptions {
            hide_referer: self.hide_referer,
            remove_cookies: self.remove_cookies,
        }
    }
}

fn parse_flag(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("true" | "1" | "yes" | "on")
    )
}

/// Parse a candidate target. Only absolute `http`/`https` URLs with a host
/// are accepted.
pub fn validate_target(raw: Option<&str>) -> Result<Url> {
    let raw = match raw.map(str::trim) {
        Some(value) if !value.is_empty() => value,
        _ => return Err(ProxyError::MissingUrl),
    };

    let url = Url::parse(raw).map_err(|e| ProxyError::InvalidUrl {
        reason: e.to_string(),
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ProxyError::InvalidUrl {
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(ProxyError::InvalidUrl {
            reason: "missing host".to_string(),
        });
    }

    Ok(url)
}

/// Build `<proxy_path>?url=<encoded target>` plus option flags.
///
/// With `explicit_flags` both flags are always written; otherwise only
/// flags that are set are carried.
pub fn proxy_link(proxy_path: &str, target: &str, options: ProxyOptions, explicit_flags: bool) -> String {
    let mut link = format!("{}?url={}", proxy_path, urlencoding::encode(target));
    if explicit_flags || options.hide_referer {
        link.push_str(&format!("&hideReferer={}", options.hide_referer));
    }
    if explicit_flags || options.remove_cookies {
        link.push_str(&format!("&removeCookies={}", options.remove_cookies));
    }
    link
}

/// If `link` points at the proxy endpoint, return the target it wraps.
pub fn unwrap_proxied(link: &str, proxy_path: &str) -> Option<String> {
    let placeholder = Url::parse("http://proxy.invalid/").ok()?;
    let parsed = placeholder.join(link).ok()?;
    if parsed.path() != proxy_path {
        return None;
    }
    parsed
        .query_pairs()
        .find(|(key, _)| key == "url")
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_http_and_https() {
        for raw in [
            "http://example.com",
            "https://example.com/page?x=1#frag",
            "  https://sub.example.org:8443/a/b  ",
            "http://127.0.0.1:8080/",
            "https://[2001:db8::1]/",
        ] {
            let url = validate_target(Some(raw)).unwrap();
            assert!(matches!(url.scheme(), "http" | "https"), "{}", raw);
        }
    }

    #[test]
    fn test_missing_input() {
        assert!(matches!(validate_target(None), Err(ProxyError::MissingUrl)));
        assert!(matches!(validate_target(Some("")), Err(ProxyError::MissingUrl)));
        assert!(matches!(validate_target(Some("   ")), Err(ProxyError::MissingUrl)));
    }

    #[test]
    fn test_rejects_invalid_input() {
        for raw in [
            "example.com",
            "/relative/path",
            "ftp://example.com/file",
            "javascript:alert(1)",
            "data:text/html,hi",
            "http://",
            "https://exa mple.com",
            "file:///etc/passwd",
        ] {
            assert!(
                matches!(validate_target(Some(raw)), Err(ProxyError::InvalidUrl { .. })),
                "{} should be rejected",
                raw
            );
        }
    }

    #[test]
    fn test_proxy_link_encodes_target() {
        let link = proxy_link(
            "/api/proxy",
            "https://example.com/path?a=1",
            ProxyOptions::default(),
            false,
        );
        assert_eq!(link, "/api/proxy?url=https%3A%2F%2Fexample.com%2Fpath%3Fa%3D1");

        let link = proxy_link("/api/proxy", "https://example.com/", ProxyOptions::default(), true);
        assert!(link.ends_with("&hideReferer=false&removeCookies=false"));

        let options = ProxyOptions { hide_referer: true, remove_cookies: false };
        let link = proxy_link("/api/proxy", "https://example.com/", options, false);
        assert!(link.ends_with("&hideReferer=true"));
    }

    #[test]
    fn test_unwrap_proxied_round_trip() {
        let target = "https://example.com/path?a=1&b=two%20words";
        let link = format!(
            "http://proxy.local{}",
            proxy_link("/api/proxy", target, ProxyOptions::default(), false)
        );
        assert_eq!(unwrap_proxied(&link, "/api/proxy").as_deref(), Some(target));
        assert_eq!(unwrap_proxied("https://example.com/other", "/api/proxy"), None);
    }

    #[test]
    fn test_query_flags() {
        let query = ProxyQuery {
            url: None,
            hide_referer: Some("TRUE".to_string()),
            remove_cookies: Some("false".to_string()),
        };
        assert_eq!(
            query.options(),
            ProxyOptions { hide_referer: true, remove_cookies: false }
        );
    }
}
