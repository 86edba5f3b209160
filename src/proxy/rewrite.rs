//! Pattern-based link rewriting for HTML, CSS and JavaScript bodies.
//!
//! Every static URL reference is resolved against the page URL and
//! re-expressed as `<proxy base><proxy path>?url=<encoded absolute URL>` so
//! that follow-up navigation keeps flowing through the proxy.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::debug;
use url::Url;

use crate::config::ForeignRedirectPolicy;
use super::target::proxy_link;
use super::ProxyOptions;

/// `src=`, `href=`, `action=` with a single- or double-quoted value.
static ATTRIBUTE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(?:src|href|action)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});

static SRCSET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bsrcset\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});

/// CSS `url(...)` in any quoting style.
static CSS_URL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\burl\(\s*(?:"([^"]*)"|'([^']*)'|([^\s"')]*))\s*\)"#).unwrap()
});

/// CSS `@import "..."` without `url()`.
static CSS_IMPORT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)@import\s+(?:"([^"]*)"|'([^']*)')"#).unwrap()
});

/// `&amp;`, `&quot;` and `&apos;` in named, decimal or hex form.
static CHAR_REF_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)&(?:(amp|#0*38|#x0*26)|(quot|#0*34|#x0*22)|(apos|#0*39|#x0*27));").unwrap()
});

/// `scheme://` prefix of an absolute URL.
static ABSOLUTE_SCHEME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.\-]*://").unwrap()
});

/// Prefixes that are never rewritten.
const SKIPPED_PREFIXES: &[&str] = &["data:", "mailto:", "#", "javascript:", "about:", "//"];

/// Which rewriting rules apply to a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    Css,
    JavaScript,
}

impl ContentKind {
    /// Classify a `Content-Type`. `None` means the body is not rewritten.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();

        match mime.as_str() {
            "text/html" => Some(ContentKind::Html),
            "text/css" => Some(ContentKind::Css),
            "application/javascript" | "text/javascript" => Some(ContentKind::JavaScript),
            _ => None,
        }
    }
}

/// Outcome of rewriting a redirect `Location`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationRewrite {
    Rewritten(String),
    Unchanged,
    Blocked { origin: String },
}

/// Per-response rewriting state.
#[derive(Debug, Clone)]
pub struct RewriteContext {
    /// Base for relative references: the URL the body was served from.
    pub page_url: Url,
    /// Scheme and authority of the proxy itself, without trailing slash.
    pub proxy_base: String,
    pub proxy_path: String,
    pub options: ProxyOptions,
    pub foreign_redirects: ForeignRedirectPolicy,
}

impl RewriteContext {
    pub fn new(
        page_url: Url,
        proxy_base: &str,
        proxy_path: &str,
        options: ProxyOptions,
        foreign_redirects: ForeignRedirectPolicy,
    ) -> Self {
        Self {
            page_url,
            proxy_base: proxy_base.trim_end_matches('/').to_string(),
            proxy_path: proxy_path.to_string(),
            options,
            foreign_redirects,
        }
    }

    /// Proxied form of an absolute URL.
    pub fn proxied(&self, absolute: &Url) -> String {
        format!(
            "{}{}",
            self.proxy_base,
            proxy_link(&self.proxy_path, absolute.as_str(), self.options, false)
        )
    }

    fn is_proxied(&self, value: &str) -> bool {
        let own = format!("{}{}", self.proxy_base, self.proxy_path);
        [own.as_str(), self.proxy_path.as_str()].iter().any(|prefix| {
            value
                .strip_prefix(prefix)
                .map_or(false, |rest| rest.is_empty() || rest.starts_with('?'))
        })
    }

    /// Resolve and proxy one link value. `None` leaves the value as it is.
    pub fn rewrite_link(&self, value: &str) -> Option<String> {
        let candidate = value.trim();
        if candidate.is_empty() || is_skipped(candidate) || self.is_proxied(candidate) {
            return None;
        }

        let resolved = match self.page_url.join(candidate) {
            Ok(url) => url,
            Err(e) => {
                debug!("Leaving unresolvable link '{}': {}", candidate, e);
                return None;
            }
        };

        if !matches!(resolved.scheme(), "http" | "https") {
            return None;
        }

        Some(self.proxied(&resolved))
    }

    /// Rewrite a redirect target, applying the foreign-origin policy to
    /// absolute targets on another origin.
    pub fn rewrite_location(&self, location: &str) -> LocationRewrite {
        let candidate = location.trim();
        if candidate.is_empty() || self.is_proxied(candidate) {
            return LocationRewrite::Unchanged;
        }

        let resolved = match self.page_url.join(candidate) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            _ => return LocationRewrite::Unchanged,
        };

        if resolved.origin() != self.page_url.origin() {
            match self.foreign_redirects {
                ForeignRedirectPolicy::Proxy => {}
                ForeignRedirectPolicy::Passthrough => return LocationRewrite::Unchanged,
                ForeignRedirectPolicy::Block => {
                    return LocationRewrite::Blocked {
                        origin: resolved.origin().ascii_serialization(),
                    }
                }
            }
        }

        LocationRewrite::Rewritten(self.proxied(&resolved))
    }

    /// Apply the rule set for `kind` to a decoded body.
    pub fn rewrite(&self, kind: ContentKind, text: &str) -> String {
        match kind {
            ContentKind::Html => {
                let out = self.rewrite_attributes(text, true);
                let out = self.rewrite_srcsets(&out);
                self.rewrite_css_urls(&out)
            }
            ContentKind::Css => {
                let out = self.rewrite_css_urls(text);
                self.rewrite_css_imports(&out)
            }
            ContentKind::JavaScript => {
                let out = self.rewrite_attributes(text, false);
                self.rewrite_css_urls(&out)
            }
        }
    }

    /// In markup, attribute values are entity-escaped and are decoded
    /// before resolution. Inside script literals they are taken as written.
    fn rewrite_attributes(&self, text: &str, markup: bool) -> String {
        ATTRIBUTE_PATTERN
            .replace_all(text, |caps: &Captures| {
                self.replace_value(caps, |value| {
                    if markup {
                        self.rewrite_link(&decode_char_refs(value))
                    } else {
                        self.rewrite_link(value)
                    }
                })
            })
            .into_owned()
    }

    fn rewrite_srcsets(&self, text: &str) -> String {
        SRCSET_PATTERN
            .replace_all(text, |caps: &Captures| self.replace_value(caps, |value| self.rewrite_srcset(value)))
            .into_owned()
    }

    fn rewrite_css_urls(&self, text: &str) -> String {
        CSS_URL_PATTERN
            .replace_all(text, |caps: &Captures| self.replace_value(caps, |value| self.rewrite_link(value)))
            .into_owned()
    }

    fn rewrite_css_imports(&self, text: &str) -> String {
        CSS_IMPORT_PATTERN
            .replace_all(text, |caps: &Captures| self.replace_value(caps, |value| self.rewrite_link(value)))
            .into_owned()
    }

    /// Rewrite each candidate of a `srcset` list, keeping descriptors and
    /// separators byte for byte.
    ///
    /// A candidate URL runs to the next whitespace, so commas inside it (as
    /// in `data:` URIs) do not split it. Trailing commas end the candidate.
    pub fn rewrite_srcset(&self, value: &str) -> Option<String> {
        let mut out = String::with_capacity(value.len());
        let mut rest = value;
        let mut changed = false;

        loop {
            let separator = rest.len()
                - rest
                    .trim_start_matches(|c: char| c.is_whitespace() || c == ',')
                    .len();
            out.push_str(&rest[..separator]);
            rest = &rest[separator..];
            if rest.is_empty() {
                break;
            }

            let token_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            let url = rest[..token_end].trim_end_matches(',');
            match self.rewrite_link(&decode_char_refs(url)) {
                Some(rewritten) => {
                    changed = true;
                    out.push_str(&rewritten);
                }
                None => out.push_str(url),
            }
            rest = &rest[url.len()..];

            if url.len() == token_end {
                let descriptor_end = rest.find(',').unwrap_or(rest.len());
                out.push_str(&rest[..descriptor_end]);
                rest = &rest[descriptor_end..];
            }
        }

        changed.then_some(out)
    }

    /// Replace the first participating value group of a match, keeping the
    /// rest of the matched text (attribute name, quotes, spacing) as is.
    fn replace_value<F>(&self, caps: &Captures, rewrite: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        let whole = caps.get(0).map_or("", |m| m.as_str());
        let Some(value) = caps.iter().skip(1).flatten().next() else {
            return whole.to_string();
        };
        let Some(replacement) = rewrite(value.as_str()) else {
            return whole.to_string();
        };

        let start = caps.get(0).map_or(0, |m| m.start());
        let (from, to) = (value.start() - start, value.end() - start);
        format!("{}{}{}", &whole[..from], replacement, &whole[to..])
    }
}

fn decode_char_refs(value: &str) -> Cow<'_, str> {
    CHAR_REF_PATTERN.replace_all(value, |caps: &Captures| {
        if caps.get(1).is_some() {
            "&"
        } else if caps.get(2).is_some() {
            "\""
        } else {
            "'"
        }
    })
}

fn is_skipped(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    SKIPPED_PREFIXES.iter().any(|prefix| lower.starts_with(prefix))
        || ABSOLUTE_SCHEME_PATTERN.is_match(value)
}
