use std::error::Error as StdError;
use std::time::Instant;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use tracing::{debug, warn};
use url::Url;

use crate::config::{ForeignRedirectPolicy, UpstreamConfig};
use crate::error::{ProxyError, Result, UpstreamFailure};
use super::target::unwrap_proxied;
use super::ProxyOptions;

/// Codings the content decoder can reverse, advertised upstream.
pub const SUPPORTED_ENCODINGS: &str = "gzip, deflate, br";

pub type ByteStream = BoxStream<'static, std::result::Result<Bytes, reqwest::Error>>;

/// Inbound header policy for one outbound request.
#[derive(Debug, Clone)]
pub struct OutboundPolicy<'a> {
    pub options: ProxyOptions,
    pub fingerprint_header: &'a str,
    pub proxy_path: &'a str,
}

/// Status line and headers of an upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// URL that produced the response, after any followed redirects.
    pub url: Url,
}

impl UpstreamHead {
    pub fn header_str(&self, name: HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Upstream response whose body has not been read yet.
pub struct UpstreamResponse {
    pub head: UpstreamHead,
    response: reqwest::Response,
}

/// Upstream response with the whole body in memory.
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    pub head: UpstreamHead,
    pub body: Bytes,
}

/// Outcome of buffering a body under a size limit.
pub enum Buffering {
    Complete(BufferedResponse),
    /// The body exceeded the limit. The stream replays what was read so
    /// far followed by the rest of the body.
    Oversized { body: ByteStream },
}

impl UpstreamResponse {
    pub fn into_stream(self) -> (UpstreamHead, ByteStream) {
        (self.head, self.response.bytes_stream().boxed())
    }

    /// Read the body into memory unless it is larger than `limit` bytes.
    pub async fn buffer(mut self, limit: usize) -> Result<Buffering> {
        let declared = self.response.content_length().unwrap_or(0);
        if declared > limit as u64 {
            debug!("Body of {} declares {} bytes, streaming", self.head.url, declared);
            let (_, body) = self.into_stream();
            return Ok(Buffering::Oversized { body });
        }

        let host = host_of(&self.head.url);
        let mut buffer = BytesMut::with_capacity(declared as usize);
        loop {
            let chunk = self.response.chunk().await.map_err(|e| ProxyError::Upstream {
                host: host.clone(),
                failure: classify(&e),
            })?;
            let Some(chunk) = chunk else { break };
            buffer.extend_from_slice(&chunk);

            if buffer.len() > limit {
                debug!("Body of {} exceeded {} bytes while buffering, streaming", self.head.url, limit);
                let prefix = buffer.freeze();
                let rest = self.response.bytes_stream();
                let body = stream::once(async move { Ok(prefix) }).chain(rest).boxed();
                return Ok(Buffering::Oversized { body });
            }
        }

        Ok(Buffering::Complete(BufferedResponse {
            head: self.head,
            body: buffer.freeze(),
        }))
    }
}

fn redirect_policy(max_redirects: usize, stop_at_foreign: bool) -> reqwest::redirect::Policy {
    reqwest::redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() > max_redirects {
            return attempt.error(format!("too many redirects (max {})", max_redirects));
        }
        let foreign = attempt
            .previous()
            .last()
            .map_or(false, |previous| previous.origin() != attempt.url().origin());
        if stop_at_foreign && foreign {
            debug!("Not following redirect to foreign origin {}", attempt.url().origin().ascii_serialization());
            return attempt.stop();
        }
        attempt.follow()
    })
}

/// Issues the live GET for a proxied page or asset.
pub struct UpstreamFetcher {
    client: reqwest::Client,
}

impl UpstreamFetcher {
    /// Unless foreign redirects are proxied, a hop to another origin is not
    /// followed. The 3xx is returned instead so its `Location` goes through
    /// the foreign-redirect policy.
    pub fn new(config: &UpstreamConfig, foreign_redirects: ForeignRedirectPolicy) -> anyhow::Result<Self> {
        let redirect_policy = if config.follow_redirects {
            redirect_policy(config.max_redirects, foreign_redirects != ForeignRedirectPolicy::Proxy)
        } else {
            reqwest::redirect::Policy::none()
        };

        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .redirect(redirect_policy)
            .danger_accept_invalid_certs(config.accept_invalid_certs);

        // Only used when the visitor's browser sent no user agent.
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.as_str());
        }

        let client = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self { client })
    }

    /// Send the GET and return once response headers arrive.
    pub async fn fetch(
        &self,
        target: &Url,
        inbound: &HeaderMap,
        policy: &OutboundPolicy<'_>,
    ) -> Result<UpstreamResponse> {
        let started = Instant::now();
        let headers = outbound_headers(inbound, target, policy);

        debug!("Fetching {}", target);
        let response = self
            .client
            .get(target.clone())
            .headers(headers)
            .send()
            .await
            .map_err(|e| {
                let failure = classify(&e);
                warn!("Upstream request to {} failed ({}): {}", target, failure, e);
                ProxyError::Upstream {
                    host: host_of(target),
                    failure,
                }
            })?;

        debug!(
            "Upstream {} answered {} in {}ms",
            response.url(),
            response.status(),
            started.elapsed().as_millis()
        );

        let head = UpstreamHead {
            status: response.status(),
            headers: response.headers().clone(),
            url: response.url().clone(),
        };

        Ok(UpstreamResponse { head, response })
    }
}

/// Headers to send upstream, derived from the visitor's request.
pub fn outbound_headers(inbound: &HeaderMap, target: &Url, policy: &OutboundPolicy<'_>) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len());

    for (name, value) in inbound.iter() {
        if is_hop_by_hop_header(name)
            || *name == header::HOST
            || *name == header::CONTENT_LENGTH
            || *name == header::ACCEPT_ENCODING
            || name.as_str().starts_with("x-forwarded-")
            || name.as_str().eq_ignore_ascii_case(policy.fingerprint_header)
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static(SUPPORTED_ENCODINGS));

    if policy.options.hide_referer {
        headers.remove(header::REFERER);
        headers.remove(header::ORIGIN);
    } else {
        if headers.contains_key(header::ORIGIN) {
            match HeaderValue::from_str(&target.origin().ascii_serialization()) {
                Ok(origin) => {
                    headers.insert(header::ORIGIN, origin);
                }
                Err(_) => {
                    headers.remove(header::ORIGIN);
                }
            }
        }

        // A referer pointing at the proxy would leak the proxy's address.
        let unwrapped = headers
            .get(header::REFERER)
            .and_then(|v| v.to_str().ok())
            .map(|referer| unwrap_proxied(referer, policy.proxy_path));
        match unwrapped {
            Some(Some(original)) => match HeaderValue::from_str(&original) {
                Ok(value) => {
                    headers.insert(header::REFERER, value);
                }
                Err(_) => {
                    headers.remove(header::REFERER);
                }
            },
            Some(None) => {
                headers.remove(header::REFERER);
            }
            None => {}
        }
    }

    if policy.options.remove_cookies {
        headers.remove(header::COOKIE);
    }

    headers
}

pub fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn host_of(url: &Url) -> String {
    url.host_str().unwrap_or_default().to_string()
}

/// Map a transport error to the failure kinds surfaced to visitors.
pub fn classify(error: &reqwest::Error) -> UpstreamFailure {
    if error.is_timeout() {
        return UpstreamFailure::Timeout;
    }

    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string().to_ascii_lowercase();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return UpstreamFailure::Dns;
        }
        if text.contains("certificate") || text.contains("tls") || text.contains("handshake") {
            return UpstreamFailure::Tls;
        }
        source = cause.source();
    }

    if error.is_connect() {
        UpstreamFailure::Connect
    } else if error.is_body() || error.is_decode() {
        UpstreamFailure::Body
    } else {
        UpstreamFailure::Request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const FINGERPRINT: &str = "x-visitor-fingerprint";

    fn policy(options: ProxyOptions) -> OutboundPolicy<'static> {
        OutboundPolicy {
            options,
            fingerprint_header: FINGERPRINT,
            proxy_path: "/api/proxy",
        }
    }

    fn inbound() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("proxy.local"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip, zstd"));
        headers.insert(header::COOKIE, HeaderValue::from_static("session=abc"));
        headers.insert(header::USER_AGENT, HeaderValue::from_static("test-browser/1.0"));
        headers.insert(header::ORIGIN, HeaderValue::from_static("http://proxy.local"));
        headers.insert(
            header::REFERER,
            HeaderValue::from_static("http://proxy.local/api/proxy?url=https%3A%2F%2Fexample.com%2Fprev"),
        );
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        headers.insert(FINGERPRINT, HeaderValue::from_static("fp-1"));
        headers
    }

    fn fetcher(follow_redirects: bool) -> UpstreamFetcher {
        fetcher_with(follow_redirects, ForeignRedirectPolicy::Proxy)
    }

    fn fetcher_with(follow_redirects: bool, foreign_redirects: ForeignRedirectPolicy) -> UpstreamFetcher {
        let config = UpstreamConfig {
            follow_redirects,
            timeout: Duration::from_secs(5),
            ..UpstreamConfig::default()
        };
        UpstreamFetcher::new(&config, foreign_redirects).unwrap()
    }

    #[test]
    fn test_outbound_headers_default_policy() {
        let target = Url::parse("https://example.com/page").unwrap();
        let headers = outbound_headers(&inbound(), &target, &policy(ProxyOptions::default()));

        assert!(headers.get(header::HOST).is_none());
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("x-forwarded-for").is_none());
        assert!(headers.get(FINGERPRINT).is_none());
        assert_eq!(headers[header::ACCEPT_ENCODING], SUPPORTED_ENCODINGS);
        assert_eq!(headers[header::ORIGIN], "https://example.com");
        assert_eq!(headers[header::REFERER], "https://example.com/prev");
        assert_eq!(headers[header::COOKIE], "session=abc");
        assert_eq!(headers[header::USER_AGENT], "test-browser/1.0");
    }

    #[test]
    fn test_outbound_headers_privacy_flags() {
        let target = Url::parse("https://example.com/page").unwrap();
        let options = ProxyOptions { hide_referer: true, remove_cookies: true };
        let headers = outbound_headers(&inbound(), &target, &policy(options));

        assert!(headers.get(header::REFERER).is_none());
        assert!(headers.get(header::ORIGIN).is_none());
        assert!(headers.get(header::COOKIE).is_none());
        assert_eq!(headers[header::USER_AGENT], "test-browser/1.0");
    }

    #[test]
    fn test_non_proxied_referer_is_dropped() {
        let target = Url::parse("https://example.com/").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::REFERER, HeaderValue::from_static("http://proxy.local/"));
        let headers = outbound_headers(&headers, &target, &policy(ProxyOptions::default()));
        assert!(headers.get(header::REFERER).is_none());
    }

    #[tokio::test]
    async fn test_fetch_forwards_policy_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .and(header_exists("accept-encoding"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .expect(1)
            .mount(&server)
            .await;

        let target = Url::parse(&format!("{}/page", server.uri())).unwrap();
        let response = fetcher(true)
            .fetch(&target, &inbound(), &policy(ProxyOptions { hide_referer: false, remove_cookies: true }))
            .await
            .unwrap();
        assert_eq!(response.head.status, StatusCode::OK);

        match response.buffer(1024).await.unwrap() {
            Buffering::Complete(buffered) => assert_eq!(buffered.body, Bytes::from_static(b"hello")),
            Buffering::Oversized { .. } => panic!("small body must be buffered"),
        }

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].headers["accept-encoding"], SUPPORTED_ENCODINGS);
        assert!(requests[0].headers.get("cookie").is_none());
        assert!(requests[0].headers.get(FINGERPRINT).is_none());
    }

    #[tokio::test]
    async fn test_redirects_followed_when_enabled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/new"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string("moved"))
            .mount(&server)
            .await;

        let target = Url::parse(&format!("{}/old", server.uri())).unwrap();
        let followed = fetcher(true)
            .fetch(&target, &HeaderMap::new(), &policy(ProxyOptions::default()))
            .await
            .unwrap();
        assert_eq!(followed.head.status, StatusCode::OK);
        assert_eq!(followed.head.url.path(), "/new");

        let manual = fetcher(false)
            .fetch(&target, &HeaderMap::new(), &policy(ProxyOptions::default()))
            .await
            .unwrap();
        assert_eq!(manual.head.status, StatusCode::FOUND);
        assert_eq!(manual.head.header_str(header::LOCATION), Some("/new"));
    }

    #[tokio::test]
    async fn test_foreign_redirect_is_not_followed_unless_proxied() {
        let origin = MockServer::start().await;
        let foreign = MockServer::start().await;
        let foreign_url = format!("{}/landing", foreign.uri());
        Mock::given(method("GET"))
            .and(path("/hop"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/away"))
            .mount(&origin)
            .await;
        Mock::given(method("GET"))
            .and(path("/away"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", foreign_url.as_str()))
            .mount(&origin)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("elsewhere"))
            .mount(&foreign)
            .await;

        let target = Url::parse(&format!("{}/hop", origin.uri())).unwrap();
        for policy_kind in [ForeignRedirectPolicy::Block, ForeignRedirectPolicy::Passthrough] {
            let stopped = fetcher_with(true, policy_kind)
                .fetch(&target, &HeaderMap::new(), &policy(ProxyOptions::default()))
                .await
                .unwrap();
            assert_eq!(stopped.head.status, StatusCode::FOUND);
            assert_eq!(stopped.head.url.path(), "/away");
            assert_eq!(stopped.head.header_str(header::LOCATION), Some(foreign_url.as_str()));
        }
        assert!(foreign.received_requests().await.unwrap().is_empty());

        let followed = fetcher_with(true, ForeignRedirectPolicy::Proxy)
            .fetch(&target, &HeaderMap::new(), &policy(ProxyOptions::default()))
            .await
            .unwrap();
        assert_eq!(followed.head.status, StatusCode::OK);
        assert_eq!(followed.head.url.as_str(), foreign_url);
    }

    #[tokio::test]
    async fn test_redirect_chain_is_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/again"))
            .mount(&server)
            .await;

        let config = UpstreamConfig {
            max_redirects: 3,
            timeout: Duration::from_secs(5),
            ..UpstreamConfig::default()
        };
        let target = Url::parse(&server.uri()).unwrap();
        let result = UpstreamFetcher::new(&config, ForeignRedirectPolicy::Block)
            .unwrap()
            .fetch(&target, &HeaderMap::new(), &policy(ProxyOptions::default()))
            .await;

        assert!(matches!(result, Err(ProxyError::Upstream { .. })));
        assert_eq!(server.received_requests().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_oversized_body_is_streamed_in_full() {
        let server = MockServer::start().await;
        let body = vec![b'a'; 4096];
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let target = Url::parse(&server.uri()).unwrap();
        let response = fetcher(true)
            .fetch(&target, &HeaderMap::new(), &policy(ProxyOptions::default()))
            .await
            .unwrap();

        match response.buffer(100).await.unwrap() {
            Buffering::Oversized { body: mut stream } => {
                let mut collected = Vec::new();
                while let Some(chunk) = stream.next().await {
                    collected.extend_from_slice(&chunk.unwrap());
                }
                assert_eq!(collected, body);
            }
            Buffering::Complete(_) => panic!("body over the limit must not be buffered"),
        }
    }

    #[tokio::test]
    async fn test_refused_connection_is_connect_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = Url::parse(&format!("http://127.0.0.1:{}/", port)).unwrap();
        let result = fetcher(true)
            .fetch(&target, &HeaderMap::new(), &policy(ProxyOptions::default()))
            .await;

        match result {
            Err(ProxyError::Upstream { host, failure }) => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(failure, UpstreamFailure::Connect);
            }
            other => panic!("expected upstream failure, got {:?}", other.map(|r| r.head.status)),
        }
    }
}
