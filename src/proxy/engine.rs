use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{ConnectInfo, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ProxyError, Result as ProxyResult};
use crate::gate::{VisitorGate, VisitorIdentity};
use crate::observability::{ActivityLog, ActivityStatus, AttemptGuard, MetricsCollector};
use super::{
    charset::{corrected_content_type, decode_text, encode_text, resolve_charset},
    decode::{decode_body, Decoded},
    emit::{emit_buffered, emit_rewritten, emit_streaming, forwarded_headers},
    rewrite::{ContentKind, LocationRewrite, RewriteContext},
    target::{proxy_link, validate_target, ProxyForm, ProxyQuery},
    upstream::{BufferedResponse, Buffering, OutboundPolicy, UpstreamFetcher},
    ProxyRequest,
};

/// The browsing proxy: validates, gates, fetches, rewrites and logs.
pub struct BrowsingProxy {
    config: Config,
    fetcher: UpstreamFetcher,
    gate: Arc<dyn VisitorGate>,
    activity: Arc<dyn ActivityLog>,
    metrics: Arc<MetricsCollector>,
}

#[derive(Clone)]
struct AppState {
    proxy: Arc<BrowsingProxy>,
}

impl BrowsingProxy {
    pub fn new(
        config: &Config,
        gate: Arc<dyn VisitorGate>,
        activity: Arc<dyn ActivityLog>,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        let fetcher = UpstreamFetcher::new(&config.upstream, config.rewrite.foreign_redirects)?;

        Ok(Self {
            config: config.clone(),
            fetcher,
            gate,
            activity,
            metrics,
        })
    }

    pub fn router(self: Arc<Self>) -> Router {
        let mut router = Router::new()
            .route(&self.config.rewrite.proxy_path, get(proxy_get).post(proxy_post))
            .route("/healthz", get(healthz));

        if self.config.metrics.enabled {
            router = router.route(&self.config.metrics.path, get(render_metrics));
        }

        router
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive())
                    .layer(TimeoutLayer::new(self.config.server.request_timeout))
                    .into_inner(),
            )
            .with_state(AppState { proxy: self })
    }

    /// Bind and serve until Ctrl-C.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", addr, e))?;

        info!(
            "Browsing proxy listening on {} (endpoint {})",
            addr, self.config.rewrite.proxy_path
        );

        axum::serve(
            listener,
            self.router().into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        Ok(())
    }

    /// `GET <proxy_path>`: fetch the target and serve it in proxied form.
    pub async fn handle_get(&self, peer: SocketAddr, query: ProxyQuery, headers: HeaderMap) -> Response {
        if is_upgrade_request(&headers) {
            return self.reject(ProxyError::UpgradeNotSupported);
        }

        let target = match validate_target(query.url.as_deref()) {
            Ok(target) => target,
            Err(e) => return self.reject(e),
        };

        let request = ProxyRequest {
            request_id: Uuid::new_v4().to_string(),
            target,
            options: query.options(),
            identity: self.identity(peer, &headers),
        };
        let proxy_base = self.proxy_base(&headers);

        self.serve(&request, &headers, &proxy_base).await
    }

    /// `POST <proxy_path>`: answer with the equivalent GET link instead of
    /// fetching.
    pub fn redirect_descriptor(&self, body: &[u8]) -> ProxyResult<Value> {
        let form: ProxyForm = serde_json::from_slice(body)?;
        let target = validate_target(form.url.as_deref())?;
        let url = proxy_link(
            &self.config.rewrite.proxy_path,
            target.as_str(),
            form.options(),
            true,
        );

        debug!("Redirect descriptor issued for {}", target);
        Ok(json!({ "success": true, "url": url }))
    }

    fn reject(&self, error: ProxyError) -> Response {
        warn!("Rejected proxy request: {}", error);
        self.metrics.record_rejection(error.error_code());
        error.into_response()
    }

    /// Run one attempt and record exactly one activity entry for it.
    #[instrument(skip(self, request, inbound, proxy_base), fields(request_id, client_ip, target))]
    async fn serve(&self, request: &ProxyRequest, inbound: &HeaderMap, proxy_base: &str) -> Response {
        tracing::Span::current()
            .record("request_id", request.request_id.as_str())
            .record("client_ip", tracing::field::display(request.identity.ip))
            .record("target", request.target.as_str());

        let guard = AttemptGuard::new(
            self.activity.clone(),
            &request.request_id,
            &request.identity,
            request.target.as_str(),
        );

        match self.run(request, inbound, proxy_base).await {
            Ok(response) => {
                let status = response.status().as_u16();
                guard.record(ActivityStatus::Success, Some(status), None).await;
                self.metrics.record_outcome(ActivityStatus::Success);
                debug!("Served {} with status {}", request.target, status);
                response
            }
            Err(e) => {
                let outcome = match e {
                    ProxyError::Blocked | ProxyError::ForeignRedirect { .. } => ActivityStatus::Blocked,
                    _ => ActivityStatus::Error,
                };
                match outcome {
                    ActivityStatus::Blocked => warn!("Request blocked: {}", e),
                    _ => error!("Proxy request failed: {}", e),
                }

                guard
                    .record(outcome, Some(e.status_code().as_u16()), Some(e.to_string()))
                    .await;
                self.metrics.record_outcome(outcome);
                e.into_response()
            }
        }
    }

    async fn run(&self, request: &ProxyRequest, inbound: &HeaderMap, proxy_base: &str) -> ProxyResult<Response> {
        if self.gate.is_blocked(&request.identity).await? {
            return Err(ProxyError::Blocked);
        }

        let policy = OutboundPolicy {
            options: request.options,
            fingerprint_header: &self.config.server.fingerprint_header,
            proxy_path: &self.config.rewrite.proxy_path,
        };

        let started = Instant::now();
        let upstream = self.fetcher.fetch(&request.target, inbound, &policy).await?;
        let status = upstream.head.status;
        self.metrics
            .record_upstream(status.as_u16(), started.elapsed().as_secs_f64());

        let context = RewriteContext::new(
            upstream.head.url.clone(),
            proxy_base,
            &self.config.rewrite.proxy_path,
            request.options,
            self.config.rewrite.foreign_redirects,
        );

        let mut headers = forwarded_headers(&upstream.head.headers, request.options);
        if let Some(location) = upstream.head.header_str(header::LOCATION) {
            match context.rewrite_location(location) {
                LocationRewrite::Rewritten(proxied) => {
                    let value = HeaderValue::from_str(&proxied)
                        .map_err(|e| ProxyError::Internal(format!("Invalid Location header: {}", e)))?;
                    headers.insert(header::LOCATION, value);
                }
                LocationRewrite::Unchanged => {}
                LocationRewrite::Blocked { origin } => {
                    return Err(ProxyError::ForeignRedirect { origin });
                }
            }
        }

        let kind = upstream
            .head
            .header_str(header::CONTENT_TYPE)
            .and_then(ContentKind::from_content_type)
            .filter(|_| has_body(status));

        let Some(kind) = kind else {
            let (_, body) = upstream.into_stream();
            self.metrics.record_emission(false);
            return Ok(emit_streaming(status, headers, body));
        };

        match upstream.buffer(self.config.rewrite.max_body_bytes).await? {
            Buffering::Oversized { body } => {
                self.metrics.record_emission(false);
                Ok(emit_streaming(status, headers, body))
            }
            Buffering::Complete(buffered) => Ok(self.rewrite_buffered(buffered, kind, &context, headers)),
        }
    }

    /// Decode, rewrite and re-encode a buffered text body. Anything that
    /// cannot be decoded is emitted exactly as received.
    fn rewrite_buffered(
        &self,
        buffered: BufferedResponse,
        kind: ContentKind,
        context: &RewriteContext,
        headers: HeaderMap,
    ) -> Response {
        let status = buffered.head.status;
        let content_encoding = buffered.head.header_str(header::CONTENT_ENCODING);

        let decoded = match decode_body(&buffered.body, content_encoding, self.config.rewrite.max_body_bytes) {
            Ok(Decoded::Plain(bytes)) => bytes,
            Ok(Decoded::Unrecognized { coding }) => {
                debug!("Unsupported content coding '{}', passing body through", coding);
                self.metrics.record_emission(false);
                return emit_buffered(status, headers, buffered.body.clone());
            }
            Ok(Decoded::Oversized { limit }) => {
                warn!("Body of {} decodes to more than {} bytes, passing body through", buffered.head.url, limit);
                self.metrics.record_decode_fallback();
                self.metrics.record_emission(false);
                return emit_buffered(status, headers, buffered.body.clone());
            }
            Err(e) => {
                warn!("{}, passing body through", e);
                self.metrics.record_decode_fallback();
                self.metrics.record_emission(false);
                return emit_buffered(status, headers, buffered.body.clone());
            }
        };

        let content_type = buffered.head.header_str(header::CONTENT_TYPE).unwrap_or("text/html");
        let encoding = resolve_charset(Some(content_type));
        let text = decode_text(&decoded, encoding);
        let rewritten = context.rewrite(kind, &text);
        let (body, emitted) = encode_text(&rewritten, encoding);
        let content_type = corrected_content_type(content_type, emitted);

        debug!(
            "Rewrote {:?} body: {} -> {} bytes ({})",
            kind,
            decoded.len(),
            body.len(),
            emitted.name()
        );
        self.metrics.record_emission(true);
        emit_rewritten(status, headers, body, &content_type)
    }

    fn identity(&self, peer: SocketAddr, headers: &HeaderMap) -> VisitorIdentity {
        let forwarded = if self.config.server.trust_forwarded_headers {
            header_str(headers, "x-forwarded-for")
                .and_then(|value| value.split(',').next())
                .and_then(|first| first.trim().parse::<IpAddr>().ok())
        } else {
            None
        };

        let fingerprint = header_str(headers, &self.config.server.fingerprint_header).map(String::from);
        VisitorIdentity::new(forwarded.unwrap_or_else(|| peer.ip()), fingerprint)
    }

    /// Scheme and authority the visitor used to reach the proxy. Empty when
    /// unknown, which yields host-relative proxied links.
    fn proxy_base(&self, headers: &HeaderMap) -> String {
        if let Some(base) = &self.config.server.public_base_url {
            return base.trim_end_matches('/').to_string();
        }

        let trusted = self.config.server.trust_forwarded_headers;
        let forwarded = |name: &str| if trusted { header_str(headers, name) } else { None };

        let host = forwarded("x-forwarded-host")
            .or_else(|| header_str(headers, "host"))
            .filter(|host| is_valid_authority(host));
        let Some(host) = host else {
            return String::new();
        };

        let scheme = match forwarded("x-forwarded-proto") {
            Some("https") => "https",
            _ => "http",
        };
        format!("{}://{}", scheme, host)
    }
}

async fn proxy_get(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    query: Option<Query<ProxyQuery>>,
    headers: HeaderMap,
) -> Response {
    let query = query.map(|Query(query)| query).unwrap_or_default();
    state.proxy.handle_get(peer, query, headers).await
}

async fn proxy_post(State(state): State<AppState>, body: Bytes) -> Response {
    match state.proxy.redirect_descriptor(&body) {
        Ok(descriptor) => Json(descriptor).into_response(),
        Err(e) => state.proxy.reject(e),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match state.proxy.metrics.render() {
        Some(text) => text.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Received shutdown signal");
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    header_str(headers, "upgrade").map_or(false, |v| v.to_ascii_lowercase().contains("websocket"))
}

/// No rewritable body accompanies 1xx, 204 and 304 responses.
fn has_body(status: StatusCode) -> bool {
    !(status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED)
}

fn is_valid_authority(host: &str) -> bool {
    !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']' | '_'))
}
