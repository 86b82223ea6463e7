use crate::auth::{SessionAuthenticator, decode_state, encode_state};
use crate::cache::{cache_duration, fingerprint, is_cacheable_request, is_cacheable_response};
use crate::metrics::{
    ACTIVE_CONNECTIONS, RATE_LIMIT_HITS, REQUESTS_TOTAL, RESPONSE_STATUS, RESPONSE_TIME, render,
};
use crate::state::{
    AUTH_CALLBACK_PATH, AUTH_LOGOUT_PATH, CACHE_STATUS_HEADER, HEALTH_PATH, METRICS_PATH,
    ProxyState,
};
use crate::utils::{UpstreamTarget, normalize_host};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use log::{info, warn};
use pingora::http::{RequestHeader, ResponseHeader};
use pingora::prelude::*;
use pingora::{Error, ErrorType};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::form_urlencoded;

const LOGIN_PAGE: &str = include_str!("../login_page.html");

/// Upstream body accumulated for the cache, together with the snapshot of
/// status and headers taken when the response head arrived.
struct Capture {
    key: String,
    ttl: Duration,
    eligible: bool,
    status: u16,
    headers: Vec<(String, String)>,
    body: BytesMut,
}

pub struct RequestCtx {
    origin: String,
    client_ip: String,
    start: Instant,
    /// True once the request passed admission and was handed to the
    /// terminal forwarder; gates the per-origin metric samples.
    dispatched: bool,
    destination: Option<String>,
    target: Option<UpstreamTarget>,
    cors_allow_origin: Option<String>,
    mark_miss: bool,
    capture: Option<Capture>,
}

/// The proxy service: front controller, host dispatcher and forwarder in
/// one `ProxyHttp` implementation.
pub struct Gateway {
    pub state: Arc<ProxyState>,
}

impl Gateway {
    fn client_ip(&self, session: &Session) -> String {
        for header in &self.state.config.ip_headers {
            if let Some(value) = session
                .req_header()
                .headers
                .get(header)
                .and_then(|v| v.to_str().ok())
                && !value.is_empty()
            {
                return value.to_string();
            }
        }
        "empty".to_string()
    }

    fn request_host(session: &Session) -> String {
        session
            .req_header()
            .headers
            .get("Host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    }

    fn request_scheme(session: &Session) -> &'static str {
        if session
            .as_downstream()
            .stream()
            .and_then(|s| s.get_ssl())
            .is_some()
        {
            "https"
        } else {
            "http"
        }
    }

    /// Origins this host answers CORS for: itself, its www variant, and
    /// every shared session domain, over both schemes.
    fn allowed_origins(&self, origin_host: &str) -> Vec<String> {
        let mut allowed = vec![
            format!("https://{}", origin_host),
            format!("http://{}", origin_host),
        ];
        if let Some(bare) = origin_host.strip_prefix("www.") {
            allowed.push(format!("https://{}", bare));
            allowed.push(format!("http://{}", bare));
        } else if !origin_host.contains(':') {
            allowed.push(format!("https://www.{}", origin_host));
            allowed.push(format!("http://www.{}", origin_host));
        }
        if let Some(sso) = &self.state.config.sso {
            for domain in &sso.shared_domains {
                allowed.push(format!("https://{}", domain));
                allowed.push(format!("http://{}", domain));
                allowed.push(format!("https://www.{}", domain));
                allowed.push(format!("http://www.{}", domain));
            }
        }
        allowed
    }

    fn cors_allow_origin(&self, origin_host: &str, request_origin: Option<&str>) -> Option<String> {
        match request_origin {
            Some(origin) if !origin.is_empty() => self
                .allowed_origins(origin_host)
                .into_iter()
                .find(|allowed| allowed == origin),
            _ => Some("*".to_string()),
        }
    }

    fn apply_cors(header: &mut ResponseHeader, allow_origin: &Option<String>) -> Result<()> {
        if let Some(origin) = allow_origin {
            header.insert_header("Access-Control-Allow-Origin", origin.clone())?;
        }
        header.insert_header(
            "Access-Control-Allow-Methods",
            "GET, POST, PUT, DELETE, OPTIONS, PATCH",
        )?;
        header.insert_header(
            "Access-Control-Allow-Headers",
            "Content-Type, Authorization, X-Requested-With, Accept, Origin",
        )?;
        header.insert_header("Access-Control-Allow-Credentials", "true")?;
        header.insert_header("Access-Control-Max-Age", "86400")?;
        Ok(())
    }

    async fn respond_text(session: &mut Session, status: u16, body: &str) -> Result<()> {
        let mut header = ResponseHeader::build(status, Some(2))?;
        header.insert_header("Content-Type", "text/plain; charset=utf-8")?;
        header.insert_header("Content-Length", body.len().to_string())?;
        session
            .write_response_header(Box::new(header), false)
            .await?;
        session
            .write_response_body(Some(Bytes::copy_from_slice(body.as_bytes())), true)
            .await?;
        Ok(())
    }

    async fn serve_login_page(
        &self,
        session: &mut Session,
        auth: &SessionAuthenticator,
        host: &str,
        redirect_url: &str,
    ) -> Result<()> {
        let state = encode_state(host);
        let auth_url = auth.login_url(&state, redirect_url);
        let body = LOGIN_PAGE.replace("{{AUTH_URL}}", &auth_url);

        let mut header = ResponseHeader::build(200, Some(8))?;
        header.insert_header("Content-Type", "text/html; charset=utf-8")?;
        header.insert_header("Content-Length", body.len().to_string())?;
        header.insert_header("X-Content-Type-Options", "nosniff")?;
        header.insert_header("X-Frame-Options", "DENY")?;
        header.insert_header(
            "Cache-Control",
            "no-store, no-cache, must-revalidate, private",
        )?;
        header.insert_header("Pragma", "no-cache")?;
        header.insert_header("Expires", "0")?;
        header.insert_header("CDN-Cache-Control", "no-store")?;
        session
            .write_response_header(Box::new(header), false)
            .await?;
        session
            .write_response_body(Some(Bytes::from(body.into_bytes())), true)
            .await?;
        Ok(())
    }

    /// OAuth callback on an auth domain: decode the state back into the
    /// target host, exchange the code, check the allowlist, issue the
    /// cross-domain cookie set and bounce to the target.
    async fn handle_callback(&self, session: &mut Session) -> Result<()> {
        let query = session.req_header().uri.query().unwrap_or("").to_string();
        let params: HashMap<String, String> =
            form_urlencoded::parse(query.as_bytes()).into_owned().collect();

        let code = params.get("code").cloned().unwrap_or_default();
        if code.is_empty() {
            return Self::respond_text(session, 400, "No code provided").await;
        }
        let state = params.get("state").cloned().unwrap_or_default();
        if state.is_empty() {
            return Self::respond_text(session, 400, "No state provided").await;
        }
        let target_host = match decode_state(&state) {
            Ok(host) => host,
            Err(_) => {
                return Self::respond_text(session, 400, "Invalid state parameter").await;
            }
        };

        let Some(auth) = &self.state.authenticator else {
            return Self::respond_text(session, 404, "Not found").await;
        };
        let Some(handler) = self.state.handler_for(normalize_host(&target_host)) else {
            let body = format!("Host ({}) not found", target_host);
            return Self::respond_text(session, 502, &body).await;
        };

        let redirect_url = handler.redirect_url.clone().unwrap_or_default();
        let user = match auth.fetch_user_info(&code, &redirect_url).await {
            Ok(user) => user,
            Err(e) => {
                warn!("callback for {} failed: {}", target_host, e);
                return Self::respond_text(session, 500, "Failed to get user info").await;
            }
        };

        if !handler.rule.allowed_emails.iter().any(|e| e == &user.email) {
            let body = format!(
                "Access denied. Email {} is not authorized to access this resource.",
                user.email
            );
            return Self::respond_text(session, 403, &body).await;
        }

        info!("login success: {} -> {}", user.email, target_host);
        let mut header = ResponseHeader::build(307, Some(4))?;
        for cookie in auth.session_cookies(&user.email) {
            header.append_header("Set-Cookie", cookie)?;
        }
        header.insert_header("Location", format!("https://{}/", target_host))?;
        header.insert_header("Content-Length", "0")?;
        session.write_response_header(Box::new(header), true).await?;
        Ok(())
    }

    async fn serve_cached(
        &self,
        session: &mut Session,
        entry: crate::cache::CacheEntry,
        allow_origin: &Option<String>,
    ) -> Result<()> {
        let mut header = ResponseHeader::build(entry.status, Some(entry.headers.len() + 8))?;
        for (name, value) in &entry.headers {
            header.append_header(name.clone(), value.clone())?;
        }
        header.insert_header(CACHE_STATUS_HEADER, "HIT")?;
        header.insert_header("Content-Length", entry.body.len().to_string())?;
        Self::apply_cors(&mut header, allow_origin)?;
        session
            .write_response_header(Box::new(header), false)
            .await?;
        session
            .write_response_body(Some(entry.body.clone()), true)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ProxyHttp for Gateway {
    type CTX = RequestCtx;

    fn new_ctx(&self) -> Self::CTX {
        RequestCtx {
            origin: String::new(),
            client_ip: String::new(),
            start: Instant::now(),
            dispatched: false,
            destination: None,
            target: None,
            cors_allow_origin: None,
            mark_miss: false,
            capture: None,
        }
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let path = session.req_header().uri.path().to_string();

        if path == HEALTH_PATH {
            Self::respond_text(session, 200, "OK").await?;
            return Ok(true);
        }
        if path == METRICS_PATH {
            let (content_type, body) = render();
            let mut header = ResponseHeader::build(200, Some(2))?;
            header.insert_header("Content-Type", content_type)?;
            header.insert_header("Content-Length", body.len().to_string())?;
            session
                .write_response_header(Box::new(header), false)
                .await?;
            session
                .write_response_body(Some(Bytes::from(body)), true)
                .await?;
            return Ok(true);
        }

        let host = Self::request_host(session);
        let host_no_port = host.split(':').next().unwrap_or("").to_string();
        ctx.client_ip = self.client_ip(session);

        // Auth-domain traffic only ever services the OAuth callback.
        if self.state.is_auth_domain(&host_no_port) {
            if path == AUTH_CALLBACK_PATH {
                self.handle_callback(session).await?;
            } else {
                Self::respond_text(session, 404, "Not found").await?;
            }
            return Ok(true);
        }

        let origin = normalize_host(&host).to_string();
        ctx.origin = origin.clone();

        let Some(handler) = self.state.handler_for(&origin) else {
            let body = format!("Host ({}) not found", origin);
            Self::respond_text(session, 502, &body).await?;
            return Ok(true);
        };

        // SSO admission.
        if handler.sso_enforced
            && let Some(auth) = &self.state.authenticator
        {
            if path == AUTH_LOGOUT_PATH {
                let mut header = ResponseHeader::build(307, Some(4))?;
                for cookie in auth.logout_cookies() {
                    header.append_header("Set-Cookie", cookie)?;
                }
                header.insert_header("Location", "/")?;
                header.insert_header("Content-Length", "0")?;
                session.write_response_header(Box::new(header), true).await?;
                return Ok(true);
            }

            let cookie_header = session
                .req_header()
                .headers
                .get("Cookie")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string());
            if !SessionAuthenticator::has_session(cookie_header.as_deref()) {
                let redirect_url = handler.redirect_url.clone().unwrap_or_default();
                self.serve_login_page(session, auth, &host, &redirect_url)
                    .await?;
                return Ok(true);
            }
        }

        // Blacklist wins over everything else; the counter is not touched.
        if handler.rule.ip_blacklist.contains(&ctx.client_ip) {
            warn!("blocked request from {} to {}", ctx.client_ip, origin);
            let body = format!("Access denied. Your IP ({}) is blocked.", ctx.client_ip);
            Self::respond_text(session, 403, &body).await?;
            return Ok(true);
        }

        if handler.limiter.observe(&ctx.client_ip) {
            RATE_LIMIT_HITS
                .with_label_values(&[&origin, &ctx.client_ip])
                .inc();
            Self::respond_text(session, 429, "Rate limit exceeded").await?;
            return Ok(true);
        }

        let request_origin = session
            .req_header()
            .headers
            .get("Origin")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        ctx.cors_allow_origin = self.cors_allow_origin(&origin, request_origin.as_deref());

        if session.req_header().method == "OPTIONS" {
            let mut header = ResponseHeader::build(204, Some(6))?;
            Self::apply_cors(&mut header, &ctx.cors_allow_origin)?;
            header.insert_header("Content-Length", "0")?;
            session.write_response_header(Box::new(header), true).await?;
            return Ok(true);
        }

        // Terminal forwarder from here on.
        let target = match &handler.upstream {
            Ok(target) => target.clone(),
            Err(e) => {
                warn!("invalid upstream for {}: {}", origin, e);
                Self::respond_text(session, 500, "Invalid target URL").await?;
                return Ok(true);
            }
        };
        ctx.destination = Some(handler.rule.destination.clone());
        ctx.target = Some(target);
        ctx.dispatched = true;
        REQUESTS_TOTAL.with_label_values(&[&origin]).inc();
        ACTIVE_CONNECTIONS.with_label_values(&[&origin]).inc();

        if handler.rule.cache_max_ttl_seconds > 0 && session.req_header().method == "GET" {
            ctx.mark_miss = true;
            let has_authorization = session.req_header().headers.get("Authorization").is_some();
            if is_cacheable_request("GET", has_authorization) {
                let path_and_query = session
                    .req_header()
                    .uri
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/")
                    .to_string();
                let key = fingerprint("GET", &origin, &path_and_query);
                if let Some(entry) = self.state.cache.lookup(&key) {
                    self.serve_cached(session, entry, &ctx.cors_allow_origin)
                        .await?;
                    return Ok(true);
                }
                ctx.capture = Some(Capture {
                    key,
                    ttl: Duration::from_secs(handler.rule.cache_max_ttl_seconds),
                    eligible: false,
                    status: 0,
                    headers: Vec::new(),
                    body: BytesMut::new(),
                });
            }
        }

        Ok(false)
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let (Some(destination), Some(target)) = (&ctx.destination, &ctx.target) else {
            return Err(Error::explain(
                ErrorType::InternalError,
                "request dispatched without upstream target",
            ));
        };
        let peer = self.state.peer_for(destination, target);
        Ok(Box::new(peer))
    }

    async fn upstream_request_filter(
        &self,
        session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let host = Self::request_host(session);
        if !host.is_empty() {
            upstream_request.insert_header("X-Forwarded-Host", host)?;
        }
        upstream_request.insert_header("X-Forwarded-Proto", Self::request_scheme(session))?;

        let forwarded_for = upstream_request
            .headers
            .get("X-Forwarded-For")
            .and_then(|v| v.to_str().ok())
            .map(|existing| format!("{}, {}", existing, ctx.client_ip))
            .unwrap_or_else(|| ctx.client_ip.clone());
        upstream_request.insert_header("X-Forwarded-For", forwarded_for)?;

        if self.state.config.transport.disable_compression {
            upstream_request.remove_header("Accept-Encoding");
        }
        Ok(())
    }

    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        if let Some(capture) = ctx.capture.as_mut() {
            let status = upstream_response.status.as_u16();
            let cache_control = upstream_response
                .headers
                .get("Cache-Control")
                .and_then(|v| v.to_str().ok());
            let ttl = cache_duration(cache_control, capture.ttl);

            if is_cacheable_response(status) && !ttl.is_zero() {
                capture.eligible = true;
                capture.ttl = ttl;
                capture.status = status;
                // Owned snapshot, taken before the proxy-added headers.
                capture.headers = upstream_response
                    .headers
                    .iter()
                    .filter(|(name, _)| {
                        !matches!(
                            name.as_str().to_ascii_lowercase().as_str(),
                            "connection" | "keep-alive" | "transfer-encoding" | "content-length"
                        )
                    })
                    .map(|(name, value)| {
                        (
                            name.as_str().to_string(),
                            String::from_utf8_lossy(value.as_bytes()).to_string(),
                        )
                    })
                    .collect();
            } else {
                ctx.capture = None;
            }
        }

        if ctx.mark_miss {
            upstream_response.insert_header(CACHE_STATUS_HEADER, "MISS")?;
        }
        if ctx.dispatched {
            Self::apply_cors(upstream_response, &ctx.cors_allow_origin)?;
        }
        Ok(())
    }

    fn response_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<Option<Duration>> {
        let mut complete = false;
        if let Some(capture) = ctx.capture.as_mut() {
            if capture.eligible {
                if let Some(chunk) = body {
                    capture.body.extend_from_slice(chunk);
                }
                complete = end_of_stream;
            }
        }
        if complete && let Some(capture) = ctx.capture.take() {
            self.state.cache.store(
                capture.key,
                capture.body.freeze(),
                capture.status,
                capture.headers,
                capture.ttl,
            );
        }
        Ok(None)
    }

    async fn logging(&self, session: &mut Session, _e: Option<&Error>, ctx: &mut Self::CTX) {
        let status = session
            .as_downstream()
            .response_written()
            .map(|resp| resp.status.as_u16())
            .unwrap_or(0);

        if ctx.dispatched {
            RESPONSE_TIME
                .with_label_values(&[&ctx.origin])
                .observe(ctx.start.elapsed().as_secs_f64());
            RESPONSE_STATUS
                .with_label_values(&[&ctx.origin, &status.to_string()])
                .inc();
            ACTIVE_CONNECTIONS.with_label_values(&[&ctx.origin]).dec();
        }

        info!(
            "{} {} {} -> {} ({}ms)",
            ctx.client_ip,
            session.req_header().method,
            session.req_header().uri,
            status,
            ctx.start.elapsed().as_millis()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn gateway(config_toml: &str) -> Gateway {
        let config: Config = toml::from_str(config_toml).unwrap();
        Gateway {
            state: Arc::new(ProxyState::new(config)),
        }
    }

    #[test]
    fn test_cors_allow_origin() {
        let gw = gateway(
            r#"
            ip_headers = ["X-Forwarded-For"]

            [sso]
            enabled = false
            shared_domains = ["shared.com"]

            [hosts."example.com"]
            destination = "http://127.0.0.1:3000"
        "#,
        );

        assert_eq!(
            gw.cors_allow_origin("example.com", Some("https://example.com")),
            Some("https://example.com".to_string())
        );
        assert_eq!(
            gw.cors_allow_origin("example.com", Some("https://www.example.com")),
            Some("https://www.example.com".to_string())
        );
        assert_eq!(
            gw.cors_allow_origin("example.com", Some("http://shared.com")),
            Some("http://shared.com".to_string())
        );
        assert_eq!(
            gw.cors_allow_origin("example.com", Some("https://evil.com")),
            None
        );
        assert_eq!(
            gw.cors_allow_origin("example.com", None),
            Some("*".to_string())
        );

        gw.state.shutdown();
    }

    #[test]
    fn test_login_page_asset_has_placeholder() {
        assert!(LOGIN_PAGE.contains("{{AUTH_URL}}"));
        let rendered = LOGIN_PAGE.replace("{{AUTH_URL}}", "https://idp/auth?state=abc");
        assert!(rendered.contains("https://idp/auth?state=abc"));
        assert!(!rendered.contains("{{AUTH_URL}}"));
    }
}
