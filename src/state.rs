use crate::auth::SessionAuthenticator;
use crate::cache::ResponseCache;
use crate::config::{Config, HostRule};
use crate::limiter::{Limiter, SlidingWindowLimiter, UnlimitedLimiter};
use crate::utils::{ParseError, UpstreamTarget};
use log::info;
use parking_lot::RwLock;
use pingora::prelude::HttpPeer;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

pub const HEALTH_PATH: &str = "/rlsp/system/health";
pub const METRICS_PATH: &str = "/metrics";
pub const AUTH_CALLBACK_PATH: &str = "/auth/callback";
pub const AUTH_LOGOUT_PATH: &str = "/auth/logout";
pub const CACHE_STATUS_HEADER: &str = "X-RLSP-Cache";

/// Everything needed to serve one host, assembled on first request and
/// memoized. Admission order at request time: SSO, blacklist, rate limit,
/// cache, forward.
pub struct HostHandler {
    /// Normalized host, used as the metric label.
    pub origin: String,
    pub rule: HostRule,
    pub limiter: Arc<dyn Limiter>,
    /// A parse failure is kept and answered with a 500 on every dispatch.
    pub upstream: Result<UpstreamTarget, ParseError>,
    /// Resolved redirect URL for this host (override or global default).
    /// None when SSO is disabled.
    pub redirect_url: Option<String>,
    /// SSO admission runs only when globally enabled and the rule lists
    /// allowed emails.
    pub sso_enforced: bool,
}

pub struct ProxyState {
    pub config: Config,
    pub authenticator: Option<SessionAuthenticator>,
    pub cache: Arc<ResponseCache>,
    /// The global auth domain plus every per-host override domain.
    auth_domains: HashSet<String>,
    handlers: RwLock<HashMap<String, Arc<HostHandler>>>,
    peers: RwLock<HashMap<String, HttpPeer>>,
}

impl ProxyState {
    pub fn new(config: Config) -> Self {
        let authenticator = config
            .sso
            .as_ref()
            .filter(|sso| sso.enabled)
            .map(SessionAuthenticator::new);
        if authenticator.is_some() {
            info!("SSO authentication is enabled globally");
        }

        let mut auth_domains = HashSet::new();
        if let Some(sso) = config.sso.as_ref().filter(|sso| sso.enabled) {
            if !sso.auth_domain.is_empty() {
                auth_domains.insert(sso.auth_domain.clone());
            }
            for rule in config.hosts.values() {
                if let Some(auth) = &rule.auth
                    && !auth.domain.is_empty()
                {
                    auth_domains.insert(auth.domain.clone());
                }
            }
        }

        let cache = ResponseCache::new(config.cache.max_entries);

        Self {
            config,
            authenticator,
            cache,
            auth_domains,
            handlers: RwLock::new(HashMap::new()),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_auth_domain(&self, host: &str) -> bool {
        self.auth_domains.contains(host)
    }

    /// Returns the memoized handler for a normalized host, building it on
    /// first use. Concurrent first callers observe the same Arc.
    pub fn handler_for(&self, origin: &str) -> Option<Arc<HostHandler>> {
        if let Some(handler) = self.handlers.read().get(origin) {
            return Some(handler.clone());
        }

        let rule = self.config.hosts.get(origin)?.clone();

        let mut handlers = self.handlers.write();
        // Double-check after acquiring the write lock.
        if let Some(handler) = handlers.get(origin) {
            return Some(handler.clone());
        }

        let limiter: Arc<dyn Limiter> = if rule.is_unlimited() {
            info!("host {} is not rate limited", origin);
            Arc::new(UnlimitedLimiter)
        } else {
            info!(
                "host {} allows {} request(s) per {} second(s)",
                origin, rule.requests, rule.per_second
            );
            SlidingWindowLimiter::new(rule.per_second as u64, rule.requests as usize)
        };

        let upstream = rule.destination.parse::<UpstreamTarget>();

        let sso = self.config.sso.as_ref().filter(|sso| sso.enabled);
        let redirect_url = sso.map(|sso| {
            rule.auth
                .as_ref()
                .map(|auth| auth.redirect_url.as_str())
                .filter(|url| !url.is_empty())
                .unwrap_or(sso.redirect_url.as_str())
                .to_string()
        });
        let sso_enforced = sso.is_some() && !rule.allowed_emails.is_empty();

        let handler = Arc::new(HostHandler {
            origin: origin.to_string(),
            rule,
            limiter,
            upstream,
            redirect_url,
            sso_enforced,
        });
        handlers.insert(origin.to_string(), handler.clone());
        Some(handler)
    }

    /// Returns the memoized, connection-pool-tuned peer for an upstream,
    /// keyed by the destination URL string.
    pub fn peer_for(&self, destination: &str, target: &UpstreamTarget) -> HttpPeer {
        if let Some(peer) = self.peers.read().get(destination) {
            return peer.clone();
        }

        let mut peers = self.peers.write();
        if let Some(peer) = peers.get(destination) {
            return peer.clone();
        }

        let transport = &self.config.transport;
        let mut peer = HttpPeer::new(
            (target.host.as_str(), target.port),
            target.tls,
            target.sni.clone(),
        );
        peer.options.connection_timeout =
            Some(Duration::from_secs(transport.tls_handshake_timeout_secs));
        peer.options.idle_timeout = Some(Duration::from_secs(transport.idle_conn_timeout_secs));

        peers.insert(destination.to_string(), peer.clone());
        peer
    }

    /// Closes every limiter and the cache. Idempotent; invoked by the
    /// listener during drain.
    pub fn shutdown(&self) {
        for handler in self.handlers.read().values() {
            handler.limiter.close();
        }
        self.cache.close();
        info!("proxy state shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthOverride, SsoConfig};
    use std::thread;

    fn test_config() -> Config {
        let toml = r#"
            ip_headers = ["X-Forwarded-For"]

            [hosts."example.com"]
            destination = "http://127.0.0.1:3000"
            requests = 2
            per_second = 1

            [hosts."free.com"]
            destination = "http://127.0.0.1:3001"

            [hosts."broken.com"]
            destination = "http://"
        "#;
        toml::from_str(toml).unwrap()
    }

    #[test]
    fn test_handler_memoization_identity() {
        let state = Arc::new(ProxyState::new(test_config()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let state = state.clone();
            handles.push(thread::spawn(move || {
                state.handler_for("example.com").unwrap()
            }));
        }
        let handlers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for handler in &handlers[1..] {
            assert!(Arc::ptr_eq(&handlers[0], handler));
        }

        state.shutdown();
    }

    #[test]
    fn test_unknown_host_has_no_handler() {
        let state = ProxyState::new(test_config());
        assert!(state.handler_for("nope.com").is_none());
        state.shutdown();
    }

    #[test]
    fn test_sentinel_binds_unlimited_limiter() {
        let state = ProxyState::new(test_config());
        let handler = state.handler_for("free.com").unwrap();
        for _ in 0..100 {
            assert!(!handler.limiter.observe("1.2.3.4"));
        }
        state.shutdown();
    }

    #[test]
    fn test_invalid_upstream_is_kept_as_error() {
        let state = ProxyState::new(test_config());
        let handler = state.handler_for("broken.com").unwrap();
        assert!(handler.upstream.is_err());
        state.shutdown();
    }

    #[test]
    fn test_peer_memoization() {
        let state = ProxyState::new(test_config());
        let target: UpstreamTarget = "http://127.0.0.1:3000".parse().unwrap();

        let peer = state.peer_for("http://127.0.0.1:3000", &target);
        assert_eq!(peer.options.idle_timeout, Some(Duration::from_secs(90)));
        assert_eq!(
            peer.options.connection_timeout,
            Some(Duration::from_secs(10))
        );
        let _again = state.peer_for("http://127.0.0.1:3000", &target);
        assert_eq!(state.peers.read().len(), 1);

        state.shutdown();
    }

    #[test]
    fn test_auth_domain_resolution() {
        let mut config = test_config();
        config.sso = Some(SsoConfig {
            enabled: true,
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            redirect_url: "https://auth.example.com/auth/callback".to_string(),
            auth_domain: "auth.example.com".to_string(),
            shared_domains: vec!["example.com".to_string()],
            ..Default::default()
        });
        let rule = config.hosts.get_mut("example.com").unwrap();
        rule.allowed_emails = vec!["a@x".to_string()];
        rule.auth = Some(AuthOverride {
            domain: "login.example.com".to_string(),
            redirect_url: "https://login.example.com/auth/callback".to_string(),
        });

        let state = ProxyState::new(config);
        assert!(state.is_auth_domain("auth.example.com"));
        assert!(state.is_auth_domain("login.example.com"));
        assert!(!state.is_auth_domain("example.com"));

        let handler = state.handler_for("example.com").unwrap();
        assert!(handler.sso_enforced);
        assert_eq!(
            handler.redirect_url.as_deref(),
            Some("https://login.example.com/auth/callback")
        );

        // No override falls back to the global redirect.
        let free = state.handler_for("free.com").unwrap();
        assert!(!free.sso_enforced);
        assert_eq!(
            free.redirect_url.as_deref(),
            Some("https://auth.example.com/auth/callback")
        );

        state.shutdown();
    }
}
