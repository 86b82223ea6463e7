use crate::utils::normalize_host;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default = "default_ip_headers")]
    pub ip_headers: Vec<String>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sso: Option<SsoConfig>,
    /// Blacklist applied to every host, merged into each rule at load time.
    #[serde(default)]
    pub ip_blacklist: Vec<String>,
    #[serde(default)]
    pub hosts: HashMap<String, HostRule>,
}

fn default_ip_headers() -> Vec<String> {
    vec!["X-Forwarded-For".to_string(), "X-Real-IP".to_string()]
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_read_timeout() -> u64 {
    30
}

fn default_write_timeout() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    120
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TransportConfig {
    /// Size of the upstream keep-alive pool, shared across all upstreams.
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: usize,
    #[serde(default = "default_idle_conn_timeout")]
    pub idle_conn_timeout_secs: u64,
    #[serde(default = "default_tls_handshake_timeout")]
    pub tls_handshake_timeout_secs: u64,
    #[serde(default)]
    pub disable_compression: bool,
}

fn default_max_idle_conns() -> usize {
    100
}

fn default_idle_conn_timeout() -> u64 {
    90
}

fn default_tls_handshake_timeout() -> u64 {
    10
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_idle_conns: default_max_idle_conns(),
            idle_conn_timeout_secs: default_idle_conn_timeout(),
            tls_handshake_timeout_secs: default_tls_handshake_timeout(),
            disable_compression: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
}

fn default_cache_entries() -> usize {
    1000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_entries(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct SsoConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub redirect_url: String,
    #[serde(default)]
    pub auth_domain: String,
    /// Every domain that honors the session cookie; one Set-Cookie is
    /// issued per entry.
    #[serde(default)]
    pub shared_domains: Vec<String>,
    #[serde(default = "default_auth_endpoint")]
    pub auth_endpoint: String,
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,
    #[serde(default = "default_userinfo_endpoint")]
    pub userinfo_endpoint: String,
}

fn default_auth_endpoint() -> String {
    "https://accounts.google.com/o/oauth2/auth".to_string()
}

fn default_token_endpoint() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_userinfo_endpoint() -> String {
    "https://www.googleapis.com/oauth2/v2/userinfo".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HostRule {
    pub destination: String,
    #[serde(default = "default_unlimited")]
    pub requests: i64,
    #[serde(default = "default_unlimited")]
    pub per_second: i64,
    #[serde(default)]
    pub ip_blacklist: HashSet<String>,
    /// Empty means SSO is not enforced for this host even when globally
    /// enabled.
    #[serde(default)]
    pub allowed_emails: Vec<String>,
    #[serde(default)]
    pub auth: Option<AuthOverride>,
    /// 0 disables caching for this host.
    #[serde(default)]
    pub cache_max_ttl_seconds: u64,
}

fn default_unlimited() -> i64 {
    -1
}

impl HostRule {
    /// The (-1, -1) sentinel pair marks a host without a rate limit.
    pub fn is_unlimited(&self) -> bool {
        self.requests == -1 && self.per_second == -1
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AuthOverride {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub redirect_url: String,
}

#[derive(Debug, Clone)]
pub enum ConfigError {
    NoIpHeaders,
    MissingDestination(String),
    InvalidRequests(String, i64),
    InvalidPerSecond(String, i64),
    MismatchedSentinel(String, i64, i64),
    IncompleteSso(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NoIpHeaders => write!(f, "no IP header defined"),
            ConfigError::MissingDestination(host) => {
                write!(f, "host '{}' is missing destination", host)
            }
            ConfigError::InvalidRequests(host, v) => {
                write!(f, "host '{}' has invalid number of requests: {}", host, v)
            }
            ConfigError::InvalidPerSecond(host, v) => {
                write!(f, "host '{}' has invalid per_second value: {}", host, v)
            }
            ConfigError::MismatchedSentinel(host, requests, per_second) => write!(
                f,
                "host '{}' has invalid requests and per_second values: {}, {}",
                host, requests, per_second
            ),
            ConfigError::IncompleteSso(field) => {
                write!(f, "SSO is enabled but {} is missing", field)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ip_headers.is_empty() {
            return Err(ConfigError::NoIpHeaders);
        }

        if let Some(sso) = &self.sso
            && sso.enabled
        {
            if sso.client_id.is_empty() {
                return Err(ConfigError::IncompleteSso("client_id"));
            }
            if sso.client_secret.is_empty() {
                return Err(ConfigError::IncompleteSso("client_secret"));
            }
            if sso.redirect_url.is_empty() {
                return Err(ConfigError::IncompleteSso("redirect_url"));
            }
        }

        for (host, rule) in &self.hosts {
            if rule.destination.is_empty() {
                return Err(ConfigError::MissingDestination(host.clone()));
            }
            if rule.requests < -1 {
                return Err(ConfigError::InvalidRequests(host.clone(), rule.requests));
            }
            if rule.per_second < -1 {
                return Err(ConfigError::InvalidPerSecond(host.clone(), rule.per_second));
            }
            if (rule.requests == -1) != (rule.per_second == -1) {
                return Err(ConfigError::MismatchedSentinel(
                    host.clone(),
                    rule.requests,
                    rule.per_second,
                ));
            }
        }

        Ok(())
    }

    /// SSO is active only when configured and switched on.
    pub fn sso_enabled(&self) -> bool {
        self.sso.as_ref().is_some_and(|s| s.enabled)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(sso) = &mut self.sso {
            if let Ok(val) = env::var("RLSP_CLIENT_ID") {
                sso.client_id = val;
            }
            if let Ok(val) = env::var("RLSP_CLIENT_SECRET") {
                sso.client_secret = val;
            }
            if let Ok(val) = env::var("RLSP_AUTH_DOMAIN") {
                sso.auth_domain = val;
            }
            if let Ok(val) = env::var("RLSP_REDIRECT_URL") {
                sso.redirect_url = val;
            }
        }

        if let Ok(val) = env::var("RLSP_IP_BLACKLIST") {
            self.ip_blacklist
                .extend(val.split(',').map(|ip| ip.trim().to_string()));
        }

        if let Ok(Ok(val)) = env::var("SERVER_READ_TIMEOUT_SECS").map(|v| v.parse()) {
            self.server.read_timeout_secs = val;
        }
        if let Ok(Ok(val)) = env::var("SERVER_WRITE_TIMEOUT_SECS").map(|v| v.parse()) {
            self.server.write_timeout_secs = val;
        }
        if let Ok(Ok(val)) = env::var("SERVER_IDLE_TIMEOUT_SECS").map(|v| v.parse()) {
            self.server.idle_timeout_secs = val;
        }
        if let Ok(Ok(val)) = env::var("TRANSPORT_MAX_IDLE_CONNS").map(|v| v.parse()) {
            self.transport.max_idle_conns = val;
        }
        if let Ok(Ok(val)) = env::var("TRANSPORT_IDLE_CONN_TIMEOUT_SECS").map(|v| v.parse()) {
            self.transport.idle_conn_timeout_secs = val;
        }
        if let Ok(Ok(val)) = env::var("TRANSPORT_TLS_HANDSHAKE_TIMEOUT_SECS").map(|v| v.parse()) {
            self.transport.tls_handshake_timeout_secs = val;
        }
    }

    /// Re-keys host rules by normalized hostname and merges the global
    /// blacklist into each rule.
    fn finalize(&mut self) {
        let hosts = std::mem::take(&mut self.hosts);
        for (host, mut rule) in hosts {
            for ip in &self.ip_blacklist {
                rule.ip_blacklist.insert(ip.clone());
            }
            self.hosts.insert(normalize_host(&host).to_string(), rule);
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, Box<dyn std::error::Error>> {
    if !path.as_ref().exists() {
        let example = include_str!("../example_config.toml");
        fs::write(path.as_ref(), example)?;
    }

    let content = fs::read_to_string(path)?;
    let mut config: Config = toml::from_str(&content)?;
    config.apply_env_overrides();
    config.validate()?;
    config.finalize();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(destination: &str, requests: i64, per_second: i64) -> HostRule {
        HostRule {
            destination: destination.to_string(),
            requests,
            per_second,
            ip_blacklist: HashSet::new(),
            allowed_emails: Vec::new(),
            auth: None,
            cache_max_ttl_seconds: 0,
        }
    }

    #[test]
    fn test_validate_sentinel_pair() {
        let mut config = Config {
            ip_headers: default_ip_headers(),
            ..Default::default()
        };

        config
            .hosts
            .insert("a.com".to_string(), rule("http://127.0.0.1:1", -1, -1));
        config
            .hosts
            .insert("b.com".to_string(), rule("http://127.0.0.1:2", 10, 1));
        assert!(config.validate().is_ok());

        config
            .hosts
            .insert("c.com".to_string(), rule("http://127.0.0.1:3", -1, 5));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MismatchedSentinel(_, -1, 5))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config {
            ip_headers: default_ip_headers(),
            ..Default::default()
        };

        config
            .hosts
            .insert("a.com".to_string(), rule("http://127.0.0.1:1", -2, 1));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRequests(_, -2))
        ));

        config.hosts.clear();
        config.hosts.insert("a.com".to_string(), rule("", 1, 1));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingDestination(_))
        ));

        config.hosts.clear();
        config.ip_headers.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoIpHeaders)));
    }

    #[test]
    fn test_validate_sso_completeness() {
        let config = Config {
            ip_headers: default_ip_headers(),
            sso: Some(SsoConfig {
                enabled: true,
                client_id: "id".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::IncompleteSso("client_secret"))
        ));

        let config = Config {
            ip_headers: default_ip_headers(),
            sso: Some(SsoConfig {
                enabled: false,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_finalize_merges_global_blacklist_and_normalizes() {
        let mut config = Config {
            ip_headers: default_ip_headers(),
            ip_blacklist: vec!["9.9.9.9".to_string()],
            ..Default::default()
        };
        let mut r = rule("http://127.0.0.1:1", -1, -1);
        r.ip_blacklist.insert("1.2.3.4".to_string());
        config.hosts.insert("www.example.com".to_string(), r);

        config.finalize();

        let rule = config.hosts.get("example.com").unwrap();
        assert!(rule.ip_blacklist.contains("1.2.3.4"));
        assert!(rule.ip_blacklist.contains("9.9.9.9"));
        assert!(!config.hosts.contains_key("www.example.com"));
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml = r#"
            ip_headers = ["X-Real-IP"]

            [hosts."example.com"]
            destination = "http://127.0.0.1:3000"
            requests = 5
            per_second = 1
            ip_blacklist = ["5.6.7.8"]
            cache_max_ttl_seconds = 60
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());

        let rule = config.hosts.get("example.com").unwrap();
        assert_eq!(rule.requests, 5);
        assert_eq!(rule.per_second, 1);
        assert!(rule.ip_blacklist.contains("5.6.7.8"));
        assert_eq!(rule.cache_max_ttl_seconds, 60);
        assert!(!rule.is_unlimited());
        assert!(!config.sso_enabled());
    }
}
