use std::fmt;
use std::str::FromStr;
use url::Url;

/// Strips the port and a leading `www.` from a Host header value. The result
/// is the key used for rule lookup, chain memoization and metric labels.
pub fn normalize_host(host: &str) -> &str {
    let host = host.split(':').next().unwrap_or(host);
    host.strip_prefix("www.").unwrap_or(host)
}

/// A parsed upstream destination. Carries everything the connector needs:
/// whether to speak TLS, the address, and the SNI to present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub tls: bool,
    pub host: String,
    pub port: u16,
    pub sni: String,
}

impl FromStr for UpstreamTarget {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).map_err(|e| ParseError::InvalidUrl(format!("{}: {}", s, e)))?;
        let tls = match url.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(ParseError::UnsupportedScheme(other.to_string())),
        };
        let host = url
            .host_str()
            .ok_or_else(|| ParseError::MissingHost(s.to_string()))?
            .to_string();
        let port = url.port().unwrap_or(if tls { 443 } else { 80 });
        Ok(Self {
            tls,
            sni: host.clone(),
            host,
            port,
        })
    }
}

impl fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub enum ParseError {
    InvalidUrl(String),
    MissingHost(String),
    UnsupportedScheme(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::InvalidUrl(s) => write!(f, "Invalid upstream URL: {}", s),
            ParseError::MissingHost(s) => write!(f, "Upstream URL has no host: {}", s),
            ParseError::UnsupportedScheme(s) => write!(f, "Unsupported upstream scheme: {}", s),
        }
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone)]
pub enum AuthError {
    Exchange(String),
    UserInfo(String),
    MissingEmail,
    InvalidState,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Exchange(s) => write!(f, "Failed to exchange code for token: {}", s),
            AuthError::UserInfo(s) => write!(f, "Failed to get user info: {}", s),
            AuthError::MissingEmail => write!(f, "User info response missing email field"),
            AuthError::InvalidState => write!(f, "Invalid state parameter"),
        }
    }
}

impl std::error::Error for AuthError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("example.com"), "example.com");
        assert_eq!(normalize_host("www.example.com"), "example.com");
        assert_eq!(normalize_host("example.com:8080"), "example.com");
        assert_eq!(normalize_host("www.example.com:8080"), "example.com");
        assert_eq!(normalize_host("wwwx.example.com"), "wwwx.example.com");
    }

    #[test]
    fn test_upstream_target_parse() {
        let t: UpstreamTarget = "http://127.0.0.1:3000".parse().unwrap();
        assert!(!t.tls);
        assert_eq!(t.host, "127.0.0.1");
        assert_eq!(t.port, 3000);

        let t: UpstreamTarget = "https://backend.internal".parse().unwrap();
        assert!(t.tls);
        assert_eq!(t.port, 443);
        assert_eq!(t.sni, "backend.internal");

        let t: UpstreamTarget = "http://backend.internal".parse().unwrap();
        assert_eq!(t.port, 80);

        assert!("ftp://backend".parse::<UpstreamTarget>().is_err());
        assert!("not a url".parse::<UpstreamTarget>().is_err());
    }
}
