use crate::config::SsoConfig;
use crate::utils::AuthError;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use serde::Deserialize;
use url::Url;

/// Name of the cross-domain session cookie. Its value is the authenticated
/// email; the session is unsigned, which is only acceptable while every
/// shared domain is served by this proxy.
pub const SESSION_COOKIE: &str = "rlsp_session";

const SESSION_TTL_SECS: u64 = 24 * 60 * 60;

const SCOPES: &str = "https://www.googleapis.com/auth/userinfo.email \
                      https://www.googleapis.com/auth/userinfo.profile";

#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub verified_email: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub picture: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// OAuth2 code exchange plus cross-domain cookie sessions. Stateless between
/// calls; all session state lives in the cookie.
pub struct SessionAuthenticator {
    client_id: String,
    client_secret: String,
    auth_endpoint: String,
    token_endpoint: String,
    userinfo_endpoint: String,
    shared_domains: Vec<String>,
    http: reqwest::Client,
}

impl SessionAuthenticator {
    pub fn new(sso: &SsoConfig) -> Self {
        Self {
            client_id: sso.client_id.clone(),
            client_secret: sso.client_secret.clone(),
            auth_endpoint: sso.auth_endpoint.clone(),
            token_endpoint: sso.token_endpoint.clone(),
            userinfo_endpoint: sso.userinfo_endpoint.clone(),
            shared_domains: sso.shared_domains.clone(),
            http: reqwest::Client::new(),
        }
    }

    /// The identity provider URL the login page points at. `redirect_url` is
    /// resolved per target host by the caller.
    pub fn login_url(&self, state: &str, redirect_url: &str) -> String {
        let mut url = match Url::parse(&self.auth_endpoint) {
            Ok(url) => url,
            // Endpoint comes from config; a bad value surfaces on first use.
            Err(_) => return self.auth_endpoint.clone(),
        };
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", redirect_url)
            .append_pair("response_type", "code")
            .append_pair("scope", SCOPES)
            .append_pair("state", state);
        url.to_string()
    }

    /// Exchanges the callback code for a token and resolves the identity
    /// behind it. Requires a non-empty email in the userinfo response.
    pub async fn fetch_user_info(
        &self,
        code: &str,
        redirect_url: &str,
    ) -> Result<UserInfo, AuthError> {
        let params = [
            ("code", code),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("redirect_uri", redirect_url),
            ("grant_type", "authorization_code"),
        ];

        let response = self
            .http
            .post(&self.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::Exchange(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthError::Exchange(format!(
                "token endpoint returned status {}",
                response.status()
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Exchange(e.to_string()))?;

        let response = self
            .http
            .get(&self.userinfo_endpoint)
            .bearer_auth(&token.access_token)
            .send()
            .await
            .map_err(|e| AuthError::UserInfo(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthError::UserInfo(format!(
                "userinfo endpoint returned status {}",
                response.status()
            )));
        }
        let info: UserInfo = response
            .json()
            .await
            .map_err(|e| AuthError::UserInfo(e.to_string()))?;

        if info.email.is_empty() {
            return Err(AuthError::MissingEmail);
        }
        Ok(info)
    }

    /// One session cookie per shared domain.
    pub fn session_cookies(&self, email: &str) -> Vec<String> {
        self.shared_domains
            .iter()
            .map(|domain| {
                format!(
                    "{}={}; Path=/; Domain={}; Max-Age={}; HttpOnly; Secure; SameSite=None",
                    SESSION_COOKIE, email, domain, SESSION_TTL_SECS
                )
            })
            .collect()
    }

    /// Expired empty-value cookies for every shared domain.
    pub fn logout_cookies(&self) -> Vec<String> {
        self.shared_domains
            .iter()
            .map(|domain| {
                format!(
                    "{}=; Path=/; Domain={}; Max-Age=0; HttpOnly; Secure; SameSite=None",
                    SESSION_COOKIE, domain
                )
            })
            .collect()
    }

    pub fn has_session(cookie_header: Option<&str>) -> bool {
        Self::session_email(cookie_header).is_some()
    }

    pub fn session_email(cookie_header: Option<&str>) -> Option<String> {
        let header = cookie_header?;
        for part in header.split(';') {
            let part = part.trim();
            if let Some(value) = part.strip_prefix(SESSION_COOKIE)
                && let Some(value) = value.strip_prefix('=')
                && !value.is_empty()
            {
                return Some(value.to_string());
            }
        }
        None
    }
}

/// The target hostname rides through the identity provider as the opaque
/// OAuth state parameter.
pub fn encode_state(host: &str) -> String {
    URL_SAFE.encode(host.as_bytes())
}

pub fn decode_state(state: &str) -> Result<String, AuthError> {
    let bytes = URL_SAFE.decode(state).map_err(|_| AuthError::InvalidState)?;
    String::from_utf8(bytes).map_err(|_| AuthError::InvalidState)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SsoConfig;

    fn authenticator() -> SessionAuthenticator {
        SessionAuthenticator::new(&SsoConfig {
            enabled: true,
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            redirect_url: "https://auth.example.com/auth/callback".to_string(),
            auth_domain: "auth.example.com".to_string(),
            shared_domains: vec!["example.com".to_string(), "other.com".to_string()],
            auth_endpoint: "https://idp.example.com/auth".to_string(),
            token_endpoint: "https://idp.example.com/token".to_string(),
            userinfo_endpoint: "https://idp.example.com/userinfo".to_string(),
        })
    }

    #[test]
    fn test_state_round_trip() {
        for host in ["example.com", "www.example.com:8080", "h"] {
            let state = encode_state(host);
            assert_eq!(decode_state(&state).unwrap(), host);
        }
        assert!(decode_state("not base64 🦀").is_err());
    }

    #[test]
    fn test_login_url() {
        let auth = authenticator();
        let url = auth.login_url("c3RhdGU=", "https://auth.example.com/auth/callback");
        let parsed = Url::parse(&url).unwrap();
        let pairs: Vec<(String, String)> = parsed.query_pairs().into_owned().collect();

        assert!(url.starts_with("https://idp.example.com/auth?"));
        assert!(pairs.contains(&("client_id".to_string(), "client".to_string())));
        assert!(pairs.contains(&("response_type".to_string(), "code".to_string())));
        assert!(pairs.contains(&("state".to_string(), "c3RhdGU=".to_string())));
        assert!(
            pairs.contains(&(
                "redirect_uri".to_string(),
                "https://auth.example.com/auth/callback".to_string()
            ))
        );
    }

    #[test]
    fn test_session_cookies() {
        let auth = authenticator();
        let cookies = auth.session_cookies("a@x");
        assert_eq!(cookies.len(), 2);
        assert!(cookies[0].starts_with("rlsp_session=a@x; "));
        for cookie in &cookies {
            assert!(cookie.contains("Path=/"));
            assert!(cookie.contains("HttpOnly"));
            assert!(cookie.contains("Secure"));
            assert!(cookie.contains("SameSite=None"));
            assert!(cookie.contains("Max-Age=86400"));
        }
        assert!(cookies[0].contains("Domain=example.com"));
        assert!(cookies[1].contains("Domain=other.com"));
    }

    #[test]
    fn test_logout_cookies_expire_immediately() {
        let auth = authenticator();
        for cookie in auth.logout_cookies() {
            assert!(cookie.starts_with("rlsp_session=; "));
            assert!(cookie.contains("Max-Age=0"));
        }
    }

    #[test]
    fn test_session_email() {
        assert_eq!(
            SessionAuthenticator::session_email(Some("rlsp_session=a@x")),
            Some("a@x".to_string())
        );
        assert_eq!(
            SessionAuthenticator::session_email(Some("other=1; rlsp_session=a@x; more=2")),
            Some("a@x".to_string())
        );
        assert_eq!(SessionAuthenticator::session_email(Some("rlsp_session=")), None);
        assert_eq!(SessionAuthenticator::session_email(Some("other=1")), None);
        assert_eq!(SessionAuthenticator::session_email(None), None);
        assert!(!SessionAuthenticator::has_session(Some("rlsp_sessionx=1")));
    }
}
