//! Bearer token acquisition and tunnel URL composition.

use std::fmt;
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

/// Timeout for the one-shot login request.
const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest relay error body echoed back to the operator.
const MAX_ERROR_DETAIL: usize = 200;

/// Authentication and URL errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Login rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Login request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid login response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AuthError {
    /// Whether retrying with the same credentials is pointless.
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Http(_))
    }
}

/// How this process obtains its bearer token. Exactly one path per run.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Token supplied out-of-band, used as is.
    Token(String),
    /// Exchanged for a token at the relay's login endpoint.
    Login { username: String, password: String },
}

impl Credentials {
    /// Pick the authentication path from optional CLI/env inputs.
    pub fn from_parts(
        token: Option<String>,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Self, AuthError> {
        match (token, username, password) {
            (Some(token), None, None) if !token.is_empty() => Ok(Self::Token(token)),
            (Some(_), None, None) => Err(AuthError::Config("token is empty".into())),
            (None, Some(username), Some(password)) if !username.is_empty() => {
                Ok(Self::Login { username, password })
            }
            (None, Some(_), Some(_)) => Err(AuthError::Config("username is empty".into())),
            (Some(_), _, _) => Err(AuthError::Config(
                "a token cannot be combined with username/password".into(),
            )),
            (None, Some(_), None) | (None, None, Some(_)) => Err(AuthError::Config(
                "username and password must be given together".into(),
            )),
            (None, None, None) => Err(AuthError::Config(
                "either a token or a username and password is required".into(),
            )),
        }
    }

    /// Whether a fresh token can be obtained after the relay rejects one.
    pub const fn can_refresh(&self) -> bool {
        matches!(self, Self::Login { .. })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token(_) => f.write_str("Token(<redacted>)"),
            Self::Login { username, .. } => f
                .debug_struct("Login")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Derive the tunnel URL from a plain server URL: `http→ws`, `https→wss`,
/// then append `tunnel_path`.
pub fn tunnel_url_from_server(server_url: &str, tunnel_path: &str) -> Result<Url, AuthError> {
    let mut url = parse_url(server_url)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(AuthError::Config(format!(
                "unsupported server URL scheme {other:?} (expected http or https)"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| AuthError::Config(format!("cannot use scheme {scheme} for {server_url}")))?;
    append_path(&mut url, tunnel_path);
    Ok(url)
}

/// Validate an explicit tunnel URL (`ws`/`wss`).
pub fn parse_tunnel_url(tunnel_url: &str) -> Result<Url, AuthError> {
    let url = parse_url(tunnel_url)?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(AuthError::Config(format!(
            "unsupported tunnel URL scheme {other:?} (expected ws or wss)"
        ))),
    }
}

/// Login endpoint relative to `base`, which may be a server or tunnel URL.
pub fn login_url(base: &Url, login_path: &str) -> Result<Url, AuthError> {
    let mut url = base.clone();
    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        other => {
            return Err(AuthError::Config(format!(
                "cannot derive a login URL from scheme {other:?}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| AuthError::Config(format!("cannot use scheme {scheme} for {base}")))?;
    url.set_query(None);
    append_path(&mut url, login_path);
    Ok(url)
}

/// The dial URL: `tunnel_url` with `token` added as a query parameter.
pub fn with_token(tunnel_url: &Url, token: &str) -> Url {
    let mut url = tunnel_url.clone();
    url.query_pairs_mut().append_pair("token", token);
    url
}

/// A URL safe to log: query string and credentials removed.
pub fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    let _ = url.set_password(None);
    let _ = url.set_username("");
    url.to_string()
}

fn parse_url(raw: &str) -> Result<Url, AuthError> {
    Url::parse(raw).map_err(|e| AuthError::Config(format!("invalid URL {raw:?}: {e}")))
}

fn append_path(url: &mut Url, suffix: &str) {
    let base = url.path().trim_end_matches('/').to_string();
    let suffix = suffix.trim_start_matches('/');
    url.set_path(&format!("{base}/{suffix}"));
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    access_token: String,
}

/// Produces bearer tokens for the tunnel.
#[derive(Debug)]
pub struct Authenticator {
    credentials: Credentials,
    login_url: Option<Url>,
    http: reqwest::Client,
}

impl Authenticator {
    /// `login_url` is required for [`Credentials::Login`].
    pub fn new(credentials: Credentials, login_url: Option<Url>) -> Result<Self, AuthError> {
        if credentials.can_refresh() && login_url.is_none() {
            return Err(AuthError::Config(
                "username/password login needs a login URL".into(),
            ));
        }

        crate::install_crypto_provider();
        let http = reqwest::Client::builder().timeout(LOGIN_TIMEOUT).build()?;

        Ok(Self {
            credentials,
            login_url,
            http,
        })
    }

    pub const fn can_refresh(&self) -> bool {
        self.credentials.can_refresh()
    }

    /// Get a bearer token: the supplied one, or a fresh login.
    pub async fn obtain_token(&self) -> Result<String, AuthError> {
        match &self.credentials {
            Credentials::Token(token) => Ok(token.clone()),
            Credentials::Login { username, password } => self.login(username, password).await,
        }
    }

    async fn login(&self, username: &str, password: &str) -> Result<String, AuthError> {
        let url = self
            .login_url
            .as_ref()
            .ok_or_else(|| AuthError::Config("no login URL configured".into()))?;

        let response = self
            .http
            .post(url.clone())
            .json(&LoginRequest { username, password })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                message: error_detail(&body),
            });
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
        if login.access_token.is_empty() {
            return Err(AuthError::InvalidResponse("empty access_token".into()));
        }

        info!(username = %username, login_url = %redacted(url), "Authenticated with relay");
        Ok(login.access_token)
    }
}

/// Best-effort human-readable reason from a login error body.
fn error_detail(body: &str) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
        for key in ["detail", "error", "message"] {
            if let Some(Value::String(detail)) = map.get(key) {
                return detail.clone();
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "no details".to_string();
    }
    trimmed.chars().take(MAX_ERROR_DETAIL).collect()
}
