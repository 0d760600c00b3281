//! Google ID token verification.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::token::unix_now;

pub const GOOGLE_TOKENINFO_URL: &str = "https://oauth2.googleapis.com/tokeninfo";
const GOOGLE_ISSUERS: [&str; 2] = ["accounts.google.com", "https://accounts.google.com"];

/// Profile extracted from a verified Google ID token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GoogleIdentity {
    pub sub: String,
    pub email: String,
    pub name: String,
    pub picture: String,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity token rejected: {0}")]
    Rejected(String),
    #[error("identity token audience mismatch")]
    AudienceMismatch,
    #[error("identity token expired")]
    Expired,
    #[error("identity provider unreachable: {0}")]
    Transport(String),
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, id_token: &str) -> Result<GoogleIdentity, IdentityError>;
}

/// Verifies ID tokens against Google's `tokeninfo` endpoint.
pub struct GoogleVerifier {
    client: reqwest::Client,
    client_id: String,
    endpoint: String,
}

impl GoogleVerifier {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self::with_endpoint(client_id, GOOGLE_TOKENINFO_URL)
    }

    pub fn with_endpoint(client_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            client_id: client_id.into(),
            endpoint: endpoint.into(),
        }
    }
}

#[derive(Deserialize)]
struct TokenInfo {
    iss: Option<String>,
    aud: Option<String>,
    sub: Option<String>,
    email: Option<String>,
    #[serde(default)]
    email_verified: Value,
    #[serde(default)]
    exp: Value,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    picture: Option<String>,
}

#[async_trait]
impl IdentityVerifier for GoogleVerifier {
    async fn verify(&self, id_token: &str) -> Result<GoogleIdentity, IdentityError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("id_token", id_token)])
            .send()
            .await
            .map_err(|err| IdentityError::Transport(err.to_string()))?;

        if !response.status().is_success() {
            debug!(status = %response.status(), "tokeninfo rejected id token");
            return Err(IdentityError::Rejected(format!(
                "tokeninfo returned {}",
                response.status()
            )));
        }

        let info: TokenInfo = response
            .json()
            .await
            .map_err(|err| IdentityError::Rejected(err.to_string()))?;
        validate_token_info(info, &self.client_id, unix_now())
    }
}

fn validate_token_info(
    info: TokenInfo,
    client_id: &str,
    now: u64,
) -> Result<GoogleIdentity, IdentityError> {
    if info.aud.as_deref() != Some(client_id) {
        return Err(IdentityError::AudienceMismatch);
    }
    match info.iss.as_deref() {
        Some(iss) if GOOGLE_ISSUERS.contains(&iss) => {}
        _ => return Err(IdentityError::Rejected("unexpected issuer".into())),
    }
    if !value_as_bool(&info.email_verified) {
        return Err(IdentityError::Rejected("email not verified".into()));
    }
    match value_as_u64(&info.exp) {
        Some(exp) if exp >= now => {}
        _ => return Err(IdentityError::Expired),
    }

    let sub = info
        .sub
        .filter(|s| !s.is_empty())
        .ok_or_else(|| IdentityError::Rejected("missing subject".into()))?;
    let email = info
        .email
        .filter(|s| !s.is_empty())
        .ok_or_else(|| IdentityError::Rejected("missing email".into()))?;

    Ok(GoogleIdentity {
        sub,
        email,
        name: info.name.unwrap_or_default(),
        picture: info.picture.unwrap_or_default(),
    })
}

// tokeninfo encodes booleans and numbers as strings.
fn value_as_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
