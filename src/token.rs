//! Signed bearer tokens.
//!
//! A token is the hex-encoded JSON claims followed by a hex-encoded
//! HMAC-SHA256 over that payload:
//!
//! ```text
//! hex(json(claims)) "." hex(HMAC-SHA256(secret, hex(json(claims))))
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Identity carried by a bearer token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub id: String,
    pub email: String,
    pub name: String,
    pub picture: String,
    /// Unix timestamp (seconds) after which the token is rejected.
    pub exp: u64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("token expired at {expired_at}")]
    Expired { expired_at: u64 },
}

#[derive(Clone)]
pub struct TokenSigner {
    secret_key: Vec<u8>,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

impl TokenSigner {
    pub fn new(secret_key: impl AsRef<[u8]>) -> Self {
        Self {
            secret_key: secret_key.as_ref().to_vec(),
        }
    }

    /// Issues a token for `claims`, overriding `exp` with now + `ttl`.
    pub fn issue(&self, mut claims: Claims, ttl: Duration) -> String {
        claims.exp = unix_now() + ttl.as_secs();
        self.encode(&claims)
    }

    fn encode(&self, claims: &Claims) -> String {
        // Serializing plain strings and integers cannot fail.
        let json = serde_json::to_vec(claims).unwrap_or_default();
        let payload = hex::encode(json);
        let signature = hex::encode(self.compute_signature(&payload));
        format!("{payload}.{signature}")
    }

    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        self.verify_at(token, unix_now())
    }

    fn verify_at(&self, token: &str, now: u64) -> Result<Claims, TokenError> {
        let (payload, signature) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let provided = hex::decode(signature).map_err(|_| TokenError::Malformed)?;
        let expected = self.compute_signature(payload);
        if !bool::from(provided.ct_eq(&expected)) {
            return Err(TokenError::InvalidSignature);
        }

        let json = hex::decode(payload).map_err(|_| TokenError::Malformed)?;
        let claims: Claims = serde_json::from_slice(&json).map_err(|_| TokenError::Malformed)?;
        if now > claims.exp {
            return Err(TokenError::Expired {
                expired_at: claims.exp,
            });
        }
        Ok(claims)
    }

    fn compute_signature(&self, payload: &str) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret_key).expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> Claims {
        Claims {
            id: "1093".into(),
            email: "f2021@hyderabad.bits-pilani.ac.in".into(),
            name: "Test User".into(),
            picture: "https://example.com/p.png".into(),
            exp: 0,
        }
    }

    #[test]
    fn issued_token_verifies() {
        let signer = TokenSigner::new("secret");
        let token = signer.issue(claims(), Duration::from_secs(60));
        let verified = signer.verify(&token).unwrap();
        assert_eq!(verified.id, "1093");
        assert!(verified.exp >= unix_now());
    }

    #[test]
    fn token_from_other_secret_is_rejected() {
        let token = TokenSigner::new("secret").issue(claims(), Duration::from_secs(60));
        let result = TokenSigner::new("other").verify(&token);
        assert_eq!(result, Err(TokenError::InvalidSignature));
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let signer = TokenSigner::new("secret");
        let token = signer.issue(claims(), Duration::from_secs(60));
        let (_, signature) = token.split_once('.').unwrap();

        let mut forged = claims();
        forged.id = "admin".into();
        forged.exp = unix_now() + 60;
        let payload = hex::encode(serde_json::to_vec(&forged).unwrap());
        let result = signer.verify(&format!("{payload}.{signature}"));
        assert_eq!(result, Err(TokenError::InvalidSignature));
    }

    #[test]
    fn expired_token_is_rejected() {
        let signer = TokenSigner::new("secret");
        let token = signer.issue(claims(), Duration::from_secs(60));
        let later = unix_now() + 3600;
        assert!(matches!(
            signer.verify_at(&token, later),
            Err(TokenError::Expired { .. })
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        let signer = TokenSigner::new("secret");
        assert_eq!(signer.verify("not-a-token"), Err(TokenError::Malformed));
        assert_eq!(signer.verify("abc.zz"), Err(TokenError::Malformed));
    }
}
