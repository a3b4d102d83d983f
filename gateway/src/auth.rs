//! Browser authentication: the opening handshake verifies a JWT before the
//! multiplexed socket is handed to the Browser Channel. Failure closes with
//! 4001, no message leakage beyond the close reason.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[allow(dead_code)]
    exp: usize,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("invalid or expired token")]
    InvalidToken,
}

/// Verifies an HS256 JWT against the Gateway's shared secret. No renewal
/// mid-stream: a dropped connection reconnects with a fresh token, so this
/// is only ever called once, at handshake time.
pub fn verify(token: &str, secret: &str) -> Result<Claims, AuthError> {
    let key = DecodingKey::from_secret(secret.as_bytes());
    let validation = Validation::new(Algorithm::HS256);
    decode::<Claims>(token, &key, &validation)
        .map(|data| data.claims)
        .map_err(|_| AuthError::InvalidToken)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(secret: &str, sub: &str, exp: usize) -> String {
        encode(&Header::new(Algorithm::HS256), &Claims { sub: sub.into(), exp }, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn round_trips_a_valid_token() {
        let t = token("shh", "alice", 9_999_999_999);
        let claims = verify(&t, "shh").unwrap();
        assert_eq!(claims.sub, "alice");
    }

    #[test]
    fn rejects_wrong_secret() {
        let t = token("shh", "alice", 9_999_999_999);
        assert!(verify(&t, "other").is_err());
    }

    #[test]
    fn rejects_expired_token() {
        let t = token("shh", "alice", 1);
        assert!(verify(&t, "shh").is_err());
    }
}
