//! Identity token verification.
//!
//! Tokens are JWTs issued elsewhere. The relay only verifies them against a
//! pre-distributed key and never issues tokens itself.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::{RelayError, Result};

/// Claims the relay reads from an identity token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID).
    pub sub: String,
    /// Display name.
    pub preferred_username: String,
    /// Expiration timestamp.
    pub exp: u64,
    /// Issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// A verified identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    /// Stable user ID (token subject).
    pub user_id: String,
    /// Display name used as the message sender.
    pub username: String,
}

impl From<Claims> for Identity {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.sub,
            username: claims.preferred_username,
        }
    }
}

/// Verifies identity tokens.
#[derive(Clone)]
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// Create a verifier for RS256 tokens signed by the holder of `public_key_pem`.
    pub fn rs256(public_key_pem: &str) -> Result<Self> {
        let decoding_key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
            .map_err(|e| RelayError::Config(format!("invalid RSA public key: {e}")))?;
        Ok(Self::with_key(decoding_key, Algorithm::RS256))
    }

    /// Create a verifier for HS256 tokens signed with a shared secret.
    pub fn hs256(secret: &str) -> Self {
        Self::with_key(DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256)
    }

    fn with_key(decoding_key: DecodingKey, algorithm: Algorithm) -> Self {
        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            decoding_key,
            validation,
        }
    }

    /// Build the verifier described by the configuration.
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let verifier = match config.algorithm.to_uppercase().as_str() {
            "RS256" => Self::rs256(&config.resolve_public_key()?)?,
            "HS256" => {
                if config.secret.is_empty() {
                    return Err(RelayError::Config("auth.secret is empty".to_string()));
                }
                Self::hs256(&config.secret)
            }
            other => {
                return Err(RelayError::Config(format!(
                    "unsupported auth.algorithm: {other}"
                )))
            }
        };

        let verifier = match &config.audience {
            Some(audience) => verifier.with_audience(audience),
            None => verifier,
        };
        Ok(match &config.issuer {
            Some(issuer) => verifier.with_issuer(issuer),
            None => verifier,
        })
    }

    /// Require the `aud` claim to contain `audience`.
    pub fn with_audience(mut self, audience: &str) -> Self {
        self.validation.set_audience(&[audience]);
        self.validation.validate_aud = true;
        self.validation.required_spec_claims.insert("aud".to_string());
        self
    }

    /// Require the `iss` claim to be present and equal `issuer`.
    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self.validation.required_spec_claims.insert("iss".to_string());
        self
    }

    /// Verify a token and return the identity it carries.
    pub fn verify(&self, token: &str) -> Result<Identity> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            tracing::debug!("Token validation failed: {}", e);
            RelayError::Auth("invalid or expired token".to_string())
        })?;

        if data.claims.sub.is_empty() {
            return Err(RelayError::Auth("token has an empty subject".to_string()));
        }
        Ok(data.claims.into())
    }
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("algorithms", &self.validation.algorithms)
            .finish()
    }
}
