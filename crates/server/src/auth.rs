use anyhow::{bail, Context};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use shared::domain::UserId;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

/// Checks the bearer token a websocket client presents. Tokens are issued
/// elsewhere; this side only verifies them.
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str, algorithm: &str) -> anyhow::Result<Self> {
        let algorithm: Algorithm = algorithm
            .parse()
            .with_context(|| format!("unsupported jwt algorithm '{algorithm}'"))?;
        let mut validation = Validation::new(algorithm);
        // `exp` is honoured when present but not required.
        validation.set_required_spec_claims::<&str>(&[]);
        Ok(Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    /// Accepts `token` only if it verifies and its subject is `user_id`.
    pub fn verify(&self, token: &str, user_id: UserId) -> anyhow::Result<()> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .context("token failed verification")?;
        if data.claims.sub != user_id.to_string() {
            bail!("token subject {} does not match user {user_id}", data.claims.sub);
        }
        Ok(())
    }
}
