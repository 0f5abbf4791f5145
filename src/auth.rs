//! Identity provider token validation
//!
//! Validates bearer tokens issued by an AWS-Cognito-style identity provider
//! against the pool's JWKS endpoint. The key set is fetched once and cached
//! for the life of the process. Every failure here is a hard rejection; auth
//! errors are never softened into chat replies.

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::info;

use crate::error::AgentError;
use crate::Result;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub region: String,
    pub user_pool_id: String,
    pub client_id: String,
}

impl AuthConfig {
    pub fn issuer(&self) -> String {
        format!(
            "https://cognito-idp.{}.amazonaws.com/{}",
            self.region, self.user_pool_id
        )
    }

    pub fn jwks_url(&self) -> String {
        format!("{}/.well-known/jwks.json", self.issuer())
    }
}

/// The identity a validated token yields. The ledger is not partitioned by
/// user; this is used for authorization and logging only.
#[derive(Debug, Clone, Serialize)]
pub struct UserIdentity {
    pub id: String,
    pub username: String,
    pub email: String,
    pub verified: bool,
}

#[derive(Debug, Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    #[serde(default)]
    kid: String,
    #[serde(default)]
    n: String,
    #[serde(default)]
    e: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(rename = "cognito:username", default)]
    cognito_username: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_verified: bool,
}

pub struct TokenVerifier {
    config: AuthConfig,
    client: Client,
    keys: OnceCell<Jwks>,
}

impl TokenVerifier {
    pub fn new(config: AuthConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            config,
            client,
            keys: OnceCell::new(),
        }
    }

    /// Fetch and cache the provider's public keys. No invalidation short of
    /// a process restart.
    async fn public_keys(&self) -> Result<&Jwks> {
        self.keys
            .get_or_try_init(|| async {
                info!("Fetching identity provider public keys");

                let response = self
                    .client
                    .get(self.config.jwks_url())
                    .send()
                    .await
                    .map_err(|e| {
                        AgentError::UpstreamAuth(format!("Unable to fetch public keys: {}", e))
                    })?;

                if !response.status().is_success() {
                    return Err(AgentError::UpstreamAuth(format!(
                        "Public key endpoint returned {}",
                        response.status()
                    )));
                }

                response.json::<Jwks>().await.map_err(|e| {
                    AgentError::UpstreamAuth(format!("Bad public key payload: {}", e))
                })
            })
            .await
    }

    /// Validate a bearer token and extract the caller's identity.
    pub async fn verify(&self, token: &str) -> Result<UserIdentity> {
        let header = decode_header(token)
            .map_err(|e| AgentError::UpstreamAuth(format!("Invalid token header: {}", e)))?;
        let kid = header
            .kid
            .ok_or_else(|| AgentError::UpstreamAuth("Token header missing 'kid'".to_string()))?;

        let jwks = self.public_keys().await?;
        let jwk = jwks.keys.iter().find(|key| key.kid == kid).ok_or_else(|| {
            AgentError::UpstreamAuth("Unable to find appropriate public key".to_string())
        })?;

        let decoding_key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e)
            .map_err(|e| AgentError::UpstreamAuth(format!("Bad public key material: {}", e)))?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[self.config.client_id.as_str()]);
        validation.set_issuer(&[self.config.issuer()]);

        let token_data = decode::<Claims>(token, &decoding_key, &validation)
            .map_err(|e| AgentError::UpstreamAuth(format!("Invalid JWT token: {}", e)))?;

        let claims = token_data.claims;
        Ok(UserIdentity {
            id: claims.sub,
            username: claims
                .cognito_username
                .or(claims.username)
                .unwrap_or_default(),
            email: claims.email.unwrap_or_default(),
            verified: claims.email_verified,
        })
    }
}
