//! Runtime configuration
//!
//! Gathered once at startup and passed into the components that need it.
//! Nothing reads the environment after construction.

use std::env;

use crate::auth::AuthConfig;
use crate::interpreter::QueryStrategy;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: Option<String>,
    pub gemini_api_key: String,
    pub query_strategy: QueryStrategy,
    pub auth: Option<AuthConfig>,
}

impl Config {
    /// Read configuration from the environment. The binaries load `.env`
    /// before calling this.
    pub fn from_env() -> Self {
        let port = env::var("PORT")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(8000);

        let database_url = env::var("AGENT_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok();

        let gemini_api_key = env::var("GEMINI_API_KEY").unwrap_or_default();

        let query_strategy =
            QueryStrategy::from_config(&env::var("QUERY_STRATEGY").unwrap_or_default());

        // Auth is optional: without a configured user pool the API runs open
        // (development mode).
        let auth = match (
            env::var("COGNITO_USER_POOL_ID"),
            env::var("COGNITO_CLIENT_ID"),
        ) {
            (Ok(user_pool_id), Ok(client_id)) => Some(AuthConfig {
                region: env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
                user_pool_id,
                client_id,
            }),
            _ => None,
        };

        Self {
            port,
            database_url,
            gemini_api_key,
            query_strategy,
            auth,
        }
    }
}
