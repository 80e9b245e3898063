use serde::Deserialize;
use std::{collections::HashSet, env, path::PathBuf};

/// Server configuration loaded from environment variables (with `.env`
/// support).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Server settings
    pub server_host: String,
    pub server_port: u16,

    // Storage settings
    pub database_path: PathBuf,

    // CORS settings
    pub cors_allowed_origins: Vec<String>,

    /// Bearer credentials the token-verification collaborator accepts, as
    /// `identity=token` entries.
    pub auth_tokens: Vec<(String, String)>,

    /// Identities allowed to connect; a verified token resolving to anything
    /// else is refused.
    pub allowed_clients: HashSet<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        Ok(Self {
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()
                .unwrap_or(8000),

            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "data/scanner_data.db".to_string())
                .into(),

            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000,http://localhost:5173".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),

            auth_tokens: parse_auth_tokens(
                &env::var("AUTH_TOKENS").unwrap_or_default(),
            ),

            allowed_clients: env::var("ALLOWED_CLIENTS")
                .unwrap_or_else(|_| "admin".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }
}

fn parse_auth_tokens(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|entry| {
            let (identity, token) = entry.split_once('=')?;
            let identity = identity.trim();
            let token = token.trim();
            if identity.is_empty() || token.is_empty() {
                return None;
            }
            Some((identity.to_string(), token.to_string()))
        })
        .collect()
}
