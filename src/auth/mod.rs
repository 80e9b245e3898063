//! Connection admission boundary.
//!
//! Token issuance lives outside this service; callers arrive with a bearer
//! credential that a [`TokenVerifier`] collaborator resolves to an
//! allow-listed identity. The shipped verifier hashes presented tokens and
//! resolves them against statically configured credentials.

use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::warn;

use crate::errors::AppError;
use crate::infra::app_state::AppState;
use crate::infra::config::Config;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication required")]
    MissingCredential,
    #[error("invalid credential")]
    InvalidToken,
    #[error("identity '{0}' is not permitted")]
    Forbidden(String),
}

/// External token-verification collaborator: accepts a bearer token and
/// resolves it to an allow-listed identity, or refuses.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<String, AuthError>;
}

/// Verifier over a static credential set. Tokens are held as sha256 digests
/// so the plaintext never sits in the lookup table.
#[derive(Debug, Default)]
pub struct StaticTokenVerifier {
    identities_by_hash: HashMap<String, String>,
    allowed: HashSet<String>,
}

impl StaticTokenVerifier {
    pub fn new(
        tokens: impl IntoIterator<Item = (String, String)>,
        allowed: HashSet<String>,
    ) -> Self {
        let identities_by_hash = tokens
            .into_iter()
            .map(|(identity, token)| (hash_token(&token), identity))
            .collect();
        Self {
            identities_by_hash,
            allowed,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.auth_tokens.clone(), config.allowed_clients.clone())
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Result<String, AuthError> {
        let identity = self
            .identities_by_hash
            .get(&hash_token(token))
            .ok_or(AuthError::InvalidToken)?;

        if !self.allowed.contains(identity) {
            return Err(AuthError::Forbidden(identity.clone()));
        }
        Ok(identity.clone())
    }
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Identity of the verified caller, inserted into request extensions.
#[derive(Debug, Clone)]
pub struct AuthenticatedClient(pub String);

/// REST middleware: require a valid bearer credential, reject with 401/403.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = bearer_token(request.headers()).ok_or(AuthError::MissingCredential)?;
    let identity = state.token_verifier.verify(&token)?;

    request.extensions_mut().insert(AuthenticatedClient(identity));
    Ok(next.run(request).await)
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?;
    Some(token.to_string())
}

/// Credential extraction for WebSocket admission: the authorization header,
/// or a query-parameter fallback kept for clients that cannot set headers
/// during the upgrade. The fallback is logged whenever it is used.
pub fn admission_token(
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<String, AuthError> {
    if let Some(token) = bearer_token(headers) {
        return Ok(token);
    }
    if let Some(token) = query_token.filter(|t| !t.is_empty()) {
        warn!("credential presented via query parameter");
        return Ok(token.to_string());
    }
    Err(AuthError::MissingCredential)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn verifier() -> StaticTokenVerifier {
        StaticTokenVerifier::new(
            [
                ("admin".to_string(), "s3cret".to_string()),
                ("ghost".to_string(), "spooky".to_string()),
            ],
            HashSet::from(["admin".to_string()]),
        )
    }

    #[test]
    fn valid_token_resolves_to_identity() {
        assert_eq!(verifier().verify("s3cret").unwrap(), "admin");
    }

    #[test]
    fn unknown_token_is_invalid() {
        assert!(matches!(
            verifier().verify("wrong"),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn valid_token_for_unlisted_identity_is_forbidden() {
        assert!(matches!(
            verifier().verify("spooky"),
            Err(AuthError::Forbidden(identity)) if identity == "ghost"
        ));
    }

    #[test]
    fn admission_prefers_header_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer from-header"),
        );
        assert_eq!(
            admission_token(&headers, Some("from-query")).unwrap(),
            "from-header"
        );
    }

    #[test]
    fn admission_falls_back_to_query_parameter() {
        let headers = HeaderMap::new();
        assert_eq!(
            admission_token(&headers, Some("from-query")).unwrap(),
            "from-query"
        );
        assert!(matches!(
            admission_token(&headers, None),
            Err(AuthError::MissingCredential)
        ));
    }
}
