//! Credential gate shared by every transport.
//!
//! Only the gating contract lives here: a transport extracts the presented
//! credential, asks an [`Authenticator`], and refuses the connection on
//! error. How credentials are issued is out of scope.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use conduit_rpc::{Identity, RpcError};
use conduit_settings::AuthSettings;

/// Why a credential was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// Authentication is required and nothing was presented.
    #[error("missing credential")]
    Missing,
    /// A credential was presented and rejected.
    #[error("invalid credential")]
    Invalid,
}

impl From<AuthError> for RpcError {
    fn from(err: AuthError) -> Self {
        Self::Unauthorized {
            message: err.to_string(),
        }
    }
}

/// Decides whether a presented credential admits a connection.
pub trait Authenticator: Send + Sync {
    /// `Ok(None)` admits an anonymous connection.
    fn authenticate(&self, credential: Option<&str>) -> Result<Option<Identity>, AuthError>;
}

/// Accepts a fixed list of bearer tokens.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    required: bool,
    tokens: Vec<String>,
}

impl StaticTokenAuthenticator {
    /// Authenticator over `tokens`.
    pub fn new(required: bool, tokens: Vec<String>) -> Self {
        Self { required, tokens }
    }

    /// Authenticator configured from settings.
    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self::new(settings.required, settings.tokens.clone())
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, credential: Option<&str>) -> Result<Option<Identity>, AuthError> {
        let matched = credential.and_then(|presented| {
            self.tokens
                .iter()
                .position(|t| constant_time_eq(t.as_bytes(), presented.as_bytes()))
        });
        match (matched, credential, self.required) {
            (Some(index), _, _) => Ok(Some(Identity::bearer(format!("token-{index}")))),
            (None, None, true) => Err(AuthError::Missing),
            (None, Some(_), true) => Err(AuthError::Invalid),
            (None, _, false) => Ok(None),
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        let token = token.trim();
        (!token.is_empty()).then_some(token)
    } else {
        None
    }
}
