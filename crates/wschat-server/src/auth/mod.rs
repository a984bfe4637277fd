//! Identity verification for `auth` envelopes.
//!
//! The router asks an [`AuthBackend`] whether a client may attach a user id
//! to its connection. Which backend runs is a config choice.

pub mod rate_limit;
pub mod token;

pub use rate_limit::AuthRateLimiter;

use crate::config::{AuthConfig, BackendKind};
use std::sync::Arc;
use tracing::info;
use wschat_core::{ChatError, ChatResult};

/// Validates a client-supplied identity.
pub trait AuthBackend: Send + Sync {
    /// Accept or refuse `user_id`, optionally proven by `token`.
    fn verify(&self, user_id: &str, token: Option<&str>) -> ChatResult<()>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Takes the client at its word. Any non-empty user id is accepted as sent.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustBackend;

impl AuthBackend for TrustBackend {
    fn verify(&self, user_id: &str, _token: Option<&str>) -> ChatResult<()> {
        if user_id.is_empty() {
            return Err(ChatError::Auth("empty user id".into()));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "trust"
    }
}

/// Requires a token minted by [`token::issue_token`] with the shared secret.
pub struct HmacBackend {
    secret: Vec<u8>,
}

impl HmacBackend {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }
}

impl AuthBackend for HmacBackend {
    fn verify(&self, user_id: &str, token: Option<&str>) -> ChatResult<()> {
        let token = token.ok_or_else(|| ChatError::Auth("token required".into()))?;
        token::verify_token(&self.secret, user_id, token)
    }

    fn name(&self) -> &'static str {
        "hmac"
    }
}

/// Build the backend selected in `[auth]`.
pub fn backend_from_config(config: &AuthConfig) -> ChatResult<Arc<dyn AuthBackend>> {
    let backend: Arc<dyn AuthBackend> = match config.backend {
        BackendKind::Trust => Arc::new(TrustBackend),
        BackendKind::Hmac => Arc::new(HmacBackend::new(config.secret_bytes()?)),
    };
    info!(backend = backend.name(), "auth backend ready");
    Ok(backend)
}
