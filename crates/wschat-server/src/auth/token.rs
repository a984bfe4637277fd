//! HMAC identity tokens.
//!
//! A token binds a user id to an expiry time and is signed with a shared
//! secret, so an external issuer can vouch for `userId` without a round trip.
//! Format (hex-encoded): `[8-byte big-endian expiry][32-byte HMAC-SHA256]`,
//! where the MAC covers `expiry || user_id`.

use ring::hmac;
use std::time::{SystemTime, UNIX_EPOCH};
use wschat_core::{ChatError, ChatResult};

const TOKEN_LEN: usize = 8 + 32;

/// Issue a token for `user_id`, valid for `ttl_secs`.
pub fn issue_token(secret: &[u8], user_id: &str, ttl_secs: u64) -> String {
    issue_token_until(secret, user_id, unix_now().saturating_add(ttl_secs))
}

/// Issue a token that expires at `expiry` (seconds since the Unix epoch).
pub fn issue_token_until(secret: &[u8], user_id: &str, expiry: u64) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, &signed_data(expiry, user_id));

    let mut token = Vec::with_capacity(TOKEN_LEN);
    token.extend_from_slice(&expiry.to_be_bytes());
    token.extend_from_slice(tag.as_ref());
    hex::encode(token)
}

/// Check signature and expiry of a token presented for `user_id`.
pub fn verify_token(secret: &[u8], user_id: &str, token: &str) -> ChatResult<()> {
    let raw = hex::decode(token).map_err(|_| ChatError::Auth("token is not hex".into()))?;
    if raw.len() != TOKEN_LEN {
        return Err(ChatError::Auth(format!(
            "invalid token length: expected {TOKEN_LEN}, got {}",
            raw.len()
        )));
    }

    let mut expiry_bytes = [0u8; 8];
    expiry_bytes.copy_from_slice(&raw[..8]);
    let expiry = u64::from_be_bytes(expiry_bytes);

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    hmac::verify(&key, &signed_data(expiry, user_id), &raw[8..])
        .map_err(|_| ChatError::Auth("invalid token signature".into()))?;

    if unix_now() > expiry {
        return Err(ChatError::Auth("token expired".into()));
    }
    Ok(())
}

/// Generate a random 32-byte secret.
pub fn generate_secret() -> ChatResult<Vec<u8>> {
    use ring::rand::{SecureRandom, SystemRandom};
    let mut secret = vec![0u8; 32];
    SystemRandom::new()
        .fill(&mut secret)
        .map_err(|_| ChatError::Auth("system RNG unavailable".into()))?;
    Ok(secret)
}

fn signed_data(expiry: u64, user_id: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(8 + user_id.len());
    data.extend_from_slice(&expiry.to_be_bytes());
    data.extend_from_slice(user_id.as_bytes());
    data
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
