//! Heartbeat authentication token.
//!
//! `auth_token = HMAC-SHA256(auth_key, node_id || i64_be(timestamp_ms))`.
//! Without a configured key the token is 32 zero bytes.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use marathon_proto::AUTH_TOKEN_SIZE;

type HmacSha256 = Hmac<Sha256>;

/// Compute the auth token for one heartbeat. `key` of `None` (or empty)
/// yields the all-zero token.
pub fn auth_token(key: Option<&[u8]>, node_id: Uuid, timestamp_ms: i64) -> [u8; AUTH_TOKEN_SIZE] {
    let mut token = [0u8; AUTH_TOKEN_SIZE];
    let Some(key) = key.filter(|k| !k.is_empty()) else {
        return token;
    };
    // HMAC accepts any key length, so construction cannot fail.
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return token;
    };
    mac.update(node_id.as_bytes());
    mac.update(&timestamp_ms.to_be_bytes());
    token.copy_from_slice(&mac.finalize().into_bytes());
    token
}
