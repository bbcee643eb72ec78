//! HMAC-SHA256 request signing and verification.
//!
//! Every `InvokeMethod` request carries a hex-encoded HMAC over the
//! canonical message `"{method_id}:{client_id}:{timestamp}"`, keyed by the
//! client's API key. Verification compares in constant time and bounds the
//! timestamp to a replay window; both checks reject independently.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Maximum allowed skew between a request timestamp and the verifier's
/// clock, in seconds. Anything at or beyond this is treated as a replay.
pub const REPLAY_WINDOW_SECS: u64 = 300;

/// The string both sides sign: `"{method_id}:{client_id}:{timestamp}"`.
#[must_use]
pub fn canonical_message(method_id: &str, client_id: &str, timestamp: u64) -> String {
    format!("{method_id}:{client_id}:{timestamp}")
}

/// Computes the hex-encoded HMAC-SHA256 signature for a request.
#[must_use]
pub fn sign(api_key: &str, method_id: &str, client_id: &str, timestamp: u64) -> String {
    // HMAC accepts keys of any length; new_from_slice cannot fail for SHA-256.
    let mut mac = HmacSha256::new_from_slice(api_key.as_bytes())
        .expect("HMAC-SHA256 accepts any key length");
    mac.update(canonical_message(method_id, client_id, timestamp).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison of a presented signature against the expected
/// HMAC for the given request fields.
#[must_use]
pub fn verify(
    api_key: &str,
    method_id: &str,
    client_id: &str,
    timestamp: u64,
    signature: &str,
) -> bool {
    let expected = sign(api_key, method_id, client_id, timestamp);
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

/// Whether `timestamp` falls inside the replay window around `now`.
#[must_use]
pub fn timestamp_in_window(now: u64, timestamp: u64) -> bool {
    now.abs_diff(timestamp) < REPLAY_WINDOW_SECS
}

/// Current unix time in whole seconds.
///
/// A clock set before the epoch yields 0, which the replay window then
/// rejects; the failure mode is closed, not permissive.
#[must_use]
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
