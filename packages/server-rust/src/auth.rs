//! Client authentication, request-signature validation, and permission checks.
//!
//! All three operations are pure decision functions: they fail closed,
//! report synchronously to the caller, and have no side effects beyond
//! logging. The registered-client table is a `DashMap` so concurrent
//! dispatch workers can authenticate without coordination.

use std::collections::HashSet;

use dashmap::DashMap;
use meshlink_core::signature;
use tracing::{info, warn};

/// Permission set granted to anonymous callers when [`AuthProvider`] runs
/// with `allow_anonymous` enabled.
pub const ANONYMOUS_PERMISSIONS: [&str; 3] = ["read", "write", "subscribe"];

/// Credentials registered for a single client.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub api_key: String,
    pub permissions: HashSet<String>,
}

/// Validates client identity, request signatures, and permission grants.
///
/// The permissive "development mode" of the original deployment (empty API
/// key accepted with full permissions) is an explicit opt-in flag here,
/// never the default: a server constructed with [`AuthProvider::new`]
/// rejects every request that is not backed by a registered credential.
#[derive(Debug, Default)]
pub struct AuthProvider {
    clients: DashMap<String, ClientCredentials>,
    allow_anonymous: bool,
}

impl AuthProvider {
    /// Creates a strict provider with no registered clients.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a provider that additionally accepts unauthenticated callers
    /// (empty API key, empty signature) with the fixed
    /// [`ANONYMOUS_PERMISSIONS`] grant. Intended for local development only.
    #[must_use]
    pub fn allow_anonymous() -> Self {
        Self {
            clients: DashMap::new(),
            allow_anonymous: true,
        }
    }

    /// Returns whether the anonymous bypass is enabled.
    #[must_use]
    pub fn is_anonymous_allowed(&self) -> bool {
        self.allow_anonymous
    }

    /// Registers (or replaces) a client's API key and permission set.
    pub fn register_client<I, S>(&self, client_id: &str, api_key: &str, permissions: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.clients.insert(
            client_id.to_string(),
            ClientCredentials {
                api_key: api_key.to_string(),
                permissions: permissions.into_iter().map(Into::into).collect(),
            },
        );
        info!(client_id, "registered client");
    }

    /// Validates an API key and returns the client's permission set on an
    /// exact match, `None` otherwise. Unknown clients and mismatched keys
    /// are rejected, never silently allowed.
    #[must_use]
    pub fn authenticate(&self, client_id: &str, api_key: &str) -> Option<HashSet<String>> {
        if self.allow_anonymous && api_key.is_empty() {
            info!(client_id, "anonymous mode: authenticated without API key");
            return Some(ANONYMOUS_PERMISSIONS.iter().map(ToString::to_string).collect());
        }

        if let Some(creds) = self.clients.get(client_id) {
            if creds.api_key == api_key {
                return Some(creds.permissions.clone());
            }
        }

        warn!(client_id, "authentication failed");
        None
    }

    /// Recomputes the expected HMAC-SHA256 signature and compares it in
    /// constant time, additionally bounding the request timestamp to the
    /// replay window. Signature mismatch and staleness each reject
    /// independently.
    #[must_use]
    pub fn validate_signature(
        &self,
        client_id: &str,
        method_id: &str,
        timestamp: u64,
        presented: &str,
    ) -> bool {
        let Some(creds) = self.clients.get(client_id) else {
            if self.allow_anonymous {
                info!(client_id, "anonymous mode: skipping signature validation");
                return true;
            }
            warn!(client_id, "signature validation for unknown client");
            return false;
        };

        if self.allow_anonymous && presented.is_empty() {
            info!(client_id, "anonymous mode: empty signature accepted");
            return true;
        }

        let signature_valid =
            signature::verify(&creds.api_key, method_id, client_id, timestamp, presented);
        if !signature_valid {
            warn!(client_id, "invalid request signature");
        }

        let now = signature::unix_timestamp();
        let timestamp_valid = signature::timestamp_in_window(now, timestamp);
        if !timestamp_valid {
            warn!(client_id, timestamp, "request timestamp outside replay window");
        }

        signature_valid && timestamp_valid
    }

    /// True iff `required_permission` is in the client's registered set.
    #[must_use]
    pub fn has_permission(&self, client_id: &str, required_permission: &str) -> bool {
        let Some(creds) = self.clients.get(client_id) else {
            if self.allow_anonymous {
                return true;
            }
            return false;
        };

        let granted = creds.permissions.contains(required_permission);
        if !granted {
            warn!(client_id, required_permission, "permission denied");
        }
        granted
    }
}

#[cfg(test)]
mod tests {
    use meshlink_core::signature::sign;

    use super::*;

    const KEY: &str = "sk_client1_12345abcde";

    fn provider() -> AuthProvider {
        let auth = AuthProvider::new();
        auth.register_client("client1", KEY, ["read", "write", "subscribe"]);
        auth.register_client("client2", "sk_client2_67890fghij", ["read"]);
        auth
    }

    #[test]
    fn authenticate_returns_exact_registered_permissions() {
        let auth = provider();
        let perms = auth.authenticate("client1", KEY).expect("valid pair");
        let expected: HashSet<String> =
            ["read", "write", "subscribe"].iter().map(ToString::to_string).collect();
        assert_eq!(perms, expected);

        let perms = auth.authenticate("client2", "sk_client2_67890fghij").unwrap();
        assert_eq!(perms.len(), 1);
        assert!(perms.contains("read"));
    }

    #[test]
    fn authenticate_rejects_invalid_pairs() {
        let auth = provider();
        assert!(auth.authenticate("client1", "wrong-key").is_none());
        assert!(auth.authenticate("nobody", KEY).is_none());
        assert!(auth.authenticate("client1", "").is_none());
    }

    #[test]
    fn anonymous_mode_grants_fixed_permissions_for_empty_key() {
        let auth = AuthProvider::allow_anonymous();
        let perms = auth.authenticate("anyone", "").expect("anonymous accepted");
        assert!(perms.contains("read"));
        assert!(perms.contains("write"));
        assert!(perms.contains("subscribe"));
        // A non-empty wrong key still fails even in anonymous mode.
        assert!(auth.authenticate("anyone", "bogus").is_none());
    }

    #[test]
    fn validate_signature_accepts_fresh_signed_request() {
        let auth = provider();
        let now = meshlink_core::signature::unix_timestamp();
        let sig = sign(KEY, "add", "client1", now);
        assert!(auth.validate_signature("client1", "add", now, &sig));
    }

    #[test]
    fn validate_signature_rejects_corrupted_signature() {
        let auth = provider();
        let now = meshlink_core::signature::unix_timestamp();
        let mut sig = sign(KEY, "add", "client1", now);
        let flipped = if sig.ends_with('0') { "1" } else { "0" };
        sig.replace_range(sig.len() - 1.., flipped);
        assert!(!auth.validate_signature("client1", "add", now, &sig));
    }

    #[test]
    fn validate_signature_rejects_stale_timestamp_with_correct_signature() {
        let auth = provider();
        let stale = meshlink_core::signature::unix_timestamp() - 301;
        let sig = sign(KEY, "add", "client1", stale);
        assert!(!auth.validate_signature("client1", "add", stale, &sig));
    }

    #[test]
    fn validate_signature_rejects_unknown_client_when_strict() {
        let auth = provider();
        let now = meshlink_core::signature::unix_timestamp();
        let sig = sign(KEY, "add", "ghost", now);
        assert!(!auth.validate_signature("ghost", "add", now, &sig));
    }

    #[test]
    fn has_permission_checks_registered_set() {
        let auth = provider();
        assert!(auth.has_permission("client1", "write"));
        assert!(auth.has_permission("client2", "read"));
        assert!(!auth.has_permission("client2", "write"));
        assert!(!auth.has_permission("ghost", "read"));
    }
}
