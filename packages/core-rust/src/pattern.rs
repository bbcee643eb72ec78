//! Prefix-wildcard matching of event types against subscription patterns.
//!
//! The same rule runs on both sides of the wire: the server filters
//! broadcasts per subscription, and the client filters a `"*"` stream
//! against its locally registered handlers.

/// Returns whether `event_type` matches a subscription `pattern`.
///
/// - `"*"` matches every event type.
/// - A pattern ending in `"*"` matches by prefix (trailing `*` stripped).
/// - Any other pattern matches only by exact equality.
#[must_use]
pub fn pattern_matches(event_type: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return event_type.starts_with(prefix);
    }
    event_type == pattern
}
