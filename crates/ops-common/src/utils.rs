//! Small stateless helpers shared across components.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

/// Wildcard resource match: `*` may appear as a suffix or infix, matching
/// any run of characters in its place (spec §4.6, §4.5 maintenance window
/// resource matching).
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut pos = 0usize;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !value[pos..].starts_with(part) {
                return false;
            }
            pos += part.len();
        } else if i == parts.len() - 1 {
            return value[pos..].ends_with(part);
        } else if let Some(found) = value[pos..].find(part) {
            pos += found + part.len();
        } else {
            return false;
        }
    }
    true
}

static RE_IPV4: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap());
static RE_IPV6: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:[0-9a-fA-F]{1,4}:){2,7}[0-9a-fA-F]{0,4}\b").unwrap());
static RE_ISO8601: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?").unwrap()
});
static RE_EPOCH: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{10,13}\b").unwrap());
static RE_PORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(:\d{2,5}\b|\bport\s+\d{2,5}\b)").unwrap());
static RE_UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b").unwrap()
});
static RE_HEX_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b[0-9a-f]{16,32}\b").unwrap());

/// Replace dynamic substrings (IPs, timestamps, ports, UUIDs, hex session
/// tokens) with fixed placeholder tokens, so that two messages differing
/// only in these fields normalize to the same string (spec §4.2).
pub fn normalize_message(message: &str) -> String {
    let s = RE_ISO8601.replace_all(message, "<TIMESTAMP>");
    let s = RE_EPOCH.replace_all(&s, "<TIMESTAMP>");
    let s = RE_IPV6.replace_all(&s, "<IP>");
    let s = RE_IPV4.replace_all(&s, "<IP>");
    let s = RE_PORT.replace_all(&s, "<PORT>");
    let s = RE_UUID.replace_all(&s, "<SESSION>");
    let s = RE_HEX_TOKEN.replace_all(&s, "<SESSION>");
    s.into_owned()
}

/// Stable (non-cryptographic) hash used for fingerprints, rendered as hex.
pub fn stable_hash(parts: &[&str]) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    for part in parts {
        part.hash(&mut hasher);
        0u8.hash(&mut hasher); // separator so "ab"+"c" != "a"+"bc"
    }
    format!("{:016x}", hasher.finish())
}

/// Human-readable RouterOS-style uptime (`NwNdNhNmNs`) to seconds.
pub fn parse_uptime(uptime: &str) -> u64 {
    static RE_COMPONENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)([wdhms])").unwrap());
    let mut total = 0u64;
    for cap in RE_COMPONENT.captures_iter(uptime) {
        let value: u64 = cap[1].parse().unwrap_or(0);
        let unit = &cap[2];
        total += match unit {
            "w" => value * 604_800,
            "d" => value * 86_400,
            "h" => value * 3_600,
            "m" => value * 60,
            "s" => value,
            _ => 0,
        };
    }
    total
}

/// Whether `when` falls within `[start, end]` inclusive.
pub fn in_range(when: DateTime<Utc>, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    when >= start && when <= end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_suffix_and_infix() {
        assert!(wildcard_match("ether*", "ether1"));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("eth*1", "ethX1"));
        assert!(!wildcard_match("ether*", "wlan1"));
    }

    #[test]
    fn normalize_message_replaces_dynamic_fields() {
        let a = "link down on 10.0.0.1:22 at 2024-01-01T00:00:00Z session ab12cd34ab12cd34";
        let b = "link down on 192.168.1.5:8443 at 2024-06-05T12:30:00Z session 00ff00ff00ff00ff";
        assert_eq!(normalize_message(a), normalize_message(b));
    }

    #[test]
    fn parse_uptime_handles_all_units() {
        assert_eq!(parse_uptime("1w2d3h4m5s"), 604_800 + 2 * 86_400 + 3 * 3600 + 4 * 60 + 5);
        assert_eq!(parse_uptime("5s"), 5);
    }

    #[test]
    fn fingerprint_is_order_sensitive() {
        assert_ne!(stable_hash(&["a", "bc"]), stable_hash(&["ab", "c"]));
        assert_eq!(stable_hash(&["a", "b"]), stable_hash(&["a", "b"]));
    }
}
