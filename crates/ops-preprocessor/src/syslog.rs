//! Syslog wire protocol parsing (spec §4.5, §6): RFC 3164 and RFC 5424,
//! auto-detected by the presence of a version digit right after the PRI.

use once_cell::sync::Lazy;
use ops_common::{Error, Result};
use regex::Regex;

/// Topics the device vocabulary recognizes for the message/topic split.
/// Not an exhaustive device grammar (the core explicitly stops at a
/// topic/keyword classifier, spec §1 Non-goals) — just the prefixes that
/// route a message to a category instead of falling back to `unknown`.
const KNOWN_TOPICS: &[&str] = &[
    "system", "interface", "firewall", "dhcp", "wireless", "routing", "script", "account", "ppp", "ipsec", "ntp",
    "dns", "vpn", "critical", "error", "warning", "info", "manager",
];

static PRI_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^<(\d{1,3})>").unwrap());
static TOPIC_PREFIX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([a-z,]+)\s(.*)$").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub struct SyslogMessage {
    pub facility: u8,
    pub severity: u8,
    pub hostname: String,
    pub topic: String,
    pub message: String,
}

/// Parse a single syslog line into its structured fields. `unknown` topic if
/// the message prefix doesn't match the known vocabulary.
pub fn parse_syslog(line: &str) -> Result<SyslogMessage> {
    let pri_caps = PRI_RE
        .captures(line)
        .ok_or_else(|| Error::Validation("syslog message missing PRI header".into()))?;
    let pri: u16 = pri_caps[1].parse().map_err(|_| Error::Validation("invalid PRI value".into()))?;
    let facility = (pri / 8) as u8;
    let severity = (pri % 8) as u8;
    let rest = &line[pri_caps[0].len()..];

    let (hostname, message) = if is_rfc5424(rest) {
        parse_rfc5424(rest)?
    } else {
        parse_rfc3164(rest)?
    };

    let (topic, message) = split_topic(&message);

    Ok(SyslogMessage {
        facility,
        severity,
        hostname,
        topic,
        message,
    })
}

fn is_rfc5424(rest: &str) -> bool {
    rest.chars().next().is_some_and(|c| c.is_ascii_digit()) && rest.split_whitespace().next().map(|t| t.chars().all(|c| c.is_ascii_digit())).unwrap_or(false)
}

/// `VER TS HOST APP PROCID MSGID SD MSG` — this implementation treats
/// structured data as opaque and requires it to be `-` (absent) or a single
/// bracketed token, which covers the device traffic this core handles.
fn parse_rfc5424(rest: &str) -> Result<(String, String)> {
    let mut parts = rest.splitn(7, ' ');
    let _version = parts.next().ok_or_else(|| Error::Validation("rfc5424: missing version".into()))?;
    let _timestamp = parts.next().ok_or_else(|| Error::Validation("rfc5424: missing timestamp".into()))?;
    let hostname = parts.next().ok_or_else(|| Error::Validation("rfc5424: missing hostname".into()))?.to_string();
    let _app = parts.next();
    let _procid = parts.next();
    let _msgid = parts.next();
    let remainder = parts.next().unwrap_or("").to_string();
    // remainder is "SD MSG" or just "MSG" if SD was folded into msgid absence; split on first space after SD token.
    let message = match remainder.find(' ') {
        Some(idx) if remainder.starts_with('-') || remainder.starts_with('[') => remainder[idx + 1..].to_string(),
        _ => remainder,
    };
    Ok((hostname, message))
}

/// `MMM DD HH:MM:SS HOST MSG`
fn parse_rfc3164(rest: &str) -> Result<(String, String)> {
    let rest = rest.trim_start();
    let mut parts = rest.splitn(5, ' ');
    let _month = parts.next().ok_or_else(|| Error::Validation("rfc3164: missing month".into()))?;
    let _day = parts.next().ok_or_else(|| Error::Validation("rfc3164: missing day".into()))?;
    let _time = parts.next().ok_or_else(|| Error::Validation("rfc3164: missing time".into()))?;
    let hostname = parts.next().ok_or_else(|| Error::Validation("rfc3164: missing hostname".into()))?.to_string();
    let message = parts.next().unwrap_or("").to_string();
    Ok((hostname, message))
}

fn split_topic(message: &str) -> (String, String) {
    if let Some(caps) = TOPIC_PREFIX_RE.captures(message) {
        let prefix = &caps[1];
        let body = caps[2].to_string();
        if prefix.split(',').any(|p| KNOWN_TOPICS.contains(&p)) {
            return (prefix.to_string(), body);
        }
    }
    ("unknown".to_string(), message.to_string())
}

/// First non-severity topic from a (possibly comma-separated) topic string,
/// used as the normalized event category (spec §4.5).
pub fn primary_topic(topic: &str) -> String {
    topic.split(',').next().unwrap_or("unknown").to_string()
}

/// Render a message back to RFC 3164 wire format, used only by tests
/// exercising the parse round-trip law (spec §8).
#[cfg(test)]
pub fn render_rfc3164(facility: u8, severity: u8, hostname: &str, topic: &str, message: &str) -> String {
    let pri = facility as u16 * 8 + severity as u16;
    format!("<{pri}>Jan  1 00:00:00 {hostname} {topic} {message}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3164_with_known_topic() {
        let msg = parse_syslog("<134>Jan  1 12:00:00 router1 interface ether1 link down").unwrap();
        assert_eq!(msg.facility, 16);
        assert_eq!(msg.severity, 6);
        assert_eq!(msg.hostname, "router1");
        assert_eq!(msg.topic, "interface");
        assert_eq!(msg.message, "ether1 link down");
    }

    #[test]
    fn falls_back_to_unknown_topic() {
        let msg = parse_syslog("<13>Jan  1 12:00:00 router1 some unstructured message here").unwrap();
        assert_eq!(msg.topic, "unknown");
        assert_eq!(msg.message, "some unstructured message here");
    }

    #[test]
    fn parses_rfc5424_with_structured_data_absent() {
        let msg = parse_syslog("<165>1 2024-01-01T00:00:00Z router1 app 123 - - firewall rule hit").unwrap();
        assert_eq!(msg.hostname, "router1");
        assert_eq!(msg.topic, "firewall");
        assert_eq!(msg.message, "rule hit");
    }

    #[test]
    fn round_trip_preserves_fields() {
        let rendered = render_rfc3164(16, 3, "router2", "interface", "ether2 link flap");
        let parsed = parse_syslog(&rendered).unwrap();
        assert_eq!(parsed.facility, 16);
        assert_eq!(parsed.severity, 3);
        assert_eq!(parsed.hostname, "router2");
        assert_eq!(parsed.topic, "interface");
        assert_eq!(parsed.message, "ether2 link flap");
    }

    #[test]
    fn rejects_missing_pri() {
        assert!(parse_syslog("no pri header here").is_err());
    }
}
