use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;

use crate::redact::redact;

/// Heuristics for request bodies that look like injection attempts.
/// A match only flags the audit line; it never blocks the request.
static SUSPICIOUS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)<\s*script").expect("script regex"),
        Regex::new(r"(?i)\b(union\s+select|drop\s+table|insert\s+into)\b").expect("sql regex"),
        Regex::new(r"(?i)(;\s*(rm|curl|wget)\s|\$\(|`)").expect("command regex"),
        Regex::new(r"\.\./").expect("traversal regex"),
    ]
});

pub fn is_suspicious(body: &str) -> bool {
    SUSPICIOUS.iter().any(|p| p.is_match(body))
}

/// One audit line per gateway request: method, URL, client IP, suspicious
/// flag. Bodies are inspected but never logged verbatim.
pub fn log_request(alias: &str, method: &str, uri: &str, client: IpAddr, body: &[u8]) {
    let text = String::from_utf8_lossy(body);
    let suspicious = is_suspicious(&text);
    if suspicious {
        tracing::warn!(
            alias,
            method,
            uri = %redact(uri),
            %client,
            suspicious,
            "gateway request flagged by audit heuristics"
        );
    } else {
        tracing::info!(alias, method, uri = %redact(uri), %client, suspicious, "gateway request");
    }
}
