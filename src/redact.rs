use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

/// Redaction rules applied to every persisted log stream and audit line.
/// Order matters: key/value patterns run before the bare-token patterns so
/// `api_key=sk-...` collapses to a single placeholder instead of two.
static RULES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r#"(?i)(api[_-]?key['"]?\s*[=:]\s*)[^\s,"'}]+"#).expect("api-key regex"),
            "$1[REDACTED_KEY]",
        ),
        (
            Regex::new(r#"(?i)((?:secret|password|passwd|token)['"]?\s*[=:]\s*)[^\s,"'}]+"#)
                .expect("secret regex"),
            "$1[REDACTED]",
        ),
        (
            Regex::new(r"(?i)bearer\s+[A-Za-z0-9._~+/=-]{8,}").expect("bearer regex"),
            "Bearer [REDACTED]",
        ),
        (
            Regex::new(r"\bsk-[A-Za-z0-9_-]{8,}\b").expect("sk-key regex"),
            "[REDACTED_KEY]",
        ),
        (
            Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("email regex"),
            "[EMAIL]",
        ),
        (
            Regex::new(r"/(?:home|Users)/[A-Za-z0-9._-]+").expect("home-path regex"),
            "[HOME]",
        ),
    ]
});

/// Redact sensitive material from text bound for disk or audit logs.
/// Returns borrowed input unchanged when nothing matches.
pub fn redact(input: &str) -> Cow<'_, str> {
    let mut touched = false;
    let mut current = Cow::Borrowed(input);
    for (pattern, replacement) in RULES.iter() {
        match pattern.replace_all(&current, *replacement) {
            Cow::Borrowed(_) => {}
            Cow::Owned(next) => {
                touched = true;
                current = Cow::Owned(next);
            }
        }
    }
    if touched {
        current
    } else {
        Cow::Borrowed(input)
    }
}
