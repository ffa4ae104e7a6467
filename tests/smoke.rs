use parley::config::{AliasRole, Config};
use parley::redact::redact;
use parley::response::{ToolEnvelope, ToolMetadata};

#[test]
fn envelope_success_serializes_correctly() {
    let envelope = ToolEnvelope::success(
        r#"{"solution":"an answer"}"#.to_string(),
        ToolMetadata {
            tool_name: "debate_with_preset".to_string(),
            duration_seconds: 4.2,
        },
    );

    let json = serde_json::to_string(&envelope).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed["status"], "success");
    assert_eq!(parsed["content_type"], "text");
    assert_eq!(parsed["metadata"]["tool_name"], "debate_with_preset");
    assert!(parsed["metadata"]["duration_seconds"].is_f64());
}

#[test]
fn envelope_error_serializes_correctly() {
    let envelope = ToolEnvelope::error(
        "question too simple".to_string(),
        ToolMetadata {
            tool_name: "debate_with_preset".to_string(),
            duration_seconds: 0.001,
        },
    );
    let json = serde_json::to_string(&envelope).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed["status"], "error");
    assert_eq!(parsed["content"], "question too simple");
}

#[test]
fn registry_carries_the_five_alias_taxonomy_plus_coordinator() {
    let config = Config::from_env();

    for alias in ["k1", "k2", "k3", "k4", "k5"] {
        let entry = config.alias(alias).unwrap_or_else(|| panic!("{alias} missing"));
        assert_eq!(entry.role, AliasRole::Debater);
        assert!(entry.cost_per_ktok > 0.0);
        assert!(!entry.model_id.is_empty());
    }
    let coordinator = config.alias("coordinator").expect("coordinator present");
    assert_eq!(coordinator.role, AliasRole::Coordinator);

    // One TCP port per listener, no conflicts.
    let mut ports: Vec<u16> = config.aliases.values().map(|e| e.port).collect();
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), config.aliases.len(), "ports must be distinct");

    assert_eq!(config.debater_aliases(), vec!["k1", "k2", "k3", "k4", "k5"]);
    assert!(config.alias("k6").is_none(), "unknown aliases stay unknown");
}

#[test]
fn redaction_covers_the_sensitive_patterns() {
    let line = "user bob@corp.example wrote HMAC_SECRET=supersecret under /home/bob \
                with api_key=sk-live-123456789 and Authorization: Bearer abcdef0123456789";
    let out = redact(line);
    assert!(!out.contains("supersecret"));
    assert!(!out.contains("sk-live-123456789"));
    assert!(!out.contains("abcdef0123456789"));
    assert!(!out.contains("bob@corp.example"));
    assert!(!out.contains("/home/bob"));
}

#[test]
fn user_messages_do_not_leak_upstream_details() {
    use parley::error::ParleyError;

    let upstream = ParleyError::Upstream {
        provider: "k3".to_string(),
        message: "500: internal stack trace at https://internal.host/path".to_string(),
        status: Some(500),
    };
    let message = upstream.user_message();
    assert!(!message.contains("internal.host"));
    assert!(message.contains("k3"));

    let auth = ParleyError::AuthFailed {
        provider: "k1".to_string(),
        message: "invalid api key sk-live-xyz".to_string(),
    };
    assert!(!auth.user_message().contains("sk-live"));
}
