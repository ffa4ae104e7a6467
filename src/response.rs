use rmcp::model::{CallToolResult, Content};
use serde::Serialize;

/// Envelope every tool returns: a status, a JSON content payload, and call
/// metadata. Errors ride inside the payload (`"status": "error"`) so a
/// failed tool never becomes a transport-level failure for the MCP client.
#[derive(Debug, Serialize)]
pub struct ToolEnvelope {
    pub status: &'static str,
    pub content: String,
    pub content_type: &'static str,
    pub metadata: ToolMetadata,
}

#[derive(Debug, Serialize)]
pub struct ToolMetadata {
    pub tool_name: String,
    pub duration_seconds: f64,
}

impl ToolEnvelope {
    pub fn success(content: String, metadata: ToolMetadata) -> Self {
        Self {
            status: "success",
            content,
            content_type: "text",
            metadata,
        }
    }

    pub fn error(message: String, metadata: ToolMetadata) -> Self {
        Self {
            status: "error",
            content: message,
            content_type: "text",
            metadata,
        }
    }

    /// Convert to MCP CallToolResult, clamping non-finite durations so
    /// serialization can't fail on a weird clock.
    pub fn into_call_tool_result(mut self) -> CallToolResult {
        if !self.metadata.duration_seconds.is_finite() {
            self.metadata.duration_seconds = 0.0;
        }
        match serde_json::to_string(&self) {
            Ok(json) => CallToolResult::success(vec![Content::text(json)]),
            Err(e) => CallToolResult::success(vec![Content::text(format!(
                r#"{{"status":"error","content":"serialization failed: {e}","content_type":"text","metadata":{{}}}}"#
            ))]),
        }
    }
}
