use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Request to deliberate a question across a panel of models.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct DebateRequest {
    /// The question to deliberate (minimum 15 significant characters)
    pub question: String,
    /// Preset name (rapid, balanced, maximum-accuracy, cost-optimized,
    /// deep-analysis, security-focused). Omit for automatic selection.
    pub preset: Option<String>,
    /// Project directory; changes to its files invalidate cached results
    pub project_path: Option<String>,
    /// How urgent the answer is (0..1); above 0.8 forces the rapid preset
    pub urgency: Option<f64>,
    /// Spend appetite (0..1); below 0.3 forces the cost-optimized preset
    pub budget: Option<f64>,
    /// Bypass the result cache and deliberate fresh
    pub fresh: Option<bool>,
    /// Fine-grained overrides of the selected preset
    pub overrides: Option<DebateOverrides>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DebateOverrides {
    /// Roster override, e.g. ["k1:2", "k3"] (instance counts allowed)
    pub models: Option<Vec<String>>,
    /// Reserved: request an extra verification pass after synthesis
    pub verification: Option<bool>,
    /// Per-debate wall clock override in minutes
    pub timeout_minutes: Option<u64>,
}

/// Final result of one deliberation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateResult {
    /// The synthesized answer — the primary output
    pub solution: String,
    /// Alias of the highest-scored individual position (metadata)
    pub winner: String,
    /// Final consensus score, 0–100
    pub score: f64,
    /// Aliases that contributed at least one position
    pub contributors: Vec<String>,
    pub rounds: usize,
    pub from_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<PresetReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<ConfidenceReport>,
    pub cancelled: bool,
    /// "coordinator" when the synthesizer model wrote the answer,
    /// "fallback" for deterministic concatenation
    pub synthesized_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetReport {
    pub id: String,
    pub name: String,
    pub actual_time: String,
    pub actual_cost: String,
    pub estimated_time: String,
    pub estimated_cost: String,
    pub overrides: Vec<String>,
    pub selection_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceReport {
    /// 0–100
    pub score: f64,
    pub level: String,
    pub factors: Vec<String>,
}
