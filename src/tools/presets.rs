use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::selection::Level;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListPresetsRequest {
    /// Include resolved rosters and cost estimates
    pub detailed: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct PresetCatalog {
    pub presets: Vec<PresetSummary>,
}

#[derive(Debug, Serialize)]
pub struct PresetSummary {
    pub id: String,
    pub name: String,
    pub description: String,
    pub max_rounds: usize,
    pub consensus_threshold: f64,
    pub intelligent_selection: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roster: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_time: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AnalyzePresetRequest {
    /// The question to analyze
    pub question: String,
    /// Project directory (reserved for context-aware analysis)
    pub project_path: Option<String>,
    /// How urgent the answer is (0..1)
    pub urgency: Option<f64>,
    /// Spend appetite (0..1)
    pub budget: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct PresetRecommendation {
    pub preset: String,
    pub reason: String,
    pub category: String,
    pub complexity: Level,
    pub criticality: Level,
    pub keywords: Vec<String>,
    pub estimated_cost: String,
    pub estimated_time: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EstimateCostRequest {
    /// Preset name to estimate
    pub preset: String,
    /// Question length in characters (defaults to a typical 200)
    pub question_length: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct CostEstimate {
    pub preset: String,
    pub estimated_tokens: f64,
    pub estimated_cost: String,
    pub estimated_time: String,
}
