use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::ParleyError;

/// One concrete debater slot: an alias plus an instance index, so `k1:2`
/// expands to two independent entries sharing the alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub alias: String,
    pub instance: usize,
}

impl RosterEntry {
    pub fn label(&self) -> String {
        if self.instance == 0 {
            self.alias.clone()
        } else {
            format!("{}#{}", self.alias, self.instance + 1)
        }
    }
}

/// Expand a roster spec (`["k1:2", "k3"]`) into concrete entries.
pub fn expand_roster(spec: &[String]) -> Vec<RosterEntry> {
    let mut entries = Vec::new();
    for item in spec {
        let (alias, count) = match item.split_once(':') {
            Some((alias, count)) => (alias, count.parse().unwrap_or(1)),
            None => (item.as_str(), 1usize),
        };
        let alias = alias.trim();
        if alias.is_empty() {
            continue;
        }
        // Instance numbering continues across repeated mentions of an alias.
        let existing = entries.iter().filter(|e: &&RosterEntry| e.alias == alias).count();
        for i in 0..count.max(1) {
            entries.push(RosterEntry {
                alias: alias.to_string(),
                instance: existing + i,
            });
        }
    }
    entries
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum PresetId {
    Rapid,
    CostOptimized,
    Balanced,
    MaximumAccuracy,
    DeepAnalysis,
    SecurityFocused,
}

impl PresetId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rapid => "rapid",
            Self::CostOptimized => "cost-optimized",
            Self::Balanced => "balanced",
            Self::MaximumAccuracy => "maximum-accuracy",
            Self::DeepAnalysis => "deep-analysis",
            Self::SecurityFocused => "security-focused",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "rapid" => Some(Self::Rapid),
            "cost-optimized" => Some(Self::CostOptimized),
            "balanced" => Some(Self::Balanced),
            "maximum-accuracy" => Some(Self::MaximumAccuracy),
            "deep-analysis" => Some(Self::DeepAnalysis),
            "security-focused" => Some(Self::SecurityFocused),
            _ => None,
        }
    }
}

/// Static description of one preset. Roster specs reference aliases
/// symbolically; `fastest`/`cheapest` resolve against the registry at
/// selection time.
pub struct Preset {
    pub id: PresetId,
    pub name: &'static str,
    pub roster_spec: &'static [&'static str],
    pub max_rounds: usize,
    pub consensus_threshold: f64,
    pub intelligent_selection: bool,
    pub description: &'static str,
}

pub const PRESETS: &[Preset] = &[
    Preset {
        id: PresetId::Rapid,
        name: "Rapid",
        roster_spec: &["fastest:3"],
        max_rounds: 1,
        consensus_threshold: 70.0,
        intelligent_selection: false,
        description: "Three instances of the fastest model, one round.",
    },
    Preset {
        id: PresetId::CostOptimized,
        name: "Cost optimized",
        roster_spec: &["cheapest"],
        max_rounds: 1,
        consensus_threshold: 60.0,
        intelligent_selection: false,
        description: "A single instance of the cheapest model.",
    },
    Preset {
        id: PresetId::Balanced,
        name: "Balanced",
        roster_spec: &["k1", "k2", "k4"],
        max_rounds: 3,
        consensus_threshold: 80.0,
        intelligent_selection: true,
        description: "Three diverse models, up to three rounds.",
    },
    Preset {
        id: PresetId::MaximumAccuracy,
        name: "Maximum accuracy",
        roster_spec: &["k1:2", "k2", "k3", "k4:2", "k5"],
        max_rounds: 5,
        consensus_threshold: 95.0,
        intelligent_selection: false,
        description: "All five models, the heavyweights doubled.",
    },
    Preset {
        id: PresetId::DeepAnalysis,
        name: "Deep analysis",
        roster_spec: &["k1", "k3", "k4", "k5"],
        max_rounds: 5,
        consensus_threshold: 90.0,
        intelligent_selection: true,
        description: "Four models weighted toward analysis specialists.",
    },
    Preset {
        id: PresetId::SecurityFocused,
        name: "Security focused",
        roster_spec: &["k4", "k5", "k1"],
        max_rounds: 4,
        consensus_threshold: 95.0,
        intelligent_selection: false,
        description: "Security specialists first, high consensus bar.",
    },
];

pub fn preset(id: PresetId) -> &'static Preset {
    PRESETS
        .iter()
        .find(|p| p.id == id)
        .expect("preset catalog covers every id")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Low,
    Medium,
    High,
}

/// Output of the lightweight question categorizer.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct QuestionProfile {
    pub category: String,
    pub complexity: Level,
    pub criticality: Level,
    pub keywords: Vec<String>,
}

const SECURITY_KEYWORDS: &[&str] = &[
    "security",
    "vulnerab",
    "exploit",
    "injection",
    "xss",
    "csrf",
    "authentication",
    "authorization",
    "encrypt",
    "password",
    "secret",
    "token leak",
];

const COMPLEX_KEYWORDS: &[&str] = &[
    "architecture",
    "distributed",
    "concurren",
    "consistency",
    "scalab",
    "migrate",
    "refactor",
    "trade-off",
    "tradeoff",
    "design a",
];

const CRITICAL_KEYWORDS: &[&str] = &[
    "production",
    "outage",
    "critical",
    "data loss",
    "payment",
    "incident",
    "compliance",
];

const SIMPLE_KEYWORDS: &[&str] = &[
    "what is",
    "what does",
    "define",
    "explain briefly",
    "rename",
    "typo",
    "syntax for",
];

/// Keyword-driven categorizer. Deterministic by construction so the
/// selection policy is reproducible for identical inputs.
pub fn categorize(question: &str) -> QuestionProfile {
    let lower = question.to_lowercase();
    let mut keywords = Vec::new();

    let mut hit = |list: &[&str]| -> bool {
        let mut any = false;
        for kw in list {
            if lower.contains(kw) {
                keywords.push((*kw).to_string());
                any = true;
            }
        }
        any
    };

    let security = hit(SECURITY_KEYWORDS);
    let complex = hit(COMPLEX_KEYWORDS);
    let critical = hit(CRITICAL_KEYWORDS);
    let simple = hit(SIMPLE_KEYWORDS);

    let category = if security {
        "security"
    } else if complex {
        "architecture"
    } else if simple {
        "general"
    } else {
        "engineering"
    };

    let complexity = if complex || lower.len() > 400 {
        Level::High
    } else if simple || lower.len() < 80 {
        Level::Low
    } else {
        Level::Medium
    };

    let criticality = if critical || security {
        Level::High
    } else if simple {
        Level::Low
    } else {
        Level::Medium
    };

    QuestionProfile {
        category: category.to_string(),
        complexity,
        criticality,
        keywords,
    }
}

/// Inputs to one selection decision.
#[derive(Debug, Clone, Default)]
pub struct SelectionInput {
    pub preset: Option<PresetId>,
    pub urgency: Option<f64>,
    pub budget: Option<f64>,
    pub model_overrides: Option<Vec<String>>,
    pub timeout_minutes: Option<u64>,
}

/// The concrete plan for one debate.
#[derive(Debug, Clone)]
pub struct SelectionOutcome {
    pub preset: PresetId,
    pub roster: Vec<RosterEntry>,
    pub max_rounds: usize,
    pub consensus_threshold: f64,
    pub reason: String,
    pub profile: QuestionProfile,
}

/// Map a question plus caller hints to a roster and round budget.
/// Environment overrides (MAX_DEBATE_ITERATIONS, CONSENSUS_THRESHOLD) win
/// over preset values.
pub fn select(
    question: &str,
    input: &SelectionInput,
    config: &Config,
) -> Result<SelectionOutcome, ParleyError> {
    let profile = categorize(question);

    let (id, reason) = match input.preset {
        Some(id) => (id, format!("caller requested {}", id.as_str())),
        None => recommend(&profile, input),
    };
    let chosen = preset(id);

    let roster = match &input.model_overrides {
        Some(models) if !models.is_empty() => {
            let expanded = expand_roster(models);
            for entry in &expanded {
                let known = config
                    .alias(&entry.alias)
                    .is_some_and(|e| e.role == crate::config::AliasRole::Debater);
                if !known {
                    return Err(ParleyError::AliasNotFound(entry.alias.clone()));
                }
            }
            expanded
        }
        _ => resolve_roster(chosen.roster_spec, config),
    };
    if roster.is_empty() {
        return Err(ParleyError::Configuration(
            "selection produced an empty roster".to_string(),
        ));
    }

    let max_rounds = config
        .debate
        .max_iterations_override
        .unwrap_or(chosen.max_rounds);
    let consensus_threshold = config
        .debate
        .consensus_threshold_override
        .unwrap_or(chosen.consensus_threshold);

    Ok(SelectionOutcome {
        preset: id,
        roster,
        max_rounds,
        consensus_threshold,
        reason,
        profile,
    })
}

/// Automatic preset selection rules, applied in order.
pub fn recommend(profile: &QuestionProfile, input: &SelectionInput) -> (PresetId, String) {
    if profile.category == "security" {
        return (
            PresetId::SecurityFocused,
            "security keywords detected".to_string(),
        );
    }
    if input.urgency.is_some_and(|u| u > 0.8) {
        return (PresetId::Rapid, "urgency above 0.8".to_string());
    }
    if input.budget.is_some_and(|b| b < 0.3) {
        return (PresetId::CostOptimized, "budget below 0.3".to_string());
    }
    if profile.complexity == Level::High && profile.criticality == Level::High {
        return (
            PresetId::MaximumAccuracy,
            "high complexity and high criticality".to_string(),
        );
    }
    if profile.complexity == Level::High {
        return (PresetId::DeepAnalysis, "high complexity".to_string());
    }
    if profile.complexity == Level::Low {
        return (PresetId::Rapid, "low complexity".to_string());
    }
    (PresetId::Balanced, "default".to_string())
}

/// A preset's concrete roster against this registry.
pub fn preset_roster(id: PresetId, config: &Config) -> Vec<RosterEntry> {
    resolve_roster(preset(id).roster_spec, config)
}

/// Resolve symbolic roster specs (`fastest`, `cheapest`) against the
/// registry and expand instance counts.
fn resolve_roster(spec: &[&str], config: &Config) -> Vec<RosterEntry> {
    let resolved: Vec<String> = spec
        .iter()
        .map(|item| {
            let (alias, suffix) = match item.split_once(':') {
                Some((alias, count)) => (alias, format!(":{count}")),
                None => (*item, String::new()),
            };
            let concrete = match alias {
                "fastest" => config.fastest_alias(),
                "cheapest" => config.cheapest_alias(),
                other => other,
            };
            format!("{concrete}{suffix}")
        })
        .collect();
    expand_roster(&resolved)
}

/// Opaque display estimates for one preset (there is no real pricing
/// table). Derived from roster size × rounds × per-alias cost.
pub fn estimate_cost(id: PresetId, question_length: usize, config: &Config) -> (String, String, f64) {
    let chosen = preset(id);
    let roster = resolve_roster(chosen.roster_spec, config);
    // Prompt plus a typical answer, per model, per round.
    let tokens_per_call = (question_length / 4 + 700) as f64;
    let calls = (roster.len() * chosen.max_rounds + chosen.max_rounds + 1) as f64;
    let avg_cost_per_ktok = roster
        .iter()
        .filter_map(|e| config.alias(&e.alias))
        .map(|e| e.cost_per_ktok)
        .sum::<f64>()
        .max(0.001)
        / roster.len().max(1) as f64;
    let dollars = calls * tokens_per_call / 1000.0 * avg_cost_per_ktok;
    let minutes = chosen.max_rounds as f64 * 1.5 + 0.5;
    (
        format!("~${dollars:.3}"),
        format!("~{minutes:.0} min"),
        calls * tokens_per_call,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_expansion_handles_instances() {
        let roster = expand_roster(&["k1:2".to_string(), "k3".to_string(), "k1".to_string()]);
        let labels: Vec<String> = roster.iter().map(|e| e.label()).collect();
        assert_eq!(labels, vec!["k1", "k1#2", "k3", "k1#3"]);
    }

    #[test]
    fn security_questions_get_security_preset() {
        let profile = categorize("How should we prevent SQL injection in the login form?");
        let (id, _) = recommend(&profile, &SelectionInput::default());
        assert_eq!(id, PresetId::SecurityFocused);
    }

    #[test]
    fn urgency_beats_complexity() {
        let profile = categorize(
            "Design a distributed architecture for our concurrency-heavy ingestion pipeline \
             with strong consistency guarantees across regions",
        );
        let input = SelectionInput {
            urgency: Some(0.9),
            ..SelectionInput::default()
        };
        let (id, _) = recommend(&profile, &input);
        assert_eq!(id, PresetId::Rapid);
    }
}
