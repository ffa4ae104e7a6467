use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::debate::prompts;
use crate::invoker::ModelInvoker;

/// Hard ceiling on the coordinator call.
pub const COORDINATOR_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Score at which the debate no longer needs another round.
pub const CONTINUE_BELOW: f64 = 85.0;

/// Score at which synthesis is worth attempting.
pub const SYNTHESIS_READY_AT: f64 = 70.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsensusLevel {
    None,
    Weak,
    Moderate,
    Strong,
    NearUnanimous,
}

impl ConsensusLevel {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s >= 85.0 => Self::NearUnanimous,
            s if s >= 60.0 => Self::Strong,
            s if s >= 40.0 => Self::Moderate,
            s if s >= 20.0 => Self::Weak,
            _ => Self::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Weak => "weak",
            Self::Moderate => "moderate",
            Self::Strong => "strong",
            Self::NearUnanimous => "near-unanimous",
        }
    }
}

/// Structured output of one consensus evaluation; governs round termination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusVerdict {
    pub score: f64,
    pub level: ConsensusLevel,
    pub core_agreement: String,
    pub disagreements: Vec<String>,
    pub continue_debate: bool,
    pub synthesis_ready: bool,
    pub reasoning: String,
}

/// Wire shape demanded from the coordinator. Defaults let a sparse but
/// well-formed reply through; score is clamped after parse.
#[derive(Deserialize)]
struct VerdictWire {
    score: f64,
    #[serde(default)]
    level: Option<ConsensusLevel>,
    #[serde(default)]
    core_agreement: String,
    #[serde(default)]
    disagreements: Vec<String>,
    #[serde(default)]
    continue_debate: Option<bool>,
    #[serde(default)]
    synthesis_ready: Option<bool>,
    #[serde(default)]
    reasoning: String,
}

/// Scores agreement across a round's responses using a designated
/// coordinator alias, falling back to lexical overlap when the coordinator
/// fails or replies with something unparseable.
pub struct ConsensusAnalyzer {
    invoker: Arc<dyn ModelInvoker>,
    coordinator_alias: String,
    timeout: Duration,
}

impl ConsensusAnalyzer {
    pub fn new(invoker: Arc<dyn ModelInvoker>, coordinator_alias: String) -> Self {
        Self {
            invoker,
            coordinator_alias,
            timeout: COORDINATOR_TIMEOUT,
        }
    }

    /// Evaluate one round. `positions` are `(roster label, response text)`
    /// pairs already normalized into roster order.
    pub async fn evaluate(
        &self,
        question: &str,
        positions: &[(String, String)],
        trend: &[f64],
    ) -> ConsensusVerdict {
        let prompt = prompts::coordinator_prompt(question, positions, trend);

        let reply = tokio::time::timeout(
            self.timeout,
            self.invoker
                .call_model(&self.coordinator_alias, &prompt, None),
        )
        .await
        .ok()
        .flatten();

        if let Some(text) = reply
            && let Some(verdict) = parse_verdict(&text)
        {
            return verdict;
        }

        tracing::warn!("coordinator verdict unavailable — using lexical fallback");
        lexical_consensus(positions)
    }
}

/// Parse the first JSON object out of a coordinator reply.
pub fn parse_verdict(reply: &str) -> Option<ConsensusVerdict> {
    let block = extract_json_block(reply)?;
    let wire: VerdictWire = serde_json::from_str(block).ok()?;
    let score = wire.score.clamp(0.0, 100.0);
    Some(ConsensusVerdict {
        score,
        level: wire.level.unwrap_or_else(|| ConsensusLevel::from_score(score)),
        core_agreement: wire.core_agreement,
        disagreements: wire.disagreements,
        continue_debate: wire.continue_debate.unwrap_or(score < CONTINUE_BELOW),
        synthesis_ready: wire.synthesis_ready.unwrap_or(score >= SYNTHESIS_READY_AT),
        reasoning: wire.reasoning,
    })
}

/// Locate the first balanced `{…}` block, skipping braces inside strings.
pub fn extract_json_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Fallback scoring: average pairwise word-set Jaccard similarity × 100.
pub fn lexical_consensus(positions: &[(String, String)]) -> ConsensusVerdict {
    let score = if positions.len() < 2 {
        100.0
    } else {
        let sets: Vec<HashSet<String>> = positions.iter().map(|(_, text)| word_set(text)).collect();
        let mut total = 0.0;
        let mut pairs = 0usize;
        for i in 0..sets.len() {
            for j in (i + 1)..sets.len() {
                total += jaccard(&sets[i], &sets[j]);
                pairs += 1;
            }
        }
        (total / pairs as f64) * 100.0
    };

    ConsensusVerdict {
        score,
        level: ConsensusLevel::from_score(score),
        core_agreement: String::new(),
        disagreements: Vec::new(),
        continue_debate: score < CONTINUE_BELOW,
        synthesis_ready: score >= SYNTHESIS_READY_AT,
        reasoning: "fallback: lexical overlap".to_string(),
    }
}

fn word_set(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        1.0
    } else {
        intersection as f64 / union as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_block_extraction_handles_prose_and_strings() {
        let reply = r#"Here is my verdict: {"score": 82, "reasoning": "close {braces} inside"} trailing"#;
        let block = extract_json_block(reply).unwrap();
        assert!(block.starts_with('{') && block.ends_with('}'));
        let parsed: serde_json::Value = serde_json::from_str(block).unwrap();
        assert_eq!(parsed["score"], 82);
    }

    #[test]
    fn verdict_scores_clamped_and_defaulted() {
        let verdict = parse_verdict(r#"{"score": 140}"#).unwrap();
        assert_eq!(verdict.score, 100.0);
        assert_eq!(verdict.level, ConsensusLevel::NearUnanimous);
        assert!(!verdict.continue_debate);
        assert!(verdict.synthesis_ready);
    }

    #[test]
    fn identical_positions_score_full_overlap() {
        let positions = vec![
            ("k1".to_string(), "use a mutex around the map".to_string()),
            ("k2".to_string(), "use a mutex around the map".to_string()),
        ];
        let verdict = lexical_consensus(&positions);
        assert!((verdict.score - 100.0).abs() < f64::EPSILON);
        assert!(!verdict.continue_debate);
    }

    #[test]
    fn disjoint_positions_score_zero() {
        let positions = vec![
            ("k1".to_string(), "alpha beta gamma".to_string()),
            ("k2".to_string(), "delta epsilon zeta".to_string()),
        ];
        let verdict = lexical_consensus(&positions);
        assert_eq!(verdict.score, 0.0);
        assert_eq!(verdict.level, ConsensusLevel::None);
        assert!(verdict.continue_debate);
        assert!(!verdict.synthesis_ready);
    }
}
