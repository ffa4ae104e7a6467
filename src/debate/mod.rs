pub mod artifacts;
pub mod prompts;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::DebateSettings;
use crate::consensus::{ConsensusAnalyzer, ConsensusVerdict};
use crate::debate::artifacts::ArtifactWriter;
use crate::error::ParleyError;
use crate::invoker::ModelInvoker;
use crate::selection::{RosterEntry, SelectionOutcome};

/// Three consecutive rounds spanning fewer than this many consensus points
/// mean the debate is stuck.
pub const STUCK_SPAN: f64 = 3.0;

/// Window of trailing rounds examined by stuck detection.
pub const STUCK_WINDOW: usize = 3;

/// Minimum surviving initial positions for a debate to proceed.
pub const MIN_INITIAL_POSITIONS: usize = 2;

/// Phase transitions reported to observers. The sink is a plain channel so
/// observers never sit inside the state machine.
#[derive(Debug, Clone)]
pub struct DebateEvent {
    pub phase: &'static str,
    pub round: usize,
    pub score: Option<f64>,
}

/// Result of a completed debate, before the tool layer decorates it with
/// preset and confidence metadata.
#[derive(Debug, Clone)]
pub struct DebateOutcome {
    pub solution: String,
    pub winner: String,
    pub score: f64,
    pub contributors: Vec<String>,
    pub rounds: usize,
    pub consensus_trend: Vec<f64>,
    pub cancelled: bool,
    pub synthesized_by: &'static str,
    pub final_verdict: ConsensusVerdict,
}

/// Drives the debate state machine:
/// INIT → PROPOSING → EVALUATING → (UPDATING | SYNTHESIZING) → DONE/FAILED.
///
/// The orchestrator exclusively owns all debate state; the invoker knows
/// nothing about it and the analyzer only sees normalized position lists.
pub struct Orchestrator {
    invoker: Arc<dyn ModelInvoker>,
    analyzer: ConsensusAnalyzer,
    settings: DebateSettings,
    artifacts: Arc<ArtifactWriter>,
    events: Option<tokio::sync::mpsc::UnboundedSender<DebateEvent>>,
}

impl Orchestrator {
    pub fn new(
        invoker: Arc<dyn ModelInvoker>,
        analyzer: ConsensusAnalyzer,
        settings: DebateSettings,
        artifacts: Arc<ArtifactWriter>,
    ) -> Self {
        Self {
            invoker,
            analyzer,
            settings,
            artifacts,
            events: None,
        }
    }

    pub fn with_events(
        mut self,
        sender: tokio::sync::mpsc::UnboundedSender<DebateEvent>,
    ) -> Self {
        self.events = Some(sender);
        self
    }

    fn emit(&self, phase: &'static str, round: usize, score: Option<f64>) {
        if let Some(tx) = &self.events {
            let _ = tx.send(DebateEvent {
                phase,
                round,
                score,
            });
        }
    }

    /// Run one debate to completion. `cancel` lets the caller abort early
    /// with the same semantics as the wall-clock deadline.
    pub async fn run(
        &self,
        question: &str,
        plan: &SelectionOutcome,
        project_path: Option<&Path>,
        fingerprint: &str,
        cancel: CancellationToken,
    ) -> Result<DebateOutcome, ParleyError> {
        let roster = &plan.roster;
        let deadline = Instant::now() + self.settings.timeout;

        // PROPOSING: one initial prompt per roster entry, nulls dropped.
        self.emit("proposing", 1, None);
        let initial = prompts::initial_prompt(question, project_note(project_path).as_deref());
        let tasks: Vec<(usize, String, String)> = roster
            .iter()
            .enumerate()
            .map(|(i, e)| (i, e.alias.clone(), initial.clone()))
            .collect();
        let mut current = self
            .fan_out(tasks, project_path, deadline, &cancel)
            .await;

        let live = current.iter().flatten().count();
        if live < MIN_INITIAL_POSITIONS {
            self.emit("failed", 1, None);
            return Err(ParleyError::InsufficientResponses {
                got: live,
                wanted: MIN_INITIAL_POSITIONS,
            });
        }

        let mut trend: Vec<f64> = Vec::new();
        let mut verdict;
        let mut cancelled;

        // EVALUATING ↔ UPDATING until a termination condition fires.
        loop {
            let round = trend.len() + 1;
            self.emit("evaluating", round, None);

            let labeled = labeled_positions(roster, &current);
            verdict = self.analyzer.evaluate(question, &labeled, &trend).await;
            trend.push(verdict.score);
            self.emit("evaluated", round, Some(verdict.score));

            self.artifacts
                .write_intermediate(
                    round,
                    &serde_json::json!({
                        "type": "intermediate",
                        "round": round,
                        "fingerprint": fingerprint,
                        "positions_by_model": positions_object(&labeled),
                        "verdict": verdict,
                        "trend": trend,
                    }),
                )
                .await;

            cancelled = cancel.is_cancelled() || Instant::now() >= deadline;
            let natural = verdict.synthesis_ready && !verdict.continue_debate;
            let budget_spent = trend.len() >= plan.max_rounds;
            let stuck = is_stuck(&trend);

            if cancelled || natural || budget_spent || stuck {
                if stuck && !natural {
                    tracing::info!(trend = ?trend, "debate is stuck — synthesizing early");
                }
                break;
            }

            // UPDATING: every entry sees its own previous position, all
            // other positions, and the open disagreements. A null reply
            // retains the previous position.
            self.emit("updating", round + 1, None);
            let tasks: Vec<(usize, String, String)> = roster
                .iter()
                .enumerate()
                .map(|(i, e)| {
                    let own = current[i]
                        .as_deref()
                        .unwrap_or("(you have not stated a position yet)");
                    let others: Vec<(String, String)> = roster
                        .iter()
                        .enumerate()
                        .filter(|(j, _)| *j != i)
                        .filter_map(|(j, other)| {
                            current[j].as_ref().map(|text| (other.label(), text.clone()))
                        })
                        .collect();
                    let prompt =
                        prompts::update_prompt(question, own, &others, &verdict.disagreements);
                    (i, e.alias.clone(), prompt)
                })
                .collect();

            let fresh = self
                .fan_out(tasks, project_path, deadline, &cancel)
                .await;
            for (slot, update) in current.iter_mut().zip(fresh) {
                if update.is_some() {
                    *slot = update;
                }
            }
        }

        // SYNTHESIZING: the first roster entry's alias writes the final
        // answer; on failure, deterministic concatenation.
        self.emit("synthesizing", trend.len(), Some(verdict.score));
        let labeled = labeled_positions(roster, &current);
        let (solution, synthesized_by) = self
            .synthesize(question, &labeled, &verdict, roster, deadline, &cancel)
            .await;

        let winner_label = centrality_winner(&labeled);
        let winner = alias_of(roster, &winner_label);
        let contributors = contributor_aliases(roster, &current);

        let outcome = DebateOutcome {
            solution,
            winner,
            score: verdict.score,
            contributors,
            rounds: trend.len(),
            consensus_trend: trend,
            cancelled,
            synthesized_by,
            final_verdict: verdict,
        };

        self.artifacts
            .write_final(&serde_json::json!({
                "type": "final",
                "fingerprint": fingerprint,
                "solution": outcome.solution,
                "winner": outcome.winner,
                "score": outcome.score,
                "contributors": outcome.contributors,
                "rounds": outcome.rounds,
                "trend": outcome.consensus_trend,
                "cancelled": outcome.cancelled,
                "synthesized_by": outcome.synthesized_by,
                "positions_by_model": positions_object(&labeled),
            }))
            .await;
        self.emit("done", outcome.rounds, Some(outcome.score));

        Ok(outcome)
    }

    /// Fan one prompt set out across the roster. Completion order is
    /// irrelevant: results land in roster-index slots, so downstream
    /// consensus scoring is reproducible for the same response set.
    /// A failure in one call never cancels the others; the round deadline
    /// (or caller cancellation) turns stragglers into nulls.
    async fn fan_out(
        &self,
        tasks: Vec<(usize, String, String)>,
        project_path: Option<&Path>,
        debate_deadline: Instant,
        cancel: &CancellationToken,
    ) -> Vec<Option<String>> {
        let slots = tasks.len();
        let mut results: Vec<Option<String>> = vec![None; slots];

        let remaining = debate_deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO);
        let round_budget = self.settings.round_deadline.min(remaining);
        if round_budget.is_zero() {
            return results;
        }

        let mut set = JoinSet::new();
        for (idx, alias, prompt) in tasks {
            let invoker = self.invoker.clone();
            let project: Option<PathBuf> = project_path.map(Path::to_path_buf);
            set.spawn(async move {
                let reply = invoker
                    .call_model(&alias, &prompt, project.as_deref())
                    .await;
                (idx, reply)
            });
        }

        let cutoff = tokio::time::sleep(round_budget);
        tokio::pin!(cutoff);

        loop {
            tokio::select! {
                biased; // prefer results over cutoff — if both ready, take the result
                joined = set.join_next() => {
                    match joined {
                        Some(Ok((idx, reply))) => {
                            results[idx] = reply;
                            if set.is_empty() { break; }
                        }
                        Some(Err(join_err)) => {
                            if join_err.is_panic() {
                                tracing::error!("fan-out task panicked: {join_err}");
                            }
                            if set.is_empty() { break; }
                        }
                        None => break,
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("fan-out cancelled by caller");
                    set.abort_all();
                    drain(&mut set, &mut results).await;
                    break;
                }
                _ = &mut cutoff => {
                    tracing::warn!(pending = set.len(), "round deadline — cancelling stragglers");
                    set.abort_all();
                    drain(&mut set, &mut results).await;
                    break;
                }
            }
        }

        results
    }

    async fn synthesize(
        &self,
        question: &str,
        labeled: &[(String, String)],
        verdict: &ConsensusVerdict,
        roster: &[RosterEntry],
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> (String, &'static str) {
        let synthesizer = &roster[0].alias;
        let prompt = prompts::synthesis_prompt(question, labeled, &verdict.disagreements);

        let budget = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::ZERO)
            .min(Duration::from_secs(3 * 60));

        let attempt = if budget.is_zero() || cancel.is_cancelled() {
            None
        } else {
            tokio::time::timeout(budget, self.invoker.call_model(synthesizer, &prompt, None))
                .await
                .ok()
                .flatten()
        };

        match attempt {
            Some(text) => (text, "coordinator"),
            None => {
                tracing::warn!(alias = %synthesizer, "synthesizer unavailable — concatenation fallback");
                (fallback_synthesis(labeled), "fallback")
            }
        }
    }
}

async fn drain(set: &mut JoinSet<(usize, Option<String>)>, results: &mut [Option<String>]) {
    while let Some(joined) = set.join_next().await {
        if let Ok((idx, reply)) = joined {
            results[idx] = reply;
        }
    }
}

/// With at least three completed rounds, a trailing window spanning fewer
/// than [`STUCK_SPAN`] points means further rounds won't move consensus.
pub fn is_stuck(trend: &[f64]) -> bool {
    if trend.len() < STUCK_WINDOW {
        return false;
    }
    let window = &trend[trend.len() - STUCK_WINDOW..];
    let max = window.iter().cloned().fold(f64::MIN, f64::max);
    let min = window.iter().cloned().fold(f64::MAX, f64::min);
    max - min < STUCK_SPAN
}

/// Normalize the sparse position slots into roster-index-sorted
/// `(label, text)` pairs, dropping nulls.
pub fn labeled_positions(
    roster: &[RosterEntry],
    positions: &[Option<String>],
) -> Vec<(String, String)> {
    roster
        .iter()
        .zip(positions)
        .filter_map(|(entry, slot)| slot.as_ref().map(|text| (entry.label(), text.clone())))
        .collect()
}

fn positions_object(labeled: &[(String, String)]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (label, text) in labeled {
        map.insert(label.clone(), serde_json::Value::String(text.clone()));
    }
    serde_json::Value::Object(map)
}

/// The "highest-scored individual response": the position with the greatest
/// average lexical similarity to its peers. Deterministic; ties resolve to
/// the earliest roster slot.
pub fn centrality_winner(labeled: &[(String, String)]) -> String {
    if labeled.is_empty() {
        return String::new();
    }
    if labeled.len() == 1 {
        return labeled[0].0.clone();
    }

    let sets: Vec<HashSet<String>> = labeled
        .iter()
        .map(|(_, text)| {
            text.split_whitespace()
                .map(|w| w.to_lowercase())
                .collect::<HashSet<_>>()
        })
        .collect();

    let mut best = 0usize;
    let mut best_score = f64::MIN;
    for i in 0..sets.len() {
        let mut total = 0.0;
        for j in 0..sets.len() {
            if i == j {
                continue;
            }
            let intersection = sets[i].intersection(&sets[j]).count();
            let union = sets[i].len() + sets[j].len() - intersection;
            total += if union == 0 {
                1.0
            } else {
                intersection as f64 / union as f64
            };
        }
        let score = total / (sets.len() - 1) as f64;
        if score > best_score {
            best_score = score;
            best = i;
        }
    }
    labeled[best].0.clone()
}

/// Deterministic concatenation used when the synthesizer fails: the most
/// central position in full, then each other panelist's key points.
pub fn fallback_synthesis(labeled: &[(String, String)]) -> String {
    if labeled.is_empty() {
        return "No positions were gathered before the debate ended.".to_string();
    }
    let winner = centrality_winner(labeled);
    let mut out = String::new();
    for (label, text) in labeled {
        if *label == winner {
            out.push_str(text);
            out.push('\n');
            break;
        }
    }
    let others: Vec<&(String, String)> = labeled.iter().filter(|(l, _)| *l != winner).collect();
    if !others.is_empty() {
        out.push_str("\nAdditional perspectives:\n");
        for (label, text) in others {
            let excerpt: String = text.chars().take(200).collect();
            out.push_str(&format!("- {label}: {excerpt}\n"));
        }
    }
    out
}

fn alias_of(roster: &[RosterEntry], label: &str) -> String {
    roster
        .iter()
        .find(|e| e.label() == label)
        .map(|e| e.alias.clone())
        .unwrap_or_else(|| label.to_string())
}

fn contributor_aliases(roster: &[RosterEntry], positions: &[Option<String>]) -> Vec<String> {
    let mut seen = HashSet::new();
    roster
        .iter()
        .zip(positions)
        .filter(|(_, slot)| slot.is_some())
        .map(|(entry, _)| entry.alias.clone())
        .filter(|alias| seen.insert(alias.clone()))
        .collect()
}

fn project_note(project_path: Option<&Path>) -> Option<String> {
    project_path.map(|p| format!("The caller is working in the project at {}.", p.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stuck_needs_three_flat_rounds() {
        assert!(!is_stuck(&[71.0, 72.0]));
        assert!(is_stuck(&[71.0, 72.0, 71.0]));
        assert!(!is_stuck(&[60.0, 70.0, 80.0]));
        // Only the trailing window counts.
        assert!(is_stuck(&[10.0, 50.0, 80.0, 81.0, 80.5]));
    }

    #[test]
    fn centrality_prefers_the_agreeing_majority() {
        let labeled = vec![
            ("k1".to_string(), "use a mutex to guard the cache".to_string()),
            ("k2".to_string(), "use a mutex to guard the cache map".to_string()),
            ("k3".to_string(), "rewrite everything in assembly".to_string()),
        ];
        let winner = centrality_winner(&labeled);
        assert!(winner == "k1" || winner == "k2");
    }

    #[test]
    fn fallback_synthesis_lists_other_perspectives() {
        let labeled = vec![
            ("k1".to_string(), "answer alpha shared words".to_string()),
            ("k2".to_string(), "answer beta shared words".to_string()),
        ];
        let text = fallback_synthesis(&labeled);
        assert!(text.contains("Additional perspectives:"));
    }
}
