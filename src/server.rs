use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Implementation, ServerCapabilities, ServerInfo};
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler};
use tokio_util::sync::CancellationToken;

use crate::cache::fingerprint::{debate_fingerprint, project_fingerprint, significant_len};
use crate::cache::{CacheContext, FingerprintCache};
use crate::config::Config;
use crate::consensus::{ConsensusAnalyzer, ConsensusLevel};
use crate::debate::artifacts::{ArtifactWriter, ConfidenceTracker};
use crate::debate::{DebateOutcome, Orchestrator};
use crate::error::ParleyError;
use crate::invoker::{DispatchInvoker, ModelInvoker};
use crate::response::{ToolEnvelope, ToolMetadata};
use crate::retry::RetryHarness;
use crate::selection::{self, PresetId, SelectionInput, SelectionOutcome, PRESETS};
use crate::tools::debate::{ConfidenceReport, DebateRequest, DebateResult, PresetReport};
use crate::tools::presets::{
    AnalyzePresetRequest, CostEstimate, EstimateCostRequest, ListPresetsRequest, PresetCatalog,
    PresetRecommendation, PresetSummary,
};

/// Pre-flight floor on significant question characters.
pub const MIN_QUESTION_CHARS: usize = 15;

/// Project fingerprint used when the caller passed no project path.
pub const NO_PROJECT: &str = "none";

/// Everything a debate needs, constructed once at service start and shared
/// by reference — no process-wide singletons.
pub struct Engine {
    pub config: Arc<Config>,
    pub cache: Arc<FingerprintCache>,
    pub invoker: Arc<dyn ModelInvoker>,
    pub harness: Arc<RetryHarness>,
    pub artifacts: Arc<ArtifactWriter>,
    pub confidence: ConfidenceTracker,
}

#[derive(Clone)]
pub struct ParleyServer {
    engine: Arc<Engine>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl ParleyServer {
    pub async fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let harness = Arc::new(RetryHarness::new(config.retry.clone()));
        let signer = crate::gateway::signer_from(&config);
        let invoker: Arc<dyn ModelInvoker> =
            Arc::new(DispatchInvoker::new(config.clone(), harness.clone(), signer));
        Self::with_invoker(config, invoker, harness).await
    }

    /// Assemble the engine around an arbitrary invoker. Integration tests
    /// inject synthetic invokers here.
    pub async fn with_invoker(
        config: Arc<Config>,
        invoker: Arc<dyn ModelInvoker>,
        harness: Arc<RetryHarness>,
    ) -> Self {
        let cache = Arc::new(FingerprintCache::new(&config.cache));
        cache.load().await;
        let artifacts = Arc::new(ArtifactWriter::new(config.logs_dir.clone()));
        let confidence = ConfidenceTracker::open(&config.logs_dir).await;
        let engine = Arc::new(Engine {
            config,
            cache,
            invoker,
            harness,
            artifacts,
            confidence,
        });
        Self {
            engine,
            tool_router: Self::tool_router(),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// The full deliberation pipeline: validation, selection, cache probe,
    /// orchestration, decoration, cache store. The MCP tool below is a thin
    /// wrapper over this.
    pub async fn deliberate(&self, req: &DebateRequest) -> Result<DebateResult, ParleyError> {
        let start = Instant::now();

        if significant_len(&req.question) < MIN_QUESTION_CHARS {
            return Err(ParleyError::QuestionTooSimple(format!(
                "needs at least {MIN_QUESTION_CHARS} significant characters"
            )));
        }

        let preset_id = match req.preset.as_deref() {
            Some(name) => Some(
                PresetId::parse(name)
                    .ok_or_else(|| ParleyError::Configuration(format!("unknown preset: {name}")))?,
            ),
            None => None,
        };
        let input = SelectionInput {
            preset: preset_id,
            urgency: req.urgency,
            budget: req.budget,
            model_overrides: req.overrides.as_ref().and_then(|o| o.models.clone()),
            timeout_minutes: req.overrides.as_ref().and_then(|o| o.timeout_minutes),
        };
        let plan = selection::select(&req.question, &input, &self.engine.config)?;

        let project = req.project_path.as_ref().map(PathBuf::from);
        let project_fp = match &project {
            Some(path) => project_fingerprint(path).await,
            None => NO_PROJECT.to_string(),
        };
        let roster_aliases: Vec<String> = plan.roster.iter().map(|e| e.alias.clone()).collect();
        let ctx = CacheContext {
            category: plan.profile.category.clone(),
            roster_aliases,
            project_fingerprint: project_fp,
            bypass: req.fresh.unwrap_or(false),
        };

        if let Some(hit) = self.engine.cache.probe(&req.question, &ctx).await
            && let Ok(mut result) = serde_json::from_value::<DebateResult>(hit.result.clone())
        {
            result.from_cache = true;
            self.engine
                .cache
                .record_response_time(true, start.elapsed().as_millis() as u64);
            tracing::info!(fingerprint = %hit.fingerprint, "cache hit — returning stored result");
            return Ok(result);
        }

        let fingerprint = debate_fingerprint(
            &req.question,
            &ctx.category,
            &ctx.roster_aliases,
            &ctx.project_fingerprint,
        );

        let mut settings = self.engine.config.debate.clone();
        if let Some(minutes) = input.timeout_minutes {
            settings.timeout = Duration::from_secs(minutes.max(1) * 60);
        }
        let analyzer = ConsensusAnalyzer::new(
            self.engine.invoker.clone(),
            self.engine.config.coordinator_alias.clone(),
        );
        let orchestrator = Orchestrator::new(
            self.engine.invoker.clone(),
            analyzer,
            settings,
            self.engine.artifacts.clone(),
        );

        let outcome = orchestrator
            .run(
                &req.question,
                &plan,
                project.as_deref(),
                &fingerprint,
                CancellationToken::new(),
            )
            .await
            .inspect_err(|e| tracing::warn!(fingerprint = %fingerprint, "debate failed: {e}"))?;

        let elapsed = start.elapsed();
        self.engine
            .cache
            .record_response_time(false, elapsed.as_millis() as u64);

        let result = self
            .assemble_result(req, &plan, &input, outcome, elapsed)
            .await;
        let confidence_unit = result
            .confidence
            .as_ref()
            .map(|c| c.score / 100.0)
            .unwrap_or(0.0);
        if !result.cancelled {
            self.engine
                .cache
                .store(
                    &req.question,
                    serde_json::to_value(&result).unwrap_or(serde_json::Value::Null),
                    confidence_unit,
                    &ctx,
                )
                .await;
        }
        Ok(result)
    }

    #[tool(
        name = "debate_with_preset",
        description = "Deliberate a question across several AI models: iterative debate rounds, consensus scoring, and one synthesized answer with a confidence score. Results are cached per question, roster, and project state.",
        annotations(read_only_hint = true)
    )]
    async fn debate_with_preset(
        &self,
        Parameters(req): Parameters<DebateRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();

        match self.deliberate(&req).await {
            Ok(result) => Ok(self.success("debate_with_preset", &result, start.elapsed())),
            // Bad input is an MCP parameter error; debate failures travel in
            // the envelope so the client can read the structured reason.
            Err(
                e @ (ParleyError::QuestionTooSimple(_)
                | ParleyError::Configuration(_)
                | ParleyError::AliasNotFound(_)),
            ) => Err(McpError::invalid_params(e.user_message(), None)),
            Err(e) => {
                let envelope = ToolEnvelope::error(
                    serde_json::json!({
                        "kind": error_kind_name(&e),
                        "reason": e.user_message(),
                    })
                    .to_string(),
                    ToolMetadata {
                        tool_name: "debate_with_preset".to_string(),
                        duration_seconds: start.elapsed().as_secs_f64(),
                    },
                );
                Ok(envelope.into_call_tool_result())
            }
        }
    }

    #[tool(
        name = "list_presets",
        description = "List the debate presets with round budgets and consensus thresholds. Pass detailed=true for resolved rosters and cost estimates.",
        annotations(read_only_hint = true)
    )]
    async fn list_presets(
        &self,
        Parameters(req): Parameters<ListPresetsRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let detailed = req.detailed.unwrap_or(false);

        let presets = PRESETS
            .iter()
            .map(|p| {
                let (roster, estimated_cost, estimated_time) = if detailed {
                    let roster = selection::preset_roster(p.id, &self.engine.config)
                        .iter()
                        .map(|e| e.label())
                        .collect();
                    let (cost, time, _) =
                        selection::estimate_cost(p.id, 200, &self.engine.config);
                    (Some(roster), Some(cost), Some(time))
                } else {
                    (None, None, None)
                };
                PresetSummary {
                    id: p.id.as_str().to_string(),
                    name: p.name.to_string(),
                    description: p.description.to_string(),
                    max_rounds: p.max_rounds,
                    consensus_threshold: p.consensus_threshold,
                    intelligent_selection: p.intelligent_selection,
                    roster,
                    estimated_cost,
                    estimated_time,
                }
            })
            .collect();

        self.serialize_success("list_presets", &PresetCatalog { presets }, start.elapsed())
    }

    #[tool(
        name = "analyze_question_for_preset",
        description = "Categorize a question (category, complexity, criticality) and recommend the preset the automatic selection rules would pick.",
        annotations(read_only_hint = true)
    )]
    async fn analyze_question_for_preset(
        &self,
        Parameters(req): Parameters<AnalyzePresetRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();

        let profile = selection::categorize(&req.question);
        let input = SelectionInput {
            urgency: req.urgency,
            budget: req.budget,
            ..SelectionInput::default()
        };
        let (preset, reason) = selection::recommend(&profile, &input);
        let (estimated_cost, estimated_time, _) =
            selection::estimate_cost(preset, req.question.len(), &self.engine.config);

        let recommendation = PresetRecommendation {
            preset: preset.as_str().to_string(),
            reason,
            category: profile.category,
            complexity: profile.complexity,
            criticality: profile.criticality,
            keywords: profile.keywords,
            estimated_cost,
            estimated_time,
        };
        self.serialize_success("analyze_question_for_preset", &recommendation, start.elapsed())
    }

    #[tool(
        name = "estimate_preset_cost",
        description = "Estimate the token, dollar, and wall-clock cost of running a preset for a question of the given length.",
        annotations(read_only_hint = true)
    )]
    async fn estimate_preset_cost(
        &self,
        Parameters(req): Parameters<EstimateCostRequest>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let preset = PresetId::parse(&req.preset)
            .ok_or_else(|| McpError::invalid_params(format!("unknown preset: {}", req.preset), None))?;
        let question_length = req.question_length.unwrap_or(200);
        let (estimated_cost, estimated_time, estimated_tokens) =
            selection::estimate_cost(preset, question_length, &self.engine.config);

        let estimate = CostEstimate {
            preset: preset.as_str().to_string(),
            estimated_tokens,
            estimated_cost,
            estimated_time,
        };
        self.serialize_success("estimate_preset_cost", &estimate, start.elapsed())
    }

    /// Decorate a raw debate outcome with preset and confidence metadata,
    /// and feed the per-category history.
    async fn assemble_result(
        &self,
        req: &DebateRequest,
        plan: &SelectionOutcome,
        input: &SelectionInput,
        outcome: DebateOutcome,
        elapsed: Duration,
    ) -> DebateResult {
        let history = self
            .engine
            .confidence
            .success_rate(&plan.profile.category)
            .await;
        let history_rate = history.unwrap_or(0.5);
        let confidence_score = (0.7 * outcome.score + 0.3 * history_rate * 100.0).clamp(0.0, 100.0);
        let mut factors = vec![
            format!("final consensus {:.0}/100", outcome.score),
            format!(
                "{} of {} roster slots contributed",
                outcome.contributors.len(),
                plan.roster.len()
            ),
        ];
        match history {
            Some(rate) => factors.push(format!(
                "category '{}' historical success {:.0}%",
                plan.profile.category,
                rate * 100.0
            )),
            None => factors.push(format!(
                "no history yet for category '{}'",
                plan.profile.category
            )),
        }
        if outcome.synthesized_by == "fallback" {
            factors.push("synthesizer fallback used".to_string());
        }

        let success = outcome.score >= plan.consensus_threshold;
        self.engine
            .confidence
            .record(&plan.profile.category, success)
            .await;

        let (estimated_cost, estimated_time, _) =
            selection::estimate_cost(plan.preset, req.question.len(), &self.engine.config);
        let mut applied_overrides = Vec::new();
        if input.model_overrides.is_some() {
            applied_overrides.push("models".to_string());
        }
        if input.timeout_minutes.is_some() {
            applied_overrides.push("timeout_minutes".to_string());
        }
        if self.engine.config.debate.max_iterations_override.is_some() {
            applied_overrides.push("max_iterations(env)".to_string());
        }
        if self
            .engine
            .config
            .debate
            .consensus_threshold_override
            .is_some()
        {
            applied_overrides.push("consensus_threshold(env)".to_string());
        }

        // Same token heuristic the cache pins: len/4 tokens at $0.00002.
        let tokens = outcome.solution.len().div_ceil(4) as f64
            * outcome.rounds.max(1) as f64
            * plan.roster.len() as f64;
        let actual_cost = format!("~${:.3}", tokens * 0.000_02);

        let preset_def = selection::preset(plan.preset);
        DebateResult {
            solution: outcome.solution,
            winner: outcome.winner,
            score: outcome.score,
            contributors: outcome.contributors,
            rounds: outcome.rounds,
            from_cache: false,
            preset: Some(PresetReport {
                id: plan.preset.as_str().to_string(),
                name: preset_def.name.to_string(),
                actual_time: format!("{:.1}s", elapsed.as_secs_f64()),
                actual_cost,
                estimated_time,
                estimated_cost,
                overrides: applied_overrides,
                selection_reason: plan.reason.clone(),
            }),
            confidence: Some(ConfidenceReport {
                score: confidence_score,
                level: ConsensusLevel::from_score(confidence_score)
                    .as_str()
                    .to_string(),
                factors,
            }),
            cancelled: outcome.cancelled,
            synthesized_by: outcome.synthesized_by.to_string(),
        }
    }

    fn success<T: serde::Serialize>(
        &self,
        tool_name: &str,
        payload: &T,
        elapsed: Duration,
    ) -> CallToolResult {
        match serde_json::to_string(payload) {
            Ok(json) => ToolEnvelope::success(
                json,
                ToolMetadata {
                    tool_name: tool_name.to_string(),
                    duration_seconds: elapsed.as_secs_f64(),
                },
            )
            .into_call_tool_result(),
            Err(e) => ToolEnvelope::error(
                format!("serialization failed: {e}"),
                ToolMetadata {
                    tool_name: tool_name.to_string(),
                    duration_seconds: elapsed.as_secs_f64(),
                },
            )
            .into_call_tool_result(),
        }
    }

    fn serialize_success<T: serde::Serialize>(
        &self,
        tool_name: &str,
        payload: &T,
        elapsed: Duration,
    ) -> Result<CallToolResult, McpError> {
        Ok(self.success(tool_name, payload, elapsed))
    }
}

/// Wire name of the error taxonomy, for structured failure payloads.
fn error_kind_name(e: &ParleyError) -> &'static str {
    match e {
        ParleyError::QuestionTooSimple(_) => "question_too_simple",
        ParleyError::InsufficientResponses { .. } => "insufficient_responses",
        ParleyError::AuthFailed { .. } => "authentication_failure",
        ParleyError::RateLimited { .. } => "rate_limited",
        ParleyError::Timeout(_) | ParleyError::Cancelled(_) => "timeout",
        ParleyError::ReplayDetected => "replay_detected",
        _ => "internal_error",
    }
}

#[tool_handler]
impl ServerHandler for ParleyServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "parley".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "Parley: multi-model deliberation with consensus scoring.\n\n\
                 Tools:\n\
                 - `debate_with_preset`: Deliberate a question across several models and get one \
                 synthesized answer with a confidence score. Pass `preset` to pick a tradeoff, or \
                 omit it and let the question analyzer choose.\n\
                 - `list_presets`: See the preset catalog (rosters, round budgets, thresholds).\n\
                 - `analyze_question_for_preset`: Preview which preset automatic selection would pick.\n\
                 - `estimate_preset_cost`: Estimate tokens, dollars, and time for a preset.\n\n\
                 Workflow:\n\
                 1. For one-off questions just call `debate_with_preset` with the question.\n\
                 2. Pass `project_path` when the question concerns a codebase — cached answers are \
                 invalidated automatically when project files change.\n\
                 3. Identical questions hit the result cache; pass `fresh: true` to force a re-run.\n\
                 4. `overrides.models` accepts roster specs like [\"k1:2\", \"k3\"]."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
