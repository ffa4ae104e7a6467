//! Versioned prompt templates. These are part of each component's contract:
//! changing one requires refreshing the consensus-scoring regression
//! fixtures in `tests/consensus.rs`.

pub const PROMPT_VERSION: &str = "v3";

/// First-round prompt: propose a position on the question.
pub fn initial_prompt(question: &str, project_note: Option<&str>) -> String {
    let mut prompt = String::new();
    if let Some(note) = project_note {
        prompt.push_str(&format!("Project context:\n{note}\n\n"));
    }
    prompt.push_str(&format!(
        "You are one expert in a panel deliberating on a question. Give your \
         best, self-contained answer. State your position clearly, then your \
         key reasoning in brief.\n\nQuestion: {question}\n"
    ));
    prompt
}

/// Update-round prompt: the model sees its own previous position, every
/// other panelist's current position, and the open disagreements.
pub fn update_prompt(
    question: &str,
    own_previous: &str,
    others: &[(String, String)],
    disagreements: &[String],
) -> String {
    let mut prompt = format!(
        "You are one expert in a panel deliberating on a question.\n\n\
         Question: {question}\n\n\
         Your previous position:\n{own_previous}\n\n\
         The other panelists currently hold:\n"
    );
    for (label, text) in others {
        prompt.push_str(&format!("--- {label} ---\n{text}\n"));
    }
    if !disagreements.is_empty() {
        prompt.push_str("\nOpen disagreements:\n");
        for d in disagreements {
            prompt.push_str(&format!("- {d}\n"));
        }
    }
    prompt.push_str(
        "\nRevise your position if the other panelists convinced you on any \
         point; otherwise defend it. Answer with your updated position and \
         brief reasoning.\n",
    );
    prompt
}

/// Coordinator prompt: demands a strict JSON verdict.
pub fn coordinator_prompt(
    question: &str,
    positions: &[(String, String)],
    trend: &[f64],
) -> String {
    let mut prompt = format!(
        "You are the neutral coordinator of an expert panel. Score how much \
         the panelists agree on the question below.\n\n\
         Question: {question}\n\nPositions:\n"
    );
    for (label, text) in positions {
        prompt.push_str(&format!("--- {label} ---\n{text}\n"));
    }
    if !trend.is_empty() {
        let trend_text: Vec<String> = trend.iter().map(|s| format!("{s:.0}")).collect();
        prompt.push_str(&format!(
            "\nConsensus trend over previous rounds: [{}]\n",
            trend_text.join(", ")
        ));
    }
    prompt.push_str(
        "\nReply with exactly one JSON object and nothing else:\n\
         {\n\
           \"score\": <0-100 agreement score>,\n\
           \"level\": \"none\" | \"weak\" | \"moderate\" | \"strong\" | \"near-unanimous\",\n\
           \"core_agreement\": \"<what the panel agrees on>\",\n\
           \"disagreements\": [\"<each open disagreement>\"],\n\
           \"continue_debate\": <true if another round would help>,\n\
           \"synthesis_ready\": <true if a final answer can be written now>,\n\
           \"reasoning\": \"<one-paragraph justification>\"\n\
         }\n",
    );
    prompt
}

/// Synthesizer prompt: one final answer from the last round's positions.
pub fn synthesis_prompt(
    question: &str,
    positions: &[(String, String)],
    disagreements: &[String],
) -> String {
    let mut prompt = format!(
        "You are the synthesizer for an expert panel. Write the single best \
         final answer to the question, merging the strongest points from \
         every position below. Where the panel disagrees, pick the \
         better-supported side and say why in one sentence.\n\n\
         Question: {question}\n\nFinal positions:\n"
    );
    for (label, text) in positions {
        prompt.push_str(&format!("--- {label} ---\n{text}\n"));
    }
    if !disagreements.is_empty() {
        prompt.push_str("\nUnresolved disagreements:\n");
        for d in disagreements {
            prompt.push_str(&format!("- {d}\n"));
        }
    }
    prompt.push_str("\nFinal answer:\n");
    prompt
}
