use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use steward_types::{
    AbstainReason, DecisionOutcome, Proposal, RiskLevel, VoteDecision, VotingStrategy,
};

use crate::provider::{CompletionProvider, ProviderError};

const STRICT_REPROMPT_SUFFIX: &str = "\n\nYour previous reply did not match the required JSON \
shape. Respond again with ONLY a JSON object containing exactly the keys choice_label, \
confidence, risk, reasoning and key_factors. No prose, no markdown fences.";

#[derive(Debug, Clone)]
pub struct DecisionEngineConfig {
    /// Attempts per provider call for transport-class failures.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_body_chars: usize,
    pub max_reasoning_chars: usize,
}

impl Default for DecisionEngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            max_body_chars: 8_000,
            max_reasoning_chars: 2_000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecisionError {
    #[error("decision cancelled")]
    Cancelled,
}

/// Raw provider payload once it has passed schema validation.
#[derive(Debug, Deserialize)]
struct RawDecision {
    choice_label: String,
    confidence: f64,
    risk: RiskLevel,
    reasoning: String,
    #[serde(default)]
    key_factors: Vec<String>,
}

/// Wraps the AI provider with strategy-conditioned prompts, schema
/// enforcement, bounded retries, and the abstain taxonomy. Provider
/// failures never escape as errors: after the retry budget they become an
/// abstain so one bad proposal cannot sink a run.
pub struct DecisionEngine {
    provider: Arc<dyn CompletionProvider>,
    config: DecisionEngineConfig,
}

impl DecisionEngine {
    pub fn new(provider: Arc<dyn CompletionProvider>, config: DecisionEngineConfig) -> Self {
        Self { provider, config }
    }

    pub async fn decide(
        &self,
        proposal: &Proposal,
        strategy: VotingStrategy,
        confidence_threshold: f64,
        cancel: &CancellationToken,
    ) -> Result<DecisionOutcome, DecisionError> {
        let prompt = build_prompt(proposal, strategy, self.config.max_body_chars);

        let raw = match self.complete_with_retries(&prompt, cancel).await {
            Ok(raw) => raw,
            Err(ProviderError::Cancelled) => return Err(DecisionError::Cancelled),
            Err(err) => {
                warn!(proposal_id = %proposal.id, error = %err, "provider unavailable, abstaining");
                return Ok(abstain(proposal, AbstainReason::ProviderError, None));
            }
        };

        let parsed = match parse_decision(&raw) {
            Ok(parsed) => parsed,
            Err(detail) => {
                // One stricter re-prompt; a second malformed reply abstains.
                debug!(proposal_id = %proposal.id, detail, "schema violation, re-prompting");
                let strict = format!("{prompt}{STRICT_REPROMPT_SUFFIX}");
                match self.complete_with_retries(&strict, cancel).await {
                    Ok(raw) => match parse_decision(&raw) {
                        Ok(parsed) => parsed,
                        Err(detail) => {
                            warn!(proposal_id = %proposal.id, detail, "provider output unusable");
                            return Ok(abstain(proposal, AbstainReason::ProviderError, None));
                        }
                    },
                    Err(ProviderError::Cancelled) => return Err(DecisionError::Cancelled),
                    Err(_) => {
                        return Ok(abstain(proposal, AbstainReason::ProviderError, None));
                    }
                }
            }
        };

        let Some(choice_index) = map_choice(&proposal.choices, &parsed.choice_label) else {
            return Ok(abstain(
                proposal,
                AbstainReason::UnmappedChoice,
                Some(parsed.confidence),
            ));
        };

        if !risk_allowed(strategy, parsed.risk) {
            return Ok(abstain(
                proposal,
                AbstainReason::RiskExceedsStrategy,
                Some(parsed.confidence),
            ));
        }

        let effective = effective_threshold(strategy, confidence_threshold);
        if parsed.confidence < effective {
            return Ok(abstain(
                proposal,
                AbstainReason::BelowThreshold,
                Some(parsed.confidence),
            ));
        }

        let mut key_factors = parsed.key_factors;
        key_factors.truncate(8);
        Ok(DecisionOutcome::Vote(VoteDecision {
            proposal_id: proposal.id.clone(),
            choice_index,
            choice_label: proposal.choices[(choice_index - 1) as usize].clone(),
            confidence: parsed.confidence,
            reasoning: truncate_text(&parsed.reasoning, self.config.max_reasoning_chars),
            risk_level: parsed.risk,
            strategy,
            key_factors,
        }))
    }

    async fn complete_with_retries(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let mut attempt = 0u32;
        loop {
            match self.provider.complete(prompt, cancel).await {
                Ok(raw) => return Ok(raw),
                Err(err) if err.is_retryable() && attempt + 1 < self.config.max_attempts => {
                    let delay = backoff_with_jitter(self.config.base_backoff, attempt);
                    debug!(attempt, ?delay, error = %err, "provider retry");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn abstain(proposal: &Proposal, reason: AbstainReason, confidence: Option<f64>) -> DecisionOutcome {
    DecisionOutcome::Abstain {
        proposal_id: proposal.id.clone(),
        reason,
        confidence,
    }
}

pub(crate) fn effective_threshold(strategy: VotingStrategy, threshold: f64) -> f64 {
    match strategy {
        VotingStrategy::Conservative => threshold.max(0.75),
        VotingStrategy::Balanced => threshold,
        VotingStrategy::Aggressive => threshold.min(0.55),
    }
}

pub(crate) fn risk_allowed(strategy: VotingStrategy, risk: RiskLevel) -> bool {
    match strategy {
        VotingStrategy::Conservative => risk == RiskLevel::Low,
        VotingStrategy::Balanced => risk <= RiskLevel::Medium,
        VotingStrategy::Aggressive => true,
    }
}

fn posture(strategy: VotingStrategy) -> &'static str {
    match strategy {
        VotingStrategy::Conservative => {
            "Posture: conservative. Only support low-risk proposals with clear, bounded \
             outcomes. When in doubt, abstain by reporting low confidence."
        }
        VotingStrategy::Balanced => {
            "Posture: balanced. Weigh benefits against risk; support proposals whose expected \
             value is positive and whose risk is at most moderate."
        }
        VotingStrategy::Aggressive => {
            "Posture: aggressive. Favor action and growth opportunities; higher risk is \
             acceptable when the upside justifies it."
        }
    }
}

fn build_prompt(proposal: &Proposal, strategy: VotingStrategy, max_body_chars: usize) -> String {
    let choices = proposal
        .choices
        .iter()
        .enumerate()
        .map(|(i, label)| format!("{}. {label}", i + 1))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Evaluate the following DAO governance proposal and decide how to vote.\n\n\
         {}\n\n\
         Space: {}\nTitle: {}\n\nBody:\n{}\n\nChoices:\n{}\n\n\
         Reply with a single JSON object:\n\
         {{\"choice_label\": <one of the choice labels verbatim>, \
         \"confidence\": <0.0-1.0>, \"risk\": <\"low\"|\"medium\"|\"high\">, \
         \"reasoning\": <short explanation>, \"key_factors\": [<up to 8 short strings>]}}",
        posture(strategy),
        proposal.space,
        proposal.title,
        truncate_text(&proposal.body, max_body_chars),
        choices,
    )
}

fn decision_schema() -> &'static jsonschema::Validator {
    static VALIDATOR: OnceLock<jsonschema::Validator> = OnceLock::new();
    VALIDATOR.get_or_init(|| {
        let schema = json!({
            "type": "object",
            "required": ["choice_label", "confidence", "risk", "reasoning"],
            "properties": {
                "choice_label": { "type": "string", "minLength": 1 },
                "confidence": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
                "risk": { "type": "string", "enum": ["low", "medium", "high"] },
                "reasoning": { "type": "string" },
                "key_factors": {
                    "type": "array",
                    "items": { "type": "string" },
                    "maxItems": 8
                }
            }
        });
        jsonschema::validator_for(&schema).expect("decision schema is valid")
    })
}

fn parse_decision(raw: &str) -> Result<RawDecision, String> {
    let value = serde_json::from_str::<Value>(raw.trim())
        .ok()
        .or_else(|| extract_first_json_object(raw))
        .ok_or_else(|| "no JSON object in completion".to_string())?;
    if let Err(err) = decision_schema().validate(&value) {
        return Err(err.to_string());
    }
    serde_json::from_value(value).map_err(|err| err.to_string())
}

/// Providers occasionally wrap the object in prose or code fences; pull out
/// the first balanced top-level object.
fn extract_first_json_object(input: &str) -> Option<Value> {
    let start = input.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in input[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &input[start..start + offset + ch.len_utf8()];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

fn map_choice(choices: &[String], label: &str) -> Option<u32> {
    choices
        .iter()
        .position(|c| c.trim().eq_ignore_ascii_case(label.trim()))
        .map(|i| (i + 1) as u32)
}

fn truncate_text(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let mut out = input.chars().take(max_chars).collect::<String>();
    out.push_str("...<truncated>");
    out
}

fn backoff_with_jitter(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(6));
    if exp.is_zero() {
        return exp;
    }
    let half = (exp.as_millis() as u64) / 2;
    let jitter = rand::thread_rng().gen_range(0..=half.max(1));
    exp + Duration::from_millis(jitter)
}
