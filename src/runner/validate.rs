//! The two LLM-backed seams the Block Runner calls into for every
//! answered `INTERACTION` block: risk-control validation of the raw
//! answer, and semantic extraction of the interaction's declared
//! variable from it. Both are genuinely LLM calls, so they are modelled
//! as an injectable trait rather than hand-rolled string matching — the
//! same seam shape as [`crate::llm::LlmProvider`] itself, so a test
//! harness can stub deterministic responses without a network call.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::llm::{ChatMessage, LlmProvider, UsageContext};
use crate::markdownflow::Interaction;
use crate::runner::step::NormalizedInput;
use crate::runner::{Result, RunnerError};

/// Outcome of semantic variable extraction over the learner's answer.
#[derive(Clone, Debug, PartialEq)]
pub enum ExtractOutcome {
    /// The answer validated; these variables should be persisted and
    /// emitted as `VARIABLE_UPDATE` events.
    Variables(BTreeMap<String, String>),
    /// The answer failed semantic validation; `message` is shown to the
    /// learner as an `ERROR_MESSAGE` block before the interaction is
    /// re-prompted.
    Invalid { message: String },
}

/// Everything the two validation calls need to know about the question
/// being answered, independent of how the Block Runner represents a
/// block internally.
#[derive(Clone, Debug)]
pub struct InteractionCtx {
    pub shifu_bid: String,
    pub outline_item_bid: String,
    pub question: Option<String>,
    pub llm: Option<String>,
    pub llm_temperature: Option<f32>,
}

#[async_trait]
pub trait InteractionProcessor: Send + Sync {
    /// Returns `Some(feedback)` when the submitted text should be
    /// rejected (e.g. flagged content, off-topic, empty-after-trim);
    /// `None` means the text may proceed to variable extraction.
    async fn check_risk_control(&self, ctx: &InteractionCtx, joined_input: &str) -> Result<Option<String>>;

    /// Extracts the interaction's declared variable from the learner's
    /// normalised input.
    async fn extract_variables(
        &self,
        ctx: &InteractionCtx,
        interaction: &Interaction,
        input: &NormalizedInput,
    ) -> Result<ExtractOutcome>;
}

/// Default implementation: both calls go through the same
/// [`LlmProvider`] the CONTENT path uses, with the model/temperature
/// resolved the same way (nearest-non-null ancestor override).
pub struct LlmInteractionProcessor {
    llm: std::sync::Arc<dyn LlmProvider>,
    default_model: String,
    usage_ctx_for: fn(&InteractionCtx) -> UsageContext,
}

impl LlmInteractionProcessor {
    pub fn new(llm: std::sync::Arc<dyn LlmProvider>, default_model: String) -> Self {
        Self {
            llm,
            default_model,
            usage_ctx_for: |ctx| UsageContext {
                user_bid: String::new(),
                shifu_bid: ctx.shifu_bid.clone(),
                scene: crate::types::UsageScene::Debug,
            },
        }
    }

    fn model_for(&self, ctx: &InteractionCtx) -> String {
        ctx.llm.clone().unwrap_or_else(|| self.default_model.clone())
    }
}

#[derive(Deserialize)]
struct ExtractionReply {
    valid: bool,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[async_trait]
impl InteractionProcessor for LlmInteractionProcessor {
    async fn check_risk_control(&self, ctx: &InteractionCtx, joined_input: &str) -> Result<Option<String>> {
        if joined_input.trim().is_empty() {
            return Ok(Some("Please provide an answer before continuing.".to_string()));
        }
        let messages = vec![
            ChatMessage::system(
                "You moderate learner answers in a tutoring platform. Reply with exactly \
                 `OK` if the text is safe and on-topic, otherwise reply with one short \
                 sentence telling the learner what to fix.",
            ),
            ChatMessage::user(joined_input),
        ];
        let usage_ctx = (self.usage_ctx_for)(ctx);
        let reply = self
            .llm
            .complete(&messages, &self.model_for(ctx), ctx.llm_temperature, &usage_ctx)
            .await
            .map_err(RunnerError::Llm)?;
        let trimmed = reply.trim();
        if trimmed.eq_ignore_ascii_case("ok") {
            Ok(None)
        } else {
            Ok(Some(trimmed.to_string()))
        }
    }

    async fn extract_variables(
        &self,
        ctx: &InteractionCtx,
        interaction: &Interaction,
        input: &NormalizedInput,
    ) -> Result<ExtractOutcome> {
        let Some(variable) = interaction.variable.as_ref() else {
            return Ok(ExtractOutcome::Variables(BTreeMap::new()));
        };
        let joined = input.joined_all();
        let question = interaction.question.clone().unwrap_or_default();
        let messages = vec![
            ChatMessage::system(format!(
                "Extract the value of `{variable}` from the learner's answer to: \"{question}\". \
                 Reply with strict JSON: {{\"valid\": bool, \"value\": string|null, \"message\": string|null}}. \
                 `valid` is false only if the answer does not actually answer the question."
            )),
            ChatMessage::user(joined),
        ];
        let usage_ctx = (self.usage_ctx_for)(ctx);
        let reply = self
            .llm
            .complete(&messages, &self.model_for(ctx), ctx.llm_temperature, &usage_ctx)
            .await
            .map_err(RunnerError::Llm)?;

        let parsed: std::result::Result<ExtractionReply, _> = serde_json::from_str(reply.trim());
        match parsed {
            Ok(ExtractionReply { valid: true, value: Some(value), .. }) => {
                let mut out = BTreeMap::new();
                out.insert(variable.clone(), value);
                Ok(ExtractOutcome::Variables(out))
            }
            Ok(ExtractionReply { valid: true, value: None, .. }) => {
                let mut out = BTreeMap::new();
                out.insert(variable.clone(), input.joined_all());
                Ok(ExtractOutcome::Variables(out))
            }
            Ok(ExtractionReply { valid: false, message, .. }) => Ok(ExtractOutcome::Invalid {
                message: message.unwrap_or_else(|| "That doesn't quite answer the question — try again.".to_string()),
            }),
            Err(_) => {
                // Non-JSON replies degrade to the raw text as feedback,
                // matching the parser's own never-fail posture.
                Ok(ExtractOutcome::Invalid { message: reply })
            }
        }
    }
}

fn _value_unused(_: Value) {}
