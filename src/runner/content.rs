//! CONTENT block handling.
//!
//! Resolves the LLM model/temperature/system prompt by walking the
//! ancestor chain for the nearest non-null override (falling back to the
//! Shifu, then to the `DEFAULT_LLM_MODEL`/`DEFAULT_LLM_TEMPERATURE`
//! config keys), streams the completion as `CONTENT` events, feeds each
//! delta into the Streaming TTS Orchestrator when TTS is enabled, and
//! persists the finished block.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;

use crate::events::Event;
use crate::llm::{ChatMessage, UsageContext};
use crate::markdownflow::Block;
use crate::outline::tree::{OutlineItem, Shifu};
use crate::store::models::LearnGeneratedBlock;
use crate::tts::processor::StreamingTtsProcessor;
use crate::tts::VoiceSettings;
use crate::types::{generate_id, GeneratedBlockKind, ProgressStatus, Role};

use super::step::{RunInput, StepState};
use super::{BlockRunner, Result, RunOutcome, RunnerError};
use crate::store::models::LearnProgressRecord;

/// Walks the ancestor chain root-to-leaf (reversed, so leaf wins first),
/// falling back to the Shifu, then to configured defaults.
pub(super) async fn resolve_llm_settings(
    runner: &BlockRunner,
    chain: &[(OutlineItem, LearnProgressRecord)],
    shifu: &Shifu,
) -> Result<(String, Option<f32>)> {
    let mut model = chain.iter().rev().find_map(|(item, _)| item.llm.clone());
    let mut temperature = chain.iter().rev().find_map(|(item, _)| item.llm_temperature);

    model = model.or_else(|| shifu.llm.clone());
    temperature = temperature.or(shifu.llm_temperature);

    let model = match model {
        Some(m) => m,
        None => runner
            .config
            .get("DEFAULT_LLM_MODEL")
            .await
            .map_err(RunnerError::Config)?
            .unwrap_or_else(|| runner.default_llm_model.clone()),
    };

    if temperature.is_none() {
        if let Some(raw) = runner.config.get("DEFAULT_LLM_TEMPERATURE").await.map_err(RunnerError::Config)? {
            temperature = raw.parse::<f32>().ok();
        }
    }

    Ok((model, temperature.or(runner.default_llm_temperature)))
}

pub(super) fn resolve_system_prompt(chain: &[(OutlineItem, LearnProgressRecord)], shifu: &Shifu) -> Option<String> {
    chain
        .iter()
        .rev()
        .find_map(|(item, _)| item.llm_system_prompt.clone().filter(|s| !s.trim().is_empty()))
        .or_else(|| shifu.llm_system_prompt.clone().filter(|s| !s.trim().is_empty()))
}

fn build_chat_messages(system_prompt: Option<&str>, mdflow: &str, block: &Block, profile: &BTreeMap<String, String>) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    if let Some(prompt) = system_prompt {
        if !prompt.trim().is_empty() {
            messages.push(ChatMessage::system(prompt));
        }
    }
    let vars_desc = if profile.is_empty() {
        String::new()
    } else {
        let joined = profile.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(", ");
        format!("\n\nLearner variables so far: {joined}")
    };
    messages.push(ChatMessage::system(format!(
        "You are rendering one MarkdownFlow lesson block for a learner. Full lesson source:\n\n{mdflow}{vars_desc}"
    )));
    messages.push(ChatMessage::user(block.content.clone()));
    messages
}

#[allow(clippy::too_many_arguments)]
fn build_tts_processor(
    runner: &BlockRunner,
    state: &StepState,
    leaf: &OutlineItem,
    record: &LearnProgressRecord,
    holder: &LearnGeneratedBlock,
    shifu_tts: &crate::outline::tree::TtsSettings,
) -> Option<StreamingTtsProcessor> {
    let deps = runner.tts.as_ref()?;
    if !shifu_tts.tts_enabled {
        return None;
    }
    Some(StreamingTtsProcessor::new(
        leaf.outline_item_bid.clone(),
        holder.generated_block_bid.clone(),
        record.progress_record_bid.clone(),
        state.user_bid.clone(),
        state.shifu_bid.clone(),
        runner.max_segment_chars,
        shifu_tts.provider.clone().unwrap_or_default(),
        shifu_tts.model.clone().unwrap_or_default(),
        VoiceSettings {
            voice_id: shifu_tts.voice_id.clone().unwrap_or_default(),
            speed: shifu_tts.speed.unwrap_or(1.0),
            pitch: shifu_tts.pitch.unwrap_or(0),
            emotion: shifu_tts.emotion.clone().unwrap_or_default(),
            volume: shifu_tts.volume.unwrap_or(1.0),
            ..Default::default()
        },
        state.usage_scene,
        Arc::clone(&deps.synthesizer),
        Arc::clone(&deps.worker_pool),
        Arc::clone(&runner.store),
    ))
}

pub async fn handle_content(
    runner: &BlockRunner,
    state: &StepState,
    chain: &[(OutlineItem, LearnProgressRecord)],
    record: LearnProgressRecord,
    block: &Block,
) -> Result<RunOutcome> {
    let leaf = chain.last().expect("ensure_chain always returns at least the leaf").0.clone();
    let shifu = runner
        .tree
        .get_shifu(&state.shifu_bid, state.preview_mode)
        .await
        .map_err(RunnerError::Outline)?;

    let (llm_model, llm_temperature) = resolve_llm_settings(runner, chain, &shifu).await?;
    let system_prompt = resolve_system_prompt(chain, &shifu);

    let generated_block_bid = generate_id();
    let holder = LearnGeneratedBlock {
        generated_block_bid: generated_block_bid.clone(),
        progress_record_bid: record.progress_record_bid.clone(),
        user_bid: state.user_bid.clone(),
        shifu_bid: state.shifu_bid.clone(),
        outline_item_bid: leaf.outline_item_bid.clone(),
        kind: GeneratedBlockKind::Content,
        role: Role::Teacher,
        position: block.index as u32,
        block_content_conf: block.content.clone(),
        generated_content: String::new(),
        status: 1,
        liked: crate::types::Liked::Neutral,
        deleted: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    runner.store.append_generated_block(holder.clone()).await.map_err(RunnerError::Store)?;

    let profile = runner
        .store
        .get_profile_variables(&state.user_bid, &state.shifu_bid)
        .await
        .map_err(RunnerError::Store)?;
    let messages = build_chat_messages(system_prompt.as_deref(), &leaf.mdflow, block, &profile);

    let usage_ctx = UsageContext { user_bid: state.user_bid.clone(), shifu_bid: state.shifu_bid.clone(), scene: state.usage_scene };
    let mut stream = runner
        .llm
        .stream(&messages, &llm_model, llm_temperature, usage_ctx)
        .await
        .map_err(RunnerError::Llm)?;

    let mut events = Vec::new();
    let mut accumulated = String::new();
    let mut tts_processor = build_tts_processor(runner, state, &leaf, &record, &holder, &shifu.tts);

    while let Some(chunk) = stream.next().await {
        let text = chunk.map_err(RunnerError::Llm)?;
        if text.is_empty() {
            continue;
        }
        accumulated.push_str(&text);
        events.push(Event::content_chunk(leaf.outline_item_bid.clone(), generated_block_bid.clone(), text.clone()));
        if let Some(proc) = tts_processor.as_mut() {
            events.extend(proc.push_text(&text).await);
        }
    }

    events.push(Event::brk(leaf.outline_item_bid.clone(), generated_block_bid.clone()));

    let mut finished = holder;
    finished.generated_content = accumulated;
    finished.updated_at = Utc::now();
    runner.store.update_generated_block(finished).await.map_err(RunnerError::Store)?;

    if let Some(mut proc) = tts_processor {
        let finalize_events = if state.preview_mode {
            proc.finalize_preview().await
        } else if let Some(deps) = &runner.tts {
            proc.finalize(deps.storage.as_ref()).await
        } else {
            Vec::new()
        };
        events.extend(finalize_events);
    }

    let record = runner.ledger.set_position(record, block.index as u32 + 1).await.map_err(RunnerError::Store)?;
    runner.ledger.advance(record, ProgressStatus::InProgress).await.map_err(RunnerError::Store)?;

    Ok(RunOutcome { events, can_continue: true })
}

/// The free-form aside chat path (`input_type = "ask"`). Doesn't touch
/// `block_position`: it's a side channel on top of the current block.
pub async fn handle_ask(
    runner: &BlockRunner,
    state: &StepState,
    chain: &[(OutlineItem, LearnProgressRecord)],
    record: LearnProgressRecord,
    block: &Block,
    input: RunInput,
) -> Result<RunOutcome> {
    let leaf = chain.last().expect("ensure_chain always returns at least the leaf").0.clone();

    let question = match input {
        RunInput::Text(text) => text,
        RunInput::Values(map) => map.into_values().flatten().collect::<Vec<_>>().join(" "),
        RunInput::Empty => String::new(),
    };
    if question.trim().is_empty() {
        return Ok(RunOutcome { events: vec![], can_continue: false });
    }

    let ask_bid = generate_id();
    let ask_row = LearnGeneratedBlock {
        generated_block_bid: ask_bid,
        progress_record_bid: record.progress_record_bid.clone(),
        user_bid: state.user_bid.clone(),
        shifu_bid: state.shifu_bid.clone(),
        outline_item_bid: leaf.outline_item_bid.clone(),
        kind: GeneratedBlockKind::Ask,
        role: Role::Student,
        position: block.index as u32,
        block_content_conf: block.content.clone(),
        generated_content: question.clone(),
        status: 1,
        liked: crate::types::Liked::Neutral,
        deleted: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    runner.store.append_generated_block(ask_row).await.map_err(RunnerError::Store)?;

    let shifu = runner
        .tree
        .get_shifu(&state.shifu_bid, state.preview_mode)
        .await
        .map_err(RunnerError::Outline)?;
    let (llm_model, llm_temperature) = resolve_llm_settings(runner, chain, &shifu).await?;

    let messages = vec![
        ChatMessage::system(format!(
            "You are a tutor answering an aside question about this lesson block:\n\n{}",
            block.content
        )),
        ChatMessage::user(question),
    ];
    let usage_ctx = UsageContext { user_bid: state.user_bid.clone(), shifu_bid: state.shifu_bid.clone(), scene: state.usage_scene };
    let reply = runner
        .llm
        .complete(&messages, &llm_model, llm_temperature, &usage_ctx)
        .await
        .map_err(RunnerError::Llm)?;

    let answer_bid = generate_id();
    let answer_row = LearnGeneratedBlock {
        generated_block_bid: answer_bid.clone(),
        progress_record_bid: record.progress_record_bid.clone(),
        user_bid: state.user_bid.clone(),
        shifu_bid: state.shifu_bid.clone(),
        outline_item_bid: leaf.outline_item_bid.clone(),
        kind: GeneratedBlockKind::Answer,
        role: Role::Teacher,
        position: block.index as u32,
        block_content_conf: block.content.clone(),
        generated_content: reply.clone(),
        status: 1,
        liked: crate::types::Liked::Neutral,
        deleted: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    runner.store.append_generated_block(answer_row).await.map_err(RunnerError::Store)?;

    let events = vec![
        Event::content_chunk(leaf.outline_item_bid.clone(), answer_bid.clone(), reply),
        Event::brk(leaf.outline_item_bid.clone(), answer_bid),
    ];
    Ok(RunOutcome { events, can_continue: false })
}
