//! INTERACTION block handling.
//!
//! Order of checks: system buttons (`_sys_pay`/`_sys_login`/`_sys_next_chapter`)
//! short-circuit before the generic persisted-interaction lifecycle; an
//! unanswered interaction is created once and re-emitted verbatim on
//! every subsequent call until the learner answers it — at most one
//! active interaction row exists per position at any instant.

use chrono::Utc;

use crate::events::Event;
use crate::markdownflow::Block;
use crate::outline::tree::OutlineItem;
use crate::store::models::{LearnGeneratedBlock, LearnProgressRecord};
use crate::types::{generate_id, GeneratedBlockKind, InputType, Liked, ProgressStatus, Role, SYS_LOGIN, SYS_NEXT_CHAPTER, SYS_PAY};

use super::outline_step;
use super::step::{normalize_input, RunInput, StepState};
use super::validate::{ExtractOutcome, InteractionCtx};
use super::{BlockRunner, Result, RunOutcome, RunnerError};

fn new_row(
    record: &LearnProgressRecord,
    state: &StepState,
    outline_bid: &str,
    block: &Block,
    kind: GeneratedBlockKind,
    role: Role,
    content: String,
) -> LearnGeneratedBlock {
    LearnGeneratedBlock {
        generated_block_bid: generate_id(),
        progress_record_bid: record.progress_record_bid.clone(),
        user_bid: state.user_bid.clone(),
        shifu_bid: state.shifu_bid.clone(),
        outline_item_bid: outline_bid.to_string(),
        kind,
        role,
        position: block.index as u32,
        block_content_conf: block.content.clone(),
        generated_content: content,
        status: 1,
        liked: Liked::Neutral,
        deleted: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

async fn advance_past(runner: &BlockRunner, record: LearnProgressRecord, next_position: u32) -> Result<()> {
    let record = runner.ledger.set_position(record, next_position).await.map_err(RunnerError::Store)?;
    runner.ledger.advance(record, ProgressStatus::InProgress).await.map_err(RunnerError::Store)?;
    Ok(())
}

pub async fn handle_interaction(
    runner: &BlockRunner,
    state: &mut StepState,
    chain: &[(OutlineItem, LearnProgressRecord)],
    record: LearnProgressRecord,
    block: &Block,
    _input_type: InputType,
    input: RunInput,
) -> Result<RunOutcome> {
    let leaf = chain.last().expect("ensure_chain always returns at least the leaf").0.clone();
    let interaction = block.interaction.clone().unwrap_or_default();
    let outline_bid = leaf.outline_item_bid.clone();

    if interaction.buttons.iter().any(|b| b.value.as_deref() == Some(SYS_PAY)) {
        return if state.paid {
            advance_past(runner, record, block.index as u32 + 1).await?;
            Ok(RunOutcome { events: vec![], can_continue: true })
        } else {
            let gb = generate_id();
            Ok(RunOutcome { events: vec![Event::interaction(outline_bid, gb, block.content.clone())], can_continue: false })
        };
    }
    if interaction.buttons.iter().any(|b| b.value.as_deref() == Some(SYS_LOGIN)) {
        return if state.mobile {
            advance_past(runner, record, block.index as u32 + 1).await?;
            Ok(RunOutcome { events: vec![], can_continue: true })
        } else {
            let gb = generate_id();
            Ok(RunOutcome { events: vec![Event::interaction(outline_bid, gb, block.content.clone())], can_continue: false })
        };
    }

    let is_next_chapter = interaction.buttons.iter().any(|b| b.value.as_deref() == Some(SYS_NEXT_CHAPTER));

    let existing = runner
        .store
        .find_active_generated_block(&record.progress_record_bid, block.index as u32)
        .await
        .map_err(RunnerError::Store)?;

    let Some(mut row) = existing else {
        let row = new_row(&record, state, &outline_bid, block, GeneratedBlockKind::Interaction, Role::Teacher, String::new());
        runner.store.append_generated_block(row.clone()).await.map_err(RunnerError::Store)?;
        return Ok(RunOutcome {
            events: vec![Event::interaction(outline_bid, row.generated_block_bid, block.content.clone())],
            can_continue: false,
        });
    };

    if is_next_chapter {
        let tree = runner
            .tree
            .get_struct(&state.shifu_bid, state.preview_mode)
            .await
            .map_err(RunnerError::Outline)?;
        return outline_step::advance_chapter(runner, state, &tree, &outline_bid).await;
    }

    let normalized = normalize_input(&input, interaction.variable.as_deref());
    let joined = normalized.joined_all();

    let ctx = InteractionCtx {
        shifu_bid: state.shifu_bid.clone(),
        outline_item_bid: outline_bid.clone(),
        question: interaction.question.clone(),
        llm: leaf.llm.clone(),
        llm_temperature: leaf.llm_temperature,
    };

    // Risk control runs against the raw answer before it's persisted as
    // `row`'s content: a rejected answer leaves the original, still-Teacher
    // interaction row untouched and simply re-prompts it — no second
    // active interaction row is created here.
    if let Some(feedback) = runner.interaction_processor.check_risk_control(&ctx, &joined).await? {
        let feedback_gb = generate_id();
        let events = vec![
            Event::content_chunk(outline_bid.clone(), feedback_gb.clone(), feedback),
            Event::brk(outline_bid.clone(), feedback_gb),
            Event::interaction(outline_bid, row.generated_block_bid.clone(), block.content.clone()),
        ];
        return Ok(RunOutcome { events, can_continue: false });
    }

    row.role = Role::Student;
    row.generated_content = joined.clone();
    row.updated_at = Utc::now();
    runner.store.update_generated_block(row.clone()).await.map_err(RunnerError::Store)?;

    if interaction.variable.is_none() {
        advance_past(runner, record, block.index as u32 + 1).await?;
        return Ok(RunOutcome { events: vec![], can_continue: true });
    }

    match runner.interaction_processor.extract_variables(&ctx, &interaction, &normalized).await? {
        ExtractOutcome::Variables(vars) => {
            let mut events = Vec::with_capacity(vars.len());
            for (name, value) in &vars {
                runner
                    .store
                    .set_profile_variable(&state.user_bid, &state.shifu_bid, name, value)
                    .await
                    .map_err(RunnerError::Store)?;
                events.push(Event::variable_update(outline_bid.clone(), row.generated_block_bid.clone(), name.clone(), value.clone()));
            }
            advance_past(runner, record, block.index as u32 + 1).await?;
            Ok(RunOutcome { events, can_continue: true })
        }
        ExtractOutcome::Invalid { message } => {
            // The answered row failed validation: retire it so only the
            // fresh re-prompt below counts as the active interaction for
            // this position.
            row.status = 0;
            row.updated_at = Utc::now();
            runner.store.update_generated_block(row).await.map_err(RunnerError::Store)?;

            let error_row = new_row(&record, state, &outline_bid, block, GeneratedBlockKind::ErrorMessage, Role::Teacher, message.clone());
            let error_gb = error_row.generated_block_bid.clone();
            runner.store.append_generated_block(error_row).await.map_err(RunnerError::Store)?;

            let fresh_row = new_row(&record, state, &outline_bid, block, GeneratedBlockKind::Interaction, Role::Teacher, String::new());
            let fresh_gb = fresh_row.generated_block_bid.clone();
            runner.store.append_generated_block(fresh_row).await.map_err(RunnerError::Store)?;

            let events = vec![
                Event::content_chunk(outline_bid.clone(), error_gb.clone(), message),
                Event::brk(outline_bid.clone(), error_gb),
                Event::interaction(outline_bid, fresh_gb, block.content.clone()),
            ];
            Ok(RunOutcome { events, can_continue: false })
        }
    }
}
