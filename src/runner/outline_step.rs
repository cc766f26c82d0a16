//! Applies [`crate::outline::walker`] transitions to progress rows and
//! `OUTLINE_ITEM_UPDATE` events, and the deferred "next chapter" handshake.

use crate::events::event::OutlineItemUpdatePayload;
use crate::events::Event;
use crate::outline::tree::StructTree;
use crate::outline::walker::{self, OutlineTransition, TransitionKind};
use crate::types::{OutlineType, ProgressStatus};

use super::step::StepState;
use super::{BlockRunner, Result, RunOutcome, RunnerError};

fn wire_status(status: ProgressStatus) -> crate::events::event::OutlineStatusWire {
    use crate::events::event::OutlineStatusWire;
    match status {
        ProgressStatus::NotStarted => OutlineStatusWire::NotStarted,
        ProgressStatus::InProgress => OutlineStatusWire::InProgress,
        ProgressStatus::Completed => OutlineStatusWire::Completed,
        ProgressStatus::Locked | ProgressStatus::Reset => OutlineStatusWire::Locked,
    }
}

/// Turns a batch of [`OutlineTransition`]s into persisted progress rows
/// plus their `OUTLINE_ITEM_UPDATE` events, in order.
pub async fn apply_transitions(
    runner: &BlockRunner,
    user_bid: &str,
    shifu_bid: &str,
    transitions: &[OutlineTransition],
) -> Result<Vec<Event>> {
    let mut events = Vec::with_capacity(transitions.len());
    for transition in transitions {
        let status = match transition.kind {
            TransitionKind::LeafStart | TransitionKind::NodeStart => ProgressStatus::InProgress,
            TransitionKind::LeafCompleted | TransitionKind::NodeCompleted => ProgressStatus::Completed,
        };

        let mut record = runner
            .ledger
            .find_or_create(user_bid, shifu_bid, &transition.outline_bid)
            .await
            .map_err(RunnerError::Store)?;
        if matches!(transition.kind, TransitionKind::LeafStart | TransitionKind::NodeStart) {
            record = runner.ledger.set_position(record, 0).await.map_err(RunnerError::Store)?;
        }
        runner.ledger.advance(record, status).await.map_err(RunnerError::Store)?;

        events.push(Event::outline_item_update(
            transition.outline_bid.clone(),
            String::new(),
            OutlineItemUpdatePayload {
                outline_bid: transition.outline_bid.clone(),
                title: transition.title.clone(),
                status: wire_status(status),
                has_children: transition.has_children,
            },
        ));
    }
    Ok(events)
}

fn system_button_source(label: &str, value: &str) -> String {
    format!("?[{label}//{value}]")
}

/// First arrival at a not-yet-started leaf: gate on payment/login, then
/// emit the `NODE_START`/`LEAF_START` batch.
pub async fn handle_entering_leaf(
    runner: &BlockRunner,
    state: &StepState,
    tree: &StructTree,
    leaf_outline_type: OutlineType,
    leaf_bid: &str,
) -> Result<RunOutcome> {
    if leaf_outline_type == OutlineType::Normal && !state.preview_mode && !state.paid {
        let gb = crate::types::generate_id();
        let source = system_button_source("Unlock this lesson", crate::types::SYS_PAY);
        return Ok(RunOutcome {
            events: vec![Event::interaction(leaf_bid.to_string(), gb, source)],
            can_continue: false,
        });
    }
    if leaf_outline_type == OutlineType::Trial && !state.mobile {
        let gb = crate::types::generate_id();
        let source = system_button_source("Sign in to continue", crate::types::SYS_LOGIN);
        return Ok(RunOutcome {
            events: vec![Event::interaction(leaf_bid.to_string(), gb, source)],
            can_continue: false,
        });
    }

    let transitions = walker::enter_leaf(tree, leaf_bid);
    let events = apply_transitions(runner, &state.user_bid, &state.shifu_bid, &transitions).await?;
    Ok(RunOutcome { events, can_continue: true })
}

/// The learner clicked `_sys_next_chapter`: complete the current leaf,
/// advance to the next one (or finish the course), and move `state`'s
/// cursor if a next leaf was found.
pub async fn advance_chapter(
    runner: &BlockRunner,
    state: &mut StepState,
    tree: &StructTree,
    leaf_bid: &str,
) -> Result<RunOutcome> {
    let transitions = walker::complete_leaf_and_advance(tree, leaf_bid);
    let mut events = apply_transitions(runner, &state.user_bid, &state.shifu_bid, &transitions).await?;

    match transitions.iter().find(|t| t.kind == TransitionKind::LeafStart) {
        Some(next_leaf) => {
            state.outline_item_bid = next_leaf.outline_bid.clone();
            Ok(RunOutcome { events, can_continue: true })
        }
        None => {
            events.push(Event::done(leaf_bid.to_string(), String::new()));
            Ok(RunOutcome { events, can_continue: false })
        }
    }
}
