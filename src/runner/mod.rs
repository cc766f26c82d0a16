//! C3 — Block Runner: the core run-loop.
//!
//! `run_once` advances progress by at most one block, or one
//! outline-boundary batch (entering a leaf, or completing one and
//! advancing to the next); `run_script` repeatedly calls it — substituting
//! `input_type = "continue"` after the first call — until the Runner
//! blocks on input or the course completes.

mod content;
mod interaction;
mod outline_step;
pub mod step;
pub mod validate;

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{instrument, warn};

use crate::config::{ConfigError, ConfigService};
use crate::llm::{LlmError, LlmProvider};
use crate::markdownflow::{self, Block};
use crate::outline::progress::ProgressLedger;
use crate::outline::tree::{OutlineError, StructTreeProvider};
use crate::store::{Store, StoreError};
use crate::tts::{AudioStorage, TtsError, TtsSynthesizer};
use crate::types::{BlockKind, InputType, ProgressStatus, UsageScene};

pub use step::{normalize_input, NormalizedInput, RunInput, StepState};
pub use validate::{InteractionCtx, InteractionProcessor};

#[derive(Debug, Error, Diagnostic)]
pub enum RunnerError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Outline(#[from] OutlineError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Tts(#[from] TtsError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error("generated block not found: {0}")]
    #[diagnostic(code(runner::generated_block_not_found))]
    GeneratedBlockNotFound(String),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// One `PUT /shifu/{bid}/run/{outline_bid}` request.
#[derive(Clone, Debug)]
pub struct RunRequest {
    pub user_bid: String,
    pub shifu_bid: String,
    pub outline_item_bid: String,
    pub preview_mode: bool,
    pub mobile: bool,
    pub paid: bool,
    pub usage_scene: UsageScene,
    pub input_type: InputType,
    pub input: RunInput,
    pub reload_generated_block_bid: Option<String>,
}

/// Result of one `run_once`/`run_script` call: the ordered event batch
/// plus whether the Runner is ready to be called again immediately
/// (`true`) or is now blocked on learner input (`false`).
#[derive(Clone, Debug, Default)]
pub struct RunOutcome {
    pub events: Vec<crate::events::Event>,
    pub can_continue: bool,
}

/// TTS dependencies, bundled separately since a deployment with TTS
/// disabled wires none of them — TTS is opt-in per Shifu.
pub struct TtsDeps {
    pub synthesizer: Arc<dyn TtsSynthesizer>,
    pub storage: Arc<dyn AudioStorage>,
    pub worker_pool: Arc<Semaphore>,
}

/// A run_script loop longer than this is almost certainly a cycle in the
/// outline tree rather than legitimate progress; breaking out here keeps
/// a malformed tree from hanging a request instead of silently looping.
const MAX_STEPS_PER_SCRIPT: usize = 256;

pub struct BlockRunner {
    tree: Arc<dyn StructTreeProvider>,
    ledger: ProgressLedger,
    store: Arc<dyn Store>,
    llm: Arc<dyn LlmProvider>,
    interaction_processor: Arc<dyn InteractionProcessor>,
    config: Arc<ConfigService>,
    tts: Option<TtsDeps>,
    default_llm_model: String,
    default_llm_temperature: Option<f32>,
    max_segment_chars: usize,
}

impl BlockRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tree: Arc<dyn StructTreeProvider>,
        store: Arc<dyn Store>,
        llm: Arc<dyn LlmProvider>,
        interaction_processor: Arc<dyn InteractionProcessor>,
        config: Arc<ConfigService>,
        tts: Option<TtsDeps>,
        default_llm_model: impl Into<String>,
        default_llm_temperature: Option<f32>,
        max_segment_chars: usize,
    ) -> Self {
        let ledger = ProgressLedger::new(Arc::clone(&store), Arc::clone(&tree));
        Self {
            tree,
            ledger,
            store,
            llm,
            interaction_processor,
            config,
            tts,
            default_llm_model: default_llm_model.into(),
            default_llm_temperature,
            max_segment_chars,
        }
    }

    /// If `target_bid` is given, applies its reload semantics before the
    /// loop starts: a non-`ask` target rewinds `block_position` and
    /// retires generated rows from that point on; an `ask`/`answer`
    /// target is a side channel with no effect on the main cursor
    ///.
    async fn apply_reload(&self, state: &StepState, target_bid: &str) -> Result<()> {
        let target = self
            .store
            .find_generated_block(target_bid)
            .await?
            .ok_or_else(|| RunnerError::GeneratedBlockNotFound(target_bid.to_string()))?;

        if matches!(target.kind, crate::types::GeneratedBlockKind::Ask | crate::types::GeneratedBlockKind::Answer) {
            return Ok(());
        }

        let Some(record) = self.store.find_active_progress(&state.user_bid, &target.outline_item_bid).await? else {
            return Ok(());
        };
        let record = self.ledger.rewind(record, target.position).await?;
        self.ledger.advance(record, ProgressStatus::InProgress).await?;
        Ok(())
    }

    /// Runs one block step (or outline-boundary batch).
    #[instrument(skip(self, state, input), fields(outline = %state.outline_item_bid), err)]
    pub async fn run_once(&self, state: &mut StepState, input_type: InputType, input: RunInput) -> Result<RunOutcome> {
        let chain = self
            .ledger
            .ensure_chain(&state.user_bid, &state.shifu_bid, &state.outline_item_bid, state.preview_mode)
            .await?;
        let (leaf_item, leaf_record) = chain.last().cloned().expect("ensure_chain always returns at least one entry");

        if leaf_record.status == ProgressStatus::NotStarted {
            let tree = self.tree.get_struct(&state.shifu_bid, state.preview_mode).await?;
            return outline_step::handle_entering_leaf(self, state, &tree, leaf_item.outline_type, &leaf_item.outline_item_bid).await;
        }

        let blocks = markdownflow::parse(&leaf_item.mdflow);
        let position = leaf_record.block_position as usize;

        if position >= blocks.len() {
            return self.handle_leaf_exhausted(state, &chain, leaf_record, blocks.len(), &leaf_item.title, input_type, input).await;
        }

        let block = blocks[position].clone();
        match block.kind {
            BlockKind::Content => {
                if matches!(input_type, InputType::Ask) {
                    return content::handle_ask(self, state, &chain, leaf_record, &block, input).await;
                }
                if matches!(input_type, InputType::Normal) && !matches!(input, RunInput::Empty) {
                    // Desync recovery: the client still thinks it owes an
                    // answer, but the current block isn't an interaction
                    // anymore (e.g. a reload raced a second tab). Silently
                    // flip to the content path instead of emitting.
                    return Ok(RunOutcome { events: vec![], can_continue: true });
                }
                content::handle_content(self, state, &chain, leaf_record, &block).await
            }
            BlockKind::Interaction => interaction::handle_interaction(self, state, &chain, leaf_record, &block, input_type, input).await,
        }
    }

    /// The leaf's real blocks are exhausted: synthesize (or re-find) the
    /// `_sys_next_chapter` interaction at the virtual position just past
    /// the last real block, and run it through the normal interaction
    /// path.
    async fn handle_leaf_exhausted(
        &self,
        state: &mut StepState,
        chain: &[(crate::outline::tree::OutlineItem, crate::store::models::LearnProgressRecord)],
        record: crate::store::models::LearnProgressRecord,
        virtual_position: usize,
        leaf_title: &str,
        input_type: InputType,
        input: RunInput,
    ) -> Result<RunOutcome> {
        let source = markdownflow::next_chapter_interaction_source(leaf_title);
        let mut virtual_block: Block = markdownflow::parse(&source)
            .into_iter()
            .next()
            .expect("next_chapter_interaction_source always parses to one interaction block");
        virtual_block.index = virtual_position;

        interaction::handle_interaction(self, state, chain, record, &virtual_block, input_type, input).await
    }

    /// Drives `run_once` in a loop — `input_type` becomes `"continue"`
    /// with empty input after the first call — until the Runner blocks
    /// on input or the course completes.
    pub async fn run_script(&self, req: RunRequest) -> Result<RunOutcome> {
        let mut state = StepState {
            user_bid: req.user_bid,
            shifu_bid: req.shifu_bid,
            outline_item_bid: req.outline_item_bid,
            preview_mode: req.preview_mode,
            mobile: req.mobile,
            paid: req.paid,
            usage_scene: req.usage_scene,
        };

        if let Some(target_bid) = &req.reload_generated_block_bid {
            self.apply_reload(&state, target_bid).await?;
        }

        let mut input_type = req.input_type;
        let mut input = req.input;
        let mut all_events = Vec::new();
        let mut can_continue = true;
        let mut steps = 0usize;

        while can_continue {
            steps += 1;
            if steps > MAX_STEPS_PER_SCRIPT {
                warn!(steps, "run_script exceeded max step count, breaking");
                break;
            }
            let outcome = self.run_once(&mut state, input_type, input).await?;
            can_continue = outcome.can_continue;
            all_events.extend(outcome.events);
            input_type = InputType::Continue;
            input = RunInput::Empty;
        }

        Ok(RunOutcome { events: all_events, can_continue: false })
    }
}
