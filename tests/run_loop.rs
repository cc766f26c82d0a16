//! End-to-end exercises of [`BlockRunner`] against in-memory fakes: no
//! network, no database, no real TTS provider. Each test wires a small
//! fixed outline/lesson and asserts the exact event sequence and cursor
//! state the run loop produces for one learner turn.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream;

use markdownflow_engine::config::ConfigService;
use markdownflow_engine::events::{EventPayload, EventType};
use markdownflow_engine::llm::{BoxStream, ChatMessage, LlmProvider, UsageContext};
use markdownflow_engine::outline::tree::{
    NodeType, OutlineError, OutlineItem, Shifu, StructNode, StructTree, StructTreeProvider, TtsSettings,
};
use markdownflow_engine::runner::validate::{ExtractOutcome, InteractionCtx, InteractionProcessor};
use markdownflow_engine::runner::{BlockRunner, RunInput, RunRequest, StepState};
use markdownflow_engine::store::{InMemoryStore, Store};
use markdownflow_engine::types::{InputType, OutlineType, ProgressStatus, UsageScene};

struct FakeTree {
    shifu: Shifu,
    tree: StructTree,
    chains: HashMap<String, Vec<OutlineItem>>,
}

#[async_trait]
impl StructTreeProvider for FakeTree {
    async fn get_struct(&self, _shifu_bid: &str, _preview_mode: bool) -> markdownflow_engine::outline::tree::Result<StructTree> {
        Ok(self.tree.clone())
    }

    async fn get_shifu(&self, _shifu_bid: &str, _preview_mode: bool) -> markdownflow_engine::outline::tree::Result<Shifu> {
        Ok(self.shifu.clone())
    }

    async fn get_outline_with_mdflow(
        &self,
        outline_item_bid: &str,
        _preview_mode: bool,
    ) -> markdownflow_engine::outline::tree::Result<OutlineItem> {
        self.chains
            .values()
            .flatten()
            .find(|i| i.outline_item_bid == outline_item_bid)
            .cloned()
            .ok_or_else(|| OutlineError::OutlineItemNotFound(outline_item_bid.to_string()))
    }

    async fn ancestor_chain(
        &self,
        outline_item_bid: &str,
        _preview_mode: bool,
    ) -> markdownflow_engine::outline::tree::Result<Vec<OutlineItem>> {
        self.chains
            .get(outline_item_bid)
            .cloned()
            .ok_or_else(|| OutlineError::OutlineItemNotFound(outline_item_bid.to_string()))
    }
}

fn leaf_item(bid: &str, mdflow: &str) -> OutlineItem {
    OutlineItem {
        outline_item_bid: bid.to_string(),
        shifu_bid: "shifu-1".to_string(),
        position: "1".to_string(),
        title: bid.to_string(),
        outline_type: OutlineType::Normal,
        hidden: false,
        llm_system_prompt: None,
        llm: None,
        llm_temperature: None,
        mdflow: mdflow.to_string(),
    }
}

fn leaf_node(bid: &str) -> StructNode {
    StructNode { bid: bid.to_string(), id: 0, node_type: NodeType::Outline, title: bid.to_string(), hidden: false, children: Vec::new() }
}

fn sample_shifu() -> Shifu {
    Shifu {
        shifu_bid: "shifu-1".to_string(),
        title: "Intro to Rust".to_string(),
        description: String::new(),
        avatar: String::new(),
        price: 0.0,
        keywords: Vec::new(),
        llm_system_prompt: None,
        llm: None,
        llm_temperature: None,
        tts: TtsSettings::default(),
    }
}

/// One leaf, no siblings: entering it, streaming its only CONTENT block,
/// and exhausting it all happen inside a single `run_script` call.
fn single_leaf_tree() -> FakeTree {
    let item = leaf_item("leaf-1", "Hi there, learner.");
    FakeTree {
        shifu: sample_shifu(),
        tree: StructTree {
            root: StructNode {
                bid: "shifu-1".to_string(),
                id: 0,
                node_type: NodeType::Shifu,
                title: "course".to_string(),
                hidden: false,
                children: vec![leaf_node("leaf-1")],
            },
        },
        chains: HashMap::from([("leaf-1".to_string(), vec![item])]),
    }
}

fn two_leaf_tree() -> FakeTree {
    let a = leaf_item("leaf-1", "First chapter content.");
    let b = leaf_item("leaf-2", "Second chapter content.");
    FakeTree {
        shifu: sample_shifu(),
        tree: StructTree {
            root: StructNode {
                bid: "shifu-1".to_string(),
                id: 0,
                node_type: NodeType::Shifu,
                title: "course".to_string(),
                hidden: false,
                children: vec![leaf_node("leaf-1"), leaf_node("leaf-2")],
            },
        },
        chains: HashMap::from([("leaf-1".to_string(), vec![a]), ("leaf-2".to_string(), vec![b])]),
    }
}

fn interaction_leaf_tree() -> FakeTree {
    let item = leaf_item("leaf-1", "?[%{{lang}}...what's your favourite language?]");
    FakeTree {
        shifu: sample_shifu(),
        tree: StructTree {
            root: StructNode {
                bid: "shifu-1".to_string(),
                id: 0,
                node_type: NodeType::Shifu,
                title: "course".to_string(),
                hidden: false,
                children: vec![leaf_node("leaf-1")],
            },
        },
        chains: HashMap::from([("leaf-1".to_string(), vec![item])]),
    }
}

struct FixedStreamLlm {
    chunks: Vec<&'static str>,
    reply: &'static str,
}

#[async_trait]
impl LlmProvider for FixedStreamLlm {
    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _model: &str,
        _temperature: Option<f32>,
        _usage_ctx: &UsageContext,
    ) -> markdownflow_engine::llm::Result<String> {
        Ok(self.reply.to_string())
    }

    async fn stream(
        &self,
        _messages: &[ChatMessage],
        _model: &str,
        _temperature: Option<f32>,
        _usage_ctx: UsageContext,
    ) -> markdownflow_engine::llm::Result<BoxStream> {
        let items: Vec<markdownflow_engine::llm::Result<String>> = self.chunks.iter().map(|c| Ok(c.to_string())).collect();
        Ok(Box::pin(stream::iter(items)))
    }
}

/// Always passes risk control and reports no declared variable, unless
/// configured to reject the first submission.
struct FixedInteractionProcessor {
    reject_first: AtomicBool,
    outcome: ExtractOutcome,
}

impl FixedInteractionProcessor {
    fn always_extracts(outcome: ExtractOutcome) -> Self {
        Self { reject_first: AtomicBool::new(false), outcome }
    }

    fn rejects_once_then(outcome: ExtractOutcome) -> Self {
        Self { reject_first: AtomicBool::new(true), outcome }
    }
}

#[async_trait]
impl InteractionProcessor for FixedInteractionProcessor {
    async fn check_risk_control(&self, _ctx: &InteractionCtx, _joined_input: &str) -> markdownflow_engine::runner::Result<Option<String>> {
        if self.reject_first.swap(false, Ordering::SeqCst) {
            Ok(Some("please be more specific".to_string()))
        } else {
            Ok(None)
        }
    }

    async fn extract_variables(
        &self,
        _ctx: &InteractionCtx,
        _interaction: &markdownflow_engine::markdownflow::Interaction,
        _input: &markdownflow_engine::runner::step::NormalizedInput,
    ) -> markdownflow_engine::runner::Result<ExtractOutcome> {
        Ok(self.outcome.clone())
    }
}

fn build_runner(
    tree: Arc<dyn StructTreeProvider>,
    store: Arc<InMemoryStore>,
    llm: Arc<dyn LlmProvider>,
    interaction: Arc<dyn InteractionProcessor>,
) -> BlockRunner {
    let config = Arc::new(ConfigService::with_default_cache(store.clone(), None));
    BlockRunner::new(tree, store, llm, interaction, config, None, "gpt-5", None, 400)
}

fn new_state(outline_item_bid: &str) -> StepState {
    StepState {
        user_bid: "user-1".to_string(),
        shifu_bid: "shifu-1".to_string(),
        outline_item_bid: outline_item_bid.to_string(),
        preview_mode: true,
        mobile: true,
        paid: true,
        usage_scene: UsageScene::Debug,
    }
}

#[tokio::test]
async fn entering_a_leaf_emits_outline_item_update_before_any_content() {
    let tree = Arc::new(single_leaf_tree());
    let store = Arc::new(InMemoryStore::new());
    let llm = Arc::new(FixedStreamLlm { chunks: vec!["Hi ", "there."], reply: "" });
    let interaction = Arc::new(FixedInteractionProcessor::always_extracts(ExtractOutcome::Variables(Default::default())));
    let runner = build_runner(tree, store, llm, interaction);

    let mut state = new_state("leaf-1");
    let outcome = runner.run_once(&mut state, InputType::Normal, RunInput::Empty).await.unwrap();

    assert!(outcome.can_continue);
    // One transition for the course root, one for the leaf itself.
    assert_eq!(outcome.events.len(), 2);
    assert!(outcome.events.iter().all(|e| e.event_type == EventType::OutlineItemUpdate));
}

#[tokio::test]
async fn plain_content_leaf_streams_chunks_then_breaks_and_advances_position() {
    let tree = Arc::new(single_leaf_tree());
    let store = Arc::new(InMemoryStore::new());
    let llm = Arc::new(FixedStreamLlm { chunks: vec!["Hi ", "there."], reply: "" });
    let interaction = Arc::new(FixedInteractionProcessor::always_extracts(ExtractOutcome::Variables(Default::default())));
    let runner = build_runner(tree, Arc::clone(&store), llm, interaction);

    let mut state = new_state("leaf-1");
    runner.run_once(&mut state, InputType::Normal, RunInput::Empty).await.unwrap(); // enter leaf

    let outcome = runner.run_once(&mut state, InputType::Continue, RunInput::Empty).await.unwrap();

    assert!(outcome.can_continue);
    let kinds: Vec<_> = outcome.events.iter().map(|e| e.event_type).collect();
    assert_eq!(kinds, vec![EventType::Content, EventType::Content, EventType::Break]);
    match &outcome.events[0].content {
        EventPayload::Text(text) => assert_eq!(text, "Hi "),
        other => panic!("expected text payload, got {other:?}"),
    }
    match &outcome.events[1].content {
        EventPayload::Text(text) => assert_eq!(text, "there."),
        other => panic!("expected text payload, got {other:?}"),
    }

    let record = store.find_active_progress("user-1", "leaf-1").await.unwrap().unwrap();
    assert_eq!(record.status, ProgressStatus::InProgress);
    assert_eq!(record.block_position, 1);
}

#[tokio::test]
async fn exhausting_the_only_leaf_synthesizes_next_chapter_interaction() {
    let tree = Arc::new(single_leaf_tree());
    let store = Arc::new(InMemoryStore::new());
    let llm = Arc::new(FixedStreamLlm { chunks: vec!["Hi ", "there."], reply: "" });
    let interaction = Arc::new(FixedInteractionProcessor::always_extracts(ExtractOutcome::Variables(Default::default())));
    let runner = build_runner(tree, store, llm, interaction);

    let mut state = new_state("leaf-1");
    runner.run_once(&mut state, InputType::Normal, RunInput::Empty).await.unwrap(); // enter leaf
    runner.run_once(&mut state, InputType::Continue, RunInput::Empty).await.unwrap(); // content block

    let outcome = runner.run_once(&mut state, InputType::Continue, RunInput::Empty).await.unwrap();

    assert!(!outcome.can_continue);
    assert_eq!(outcome.events.len(), 1);
    assert_eq!(outcome.events[0].event_type, EventType::Interaction);
    match &outcome.events[0].content {
        EventPayload::Text(source) => assert!(source.contains("_sys_next_chapter")),
        other => panic!("expected interaction source text, got {other:?}"),
    }
}

#[tokio::test]
async fn run_script_drives_a_single_leaf_course_to_completion_in_one_call() {
    let tree = Arc::new(single_leaf_tree());
    let store = Arc::new(InMemoryStore::new());
    let llm = Arc::new(FixedStreamLlm { chunks: vec!["Hi ", "there."], reply: "" });
    let interaction = Arc::new(FixedInteractionProcessor::always_extracts(ExtractOutcome::Variables(Default::default())));
    let runner = build_runner(tree, store, llm, interaction);

    let req = RunRequest {
        user_bid: "user-1".to_string(),
        shifu_bid: "shifu-1".to_string(),
        outline_item_bid: "leaf-1".to_string(),
        preview_mode: true,
        mobile: true,
        paid: true,
        usage_scene: UsageScene::Debug,
        input_type: InputType::Normal,
        input: RunInput::Empty,
        reload_generated_block_bid: None,
    };
    let outcome = runner.run_script(req).await.unwrap();

    assert!(!outcome.can_continue);
    let kinds: Vec<_> = outcome.events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        kinds,
        vec![
            EventType::OutlineItemUpdate,
            EventType::OutlineItemUpdate,
            EventType::Content,
            EventType::Content,
            EventType::Break,
            EventType::Interaction,
        ]
    );
}

#[tokio::test]
async fn clicking_next_chapter_advances_to_the_second_leaf() {
    let tree = Arc::new(two_leaf_tree());
    let store = Arc::new(InMemoryStore::new());
    let llm = Arc::new(FixedStreamLlm { chunks: vec!["ok"], reply: "" });
    let interaction = Arc::new(FixedInteractionProcessor::always_extracts(ExtractOutcome::Variables(Default::default())));
    let runner = build_runner(tree, Arc::clone(&store), llm, interaction);

    let mut state = new_state("leaf-1");
    runner.run_once(&mut state, InputType::Normal, RunInput::Empty).await.unwrap(); // enter leaf-1
    runner.run_once(&mut state, InputType::Continue, RunInput::Empty).await.unwrap(); // content block
    let outcome = runner.run_once(&mut state, InputType::Continue, RunInput::Empty).await.unwrap(); // synthesize next-chapter prompt
    assert!(!outcome.can_continue);

    // The learner clicks the synthesized next-chapter button.
    let advance = runner.run_once(&mut state, InputType::Normal, RunInput::Empty).await.unwrap();
    assert!(advance.can_continue);
    assert_eq!(state.outline_item_bid, "leaf-2");
    let kinds: Vec<_> = advance.events.iter().map(|e| e.event_type).collect();
    assert_eq!(kinds, vec![EventType::OutlineItemUpdate, EventType::OutlineItemUpdate]);

    let old_leaf = store.find_active_progress("user-1", "leaf-1").await.unwrap().unwrap();
    assert_eq!(old_leaf.status, ProgressStatus::Completed);
}

#[tokio::test]
async fn interaction_validation_failure_reprompts_without_a_variable_update() {
    let tree = Arc::new(interaction_leaf_tree());
    let store = Arc::new(InMemoryStore::new());
    let llm = Arc::new(FixedStreamLlm { chunks: vec![], reply: "" });
    let interaction =
        Arc::new(FixedInteractionProcessor::always_extracts(ExtractOutcome::Invalid { message: "that isn't a language".to_string() }));
    let runner = build_runner(tree, Arc::clone(&store), llm, interaction);

    let mut state = new_state("leaf-1");
    runner.run_once(&mut state, InputType::Normal, RunInput::Empty).await.unwrap(); // enter leaf, emits the interaction prompt

    let outcome = runner.run_once(&mut state, InputType::Normal, RunInput::Text("purple".to_string())).await.unwrap();

    assert!(!outcome.can_continue);
    let kinds: Vec<_> = outcome.events.iter().map(|e| e.event_type).collect();
    assert_eq!(kinds, vec![EventType::Content, EventType::Break, EventType::Interaction]);
    assert!(!kinds.contains(&EventType::VariableUpdate));

    let record = store.find_active_progress("user-1", "leaf-1").await.unwrap().unwrap();
    assert_eq!(record.block_position, 0, "a rejected answer must not move the cursor");
}

#[tokio::test]
async fn interaction_risk_control_rejection_reprompts_the_same_row() {
    let tree = Arc::new(interaction_leaf_tree());
    let store = Arc::new(InMemoryStore::new());
    let llm = Arc::new(FixedStreamLlm { chunks: vec![], reply: "" });
    let interaction = Arc::new(FixedInteractionProcessor::rejects_once_then(ExtractOutcome::Variables(Default::default())));
    let runner = build_runner(tree, Arc::clone(&store), llm, interaction);

    let mut state = new_state("leaf-1");
    runner.run_once(&mut state, InputType::Normal, RunInput::Empty).await.unwrap();

    let rejected = runner.run_once(&mut state, InputType::Normal, RunInput::Text("rust".to_string())).await.unwrap();
    assert!(!rejected.can_continue);
    let kinds: Vec<_> = rejected.events.iter().map(|e| e.event_type).collect();
    assert_eq!(kinds, vec![EventType::Content, EventType::Break, EventType::Interaction]);

    let accepted = runner.run_once(&mut state, InputType::Normal, RunInput::Text("rust".to_string())).await.unwrap();
    assert!(accepted.can_continue);
}

#[tokio::test]
async fn declared_variable_answer_persists_and_emits_variable_update() {
    let tree = Arc::new(interaction_leaf_tree());
    let store = Arc::new(InMemoryStore::new());
    let llm = Arc::new(FixedStreamLlm { chunks: vec![], reply: "" });
    let mut vars = std::collections::BTreeMap::new();
    vars.insert("lang".to_string(), "rust".to_string());
    let interaction = Arc::new(FixedInteractionProcessor::always_extracts(ExtractOutcome::Variables(vars)));
    let runner = build_runner(tree, Arc::clone(&store), llm, interaction);

    let mut state = new_state("leaf-1");
    runner.run_once(&mut state, InputType::Normal, RunInput::Empty).await.unwrap();

    let outcome = runner.run_once(&mut state, InputType::Normal, RunInput::Text("rust".to_string())).await.unwrap();
    assert!(outcome.can_continue);
    assert_eq!(outcome.events.len(), 1);
    assert_eq!(outcome.events[0].event_type, EventType::VariableUpdate);
    match &outcome.events[0].content {
        EventPayload::Variable(payload) => {
            assert_eq!(payload.variable_name, "lang");
            assert_eq!(payload.variable_value, "rust");
        }
        other => panic!("expected variable payload, got {other:?}"),
    }

    let profile = store.get_profile_variables("user-1", "shifu-1").await.unwrap();
    assert_eq!(profile.get("lang").map(String::as_str), Some("rust"));
}

#[tokio::test]
async fn ask_path_never_moves_the_block_position() {
    let tree = Arc::new(single_leaf_tree());
    let store = Arc::new(InMemoryStore::new());
    let llm = Arc::new(FixedStreamLlm { chunks: vec![], reply: "asides are answered without advancing the lesson" });
    let interaction = Arc::new(FixedInteractionProcessor::always_extracts(ExtractOutcome::Variables(Default::default())));
    let runner = build_runner(tree, Arc::clone(&store), llm, interaction);

    let mut state = new_state("leaf-1");
    runner.run_once(&mut state, InputType::Normal, RunInput::Empty).await.unwrap(); // enter leaf

    let before = store.find_active_progress("user-1", "leaf-1").await.unwrap().unwrap();
    assert_eq!(before.block_position, 0);

    let outcome = runner.run_once(&mut state, InputType::Ask, RunInput::Text("why is it called Rust?".to_string())).await.unwrap();

    assert!(!outcome.can_continue);
    let kinds: Vec<_> = outcome.events.iter().map(|e| e.event_type).collect();
    assert_eq!(kinds, vec![EventType::Content, EventType::Break]);

    let after = store.find_active_progress("user-1", "leaf-1").await.unwrap().unwrap();
    assert_eq!(after.block_position, 0, "an aside question must not advance the cursor");
}

#[tokio::test]
async fn reload_targeting_an_ask_generated_block_is_a_cursor_no_op() {
    let tree = Arc::new(single_leaf_tree());
    let store = Arc::new(InMemoryStore::new());
    let llm = Arc::new(FixedStreamLlm { chunks: vec!["Hi ", "there."], reply: "an aside reply" });
    let interaction = Arc::new(FixedInteractionProcessor::always_extracts(ExtractOutcome::Variables(Default::default())));
    let runner = build_runner(tree, Arc::clone(&store), llm, interaction);

    let mut state = new_state("leaf-1");
    runner.run_once(&mut state, InputType::Normal, RunInput::Empty).await.unwrap(); // enter leaf, position 0
    runner.run_once(&mut state, InputType::Ask, RunInput::Text("why?".to_string())).await.unwrap(); // aside, still position 0
    runner.run_once(&mut state, InputType::Continue, RunInput::Empty).await.unwrap(); // content block, position -> 1

    let record_before = store.find_active_progress("user-1", "leaf-1").await.unwrap().unwrap();
    assert_eq!(record_before.block_position, 1);

    let answer_bid = store
        .list_generated_blocks(&record_before.progress_record_bid)
        .await
        .unwrap()
        .into_iter()
        .find(|b| matches!(b.kind, markdownflow_engine::types::GeneratedBlockKind::Answer))
        .expect("the ask path appended an answer row")
        .generated_block_bid;

    let req = RunRequest {
        user_bid: "user-1".to_string(),
        shifu_bid: "shifu-1".to_string(),
        outline_item_bid: "leaf-1".to_string(),
        preview_mode: true,
        mobile: true,
        paid: true,
        usage_scene: UsageScene::Debug,
        input_type: InputType::Continue,
        input: RunInput::Empty,
        reload_generated_block_bid: Some(answer_bid),
    };
    runner.run_script(req).await.unwrap();

    let record_after = store.find_active_progress("user-1", "leaf-1").await.unwrap().unwrap();
    assert_eq!(record_after.block_position, 1, "reloading an ask/answer row must not rewind the main cursor");
}

#[tokio::test]
async fn unpaid_normal_leaf_gates_behind_a_paywall_prompt() {
    let tree = Arc::new(single_leaf_tree());
    let store = Arc::new(InMemoryStore::new());
    let llm = Arc::new(FixedStreamLlm { chunks: vec![], reply: "" });
    let interaction = Arc::new(FixedInteractionProcessor::always_extracts(ExtractOutcome::Variables(Default::default())));
    let runner = build_runner(tree, store, llm, interaction);

    let mut state = StepState {
        user_bid: "user-1".to_string(),
        shifu_bid: "shifu-1".to_string(),
        outline_item_bid: "leaf-1".to_string(),
        preview_mode: false,
        mobile: true,
        paid: false,
        usage_scene: UsageScene::Production,
    };
    let outcome = runner.run_once(&mut state, InputType::Normal, RunInput::Empty).await.unwrap();

    assert!(!outcome.can_continue);
    assert_eq!(outcome.events.len(), 1);
    assert_eq!(outcome.events[0].event_type, EventType::Interaction);
    match &outcome.events[0].content {
        EventPayload::Text(source) => assert!(source.contains("_sys_pay")),
        other => panic!("expected the pay-gate source text, got {other:?}"),
    }
}
