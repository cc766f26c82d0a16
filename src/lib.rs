//! # markdownflow-engine: Run Engine for MarkdownFlow Lessons
//!
//! This crate drives a MarkdownFlow lesson document — an outline tree of
//! chapters and leaves, each leaf a sequence of CONTENT and INTERACTION
//! blocks — from a learner's current position to the next point where it
//! needs either more input or more LLM output. A leaf's markdown is parsed
//! once per call ([`markdownflow`]), the outline tree tracks where the
//! learner is and what's left ([`outline`]), and the [`runner::BlockRunner`]
//! ties the two together: one call advances at most one block (or one
//! outline-boundary transition), streaming LLM content and, when a Shifu
//! has TTS enabled, audio segments aligned to visual boundaries in that
//! content ([`visual`], [`tts`]).
//!
//! ## Core Concepts
//!
//! - **Blocks**: CONTENT (LLM-rendered prose) or INTERACTION (a question,
//!   button set, or system action) — the unit [`runner::BlockRunner`] steps
//!   over.
//! - **Outline tree**: chapters (nodes) and leaves, each with its own
//!   progress status; the [`outline::walker`] computes transitions as the
//!   learner enters and completes them.
//! - **Events**: the engine's only output is an ordered [`events::Event`]
//!   stream, framed for SSE delivery.
//! - **Store**: all persistence — progress, generated blocks, learner
//!   variables — goes through the [`store::Store`] trait, so the engine is
//!   backend-agnostic (in-memory for tests, SQLite/Postgres in production).
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use markdownflow_engine::runner::{BlockRunner, RunRequest, RunInput};
//! use markdownflow_engine::store::InMemoryStore;
//! use markdownflow_engine::types::{InputType, UsageScene};
//!
//! # async fn example(
//! #     tree: Arc<dyn markdownflow_engine::outline::tree::StructTreeProvider>,
//! #     llm: Arc<dyn markdownflow_engine::llm::LlmProvider>,
//! #     interaction_processor: Arc<dyn markdownflow_engine::runner::InteractionProcessor>,
//! #     config: Arc<markdownflow_engine::config::ConfigService>,
//! # ) -> Result<(), markdownflow_engine::runner::RunnerError> {
//! let store = Arc::new(InMemoryStore::new());
//! let runner = BlockRunner::new(tree, store, llm, interaction_processor, config, None, "gpt-4o-mini", Some(0.7), 240);
//!
//! let outcome = runner
//!     .run_script(RunRequest {
//!         user_bid: "user-1".into(),
//!         shifu_bid: "shifu-1".into(),
//!         outline_item_bid: "leaf-1a".into(),
//!         preview_mode: false,
//!         mobile: false,
//!         paid: true,
//!         usage_scene: UsageScene::Production,
//!         input_type: InputType::Normal,
//!         input: RunInput::Empty,
//!         reload_generated_block_bid: None,
//!     })
//!     .await?;
//! for event in &outcome.events {
//!     println!("{}", event.to_sse_frame());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`markdownflow`] — pure document parser (`===` sections, `?[...]` grammar)
//! - [`outline`] — struct tree access, progress ledger, outline walker
//! - [`runner`] — the Block Runner state machine
//! - [`llm`] — chat-completion provider abstraction
//! - [`visual`] — visual-boundary detection for streaming TTS alignment
//! - [`tts`] — streaming text-to-speech pipeline
//! - [`metering`] — usage recording for billing
//! - [`config`] — layered config/secrets resolution
//! - [`events`] — the SSE event wire format
//! - [`store`] — persistence trait and backends
//! - [`telemetry`] — human-readable event/error rendering for logs
//! - [`error`] — the crate-wide error ladder

pub mod config;
pub mod error;
pub mod events;
pub mod llm;
pub mod markdownflow;
pub mod metering;
pub mod outline;
pub mod runner;
pub mod store;
pub mod telemetry;
pub mod tts;
pub mod types;
pub mod visual;

pub use error::EngineError;
