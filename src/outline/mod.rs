//! Outline tree, progress bookkeeping, and the transition walker. These
//! three pieces are kept separate on purpose: `tree`
//! is pure data, `progress` is the persistence-facing orchestration layer,
//! and `walker` is a pure function from tree shape to transition events —
//! none of them know about the LLM or TTS side of the runner.

pub mod progress;
pub mod tree;
pub mod walker;

pub use progress::{ensure_progress_chain, find_or_create_progress, ProgressLedger};
pub use tree::{NodeType, OutlineError, OutlineItem, Shifu, StructNode, StructTree, StructTreeProvider, TtsSettings};
pub use walker::{complete_leaf_and_advance, enter_leaf, OutlineTransition, TransitionKind};
