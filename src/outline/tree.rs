//! Outline tree data model.
//!
//! `StructTree` is an immutable per-variant snapshot; the Engine never
//! mutates it. Ownership of the tree itself lives with the authoring
//! subsystem (out of scope), so this module only defines the shape and a
//! read-only [`StructTreeProvider`] seam the Block Runner and Outline
//! Walker consume.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{Bid, OutlineType};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Shifu,
    Outline,
    Block,
}

/// A `tts_enabled`/voice configuration block shared by `Shifu` and, when
/// overridden per-outline, by an `OutlineItem`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TtsSettings {
    pub tts_enabled: bool,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub voice_id: Option<String>,
    pub speed: Option<f32>,
    pub pitch: Option<i32>,
    pub emotion: Option<String>,
    pub volume: Option<f32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Shifu {
    pub shifu_bid: Bid,
    pub title: String,
    pub description: String,
    pub avatar: String,
    pub price: f64,
    pub keywords: Vec<String>,
    pub llm_system_prompt: Option<String>,
    pub llm: Option<String>,
    pub llm_temperature: Option<f32>,
    pub tts: TtsSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutlineItem {
    pub outline_item_bid: Bid,
    pub shifu_bid: Bid,
    pub position: String,
    pub title: String,
    pub outline_type: OutlineType,
    pub hidden: bool,
    pub llm_system_prompt: Option<String>,
    pub llm: Option<String>,
    pub llm_temperature: Option<f32>,
    pub mdflow: String,
}

/// One node of the immutable struct-tree snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StructNode {
    /// Set for `shifu`/`outline` nodes; empty for `block` (those only carry `id`).
    pub bid: Bid,
    pub id: i64,
    pub node_type: NodeType,
    pub title: String,
    pub hidden: bool,
    pub children: Vec<StructNode>,
}

impl StructNode {
    /// A node is a leaf outline when its first child is a `block`, or it
    /// has no children at all.
    pub fn is_leaf_outline(&self) -> bool {
        self.node_type == NodeType::Outline
            && (self.children.is_empty() || self.children[0].node_type == NodeType::Block)
    }

    pub fn find(&self, bid: &str) -> Option<&StructNode> {
        if self.bid == bid {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(bid))
    }

    /// The root-to-node path of ancestors, the node itself last.
    pub fn path_to<'a>(&'a self, bid: &str) -> Option<Vec<&'a StructNode>> {
        if self.bid == bid {
            return Some(vec![self]);
        }
        for child in &self.children {
            if let Some(mut path) = child.path_to(bid) {
                path.insert(0, self);
                return Some(path);
            }
        }
        None
    }

    /// The next visible (non-hidden) sibling after `bid` among this node's children.
    pub fn next_visible_sibling(&self, bid: &str) -> Option<&StructNode> {
        let idx = self.children.iter().position(|c| c.bid == bid)?;
        self.children[idx + 1..].iter().find(|c| !c.hidden)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StructTree {
    pub root: StructNode,
}

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum OutlineError {
    #[error("shifu not found: {0}")]
    #[diagnostic(code(outline::shifu_not_found))]
    ShifuNotFound(Bid),

    #[error("shifu struct not found: {0}")]
    #[diagnostic(code(outline::shifu_struct_not_found))]
    ShifuStructNotFound(Bid),

    #[error("outline item not found: {0}")]
    #[diagnostic(code(outline::lesson_not_found))]
    OutlineItemNotFound(Bid),
}

pub type Result<T> = std::result::Result<T, OutlineError>;


/// Read-only access to the authoring-owned outline tree, variant-selected
/// by `preview_mode`. Owned externally; this crate only
/// consumes it.
#[async_trait]
pub trait StructTreeProvider: Send + Sync {
    async fn get_struct(&self, shifu_bid: &str, preview_mode: bool) -> Result<StructTree>;

    async fn get_shifu(&self, shifu_bid: &str, preview_mode: bool) -> Result<Shifu>;

    async fn get_outline_with_mdflow(&self, outline_item_bid: &str, preview_mode: bool) -> Result<OutlineItem>;

    /// Root-to-leaf ancestor chain (root first), used to resolve LLM
    /// settings and system prompts by nearest-non-null override.
    async fn ancestor_chain(&self, outline_item_bid: &str, preview_mode: bool) -> Result<Vec<OutlineItem>>;
}
