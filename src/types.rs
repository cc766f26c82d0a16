//! Shared domain vocabulary used across every component: outline status
//! lattice, block kinds, run-loop input modes, and the billing/usage
//! discriminants.
//!
//! These are the "nouns" of the engine — kept here rather than duplicated
//! per-module, so every component names them the same way.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Business id: an opaque 32-hex or 36-char string. Never an auto-increment
/// integer — cross-service identity must survive a DB migration.
pub type Bid = String;

/// Generate a fresh business id (36-char, hyphenated UUIDv4).
pub fn generate_id() -> Bid {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlineType {
    Normal,
    Trial,
    Guest,
}

/// `LearnProgressRecord.status`. Transitions only ever move right along
/// this lattice, except for an explicit reset which produces a fresh
/// `Reset` row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Locked,
    NotStarted,
    InProgress,
    Completed,
    Reset,
}

impl ProgressStatus {
    /// Ordinal rank on the lattice; `Reset` is excluded from ordering
    /// since it is not reachable by forward transition.
    pub fn rank(self) -> Option<u8> {
        match self {
            ProgressStatus::Locked => Some(0),
            ProgressStatus::NotStarted => Some(1),
            ProgressStatus::InProgress => Some(2),
            ProgressStatus::Completed => Some(3),
            ProgressStatus::Reset => None,
        }
    }

    pub fn can_advance_to(self, next: ProgressStatus) -> bool {
        match (self.rank(), next.rank()) {
            (Some(a), Some(b)) => b >= a,
            _ => matches!(next, ProgressStatus::Reset),
        }
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProgressStatus::Locked => "locked",
            ProgressStatus::NotStarted => "not_started",
            ProgressStatus::InProgress => "in_progress",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Reset => "reset",
        };
        write!(f, "{s}")
    }
}

/// Block Runner's `run_type`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Input,
    Output,
}

/// Block Runner's `input_type`: how to interpret the incoming `input` payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    Normal,
    Ask,
    Continue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Content,
    Interaction,
}

/// `LearnGeneratedBlock.type`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratedBlockKind {
    Content,
    Interaction,
    ErrorMessage,
    Ask,
    Answer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Teacher,
    Student,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum UsageType {
    Llm = 1101,
    Tts = 1102,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RecordLevel {
    Request = 0,
    Segment = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum UsageScene {
    Debug = 1201,
    Preview = 1202,
    Production = 1203,
}

impl UsageScene {
    /// Default billability when no explicit override is given.
    pub fn default_billable(self) -> bool {
        matches!(self, UsageScene::Production)
    }
}

/// Reaction applied to a generated block via the `like`/`dislike`/`none` action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i8)]
pub enum Liked {
    Disliked = -1,
    Neutral = 0,
    Liked = 1,
}

/// System button values interpreted by the Runner rather than recorded as
/// a learner variable.
pub const SYS_PAY: &str = "_sys_pay";
pub const SYS_LOGIN: &str = "_sys_login";
pub const SYS_NEXT_CHAPTER: &str = "_sys_next_chapter";

pub fn is_system_button(value: &str) -> bool {
    value.starts_with("_sys_")
}
