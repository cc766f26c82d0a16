//! Crate-wide error taxonomy.
//!
//! Every fallible module defines its own error enum and folds it into
//! [`EngineError`] via `#[from]`, the same ladder used by
//! `RunnerError`/`NodeError` in this codebase's lineage: a `thiserror`
//! derive for `Display`/`std::error::Error`, paired with `miette::Diagnostic`
//! for rendered, codeed diagnostics.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::llm::LlmError;
use crate::metering::MeteringError;
use crate::runner::RunnerError;
use crate::store::StoreError;
use crate::tts::TtsError;

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Tts(#[from] TtsError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Metering(#[from] MeteringError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// A cause chain that can cross an async/serialization boundary intact,
/// for embedding inside event frames rather
/// than inside a Rust `std::error::Error` impl.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LadderError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<LadderError>>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl std::fmt::Display for LadderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for LadderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_ref().map(|c| c as &dyn std::error::Error)
    }
}

impl LadderError {
    pub fn msg(m: impl Into<String>) -> Self {
        LadderError {
            message: m.into(),
            cause: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_cause(mut self, cause: LadderError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Build a ladder from any standard error's `source()` chain.
    pub fn from_std(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut ladder = LadderError::msg(err.to_string());
        if let Some(source) = err.source() {
            ladder = ladder.with_cause(LadderError::from_std(source));
        }
        ladder
    }
}
