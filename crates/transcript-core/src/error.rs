use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::MessageLoadingState;

/// Broad error category used by hosts to decide how to surface a failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TranscriptErrorCategory {
    /// Invalid tuning or host input.
    Config,
    /// The message store collaborator failed.
    Store,
    /// A referenced conversation or message does not exist.
    NotFound,
    /// The request conflicts with the current window state.
    InvalidState,
    /// Engine bug or invariant break.
    Internal,
}

/// Stable error payload emitted across the host boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct TranscriptError {
    /// High-level error category.
    pub category: TranscriptErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl TranscriptError {
    pub fn new(
        category: TranscriptErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    /// A pagination request collided with one already in flight.
    pub fn invalid_loading_transition(
        current: MessageLoadingState,
        requested: MessageLoadingState,
    ) -> Self {
        Self::new(
            TranscriptErrorCategory::InvalidState,
            "invalid_loading_transition",
            format!("cannot start {requested:?} while {current:?} is in flight"),
        )
    }

    /// An action named a conversation that is not the open one.
    pub fn conversation_not_open(conversation_id: Option<&str>) -> Self {
        let message = match conversation_id {
            Some(id) => format!("conversation '{id}' is not open"),
            None => "no conversation is open".to_owned(),
        };
        Self::new(
            TranscriptErrorCategory::NotFound,
            "conversation_not_open",
            message,
        )
    }

    /// The open conversation has no window to act on.
    pub fn window_missing(conversation_id: &str) -> Self {
        Self::new(
            TranscriptErrorCategory::Internal,
            "window_missing",
            format!("conversation '{conversation_id}' has no loaded window"),
        )
    }
}
