use crate::{error::TranscriptError, types::MessageLoadingState};

/// Transition rules for a conversation's `message_loading_state`.
///
/// The window store never takes this lock on its own: whoever issues a fetch
/// asks the guard first, records the returned state, and clears it once the
/// fetch settles (success or failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadingGuard {
    state: Option<MessageLoadingState>,
}

impl LoadingGuard {
    pub fn new(state: Option<MessageLoadingState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> Option<MessageLoadingState> {
        self.state
    }

    /// Claim the guard for `requested`.
    ///
    /// Directional loads need an idle guard. `LoadingNewest` supersedes any
    /// directional load, since a reset makes their results stale anyway.
    pub fn begin(
        &mut self,
        requested: MessageLoadingState,
    ) -> Result<MessageLoadingState, TranscriptError> {
        match (self.state, requested) {
            (None, _) | (Some(_), MessageLoadingState::LoadingNewest) => {
                self.state = Some(requested);
                Ok(requested)
            }
            (Some(current), _) => Err(TranscriptError::invalid_loading_transition(
                current, requested,
            )),
        }
    }

    /// Release the guard after a fetch settled.
    pub fn finish(&mut self) -> Option<MessageLoadingState> {
        self.state.take()
    }
}
