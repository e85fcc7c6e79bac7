use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{rows::RowLayout, types::ConversationWindow};

/// Where the viewport should go after a window update renders.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum Anchor {
    ChangeNothing,
    ScrollToBottom,
    /// Scroll the given row into view.
    ScrollToIndex(usize),
    /// Scroll the unread divider at `index` into view.
    ScrollToUnreadIndicator { index: usize },
    /// Restore the previous absolute offset; content was prepended above it.
    Top { scroll_top: f32 },
    /// Restore the previous distance from the bottom edge.
    Bottom { distance_from_bottom: f32 },
}

/// Snapshot of the parts of a window the planner compares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorInput {
    pub conversation_id: Option<String>,
    pub message_ids: Arc<[String]>,
    pub scroll_to_message_id: Option<String>,
    pub scroll_to_message_counter: u64,
    /// Row of `scroll_to_message_id` in the rendered layout.
    pub scroll_target_row: Option<usize>,
    pub unread_indicator_row: Option<usize>,
    pub oldest_unseen_id: Option<String>,
    /// The user already dismissed or scrolled past the unread divider.
    pub unread_acknowledged: bool,
}

impl Default for AnchorInput {
    fn default() -> Self {
        Self {
            conversation_id: None,
            message_ids: Arc::from(Vec::new()),
            scroll_to_message_id: None,
            scroll_to_message_counter: 0,
            scroll_target_row: None,
            unread_indicator_row: None,
            oldest_unseen_id: None,
            unread_acknowledged: false,
        }
    }
}

impl AnchorInput {
    pub fn from_window(
        conversation_id: &str,
        window: &ConversationWindow,
        layout: &RowLayout,
        unread_acknowledged: bool,
    ) -> Self {
        Self {
            conversation_id: Some(conversation_id.to_owned()),
            message_ids: Arc::clone(&window.message_ids),
            scroll_to_message_id: window.scroll_to_message_id.clone(),
            scroll_to_message_counter: window.scroll_to_message_counter,
            scroll_target_row: window
                .scroll_to_message_id
                .as_deref()
                .and_then(|id| layout.row_index_of(id)),
            unread_indicator_row: layout.unread_marker_row(),
            oldest_unseen_id: window
                .metrics
                .oldest_unseen
                .as_ref()
                .map(|pointer| pointer.id.clone()),
            unread_acknowledged,
        }
    }
}

/// Viewport position captured right before an update is rendered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct ViewportSample {
    pub is_at_bottom: bool,
    pub scroll_top: f32,
    pub distance_from_bottom: f32,
}

impl ViewportSample {
    /// Derive a sample from raw scroll geometry.
    pub fn measure(
        scroll_top: f32,
        scroll_height: f32,
        client_height: f32,
        at_bottom_threshold_px: f32,
    ) -> Self {
        let distance_from_bottom = (scroll_height - client_height - scroll_top).max(0.0);
        Self {
            is_at_bottom: distance_from_bottom <= at_bottom_threshold_px,
            scroll_top,
            distance_from_bottom,
        }
    }
}

/// Classify how the viewport should move between two renders. First match wins.
pub fn plan(prev: &AnchorInput, next: &AnchorInput, viewport: &ViewportSample) -> Anchor {
    let switched = prev.conversation_id != next.conversation_id;
    let jumped = if switched {
        next.scroll_to_message_id.is_some()
    } else {
        next.scroll_to_message_counter > prev.scroll_to_message_counter
    };

    if !switched && !jumped && Arc::ptr_eq(&prev.message_ids, &next.message_ids) {
        return Anchor::ChangeNothing;
    }

    if jumped {
        match next.scroll_target_row {
            Some(index) => return Anchor::ScrollToIndex(index),
            None => error!(
                conversation_id = ?next.conversation_id,
                target = ?next.scroll_to_message_id,
                "scroll target is not a rendered row"
            ),
        }
    }

    if let Some(index) = next.unread_indicator_row
        && !next.unread_acknowledged
        && (switched || (prev.oldest_unseen_id.is_none() && next.oldest_unseen_id.is_some()))
    {
        return Anchor::ScrollToUnreadIndicator { index };
    }

    if viewport.is_at_bottom || switched {
        return Anchor::ScrollToBottom;
    }

    let prepended = prev
        .message_ids
        .first()
        .and_then(|first| next.message_ids.iter().position(|id| id == first))
        .is_some_and(|index| index > 0);
    if prepended {
        return Anchor::Top {
            scroll_top: viewport.scroll_top,
        };
    }

    Anchor::Bottom {
        distance_from_bottom: viewport.distance_from_bottom,
    }
}
