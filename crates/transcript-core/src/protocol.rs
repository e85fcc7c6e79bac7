use serde::{Deserialize, Serialize};

use crate::{
    anchor::Anchor,
    error::TranscriptError,
    rows::RowDescriptor,
    types::{Message, MessageLoadingState, WindowMetrics},
    visibility::VisibilityEvent,
};

/// Direction and boundary of one history fetch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum FetchKind {
    /// Messages strictly before `before`.
    Older {
        /// First loaded message ID.
        before: String,
    },
    /// Messages strictly after `after`.
    Newer {
        /// Last loaded message ID.
        after: String,
    },
    /// Newest page, or a page centred on `around`.
    Newest {
        /// Jump target, if any.
        around: Option<String>,
    },
}

impl FetchKind {
    /// Loading state held while this fetch is in flight.
    pub fn loading_state(&self) -> MessageLoadingState {
        match self {
            Self::Older { .. } => MessageLoadingState::LoadingOlder,
            Self::Newer { .. } => MessageLoadingState::LoadingNewer,
            Self::Newest { .. } => MessageLoadingState::LoadingNewest,
        }
    }
}

/// History fetch issued by a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchRequest {
    /// Session-unique request ID used to recognise stale completions.
    pub request_id: u64,
    /// Conversation the fetch belongs to.
    pub conversation_id: String,
    /// Direction and boundary.
    pub kind: FetchKind,
    /// Maximum number of messages to return.
    pub limit: usize,
}

/// Completed fetch handed back to the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageResult {
    /// The request this page answers.
    pub request: FetchRequest,
    /// Returned messages, any order.
    pub messages: Vec<Message>,
    /// Conversation-wide metrics. Only read for `FetchKind::Newest` pages.
    #[serde(default)]
    pub metrics: WindowMetrics,
}

/// Read receipt for everything up to and including one message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MarkReadRequest {
    /// Conversation being read.
    pub conversation_id: String,
    /// Newest message whose bottom edge was seen.
    pub upto_message_id: String,
}

/// Command channel input accepted by the transcript runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TranscriptCommand {
    /// Show a conversation, optionally centred on one message.
    OpenConversation {
        /// Target conversation ID.
        conversation_id: String,
        /// Message to centre the first page on.
        around_message_id: Option<String>,
    },
    /// Close the open conversation.
    CloseConversation,
    /// Jump to a message of the open conversation.
    JumpToMessage {
        /// Target message ID.
        message_id: String,
    },
    /// A live message arrived from sync or from the local composer.
    MessageArrived {
        /// The new message.
        message: Message,
        /// The local user just sent it.
        is_just_sent: bool,
    },
    /// A loaded message was edited or reacted to.
    MessageChanged {
        /// Full replacement record.
        message: Message,
    },
    /// A message was deleted.
    MessageDeleted {
        /// Deleted message ID.
        message_id: String,
    },
    /// Batch of row visibility observations.
    VisibilityBatch {
        /// Observations in host order.
        events: Vec<VisibilityEvent>,
    },
    /// Viewport height changed.
    ViewportResized {
        /// New viewport height in pixels.
        height_px: f32,
    },
    /// The list scrolled.
    Scrolled {
        /// Absolute scroll offset.
        scroll_top: f32,
        /// Total content height.
        scroll_height: f32,
        /// Viewport height.
        client_height: f32,
    },
    /// Suppress programmatic scrolling while the user drags.
    EngageScrollLock,
    /// Resume programmatic scrolling.
    ReleaseScrollLock,
    /// Host window focus changed.
    SetActive {
        /// Whether the host window has focus.
        is_active: bool,
    },
    /// The user dismissed the unread divider.
    AcknowledgeUnread,
    /// Start multi-select, optionally preselecting one message.
    EnterSelectMode {
        /// Message to preselect.
        message_id: Option<String>,
    },
    /// Flip one message's selection.
    ToggleSelected {
        /// Message ID.
        message_id: String,
    },
    /// Leave multi-select.
    ExitSelectMode,
    /// Recompute the newest pointer from the loaded window.
    RepairNewest,
    /// Recompute the oldest pointer from the loaded window.
    RepairOldest,
    /// Describe one rendered row.
    GetRow {
        /// Row index.
        index: usize,
    },
}

/// Event stream emitted by the transcript runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TranscriptEvent {
    /// The open window changed; hosts should re-read rows.
    WindowChanged {
        /// Conversation ID.
        conversation_id: String,
        /// Number of rendered rows.
        row_count: usize,
        /// Header row is present.
        have_oldest: bool,
        /// Window ends at the newest message.
        have_newest: bool,
    },
    /// Where the viewport should move after the last change.
    Scroll {
        /// Conversation ID.
        conversation_id: String,
        /// Scroll instruction.
        anchor: Anchor,
    },
    /// A loaded message changed in place.
    MessageUpdated {
        /// Conversation ID.
        conversation_id: String,
        /// Changed message ID.
        message_id: String,
    },
    /// A history fetch was issued.
    FetchStarted {
        /// The issued request.
        request: FetchRequest,
    },
    /// A read receipt was stored.
    MarkedRead(MarkReadRequest),
    /// Answer to `TranscriptCommand::GetRow`.
    Row {
        /// Requested index.
        index: usize,
        /// Row at that index, if any.
        row: Option<RowDescriptor>,
    },
    /// A command or fetch failed.
    Error(TranscriptError),
}
