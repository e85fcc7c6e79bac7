use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// One prior revision of an edited message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EditRevision {
    /// Body text before the edit.
    pub body: String,
    /// Edit timestamp in milliseconds since Unix epoch.
    pub timestamp: u64,
}

/// Emoji reaction attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reaction {
    /// Reaction emoji.
    pub emoji: String,
    /// Sender of the reaction.
    pub from_id: String,
    /// Reaction timestamp in milliseconds since Unix epoch.
    pub timestamp: u64,
}

/// Message record as seen by the window engine.
///
/// Only ordering and read-state fields drive window bookkeeping; the rest is
/// carried through for the host renderer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Unique message ID.
    pub id: String,
    /// Owning conversation ID.
    pub conversation_id: String,
    /// Sender-side timestamp in milliseconds since Unix epoch.
    pub sent_at: u64,
    /// Local receive timestamp in milliseconds since Unix epoch.
    pub received_at: u64,
    /// Whether the local user has not read this message yet.
    pub is_unread: bool,
    /// Display-ready text body.
    #[serde(default)]
    pub body: String,
    /// Prior revisions, oldest first.
    #[serde(default)]
    pub edit_history: Vec<EditRevision>,
    /// Reactions in arrival order.
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    /// UI-only "show more" expansion limit. Never persisted.
    #[serde(skip)]
    pub display_limit: Option<usize>,
}

impl Message {
    /// Create a read, text-less message.
    pub fn new(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        sent_at: u64,
        received_at: u64,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            sent_at,
            received_at,
            is_unread: false,
            body: String::new(),
            edit_history: Vec::new(),
            reactions: Vec::new(),
            display_limit: None,
        }
    }

    /// Same message flagged unread.
    pub fn unread(mut self) -> Self {
        self.is_unread = true;
        self
    }

    /// Same message with a body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Window ordering key.
    pub fn sort_key(&self) -> (u64, u64) {
        (self.received_at, self.sent_at)
    }

    /// Lightweight pointer to this message.
    pub fn pointer(&self) -> Pointer {
        Pointer {
            id: self.id.clone(),
            received_at: self.received_at,
            sent_at: self.sent_at,
        }
    }
}

/// Lightweight message reference used for boundary bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Pointer {
    /// Referenced message ID.
    pub id: String,
    /// Receive timestamp of the referenced message.
    pub received_at: u64,
    /// Send timestamp of the referenced message.
    pub sent_at: u64,
}

impl Pointer {
    /// Window ordering key.
    pub fn sort_key(&self) -> (u64, u64) {
        (self.received_at, self.sent_at)
    }
}

/// Boundary and unread bookkeeping for one conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct WindowMetrics {
    /// Newest known message.
    pub newest: Option<Pointer>,
    /// Oldest known message.
    pub oldest: Option<Pointer>,
    /// Oldest message the user has not seen yet.
    pub oldest_unseen: Option<Pointer>,
    /// Number of unseen messages counted since `oldest_unseen` was set.
    pub total_unseen: u64,
}

/// Directional pagination guard. At most one value at a time per conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MessageLoadingState {
    /// Fetching history before the first loaded message.
    LoadingOlder,
    /// Fetching history after the last loaded message.
    LoadingNewer,
    /// Initial open or explicit jump; replaces the window when it lands.
    LoadingNewest,
}

/// In-memory slice of one conversation's history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationWindow {
    /// Loaded message IDs, sorted by `(received_at, sent_at)` ascending.
    ///
    /// Shared so that an untouched window can be recognised by pointer.
    pub message_ids: Arc<[String]>,
    /// The first loaded message is the oldest in the conversation.
    pub have_oldest: bool,
    /// The last loaded message is the newest in the conversation.
    pub have_newest: bool,
    /// Boundary and unread metrics.
    pub metrics: WindowMetrics,
    /// In-flight pagination, if any.
    pub message_loading_state: Option<MessageLoadingState>,
    /// Last reported viewport proximity to the newest message.
    pub is_near_bottom: bool,
    /// Explicit "jump to this message" target.
    pub scroll_to_message_id: Option<String>,
    /// Bumped on every jump request so repeated targets stay observable.
    pub scroll_to_message_counter: u64,
    /// Bumped on in-place edits that may affect layout or unread accounting.
    pub message_change_counter: u64,
}

impl Default for ConversationWindow {
    fn default() -> Self {
        Self {
            message_ids: Arc::from(Vec::new()),
            have_oldest: false,
            have_newest: false,
            metrics: WindowMetrics::default(),
            message_loading_state: None,
            is_near_bottom: false,
            scroll_to_message_id: None,
            scroll_to_message_counter: 0,
            message_change_counter: 0,
        }
    }
}

impl ConversationWindow {
    pub fn len(&self) -> usize {
        self.message_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.message_ids.is_empty()
    }

    pub fn first_id(&self) -> Option<&str> {
        self.message_ids.first().map(String::as_str)
    }

    pub fn last_id(&self) -> Option<&str> {
        self.message_ids.last().map(String::as_str)
    }

    /// Index of `id` within `message_ids`.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.message_ids.iter().position(|candidate| candidate == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }
}

/// Flags describing where a merged batch came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MergeOptions {
    /// The batch is a live arrival rather than paginated history.
    pub is_new_message: bool,
    /// The batch is the local user's own outgoing message.
    pub is_just_sent: bool,
    /// The host window currently has focus.
    pub is_active: bool,
}

/// Eviction bound for `discard`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DiscardBound {
    /// Drop a prefix, retaining the last `N` ids.
    KeepAtBottom(usize),
    /// Drop a suffix, retaining the first `N` ids.
    KeepAtTop(usize),
}

impl DiscardBound {
    pub fn keep(self) -> usize {
        match self {
            Self::KeepAtBottom(keep) | Self::KeepAtTop(keep) => keep,
        }
    }
}

const DEFAULT_PAGE_SIZE: usize = 30;
const DEFAULT_MARK_READ_THROTTLE_MS: u64 = 500;
const DEFAULT_LOAD_NEWER_THRESHOLD_ROWS: usize = 5;
const DEFAULT_KEEP_AT_BOTTOM_SCREENS: usize = 2;
const DEFAULT_KEEP_AT_TOP_SCREENS: usize = 5;
const DEFAULT_ESTIMATED_ROW_HEIGHT_PX: f32 = 60.0;
const DEFAULT_AT_BOTTOM_THRESHOLD_PX: f32 = 15.0;

/// Tuning knobs for pagination, eviction and read-marking.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowTuning {
    /// Messages requested per fetch.
    pub page_size: usize,
    /// Trailing throttle interval for mark-read calls.
    pub mark_read_throttle_ms: u64,
    /// Rows from the end of the window at which newer history is requested.
    pub load_newer_threshold_rows: usize,
    /// Screens retained when evicting while the viewport sits at the bottom.
    pub keep_at_bottom_screens: usize,
    /// Screens retained when evicting after older history was loaded.
    pub keep_at_top_screens: usize,
    /// Row height used to estimate how many rows fit in the viewport.
    pub estimated_row_height_px: f32,
    /// Distance from the bottom under which the viewport counts as at-bottom.
    pub at_bottom_threshold_px: f32,
}

impl Default for WindowTuning {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            mark_read_throttle_ms: DEFAULT_MARK_READ_THROTTLE_MS,
            load_newer_threshold_rows: DEFAULT_LOAD_NEWER_THRESHOLD_ROWS,
            keep_at_bottom_screens: DEFAULT_KEEP_AT_BOTTOM_SCREENS,
            keep_at_top_screens: DEFAULT_KEEP_AT_TOP_SCREENS,
            estimated_row_height_px: DEFAULT_ESTIMATED_ROW_HEIGHT_PX,
            at_bottom_threshold_px: DEFAULT_AT_BOTTOM_THRESHOLD_PX,
        }
    }
}

impl WindowTuning {
    /// Estimated number of rows visible in a viewport of `height_px` (at least 1).
    pub fn visible_rows(&self, height_px: f32) -> usize {
        let row_height = self.estimated_row_height_px.max(1.0);
        if !height_px.is_finite() || height_px <= 0.0 {
            return 1;
        }
        ((height_px / row_height).ceil() as usize).max(1)
    }

    /// Ids retained by a bottom eviction for `visible_rows`.
    pub fn keep_at_bottom(&self, visible_rows: usize) -> usize {
        self.keep_at_bottom_screens.max(1).saturating_mul(visible_rows.max(1))
    }

    /// Ids retained by a top eviction for `visible_rows`.
    pub fn keep_at_top(&self, visible_rows: usize) -> usize {
        self.keep_at_top_screens.max(1).saturating_mul(visible_rows.max(1))
    }
}
