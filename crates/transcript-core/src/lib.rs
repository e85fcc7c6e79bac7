//! Message-window engine behind a scrollable conversation transcript.
//!
//! This crate keeps a bounded, contiguous slice of a conversation's history in
//! memory, decides when to page more history in, where the viewport should
//! re-anchor after each change, and which rows to evict. Everything here is
//! synchronous; I/O is requested through session effects.

/// Scroll anchor planning between two renders.
pub mod anchor;
/// Async command/event channel primitives.
pub mod channel;
/// Stable error payloads.
pub mod error;
/// Pagination mutual-exclusion rules.
pub mod loading;
/// Conversion of fetched pages into window ops.
pub mod normalization;
/// Host-facing command/event protocol and fetch payloads.
pub mod protocol;
/// Row projection of a window.
pub mod rows;
/// Session facade tying tracker, store and planner together.
pub mod session;
/// Conversation window reducer.
pub mod store;
/// Trailing-edge throttle used for read receipts.
pub mod throttle;
/// Message, pointer, window and tuning types.
pub mod types;
/// Visibility ratio accumulator.
pub mod visibility;

pub use anchor::{Anchor, AnchorInput, ViewportSample, plan};
pub use channel::{EventStream, TranscriptChannelError, TranscriptChannels};
pub use error::{TranscriptError, TranscriptErrorCategory};
pub use loading::LoadingGuard;
pub use normalization::normalize_page;
pub use protocol::{
    FetchKind, FetchRequest, MarkReadRequest, PageResult, TranscriptCommand, TranscriptEvent,
};
pub use rows::{RowDescriptor, RowLayout};
pub use session::{Effect, TranscriptSession};
pub use store::{IgnoreReason, MessageWindowStore, Selection, Transition, WindowOp};
pub use throttle::TrailingThrottle;
pub use types::{
    ConversationWindow, DiscardBound, EditRevision, MergeOptions, Message, MessageLoadingState,
    Pointer, Reaction, WindowMetrics, WindowTuning,
};
pub use visibility::{VisibilityEvent, VisibilitySummary, VisibilityTarget, VisibilityTracker};
