use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, error, info, trace, warn};

use crate::{
    anchor::{Anchor, AnchorInput, ViewportSample, plan},
    error::TranscriptError,
    loading::LoadingGuard,
    normalization::normalize_page,
    protocol::{FetchKind, FetchRequest, MarkReadRequest, PageResult},
    rows::{RowDescriptor, RowLayout},
    store::{IgnoreReason, MessageWindowStore, Transition, WindowOp},
    throttle::TrailingThrottle,
    types::{DiscardBound, MergeOptions, Message, WindowMetrics, WindowTuning},
    visibility::{VisibilityEvent, VisibilitySummary, VisibilityTracker},
};

/// Side effect requested by a session. The session itself never performs I/O.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Load history from the message store and hand it back via
    /// [`TranscriptSession::on_page_loaded`].
    Fetch(FetchRequest),
    /// Persist a read receipt.
    MarkRead(MarkReadRequest),
    /// Move the viewport.
    Scroll {
        conversation_id: String,
        anchor: Anchor,
    },
    /// The rendered rows changed.
    WindowChanged {
        conversation_id: String,
        row_count: usize,
        have_oldest: bool,
        have_newest: bool,
    },
    /// One loaded message changed in place.
    MessageUpdated {
        conversation_id: String,
        message_id: String,
    },
}

#[derive(Debug, Clone)]
struct OpenConversation {
    conversation_id: String,
    in_flight: Option<u64>,
    unread_acknowledged: bool,
    last_bottom_visible: Option<String>,
    last_change_counter: u64,
}

impl OpenConversation {
    fn new(conversation_id: String) -> Self {
        Self {
            conversation_id,
            in_flight: None,
            unread_acknowledged: false,
            last_bottom_visible: None,
            last_change_counter: 0,
        }
    }
}

/// Drives one transcript view: host input in, [`Effect`]s out.
///
/// Owns the window store, the visibility tracker and the mark-read throttle,
/// and diffs every rendered window against the previous one to produce a
/// scroll anchor. At most one conversation is open at a time.
#[derive(Debug)]
pub struct TranscriptSession {
    tuning: WindowTuning,
    store: MessageWindowStore,
    tracker: VisibilityTracker,
    open: Option<OpenConversation>,
    rendered: AnchorInput,
    mark_read: TrailingThrottle<MarkReadRequest>,
    viewport: ViewportSample,
    visible_rows: usize,
    scroll_locked: bool,
    is_active: bool,
    next_request_id: u64,
}

impl TranscriptSession {
    pub fn new(tuning: WindowTuning) -> Self {
        let mark_read = TrailingThrottle::new(Duration::from_millis(tuning.mark_read_throttle_ms));
        // Until the host reports a height, assume one page fills the viewport.
        let visible_rows = tuning.page_size.max(1);
        Self {
            tuning,
            store: MessageWindowStore::new(),
            tracker: VisibilityTracker::new(),
            open: None,
            rendered: AnchorInput::default(),
            mark_read,
            viewport: ViewportSample {
                is_at_bottom: true,
                ..ViewportSample::default()
            },
            visible_rows,
            scroll_locked: false,
            is_active: false,
            next_request_id: 0,
        }
    }

    pub fn tuning(&self) -> &WindowTuning {
        &self.tuning
    }

    pub fn store(&self) -> &MessageWindowStore {
        &self.store
    }

    pub fn open_conversation_id(&self) -> Option<&str> {
        self.open.as_ref().map(|open| open.conversation_id.as_str())
    }

    pub fn visible_rows(&self) -> usize {
        self.visible_rows
    }

    pub fn is_scroll_locked(&self) -> bool {
        self.scroll_locked
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    /// Show `conversation_id`, closing whatever was open before.
    ///
    /// Re-opening the open conversation is a no-op, or a jump when `around`
    /// names a message.
    pub fn open_conversation(
        &mut self,
        conversation_id: impl Into<String>,
        around: Option<String>,
    ) -> Vec<Effect> {
        let conversation_id = conversation_id.into();
        if self.open_conversation_id() == Some(conversation_id.as_str()) {
            return match around {
                Some(message_id) => self.jump_to_message(message_id).unwrap_or_else(|err| {
                    error!(%conversation_id, error = %err, "jump on re-open failed");
                    Vec::new()
                }),
                None => Vec::new(),
            };
        }

        let mut effects = self.close_conversation();
        self.store.apply(WindowOp::Reset {
            conversation_id: conversation_id.clone(),
            messages: Vec::new(),
            metrics: WindowMetrics::default(),
            scroll_to_message_id: None,
            unbounded_fetch: false,
        });
        self.tracker.reset();
        self.open = Some(OpenConversation::new(conversation_id.clone()));
        info!(%conversation_id, around = ?around, "conversation opened");

        match self.begin_fetch(FetchKind::Newest { around }) {
            Ok(request) => effects.push(Effect::Fetch(request)),
            Err(err) => error!(%conversation_id, error = %err, "initial fetch was refused"),
        }
        effects
    }

    /// Tear down the open conversation, flushing any pending read receipt.
    pub fn close_conversation(&mut self) -> Vec<Effect> {
        let Some(open) = self.open.take() else {
            return Vec::new();
        };
        let mut effects = Vec::new();
        if let Some(request) = self.mark_read.flush() {
            effects.push(Effect::MarkRead(request));
        }
        self.store.apply(WindowOp::Close {
            conversation_id: open.conversation_id.clone(),
        });
        self.tracker.reset();
        self.rendered = AnchorInput::default();
        info!(conversation_id = %open.conversation_id, "conversation closed");
        effects
    }

    /// Scroll to `message_id`, loading a page around it when it is not loaded.
    pub fn jump_to_message(
        &mut self,
        message_id: impl Into<String>,
    ) -> Result<Vec<Effect>, TranscriptError> {
        let message_id = message_id.into();
        let conversation_id = self.require_open()?;
        let window = self
            .store
            .window(&conversation_id)
            .ok_or_else(|| TranscriptError::window_missing(&conversation_id))?;

        let mut effects = Vec::new();
        if window.contains(&message_id) {
            self.store.apply(WindowOp::ScrollToMessage {
                conversation_id,
                message_id,
            });
            self.render(&mut effects);
        } else {
            debug!(%conversation_id, %message_id, "jump target not loaded; fetching around it");
            let request = self.begin_fetch(FetchKind::Newest {
                around: Some(message_id),
            })?;
            effects.push(Effect::Fetch(request));
        }
        Ok(effects)
    }

    /// Apply a completed fetch. Pages that no longer match the in-flight
    /// request of the open conversation are dropped.
    pub fn on_page_loaded(&mut self, page: PageResult) -> Vec<Effect> {
        let request_id = page.request.request_id;
        let Some(open) = self.open.as_mut() else {
            debug!(request_id, "dropping page; no conversation is open");
            return Vec::new();
        };
        if open.conversation_id != page.request.conversation_id
            || open.in_flight != Some(request_id)
            || self.store.window(&open.conversation_id).is_none()
        {
            debug!(
                request_id,
                conversation_id = %page.request.conversation_id,
                "dropping stale page"
            );
            return Vec::new();
        }
        open.in_flight = None;
        let conversation_id = open.conversation_id.clone();
        let kind = page.request.kind.clone();
        let received = page.messages.len();

        let ops = normalize_page(page, self.tuning.page_size, self.is_active);
        let applied = self.store.apply_ops(ops);
        self.settle_loading(&conversation_id);
        debug!(%conversation_id, request_id, received, applied, ?kind, "page applied");

        if let FetchKind::Older { .. } = kind {
            let keep = self.tuning.keep_at_top(self.visible_rows);
            self.discard(&conversation_id, DiscardBound::KeepAtTop(keep));
        }

        let mut effects = Vec::new();
        self.render(&mut effects);
        effects
    }

    /// Release the loading state of a failed fetch.
    ///
    /// Returns `false` when the failure belongs to a request that is no longer
    /// in flight.
    pub fn on_fetch_failed(&mut self, request: &FetchRequest, error: &TranscriptError) -> bool {
        let Some(open) = self.open.as_mut() else {
            return false;
        };
        if open.conversation_id != request.conversation_id
            || open.in_flight != Some(request.request_id)
        {
            debug!(request_id = request.request_id, "ignoring failure of stale fetch");
            return false;
        }
        open.in_flight = None;
        self.settle_loading(&request.conversation_id);
        warn!(
            conversation_id = %request.conversation_id,
            request_id = request.request_id,
            error = %error,
            "history fetch failed"
        );
        true
    }

    /// Merge a live message into the open conversation.
    ///
    /// A just-sent message that cannot be appended because the window is off
    /// the live tail reloads the newest page instead.
    pub fn on_message_arrived(&mut self, message: Message, is_just_sent: bool) -> Vec<Effect> {
        let Some(conversation_id) = self.open_conversation_id().map(str::to_owned) else {
            return Vec::new();
        };
        if message.conversation_id != conversation_id {
            trace!(message_id = %message.id, "arrival for a conversation that is not open");
            return Vec::new();
        }

        let transition = self.store.apply(WindowOp::Merge {
            conversation_id: conversation_id.clone(),
            messages: vec![message],
            options: MergeOptions {
                is_new_message: true,
                is_just_sent,
                is_active: self.is_active,
            },
        });

        let mut effects = Vec::new();
        match transition {
            Transition::Applied => self.render(&mut effects),
            Transition::Ignored(IgnoreReason::NotAtLiveTail) if is_just_sent => {
                match self.begin_fetch(FetchKind::Newest { around: None }) {
                    Ok(request) => effects.push(Effect::Fetch(request)),
                    Err(err) => warn!(%conversation_id, error = %err, "cannot reload newest page"),
                }
            }
            Transition::Ignored(_) => {}
        }
        effects
    }

    /// Replace a loaded message after an edit or reaction.
    pub fn on_message_changed(&mut self, message: Message, now: Instant) -> Vec<Effect> {
        let message_id = message.id.clone();
        let Some(conversation_id) = self
            .store
            .message(&message_id)
            .map(|existing| existing.conversation_id.clone())
        else {
            return Vec::new();
        };
        if !self
            .store
            .apply(WindowOp::Patch {
                id: message_id.clone(),
                data: message,
            })
            .is_applied()
        {
            return Vec::new();
        }

        let mut effects = vec![Effect::MessageUpdated {
            conversation_id,
            message_id,
        }];
        self.refresh_read_position(None, now);
        effects.extend(self.poll_mark_read(now));
        effects
    }

    pub fn on_message_deleted(&mut self, message_id: &str) -> Vec<Effect> {
        if !self
            .store
            .apply(WindowOp::Remove {
                id: message_id.to_owned(),
            })
            .is_applied()
        {
            return Vec::new();
        }
        self.tracker.forget(message_id);
        if let Some(open) = self.open.as_mut()
            && open.last_bottom_visible.as_deref() == Some(message_id)
        {
            open.last_bottom_visible = None;
        }

        let mut effects = Vec::new();
        self.render(&mut effects);
        effects
    }

    /// Feed one batch of visibility observations.
    ///
    /// Updates near-bottom state, schedules read receipts, and issues at most
    /// one pagination fetch or one bottom eviction.
    pub fn on_visibility_batch(
        &mut self,
        events: impl IntoIterator<Item = VisibilityEvent>,
        now: Instant,
    ) -> Vec<Effect> {
        let Some(conversation_id) = self.open_conversation_id().map(str::to_owned) else {
            return Vec::new();
        };
        let summary = self.tracker.observe(events);
        self.store.apply(WindowOp::SetNearBottom {
            conversation_id: conversation_id.clone(),
            is_near_bottom: summary.is_near_bottom,
        });

        let mut effects = Vec::new();
        self.refresh_read_position(Some(&summary), now);

        if let Some(kind) = self.pagination_trigger(&summary) {
            match self.begin_fetch(kind) {
                Ok(request) => effects.push(Effect::Fetch(request)),
                Err(err) => debug!(%conversation_id, error = %err, "pagination skipped"),
            }
        } else if summary.is_near_bottom
            && self
                .store
                .window(&conversation_id)
                .is_some_and(|window| window.have_newest && window.message_loading_state.is_none())
        {
            let keep = self.tuning.keep_at_bottom(self.visible_rows);
            if self.discard(&conversation_id, DiscardBound::KeepAtBottom(keep)) {
                self.render(&mut effects);
            }
        }

        effects.extend(self.poll_mark_read(now));
        effects
    }

    pub fn on_viewport_resize(&mut self, height_px: f32) {
        self.visible_rows = self.tuning.visible_rows(height_px);
        trace!(height_px, visible_rows = self.visible_rows, "viewport resized");
    }

    pub fn on_scroll(&mut self, scroll_top: f32, scroll_height: f32, client_height: f32) {
        self.viewport = ViewportSample::measure(
            scroll_top,
            scroll_height,
            client_height,
            self.tuning.at_bottom_threshold_px,
        );
    }

    pub fn viewport(&self) -> &ViewportSample {
        &self.viewport
    }

    /// Suppress every scroll instruction until released.
    pub fn engage_scroll_lock(&mut self) {
        self.scroll_locked = true;
    }

    pub fn release_scroll_lock(&mut self) {
        self.scroll_locked = false;
    }

    /// Track host focus. Read receipts are only sent while active.
    pub fn set_active(&mut self, is_active: bool, now: Instant) {
        if self.is_active == is_active {
            return;
        }
        self.is_active = is_active;
        if !is_active {
            self.mark_read.cancel();
            return;
        }
        if let Some(open) = &self.open
            && let Some(upto_message_id) = open.last_bottom_visible.clone()
        {
            self.mark_read.push(
                MarkReadRequest {
                    conversation_id: open.conversation_id.clone(),
                    upto_message_id,
                },
                now,
            );
        }
    }

    /// Dismiss the unread divider of the open conversation.
    pub fn acknowledge_unread(&mut self) -> Result<Vec<Effect>, TranscriptError> {
        let conversation_id = self.require_open()?;
        if let Some(open) = self.open.as_mut() {
            open.unread_acknowledged = true;
        }
        let mut effects = Vec::new();
        if self
            .store
            .apply(WindowOp::ClearUnreadMetrics { conversation_id })
            .is_applied()
        {
            self.render(&mut effects);
        }
        Ok(effects)
    }

    pub fn repair_newest(&mut self) -> Result<Transition, TranscriptError> {
        let conversation_id = self.require_open()?;
        Ok(self.store.apply(WindowOp::RepairNewest { conversation_id }))
    }

    pub fn repair_oldest(&mut self) -> Result<Transition, TranscriptError> {
        let conversation_id = self.require_open()?;
        Ok(self.store.apply(WindowOp::RepairOldest { conversation_id }))
    }

    pub fn enter_select_mode(
        &mut self,
        message_id: Option<String>,
    ) -> Result<Transition, TranscriptError> {
        let conversation_id = self.require_open()?;
        Ok(self.store.apply(WindowOp::EnterSelectMode {
            conversation_id,
            message_id,
        }))
    }

    pub fn toggle_selected(&mut self, message_id: impl Into<String>) -> Transition {
        self.store.apply(WindowOp::ToggleSelected {
            message_id: message_id.into(),
        })
    }

    pub fn exit_select_mode(&mut self) -> Transition {
        self.store.apply(WindowOp::ExitSelectMode)
    }

    /// Row layout of the open conversation.
    pub fn row_layout(&self) -> Option<RowLayout> {
        let open = self.open.as_ref()?;
        self.store
            .window(&open.conversation_id)
            .map(RowLayout::from_window)
    }

    pub fn get_row(&self, index: usize) -> Option<RowDescriptor> {
        self.row_layout()
            .and_then(|layout| layout.get_row(index).cloned())
    }

    /// Release the throttled read receipt once it is due.
    pub fn poll_mark_read(&mut self, now: Instant) -> Option<Effect> {
        self.mark_read.poll(now).map(Effect::MarkRead)
    }

    pub fn next_mark_read_deadline(&self) -> Option<Instant> {
        self.mark_read.deadline()
    }

    fn require_open(&self) -> Result<String, TranscriptError> {
        self.open_conversation_id()
            .map(str::to_owned)
            .ok_or_else(|| TranscriptError::conversation_not_open(None))
    }

    fn begin_fetch(&mut self, kind: FetchKind) -> Result<FetchRequest, TranscriptError> {
        let Some(open) = self.open.as_mut() else {
            return Err(TranscriptError::conversation_not_open(None));
        };
        let window = self
            .store
            .window(&open.conversation_id)
            .ok_or_else(|| TranscriptError::window_missing(&open.conversation_id))?;

        let mut guard = LoadingGuard::new(window.message_loading_state);
        let state = guard.begin(kind.loading_state())?;
        self.store.apply(WindowOp::SetLoadingState {
            conversation_id: open.conversation_id.clone(),
            state: Some(state),
        });

        self.next_request_id += 1;
        let request = FetchRequest {
            request_id: self.next_request_id,
            conversation_id: open.conversation_id.clone(),
            kind,
            limit: self.tuning.page_size,
        };
        if let Some(superseded) = open.in_flight.replace(request.request_id) {
            debug!(superseded, request_id = request.request_id, "fetch superseded");
        }
        debug!(
            conversation_id = %request.conversation_id,
            request_id = request.request_id,
            kind = ?request.kind,
            "fetch issued"
        );
        Ok(request)
    }

    fn settle_loading(&mut self, conversation_id: &str) {
        let Some(window) = self.store.window(conversation_id) else {
            return;
        };
        let mut guard = LoadingGuard::new(window.message_loading_state);
        let released = guard.finish();
        trace!(%conversation_id, ?released, "loading state released");
        self.store.apply(WindowOp::SetLoadingState {
            conversation_id: conversation_id.to_owned(),
            state: guard.state(),
        });
    }

    fn pagination_trigger(&self, summary: &VisibilitySummary) -> Option<FetchKind> {
        let open = self.open.as_ref()?;
        let window = self.store.window(&open.conversation_id)?;
        if window.message_loading_state.is_some() || window.is_empty() {
            return None;
        }

        let layout = RowLayout::from_window(window);
        if !window.have_newest
            && let Some(id) = summary.newest_bottom_visible.as_deref()
            && let Some(row) = layout.row_index_of(id)
            && let Some(last_row) = layout.last_message_row()
            && row + self.tuning.load_newer_threshold_rows >= last_row
        {
            return window.last_id().map(|after| FetchKind::Newer {
                after: after.to_owned(),
            });
        }

        if !window.have_oldest
            && let Some(oldest) = summary.oldest_partially_visible.as_deref()
            && window.first_id() == Some(oldest)
        {
            return Some(FetchKind::Older {
                before: oldest.to_owned(),
            });
        }
        None
    }

    /// Push a read receipt when the bottom-visible row or the change counter moved.
    fn refresh_read_position(&mut self, summary: Option<&VisibilitySummary>, now: Instant) {
        let Some(open) = self.open.as_mut() else {
            return;
        };
        let Some(window) = self.store.window(&open.conversation_id) else {
            return;
        };

        let mut changed = window.message_change_counter != open.last_change_counter;
        open.last_change_counter = window.message_change_counter;
        if let Some(summary) = summary
            && summary.newest_bottom_visible != open.last_bottom_visible
        {
            changed = true;
            open.last_bottom_visible = summary.newest_bottom_visible.clone();
        }

        if changed
            && self.is_active
            && let Some(upto_message_id) = open.last_bottom_visible.clone()
        {
            trace!(conversation_id = %open.conversation_id, %upto_message_id, "read receipt scheduled");
            self.mark_read.push(
                MarkReadRequest {
                    conversation_id: open.conversation_id.clone(),
                    upto_message_id,
                },
                now,
            );
        }
    }

    fn discard(&mut self, conversation_id: &str, bound: DiscardBound) -> bool {
        self.store
            .apply(WindowOp::Discard {
                conversation_id: conversation_id.to_owned(),
                bound,
            })
            .is_applied()
    }

    fn render(&mut self, effects: &mut Vec<Effect>) {
        let Some(open) = self.open.as_ref() else {
            return;
        };
        let Some(window) = self.store.window(&open.conversation_id) else {
            error!(conversation_id = %open.conversation_id, "open conversation has no window");
            return;
        };

        let layout = RowLayout::from_window(window);
        let next = AnchorInput::from_window(
            &open.conversation_id,
            window,
            &layout,
            open.unread_acknowledged,
        );
        let anchor = plan(&self.rendered, &next, &self.viewport);
        if !Arc::ptr_eq(&self.rendered.message_ids, &next.message_ids) {
            // Rows were rebuilt; the host re-reports every intersecting row.
            self.tracker.reset();
        }
        effects.push(Effect::WindowChanged {
            conversation_id: open.conversation_id.clone(),
            row_count: layout.row_count(),
            have_oldest: window.have_oldest,
            have_newest: window.have_newest,
        });

        if anchor != Anchor::ChangeNothing {
            if self.scroll_locked {
                debug!(?anchor, "scroll lock engaged; dropping anchor");
            } else {
                trace!(?anchor, "anchor planned");
                effects.push(Effect::Scroll {
                    conversation_id: open.conversation_id.clone(),
                    anchor,
                });
                if anchor == Anchor::ScrollToBottom {
                    self.viewport.is_at_bottom = true;
                    self.viewport.distance_from_bottom = 0.0;
                }
            }
        }
        self.rendered = next;
    }
}
