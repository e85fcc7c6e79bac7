use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use tracing::{debug, error, trace, warn};

use crate::types::{
    ConversationWindow, DiscardBound, MergeOptions, Message, MessageLoadingState, Pointer,
    WindowMetrics,
};

/// Every state transition the window store understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowOp {
    /// Replace a conversation's window wholesale.
    Reset {
        conversation_id: String,
        messages: Vec<Message>,
        metrics: WindowMetrics,
        scroll_to_message_id: Option<String>,
        /// The fetch recentred the window; caller metrics are authoritative.
        unbounded_fetch: bool,
    },
    /// Union a page or a live arrival into an existing window.
    Merge {
        conversation_id: String,
        messages: Vec<Message>,
        options: MergeOptions,
    },
    /// Replace one loaded message in place.
    Patch { id: String, data: Message },
    /// Drop one loaded message.
    Remove { id: String },
    /// Evict the end of the window opposite the viewport.
    Discard {
        conversation_id: String,
        bound: DiscardBound,
    },
    SetLoadingState {
        conversation_id: String,
        state: Option<MessageLoadingState>,
    },
    SetNearBottom {
        conversation_id: String,
        is_near_bottom: bool,
    },
    /// Record that a fetch reached one or both ends of the history.
    SetEdges {
        conversation_id: String,
        have_oldest: Option<bool>,
        have_newest: Option<bool>,
    },
    ClearUnreadMetrics { conversation_id: String },
    /// Recompute `metrics.newest` from the last loaded id.
    RepairNewest { conversation_id: String },
    /// Recompute `metrics.oldest` from the first loaded id.
    RepairOldest { conversation_id: String },
    /// Explicit jump to an already-loaded message.
    ScrollToMessage {
        conversation_id: String,
        message_id: String,
    },
    /// Set the UI-only expansion flag of one message.
    SetDisplayLimit {
        id: String,
        display_limit: Option<usize>,
    },
    /// Tear down a conversation's window and every lookup entry it owns.
    Close { conversation_id: String },
    EnterSelectMode {
        conversation_id: String,
        message_id: Option<String>,
    },
    ToggleSelected { message_id: String },
    ExitSelectMode,
}

impl WindowOp {
    /// Stable op name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Reset { .. } => "reset",
            Self::Merge { .. } => "merge",
            Self::Patch { .. } => "patch",
            Self::Remove { .. } => "remove",
            Self::Discard { .. } => "discard",
            Self::SetLoadingState { .. } => "set_loading_state",
            Self::SetNearBottom { .. } => "set_near_bottom",
            Self::SetEdges { .. } => "set_edges",
            Self::ClearUnreadMetrics { .. } => "clear_unread_metrics",
            Self::RepairNewest { .. } => "repair_newest",
            Self::RepairOldest { .. } => "repair_oldest",
            Self::ScrollToMessage { .. } => "scroll_to_message",
            Self::SetDisplayLimit { .. } => "set_display_limit",
            Self::Close { .. } => "close",
            Self::EnterSelectMode { .. } => "enter_select_mode",
            Self::ToggleSelected { .. } => "toggle_selected",
            Self::ExitSelectMode => "exit_select_mode",
        }
    }
}

/// Why an op left the store untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    UnknownConversation,
    UnknownMessage,
    EmptyBatch,
    /// A live arrival reached a window that does not end at the newest message.
    NotAtLiveTail,
    SelectModeActive,
    WithinBound,
    NoChange,
}

/// Outcome of [`MessageWindowStore::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    Ignored(IgnoreReason),
}

impl Transition {
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Multi-select session. Eviction is suspended for its conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub conversation_id: String,
    pub message_ids: BTreeSet<String>,
}

/// Owns one [`ConversationWindow`] per loaded conversation plus the message
/// lookup backing them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageWindowStore {
    messages: HashMap<String, Message>,
    windows: HashMap<String, ConversationWindow>,
    selection: Option<Selection>,
}

impl MessageWindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn window(&self, conversation_id: &str) -> Option<&ConversationWindow> {
        self.windows.get(conversation_id)
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.get(id)
    }

    /// Loaded messages of a conversation in window order.
    pub fn messages_in_window(&self, conversation_id: &str) -> Vec<&Message> {
        self.windows
            .get(conversation_id)
            .map(|window| {
                window
                    .message_ids
                    .iter()
                    .filter_map(|id| self.messages.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn conversation_ids(&self) -> impl Iterator<Item = &str> {
        self.windows.keys().map(String::as_str)
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    pub fn is_in_select_mode(&self, conversation_id: &str) -> bool {
        self.selection
            .as_ref()
            .is_some_and(|selection| selection.conversation_id == conversation_id)
    }

    /// Apply ops in order, returning how many changed the store.
    pub fn apply_ops(&mut self, ops: impl IntoIterator<Item = WindowOp>) -> usize {
        ops.into_iter()
            .map(|op| self.apply(op))
            .filter(|transition| transition.is_applied())
            .count()
    }

    /// Apply one op.
    pub fn apply(&mut self, op: WindowOp) -> Transition {
        let kind = op.kind();
        let transition = match op {
            WindowOp::Reset {
                conversation_id,
                messages,
                metrics,
                scroll_to_message_id,
                unbounded_fetch,
            } => self.reset(
                conversation_id,
                messages,
                metrics,
                scroll_to_message_id,
                unbounded_fetch,
            ),
            WindowOp::Merge {
                conversation_id,
                messages,
                options,
            } => self.merge(conversation_id, messages, options),
            WindowOp::Patch { id, data } => self.patch(id, data),
            WindowOp::Remove { id } => self.remove(&id),
            WindowOp::Discard {
                conversation_id,
                bound,
            } => self.discard(&conversation_id, bound),
            WindowOp::SetLoadingState {
                conversation_id,
                state,
            } => self.update_window(&conversation_id, |window| {
                replace_if_changed(&mut window.message_loading_state, state)
            }),
            WindowOp::SetNearBottom {
                conversation_id,
                is_near_bottom,
            } => self.update_window(&conversation_id, |window| {
                replace_if_changed(&mut window.is_near_bottom, is_near_bottom)
            }),
            WindowOp::SetEdges {
                conversation_id,
                have_oldest,
                have_newest,
            } => self.update_window(&conversation_id, |window| {
                let oldest_changed = have_oldest
                    .is_some_and(|value| replace_if_changed(&mut window.have_oldest, value));
                let newest_changed = have_newest
                    .is_some_and(|value| replace_if_changed(&mut window.have_newest, value));
                oldest_changed || newest_changed
            }),
            WindowOp::ClearUnreadMetrics { conversation_id } => {
                self.update_window(&conversation_id, |window| {
                    let changed = window.metrics.oldest_unseen.is_some()
                        || window.metrics.total_unseen != 0;
                    window.metrics.oldest_unseen = None;
                    window.metrics.total_unseen = 0;
                    changed
                })
            }
            WindowOp::RepairNewest { conversation_id } => self.repair(&conversation_id, Edge::Newest),
            WindowOp::RepairOldest { conversation_id } => self.repair(&conversation_id, Edge::Oldest),
            WindowOp::ScrollToMessage {
                conversation_id,
                message_id,
            } => self.scroll_to_message(&conversation_id, message_id),
            WindowOp::SetDisplayLimit { id, display_limit } => match self.messages.get_mut(&id) {
                Some(message) => {
                    if replace_if_changed(&mut message.display_limit, display_limit) {
                        Transition::Applied
                    } else {
                        Transition::Ignored(IgnoreReason::NoChange)
                    }
                }
                None => Transition::Ignored(IgnoreReason::UnknownMessage),
            },
            WindowOp::Close { conversation_id } => self.close(&conversation_id),
            WindowOp::EnterSelectMode {
                conversation_id,
                message_id,
            } => self.enter_select_mode(conversation_id, message_id),
            WindowOp::ToggleSelected { message_id } => self.toggle_selected(message_id),
            WindowOp::ExitSelectMode => match self.selection.take() {
                Some(_) => Transition::Applied,
                None => Transition::Ignored(IgnoreReason::NoChange),
            },
        };

        if let Transition::Ignored(reason) = transition {
            trace!(op = kind, ?reason, "window op ignored");
        }
        transition
    }

    fn reset(
        &mut self,
        conversation_id: String,
        messages: Vec<Message>,
        mut metrics: WindowMetrics,
        scroll_to_message_id: Option<String>,
        unbounded_fetch: bool,
    ) -> Transition {
        let batch = sorted_unique(
            messages
                .into_iter()
                .filter(|message| belongs_to(message, &conversation_id)),
        );

        if let (Some(first), Some(last)) = (batch.first(), batch.last()) {
            let widen_oldest = match &metrics.oldest {
                None => true,
                Some(oldest) => !unbounded_fetch && first.sort_key() < oldest.sort_key(),
            };
            if widen_oldest {
                metrics.oldest = Some(first.pointer());
            }

            let widen_newest = match &metrics.newest {
                None => true,
                Some(newest) => !unbounded_fetch && last.sort_key() > newest.sort_key(),
            };
            if widen_newest {
                metrics.newest = Some(last.pointer());
            }
        }

        let message_ids: Vec<String> = batch.iter().map(|message| message.id.clone()).collect();
        let previous = self.windows.remove(&conversation_id);
        let (scroll_to_message_counter, is_near_bottom) = match &previous {
            Some(window) => (window.scroll_to_message_counter, window.is_near_bottom),
            None => (0, false),
        };
        // Replaying the same reset must not retrigger the jump.
        let retarget = scroll_to_message_id.is_some()
            && previous.as_ref().is_none_or(|window| {
                window.scroll_to_message_id != scroll_to_message_id
                    || window.message_ids[..] != message_ids[..]
            });
        if let Some(previous) = &previous {
            let incoming: HashSet<&str> = batch.iter().map(|message| message.id.as_str()).collect();
            for id in previous.message_ids.iter() {
                if !incoming.contains(id.as_str()) {
                    self.messages.remove(id);
                }
            }
        }

        debug!(
            %conversation_id,
            message_count = message_ids.len(),
            unbounded_fetch,
            scroll_to = ?scroll_to_message_id,
            "window reset"
        );

        let window = ConversationWindow {
            message_ids: Arc::from(message_ids),
            have_oldest: false,
            have_newest: false,
            metrics,
            message_loading_state: None,
            is_near_bottom,
            scroll_to_message_counter: scroll_to_message_counter + u64::from(retarget),
            scroll_to_message_id,
            message_change_counter: 0,
        };
        for message in batch {
            self.messages.insert(message.id.clone(), message);
        }
        self.windows.insert(conversation_id, window);
        Transition::Applied
    }

    fn merge(
        &mut self,
        conversation_id: String,
        messages: Vec<Message>,
        options: MergeOptions,
    ) -> Transition {
        if messages.is_empty() {
            return Transition::Ignored(IgnoreReason::EmptyBatch);
        }
        let Some(window) = self.windows.get(&conversation_id) else {
            return Transition::Ignored(IgnoreReason::UnknownConversation);
        };
        let incoming: Vec<Message> = messages
            .into_iter()
            .filter(|message| belongs_to(message, &conversation_id))
            .collect();
        if incoming.is_empty() {
            return Transition::Ignored(IgnoreReason::EmptyBatch);
        }

        if options.is_new_message
            && let Some(last_id) = window.last_id()
        {
            let at_live_tail = window
                .metrics
                .newest
                .as_ref()
                .is_some_and(|newest| newest.id == last_id);
            if !at_live_tail {
                if options.is_just_sent {
                    warn!(%conversation_id, "just-sent message arrived while window is off the live tail");
                } else {
                    debug!(%conversation_id, "dropping live arrival; window is off the live tail");
                }
                return Transition::Ignored(IgnoreReason::NotAtLiveTail);
            }
        }

        let existing: HashSet<&str> = window.message_ids.iter().map(String::as_str).collect();
        let added: HashSet<String> = incoming
            .iter()
            .filter(|message| !existing.contains(message.id.as_str()))
            .map(|message| message.id.clone())
            .collect();

        let mut union = Vec::with_capacity(window.len() + incoming.len());
        for id in window.message_ids.iter() {
            match self.messages.get(id) {
                Some(message) => union.push(message.clone()),
                None => invariant_violated(&conversation_id, id, "window id missing from lookup"),
            }
        }
        union.extend(incoming.iter().cloned());
        let sorted = sorted_unique(union);

        let mut metrics = window.metrics.clone();
        if let (Some(first), Some(last)) = (sorted.first(), sorted.last()) {
            let extend_oldest = metrics
                .oldest
                .as_ref()
                .is_none_or(|oldest| first.sort_key() <= oldest.sort_key());
            if extend_oldest {
                metrics.oldest = Some(first.pointer());
            }
            let extend_newest = metrics
                .newest
                .as_ref()
                .is_none_or(|newest| last.sort_key() >= newest.sort_key());
            if extend_newest {
                metrics.newest = Some(last.pointer());
            }
        }

        let newly_added: Vec<&Message> = sorted
            .iter()
            .filter(|message| added.contains(&message.id))
            .collect();
        if metrics.oldest_unseen.is_none() && (!window.is_near_bottom || !options.is_active) {
            metrics.oldest_unseen = newly_added
                .iter()
                .find(|message| message.is_unread)
                .map(|message| message.pointer());
        }
        if options.is_new_message && !options.is_just_sent && metrics.oldest_unseen.is_some() {
            let unread = newly_added.iter().filter(|message| message.is_unread).count();
            metrics.total_unseen += unread as u64;
        }

        let message_ids: Vec<String> = sorted.iter().map(|message| message.id.clone()).collect();
        let unchanged = message_ids.as_slice() == &*window.message_ids;
        trace!(
            %conversation_id,
            added = added.len(),
            total = message_ids.len(),
            is_new_message = options.is_new_message,
            "window merge"
        );

        let Some(window) = self.windows.get_mut(&conversation_id) else {
            return Transition::Ignored(IgnoreReason::UnknownConversation);
        };
        if !unchanged {
            window.message_ids = Arc::from(message_ids);
        }
        window.metrics = metrics;
        if options.is_just_sent
            && let Some(last_id) = window.last_id().map(str::to_owned)
        {
            window.scroll_to_message_id = Some(last_id);
            window.scroll_to_message_counter += 1;
        }
        for message in incoming {
            let previous = self.messages.insert(message.id.clone(), message);
            if let Some(previous) = previous
                && let Some(stored) = self.messages.get_mut(&previous.id)
                && stored.display_limit.is_none()
            {
                stored.display_limit = previous.display_limit;
            }
        }
        Transition::Applied
    }

    fn patch(&mut self, id: String, mut data: Message) -> Transition {
        let Some(existing) = self.messages.get(&id) else {
            return Transition::Ignored(IgnoreReason::UnknownMessage);
        };
        let Some(window) = self.windows.get_mut(&existing.conversation_id) else {
            return Transition::Ignored(IgnoreReason::UnknownConversation);
        };
        if data.conversation_id != existing.conversation_id {
            warn!(
                message_id = %id,
                from = %existing.conversation_id,
                to = %data.conversation_id,
                "ignoring conversation change in message patch"
            );
            data.conversation_id = existing.conversation_id.clone();
        }

        let has_new_edit = existing.edit_history.len() != data.edit_history.len();
        let new_reactions = data
            .reactions
            .iter()
            .filter(|reaction| !existing.reactions.contains(reaction))
            .count() as u64;
        data.display_limit = if has_new_edit {
            None
        } else {
            existing.display_limit
        };
        data.id = id.clone();

        window.message_change_counter += if has_new_edit { 1 } else { new_reactions };
        trace!(message_id = %id, has_new_edit, new_reactions, "message patched");
        self.messages.insert(id, data);
        Transition::Applied
    }

    fn remove(&mut self, id: &str) -> Transition {
        let conversation_id = match self.messages.get(id) {
            Some(message) => message.conversation_id.clone(),
            None => match self
                .windows
                .iter()
                .find(|(_, window)| window.contains(id))
            {
                Some((conversation_id, _)) => conversation_id.clone(),
                None => return Transition::Ignored(IgnoreReason::UnknownMessage),
            },
        };
        let Some(window) = self.windows.get_mut(&conversation_id) else {
            self.messages.remove(id);
            return Transition::Ignored(IgnoreReason::UnknownConversation);
        };

        let ids = Arc::clone(&window.message_ids);
        if ids.len() > 1 {
            let last = ids.len() - 1;
            if ids[0] == id
                && window
                    .metrics
                    .oldest
                    .as_ref()
                    .is_some_and(|oldest| oldest.id == id)
            {
                window.metrics.oldest = pointer_for(&self.messages, &ids[1]);
            }
            if ids[last] == id
                && window
                    .metrics
                    .newest
                    .as_ref()
                    .is_some_and(|newest| newest.id == id)
            {
                window.metrics.newest = pointer_for(&self.messages, &ids[last - 1]);
            }
        }

        if ids.iter().any(|candidate| candidate == id) {
            let remaining: Vec<String> = ids
                .iter()
                .filter(|candidate| candidate.as_str() != id)
                .cloned()
                .collect();
            window.message_ids = Arc::from(remaining);
        }
        if let Some(selection) = self.selection.as_mut() {
            selection.message_ids.remove(id);
        }
        self.messages.remove(id);
        debug!(%conversation_id, message_id = %id, "message removed from window");
        Transition::Applied
    }

    fn discard(&mut self, conversation_id: &str, bound: DiscardBound) -> Transition {
        if self.is_in_select_mode(conversation_id) {
            return Transition::Ignored(IgnoreReason::SelectModeActive);
        }
        let Some(window) = self.windows.get_mut(conversation_id) else {
            return Transition::Ignored(IgnoreReason::UnknownConversation);
        };
        let keep = bound.keep();
        if window.len() <= keep {
            return Transition::Ignored(IgnoreReason::WithinBound);
        }

        let (kept, dropped) = match bound {
            DiscardBound::KeepAtBottom(_) => {
                let split = window.len() - keep;
                window.have_oldest = false;
                (
                    window.message_ids[split..].to_vec(),
                    window.message_ids[..split].to_vec(),
                )
            }
            DiscardBound::KeepAtTop(_) => {
                window.have_newest = false;
                (
                    window.message_ids[..keep].to_vec(),
                    window.message_ids[keep..].to_vec(),
                )
            }
        };
        debug!(
            %conversation_id,
            ?bound,
            dropped = dropped.len(),
            kept = kept.len(),
            "discarding window entries"
        );
        window.message_ids = Arc::from(kept);
        for id in &dropped {
            self.messages.remove(id);
        }
        Transition::Applied
    }

    fn repair(&mut self, conversation_id: &str, edge: Edge) -> Transition {
        let Some(window) = self.windows.get_mut(conversation_id) else {
            return Transition::Ignored(IgnoreReason::UnknownConversation);
        };
        let (id, slot) = match edge {
            Edge::Newest => (window.message_ids.last(), &mut window.metrics.newest),
            Edge::Oldest => (window.message_ids.first(), &mut window.metrics.oldest),
        };
        let repaired = id.and_then(|id| pointer_for(&self.messages, id));
        debug!(%conversation_id, ?edge, pointer = ?repaired, "repairing window pointer");
        if replace_if_changed(slot, repaired) {
            Transition::Applied
        } else {
            Transition::Ignored(IgnoreReason::NoChange)
        }
    }

    fn scroll_to_message(&mut self, conversation_id: &str, message_id: String) -> Transition {
        let Some(window) = self.windows.get_mut(conversation_id) else {
            return Transition::Ignored(IgnoreReason::UnknownConversation);
        };
        if !window.contains(&message_id) {
            return Transition::Ignored(IgnoreReason::UnknownMessage);
        }
        window.scroll_to_message_id = Some(message_id);
        window.scroll_to_message_counter += 1;
        Transition::Applied
    }

    fn close(&mut self, conversation_id: &str) -> Transition {
        let Some(window) = self.windows.remove(conversation_id) else {
            return Transition::Ignored(IgnoreReason::UnknownConversation);
        };
        self.messages
            .retain(|_, message| message.conversation_id != conversation_id);
        if self.is_in_select_mode(conversation_id) {
            self.selection = None;
        }
        debug!(%conversation_id, dropped = window.len(), "conversation window closed");
        Transition::Applied
    }

    fn enter_select_mode(
        &mut self,
        conversation_id: String,
        message_id: Option<String>,
    ) -> Transition {
        let Some(window) = self.windows.get(&conversation_id) else {
            return Transition::Ignored(IgnoreReason::UnknownConversation);
        };
        let mut message_ids = BTreeSet::new();
        if let Some(id) = message_id {
            if !window.contains(&id) {
                return Transition::Ignored(IgnoreReason::UnknownMessage);
            }
            message_ids.insert(id);
        }
        self.selection = Some(Selection {
            conversation_id,
            message_ids,
        });
        Transition::Applied
    }

    fn toggle_selected(&mut self, message_id: String) -> Transition {
        let Some(selection) = self.selection.as_mut() else {
            return Transition::Ignored(IgnoreReason::NoChange);
        };
        let in_window = self
            .windows
            .get(&selection.conversation_id)
            .is_some_and(|window| window.contains(&message_id));
        if !in_window {
            return Transition::Ignored(IgnoreReason::UnknownMessage);
        }
        if !selection.message_ids.remove(&message_id) {
            selection.message_ids.insert(message_id);
        }
        Transition::Applied
    }

    fn update_window(
        &mut self,
        conversation_id: &str,
        update: impl FnOnce(&mut ConversationWindow) -> bool,
    ) -> Transition {
        let Some(window) = self.windows.get_mut(conversation_id) else {
            return Transition::Ignored(IgnoreReason::UnknownConversation);
        };
        if update(window) {
            Transition::Applied
        } else {
            Transition::Ignored(IgnoreReason::NoChange)
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Edge {
    Newest,
    Oldest,
}

fn belongs_to(message: &Message, conversation_id: &str) -> bool {
    if message.conversation_id == conversation_id {
        return true;
    }
    warn!(
        message_id = %message.id,
        expected = %conversation_id,
        actual = %message.conversation_id,
        "skipping message from another conversation"
    );
    false
}

/// Dedupe by id (last occurrence wins) and sort by `(received_at, sent_at)`.
///
/// Ties on the timestamp pair fall back to the id so the result is deterministic.
fn sorted_unique(messages: impl IntoIterator<Item = Message>) -> Vec<Message> {
    let mut by_id: HashMap<String, Message> = HashMap::new();
    for message in messages {
        by_id.insert(message.id.clone(), message);
    }
    let mut sorted: Vec<Message> = by_id.into_values().collect();
    sorted.sort_by(|a, b| {
        a.sort_key()
            .cmp(&b.sort_key())
            .then_with(|| a.id.cmp(&b.id))
    });
    sorted
}

fn pointer_for(messages: &HashMap<String, Message>, id: &str) -> Option<Pointer> {
    messages.get(id).map(Message::pointer)
}

fn replace_if_changed<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

fn invariant_violated(conversation_id: &str, message_id: &str, what: &str) {
    error!(%conversation_id, %message_id, "window invariant violated: {what}");
    debug_assert!(false, "window invariant violated: {what}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Reaction;

    const CONVO: &str = "c-1";

    fn msg(id: &str, at: u64) -> Message {
        Message::new(id, CONVO, at, at)
    }

    fn ptr(id: &str, at: u64) -> Pointer {
        Pointer {
            id: id.to_owned(),
            received_at: at,
            sent_at: at,
        }
    }

    fn reset_op(messages: Vec<Message>) -> WindowOp {
        WindowOp::Reset {
            conversation_id: CONVO.to_owned(),
            messages,
            metrics: WindowMetrics::default(),
            scroll_to_message_id: None,
            unbounded_fetch: false,
        }
    }

    fn store_with(ids: &[(&str, u64)]) -> MessageWindowStore {
        let mut store = MessageWindowStore::new();
        let transition = store.apply(reset_op(ids.iter().map(|(id, at)| msg(id, *at)).collect()));
        assert_eq!(transition, Transition::Applied);
        store
    }

    fn ids(store: &MessageWindowStore) -> Vec<String> {
        store
            .window(CONVO)
            .expect("window should exist")
            .message_ids
            .to_vec()
    }

    fn merge(store: &mut MessageWindowStore, messages: Vec<Message>, options: MergeOptions) -> Transition {
        store.apply(WindowOp::Merge {
            conversation_id: CONVO.to_owned(),
            messages,
            options,
        })
    }

    fn assert_sorted_unique(store: &MessageWindowStore) {
        let window = store.window(CONVO).expect("window should exist");
        let keys: Vec<(u64, u64)> = window
            .message_ids
            .iter()
            .map(|id| store.message(id).expect("lookup entry").sort_key())
            .collect();
        assert!(keys.windows(2).all(|pair| pair[0] <= pair[1]));
        let unique: HashSet<&String> = window.message_ids.iter().collect();
        assert_eq!(unique.len(), window.len());
    }

    #[test]
    fn reset_sorts_dedupes_and_fills_metrics() {
        let store = store_with(&[("c", 30), ("a", 10), ("b", 20), ("a", 10)]);
        assert_eq!(ids(&store), ["a", "b", "c"]);
        let window = store.window(CONVO).expect("window");
        assert_eq!(window.metrics.oldest, Some(ptr("a", 10)));
        assert_eq!(window.metrics.newest, Some(ptr("c", 30)));
        assert_eq!(window.message_loading_state, None);
        assert_sorted_unique(&store);
    }

    #[test]
    fn reset_only_widens_caller_metrics_when_bounded() {
        let mut store = MessageWindowStore::new();
        store.apply(WindowOp::Reset {
            conversation_id: CONVO.to_owned(),
            messages: vec![msg("b", 20), msg("c", 30)],
            metrics: WindowMetrics {
                oldest: Some(ptr("a", 10)),
                newest: Some(ptr("z", 25)),
                ..WindowMetrics::default()
            },
            scroll_to_message_id: None,
            unbounded_fetch: false,
        });
        let metrics = &store.window(CONVO).expect("window").metrics;
        assert_eq!(metrics.oldest, Some(ptr("a", 10)));
        assert_eq!(metrics.newest, Some(ptr("c", 30)));
    }

    #[test]
    fn unbounded_reset_trusts_caller_metrics() {
        let mut store = MessageWindowStore::new();
        store.apply(WindowOp::Reset {
            conversation_id: CONVO.to_owned(),
            messages: vec![msg("m", 50), msg("n", 60)],
            metrics: WindowMetrics {
                oldest: Some(ptr("x", 70)),
                newest: Some(ptr("y", 55)),
                ..WindowMetrics::default()
            },
            scroll_to_message_id: Some("m".to_owned()),
            unbounded_fetch: true,
        });
        let window = store.window(CONVO).expect("window");
        assert_eq!(window.metrics.oldest, Some(ptr("x", 70)));
        assert_eq!(window.metrics.newest, Some(ptr("y", 55)));
        assert_eq!(window.scroll_to_message_id.as_deref(), Some("m"));
        assert_eq!(window.scroll_to_message_counter, 1);
    }

    #[test]
    fn reset_is_idempotent() {
        let batch = vec![msg("b", 20), msg("a", 10), msg("c", 30)];
        let mut once = MessageWindowStore::new();
        once.apply(reset_op(batch.clone()));
        let mut twice = once.clone();
        twice.apply(reset_op(batch));
        assert_eq!(once, twice);
    }

    #[test]
    fn replayed_targeted_reset_keeps_the_jump_counter() {
        let targeted = |messages: Vec<Message>, target: &str| WindowOp::Reset {
            conversation_id: CONVO.to_owned(),
            messages,
            metrics: WindowMetrics::default(),
            scroll_to_message_id: Some(target.to_owned()),
            unbounded_fetch: false,
        };
        let batch = vec![msg("a", 10), msg("b", 20), msg("c", 30)];
        let mut store = MessageWindowStore::new();
        store.apply(targeted(batch.clone(), "b"));
        let once = store.clone();
        store.apply(targeted(batch.clone(), "b"));
        assert_eq!(store, once);
        assert_eq!(store.window(CONVO).map(|w| w.scroll_to_message_counter), Some(1));

        store.apply(targeted(batch.clone(), "c"));
        assert_eq!(store.window(CONVO).map(|w| w.scroll_to_message_counter), Some(2));
        store.apply(targeted(vec![msg("c", 30), msg("d", 40)], "c"));
        assert_eq!(store.window(CONVO).map(|w| w.scroll_to_message_counter), Some(3));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "window invariant violated")]
    fn merge_panics_on_window_id_missing_from_lookup() {
        let mut store = store_with(&[("a", 10), ("b", 20)]);
        store.messages.remove("a");
        merge(&mut store, vec![msg("c", 30)], MergeOptions::default());
    }

    #[test]
    fn field_updates_on_unknown_conversations_are_ignored() {
        let mut store = store_with(&[("a", 10)]);
        let near_bottom = |conversation_id: &str| WindowOp::SetNearBottom {
            conversation_id: conversation_id.to_owned(),
            is_near_bottom: true,
        };
        assert_eq!(
            store.apply(near_bottom("c-9")),
            Transition::Ignored(IgnoreReason::UnknownConversation)
        );
        assert!(store.apply(near_bottom(CONVO)).is_applied());
        assert_eq!(store.apply(near_bottom(CONVO)), Transition::Ignored(IgnoreReason::NoChange));
    }

    #[test]
    fn reset_drops_lookup_entries_of_replaced_window() {
        let mut store = store_with(&[("a", 10), ("b", 20)]);
        store.apply(reset_op(vec![msg("x", 100)]));
        assert_eq!(ids(&store), ["x"]);
        assert!(store.message("a").is_none());
        assert!(store.message("x").is_some());
    }

    #[test]
    fn merge_appends_pages_in_both_directions() {
        let mut store = store_with(&[("c", 30), ("d", 40)]);
        assert!(merge(&mut store, vec![msg("a", 10), msg("b", 20)], MergeOptions::default()).is_applied());
        assert!(merge(&mut store, vec![msg("e", 50)], MergeOptions::default()).is_applied());
        assert_eq!(ids(&store), ["a", "b", "c", "d", "e"]);
        let metrics = &store.window(CONVO).expect("window").metrics;
        assert_eq!(metrics.oldest, Some(ptr("a", 10)));
        assert_eq!(metrics.newest, Some(ptr("e", 50)));
        assert_sorted_unique(&store);
    }

    #[test]
    fn merge_of_known_ids_keeps_the_same_id_list() {
        let mut store = store_with(&[("a", 10), ("b", 20)]);
        let before = Arc::clone(&store.window(CONVO).expect("window").message_ids);
        assert!(merge(&mut store, vec![msg("b", 20).with_body("edited")], MergeOptions::default()).is_applied());
        let after = &store.window(CONVO).expect("window").message_ids;
        assert!(Arc::ptr_eq(&before, after));
        assert_eq!(store.message("b").expect("b").body, "edited");
    }

    #[test]
    fn merge_ignores_empty_batch_and_unknown_conversation() {
        let mut store = store_with(&[("a", 10)]);
        assert_eq!(
            merge(&mut store, Vec::new(), MergeOptions::default()),
            Transition::Ignored(IgnoreReason::EmptyBatch)
        );
        let transition = store.apply(WindowOp::Merge {
            conversation_id: "other".to_owned(),
            messages: vec![Message::new("x", "other", 1, 1)],
            options: MergeOptions::default(),
        });
        assert_eq!(transition, Transition::Ignored(IgnoreReason::UnknownConversation));
    }

    #[test]
    fn live_arrival_is_rejected_when_window_is_off_the_tail() {
        let mut store = MessageWindowStore::new();
        store.apply(WindowOp::Reset {
            conversation_id: CONVO.to_owned(),
            messages: (1..=5).map(|n| msg(&format!("m{n}"), n * 10)).collect(),
            metrics: WindowMetrics {
                newest: Some(ptr("m9", 90)),
                ..WindowMetrics::default()
            },
            scroll_to_message_id: None,
            unbounded_fetch: true,
        });
        let before = store.clone();

        let transition = merge(
            &mut store,
            vec![msg("m_new", 100)],
            MergeOptions {
                is_new_message: true,
                ..MergeOptions::default()
            },
        );
        assert_eq!(transition, Transition::Ignored(IgnoreReason::NotAtLiveTail));
        assert_eq!(store, before);
    }

    #[test]
    fn live_arrival_is_accepted_at_the_tail() {
        let mut store = store_with(&[("m1", 10), ("m2", 20)]);
        let transition = merge(
            &mut store,
            vec![msg("m3", 30)],
            MergeOptions {
                is_new_message: true,
                is_active: true,
                ..MergeOptions::default()
            },
        );
        assert!(transition.is_applied());
        assert_eq!(ids(&store), ["m1", "m2", "m3"]);
        assert_eq!(store.window(CONVO).expect("window").metrics.newest, Some(ptr("m3", 30)));
    }

    #[test]
    fn just_sent_message_requests_scroll() {
        let mut store = store_with(&[("m1", 10)]);
        merge(
            &mut store,
            vec![msg("m2", 20)],
            MergeOptions {
                is_new_message: true,
                is_just_sent: true,
                is_active: true,
            },
        );
        let window = store.window(CONVO).expect("window");
        assert_eq!(window.scroll_to_message_id.as_deref(), Some("m2"));
        assert_eq!(window.scroll_to_message_counter, 1);
    }

    #[test]
    fn paginated_unread_sets_oldest_unseen_without_counting() {
        let mut store = store_with(&[("m2", 20)]);
        merge(
            &mut store,
            vec![msg("m1", 10).unread()],
            MergeOptions {
                is_active: true,
                ..MergeOptions::default()
            },
        );
        let metrics = &store.window(CONVO).expect("window").metrics;
        assert_eq!(metrics.oldest_unseen, Some(ptr("m1", 10)));
        assert_eq!(metrics.total_unseen, 0);
    }

    #[test]
    fn live_unread_arrivals_count_once_oldest_unseen_is_known() {
        let mut store = store_with(&[("m1", 10)]);
        let live = MergeOptions {
            is_new_message: true,
            is_active: true,
            ..MergeOptions::default()
        };
        merge(&mut store, vec![msg("m2", 20).unread()], live);
        merge(&mut store, vec![msg("m3", 30).unread(), msg("m4", 40)], live);
        let metrics = &store.window(CONVO).expect("window").metrics;
        assert_eq!(metrics.oldest_unseen, Some(ptr("m2", 20)));
        assert_eq!(metrics.total_unseen, 2);
    }

    #[test]
    fn unread_arrivals_near_bottom_and_active_are_not_tracked() {
        let mut store = store_with(&[("m1", 10)]);
        store.apply(WindowOp::SetNearBottom {
            conversation_id: CONVO.to_owned(),
            is_near_bottom: true,
        });
        merge(
            &mut store,
            vec![msg("m2", 20).unread()],
            MergeOptions {
                is_new_message: true,
                is_active: true,
                ..MergeOptions::default()
            },
        );
        let metrics = &store.window(CONVO).expect("window").metrics;
        assert_eq!(metrics.oldest_unseen, None);
        assert_eq!(metrics.total_unseen, 0);
    }

    #[test]
    fn sort_invariant_holds_across_mixed_operations() {
        let mut store = store_with(&[("m5", 50), ("m3", 30)]);
        merge(&mut store, vec![msg("m4", 40), msg("m1", 10)], MergeOptions::default());
        merge(&mut store, vec![msg("m2", 20), msg("m4", 40)], MergeOptions::default());
        merge(
            &mut store,
            vec![Message::new("m6", CONVO, 1, 50)],
            MergeOptions::default(),
        );
        assert_eq!(ids(&store), ["m1", "m2", "m3", "m4", "m6", "m5"]);
        assert_sorted_unique(&store);
    }

    #[test]
    fn patch_preserves_expansion_without_new_edit() {
        let mut store = store_with(&[("a", 10)]);
        store.apply(WindowOp::SetDisplayLimit {
            id: "a".to_owned(),
            display_limit: Some(2),
        });
        let mut data = msg("a", 10);
        data.reactions.push(Reaction {
            emoji: "+1".to_owned(),
            from_id: "u-2".to_owned(),
            timestamp: 11,
        });
        data.reactions.push(Reaction {
            emoji: "heart".to_owned(),
            from_id: "u-3".to_owned(),
            timestamp: 12,
        });
        store.apply(WindowOp::Patch {
            id: "a".to_owned(),
            data,
        });
        assert_eq!(store.message("a").expect("a").display_limit, Some(2));
        assert_eq!(store.window(CONVO).expect("window").message_change_counter, 2);
    }

    #[test]
    fn patch_with_new_edit_clears_expansion_and_bumps_once() {
        let mut store = store_with(&[("a", 10)]);
        store.apply(WindowOp::SetDisplayLimit {
            id: "a".to_owned(),
            display_limit: Some(2),
        });
        let mut data = msg("a", 10).with_body("v2");
        data.edit_history.push(crate::types::EditRevision {
            body: "v1".to_owned(),
            timestamp: 10,
        });
        store.apply(WindowOp::Patch {
            id: "a".to_owned(),
            data,
        });
        let message = store.message("a").expect("a");
        assert_eq!(message.display_limit, None);
        assert_eq!(message.body, "v2");
        assert_eq!(store.window(CONVO).expect("window").message_change_counter, 1);
    }

    #[test]
    fn patch_of_unknown_message_is_ignored() {
        let mut store = store_with(&[("a", 10)]);
        let transition = store.apply(WindowOp::Patch {
            id: "zzz".to_owned(),
            data: msg("zzz", 1),
        });
        assert_eq!(transition, Transition::Ignored(IgnoreReason::UnknownMessage));
    }

    #[test]
    fn removing_newest_repairs_pointer_from_neighbour() {
        let mut store = store_with(&[("a", 10), ("b", 20), ("c", 30)]);
        store.apply(WindowOp::Remove { id: "c".to_owned() });
        let window = store.window(CONVO).expect("window");
        assert_eq!(window.message_ids.to_vec(), ["a", "b"]);
        assert_eq!(window.metrics.newest, Some(ptr("b", 20)));
        assert!(store.message("c").is_none());
    }

    #[test]
    fn removing_oldest_repairs_pointer_from_neighbour() {
        let mut store = store_with(&[("a", 10), ("b", 20), ("c", 30)]);
        store.apply(WindowOp::Remove { id: "a".to_owned() });
        let window = store.window(CONVO).expect("window");
        assert_eq!(window.metrics.oldest, Some(ptr("b", 20)));
        assert_eq!(window.metrics.newest, Some(ptr("c", 30)));
    }

    #[test]
    fn removing_middle_message_keeps_pointers() {
        let mut store = store_with(&[("a", 10), ("b", 20), ("c", 30)]);
        store.apply(WindowOp::Remove { id: "b".to_owned() });
        let window = store.window(CONVO).expect("window");
        assert_eq!(window.message_ids.to_vec(), ["a", "c"]);
        assert_eq!(window.metrics.oldest, Some(ptr("a", 10)));
        assert_eq!(window.metrics.newest, Some(ptr("c", 30)));
    }

    #[test]
    fn discard_keep_at_bottom_drops_prefix_and_lookups() {
        let mut store = store_with(&[("a", 10), ("b", 20), ("c", 30), ("d", 40)]);
        let transition = store.apply(WindowOp::Discard {
            conversation_id: CONVO.to_owned(),
            bound: DiscardBound::KeepAtBottom(2),
        });
        assert!(transition.is_applied());
        assert_eq!(ids(&store), ["c", "d"]);
        assert!(store.message("a").is_none());
        assert!(store.message("b").is_none());
        assert!(store.message("c").is_some());
    }

    #[test]
    fn discard_keep_at_top_drops_suffix_and_leaves_tail() {
        let mut store = store_with(&[("a", 10), ("b", 20), ("c", 30), ("d", 40)]);
        store.apply(WindowOp::SetEdges {
            conversation_id: CONVO.to_owned(),
            have_oldest: Some(true),
            have_newest: Some(true),
        });
        store.apply(WindowOp::Discard {
            conversation_id: CONVO.to_owned(),
            bound: DiscardBound::KeepAtTop(3),
        });
        let window = store.window(CONVO).expect("window");
        assert_eq!(window.message_ids.to_vec(), ["a", "b", "c"]);
        assert!(window.have_oldest);
        assert!(!window.have_newest);
        assert!(store.message("d").is_none());
    }

    #[test]
    fn discard_is_noop_in_select_mode_or_within_bound() {
        let mut store = store_with(&[("a", 10), ("b", 20), ("c", 30), ("d", 40)]);
        store.apply(WindowOp::EnterSelectMode {
            conversation_id: CONVO.to_owned(),
            message_id: Some("b".to_owned()),
        });
        let before = store.clone();
        let transition = store.apply(WindowOp::Discard {
            conversation_id: CONVO.to_owned(),
            bound: DiscardBound::KeepAtBottom(2),
        });
        assert_eq!(transition, Transition::Ignored(IgnoreReason::SelectModeActive));
        assert_eq!(store, before);

        store.apply(WindowOp::ExitSelectMode);
        let transition = store.apply(WindowOp::Discard {
            conversation_id: CONVO.to_owned(),
            bound: DiscardBound::KeepAtTop(4),
        });
        assert_eq!(transition, Transition::Ignored(IgnoreReason::WithinBound));
    }

    #[test]
    fn repair_recomputes_pointers_from_window_extremes() {
        let mut store = MessageWindowStore::new();
        store.apply(WindowOp::Reset {
            conversation_id: CONVO.to_owned(),
            messages: vec![msg("b", 20), msg("c", 30)],
            metrics: WindowMetrics {
                oldest: Some(ptr("a", 10)),
                newest: Some(ptr("d", 40)),
                ..WindowMetrics::default()
            },
            scroll_to_message_id: None,
            unbounded_fetch: true,
        });
        store.apply(WindowOp::RepairNewest {
            conversation_id: CONVO.to_owned(),
        });
        store.apply(WindowOp::RepairOldest {
            conversation_id: CONVO.to_owned(),
        });
        let metrics = &store.window(CONVO).expect("window").metrics;
        assert_eq!(metrics.newest, Some(ptr("c", 30)));
        assert_eq!(metrics.oldest, Some(ptr("b", 20)));
    }

    #[test]
    fn scroll_to_message_bumps_counter_for_repeated_targets() {
        let mut store = store_with(&[("a", 10), ("b", 20)]);
        for _ in 0..2 {
            store.apply(WindowOp::ScrollToMessage {
                conversation_id: CONVO.to_owned(),
                message_id: "a".to_owned(),
            });
        }
        let window = store.window(CONVO).expect("window");
        assert_eq!(window.scroll_to_message_id.as_deref(), Some("a"));
        assert_eq!(window.scroll_to_message_counter, 2);

        let transition = store.apply(WindowOp::ScrollToMessage {
            conversation_id: CONVO.to_owned(),
            message_id: "missing".to_owned(),
        });
        assert_eq!(transition, Transition::Ignored(IgnoreReason::UnknownMessage));
    }

    #[test]
    fn clear_unread_metrics_resets_unseen_bookkeeping() {
        let mut store = store_with(&[("m1", 10)]);
        merge(
            &mut store,
            vec![msg("m2", 20).unread()],
            MergeOptions {
                is_new_message: true,
                ..MergeOptions::default()
            },
        );
        assert!(store.apply(WindowOp::ClearUnreadMetrics {
            conversation_id: CONVO.to_owned(),
        })
        .is_applied());
        let metrics = &store.window(CONVO).expect("window").metrics;
        assert_eq!(metrics.oldest_unseen, None);
        assert_eq!(metrics.total_unseen, 0);
    }

    #[test]
    fn close_drops_window_and_every_lookup_entry() {
        let mut store = store_with(&[("a", 10), ("b", 20)]);
        store.apply(WindowOp::Reset {
            conversation_id: "c-2".to_owned(),
            messages: vec![Message::new("x", "c-2", 1, 1)],
            metrics: WindowMetrics::default(),
            scroll_to_message_id: None,
            unbounded_fetch: false,
        });
        store.apply(WindowOp::Close {
            conversation_id: CONVO.to_owned(),
        });
        assert!(store.window(CONVO).is_none());
        assert!(store.message("a").is_none());
        assert!(store.message("x").is_some());
        assert_eq!(store.conversation_ids().collect::<Vec<_>>(), ["c-2"]);
    }

    #[test]
    fn loading_state_updates_report_no_change() {
        let mut store = store_with(&[("a", 10)]);
        let set = WindowOp::SetLoadingState {
            conversation_id: CONVO.to_owned(),
            state: Some(MessageLoadingState::LoadingOlder),
        };
        assert!(store.apply(set.clone()).is_applied());
        assert_eq!(store.apply(set), Transition::Ignored(IgnoreReason::NoChange));
    }

    #[test]
    fn toggles_selection_inside_select_mode() {
        let mut store = store_with(&[("a", 10), ("b", 20)]);
        assert_eq!(
            store.apply(WindowOp::ToggleSelected {
                message_id: "a".to_owned()
            }),
            Transition::Ignored(IgnoreReason::NoChange)
        );
        store.apply(WindowOp::EnterSelectMode {
            conversation_id: CONVO.to_owned(),
            message_id: None,
        });
        store.apply(WindowOp::ToggleSelected {
            message_id: "a".to_owned(),
        });
        store.apply(WindowOp::ToggleSelected {
            message_id: "b".to_owned(),
        });
        store.apply(WindowOp::ToggleSelected {
            message_id: "a".to_owned(),
        });
        let selection = store.selection().expect("selection");
        assert_eq!(selection.message_ids.iter().collect::<Vec<_>>(), ["b"]);
        assert_eq!(
            store
                .messages_in_window(CONVO)
                .iter()
                .map(|m| m.id.as_str())
                .collect::<Vec<_>>(),
            ["a", "b"]
        );
    }
}
