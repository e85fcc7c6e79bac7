use serde::{Deserialize, Serialize};

use crate::types::ConversationWindow;

/// One rendered row of the transcript list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RowDescriptor {
    /// Conversation hero shown once the oldest message is loaded.
    Header,
    /// A loaded message.
    Message { id: String },
    /// "N unread messages" divider placed before the oldest unseen message.
    UnreadMarker { total_unseen: u64 },
}

/// Row projection of a window: optional header, messages, optional unread marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowLayout {
    rows: Vec<RowDescriptor>,
    unread_marker_row: Option<usize>,
}

impl RowLayout {
    pub fn from_window(window: &ConversationWindow) -> Self {
        let unseen_id = window
            .metrics
            .oldest_unseen
            .as_ref()
            .map(|pointer| pointer.id.as_str());

        let mut rows = Vec::with_capacity(window.len() + 2);
        if window.have_oldest {
            rows.push(RowDescriptor::Header);
        }
        let mut unread_marker_row = None;
        for id in window.message_ids.iter() {
            if unread_marker_row.is_none() && unseen_id == Some(id.as_str()) {
                unread_marker_row = Some(rows.len());
                rows.push(RowDescriptor::UnreadMarker {
                    total_unseen: window.metrics.total_unseen,
                });
            }
            rows.push(RowDescriptor::Message { id: id.clone() });
        }

        Self {
            rows,
            unread_marker_row,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn get_row(&self, index: usize) -> Option<&RowDescriptor> {
        self.rows.get(index)
    }

    pub fn rows(&self) -> &[RowDescriptor] {
        &self.rows
    }

    pub fn has_header(&self) -> bool {
        matches!(self.rows.first(), Some(RowDescriptor::Header))
    }

    pub fn unread_marker_row(&self) -> Option<usize> {
        self.unread_marker_row
    }

    /// Row index of a message, if it is loaded.
    pub fn row_index_of(&self, message_id: &str) -> Option<usize> {
        self.rows.iter().position(
            |row| matches!(row, RowDescriptor::Message { id } if id == message_id),
        )
    }

    /// Index of the last message row.
    pub fn last_message_row(&self) -> Option<usize> {
        self.rows
            .iter()
            .rposition(|row| matches!(row, RowDescriptor::Message { .. }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::types::{Pointer, WindowMetrics};

    fn window(ids: &[&str]) -> ConversationWindow {
        ConversationWindow {
            message_ids: Arc::from(
                ids.iter().map(|id| (*id).to_owned()).collect::<Vec<_>>(),
            ),
            ..ConversationWindow::default()
        }
    }

    #[test]
    fn lays_out_messages_without_extras() {
        let layout = RowLayout::from_window(&window(&["a", "b"]));
        assert_eq!(layout.row_count(), 2);
        assert!(!layout.has_header());
        assert_eq!(layout.row_index_of("b"), Some(1));
        assert_eq!(layout.last_message_row(), Some(1));
        assert_eq!(layout.get_row(2), None);
    }

    #[test]
    fn places_header_and_unread_marker() {
        let mut window = window(&["a", "b", "c"]);
        window.have_oldest = true;
        window.metrics = WindowMetrics {
            oldest_unseen: Some(Pointer {
                id: "b".to_owned(),
                received_at: 2,
                sent_at: 2,
            }),
            total_unseen: 4,
            ..WindowMetrics::default()
        };

        let layout = RowLayout::from_window(&window);
        assert_eq!(
            layout.rows(),
            [
                RowDescriptor::Header,
                RowDescriptor::Message { id: "a".to_owned() },
                RowDescriptor::UnreadMarker { total_unseen: 4 },
                RowDescriptor::Message { id: "b".to_owned() },
                RowDescriptor::Message { id: "c".to_owned() },
            ]
        );
        assert_eq!(layout.unread_marker_row(), Some(2));
        assert_eq!(layout.row_index_of("b"), Some(3));
        assert_eq!(layout.last_message_row(), Some(4));
    }

    #[test]
    fn skips_marker_when_unseen_message_is_not_loaded() {
        let mut window = window(&["a"]);
        window.metrics.oldest_unseen = Some(Pointer {
            id: "gone".to_owned(),
            received_at: 0,
            sent_at: 0,
        });
        let layout = RowLayout::from_window(&window);
        assert_eq!(layout.unread_marker_row(), None);
        assert_eq!(layout.row_count(), 1);
    }
}
