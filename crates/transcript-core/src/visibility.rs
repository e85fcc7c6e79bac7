use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Observed element: the synthetic bottom sentinel or a message row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum VisibilityTarget {
    BottomSentinel,
    Message(String),
}

/// One `(element, ratio)` observation reported by the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisibilityEvent {
    pub target: VisibilityTarget,
    /// Visible fraction of the element, `0.0..=1.0`.
    pub ratio: f32,
}

impl VisibilityEvent {
    pub fn message(id: impl Into<String>, ratio: f32) -> Self {
        Self {
            target: VisibilityTarget::Message(id.into()),
            ratio,
        }
    }

    pub fn sentinel(ratio: f32) -> Self {
        Self {
            target: VisibilityTarget::BottomSentinel,
            ratio,
        }
    }
}

/// Edge ids derived from the accumulated observations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct VisibilitySummary {
    pub is_near_bottom: bool,
    pub oldest_partially_visible: Option<String>,
    pub newest_partially_visible: Option<String>,
    pub newest_fully_visible: Option<String>,
    /// Newest row whose bottom edge is known to be on screen.
    pub newest_bottom_visible: Option<String>,
}

/// Accumulates visibility ratios in first-observation order.
///
/// Updates to an already-observed row keep its original slot; order is never
/// re-sorted, since it decides which visible row is oldest and which newest.
#[derive(Debug, Clone, Default)]
pub struct VisibilityTracker {
    rows: IndexMap<String, f32>,
    sentinel_ratio: f32,
}

impl VisibilityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a batch and return the derived summary.
    pub fn observe(
        &mut self,
        events: impl IntoIterator<Item = VisibilityEvent>,
    ) -> VisibilitySummary {
        for event in events {
            let ratio = sanitize_ratio(event.ratio);
            match event.target {
                VisibilityTarget::BottomSentinel => self.sentinel_ratio = ratio,
                VisibilityTarget::Message(id) => {
                    self.rows.insert(id, ratio);
                }
            }
        }
        let summary = self.summary();
        trace!(?summary, tracked = self.rows.len(), "visibility batch observed");
        summary
    }

    pub fn summary(&self) -> VisibilitySummary {
        let is_near_bottom = self.sentinel_ratio > 0.0;
        let mut oldest_partially_visible = None;
        let mut newest_partially_visible = None;
        let mut newest_fully_visible = None;
        for (id, ratio) in self.rows.iter().filter(|(_, ratio)| **ratio > 0.0) {
            if oldest_partially_visible.is_none() {
                oldest_partially_visible = Some(id.clone());
            }
            newest_partially_visible = Some(id.clone());
            if *ratio >= 1.0 {
                newest_fully_visible = Some(id.clone());
            }
        }

        let newest_bottom_visible = match &newest_fully_visible {
            Some(id) => Some(id.clone()),
            None if is_near_bottom || newest_partially_visible != oldest_partially_visible => {
                oldest_partially_visible.clone()
            }
            None => None,
        };

        VisibilitySummary {
            is_near_bottom,
            oldest_partially_visible,
            newest_partially_visible,
            newest_fully_visible,
            newest_bottom_visible,
        }
    }

    /// Drop every observation, as when the rendered row set is rebuilt.
    pub fn reset(&mut self) {
        self.rows.clear();
        self.sentinel_ratio = 0.0;
    }

    /// Drop one row, keeping the relative order of the rest.
    pub fn forget(&mut self, message_id: &str) {
        self.rows.shift_remove(message_id);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn ratio(&self, message_id: &str) -> Option<f32> {
        self.rows.get(message_id).copied()
    }
}

fn sanitize_ratio(ratio: f32) -> f32 {
    if ratio.is_nan() {
        0.0
    } else {
        ratio.clamp(0.0, 1.0)
    }
}
