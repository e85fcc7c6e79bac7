//! Scripted host that drives a transcript runtime through a simulated viewport.

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{sync::broadcast::error::RecvError, time::timeout};
use tracing::{debug, info, warn};
use transcript_core::{
    Anchor, EventStream, FetchKind, Message, RowDescriptor, TranscriptChannelError,
    TranscriptCommand, TranscriptError, TranscriptEvent, VisibilityEvent,
};
use transcript_platform::{InMemoryMessageStore, MessageStore, StoreError};
use transcript_runtime::{TranscriptRuntimeHandle, spawn_runtime};
use uuid::Uuid;

use crate::config::SmokeConfig;

/// `GetRow` index used as an ordering fence; it never names a real row.
const FENCE_ROW: usize = usize::MAX;
const FIRST_SENT_AT_MS: u64 = 1_700_000_000_000;
const SEND_SPACING_MS: u64 = 1_000;

#[derive(Debug, Error)]
pub enum SmokeError {
    #[error("timed out after {waited_ms}ms waiting for {what}")]
    Timeout { what: &'static str, waited_ms: u64 },
    #[error("event stream closed")]
    EventStreamClosed,
    #[error(transparent)]
    Channel(#[from] TranscriptChannelError),
    #[error("runtime error: {0}")]
    Runtime(TranscriptError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What the run observed.
#[derive(Debug, Default)]
pub struct SmokeReport {
    pub older_pages: usize,
    pub oldest_reached: bool,
    pub anchors: Vec<Anchor>,
    pub marked_read_upto: Option<String>,
    pub final_row_count: usize,
    pub unseen_after_run: u64,
}

/// Seed a store, run the script against a fresh runtime, then shut it down.
pub async fn run(config: &SmokeConfig) -> Result<SmokeReport, SmokeError> {
    let store = InMemoryMessageStore::new();
    let newest_id = seed(&store, config)?;
    let handle = spawn_runtime(Arc::new(store.clone()), config.tuning.clone());
    let events = handle.subscribe();

    let mut host = SimulatedHost {
        config,
        handle,
        events,
        row_count: 0,
        visible: Vec::new(),
        report: SmokeReport::default(),
    };
    let outcome = host.script(&newest_id).await;

    let SimulatedHost {
        handle, mut report, ..
    } = host;
    handle.shutdown().await;
    outcome?;

    report.unseen_after_run = store.metrics(&config.conversation_id).await?.total_unseen;
    Ok(report)
}

fn seed(store: &InMemoryMessageStore, config: &SmokeConfig) -> Result<String, StoreError> {
    let first_unread = config.message_count - config.unread_count;
    let messages: Vec<Message> = (0..config.message_count)
        .map(|n| {
            let sent_at = FIRST_SENT_AT_MS + n as u64 * SEND_SPACING_MS;
            let message = Message::new(
                Uuid::new_v4().to_string(),
                config.conversation_id.clone(),
                sent_at,
                sent_at,
            )
            .with_body(format!("smoke message #{n}"));
            if n >= first_unread {
                message.unread()
            } else {
                message
            }
        })
        .collect();
    let newest_id = messages
        .last()
        .map(|message| message.id.clone())
        .unwrap_or_default();
    store.insert_many(messages)?;
    info!(
        conversation_id = %config.conversation_id,
        messages = config.message_count,
        unread = config.unread_count,
        "store seeded"
    );
    Ok(newest_id)
}

struct SimulatedHost<'a> {
    config: &'a SmokeConfig,
    handle: TranscriptRuntimeHandle,
    events: EventStream,
    row_count: usize,
    visible: Vec<String>,
    report: SmokeReport,
}

impl SimulatedHost<'_> {
    async fn script(&mut self, newest_id: &str) -> Result<(), SmokeError> {
        let conversation_id = self.config.conversation_id.clone();
        self.send(TranscriptCommand::ViewportResized {
            height_px: self.config.viewport_height_px,
        })
        .await?;
        self.send(TranscriptCommand::SetActive { is_active: true })
            .await?;
        self.send(TranscriptCommand::OpenConversation {
            conversation_id: conversation_id.clone(),
            around_message_id: None,
        })
        .await?;
        self.wait_for_window().await?;
        info!(%conversation_id, row_count = self.row_count, "conversation opened");

        for step in 1..=self.config.scroll_steps {
            let rows = self.rows().await?;
            if rows.first() == Some(&RowDescriptor::Header) {
                self.report.oldest_reached = true;
                info!(step, "reached the start of the conversation");
                break;
            }
            self.show(&rows, Edge::Top).await?;
            let seen = self.fence().await?;
            let requested_older = seen.iter().any(|event| {
                matches!(
                    event,
                    TranscriptEvent::FetchStarted { request }
                        if matches!(request.kind, FetchKind::Older { .. })
                )
            });
            if !requested_older {
                debug!(step, "top edge did not request older history");
                break;
            }
            self.await_fetched_page(&seen).await?;
            self.report.older_pages += 1;
            info!(step, row_count = self.row_count, "older page merged");
        }

        self.send(TranscriptCommand::JumpToMessage {
            message_id: newest_id.to_owned(),
        })
        .await?;
        let seen = self.fence().await?;
        let refetched = self.await_fetched_page(&seen).await?;
        info!(refetched, row_count = self.row_count, "jumped back to the newest message");

        let rows = self.rows().await?;
        let bottom = self.show(&rows, Edge::Bottom).await?;
        if let Some(bottom) = bottom {
            let receipt = self
                .wait_until("read receipt", |event| {
                    matches!(event, TranscriptEvent::MarkedRead(request) if request.upto_message_id == bottom)
                })
                .await?;
            if let TranscriptEvent::MarkedRead(request) = receipt {
                self.report.marked_read_upto = Some(request.upto_message_id);
            }
        }

        let sent_at = FIRST_SENT_AT_MS + self.config.message_count as u64 * SEND_SPACING_MS;
        let live = Message::new(
            Uuid::new_v4().to_string(),
            conversation_id.clone(),
            sent_at,
            sent_at,
        )
        .with_body("sent from the smoke host");
        self.send(TranscriptCommand::MessageArrived {
            message: live,
            is_just_sent: true,
        })
        .await?;
        self.wait_for_window().await?;

        // A reply from the other side while the viewport still sits at the bottom.
        let reply_at = sent_at + SEND_SPACING_MS;
        let reply = Message::new(
            Uuid::new_v4().to_string(),
            conversation_id.clone(),
            reply_at,
            reply_at,
        )
        .with_body("reply seen by the smoke host");
        self.send(TranscriptCommand::MessageArrived {
            message: reply,
            is_just_sent: false,
        })
        .await?;
        self.wait_for_window().await?;
        self.report.final_row_count = self.row_count;

        self.send(TranscriptCommand::CloseConversation).await?;
        self.fence().await?;
        Ok(())
    }

    async fn send(&self, command: TranscriptCommand) -> Result<(), SmokeError> {
        self.handle.send(command).await?;
        Ok(())
    }

    /// Report the rows a viewport pinned to `edge` would show.
    ///
    /// Returns the newest message id in view.
    async fn show(
        &mut self,
        rows: &[RowDescriptor],
        edge: Edge,
    ) -> Result<Option<String>, SmokeError> {
        let tuning = &self.config.tuning;
        let viewport = self.config.viewport_height_px;
        let capacity = tuning.visible_rows(viewport);
        let in_view: Vec<&RowDescriptor> = match edge {
            Edge::Top => rows.iter().take(capacity).collect(),
            Edge::Bottom => rows.iter().skip(rows.len().saturating_sub(capacity)).collect(),
        };
        let now_visible: Vec<String> = in_view
            .iter()
            .filter_map(|row| match row {
                RowDescriptor::Message { id } => Some(id.clone()),
                _ => None,
            })
            .collect();

        let mut events: Vec<VisibilityEvent> = self
            .visible
            .iter()
            .filter(|id| !now_visible.contains(id))
            .map(|id| VisibilityEvent::message(id.clone(), 0.0))
            .collect();
        for (position, id) in now_visible.iter().enumerate() {
            // The outermost row is only partly inside the viewport.
            let clipped = match edge {
                Edge::Top => position == 0,
                Edge::Bottom => false,
            };
            events.push(VisibilityEvent::message(
                id.clone(),
                if clipped { 0.5 } else { 1.0 },
            ));
        }
        events.push(VisibilityEvent::sentinel(match edge {
            Edge::Top => 0.0,
            Edge::Bottom => 1.0,
        }));

        let scroll_height = rows.len() as f32 * tuning.estimated_row_height_px;
        let scroll_top = match edge {
            Edge::Top => 0.0,
            Edge::Bottom => (scroll_height - viewport).max(0.0),
        };
        self.send(TranscriptCommand::Scrolled {
            scroll_top,
            scroll_height,
            client_height: viewport,
        })
        .await?;
        self.send(TranscriptCommand::VisibilityBatch { events })
            .await?;

        let newest = now_visible.last().cloned();
        self.visible = now_visible;
        Ok(newest)
    }

    /// Read every rendered row, in order.
    async fn rows(&mut self) -> Result<Vec<RowDescriptor>, SmokeError> {
        let expected = self.row_count;
        for index in 0..expected {
            self.send(TranscriptCommand::GetRow { index }).await?;
        }
        let mut rows = Vec::with_capacity(expected);
        for _ in 0..expected {
            let event = self
                .wait_until("row", |event| {
                    matches!(event, TranscriptEvent::Row { index, .. } if *index != FENCE_ROW)
                })
                .await?;
            if let TranscriptEvent::Row { row: Some(row), .. } = event {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Collect every event emitted before the runtime handles a fence command.
    async fn fence(&mut self) -> Result<Vec<TranscriptEvent>, SmokeError> {
        self.send(TranscriptCommand::GetRow { index: FENCE_ROW })
            .await?;
        let mut seen = Vec::new();
        loop {
            let event = self.next_event("fence").await?;
            if matches!(event, TranscriptEvent::Row { index: FENCE_ROW, .. }) {
                return Ok(seen);
            }
            seen.push(event);
        }
    }

    /// Wait for the page of a fetch started in `seen`, unless it already landed.
    async fn await_fetched_page(&mut self, seen: &[TranscriptEvent]) -> Result<bool, SmokeError> {
        let Some(started) = seen
            .iter()
            .rposition(|event| matches!(event, TranscriptEvent::FetchStarted { .. }))
        else {
            return Ok(false);
        };
        let landed = seen[started..]
            .iter()
            .any(|event| matches!(event, TranscriptEvent::WindowChanged { .. }));
        if !landed {
            self.wait_for_window().await?;
        }
        Ok(true)
    }

    async fn wait_for_window(&mut self) -> Result<(), SmokeError> {
        self.wait_until("window change", |event| {
            matches!(event, TranscriptEvent::WindowChanged { .. })
        })
        .await
        .map(|_| ())
    }

    async fn wait_until<F>(
        &mut self,
        what: &'static str,
        mut predicate: F,
    ) -> Result<TranscriptEvent, SmokeError>
    where
        F: FnMut(&TranscriptEvent) -> bool,
    {
        loop {
            let event = self.next_event(what).await?;
            if predicate(&event) {
                return Ok(event);
            }
        }
    }

    async fn next_event(&mut self, what: &'static str) -> Result<TranscriptEvent, SmokeError> {
        let waited_ms = self.config.event_timeout_ms + self.config.tuning.mark_read_throttle_ms;
        loop {
            let event = match timeout(Duration::from_millis(waited_ms), self.events.recv()).await {
                Err(_) => return Err(SmokeError::Timeout { what, waited_ms }),
                Ok(Err(RecvError::Closed)) => return Err(SmokeError::EventStreamClosed),
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!(skipped, "event stream lagged");
                    continue;
                }
                Ok(Ok(event)) => event,
            };

            if !matches!(event, TranscriptEvent::Row { .. }) {
                let payload = serde_json::to_string(&event)?;
                debug!(%payload, "transcript event");
            }
            match &event {
                TranscriptEvent::WindowChanged { row_count, .. } => self.row_count = *row_count,
                TranscriptEvent::Scroll { anchor, .. } => self.report.anchors.push(*anchor),
                TranscriptEvent::Error(err) => return Err(SmokeError::Runtime(err.clone())),
                _ => {}
            }
            return Ok(event);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Edge {
    Top,
    Bottom,
}
