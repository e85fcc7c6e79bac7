//! Tokio runtime that owns a [`TranscriptSession`], executes its effects
//! against a [`MessageStore`], and talks to hosts over [`TranscriptChannels`].

use std::{sync::Arc, time::Instant};

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use transcript_core::{
    Effect, EventStream, FetchKind, FetchRequest, MarkReadRequest, PageResult,
    TranscriptChannelError, TranscriptChannels, TranscriptCommand, TranscriptError,
    TranscriptEvent, TranscriptSession, WindowMetrics, WindowTuning,
};
use transcript_platform::MessageStore;

const COMMAND_BUFFER: usize = 128;
const EVENT_BUFFER: usize = 512;

/// Host-side handle to a running transcript runtime.
#[derive(Debug)]
pub struct TranscriptRuntimeHandle {
    channels: TranscriptChannels,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl TranscriptRuntimeHandle {
    pub async fn send(&self, command: TranscriptCommand) -> Result<(), TranscriptChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    pub fn channels(&self) -> &TranscriptChannels {
        &self.channels
    }

    /// Stop the runtime loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(err) = self.task.await {
            warn!(error = %err, "transcript runtime task ended abnormally");
        }
    }
}

/// Spawn a runtime on the current tokio runtime.
pub fn spawn_runtime(store: Arc<dyn MessageStore>, tuning: WindowTuning) -> TranscriptRuntimeHandle {
    let (channels, command_rx) = TranscriptChannels::new(COMMAND_BUFFER, EVENT_BUFFER);
    let shutdown = CancellationToken::new();
    let runtime = TranscriptRuntime::new(
        channels.clone(),
        command_rx,
        store,
        tuning,
        shutdown.child_token(),
    );
    let task = tokio::spawn(async move {
        runtime.run().await;
    });

    TranscriptRuntimeHandle {
        channels,
        shutdown,
        task,
    }
}

/// Result of a spawned store call, fed back into the loop in arrival order.
#[derive(Debug)]
enum Completion {
    Page(PageResult),
    FetchFailed {
        request: FetchRequest,
        error: TranscriptError,
    },
    MarkRead {
        request: MarkReadRequest,
        result: Result<(), TranscriptError>,
    },
}

struct TranscriptRuntime {
    channels: TranscriptChannels,
    command_rx: mpsc::Receiver<TranscriptCommand>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    store: Arc<dyn MessageStore>,
    session: TranscriptSession,
    shutdown: CancellationToken,
}

impl TranscriptRuntime {
    fn new(
        channels: TranscriptChannels,
        command_rx: mpsc::Receiver<TranscriptCommand>,
        store: Arc<dyn MessageStore>,
        tuning: WindowTuning,
        shutdown: CancellationToken,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            channels,
            command_rx,
            completion_tx,
            completion_rx,
            store,
            session: TranscriptSession::new(tuning),
            shutdown,
        }
    }

    async fn run(mut self) {
        info!("transcript runtime started");
        loop {
            let deadline = self.session.next_mark_read_deadline();
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                command = self.command_rx.recv() => {
                    let Some(command) = command else { break };
                    if let Err(err) = self.handle_command(command) {
                        debug!(code = %err.code, "command failed");
                        self.channels.emit(TranscriptEvent::Error(err));
                    }
                }
                Some(completion) = self.completion_rx.recv() => self.handle_completion(completion),
                _ = sleep_until(deadline) => {
                    if let Some(effect) = self.session.poll_mark_read(now()) {
                        self.execute(vec![effect]);
                    }
                }
            }
        }

        // The final receipt must land before the loop returns.
        for effect in self.session.close_conversation() {
            match effect {
                Effect::MarkRead(request) => {
                    let result = self
                        .store
                        .mark_read(&request.conversation_id, &request.upto_message_id)
                        .await
                        .map_err(TranscriptError::from);
                    self.handle_completion(Completion::MarkRead { request, result });
                }
                other => self.execute(vec![other]),
            }
        }
        info!("transcript runtime stopped");
    }

    fn handle_command(&mut self, command: TranscriptCommand) -> Result<(), TranscriptError> {
        let effects = match command {
            TranscriptCommand::OpenConversation {
                conversation_id,
                around_message_id,
            } => self
                .session
                .open_conversation(conversation_id, around_message_id),
            TranscriptCommand::CloseConversation => self.session.close_conversation(),
            TranscriptCommand::JumpToMessage { message_id } => {
                self.session.jump_to_message(message_id)?
            }
            TranscriptCommand::MessageArrived {
                message,
                is_just_sent,
            } => self.session.on_message_arrived(message, is_just_sent),
            TranscriptCommand::MessageChanged { message } => {
                self.session.on_message_changed(message, now())
            }
            TranscriptCommand::MessageDeleted { message_id } => {
                self.session.on_message_deleted(&message_id)
            }
            TranscriptCommand::VisibilityBatch { events } => {
                self.session.on_visibility_batch(events, now())
            }
            TranscriptCommand::ViewportResized { height_px } => {
                self.session.on_viewport_resize(height_px);
                Vec::new()
            }
            TranscriptCommand::Scrolled {
                scroll_top,
                scroll_height,
                client_height,
            } => {
                self.session
                    .on_scroll(scroll_top, scroll_height, client_height);
                Vec::new()
            }
            TranscriptCommand::EngageScrollLock => {
                self.session.engage_scroll_lock();
                Vec::new()
            }
            TranscriptCommand::ReleaseScrollLock => {
                self.session.release_scroll_lock();
                Vec::new()
            }
            TranscriptCommand::SetActive { is_active } => {
                self.session.set_active(is_active, now());
                Vec::new()
            }
            TranscriptCommand::AcknowledgeUnread => self.session.acknowledge_unread()?,
            TranscriptCommand::EnterSelectMode { message_id } => {
                let transition = self.session.enter_select_mode(message_id)?;
                debug!(?transition, "enter select mode");
                Vec::new()
            }
            TranscriptCommand::ToggleSelected { message_id } => {
                let transition = self.session.toggle_selected(message_id);
                debug!(?transition, "toggle selected");
                Vec::new()
            }
            TranscriptCommand::ExitSelectMode => {
                self.session.exit_select_mode();
                Vec::new()
            }
            TranscriptCommand::RepairNewest => {
                let transition = self.session.repair_newest()?;
                debug!(?transition, "repair newest");
                Vec::new()
            }
            TranscriptCommand::RepairOldest => {
                let transition = self.session.repair_oldest()?;
                debug!(?transition, "repair oldest");
                Vec::new()
            }
            TranscriptCommand::GetRow { index } => {
                self.channels.emit(TranscriptEvent::Row {
                    index,
                    row: self.session.get_row(index),
                });
                Vec::new()
            }
        };
        self.execute(effects);
        Ok(())
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Page(page) => {
                let effects = self.session.on_page_loaded(page);
                self.execute(effects);
            }
            Completion::FetchFailed { request, error } => {
                if self.session.on_fetch_failed(&request, &error) {
                    self.channels.emit(TranscriptEvent::Error(error));
                }
            }
            Completion::MarkRead { request, result } => match result {
                Ok(()) => self.channels.emit(TranscriptEvent::MarkedRead(request)),
                Err(error) => {
                    warn!(
                        conversation_id = %request.conversation_id,
                        upto_message_id = %request.upto_message_id,
                        error = %error,
                        "mark read failed"
                    );
                    self.channels.emit(TranscriptEvent::Error(error));
                }
            },
        }
    }

    fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Fetch(request) => {
                    self.channels.emit(TranscriptEvent::FetchStarted {
                        request: request.clone(),
                    });
                    let store = Arc::clone(&self.store);
                    let completion_tx = self.completion_tx.clone();
                    tokio::spawn(async move {
                        let completion = match fetch_page(store.as_ref(), &request).await {
                            Ok(page) => Completion::Page(page),
                            Err(error) => Completion::FetchFailed { request, error },
                        };
                        let _ = completion_tx.send(completion);
                    });
                }
                Effect::MarkRead(request) => {
                    let store = Arc::clone(&self.store);
                    let completion_tx = self.completion_tx.clone();
                    tokio::spawn(async move {
                        let result = store
                            .mark_read(&request.conversation_id, &request.upto_message_id)
                            .await
                            .map_err(TranscriptError::from);
                        let _ = completion_tx.send(Completion::MarkRead { request, result });
                    });
                }
                Effect::Scroll {
                    conversation_id,
                    anchor,
                } => self.channels.emit(TranscriptEvent::Scroll {
                    conversation_id,
                    anchor,
                }),
                Effect::WindowChanged {
                    conversation_id,
                    row_count,
                    have_oldest,
                    have_newest,
                } => self.channels.emit(TranscriptEvent::WindowChanged {
                    conversation_id,
                    row_count,
                    have_oldest,
                    have_newest,
                }),
                Effect::MessageUpdated {
                    conversation_id,
                    message_id,
                } => self.channels.emit(TranscriptEvent::MessageUpdated {
                    conversation_id,
                    message_id,
                }),
            }
        }
    }
}

async fn fetch_page(
    store: &dyn MessageStore,
    request: &FetchRequest,
) -> Result<PageResult, TranscriptError> {
    let conversation_id = request.conversation_id.as_str();
    let messages = match &request.kind {
        FetchKind::Older { before } => {
            store
                .load_older(conversation_id, before, request.limit)
                .await?
        }
        FetchKind::Newer { after } => {
            store
                .load_newer(conversation_id, after, request.limit)
                .await?
        }
        FetchKind::Newest { around } => {
            store
                .load_newest(conversation_id, around.as_deref(), request.limit)
                .await?
        }
    };
    let metrics = match request.kind {
        FetchKind::Newest { .. } => store.metrics(conversation_id).await?,
        _ => WindowMetrics::default(),
    };
    Ok(PageResult {
        request: request.clone(),
        messages,
        metrics,
    })
}

/// Wall-clock reading that follows tokio's clock, so paused-time tests work.
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::timeout;
    use transcript_core::{Anchor, Message, RowDescriptor, VisibilityEvent};
    use transcript_platform::{InMemoryMessageStore, StoreError};

    use super::*;

    const CONVO: &str = "c-1";

    struct FailingStore;

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn load_older(&self, _: &str, _: &str, _: usize) -> Result<Vec<Message>, StoreError> {
            Err(StoreError::Backend("disk offline".to_owned()))
        }

        async fn load_newer(&self, _: &str, _: &str, _: usize) -> Result<Vec<Message>, StoreError> {
            Err(StoreError::Backend("disk offline".to_owned()))
        }

        async fn load_newest(
            &self,
            _: &str,
            _: Option<&str>,
            _: usize,
        ) -> Result<Vec<Message>, StoreError> {
            Err(StoreError::Backend("disk offline".to_owned()))
        }

        async fn metrics(&self, _: &str) -> Result<WindowMetrics, StoreError> {
            Ok(WindowMetrics::default())
        }

        async fn mark_read(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("read receipts disabled".to_owned()))
        }
    }

    fn seeded_store(count: u64) -> InMemoryMessageStore {
        let store = InMemoryMessageStore::new();
        store
            .insert_many((0..count).map(|n| Message::new(format!("m{n}"), CONVO, n, n).unread()))
            .expect("seed should work");
        store
    }

    async fn wait_for(
        events: &mut EventStream,
        mut matches: impl FnMut(&TranscriptEvent) -> bool,
    ) -> TranscriptEvent {
        loop {
            let event = timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event timeout")
                .expect("event receive");
            if matches(&event) {
                return event;
            }
        }
    }

    async fn open(handle: &TranscriptRuntimeHandle) {
        handle
            .send(TranscriptCommand::OpenConversation {
                conversation_id: CONVO.to_owned(),
                around_message_id: None,
            })
            .await
            .expect("command should enqueue");
    }

    #[tokio::test(start_paused = true)]
    async fn opening_loads_newest_page_and_anchors() {
        let handle = spawn_runtime(Arc::new(seeded_store(5)), WindowTuning::default());
        let mut events = handle.subscribe();
        open(&handle).await;

        let started = wait_for(&mut events, |event| {
            matches!(event, TranscriptEvent::FetchStarted { .. })
        })
        .await;
        match started {
            TranscriptEvent::FetchStarted { request } => {
                assert_eq!(request.kind, FetchKind::Newest { around: None });
                assert_eq!(request.limit, 30);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let changed = wait_for(&mut events, |event| {
            matches!(event, TranscriptEvent::WindowChanged { .. })
        })
        .await;
        assert_eq!(
            changed,
            TranscriptEvent::WindowChanged {
                conversation_id: CONVO.to_owned(),
                row_count: 7,
                have_oldest: true,
                have_newest: true,
            }
        );

        let scroll = wait_for(&mut events, |event| matches!(event, TranscriptEvent::Scroll { .. })).await;
        assert_eq!(
            scroll,
            TranscriptEvent::Scroll {
                conversation_id: CONVO.to_owned(),
                anchor: Anchor::ScrollToUnreadIndicator { index: 1 },
            }
        );

        handle
            .send(TranscriptCommand::GetRow { index: 2 })
            .await
            .expect("command should enqueue");
        let row = wait_for(&mut events, |event| matches!(event, TranscriptEvent::Row { .. })).await;
        assert_eq!(
            row,
            TranscriptEvent::Row {
                index: 2,
                row: Some(RowDescriptor::Message {
                    id: "m0".to_owned()
                }),
            }
        );
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_read_receipt_reaches_the_store() {
        let store = seeded_store(5);
        let handle = spawn_runtime(Arc::new(store.clone()), WindowTuning::default());
        let mut events = handle.subscribe();
        open(&handle).await;
        wait_for(&mut events, |event| {
            matches!(event, TranscriptEvent::WindowChanged { .. })
        })
        .await;

        handle
            .send(TranscriptCommand::SetActive { is_active: true })
            .await
            .expect("command should enqueue");
        handle
            .send(TranscriptCommand::VisibilityBatch {
                events: vec![
                    VisibilityEvent::message("m4", 1.0),
                    VisibilityEvent::sentinel(1.0),
                ],
            })
            .await
            .expect("command should enqueue");

        let marked = wait_for(&mut events, |event| matches!(event, TranscriptEvent::MarkedRead(_))).await;
        assert_eq!(
            marked,
            TranscriptEvent::MarkedRead(MarkReadRequest {
                conversation_id: CONVO.to_owned(),
                upto_message_id: "m4".to_owned(),
            })
        );
        let metrics = store.metrics(CONVO).await.expect("metrics");
        assert_eq!(metrics.total_unseen, 0);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_writes_the_pending_read_receipt() {
        let store = seeded_store(5);
        let tuning = WindowTuning {
            mark_read_throttle_ms: 60_000,
            ..WindowTuning::default()
        };
        let handle = spawn_runtime(Arc::new(store.clone()), tuning);
        let mut events = handle.subscribe();
        open(&handle).await;
        wait_for(&mut events, |event| {
            matches!(event, TranscriptEvent::WindowChanged { .. })
        })
        .await;

        for command in [
            TranscriptCommand::SetActive { is_active: true },
            TranscriptCommand::VisibilityBatch {
                events: vec![
                    VisibilityEvent::message("m4", 1.0),
                    VisibilityEvent::sentinel(1.0),
                ],
            },
            TranscriptCommand::GetRow { index: 0 },
        ] {
            handle.send(command).await.expect("command should enqueue");
        }
        wait_for(&mut events, |event| matches!(event, TranscriptEvent::Row { .. })).await;
        assert_eq!(store.metrics(CONVO).await.expect("metrics").total_unseen, 5);

        handle.shutdown().await;
        let marked = wait_for(&mut events, |event| matches!(event, TranscriptEvent::MarkedRead(_))).await;
        assert_eq!(
            marked,
            TranscriptEvent::MarkedRead(MarkReadRequest {
                conversation_id: CONVO.to_owned(),
                upto_message_id: "m4".to_owned(),
            })
        );
        assert_eq!(store.metrics(CONVO).await.expect("metrics").total_unseen, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_surfaces_store_error() {
        let handle = spawn_runtime(Arc::new(FailingStore), WindowTuning::default());
        let mut events = handle.subscribe();
        open(&handle).await;

        let error = wait_for(&mut events, |event| matches!(event, TranscriptEvent::Error(_))).await;
        match error {
            TranscriptEvent::Error(err) => {
                assert_eq!(err.code, "store_failure");
                assert!(err.message.contains("disk offline"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        handle
            .send(TranscriptCommand::JumpToMessage {
                message_id: "m1".to_owned(),
            })
            .await
            .expect("command should enqueue");
        let retried = wait_for(&mut events, |event| {
            matches!(event, TranscriptEvent::FetchStarted { .. })
        })
        .await;
        assert!(matches!(
            retried,
            TranscriptEvent::FetchStarted {
                request: FetchRequest {
                    kind: FetchKind::Newest { around: Some(_) },
                    ..
                }
            }
        ));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn actions_without_open_conversation_emit_errors() {
        let handle = spawn_runtime(Arc::new(InMemoryMessageStore::new()), WindowTuning::default());
        let mut events = handle.subscribe();
        handle
            .send(TranscriptCommand::AcknowledgeUnread)
            .await
            .expect("command should enqueue");

        let event = wait_for(&mut events, |_| true).await;
        match event {
            TranscriptEvent::Error(err) => assert_eq!(err.code, "conversation_not_open"),
            other => panic!("unexpected event: {other:?}"),
        }
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_the_command_channel() {
        let handle = spawn_runtime(Arc::new(InMemoryMessageStore::new()), WindowTuning::default());
        let channels = handle.channels().clone();
        handle.shutdown().await;

        let err = channels
            .send_command(TranscriptCommand::CloseConversation)
            .await
            .expect_err("runtime is gone");
        assert!(matches!(err, TranscriptChannelError::CommandChannelClosed));
    }
}
