use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::protocol::{TranscriptCommand, TranscriptEvent};

/// Broadcast event stream handed to host subscribers.
pub type EventStream = broadcast::Receiver<TranscriptEvent>;

/// Errors returned by transcript channel operations.
#[derive(Debug, Error)]
pub enum TranscriptChannelError {
    /// The runtime dropped its command receiver.
    #[error("command channel is closed")]
    CommandChannelClosed,
}

/// Command/event channel pair shared by the runtime and its hosts.
#[derive(Clone, Debug)]
pub struct TranscriptChannels {
    command_tx: mpsc::Sender<TranscriptCommand>,
    event_tx: broadcast::Sender<TranscriptEvent>,
}

impl TranscriptChannels {
    /// Create a channel set and return it with the command receiver.
    pub fn new(
        command_buffer: usize,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<TranscriptCommand>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));

        (
            Self {
                command_tx,
                event_tx,
            },
            command_rx,
        )
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Queue one command for the runtime.
    pub async fn send_command(
        &self,
        command: TranscriptCommand,
    ) -> Result<(), TranscriptChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| TranscriptChannelError::CommandChannelClosed)
    }

    /// Emit an event to every subscriber.
    ///
    /// Best-effort: with no subscribers the event is dropped.
    pub fn emit(&self, event: TranscriptEvent) {
        let _ = self.event_tx.send(event);
    }
}
