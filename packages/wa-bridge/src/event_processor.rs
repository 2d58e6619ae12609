//! Event processor.
//!
//! The application service pushes decoded events into an unbounded queue;
//! a single worker task drains it into the [`MatrixHandler`] so events of a
//! transaction are handled in order.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::BridgeError;
use crate::handler::{MatrixEvent, MatrixHandler};

pub type EventSender = mpsc::UnboundedSender<MatrixEvent>;

struct Worker {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct EventProcessor {
    handler: Arc<MatrixHandler>,
    sender: EventSender,
    queue: Option<mpsc::UnboundedReceiver<MatrixEvent>>,
    worker: Option<Worker>,
}

impl EventProcessor {
    pub fn new(handler: Arc<MatrixHandler>) -> Self {
        let (sender, queue) = mpsc::unbounded_channel();
        Self {
            handler,
            sender,
            queue: Some(queue),
            worker: None,
        }
    }

    /// Handle for producers. Events sent before [`start`](Self::start) are
    /// buffered.
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    /// Spawn the worker. The queue can only be consumed once, so a stopped
    /// processor cannot be restarted.
    pub fn start(&mut self) -> Result<(), BridgeError> {
        let mut queue = self
            .queue
            .take()
            .ok_or(BridgeError::NotRunning("event queue"))?;
        let handler = Arc::clone(&self.handler);
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    event = queue.recv() => match event {
                        Some(event) => handler.handle_event(event).await,
                        None => break,
                    },
                }
            }
            tracing::debug!("Event processor stopped");
        });

        self.worker = Some(Worker { stop_tx, handle });
        Ok(())
    }

    /// Stop the worker once the event in flight, if any, is handled.
    pub async fn stop(&mut self) -> Result<(), BridgeError> {
        let Worker { stop_tx, handle } = self
            .worker
            .take()
            .ok_or(BridgeError::NotRunning("event processor"))?;
        // The worker may already have exited on a closed queue.
        let _ = stop_tx.send(());
        handle.await.map_err(|_| BridgeError::TaskJoin {
            task: "event processor",
        })
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::tests::StubClient;
    use crate::registry::Registry;
    use crate::state_store::{Membership, StateStore};
    use crate::types::{MatrixRoomID, MatrixUserID};
    use std::time::Duration;

    fn processor() -> (EventProcessor, Arc<StateStore>) {
        let state_store = Arc::new(StateStore::new("/unused/state.json"));
        let handler = Arc::new(MatrixHandler::new(
            Arc::new(Registry::new()),
            Arc::clone(&state_store),
            Arc::new(StubClient::default()),
            MatrixUserID::new("@whatsappbot:example.com"),
        ));
        (EventProcessor::new(handler), state_store)
    }

    fn join(user: &str) -> MatrixEvent {
        MatrixEvent {
            event_id: format!("$join-{user}"),
            room_id: MatrixRoomID::new("!room:example.com"),
            sender: MatrixUserID::new(user),
            event_type: "m.room.member".to_string(),
            state_key: Some(user.to_string()),
            content: serde_json::json!({ "membership": "join" }),
        }
    }

    #[tokio::test]
    async fn test_buffered_events_are_processed_after_start() {
        let (mut processor, state_store) = processor();
        processor.sender().send(join("@alice:example.com")).unwrap();

        processor.start().unwrap();
        for _ in 0..50 {
            if !state_store.joined_members(&MatrixRoomID::new("!room:example.com")).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        processor.stop().await.unwrap();

        assert_eq!(
            state_store.membership(
                &MatrixRoomID::new("!room:example.com"),
                &MatrixUserID::new("@alice:example.com")
            ),
            Some(Membership::Join)
        );
    }

    #[tokio::test]
    async fn test_stop_without_start_fails() {
        let (mut processor, _) = processor();
        assert!(matches!(
            processor.stop().await,
            Err(BridgeError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_cannot_start_twice() {
        let (mut processor, _) = processor();
        processor.start().unwrap();
        assert!(processor.start().is_err());
        processor.stop().await.unwrap();
        assert!(!processor.is_running());
    }
}
