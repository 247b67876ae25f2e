//! The two event queues the reactor multiplexes: a bounded MPSC
//! application queue (many user-thread producers, the reactor is the sole
//! consumer) and a background queue (the reactor is the sole producer, the
//! user thread the sole consumer).

use kcgroup_types::GroupError;
use tokio::sync::mpsc;

use crate::background::{BackgroundEvent, BackgroundEventSink};
use crate::events::ApplicationEvent;

/// Reactor-side half of the application event queue: only `run_once`
/// drains this.
pub struct ApplicationEventQueue {
    sender: mpsc::Sender<ApplicationEvent>,
    receiver: mpsc::Receiver<ApplicationEvent>,
}

impl ApplicationEventQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self { sender, receiver }
    }

    /// A clonable producer handle for the user-facing API thread(s).
    #[must_use]
    pub fn sender(&self) -> ApplicationEventSender {
        ApplicationEventSender(self.sender.clone())
    }

    /// Drains everything currently buffered, preserving FIFO order.
    pub(crate) fn drain(&mut self, out: &mut Vec<ApplicationEvent>) {
        while let Ok(event) = self.receiver.try_recv() {
            out.push(event);
        }
    }
}

/// Clonable producer handle used by `enqueue_application_event`.
#[derive(Clone)]
pub struct ApplicationEventSender(mpsc::Sender<ApplicationEvent>);

impl ApplicationEventSender {
    pub async fn enqueue(&self, event: ApplicationEvent) -> Result<(), GroupError> {
        self.0
            .send(event)
            .await
            .map_err(|_| GroupError::Disconnected)
    }

    /// Non-blocking variant; fails if the bounded queue is full.
    pub fn try_enqueue(&self, event: ApplicationEvent) -> Result<(), GroupError> {
        self.0
            .try_send(event)
            .map_err(|_| GroupError::Retriable("application event queue is full".into()))
    }
}

/// Reactor-side half of the background queue: the reactor is the sole
/// producer, enforced by never exposing a second `Sender`.
pub struct BackgroundEventQueue {
    sender: mpsc::Sender<BackgroundEvent>,
    receiver: Option<mpsc::Receiver<BackgroundEvent>>,
}

impl BackgroundEventQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Some(receiver),
        }
    }

    /// Takes the single consumer side; returns `None` on a second call.
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<BackgroundEvent>> {
        self.receiver.take()
    }

    pub(crate) fn enqueue(&self, event: BackgroundEvent) {
        if self.sender.try_send(event).is_err() {
            tracing::warn!("background event queue full or closed; dropping event");
        }
    }
}

impl BackgroundEventSink for BackgroundEventQueue {
    fn enqueue(&mut self, event: BackgroundEvent) {
        BackgroundEventQueue::enqueue(self, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn application_events_are_fifo() {
        let mut queue = ApplicationEventQueue::new(8);
        let sender = queue.sender();
        sender
            .enqueue(ApplicationEvent::Poll { poll_time_ms: 1 })
            .await
            .unwrap();
        sender
            .enqueue(ApplicationEvent::Poll { poll_time_ms: 2 })
            .await
            .unwrap();

        let mut drained = Vec::new();
        queue.drain(&mut drained);
        assert_eq!(drained.len(), 2);
        assert!(matches!(
            drained[0],
            ApplicationEvent::Poll { poll_time_ms: 1 }
        ));
        assert!(matches!(
            drained[1],
            ApplicationEvent::Poll { poll_time_ms: 2 }
        ));
    }

    #[test]
    fn background_queue_exposes_receiver_exactly_once() {
        let mut queue = BackgroundEventQueue::new(4);
        assert!(queue.take_receiver().is_some());
        assert!(queue.take_receiver().is_none());
    }
}
