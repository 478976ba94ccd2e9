use std::panic::{catch_unwind, AssertUnwindSafe};

use futures_util::Stream;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::session::Status;

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchEvent {
    pub event_type: String,
    pub data: Value,
    /// Session sequence at delivery time. Never decreases within one session,
    /// including for events replayed after bootstrap. A fresh identify starts
    /// a new session and the sequence restarts.
    pub sequence: u64,
    /// Sequence carried by the frame itself, if any.
    pub frame_sequence: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Dispatch(DispatchEvent),
    /// First bootstrap of this client completed.
    Ready,
    /// Bootstrap completed again after a fresh identify.
    Reconnected,
    /// A dropped session was resumed.
    Resumed,
    StatusChanged { old: Status, new: Status },
    Disconnected { close_code: Option<u16> },
    /// Terminal; nothing further will be produced.
    Shutdown { close_code: Option<u16> },
}

/// Broadcast fan-out of gateway events.
///
/// Every subscriber consumes at its own pace. A subscriber that falls more
/// than `capacity` events behind loses the oldest ones; the gap is logged.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: GatewayEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            receiver: self.sender.subscribe(),
            skipped: 0,
        }
    }

    pub fn dispatch(&self, event: DispatchEvent) {
        self.publish(GatewayEvent::Dispatch(event));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(4096)
    }
}

/// One consumer's view of the bus, starting at the moment it subscribed.
pub struct EventStream {
    receiver: broadcast::Receiver<GatewayEvent>,
    skipped: u64,
}

impl EventStream {
    /// Next event, or `None` once the shard is gone.
    pub async fn next(&mut self) -> Option<GatewayEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(missed)) => {
                    self.skipped += missed;
                    tracing::warn!(missed, "event consumer lagged; oldest events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Total events this consumer lost to lag.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn into_stream(self) -> impl Stream<Item = GatewayEvent> + Send {
        futures_util::stream::unfold(self, |mut events| async move {
            events.next().await.map(|event| (event, events))
        })
    }
}

/// Run `listener` for every event on its own task. A panicking listener is
/// reported and the loop moves on to the next event.
pub(crate) fn spawn_listener<F>(mut events: EventStream, listener: F) -> JoinHandle<()>
where
    F: Fn(&GatewayEvent) + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let terminal = matches!(event, GatewayEvent::Shutdown { .. });
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                tracing::error!(event = event_label(&event), "event listener panicked");
            }
            if terminal {
                break;
            }
        }
    })
}

fn event_label(event: &GatewayEvent) -> &str {
    match event {
        GatewayEvent::Dispatch(dispatch) => dispatch.event_type.as_str(),
        GatewayEvent::Ready => "ready",
        GatewayEvent::Reconnected => "reconnected",
        GatewayEvent::Resumed => "resumed",
        GatewayEvent::StatusChanged { .. } => "status",
        GatewayEvent::Disconnected { .. } => "disconnected",
        GatewayEvent::Shutdown { .. } => "shutdown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn dispatch(seq: u64) -> GatewayEvent {
        GatewayEvent::Dispatch(DispatchEvent {
            event_type: "MESSAGE_CREATE".into(),
            data: json!({"n": seq}),
            sequence: seq,
            frame_sequence: Some(seq),
        })
    }

    #[tokio::test]
    async fn fan_out_to_independent_consumers() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(dispatch(1));
        bus.publish(GatewayEvent::Ready);

        assert_eq!(a.next().await, Some(dispatch(1)));
        assert_eq!(a.next().await, Some(GatewayEvent::Ready));
        assert_eq!(b.next().await, Some(dispatch(1)));
    }

    #[tokio::test]
    async fn lagging_consumer_drops_oldest() {
        let bus = EventBus::new(2);
        let mut slow = bus.subscribe();
        for seq in 1..=5 {
            bus.publish(dispatch(seq));
        }
        assert_eq!(slow.next().await, Some(dispatch(4)));
        assert_eq!(slow.skipped(), 3);
        assert_eq!(slow.next().await, Some(dispatch(5)));
    }

    #[tokio::test]
    async fn stream_ends_when_bus_dropped() {
        let bus = EventBus::new(4);
        let stream = bus.subscribe().into_stream();
        bus.publish(GatewayEvent::Resumed);
        drop(bus);
        let collected: Vec<_> = stream.collect().await;
        assert_eq!(collected, vec![GatewayEvent::Resumed]);
    }

    #[tokio::test]
    async fn panicking_listener_keeps_running() {
        let bus = EventBus::new(8);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handle = spawn_listener(bus.subscribe(), move |event| {
            counter.fetch_add(1, Ordering::SeqCst);
            if *event == GatewayEvent::Ready {
                panic!("listener bug");
            }
        });

        bus.publish(GatewayEvent::Ready);
        bus.publish(dispatch(1));
        bus.publish(GatewayEvent::Shutdown { close_code: None });
        handle.await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
