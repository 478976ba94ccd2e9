use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use strand_models::gateway::GatewayMessage;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::outbound::Control;
use crate::session::SequenceCursor;

const NO_LATENCY: u64 = u64::MAX;

/// Heartbeat bookkeeping shared between the heartbeat task, the read loop
/// (acks) and callers asking for latency.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    last_sent: Mutex<Option<Instant>>,
    awaiting_ack: AtomicBool,
    latency_ms: AtomicU64,
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self {
            last_sent: Mutex::new(None),
            awaiting_ack: AtomicBool::new(false),
            latency_ms: AtomicU64::new(NO_LATENCY),
        }
    }
}

impl HeartbeatMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_sent(&self, at: Instant) {
        *self.lock_last_sent() = Some(at);
        self.awaiting_ack.store(true, Ordering::Release);
    }

    /// Record an ack and return the round trip of the heartbeat it answers.
    pub(crate) fn acknowledge(&self, at: Instant) -> Option<Duration> {
        self.awaiting_ack.store(false, Ordering::Release);
        let sent = (*self.lock_last_sent())?;
        let rtt = at.saturating_duration_since(sent);
        self.latency_ms
            .store(rtt.as_millis().min(u128::from(NO_LATENCY - 1)) as u64, Ordering::Release);
        Some(rtt)
    }

    pub fn awaiting_ack(&self) -> bool {
        self.awaiting_ack.load(Ordering::Acquire)
    }

    /// Round trip of the last acknowledged heartbeat.
    pub fn latency(&self) -> Option<Duration> {
        match self.latency_ms.load(Ordering::Acquire) {
            NO_LATENCY => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Forget in-flight state when a connection ends. Latency is kept.
    pub(crate) fn reset(&self) {
        *self.lock_last_sent() = None;
        self.awaiting_ack.store(false, Ordering::Release);
    }

    fn lock_last_sent(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        match self.last_sent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Queue one heartbeat for immediate sending. Returns false once the
/// connection's sender is gone.
pub(crate) fn send_heartbeat(
    control: &mpsc::UnboundedSender<Control>,
    sequence: &SequenceCursor,
    monitor: &HeartbeatMonitor,
) -> bool {
    let payload = match serde_json::to_string(&GatewayMessage::heartbeat(sequence.get())) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!("failed to encode heartbeat: {e}");
            return true;
        }
    };
    if control.send(Control::Send(payload)).is_err() {
        return false;
    }
    monitor.record_sent(Instant::now());
    true
}

/// Heartbeat timer for one connection. The first beat goes out immediately.
/// With `strict` set, a beat that finds the previous one unacknowledged
/// signals `zombie` and stops instead of sending.
pub(crate) fn spawn_heartbeat(
    interval: Duration,
    sequence: Arc<SequenceCursor>,
    monitor: Arc<HeartbeatMonitor>,
    control: mpsc::UnboundedSender<Control>,
    strict: bool,
    zombie: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if strict && monitor.awaiting_ack() {
                tracing::warn!(
                    interval_ms = interval.as_millis() as u64,
                    "heartbeat not acknowledged; treating connection as dead"
                );
                zombie.notify_one();
                break;
            }
            if !send_heartbeat(&control, &sequence, &monitor) {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat_seq(control: Control) -> serde_json::Value {
        match control {
            Control::Send(payload) => {
                let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
                assert_eq!(value["op"], 1);
                value["d"].clone()
            }
            other => panic!("unexpected control {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn beats_on_interval_with_latest_sequence() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sequence = Arc::new(SequenceCursor::default());
        let monitor = Arc::new(HeartbeatMonitor::new());
        let handle = spawn_heartbeat(
            Duration::from_millis(41_250),
            sequence.clone(),
            monitor.clone(),
            tx,
            false,
            Arc::new(Notify::new()),
        );

        assert_eq!(heartbeat_seq(rx.recv().await.unwrap()), serde_json::Value::Null);
        sequence.advance(17);
        let before = Instant::now();
        assert_eq!(heartbeat_seq(rx.recv().await.unwrap()), 17);
        assert!(Instant::now() - before >= Duration::from_millis(41_000));
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn ack_measures_round_trip() {
        let monitor = HeartbeatMonitor::new();
        assert_eq!(monitor.latency(), None);
        let sent = Instant::now();
        monitor.record_sent(sent);
        assert!(monitor.awaiting_ack());

        tokio::time::advance(Duration::from_millis(120)).await;
        let rtt = monitor.acknowledge(Instant::now()).unwrap();
        assert_eq!(rtt, Duration::from_millis(120));
        assert_eq!(monitor.latency(), Some(Duration::from_millis(120)));
        assert!(!monitor.awaiting_ack());

        monitor.reset();
        assert_eq!(monitor.latency(), Some(Duration::from_millis(120)));
    }

    #[tokio::test(start_paused = true)]
    async fn strict_mode_flags_missing_ack() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let zombie = Arc::new(Notify::new());
        let handle = spawn_heartbeat(
            Duration::from_secs(10),
            Arc::new(SequenceCursor::default()),
            Arc::new(HeartbeatMonitor::new()),
            tx,
            true,
            zombie.clone(),
        );

        rx.recv().await.unwrap();
        zombie.notified().await;
        handle.await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn lenient_mode_keeps_beating_without_acks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_heartbeat(
            Duration::from_secs(10),
            Arc::new(SequenceCursor::default()),
            Arc::new(HeartbeatMonitor::new()),
            tx,
            false,
            Arc::new(Notify::new()),
        );
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }
        handle.abort();
    }
}
