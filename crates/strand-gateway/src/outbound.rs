// Rate-limited outbound dispatcher (115 queued + 4 control sends per 60s).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::SinkExt;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::transport::WsSink;

/// Length of one rate-limit window.
pub const SEND_WINDOW: Duration = Duration::from_secs(60);
/// Queued sends allowed per window. The server allows 120; the rest is margin.
pub const ORDINARY_LIMIT: u32 = 115;
/// Ceiling for control sends (heartbeat, identify, resume) that skip the queue.
pub const CONTROL_LIMIT: u32 = 119;
/// Pause before retrying the head of a queue after the budget ran out.
pub const RATE_LIMIT_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueClass {
    /// Member chunk and guild sync requests; always drained first.
    ChunkSync,
    Ordinary,
}

/// Per-connection send counter over a fixed 60 second window.
#[derive(Debug)]
pub struct SendBudget {
    window_end: Instant,
    sent: u32,
    warned: bool,
}

impl SendBudget {
    pub fn new(now: Instant) -> Self {
        Self {
            window_end: now + SEND_WINDOW,
            sent: 0,
            warned: false,
        }
    }

    /// Take one send from the budget. Control sends may dip into the reserve.
    pub fn try_acquire(&mut self, now: Instant, control: bool) -> bool {
        if now >= self.window_end {
            self.window_end = now + SEND_WINDOW;
            self.sent = 0;
            self.warned = false;
        }
        let limit = if control { CONTROL_LIMIT } else { ORDINARY_LIMIT };
        if self.sent < limit {
            self.sent += 1;
            return true;
        }
        if !self.warned {
            self.warned = true;
            tracing::warn!(
                sent = self.sent,
                "outbound rate limit reached; holding sends until the window resets"
            );
        }
        false
    }

    pub fn sent(&self) -> u32 {
        self.sent
    }
}

#[derive(Default)]
struct Queues {
    chunk_sync: VecDeque<String>,
    ordinary: VecDeque<String>,
}

impl Queues {
    fn get_mut(&mut self, class: QueueClass) -> &mut VecDeque<String> {
        match class {
            QueueClass::ChunkSync => &mut self.chunk_sync,
            QueueClass::Ordinary => &mut self.ordinary,
        }
    }
}

/// Pending outbound payloads. Outlives individual connections so commands
/// submitted while disconnected go out after the next identify or resume.
pub struct OutboundQueue {
    queues: Mutex<Queues>,
    notify: Notify,
    authorized: watch::Sender<bool>,
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundQueue {
    pub fn new() -> Self {
        let (authorized, _) = watch::channel(false);
        Self {
            queues: Mutex::new(Queues::default()),
            notify: Notify::new(),
            authorized,
        }
    }

    pub fn push(&self, class: QueueClass, payload: String) {
        self.lock().get_mut(class).push_back(payload);
        self.notify.notify_one();
    }

    /// Head of the highest priority non-empty queue, left in place.
    pub fn peek(&self) -> Option<(QueueClass, String)> {
        let queues = self.lock();
        if let Some(head) = queues.chunk_sync.front() {
            return Some((QueueClass::ChunkSync, head.clone()));
        }
        queues
            .ordinary
            .front()
            .map(|head| (QueueClass::Ordinary, head.clone()))
    }

    /// Remove the head of `class` if it is still the payload that was sent.
    pub fn pop_sent(&self, class: QueueClass, payload: &str) -> bool {
        let mut queues = self.lock();
        let queue = queues.get_mut(class);
        if queue.front().is_some_and(|head| head == payload) {
            queue.pop_front();
            true
        } else {
            false
        }
    }

    pub fn len(&self, class: QueueClass) -> usize {
        self.lock().get_mut(class).len()
    }

    pub fn clear_chunk_sync(&self) -> usize {
        let mut queues = self.lock();
        let dropped = queues.chunk_sync.len();
        queues.chunk_sync.clear();
        dropped
    }

    /// Open or close the gate for queued sends.
    pub fn set_authorized(&self, authorized: bool) {
        self.authorized.send_replace(authorized);
    }

    async fn wait_authorized(&self) {
        let mut rx = self.authorized.subscribe();
        // The sender lives in self, so this only ends when authorized.
        let _ = rx.wait_for(|authorized| *authorized).await;
    }

    async fn next_item(&self) -> (QueueClass, String) {
        loop {
            if let Some(item) = self.peek() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queues> {
        match self.queues.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Frames that bypass the queues.
#[derive(Debug)]
pub(crate) enum Control {
    /// Sent directly within the control allowance, otherwise appended to
    /// the ordinary queue.
    Send(String),
    /// Send a close frame and stop the sender.
    Close { code: u16, reason: &'static str },
}

pub(crate) fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: WsCloseCode::from(code),
        reason: reason.to_string().into(),
    }))
}

/// The single writer of one connection. Drains control frames first, then
/// the chunk/sync queue, then the ordinary queue, within the send budget.
pub(crate) async fn run_sender(
    mut sink: WsSink,
    mut control: mpsc::UnboundedReceiver<Control>,
    queue: Arc<OutboundQueue>,
    shard_id: u32,
) {
    let mut budget = SendBudget::new(Instant::now());
    let mut paused_until: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;
            frame = control.recv() => match frame {
                Some(Control::Send(payload)) => {
                    if budget.try_acquire(Instant::now(), true) {
                        if let Err(e) = sink.send(Message::text(payload)).await {
                            tracing::debug!(shard_id, "gateway send failed: {e}");
                            break;
                        }
                    } else {
                        queue.push(QueueClass::Ordinary, payload);
                    }
                }
                Some(Control::Close { code, reason }) => {
                    tracing::debug!(shard_id, code, reason, "closing gateway connection");
                    let _ = sink.send(close_message(code, reason)).await;
                    let _ = sink.close().await;
                    break;
                }
                None => break,
            },
            (class, payload) = next_queued(&queue, paused_until) => {
                if budget.try_acquire(Instant::now(), false) {
                    paused_until = None;
                    if let Err(e) = sink.send(Message::text(payload.clone())).await {
                        tracing::debug!(shard_id, "gateway send failed: {e}");
                        break;
                    }
                    queue.pop_sent(class, &payload);
                } else {
                    paused_until = Some(Instant::now() + RATE_LIMIT_PAUSE);
                }
            }
        }
    }
}

async fn next_queued(queue: &OutboundQueue, paused_until: Option<Instant>) -> (QueueClass, String) {
    if let Some(until) = paused_until {
        tokio::time::sleep_until(until).await;
    }
    queue.wait_authorized().await;
    queue.next_item().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;

    fn recording_sink() -> (WsSink, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = futures_util::sink::unfold(tx, |tx, frame: Message| async move {
            tx.send(frame).map_err(|_| GatewayError::Closed)?;
            Ok::<_, GatewayError>(tx)
        });
        (Box::pin(sink), rx)
    }

    fn text(frame: Message) -> String {
        match frame {
            Message::Text(text) => text.as_str().to_string(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn budget_holds_ordinary_sends_at_limit() {
        let start = Instant::now();
        let mut budget = SendBudget::new(start);
        let allowed = (0..130).filter(|_| budget.try_acquire(start, false)).count();
        assert_eq!(allowed, ORDINARY_LIMIT as usize);
        // Control traffic still has a small reserve.
        let control = (0..10).filter(|_| budget.try_acquire(start, true)).count();
        assert_eq!(control, (CONTROL_LIMIT - ORDINARY_LIMIT) as usize);
        assert!(budget.sent() < 120);
    }

    #[test]
    fn budget_resets_after_window() {
        let start = Instant::now();
        let mut budget = SendBudget::new(start);
        for _ in 0..ORDINARY_LIMIT {
            assert!(budget.try_acquire(start, false));
        }
        assert!(!budget.try_acquire(start + Duration::from_secs(59), false));
        assert!(budget.try_acquire(start + SEND_WINDOW, false));
        assert_eq!(budget.sent(), 1);
    }

    #[test]
    fn chunk_sync_drains_before_ordinary() {
        let queue = OutboundQueue::new();
        queue.push(QueueClass::Ordinary, "a".into());
        queue.push(QueueClass::ChunkSync, "chunk".into());
        queue.push(QueueClass::Ordinary, "b".into());

        let mut order = Vec::new();
        while let Some((class, payload)) = queue.peek() {
            assert!(queue.pop_sent(class, &payload));
            order.push(payload);
        }
        assert_eq!(order, vec!["chunk", "a", "b"]);
    }

    #[test]
    fn pop_ignores_replaced_head() {
        let queue = OutboundQueue::new();
        queue.push(QueueClass::ChunkSync, "old".into());
        let (class, payload) = queue.peek().unwrap();
        queue.clear_chunk_sync();
        queue.push(QueueClass::ChunkSync, "new".into());
        assert!(!queue.pop_sent(class, &payload));
        assert_eq!(queue.len(QueueClass::ChunkSync), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sender_waits_for_authorization() {
        let (sink, mut frames) = recording_sink();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(OutboundQueue::new());
        queue.push(QueueClass::Ordinary, "queued".into());
        let task = tokio::spawn(run_sender(sink, control_rx, queue.clone(), 0));

        control_tx.send(Control::Send("identify".into())).unwrap();
        assert_eq!(text(frames.recv().await.unwrap()), "identify");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(frames.try_recv().is_err());

        queue.set_authorized(true);
        assert_eq!(text(frames.recv().await.unwrap()), "queued");
        assert_eq!(queue.len(QueueClass::Ordinary), 0);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn sender_throttles_past_budget() {
        let (sink, mut frames) = recording_sink();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(OutboundQueue::new());
        queue.set_authorized(true);
        for n in 0..125 {
            queue.push(QueueClass::Ordinary, format!("m{n}"));
        }
        let start = Instant::now();
        let task = tokio::spawn(run_sender(sink, control_rx, queue.clone(), 0));

        for n in 0..ORDINARY_LIMIT {
            assert_eq!(text(frames.recv().await.unwrap()), format!("m{n}"));
        }
        assert!(Instant::now() < start + Duration::from_secs(1));

        // Heartbeats still fit in the reserve while the queue is held.
        control_tx.send(Control::Send("hb".into())).unwrap();
        assert_eq!(text(frames.recv().await.unwrap()), "hb");

        // The 116th queued payload waits for the next window, in order.
        let next = frames.recv().await.unwrap();
        assert!(Instant::now() >= start + SEND_WINDOW);
        assert_eq!(text(next), format!("m{ORDINARY_LIMIT}"));
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_over_budget_falls_back_to_queue() {
        let (sink, mut frames) = recording_sink();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let queue = Arc::new(OutboundQueue::new());
        let task = tokio::spawn(run_sender(sink, control_rx, queue.clone(), 0));

        for n in 0..CONTROL_LIMIT {
            control_tx.send(Control::Send(format!("c{n}"))).unwrap();
        }
        for _ in 0..CONTROL_LIMIT {
            frames.recv().await.unwrap();
        }
        control_tx.send(Control::Send("late".into())).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.len(QueueClass::Ordinary), 1);
        task.abort();
    }

    #[tokio::test]
    async fn close_frame_stops_sender() {
        let (sink, mut frames) = recording_sink();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_sender(sink, control_rx, Arc::new(OutboundQueue::new()), 0));

        control_tx
            .send(Control::Close { code: 4000, reason: "OP 7: RECONNECT" })
            .unwrap();
        match frames.recv().await.unwrap() {
            Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4000),
            other => panic!("expected close, got {other:?}"),
        }
        task.await.unwrap();
    }
}
