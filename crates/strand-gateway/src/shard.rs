// Session state machine: connect, identify/resume, read loop, reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use strand_models::gateway::*;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use crate::close_code::{CloseCode, CLOSE_NORMAL, CLOSE_RECONNECT};
use crate::compression::FrameDecoder;
use crate::config::GatewayConfig;
use crate::dispatch::{Completion, Dispatcher, Effect};
use crate::error::GatewayError;
use crate::events::{spawn_listener, EventBus, EventStream, GatewayEvent};
use crate::heartbeat::{send_heartbeat, spawn_heartbeat, HeartbeatMonitor};
use crate::outbound::{run_sender, Control, OutboundQueue, QueueClass};
use crate::reconnect::{ConnectPermit, ConnectQueue, ReconnectBackoff};
use crate::session::{SequenceCursor, Session, Status};
use crate::transport::{Connector, TungsteniteConnector, WsSink, WsStream};

/// How long a closing connection's writer gets to flush its close frame.
const SENDER_DRAIN: Duration = Duration::from_secs(2);

/// Commands a caller can queue on a shard.
#[derive(Debug, Clone)]
pub enum GatewayCommand {
    VoiceStateUpdate(VoiceStateUpdate),
    PresenceUpdate(PresenceUpdate),
    RequestGuildMembers(RequestGuildMembers),
    Raw(GatewayMessage),
}

impl GatewayCommand {
    pub fn into_message(self) -> Result<GatewayMessage, serde_json::Error> {
        match self {
            GatewayCommand::VoiceStateUpdate(body) => {
                GatewayMessage::command(OpCode::VoiceStateUpdate, &body)
            }
            GatewayCommand::PresenceUpdate(body) => {
                GatewayMessage::command(OpCode::PresenceUpdate, &body)
            }
            GatewayCommand::RequestGuildMembers(body) => {
                GatewayMessage::command(OpCode::RequestGuildMembers, &body)
            }
            GatewayCommand::Raw(message) => Ok(message),
        }
    }
}

/// One gateway session: owns the connection lifecycle and exposes events,
/// status and a command queue to the caller.
pub struct Shard {
    config: Arc<GatewayConfig>,
    connector: Arc<dyn Connector>,
    connect_queue: ConnectQueue,
    events: EventBus,
    outbound: Arc<OutboundQueue>,
    monitor: Arc<HeartbeatMonitor>,
    sequence: Arc<SequenceCursor>,
    status: Arc<watch::Sender<Status>>,
    session_id: Arc<RwLock<Option<String>>>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl Shard {
    pub fn new(config: GatewayConfig) -> Self {
        let queue = ConnectQueue::new(config.connect_spacing());
        Self::with_connector(config, Arc::new(TungsteniteConnector::default()), queue)
    }

    /// Build a shard over a custom transport. Shards that share `connect_queue`
    /// space their identify attempts against each other.
    pub fn with_connector(
        config: GatewayConfig,
        connector: Arc<dyn Connector>,
        connect_queue: ConnectQueue,
    ) -> Self {
        let (status, _) = watch::channel(Status::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            events: EventBus::new(config.event_capacity.max(1)),
            config: Arc::new(config),
            connector,
            connect_queue,
            outbound: Arc::new(OutboundQueue::new()),
            monitor: Arc::new(HeartbeatMonitor::new()),
            sequence: Arc::new(SequenceCursor::default()),
            status: Arc::new(status),
            session_id: Arc::new(RwLock::new(None)),
            shutdown,
            started: AtomicBool::new(false),
            runner: Mutex::new(None),
        }
    }

    /// Spawn the connection task. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), GatewayError> {
        if *self.shutdown.borrow() {
            return Err(GatewayError::ShutDown);
        }
        self.config
            .validate()
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(GatewayError::AlreadyStarted);
        }

        let runner = Runner {
            shard_id: self.config.shard_label(),
            config: self.config.clone(),
            connector: self.connector.clone(),
            connect_queue: self.connect_queue.clone(),
            events: self.events.clone(),
            outbound: self.outbound.clone(),
            monitor: self.monitor.clone(),
            status: self.status.clone(),
            session_id: self.session_id.clone(),
            shutdown: self.shutdown.subscribe(),
            session: Session {
                sequence: self.sequence.clone(),
                ..Session::default()
            },
            dispatcher: Dispatcher::new(self.config.guild_sync),
            backoff: ReconnectBackoff::new(self.config.max_reconnect_delay()),
        };
        *self.lock_runner() = Some(tokio::spawn(runner.run()));
        Ok(())
    }

    /// Subscribe to events published from now on.
    pub fn events(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Run `listener` for every event on a background task. A panic inside
    /// the listener is logged and does not affect the shard.
    pub fn add_listener<F>(&self, listener: F) -> JoinHandle<()>
    where
        F: Fn(&GatewayEvent) + Send + 'static,
    {
        spawn_listener(self.events.subscribe(), listener)
    }

    /// Queue a command. Returns once queued; it goes out when the session is
    /// authorized and the send budget allows.
    pub fn submit(&self, command: GatewayCommand) -> Result<(), GatewayError> {
        if *self.shutdown.borrow() || self.status() == Status::Shutdown {
            return Err(GatewayError::ShutDown);
        }
        let payload = serde_json::to_string(&command.into_message()?)?;
        self.outbound.push(QueueClass::Ordinary, payload);
        Ok(())
    }

    pub fn update_voice_state(&self, update: VoiceStateUpdate) -> Result<(), GatewayError> {
        self.submit(GatewayCommand::VoiceStateUpdate(update))
    }

    pub fn status(&self) -> Status {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    /// Round trip of the last acknowledged heartbeat.
    pub fn latency(&self) -> Option<Duration> {
        self.monitor.latency()
    }

    pub fn session_id(&self) -> Option<String> {
        match self.session_id.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Last dispatch sequence seen on the current session.
    pub fn sequence(&self) -> Option<u64> {
        self.sequence.get()
    }

    /// Close the connection and stop reconnecting. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let runner = self.lock_runner().take();
        match runner {
            Some(handle) => {
                if let Err(e) = handle.await {
                    tracing::error!(shard_id = self.config.shard_label(), "shard task failed: {e}");
                }
            }
            None => {
                if self.status() != Status::Shutdown {
                    publish_status(&self.status, &self.events, Status::Shutdown);
                    self.events.publish(GatewayEvent::Shutdown { close_code: None });
                }
            }
        }
    }

    fn lock_runner(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.runner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn publish_status(status: &watch::Sender<Status>, events: &EventBus, new: Status) {
    let old = status.send_replace(new);
    if old != new {
        events.publish(GatewayEvent::StatusChanged { old, new });
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // An error means the shard handle is gone, which is a shutdown too.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

enum Outcome {
    Closed { close_code: Option<u16> },
    Shutdown,
}

/// Per-connection state of the read loop.
struct Connection {
    control: mpsc::UnboundedSender<Control>,
    permit: Option<ConnectPermit>,
    heartbeat: Option<JoinHandle<()>>,
    zombie: Arc<Notify>,
    awaiting_hello: bool,
    /// IDENTIFY went out and READY has not confirmed it yet.
    identify_pending: bool,
}

impl Connection {
    fn send(&self, message: &GatewayMessage) {
        match serde_json::to_string(message) {
            Ok(payload) => {
                let _ = self.control.send(Control::Send(payload));
            }
            Err(e) => tracing::warn!("failed to encode gateway payload: {e}"),
        }
    }

    fn close(&self, code: u16, reason: &'static str) {
        let _ = self.control.send(Control::Close { code, reason });
    }
}

struct Runner {
    shard_id: u32,
    config: Arc<GatewayConfig>,
    connector: Arc<dyn Connector>,
    connect_queue: ConnectQueue,
    events: EventBus,
    outbound: Arc<OutboundQueue>,
    monitor: Arc<HeartbeatMonitor>,
    status: Arc<watch::Sender<Status>>,
    session_id: Arc<RwLock<Option<String>>>,
    shutdown: watch::Receiver<bool>,
    session: Session,
    dispatcher: Dispatcher,
    backoff: ReconnectBackoff,
}

impl Runner {
    async fn run(mut self) {
        let mut delay: Option<Duration> = None;
        let mut reconnecting = false;
        let mut shutdown = self.shutdown.clone();

        loop {
            if let Some(wait) = delay.take() {
                self.set_status(Status::WaitingToReconnect);
                tracing::info!(
                    shard_id = self.shard_id,
                    delay_ms = wait.as_millis() as u64,
                    "reconnecting after delay"
                );
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown_requested(&mut shutdown) => {
                        self.finish(None);
                        return;
                    }
                }
            }
            if *shutdown.borrow() {
                self.finish(None);
                return;
            }

            let permit = if self.session.can_resume() {
                None
            } else {
                if reconnecting {
                    self.set_status(Status::ReconnectQueued);
                }
                tokio::select! {
                    permit = self.connect_queue.acquire() => Some(permit),
                    _ = shutdown_requested(&mut shutdown) => {
                        self.finish(None);
                        return;
                    }
                }
            };

            self.set_status(if reconnecting {
                Status::Reconnecting
            } else {
                Status::Connecting
            });
            reconnecting = true;

            let url = self.config.connect_url();
            tracing::debug!(shard_id = self.shard_id, url = %url, "opening gateway connection");
            let connected = tokio::select! {
                result = self.connector.connect(&url) => result,
                _ = shutdown_requested(&mut shutdown) => {
                    self.finish(None);
                    return;
                }
            };

            let (sink, stream) = match connected {
                Ok(pair) => pair,
                Err(e) => {
                    drop(permit);
                    tracing::warn!(shard_id = self.shard_id, "gateway connect failed: {e}");
                    self.set_status(Status::Disconnected);
                    if !self.config.auto_reconnect {
                        self.finish(None);
                        return;
                    }
                    delay = Some(self.backoff.next_delay());
                    continue;
                }
            };

            let (outcome, identify_pending) = self.run_connection(sink, stream, permit).await;
            let close_code = match outcome {
                Outcome::Shutdown => {
                    self.finish(Some(CLOSE_NORMAL));
                    return;
                }
                Outcome::Closed { close_code } => close_code,
            };

            let fatal = close_code
                .map(CloseCode::from_code)
                .filter(|code| !code.is_reconnectable());
            if let Some(code) = fatal {
                tracing::error!(
                    shard_id = self.shard_id,
                    close_code = code.code(),
                    reason = code.description(),
                    "gateway closed with a non-recoverable code"
                );
                self.finish(close_code);
                return;
            }
            if !self.config.auto_reconnect {
                tracing::warn!(
                    shard_id = self.shard_id,
                    close_code = ?close_code,
                    "connection lost and auto reconnect is disabled"
                );
                self.finish(close_code);
                return;
            }

            delay = Some(if identify_pending {
                tracing::warn!(
                    shard_id = self.shard_id,
                    "identify was not confirmed; treating as rate limited"
                );
                self.config.identify_retry_delay()
            } else {
                self.backoff.next_delay()
            });
        }
    }

    async fn run_connection(
        &mut self,
        sink: WsSink,
        mut stream: WsStream,
        permit: Option<ConnectPermit>,
    ) -> (Outcome, bool) {
        let (control, control_rx) = mpsc::unbounded_channel();
        let sender = tokio::spawn(run_sender(
            sink,
            control_rx,
            self.outbound.clone(),
            self.shard_id,
        ));
        let mut conn = Connection {
            control,
            permit,
            heartbeat: None,
            zombie: Arc::new(Notify::new()),
            awaiting_hello: false,
            identify_pending: false,
        };
        let zombie = conn.zombie.clone();
        let mut shutdown = self.shutdown.clone();
        let mut decoder = FrameDecoder::new();

        self.dispatcher.begin_connection();
        self.set_status(Status::Identifying);

        match self.session.session_id.clone() {
            Some(session_id) => {
                let resume = Resume {
                    token: self.config.token.clone(),
                    session_id,
                    seq: self.session.sequence.get(),
                };
                match GatewayMessage::command(OpCode::Resume, &resume) {
                    Ok(message) => {
                        tracing::info!(
                            shard_id = self.shard_id,
                            session_id = %resume.session_id,
                            seq = ?resume.seq,
                            "resuming session"
                        );
                        conn.send(&message);
                    }
                    Err(e) => tracing::warn!("failed to encode RESUME: {e}"),
                }
                self.set_status(Status::AwaitingConfirmation);
            }
            None => conn.awaiting_hello = true,
        }

        let outcome = loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => match decoder.decode_text(text.as_str()) {
                        Ok(payload) => {
                            if let Some(outcome) = self.handle_payload(payload, &mut conn) {
                                break outcome;
                            }
                        }
                        Err(e) => tracing::debug!(shard_id = self.shard_id, "dropping gateway frame: {e}"),
                    },
                    Some(Ok(Message::Binary(bytes))) => match decoder.push_binary(&bytes) {
                        Ok(Some(payload)) => {
                            if let Some(outcome) = self.handle_payload(payload, &mut conn) {
                                break outcome;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!(shard_id = self.shard_id, "dropping compressed gateway frame: {e}"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let close_code = frame.as_ref().map(|frame| u16::from(frame.code));
                        tracing::info!(
                            shard_id = self.shard_id,
                            close_code = ?close_code,
                            reason = frame.as_ref().map(|frame| frame.reason.as_str()).unwrap_or(""),
                            "gateway closed the connection"
                        );
                        break Outcome::Closed { close_code };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(shard_id = self.shard_id, "gateway receive error: {e}");
                        break Outcome::Closed { close_code: None };
                    }
                    None => break Outcome::Closed { close_code: None },
                },
                _ = zombie.notified() => {
                    conn.close(CLOSE_RECONNECT, "heartbeat not acknowledged");
                    break Outcome::Closed { close_code: Some(CLOSE_RECONNECT) };
                }
                _ = shutdown_requested(&mut shutdown) => {
                    conn.close(CLOSE_NORMAL, "shutdown");
                    break Outcome::Shutdown;
                }
            }
        };

        if let Some(heartbeat) = conn.heartbeat.take() {
            heartbeat.abort();
        }
        self.monitor.reset();
        let identify_pending = conn.identify_pending;
        drop(conn);
        if tokio::time::timeout(SENDER_DRAIN, sender).await.is_err() {
            tracing::debug!(shard_id = self.shard_id, "gateway writer did not finish in time");
        }

        self.outbound.set_authorized(false);
        if let Outcome::Closed { close_code } = outcome {
            self.set_status(Status::Disconnected);
            self.events.publish(GatewayEvent::Disconnected { close_code });
        }
        (outcome, identify_pending)
    }

    /// Returns an outcome when the payload ends the connection.
    fn handle_payload(&mut self, payload: GatewayMessage, conn: &mut Connection) -> Option<Outcome> {
        if let Some(seq) = payload.s {
            if !self.session.sequence.advance(seq) {
                tracing::debug!(
                    shard_id = self.shard_id,
                    seq,
                    current = ?self.session.sequence.get(),
                    "sequence behind cursor; cursor kept"
                );
            }
        }

        match payload.op {
            OpCode::Dispatch => {
                let cursor = self.session.sequence.get().unwrap_or(0);
                for effect in self.dispatcher.handle(payload, cursor) {
                    self.apply(effect, conn);
                }
                None
            }
            OpCode::Heartbeat => {
                send_heartbeat(&conn.control, &self.session.sequence, &self.monitor);
                None
            }
            OpCode::Reconnect => {
                tracing::info!(shard_id = self.shard_id, "gateway requested reconnect");
                conn.close(CLOSE_RECONNECT, "OP 7: RECONNECT");
                Some(Outcome::Closed {
                    close_code: Some(CLOSE_RECONNECT),
                })
            }
            OpCode::InvalidSession => {
                let resumable = payload.d.as_ref().and_then(Value::as_bool).unwrap_or(false);
                if resumable {
                    tracing::info!(shard_id = self.shard_id, "session invalidated; resumable");
                    conn.close(CLOSE_RECONNECT, "OP 9: INVALID_SESSION");
                    Some(Outcome::Closed {
                        close_code: Some(CLOSE_RECONNECT),
                    })
                } else {
                    tracing::info!(shard_id = self.shard_id, "session invalidated; identifying again");
                    self.invalidate();
                    conn.close(CLOSE_NORMAL, "OP 9: INVALID_SESSION");
                    Some(Outcome::Closed {
                        close_code: Some(CLOSE_NORMAL),
                    })
                }
            }
            OpCode::Hello => {
                self.on_hello(&payload, conn);
                None
            }
            OpCode::HeartbeatAck => {
                if let Some(rtt) = self.monitor.acknowledge(Instant::now()) {
                    tracing::debug!(
                        shard_id = self.shard_id,
                        latency_ms = rtt.as_millis() as u64,
                        "heartbeat acknowledged"
                    );
                }
                None
            }
            other => {
                tracing::debug!(shard_id = self.shard_id, op = u8::from(other), "ignoring gateway opcode");
                None
            }
        }
    }

    fn on_hello(&mut self, payload: &GatewayMessage, conn: &mut Connection) {
        let hello = match payload.body::<Hello>() {
            Ok(hello) => hello,
            Err(e) => {
                tracing::warn!(shard_id = self.shard_id, "unexpected HELLO body: {e}");
                return;
            }
        };
        if !hello.trace.is_empty() {
            tracing::debug!(shard_id = self.shard_id, trace = ?hello.trace, "hello");
        }

        if hello.heartbeat_interval == 0 {
            tracing::warn!(shard_id = self.shard_id, "HELLO without heartbeat interval");
        } else {
            let heartbeat = spawn_heartbeat(
                Duration::from_millis(hello.heartbeat_interval),
                self.session.sequence.clone(),
                self.monitor.clone(),
                conn.control.clone(),
                self.config.strict_heartbeat_acks,
                conn.zombie.clone(),
            );
            if let Some(previous) = conn.heartbeat.replace(heartbeat) {
                previous.abort();
            }
        }

        if !conn.awaiting_hello {
            return;
        }
        conn.awaiting_hello = false;

        let identify = Identify {
            token: self.config.token.clone(),
            properties: IdentifyProperties::default(),
            compress: self.config.compress,
            large_threshold: self.config.large_threshold,
            shard: self.config.shard.map(|shard| [shard.id, shard.total]),
            presence: None,
        };
        match GatewayMessage::command(OpCode::Identify, &identify) {
            Ok(message) => {
                tracing::info!(shard_id = self.shard_id, "identifying");
                conn.send(&message);
                conn.identify_pending = true;
                self.outbound.set_authorized(true);
                self.set_status(Status::AwaitingConfirmation);
            }
            Err(e) => tracing::warn!("failed to encode IDENTIFY: {e}"),
        }
        // Release the connect queue once IDENTIFY is on its way.
        conn.permit.take();
    }

    fn apply(&mut self, effect: Effect, conn: &mut Connection) {
        match effect {
            Effect::Deliver(event) => self.events.dispatch(event),
            Effect::SessionStarted { session_id } => {
                conn.identify_pending = false;
                self.backoff.reset();
                self.session.session_id = Some(session_id.clone());
                match self.session_id.write() {
                    Ok(mut guard) => *guard = Some(session_id),
                    Err(poisoned) => *poisoned.into_inner() = Some(session_id),
                }
                self.set_status(Status::Connected { initiating: true });
            }
            Effect::Authorized => {
                self.backoff.reset();
                self.outbound.set_authorized(true);
                self.set_status(Status::Connected { initiating: true });
            }
            Effect::Request(message) => match serde_json::to_string(&message) {
                Ok(payload) => self.outbound.push(QueueClass::ChunkSync, payload),
                Err(e) => tracing::warn!("failed to encode bootstrap request: {e}"),
            },
            Effect::BootstrapComplete(completion) => {
                tracing::info!(
                    shard_id = self.shard_id,
                    completion = ?completion,
                    "session ready"
                );
                self.set_status(Status::Connected { initiating: false });
                self.events.publish(match completion {
                    Completion::Ready => GatewayEvent::Ready,
                    Completion::Reconnected => GatewayEvent::Reconnected,
                    Completion::Resumed => GatewayEvent::Resumed,
                });
            }
        }
    }

    fn invalidate(&mut self) {
        self.session.invalidate();
        match self.session_id.write() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
        self.dispatcher.invalidate();
        let dropped = self.outbound.clear_chunk_sync();
        if dropped > 0 {
            tracing::debug!(shard_id = self.shard_id, dropped, "dropped pending bootstrap requests");
        }
    }

    fn set_status(&self, new: Status) {
        publish_status(&self.status, &self.events, new);
    }

    fn finish(&mut self, close_code: Option<u16>) {
        tracing::info!(shard_id = self.shard_id, close_code = ?close_code, "shard shut down");
        self.set_status(Status::Shutdown);
        self.events.publish(GatewayEvent::Shutdown { close_code });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strand_models::gateway::VoiceStateUpdate;

    #[test]
    fn commands_encode_with_their_opcode() {
        let message = GatewayCommand::VoiceStateUpdate(VoiceStateUpdate::disconnect(7))
            .into_message()
            .unwrap();
        assert_eq!(message.op, OpCode::VoiceStateUpdate);
        assert_eq!(message.d.unwrap()["channel_id"], Value::Null);

        let raw = GatewayMessage::command(OpCode::Other(42), &json!({})).unwrap();
        assert_eq!(GatewayCommand::Raw(raw.clone()).into_message().unwrap(), raw);
    }

    #[tokio::test]
    async fn shutdown_before_start_is_terminal() {
        let shard = Shard::new(GatewayConfig::new("token"));
        let mut events = shard.events();
        shard.shutdown().await;
        shard.shutdown().await;

        assert_eq!(shard.status(), Status::Shutdown);
        assert!(matches!(shard.start(), Err(GatewayError::ShutDown)));
        assert!(matches!(
            shard.update_voice_state(VoiceStateUpdate::disconnect(1)),
            Err(GatewayError::ShutDown)
        ));
        assert_eq!(
            events.next().await,
            Some(GatewayEvent::StatusChanged {
                old: Status::Disconnected,
                new: Status::Shutdown
            })
        );
        assert_eq!(events.next().await, Some(GatewayEvent::Shutdown { close_code: None }));
    }

    #[tokio::test]
    async fn invalid_shard_config_is_rejected_on_start() {
        let mut config = GatewayConfig::new("token");
        config.shard = Some(crate::config::ShardInfo { id: 2, total: 2 });
        let shard = Shard::new(config);
        assert!(matches!(shard.start(), Err(GatewayError::Config(_))));
    }
}
