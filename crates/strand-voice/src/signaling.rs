// Voice signaling session: identify/resume, heartbeats, UDP discovery and
// key exchange, participant announcements.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use strand_gateway::transport::{WsSink, WsStream};
use strand_gateway::{Connector, ReconnectBackoff};
use strand_models::Snowflake;
use strand_models::voice::{
    ClientDisconnect, SelectProtocol, SelectProtocolData, SessionDescription, Speaking,
    VoiceHello, VoiceIdentify, VoiceMessage, VoiceReady, VoiceResume,
    VOICE_OP_CLIENT_DISCONNECT, VOICE_OP_HEARTBEAT, VOICE_OP_HEARTBEAT_ACK, VOICE_OP_HELLO,
    VOICE_OP_IDENTIFY, VOICE_OP_READY, VOICE_OP_RESUME, VOICE_OP_RESUMED,
    VOICE_OP_SELECT_PROTOCOL, VOICE_OP_SESSION_DESCRIPTION, VOICE_OP_SPEAKING,
};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::connection::{CloseReason, TransportReady, VoiceRelay};
use crate::crypto::PacketCipher;
use crate::error::VoiceError;
use crate::packet::{IpDiscovery, DISCOVERY_PACKET_SIZE};
use crate::session::VoiceSessionInfo;

const CLOSE_NORMAL: u16 = 1000;
const VOICE_PROTOCOL: &str = "udp";

/// Close codes after which the voice session cannot continue.
pub fn fatal_close(code: u16) -> Option<CloseReason> {
    match code {
        // Authentication failed, session no longer valid.
        4004 | 4006 => Some(CloseReason::SessionInvalid),
        // Voice server gone, or kicked / channel deleted.
        4011 | 4014 => Some(CloseReason::Disconnected),
        _ => None,
    }
}

enum Outcome {
    Closed { close_code: Option<u16> },
    Shutdown,
}

/// The UDP side negotiated after READY, waiting for its key.
struct PendingTransport {
    socket: Arc<UdpSocket>,
    server: SocketAddr,
}

pub(crate) struct VoiceSignaling {
    relay: VoiceRelay,
    info: VoiceSessionInfo,
    connector: Arc<dyn Connector>,
    backoff: ReconnectBackoff,
    mode: String,
    discovery_timeout: Duration,
    pending: Option<PendingTransport>,
    /// Set once a session description arrived; later connections resume.
    established: bool,
    heartbeat_sent: Option<(u64, Instant)>,
}

impl VoiceSignaling {
    pub(crate) fn new(relay: VoiceRelay, info: VoiceSessionInfo, connector: Arc<dyn Connector>) -> Self {
        let config = relay.config();
        let backoff = ReconnectBackoff::new(config.max_reconnect_delay());
        let mode = config.encryption_mode.clone();
        let discovery_timeout = config.connect_timeout();
        Self {
            relay,
            info,
            connector,
            backoff,
            mode,
            discovery_timeout,
            pending: None,
            established: false,
            heartbeat_sent: None,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut shutdown = self.relay.subscribe_shutdown();
        let url = self.info.gateway_url();

        loop {
            if *shutdown.borrow() {
                break;
            }
            let connected = tokio::select! {
                connected = self.connector.connect(&url) => connected,
                _ = shutdown_requested(&mut shutdown) => break,
            };
            let outcome = match connected {
                Ok((sink, stream)) => self.run_connection(sink, stream, &mut shutdown).await,
                Err(e) => {
                    tracing::warn!(guild_id = self.info.guild_id, "voice signaling connect failed: {e}");
                    Outcome::Closed { close_code: None }
                }
            };

            let close_code = match outcome {
                Outcome::Shutdown => break,
                Outcome::Closed { close_code } => close_code,
            };
            if let Some(reason) = close_code.and_then(fatal_close) {
                tracing::error!(
                    guild_id = self.info.guild_id,
                    close_code = ?close_code,
                    "voice session ended by server"
                );
                self.relay.shutdown(reason);
                break;
            }

            let delay = self.backoff.next_delay();
            tracing::info!(
                guild_id = self.info.guild_id,
                close_code = ?close_code,
                delay_ms = delay.as_millis() as u64,
                "voice signaling reconnecting"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
        tracing::debug!(guild_id = self.info.guild_id, "voice signaling stopped");
    }

    async fn run_connection(
        &mut self,
        mut sink: WsSink,
        mut stream: WsStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Outcome {
        let mut heartbeat: Option<Interval> = None;
        self.heartbeat_sent = None;

        let opened = if self.established {
            tracing::info!(guild_id = self.info.guild_id, "resuming voice session");
            let resume = VoiceResume {
                server_id: self.info.guild_id,
                session_id: self.info.session_id.clone(),
                token: self.info.token.clone(),
            };
            send(&mut sink, VOICE_OP_RESUME, &resume).await
        } else {
            let identify = VoiceIdentify {
                server_id: self.info.guild_id,
                user_id: self.info.user_id,
                session_id: self.info.session_id.clone(),
                token: self.info.token.clone(),
            };
            send(&mut sink, VOICE_OP_IDENTIFY, &identify).await
        };
        if let Err(e) = opened {
            tracing::warn!(guild_id = self.info.guild_id, "voice handshake send failed: {e}");
            return Outcome::Closed { close_code: None };
        }

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let message = match serde_json::from_str::<VoiceMessage>(text.as_str()) {
                            Ok(message) => message,
                            Err(e) => {
                                tracing::debug!(guild_id = self.info.guild_id, "dropping voice frame: {e}");
                                continue;
                            }
                        };
                        // READY runs ip discovery; shutdown must not wait for it.
                        let handled = tokio::select! {
                            handled = self.handle_message(message, &mut sink, &mut heartbeat) => handled,
                            _ = shutdown_requested(shutdown) => {
                                close_normal(&mut sink, self.info.guild_id).await;
                                return Outcome::Shutdown;
                            }
                        };
                        if let Err(e) = handled {
                            tracing::warn!(guild_id = self.info.guild_id, "voice signaling failed: {e}");
                            let _ = sink.close().await;
                            return Outcome::Closed { close_code: None };
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let close_code = frame.as_ref().map(|frame| u16::from(frame.code));
                        tracing::info!(
                            guild_id = self.info.guild_id,
                            close_code = ?close_code,
                            "voice server closed the connection"
                        );
                        return Outcome::Closed { close_code };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(guild_id = self.info.guild_id, "voice receive error: {e}");
                        return Outcome::Closed { close_code: None };
                    }
                    None => return Outcome::Closed { close_code: None },
                },
                _ = next_tick(&mut heartbeat) => {
                    let nonce: u64 = rand::random();
                    if let Err(e) = send(&mut sink, VOICE_OP_HEARTBEAT, &nonce).await {
                        tracing::debug!(guild_id = self.info.guild_id, "voice heartbeat send failed: {e}");
                        return Outcome::Closed { close_code: None };
                    }
                    self.heartbeat_sent = Some((nonce, Instant::now()));
                }
                _ = shutdown_requested(shutdown) => {
                    close_normal(&mut sink, self.info.guild_id).await;
                    return Outcome::Shutdown;
                }
            }
        }
    }

    async fn handle_message(
        &mut self,
        message: VoiceMessage,
        sink: &mut WsSink,
        heartbeat: &mut Option<Interval>,
    ) -> Result<(), VoiceError> {
        match message.op {
            VOICE_OP_HELLO => {
                let hello: VoiceHello = message.body()?;
                let period = Duration::from_millis(hello.heartbeat_interval.max(1.0) as u64);
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                *heartbeat = Some(interval);
                tracing::debug!(
                    guild_id = self.info.guild_id,
                    heartbeat_ms = period.as_millis() as u64,
                    "voice hello"
                );
            }
            VOICE_OP_READY => {
                let ready: VoiceReady = message.body()?;
                self.on_ready(ready, sink).await?;
            }
            VOICE_OP_SESSION_DESCRIPTION => {
                let description: SessionDescription = message.body()?;
                self.on_session_description(description)?;
            }
            VOICE_OP_RESUMED => {
                self.backoff.reset();
                tracing::info!(guild_id = self.info.guild_id, "voice session resumed");
            }
            VOICE_OP_SPEAKING => {
                let speaking: Speaking = message.body()?;
                match speaking.user_id {
                    Some(user_id) => self.relay.bind_ssrc(speaking.ssrc, user_id),
                    None => tracing::debug!(ssrc = speaking.ssrc, "speaking without a user id"),
                }
            }
            VOICE_OP_CLIENT_DISCONNECT => {
                let disconnect: ClientDisconnect = message.body()?;
                tracing::debug!(user_id = disconnect.user_id, "participant left voice");
                self.relay.forget_user(disconnect.user_id);
            }
            VOICE_OP_HEARTBEAT_ACK => {
                let acked = message.d.as_u64();
                match self.heartbeat_sent.take() {
                    Some((nonce, sent)) if acked == Some(nonce) => {
                        tracing::debug!(
                            guild_id = self.info.guild_id,
                            latency_ms = sent.elapsed().as_millis() as u64,
                            "voice heartbeat acknowledged"
                        );
                    }
                    other => {
                        tracing::debug!(acked = ?acked, "unexpected voice heartbeat ack");
                        self.heartbeat_sent = other;
                    }
                }
            }
            op => tracing::debug!(op, "ignoring voice opcode"),
        }
        Ok(())
    }

    /// Bind a socket, learn our external address and pick the protocol.
    async fn on_ready(&mut self, ready: VoiceReady, sink: &mut WsSink) -> Result<(), VoiceError> {
        if !ready.modes.is_empty() && !ready.modes.contains(&self.mode) {
            tracing::warn!(
                mode = %self.mode,
                offered = ?ready.modes,
                "voice server does not offer the configured encryption mode"
            );
        }
        let server = tokio::net::lookup_host((ready.ip.as_str(), ready.port))
            .await?
            .next()
            .ok_or(VoiceError::MissingField("voice server address"))?;
        let bind: SocketAddr = if server.is_ipv4() {
            SocketAddr::from(([0u8; 4], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        let external = tokio::time::timeout(
            self.discovery_timeout,
            discover(&socket, server, ready.ssrc),
        )
        .await
        .map_err(|_| VoiceError::DiscoveryTimeout)??;

        tracing::debug!(
            guild_id = self.info.guild_id,
            ssrc = ready.ssrc,
            address = %external.address,
            port = external.port,
            "ip discovery complete"
        );
        self.pending = Some(PendingTransport { socket, server });

        let select = SelectProtocol {
            protocol: VOICE_PROTOCOL.to_string(),
            data: SelectProtocolData {
                address: external.address,
                port: external.port,
                mode: self.mode.clone(),
            },
        };
        send(sink, VOICE_OP_SELECT_PROTOCOL, &select).await
    }

    fn on_session_description(&mut self, description: SessionDescription) -> Result<(), VoiceError> {
        if description.mode != self.mode {
            tracing::warn!(
                mode = %description.mode,
                expected = %self.mode,
                "voice server selected a different encryption mode"
            );
        }
        let cipher = Arc::new(PacketCipher::new(&description.secret_key)?);
        let Some(pending) = self.pending.as_ref() else {
            tracing::warn!(guild_id = self.info.guild_id, "session description before ip discovery");
            return Ok(());
        };
        self.relay.transport_ready(TransportReady {
            socket: pending.socket.clone(),
            server: pending.server,
            cipher,
        });
        self.established = true;
        self.backoff.reset();
        Ok(())
    }
}

async fn send<T: serde::Serialize>(sink: &mut WsSink, op: u8, body: &T) -> Result<(), VoiceError> {
    let json = serde_json::to_string(&VoiceMessage::new(op, body)?)?;
    sink.send(Message::text(json)).await?;
    Ok(())
}

async fn close_normal(sink: &mut WsSink, guild_id: Snowflake) {
    let close = Message::Close(Some(CloseFrame {
        code: WsCloseCode::from(CLOSE_NORMAL),
        reason: "shutdown".into(),
    }));
    if let Err(e) = sink.send(close).await {
        tracing::debug!(guild_id, "voice close send failed: {e}");
    }
}

/// Send discovery requests until a response for `ssrc` arrives.
async fn discover(socket: &UdpSocket, server: SocketAddr, ssrc: u32) -> Result<IpDiscovery, VoiceError> {
    socket.send_to(&IpDiscovery::request(ssrc).encode(), server).await?;
    let mut buf = [0u8; DISCOVERY_PACKET_SIZE * 2];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        if from != server {
            continue;
        }
        match IpDiscovery::decode(&buf[..len]) {
            Ok(reply) if reply.response && reply.ssrc == ssrc => return Ok(reply),
            Ok(_) => continue,
            Err(e) => tracing::debug!(ssrc, "ignoring discovery reply: {e}"),
        }
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_classification() {
        assert_eq!(fatal_close(4004), Some(CloseReason::SessionInvalid));
        assert_eq!(fatal_close(4006), Some(CloseReason::SessionInvalid));
        assert_eq!(fatal_close(4014), Some(CloseReason::Disconnected));
        assert_eq!(fatal_close(4011), Some(CloseReason::Disconnected));
        assert_eq!(fatal_close(4015), None);
        assert_eq!(fatal_close(1006), None);
    }

    #[tokio::test]
    async fn discovery_waits_for_matching_reply() {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let request = IpDiscovery::decode(&buf[..len]).unwrap();
            assert!(!request.response);
            let wrong = IpDiscovery {
                response: true,
                ssrc: request.ssrc + 1,
                address: "198.51.100.1".into(),
                port: 1,
            };
            server.send_to(&wrong.encode(), from).await.unwrap();
            let reply = IpDiscovery {
                response: true,
                ssrc: request.ssrc,
                address: "203.0.113.9".into(),
                port: from.port(),
            };
            server.send_to(&reply.encode(), from).await.unwrap();
        });

        let found = discover(&client, server_addr, 42).await.unwrap();
        assert_eq!(found.address, "203.0.113.9");
        assert_eq!(found.port, client.local_addr().unwrap().port());
        responder.await.unwrap();
    }
}
