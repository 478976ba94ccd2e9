use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashSet;
use strand_gateway::Connector;
use strand_models::Snowflake;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::VoiceConfig;
use crate::crypto::PacketCipher;
use crate::decode::AudioDecoder;
use crate::error::VoiceError;
use crate::handler::{AudioReceiveHandler, ParticipantDirectory};
use crate::jitter::JitterQueues;
use crate::mixer::{mix_tick, MIX_INTERVAL};
use crate::packet::AudioPacket;
use crate::session::VoiceSessionInfo;
use crate::signaling::VoiceSignaling;
use crate::ssrc::SsrcTable;

/// Receive buffer size; large enough for uncompressed 20 ms frames.
const MAX_DATAGRAM_SIZE: usize = 8192;
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The transport or secret key never became available.
    ConnectionTimeout,
    /// Closed by the caller.
    Requested,
    /// The voice server rejected the session.
    SessionInvalid,
    /// Removed from the channel or the voice server went away.
    Disconnected,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CloseReason::ConnectionTimeout => "connection timed out",
            CloseReason::Requested => "closed by request",
            CloseReason::SessionInvalid => "voice session invalid",
            CloseReason::Disconnected => "disconnected from voice",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    WaitingForTransportReady,
    Active,
    ShuttingDown,
    Closed(CloseReason),
}

/// A negotiated datagram path: the socket, where voice is sent, and the
/// session cipher.
#[derive(Debug, Clone)]
pub struct TransportReady {
    pub socket: Arc<UdpSocket>,
    pub server: SocketAddr,
    pub cipher: Arc<PacketCipher>,
}

/// What happened to one received datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Receipt {
    Delivered(Snowflake),
    Silence,
    UnknownSsrc(u32),
    UnknownUser(Snowflake),
    Undecodable,
}

/// Receiving side of one voice connection.
///
/// Cheap to clone; every clone drives the same relay. Decoded audio goes to
/// the handler per participant and, every 20 ms, as one mixed frame.
#[derive(Clone)]
pub struct VoiceRelay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    config: VoiceConfig,
    handler: Arc<dyn AudioReceiveHandler>,
    directory: Arc<dyn ParticipantDirectory>,
    decoder: Arc<dyn AudioDecoder>,
    ssrc: SsrcTable,
    jitter: JitterQueues,
    /// Unannounced sources already warned about.
    unknown_ssrcs: DashSet<u32>,
    transport: watch::Sender<Option<TransportReady>>,
    state: watch::Sender<RelayState>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    closing: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl VoiceRelay {
    pub fn new(
        config: VoiceConfig,
        handler: Arc<dyn AudioReceiveHandler>,
        directory: Arc<dyn ParticipantDirectory>,
        decoder: Arc<dyn AudioDecoder>,
    ) -> Self {
        let jitter = JitterQueues::new(config.jitter_staleness());
        Self {
            inner: Arc::new(RelayInner {
                config,
                handler,
                directory,
                decoder,
                ssrc: SsrcTable::new(),
                jitter,
                unknown_ssrcs: DashSet::new(),
                transport: watch::Sender::new(None),
                state: watch::Sender::new(RelayState::Idle),
                shutdown: watch::Sender::new(false),
                started: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Open the voice signaling session for `info` and wait until audio
    /// flows. Signaling keeps running, resuming on recoverable closes,
    /// until the relay shuts down.
    pub async fn connect(
        &self,
        info: VoiceSessionInfo,
        connector: Arc<dyn Connector>,
    ) -> Result<(), VoiceError> {
        self.mark_started()?;
        tracing::info!(
            guild_id = info.guild_id,
            endpoint = %info.endpoint,
            "connecting to voice"
        );
        // Signaling is not aborted on shutdown; it closes its connection itself.
        tokio::spawn(VoiceSignaling::new(self.clone(), info, connector).run());
        self.await_transport().await
    }

    /// Wait for a transport handed in through [`VoiceRelay::transport_ready`],
    /// then start packet I/O. Fails with [`CloseReason::ConnectionTimeout`]
    /// when nothing arrives within the configured timeout.
    pub async fn start(&self) -> Result<(), VoiceError> {
        self.mark_started()?;
        self.await_transport().await
    }

    /// Hand over a negotiated transport. A later call replaces the previous
    /// one for the receive loop.
    pub fn transport_ready(&self, ready: TransportReady) {
        if self.is_closing() {
            return;
        }
        tracing::debug!(server = %ready.server, "voice transport ready");
        self.inner.transport.send_replace(Some(ready));
    }

    /// Stop packet I/O, the mixer and signaling. Idempotent; only the first
    /// reason is kept.
    pub fn shutdown(&self, reason: CloseReason) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.state.send_replace(RelayState::ShuttingDown);
        self.inner.shutdown.send_replace(true);

        let tasks = {
            let mut tasks = match self.inner.tasks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            task.abort();
        }

        self.inner.transport.send_replace(None);
        self.inner.ssrc.clear();
        self.inner.jitter.clear();
        self.inner.unknown_ssrcs.clear();
        self.inner.state.send_replace(RelayState::Closed(reason));
        tracing::info!(reason = %reason, "voice relay closed");
    }

    pub fn state(&self) -> RelayState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<RelayState> {
        self.inner.state.subscribe()
    }

    pub fn ssrc_table(&self) -> &SsrcTable {
        &self.inner.ssrc
    }

    pub fn jitter(&self) -> &JitterQueues {
        &self.inner.jitter
    }

    pub fn config(&self) -> &VoiceConfig {
        &self.inner.config
    }

    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    /// A participant announced which source they send on.
    pub(crate) fn bind_ssrc(&self, ssrc: u32, user_id: Snowflake) {
        self.inner.unknown_ssrcs.remove(&ssrc);
        self.inner.ssrc.update(ssrc, user_id);
    }

    /// A participant left: forget their sources, queued audio and decoder
    /// state.
    pub(crate) fn forget_user(&self, user_id: Snowflake) {
        for ssrc in self.inner.ssrc.remove_user(user_id) {
            self.inner.decoder.forget(ssrc);
        }
        self.inner.jitter.remove(user_id);
    }

    fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    fn mark_started(&self) -> Result<(), VoiceError> {
        if self.is_closing() {
            return Err(self.closed_error());
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(VoiceError::AlreadyStarted);
        }
        Ok(())
    }

    fn closed_error(&self) -> VoiceError {
        match self.state() {
            RelayState::Closed(reason) => VoiceError::Closed(reason),
            _ => VoiceError::Closed(CloseReason::Requested),
        }
    }

    /// Spawn a task owned by the relay. Nothing is spawned once shutdown
    /// began; the check and the push happen under the same lock shutdown
    /// drains.
    fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = match self.inner.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.is_closing() {
            return;
        }
        tasks.retain(|task| !task.is_finished());
        tasks.push(tokio::spawn(future));
    }

    async fn await_transport(&self) -> Result<(), VoiceError> {
        self.inner
            .state
            .send_replace(RelayState::WaitingForTransportReady);
        let mut transport = self.inner.transport.subscribe();
        let mut shutdown = self.subscribe_shutdown();
        let timeout = self.inner.config.connect_timeout();

        let wait = async { transport.wait_for(Option::is_some).await.map(|_| ()) };
        tokio::select! {
            ready = tokio::time::timeout(timeout, wait) => match ready {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(self.closed_error()),
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        "voice transport not ready in time"
                    );
                    self.shutdown(CloseReason::ConnectionTimeout);
                    return Err(VoiceError::Closed(CloseReason::ConnectionTimeout));
                }
            },
            _ = shutdown_requested(&mut shutdown) => return Err(self.closed_error()),
        }

        self.spawn(receive_loop(self.inner.clone()));
        if self.inner.handler.can_receive_combined() {
            self.spawn(mix_loop(self.inner.clone()));
        }
        if self.is_closing() {
            return Err(self.closed_error());
        }
        self.inner.state.send_replace(RelayState::Active);
        tracing::info!("voice relay active");
        Ok(())
    }
}

impl fmt::Debug for VoiceRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceRelay")
            .field("state", &self.state())
            .field("ssrcs", &self.inner.ssrc.len())
            .finish()
    }
}

impl RelayInner {
    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    fn receive(&self, datagram: &[u8], cipher: &PacketCipher, now: Instant) -> Receipt {
        let packet = match AudioPacket::open(datagram, cipher) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(len = datagram.len(), "dropping voice datagram: {e}");
                return Receipt::Undecodable;
            }
        };
        let ssrc = packet.header.ssrc;

        let Some(user_id) = self.ssrc.user_for(ssrc) else {
            // Clients send a few silence frames before their SPEAKING arrives.
            if packet.is_silence() {
                return Receipt::Silence;
            }
            if self.unknown_ssrcs.insert(ssrc) {
                tracing::warn!(ssrc, "audio from an unannounced ssrc");
            } else {
                tracing::debug!(ssrc, "audio from an unannounced ssrc");
            }
            return Receipt::UnknownSsrc(ssrc);
        };
        if !self.directory.contains(user_id) {
            tracing::warn!(ssrc, user_id, "audio from an unknown participant");
            return Receipt::UnknownUser(user_id);
        }
        if packet.is_silence() {
            return Receipt::Silence;
        }

        let samples = match self.decoder.decode(ssrc, &packet.payload) {
            Ok(samples) => samples,
            Err(e) => {
                tracing::debug!(ssrc, user_id, "dropping undecodable audio: {e}");
                return Receipt::Undecodable;
            }
        };

        if self.handler.can_receive_user()
            && catch_unwind(AssertUnwindSafe(|| {
                self.handler.handle_user_audio(user_id, &samples)
            }))
            .is_err()
        {
            tracing::error!(user_id, "user audio handler panicked");
        }
        if self.handler.can_receive_combined() {
            self.jitter.push(user_id, samples, now);
        }
        Receipt::Delivered(user_id)
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Reads datagrams with a short timeout so shutdown is noticed promptly.
async fn receive_loop(inner: Arc<RelayInner>) {
    let mut transport = inner.transport.subscribe();
    let mut current = transport.borrow_and_update().clone();
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let read_timeout = inner.config.read_timeout();

    while !inner.is_closing() {
        if transport.has_changed().unwrap_or(false) {
            current = transport.borrow_and_update().clone();
        }
        let Some(ready) = current.clone() else {
            break;
        };
        match tokio::time::timeout(read_timeout, ready.socket.recv_from(&mut buf)).await {
            Err(_) => continue,
            Ok(Err(e)) => match read_retry_delay(&e) {
                Some(delay) => {
                    tracing::debug!("voice socket read failed: {e}");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    tracing::error!("voice socket unusable: {e}");
                    break;
                }
            },
            Ok(Ok((len, _from))) => {
                inner.receive(&buf[..len], &ready.cipher, Instant::now());
            }
        }
    }
    tracing::debug!("voice receive loop stopped");
}

/// Delay before reading again after a failed read, or `None` when the
/// socket is unusable. ICMP errors from earlier sends surface as refused or
/// reset reads and pass.
fn read_retry_delay(error: &io::Error) -> Option<Duration> {
    match error.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => Some(READ_ERROR_BACKOFF),
        _ => None,
    }
}

/// Emits one combined frame every 20 ms, silence included.
async fn mix_loop(inner: Arc<RelayInner>) {
    let mut ticker = tokio::time::interval(MIX_INTERVAL);
    loop {
        ticker.tick().await;
        if inner.is_closing() {
            break;
        }
        let audio = mix_tick(&inner.jitter, Instant::now());
        if catch_unwind(AssertUnwindSafe(|| inner.handler.handle_combined_audio(audio))).is_err() {
            tracing::error!("combined audio handler panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::decode::{encode_pcm, PcmDecoder};
    use crate::handler::Everyone;
    use crate::mixer::{CombinedAudio, FRAME_SAMPLES};
    use crate::packet::{RtpHeader, SILENCE_FRAME};

    struct Collect {
        combined: mpsc::UnboundedSender<CombinedAudio>,
        per_user: bool,
    }

    impl AudioReceiveHandler for Collect {
        fn can_receive_user(&self) -> bool {
            self.per_user
        }

        fn handle_combined_audio(&self, audio: CombinedAudio) {
            let _ = self.combined.send(audio);
        }

        fn handle_user_audio(&self, _user_id: Snowflake, _samples: &[i16]) {
            panic!("handler bug");
        }
    }

    fn relay(
        config: VoiceConfig,
        directory: Arc<dyn ParticipantDirectory>,
    ) -> (VoiceRelay, mpsc::UnboundedReceiver<CombinedAudio>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Collect {
            combined: tx,
            per_user: true,
        });
        let relay = VoiceRelay::new(config, handler, directory, Arc::new(PcmDecoder));
        (relay, rx)
    }

    fn sealed(ssrc: u32, payload: Vec<u8>, cipher: &PacketCipher) -> Vec<u8> {
        AudioPacket::new(RtpHeader::new(1, 960, ssrc), payload)
            .seal(cipher)
            .unwrap()
            .to_vec()
    }

    #[test]
    fn receive_classifies_datagrams() {
        let (relay, _rx) = relay(
            VoiceConfig::default(),
            Arc::new(|user_id: Snowflake| user_id != 66),
        );
        let cipher = PacketCipher::new(&[3u8; 32]).unwrap();
        let inner = &relay.inner;
        let now = Instant::now();

        let silence = sealed(10, SILENCE_FRAME.to_vec(), &cipher);
        assert_eq!(inner.receive(&silence, &cipher, now), Receipt::Silence);

        let audio = sealed(10, encode_pcm(&[1, 2]), &cipher);
        assert_eq!(inner.receive(&audio, &cipher, now), Receipt::UnknownSsrc(10));

        relay.bind_ssrc(11, 66);
        let stranger = sealed(11, encode_pcm(&[1, 2]), &cipher);
        assert_eq!(inner.receive(&stranger, &cipher, now), Receipt::UnknownUser(66));

        relay.bind_ssrc(10, 55);
        assert_eq!(inner.receive(&audio, &cipher, now), Receipt::Delivered(55));
        assert_eq!(relay.jitter().queued(55), 1);

        assert_eq!(inner.receive(&[0x80, 0x78, 0], &cipher, now), Receipt::Undecodable);
        assert!(relay.jitter().take_fresh(66, now).is_none());
    }

    #[test]
    fn unknown_ssrc_warns_once_until_bound() {
        let (relay, _rx) = relay(VoiceConfig::default(), Arc::new(Everyone));
        let cipher = PacketCipher::new(&[3u8; 32]).unwrap();
        let audio = sealed(12, encode_pcm(&[1, 2]), &cipher);
        let now = Instant::now();

        assert_eq!(relay.inner.receive(&audio, &cipher, now), Receipt::UnknownSsrc(12));
        assert!(relay.inner.unknown_ssrcs.contains(&12));
        assert_eq!(relay.inner.receive(&audio, &cipher, now), Receipt::UnknownSsrc(12));
        assert_eq!(relay.inner.unknown_ssrcs.len(), 1);

        relay.bind_ssrc(12, 80);
        assert!(!relay.inner.unknown_ssrcs.contains(&12));
        assert_eq!(relay.inner.receive(&audio, &cipher, now), Receipt::Delivered(80));
    }

    #[test]
    fn read_errors_back_off_or_stop() {
        for kind in [io::ErrorKind::ConnectionRefused, io::ErrorKind::ConnectionReset] {
            assert_eq!(read_retry_delay(&io::Error::from(kind)), Some(READ_ERROR_BACKOFF));
        }
        assert_eq!(read_retry_delay(&io::Error::from(io::ErrorKind::NotConnected)), None);
        assert_eq!(read_retry_delay(&io::Error::other("socket gone")), None);
    }

    #[test]
    fn leaving_participant_is_forgotten() {
        let (relay, _rx) = relay(VoiceConfig::default(), Arc::new(Everyone));
        let cipher = PacketCipher::new(&[3u8; 32]).unwrap();
        relay.bind_ssrc(10, 55);
        let audio = sealed(10, encode_pcm(&[1, 2]), &cipher);
        relay.inner.receive(&audio, &cipher, Instant::now());

        relay.forget_user(55);
        assert_eq!(relay.ssrc_table().user_for(10), None);
        assert_eq!(relay.jitter().queued(55), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_transport_times_out() {
        let config = VoiceConfig {
            connect_timeout_ms: 50,
            ..VoiceConfig::default()
        };
        let (relay, _rx) = relay(config, Arc::new(Everyone));
        let started = Instant::now();

        let result = relay.start().await;
        assert!(matches!(
            result,
            Err(VoiceError::Closed(CloseReason::ConnectionTimeout))
        ));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(relay.state(), RelayState::Closed(CloseReason::ConnectionTimeout));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (relay, _rx) = relay(VoiceConfig::default(), Arc::new(Everyone));
        relay.bind_ssrc(1, 2);
        relay.shutdown(CloseReason::Requested);
        relay.shutdown(CloseReason::Disconnected);

        assert_eq!(relay.state(), RelayState::Closed(CloseReason::Requested));
        assert!(relay.ssrc_table().is_empty());
        assert!(matches!(
            relay.start().await,
            Err(VoiceError::Closed(CloseReason::Requested))
        ));
    }

    #[tokio::test]
    async fn loopback_audio_reaches_the_mixer() {
        let (relay, mut rx) = relay(VoiceConfig::default(), Arc::new(Everyone));
        let local = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let cipher = Arc::new(PacketCipher::new(&[9u8; 32]).unwrap());

        relay.transport_ready(TransportReady {
            socket: local.clone(),
            server: remote.local_addr().unwrap(),
            cipher: cipher.clone(),
        });
        relay.start().await.unwrap();
        assert_eq!(relay.state(), RelayState::Active);
        assert!(matches!(relay.start().await, Err(VoiceError::AlreadyStarted)));

        relay.bind_ssrc(7, 70);
        let packet = sealed(7, encode_pcm(&vec![1000; FRAME_SAMPLES]), &cipher);
        remote
            .send_to(&packet, local.local_addr().unwrap())
            .await
            .unwrap();

        let mixed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let audio = rx.recv().await.unwrap();
                if !audio.is_silence() {
                    return audio;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(mixed.users, vec![70]);
        assert!(mixed.samples.iter().all(|sample| *sample == 1000));

        relay.shutdown(CloseReason::Requested);
        assert_eq!(relay.state(), RelayState::Closed(CloseReason::Requested));
    }
}
