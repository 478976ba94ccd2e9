use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::error::GatewayError;

pub type WsSink = Pin<Box<dyn Sink<Message, Error = GatewayError> + Send>>;
pub type WsStream = Pin<Box<dyn Stream<Item = Result<Message, GatewayError>> + Send>>;

/// Opens streaming connections. The shard owns both halves for the lifetime
/// of one connection and asks for a fresh pair on every reconnect.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<(WsSink, WsStream), GatewayError>;
}

/// WebSocket connector backed by tokio-tungstenite.
pub struct TungsteniteConnector {
    timeout: Duration,
}

impl TungsteniteConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TungsteniteConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<(WsSink, WsStream), GatewayError> {
        let (ws, response) =
            tokio::time::timeout(self.timeout, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|_| GatewayError::ConnectTimeout)??;

        if let Some(ray) = response.headers().get("cf-ray") {
            tracing::debug!(cf_ray = ?ray, "websocket handshake complete");
        }

        let (sink, stream) = ws.split();
        let sink: WsSink = Box::pin(sink.sink_map_err(GatewayError::from));
        let stream: WsStream = Box::pin(stream.map(|frame| frame.map_err(GatewayError::from)));
        Ok((sink, stream))
    }
}

/// In-memory transport for driving a shard without a network.
pub mod memory {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use serde_json::Value;
    use tokio::sync::mpsc;

    use super::*;

    enum Pending {
        Accept(WsSink, WsStream),
        Refuse,
    }

    /// Hands out pre-registered connections in order. When nothing is
    /// registered, the attempt fails like an unreachable endpoint.
    #[derive(Default)]
    pub struct MemoryConnector {
        pending: Mutex<VecDeque<Pending>>,
        attempts: AtomicUsize,
        urls: Mutex<Vec<String>>,
    }

    /// Server side of an in-memory connection.
    pub struct ServerEnd {
        from_client: mpsc::UnboundedReceiver<Message>,
        to_client: mpsc::UnboundedSender<Result<Message, GatewayError>>,
    }

    impl MemoryConnector {
        pub fn new() -> Self {
            Self::default()
        }

        /// Register the next connection and return its server side.
        pub fn accept(&self) -> ServerEnd {
            let (client_tx, from_client) = mpsc::unbounded_channel::<Message>();
            let (to_client, client_rx) = mpsc::unbounded_channel();

            let sink = futures_util::sink::unfold(client_tx, |tx, frame: Message| async move {
                tx.send(frame).map_err(|_| GatewayError::Closed)?;
                Ok::<_, GatewayError>(tx)
            });
            let stream = futures_util::stream::unfold(client_rx, |mut rx| async move {
                rx.recv().await.map(|frame| (frame, rx))
            });

            self.lock_pending()
                .push_back(Pending::Accept(Box::pin(sink), Box::pin(stream)));
            ServerEnd { from_client, to_client }
        }

        /// Make the next attempt fail.
        pub fn refuse(&self) {
            self.lock_pending().push_back(Pending::Refuse);
        }

        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        pub fn urls(&self) -> Vec<String> {
            match self.urls.lock() {
                Ok(urls) => urls.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            }
        }

        fn lock_pending(&self) -> std::sync::MutexGuard<'_, VecDeque<Pending>> {
            match self.pending.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            }
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, url: &str) -> Result<(WsSink, WsStream), GatewayError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match self.urls.lock() {
                Ok(mut urls) => urls.push(url.to_string()),
                Err(poisoned) => poisoned.into_inner().push(url.to_string()),
            }
            match self.lock_pending().pop_front() {
                Some(Pending::Accept(sink, stream)) => Ok((sink, stream)),
                Some(Pending::Refuse) | None => Err(GatewayError::Closed),
            }
        }
    }

    impl ServerEnd {
        pub fn send_json(&self, value: Value) -> bool {
            self.to_client
                .send(Ok(Message::text(value.to_string())))
                .is_ok()
        }

        pub fn send_binary(&self, bytes: Vec<u8>) -> bool {
            self.to_client.send(Ok(Message::binary(bytes))).is_ok()
        }

        /// Close from the server side with the given code.
        pub fn close(&self, code: u16) -> bool {
            use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
            use tokio_tungstenite::tungstenite::protocol::CloseFrame;
            self.to_client
                .send(Ok(Message::Close(Some(CloseFrame {
                    code: CloseCode::from(code),
                    reason: String::new().into(),
                }))))
                .is_ok()
        }

        /// Next frame the client wrote, `None` once the client hung up.
        pub async fn recv(&mut self) -> Option<Message> {
            self.from_client.recv().await
        }

        /// Next text frame decoded as JSON, skipping anything else.
        pub async fn recv_json(&mut self) -> Option<Value> {
            loop {
                match self.recv().await? {
                    Message::Text(text) => {
                        if let Ok(value) = serde_json::from_str(text.as_str()) {
                            return Some(value);
                        }
                    }
                    _ => continue,
                }
            }
        }

        /// Next JSON payload with the given opcode.
        pub async fn recv_op(&mut self, op: u64) -> Option<Value> {
            loop {
                let value = self.recv_json().await?;
                if value["op"].as_u64() == Some(op) {
                    return Some(value);
                }
            }
        }
    }
}
