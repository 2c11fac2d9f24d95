use crate::core::errors::ConnectivityError;
use crate::core::kernel::codec::WsCodec;
use crate::core::types::TransportKind;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{instrument, warn};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// WebSocket configuration
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Interval between application-level pings in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Outbound frames allowed per second
    pub max_frames_per_second: u32,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            max_frames_per_second: 50,
        }
    }
}

impl WsConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// WebSocket session trait - pure transport layer
#[async_trait]
pub trait WsSession<C: WsCodec>: Send + Sync {
    /// Connect to the WebSocket
    async fn connect(&mut self) -> Result<(), ConnectivityError>;

    /// Send a raw message
    async fn send_raw(&mut self, msg: Message) -> Result<(), ConnectivityError>;

    /// Receive the next raw message
    async fn next_raw(&mut self) -> Option<Result<Message, ConnectivityError>>;

    /// Close the connection
    async fn close(&mut self) -> Result<(), ConnectivityError>;

    /// Check if the connection is alive
    fn is_connected(&self) -> bool;

    /// Encode and send a request envelope using the codec
    async fn send_request(
        &mut self,
        method: &str,
        params: &Value,
        req_id: u64,
    ) -> Result<(), ConnectivityError>;

    /// Get the next decoded message
    async fn next_message(&mut self) -> Option<Result<C::Message, ConnectivityError>>;
}

/// Connection statistics
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connection_count: u32,
    pub last_message_at: Option<Instant>,
}

/// Tungstenite-based WebSocket implementation
pub struct TungsteniteWs<C: WsCodec> {
    url: String,
    write: Option<futures_util::stream::SplitSink<WsStream, Message>>,
    read: Option<futures_util::stream::SplitStream<WsStream>>,
    connected: bool,
    exchange_name: String,
    codec: C,
    config: WsConfig,
    connection_stats: ConnectionStats,
}

impl<C: WsCodec> TungsteniteWs<C> {
    /// Create a new WebSocket session with the specified codec
    ///
    /// # Arguments
    /// * `url` - The WebSocket URL to connect to
    /// * `exchange_name` - Name of the exchange for logging/tracing
    /// * `codec` - The codec to handle message encoding/decoding
    pub fn new(url: String, exchange_name: String, codec: C) -> Self {
        Self {
            url,
            write: None,
            read: None,
            connected: false,
            exchange_name,
            codec,
            config: WsConfig::default(),
            connection_stats: ConnectionStats::default(),
        }
    }

    pub fn with_config(mut self, config: WsConfig) -> Self {
        self.config = config;
        self
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.connection_stats
    }

    fn not_connected(context: &str) -> ConnectivityError {
        ConnectivityError::unavailable(
            TransportKind::Stream,
            format!("WebSocket not connected ({})", context),
        )
    }

    fn record_received(&mut self, message: &Message) {
        self.connection_stats.messages_received += 1;
        self.connection_stats.bytes_received += message.len() as u64;
        self.connection_stats.last_message_at = Some(Instant::now());
    }
}

#[async_trait]
impl<C: WsCodec> WsSession<C> for TungsteniteWs<C> {
    #[instrument(skip(self), fields(exchange = %self.exchange_name, url = %self.url))]
    async fn connect(&mut self) -> Result<(), ConnectivityError> {
        let started = Instant::now();
        let (ws_stream, _) = tokio::time::timeout(self.config.connect_timeout(), connect_async(&self.url))
            .await
            .map_err(|_| ConnectivityError::Timeout {
                transport: TransportKind::Stream,
                elapsed_ms: started.elapsed().as_millis() as u64,
            })?
            .map_err(|e| {
                ConnectivityError::unavailable(
                    TransportKind::Stream,
                    format!("WebSocket connection failed: {}", e),
                )
            })?;

        let (write, read) = ws_stream.split();
        self.write = Some(write);
        self.read = Some(read);
        self.connected = true;

        self.connection_stats.connection_count += 1;
        self.connection_stats.last_message_at = Some(Instant::now());

        Ok(())
    }

    #[instrument(skip(self, msg), fields(exchange = %self.exchange_name))]
    async fn send_raw(&mut self, msg: Message) -> Result<(), ConnectivityError> {
        if !self.connected {
            return Err(Self::not_connected("send"));
        }

        let write = self
            .write
            .as_mut()
            .ok_or_else(|| Self::not_connected("write half missing"))?;

        let len = msg.len() as u64;
        if let Err(e) = write.send(msg).await {
            self.connected = false;
            return Err(ConnectivityError::unavailable(
                TransportKind::Stream,
                format!("Failed to send WebSocket message: {}", e),
            ));
        }

        self.connection_stats.messages_sent += 1;
        self.connection_stats.bytes_sent += len;
        Ok(())
    }

    async fn next_raw(&mut self) -> Option<Result<Message, ConnectivityError>> {
        loop {
            if !self.connected {
                return Some(Err(Self::not_connected("receive")));
            }

            let read = self.read.as_mut()?;

            match read.next().await {
                Some(Ok(message)) => {
                    self.record_received(&message);
                    match message {
                        Message::Close(_) => {
                            self.connected = false;
                            return Some(Ok(message));
                        }
                        Message::Ping(data) => {
                            // Answer pings at the transport level
                            if let Err(e) = self.send_raw(Message::Pong(data)).await {
                                warn!("Failed to send pong response: {}", e);
                            }
                        }
                        Message::Pong(_) => {}
                        other => return Some(Ok(other)),
                    }
                }
                Some(Err(e)) => {
                    self.connected = false;
                    return Some(Err(ConnectivityError::unavailable(
                        TransportKind::Stream,
                        format!("WebSocket error: {}", e),
                    )));
                }
                None => {
                    self.connected = false;
                    return None;
                }
            }
        }
    }

    #[instrument(skip(self), fields(exchange = %self.exchange_name))]
    async fn close(&mut self) -> Result<(), ConnectivityError> {
        if let Some(write) = self.write.as_mut() {
            let _ = write.send(Message::Close(None)).await;
        }
        self.connected = false;
        self.write = None;
        self.read = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    #[instrument(skip(self, params), fields(exchange = %self.exchange_name, method = %method, req_id = req_id))]
    async fn send_request(
        &mut self,
        method: &str,
        params: &Value,
        req_id: u64,
    ) -> Result<(), ConnectivityError> {
        let message = self.codec.encode_request(method, params, req_id)?;
        self.send_raw(message).await
    }

    async fn next_message(&mut self) -> Option<Result<C::Message, ConnectivityError>> {
        loop {
            match self.next_raw().await {
                Some(Ok(Message::Close(_))) => return None,
                Some(Ok(raw_msg)) => match self.codec.decode_message(raw_msg) {
                    Ok(Some(decoded)) => return Some(Ok(decoded)),
                    Ok(None) => {}
                    Err(e) => return Some(Err(e)),
                },
                Some(Err(e)) => return Some(Err(e)),
                None => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::kernel::codec::EnvelopeCodec;

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let mut ws = TungsteniteWs::new(
            "ws://127.0.0.1:9".to_string(),
            "test".to_string(),
            EnvelopeCodec::new(),
        );
        assert!(!ws.is_connected());
        let err = ws
            .send_request("ping", &Value::Null, 1)
            .await
            .unwrap_err();
        assert!(err.allows_fallback());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let mut ws = TungsteniteWs::new(
            "ws://127.0.0.1:9".to_string(),
            "test".to_string(),
            EnvelopeCodec::new(),
        )
        .with_config(WsConfig {
            connect_timeout_ms: 500,
            ..WsConfig::default()
        });
        assert!(ws.connect().await.is_err());
        assert_eq!(ws.stats().connection_count, 0);
    }
}
