use crate::core::errors::ConnectivityError;
use crate::core::types::TransportKind;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

/// Codec trait for converting between raw WebSocket frames and typed messages
pub trait WsCodec: Send + Sync + 'static {
    /// The type representing parsed messages
    type Message: Send + Sync;

    /// Encode a request envelope
    ///
    /// # Arguments
    /// * `method` - Remote method name (`subscribe`, `add_order`, ...)
    /// * `params` - Method parameters
    /// * `req_id` - Correlation id echoed back in the response
    fn encode_request(&self, method: &str, params: &Value, req_id: u64)
        -> Result<Message, ConnectivityError>;

    /// Decode a raw WebSocket message into a typed message
    ///
    /// Control frames (ping, pong, close) are handled at the transport level.
    ///
    /// # Returns
    /// - `Ok(Some(message))` - Successfully decoded message
    /// - `Ok(None)` - Message was ignored/filtered by codec
    /// - `Err(error)` - Failed to decode message
    fn decode_message(&self, message: Message) -> Result<Option<Self::Message>, ConnectivityError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceInfo {
    pub provided: Option<i64>,
    pub expected_minimum: Option<i64>,
}

/// Error details carried by responses and error pushes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamErrorInfo {
    pub code: Option<String>,
    pub message: String,
    pub nonce_info: Option<NonceInfo>,
}

impl StreamErrorInfo {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::String(message) => Self {
                code: None,
                message: message.clone(),
                nonce_info: None,
            },
            Value::Object(map) => {
                let code = map.get("code").map(|code| match code {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
                let message = map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string();
                let nonce_info = map
                    .get("details")
                    .and_then(|details| details.get("nonce_info"))
                    .and_then(|info| serde_json::from_value(info.clone()).ok());
                Self {
                    code,
                    message,
                    nonce_info,
                }
            }
            other => Self {
                code: None,
                message: other.to_string(),
                nonce_info: None,
            },
        }
    }

    /// Map onto the error taxonomy; nonce details always mean a nonce conflict
    pub fn into_error(self, connection_id: &str) -> ConnectivityError {
        if let Some(info) = self.nonce_info {
            return ConnectivityError::NonceConflict {
                connection_id: connection_id.to_string(),
                provided: info.provided,
                expected_minimum: info.expected_minimum,
            };
        }
        ConnectivityError::from_exchange_message(&self.message, TransportKind::Stream, connection_id)
    }
}

/// Decoded streaming-channel message
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// Reply to a request we sent
    Response {
        method: String,
        req_id: Option<u64>,
        success: bool,
        result: Value,
        error: Option<StreamErrorInfo>,
    },
    /// Pushed update `{channel, type, data}`
    Push {
        channel: String,
        kind: String,
        data: Value,
    },
    /// Unsolicited error push
    Error {
        req_id: Option<u64>,
        info: StreamErrorInfo,
    },
    Heartbeat,
}

/// JSON envelope codec: `{method, params, req_id}` out, `{channel, type, data}` in
#[derive(Debug, Clone, Default)]
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self
    }

    fn decode_value(value: Value) -> Option<StreamMessage> {
        let req_id = value.get("req_id").and_then(Value::as_u64);

        if let Some(method) = value.get("method").and_then(Value::as_str) {
            if method == "heartbeat" {
                return Some(StreamMessage::Heartbeat);
            }
            let success = value
                .get("success")
                .and_then(Value::as_bool)
                .unwrap_or_else(|| value.get("error").is_none());
            return Some(StreamMessage::Response {
                method: method.to_string(),
                req_id,
                success,
                result: value.get("result").cloned().unwrap_or(Value::Null),
                error: value.get("error").map(StreamErrorInfo::from_value),
            });
        }

        if let Some(channel) = value.get("channel").and_then(Value::as_str) {
            if channel == "heartbeat" || channel == "status" {
                return Some(StreamMessage::Heartbeat);
            }
            return Some(StreamMessage::Push {
                channel: channel.to_string(),
                kind: value
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("update")
                    .to_string(),
                data: value.get("data").cloned().unwrap_or(Value::Null),
            });
        }

        value.get("error").map(|error| StreamMessage::Error {
            req_id,
            info: StreamErrorInfo::from_value(error),
        })
    }
}

impl WsCodec for EnvelopeCodec {
    type Message = StreamMessage;

    fn encode_request(
        &self,
        method: &str,
        params: &Value,
        req_id: u64,
    ) -> Result<Message, ConnectivityError> {
        let envelope = if params.is_null() {
            json!({ "method": method, "req_id": req_id })
        } else {
            json!({ "method": method, "params": params, "req_id": req_id })
        };
        Ok(Message::Text(serde_json::to_string(&envelope)?))
    }

    fn decode_message(&self, message: Message) -> Result<Option<Self::Message>, ConnectivityError> {
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => String::from_utf8(bytes).map_err(|e| {
                ConnectivityError::Protocol(format!("Binary frame is not UTF-8: {}", e))
            })?,
            _ => return Ok(None),
        };

        let value: Value = serde_json::from_str(&text)?;
        Ok(Self::decode_value(value))
    }
}
