/// `LotusLink` Kernel - transport layer for both exchange channels
///
/// The kernel contains only transport logic and generic interfaces; routing,
/// breaking and nonce policy live in `crate::resilience`.
///
/// # Architecture
///
/// ## Transport Layer
/// - `RestClient`: HTTP client interface with nonce-carrying signed POSTs
/// - `WsSession`: WebSocket connection management
///
/// ## Authentication
/// - `Signer`: Pluggable authentication interface
/// - `HmacSha512Signer`: HMAC-SHA512 over `path + SHA256(nonce + body)`
///
/// ## Message Handling
/// - `WsCodec`: envelope encoding/decoding
/// - `EnvelopeCodec`: `{method, params, req_id}` out, `{channel, type, data}` in
///
/// # Example
/// ```rust,no_run
/// use lotuslink::core::kernel::*;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let signer = Arc::new(HmacSha512Signer::new(
///     "api_key".to_string(),
///     "c2VjcmV0",
/// )?);
/// let rest = RestClientBuilder::new(RestClientConfig::new(
///     "https://api.kraken.com".to_string(),
///     "kraken".to_string(),
/// ))
/// .with_signer(signer)
/// .build()?;
///
/// let balance = rest.signed_post("/0/private/Balance", &[], 1).await?;
/// println!("{balance}");
/// # Ok(())
/// # }
/// ```
pub mod codec;
pub mod rest;
pub mod signer;
pub mod ws;

pub use codec::{EnvelopeCodec, NonceInfo, StreamErrorInfo, StreamMessage, WsCodec};
pub use rest::{ReqwestRest, RestClient, RestClientBuilder, RestClientConfig};
pub use signer::{HmacSha512Signer, SignatureResult, Signer};
pub use ws::{ConnectionStats, TungsteniteWs, WsConfig, WsSession};
