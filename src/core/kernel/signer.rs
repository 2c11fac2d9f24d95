use crate::core::errors::ConnectivityError;
use crate::core::types::TransportKind;
use base64::engine::general_purpose;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha512};
use std::collections::HashMap;

/// Result type for signing operations: (headers, `query_params`)
pub type SignatureResult = Result<(HashMap<String, String>, Vec<(String, String)>), ConnectivityError>;

/// Signer trait for request authentication
///
/// Implementations receive the already-encoded body, which must contain the
/// nonce being signed, so the signature and the body can never disagree.
pub trait Signer: Send + Sync {
    /// Sign a request and return headers and query parameters
    ///
    /// # Arguments
    /// * `method` - HTTP method (GET, POST, etc.)
    /// * `endpoint` - API endpoint path
    /// * `query_string` - Query string (without leading '?')
    /// * `body` - Raw request body bytes
    /// * `nonce` - Sequence number embedded in the body
    fn sign_request(
        &self,
        method: &str,
        endpoint: &str,
        query_string: &str,
        body: &[u8],
        nonce: i64,
    ) -> SignatureResult;
}

/// HMAC-SHA512 signer over `path + SHA256(nonce + body)`
pub struct HmacSha512Signer {
    api_key: String,
    secret: Vec<u8>,
}

impl HmacSha512Signer {
    /// Create a new signer
    ///
    /// # Arguments
    /// * `api_key` - API key sent in the `API-Key` header
    /// * `secret_key` - Base64-encoded API secret
    pub fn new(api_key: String, secret_key: &str) -> Result<Self, ConnectivityError> {
        let secret = general_purpose::STANDARD
            .decode(secret_key)
            .map_err(|e| ConnectivityError::Authentication {
                transport: TransportKind::Rest,
                message: format!("Invalid secret key encoding: {}", e),
            })?;

        Ok(Self { api_key, secret })
    }

    fn signature(&self, endpoint: &str, body: &[u8], nonce: i64) -> Result<String, ConnectivityError> {
        let mut sha = Sha256::new();
        sha.update(nonce.to_string().as_bytes());
        sha.update(body);
        let digest = sha.finalize();

        let mut mac = Hmac::<Sha512>::new_from_slice(&self.secret).map_err(|e| {
            ConnectivityError::Authentication {
                transport: TransportKind::Rest,
                message: format!("Invalid secret key: {}", e),
            }
        })?;
        mac.update(endpoint.as_bytes());
        mac.update(&digest);

        Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }
}

impl Signer for HmacSha512Signer {
    fn sign_request(
        &self,
        _method: &str,
        endpoint: &str,
        query_string: &str,
        body: &[u8],
        nonce: i64,
    ) -> SignatureResult {
        let signature = self.signature(endpoint, body, nonce)?;

        let mut headers = HashMap::new();
        headers.insert("API-Key".to_string(), self.api_key.clone());
        headers.insert("API-Sign".to_string(), signature);

        let params = query_string
            .split('&')
            .filter_map(|param| {
                param
                    .split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
            })
            .collect();

        Ok((headers, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_base64_secret() {
        assert!(HmacSha512Signer::new("key".to_string(), "not base64!!").is_err());
    }

    #[test]
    fn test_signature_depends_on_nonce() {
        let secret = general_purpose::STANDARD.encode(b"super-secret");
        let signer = HmacSha512Signer::new("key".to_string(), &secret).unwrap();

        let (headers_a, _) = signer
            .sign_request("POST", "/0/private/Balance", "", b"nonce=1", 1)
            .unwrap();
        let (headers_b, _) = signer
            .sign_request("POST", "/0/private/Balance", "", b"nonce=2", 2)
            .unwrap();

        assert_eq!(headers_a["API-Key"], "key");
        assert_ne!(headers_a["API-Sign"], headers_b["API-Sign"]);
    }

    #[test]
    fn test_signature_is_deterministic() {
        let secret = general_purpose::STANDARD.encode(b"super-secret");
        let signer = HmacSha512Signer::new("key".to_string(), &secret).unwrap();
        let sign = || {
            signer
                .sign_request("POST", "/0/private/AddOrder", "", b"nonce=42&pair=XBTUSD", 42)
                .unwrap()
                .0["API-Sign"]
                .clone()
        };
        assert_eq!(sign(), sign());
    }
}
