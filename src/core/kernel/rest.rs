use crate::core::errors::ConnectivityError;
use crate::core::kernel::signer::Signer;
use crate::core::types::TransportKind;
use async_trait::async_trait;
use reqwest::{Client, Method, Response};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{instrument, trace};

/// REST client trait for making HTTP requests
///
/// Transport only: callers pass endpoints and parameters, the client handles
/// encoding, signing and status mapping.
#[async_trait]
pub trait RestClient: Send + Sync {
    /// Make an unauthenticated GET request
    ///
    /// # Arguments
    /// * `endpoint` - The API endpoint path
    /// * `query_params` - Query parameters as key-value pairs
    async fn get(
        &self,
        endpoint: &str,
        query_params: &[(&str, &str)],
    ) -> Result<Value, ConnectivityError>;

    /// Make a signed, form-encoded POST request
    ///
    /// # Arguments
    /// * `endpoint` - The API endpoint path
    /// * `form` - Form fields, excluding the nonce
    /// * `nonce` - Sequence number placed first in the body and signed
    async fn signed_post(
        &self,
        endpoint: &str,
        form: &[(String, String)],
        nonce: i64,
    ) -> Result<Value, ConnectivityError>;

    /// Whether a signer is configured
    fn can_sign(&self) -> bool;
}

/// Configuration for the REST client
#[derive(Clone, Debug)]
pub struct RestClientConfig {
    /// Base URL for the API
    pub base_url: String,
    /// Exchange name for logging and tracing
    pub exchange_name: String,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
    /// User agent string to include in requests
    pub user_agent: String,
}

impl RestClientConfig {
    pub fn new(base_url: String, exchange_name: String) -> Self {
        Self {
            base_url,
            exchange_name,
            timeout_seconds: 30,
            user_agent: "LotusLink/1.0".to_string(),
        }
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }
}

/// Builder for creating REST client instances
pub struct RestClientBuilder {
    config: RestClientConfig,
    signer: Option<Arc<dyn Signer>>,
}

impl RestClientBuilder {
    pub fn new(config: RestClientConfig) -> Self {
        Self {
            config,
            signer: None,
        }
    }

    /// Set the signer for authenticated requests
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn build(self) -> Result<ReqwestRest, ConnectivityError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_seconds))
            .user_agent(&self.config.user_agent)
            .build()
            .map_err(|e| {
                ConnectivityError::Protocol(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(ReqwestRest {
            client,
            config: self.config,
            signer: self.signer,
        })
    }
}

/// Implementation of `RestClient` using reqwest
#[derive(Clone)]
pub struct ReqwestRest {
    client: Client,
    config: RestClientConfig,
    signer: Option<Arc<dyn Signer>>,
}

impl std::fmt::Debug for ReqwestRest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestRest")
            .field("config", &self.config)
            .field("has_signer", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}

impl ReqwestRest {
    fn build_url(&self, endpoint: &str) -> String {
        format!("{}{}", self.config.base_url, endpoint)
    }

    /// Form-encode fields with the nonce first
    pub fn encode_form(form: &[(String, String)], nonce: i64) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        serializer.append_pair("nonce", &nonce.to_string());
        for (key, value) in form {
            serializer.append_pair(key, value);
        }
        serializer.finish()
    }

    fn map_send_error(err: &reqwest::Error, started: Instant) -> ConnectivityError {
        if err.is_timeout() {
            ConnectivityError::Timeout {
                transport: TransportKind::Rest,
                elapsed_ms: started.elapsed().as_millis() as u64,
            }
        } else {
            ConnectivityError::unavailable(TransportKind::Rest, format!("Request failed: {}", err))
        }
    }

    #[instrument(skip(self, response), fields(exchange = %self.config.exchange_name, status = %response.status()))]
    async fn handle_response(&self, response: Response) -> Result<Value, ConnectivityError> {
        let status = response.status();
        let response_text = response.text().await.map_err(|e| {
            ConnectivityError::unavailable(
                TransportKind::Rest,
                format!("Failed to read response body: {}", e),
            )
        })?;

        trace!("Response body: {}", response_text);

        if status.is_success() {
            serde_json::from_str(&response_text).map_err(|e| {
                ConnectivityError::Protocol(format!("Failed to parse JSON response: {}", e))
            })
        } else {
            Err(ConnectivityError::from_http_status(
                status.as_u16(),
                response_text,
                TransportKind::Rest,
            ))
        }
    }
}

#[async_trait]
impl RestClient for ReqwestRest {
    #[instrument(skip(self, query_params), fields(exchange = %self.config.exchange_name, endpoint = %endpoint, param_count = query_params.len()))]
    async fn get(
        &self,
        endpoint: &str,
        query_params: &[(&str, &str)],
    ) -> Result<Value, ConnectivityError> {
        let started = Instant::now();
        let response = self
            .client
            .request(Method::GET, self.build_url(endpoint))
            .query(query_params)
            .send()
            .await
            .map_err(|e| Self::map_send_error(&e, started))?;

        self.handle_response(response).await
    }

    #[instrument(skip(self, form), fields(exchange = %self.config.exchange_name, endpoint = %endpoint, nonce = nonce))]
    async fn signed_post(
        &self,
        endpoint: &str,
        form: &[(String, String)],
        nonce: i64,
    ) -> Result<Value, ConnectivityError> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| ConnectivityError::Authentication {
                transport: TransportKind::Rest,
                message: "Authentication required but no signer provided".to_string(),
            })?;

        let body = Self::encode_form(form, nonce);
        let (headers, _) = signer.sign_request("POST", endpoint, "", body.as_bytes(), nonce)?;

        let mut request = self
            .client
            .request(Method::POST, self.build_url(endpoint))
            .header("Content-Type", "application/x-www-form-urlencoded");
        for (key, value) in headers {
            request = request.header(&key, &value);
        }

        let started = Instant::now();
        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| Self::map_send_error(&e, started))?;

        self.handle_response(response).await
    }

    fn can_sign(&self) -> bool {
        self.signer.is_some()
    }
}
