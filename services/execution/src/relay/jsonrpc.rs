//! JSON-RPC over HTTP for relay endpoints, with error classification

use crate::error::{ConfigError, RelayError};
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use url::Url;

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

pub struct JsonRpcTransport {
    client: reqwest::Client,
    url: Url,
    next_id: AtomicU64,
}

impl JsonRpcTransport {
    pub fn new(client: reqwest::Client, url: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            client,
            url: url.parse()?,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Serialized request body. Callers that sign the body need it before sending.
    pub fn encode(&self, method: &str, params: Value) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": [params],
        })
        .to_string()
    }

    /// POST a pre-encoded body and return the `result` member
    pub async fn post(
        &self,
        body: String,
        headers: HeaderMap,
        timeout: Duration,
    ) -> Result<Value, RelayError> {
        let response = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .headers(headers)
            .body(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let text = response.text().await.map_err(classify_transport)?;

        if !status.is_success() {
            // Relays often put a JSON-RPC error inside non-2xx responses
            if let Ok(RpcResponse { error: Some(error), .. }) = serde_json::from_str(&text) {
                if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS
                    && !matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN)
                {
                    return Err(classify_rpc_error(error.code, &error.message));
                }
            }
            return Err(classify_status(status, &text));
        }

        let parsed: RpcResponse = serde_json::from_str(&text)
            .map_err(|e| RelayError::invalid_response(format!("{}: {}", e, truncate(&text))))?;

        if let Some(error) = parsed.error {
            return Err(classify_rpc_error(error.code, &error.message));
        }
        parsed
            .result
            .ok_or_else(|| RelayError::invalid_response("response carries neither result nor error"))
    }

    pub async fn call(
        &self,
        method: &str,
        params: Value,
        headers: HeaderMap,
        timeout: Duration,
    ) -> Result<Value, RelayError> {
        let body = self.encode(method, params);
        self.post(body, headers, timeout).await
    }
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(200) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

fn classify_transport(error: reqwest::Error) -> RelayError {
    if error.is_timeout() {
        RelayError::Timeout
    } else if error.is_decode() {
        RelayError::invalid_response(error.to_string())
    } else {
        RelayError::connection(error.to_string())
    }
}

/// HTTP status to error class
pub fn classify_status(status: StatusCode, body: &str) -> RelayError {
    let message = format!("HTTP {}: {}", status.as_u16(), truncate(body));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RelayError::Authentication { message },
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => RelayError::connection(message),
        s if s.is_server_error() => RelayError::connection(message),
        _ => RelayError::rejected(message),
    }
}

/// JSON-RPC error message to error class
pub fn classify_rpc_error(code: i64, message: &str) -> RelayError {
    let lowered = message.to_ascii_lowercase();
    let message = format!("{} (code {})", message, code);

    if lowered.contains("nonce too low") || lowered.contains("nonce is too low") {
        RelayError::NonceTooLow { message }
    } else if lowered.contains("revert") || lowered.contains("simulation") {
        RelayError::SimulationReverted { message }
    } else if lowered.contains("unauthorized")
        || lowered.contains("signature")
        || lowered.contains("forbidden")
    {
        RelayError::Authentication { message }
    } else if lowered.contains("rate limit") || lowered.contains("too many requests") {
        RelayError::Connection { message }
    } else {
        RelayError::Rejected { message }
    }
}
