use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;

use crate::error::UpstreamError;

/// Parsed capability payload from a successful upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub imessage: bool,
    pub sms: bool,
}

const UPSTREAM_DEADLINE: Duration = Duration::from_secs(15);

/// The single upstream collaborator the Classifier depends on: one GET per
/// phone. Kept behind a trait (mirroring the store traits) so the
/// Classifier's retry/backoff/classification logic in `src/classifier.rs` is
/// testable against a scripted fake instead of a live endpoint.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Perform one `GET /contacts/{e164}/capabilities` call. Returns the
    /// parsed capabilities on success, or the classified error otherwise.
    /// Never retries internally — retry policy lives in the Classifier,
    /// which needs to distinguish "sleep 5s, doesn't count" (429) from
    /// "counts against MAX_RETRIES" (5xx/timeout).
    async fn classify(&self, e164: &str) -> Result<Capabilities, UpstreamError>;
}

pub struct HttpUpstreamClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpUpstreamClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        let client = Client::builder()
            .timeout(UPSTREAM_DEADLINE)
            .user_agent("chunked-classify-engine/0.1.0")
            .build()
            .expect("failed to build upstream HTTP client");

        Self {
            client,
            base_url,
            api_key,
        }
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn classify(&self, e164: &str) -> Result<Capabilities, UpstreamError> {
        let url = format!(
            "{}/contacts/{}/capabilities",
            self.base_url.trim_end_matches('/'),
            urlencode(e164)
        );

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(UpstreamError::RateLimited);
        }

        if status.is_server_error() {
            return Err(UpstreamError::Transient(format!(
                "upstream {} error",
                status.as_u16()
            )));
        }

        if !status.is_success() {
            return Err(UpstreamError::Permanent(format!(
                "upstream {} error",
                status.as_u16()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| UpstreamError::Permanent(format!("unparseable body: {e}")))?;

        let capabilities = body
            .get("capabilities")
            .ok_or_else(|| UpstreamError::Permanent("missing capabilities field".to_string()))?;

        let imessage = capabilities
            .get("imessage")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let sms = capabilities
            .get("sms")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        Ok(Capabilities { imessage, sms })
    }
}

fn classify_transport_error(err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() || err.is_connect() {
        UpstreamError::Transient(err.to_string())
    } else {
        UpstreamError::Permanent(err.to_string())
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Scripted test double for `UpstreamClient`, kept outside `#[cfg(test)]` so
/// both unit tests and the `tests/` integration suite can depend on it, the
/// same way the in-memory store fakes are always compiled.
pub mod fakes {
    use super::*;
    use std::sync::Mutex;

    /// Scripted upstream: each call to `classify` consumes the next
    /// scripted response, looping the last one if the script runs out.
    pub struct FakeUpstreamClient {
        script: Mutex<Vec<Result<Capabilities, UpstreamError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeUpstreamClient {
        pub fn new(script: Vec<Result<Capabilities, UpstreamError>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl UpstreamClient for FakeUpstreamClient {
        async fn classify(&self, e164: &str) -> Result<Capabilities, UpstreamError> {
            self.calls.lock().unwrap().push(e164.to_string());
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                return Ok(Capabilities {
                    imessage: true,
                    sms: true,
                });
            }
            if script.len() == 1 {
                script[0].clone()
            } else {
                script.remove(0)
            }
        }
    }
}
