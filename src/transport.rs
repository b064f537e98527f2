use std::{collections::BTreeMap, time::Duration};

use crate::error::{Error, Result};

/// Status line and fully drained body of one HTTP exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Moves one POST request to the backend.
///
/// Implementations must return `Error::Transport` for failures below the
/// HTTP layer (connect, timeout, reset). Any status code the server answers
/// with is an `Ok` response.
pub trait Transport: Send + Sync {
    fn post(&self, url: &str, headers: &BTreeMap<String, String>, body: &[u8])
        -> Result<HttpResponse>;
}

/// Blocking HTTP transport backed by reqwest
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

    pub fn new(timeout: Duration) -> Result<Self> {
        // No idle pool: each attempt gets its own connection and gives it
        // back before returning
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn post(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: &[u8],
    ) -> Result<HttpResponse> {
        let mut request = self.client.post(url).body(body.to_vec());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .map_err(|e| Error::Transport(format!("POST {} failed: {}", url, e)))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .map_err(|e| Error::Transport(format!("reading response from {} failed: {}", url, e)))?;

        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// Answers every request with the same canned response.
///
/// Used to run the whole pipeline without a backend.
#[derive(Debug, Clone)]
pub struct FixedResponseTransport {
    response: HttpResponse,
}

impl FixedResponseTransport {
    pub fn new(response: HttpResponse) -> Self {
        Self { response }
    }
}

impl Transport for FixedResponseTransport {
    fn post(
        &self,
        url: &str,
        _headers: &BTreeMap<String, String>,
        _body: &[u8],
    ) -> Result<HttpResponse> {
        tracing::debug!("Answering {} with fixed status {}", url, self.response.status);
        Ok(self.response.clone())
    }
}
