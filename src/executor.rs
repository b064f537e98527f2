//! POST requests to the git metadata API with retries on transport failure

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use rand::Rng;

use crate::{
    config::{Credentials, RequestMode},
    error::{Error, Result},
    transport::{HttpResponse, Transport},
};

pub const API_KEY_HEADER: &str = "dd-api-key";
pub const APPLICATION_KEY_HEADER: &str = "dd-application-key";
pub const EVP_SUBDOMAIN_HEADER_NAME: &str = "X-Datadog-EVP-Subdomain";
pub const EVP_SUBDOMAIN_HEADER_API_VALUE: &str = "api";

/// Fibonacci backoff with multiplicative jitter
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    /// Delay unit multiplied by the fibonacci term
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the `retry`-th failed attempt (0-based).
    ///
    /// `base_delay * fib(retry) * U[0.5, 1.5)` with fib = 1, 1, 2, 3, 5, ...
    pub fn delay_after<R: Rng>(&self, retry: u32, rng: &mut R) -> Duration {
        let jitter: f64 = rng.random_range(0.5..1.5);
        self.base_delay.mul_f64(fibonacci(retry) as f64 * jitter)
    }
}

fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

/// Sends requests for one client configuration
pub struct RequestExecutor {
    mode: RequestMode,
    base_url: String,
    credentials: Credentials,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl RequestExecutor {
    pub fn new(
        mode: RequestMode,
        base_url: impl Into<String>,
        credentials: Credentials,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            mode,
            base_url: base_url.into(),
            credentials,
            transport,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Full request target for an endpoint such as `/search_commits`
    pub fn url_for(&self, endpoint: &str) -> String {
        format!("{}/repository{}", self.base_url, endpoint)
    }

    /// Headers for the configured mode, with `extra` merged on top
    pub fn headers(&self, extra: &[(&str, &str)]) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        match self.mode {
            RequestMode::AgentlessEvents => {
                headers.insert(API_KEY_HEADER.to_string(), self.credentials.api_key.clone());
                headers.insert(
                    APPLICATION_KEY_HEADER.to_string(),
                    self.credentials.app_key.clone(),
                );
            }
            RequestMode::EvpProxyEvents => {
                headers.insert(
                    EVP_SUBDOMAIN_HEADER_NAME.to_string(),
                    EVP_SUBDOMAIN_HEADER_API_VALUE.to_string(),
                );
            }
        }
        for (name, value) in extra {
            headers.insert(name.to_string(), value.to_string());
        }
        headers
    }

    /// POST `payload` to `endpoint`.
    ///
    /// Any response with a status line ends the loop; only transport errors
    /// are retried. When every attempt fails the last error is returned.
    pub fn send(
        &self,
        endpoint: &str,
        payload: &[u8],
        extra_headers: &[(&str, &str)],
    ) -> Result<HttpResponse> {
        let url = self.url_for(endpoint);
        let headers = self.headers(extra_headers);
        let attempts = self.policy.attempts.max(1);
        let mut rng = rand::rng();
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.policy.delay_after(attempt - 1, &mut rng);
                tracing::debug!("Retrying POST {} in {:?}", url, delay);
                std::thread::sleep(delay);
            }

            tracing::debug!(
                "Sending request: POST {} ({} bytes, attempt {}/{})",
                url,
                payload.len(),
                attempt + 1,
                attempts
            );
            match self.transport.post(&url, &headers, payload) {
                Ok(response) => {
                    tracing::debug!("Response status: {}", response.status);
                    return Ok(response);
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        "POST {} failed on attempt {}/{}: {}",
                        url,
                        attempt + 1,
                        attempts,
                        e
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::Transport(format!("no attempt made for {}", url))))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use super::*;

    /// Fails the first `failures` calls with a transport error, then
    /// answers with `status`
    struct FlakyTransport {
        failures: usize,
        status: u16,
        calls: AtomicUsize,
        seen_headers: Mutex<Vec<BTreeMap<String, String>>>,
        seen_urls: Mutex<Vec<String>>,
    }

    impl FlakyTransport {
        fn new(failures: usize, status: u16) -> Self {
            Self {
                failures,
                status,
                calls: AtomicUsize::new(0),
                seen_headers: Mutex::new(Vec::new()),
                seen_urls: Mutex::new(Vec::new()),
            }
        }
    }

    impl Transport for FlakyTransport {
        fn post(
            &self,
            url: &str,
            headers: &BTreeMap<String, String>,
            _body: &[u8],
        ) -> Result<HttpResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_headers.lock().unwrap().push(headers.clone());
            self.seen_urls.lock().unwrap().push(url.to_string());
            if call < self.failures {
                Err(Error::Transport(format!("connection reset #{}", call)))
            } else {
                Ok(HttpResponse::new(self.status, "{}"))
            }
        }
    }

    fn credentials() -> Credentials {
        Credentials::new("api-secret", "app-secret")
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 5,
            base_delay: Duration::from_millis(1),
        }
    }

    fn executor(mode: RequestMode, transport: Arc<FlakyTransport>) -> RequestExecutor {
        RequestExecutor::new(mode, "https://api.example.com/api/v2/git", credentials(), transport)
            .with_retry_policy(fast_policy())
    }

    #[test]
    fn test_fibonacci_sequence() {
        let terms: Vec<u64> = (0..7).map(fibonacci).collect();
        assert_eq!(terms, vec![1, 1, 2, 3, 5, 8, 13]);
    }

    #[test]
    fn test_delays_never_zero_and_grow_in_expectation() {
        let policy = RetryPolicy {
            attempts: 5,
            base_delay: Duration::from_millis(100),
        };
        let mut rng = rand::rng();
        for retry in 0..4 {
            let term = fibonacci(retry) as f64;
            for _ in 0..200 {
                let delay = policy.delay_after(retry, &mut rng).as_secs_f64();
                assert!(delay > 0.0);
                assert!(delay >= 0.1 * term * 0.5 - 1e-9);
                assert!(delay < 0.1 * term * 1.5 + 1e-9);
            }
        }
        // Midpoints of the jitter window are non-decreasing
        let midpoints: Vec<u64> = (0..4).map(fibonacci).collect();
        assert!(midpoints.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_url_composition() {
        let transport = Arc::new(FlakyTransport::new(0, 200));
        let exec = executor(RequestMode::AgentlessEvents, transport.clone());
        exec.send("/search_commits", b"{}", &[]).unwrap();
        assert_eq!(
            transport.seen_urls.lock().unwrap()[0],
            "https://api.example.com/api/v2/git/repository/search_commits"
        );
    }

    #[test]
    fn test_agentless_headers_carry_credentials() {
        let transport = Arc::new(FlakyTransport::new(0, 200));
        let exec = executor(RequestMode::AgentlessEvents, transport);
        let headers = exec.headers(&[("Content-Type", "multipart/form-data")]);
        assert_eq!(headers.get(API_KEY_HEADER).unwrap(), "api-secret");
        assert_eq!(headers.get(APPLICATION_KEY_HEADER).unwrap(), "app-secret");
        assert_eq!(headers.get("Content-Type").unwrap(), "multipart/form-data");
        assert!(!headers.contains_key(EVP_SUBDOMAIN_HEADER_NAME));
    }

    #[test]
    fn test_evp_headers_never_carry_credentials() {
        let transport = Arc::new(FlakyTransport::new(0, 200));
        let exec = executor(RequestMode::EvpProxyEvents, transport.clone());
        exec.send("/packfile", b"x", &[("Content-Type", "application/json")])
            .unwrap();

        let headers = &transport.seen_headers.lock().unwrap()[0];
        assert_eq!(headers.get(EVP_SUBDOMAIN_HEADER_NAME).unwrap(), "api");
        assert!(!headers.contains_key(API_KEY_HEADER));
        assert!(!headers.contains_key(APPLICATION_KEY_HEADER));
        assert!(!headers.values().any(|v| v.contains("secret")));
    }

    #[test]
    fn test_recovers_after_transient_failures() {
        let transport = Arc::new(FlakyTransport::new(3, 200));
        let exec = executor(RequestMode::AgentlessEvents, transport.clone());
        let response = exec.send("/search_commits", b"{}", &[]).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_gives_up_after_five_attempts() {
        let transport = Arc::new(FlakyTransport::new(usize::MAX, 200));
        let exec = executor(RequestMode::AgentlessEvents, transport.clone());
        let err = exec.send("/search_commits", b"{}", &[]).unwrap_err();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 5);
        match err {
            Error::Transport(msg) => assert!(msg.contains("#4"), "last error surfaced: {}", msg),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_error_status_is_not_retried() {
        let transport = Arc::new(FlakyTransport::new(0, 500));
        let exec = executor(RequestMode::AgentlessEvents, transport.clone());
        let response = exec.send("/packfile", b"{}", &[]).unwrap();
        assert_eq!(response.status, 500);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }
}
