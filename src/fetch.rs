//! Blocking page fetcher with a bounded retry schedule.
//!
//! Numista rejects unidentified clients, so the client always sends a
//! desktop-browser user agent and an English `Accept-Language`. Failures
//! sleep according to a fixed backoff schedule (clamped to its last entry)
//! and retry up to the attempt ceiling; exhaustion is the only error this
//! module surfaces, and the caller treats it as terminal for the run.

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT_LANGUAGE, HeaderMap, HeaderValue, USER_AGENT};
use tracing::warn;

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const ACCEPT_LANGUAGE_VALUE: &str = "en-US,en;q=0.9";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Process-wide retry configuration, injected at construction so tests can
/// substitute a zero-delay schedule.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: [5, 10, 20, 40, 60].map(Duration::from_secs).to_vec(),
        }
    }
}

impl RetryPolicy {
    /// Wait before the next try after a failed attempt (0-based). Attempts
    /// past the end of the schedule reuse its last entry.
    pub fn wait_after(&self, attempt: usize) -> Duration {
        match self.backoff.last() {
            Some(last) => *self.backoff.get(attempt).unwrap_or(last),
            None => Duration::ZERO,
        }
    }
}

/// Seam consumed by the reconciliation orchestrator; tests substitute a
/// closure-backed fake.
pub trait PageFetcher {
    fn fetch_page(&self, url: &str) -> Result<String>;
}

pub struct HttpFetcher {
    client: Client,
    policy: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(policy: RetryPolicy) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(ACCEPT_LANGUAGE_VALUE));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build http client")?;

        Ok(Self { client, policy })
    }

    fn get_once(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("request failed: {url}"))?
            .error_for_status()
            .with_context(|| format!("request rejected: {url}"))?;

        let body = response
            .bytes()
            .with_context(|| format!("failed to read response body: {url}"))?;

        // Best-effort decode: replace undecodable bytes, never fail the fetch.
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

impl PageFetcher for HttpFetcher {
    fn fetch_page(&self, url: &str) -> Result<String> {
        fetch_with_retry(&self.policy, url, |_| self.get_once(url))
    }
}

/// Run one attempt function under the retry policy. Split out from
/// `HttpFetcher` so the schedule behavior is testable without a network.
pub fn fetch_with_retry<F>(policy: &RetryPolicy, url: &str, mut attempt_fn: F) -> Result<String>
where
    F: FnMut(usize) -> Result<String>,
{
    for attempt in 0..policy.max_attempts {
        match attempt_fn(attempt) {
            Ok(body) => return Ok(body),
            Err(err) => {
                let wait = policy.wait_after(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    wait_secs = wait.as_secs(),
                    error = %err,
                    "fetch attempt failed"
                );
                if attempt + 1 < policy.max_attempts {
                    thread::sleep(wait);
                }
            }
        }
    }

    bail!("failed to fetch {url} after {} attempts", policy.max_attempts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zero_delay(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: vec![Duration::ZERO],
        }
    }

    #[test]
    fn schedule_clamps_to_last_entry() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.wait_after(0), Duration::from_secs(5));
        assert_eq!(policy.wait_after(4), Duration::from_secs(60));
        assert_eq!(policy.wait_after(17), Duration::from_secs(60));
    }

    #[test]
    fn empty_schedule_waits_zero() {
        let policy = RetryPolicy {
            max_attempts: 2,
            backoff: Vec::new(),
        };
        assert_eq!(policy.wait_after(0), Duration::ZERO);
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let mut calls = 0;
        let body = fetch_with_retry(&zero_delay(5), "http://example", |attempt| {
            calls += 1;
            if attempt < 2 {
                bail!("transient")
            }
            Ok("page".to_string())
        })
        .unwrap();

        assert_eq!(body, "page");
        assert_eq!(calls, 3);
    }

    #[test]
    fn exhausting_attempts_is_terminal() {
        let mut calls = 0;
        let err = fetch_with_retry(&zero_delay(5), "http://example", |_| {
            calls += 1;
            bail!("down")
        })
        .unwrap_err();

        assert_eq!(calls, 5);
        assert!(err.to_string().contains("after 5 attempts"));
    }
}
