//! GitLab API rate-limit tracking.
//!
//! GitLab reports `RateLimit-Remaining` / `RateLimit-Reset` on authenticated
//! API responses and `Retry-After` on a 429.  The client records them after
//! every response and pauses before the next request when the budget runs
//! low.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tracing::info;

/// Longest pause the client will take before a request.
const MAX_PAUSE: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct RateLimitState {
    remaining: AtomicU64,
    /// Unix timestamp at which requests may continue.
    resume_at: AtomicU64,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self {
            remaining: AtomicU64::new(u64::MAX),
            resume_at: AtomicU64::new(0),
        }
    }
}

impl RateLimitState {
    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Relaxed)
    }

    /// Record the limit headers of a response.
    pub fn observe(&self, status: StatusCode, headers: &HeaderMap) {
        if let Some(r) = header_u64(headers, "RateLimit-Remaining") {
            self.remaining.store(r, Ordering::Relaxed);
        }
        if let Some(reset) = header_u64(headers, "RateLimit-Reset") {
            self.resume_at.store(reset, Ordering::Relaxed);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let wait = header_u64(headers, "Retry-After").unwrap_or(1);
            self.remaining.store(0, Ordering::Relaxed);
            self.resume_at
                .store(now_secs().saturating_add(wait), Ordering::Relaxed);
        }
    }

    /// How long to pause before the next request, if the remaining budget
    /// is under `buffer`.
    pub fn pause_needed(&self, buffer: u64) -> Option<Duration> {
        let remaining = self.remaining.load(Ordering::Relaxed);
        if remaining == u64::MAX || remaining >= buffer {
            return None;
        }
        let wait = self
            .resume_at
            .load(Ordering::Relaxed)
            .saturating_sub(now_secs());
        (wait > 0).then(|| Duration::from_secs(wait).min(MAX_PAUSE))
    }

    /// Sleep through [`Self::pause_needed`].
    pub async fn throttle(&self, buffer: u64) {
        if let Some(wait) = self.pause_needed(buffer) {
            info!(
                remaining = self.remaining(),
                wait_secs = wait.as_secs(),
                "GitLab rate limit approaching; pausing"
            );
            tokio::time::sleep(wait).await;
        }
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn now_secs() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0)
}
