//! Shared retry loop for outbound HTTP calls.
//!
//! Used by the Drive client, the embedding providers and the chat model:
//! - HTTP 429 and 5xx → retry with exponential backoff
//! - other 4xx → fail immediately with the response body
//! - network errors → retry
//! - backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{anyhow, bail, Result};
use std::future::Future;
use std::time::Duration;

/// Delay before retry `attempt` (1-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << (attempt.saturating_sub(1)).min(5))
}

/// Send the request produced by `send` until it succeeds or `max_retries`
/// retries are used up. `label` names the remote in error messages.
pub async fn send_with_retry<F, Fut>(
    label: &str,
    max_retries: u32,
    mut send: F,
) -> Result<reqwest::Response>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<reqwest::Response>>,
{
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            tokio::time::sleep(backoff_delay(attempt)).await;
        }

        match send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }

                let body_text = response.text().await.unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    tracing::debug!(%status, attempt, "{label} transient error, retrying");
                    last_err = Some(anyhow!("{} error {}: {}", label, status, body_text));
                    continue;
                }

                bail!("{} error {}: {}", label, status, body_text);
            }
            Err(e) => {
                tracing::debug!(attempt, "{label} request failed: {e:#}");
                last_err = Some(e.context(format!("{} request failed", label)));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("{} failed after retries", label)))
}
