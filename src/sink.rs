//! Delivery of updates. Not part of the engine: this is the plain-text reference consumer
//! used by the binary, plus the retry wrapper any real sink should go through.

use retry_policies::policies::ExponentialBackoff;
use retry_policies::{Jitter, RetryDecision, RetryPolicy as BackoffPolicy};
use std::io::Write;
use std::time::{Duration, SystemTime};
use thiserror::Error;

use crate::hn_client::{clean_text, permalink, profile_url};
use crate::models::{HackerNewsItem, Update};

const TEXT_CHARS_MAX: usize = 3000;

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The receiving side asked us to slow down.
    #[error("rate limited, retry after {0:?}")]
    RetryAfter(Duration),
    #[error("delivery failed: {0}")]
    Failed(#[from] anyhow::Error),
}

pub trait EventSink {
    fn deliver(&mut self, update: &Update) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::builder()
            .retry_bounds(self.base_delay.min(self.max_delay), self.max_delay)
            .jitter(Jitter::None)
            .build_with_max_retries(self.max_attempts.saturating_sub(1))
    }

    /// How long to wait after failed attempt number `attempt` (1-based), or `None` once the
    /// attempts are used up.
    pub fn delay_for(&self, attempt: u32, error: &DeliveryError) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        match error {
            // One extra second so we do not land exactly on the limit.
            DeliveryError::RetryAfter(after) => Some(*after + Duration::from_secs(1)),
            DeliveryError::Failed(_) => {
                let now = SystemTime::now();
                match self.backoff().should_retry(now, attempt.saturating_sub(1)) {
                    RetryDecision::Retry { execute_after } => {
                        let wait = execute_after.duration_since(now).unwrap_or_default();
                        // Whole milliseconds: drop the time spent deciding.
                        Some(Duration::from_millis(wait.as_millis() as u64))
                    }
                    RetryDecision::DoNotRetry => None,
                }
            }
        }
    }
}

/// Deliver one update, retrying up to `policy.max_attempts` times. `sleep` is how waiting
/// happens (`std::thread::sleep` in production).
pub fn deliver_with_retry(
    sink: &mut dyn EventSink,
    update: &Update,
    policy: &RetryPolicy,
    mut sleep: impl FnMut(Duration),
) -> Result<(), DeliveryError> {
    let mut attempt = 1;
    loop {
        let e = match sink.deliver(update) {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        let Some(delay) = policy.delay_for(attempt, &e) else {
            return Err(e);
        };
        tracing::info!(
            attempt,
            error = %e,
            "delivery of {} failed, waiting {:?}",
            update.record.id,
            delay
        );
        sleep(delay);
        attempt += 1;
    }
}

fn ellipsis(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let mut cut: String = text.chars().take(max.saturating_sub(1)).collect();
        cut.push('…');
        cut
    } else {
        text.to_string()
    }
}

fn plural(n: i64) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

fn story_meta(item: &HackerNewsItem) -> Vec<String> {
    let mut meta = Vec::new();
    if let Some(by) = &item.by {
        meta.push(format!("by {} ({})", by, profile_url(by)));
    }
    if let Some(score) = item.score.filter(|&s| s != 1) {
        meta.push(format!("{score} points"));
    }
    match (item.descendants, item.kids.as_ref()) {
        (Some(n), _) if n > 0 => meta.push(format!("{n} comment{}", plural(n))),
        (_, Some(kids)) if !kids.is_empty() => {
            let n = kids.len() as i64;
            meta.push(format!("{n} comment{}", plural(n)));
        }
        _ => {}
    }
    meta
}

/// Render an update as plain text.
pub fn format_update(update: &Update) -> String {
    let empty = HackerNewsItem::default();
    let item = update.record.payload().unwrap_or(&empty);

    let title = item.title.as_deref().unwrap_or("<no title>");
    let mut text = format!(
        "{}: {}",
        update.kind.as_str().to_uppercase(),
        clean_text(title)
    );

    if let Some(url) = &item.url {
        text.push('\n');
        text.push_str(url);
    }

    let meta = story_meta(item);
    if !meta.is_empty() {
        text.push('\n');
        text.push_str(&meta.join(" - "));
    }

    if let Some(body) = &item.text {
        text.push_str("\n\n");
        text.push_str(&ellipsis(clean_text(body).trim(), TEXT_CHARS_MAX));
    }

    text.push_str("\n\n");
    text.push_str(&permalink(update.record.id));
    text
}

/// Writes each update to stdout, separated by blank lines.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl EventSink for StdoutSink {
    fn deliver(&mut self, update: &Update) -> Result<(), DeliveryError> {
        let mut out = std::io::stdout().lock();
        writeln!(out, "{}\n", format_update(update)).map_err(anyhow::Error::from)?;
        out.flush().map_err(anyhow::Error::from)?;
        Ok(())
    }
}
