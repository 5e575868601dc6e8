use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use types::{
    Context, ErrorKind, ModelCatalog, Provider, ProviderError, ProviderId, ProviderStream,
    ReliabilityConfig, Response, StreamItem,
};

use crate::DEFAULT_STREAM_BUFFER_SIZE;

/// Exponential backoff schedule shared by provider calls and tool calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(2),
            jitter: true,
        }
    }
}

impl From<&ReliabilityConfig> for RetryPolicy {
    fn from(config: &ReliabilityConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
            jitter: config.jitter,
        }
        .normalized()
    }
}

impl RetryPolicy {
    /// At least one attempt, a non-zero base, and a cap no lower than the
    /// base.
    pub fn normalized(mut self) -> Self {
        self.max_attempts = self.max_attempts.max(1);
        self.backoff_base = self.backoff_base.max(Duration::from_millis(1));
        self.backoff_max = self.backoff_max.max(self.backoff_base);
        self
    }

    /// `base * 2^(attempt - 1)`, capped at `backoff_max`.
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1_u32 << doublings)
            .min(self.backoff_max)
    }

    /// Delay before the retry that follows `attempt`, drawn from
    /// `[capped / 2, capped]` when jitter is on.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = self.capped_delay(attempt);
        self.jittered(capped / 2, capped)
    }

    /// Full-jitter variant drawn from `[0, capped]`, used for tool retries
    /// where many calls of one batch may fail together.
    pub fn full_jitter_delay(&self, attempt: u32) -> Duration {
        self.jittered(Duration::ZERO, self.capped_delay(attempt))
    }

    fn jittered(&self, floor: Duration, capped: Duration) -> Duration {
        if !self.jitter || floor >= capped {
            return capped;
        }
        let millis = |duration: Duration| u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(millis(floor)..=millis(capped)))
    }
}

/// Wraps a provider and repeats calls that failed with a transient error.
///
/// Streams are only repeated while nothing has reached the caller; a drop
/// after the first forwarded item surfaces as `StreamInterrupted`.
pub struct ReliableProvider {
    inner: Arc<dyn Provider>,
    policy: RetryPolicy,
}

impl ReliableProvider {
    pub fn new(inner: Box<dyn Provider>, policy: RetryPolicy) -> Self {
        Self::from_arc(Arc::from(inner), policy)
    }

    pub fn from_arc(inner: Arc<dyn Provider>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy: policy.normalized(),
        }
    }
}

/// Sleeps out the backoff for `attempt` and returns `true` when another
/// attempt is allowed.
async fn back_off(
    policy: &RetryPolicy,
    provider: &ProviderId,
    attempt: u32,
    reason: &str,
    phase: &'static str,
) -> bool {
    if attempt >= policy.max_attempts {
        return false;
    }
    let delay = policy.delay_for_attempt(attempt);
    tracing::warn!(
        %provider,
        attempt,
        max_attempts = policy.max_attempts,
        delay_ms = delay.as_millis() as u64,
        reason,
        phase,
        "retrying provider call"
    );
    tokio::time::sleep(delay).await;
    true
}

fn is_transient(error: &ProviderError) -> bool {
    error.kind() == ErrorKind::TransientExternal
}

#[async_trait]
impl Provider for ReliableProvider {
    fn provider_id(&self) -> &ProviderId {
        self.inner.provider_id()
    }

    fn model_catalog(&self) -> &ModelCatalog {
        self.inner.model_catalog()
    }

    async fn complete(&self, context: &Context) -> Result<Response, ProviderError> {
        let provider = self.inner.provider_id();
        let mut attempt = 1;
        loop {
            let error = match self.inner.complete(context).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };
            if !is_transient(&error)
                || !back_off(&self.policy, provider, attempt, &error.to_string(), "complete").await
            {
                return Err(error);
            }
            attempt += 1;
        }
    }

    async fn stream(
        &self,
        context: &Context,
        buffer_size: usize,
    ) -> Result<ProviderStream, ProviderError> {
        let (sender, receiver) = mpsc::channel(match buffer_size {
            0 => DEFAULT_STREAM_BUFFER_SIZE,
            size => size,
        });
        tokio::spawn(retry_stream(
            Arc::clone(&self.inner),
            self.policy,
            context.clone(),
            buffer_size,
            sender,
        ));
        Ok(receiver)
    }
}

async fn retry_stream(
    inner: Arc<dyn Provider>,
    policy: RetryPolicy,
    context: Context,
    buffer_size: usize,
    sender: mpsc::Sender<Result<StreamItem, ProviderError>>,
) {
    let provider = inner.provider_id().clone();
    let mut attempt = 1;
    loop {
        let mut upstream = match inner.stream(&context, buffer_size).await {
            Ok(upstream) => upstream,
            Err(error) => {
                if is_transient(&error)
                    && back_off(&policy, &provider, attempt, &error.to_string(), "open").await
                {
                    attempt += 1;
                    continue;
                }
                let _ = sender.send(Err(error)).await;
                return;
            }
        };

        let mut forwarded = false;
        let lost = loop {
            match upstream.recv().await {
                None => return,
                Some(Ok(StreamItem::ConnectionLost(message))) => break message,
                Some(item) => {
                    forwarded = true;
                    if sender.send(item).await.is_err() {
                        return;
                    }
                }
            }
        };
        if forwarded || !back_off(&policy, &provider, attempt, &lost, "stream").await {
            let _ = sender
                .send(Err(ProviderError::StreamInterrupted {
                    provider,
                    message: lost,
                }))
                .await;
            return;
        }
        attempt += 1;
    }
}
