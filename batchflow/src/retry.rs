use crate::flow::FlowError;
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// A multi-attempt request that tracks its own progress.
#[async_trait]
pub trait RequestFlow: Send {
    /// Sends the next request in the flow.
    ///
    /// An `Err` is unrecoverable. Recoverable failures return `Ok` and leave
    /// the flow not done.
    async fn send(&mut self) -> Result<(), FlowError>;

    /// Whether the flow needs no further attempts. Done does not imply every
    /// item succeeded.
    fn is_done(&self) -> bool;
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExponentialBackoff {
    pub initial_interval: Duration,
    pub randomization_factor: f64,
    pub multiplier: f64,
    pub max_interval: Duration,
    pub max_tries: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            randomization_factor: 0.3,
            multiplier: 2.0,
            max_interval: Duration::from_secs(20),
            max_tries: 3,
        }
    }
}

impl ExponentialBackoff {
    /// Picks a delay uniformly from `interval * (1 ± randomization_factor)`,
    /// never above `max_interval`.
    pub fn randomize(&self, interval: Duration) -> Duration {
        let secs = interval.as_secs_f64();
        let delta = self.randomization_factor * secs;
        let randomized = if delta > 0.0 {
            rand::thread_rng().gen_range((secs - delta)..=(secs + delta))
        } else {
            secs
        };
        Duration::from_secs_f64(randomized.max(0.0)).min(self.max_interval)
    }

    pub fn next_interval(&self, interval: Duration) -> Duration {
        let next = interval.as_secs_f64() * self.multiplier;
        if next >= self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::from_secs_f64(next.max(0.0))
        }
    }
}

/// Drives `flow` until it is done, it fails permanently, or `max_tries`
/// attempts have been made.
///
/// Running out of attempts is not an error: unresolved items keep the last
/// failure recorded against them.
pub async fn send_request<F>(flow: &mut F, backoff: &ExponentialBackoff) -> Result<(), FlowError>
where
    F: RequestFlow + ?Sized,
{
    let max_tries = backoff.max_tries.max(1);
    let mut interval = backoff.initial_interval;

    for attempt in 1..=max_tries {
        flow.send().await?;

        if flow.is_done() {
            return Ok(());
        }
        if attempt == max_tries {
            break;
        }

        let delay = backoff.randomize(interval);
        tracing::debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Request flow not done, retrying"
        );
        sleep(delay).await;
        interval = backoff.next_interval(interval);
    }

    tracing::warn!(max_tries, "Request flow retries exhausted");
    Ok(())
}
