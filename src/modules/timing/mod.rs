//! Pre-request delays.
//!
//! An enabled domain policy pins a fixed delay; otherwise the delay is drawn
//! uniformly from the global `[min, max]` window.

use std::time::Duration;

use rand::Rng;

use crate::policy::DomainPolicy;
use crate::policy::settings::ProxySettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayStrategy {
    Fixed(Duration),
    Uniform { min: Duration, max: Duration },
}

impl DelayStrategy {
    /// `policy` is the stored policy when one exists and is enabled.
    pub fn select(policy: Option<&DomainPolicy>, settings: &ProxySettings) -> Self {
        match policy {
            Some(policy) if policy.enabled => {
                DelayStrategy::Fixed(Duration::from_millis(policy.request_delay_ms))
            }
            _ => {
                let min = settings.request_delay_min_ms;
                let max = settings.request_delay_max_ms.max(min);
                DelayStrategy::Uniform {
                    min: Duration::from_millis(min),
                    max: Duration::from_millis(max),
                }
            }
        }
    }

    pub fn next_delay(&self) -> Duration {
        match *self {
            DelayStrategy::Fixed(delay) => delay,
            DelayStrategy::Uniform { min, max } if max <= min => min,
            DelayStrategy::Uniform { min, max } => {
                let millis = rand::thread_rng()
                    .gen_range(min.as_millis() as u64..=max.as_millis() as u64);
                Duration::from_millis(millis)
            }
        }
    }
}

/// Sleep for the next delay, skipping the timer entirely for zero.
pub async fn pause(strategy: DelayStrategy) -> Duration {
    let delay = strategy.next_delay();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    delay
}
