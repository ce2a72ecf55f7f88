//! Event system for the fetch engine.
//!
//! Provides hooks for logging and custom reactions around attempt activity.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::detectors::BlockReason;
use crate::policy::FetchMethod;

#[derive(Debug, Clone)]
pub struct AttemptStartedEvent {
    pub url: String,
    pub domain: String,
    pub attempt: u32,
    pub method: FetchMethod,
    /// Masked server of the proxy in use, if any.
    pub proxy: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AttemptFinishedEvent {
    pub url: String,
    pub domain: String,
    pub attempt: u32,
    pub method: FetchMethod,
    pub status: Option<u16>,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BlockEvent {
    pub domain: String,
    pub attempt: u32,
    pub reason: BlockReason,
    pub will_retry: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub domain: String,
    pub attempt: u32,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EscalationEvent {
    pub url: String,
    pub from: FetchMethod,
    pub to: FetchMethod,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub domain: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    AttemptStarted(AttemptStartedEvent),
    AttemptFinished(AttemptFinishedEvent),
    Blocked(BlockEvent),
    Retry(RetryEvent),
    Escalation(EscalationEvent),
    Error(ErrorEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &EngineEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: EngineEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &EngineEvent) {
        match event {
            EngineEvent::AttemptStarted(started) => {
                log::debug!(
                    "-> [{}] {} {} via {}",
                    started.attempt,
                    started.method,
                    started.url,
                    started.proxy.as_deref().unwrap_or("direct")
                );
            }
            EngineEvent::AttemptFinished(finished) => {
                log::debug!(
                    "<- [{}] {} {} -> {} ({:.2}s)",
                    finished.attempt,
                    finished.method,
                    finished.url,
                    finished
                        .status
                        .map(|status| status.to_string())
                        .unwrap_or_else(|| "-".into()),
                    finished.latency.as_secs_f64()
                );
            }
            EngineEvent::Blocked(block) => {
                log::warn!(
                    "blocked {} on attempt {} ({}) retry={}",
                    block.domain,
                    block.attempt,
                    block.reason,
                    block.will_retry
                );
            }
            EngineEvent::Retry(retry) => {
                log::info!("retry {} attempt {} ({})", retry.domain, retry.attempt, retry.reason);
            }
            EngineEvent::Escalation(escalation) => {
                log::info!(
                    "escalating {} from {} to {}: {}",
                    escalation.url,
                    escalation.from,
                    escalation.to,
                    escalation.reason
                );
            }
            EngineEvent::Error(error) => {
                log::warn!("warning {} -> {}", error.domain, error.error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &EngineEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher.register_handler(counter.clone());
        dispatcher.dispatch(EngineEvent::Blocked(BlockEvent {
            domain: "example.com".into(),
            attempt: 0,
            reason: BlockReason::HttpStatus(429),
            will_retry: true,
            timestamp: Utc::now(),
        }));
        assert_eq!(*counter.0.lock().unwrap(), 1);
        assert_eq!(dispatcher.len(), 2);
    }
}
