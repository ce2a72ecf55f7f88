//! Cross-cutting services module
//!
//! Proxy rotation, per-domain admission control, request pacing and the
//! event system used by the engine.

pub mod events;
pub mod gate;
pub mod proxy;
pub mod timing;

// Re-export commonly used types
pub use events::{
    AttemptFinishedEvent, AttemptStartedEvent, BlockEvent, EngineEvent, ErrorEvent,
    EscalationEvent, EventDispatcher, EventHandler, LoggingHandler, RetryEvent,
};
pub use gate::{ConcurrencyGate, GateError, GatePermit};
pub use proxy::{
    BrowserProxy, ProxyEndpoint, ProxyManager, RotationDecision, SessionKey, StickySession,
    StickySessions, rotation_decision,
};
pub use timing::DelayStrategy;
