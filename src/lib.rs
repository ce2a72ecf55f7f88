//! # fetchgate
//!
//! Adaptive fetch orchestration for scraping backends.
//!
//! For a single target URL the engine decides how to retrieve it (plain HTTP
//! or a headless browser render), through which network path (direct or a
//! rotating proxy gateway), how many times to try, and whether the page was
//! actually served or silently blocked.
//!
//! ## Features
//!
//! - Per-domain policies (method, proxy use, delay, concurrency, user agent)
//! - Time-boxed settings cache over one persisted settings record
//! - Sticky proxy sessions with `per_job`, `on_failure` and `per_request` rotation
//! - Per-domain concurrency gate
//! - Block detection and HTTP to browser escalation
//! - Optional headless Chromium fetching (`browser` feature)
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fetchgate::{FetchEngine, RedbStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(RedbStore::open("fetchgate.redb")?);
//!     let engine = FetchEngine::from_env(store)?;
//!     let result = engine.run("https://example.com", Some("job-1"), None).await?;
//!     println!("{} blocked={} via {}", result.url, result.blocked, result.method_used);
//!     Ok(())
//! }
//! ```

mod engine;

pub mod config;
pub mod detectors;
pub mod extract;
pub mod fetch;
pub mod modules;
pub mod policy;
pub mod storage;

pub use crate::engine::{
    AttemptPlan,
    EngineError,
    EngineResult,
    FetchEngine,
    FetchEngineBuilder,
    FetchOptions,
    FetchResult,
};

pub use crate::config::{ConfigError, EngineConfig, ProxyCredentials};

pub use crate::detectors::{BlockReason, BlockVerdict, classify, needs_js_render};

pub use crate::extract::{
    ExtractionError,
    ExtractionField,
    ExtractionHook,
    ExtractionSchema,
    SchemaExtractor,
};

pub use crate::fetch::{
    AttemptOutcome,
    DefaultExecutor,
    FetchError,
    FetchExecutor,
    FetchRequest,
    LaunchProfile,
    LaunchProfileProvider,
    RawFetchOutcome,
    StealthProfile,
};

pub use crate::modules::{
    ConcurrencyGate,
    EngineEvent,
    EventDispatcher,
    EventHandler,
    GateError,
    LoggingHandler,
    ProxyEndpoint,
    ProxyManager,
    SessionKey,
};

pub use crate::policy::settings::{
    ProxySettings,
    ProxySettingsUpdate,
    RotationStrategy,
    SettingsCache,
    SettingsError,
};

pub use crate::policy::{
    DomainPolicy,
    DomainPolicyUpdate,
    FetchMethod,
    MethodPreference,
    PolicyResolver,
    ResolvedPolicy,
    normalize_domain,
};

pub use crate::storage::{MemoryStore, PolicyStore, RedbStore, SettingsSource, StoreError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
