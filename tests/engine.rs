use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fetchgate::{
    AttemptOutcome, BlockReason, DomainPolicy, DomainPolicyUpdate, EngineConfig, EngineError,
    EngineEvent, EventHandler, ExtractionError, ExtractionHook, FetchEngine, FetchError,
    FetchExecutor, FetchMethod, FetchOptions, FetchRequest, MemoryStore, MethodPreference,
    ProxyCredentials, ProxySettings, RawFetchOutcome, RotationStrategy,
};
use futures::future::join_all;

type Responder = dyn Fn(&FetchRequest, usize) -> AttemptOutcome + Send + Sync;

/// Scripted executor that records every call it receives.
struct FakeExecutor {
    respond: Box<Responder>,
    calls: AtomicUsize,
    http_calls: AtomicUsize,
    browser_calls: AtomicUsize,
    proxies: Mutex<Vec<Option<u64>>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    hold: Duration,
}

impl FakeExecutor {
    fn new<F>(respond: F) -> Arc<Self>
    where
        F: Fn(&FetchRequest, usize) -> AttemptOutcome + Send + Sync + 'static,
    {
        Self::holding(Duration::ZERO, respond)
    }

    fn holding<F>(hold: Duration, respond: F) -> Arc<Self>
    where
        F: Fn(&FetchRequest, usize) -> AttemptOutcome + Send + Sync + 'static,
    {
        Arc::new(Self {
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
            http_calls: AtomicUsize::new(0),
            browser_calls: AtomicUsize::new(0),
            proxies: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            hold,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn browser_calls(&self) -> usize {
        self.browser_calls.load(Ordering::SeqCst)
    }

    fn http_calls(&self) -> usize {
        self.http_calls.load(Ordering::SeqCst)
    }

    fn proxy_ids(&self) -> Vec<Option<u64>> {
        self.proxies.lock().unwrap().clone()
    }
}

#[async_trait]
impl FetchExecutor for FakeExecutor {
    async fn fetch(&self, request: &FetchRequest) -> AttemptOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match request.method {
            FetchMethod::Http => self.http_calls.fetch_add(1, Ordering::SeqCst),
            FetchMethod::Browser => self.browser_calls.fetch_add(1, Ordering::SeqCst),
        };
        self.proxies
            .lock()
            .unwrap()
            .push(request.proxy.as_ref().map(|endpoint| endpoint.build_id()));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.hold.is_zero() {
            tokio::time::sleep(self.hold).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        (self.respond)(request, call)
    }
}

fn page(status: Option<u16>, content: &str) -> AttemptOutcome {
    AttemptOutcome::Fetched(RawFetchOutcome {
        content: content.to_string(),
        status,
        title: None,
        final_url: None,
    })
}

/// Static page large enough to pass the client-side rendering heuristic.
fn static_page() -> String {
    format!("<html><body>{}</body></html>", "<p>plain server rendered text</p>".repeat(300))
}

fn quiet_settings(retry_count: u32) -> ProxySettings {
    ProxySettings {
        retry_count,
        request_delay_min_ms: 0,
        request_delay_max_ms: 0,
        ..Default::default()
    }
}

fn http_policy(domain: &str) -> DomainPolicy {
    DomainPolicy::for_domain(domain)
        .with_method(MethodPreference::Http)
        .with_delay_ms(0)
}

fn credentials() -> ProxyCredentials {
    ProxyCredentials {
        scheme: "http".into(),
        host: "gate.example.net".into(),
        port: 7000,
        username: "user".into(),
        password: "pass".into(),
    }
}

fn engine_with(store: MemoryStore, executor: Arc<FakeExecutor>, config: EngineConfig) -> FetchEngine {
    FetchEngine::builder()
        .with_config(config)
        .with_store(Arc::new(store))
        .with_executor(executor)
        .build()
}

#[tokio::test]
async fn persistent_rate_limit_exhausts_attempts_without_error() {
    let executor = FakeExecutor::new(|_, _| page(Some(429), "slow down"));
    let store = MemoryStore::with_policies([http_policy("example.com")]).with_settings(quiet_settings(3));
    let engine = engine_with(store, executor.clone(), EngineConfig::default());

    let result = engine.run("https://example.com/item", Some("job-1"), None).await.unwrap();

    assert_eq!(executor.calls(), 4);
    assert_eq!(result.attempts, 4);
    assert!(result.blocked);
    assert_eq!(result.block_reason, Some(BlockReason::HttpStatus(429)));
    assert_eq!(result.block_reason.map(|r| r.to_string()).as_deref(), Some("http_status_429"));
    assert_eq!(result.status, Some(429));
}

#[tokio::test]
async fn http_policy_never_invokes_browser() {
    // tiny SPA shell that would normally trigger escalation
    let executor = FakeExecutor::new(|_, _| page(Some(200), r#"<div id="__next"></div>"#));
    let store = MemoryStore::with_policies([http_policy("spa.example.com")]).with_settings(quiet_settings(2));
    let engine = engine_with(store, executor.clone(), EngineConfig::default());

    let result = engine.run("https://spa.example.com/", None, None).await.unwrap();

    assert_eq!(executor.browser_calls(), 0);
    assert_eq!(result.method_used, FetchMethod::Http);
    assert!(!result.blocked);
}

#[tokio::test(start_paused = true)]
async fn gate_bounds_concurrent_fetches_per_domain() {
    let body = static_page();
    let executor = FakeExecutor::holding(Duration::from_secs(1), move |_, _| page(Some(200), &body));
    let store = MemoryStore::with_policies([http_policy("example.com").with_max_concurrency(2)])
        .with_settings(quiet_settings(0));
    let engine = engine_with(store, executor.clone(), EngineConfig::default());

    let urls: Vec<String> = (0..5).map(|i| format!("https://example.com/page/{i}")).collect();
    let results = join_all(urls.iter().map(|url| engine.run(url, None, None))).await;

    assert!(results.iter().all(|result| result.as_ref().is_ok_and(|r| !r.blocked)));
    assert_eq!(executor.calls(), 5);
    assert!(executor.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(engine.gate().available("example.com"), Some(2));
}

#[tokio::test(start_paused = true)]
async fn lowered_policy_concurrency_applies_to_later_runs() {
    let body = static_page();
    let executor = FakeExecutor::holding(Duration::from_secs(1), move |_, _| page(Some(200), &body));
    let store = MemoryStore::with_policies([http_policy("example.com")]).with_settings(quiet_settings(0));
    let engine = engine_with(store, executor.clone(), EngineConfig::default());

    engine.run("https://example.com/warmup", None, None).await.unwrap();
    assert_eq!(engine.gate().capacity("example.com"), Some(2));

    engine
        .update_policy(
            "example.com",
            &DomainPolicyUpdate {
                max_concurrency: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let urls: Vec<String> = (0..3).map(|i| format!("https://example.com/page/{i}")).collect();
    let results = join_all(urls.iter().map(|url| engine.run(url, None, None))).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(executor.calls(), 4);
    assert_eq!(executor.peak.load(Ordering::SeqCst), 1);
    assert_eq!(engine.gate().capacity("example.com"), Some(1));
}

#[tokio::test]
async fn other_domains_are_not_gated_together() {
    let body = static_page();
    let executor = FakeExecutor::new(move |_, _| page(Some(200), &body));
    let store = MemoryStore::with_policies([
        http_policy("a.example.com").with_max_concurrency(1),
        http_policy("b.example.com").with_max_concurrency(3),
    ])
    .with_settings(quiet_settings(0));
    let engine = engine_with(store, executor, EngineConfig::default());

    engine.run("https://a.example.com/", None, None).await.unwrap();
    engine.run("https://b.example.com/", None, None).await.unwrap();
    assert_eq!(engine.gate().available("a.example.com"), Some(1));
    assert_eq!(engine.gate().available("b.example.com"), Some(3));
}

#[tokio::test(start_paused = true)]
async fn per_job_stickiness_survives_within_ttl_only() {
    let body = static_page();
    let executor = FakeExecutor::new(move |_, _| page(Some(200), &body));
    let store = MemoryStore::with_policies([http_policy("example.com").with_proxy(true)]).with_settings(
        ProxySettings {
            proxy_enabled: true,
            sticky_enabled: true,
            sticky_ttl_seconds: 120,
            rotation_strategy: RotationStrategy::PerJob,
            ..quiet_settings(0)
        },
    );
    let config = EngineConfig {
        proxy: Some(credentials()),
        ..Default::default()
    };
    let engine = engine_with(store, executor.clone(), config);

    engine.run("https://example.com/a", Some("job-9"), None).await.unwrap();
    tokio::time::advance(Duration::from_secs(60)).await;
    let result = engine.run("https://example.com/b", Some("job-9"), None).await.unwrap();
    assert!(result.proxied);
    tokio::time::advance(Duration::from_secs(61)).await;
    engine.run("https://example.com/c", Some("job-9"), None).await.unwrap();

    let ids = executor.proxy_ids();
    assert_eq!(ids.len(), 3);
    assert!(ids.iter().all(Option::is_some));
    assert_eq!(ids[0], ids[1]);
    assert_ne!(ids[1], ids[2]);
}

#[tokio::test]
async fn per_request_rotation_never_reuses_endpoints() {
    let body = static_page();
    let executor = FakeExecutor::new(move |_, _| page(Some(200), &body));
    let store = MemoryStore::with_policies([http_policy("example.com").with_proxy(true)]).with_settings(
        ProxySettings {
            proxy_enabled: true,
            sticky_enabled: true,
            rotation_strategy: RotationStrategy::PerRequest,
            ..quiet_settings(0)
        },
    );
    let config = EngineConfig {
        proxy: Some(credentials()),
        ..Default::default()
    };
    let engine = engine_with(store, executor.clone(), config);

    for _ in 0..3 {
        engine.run("https://example.com/", Some("job-1"), None).await.unwrap();
    }

    let mut ids: Vec<u64> = executor.proxy_ids().into_iter().flatten().collect();
    assert_eq!(ids.len(), 3);
    ids.dedup();
    assert_eq!(ids.len(), 3);
    assert!(engine.proxy_manager().sessions().is_empty());
}

#[tokio::test]
async fn block_clears_sticky_session_and_retries_on_fresh_endpoint() {
    let body = static_page();
    let executor = FakeExecutor::new(move |_, call| {
        if call == 0 {
            page(Some(403), "denied")
        } else {
            page(Some(200), &body)
        }
    });
    let store = MemoryStore::with_policies([http_policy("example.com").with_proxy(true)]).with_settings(
        ProxySettings {
            proxy_enabled: true,
            sticky_enabled: true,
            rotation_strategy: RotationStrategy::PerJob,
            ..quiet_settings(3)
        },
    );
    let config = EngineConfig {
        proxy: Some(credentials()),
        ..Default::default()
    };
    let engine = engine_with(store, executor.clone(), config);

    let result = engine.run("https://example.com/", Some("job-2"), None).await.unwrap();

    assert!(!result.blocked);
    assert_eq!(result.attempts, 2);
    let ids = executor.proxy_ids();
    assert_ne!(ids[0], ids[1]);
}

#[tokio::test]
async fn proxy_disabled_policy_goes_direct_without_sessions() {
    let body = static_page();
    let executor = FakeExecutor::new(move |_, _| page(Some(200), &body));
    let store = MemoryStore::with_policies([http_policy("example.com").with_proxy(false)]).with_settings(
        ProxySettings {
            proxy_enabled: true,
            sticky_enabled: true,
            ..quiet_settings(0)
        },
    );
    let config = EngineConfig {
        proxy: Some(credentials()),
        ..Default::default()
    };
    let engine = engine_with(store, executor.clone(), config);

    let result = engine.run("https://example.com/", Some("job-3"), None).await.unwrap();

    assert!(!result.proxied);
    assert_eq!(executor.proxy_ids(), vec![None]);
    assert!(engine.proxy_manager().sessions().is_empty());
}

#[tokio::test]
async fn auto_method_escalates_client_rendered_pages_within_one_attempt() {
    let full = static_page();
    let executor = FakeExecutor::new(move |request, _| match request.method {
        FetchMethod::Http => page(Some(200), r#"<html><div data-reactroot></div></html>"#),
        FetchMethod::Browser => AttemptOutcome::Fetched(RawFetchOutcome {
            content: full.clone(),
            status: None,
            title: Some("Catalog".into()),
            final_url: Some("https://shop.example.com/catalog".into()),
        }),
    });
    let store = MemoryStore::new().with_settings(quiet_settings(2));
    let engine = engine_with(store, executor.clone(), EngineConfig::default());

    let result = engine.run("https://shop.example.com/catalog", None, None).await.unwrap();

    assert_eq!(result.method_used, FetchMethod::Browser);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.title.as_deref(), Some("Catalog"));
    assert_eq!(result.status, None);
    assert_eq!((executor.http_calls(), executor.browser_calls()), (1, 1));
}

#[tokio::test]
async fn auto_method_keeps_http_content_when_escalation_fails() {
    let executor = FakeExecutor::new(|request, _| match request.method {
        FetchMethod::Http => page(Some(200), "<html><body>short</body></html>"),
        FetchMethod::Browser => AttemptOutcome::Retryable(FetchError::BrowserLaunch("no chrome".into())),
    });
    let store = MemoryStore::new().with_settings(quiet_settings(2));
    let engine = engine_with(store, executor.clone(), EngineConfig::default());

    let result = engine.run("https://example.com/", None, None).await.unwrap();

    assert_eq!(result.method_used, FetchMethod::Http);
    assert_eq!(result.content, "<html><body>short</body></html>");
    assert_eq!(result.attempts, 1);
}

#[tokio::test]
async fn auto_method_falls_back_to_browser_after_transport_error() {
    let full = static_page();
    let executor = FakeExecutor::new(move |request, _| match request.method {
        FetchMethod::Http => AttemptOutcome::Retryable(FetchError::Connect("reset".into())),
        FetchMethod::Browser => page(None, &full),
    });
    let store = MemoryStore::new().with_settings(quiet_settings(2));
    let engine = engine_with(store, executor.clone(), EngineConfig::default());

    let result = engine.run("https://example.com/", None, None).await.unwrap();

    assert_eq!(result.method_used, FetchMethod::Browser);
    assert_eq!(result.attempts, 1);
}

#[tokio::test]
async fn exhausted_transport_errors_are_fatal() {
    let executor = FakeExecutor::new(|_, _| AttemptOutcome::Retryable(FetchError::Timeout("30s".into())));
    let store = MemoryStore::with_policies([http_policy("example.com")]).with_settings(quiet_settings(2));
    let engine = engine_with(store, executor.clone(), EngineConfig::default());

    let err = engine.run("https://example.com/", None, None).await.unwrap_err();

    assert_eq!(executor.calls(), 3);
    assert!(matches!(
        err,
        EngineError::Fetch {
            attempts: 3,
            source: FetchError::Timeout(_)
        }
    ));
}

#[tokio::test]
async fn fatal_outcome_stops_immediately() {
    let executor = FakeExecutor::new(|_, _| AttemptOutcome::Fatal(FetchError::InvalidRequest("bad".into())));
    let store = MemoryStore::with_policies([http_policy("example.com")]).with_settings(quiet_settings(5));
    let engine = engine_with(store, executor.clone(), EngineConfig::default());

    let err = engine.run("https://example.com/", None, None).await.unwrap_err();

    assert_eq!(executor.calls(), 1);
    assert!(matches!(err, EngineError::Fetch { attempts: 1, .. }));
}

#[tokio::test]
async fn transport_error_after_block_surfaces_last_result() {
    let executor = FakeExecutor::new(|_, call| match call {
        0 => page(Some(503), "unavailable"),
        _ => AttemptOutcome::Retryable(FetchError::Connect("refused".into())),
    });
    let store = MemoryStore::with_policies([http_policy("example.com")]).with_settings(quiet_settings(1));
    let engine = engine_with(store, executor.clone(), EngineConfig::default());

    let result = engine.run("https://example.com/", None, None).await.unwrap();

    assert_eq!(executor.calls(), 2);
    assert!(result.blocked);
    assert_eq!(result.block_reason, Some(BlockReason::HttpStatus(503)));
}

#[tokio::test]
async fn marker_blocks_retry_once() {
    let executor = FakeExecutor::new(|_, _| {
        AttemptOutcome::Fetched(RawFetchOutcome {
            content: "<html>please wait</html>".into(),
            status: None,
            title: Some("Attention Required! | Cloudflare".into()),
            final_url: None,
        })
    });
    let store = MemoryStore::with_policies([DomainPolicy::for_domain("example.com")
        .with_method(MethodPreference::Browser)
        .with_delay_ms(0)])
    .with_settings(quiet_settings(3));
    let engine = engine_with(store, executor.clone(), EngineConfig::default());

    let result = engine.run("https://example.com/", None, None).await.unwrap();

    assert_eq!(executor.calls(), 2);
    assert!(result.blocked);
    assert_eq!(result.block_reason, Some(BlockReason::TitleMarker));
    assert_eq!(result.method_used, FetchMethod::Browser);
}

#[tokio::test]
async fn per_call_method_override_wins() {
    let body = static_page();
    let executor = FakeExecutor::new(move |_, _| page(None, &body));
    let store = MemoryStore::with_policies([http_policy("example.com")]).with_settings(quiet_settings(0));
    let engine = engine_with(store, executor.clone(), EngineConfig::default());

    let options = FetchOptions::new().with_method(FetchMethod::Browser);
    let result = engine.run_with("https://example.com/", &options).await.unwrap();

    assert_eq!(result.method_used, FetchMethod::Browser);
    assert_eq!(executor.http_calls(), 0);
}

#[tokio::test]
async fn extraction_failures_yield_empty_structured_data() {
    let body = static_page();
    let executor = FakeExecutor::new(move |_, _| page(Some(200), &body));
    let store = MemoryStore::with_policies([http_policy("example.com")]).with_settings(quiet_settings(0));
    let engine = engine_with(store, executor, EngineConfig::default());

    let failing = |_: &str, _: &str| -> Result<serde_json::Value, ExtractionError> {
        Err(ExtractionError::Other("boom".into()))
    };
    let hook: Arc<dyn ExtractionHook> = Arc::new(failing);
    let result = engine.run("https://example.com/", None, Some(hook)).await.unwrap();
    assert_eq!(result.structured_data, serde_json::json!({}));

    let schema = fetchgate::SchemaExtractor::from_json(&serde_json::json!({
        "fields": [{"name": "first", "selector": "p"}]
    }))
    .unwrap();
    let result = engine
        .run("https://example.com/", None, Some(Arc::new(schema)))
        .await
        .unwrap();
    assert_eq!(
        result.structured_data,
        serde_json::json!({"first": "plain server rendered text"})
    );
}

#[tokio::test]
async fn handlers_observe_blocks_and_retries() {
    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl EventHandler for Recorder {
        fn handle(&self, event: &EngineEvent) {
            let tag = match event {
                EngineEvent::Blocked(block) => format!("blocked:{}", block.reason),
                EngineEvent::Retry(retry) => format!("retry:{}", retry.attempt),
                _ => return,
            };
            self.0.lock().unwrap().push(tag);
        }
    }

    let recorder = Arc::new(Recorder::default());
    let executor = FakeExecutor::new(|_, _| page(Some(403), "no"));
    let store = MemoryStore::with_policies([http_policy("example.com")]).with_settings(quiet_settings(1));
    let engine = FetchEngine::builder()
        .with_store(Arc::new(store))
        .with_executor(executor)
        .with_event_handler(recorder.clone())
        .build();

    engine.run("https://example.com/", None, None).await.unwrap();

    assert_eq!(
        *recorder.0.lock().unwrap(),
        vec!["blocked:http_status_403", "retry:1", "blocked:http_status_403"]
    );
}
