//! High level fetch orchestration.
//!
//! Wires together the policy resolver, settings cache, proxy rotation,
//! concurrency gate, fetch executor and block detector into one retry loop
//! that always hands back a result (possibly blocked) or a typed error.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use url::Url;

use crate::config::{ConfigError, EngineConfig};
use crate::detectors::{self, BlockReason, BlockVerdict};
use crate::extract::ExtractionHook;
use crate::fetch::{
	AttemptOutcome, DefaultExecutor, FetchError, FetchExecutor, FetchRequest, LaunchProfileProvider,
	RawFetchOutcome, StealthProfile,
};
use crate::modules::events::{
	AttemptFinishedEvent, AttemptStartedEvent, BlockEvent, EngineEvent, ErrorEvent,
	EscalationEvent, EventDispatcher, EventHandler, LoggingHandler, RetryEvent,
};
use crate::modules::gate::{ConcurrencyGate, GateError};
use crate::modules::proxy::{ProxyEndpoint, ProxyManager, SessionKey, rotation_decision};
use crate::modules::timing::{self, DelayStrategy};
use crate::policy::settings::{ProxySettings, ProxySettingsUpdate, SettingsCache, SettingsError};
use crate::policy::{
	DomainPolicy, DomainPolicyUpdate, FetchMethod, PolicyResolver, PolicySource, ResolvedPolicy,
	normalize_domain,
};
use crate::storage::{MemoryStore, PolicyStore, SettingsSource, StoreError};

/// Result alias used across the orchestration layer.
pub type EngineResult<T> = Result<T, EngineError>;

/// High-level error surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum EngineError {
	#[error("invalid url {url}: {source}")]
	InvalidUrl {
		url: String,
		#[source]
		source: url::ParseError,
	},
	#[error("url has no host: {0}")]
	MissingHost(String),
	#[error("storage error: {0}")]
	Store(#[from] StoreError),
	#[error("invalid settings: {0}")]
	Settings(#[from] SettingsError),
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	#[error("concurrency gate error: {0}")]
	Gate(#[from] GateError),
	#[error("fetch failed after {attempts} attempt(s): {source}")]
	Fetch {
		attempts: u32,
		#[source]
		source: FetchError,
	},
}

/// Final outcome of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchResult {
	pub url: String,
	pub final_url: Option<String>,
	pub content: String,
	pub title: Option<String>,
	pub status: Option<u16>,
	pub method_used: FetchMethod,
	pub blocked: bool,
	pub block_reason: Option<BlockReason>,
	/// Attempts consumed, escalations excluded.
	pub attempts: u32,
	pub proxied: bool,
	pub structured_data: Value,
}

impl FetchResult {
	fn from_raw(url: &str, raw: RawFetchOutcome, method: FetchMethod, verdict: BlockVerdict) -> Self {
		Self {
			url: url.to_string(),
			final_url: raw.final_url,
			content: raw.content,
			title: raw.title,
			status: raw.status,
			method_used: method,
			blocked: verdict.blocked,
			block_reason: verdict.reason,
			attempts: 0,
			proxied: false,
			structured_data: Value::Object(Default::default()),
		}
	}
}

/// Per-call options.
#[derive(Clone, Default)]
pub struct FetchOptions {
	pub job_id: Option<String>,
	/// Beats every policy and setting.
	pub method: Option<FetchMethod>,
	pub extraction: Option<Arc<dyn ExtractionHook>>,
}

impl FetchOptions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
		self.job_id = Some(job_id.into());
		self
	}

	pub fn with_method(mut self, method: FetchMethod) -> Self {
		self.method = Some(method);
		self
	}

	pub fn with_extraction(mut self, hook: Arc<dyn ExtractionHook>) -> Self {
		self.extraction = Some(hook);
		self
	}
}

/// Everything one attempt needs, resolved through the precedence chain.
#[derive(Debug, Clone)]
pub struct AttemptPlan {
	pub attempt: u32,
	/// `None` means HTTP first with browser escalation.
	pub method: Option<FetchMethod>,
	pub user_agent: String,
	pub block_resources: bool,
	pub concurrency: usize,
	pub delay: DelayStrategy,
	pub proxy: Option<ProxyEndpoint>,
}

impl AttemptPlan {
	fn request(&self, url: &str, method: FetchMethod) -> FetchRequest {
		FetchRequest {
			url: url.to_string(),
			method,
			proxy: self.proxy.clone(),
			user_agent: self.user_agent.clone(),
			block_resources: self.block_resources,
		}
	}
}

/// Fluent builder for [`FetchEngine`].
pub struct FetchEngineBuilder {
	config: EngineConfig,
	policies: Option<Arc<dyn PolicyStore>>,
	settings: Option<Arc<dyn SettingsSource>>,
	executor: Option<Arc<dyn FetchExecutor>>,
	profile: Option<Arc<dyn LaunchProfileProvider>>,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl FetchEngineBuilder {
	pub fn new() -> Self {
		Self {
			config: EngineConfig::default(),
			policies: None,
			settings: None,
			executor: None,
			profile: None,
			handlers: Vec::new(),
		}
	}

	pub fn with_config(mut self, config: EngineConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_policy_store(mut self, store: Arc<dyn PolicyStore>) -> Self {
		self.policies = Some(store);
		self
	}

	pub fn with_settings_source(mut self, source: Arc<dyn SettingsSource>) -> Self {
		self.settings = Some(source);
		self
	}

	/// One backend for both policies and settings.
	pub fn with_store<S>(self, store: Arc<S>) -> Self
	where
		S: PolicyStore + SettingsSource + 'static,
	{
		self.with_policy_store(store.clone()).with_settings_source(store)
	}

	pub fn with_executor(mut self, executor: Arc<dyn FetchExecutor>) -> Self {
		self.executor = Some(executor);
		self
	}

	pub fn with_launch_profile(mut self, profile: Arc<dyn LaunchProfileProvider>) -> Self {
		self.profile = Some(profile);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn build(self) -> FetchEngine {
		let memory = Arc::new(MemoryStore::new());
		let policies: Arc<dyn PolicyStore> = match self.policies {
			Some(store) => store,
			None => memory.clone(),
		};
		let settings: Arc<dyn SettingsSource> = match self.settings {
			Some(source) => source,
			None => memory,
		};

		let executor: Arc<dyn FetchExecutor> = match self.executor {
			Some(executor) => executor,
			None => {
				let profile: Arc<dyn LaunchProfileProvider> = match self.profile {
					Some(profile) => profile,
					None => Arc::new(StealthProfile::default()),
				};
				Arc::new(DefaultExecutor::with_profile(&self.config, profile))
			}
		};

		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		for handler in self.handlers {
			events.register_handler(handler);
		}

		if let Some(ref credentials) = self.config.proxy
			&& !credentials.is_complete()
		{
			log::warn!("proxy credentials configured but incomplete; requests will go direct");
		}

		FetchEngine {
			resolver: PolicyResolver::new(policies),
			settings_source: settings.clone(),
			settings: SettingsCache::with_ttl(settings, self.config.settings_ttl()),
			proxies: ProxyManager::new(self.config.proxy.clone()),
			gate: ConcurrencyGate::new(),
			executor,
			events,
			config: self.config,
		}
	}
}

impl Default for FetchEngineBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Main fetch orchestrator. Build once and share by reference.
pub struct FetchEngine {
	config: EngineConfig,
	resolver: PolicyResolver,
	settings_source: Arc<dyn SettingsSource>,
	settings: SettingsCache,
	proxies: ProxyManager,
	gate: ConcurrencyGate,
	executor: Arc<dyn FetchExecutor>,
	events: EventDispatcher,
}

impl FetchEngine {
	pub fn builder() -> FetchEngineBuilder {
		FetchEngineBuilder::new()
	}

	/// Engine over `store` with configuration taken from the environment.
	pub fn from_env<S>(store: Arc<S>) -> EngineResult<Self>
	where
		S: PolicyStore + SettingsSource + 'static,
	{
		let config = EngineConfig::from_env()?;
		Ok(Self::builder().with_config(config).with_store(store).build())
	}

	pub fn config(&self) -> &EngineConfig {
		&self.config
	}

	pub fn proxy_manager(&self) -> &ProxyManager {
		&self.proxies
	}

	pub fn gate(&self) -> &ConcurrencyGate {
		&self.gate
	}

	/// Fetch `url` once for a job.
	pub async fn run(
		&self,
		url: &str,
		job_id: Option<&str>,
		extraction: Option<Arc<dyn ExtractionHook>>,
	) -> EngineResult<FetchResult> {
		let options = FetchOptions {
			job_id: job_id.map(str::to_string),
			method: None,
			extraction,
		};
		self.run_with(url, &options).await
	}

	pub async fn run_with(&self, url: &str, options: &FetchOptions) -> EngineResult<FetchResult> {
		let parsed = Url::parse(url).map_err(|source| EngineError::InvalidUrl {
			url: url.to_string(),
			source,
		})?;
		let host = parsed
			.host_str()
			.ok_or_else(|| EngineError::MissingHost(url.to_string()))?;
		let domain = normalize_domain(host);
		let session_key = SessionKey::derive(options.job_id.as_deref(), Some(url));

		let max_attempts = self.current_settings().await.max_attempts();
		let mut last_result: Option<FetchResult> = None;
		let mut last_error: Option<FetchError> = None;
		let mut attempts = 0;

		for attempt in 0..max_attempts {
			attempts = attempt + 1;
			let is_last = attempts == max_attempts;

			let resolved = self.resolver.resolve(&domain).await?;
			let settings = self.current_settings().await;
			let plan = self.plan(attempt, &resolved, &settings, options, &session_key);

			let _permit = self.gate.acquire(&domain, plan.concurrency).await?;
			timing::pause(plan.delay).await;

			let (outcome, method_used) = self.attempt(url, &domain, &plan).await;

			match outcome {
				AttemptOutcome::Fatal(err) => {
					self.report_error(&domain, &err);
					self.proxies.clear_session(&session_key);
					return match last_result {
						Some(result) => Ok(self.finish(result, attempts, url, options)),
						None => Err(EngineError::Fetch {
							attempts,
							source: err,
						}),
					};
				}
				AttemptOutcome::Retryable(err) => {
					self.report_error(&domain, &err);
					self.proxies.clear_session(&session_key);
					if !is_last {
						self.schedule_retry(&domain, attempt, err.to_string());
					}
					last_error = Some(err);
				}
				AttemptOutcome::Fetched(raw) => {
					let verdict = detectors::classify(raw.status, raw.title.as_deref(), Some(&raw.content));
					let mut result = FetchResult::from_raw(url, raw, method_used, verdict);
					result.proxied = plan.proxy.is_some();

					let Some(reason) = verdict.reason.filter(|_| verdict.blocked) else {
						return Ok(self.finish(result, attempts, url, options));
					};

					// status blocks keep retrying; marker blocks get one fresh session
					let will_retry = !is_last && (reason.is_status() || attempt == 0);
					self.events.dispatch(EngineEvent::Blocked(BlockEvent {
						domain: domain.clone(),
						attempt,
						reason,
						will_retry,
						timestamp: Utc::now(),
					}));
					self.proxies.clear_session(&session_key);

					if !will_retry {
						return Ok(self.finish(result, attempts, url, options));
					}
					self.schedule_retry(&domain, attempt, reason.to_string());
					last_result = Some(result);
				}
			}
		}

		match (last_result, last_error) {
			(Some(result), _) => Ok(self.finish(result, attempts, url, options)),
			(None, Some(source)) => Err(EngineError::Fetch { attempts, source }),
			(None, None) => Err(EngineError::Fetch {
				attempts,
				source: FetchError::Transport("no attempt was made".into()),
			}),
		}
	}

	/// Resolve the precedence chain for one attempt and pick its proxy.
	pub fn plan(
		&self,
		attempt: u32,
		resolved: &ResolvedPolicy,
		settings: &ProxySettings,
		options: &FetchOptions,
		session_key: &SessionKey,
	) -> AttemptPlan {
		let policy = resolved.effective();

		let method = options
			.method
			.or_else(|| policy.method.resolved())
			.or_else(|| settings.method_policy.resolved());

		let stored = (resolved.source == PolicySource::Stored && resolved.policy.enabled)
			.then_some(&resolved.policy);
		let delay = DelayStrategy::select(stored, settings);

		let proxy = if resolved.forbids_proxy() {
			None
		} else {
			let decision = rotation_decision(settings.rotation_strategy, session_key, attempt);
			self.proxies
				.get_proxy(settings, decision.key.as_ref(), decision.force_new)
		};

		AttemptPlan {
			attempt,
			method,
			user_agent: policy
				.user_agent
				.clone()
				.unwrap_or_else(|| self.config.default_user_agent.clone()),
			block_resources: policy.block_resources,
			concurrency: policy.concurrency(),
			delay,
			proxy,
		}
	}

	/// Insert or edit the policy for `domain`.
	pub async fn update_policy(
		&self,
		domain: &str,
		update: &DomainPolicyUpdate,
	) -> EngineResult<DomainPolicy> {
		let store = self.resolver.store();
		let mut policy = store
			.get(domain)
			.await?
			.unwrap_or_else(|| DomainPolicy::for_domain(domain));
		update.apply(&mut policy);
		Ok(store.upsert(policy).await?)
	}

	/// Validate, persist and publish a settings change.
	pub async fn update_settings(&self, update: &ProxySettingsUpdate) -> EngineResult<ProxySettings> {
		let current = self
			.settings_source
			.load_settings()
			.await?
			.unwrap_or_default();
		let next = update.apply(&current)?;
		self.settings_source.save_settings(&next).await?;
		self.settings.invalidate().await;
		Ok(next)
	}

	async fn current_settings(&self) -> ProxySettings {
		let mut settings = self.settings.get().await;
		if let Some(enabled) = self.config.proxy_enabled_override {
			settings.proxy_enabled = enabled;
		}
		settings
	}

	/// One attempt, including an in-attempt escalation to the browser when the
	/// method is unresolved.
	async fn attempt(&self, url: &str, domain: &str, plan: &AttemptPlan) -> (AttemptOutcome, FetchMethod) {
		let Some(method) = plan.method else {
			return self.attempt_auto(url, domain, plan).await;
		};
		(self.execute(url, domain, plan, method).await, method)
	}

	async fn attempt_auto(&self, url: &str, domain: &str, plan: &AttemptPlan) -> (AttemptOutcome, FetchMethod) {
		let http = self.execute(url, domain, plan, FetchMethod::Http).await;

		let escalation = match &http {
			AttemptOutcome::Fetched(raw) => {
				let verdict = detectors::classify(raw.status, None, Some(&raw.content));
				(!verdict.blocked && detectors::needs_js_render(&raw.content))
					.then(|| "client-side rendering detected".to_string())
			}
			AttemptOutcome::Retryable(err) | AttemptOutcome::Fatal(err) => {
				Some(format!("plain fetch failed: {err}"))
			}
		};
		let Some(reason) = escalation else {
			return (http, FetchMethod::Http);
		};

		self.events.dispatch(EngineEvent::Escalation(EscalationEvent {
			url: url.to_string(),
			from: FetchMethod::Http,
			to: FetchMethod::Browser,
			reason,
			timestamp: Utc::now(),
		}));

		match self.execute(url, domain, plan, FetchMethod::Browser).await {
			rendered @ AttemptOutcome::Fetched(_) => (rendered, FetchMethod::Browser),
			AttemptOutcome::Retryable(err) | AttemptOutcome::Fatal(err) => {
				log::warn!("browser escalation for {url} failed: {err}");
				match http {
					AttemptOutcome::Fatal(original) => {
						(AttemptOutcome::Retryable(original), FetchMethod::Http)
					}
					other => (other, FetchMethod::Http),
				}
			}
		}
	}

	async fn execute(
		&self,
		url: &str,
		domain: &str,
		plan: &AttemptPlan,
		method: FetchMethod,
	) -> AttemptOutcome {
		self.events.dispatch(EngineEvent::AttemptStarted(AttemptStartedEvent {
			url: url.to_string(),
			domain: domain.to_string(),
			attempt: plan.attempt,
			method,
			proxy: plan.proxy.as_ref().map(ProxyEndpoint::to_string),
			timestamp: Utc::now(),
		}));

		let started = Instant::now();
		let outcome = self.executor.fetch(&plan.request(url, method)).await;
		let latency: Duration = started.elapsed();

		self.events.dispatch(EngineEvent::AttemptFinished(AttemptFinishedEvent {
			url: url.to_string(),
			domain: domain.to_string(),
			attempt: plan.attempt,
			method,
			status: outcome.fetched().and_then(|raw| raw.status),
			latency,
			timestamp: Utc::now(),
		}));
		outcome
	}

	fn finish(&self, mut result: FetchResult, attempts: u32, url: &str, options: &FetchOptions) -> FetchResult {
		result.attempts = attempts;
		if let Some(ref hook) = options.extraction
			&& !result.content.is_empty()
		{
			result.structured_data = match hook.extract(&result.content, url) {
				Ok(data) => data,
				Err(err) => {
					log::warn!("extraction for {url} failed: {err}");
					Value::Object(Default::default())
				}
			};
		}
		result
	}

	fn schedule_retry(&self, domain: &str, attempt: u32, reason: String) {
		self.events.dispatch(EngineEvent::Retry(RetryEvent {
			domain: domain.to_string(),
			attempt: attempt + 1,
			reason,
			timestamp: Utc::now(),
		}));
	}

	fn report_error(&self, domain: &str, err: &FetchError) {
		self.events.dispatch(EngineEvent::Error(ErrorEvent {
			domain: domain.to_string(),
			error: err.to_string(),
			timestamp: Utc::now(),
		}));
	}
}
