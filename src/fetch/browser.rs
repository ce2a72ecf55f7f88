//! Headless browser attempts over CDP.
//!
//! Every call launches an isolated Chromium with a throwaway profile
//! directory, routes it through the attempt's proxy, optionally fails heavy
//! resources and tracker requests, renders the page and tears everything
//! down again.

use std::path::PathBuf;
use std::sync::Arc;
#[cfg(feature = "browser")]
use std::time::Duration;

use super::{AttemptOutcome, FetchError, FetchRequest, LaunchProfileProvider};
use crate::config::EngineConfig;

/// Resource types failed when `block_resources` is set.
pub const BLOCKED_RESOURCE_TYPES: [&str; 4] = ["image", "media", "font", "stylesheet"];

/// URL fragments of analytics and ad endpoints failed when `block_resources` is set.
pub const TRACKER_PATTERNS: [&str; 10] = [
    "google-analytics.com",
    "googletagmanager.com",
    "doubleclick.net",
    "googlesyndication.com",
    "facebook.net",
    "connect.facebook.com",
    "hotjar.com",
    "segment.io",
    "scorecardresearch.com",
    "adservice.",
];

/// Whether an intercepted request should be failed instead of continued.
pub fn should_block(resource_type: &str, url: &str) -> bool {
    let kind = resource_type.to_ascii_lowercase();
    if BLOCKED_RESOURCE_TYPES.contains(&kind.as_str()) {
        return true;
    }
    let url = url.to_ascii_lowercase();
    TRACKER_PATTERNS.iter().any(|pattern| url.contains(pattern))
}

#[cfg_attr(not(feature = "browser"), allow(dead_code))]
fn session_dir() -> PathBuf {
    let suffix = hex::encode(rand::random::<[u8; 8]>());
    std::env::temp_dir().join(format!("fetchgate-browser-{suffix}"))
}

#[cfg(feature = "browser")]
pub struct BrowserFetcher {
    profile: Arc<dyn LaunchProfileProvider>,
    executable: Option<PathBuf>,
    headless: bool,
    timeout: Duration,
    settle: Duration,
}

#[cfg(feature = "browser")]
mod session {
    use std::path::Path;

    use chromiumoxide::cdp::browser_protocol::fetch::{
        AuthChallengeResponse, AuthChallengeResponseResponse, ContinueRequestParams,
        ContinueWithAuthParams, EnableParams, EventAuthRequired, EventRequestPaused,
        FailRequestParams, RequestPattern,
    };
    use chromiumoxide::cdp::browser_protocol::network::{ErrorReason, SetUserAgentOverrideParams};
    use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
    use chromiumoxide::{Browser, BrowserConfig, Page};
    use futures::StreamExt;
    use tokio::task::JoinHandle;

    use super::{BrowserFetcher, should_block};
    use crate::fetch::{FetchError, FetchRequest, LaunchProfile, RawFetchOutcome};

    fn navigation(err: impl std::fmt::Display) -> FetchError {
        FetchError::Navigation(err.to_string())
    }

    impl BrowserFetcher {
        pub(super) async fn launch(
            &self,
            request: &FetchRequest,
            profile: &LaunchProfile,
            data_dir: &Path,
        ) -> Result<(Browser, JoinHandle<()>), FetchError> {
            let (width, height) = profile.window;
            let mut builder = BrowserConfig::builder()
                .user_data_dir(data_dir)
                .window_size(width, height)
                .args(profile.args.iter().cloned());

            if let Some(ref path) = self.executable {
                builder = builder.chrome_executable(path);
            }
            if !self.headless {
                builder = builder.with_head();
            }
            if let Some(ref proxy) = request.proxy {
                builder = builder.arg(format!("--proxy-server={}", proxy.server()));
            }

            let config = builder.build().map_err(FetchError::BrowserLaunch)?;
            let (browser, mut handler) = Browser::launch(config)
                .await
                .map_err(|err| FetchError::BrowserLaunch(err.to_string()))?;

            let handler_task = tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if event.is_err() {
                        break;
                    }
                }
            });

            Ok((browser, handler_task))
        }

        pub(super) async fn render(
            &self,
            browser: &Browser,
            request: &FetchRequest,
            profile: &LaunchProfile,
        ) -> Result<RawFetchOutcome, FetchError> {
            let page = browser.new_page("about:blank").await.map_err(navigation)?;

            page.execute(SetUserAgentOverrideParams::new(request.user_agent.clone()))
                .await
                .map_err(navigation)?;
            for script in &profile.init_scripts {
                page.execute(AddScriptToEvaluateOnNewDocumentParams::new(script.clone()))
                    .await
                    .map_err(navigation)?;
            }

            let interceptors = intercept(&page, request).await?;

            log::debug!("rendering {}", request.url);
            let rendered = async {
                page.goto(request.url.as_str()).await.map_err(navigation)?;
                page.wait_for_navigation().await.map_err(navigation)?;
                tokio::time::sleep(self.settle).await;

                let content = page.content().await.map_err(navigation)?;
                let title = page.get_title().await.ok().flatten();
                let final_url = page.url().await.ok().flatten();
                Ok(RawFetchOutcome {
                    content,
                    status: None,
                    title,
                    final_url,
                })
            }
            .await;

            for task in interceptors {
                task.abort();
            }
            if let Err(err) = page.close().await {
                log::debug!("page close failed: {err}");
            }
            rendered
        }
    }

    /// Answer paused requests (fail or continue) and proxy auth challenges.
    async fn intercept(page: &Page, request: &FetchRequest) -> Result<Vec<JoinHandle<()>>, FetchError> {
        if !request.block_resources && request.proxy.is_none() {
            return Ok(Vec::new());
        }

        let mut tasks = Vec::new();
        let mut paused = page
            .event_listener::<EventRequestPaused>()
            .await
            .map_err(navigation)?;
        let block = request.block_resources;
        let listener = page.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                let result = if block && should_block(event.resource_type.as_ref(), &event.request.url) {
                    listener
                        .execute(FailRequestParams::new(
                            event.request_id.clone(),
                            ErrorReason::BlockedByClient,
                        ))
                        .await
                        .map(|_| ())
                } else {
                    listener
                        .execute(ContinueRequestParams::new(event.request_id.clone()))
                        .await
                        .map(|_| ())
                };
                if let Err(err) = result {
                    log::trace!("intercepted request not answered: {err}");
                }
            }
        }));

        if let Some(ref proxy) = request.proxy {
            let credentials = proxy.browser_proxy().clone();
            let mut challenges = page
                .event_listener::<EventAuthRequired>()
                .await
                .map_err(navigation)?;
            let listener = page.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = challenges.next().await {
                    let answer = AuthChallengeResponse::builder()
                        .response(AuthChallengeResponseResponse::ProvideCredentials)
                        .username(credentials.username.clone())
                        .password(credentials.password.clone())
                        .build();
                    let answer = match answer {
                        Ok(answer) => answer,
                        Err(err) => {
                            log::warn!("could not build proxy auth answer: {err}");
                            continue;
                        }
                    };
                    if let Err(err) = listener
                        .execute(ContinueWithAuthParams::new(event.request_id.clone(), answer))
                        .await
                    {
                        log::trace!("proxy auth challenge not answered: {err}");
                    }
                }
            }));
        }

        let enable = EnableParams::builder()
            .pattern(RequestPattern::builder().url_pattern("*").build())
            .handle_auth_requests(request.proxy.is_some())
            .build();
        page.execute(enable).await.map_err(navigation)?;

        Ok(tasks)
    }
}

#[cfg(feature = "browser")]
impl BrowserFetcher {
    pub fn new(config: &EngineConfig, profile: Arc<dyn LaunchProfileProvider>) -> Self {
        Self {
            profile,
            executable: config.chrome_executable.clone(),
            headless: config.headless,
            timeout: config.browser_timeout(),
            settle: config.browser_settle(),
        }
    }

    pub async fn fetch(&self, request: &FetchRequest) -> AttemptOutcome {
        let profile = self.profile.profile();
        let data_dir = session_dir();

        let session = async {
            let (mut browser, handler_task) = self.launch(request, &profile, &data_dir).await?;
            let rendered = self.render(&browser, request, &profile).await;
            if let Err(err) = browser.close().await {
                log::debug!("browser close failed: {err}");
            }
            if let Err(err) = browser.wait().await {
                log::debug!("browser process wait failed: {err}");
            }
            handler_task.abort();
            rendered
        };

        let outcome = match tokio::time::timeout(self.timeout, session).await {
            Ok(Ok(raw)) => AttemptOutcome::Fetched(raw),
            Ok(Err(err)) => AttemptOutcome::Retryable(err),
            Err(_) => AttemptOutcome::Retryable(FetchError::Timeout(format!(
                "browser render exceeded {}ms",
                self.timeout.as_millis()
            ))),
        };

        if let Err(err) = tokio::fs::remove_dir_all(&data_dir).await {
            log::trace!("browser profile dir {} not removed: {err}", data_dir.display());
        }
        outcome
    }
}

// Stub for when browser feature is disabled
#[cfg(not(feature = "browser"))]
pub struct BrowserFetcher {
    _profile: Arc<dyn LaunchProfileProvider>,
}

#[cfg(not(feature = "browser"))]
impl BrowserFetcher {
    pub fn new(_config: &EngineConfig, profile: Arc<dyn LaunchProfileProvider>) -> Self {
        Self { _profile: profile }
    }

    pub async fn fetch(&self, _request: &FetchRequest) -> AttemptOutcome {
        AttemptOutcome::Fatal(FetchError::BrowserLaunch(
            "browser support not compiled; rebuild with --features browser".into(),
        ))
    }
}
