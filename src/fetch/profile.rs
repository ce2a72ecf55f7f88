//! Browser launch profiles.
//!
//! The engine treats fingerprinting as opaque: a provider hands out launch
//! arguments, a window size and scripts to run before any page script.

use rand::seq::SliceRandom;

const COMMON_VIEWPORTS: [(u32, u32); 5] = [
    (1920, 1080),
    (1536, 864),
    (1440, 900),
    (1366, 768),
    (1280, 800),
];

const STEALTH_ARGS: [&str; 11] = [
    "--disable-blink-features=AutomationControlled",
    "--disable-infobars",
    "--disable-dev-shm-usage",
    "--no-first-run",
    "--no-default-browser-check",
    "--disable-background-networking",
    "--disable-sync",
    "--disable-translate",
    "--metrics-recording-only",
    "--no-sandbox",
    "--disable-gpu",
];

const INIT_SCRIPTS: [&str; 3] = [
    r#"Object.defineProperty(navigator, 'webdriver', { get: () => undefined, configurable: true });"#,
    r#"window.chrome = window.chrome || { runtime: {}, loadTimes: function() {}, csi: function() {}, app: {} };"#,
    r#"Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'], configurable: true });"#,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchProfile {
    pub args: Vec<String>,
    pub window: (u32, u32),
    pub init_scripts: Vec<String>,
}

/// Source of launch profiles, consulted once per browser session.
pub trait LaunchProfileProvider: Send + Sync {
    fn profile(&self) -> LaunchProfile;
}

/// Automation-hiding Chromium flags with a randomized common viewport.
#[derive(Debug, Clone, Default)]
pub struct StealthProfile {
    extra_args: Vec<String>,
}

impl StealthProfile {
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl LaunchProfileProvider for StealthProfile {
    fn profile(&self) -> LaunchProfile {
        let window = COMMON_VIEWPORTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(COMMON_VIEWPORTS[0]);

        let mut args: Vec<String> = STEALTH_ARGS.iter().map(|arg| arg.to_string()).collect();
        args.extend(self.extra_args.iter().cloned());

        LaunchProfile {
            args,
            window,
            init_scripts: INIT_SCRIPTS.iter().map(|script| script.to_string()).collect(),
        }
    }
}
