//! Client-side rendering heuristics used for method escalation.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

/// Pages with more script tags than this are assumed to render client-side.
const SCRIPT_TAG_LIMIT: usize = 15;

/// Payloads below this size rarely carry the real content.
const MIN_STATIC_PAYLOAD: usize = 5000;

const SPA_MARKERS: [&str; 3] = ["__next", "data-reactroot", "ng-version"];

static SCRIPT_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"<script\b")
        .case_insensitive(true)
        .build()
        .expect("invalid script tag regex")
});

/// Signals extracted from a plain HTTP payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderSignals {
    pub payload_len: usize,
    pub script_tags: usize,
    pub spa_marker: bool,
}

impl RenderSignals {
    pub fn inspect(html: &str) -> Self {
        Self {
            payload_len: html.len(),
            script_tags: SCRIPT_TAG_RE.find_iter(html).count(),
            spa_marker: SPA_MARKERS.iter().any(|marker| html.contains(marker)),
        }
    }

    pub fn needs_browser(&self) -> bool {
        self.payload_len == 0
            || self.payload_len < MIN_STATIC_PAYLOAD
            || self.script_tags > SCRIPT_TAG_LIMIT
            || self.spa_marker
    }
}

/// Returns true when the payload is empty or looks JS-dependent.
pub fn needs_js_render(html: &str) -> bool {
    RenderSignals::inspect(html).needs_browser()
}
