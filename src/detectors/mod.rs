//! Block detection.
//!
//! Classifies a fetch outcome as served or silently blocked using the status
//! code first, then the rendered title, then the page body. Pure functions
//! only; the orchestrator decides what to do with a verdict.

pub mod render;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use render::{RenderSignals, needs_js_render};

/// Status codes treated as block responses (and as retryable).
pub const BLOCK_STATUSES: [u16; 3] = [403, 429, 503];

const TITLE_MARKERS: [&str; 4] = [
    "access denied",
    "forbidden",
    "attention required",
    "cloudflare",
];

const BODY_MARKERS: [&str; 5] = [
    "cf-chl",
    "captcha",
    "access denied",
    "forbidden",
    "cloudflare",
];

/// Why a response was classified as blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum BlockReason {
    /// One of [`BLOCK_STATUSES`].
    HttpStatus(u16),
    TitleMarker,
    HtmlMarker,
}

impl BlockReason {
    /// Status-based blocks are worth retrying on a fresh session; marker-based
    /// ones usually mean the page itself is a challenge.
    pub fn is_status(&self) -> bool {
        matches!(self, BlockReason::HttpStatus(_))
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::HttpStatus(status) => write!(f, "http_status_{status}"),
            BlockReason::TitleMarker => f.write_str("title_block_marker"),
            BlockReason::HtmlMarker => f.write_str("html_block_marker"),
        }
    }
}

impl From<BlockReason> for String {
    fn from(reason: BlockReason) -> Self {
        reason.to_string()
    }
}

impl TryFrom<String> for BlockReason {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "title_block_marker" => Ok(BlockReason::TitleMarker),
            "html_block_marker" => Ok(BlockReason::HtmlMarker),
            other => other
                .strip_prefix("http_status_")
                .and_then(|code| code.parse().ok())
                .map(BlockReason::HttpStatus)
                .ok_or_else(|| format!("unknown block reason `{other}`")),
        }
    }
}

/// Verdict returned by [`classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockVerdict {
    pub blocked: bool,
    pub reason: Option<BlockReason>,
}

impl BlockVerdict {
    const fn clear() -> Self {
        Self {
            blocked: false,
            reason: None,
        }
    }

    const fn blocked(reason: BlockReason) -> Self {
        Self {
            blocked: true,
            reason: Some(reason),
        }
    }
}

/// Classify a response. First match wins: status, then title, then body.
pub fn classify(status: Option<u16>, title: Option<&str>, content: Option<&str>) -> BlockVerdict {
    if let Some(code) = status
        && BLOCK_STATUSES.contains(&code)
    {
        return BlockVerdict::blocked(BlockReason::HttpStatus(code));
    }

    if let Some(title) = title
        && contains_marker(title, &TITLE_MARKERS)
    {
        return BlockVerdict::blocked(BlockReason::TitleMarker);
    }

    if let Some(content) = content
        && contains_marker(content, &BODY_MARKERS)
    {
        return BlockVerdict::blocked(BlockReason::HtmlMarker);
    }

    BlockVerdict::clear()
}

fn contains_marker(haystack: &str, markers: &[&str]) -> bool {
    let lowered = haystack.to_lowercase();
    markers.iter().any(|marker| lowered.contains(marker))
}
