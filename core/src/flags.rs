//! Environment knobs consumed by the engine, parsed once per process.

use std::sync::LazyLock;
use std::time::Duration;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok()?.trim().parse().ok()
}

pub static OPENAI_API_KEY: LazyLock<Option<String>> =
    LazyLock::new(|| std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()));

pub static OPENAI_BASE_URL: LazyLock<String> = LazyLock::new(|| {
    std::env::var("OPENAI_BASE_URL")
        .ok()
        .filter(|v| !v.is_empty())
        .map(|v| v.trim_end_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string())
});

/// Per-request timeout for opening the streamed response.
pub static OPENAI_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_u64("OPENAI_TIMEOUT_MS").unwrap_or(300_000)));

/// Base delay of the exponential backoff used for rate-limit retries.
pub static RATE_LIMIT_RETRY_WAIT: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_millis(env_u64("OPENAI_RATE_LIMIT_RETRY_WAIT_MS").unwrap_or(2_500))
});

/// Path to an SSE fixture file; when set, the client streams from disk
/// instead of the network. Test hook.
pub static QUILL_SSE_FIXTURE: LazyLock<Option<String>> =
    LazyLock::new(|| std::env::var("QUILL_SSE_FIXTURE").ok().filter(|v| !v.is_empty()));
