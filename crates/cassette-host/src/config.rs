//! Loader configuration.

/// Default number of 64 KiB pages for a host-supplied linear memory.
pub const DEFAULT_MEMORY_INITIAL_PAGES: u32 = 16;

/// Default max cassette binary size: 50 MB.
pub const DEFAULT_MAX_WASM_SIZE_MB: u64 = 50;

/// Default hard bound on any string moved across the boundary: 10 MiB.
pub const DEFAULT_MAX_STRING_LEN: usize = 10 * 1024 * 1024;

/// Default timeout for fetching a cassette over HTTP.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Configuration shared by every cassette a loader produces.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Initial size of a linear memory the host supplies to the guest.
    pub memory_initial_pages: u32,
    /// Whether handles suppress repeated event ids within a subscription.
    pub deduplicate_events: bool,
    /// Maximum accepted binary size in bytes.
    pub max_wasm_size: u64,
    /// Upper bound for string reads, including the null-terminator scan.
    pub max_string_len: usize,
    /// HTTP timeout for URL sources.
    pub fetch_timeout_secs: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            memory_initial_pages: DEFAULT_MEMORY_INITIAL_PAGES,
            deduplicate_events: true,
            max_wasm_size: DEFAULT_MAX_WASM_SIZE_MB * 1024 * 1024,
            max_string_len: DEFAULT_MAX_STRING_LEN,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
        }
    }
}

impl LoaderConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self {
            memory_initial_pages: std::env::var("CASSETTE_MEMORY_INITIAL_PAGES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MEMORY_INITIAL_PAGES),
            deduplicate_events: std::env::var("CASSETTE_DEDUPLICATE_EVENTS")
                .map(|v| !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
            max_wasm_size: std::env::var("CASSETTE_MAX_WASM_SIZE_MB")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(DEFAULT_MAX_WASM_SIZE_MB)
                * 1024
                * 1024,
            max_string_len: std::env::var("CASSETTE_MAX_STRING_LEN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_STRING_LEN),
            fetch_timeout_secs: std::env::var("CASSETTE_FETCH_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS),
        }
    }
}
