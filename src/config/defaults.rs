//! Default values for configuration

/// Default environment variable name for the Telegram bot token
pub fn default_token_env() -> String {
    "SOUNDWATCH_TELEGRAM_TOKEN".to_string()
}

/// Default Telegram Bot API base URL
pub fn default_telegram_api_url() -> String {
    std::env::var("SOUNDWATCH_TELEGRAM_API_URL")
        .unwrap_or_else(|_| "https://api.telegram.org".to_string())
}

/// Default poll interval in seconds (3 minutes)
pub fn default_poll_interval() -> u64 {
    180
}

/// Default cap on notifications for the first-ever poll of a target
pub fn default_first_poll_cap() -> usize {
    3
}

/// Default bound on the persisted set of last-seen item ids per target
pub fn default_max_seen_ids() -> usize {
    200
}

/// Default maximum number of items taken from a fetched page
pub fn default_fetch_limit() -> usize {
    50
}

/// Default base URL of the remote platform
pub fn default_fetch_base_url() -> String {
    std::env::var("SOUNDWATCH_FETCH_BASE_URL")
        .unwrap_or_else(|_| "https://www.tiktok.com".to_string())
}

/// Default user agent
pub fn default_fetch_user_agent() -> String {
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36"
        .to_string()
}

/// Default request timeout in seconds
pub fn default_fetch_timeout() -> u64 {
    30
}

/// Default outbound rate limit (requests per second)
pub fn default_fetch_rate_limit() -> u32 {
    1
}
