use once_cell::sync::Lazy;
use std::env;

pub static BASE_URL: Lazy<String> = Lazy::new(|| {
    env::var("VINTED_BASE_URL").unwrap_or_else(|_| "https://www.vinted.co.uk".to_string())
});

// Browser profile presented on every request. UA version and Client Hints
// must stay aligned with each other.
pub const CHROME_VERSION: &str = "136";

pub static USER_AGENT: Lazy<String> = Lazy::new(|| {
    env::var("VINTED_USER_AGENT").unwrap_or_else(|_| {
        format!(
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
             AppleWebKit/537.36 (KHTML, like Gecko) Chrome/{CHROME_VERSION}.0.0.0 Safari/537.36"
        )
    })
});

pub static SEC_CH_UA: Lazy<String> = Lazy::new(|| {
    format!(
        "\"Chromium\";v=\"{CHROME_VERSION}\", \"Google Chrome\";v=\"{CHROME_VERSION}\", \
         \"Not.A/Brand\";v=\"24\""
    )
});

/// Outbound pacing: a flat base delay plus random jitter before each
/// platform call. Zero base means no delay (the caller controls cadence).
pub static PACE_BASE_MS: Lazy<u64> = Lazy::new(|| {
    env::var("VINTED_PACE_BASE_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
});

pub static PACE_JITTER_MS: Lazy<u64> = Lazy::new(|| {
    env::var("VINTED_PACE_JITTER_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1000)
});

/// Pause between deleting the old listing and publishing its replacement
/// during a relist.
pub static POST_DELETE_PAUSE_SECS: Lazy<u64> = Lazy::new(|| {
    env::var("VINTED_POST_DELETE_PAUSE_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(10)
});
