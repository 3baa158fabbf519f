use reqwest::Client;
use std::time::Duration;

/// Shared outbound HTTP client. Every upstream call (AmoCRM, permit
/// registry, image proxy, day classifier) relies on these timeouts; the
/// image proxy additionally enforces its own polling deadline.
pub fn build_client() -> Client {
    let timeout = env_secs("HTTP_TIMEOUT_SECS", 15);
    let connect = env_secs("HTTP_CONNECT_TIMEOUT_SECS", 5);
    Client::builder()
        .user_agent(concat!("permit-track-rs/", env!("CARGO_PKG_VERSION")))
        .timeout(timeout)
        .connect_timeout(connect)
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn env_secs(name: &str, default: u64) -> Duration {
    let secs = std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default);
    Duration::from_secs(secs)
}
