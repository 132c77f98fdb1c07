use anyhow::{Context, Result};

/// Shared client for the completion endpoint. Per-request timeouts are set by the caller.
pub fn build_http_client() -> Result<reqwest::Client> {
    let allow_system_proxy = std::env::var("MINDLY_ENABLE_SYSTEM_PROXY")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if allow_system_proxy {
        match attempt_build(false) {
            Ok(client) => return Ok(client),
            Err(error) => tracing::warn!(
                "HTTP client initialization with system proxy discovery failed ({}); retrying with no_proxy",
                error
            ),
        }
    }

    attempt_build(true).context("Failed to initialize HTTP client")
}

fn attempt_build(no_proxy: bool) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder();
    if no_proxy {
        builder = builder.no_proxy();
    }
    builder.build()
}
