use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, ClientBuilder};

/// Builds an HTTP client with progressively relaxed configuration, logging
/// which tier succeeded. Mirrors the host application's own fallback ladder
/// for constructing its model-provider client: a fully configured client
/// (rustls, explicit connect/read timeouts) first, then fewer knobs, then a
/// bare client as a last resort — never a hard failure to construct a
/// client at all.
pub fn build_http_client(overall_timeout: Duration, connect_timeout: Duration) -> Client {
    let mut headers = HeaderMap::new();
    headers.insert("Accept-Encoding", "identity".parse().unwrap());

    if let Ok(client) = ClientBuilder::new()
        .timeout(overall_timeout)
        .connect_timeout(connect_timeout)
        .danger_accept_invalid_certs(false)
        .use_rustls_tls()
        .default_headers(headers.clone())
        .build()
    {
        log::info!("[http] client built: full config (rustls, timeout {overall_timeout:?})");
        return client;
    }

    if let Ok(client) = ClientBuilder::new()
        .timeout(overall_timeout)
        .connect_timeout(connect_timeout)
        .danger_accept_invalid_certs(false)
        .default_headers(headers.clone())
        .build()
    {
        log::warn!("[http] client built: simplified TLS config");
        return client;
    }

    if let Ok(client) = ClientBuilder::new()
        .timeout(overall_timeout)
        .default_headers(headers.clone())
        .build()
    {
        log::warn!("[http] client built: timeout-only config");
        return client;
    }

    log::warn!("[http] all client configs failed, falling back to default client");
    Client::new()
}
