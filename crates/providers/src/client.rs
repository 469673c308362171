use courier_core::Error;
use reqwest::{Client, Proxy, StatusCode};
use std::time::Duration;
use tracing::{info, warn};

enum ProxyResolution {
    UseProxy(String),
    /// `proxy = ""` in the backend config disables env proxies too.
    ForceDirectConnect,
    /// Let reqwest read HTTPS_PROXY / HTTP_PROXY.
    None,
}

fn resolve_proxy(backend_proxy: Option<&str>) -> ProxyResolution {
    match backend_proxy.map(str::trim) {
        Some("") => ProxyResolution::ForceDirectConnect,
        Some(p) => ProxyResolution::UseProxy(p.to_string()),
        None => ProxyResolution::None,
    }
}

/// Build the reqwest client for one backend.
pub fn build_http_client(backend_proxy: Option<&str>, api_base: &str, timeout: Duration) -> Client {
    let mut builder = Client::builder().timeout(timeout);

    match resolve_proxy(backend_proxy) {
        ProxyResolution::UseProxy(proxy_url) => match Proxy::all(&proxy_url) {
            Ok(p) => {
                info!(proxy = %proxy_url, api_base = %api_base, "Backend using proxy");
                builder = builder.proxy(p);
            }
            Err(e) => {
                warn!(error = %e, proxy = %proxy_url, "Invalid proxy URL, falling back to direct connect");
            }
        },
        ProxyResolution::ForceDirectConnect => {
            info!(api_base = %api_base, "Backend forced to direct connect");
            builder = builder.no_proxy();
        }
        ProxyResolution::None => {}
    }

    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to build HTTP client, using default");
        Client::new()
    })
}

/// Find the largest byte index <= `max_bytes` that is a valid char boundary.
pub fn truncate_at_char_boundary(s: &str, max_bytes: usize) -> usize {
    if max_bytes >= s.len() {
        return s.len();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

/// Transport-level failures never reached a healthy server.
pub fn transport_error(backend: &str, e: reqwest::Error) -> Error {
    Error::BackendUnavailable(format!("{}: request failed: {}", backend, e))
}

/// Map a non-success HTTP status to the error taxonomy: throttling and server
/// faults gate the backend, everything else is the caller's problem.
pub fn status_error(backend: &str, status: StatusCode, body: &str) -> Error {
    let end = truncate_at_char_boundary(body, 500);
    let detail = format!("{}: API error {}: {}", backend, status, &body[..end]);
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        Error::BackendUnavailable(detail)
    } else {
        Error::Provider(detail)
    }
}
