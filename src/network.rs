//! Network URL constants and helpers.

/// Default REST API base URL (the local development backend).
pub const DEFAULT_API_URL: &str = "http://localhost:8080/api";

/// Default WebSocket URL, derived from [`DEFAULT_API_URL`].
pub const DEFAULT_WS_URL: &str = "ws://localhost:8080/ws";

/// Derive the WebSocket endpoint from a REST API base URL.
///
/// `https://host/api` becomes `wss://host/ws`, `http://host:8080/api/` becomes
/// `ws://host:8080/ws`. Any scheme other than `https` maps to `ws`.
pub fn ws_url_from_api_url(api_url: &str) -> String {
    let scheme = if api_url.starts_with("https") { "wss" } else { "ws" };
    let host = api_url
        .strip_prefix("https://")
        .or_else(|| api_url.strip_prefix("http://"))
        .unwrap_or(api_url);
    let host = host.trim_end_matches('/');
    let host = host.strip_suffix("/api").unwrap_or(host);
    format!("{}://{}/ws", scheme, host)
}

/// Append the session token to a WebSocket URL as the `token` query parameter.
pub fn with_token(url: &str, token: &str) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{}{}token={}", url, sep, urlencoding::encode(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ws_url_matches_api_url() {
        assert_eq!(ws_url_from_api_url(DEFAULT_API_URL), DEFAULT_WS_URL);
    }

    #[test]
    fn test_https_maps_to_wss() {
        assert_eq!(
            ws_url_from_api_url("https://trade.example.com/api/"),
            "wss://trade.example.com/ws"
        );
    }

    #[test]
    fn test_without_api_suffix() {
        assert_eq!(
            ws_url_from_api_url("http://10.0.0.2:9000"),
            "ws://10.0.0.2:9000/ws"
        );
    }

    #[test]
    fn test_with_token_encodes() {
        assert_eq!(
            with_token("ws://localhost:8080/ws", "a b+c"),
            "ws://localhost:8080/ws?token=a%20b%2Bc"
        );
        assert_eq!(
            with_token("ws://h/ws?v=2", "t"),
            "ws://h/ws?v=2&token=t"
        );
    }
}
