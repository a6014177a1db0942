use url::Url;

use crate::transport::TransportError;

pub const DEFAULT_PATH: &str = "/ws";

/// Where to reach the grid server's websocket endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketConfig {
    /// Full URL or bare `host:port`.
    pub url: String,
    /// Path appended when `url` has none of its own.
    pub path: Option<String>,
    /// Whether to use `wss://` when `url` carries no scheme.
    pub use_tls: bool,
}

impl WebSocketConfig {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        // Schemeless remote hosts default to TLS; loopback stays plain.
        let use_tls = url.starts_with("wss://")
            || (!url.starts_with("ws://") && !is_loopback(&url));
        Self {
            url,
            path: None,
            use_tls,
        }
    }

    /// Endpoint for a page served from `host`: `wss` when the page itself came
    /// over https, `ws` otherwise, always on the `/ws` path.
    pub fn for_host(host: &str, page_is_secure: bool) -> Self {
        Self {
            url: host.to_string(),
            path: Some(DEFAULT_PATH.to_string()),
            use_tls: page_is_secure,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn build_url(&self) -> String {
        let mut url = self.url.trim().to_string();

        if !url.contains("://") {
            url = if self.use_tls {
                format!("wss://{url}")
            } else {
                format!("ws://{url}")
            };
        }

        // localhost may resolve to ::1 while the server binds IPv4 only.
        if url.contains("://localhost") {
            url = url.replacen("://localhost", "://127.0.0.1", 1);
        }

        if let Some(path) = self.path.as_deref() {
            let has_path = url
                .split_once("://")
                .map(|(_, rest)| rest.contains('/'))
                .unwrap_or(false);
            if !has_path {
                if !path.starts_with('/') {
                    url.push('/');
                }
                url.push_str(path);
            }
        }

        url
    }

    /// Build and validate the final URL.
    pub fn endpoint(&self) -> Result<Url, TransportError> {
        let raw = self.build_url();
        let url = Url::parse(&raw).map_err(|err| TransportError::InvalidEndpoint {
            endpoint: raw.clone(),
            reason: err.to_string(),
        })?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(TransportError::InvalidEndpoint {
                    endpoint: raw,
                    reason: format!("unsupported scheme {other}"),
                });
            }
        }
        if url.host_str().is_none() {
            return Err(TransportError::InvalidEndpoint {
                endpoint: raw,
                reason: "missing host".into(),
            });
        }
        Ok(url)
    }
}

fn is_loopback(url: &str) -> bool {
    url.contains("127.0.0.1") || url.contains("localhost") || url.contains("[::1]")
}
