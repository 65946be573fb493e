//! Shared proxy configuration module
//!
//! Every outbound platform client (Telegram Bot API, Feishu Open API, media
//! downloads) is built through `build_client_with_proxy`, so a single
//! `proxySettings` block in the bridge config routes all of them.
//!
//! Note: Localhost connections always bypass proxy (NO_PROXY is automatically set).

use serde::{Deserialize, Serialize};

/// Default proxy protocol (when not specified in config)
const DEFAULT_PROXY_PROTOCOL: &str = "http";
/// Default proxy host (when not specified in config)
const DEFAULT_PROXY_HOST: &str = "127.0.0.1";
/// Default proxy port (when not specified in config)
const DEFAULT_PROXY_PORT: u16 = 7890;

/// Loopback hosts that never go through the proxy
const LOOPBACK_NO_PROXY: &str = "localhost,localhost.localdomain,127.0.0.1,127.0.0.0/8,::1,[::1]";

/// Proxy settings from the bridge config file
///
/// # Example JSON
/// ```json
/// {
///   "proxySettings": {
///     "enabled": true,
///     "protocol": "http",
///     "host": "127.0.0.1",
///     "port": 7890
///   }
/// }
/// ```
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxySettings {
    /// Whether proxy is enabled
    pub enabled: bool,
    /// Proxy protocol: "http", "https", or "socks5"
    pub protocol: Option<String>,
    /// Proxy host (IP or domain)
    pub host: Option<String>,
    /// Proxy port (1-65535)
    pub port: Option<u16>,
}

/// Get proxy URL string from settings with validation
pub fn get_proxy_url(settings: &ProxySettings) -> Result<String, String> {
    let protocol = settings.protocol.as_deref().unwrap_or(DEFAULT_PROXY_PROTOCOL);
    if !["http", "https", "socks5"].contains(&protocol) {
        return Err(format!(
            "Invalid proxy protocol '{}'. Supported: http, https, socks5",
            protocol
        ));
    }

    let port = settings.port.unwrap_or(DEFAULT_PROXY_PORT);
    if port == 0 {
        return Err(format!(
            "Invalid proxy port: {}. Port must be between 1 and 65535",
            port
        ));
    }

    let host = settings.host.as_deref().unwrap_or(DEFAULT_PROXY_HOST);

    Ok(format!("{}://{}:{}", protocol, host, port))
}

/// Build a reqwest client with the user's proxy configuration
/// - If proxy is enabled, use it for external requests
/// - Always exclude localhost/127.0.0.1/::1 from proxy
pub fn build_client_with_proxy(
    builder: reqwest::ClientBuilder,
    settings: Option<&ProxySettings>,
) -> Result<reqwest::Client, String> {
    let final_builder = match settings.filter(|p| p.enabled) {
        Some(proxy_settings) => {
            let proxy_url = get_proxy_url(proxy_settings)?;
            log::info!("[proxy_config] Using proxy for external requests: {}", proxy_url);

            let proxy = reqwest::Proxy::all(&proxy_url)
                .map_err(|e| format!("[proxy_config] Failed to create proxy: {}", e))?
                .no_proxy(reqwest::NoProxy::from_string(LOOPBACK_NO_PROXY));

            builder.proxy(proxy)
        }
        None => {
            // No user proxy configured, disable all proxies (including system proxy)
            log::debug!("[proxy_config] No proxy configured, using direct connection");
            builder.no_proxy()
        }
    };

    final_builder
        .build()
        .map_err(|e| format!("[proxy_config] Failed to build HTTP client: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_proxy_url_with_defaults() {
        let settings = ProxySettings {
            enabled: true,
            protocol: None,
            host: None,
            port: None,
        };

        let result = get_proxy_url(&settings);
        assert_eq!(result.unwrap(), "http://127.0.0.1:7890");
    }

    #[test]
    fn test_get_proxy_url_socks5() {
        let settings = ProxySettings {
            enabled: true,
            protocol: Some("socks5".to_string()),
            host: Some("192.168.1.1".to_string()),
            port: Some(1080),
        };

        assert_eq!(get_proxy_url(&settings).unwrap(), "socks5://192.168.1.1:1080");
    }

    #[test]
    fn test_get_proxy_url_invalid_protocol() {
        let settings = ProxySettings {
            enabled: true,
            protocol: Some("ftp".to_string()),
            host: None,
            port: None,
        };

        let result = get_proxy_url(&settings);
        assert!(result.unwrap_err().contains("Invalid proxy protocol"));
    }

    #[test]
    fn test_get_proxy_url_zero_port() {
        let settings = ProxySettings {
            enabled: true,
            protocol: None,
            host: None,
            port: Some(0),
        };

        let result = get_proxy_url(&settings);
        assert!(result.unwrap_err().contains("Invalid proxy port"));
    }

    #[test]
    fn test_disabled_proxy_builds_direct_client() {
        let settings = ProxySettings {
            enabled: false,
            protocol: Some("ftp".to_string()),
            host: None,
            port: None,
        };
        // Invalid protocol is ignored because the proxy is disabled
        assert!(build_client_with_proxy(reqwest::Client::builder(), Some(&settings)).is_ok());
    }

    #[test]
    fn test_enabled_proxy_with_bad_protocol_fails() {
        let settings = ProxySettings {
            enabled: true,
            protocol: Some("ftp".to_string()),
            host: None,
            port: None,
        };
        assert!(build_client_with_proxy(reqwest::Client::builder(), Some(&settings)).is_err());
    }
}
