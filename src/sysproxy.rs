// System proxy autodetection: registry on Windows, environment elsewhere.
use crate::config::{Config, ProxyType};
use crate::selector::parse_host_port;

/// What the operating system says about proxying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectedProxy {
    /// An auto-config script location.
    Pac(String),
    /// A manual HTTP proxy endpoint.
    Http(String, u16),
    /// A manual SOCKS proxy endpoint.
    Socks5(String, u16),
}

/// Apply the detected settings to the configuration, PAC taking precedence
/// over manual endpoints the way browsers resolve it. Returns whether
/// anything was applied.
pub fn auto_detect(config: &mut Config) -> bool {
    let Some(detected) = detect() else {
        tracing::warn!("No system proxy settings found to autodetect");
        return false;
    };
    tracing::info!("Autodetected system proxy: {:?}", detected);
    apply(config, detected);
    true
}

fn apply(config: &mut Config, detected: DetectedProxy) {
    match detected {
        DetectedProxy::Pac(location) => {
            config.proxy_type = ProxyType::Pac;
            config.proxy_pac_file_location = location;
        }
        DetectedProxy::Http(host, port) => {
            config.proxy_type = ProxyType::Http;
            config.set_proxy_endpoint(ProxyType::Http, &host, port);
        }
        DetectedProxy::Socks5(host, port) => {
            config.proxy_type = ProxyType::Socks5;
            config.set_proxy_endpoint(ProxyType::Socks5, &host, port);
        }
    }
}

pub fn detect() -> Option<DetectedProxy> {
    #[cfg(windows)]
    {
        detect_registry()
    }
    #[cfg(not(windows))]
    {
        detect_env()
    }
}

/// Read the Internet Settings key the way the browsers on the machine do.
#[cfg(windows)]
fn detect_registry() -> Option<DetectedProxy> {
    use winreg::enums::HKEY_CURRENT_USER;
    use winreg::RegKey;

    let hkcu = RegKey::predef(HKEY_CURRENT_USER);
    let internet_settings = hkcu
        .open_subkey("Software\\Microsoft\\Windows\\CurrentVersion\\Internet Settings")
        .ok()?;

    if let Ok(auto_config_url) = internet_settings.get_value::<String, _>("AutoConfigURL") {
        if !auto_config_url.trim().is_empty() {
            return Some(DetectedProxy::Pac(auto_config_url));
        }
    }

    let proxy_enable: u32 = internet_settings.get_value("ProxyEnable").unwrap_or(0);
    if proxy_enable == 0 {
        return None;
    }
    let proxy_server: String = internet_settings.get_value("ProxyServer").unwrap_or_default();
    parse_manual_settings(&proxy_server)
}

/// Proxy-related environment variables, lowercase variants included.
#[cfg(not(windows))]
fn detect_env() -> Option<DetectedProxy> {
    fn var(name: &str) -> Option<String> {
        std::env::var(name.to_ascii_uppercase())
            .or_else(|_| std::env::var(name))
            .ok()
            .filter(|v| !v.trim().is_empty())
    }

    let candidate = var("http_proxy")
        .or_else(|| var("https_proxy"))
        .or_else(|| var("all_proxy"))?;
    parse_proxy_url(&candidate)
}

/// A `ProxyServer` registry value: either `host:port` for every protocol or
/// a `scheme=host:port` list separated by `;`.
#[cfg_attr(not(windows), allow(dead_code))]
fn parse_manual_settings(value: &str) -> Option<DetectedProxy> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if !value.contains('=') {
        let (host, port) = parse_host_port(value)?;
        return Some(DetectedProxy::Http(host, port));
    }

    let mut socks: Option<DetectedProxy> = None;
    for part in value.split(';') {
        let Some((scheme, endpoint)) = part.trim().split_once('=') else {
            continue;
        };
        let Some((host, port)) = parse_host_port(endpoint.trim()) else {
            continue;
        };
        match scheme.trim().to_ascii_lowercase().as_str() {
            // The http entry wins as soon as it shows up.
            "http" | "https" => return Some(DetectedProxy::Http(host, port)),
            "socks" => socks = Some(DetectedProxy::Socks5(host, port)),
            _ => {}
        }
    }
    socks
}

/// An environment-style proxy URL such as `http://gw:8080` or
/// `socks5://gw:1080`.
#[cfg_attr(windows, allow(dead_code))]
fn parse_proxy_url(value: &str) -> Option<DetectedProxy> {
    let trimmed = value.trim();
    if let Some(rest) = trimmed
        .strip_prefix("socks5://")
        .or_else(|| trimmed.strip_prefix("socks5h://"))
        .or_else(|| trimmed.strip_prefix("socks://"))
    {
        let (host, port) = parse_host_port(rest.trim_end_matches('/'))?;
        return Some(DetectedProxy::Socks5(host, port));
    }
    let rest = trimmed.strip_prefix("http://").unwrap_or(trimmed);
    let (host, port) = parse_host_port(rest.trim_end_matches('/'))?;
    Some(DetectedProxy::Http(host, port))
}
