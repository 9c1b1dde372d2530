// Session configuration, persisted as a key=value properties file.
use anyhow::{anyhow, bail, Context, Result};
use base64::Engine;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const PROPERTIES_FILENAME: &str = "proxy.properties";
pub const APP_HOME_DIR: &str = ".proxlet";

/// Upper bound on a client request head; anything larger is a protocol error.
pub const MAX_REQUEST_HEAD: usize = 64 * 1024;

/// Concurrent connection handlers; the accept loop backpressures beyond this.
pub const MAX_WORKERS: usize = 256;

/// How long the duplex pump waits for the reverse direction after the
/// forward direction has seen EOF, before cancelling it.
pub const TUNNEL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    Http,
    Socks4,
    Socks5,
    Pac,
    Direct,
}

impl ProxyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyType::Http => "HTTP",
            ProxyType::Socks4 => "SOCKS4",
            ProxyType::Socks5 => "SOCKS5",
            ProxyType::Pac => "PAC",
            ProxyType::Direct => "DIRECT",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "HTTP" => Ok(ProxyType::Http),
            "SOCKS4" => Ok(ProxyType::Socks4),
            "SOCKS5" => Ok(ProxyType::Socks5),
            "PAC" => Ok(ProxyType::Pac),
            "DIRECT" => Ok(ProxyType::Direct),
            other => bail!("unknown proxy.type: {}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthProtocol {
    Basic,
    Ntlm,
    Kerberos,
}

impl AuthProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthProtocol::Basic => "BASIC",
            AuthProtocol::Ntlm => "NTLM",
            AuthProtocol::Kerberos => "KERBEROS",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "BASIC" => Ok(AuthProtocol::Basic),
            "NTLM" => Ok(AuthProtocol::Ntlm),
            "KERBEROS" => Ok(AuthProtocol::Kerberos),
            other => bail!("unknown proxy.auth.protocol: {}", other),
        }
    }
}

/// Immutable configuration snapshot for one proxy session.
///
/// The hosts and ports are stored per upstream kind; switching `proxy_type`
/// never clobbers the endpoints of the other kinds.
#[derive(Debug, Clone)]
pub struct Config {
    pub local_port: u16,
    pub proxy_type: ProxyType,

    pub proxy_http_host: String,
    pub proxy_http_port: u16,
    pub proxy_socks4_host: String,
    pub proxy_socks4_port: u16,
    pub proxy_socks5_host: String,
    pub proxy_socks5_port: u16,

    pub proxy_username: String,
    pub proxy_password: String,
    pub proxy_store_password: bool,
    pub auth_protocol: AuthProtocol,

    pub proxy_pac_file_location: String,
    pub proxy_test_url: String,

    /// Minutes an upstream stays blacklisted after a connect failure.
    pub blacklist_timeout: u64,
    /// Seconds allowed for an upstream TCP connect.
    pub connect_timeout: u64,
    /// Seconds a socket read may stay idle before being treated as EOF.
    pub socket_timeout: u64,

    pub autostart: bool,
    pub autodetect: bool,

    pub app_version: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            local_port: 3129,
            proxy_type: ProxyType::Direct,
            proxy_http_host: String::new(),
            proxy_http_port: 0,
            proxy_socks4_host: String::new(),
            proxy_socks4_port: 0,
            proxy_socks5_host: String::new(),
            proxy_socks5_port: 0,
            proxy_username: String::new(),
            proxy_password: String::new(),
            proxy_store_password: false,
            auth_protocol: AuthProtocol::Basic,
            proxy_pac_file_location: String::new(),
            proxy_test_url: "http://example.com".to_string(),
            blacklist_timeout: 30,
            connect_timeout: 10,
            socket_timeout: 60,
            autostart: false,
            autodetect: false,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl Config {
    /// Host of the configured upstream for the current kind, when one applies.
    pub fn proxy_host(&self) -> Option<&str> {
        let host = match self.proxy_type {
            ProxyType::Http => &self.proxy_http_host,
            ProxyType::Socks4 => &self.proxy_socks4_host,
            ProxyType::Socks5 => &self.proxy_socks5_host,
            ProxyType::Pac | ProxyType::Direct => return None,
        };
        if host.is_empty() {
            None
        } else {
            Some(host)
        }
    }

    pub fn proxy_port(&self) -> u16 {
        match self.proxy_type {
            ProxyType::Http => self.proxy_http_port,
            ProxyType::Socks4 => self.proxy_socks4_port,
            ProxyType::Socks5 => self.proxy_socks5_port,
            ProxyType::Pac | ProxyType::Direct => 0,
        }
    }

    /// Explicit per-kind setter; only the named kind's endpoint changes.
    pub fn set_proxy_endpoint(&mut self, kind: ProxyType, host: &str, port: u16) {
        match kind {
            ProxyType::Http => {
                self.proxy_http_host = host.to_string();
                self.proxy_http_port = port;
            }
            ProxyType::Socks4 => {
                self.proxy_socks4_host = host.to_string();
                self.proxy_socks4_port = port;
            }
            ProxyType::Socks5 => {
                self.proxy_socks5_host = host.to_string();
                self.proxy_socks5_port = port;
            }
            ProxyType::Pac | ProxyType::Direct => {}
        }
    }

    pub fn blacklist_cooldown(&self) -> Duration {
        Duration::from_secs(self.blacklist_timeout * 60)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout)
    }

    pub fn has_credentials(&self) -> bool {
        !self.proxy_username.is_empty()
    }

    /// Autodetection kicks in when asked for, or when the configured kind
    /// is missing the data it needs to work.
    pub fn is_auto_detect_needed(&self) -> bool {
        self.autodetect
            || (matches!(
                self.proxy_type,
                ProxyType::Http | ProxyType::Socks4 | ProxyType::Socks5
            ) && self.proxy_host().is_none())
            || (self.proxy_type == ProxyType::Pac && self.proxy_pac_file_location.is_empty())
    }

    /// Reject configurations that cannot serve a session.
    pub fn validate(&self) -> Result<()> {
        match self.proxy_type {
            ProxyType::Http | ProxyType::Socks4 | ProxyType::Socks5 => {
                if self.proxy_host().is_none() {
                    bail!(
                        "proxy.type is {} but its host is not configured",
                        self.proxy_type.as_str()
                    );
                }
                if self.proxy_port() == 0 {
                    bail!(
                        "proxy.type is {} but its port is not configured",
                        self.proxy_type.as_str()
                    );
                }
            }
            ProxyType::Pac => {
                if self.proxy_pac_file_location.is_empty() {
                    bail!("proxy.type is PAC but proxy.pac.fileLocation is not configured");
                }
            }
            ProxyType::Direct => {}
        }
        Ok(())
    }

    pub fn load() -> Result<Self> {
        let path = Self::properties_path()?;
        if !path.exists() {
            tracing::info!("No configuration at {:?}, using defaults", path);
            let config = Self::default();
            config.save_to(&path)?;
            return Ok(config);
        }
        let config = Self::load_from(&path)?;
        tracing::info!("Configuration loaded from {:?}", path);
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        Self::from_properties(&content)
    }

    pub fn from_properties(content: &str) -> Result<Self> {
        let mut config = Config::default();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| anyhow!("line {}: expected key=value", lineno + 1))?;
            let (key, value) = (key.trim(), value.trim());
            match key {
                "local.port" => config.local_port = parse_port(key, value)?,
                "proxy.type" => config.proxy_type = ProxyType::parse(value)?,
                "proxy.http.host" => config.proxy_http_host = value.to_string(),
                "proxy.http.port" => config.proxy_http_port = parse_port(key, value)?,
                "proxy.socks4.host" => config.proxy_socks4_host = value.to_string(),
                "proxy.socks4.port" => config.proxy_socks4_port = parse_port(key, value)?,
                "proxy.socks5.host" => config.proxy_socks5_host = value.to_string(),
                "proxy.socks5.port" => config.proxy_socks5_port = parse_port(key, value)?,
                "proxy.username" => config.proxy_username = value.to_string(),
                "proxy.password" => config.proxy_password = unwrap_password(value)?,
                "proxy.storePassword" => config.proxy_store_password = parse_bool(key, value)?,
                "proxy.auth.protocol" => config.auth_protocol = AuthProtocol::parse(value)?,
                "proxy.pac.fileLocation" => config.proxy_pac_file_location = value.to_string(),
                "proxy.test.url" => config.proxy_test_url = value.to_string(),
                "blacklist.timeout" => config.blacklist_timeout = parse_num(key, value)?,
                "socket.timeout" => config.socket_timeout = parse_num(key, value)?,
                "connect.timeout" => config.connect_timeout = parse_num(key, value)?,
                "autostart" => config.autostart = parse_bool(key, value)?,
                "autodetect" => config.autodetect = parse_bool(key, value)?,
                "app.version" => config.app_version = value.to_string(),
                other => bail!("unrecognized configuration key: {}", other),
            }
        }
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::properties_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_properties())
            .with_context(|| format!("cannot write {}", path.display()))?;
        tracing::info!("Configuration saved to {:?}", path);
        Ok(())
    }

    pub fn to_properties(&self) -> String {
        let mut out = String::new();
        out.push_str("# proxlet settings\n");
        out.push_str("# proxy.password is Base64-wrapped, not encrypted.\n");
        {
            let mut put = |key: &str, value: &str| {
                if !value.is_empty() {
                    let _ = writeln!(out, "{}={}", key, value);
                }
            };
            put("app.version", &self.app_version);
            put("local.port", &self.local_port.to_string());
            put("proxy.type", self.proxy_type.as_str());
            put("proxy.http.host", &self.proxy_http_host);
            if self.proxy_http_port != 0 {
                put("proxy.http.port", &self.proxy_http_port.to_string());
            }
            put("proxy.socks4.host", &self.proxy_socks4_host);
            if self.proxy_socks4_port != 0 {
                put("proxy.socks4.port", &self.proxy_socks4_port.to_string());
            }
            put("proxy.socks5.host", &self.proxy_socks5_host);
            if self.proxy_socks5_port != 0 {
                put("proxy.socks5.port", &self.proxy_socks5_port.to_string());
            }
            put("proxy.username", &self.proxy_username);
            if self.proxy_store_password && !self.proxy_password.is_empty() {
                put("proxy.storePassword", "true");
                put("proxy.password", &wrap_password(&self.proxy_password));
            }
            put("proxy.auth.protocol", self.auth_protocol.as_str());
            put("proxy.pac.fileLocation", &self.proxy_pac_file_location);
            put("proxy.test.url", &self.proxy_test_url);
            put("blacklist.timeout", &self.blacklist_timeout.to_string());
            put("socket.timeout", &self.socket_timeout.to_string());
            put("connect.timeout", &self.connect_timeout.to_string());
            put("autostart", if self.autostart { "true" } else { "" });
            put("autodetect", if self.autodetect { "true" } else { "" });
        }
        out
    }

    pub fn properties_path() -> Result<PathBuf> {
        Ok(Self::app_home()?.join(PROPERTIES_FILENAME))
    }

    pub fn temp_dir() -> Result<PathBuf> {
        Ok(Self::app_home()?.join("temp"))
    }

    pub fn app_home() -> Result<PathBuf> {
        let home =
            dirs::home_dir().ok_or_else(|| anyhow!("unable to locate the home directory"))?;
        Ok(home.join(APP_HOME_DIR))
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .map_err(|_| anyhow!("invalid port for {}: {}", key, value))
}

fn parse_num(key: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| anyhow!("invalid number for {}: {}", key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" | "" => Ok(false),
        other => bail!("invalid boolean for {}: {}", key, other),
    }
}

fn wrap_password(clear: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(clear)
}

fn unwrap_password(wrapped: &str) -> Result<String> {
    if wrapped.is_empty() {
        return Ok(String::new());
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(wrapped)
        .map_err(|e| anyhow!("proxy.password is not valid Base64: {}", e))?;
    String::from_utf8(bytes).map_err(|e| anyhow!("proxy.password is not valid UTF-8: {}", e))
}

// Home directory lookup, per platform.
mod dirs {
    use std::path::PathBuf;

    #[cfg(windows)]
    pub fn home_dir() -> Option<PathBuf> {
        std::env::var("USERPROFILE").ok().map(PathBuf::from)
    }

    #[cfg(not(windows))]
    pub fn home_dir() -> Option<PathBuf> {
        std::env::var("HOME").ok().map(PathBuf::from)
    }
}
