// Upstream selection: turns a request target into an ordered list of
// candidate upstreams, consulting the PAC resolver and the blacklist.
use crate::blacklist::Blacklist;
use crate::client::RequestHead;
use crate::config::{Config, ProxyType};
use crate::error::{ProxyError, Result};
use crate::pac::PacResolver;
use std::fmt;
use std::sync::Arc;

/// One selectable way to reach a target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UpstreamDirective {
    Http { host: String, port: u16 },
    Socks4 { host: String, port: u16 },
    Socks5 { host: String, port: u16 },
    Direct,
}

impl UpstreamDirective {
    pub fn is_http(&self) -> bool {
        matches!(self, UpstreamDirective::Http { .. })
    }

    pub fn endpoint(&self) -> Option<(&str, u16)> {
        match self {
            UpstreamDirective::Http { host, port }
            | UpstreamDirective::Socks4 { host, port }
            | UpstreamDirective::Socks5 { host, port } => Some((host.as_str(), *port)),
            UpstreamDirective::Direct => None,
        }
    }

    fn from_config(config: &Config) -> Result<Self> {
        let (host, port) = match (config.proxy_host(), config.proxy_port()) {
            (Some(host), port) if port != 0 => (host.to_string(), port),
            _ if config.proxy_type == ProxyType::Direct => return Ok(UpstreamDirective::Direct),
            _ => {
                return Err(ProxyError::Internal(format!(
                    "no {} upstream endpoint configured",
                    config.proxy_type.as_str()
                )))
            }
        };
        Ok(match config.proxy_type {
            ProxyType::Http => UpstreamDirective::Http { host, port },
            ProxyType::Socks4 => UpstreamDirective::Socks4 { host, port },
            ProxyType::Socks5 => UpstreamDirective::Socks5 { host, port },
            ProxyType::Pac | ProxyType::Direct => unreachable!(),
        })
    }
}

impl fmt::Display for UpstreamDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamDirective::Http { host, port } => write!(f, "HTTP {}:{}", host, port),
            UpstreamDirective::Socks4 { host, port } => write!(f, "SOCKS4 {}:{}", host, port),
            UpstreamDirective::Socks5 { host, port } => write!(f, "SOCKS5 {}:{}", host, port),
            UpstreamDirective::Direct => write!(f, "DIRECT"),
        }
    }
}

/// Parse one entry of a PAC result list, e.g. `PROXY gw:8080` or `DIRECT`.
/// Unknown or malformed entries yield `None` and are skipped by the caller.
pub fn parse_pac_entry(entry: &str) -> Option<UpstreamDirective> {
    let trimmed = entry.trim();
    if trimmed.eq_ignore_ascii_case("DIRECT") {
        return Some(UpstreamDirective::Direct);
    }

    let mut parts = trimmed.split_whitespace();
    let kind = parts.next()?.to_ascii_uppercase();
    let endpoint = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    let (host, port) = parse_host_port(endpoint)?;
    match kind.as_str() {
        "PROXY" | "HTTP" => Some(UpstreamDirective::Http { host, port }),
        "SOCKS" | "SOCKS5" => Some(UpstreamDirective::Socks5 { host, port }),
        "SOCKS4" => Some(UpstreamDirective::Socks4 { host, port }),
        _ => None,
    }
}

/// Split `host:port`, with bracketed IPv6 literals supported.
pub fn parse_host_port(value: &str) -> Option<(String, u16)> {
    if let Some(rest) = value.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = &rest[..end];
        let port = rest[end + 1..].strip_prefix(':')?.parse().ok()?;
        return Some((host.to_string(), port));
    }
    let (host, port_part) = value.rsplit_once(':')?;
    let port = port_part.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

/// Where a request wants to go, resolved from its request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEndpoint {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl TargetEndpoint {
    pub fn from_head(head: &RequestHead) -> Result<Self> {
        if head.is_connect() {
            // Authority-form, port mandatory.
            let (host, port) = parse_host_port(&head.target).ok_or_else(|| {
                ProxyError::Protocol(format!("invalid CONNECT target: {}", head.target))
            })?;
            return Ok(TargetEndpoint {
                host,
                port,
                secure: true,
            });
        }

        if let Ok(parsed) = url::Url::parse(&head.target) {
            if let Some(host) = parsed.host_str() {
                return Ok(TargetEndpoint {
                    host: host.to_string(),
                    port: parsed.port_or_known_default().unwrap_or(80),
                    secure: parsed.scheme() == "https",
                });
            }
        }

        // Origin-form: fall back to the Host header.
        let host_header = head
            .header("Host")
            .ok_or_else(|| ProxyError::Protocol("request has no resolvable host".to_string()))?;
        let (host, port) =
            parse_host_port(host_header).unwrap_or_else(|| (host_header.to_string(), 80));
        Ok(TargetEndpoint {
            host,
            port,
            secure: false,
        })
    }

    /// URL handed to the PAC script. CONNECT requests carry no scheme, so
    /// they are presented as https URLs the way browsers do; origin-form
    /// targets are completed with the resolved authority.
    pub fn pac_url(&self, head: &RequestHead) -> String {
        if head.is_connect() {
            format!("https://{}:{}/", self.host, self.port)
        } else if head.target.starts_with("http://") || head.target.starts_with("https://") {
            head.target.clone()
        } else {
            format!("http://{}{}", self.authority(), head.target)
        }
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Produces the ordered list of upstream candidates for one request.
pub struct UpstreamSelector {
    config: Arc<Config>,
    blacklist: Arc<Blacklist>,
    pac: Option<Arc<PacResolver>>,
}

impl UpstreamSelector {
    pub fn new(
        config: Arc<Config>,
        blacklist: Arc<Blacklist>,
        pac: Option<Arc<PacResolver>>,
    ) -> Self {
        UpstreamSelector {
            config,
            blacklist,
            pac,
        }
    }

    pub async fn select(&self, head: &RequestHead, target: &TargetEndpoint) -> Result<Vec<UpstreamDirective>> {
        let candidates = match self.config.proxy_type {
            ProxyType::Pac => {
                let resolver = self
                    .pac
                    .as_ref()
                    .ok_or_else(|| ProxyError::Internal("PAC resolver not initialized".into()))?;
                let url = target.pac_url(head);
                let entries = resolver
                    .resolve(&url, &target.host)
                    .await
                    .map_err(|e| ProxyError::Internal(format!("PAC evaluation failed: {}", e)))?;
                let parsed: Vec<UpstreamDirective> =
                    entries.iter().filter_map(|e| parse_pac_entry(e)).collect();
                if parsed.is_empty() {
                    vec![UpstreamDirective::Direct]
                } else {
                    parsed
                }
            }
            _ => vec![UpstreamDirective::from_config(&self.config)?],
        };

        let usable: Vec<UpstreamDirective> = candidates
            .iter()
            .filter(|d| !self.blacklist.is_bad(d))
            .cloned()
            .collect();

        // Everything blacklisted: retry the unfiltered list rather than
        // starving the request entirely.
        if usable.is_empty() {
            tracing::debug!("All candidate upstreams blacklisted, retrying unfiltered");
            return Ok(candidates);
        }
        Ok(usable)
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }
}
