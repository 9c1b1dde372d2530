// Proxy Auto-Config: script loading and FindProxyForURL evaluation.
use anyhow::{anyhow, bail, Context as _, Result};
use boa_engine::{js_string, Context, JsArgs, JsResult, JsString, JsValue, NativeFunction, Source};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Positive results are remembered per host for a short while; a PAC script
/// rarely differentiates beyond the host, and browsers cache the same way.
const PAC_CACHE_TTL: Duration = Duration::from_secs(300);

/// Evaluates the session's PAC script. The JS engine context is not Send, so
/// every evaluation builds a fresh context on the blocking pool; the script
/// text itself is loaded once at session start.
///
/// Contract for callers: `resolve` is safe to call concurrently and, for a
/// given (url, host), is a pure function of the script -- failures degrade
/// to DIRECT rather than erroring the request.
pub struct PacResolver {
    script: String,
    location: String,
    cache: Mutex<HashMap<String, (Instant, Vec<String>)>>,
}

impl PacResolver {
    /// Fetch and keep the PAC script from an http(s) URL, a file: URL, or a
    /// plain filesystem path.
    pub async fn load(location: &str) -> Result<Arc<Self>> {
        let script = load_script(location).await?;
        tracing::info!("PAC script loaded ({} bytes) from {}", script.len(), location);
        Ok(Arc::new(PacResolver {
            script,
            location: location.to_string(),
            cache: Mutex::new(HashMap::new()),
        }))
    }

    #[cfg(test)]
    pub fn from_script(script: &str) -> Arc<Self> {
        Arc::new(PacResolver {
            script: script.to_string(),
            location: "<inline>".to_string(),
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Run `FindProxyForURL(url, host)` and split the result on `;`.
    pub async fn resolve(self: &Arc<Self>, url: &str, host: &str) -> Result<Vec<String>> {
        let key = host.to_ascii_lowercase();
        if let Some(cached) = self.cached(&key) {
            tracing::debug!("PAC cache hit for {}", key);
            return Ok(cached);
        }

        let resolver = Arc::clone(self);
        let (url, host) = (url.to_string(), host.to_string());
        let outcome =
            tokio::task::spawn_blocking(move || resolver.evaluate(&url, &host)).await?;

        let entries = match outcome {
            Ok(result) => {
                let entries = split_result(&result);
                if entries.is_empty() {
                    tracing::warn!("PAC returned no directives for {}, assuming DIRECT", key);
                    vec!["DIRECT".to_string()]
                } else {
                    entries
                }
            }
            Err(e) => {
                tracing::warn!("PAC evaluation failed for {}: {}", key, e);
                vec!["DIRECT".to_string()]
            }
        };

        self.store(key, entries.clone());
        Ok(entries)
    }

    fn cached(&self, key: &str) -> Option<Vec<String>> {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match cache.get(key) {
            Some((stored_at, entries)) if stored_at.elapsed() < PAC_CACHE_TTL => {
                Some(entries.clone())
            }
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    fn store(&self, key: String, entries: Vec<String>) {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.insert(key, (Instant::now(), entries));
    }

    fn evaluate(&self, url: &str, host: &str) -> Result<String> {
        let mut context = Context::default();
        register_helpers(&mut context)?;

        context
            .eval(Source::from_bytes(self.script.as_bytes()))
            .map_err(|e| anyhow!("PAC script error: {}", e))?;

        let call = format!(
            "FindProxyForURL(\"{}\", \"{}\")",
            js_escape(url),
            js_escape(host)
        );
        let value = context
            .eval(Source::from_bytes(call.as_bytes()))
            .map_err(|e| anyhow!("FindProxyForURL failed: {}", e))?;
        let result = value
            .to_string(&mut context)
            .map_err(|e| anyhow!("FindProxyForURL returned a non-string: {}", e))?;
        Ok(result.to_std_string_escaped())
    }
}

fn js_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn split_result(result: &str) -> Vec<String> {
    result
        .split(';')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

async fn load_script(location: &str) -> Result<String> {
    let trimmed = location.trim();
    if trimmed.is_empty() {
        bail!("PAC file location is empty");
    }

    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        tracing::info!("Downloading PAC script from {}", trimmed);
        let response = reqwest::get(trimmed)
            .await
            .with_context(|| format!("PAC download failed: {}", trimmed))?;
        if !response.status().is_success() {
            bail!("PAC download failed: {} answered {}", trimmed, response.status());
        }
        return response
            .text()
            .await
            .with_context(|| format!("PAC content unreadable: {}", trimmed));
    }

    let path = trimmed
        .strip_prefix("file://")
        .map(|p| p.trim_start_matches('/'))
        .map(|p| {
            if cfg!(windows) {
                p.to_string()
            } else {
                format!("/{}", p)
            }
        })
        .unwrap_or_else(|| trimmed.to_string());

    tracing::info!("Reading PAC script from {}", path);
    std::fs::read_to_string(&path).with_context(|| format!("cannot read PAC file {}", path))
}

// ---- PAC helper functions exposed to the script ------------------------------

type PacBuiltin = fn(&JsValue, &[JsValue], &mut Context) -> JsResult<JsValue>;

const BUILTINS: &[(&str, usize, PacBuiltin)] = &[
    ("isPlainHostName", 1, is_plain_host_name),
    ("dnsDomainIs", 2, dns_domain_is),
    ("localHostOrDomainIs", 2, local_host_or_domain_is),
    ("isResolvable", 1, is_resolvable),
    ("isInNet", 3, is_in_net),
    ("dnsResolve", 1, dns_resolve),
    ("myIpAddress", 0, my_ip_address),
    ("dnsDomainLevels", 1, dns_domain_levels),
    ("shExpMatch", 2, sh_exp_match_builtin),
    ("weekdayRange", 3, always_true),
    ("dateRange", 7, always_true),
    ("timeRange", 7, always_true),
    ("alert", 1, alert),
];

fn register_helpers(context: &mut Context) -> Result<()> {
    for (name, arity, body) in BUILTINS {
        context
            .register_global_builtin_callable(
                JsString::from(*name),
                *arity,
                NativeFunction::from_fn_ptr(*body),
            )
            .map_err(|e| anyhow!("cannot register PAC helper {}: {}", name, e))?;
    }
    Ok(())
}

fn arg_str(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    Ok(args
        .get_or_undefined(index)
        .to_string(context)?
        .to_std_string_escaped())
}

fn is_plain_host_name(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let host = arg_str(args, 0, context)?;
    Ok(JsValue::Boolean(!host.contains('.')))
}

fn dns_domain_is(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let host = arg_str(args, 0, context)?.to_ascii_lowercase();
    let domain = arg_str(args, 1, context)?.to_ascii_lowercase();
    Ok(JsValue::Boolean(host.ends_with(&domain)))
}

fn local_host_or_domain_is(
    _: &JsValue,
    args: &[JsValue],
    context: &mut Context,
) -> JsResult<JsValue> {
    let host = arg_str(args, 0, context)?.to_ascii_lowercase();
    let hostdom = arg_str(args, 1, context)?.to_ascii_lowercase();
    Ok(JsValue::Boolean(
        host == hostdom || hostdom.starts_with(&format!("{}.", host)),
    ))
}

fn is_resolvable(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let host = arg_str(args, 0, context)?;
    Ok(JsValue::Boolean(resolve_ipv4(&host).is_some()))
}

fn is_in_net(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let host = arg_str(args, 0, context)?;
    let pattern = arg_str(args, 1, context)?;
    let mask = arg_str(args, 2, context)?;

    let in_net = (|| -> Option<bool> {
        let host_ip = resolve_ipv4(&host)?;
        let pattern_ip: Ipv4Addr = pattern.parse().ok()?;
        let mask_ip: Ipv4Addr = mask.parse().ok()?;
        Some(
            u32::from(host_ip) & u32::from(mask_ip)
                == u32::from(pattern_ip) & u32::from(mask_ip),
        )
    })()
    .unwrap_or(false);

    Ok(JsValue::Boolean(in_net))
}

fn dns_resolve(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let host = arg_str(args, 0, context)?;
    match resolve_ipv4(&host) {
        Some(ip) => Ok(JsValue::String(js_string!(ip.to_string()))),
        None => Ok(JsValue::null()),
    }
}

fn my_ip_address(_: &JsValue, _: &[JsValue], _: &mut Context) -> JsResult<JsValue> {
    let ip = local_ip_address().unwrap_or_else(|| "127.0.0.1".to_string());
    Ok(JsValue::String(js_string!(ip)))
}

fn dns_domain_levels(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let host = arg_str(args, 0, context)?;
    Ok(JsValue::Integer(
        host.chars().filter(|&c| c == '.').count() as i32
    ))
}

fn sh_exp_match_builtin(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let value = arg_str(args, 0, context)?;
    let pattern = arg_str(args, 1, context)?;
    Ok(JsValue::Boolean(sh_exp_match(&value, &pattern)))
}

fn always_true(_: &JsValue, _: &[JsValue], _: &mut Context) -> JsResult<JsValue> {
    Ok(JsValue::Boolean(true))
}

fn alert(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let message = arg_str(args, 0, context)?;
    tracing::debug!("PAC alert: {}", message);
    Ok(JsValue::undefined())
}

/// Shell-expression (glob) matching: `*` and `?` wildcards, everything else
/// literal.
pub fn sh_exp_match(value: &str, pattern: &str) -> bool {
    let mut regex_str = String::with_capacity(pattern.len() + 8);
    regex_str.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => regex_str.push_str(".*"),
            '?' => regex_str.push('.'),
            '.' | '\\' | '^' | '$' | '|' | '+' | '(' | ')' | '[' | ']' | '{' | '}' => {
                regex_str.push('\\');
                regex_str.push(ch);
            }
            _ => regex_str.push(ch),
        }
    }
    regex_str.push('$');

    regex::Regex::new(&regex_str)
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

fn resolve_ipv4(host: &str) -> Option<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Some(ip);
    }
    format!("{}:0", host)
        .to_socket_addrs()
        .ok()?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
}

fn local_ip_address() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:53").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}
