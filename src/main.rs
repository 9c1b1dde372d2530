// Point d'entrée CLI: charge la configuration, démarre la session proxy.
use anyhow::{Context, Result};
use proxlet::config::Config;
use proxlet::pac::PacResolver;
use proxlet::selector::{parse_pac_entry, UpstreamDirective};
use proxlet::server::{ProxyServer, Session};
use proxlet::sysproxy;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(
    name = "proxlet",
    version,
    about = "Local proxy facade: relays plain HTTP clients to an authenticating corporate proxy"
)]
struct Cli {
    /// Alternate properties file (default: ~/.proxlet/proxy.properties)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the loopback listen port
    #[arg(long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch proxy.test.url through the configured upstream and report
    Test,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging()?;

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    if let Ok(temp_dir) = Config::temp_dir() {
        let _ = std::fs::create_dir_all(&temp_dir);
    }

    if config.is_auto_detect_needed() {
        if sysproxy::auto_detect(&mut config) && cli.config.is_none() {
            let _ = config.save();
        }
    }

    if let Some(port) = cli.port {
        config.local_port = port;
    }

    match cli.command {
        Some(Command::Test) => test_upstream(&config).await,
        None => run(config).await,
    }
}

async fn run(config: Config) -> Result<()> {
    tracing::info!(
        "proxlet {} -- upstream {}",
        config.app_version,
        config.proxy_type.as_str()
    );

    let session = Session::open(config).await?;
    let mut server = ProxyServer::new(session);
    let addr = server.start().await?;
    tracing::info!("Prêt: configurez vos clients sur http://{}", addr);

    tokio::signal::ctrl_c()
        .await
        .context("cannot install the Ctrl-C handler")?;
    tracing::info!("Signal d'arrêt reçu");
    server.stop().await;
    Ok(())
}

/// One-shot check that the configured upstream actually relays traffic.
async fn test_upstream(config: &Config) -> Result<()> {
    let mut builder = reqwest::Client::builder()
        .timeout(config.socket_timeout())
        .connect_timeout(config.connect_timeout());

    if let Some(proxy_url) = upstream_proxy_url(config).await? {
        tracing::info!("Testing through upstream {}", proxy_url);
        let mut proxy = reqwest::Proxy::all(&proxy_url)
            .with_context(|| format!("invalid upstream proxy URL {}", proxy_url))?;
        if config.has_credentials() {
            proxy = proxy.basic_auth(&config.proxy_username, &config.proxy_password);
        }
        builder = builder.proxy(proxy);
    } else {
        tracing::info!("Testing without an upstream (DIRECT)");
    }

    let client = builder.build()?;
    let response = client
        .get(&config.proxy_test_url)
        .send()
        .await
        .with_context(|| format!("request to {} failed", config.proxy_test_url))?;

    println!("{} -> {}", config.proxy_test_url, response.status());
    Ok(())
}

/// The reqwest-style proxy URL for the configured upstream; for PAC, the
/// first usable directive returned for the test URL.
async fn upstream_proxy_url(config: &Config) -> Result<Option<String>> {
    use proxlet::config::ProxyType;
    match config.proxy_type {
        ProxyType::Direct => Ok(None),
        ProxyType::Http | ProxyType::Socks4 | ProxyType::Socks5 => {
            let host = config
                .proxy_host()
                .context("upstream host is not configured")?;
            let scheme = match config.proxy_type {
                ProxyType::Http => "http",
                ProxyType::Socks4 => "socks4",
                // socks5h: let the SOCKS server resolve names.
                _ => "socks5h",
            };
            Ok(Some(format!("{}://{}:{}", scheme, host, config.proxy_port())))
        }
        ProxyType::Pac => {
            let resolver = PacResolver::load(&config.proxy_pac_file_location).await?;
            let host = url::Url::parse(&config.proxy_test_url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .context("proxy.test.url is not a valid URL")?;
            let entries = resolver.resolve(&config.proxy_test_url, &host).await?;
            for entry in &entries {
                match parse_pac_entry(entry) {
                    Some(UpstreamDirective::Http { host, port }) => {
                        return Ok(Some(format!("http://{}:{}", host, port)))
                    }
                    Some(UpstreamDirective::Socks5 { host, port }) => {
                        return Ok(Some(format!("socks5h://{}:{}", host, port)))
                    }
                    Some(UpstreamDirective::Socks4 { host, port }) => {
                        return Ok(Some(format!("socks4://{}:{}", host, port)))
                    }
                    Some(UpstreamDirective::Direct) => return Ok(None),
                    None => continue,
                }
            }
            Ok(None)
        }
    }
}

/// Console output plus a log file under the application home, the file kept
/// out of the hot path by the non-blocking appender.
fn init_logging() -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_dir = Config::app_home().unwrap_or_else(|_| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::never(&log_dir, "proxlet.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    Ok(guard)
}
