// Serveur proxy local: session, listener et boucle d'acceptation.
use crate::auth::Authenticator;
use crate::blacklist::Blacklist;
use crate::client::ClientConnection;
use crate::config::{Config, ProxyType, MAX_WORKERS};
use crate::error::ProxyError;
use crate::pac::PacResolver;
use crate::processor;
use crate::selector::UpstreamSelector;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};

/// Everything a request handler needs, frozen for the lifetime of one
/// start/stop interval. No process-wide state: stopping the session drops
/// the blacklist, the PAC resolver and any cached credentials with it.
pub struct Session {
    pub config: Arc<Config>,
    pub blacklist: Arc<Blacklist>,
    pub authenticator: Authenticator,
    pub selector: UpstreamSelector,
}

impl Session {
    pub async fn open(config: Config) -> Result<Arc<Self>> {
        config.validate()?;
        let config = Arc::new(config);

        let pac = if config.proxy_type == ProxyType::Pac {
            let resolver = PacResolver::load(&config.proxy_pac_file_location)
                .await
                .context("cannot initialize the PAC resolver")?;
            Some(resolver)
        } else {
            None
        };

        let blacklist = Arc::new(Blacklist::new(config.blacklist_cooldown()));
        let selector = UpstreamSelector::new(
            Arc::clone(&config),
            Arc::clone(&blacklist),
            pac,
        );

        Ok(Arc::new(Session {
            authenticator: Authenticator::new(Arc::clone(&config)),
            selector,
            blacklist,
            config,
        }))
    }
}

/// The listening side of a session. `start` binds the loopback port and
/// spawns the accept loop; `stop` closes the listener and signals every
/// in-flight handler to drop its sockets.
pub struct ProxyServer {
    session: Arc<Session>,
    local_addr: Option<SocketAddr>,
    accept_task: Option<tokio::task::JoinHandle<()>>,
    shutdown: Option<watch::Sender<bool>>,
}

impl ProxyServer {
    pub fn new(session: Arc<Session>) -> Self {
        ProxyServer {
            session,
            local_addr: None,
            accept_task: None,
            shutdown: None,
        }
    }

    /// Bind 127.0.0.1 and launch the accept loop. Port 0 picks a free port;
    /// the bound address is returned either way.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.accept_task.is_some() {
            self.stop().await;
        }

        let addr = SocketAddr::from(([127, 0, 0, 1], self.session.config.local_port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("cannot bind {}", addr))?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Démarrage du serveur proxy sur {}", local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = Arc::clone(&self.session);
        let handle = tokio::spawn(accept_loop(listener, session, shutdown_rx));

        self.local_addr = Some(local_addr);
        self.accept_task = Some(handle);
        self.shutdown = Some(shutdown_tx);
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.accept_task.is_some()
    }

    /// Close the listener and signal the in-flight connections. Handlers
    /// select on the shutdown signal, so their sockets drop promptly.
    pub async fn stop(&mut self) {
        tracing::info!("Arrêt du serveur proxy");
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(handle) = self.accept_task.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.local_addr = None;
    }
}

async fn accept_loop(
    listener: TcpListener,
    session: Arc<Session>,
    shutdown: watch::Receiver<bool>,
) {
    // Pool borné: au-delà, l'accept attend qu'un worker se libère.
    let workers = Arc::new(Semaphore::new(MAX_WORKERS));

    loop {
        let permit = match Arc::clone(&workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let mut shutdown_accept = shutdown.clone();
        let accepted = tokio::select! {
            _ = shutdown_accept.changed() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!("Nouvelle connexion de {}", peer);
                let session = Arc::clone(&session);
                let mut shutdown_conn = shutdown.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    tokio::select! {
                        _ = shutdown_conn.changed() => {
                            tracing::debug!("Connexion {} interrompue par l'arrêt de session", peer);
                        }
                        _ = handle_connection(session, stream, peer) => {}
                    }
                });
            }
            Err(e) => {
                tracing::error!("Erreur accept: {}", e);
                break;
            }
        }
    }

    tracing::debug!("Boucle serveur terminée");
}

async fn handle_connection(
    session: Arc<Session>,
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
) {
    let mut conn =
        match ClientConnection::accept(stream, peer, session.config.socket_timeout()).await {
            Ok(conn) => conn,
            Err(ProxyError::Io(e)) => {
                tracing::debug!("Connexion {} fermée sans requête: {}", peer, e);
                return;
            }
            Err(e) => {
                tracing::debug!("Requête invalide depuis {}: {}", peer, e);
                return;
            }
        };

    processor::process(&session, &mut conn).await;
    // La connexion (et son socket) se ferme ici, dans tous les cas.
}
