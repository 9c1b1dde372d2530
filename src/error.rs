// Error taxonomy for the request pipeline.
use std::io;

/// Outcome of a single processor attempt against one upstream directive.
///
/// The router reacts differently per variant: `ProxyConnect` blacklists the
/// directive and moves on to the next candidate, `ProxyAuthorization` and
/// `TunnelRefused` forward the upstream's own response verbatim, everything
/// else is mapped to a synthesized status code -- but only while no response
/// byte has been committed to the client.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The client sent something that is not a parsable HTTP/1.x request.
    #[error("malformed request: {0}")]
    Protocol(String),

    /// The upstream TCP connection could not be opened (refused, timed out,
    /// unresolvable). The directive gets blacklisted and the next one tried.
    #[error("upstream unreachable: {0}")]
    ProxyConnect(#[source] io::Error),

    /// The upstream kept answering 407 after the authentication exchange.
    /// Carries the upstream's raw response, forwarded to the client as-is.
    #[error("upstream requires proxy authorization")]
    ProxyAuthorization { response: Vec<u8> },

    /// The upstream answered a CONNECT with a non-2xx status. Carries the
    /// raw response, forwarded to the client as-is.
    #[error("tunnel refused: {status_line}")]
    TunnelRefused {
        status_line: String,
        response: Vec<u8>,
    },

    /// The upstream accepted the TCP connection but never produced a usable
    /// response.
    #[error("upstream gave no response: {0}")]
    GatewayTimeout(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    /// Status code synthesized for the client when the response is still
    /// uncommitted and there is no upstream response to forward.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::Protocol(_) => 400,
            ProxyError::ProxyConnect(_) => 502,
            ProxyError::GatewayTimeout(_) => 504,
            ProxyError::ProxyAuthorization { .. } | ProxyError::TunnelRefused { .. } => 502,
            ProxyError::Io(_) | ProxyError::Internal(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
