// Upstream proxy credentials: Basic, NTLM and Negotiate handling.
use crate::config::{AuthProtocol, Config};
use crate::error::{ProxyError, Result};
use base64::Engine;
use std::sync::Arc;

/// Per-session credential source for the upstream HTTP proxy and for SOCKS5
/// sub-negotiation. The session owns it; dropping the session drops any
/// cached material.
pub struct Authenticator {
    config: Arc<Config>,
}

impl Authenticator {
    pub fn new(config: Arc<Config>) -> Self {
        Authenticator { config }
    }

    /// Token sent preemptively on the first request to the upstream, when
    /// the configuration provides one.
    pub fn initial_token(&self) -> Result<Option<String>> {
        if !self.config.has_credentials() {
            return Ok(None);
        }
        match self.config.auth_protocol {
            AuthProtocol::Basic => Ok(Some(self.basic_token()?)),
            AuthProtocol::Ntlm => {
                let ntlm = NtlmExchange::new(&self.config.proxy_username);
                Ok(Some(format!("NTLM {}", ntlm.negotiate_message())))
            }
            // No ticket bridge here: the first round goes out bare and a 407
            // surfaces verbatim if the upstream insists.
            AuthProtocol::Kerberos => Ok(None),
        }
    }

    /// Answer a 407 challenge. `None` means the exchange cannot continue and
    /// the upstream's response should go to the client untouched.
    pub fn answer_challenge(&self, challenge: &ProxyChallenge) -> Result<Option<String>> {
        if !self.config.has_credentials() {
            return Ok(None);
        }
        match self.config.auth_protocol {
            AuthProtocol::Basic => {
                if challenge.offers("Basic") {
                    Ok(Some(self.basic_token()?))
                } else {
                    Ok(None)
                }
            }
            AuthProtocol::Ntlm => {
                let Some(token) = challenge.token_for("NTLM") else {
                    return Ok(None);
                };
                let ntlm = NtlmExchange::new(&self.config.proxy_username);
                let _server_challenge = ntlm.parse_challenge(token)?;
                // Computing the authenticate (Type 3) response needs the
                // NT hash machinery; not carried here. The persistent 407
                // is forwarded to the client instead.
                tracing::debug!("NTLM challenge received but Type 3 is not supported");
                Ok(None)
            }
            AuthProtocol::Kerberos => {
                tracing::debug!("Negotiate challenge received but no ticket bridge is available");
                Ok(None)
            }
        }
    }

    fn basic_token(&self) -> Result<String> {
        if self.config.proxy_password.is_empty() {
            return Err(ProxyError::Internal(
                "proxy.username is set but proxy.password is empty".to_string(),
            ));
        }
        let pair = format!(
            "{}:{}",
            self.config.proxy_username, self.config.proxy_password
        );
        Ok(format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(pair)
        ))
    }

    /// Credentials for SOCKS5 username/password sub-negotiation.
    pub fn socks_credentials(&self) -> Option<(&str, &str)> {
        if self.config.has_credentials() {
            Some((&self.config.proxy_username, &self.config.proxy_password))
        } else {
            None
        }
    }

    /// User id for the SOCKS4 request, when one is configured.
    pub fn socks_user_id(&self) -> Option<&str> {
        if self.config.has_credentials() {
            Some(&self.config.proxy_username)
        } else {
            None
        }
    }
}

/// The `Proxy-Authenticate` offerings of a 407 response.
#[derive(Debug, Default)]
pub struct ProxyChallenge {
    offers: Vec<String>,
}

impl ProxyChallenge {
    pub fn from_headers<'a>(values: impl Iterator<Item = &'a str>) -> Self {
        ProxyChallenge {
            offers: values.map(|v| v.trim().to_string()).collect(),
        }
    }

    /// Whether the upstream offered the given scheme at all.
    pub fn offers(&self, scheme: &str) -> bool {
        self.offers.iter().any(|o| {
            o.split_whitespace()
                .next()
                .map(|s| s.eq_ignore_ascii_case(scheme))
                .unwrap_or(false)
        })
    }

    /// Base64 payload following the scheme name, if the offer carries one.
    pub fn token_for(&self, scheme: &str) -> Option<&str> {
        self.offers.iter().find_map(|o| {
            let mut parts = o.splitn(2, char::is_whitespace);
            let name = parts.next()?;
            if name.eq_ignore_ascii_case(scheme) {
                parts.next().map(str::trim).filter(|t| !t.is_empty())
            } else {
                None
            }
        })
    }
}

/// NTLM message plumbing: builds the negotiate (Type 1) message and decodes
/// the server challenge (Type 2).
pub struct NtlmExchange {
    domain: String,
    workstation: String,
}

const NTLMSSP_SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

impl NtlmExchange {
    pub fn new(username: &str) -> Self {
        let domain = username
            .split_once('\\')
            .map(|(d, _)| d.to_ascii_uppercase())
            .unwrap_or_default();
        let workstation = std::env::var("COMPUTERNAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_default()
            .to_ascii_uppercase();
        NtlmExchange {
            domain,
            workstation,
        }
    }

    /// Base64 Type 1 message carrying the OEM domain and workstation.
    pub fn negotiate_message(&self) -> String {
        let domain = self.domain.as_bytes();
        let workstation = self.workstation.as_bytes();

        let flags: u32 = 0x0000_0001  // NEGOTIATE_UNICODE
            | 0x0000_0200             // NEGOTIATE_NTLM
            | 0x0000_1000             // OEM_DOMAIN_SUPPLIED
            | 0x0000_2000             // OEM_WORKSTATION_SUPPLIED
            | 0x0008_0000             // NEGOTIATE_ALWAYS_SIGN
            | 0x2000_0000; // NEGOTIATE_128

        let payload_offset = 32u32;
        let workstation_offset = payload_offset;
        let domain_offset = payload_offset + workstation.len() as u32;

        let mut msg = Vec::with_capacity(32 + workstation.len() + domain.len());
        msg.extend_from_slice(NTLMSSP_SIGNATURE);
        msg.extend_from_slice(&1u32.to_le_bytes());
        msg.extend_from_slice(&flags.to_le_bytes());

        // Domain security buffer: length, allocated, offset.
        msg.extend_from_slice(&(domain.len() as u16).to_le_bytes());
        msg.extend_from_slice(&(domain.len() as u16).to_le_bytes());
        msg.extend_from_slice(&domain_offset.to_le_bytes());

        // Workstation security buffer.
        msg.extend_from_slice(&(workstation.len() as u16).to_le_bytes());
        msg.extend_from_slice(&(workstation.len() as u16).to_le_bytes());
        msg.extend_from_slice(&workstation_offset.to_le_bytes());

        msg.extend_from_slice(workstation);
        msg.extend_from_slice(domain);

        base64::engine::general_purpose::STANDARD.encode(msg)
    }

    /// Decode a Type 2 message and extract the 8-byte server challenge.
    pub fn parse_challenge(&self, token: &str) -> Result<[u8; 8]> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(token.trim())
            .map_err(|e| ProxyError::Internal(format!("invalid NTLM challenge: {}", e)))?;
        if bytes.len() < 32 || &bytes[..8] != NTLMSSP_SIGNATURE {
            return Err(ProxyError::Internal(
                "invalid NTLM challenge message".to_string(),
            ));
        }
        let msg_type = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        if msg_type != 2 {
            return Err(ProxyError::Internal(format!(
                "expected NTLM Type 2 message, got type {}",
                msg_type
            )));
        }
        let mut challenge = [0u8; 8];
        challenge.copy_from_slice(&bytes[24..32]);
        Ok(challenge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(auth: AuthProtocol, username: &str, password: &str) -> Arc<Config> {
        let mut config = Config::default();
        config.auth_protocol = auth;
        config.proxy_username = username.to_string();
        config.proxy_password = password.to_string();
        Arc::new(config)
    }

    #[test]
    fn basic_token_is_rfc7617() {
        let auth = Authenticator::new(config_with(AuthProtocol::Basic, "jdoe", "s3cr3t"));
        assert_eq!(
            auth.initial_token().unwrap(),
            Some("Basic amRvZTpzM2NyM3Q=".to_string())
        );
    }

    #[test]
    fn no_credentials_no_token() {
        let auth = Authenticator::new(Arc::new(Config::default()));
        assert_eq!(auth.initial_token().unwrap(), None);
        assert!(auth.socks_credentials().is_none());
    }

    #[test]
    fn ntlm_type1_roundtrips_through_base64() {
        let auth = Authenticator::new(config_with(AuthProtocol::Ntlm, "CORP\\jdoe", "pw"));
        let token = auth.initial_token().unwrap().unwrap();
        let payload = token.strip_prefix("NTLM ").unwrap();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .unwrap();
        assert_eq!(&bytes[..8], b"NTLMSSP\0");
        assert_eq!(u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]), 1);
    }

    #[test]
    fn type2_challenge_extraction() {
        let exchange = NtlmExchange::new("CORP\\jdoe");
        let mut msg = Vec::new();
        msg.extend_from_slice(b"NTLMSSP\0");
        msg.extend_from_slice(&2u32.to_le_bytes());
        msg.extend_from_slice(&[0u8; 12]); // target name buffer + flags
        msg.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        msg.extend_from_slice(&[0u8; 8]);
        let token = base64::engine::general_purpose::STANDARD.encode(msg);
        assert_eq!(
            exchange.parse_challenge(&token).unwrap(),
            [1, 2, 3, 4, 5, 6, 7, 8]
        );
        assert!(exchange.parse_challenge("bm90LW50bG0=").is_err());
    }

    #[test]
    fn challenge_scheme_matching() {
        let challenge = ProxyChallenge::from_headers(
            ["Negotiate", "NTLM TlRMTVNTUAACAAAA", "Basic realm=\"corp\""].into_iter(),
        );
        assert!(challenge.offers("basic"));
        assert!(challenge.offers("Negotiate"));
        assert_eq!(challenge.token_for("NTLM"), Some("TlRMTVNTUAACAAAA"));
        assert_eq!(challenge.token_for("Negotiate"), None);
    }

    #[test]
    fn ntlm_challenge_answer_declines_type3() {
        let auth = Authenticator::new(config_with(AuthProtocol::Ntlm, "CORP\\jdoe", "pw"));
        let exchange = NtlmExchange::new("CORP\\jdoe");
        let mut msg = Vec::new();
        msg.extend_from_slice(b"NTLMSSP\0");
        msg.extend_from_slice(&2u32.to_le_bytes());
        msg.extend_from_slice(&[0u8; 12]);
        msg.extend_from_slice(&[9, 9, 9, 9, 9, 9, 9, 9]);
        let token = base64::engine::general_purpose::STANDARD.encode(msg);
        assert_eq!(exchange.parse_challenge(&token).unwrap(), [9u8; 8]);

        // The authenticator declines rather than fabricating a Type 3.
        let header = format!("NTLM {}", token);
        let challenge = ProxyChallenge::from_headers(std::iter::once(header.as_str()));
        assert_eq!(auth.answer_challenge(&challenge).unwrap(), None);
    }
}
