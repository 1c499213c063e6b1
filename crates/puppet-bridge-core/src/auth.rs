//! Credential negotiation.
//!
//! A session authenticates every call with an `authorization` metadata entry
//! of the form `Puppet <token>`. Tokens look like `<sni>_<opaque>`; in TLS
//! mode the prefix selects the virtual backend behind a shared endpoint
//! unless a server name is configured explicitly.

use crate::config::{BridgeOptions, SessionConfig};
use crate::tls;
use crate::wire::Metadata;
use crate::{BridgeError, Result};
use std::sync::Arc;
use tracing::debug;

/// A service token.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the opaque part.
        match self.sni() {
            Some(sni) => write!(f, "Token({}_***)", sni),
            None => f.write_str("Token(***)"),
        }
    }
}

impl Token {
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(BridgeError::connection("empty token"));
        }
        Ok(Token(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Server name indication embedded as the token prefix.
    pub fn sni(&self) -> Option<&str> {
        let (prefix, opaque) = self.0.rsplit_once('_')?;
        if prefix.is_empty() || opaque.is_empty() {
            None
        } else {
            Some(prefix)
        }
    }
}

/// Per-call credential: injects the authorization entry into call metadata.
#[derive(Clone)]
pub struct CallCredentials {
    header_value: String,
}

impl std::fmt::Debug for CallCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CallCredentials(***)")
    }
}

impl CallCredentials {
    pub fn new(token: &Token) -> Self {
        Self {
            header_value: authorization_value(token.as_str()),
        }
    }

    pub fn apply(&self, metadata: &mut Metadata) {
        metadata.insert(
            SessionConfig::AUTHORIZATION_KEY.to_string(),
            self.header_value.clone(),
        );
    }

    pub fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        self.apply(&mut metadata);
        metadata
    }
}

/// `Puppet <token>`
pub fn authorization_value(token: &str) -> String {
    format!("{} {}", SessionConfig::AUTH_SCHEME, token)
}

/// Server-side check of a call's metadata against the expected token.
pub fn verify(metadata: &Metadata, expected: &Token) -> Result<()> {
    let value = metadata
        .get(SessionConfig::AUTHORIZATION_KEY)
        .ok_or_else(|| BridgeError::Unauthenticated {
            message: "missing authorization metadata".to_string(),
        })?;

    let token = value
        .strip_prefix(SessionConfig::AUTH_SCHEME)
        .and_then(|rest| rest.strip_prefix(' '))
        .ok_or_else(|| BridgeError::Unauthenticated {
            message: format!("expected {} scheme", SessionConfig::AUTH_SCHEME),
        })?;

    if !constant_time_eq(token.trim().as_bytes(), expected.as_str().as_bytes()) {
        return Err(BridgeError::Unauthenticated {
            message: "invalid token".to_string(),
        });
    }
    Ok(())
}

/// Byte comparison whose running time depends only on the lengths.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Transport-level credential of a channel.
#[derive(Clone)]
pub enum ChannelCredentials {
    Insecure,
    Tls {
        server_name: String,
        config: Arc<rustls::ClientConfig>,
    },
}

impl std::fmt::Debug for ChannelCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelCredentials::Insecure => f.write_str("Insecure"),
            ChannelCredentials::Tls { server_name, .. } => {
                f.debug_struct("Tls").field("server_name", server_name).finish()
            }
        }
    }
}

impl ChannelCredentials {
    pub fn is_tls(&self) -> bool {
        matches!(self, ChannelCredentials::Tls { .. })
    }
}

/// Everything a session needs to authenticate.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub token: Token,
    pub channel: ChannelCredentials,
    pub call: CallCredentials,
}

impl Credentials {
    /// Build credentials from options without touching the network.
    ///
    /// Fails with a connection error when the token is missing, or when TLS
    /// is enabled and neither the token prefix nor the configuration yields a
    /// server name.
    pub fn build(options: &BridgeOptions) -> Result<Self> {
        let token = Token::parse(
            options
                .token
                .clone()
                .ok_or_else(|| BridgeError::connection("no token"))?,
        )?;
        let call = CallCredentials::new(&token);

        if options.insecure_client() {
            debug!("Building insecure channel credentials");
            return Ok(Self {
                token,
                channel: ChannelCredentials::Insecure,
                call,
            });
        }

        let server_name = options
            .tls
            .server_name
            .clone()
            .or_else(|| token.sni().map(str::to_string))
            .ok_or_else(|| {
                BridgeError::connection(
                    "no SNI token prefix and no TLS server name configured",
                )
            })?;

        let config = tls::client_config(options.tls.ca_cert.as_deref()).map_err(|e| {
            BridgeError::connection(format!("invalid TLS client material: {}", e))
        })?;

        debug!("Building TLS channel credentials for SNI {}", server_name);
        Ok(Self {
            token,
            channel: ChannelCredentials::Tls {
                server_name,
                config: Arc::new(config),
            },
            call,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sni_from_token_prefix() {
        assert_eq!(Token::parse("puppet_0123abcd").unwrap().sni(), Some("puppet"));
        assert_eq!(Token::parse("a_b_c").unwrap().sni(), Some("a_b"));
        assert_eq!(Token::parse("noprefix").unwrap().sni(), None);
        assert_eq!(Token::parse("_opaque").unwrap().sni(), None);
    }

    #[test]
    fn test_token_debug_hides_secret() {
        let token = Token::parse("puppet_secret").unwrap();
        assert!(!format!("{:?}", token).contains("secret"));
    }

    #[test]
    fn test_call_credentials_header() {
        let token = Token::parse("puppet_abc").unwrap();
        let metadata = CallCredentials::new(&token).metadata();
        assert_eq!(
            metadata.get("authorization").map(String::as_str),
            Some("Puppet puppet_abc")
        );
        assert!(verify(&metadata, &token).is_ok());
    }

    #[test]
    fn test_verify_rejects_bad_metadata() {
        let token = Token::parse("puppet_abc").unwrap();

        assert!(matches!(
            verify(&Metadata::new(), &token),
            Err(BridgeError::Unauthenticated { .. })
        ));

        let mut wrong_scheme = Metadata::new();
        wrong_scheme.insert("authorization".into(), "Bearer puppet_abc".into());
        assert!(verify(&wrong_scheme, &token).is_err());

        let other = CallCredentials::new(&Token::parse("puppet_xyz").unwrap()).metadata();
        assert!(verify(&other, &token).is_err());
    }

    #[test]
    fn test_token_comparison() {
        assert!(constant_time_eq(b"puppet_abc", b"puppet_abc"));
        assert!(!constant_time_eq(b"puppet_abc", b"puppet_abd"));
        assert!(!constant_time_eq(b"puppet_abc", b"puppet_ab"));
        assert!(constant_time_eq(b"", b""));

        // Same length, differing only in the last byte.
        let token = Token::parse("puppet_abc").unwrap();
        let near = CallCredentials::new(&Token::parse("puppet_abd").unwrap()).metadata();
        assert!(matches!(
            verify(&near, &token),
            Err(BridgeError::Unauthenticated { .. })
        ));
    }

    #[test]
    fn test_tls_without_sni_fails_before_io() {
        let options = BridgeOptions::new()
            .with_token("nosni")
            .with_endpoint("127.0.0.1:1");
        let err = Credentials::build(&options).unwrap_err();
        assert!(matches!(err, BridgeError::Connection { .. }));
        assert!(err.to_string().contains("SNI"));
    }

    #[test]
    fn test_missing_token_fails() {
        let err = Credentials::build(&BridgeOptions::new()).unwrap_err();
        assert!(err.to_string().contains("no token"));
    }

    #[test]
    fn test_insecure_ignores_sni() {
        let options = BridgeOptions::new()
            .with_token("nosni")
            .with_insecure_client(true);
        let creds = Credentials::build(&options).unwrap();
        assert!(!creds.channel.is_tls());
    }

    #[test]
    fn test_tls_with_token_prefix() {
        let options = BridgeOptions::new().with_token("puppet_abc");
        let creds = Credentials::build(&options).unwrap();
        match creds.channel {
            ChannelCredentials::Tls { server_name, .. } => assert_eq!(server_name, "puppet"),
            other => panic!("Expected TLS, got: {:?}", other),
        }
    }
}
