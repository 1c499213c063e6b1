//! TLS material and the byte transport under the wire protocol.

use crate::auth::ChannelCredentials;
use crate::config::SessionConfig;
use crate::{BridgeError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// Anything the wire protocol can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub type BoxTransport = Box<dyn Transport>;

/// Read PEM content given either inline PEM text or a path to a PEM file.
pub fn load_pem(value: &str) -> Result<Vec<u8>> {
    if value.trim_start().starts_with("-----BEGIN") {
        return Ok(value.as_bytes().to_vec());
    }
    std::fs::read(value).map_err(|e| BridgeError::io_with_path(e, value))
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| BridgeError::Tls {
            message: format!("invalid certificate PEM: {}", e),
        })?;
    if certs.is_empty() {
        return Err(BridgeError::Tls {
            message: "no certificate found in PEM".to_string(),
        });
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| BridgeError::Tls {
            message: format!("invalid key PEM: {}", e),
        })?
        .ok_or_else(|| BridgeError::Tls {
            message: "no private key found in PEM".to_string(),
        })
}

/// Client config trusting `ca` (PEM text or path), or the web PKI roots when
/// no CA is configured.
pub fn client_config(ca: Option<&str>) -> Result<rustls::ClientConfig> {
    let mut roots = RootCertStore::empty();
    match ca {
        Some(ca) => {
            for cert in parse_certs(&load_pem(ca)?)? {
                roots.add(cert)?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Server config from a certificate chain and key (PEM text or paths).
pub fn server_config(cert: &str, key: &str) -> Result<rustls::ServerConfig> {
    let certs = parse_certs(&load_pem(cert)?)?;
    let key = parse_key(&load_pem(key)?)?;
    Ok(rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?)
}

/// `host:port` from an endpoint that may carry a scheme (`grpc://host:port`).
pub fn normalize_endpoint(endpoint: &str) -> Result<String> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(BridgeError::connection("no endpoint"));
    }
    if !endpoint.contains("://") {
        return Ok(endpoint.to_string());
    }

    let url = url::Url::parse(endpoint)
        .map_err(|e| BridgeError::connection(format!("invalid endpoint {}: {}", endpoint, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| BridgeError::connection(format!("endpoint {} has no host", endpoint)))?;
    let port = url
        .port()
        .ok_or_else(|| BridgeError::connection(format!("endpoint {} has no port", endpoint)))?;
    Ok(format!("{}:{}", host, port))
}

/// Open the client transport for `endpoint`.
pub async fn connect(endpoint: &str, credentials: &ChannelCredentials) -> Result<BoxTransport> {
    let addr = normalize_endpoint(endpoint)?;

    let tcp = tokio::time::timeout(SessionConfig::CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| BridgeError::connection(format!("connect to {} timed out", addr)))?
        .map_err(|e| BridgeError::connection(format!("connect to {} failed: {}", addr, e)))?;
    tcp.set_nodelay(true)?;

    match credentials {
        ChannelCredentials::Insecure => {
            debug!("Plaintext transport to {}", addr);
            Ok(Box::new(tcp))
        }
        ChannelCredentials::Tls {
            server_name,
            config,
        } => {
            let name = ServerName::try_from(server_name.clone()).map_err(|e| {
                BridgeError::connection(format!("invalid server name {}: {}", server_name, e))
            })?;
            let connector = tokio_rustls::TlsConnector::from(Arc::clone(config));
            let stream = connector
                .connect(name, tcp)
                .await
                .map_err(|e| BridgeError::connection(format!("TLS handshake failed: {}", e)))?;
            debug!("TLS transport to {} (SNI {})", addr, server_name);
            Ok(Box::new(stream))
        }
    }
}

/// Server-side transport upgrade.
#[derive(Clone)]
pub enum Acceptor {
    Plain,
    Tls(tokio_rustls::TlsAcceptor),
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Acceptor::Plain => f.write_str("Plain"),
            Acceptor::Tls(_) => f.write_str("Tls"),
        }
    }
}

impl Acceptor {
    pub fn tls(config: rustls::ServerConfig) -> Self {
        Acceptor::Tls(tokio_rustls::TlsAcceptor::from(Arc::new(config)))
    }

    pub async fn accept(&self, tcp: TcpStream) -> Result<BoxTransport> {
        match self {
            Acceptor::Plain => Ok(Box::new(tcp)),
            Acceptor::Tls(acceptor) => {
                let stream = acceptor.accept(tcp).await.map_err(|e| BridgeError::Tls {
                    message: format!("TLS accept failed: {}", e),
                })?;
                Ok(Box::new(stream))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("127.0.0.1:8788").unwrap(), "127.0.0.1:8788");
        assert_eq!(
            normalize_endpoint("grpc://puppet.example.com:443").unwrap(),
            "puppet.example.com:443"
        );
        assert!(normalize_endpoint("  ").is_err());
        assert!(normalize_endpoint("grpc://no-port.example.com").is_err());
    }

    #[test]
    fn test_load_pem_accepts_inline_text() {
        let pem = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
        assert_eq!(load_pem(pem).unwrap(), pem.as_bytes());
    }

    #[test]
    fn test_load_pem_missing_file() {
        assert!(matches!(
            load_pem("/definitely/not/here.pem"),
            Err(BridgeError::Io { .. })
        ));
    }

    #[test]
    fn test_client_config_defaults_to_web_roots() {
        assert!(client_config(None).is_ok());
    }

    #[test]
    fn test_garbage_ca_is_rejected() {
        let pem = "-----BEGIN CERTIFICATE-----\n!!!!\n-----END CERTIFICATE-----\n";
        assert!(client_config(Some(pem)).is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        let result = connect("127.0.0.1:1", &ChannelCredentials::Insecure).await;
        assert!(matches!(result, Err(BridgeError::Connection { .. })));
    }
}
