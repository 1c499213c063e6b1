//! Centralized configuration for the puppet bridge.
//!
//! Fixed protocol constants live on unit structs as associated consts.
//! Deployment settings (token, endpoint, TLS material) live on
//! [`BridgeOptions`], which merges explicit values over the process
//! environment.

use std::time::Duration;

/// Client session configuration.
pub struct SessionConfig;

impl SessionConfig {
    /// How long `start()` waits for the first event-stream signal.
    pub const START_TIMEOUT: Duration = Duration::from_secs(5);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    /// Scheme literal of the `authorization` metadata value.
    pub const AUTH_SCHEME: &'static str = "Puppet";
    pub const AUTHORIZATION_KEY: &'static str = "authorization";
    /// Capacity of the session event emitter.
    pub const EMITTER_CAPACITY: usize = 1024;
}

/// Transfer policy and chunk codec configuration.
pub struct TransferConfig;

impl TransferConfig {
    /// Buffer and base64 payloads below this size travel inline.
    pub const INLINE_THRESHOLD: u64 = 2 * 1024 * 1024;
    /// Maximum payload of one data frame.
    pub const CHUNK_SIZE: usize = 64 * 1024;
}

/// Out-of-band store configuration.
pub struct StoreConfig;

impl StoreConfig {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);
    pub const ROOT_DIR_PREFIX: &'static str = "puppet-bridge";
    pub const STORE_DIR_PREFIX: &'static str = "store-";
}

/// Wire framing configuration.
pub struct WireConfig;

impl WireConfig {
    pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;
    /// Bounded queue depth per stream and per connection writer.
    pub const STREAM_BUFFER: usize = 64;
}

/// Server configuration.
pub struct ServerConfig;

impl ServerConfig {
    pub const MAX_CONNECTIONS: usize = 256;
    pub const DEFAULT_BIND: &'static str = "127.0.0.1:8788";
}

/// Endpoint discovery configuration.
pub struct DiscoveryConfig;

impl DiscoveryConfig {
    pub const DEFAULT_AUTHORITY: &'static str = "api.chatie.io";
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    pub const MAX_ATTEMPTS: u32 = 3;
}

/// Heartbeat watchdog thresholds.
///
/// The soft cycle probes the backend after `soft_threshold` of silence and
/// repeats every `soft_threshold / 2`. The hard cycle requests a session reset
/// after `hard_threshold` of silence and repeats every `hard_threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub soft_threshold: Duration,
    pub hard_threshold: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            soft_threshold: Duration::from_secs(15),
            hard_threshold: Duration::from_secs(60),
        }
    }
}

impl WatchdogConfig {
    /// Interval between repeated probes once the soft threshold is crossed.
    pub fn soft_interval(&self) -> Duration {
        self.soft_threshold / 2
    }

    /// Interval between repeated reset requests.
    pub fn hard_interval(&self) -> Duration {
        self.hard_threshold
    }
}

/// Environment variable names recognized by [`BridgeOptions::from_env`].
pub struct EnvVars;

impl EnvVars {
    pub const TOKEN: &'static str = "PUPPET_SERVICE_TOKEN";
    pub const ENDPOINT: &'static str = "PUPPET_SERVICE_ENDPOINT";
    pub const AUTHORITY: &'static str = "PUPPET_SERVICE_AUTHORITY";
    pub const TLS_CA_CERT: &'static str = "PUPPET_SERVICE_TLS_CA_CERT";
    pub const TLS_SERVER_CERT: &'static str = "PUPPET_SERVICE_TLS_SERVER_CERT";
    pub const TLS_SERVER_KEY: &'static str = "PUPPET_SERVICE_TLS_SERVER_KEY";
    pub const TLS_SERVER_NAME: &'static str = "PUPPET_SERVICE_TLS_SERVER_NAME";
    pub const NO_TLS_INSECURE_CLIENT: &'static str = "PUPPET_SERVICE_NO_TLS_INSECURE_CLIENT";
    pub const NO_TLS_INSECURE_SERVER: &'static str = "PUPPET_SERVICE_NO_TLS_INSECURE_SERVER";
}

/// TLS material. Each value is PEM text or a path to a PEM file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    pub ca_cert: Option<String>,
    pub server_cert: Option<String>,
    pub server_key: Option<String>,
    pub server_name: Option<String>,
}

/// Deployment options for both client and server.
///
/// Explicit values always win; [`BridgeOptions::with_env`] only fills the
/// gaps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeOptions {
    pub token: Option<String>,
    pub endpoint: Option<String>,
    /// Discovery service host used when no endpoint is configured.
    pub authority: Option<String>,
    pub tls: TlsOptions,
    /// Force plaintext on the client side.
    pub no_tls_insecure_client: Option<bool>,
    /// Force plaintext on the server side.
    pub no_tls_insecure_server: Option<bool>,
}

impl BridgeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = Some(authority.into());
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_insecure_client(mut self, insecure: bool) -> Self {
        self.no_tls_insecure_client = Some(insecure);
        self
    }

    pub fn with_insecure_server(mut self, insecure: bool) -> Self {
        self.no_tls_insecure_server = Some(insecure);
        self
    }

    /// Options read purely from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Fill unset fields from the process environment.
    pub fn with_env(self) -> Self {
        self.or(Self::from_env())
    }

    /// Build options from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            token: get(EnvVars::TOKEN),
            endpoint: get(EnvVars::ENDPOINT),
            authority: get(EnvVars::AUTHORITY),
            tls: TlsOptions {
                ca_cert: get(EnvVars::TLS_CA_CERT),
                server_cert: get(EnvVars::TLS_SERVER_CERT),
                server_key: get(EnvVars::TLS_SERVER_KEY),
                server_name: get(EnvVars::TLS_SERVER_NAME),
            },
            no_tls_insecure_client: get(EnvVars::NO_TLS_INSECURE_CLIENT).map(|v| parse_flag(&v)),
            no_tls_insecure_server: get(EnvVars::NO_TLS_INSECURE_SERVER).map(|v| parse_flag(&v)),
        }
    }

    /// Field-wise merge: `self` wins, `fallback` fills the gaps.
    pub fn or(self, fallback: Self) -> Self {
        Self {
            token: self.token.or(fallback.token),
            endpoint: self.endpoint.or(fallback.endpoint),
            authority: self.authority.or(fallback.authority),
            tls: TlsOptions {
                ca_cert: self.tls.ca_cert.or(fallback.tls.ca_cert),
                server_cert: self.tls.server_cert.or(fallback.tls.server_cert),
                server_key: self.tls.server_key.or(fallback.tls.server_key),
                server_name: self.tls.server_name.or(fallback.tls.server_name),
            },
            no_tls_insecure_client: self.no_tls_insecure_client.or(fallback.no_tls_insecure_client),
            no_tls_insecure_server: self.no_tls_insecure_server.or(fallback.no_tls_insecure_server),
        }
    }

    pub fn insecure_client(&self) -> bool {
        self.no_tls_insecure_client.unwrap_or(false)
    }

    pub fn insecure_server(&self) -> bool {
        self.no_tls_insecure_server.unwrap_or(false)
    }

    pub fn authority(&self) -> &str {
        self.authority
            .as_deref()
            .unwrap_or(DiscoveryConfig::DEFAULT_AUTHORITY)
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
