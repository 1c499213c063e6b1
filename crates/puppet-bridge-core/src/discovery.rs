//! Endpoint discovery.
//!
//! A client configured with only a token asks the discovery authority where
//! its backend lives:
//!
//! ```text
//! GET https://<authority>/v0/hosties/<token>  ->  {"ip": "1.2.3.4", "port": 8788}
//! ```
//!
//! A 404, an empty IP or a zero port all mean "no endpoint registered".

use crate::auth::Token;
use crate::config::DiscoveryConfig;
use crate::retry::{retry_async, RetryConfig};
use crate::{BridgeError, Result};
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Deserialize)]
struct HostieRecord {
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    port: Option<u16>,
}

impl HostieRecord {
    fn endpoint(&self) -> Option<String> {
        let ip = self.ip.as_deref().map(str::trim).filter(|ip| !ip.is_empty())?;
        let port = self.port.filter(|port| *port != 0)?;
        Some(format!("{}:{}", ip, port))
    }
}

/// Lookup URL for `token` under `authority`.
///
/// The authority may carry a scheme; bare hosts are reached over HTTPS.
pub fn lookup_url(authority: &str, token: &Token) -> Result<url::Url> {
    let authority = authority.trim().trim_end_matches('/');
    let base = if authority.contains("://") {
        authority.to_string()
    } else {
        format!("https://{}", authority)
    };

    let mut url = url::Url::parse(&base)
        .map_err(|e| BridgeError::connection(format!("invalid authority {}: {}", authority, e)))?;
    url.path_segments_mut()
        .map_err(|_| BridgeError::connection(format!("authority {} cannot be a base", authority)))?
        .extend(["v0", "hosties", token.as_str()]);
    Ok(url)
}

/// Resolve the endpoint registered for `token`, or `None` if there is none.
pub async fn discover(authority: &str, token: &Token) -> Result<Option<String>> {
    discover_with(authority, token, &RetryConfig::default()).await
}

pub async fn discover_with(
    authority: &str,
    token: &Token,
    retry: &RetryConfig,
) -> Result<Option<String>> {
    let url = lookup_url(authority, token)?;
    let client = reqwest::Client::builder()
        .timeout(DiscoveryConfig::REQUEST_TIMEOUT)
        .build()?;

    debug!("Discovering endpoint via {}", authority);
    let (result, stats) = retry_async(
        retry,
        || fetch_record(&client, url.clone()),
        BridgeError::is_retryable,
    )
    .await;

    let endpoint = result?.and_then(|record| record.endpoint());
    match &endpoint {
        Some(endpoint) => info!(
            "Discovered endpoint {} after {} attempt(s)",
            endpoint, stats.attempts
        ),
        None => info!("No endpoint registered at {}", authority),
    }
    Ok(endpoint)
}

async fn fetch_record(client: &reqwest::Client, url: url::Url) -> Result<Option<HostieRecord>> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| BridgeError::connection(format!("discovery request failed: {}", e)))?;

    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if status.is_server_error() {
        return Err(BridgeError::connection(format!("discovery returned {}", status)));
    }
    if !status.is_success() {
        return Err(BridgeError::Other(format!("discovery returned {}", status)));
    }

    let record = response
        .json::<HostieRecord>()
        .await
        .map_err(|e| BridgeError::Other(format!("invalid discovery response: {}", e)))?;
    Ok(Some(record))
}
