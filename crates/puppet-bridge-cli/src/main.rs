//! Puppet Bridge CLI - serve an in-memory backend or drive a remote one.
//!
//! Connection settings come from the flags below and fall back to the
//! `PUPPET_SERVICE_*` environment variables.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use puppet_bridge::retry::{retry_async, RetryConfig};
use puppet_bridge::{
    BridgeOptions, FileBox, MemoryPuppet, PuppetClient, PuppetServer, ServerOptions, SessionEvent,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "puppet-bridge")]
#[command(about = "Serve or drive a puppet over the bridge protocol")]
struct Args {
    /// Service token
    #[arg(long, global = true)]
    token: Option<String>,

    /// Server address (host:port); discovered from the token when unset
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Use plaintext instead of TLS
    #[arg(long, global = true)]
    insecure: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve an in-memory puppet
    Serve {
        /// Seconds between heartbeats
        #[arg(long, default_value = "10")]
        heartbeat: u64,
    },
    /// Print events until interrupted, restarting on reset
    Events,
    /// Send a ding
    Ding {
        #[arg(default_value = "ding")]
        data: String,
    },
    /// Call any backend method with JSON params
    Call {
        method: String,
        #[arg(default_value = "{}")]
        params: String,
    },
    /// Stage a file out of band and print its uuid
    Upload { path: PathBuf },
    /// Take a staged file and write it to disk
    Download { uuid: Uuid, output: PathBuf },
}

impl Args {
    fn options(&self) -> BridgeOptions {
        let mut options = BridgeOptions::new();
        if let Some(token) = &self.token {
            options = options.with_token(token.clone());
        }
        if let Some(endpoint) = &self.endpoint {
            options = options.with_endpoint(endpoint.clone());
        }
        if self.insecure {
            options = options
                .with_insecure_client(true)
                .with_insecure_server(true);
        }
        options.with_env()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let options = args.options();
    match args.command {
        Command::Serve { heartbeat } => serve(&options, Duration::from_secs(heartbeat)).await,
        Command::Events => events(options).await,
        Command::Ding { data } => {
            with_client(options, |client| async move { Ok(client.ding(&data).await?) }).await
        }
        Command::Call { method, params } => {
            let params: serde_json::Value =
                serde_json::from_str(&params).context("params must be JSON")?;
            with_client(options, |client| async move {
                let result = client.call(&method, params).await?;
                println!("{}", serde_json::to_string_pretty(&result)?);
                Ok(())
            })
            .await
        }
        Command::Upload { path } => {
            with_client(options, |client| async move {
                let uuid = client.upload(FileBox::from_file(path)).await?;
                println!("{}", uuid);
                Ok(())
            })
            .await
        }
        Command::Download { uuid, output } => {
            with_client(options, |client| async move {
                let file = client.download(uuid).await?;
                let bytes = file.read_to_end().await?;
                tokio::fs::write(&output, &bytes)
                    .await
                    .with_context(|| format!("writing {}", output.display()))?;
                info!("Wrote {} bytes to {}", bytes.len(), output.display());
                Ok(())
            })
            .await
        }
    }
}

async fn serve(options: &BridgeOptions, heartbeat: Duration) -> Result<()> {
    let server_options = ServerOptions::from_bridge(options)?;
    let puppet = Arc::new(MemoryPuppet::new().with_heartbeat(heartbeat));
    let handle = PuppetServer::start(puppet, server_options).await?;

    info!("Serving memory puppet on {}", handle.addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    handle.stop().await?;
    Ok(())
}

/// Run one operation on a started client, then stop it.
async fn with_client<F, Fut>(options: BridgeOptions, operation: F) -> Result<()>
where
    F: FnOnce(Arc<PuppetClient>) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let client = Arc::new(PuppetClient::new(options));
    client.start().await?;
    let result = operation(client.clone()).await;
    if let Err(e) = client.stop().await {
        warn!("Stop failed: {}", e);
    }
    result
}

async fn events(options: BridgeOptions) -> Result<()> {
    let client = PuppetClient::new(options);
    let mut events = client.subscribe();
    client.start().await?;

    let restart_policy = RetryConfig::new()
        .with_max_attempts(5)
        .with_base_delay(Duration::from_secs(1));

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => break,
        };
        match event {
            Ok(SessionEvent::Event(event)) => println!("{:?}", event),
            Ok(SessionEvent::Reset { reason }) => {
                warn!("Session reset: {}", reason);
                let (result, stats) =
                    retry_async(&restart_policy, || client.restart(), |_| true).await;
                result.with_context(|| format!("restart failed after {} attempts", stats.attempts))?;
                info!("Session restarted");
            }
            Err(RecvError::Lagged(skipped)) => warn!("Dropped {} events", skipped),
            Err(RecvError::Closed) => break,
        }
    }

    client.stop().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_download() {
        let uuid = Uuid::new_v4();
        let uuid_arg = uuid.to_string();
        let args = Args::try_parse_from([
            "puppet-bridge",
            "--token",
            "puppet_abc",
            "--insecure",
            "download",
            uuid_arg.as_str(),
            "out.bin",
        ])
        .unwrap();

        match args.command {
            Command::Download { uuid: parsed, output } => {
                assert_eq!(parsed, uuid);
                assert_eq!(output, PathBuf::from("out.bin"));
            }
            other => panic!("Expected Download, got: {:?}", other),
        }
    }

    #[test]
    fn test_insecure_flag_covers_both_sides() {
        let args = Args::try_parse_from(["puppet-bridge", "--insecure", "events"]).unwrap();
        let options = args.options();
        assert!(options.insecure_client());
        assert!(options.insecure_server());
    }

    #[test]
    fn test_rejects_bad_uuid() {
        assert!(Args::try_parse_from(["puppet-bridge", "download", "nope", "x"]).is_err());
    }
}
