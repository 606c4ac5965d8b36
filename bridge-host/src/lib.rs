//! Engine host
//!
//! Runs the bridge engine in its own process and serves its runtime channel
//! as length-prefixed JSON frames, normally over stdin/stdout.

pub mod client;
pub mod error;
mod forward;
pub mod frame;
pub mod logging;
pub mod server;

pub use client::HostClient;
pub use error::{HostError, Result};
pub use frame::{ClientFrame, ServerFrame, MAX_FRAME_BYTES};
pub use logging::{init_logging, LoggingConfig};
pub use server::HostServer;

use bridge_engine::{Engine, EngineConfig, EngineHandle, JsonFileSettingsStore, MemorySettingsStore, SettingsStore};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Settings file (JSON); in-memory defaults when omitted
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON on stderr
    #[arg(long)]
    pub json_logs: bool,

    /// Push finished request log entries to the client
    #[arg(long)]
    pub forward_logs: bool,

    /// Upstream request timeout in milliseconds
    #[arg(long)]
    pub fetch_timeout_ms: Option<u64>,
}

impl Args {
    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.log_level.clone(),
            json_format: self.json_logs,
            ..Default::default()
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        if let Some(timeout) = self.fetch_timeout_ms {
            config.fetch_timeout_ms = timeout;
        }
        config
    }
}

/// Build the engine described by `args`
pub async fn build_engine(args: &Args) -> Result<EngineHandle> {
    let store: Arc<dyn SettingsStore> = match &args.settings {
        Some(path) => Arc::new(JsonFileSettingsStore::new(path)),
        None => Arc::new(MemorySettingsStore::default()),
    };
    let engine = Engine::new(args.engine_config(), store).await?;
    Ok(EngineHandle::new(engine))
}

/// Serve the engine on stdin/stdout until the client goes away
pub async fn run_host(args: Args) -> Result<()> {
    tracing::info!("Starting bridge host...");
    if let Some(path) = &args.settings {
        tracing::info!("  Settings: {}", path.display());
    }

    let handle = build_engine(&args).await?;
    HostServer::new(handle)
        .with_log_forwarding(args.forward_logs)
        .serve(tokio::io::stdin(), tokio::io::stdout())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_common::{RuntimeChannel, RuntimeMessage, RuntimeReply, SenderInfo};

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["bridge-host"]);
        assert_eq!(args.log_level, "info");
        assert!(args.settings.is_none());
        assert!(!args.forward_logs);
        assert_eq!(args.engine_config().fetch_timeout_ms, EngineConfig::default().fetch_timeout_ms);
    }

    #[test]
    fn test_args_overrides() {
        let args = Args::parse_from([
            "bridge-host",
            "--settings",
            "/tmp/bridge.json",
            "--json-logs",
            "--forward-logs",
            "--fetch-timeout-ms",
            "5000",
        ]);
        assert_eq!(args.settings, Some(PathBuf::from("/tmp/bridge.json")));
        assert!(args.logging_config().json_format);
        assert!(args.forward_logs);
        assert_eq!(args.engine_config().fetch_timeout_ms, 5000);
    }

    #[tokio::test]
    async fn test_engine_reads_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"settingsVersion": 0, "env": {"OPENAI_API_KEY": "sk-file"}}"#).unwrap();

        let args = Args::parse_from(["bridge-host", "--settings", path.to_str().unwrap()]);
        let handle = build_engine(&args).await.unwrap();
        let reply = handle
            .send_message(
                &SenderInfo::new("http://localhost:5173"),
                RuntimeMessage::KeyCheck {
                    key_name: "OPENAI_API_KEY".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(reply, RuntimeReply::KeyCheck { is_set: true });
    }

    #[tokio::test]
    async fn test_malformed_settings_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        let args = Args::parse_from(["bridge-host", "--settings", path.to_str().unwrap()]);
        assert!(matches!(build_engine(&args).await, Err(HostError::Engine(_))));
    }
}
