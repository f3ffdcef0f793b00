//! # conduit-agent
//!
//! Conduit server binary: loads layered settings, wires the dispatcher, and
//! runs every enabled transport until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use conduit_rpc::{Dispatcher, MethodHandler, MethodRegistry, RequestContext, RpcError};
use conduit_server::ConduitServer;
use conduit_settings::ConduitSettings;
use serde_json::{Value, json};

/// Conduit MCP server.
#[derive(Parser, Debug)]
#[command(name = "conduit-agent", about = "Conduit MCP server")]
struct Cli {
    /// Settings file (defaults to `~/.conduit/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter, overriding the settings file.
    #[arg(long)]
    log_level: Option<String>,

    /// Bind host, overriding the settings file.
    #[arg(long)]
    host: Option<String>,
}

impl Cli {
    fn load_settings(&self) -> Result<ConduitSettings> {
        let path = self
            .config
            .clone()
            .unwrap_or_else(conduit_settings::settings_path);
        let mut settings = conduit_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        Ok(settings)
    }
}

struct Ping;

#[async_trait]
impl MethodHandler for Ping {
    async fn handle(&self, _: Option<Value>, _: &RequestContext) -> Result<Value, RpcError> {
        Ok(json!({ "pong": true, "timestamp": chrono::Utc::now().to_rfc3339() }))
    }
}

struct Echo;

#[async_trait]
impl MethodHandler for Echo {
    async fn handle(&self, params: Option<Value>, _: &RequestContext) -> Result<Value, RpcError> {
        Ok(params.unwrap_or(Value::Null))
    }
}

/// Reports which transport and identity a request arrived with.
struct WhoAmI;

#[async_trait]
impl MethodHandler for WhoAmI {
    async fn handle(&self, _: Option<Value>, ctx: &RequestContext) -> Result<Value, RpcError> {
        Ok(json!({
            "connectionId": ctx.connection_id,
            "transport": ctx.transport.to_string(),
            "identity": ctx.metadata.identity,
            "rateLimit": ctx.metadata.rate_limit,
        }))
    }
}

fn create_method_registry() -> MethodRegistry {
    let mut registry = MethodRegistry::new();
    registry.register("ping", Ping);
    registry.register("echo", Echo);
    registry.register("whoami", WhoAmI);
    tracing::debug!(methods = ?registry.methods(), "method registry created");
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.load_settings()?;
    conduit_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    let dispatcher = Dispatcher::builder(Arc::new(create_method_registry()))
        .settings(&settings.dispatch)
        .build();
    let server = Arc::new(ConduitServer::new(&settings, Arc::new(dispatcher)));

    for (kind, addr) in server.start().await.context("Failed to start transports")? {
        tracing::info!(transport = %kind, %addr, "listening");
    }

    let runner = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.run_until_shutdown().await }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    tracing::info!("Shutting down...");
    server.shutdown_handle().shutdown();
    runner.await.context("shutdown task failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_builtin_methods() {
        let registry = create_method_registry();
        assert_eq!(registry.methods(), vec!["echo", "ping", "whoami"]);
    }

    #[test]
    fn cli_overrides_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server":{"host":"0.0.0.0"},"logging":{"level":"warn"}}"#)
            .unwrap();

        let cli = Cli::parse_from([
            "conduit-agent",
            "--config",
            path.to_str().unwrap(),
            "--log-level",
            "debug",
        ]);
        let settings = cli.load_settings().unwrap();
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn missing_settings_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::parse_from([
            "conduit-agent",
            "--config",
            dir.path().join("absent.json").to_str().unwrap(),
            "--host",
            "localhost",
        ]);
        let settings = cli.load_settings().unwrap();
        assert_eq!(settings.server.host, "localhost");
        assert!(settings.websocket.enabled);
    }
}
