//! Server configuration
//!
//! Settings come from an optional TOML file; command line flags override
//! individual values. Every section has defaults, so an empty file (or no
//! file) yields a working local setup.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

use rvoip_infra_common::{Error, ErrorExt, LoggingConfig, Result};
use rvoip_kurento_client::KurentoConfig;
use rvoip_signaling_core::{BrokerConfig, MediaTopology};

/// Command line of the call broker
#[derive(Parser, Debug, Default)]
#[command(name = "rvoip-call-broker")]
#[command(about = "WebSocket signaling broker for two-party WebRTC calls on Kurento")]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address the WebSocket server listens on
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Kurento Media Server WebSocket URL
    #[arg(long)]
    pub kurento_url: Option<String>,

    /// Media server request timeout in milliseconds
    #[arg(long)]
    pub request_timeout_ms: Option<u64>,

    /// Directory served as static files (the browser client)
    #[arg(long)]
    pub static_dir: Option<PathBuf>,

    /// Pipeline wiring: direct or composite
    #[arg(long, value_parser = parse_topology)]
    pub topology: Option<MediaTopology>,

    /// Log level
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log as JSON lines
    #[arg(long)]
    pub log_json: bool,
}

fn parse_topology(value: &str) -> std::result::Result<MediaTopology, String> {
    match value.to_ascii_lowercase().as_str() {
        "direct" => Ok(MediaTopology::Direct),
        "composite" => Ok(MediaTopology::Composite),
        other => Err(format!("unknown topology '{}', expected direct or composite", other)),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub static_dir: Option<PathBuf>,
    pub kurento: KurentoConfig,
    pub broker: BrokerConfig,
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            static_dir: None,
            kurento: KurentoConfig::default(),
            broker: BrokerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(Error::from)
            .with_context("config", format!("read {}", path.display()))?;
        Self::from_toml_str(&text).with_context("config", format!("parse {}", path.display()))
    }

    /// Load the file named on the command line (if any), apply flag overrides and validate
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, cli: &Cli) {
        if let Some(listen) = cli.listen {
            self.listen_addr = listen;
        }
        if let Some(url) = &cli.kurento_url {
            self.kurento.url = url.clone();
        }
        if let Some(timeout) = cli.request_timeout_ms {
            self.kurento.request_timeout_ms = timeout;
        }
        if let Some(dir) = &cli.static_dir {
            self.static_dir = Some(dir.clone());
        }
        if let Some(topology) = cli.topology {
            self.broker.topology = topology;
        }
        if let Some(level) = &cli.log_level {
            self.logging.level = level.clone();
        }
        if cli.log_json {
            self.logging.json = true;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.kurento.url.starts_with("ws://") || self.kurento.url.starts_with("wss://")) {
            return Err(Error::validation(format!(
                "kurento.url must be a ws:// or wss:// URL, got '{}'",
                self.kurento.url
            )));
        }
        if self.kurento.request_timeout_ms == 0 {
            return Err(Error::validation("kurento.request_timeout_ms must be greater than zero"));
        }
        if let Some(dir) = &self.static_dir {
            if !dir.is_dir() {
                return Err(Error::validation(format!("static_dir {} is not a directory", dir.display())));
            }
        }
        self.broker.validate().map_err(Error::validation)
    }
}
