//! # Configuration
//!
//! One TOML file plus command-line overrides.
//!
//! ```text
//! <config dir>/mqtt2cast/config.toml   created with defaults on first start
//!            │
//!            ▼
//!        AppConfig ◄── Cli flags (override file values)
//!            │
//!            ▼
//!        validate() ── fatal on: no discovery mode, bad range, bad topic prefix
//! ```
//!
//! Every section tolerates missing keys, so an old file keeps working when new
//! settings are added.

use crate::command::PlaybackSettings;
use crate::discovery::DiscoverySettings;
use crate::mqtt::topic::validate_prefix;
use crate::mqtt::MqttConfig;
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = "mqtt2cast";
const CONFIG_FILE: &str = "config.toml";

/// Command line of the `mqtt2cast` binary
#[derive(Parser, Debug, Default, Clone)]
#[command(name = "mqtt2cast")]
#[command(author, version, about = "Bridge between an MQTT bus and Google Cast devices", long_about = None)]
pub struct Cli {
    /// MQTT broker host
    #[arg(short = 'b', long = "mqtt-broker")]
    pub mqtt_broker: Option<String>,

    /// MQTT broker port
    #[arg(short = 'p', long = "mqtt-port")]
    pub mqtt_port: Option<u16>,

    /// Log bus publishes instead of sending them
    #[arg(short = 'd', long = "dryrun")]
    pub dryrun: bool,

    /// Debug logging
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Status page bind address
    #[arg(short = 's', long = "host")]
    pub host: Option<String>,

    /// Status page port
    #[arg(short = 'q', long = "port")]
    pub port: Option<u16>,

    /// Address range to probe (CIDR, a.b.c.d-e or single address); repeatable
    #[arg(long = "subnet", value_name = "RANGE")]
    pub subnets: Vec<String>,

    /// Disable mDNS discovery
    #[arg(long)]
    pub no_mdns: bool,

    /// Configuration file to use instead of the default location
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

/// `[status_page]` section
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StatusPageSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for StatusPageSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 7777,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub discovery: DiscoverySettings,
    pub playback: PlaybackSettings,
    pub status_page: StatusPageSettings,
}

impl AppConfig {
    /// Reads the file named by `--config` or the default file, creating the latter
    /// with defaults if it is missing, then applies the command line and validates.
    pub async fn load(cli: &Cli) -> Result<Self> {
        let path = match &cli.config {
            Some(path) => path.clone(),
            None => {
                let path = default_config_path();
                ensure_default_config(&path).await?;
                path
            }
        };

        let mut config = Self::from_file(&path).await?;
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        debug!("Reading configuration from {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        Self::from_toml(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Command-line values win over the file.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(broker) = &cli.mqtt_broker {
            self.mqtt.broker = broker.clone();
        }
        if let Some(port) = cli.mqtt_port {
            self.mqtt.port = port;
        }
        if cli.dryrun {
            self.mqtt.dry_run = true;
        }
        if let Some(host) = &cli.host {
            self.status_page.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.status_page.port = port;
        }
        if !cli.subnets.is_empty() {
            self.discovery.subnets = cli.subnets.clone();
        }
        if cli.no_mdns {
            self.discovery.mdns = false;
        }
    }

    /// Catches every configuration mistake before any network work starts.
    pub fn validate(&self) -> Result<()> {
        if self.mqtt.broker.trim().is_empty() {
            return Err(eyre!("No MQTT broker configured"));
        }
        validate_prefix(&self.mqtt.topic_prefix)?;
        let targets = self.discovery.targets()?;
        if self.discovery.max_concurrent_probes == 0 {
            warn!("max_concurrent_probes is 0, probing one address at a time");
        }
        info!(
            "Configuration: broker {}:{}, prefix {}, mdns {}, {} active targets",
            self.mqtt.broker,
            self.mqtt.port,
            self.mqtt.topic_prefix,
            self.discovery.mdns,
            targets.len()
        );
        Ok(())
    }
}

pub fn default_config_path() -> PathBuf {
    let mut path = dirs::config_dir().unwrap_or_else(|| {
        warn!("Could not determine config directory, using current directory");
        PathBuf::from(".")
    });
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}

/// Writes a default configuration to `path` unless a file already exists there.
pub async fn ensure_default_config(path: &Path) -> Result<()> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(());
    }

    info!("Creating default configuration at {}", path.display());
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
    }
    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| eyre!("Failed to serialize default config: {}", e))?;
    tokio::fs::write(path, content)
        .await
        .map_err(|e| eyre!("Failed to write config file: {}", e))?;
    Ok(())
}
