//! Command line and configuration file handling.
//!
//! Command line values take precedence over `fias-bridge.toml`, which takes
//! precedence over the built-in defaults.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::dispatch::{GuestNameTemplate, HandshakePacing, LinkSettings};
use crate::error::BridgeError;
use crate::server::LinkConfig;
use crate::supervisor::DEFAULT_RESTART_DELAY;

/// Config file picked up from the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "fias-bridge.toml";

const DEFAULT_PORT: u16 = 5008;
const DEFAULT_WEB_LISTEN: &str = "0.0.0.0:8080";
const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_LOG_RETENTION_DAYS: u64 = 7;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 5;

/// fias-bridge - FIAS interface server for hotel PMS integration
#[derive(Parser, Debug, Default)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// IP address to listen on for the PMS [default: 0.0.0.0]
    #[arg(short, long)]
    pub address: Option<IpAddr>,

    /// TCP port to listen on for the PMS [default: 5008]
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address for the admin API to listen on [default: 0.0.0.0:8080]
    #[arg(long)]
    pub web_listen: Option<SocketAddr>,

    /// Configuration file path
    #[arg(short = 'f', long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Reject frames with a bad LRC instead of processing them
    #[arg(long)]
    pub strict_checksum: bool,

    /// Directory where log files are stored [default: logs]
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Number of days to keep log files [default: 7]
    #[arg(long)]
    pub log_retention_days: Option<u64>,
}

/// Configuration file format.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub fias: FiasSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Deserialize, Default)]
pub struct ServerSection {
    pub address: Option<IpAddr>,
    pub port: Option<u16>,
    pub web_listen: Option<SocketAddr>,
    pub read_timeout_secs: Option<u64>,
    pub restart_delay_secs: Option<u64>,
    pub strict_checksum: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
pub struct FiasSection {
    pub version: Option<String>,
    pub interface_type: Option<String>,
    pub character_set: Option<String>,
    pub decimal_point: Option<u32>,
    pub guest_name_macro: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LoggingSection {
    pub log_dir: Option<PathBuf>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub link: LinkConfig,
    pub settings: LinkSettings,
    pub web_listen: SocketAddr,
    pub restart_delay: Duration,
    pub log_dir: PathBuf,
    pub log_retention_days: u64,
    pub log_level: Option<String>,
    pub verbose: bool,
}

impl Config {
    /// Merge command line arguments over the file configuration.
    pub fn resolve(args: &Args, file: ConfigFile) -> Result<Self, BridgeError> {
        let ConfigFile {
            server,
            fias,
            logging,
        } = file;

        let address = args
            .address
            .or(server.address)
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let port = args.port.or(server.port).unwrap_or(DEFAULT_PORT);

        let web_listen = match args.web_listen.or(server.web_listen) {
            Some(addr) => addr,
            None => DEFAULT_WEB_LISTEN
                .parse()
                .map_err(|e| BridgeError::Config(format!("default web address: {}", e)))?,
        };

        let read_timeout = server.read_timeout_secs.unwrap_or(DEFAULT_READ_TIMEOUT_SECS);
        if read_timeout == 0 {
            return Err(BridgeError::Config("read_timeout_secs must be at least 1".to_string()));
        }

        let defaults = LinkSettings::default();
        let settings = LinkSettings {
            protocol_version: fias.version.unwrap_or(defaults.protocol_version),
            interface_type: fias.interface_type.unwrap_or(defaults.interface_type),
            character_set: fias.character_set.unwrap_or(defaults.character_set),
            decimal_places: fias.decimal_point.unwrap_or(defaults.decimal_places),
            guest_name_template: fias
                .guest_name_macro
                .map(GuestNameTemplate::new)
                .unwrap_or_default(),
            pacing: HandshakePacing::default(),
        };
        settings.validate()?;

        Ok(Self {
            link: LinkConfig {
                listen_addr: SocketAddr::new(address, port),
                read_timeout: Duration::from_secs(read_timeout),
                strict_checksum: args.strict_checksum || server.strict_checksum.unwrap_or(false),
                ..LinkConfig::default()
            },
            settings,
            web_listen,
            restart_delay: server
                .restart_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RESTART_DELAY),
            log_dir: args
                .log_dir
                .clone()
                .or(logging.log_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR)),
            log_retention_days: args
                .log_retention_days
                .or(logging.retention_days)
                .unwrap_or(DEFAULT_LOG_RETENTION_DAYS),
            log_level: logging.level,
            verbose: args.verbose,
        })
    }
}

/// The config file to load: the explicit path, or the default file if present.
pub fn config_path(args: &Args) -> Option<PathBuf> {
    args.config.clone().or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        default_path.exists().then_some(default_path)
    })
}

pub fn load_config(path: &Path) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}
