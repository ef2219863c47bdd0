use std::fs::read_to_string;
use std::net::SocketAddr;

use clap::Parser;
use serde::Deserialize;
use service::ChannelOptions;

#[derive(Deserialize, Debug)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

/// The sockets this node listens on, plus the NTP servers consulted for
/// timestamp clamping (§4.1's sanity window).
#[derive(Deserialize, Debug)]
pub struct Net {
    #[serde(default = "Net::listen")]
    pub listen: SocketAddr,

    /// Address the configuration server is reachable on; drives the
    /// protocol-version discovery handshake in the channel master.
    #[serde(default)]
    pub configuration_server: Option<SocketAddr>,
}

impl Net {
    fn listen() -> SocketAddr {
        "0.0.0.0:1628".parse().unwrap()
    }
}

impl Default for Net {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
            configuration_server: None,
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub net: Net,
    #[serde(default)]
    pub channel: ChannelOptions,
    #[serde(default)]
    pub log: Log,

    /// Path to the persistence file (§4.5); created on first successful
    /// write if absent.
    #[serde(default = "Config::persistence_path")]
    pub persistence_path: String,
}

impl Config {
    fn persistence_path() -> String {
        "lonip-router.state".to_string()
    }
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// specify the configuration file path.
    #[arg(long)]
    config: Option<String>,
}

impl Config {
    /// Loads the command line, then the configuration file if one was
    /// named; absent a file, every field falls back to its default.
    pub fn load() -> anyhow::Result<Self> {
        let path = Cli::parse().config;

        match path {
            Some(path) => {
                let cfg_str = read_to_string(&path)?;
                Ok(serde_json5::from_str(&cfg_str)?)
            }
            None => Ok(Config {
                net: Net::default(),
                channel: ChannelOptions::default(),
                log: Log::default(),
                persistence_path: Config::persistence_path(),
            }),
        }
    }
}
