use std::{
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;

use crate::runtime::{
    cli::Cli,
    conf::conf_serde::{duration, level},
};

mod defaults {
    use std::net::{Ipv4Addr, SocketAddr};
    use std::time::Duration;

    pub fn bind() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 5000))
    }

    pub fn workers() -> usize {
        10
    }

    pub fn buffer_size() -> usize {
        1500
    }

    pub fn shutdown_timeout() -> Duration {
        Duration::from_secs(5)
    }
}

/// Fully resolved application configuration.
///
/// Built by layering, in increasing priority: built-in defaults, the
/// optional YAML configuration file, environment variables, and CLI
/// arguments (the latter two arrive pre-merged through [`Cli`]).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AppProps {
    /// Address and port the UDP listener binds on.
    pub bind: SocketAddr,

    /// Number of datagram worker tasks. Each worker owns a pair of
    /// `buffer_size` byte buffers for the lifetime of the process.
    pub workers: usize,

    /// Receive buffer size per worker, in bytes. Datagrams larger than
    /// this are truncated by the socket; size it to the interface MTU.
    pub buffer_size: usize,

    /// Path to the collector route map file.
    pub route_map: PathBuf,

    /// Interface rewritten datagrams are emitted on.
    pub out_if: String,

    /// Next-hop MAC address for emitted frames.
    pub dst_mac: String,

    /// Reload the route map automatically when the file changes, in
    /// addition to the always-active SIGHUP trigger.
    pub auto_reload: bool,

    /// The logging level for the application.
    #[serde(with = "level")]
    pub log_level: Level,

    /// Maximum time to wait for workers to finish their in-flight
    /// datagram during shutdown.
    #[serde(with = "duration")]
    pub shutdown_timeout: Duration,

    /// Configuration for the API server (health endpoints).
    pub api: ApiConf,

    #[serde(skip)]
    #[allow(dead_code)]
    config_path: Option<PathBuf>,
}

impl AppProps {
    /// Resolves the configuration from defaults, the optional config file
    /// named by `cli.config`, and the CLI/environment layer itself.
    ///
    /// The route map path, outgoing interface and next-hop MAC have no
    /// sensible defaults; they must come from the file or the CLI.
    pub fn new(cli: &Cli) -> Result<Self, ConfError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Conf::default()));

        let config_path = if let Some(path) = &cli.config {
            validate_config_path(path)?;
            figment = figment.merge(Yaml::file(path));
            Some(path.clone())
        } else {
            None
        };

        figment = figment.merge(Serialized::defaults(cli));

        let raw: Conf = figment.extract()?;

        Ok(Self {
            bind: raw.bind,
            workers: raw.workers,
            buffer_size: raw.buffer_size,
            route_map: raw.route_map.ok_or(ConfError::Missing("route_map"))?,
            out_if: raw.out_if.ok_or(ConfError::Missing("out_if"))?,
            dst_mac: raw.dst_mac.ok_or(ConfError::Missing("dst_mac"))?,
            auto_reload: raw.auto_reload,
            log_level: raw.log_level,
            shutdown_timeout: raw.shutdown_timeout,
            api: raw.api,
            config_path,
        })
    }
}

/// Raw configuration shape shared by the defaults, file and CLI layers.
/// Required fields stay optional here; [`AppProps::new`] enforces them
/// once every layer has been merged.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
struct Conf {
    bind: SocketAddr,
    workers: usize,
    buffer_size: usize,
    route_map: Option<PathBuf>,
    out_if: Option<String>,
    dst_mac: Option<String>,
    auto_reload: bool,
    #[serde(with = "level")]
    log_level: Level,
    #[serde(with = "duration")]
    shutdown_timeout: Duration,
    api: ApiConf,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            bind: defaults::bind(),
            workers: defaults::workers(),
            buffer_size: defaults::buffer_size(),
            route_map: None,
            out_if: None,
            dst_mac: None,
            auto_reload: false,
            log_level: Level::INFO,
            shutdown_timeout: defaults::shutdown_timeout(),
            api: ApiConf::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ApiConf {
    /// Enable the API server.
    pub enabled: bool,
    /// The network address the API server will listen on.
    pub listen_address: String,
    /// The port the API server will listen on.
    pub port: u16,
}

impl Default for ApiConf {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_address: Ipv4Addr::UNSPECIFIED.to_string(),
            port: 8080,
        }
    }
}

/// Validates that the given path points to an existing file with a
/// supported extension.
fn validate_config_path(path: &Path) -> Result<(), ConfError> {
    if !path.is_file() {
        if path.exists() {
            return Err(ConfError::InvalidConfigPath(
                path.to_string_lossy().into_owned(),
            ));
        }
        return Err(ConfError::NoConfigFile);
    }

    match path.extension().and_then(|s| s.to_str()) {
        Some("yaml") | Some("yml") => Ok(()),
        Some(ext) => Err(ConfError::InvalidExtension(ext.to_string())),
        None => Err(ConfError::InvalidExtension("none".to_string())),
    }
}

#[derive(Debug, Error)]
pub enum ConfError {
    /// The specified configuration file does not exist.
    #[error("no config file found at the provided path")]
    NoConfigFile,

    /// The path exists but is not a file (e.g., it's a directory).
    #[error("path '{0}' is not a valid file")]
    InvalidConfigPath(String),

    /// The file has an unsupported extension.
    #[error("invalid file extension '.{0}', expected 'yaml' or 'yml'")]
    InvalidExtension(String),

    /// A required setting is absent from every configuration layer.
    #[error("missing required setting '{0}' (set it via config file, environment or CLI)")]
    Missing(&'static str),

    /// An error occurred during deserialization or processing.
    #[error("configuration error: {0}")]
    Extraction(#[from] Box<figment::Error>),
}

impl From<figment::Error> for ConfError {
    fn from(e: figment::Error) -> Self {
        ConfError::Extraction(Box::new(e))
    }
}

pub mod conf_serde {
    pub mod level {
        use serde::{self, Deserialize, Deserializer, Serializer};
        use tracing::Level;

        pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_str(level.as_str())
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = String::deserialize(deserializer)?;
            s.parse::<Level>().map_err(serde::de::Error::custom)
        }

        pub mod option {
            use super::*;

            pub fn serialize<S>(level: &Option<Level>, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                match level {
                    Some(l) => serializer.serialize_str(l.as_str()),
                    None => serializer.serialize_none(),
                }
            }

            pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Level>, D::Error>
            where
                D: Deserializer<'de>,
            {
                let opt = Option::<String>::deserialize(deserializer)?;
                match opt {
                    Some(s) => s
                        .parse::<Level>()
                        .map(Some)
                        .map_err(serde::de::Error::custom),
                    None => Ok(None),
                }
            }
        }
    }

    pub mod duration {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            serializer.serialize_str(&humantime::format_duration(*duration).to_string())
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = String::deserialize(deserializer)?;
            humantime::parse_duration(&s).map_err(serde::de::Error::custom)
        }
    }
}
