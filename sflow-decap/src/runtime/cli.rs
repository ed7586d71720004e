use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::runtime::conf::conf_serde::level;

#[derive(Parser, Debug, Serialize, Deserialize)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Set the path to the configuration file (e.g., "conf.yaml").
    #[arg(short, long, value_name = "FILE", env = "SFLOW_DECAP_CONFIG_PATH")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<PathBuf>,

    /// Path to the collector route map file.
    #[arg(short, long, value_name = "FILE", env = "SFLOW_DECAP_ROUTE_MAP")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_map: Option<PathBuf>,

    /// Outgoing interface for rewritten datagrams.
    #[arg(short = 'i', long, value_name = "IFACE", env = "SFLOW_DECAP_OUT_IF")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_if: Option<String>,

    /// Next-hop MAC address for rewritten datagrams.
    #[arg(short = 'm', long, value_name = "MAC", env = "SFLOW_DECAP_DST_MAC")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst_mac: Option<String>,

    /// Address and port to receive sFlow datagrams on.
    #[arg(short, long, value_name = "ADDR", env = "SFLOW_DECAP_BIND")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<SocketAddr>,

    /// Number of datagram workers.
    #[arg(short, long, value_name = "COUNT", env = "SFLOW_DECAP_WORKERS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Receive buffer size per worker, in bytes.
    #[arg(short = 's', long, value_name = "BYTES", env = "SFLOW_DECAP_BUFFER_SIZE")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer_size: Option<usize>,

    /// Automatically reload the route map when the file changes.
    #[arg(
        short,
        long,
        action = clap::ArgAction::SetTrue,
        env = "SFLOW_DECAP_AUTO_RELOAD"
    )]
    #[serde(skip_serializing_if = "is_false")]
    pub auto_reload: bool,

    /// Set the application's log level (e.g., "debug", "warn").
    #[arg(short, long, value_name = "LEVEL", env = "SFLOW_DECAP_LOG_LEVEL")]
    #[serde(with = "level::option", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<Level>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser as _;
    use figment::Jail;
    use tracing::Level;

    use super::Cli;

    #[test]
    fn parses_long_flags() {
        Jail::expect_with(|_| {
            let args = [
                "sflow-decap",
                "--route-map",
                "/etc/sflow-decap/routes.yaml",
                "--out-if",
                "eth1",
                "--dst-mac",
                "02:00:00:aa:bb:cc",
                "--bind",
                "127.0.0.1:6343",
                "--workers",
                "4",
                "--log-level",
                "warn",
            ];
            let cli = Cli::parse_from(args);
            assert_eq!(
                cli.route_map,
                Some(PathBuf::from("/etc/sflow-decap/routes.yaml"))
            );
            assert_eq!(cli.out_if.as_deref(), Some("eth1"));
            assert_eq!(cli.dst_mac.as_deref(), Some("02:00:00:aa:bb:cc"));
            assert_eq!(cli.bind, Some("127.0.0.1:6343".parse().unwrap()));
            assert_eq!(cli.workers, Some(4));
            assert_eq!(cli.log_level, Some(Level::WARN));

            Ok(())
        });
    }

    #[test]
    fn parses_from_env_when_no_args() {
        Jail::expect_with(|jail| {
            jail.set_env("SFLOW_DECAP_ROUTE_MAP", "/tmp/routes.yaml");
            jail.set_env("SFLOW_DECAP_OUT_IF", "eth0");
            jail.set_env("SFLOW_DECAP_AUTO_RELOAD", "true");
            jail.set_env("SFLOW_DECAP_LOG_LEVEL", "debug");

            let cli = Cli::parse_from(["sflow-decap"]);
            assert_eq!(cli.route_map, Some(PathBuf::from("/tmp/routes.yaml")));
            assert_eq!(cli.out_if.as_deref(), Some("eth0"));
            assert_eq!(cli.auto_reload, true);
            assert_eq!(cli.log_level, Some(Level::DEBUG));

            Ok(())
        });
    }

    #[test]
    fn defaults_are_left_to_the_config_layer() {
        Jail::expect_with(|_| {
            let cli = Cli::parse_from(["sflow-decap"]);
            assert_eq!(cli.bind, None);
            assert_eq!(cli.workers, None);
            assert_eq!(cli.buffer_size, None);
            assert_eq!(cli.log_level, None);
            assert_eq!(cli.auto_reload, false);

            Ok(())
        });
    }
}
