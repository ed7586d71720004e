use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs},
    path::{Path, PathBuf},
    sync::RwLock,
};

use figment::{
    Figment,
    providers::{Format, Yaml},
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("route map file '{0}' not found")]
    NotFound(PathBuf),

    #[error("failed to read route map: {0}")]
    Read(#[from] Box<figment::Error>),

    #[error("cannot parse agent address '{0}'")]
    InvalidAgentAddress(String),

    #[error("agent address '{0}' is not IPv4, only IPv4 agents are supported")]
    NonIpv4Agent(String),

    #[error("failed to resolve collector address '{addr}': {source}")]
    Resolve {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("collector address '{0}' does not resolve to an IPv4 endpoint")]
    NoIpv4Collector(String),
}

impl From<figment::Error> for RouteError {
    fn from(e: figment::Error) -> Self {
        RouteError::Read(Box::new(e))
    }
}

#[derive(Debug, Default)]
struct Routes {
    default: Option<SocketAddrV4>,
    by_agent: HashMap<Ipv4Addr, SocketAddrV4>,
}

/// Maps sFlow agents to collector endpoints.
///
/// Loaded from a YAML document of agent IPv4 addresses to `host:port`
/// collector strings; the case-insensitive key `default` names the
/// fallback collector for agents without an explicit route:
///
/// ```yaml
/// default: collector.internal:6343
/// 10.0.0.1: 192.0.2.10:6343
/// 10.0.0.2: 192.0.2.11:6343
/// ```
///
/// Collector hostnames are resolved once, at (re)load time. The table is
/// shared read-mostly across workers; [`RouteTable::reload`] swaps the
/// whole map in one write, and a failed reload leaves the previous map
/// in place.
#[derive(Debug)]
pub struct RouteTable {
    path: PathBuf,
    inner: RwLock<Routes>,
}

impl RouteTable {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, RouteError> {
        let path = path.into();
        let routes = read_routes(&path)?;
        Ok(Self {
            path,
            inner: RwLock::new(routes),
        })
    }

    /// Re-reads the route map file this table was loaded from and swaps
    /// the routes in atomically. Returns the number of per-agent routes.
    pub fn reload(&self) -> Result<usize, RouteError> {
        let routes = read_routes(&self.path)?;
        let count = routes.by_agent.len();
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *inner = routes;
        Ok(count)
    }

    /// The collector for `agent`: its explicit route if one exists, the
    /// default collector otherwise.
    pub fn lookup(&self, agent: Ipv4Addr) -> Option<SocketAddrV4> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_agent.get(&agent).copied().or(inner.default)
    }
}

fn read_routes(path: &Path) -> Result<Routes, RouteError> {
    // Figment providers treat a missing file as an empty document; an
    // absent route map should be a hard error instead.
    if !path.is_file() {
        return Err(RouteError::NotFound(path.to_path_buf()));
    }

    let raw: HashMap<String, String> = Figment::new().merge(Yaml::file(path)).extract()?;

    let mut routes = Routes::default();
    for (key, value) in raw {
        let collector = resolve_collector(&value)?;

        if key.eq_ignore_ascii_case("default") {
            routes.default = Some(collector);
            continue;
        }

        let agent: IpAddr = key
            .parse()
            .map_err(|_| RouteError::InvalidAgentAddress(key.clone()))?;
        let IpAddr::V4(agent) = agent else {
            return Err(RouteError::NonIpv4Agent(key));
        };

        debug!(agent = %agent, collector = %collector, "loaded collector route");
        routes.by_agent.insert(agent, collector);
    }

    Ok(routes)
}

fn resolve_collector(addr: &str) -> Result<SocketAddrV4, RouteError> {
    let resolved = addr.to_socket_addrs().map_err(|source| RouteError::Resolve {
        addr: addr.to_string(),
        source,
    })?;

    resolved
        .into_iter()
        .find_map(|candidate| match candidate {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| RouteError::NoIpv4Collector(addr.to_string()))
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use figment::Jail;

    use super::{RouteError, RouteTable};

    #[test]
    fn routes_agents_and_falls_back_to_default() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "routes.yaml",
                r#"
                default: "127.0.0.1:6343"
                10.0.0.1: "127.0.0.2:7000"
                "#,
            )?;

            let table = RouteTable::load("routes.yaml").unwrap();

            assert_eq!(
                table.lookup(Ipv4Addr::new(10, 0, 0, 1)),
                Some("127.0.0.2:7000".parse().unwrap())
            );
            assert_eq!(
                table.lookup(Ipv4Addr::new(10, 9, 9, 9)),
                Some("127.0.0.1:6343".parse().unwrap()),
                "unknown agents use the default collector"
            );

            Ok(())
        });
    }

    #[test]
    fn no_default_means_unknown_agents_are_unrouted() {
        Jail::expect_with(|jail| {
            jail.create_file("routes.yaml", "10.0.0.1: \"127.0.0.1:7000\"\n")?;

            let table = RouteTable::load("routes.yaml").unwrap();
            assert_eq!(table.lookup(Ipv4Addr::new(10, 9, 9, 9)), None);

            Ok(())
        });
    }

    #[test]
    fn default_key_is_case_insensitive() {
        Jail::expect_with(|jail| {
            jail.create_file("routes.yaml", "Default: \"127.0.0.1:6343\"\n")?;

            let table = RouteTable::load("routes.yaml").unwrap();
            assert!(table.lookup(Ipv4Addr::new(10, 0, 0, 1)).is_some());

            Ok(())
        });
    }

    #[test]
    fn rejects_non_ipv4_agents() {
        Jail::expect_with(|jail| {
            jail.create_file("routes.yaml", "\"fd00::1\": \"127.0.0.1:7000\"\n")?;

            let err = RouteTable::load("routes.yaml").unwrap_err();
            assert!(matches!(err, RouteError::NonIpv4Agent(_)), "got: {err}");

            Ok(())
        });
    }

    #[test]
    fn rejects_unparseable_agents() {
        Jail::expect_with(|jail| {
            jail.create_file("routes.yaml", "not-an-address: \"127.0.0.1:7000\"\n")?;

            let err = RouteTable::load("routes.yaml").unwrap_err();
            assert!(matches!(err, RouteError::InvalidAgentAddress(_)), "got: {err}");

            Ok(())
        });
    }

    #[test]
    fn missing_route_map_is_an_error() {
        Jail::expect_with(|_| {
            let err = RouteTable::load("absent.yaml").unwrap_err();
            assert!(matches!(err, RouteError::NotFound(_)), "got: {err}");

            Ok(())
        });
    }

    #[test]
    fn failed_reload_keeps_the_previous_routes() {
        Jail::expect_with(|jail| {
            jail.create_file("routes.yaml", "10.0.0.1: \"127.0.0.1:7000\"\n")?;
            let table = RouteTable::load("routes.yaml").unwrap();

            std::fs::write(jail.directory().join("routes.yaml"), "][ not yaml").unwrap();
            assert!(table.reload().is_err());
            assert_eq!(
                table.lookup(Ipv4Addr::new(10, 0, 0, 1)),
                Some("127.0.0.1:7000".parse().unwrap())
            );

            std::fs::write(
                jail.directory().join("routes.yaml"),
                "10.0.0.1: \"127.0.0.1:8000\"\n",
            )
            .unwrap();
            assert_eq!(table.reload().unwrap(), 1);
            assert_eq!(
                table.lookup(Ipv4Addr::new(10, 0, 0, 1)),
                Some("127.0.0.1:8000".parse().unwrap())
            );

            Ok(())
        });
    }
}
