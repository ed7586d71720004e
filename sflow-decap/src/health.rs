//! Liveness and readiness probes for orchestrator health checks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::runtime::conf::ApiConf;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("cannot listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("api server stopped unexpectedly: {0}")]
    Serve(#[source] std::io::Error),
}

/// Lifecycle flags behind the probe endpoints.
///
/// The startup sequence and the reload loop flip the flags; the probe
/// handlers only read them. No ordering between flags is needed, so all
/// accesses are relaxed.
#[derive(Debug, Default)]
pub struct Health {
    routes_loaded: AtomicBool,
    listening: AtomicBool,
    started: AtomicBool,
}

impl Health {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records whether the most recent route map (re)load succeeded.
    ///
    /// A failed reload keeps the previous routes serving, but readiness
    /// drops so the broken file on disk is noticed before the next
    /// restart would boot from it.
    pub fn set_routes_loaded(&self, ok: bool) {
        self.routes_loaded.store(ok, Ordering::Relaxed);
    }

    pub fn set_listening(&self) {
        self.listening.store(true, Ordering::Relaxed);
    }

    pub fn set_started(&self) {
        self.started.store(true, Ordering::Relaxed);
    }

    /// Liveness: the process owns its listening socket.
    fn alive(&self) -> Probe {
        Probe::from_checks([("listening", self.listening.load(Ordering::Relaxed))])
    }

    /// Readiness: datagrams can be received and routed, which takes the
    /// socket plus a usable route map.
    fn ready(&self) -> Probe {
        Probe::from_checks([
            ("listening", self.listening.load(Ordering::Relaxed)),
            ("routes_loaded", self.routes_loaded.load(Ordering::Relaxed)),
        ])
    }

    /// Startup: the whole boot sequence ran to completion.
    fn startup(&self) -> Probe {
        Probe::from_checks([("started", self.started.load(Ordering::Relaxed))])
    }
}

/// Wire shape of one probe response: an overall verdict plus the
/// individual checks it was derived from.
#[derive(Debug, Serialize)]
struct Probe {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

impl Probe {
    fn from_checks<const N: usize>(checks: [(&'static str, bool); N]) -> Self {
        let healthy = checks.iter().all(|(_, ok)| *ok);
        Self {
            status: if healthy { "ok" } else { "unavailable" },
            checks: checks.into_iter().collect(),
        }
    }

    fn healthy(&self) -> bool {
        self.status == "ok"
    }
}

fn respond(probe: Probe) -> (StatusCode, Json<Probe>) {
    let code = if probe.healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(probe))
}

fn router(health: Arc<Health>) -> Router {
    Router::new()
        .route(
            "/livez",
            get(|State(h): State<Arc<Health>>| async move { respond(h.alive()) }),
        )
        .route(
            "/readyz",
            get(|State(h): State<Arc<Health>>| async move { respond(h.ready()) }),
        )
        .route(
            "/startup",
            get(|State(h): State<Arc<Health>>| async move { respond(h.startup()) }),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(health)
}

/// Serves the probe endpoints until the process exits.
pub async fn serve(health: Arc<Health>, conf: &ApiConf) -> Result<(), ApiError> {
    let listener = TcpListener::bind((conf.listen_address.as_str(), conf.port))
        .await
        .map_err(|source| ApiError::Listen {
            addr: format!("{}:{}", conf.listen_address, conf.port),
            source,
        })?;

    if let Ok(local) = listener.local_addr() {
        info!(addr = %local, "serving health probes");
    }

    axum::serve(listener, router(health))
        .await
        .map_err(ApiError::Serve)
}
