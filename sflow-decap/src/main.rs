mod error;
mod exporter;
mod health;
mod pipeline;
mod route;
mod runtime;

use std::sync::Arc;

use clap::Parser;
use error::Result;
use tokio::{
    net::UdpSocket,
    signal::unix::{SignalKind, signal},
    sync::broadcast,
    task::JoinSet,
    time::timeout,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    exporter::FrameExporter,
    health::Health,
    pipeline::DatagramWorker,
    route::RouteTable,
    runtime::{cli::Cli, conf::AppProps, reload::ReloadEvents},
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let conf = AppProps::new(&cli)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(conf.log_level.as_str())),
        )
        .init();

    let health = Health::new();
    if conf.api.enabled {
        let probes = health.clone();
        let api_conf = conf.api.clone();
        tokio::spawn(async move {
            if let Err(err) = crate::health::serve(probes, &api_conf).await {
                error!(error = %err, "health api failed");
            }
        });
    }

    info!(path = %conf.route_map.display(), "loading collector route map");
    let routes = Arc::new(RouteTable::load(&conf.route_map)?);
    health.set_routes_loaded(true);

    let exporter = Arc::new(FrameExporter::open(&conf.out_if, &conf.dst_mac)?);

    let socket = Arc::new(UdpSocket::bind(conf.bind).await?);
    info!(addr = %conf.bind, "listening for sFlow datagrams");
    health.set_listening();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    info!(count = conf.workers, "starting datagram workers");
    let mut workers = JoinSet::new();
    for id in 0..conf.workers {
        let worker = DatagramWorker::new(
            id,
            socket.clone(),
            routes.clone(),
            exporter.clone(),
            conf.buffer_size,
            shutdown_tx.subscribe(),
        );
        workers.spawn(worker.run());
    }

    // Route map reloads: SIGHUP always, file watching when configured.
    let mut reloads = ReloadEvents::subscribe(&conf.route_map, conf.auto_reload)?;
    let reload_routes = routes.clone();
    let reload_health = health.clone();
    tokio::spawn(async move {
        while let Some(trigger) = reloads.recv().await {
            match reload_routes.reload() {
                Ok(count) => {
                    reload_health.set_routes_loaded(true);
                    info!(?trigger, routes = count, "route map reloaded");
                }
                Err(err) => {
                    // The previous map keeps serving; readiness drops so
                    // the broken file gets noticed.
                    reload_health.set_routes_loaded(false);
                    error!(?trigger, error = %err, "route map reload failed, keeping previous routes");
                }
            }
        }
    });

    health.set_started();
    info!("application startup sequence finished");

    wait_for_termination().await?;

    // Let in-flight datagrams finish, then stop waiting for stragglers.
    if shutdown_tx.send(()).is_err() {
        warn!("no workers listening for shutdown");
    }
    let drained = timeout(conf.shutdown_timeout, async {
        while workers.join_next().await.is_some() {}
    })
    .await;
    match drained {
        Ok(()) => info!("all workers stopped"),
        Err(_) => {
            warn!(
                timeout = ?conf.shutdown_timeout,
                "shutdown timeout exceeded, aborting remaining workers"
            );
            workers.abort_all();
        }
    }

    info!("exiting");
    Ok(())
}

async fn wait_for_termination() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received interrupt"),
        _ = sigterm.recv() => info!("received sigterm"),
    }
    Ok(())
}
