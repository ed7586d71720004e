use std::net::SocketAddr;
use std::sync::Arc;

use sflow_wire::{Cursor, rewrite};
use tokio::{net::UdpSocket, sync::broadcast};
use tracing::{debug, info, warn};

use crate::{exporter::FrameExporter, route::RouteTable};

/// One datagram worker.
///
/// Workers share the listening socket, the route table and the frame
/// exporter, but each owns its cursor (two pre-sized buffers) exclusively:
/// a datagram is received, rewritten and emitted entirely within one
/// worker, with no allocation along the way.
pub struct DatagramWorker {
    id: usize,
    socket: Arc<UdpSocket>,
    routes: Arc<RouteTable>,
    exporter: Arc<FrameExporter>,
    cursor: Cursor,
    shutdown: broadcast::Receiver<()>,
}

impl DatagramWorker {
    pub fn new(
        id: usize,
        socket: Arc<UdpSocket>,
        routes: Arc<RouteTable>,
        exporter: Arc<FrameExporter>,
        buffer_size: usize,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            id,
            socket,
            routes,
            exporter,
            cursor: Cursor::new(buffer_size),
            shutdown,
        }
    }

    /// Receive / rewrite / emit until shutdown. The rewrite itself is
    /// synchronous, so an in-flight datagram always completes before the
    /// shutdown signal is observed.
    pub async fn run(mut self) {
        debug!(worker.id = self.id, "datagram worker started");

        let mut received: u64 = 0;
        let mut forwarded: u64 = 0;

        loop {
            let (size, peer) = tokio::select! {
                result = self.socket.recv_from(self.cursor.source_mut()) => match result {
                    Ok(t) => t,
                    Err(err) => {
                        warn!(worker.id = self.id, error = %err, "recv datagram failed");
                        continue;
                    }
                },
                _ = self.shutdown.recv() => break,
            };

            received += 1;
            self.cursor.reset(size);
            debug!(worker.id = self.id, bytes = size, peer = %peer, "received datagram");

            let data = rewrite(&mut self.cursor);

            let SocketAddr::V4(agent) = peer else {
                warn!(peer = %peer, "dropping datagram from non-IPv4 peer");
                continue;
            };
            let Some(collector) = self.routes.lookup(*agent.ip()) else {
                warn!(agent = %agent.ip(), "no collector configured for agent");
                continue;
            };

            if let Err(err) = self.exporter.send(agent, collector, data).await {
                warn!(worker.id = self.id, error = %err, "failed to emit datagram");
                continue;
            }
            forwarded += 1;
        }

        info!(
            event.name = "worker.stopped",
            worker.id = self.id,
            datagrams.received = received,
            datagrams.forwarded = forwarded,
            "datagram worker stopped"
        );
    }
}
