//! Socket I/O: binds the ingress UDP port, offers each datagram to the GCU
//! handshake, and pushes whatever is left to the ingress queue. Never blocks
//! on a full queue.

use crate::queue::{IngressQueue, QueueItem};
use etx_registry::{GcuHandshake, PacketOutcome};
use std::sync::Arc;
use tokio::net::UdpSocket;

pub async fn run(
    socket: Arc<UdpSocket>,
    queue: Arc<IngressQueue>,
    gcu: Option<Arc<GcuHandshake>>,
    stats: Arc<crate::stats::Stats>,
    buf_size: usize,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; buf_size];
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            result = socket.recv_from(&mut buf) => {
                let (n, src) = match result {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(error = %err, "udp recv error");
                        continue;
                    }
                };
                let data = &buf[..n];

                if let Some(gcu) = &gcu {
                    if gcu.on_packet(src, data) == PacketOutcome::ConsumedControl {
                        continue;
                    }
                }

                let dropped = queue.push(QueueItem {
                    bytes: data.to_vec(),
                    src_ip: Some(src.ip().to_string()),
                });
                if dropped {
                    stats.incr_dropped();
                }
            }
        }
    }
}
