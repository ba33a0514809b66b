use async_trait::async_trait;
use clap::Parser;
use etx_registry::{DeviceRegistry, GcuConfig, GcuHandshake};
use ingest_agent::batch::{BatchPublisher, Publisher};
use ingest_agent::config::{self, AgentConfig};
use ingest_agent::queue::IngressQueue;
use ingest_agent::stats::Stats;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

#[derive(Parser, Debug)]
#[command(name = "ingest-agent")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    log_level: Option<String>,
    #[arg(long)]
    print_config: bool,
}

struct MqttPublisher {
    client: AsyncClient,
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, qos: u8, retain: bool, payload: Vec<u8>) {
        let qos = match qos {
            0 => QoS::AtMostOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtLeastOnce,
        };
        if let Err(err) = self.client.publish(topic, qos, retain, payload).await {
            tracing::warn!(%topic, error = %err, "mqtt publish failed");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let filter = cli
        .log_level
        .clone()
        .unwrap_or_else(|| std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()));
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let cfg = match config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(err) => {
            tracing::error!(error = %err, "configuration error");
            std::process::exit(2);
        }
    };

    if cli.print_config {
        println!("{cfg:#?}");
        return Ok(());
    }

    run(cfg).await
}

/// Binds the UDP listen port via `socket2` so `SO_RCVBUF` can be raised
/// before the socket starts receiving; a failure to set it is logged and
/// not fatal, since the OS default is still a working (if smaller) buffer.
fn bind_udp_socket(port: u16, so_rcvbuf_bytes: Option<usize>) -> anyhow::Result<UdpSocket> {
    let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
    let sock = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    if let Some(bytes) = so_rcvbuf_bytes {
        if let Err(err) = sock.set_recv_buffer_size(bytes) {
            tracing::warn!(error = %err, bytes, "failed to set SO_RCVBUF");
        }
    }
    sock.set_nonblocking(true)?;
    sock.bind(&addr.into())?;
    Ok(UdpSocket::from_std(sock.into())?)
}

async fn run(cfg: AgentConfig) -> anyhow::Result<()> {
    let cfg = Arc::new(cfg);
    let stats = Arc::new(Stats::new());
    let registry = Arc::new(DeviceRegistry::new(cfg.registry_ttl()));
    let queue = Arc::new(IngressQueue::new(cfg.queue_size, cfg.drop_policy));

    let gcu = if cfg.gcu_enabled {
        Some(Arc::new(GcuHandshake::new(GcuConfig {
            subscribe_token: cfg.gcu_subscribe_token.clone(),
            ack_token: cfg.gcu_ack_token.clone(),
            broadcast_token: cfg.gcu_broadcast_token.clone(),
            heartbeat_sec: Duration::from_secs(cfg.gcu_heartbeat_sec),
            fallback_sec: Duration::from_secs(cfg.gcu_fallback_sec),
            broadcast_on_exit: cfg.gcu_broadcast_on_exit,
        })))
    } else {
        None
    };

    let mut mqtt_opts = MqttOptions::new(&cfg.config_agent_id, &cfg.mqtt_broker_host, cfg.mqtt_broker_port);
    mqtt_opts.set_keep_alive(Duration::from_secs(30));
    mqtt_opts.set_transport(ingest_agent::tls::build_transport(&cfg)?);
    if let (Some(user), Some(pass)) = (&cfg.mqtt_username, &cfg.mqtt_password) {
        mqtt_opts.set_credentials(user, pass);
    }
    let (client, mut eventloop) = AsyncClient::new(mqtt_opts, 64);
    let publisher: Arc<dyn Publisher> = Arc::new(MqttPublisher { client });

    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "mqtt event loop error, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    let socket = Arc::new(bind_udp_socket(cfg.udp_listen_port, cfg.so_rcvbuf_bytes)?);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let udp_task = tokio::spawn(ingest_agent::udp::run(
        socket,
        queue.clone(),
        gcu.clone(),
        stats.clone(),
        cfg.udp_buf_bytes,
        shutdown_rx.clone(),
    ));

    let gcu_heartbeat_task = gcu.clone().map(|gcu| {
        let publisher = publisher.clone();
        let cfg = cfg.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(cfg.gcu_heartbeat_sec));
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() { break; }
                    }
                    _ = ticker.tick() => {
                        let (to_subscribe, _evicted) = gcu.heartbeat_tick();
                        for addr in to_subscribe {
                            let sock = match tokio::net::UdpSocket::bind("0.0.0.0:0").await {
                                Ok(s) => s,
                                Err(_) => continue,
                            };
                            let _ = sock.send_to(gcu.subscribe_token().as_bytes(), addr).await;
                        }
                    }
                }
            }
            let _ = &publisher;
        })
    });

    let registry_announcer = {
        let registry = registry.clone();
        let publisher = publisher.clone();
        let topic = cfg.config_agent_topic.clone();
        let agent_id = cfg.config_agent_id.clone();
        let period = Duration::from_secs(cfg.registry_publish_sec);
        tokio::spawn(ingest_agent::announce::run(registry, publisher, topic, agent_id, period))
    };

    let stats_task = {
        let stats = stats.clone();
        let queue = queue.clone();
        let registry = registry.clone();
        let period = Duration::from_millis(cfg.print_every_ms);
        tokio::spawn(ingest_agent::stats::run_reporter(
            stats,
            period,
            move || queue.len(),
            move || registry.snapshot().len(),
        ))
    };

    let batch_task = {
        let cfg = cfg.clone();
        let registry = registry.clone();
        let stats = stats.clone();
        let queue = queue.clone();
        let publisher = publisher.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut bp = BatchPublisher::new(cfg, registry, stats);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            bp.sweep(publisher.as_ref()).await;
                            break;
                        }
                    }
                    item = queue.pop() => {
                        bp.process(&item.bytes, item.src_ip, publisher.as_ref()).await;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(100)), if queue.is_empty() => {
                        bp.sweep(publisher.as_ref()).await;
                    }
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    if let Some(gcu) = gcu {
        for addr in gcu.shutdown() {
            if let Ok(sock) = tokio::net::UdpSocket::bind("0.0.0.0:0").await {
                let _ = sock.send_to(gcu.broadcast_token().as_bytes(), addr).await;
            }
        }
    }

    let _ = udp_task.await;
    if let Some(t) = gcu_heartbeat_task {
        let _ = t.await;
    }
    registry_announcer.abort();
    stats_task.abort();
    let _ = batch_task.await;

    Ok(())
}
