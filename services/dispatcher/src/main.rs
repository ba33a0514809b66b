use async_trait::async_trait;
use clap::Parser;
use dispatcher::config::{self, DispatcherConfig};
use dispatcher::discovery::run_discovery;
use dispatcher::dispatch::{handle_command, DeviceTransport, Discoverer, TcpDeviceTransport};
use dispatcher::sink::{handle_control_message, handle_data_message};
use etx_protocol::discovery::DiscoveryReply;
use etx_protocol::device_client::DeviceClientError;
use etx_registry::DeviceRegistry;
use etx_store::sink::{FieldMapping, RecordingSelector};
use etx_store::store::SessionStore;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "dispatcher")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    log_level: Option<String>,
    #[arg(long)]
    print_config: bool,
}

struct LiveDiscoverer {
    cfg: Arc<DispatcherConfig>,
}

#[async_trait]
impl Discoverer for LiveDiscoverer {
    async fn discover(&self) -> Vec<DiscoveryReply> {
        run_discovery(&self.cfg).await.unwrap_or_else(|err| {
            tracing::warn!(error = %err, "discovery probe failed");
            Vec::new()
        })
    }
}

struct RetryingTransport {
    inner: TcpDeviceTransport,
}

#[async_trait]
impl DeviceTransport for RetryingTransport {
    async fn request(
        &self,
        addr: SocketAddr,
        request: &Value,
        connect_timeout: Duration,
        round_trip_timeout: Duration,
    ) -> Result<Value, DeviceClientError> {
        self.inner.request(addr, request, connect_timeout, round_trip_timeout).await
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

async fn run(cfg: DispatcherConfig) -> anyhow::Result<()> {
    let cfg = Arc::new(cfg);
    let registry = Arc::new(DeviceRegistry::new(cfg.registry_ttl()));
    let store = Arc::new(SessionStore::new(
        PathBuf::from(&cfg.session_root),
        cfg.flush_every_rows as usize,
        cfg.idle_timeout(),
    ));
    let selector = Arc::new(RecordingSelector::new());
    let mapping = Arc::new(FieldMapping::default());
    let discoverer: Arc<dyn Discoverer> = Arc::new(LiveDiscoverer { cfg: cfg.clone() });
    let transport: Arc<dyn DeviceTransport> = Arc::new(RetryingTransport { inner: TcpDeviceTransport });

    let mut mqtt_opts = MqttOptions::new(
        format!("dispatcher-{}", cfg.config_agent_id),
        &cfg.mqtt_broker_host,
        cfg.mqtt_broker_port,
    );
    mqtt_opts.set_keep_alive(Duration::from_secs(30));
    mqtt_opts.set_transport(dispatcher::tls::build_transport(&cfg)?);
    if let (Some(user), Some(pass)) = (&cfg.mqtt_username, &cfg.mqtt_password) {
        mqtt_opts.set_credentials(user, pass);
    }
    let (client, mut eventloop) = AsyncClient::new(mqtt_opts, 256);

    client.subscribe(&cfg.config_cmd_topic, QoS::AtLeastOnce).await?;
    client.subscribe(&cfg.control_record_topic, QoS::AtLeastOnce).await?;
    let data_topic_filter = format!("{}/#", cfg.topic_parsed_prefix);
    client.subscribe(&data_topic_filter, QoS::AtLeastOnce).await?;

    let (work_tx, mut work_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(cfg.worker_queue_size);

    let worker = {
        let cfg = cfg.clone();
        let registry = registry.clone();
        let transport = transport.clone();
        let discoverer = discoverer.clone();
        let client = client.clone();
        tokio::spawn(async move {
            while let Some(bytes) = work_rx.recv().await {
                let result = handle_command(&bytes, &cfg, &registry, transport.as_ref(), discoverer.as_ref()).await;
                let topic = format!("{}/{}/{}", cfg.config_result_topic, cfg.config_agent_id, result.command_id);
                let payload = match serde_json::to_vec(&result) {
                    Ok(p) => p,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to serialise command result");
                        continue;
                    }
                };
                if let Err(err) = client.publish(topic, QoS::AtLeastOnce, false, payload).await {
                    tracing::warn!(error = %err, "failed to publish command result");
                }
            }
        })
    };

    let sweeper = {
        let store = store.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                store.sweep_idle(std::time::Instant::now());
            }
        })
    };

    let cmd_topic = cfg.config_cmd_topic.clone();
    let control_topic = cfg.control_record_topic.clone();
    let event_loop_task = {
        let selector = selector.clone();
        let mapping = mapping.clone();
        let store = store.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        if publish.topic == cmd_topic {
                            let _ = work_tx.send(publish.payload.to_vec()).await;
                        } else if publish.topic == control_topic {
                            if publish.retain {
                                continue;
                            }
                            handle_control_message(&publish.payload, &selector, &store);
                        } else {
                            handle_data_message(&publish.payload, &mapping, &selector, &store);
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error = %err, "mqtt event loop error, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    worker.abort();
    sweeper.abort();
    event_loop_task.abort();
    store.close_all()?;

    Ok(())
}
