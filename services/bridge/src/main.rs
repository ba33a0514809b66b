use bridge::cache::LatestCache;
use bridge::config::{self, BridgeConfig};
use chrono::Utc;
use clap::Parser;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Parser, Debug)]
#[command(name = "bridge")]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    log_level: Option<String>,
    #[arg(long)]
    print_config: bool,
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

async fn run(cfg: BridgeConfig) -> anyhow::Result<()> {
    let cache = Arc::new(LatestCache::new());

    let mut mqtt_opts = MqttOptions::new(&cfg.bridge_agent_id, &cfg.mqtt_broker_host, cfg.mqtt_broker_port);
    mqtt_opts.set_keep_alive(Duration::from_secs(30));
    mqtt_opts.set_transport(bridge::tls::build_transport(&cfg)?);
    if let (Some(user), Some(pass)) = (&cfg.mqtt_username, &cfg.mqtt_password) {
        mqtt_opts.set_credentials(user, pass);
    }
    let (client, mut eventloop) = AsyncClient::new(mqtt_opts, cfg.sse_queue_len);

    let data_topic_filter = format!("{}/#", cfg.topic_parsed_prefix);
    client.subscribe(&data_topic_filter, QoS::AtMostOnce).await?;

    let mqtt_task = {
        let cache = cache.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        match serde_json::from_slice::<serde_json::Value>(&publish.payload) {
                            Ok(payload) => cache.update(&publish.topic, payload, Utc::now()),
                            Err(err) => {
                                tracing::debug!(error = %err, topic = %publish.topic, "dropping non-JSON parsed message");
                            }
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

    let app = bridge::build_router(cache)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&cfg.http_listen_addr).await?;
    tracing::info!(addr = %cfg.http_listen_addr, "bridge listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    mqtt_task.abort();
    Ok(())
}
