//! Lookup example demonstrating service-center selection and change feeds.
//!
//! Connects to a Consul agent (or a static table), picks a few instances of a
//! service in round-robin and key-hash order, then prints membership changes
//! as the registry reports them.
//!
//! # Environment Variables
//!
//! - `CENTER_ADDRESS`: registry address (default: local agent)
//! - `SERVICE_NAME`: service to look up (default: greeter-server)
//! - `STATIC_ADDRESSES`: comma-separated `host:port` list; answers from a static table
//! - `REQUEST_COUNT`: number of picks to make (default: 10)
//! - `REQUEST_INTERVAL_MS`: milliseconds between picks (default: 1000)

use std::env;
use std::time::Duration;

use futures::StreamExt;
use service_center::{Center, CenterConfig, Update};
use tokio::time::sleep;
use tracing::{Level, error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    // Read configuration from environment
    let address = env::var("CENTER_ADDRESS").unwrap_or_default();
    let service_name = env::var("SERVICE_NAME").unwrap_or_else(|_| "greeter-server".to_string());
    let request_count: u32 = env::var("REQUEST_COUNT")
        .ok()
        .and_then(|c| c.parse().ok())
        .unwrap_or(10);
    let request_interval_ms: u64 = env::var("REQUEST_INTERVAL_MS")
        .ok()
        .and_then(|i| i.parse().ok())
        .unwrap_or(1000);

    let mut config = CenterConfig::new(address);
    if let Ok(addrs) = env::var("STATIC_ADDRESSES") {
        config = config.service(&service_name, addrs.split(',').map(str::trim).collect());
    }

    info!("Registry: {}", config.registry_url());
    info!("Service: {service_name}");

    let center = Center::setup(&config).await?;

    info!("Making {request_count} picks...\n");

    for i in 1..=request_count {
        let key = format!("request-{i}");

        match (
            center.robin(&service_name).await,
            center.hash(&service_name, &key).await,
        ) {
            (Ok(robin), Ok(hashed)) => {
                let show = |s: Option<service_center::Service>| {
                    s.map_or_else(|| "<none>".to_string(), |s| s.address().to_string())
                };
                info!("Pick {i}: robin={} {key}={}", show(robin), show(hashed));
            }

            (Err(e), _) | (_, Err(e)) => {
                error!("Pick {i} failed: {e}");
            }
        }

        if i < request_count {
            sleep(Duration::from_millis(request_interval_ms)).await;
        }
    }

    info!("\n=== Watching {service_name} (Ctrl-C to stop) ===");

    let watcher = center.watch(&service_name);
    let closer = watcher.closer();
    let mut updates = Box::pin(watcher.into_stream());

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            closer.close();
        }
    });

    while let Some(batch) = updates.next().await {
        match batch {
            Ok(batch) => {
                for update in batch {
                    match update {
                        Update::Add(addr) => info!("+ {addr}"),
                        Update::Delete(addr) => info!("- {addr}"),
                    }
                }
            }

            Err(e) => {
                error!("Watch failed: {e}");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }

    center.shutdown().await;
    Ok(())
}
