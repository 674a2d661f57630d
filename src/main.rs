//! DriftPursuit Broker
//!
//! Authoritative world-state broker for DriftPursuit.
//! Runs the simulation loop and serves WebSocket clients until Ctrl-C.

use std::sync::Arc;

use anyhow::Context as _;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use driftpursuit::{core::Context, Broker, BrokerConfig, BrokerServer, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = BrokerConfig::from_env().context("loading broker configuration")?;

    // RUST_LOG wins over BROKER_LOG_LEVEL
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).context("installing tracing subscriber")?;

    info!("DriftPursuit Broker v{}", VERSION);
    info!(
        addr = %config.bind_addr,
        max_clients = config.max_clients,
        tick_rate = config.tick_rate,
        publish_rate_hz = config.publish_rate_hz,
        bandwidth = config.bandwidth_bytes_per_sec,
        retention = config.event_retention,
        auth = config.auth_secret.is_some(),
        "Configuration loaded"
    );

    let broker = Arc::new(Broker::new(&config));
    let (ctx, cancel) = Context::with_cancel();

    let simulation = {
        let broker = broker.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { broker.run_simulation(ctx).await })
    };

    let server = Arc::new(BrokerServer::new(config, broker));
    let mut serving = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    let finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl-C")?;
            info!("Ctrl-C received, shutting down");
            None
        }
        result = &mut serving => Some(result),
    };

    server.shutdown();
    cancel.cancel();

    let served = match finished {
        Some(result) => result,
        None => serving.await,
    };
    simulation.await.context("joining simulation task")?;
    served.context("joining server task")?.context("serving clients")?;

    info!("Broker stopped");
    Ok(())
}
