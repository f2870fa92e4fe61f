use anyhow::Context;
use mirror_node::config::NodeConfig;
use mirror_node::metrics;
use mirror_node::node::Node;
use mirror_node::telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = NodeConfig::from_env();
    init_tracing(&cfg.log_filter);
    for warning in &cfg.warnings {
        warn!("{warning}");
    }

    info!(
        role = ?cfg.role,
        channels = ?cfg.channel_ids,
        front_master_index = cfg.front_master_index,
        back_master_index = cfg.back_master_index,
        connect_timeout_ms = cfg.connect_timeout_ms,
        client_link_timeout_ms = cfg.client_link_timeout_ms,
        total_channels = ?cfg.total_channels,
        flush_interval_ms = cfg.flush_interval_ms,
        bus_capacity = cfg.bus_capacity,
        "starting mirror-node"
    );
    metrics::BOOT_COUNTER.inc();
    let node = Node::start(&cfg).await?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    node.shutdown();
    info!(
        metrics = %String::from_utf8_lossy(&metrics::gather()),
        "final counters"
    );
    Ok(())
}
