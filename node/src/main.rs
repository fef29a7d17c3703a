// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use forgeline_node::config::NodeConfig;
use forgeline_node::node::Node;
use forgeline_node::telemetry::init_telemetry;

#[tokio::main]
async fn main() {
    init_telemetry();

    let cfg = match std::env::args().nth(1) {
        Some(path) => match NodeConfig::from_file(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::error!("failed to load config {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => NodeConfig::default(),
    };

    tracing::info!(?cfg.data_dir, %cfg.bind_addr, peers = cfg.peers.len(), "forgelined starting");

    let node = match Node::start(cfg).await {
        Ok(node) => node,
        Err(e) => {
            tracing::error!("node failed to start: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("signal wait failed: {}", e);
    }
    tracing::info!("shutting down");
    node.shutdown().await;
}
