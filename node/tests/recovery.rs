// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Crash recovery: the persisted chain is replayed on restart, the
//! materialized views come back byte-identical, and pending events above
//! the sealed watermark survive to be sealed later.

use forgeline_kernel::event::{CreatePayload, EventPayload};
use forgeline_kernel::types::id::PipelineId;
use forgeline_node::config::NodeConfig;
use forgeline_node::node::Node;
use std::path::Path;

fn config(dir: &Path) -> NodeConfig {
    let mut cfg = NodeConfig::default();
    cfg.data_dir = dir.to_path_buf();
    cfg.bind_addr = "127.0.0.1:0".parse().unwrap();
    cfg.identity_seed = Some("21".repeat(32));
    cfg.seal_interval_ms = 3_600_000;
    cfg.snapshot_interval_blocks = 1;
    cfg
}

#[tokio::test]
async fn test_restart_recovers_chain_and_pending_events() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("forgeline_node=debug")
        .try_init();

    let dir = tempfile::tempdir().unwrap();
    let sealed_pipeline = PipelineId::new();
    let pending_pipeline = PipelineId::new();

    let (state_hash_before, height_before) = {
        let node = Node::start(config(dir.path())).await.unwrap();
        let handle = node.handle();

        handle
            .submit(
                sealed_pipeline,
                &EventPayload::Create(CreatePayload {
                    name: "sealed".to_string(),
                    stages: vec!["build".to_string()],
                }),
            )
            .await
            .unwrap();
        assert_eq!(handle.seal_now().await.unwrap(), Some(1));

        // Accepted but deliberately never sealed before shutdown.
        handle
            .submit(
                pending_pipeline,
                &EventPayload::Create(CreatePayload {
                    name: "pending".to_string(),
                    stages: vec![],
                }),
            )
            .await
            .unwrap();

        let result = (
            handle.state_hash().await,
            handle.get_chain_status().await.height,
        );
        node.shutdown().await;
        result
    };

    // ----------------------------------------------------------------
    // Restart from the same data directory
    // ----------------------------------------------------------------
    let node = Node::start(config(dir.path())).await.unwrap();
    let handle = node.handle();

    assert_eq!(handle.get_chain_status().await.height, height_before);
    assert_eq!(handle.state_hash().await, state_hash_before);
    assert!(handle.get_pipeline(&sealed_pipeline).await.is_some());
    // The unsealed pipeline is not materialized yet...
    assert!(handle.get_pipeline(&pending_pipeline).await.is_none());

    // ...but its event survived in the pending log and seals now.
    assert_eq!(handle.seal_now().await.unwrap(), Some(2));
    let view = handle.get_pipeline(&pending_pipeline).await.unwrap();
    assert_eq!(view.name, "pending");
    assert_eq!(view.last_event_height, 2);

    node.shutdown().await;
}
