// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Two-node sync scenario: node A seals pipeline events, node B joins,
//! exchanges heights, transfers the block, and independently computes
//! the identical materialized view.

use forgeline_kernel::event::{
    CreatePayload, EventPayload, StageStatus, StageUpdatePayload,
};
use forgeline_kernel::types::id::PipelineId;
use forgeline_node::config::NodeConfig;
use forgeline_node::node::Node;
use std::path::Path;
use std::time::{Duration, Instant};

fn config(dir: &Path, seed: u8) -> NodeConfig {
    let mut cfg = NodeConfig::default();
    cfg.data_dir = dir.to_path_buf();
    cfg.bind_addr = "127.0.0.1:0".parse().unwrap();
    cfg.identity_seed = Some(format!("{:02x}", seed).repeat(32));
    // Sealing is driven explicitly so the test is deterministic.
    cfg.seal_interval_ms = 3_600_000;
    cfg.advert_interval_ms = 100;
    cfg.retry_backoff_ms = 50;
    cfg.retry_backoff_max_ms = 500;
    cfg
}

#[tokio::test]
async fn test_two_node_sync() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("forgeline_node=debug")
        .try_init();

    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    // ----------------------------------------------------------------
    // 1. Node A seals Create + StageUpdate into one block
    // ----------------------------------------------------------------
    let node_a = Node::start(config(dir_a.path(), 1)).await.unwrap();
    let handle_a = node_a.handle();

    let p1 = PipelineId::new();
    handle_a
        .submit(
            p1,
            &EventPayload::Create(CreatePayload {
                name: "p1".to_string(),
                stages: vec!["build".to_string()],
            }),
        )
        .await
        .unwrap();
    handle_a
        .submit(
            p1,
            &EventPayload::StageUpdate(StageUpdatePayload {
                stage: "build".to_string(),
                status: StageStatus::Running,
            }),
        )
        .await
        .unwrap();

    let sealed = handle_a.seal_now().await.unwrap();
    assert_eq!(sealed, Some(1));

    let view_a = handle_a.get_pipeline(&p1).await.unwrap();
    assert_eq!(view_a.stages.len(), 1);
    assert_eq!(view_a.stages[0].name, "build");
    assert_eq!(view_a.stages[0].status, StageStatus::Running);
    assert_eq!(view_a.last_event_height, 1);

    // ----------------------------------------------------------------
    // 2. Node B starts at height 0 and syncs from A
    // ----------------------------------------------------------------
    let node_b = Node::start(config(dir_b.path(), 2)).await.unwrap();
    let handle_b = node_b.handle();
    assert_eq!(handle_b.get_chain_status().await.height, 0);

    // Provision each side with the other and let B dial A.
    handle_a.connect_peer(handle_b.node_id(), node_b.local_addr.to_string());
    handle_b.connect_peer(handle_a.node_id(), node_a.local_addr.to_string());

    let deadline = Instant::now() + Duration::from_secs(15);
    while handle_b.get_chain_status().await.height < 1 {
        assert!(Instant::now() < deadline, "node B never caught up");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // ----------------------------------------------------------------
    // 3. B's independently computed view is identical
    // ----------------------------------------------------------------
    let view_b = handle_b.get_pipeline(&p1).await.unwrap();
    assert_eq!(view_a, view_b);

    let status_a = handle_a.get_chain_status().await;
    let status_b = handle_b.get_chain_status().await;
    assert_eq!(status_a.height, status_b.height);
    assert_eq!(status_a.head_hash, status_b.head_hash);

    assert_eq!(handle_a.state_hash().await, handle_b.state_hash().await);

    // ----------------------------------------------------------------
    // 4. A later block broadcast reaches B without a new handshake
    // ----------------------------------------------------------------
    let p2 = PipelineId::new();
    handle_a
        .submit(
            p2,
            &EventPayload::Create(CreatePayload {
                name: "p2".to_string(),
                stages: vec![],
            }),
        )
        .await
        .unwrap();
    assert_eq!(handle_a.seal_now().await.unwrap(), Some(2));

    let deadline = Instant::now() + Duration::from_secs(15);
    while handle_b.get_chain_status().await.height < 2 {
        assert!(Instant::now() < deadline, "broadcast never reached node B");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(handle_b.list_pipelines().await.len(), 2);
    assert_eq!(handle_a.state_hash().await, handle_b.state_hash().await);

    node_a.shutdown().await;
    node_b.shutdown().await;
}
