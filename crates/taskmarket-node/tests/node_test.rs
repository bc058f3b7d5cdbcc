use taskmarket_core::{AgentId, Verdict};
use taskmarket_node::{MarketNode, NodeConfig};

fn agent(b: u8) -> AgentId {
    AgentId::from_bytes([b; 20])
}

#[tokio::test]
async fn test_node_runs_market_and_reports_stats() {
    let mut config = NodeConfig::default();
    config.market.council = vec![agent(100), agent(101), agent(102)];
    config.market.quorum = 3;

    let node = MarketNode::from_config(config).unwrap();
    let registry = node.registry.clone();
    let transport = node.transport.clone();
    transport.credit(agent(1), 5_000).await;

    let report = node
        .run_until(async {
            let done = registry.create_task(agent(1), "a", "", 1_000, 7).await.unwrap();
            registry.submit_bid(done, agent(2), "p").await.unwrap();
            registry.accept_bid(done, agent(1), 0).await.unwrap();
            registry.submit_work(done, agent(2), "w").await.unwrap();
            registry.complete_task(done, agent(1), 4).await.unwrap();

            let disputed = registry.create_task(agent(1), "b", "", 2_000, 7).await.unwrap();
            registry.submit_bid(disputed, agent(3), "p").await.unwrap();
            registry.accept_bid(disputed, agent(1), 0).await.unwrap();
            registry.submit_work(disputed, agent(3), "w").await.unwrap();
            registry.raise_dispute(disputed, agent(3), "unpaid").await.unwrap();
            for member in [100, 101] {
                registry
                    .cast_vote(disputed, agent(member), Verdict::FavorRunner)
                    .await
                    .unwrap();
            }

            registry.create_task(agent(1), "c", "", 500, 7).await.unwrap();
        })
        .await
        .unwrap();

    // Every event queued before shutdown reaches the log
    // (5 for the completed task, 5 plus 2 pending votes for the disputed one, 1 open)
    assert_eq!(report.events_logged, 13);

    let stats = report.stats;
    assert_eq!(stats.total_tasks, 3);
    assert_eq!(stats.completed_tasks, 1);
    assert_eq!(stats.disputed_tasks, 1);
    assert_eq!(stats.open_tasks, 1);
    assert_eq!(stats.total_locked, 2_500);
    assert_eq!(stats.total_paid_out, 1_000);
    assert_eq!(transport.balance_of(&agent(1)).await, 1_500);
    assert_eq!(transport.balance_of(&agent(2)).await, 1_000);
}

#[tokio::test]
async fn test_node_rejects_invalid_market_config() {
    let mut config = NodeConfig::default();
    config.market.council = vec![agent(100)];
    config.market.quorum = 2;
    assert!(MarketNode::from_config(config).is_err());
}

#[test]
fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("node.toml");
    std::fs::write(
        &path,
        r#"
[settlement]
endpoint = "https://rpc.example"
token_contract = "0xusdc"
escrow_contract = "0xescrow"
network = "sepolia"

[logging]
level = "debug"
format = "compact"

[market]
baseline_score = 50
reject_after_deadline = true

[market.in_progress_cancel]
kind = "penalize_creator"
points = 5
"#,
    )
    .unwrap();

    let config = NodeConfig::load(Some(&path)).unwrap();
    assert_eq!(config.settlement.network, "sepolia");
    assert_eq!(config.logging.format, "compact");
    assert_eq!(config.market.baseline_score, 50);
    assert!(config.market.reject_after_deadline);

    let node = MarketNode::from_config(config).unwrap();
    assert_eq!(node.transport.target().token_contract, "0xusdc");
    assert_eq!(node.registry.config().baseline_score, 50);
}
