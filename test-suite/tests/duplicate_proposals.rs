use lockstep::ConsensusParams;
use tendersim_common::{Block, Hash256, Payload, Proposal, Transaction};
use tendersim_network::NetworkConfig;
use tendersim_test_suite::{setup_test, Cluster};

fn lossless_config() -> NetworkConfig {
    NetworkConfig {
        base_delay_ms: 5,
        jitter_ms: 0,
        drop_rate: 0.0,
        duplicate_rate: 0.0,
        ..NetworkConfig::default()
    }
}

fn forged_block(proposer: &str, text: &str) -> Block {
    let mut block = Block {
        height: 1,
        round: 0,
        parent_hash: Hash256::zero(),
        proposer: proposer.to_string(),
        txs: vec![Transaction {
            sender: "user-1".to_string(),
            key: "user-1/message".to_string(),
            value: serde_json::json!(text),
            nonce: 1,
            signature: None,
        }],
        hash: Hash256::zero(),
    };
    block.hash = block.compute_hash().unwrap();
    block
}

/// An equivocating proposer sends a second, distinct proposal for the same
/// (height, round). First-seen semantics make every node finalize the same
/// single block.
#[test]
fn equivocating_proposer_cannot_fork() {
    setup_test();
    let mut cluster = Cluster::new(4, 33, "equivocation", lossless_config(), ConsensusParams::default());
    cluster.start();

    // The legitimate proposal from node-1 is already enqueued per link, so
    // the conflicting one lands second everywhere.
    let conflicting = forged_block("node-1", "evil twin");
    let payload = Payload::Proposal(Proposal {
        height: 1,
        round: 0,
        block_hash: conflicting.hash,
        block: conflicting.clone(),
    });
    for peer in cluster.node_ids().to_vec() {
        cluster.network.send_header(
            "node-1",
            &peer,
            format!("proposal-1-0-node-1-{peer}-dup"),
            1,
            payload.clone(),
        );
    }

    assert!(cluster.run_until_committed(1, 2000, 5));
    assert_eq!(cluster.finalized_count(1), 4);

    let hashes = cluster.committed_hashes(1);
    assert_eq!(hashes.len(), 1, "nodes forked on the equivocation");
    assert_ne!(hashes[0], conflicting.hash, "the second proposal won somewhere");
}
