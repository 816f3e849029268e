use lockstep::ConsensusParams;
use tendersim_network::NetworkConfig;
use tendersim_test_suite::{assert_chain_integrity, setup_test, Cluster};

fn lossless_config() -> NetworkConfig {
    NetworkConfig {
        base_delay_ms: 5,
        jitter_ms: 0,
        drop_rate: 0.0,
        duplicate_rate: 0.0,
        ..NetworkConfig::default()
    }
}

#[test]
fn four_nodes_commit_height_one() {
    setup_test();
    let mut cluster = Cluster::new(4, 2025, "happy-4", lossless_config(), ConsensusParams::default());
    cluster.start();
    assert!(cluster.run_until_committed(1, 2000, 5));

    assert_eq!(cluster.finalized_count(1), 4);
    assert_eq!(cluster.committed_hashes(1).len(), 1);

    // Height 1, round 0: the proposer is sorted_ids[(1 + 0) % 4].
    let entry = cluster.committed_entry(0, 1).unwrap();
    assert_eq!(entry.proposer, "node-1");
    for index in 0..cluster.len() {
        assert_eq!(cluster.committed_entry(index, 1).unwrap(), entry);
    }
}

#[test]
fn eight_nodes_commit_height_one() {
    setup_test();
    let mut cluster = Cluster::new(8, 8888, "happy-8", lossless_config(), ConsensusParams::default());
    cluster.start();
    assert!(cluster.run_until_committed(1, 2000, 5));

    assert_eq!(cluster.finalized_count(1), 8);
    assert_eq!(cluster.committed_hashes(1).len(), 1);
    assert_eq!(cluster.committed_entry(0, 1).unwrap().proposer, "node-1");
}

/// Agreement, chain integrity and deterministic execution over several
/// heights.
#[test]
fn chains_stay_consistent_across_heights() {
    setup_test();
    let mut cluster = Cluster::new(4, 77, "chained", lossless_config(), ConsensusParams::default());
    cluster.start();
    assert!(cluster.run_until_committed(3, 5000, 5));

    for ledger in cluster.ledgers() {
        assert!(ledger.height() >= 3);
        assert_chain_integrity(&ledger);
    }
    for height in 1..=3 {
        assert_eq!(cluster.committed_hashes(height).len(), 1, "fork at height {height}");
    }

    // Proposer rotation follows (height + round) mod n on the sorted ids.
    assert_eq!(cluster.committed_entry(0, 1).unwrap().proposer, "node-1");
    assert_eq!(cluster.committed_entry(0, 2).unwrap().proposer, "node-2");
    assert_eq!(cluster.committed_entry(0, 3).unwrap().proposer, "node-3");

    // State roots agree because every node executed the same blocks.
    let roots: Vec<_> = (0..cluster.len())
        .map(|i| cluster.committed_entry(i, 3).unwrap().state_root)
        .collect();
    assert!(roots.windows(2).all(|pair| pair[0] == pair[1]));
}

/// Messages keep flowing under moderate jitter; timeouts cover the gaps.
#[test]
fn jittery_network_still_commits() {
    setup_test();
    // Jitter stays under the base delay so a quorum of votes can never
    // outrun the proposal they answer.
    let config = NetworkConfig {
        base_delay_ms: 5,
        jitter_ms: 3,
        ..lossless_config()
    };
    let mut cluster = Cluster::new(4, 1234, "jitter", config, ConsensusParams::default());
    cluster.start();
    assert!(cluster.run_until_committed(2, 10_000, 5));
    assert_eq!(cluster.committed_hashes(1).len(), 1);
    assert_eq!(cluster.committed_hashes(2).len(), 1);
    for ledger in cluster.ledgers() {
        assert_chain_integrity(&ledger);
    }
}
