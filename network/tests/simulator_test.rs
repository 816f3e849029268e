use std::cell::RefCell;
use std::rc::Rc;

use tendersim_common::{
    Envelope, EnvelopeKind, Hash256, Payload, Signature, SignedVote, Step, Timestamp, Transaction,
    Vote,
};
use tendersim_network::{
    envelope_wire_size, EnvelopeHandler, NetworkConfig, NetworkSimulator, OutboundEnvelope,
};

/// Records what was delivered and sends nothing back.
#[derive(Default)]
struct Recorder {
    delivered: Vec<(EnvelopeKind, String)>,
}

impl EnvelopeHandler for Recorder {
    fn on_envelope(&mut self, envelope: Envelope, _now: Timestamp) -> Vec<OutboundEnvelope> {
        self.delivered.push((envelope.kind, envelope.header_id));
        Vec::new()
    }
}

fn vote_payload(from: &str) -> Payload {
    Payload::Vote(SignedVote {
        vote: Vote {
            voter: from.to_string(),
            height: 1,
            round: 0,
            step: Step::Prevote,
            block_hash: None,
        },
        signature: Signature([0; 64]),
    })
}

fn padded_payload(padding: usize) -> Payload {
    Payload::Proposal(tendersim_common::Proposal {
        height: 1,
        round: 0,
        block_hash: Hash256::zero(),
        block: tendersim_common::Block {
            height: 1,
            round: 0,
            parent_hash: Hash256::zero(),
            proposer: "A".to_string(),
            txs: vec![Transaction {
                sender: "A".to_string(),
                key: "A/data".to_string(),
                value: serde_json::json!("x".repeat(padding)),
                nonce: 1,
                signature: None,
            }],
            hash: Hash256::zero(),
        },
    })
}

fn quiet_config() -> NetworkConfig {
    NetworkConfig {
        base_delay_ms: 5,
        jitter_ms: 0,
        drop_rate: 0.0,
        duplicate_rate: 0.0,
        link_bandwidth_bytes_per_ms: 1000,
        ..NetworkConfig::default()
    }
}

fn setup_two_nodes(config: NetworkConfig) -> (NetworkSimulator, Rc<RefCell<Recorder>>) {
    let mut network = NetworkSimulator::new(7, config);
    let recorder = Rc::new(RefCell::new(Recorder::default()));
    network.register("A", recorder.clone());
    network.register("B", recorder.clone());
    (network, recorder)
}

#[test]
fn delivers_in_send_order_on_one_link() {
    let (mut network, recorder) = setup_two_nodes(quiet_config());
    network.send_header("A", "B", "h1", 1, vote_payload("A"));
    network.send_header("A", "B", "h2", 1, vote_payload("A"));
    network.run_until_idle();
    assert_eq!(
        recorder.borrow().delivered,
        vec![
            (EnvelopeKind::Header, "h1".to_string()),
            (EnvelopeKind::Header, "h2".to_string()),
        ]
    );
}

#[test]
fn same_time_deliveries_break_ties_by_send_order() {
    let mut network = NetworkSimulator::new(1, quiet_config());
    let recorder = Rc::new(RefCell::new(Recorder::default()));
    network.register("A", recorder.clone());
    network.register("B", recorder.clone());
    network.register("C", recorder.clone());
    // Different links, equal delays: both deliver at the same instant.
    network.send_header("A", "C", "from-a", 1, vote_payload("A"));
    network.send_header("B", "C", "from-b", 1, vote_payload("B"));
    network.run_until_idle();
    assert_eq!(
        recorder.borrow().delivered,
        vec![
            (EnvelopeKind::Header, "from-a".to_string()),
            (EnvelopeKind::Header, "from-b".to_string()),
        ]
    );
}

#[test]
fn body_without_header_is_rejected() {
    let (mut network, recorder) = setup_two_nodes(quiet_config());
    network.send_body("A", "B", "h1", 1, vote_payload("A"));
    network.run_until_idle();
    assert!(recorder.borrow().delivered.is_empty());
    assert!(network
        .logs()
        .iter()
        .any(|entry| entry.event == "body_rejected_missing_header"));

    // Once the header is delivered, the body goes through.
    network.send_header("A", "B", "h1", 1, vote_payload("A"));
    network.run_until_idle();
    network.send_body("A", "B", "h1", 1, vote_payload("A"));
    network.run_until_idle();
    assert_eq!(
        recorder.borrow().delivered,
        vec![
            (EnvelopeKind::Header, "h1".to_string()),
            (EnvelopeKind::Body, "h1".to_string()),
        ]
    );
}

#[test]
fn topology_and_blocks_drop_at_enqueue() {
    let (mut network, recorder) = setup_two_nodes(quiet_config());
    network.load_topology(vec![("A".to_string(), "B".to_string())]);

    network.send_header("B", "A", "reverse", 1, vote_payload("B"));
    network.send_header("A", "nobody", "missing", 1, vote_payload("A"));
    network.block_link("A", "B");
    network.send_header("A", "B", "blocked", 1, vote_payload("A"));
    network.unblock_link("A", "B");
    network.send_header("A", "B", "open", 1, vote_payload("A"));
    network.run_until_idle();

    assert_eq!(
        recorder.borrow().delivered,
        vec![(EnvelopeKind::Header, "open".to_string())]
    );
    let events: Vec<&str> = network.logs().iter().map(|e| e.event.as_str()).collect();
    assert!(events.contains(&"drop_disconnected"));
    assert!(events.contains(&"drop_no_receiver"));
    assert!(events.contains(&"drop_blocked_link"));
}

#[test]
fn sender_inflight_cap_drops_excess() {
    let config = NetworkConfig {
        max_inflight_per_sender: 1,
        ..quiet_config()
    };
    let (mut network, recorder) = setup_two_nodes(config);
    network.send_header("A", "B", "first", 1, vote_payload("A"));
    network.send_header("A", "B", "second", 1, vote_payload("A"));
    network.run_until_idle();
    assert_eq!(recorder.borrow().delivered.len(), 1);
    assert!(network
        .logs()
        .iter()
        .any(|entry| entry.event == "drop_rate_limit_sender"));
}

/// The second message exceeds the byte cap, waits on the backpressure FIFO
/// and is delivered once the first completes.
#[test]
fn backpressure_queues_and_drains() {
    let payload = padded_payload(50);
    let probe = Envelope {
        kind: EnvelopeKind::Header,
        header_id: "h1".to_string(),
        height: 1,
        from: "A".to_string(),
        to: "B".to_string(),
        payload: payload.clone(),
    };
    let size = envelope_wire_size(&probe);

    let config = NetworkConfig {
        base_delay_ms: 10,
        max_bytes_inflight_per_link: size + size / 2,
        ..quiet_config()
    };
    let (mut network, recorder) = setup_two_nodes(config);
    network.send_header("A", "B", "h1", 1, payload.clone());
    network.send_header("A", "B", "h1b", 1, payload);
    assert!(network
        .logs()
        .iter()
        .any(|entry| entry.event == "backpressure_queue"));

    network.run_until_idle();
    assert_eq!(
        recorder.borrow().delivered,
        vec![
            (EnvelopeKind::Header, "h1".to_string()),
            (EnvelopeKind::Header, "h1b".to_string()),
        ]
    );
}

/// A second in-flight message on the link triggers the auto block; sending
/// past the block-until time succeeds and logs the unblock.
#[test]
fn auto_block_expires_after_its_duration() {
    let config = NetworkConfig {
        base_delay_ms: 10,
        auto_block_inflight_threshold: 2,
        auto_block_duration_ms: 50,
        ..quiet_config()
    };
    let (mut network, recorder) = setup_two_nodes(config);

    network.send_header("A", "B", "h2", 2, vote_payload("A"));
    network.send_header("A", "B", "h3", 3, vote_payload("A"));
    network.run_until_idle();

    network.advance_time(60);
    network.send_header("A", "B", "h4", 4, vote_payload("A"));
    network.run_until_idle();

    assert_eq!(
        recorder.borrow().delivered,
        vec![
            (EnvelopeKind::Header, "h2".to_string()),
            (EnvelopeKind::Header, "h4".to_string()),
        ]
    );
    let events: Vec<&str> = network.logs().iter().map(|e| e.event.as_str()).collect();
    assert!(events.contains(&"auto_block_link"));
    assert!(events.contains(&"auto_unblock_link"));
}

#[test]
fn rate_window_auto_blocks_bursts() {
    let config = NetworkConfig {
        max_msgs_per_link_per_window: Some(2),
        rate_window_ms: 1000,
        auto_block_duration_ms: 500,
        ..quiet_config()
    };
    let (mut network, recorder) = setup_two_nodes(config);
    for i in 0..3 {
        network.send_header("A", "B", format!("burst-{i}"), 1, vote_payload("A"));
    }
    network.run_until_idle();
    assert_eq!(recorder.borrow().delivered.len(), 2);
    assert!(network
        .logs()
        .iter()
        .any(|entry| entry.event == "auto_block_link_rate"));
}

fn run_lossy_scenario(seed: u64) -> Vec<u8> {
    let config = NetworkConfig {
        base_delay_ms: 5,
        jitter_ms: 20,
        drop_rate: 0.3,
        duplicate_rate: 0.3,
        link_bandwidth_bytes_per_ms: 100,
        ..NetworkConfig::default()
    };
    let mut network = NetworkSimulator::new(seed, config);
    let recorder = Rc::new(RefCell::new(Recorder::default()));
    for node in ["A", "B", "C"] {
        network.register(node, recorder.clone());
    }
    for i in 0..10 {
        network.send_header("A", "B", format!("ab-{i}"), 1, vote_payload("A"));
        network.send_header("B", "C", format!("bc-{i}"), 1, vote_payload("B"));
        network.advance_time(3);
    }
    network.run_until_idle();

    let mut dumped = Vec::new();
    network.dump_logs(&mut dumped).unwrap();
    dumped
}

/// Identical seed and caller sequence produce byte-identical logs even with
/// drops, duplicates and jitter.
#[test]
fn lossy_runs_are_deterministic() {
    assert_eq!(run_lossy_scenario(42), run_lossy_scenario(42));
    assert_eq!(run_lossy_scenario(2025), run_lossy_scenario(2025));
}
