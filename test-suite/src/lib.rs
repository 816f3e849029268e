//! The integration harness: wires N validators to one network simulator
//! and drives virtual time.

use lockstep::ConsensusParams;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use tendersim_common::{generate_keypair, Hash256, Height, LedgerEntry, NodeId, Timestamp};
use tendersim_consensus::{Controller, Ledger};
use tendersim_network::{NetworkConfig, NetworkSimulator};

pub fn setup_test() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// `n` validators sharing one simulator, fully meshed including self-loops
/// so every node's own votes travel the same path as its peers'.
pub struct Cluster {
    pub network: NetworkSimulator,
    node_ids: Vec<NodeId>,
    controllers: Vec<Rc<RefCell<Controller>>>,
}

impl Cluster {
    pub fn new(
        n: usize,
        seed: u64,
        chain_id: &str,
        network_config: NetworkConfig,
        params: ConsensusParams,
    ) -> Self {
        let node_ids: Vec<NodeId> = (0..n).map(|i| format!("node-{i}")).collect();
        let mut validator_keys = BTreeMap::new();
        let mut private_keys = BTreeMap::new();
        for id in &node_ids {
            let (public_key, private_key) = generate_keypair(id);
            validator_keys.insert(id.clone(), public_key);
            private_keys.insert(id.clone(), private_key);
        }

        let mut network = NetworkSimulator::new(seed, network_config);
        let mut controllers = Vec::new();
        for id in &node_ids {
            let controller = Rc::new(RefCell::new(Controller::new(
                id.clone(),
                chain_id.to_string(),
                private_keys[id],
                validator_keys.clone(),
                params.clone(),
            )));
            network.register(id.clone(), controller.clone());
            controllers.push(controller);
        }

        let edges: Vec<(NodeId, NodeId)> = node_ids
            .iter()
            .flat_map(|a| node_ids.iter().map(move |b| (a.clone(), b.clone())))
            .collect();
        network.load_topology(edges);

        Cluster {
            network,
            node_ids,
            controllers,
        }
    }

    /// Starts round 0 on every node, in sorted id order.
    pub fn start(&mut self) {
        let now = self.network.now_ms();
        for (id, controller) in self.node_ids.iter().zip(&self.controllers) {
            let outbound = controller.borrow_mut().start(now);
            self.network.dispatch(id, outbound);
        }
    }

    /// Advances virtual time in `step_ms` increments, polling every
    /// controller between deliveries so step timeouts fire uniformly.
    pub fn run(&mut self, total_ms: u64, step_ms: u64) {
        let deadline = self.network.now_ms() + total_ms;
        while self.network.now_ms() < deadline {
            self.network.advance_time(step_ms);
            self.poll_controllers();
        }
    }

    /// Runs until every node has committed `height`, or `max_ms` elapses.
    /// Returns whether all nodes got there.
    pub fn run_until_committed(&mut self, height: Height, max_ms: u64, step_ms: u64) -> bool {
        let deadline = self.network.now_ms() + max_ms;
        while self.network.now_ms() < deadline {
            if self.all_committed(height) {
                return true;
            }
            self.network.advance_time(step_ms);
            self.poll_controllers();
        }
        self.all_committed(height)
    }

    fn poll_controllers(&mut self) {
        let now = self.network.now_ms();
        for (id, controller) in self.node_ids.iter().zip(&self.controllers) {
            let outbound = controller.borrow_mut().poll(now);
            self.network.dispatch(id, outbound);
        }
    }

    fn all_committed(&self, height: Height) -> bool {
        self.controllers
            .iter()
            .all(|controller| controller.borrow().ledger().height() >= height)
    }

    pub fn len(&self) -> usize {
        self.node_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_ids.is_empty()
    }

    pub fn node_ids(&self) -> &[NodeId] {
        &self.node_ids
    }

    pub fn ledger(&self, index: usize) -> Ledger {
        self.controllers[index].borrow().ledger().clone()
    }

    pub fn ledgers(&self) -> Vec<Ledger> {
        (0..self.controllers.len()).map(|i| self.ledger(i)).collect()
    }

    /// The entry a node committed at `height`, if any.
    pub fn committed_entry(&self, index: usize, height: Height) -> Option<LedgerEntry> {
        self.controllers[index].borrow().ledger().get(height).cloned()
    }

    /// The number of nodes that committed some block at `height`.
    pub fn finalized_count(&self, height: Height) -> usize {
        self.controllers
            .iter()
            .filter(|controller| controller.borrow().ledger().height() >= height)
            .count()
    }

    /// The distinct block hashes committed at `height` across all nodes.
    pub fn committed_hashes(&self, height: Height) -> Vec<Hash256> {
        let mut hashes: Vec<Hash256> = self
            .controllers
            .iter()
            .filter_map(|controller| {
                controller
                    .borrow()
                    .ledger()
                    .get(height)
                    .map(|entry| entry.block_hash)
            })
            .collect();
        hashes.sort();
        hashes.dedup();
        hashes
    }

    pub fn dump_logs(&self) -> Vec<u8> {
        let mut dumped = Vec::new();
        self.network
            .dump_logs(&mut dumped)
            .expect("writing to a Vec cannot fail");
        dumped
    }

    pub fn now_ms(&self) -> Timestamp {
        self.network.now_ms()
    }
}

/// Asserts the chain shape of one ledger: heights `1..=len` and each entry
/// extending the previous one's block hash.
pub fn assert_chain_integrity(ledger: &Ledger) {
    let mut parent = Hash256::zero();
    for (index, entry) in ledger.entries().iter().enumerate() {
        assert_eq!(entry.height, index as Height + 1, "heights must be contiguous");
        assert_eq!(
            entry.parent_hash, parent,
            "entry at height {} does not extend the chain",
            entry.height
        );
        parent = entry.block_hash;
    }
}
