use crate::config::{parse_link_profiles, parse_topology};
use crate::event_log::LogEntry;
use crate::{LinkProfile, NetworkConfig, NetworkError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::rc::Rc;
use tendersim_common::codec;
use tendersim_common::{Envelope, EnvelopeKind, Height, NodeId, Payload, Timestamp};

type Link = (NodeId, NodeId);

/// The seam between the simulator and a node.
///
/// The simulator invokes exactly one handler at a time and enqueues the
/// returned outbox before the next delivery, so handlers never interleave
/// and never touch the simulator (or its RNG) directly.
pub trait EnvelopeHandler {
    fn on_envelope(&mut self, envelope: Envelope, now: Timestamp) -> Vec<OutboundEnvelope>;
}

/// A send request produced by a handler; the sender is the handler's own
/// node.
#[derive(Debug, Clone)]
pub struct OutboundEnvelope {
    pub kind: EnvelopeKind,
    pub receiver: NodeId,
    pub header_id: String,
    pub height: Height,
    pub payload: Payload,
}

/// The wire size of an envelope: the length of its canonical encoding.
/// Used for bandwidth serialization and byte backpressure accounting.
pub fn envelope_wire_size(envelope: &Envelope) -> usize {
    codec::canonical(envelope).unwrap().len()
}

struct ScheduledEnvelope {
    deliver_at: Timestamp,
    msg_id: u64,
    envelope: Envelope,
}

impl PartialEq for ScheduledEnvelope {
    fn eq(&self, other: &Self) -> bool {
        (self.deliver_at, self.msg_id) == (other.deliver_at, other.msg_id)
    }
}

impl Eq for ScheduledEnvelope {}

impl PartialOrd for ScheduledEnvelope {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEnvelope {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deliver_at, self.msg_id).cmp(&(other.deliver_at, other.msg_id))
    }
}

/// Simulates an unreliable network:
/// - messages are delayed, duplicated and dropped under a seeded RNG;
/// - headers must arrive before bodies (tracked by header id);
/// - per-sender and per-link inflight caps, byte backpressure, auto block;
/// - every event is logged deterministically.
pub struct NetworkSimulator {
    config: NetworkConfig,
    rng: StdRng,
    handlers: HashMap<NodeId, Rc<RefCell<dyn EnvelopeHandler>>>,
    now_ms: Timestamp,
    queue: BinaryHeap<Reverse<ScheduledEnvelope>>,
    next_msg_id: u64,
    logs: Vec<LogEntry>,
    inflight_sender: HashMap<NodeId, usize>,
    inflight_link: HashMap<Link, usize>,
    inflight_bytes_link: HashMap<Link, usize>,
    /// Receivers that have seen a given header, a precondition for bodies.
    seen_headers: HashSet<(NodeId, String)>,
    /// Directed whitelist; `None` means fully connected.
    allowed_edges: Option<HashSet<Link>>,
    blocked_links: HashSet<Link>,
    auto_blocked_until: HashMap<Link, Timestamp>,
    /// Backpressure queue per link.
    pending_link: HashMap<Link, VecDeque<(Envelope, usize)>>,
    /// Serialization/throughput tracking per link.
    link_next_available: HashMap<Link, Timestamp>,
    link_profiles: HashMap<Link, LinkProfile>,
    /// Send timestamps per link for rate-based auto blocking.
    link_send_times: HashMap<Link, VecDeque<Timestamp>>,
}

impl NetworkSimulator {
    pub fn new(seed: u64, config: NetworkConfig) -> Self {
        NetworkSimulator {
            config,
            rng: StdRng::seed_from_u64(seed),
            handlers: HashMap::new(),
            now_ms: 0,
            queue: BinaryHeap::new(),
            next_msg_id: 1,
            logs: Vec::new(),
            inflight_sender: HashMap::new(),
            inflight_link: HashMap::new(),
            inflight_bytes_link: HashMap::new(),
            seen_headers: HashSet::new(),
            allowed_edges: None,
            blocked_links: HashSet::new(),
            auto_blocked_until: HashMap::new(),
            pending_link: HashMap::new(),
            link_next_available: HashMap::new(),
            link_profiles: HashMap::new(),
            link_send_times: HashMap::new(),
        }
    }

    pub fn register(&mut self, node_id: impl Into<NodeId>, handler: Rc<RefCell<dyn EnvelopeHandler>>) {
        let node_id = node_id.into();
        self.inflight_sender.entry(node_id.clone()).or_insert(0);
        self.handlers.insert(node_id, handler);
    }

    /// Restricts the network to the given directed edges. Self-edges must
    /// be listed explicitly for self-delivery to work.
    pub fn load_topology(&mut self, edges: impl IntoIterator<Item = (NodeId, NodeId)>) {
        self.allowed_edges = Some(edges.into_iter().collect());
    }

    pub fn load_topology_from_file(&mut self, path: impl AsRef<Path>) -> Result<(), NetworkError> {
        let content = std::fs::read_to_string(path)?;
        let edges = parse_topology(&content)?;
        self.load_topology(edges);
        Ok(())
    }

    pub fn set_link_profile(
        &mut self,
        sender: impl Into<NodeId>,
        receiver: impl Into<NodeId>,
        profile: LinkProfile,
    ) {
        self.link_profiles
            .insert((sender.into(), receiver.into()), profile);
    }

    pub fn load_link_profile_from_file(
        &mut self,
        path: impl AsRef<Path>,
    ) -> Result<(), NetworkError> {
        let content = std::fs::read_to_string(path)?;
        for (link, profile) in parse_link_profiles(&content)? {
            self.link_profiles.insert(link, profile);
        }
        Ok(())
    }

    pub fn block_link(&mut self, sender: &str, receiver: &str) {
        self.blocked_links
            .insert((sender.to_string(), receiver.to_string()));
        self.log("block_link", sender, receiver, None, serde_json::json!({}));
    }

    pub fn unblock_link(&mut self, sender: &str, receiver: &str) {
        self.blocked_links
            .remove(&(sender.to_string(), receiver.to_string()));
        self.log("unblock_link", sender, receiver, None, serde_json::json!({}));
    }

    pub fn send_header(
        &mut self,
        sender: &str,
        receiver: &str,
        header_id: impl Into<String>,
        height: Height,
        payload: Payload,
    ) {
        let envelope = Envelope {
            kind: EnvelopeKind::Header,
            header_id: header_id.into(),
            height,
            from: sender.to_string(),
            to: receiver.to_string(),
            payload,
        };
        self.enqueue(envelope);
    }

    /// Bodies are only admitted once their header has been delivered to the
    /// same receiver; out-of-order bodies are rejected at enqueue, never
    /// delivered out of order.
    pub fn send_body(
        &mut self,
        sender: &str,
        receiver: &str,
        header_id: impl Into<String>,
        height: Height,
        payload: Payload,
    ) {
        let header_id = header_id.into();
        if !self
            .seen_headers
            .contains(&(receiver.to_string(), header_id.clone()))
        {
            self.log(
                "body_rejected_missing_header",
                sender,
                receiver,
                Some(height),
                serde_json::json!({ "header_id": header_id }),
            );
            return;
        }
        let envelope = Envelope {
            kind: EnvelopeKind::Body,
            header_id,
            height,
            from: sender.to_string(),
            to: receiver.to_string(),
            payload,
        };
        self.enqueue(envelope);
    }

    /// Enqueues a handler outbox on behalf of the given sender.
    pub fn dispatch(&mut self, sender: &str, batch: Vec<OutboundEnvelope>) {
        for out in batch {
            match out.kind {
                EnvelopeKind::Header => {
                    self.send_header(sender, &out.receiver, out.header_id, out.height, out.payload)
                }
                EnvelopeKind::Body => {
                    self.send_body(sender, &out.receiver, out.header_id, out.height, out.payload)
                }
            }
        }
    }

    /// Delivers all messages whose delivery time has been reached, running
    /// each receiver's handler and draining freed links.
    pub fn tick(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            let due = self
                .queue
                .peek()
                .is_some_and(|Reverse(next)| next.deliver_at <= self.now_ms);
            if !due {
                break;
            }
            let Some(Reverse(scheduled)) = self.queue.pop() else {
                break;
            };
            let envelope = scheduled.envelope;
            let link = (envelope.from.clone(), envelope.to.clone());
            let size = envelope_wire_size(&envelope);

            let sender_count = self.inflight_sender.entry(link.0.clone()).or_insert(0);
            *sender_count = sender_count.saturating_sub(1);
            let link_count = self.inflight_link.entry(link.clone()).or_insert(0);
            *link_count = link_count.saturating_sub(1);
            let link_bytes = self.inflight_bytes_link.entry(link.clone()).or_insert(0);
            *link_bytes = link_bytes.saturating_sub(size);

            if envelope.kind == EnvelopeKind::Header {
                self.seen_headers
                    .insert((envelope.to.clone(), envelope.header_id.clone()));
            }

            self.deliver(envelope);
            // Freed capacity may admit queued messages on this link.
            self.drain_pending_link(&link);
            delivered += 1;
        }
        delivered
    }

    /// Moves the virtual clock forward and delivers due messages.
    pub fn advance_time(&mut self, delta_ms: u64) -> usize {
        self.now_ms += delta_ms;
        self.tick()
    }

    /// Jumps time forward until every scheduled message is delivered.
    pub fn run_until_idle(&mut self) -> usize {
        let mut delivered = 0;
        while let Some(deliver_at) = self.queue.peek().map(|Reverse(next)| next.deliver_at) {
            self.now_ms = deliver_at;
            delivered += self.tick();
        }
        delivered
    }

    pub fn now_ms(&self) -> Timestamp {
        self.now_ms
    }

    pub fn logs(&self) -> &[LogEntry] {
        &self.logs
    }

    /// Writes the event log as JSON lines for determinism checks.
    pub fn dump_logs(&self, writer: impl std::io::Write) -> std::io::Result<()> {
        crate::event_log::dump_logs(&self.logs, writer)
    }

    // Admission pipeline -------------------------------------------------

    fn enqueue(&mut self, envelope: Envelope) {
        let link = (envelope.from.clone(), envelope.to.clone());
        let height = Some(envelope.height);
        let size = envelope_wire_size(&envelope);

        // Expired auto-blocks are cleared before any check.
        self.is_blocked(&link);

        if !self.handlers.contains_key(&link.1) {
            self.log_envelope("drop_no_receiver", &envelope);
            return;
        }
        if self
            .allowed_edges
            .as_ref()
            .is_some_and(|edges| !edges.contains(&link))
        {
            self.log_envelope("drop_disconnected", &envelope);
            return;
        }
        if self.is_blocked(&link) {
            self.log_envelope("drop_blocked_link", &envelope);
            return;
        }
        let inflight_sender = *self.inflight_sender.get(&link.0).unwrap_or(&0);
        if inflight_sender >= self.config.max_inflight_per_sender {
            self.log_envelope("drop_rate_limit_sender", &envelope);
            return;
        }
        let inflight_link = *self.inflight_link.get(&link).unwrap_or(&0);
        if inflight_link >= self.config.max_inflight_per_link {
            self.log_envelope("drop_rate_limit_link", &envelope);
            return;
        }
        let inflight_bytes = *self.inflight_bytes_link.get(&link).unwrap_or(&0);
        if inflight_bytes + size > self.config.max_bytes_inflight_per_link {
            // Backpressure: queue instead of drop.
            let queue = self.pending_link.entry(link.clone()).or_default();
            queue.push_back((envelope, size));
            let queue_len = queue.len();
            self.log(
                "backpressure_queue",
                &link.0,
                &link.1,
                height,
                serde_json::json!({
                    "queued_size": size,
                    "queue_len": queue_len,
                    "inflight_bytes": inflight_bytes,
                }),
            );
            return;
        }
        if inflight_link + 1 >= self.config.auto_block_inflight_threshold {
            let until = self.now_ms + self.config.auto_block_duration_ms;
            self.auto_blocked_until.insert(link.clone(), until);
            self.log(
                "auto_block_link",
                &link.0,
                &link.1,
                height,
                serde_json::json!({
                    "inflight": inflight_link,
                    "block_until": until,
                }),
            );
            return;
        }
        if self.rate_window_overflow(&link) {
            let until = self.now_ms + self.config.auto_block_duration_ms;
            self.auto_blocked_until.insert(link.clone(), until);
            self.log(
                "auto_block_link_rate",
                &link.0,
                &link.1,
                height,
                serde_json::json!({
                    "block_until": until,
                    "window_ms": self.config.rate_window_ms,
                    "max_msgs": self.config.max_msgs_per_link_per_window,
                }),
            );
            return;
        }
        let drop_rate = self.link_drop_rate(&link);
        if self.rng.gen::<f64>() < drop_rate {
            self.log_envelope("drop_random", &envelope);
            return;
        }

        self.schedule(envelope, size);
    }

    fn schedule(&mut self, envelope: Envelope, size: usize) {
        let link = (envelope.from.clone(), envelope.to.clone());
        let height = Some(envelope.height);
        let (base_delay, jitter, bandwidth) = self.link_params(&link);

        // Serialize sends on the link based on its bandwidth.
        let start_time = (*self.link_next_available.get(&link).unwrap_or(&self.now_ms))
            .max(self.now_ms);
        let tx_time = (size.div_ceil(bandwidth.max(1)) as u64).max(1);
        self.link_next_available.insert(link.clone(), start_time + tx_time);

        let delay = base_delay + self.rng.gen_range(0..=jitter);
        let deliver_at = start_time + delay;
        let msg_id = self.next_msg_id;
        self.next_msg_id += 1;

        *self.inflight_sender.entry(link.0.clone()).or_insert(0) += 1;
        *self.inflight_link.entry(link.clone()).or_insert(0) += 1;
        *self.inflight_bytes_link.entry(link.clone()).or_insert(0) += size;

        self.queue.push(Reverse(ScheduledEnvelope {
            deliver_at,
            msg_id,
            envelope: envelope.clone(),
        }));
        self.log(
            "delay_scheduled",
            &link.0,
            &link.1,
            height,
            serde_json::json!({
                "msg_id": msg_id,
                "deliver_at": deliver_at,
                "start_time_ms": start_time,
                "delay_ms": delay,
            }),
        );
        self.log(
            "send",
            &link.0,
            &link.1,
            height,
            serde_json::json!({
                "msg_id": msg_id,
                "delay_ms": delay,
                "tx_time_ms": tx_time,
                "start_time_ms": start_time,
                "size_bytes": size,
                "envelope": serde_json::to_value(&envelope).unwrap(),
            }),
        );

        // Duplicates consume their own inflight budget.
        if self.rng.gen::<f64>() < self.config.duplicate_rate {
            let dup_delay = delay + self.rng.gen_range(0..=self.config.jitter_ms);
            let dup_msg_id = self.next_msg_id;
            self.next_msg_id += 1;
            self.queue.push(Reverse(ScheduledEnvelope {
                deliver_at: self.now_ms + dup_delay,
                msg_id: dup_msg_id,
                envelope,
            }));
            *self.inflight_sender.entry(link.0.clone()).or_insert(0) += 1;
            *self.inflight_link.entry(link.clone()).or_insert(0) += 1;
            *self.inflight_bytes_link.entry(link.clone()).or_insert(0) += size;
            self.log(
                "duplicate",
                &link.0,
                &link.1,
                height,
                serde_json::json!({
                    "orig_msg_id": msg_id,
                    "dup_msg_id": dup_msg_id,
                    "extra_delay_ms": dup_delay - delay,
                }),
            );
        }
    }

    fn deliver(&mut self, envelope: Envelope) {
        let Some(handler) = self.handlers.get(&envelope.to).cloned() else {
            self.log_envelope("drop_missing_handler", &envelope);
            return;
        };
        self.log(
            "deliver",
            &envelope.from,
            &envelope.to,
            Some(envelope.height),
            serde_json::json!({ "envelope": serde_json::to_value(&envelope).unwrap() }),
        );
        let receiver = envelope.to.clone();
        let now = self.now_ms;
        let outbound = handler.borrow_mut().on_envelope(envelope, now);
        self.dispatch(&receiver, outbound);
    }

    /// Re-admits queued messages on a link as capacity frees up. Each entry
    /// re-runs the admission checks; a byte-cap miss leaves the entry at
    /// the head and stops the drain.
    fn drain_pending_link(&mut self, link: &Link) {
        loop {
            if self.is_blocked(link) {
                break;
            }
            let Some((envelope, size)) = self
                .pending_link
                .get(link)
                .and_then(|queue| queue.front())
                .cloned()
            else {
                break;
            };

            let inflight_sender = *self.inflight_sender.get(&link.0).unwrap_or(&0);
            let inflight_link = *self.inflight_link.get(link).unwrap_or(&0);
            let inflight_bytes = *self.inflight_bytes_link.get(link).unwrap_or(&0);
            if inflight_bytes + size > self.config.max_bytes_inflight_per_link {
                break;
            }

            self.pending_link
                .get_mut(link)
                .and_then(|queue| queue.pop_front());
            if inflight_sender >= self.config.max_inflight_per_sender {
                self.log_envelope("drop_rate_limit_sender", &envelope);
                continue;
            }
            if inflight_link >= self.config.max_inflight_per_link {
                self.log_envelope("drop_rate_limit_link", &envelope);
                continue;
            }
            if inflight_link + 1 >= self.config.auto_block_inflight_threshold {
                let until = self.now_ms + self.config.auto_block_duration_ms;
                self.auto_blocked_until.insert(link.clone(), until);
                self.log(
                    "auto_block_link",
                    &link.0,
                    &link.1,
                    Some(envelope.height),
                    serde_json::json!({
                        "inflight": inflight_link,
                        "block_until": until,
                    }),
                );
                continue;
            }
            if self.rate_window_overflow(link) {
                let until = self.now_ms + self.config.auto_block_duration_ms;
                self.auto_blocked_until.insert(link.clone(), until);
                self.log(
                    "auto_block_link_rate",
                    &link.0,
                    &link.1,
                    Some(envelope.height),
                    serde_json::json!({
                        "block_until": until,
                        "window_ms": self.config.rate_window_ms,
                        "max_msgs": self.config.max_msgs_per_link_per_window,
                    }),
                );
                continue;
            }
            let drop_rate = self.link_drop_rate(link);
            if self.rng.gen::<f64>() < drop_rate {
                self.log_envelope("drop_random", &envelope);
                continue;
            }
            self.schedule(envelope, size);
        }
        if self.pending_link.get(link).is_some_and(|q| q.is_empty()) {
            self.pending_link.remove(link);
        }
    }

    /// Whether the link is blocked, clearing (and logging) expired
    /// auto-blocks on the way.
    fn is_blocked(&mut self, link: &Link) -> bool {
        if self.blocked_links.contains(link) {
            return true;
        }
        let Some(until) = self.auto_blocked_until.get(link).copied() else {
            return false;
        };
        if self.now_ms >= until {
            self.auto_blocked_until.remove(link);
            self.log(
                "auto_unblock_link",
                &link.0,
                &link.1,
                None,
                serde_json::json!({ "time_ms": self.now_ms }),
            );
            return false;
        }
        true
    }

    fn rate_window_overflow(&mut self, link: &Link) -> bool {
        let Some(max_msgs) = self.config.max_msgs_per_link_per_window else {
            return false;
        };
        let window = self.config.rate_window_ms;
        let now = self.now_ms;
        let times = self.link_send_times.entry(link.clone()).or_default();
        while times.front().is_some_and(|&t| now - t > window) {
            times.pop_front();
        }
        if times.len() >= max_msgs {
            return true;
        }
        times.push_back(now);
        false
    }

    fn link_params(&self, link: &Link) -> (u64, u64, usize) {
        let profile = self.link_profiles.get(link);
        (
            profile
                .and_then(|p| p.base_delay_ms)
                .unwrap_or(self.config.base_delay_ms),
            profile
                .and_then(|p| p.jitter_ms)
                .unwrap_or(self.config.jitter_ms),
            profile
                .and_then(|p| p.bandwidth_bytes_per_ms)
                .unwrap_or(self.config.link_bandwidth_bytes_per_ms),
        )
    }

    fn link_drop_rate(&self, link: &Link) -> f64 {
        self.link_profiles
            .get(link)
            .and_then(|p| p.drop_rate)
            .unwrap_or(self.config.drop_rate)
    }

    // Logging helpers ----------------------------------------------------

    fn log(
        &mut self,
        event: &str,
        from: &str,
        to: &str,
        height: Option<Height>,
        details: serde_json::Value,
    ) {
        self.logs.push(LogEntry {
            time_ms: self.now_ms,
            event: event.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            height,
            details,
        });
    }

    fn log_envelope(&mut self, event: &str, envelope: &Envelope) {
        self.log(
            event,
            &envelope.from,
            &envelope.to,
            Some(envelope.height),
            serde_json::to_value(envelope).unwrap(),
        );
    }
}
