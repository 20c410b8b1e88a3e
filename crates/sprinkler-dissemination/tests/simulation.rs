//! Discrete-event simulation of several engines on a shared medium.
//!
//! Virtual clock, fixed link latency, synchronous decoding after a fixed
//! delay, and pluggable drop policies. Deterministic for a given setup.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sprinkler_dissemination::testing::{sample_content, StubCoder};
use sprinkler_dissemination::{
    Coder, CompletedTransfer, DecodeJob, DisseminationEngine, EngineActions, EngineConfig,
    SessionEvent, SessionState, SourceBlocks,
};
use sprinkler_protocol::{Message, Version};
use sprinkler_trickle::TrickleConfig;

const BLOCK: u16 = 64;
const LATENCY: Duration = Duration::from_millis(2);
const DECODE_DELAY: Duration = Duration::from_millis(5);

#[derive(Debug)]
enum Event {
    Deliver { to: usize, message: Message },
    DecodeDone { node: usize, job: DecodeJob },
}

#[derive(Debug)]
struct Scheduled {
    at: Instant,
    seq: u64,
    event: Event,
}

// Min-heap on (at, seq).
impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct SimNode {
    engine: DisseminationEngine,
    completed: Vec<CompletedTransfer>,
    events: Vec<SessionEvent>,
    data_sent: u64,
    control_sent: u64,
}

/// Returns true when `message` from `from` to `to` should be lost.
type DropPolicy = Box<dyn FnMut(usize, usize, &Message) -> bool>;

struct Simulator {
    origin: Instant,
    now: Instant,
    nodes: Vec<SimNode>,
    queue: BinaryHeap<Scheduled>,
    seq: u64,
    coder: Arc<StubCoder>,
    blocked: HashSet<(usize, usize)>,
    drop: DropPolicy,
}

impl Simulator {
    fn new(count: usize, config: EngineConfig) -> Self {
        let coder = Arc::new(StubCoder::new());
        let origin = Instant::now();
        let nodes = (0..count)
            .map(|i| {
                let mut engine =
                    DisseminationEngine::new(config.clone(), coder.clone(), i as u64 + 1).unwrap();
                engine.start(origin);
                SimNode {
                    engine,
                    completed: Vec::new(),
                    events: Vec::new(),
                    data_sent: 0,
                    control_sent: 0,
                }
            })
            .collect();
        Self {
            origin,
            now: origin,
            nodes,
            queue: BinaryHeap::new(),
            seq: 0,
            coder,
            blocked: HashSet::new(),
            drop: Box::new(|_, _, _| false),
        }
    }

    fn with_drop(mut self, drop: DropPolicy) -> Self {
        self.drop = drop;
        self
    }

    /// Cut the link both ways.
    fn partition(&mut self, a: usize, b: usize) {
        self.blocked.insert((a, b));
        self.blocked.insert((b, a));
    }

    fn publish(&mut self, node: usize, version: Version, content: SourceBlocks) {
        let actions = self.nodes[node]
            .engine
            .publish(self.now, version, content)
            .unwrap();
        self.apply(node, actions);
    }

    fn schedule(&mut self, at: Instant, event: Event) {
        self.seq += 1;
        self.queue.push(Scheduled {
            at,
            seq: self.seq,
            event,
        });
    }

    fn apply(&mut self, from: usize, actions: EngineActions) {
        for message in actions.send {
            match message {
                Message::Data(_) => self.nodes[from].data_sent += 1,
                Message::Control(_) => self.nodes[from].control_sent += 1,
            }
            for to in 0..self.nodes.len() {
                if to == from || self.blocked.contains(&(from, to)) {
                    continue;
                }
                if (self.drop)(from, to, &message) {
                    continue;
                }
                self.schedule(
                    self.now + LATENCY,
                    Event::Deliver {
                        to,
                        message: message.clone(),
                    },
                );
            }
        }
        if let Some(job) = actions.decode {
            self.schedule(self.now + DECODE_DELAY, Event::DecodeDone { node: from, job });
        }
        for event in actions.events {
            if let SessionEvent::Completed(t) = &event {
                self.nodes[from].completed.push(t.clone());
            }
            self.nodes[from].events.push(event);
        }
    }

    fn next_timer(&self) -> Option<(Instant, usize)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.engine.next_deadline().map(|d| (d, i)))
            .min()
    }

    /// Advance virtual time to `origin + limit`.
    fn run_for(&mut self, limit: Duration) {
        let end = self.origin + limit;
        loop {
            let queued = self.queue.peek().map(|s| s.at);
            let timer = self.next_timer();
            let next = match (queued, timer) {
                (Some(q), Some((t, _))) => q.min(t),
                (Some(q), None) => q,
                (None, Some((t, _))) => t,
                (None, None) => break,
            };
            if next > end {
                break;
            }
            self.now = next;

            if queued == Some(next) {
                let Some(scheduled) = self.queue.pop() else {
                    break;
                };
                match scheduled.event {
                    Event::Deliver { to, message } => {
                        let actions = self.nodes[to].engine.handle_message(self.now, message);
                        self.apply(to, actions);
                    }
                    Event::DecodeDone { node, job } => {
                        let result = self.coder.try_decode(&job.symbols, job.layout);
                        let actions = self.nodes[node].engine.on_decode_result(
                            self.now,
                            job.job_id,
                            job.version,
                            result,
                        );
                        self.apply(node, actions);
                    }
                }
            } else if let Some((_, node)) = timer {
                let actions = self.nodes[node].engine.poll_timers(self.now);
                self.apply(node, actions);
            }
        }
        self.now = self.now.max(end);
    }

    fn completed_version(&self, node: usize) -> Option<Version> {
        self.nodes[node].completed.last().map(|t| t.version)
    }
}

fn sim_config() -> EngineConfig {
    EngineConfig {
        control: TrickleConfig::from_millis(200, 12_800, 2),
        data: TrickleConfig::from_millis(20, 1_280, 2),
        symbols_per_burst: 4,
        decode_every: 2,
        post_completion_beacons: 3,
        relay_after_complete: false,
        await_interest: false,
        store_capacity_factor: 4,
        retention: Duration::from_secs(2),
    }
}

fn file(k: usize, seed: u64) -> (Vec<u8>, SourceBlocks) {
    let bytes = sample_content(k * BLOCK as usize - 17, seed);
    let blocks = SourceBlocks::from_bytes(&bytes, BLOCK).unwrap();
    assert_eq!(blocks.total_blocks() as usize, k);
    (bytes, blocks)
}

#[test]
fn test_receivers_converge_without_loss() {
    let mut sim = Simulator::new(4, sim_config());
    let (bytes, blocks) = file(10, 1);
    sim.publish(0, 1, blocks);
    sim.run_for(Duration::from_secs(60));

    for rx in 1..4 {
        let done = &sim.nodes[rx].completed;
        assert_eq!(done.len(), 1, "node {rx} should complete exactly once");
        assert_eq!(done[0].version, 1);
        assert_eq!(done[0].file_bytes().as_ref(), bytes.as_slice());
        assert_eq!(
            sim.nodes[rx].engine.sessions().current().unwrap().state(),
            SessionState::Complete
        );
    }
}

#[test]
fn test_completes_with_every_other_data_datagram_dropped() {
    let mut per_receiver = [0u64; 3];
    let drop: DropPolicy = Box::new(move |_, to, message| {
        if !matches!(message, Message::Data(_)) {
            return false;
        }
        per_receiver[to] += 1;
        per_receiver[to] % 2 == 0
    });
    let mut sim = Simulator::new(3, sim_config()).with_drop(drop);
    let (bytes, blocks) = file(10, 2);
    sim.publish(0, 1, blocks);
    sim.run_for(Duration::from_secs(120));

    for rx in 1..3 {
        assert_eq!(sim.completed_version(rx), Some(1), "node {rx}");
        assert_eq!(sim.nodes[rx].completed[0].file_bytes().as_ref(), bytes.as_slice());
    }
}

#[test]
fn test_newer_version_supersedes_transfer_in_progress() {
    let mut sim = Simulator::new(3, sim_config());
    let (_, big) = file(40, 3);
    sim.publish(0, 1, big);
    sim.run_for(Duration::from_millis(400));
    for rx in 1..3 {
        assert_eq!(sim.nodes[rx].engine.sessions().current_version(), 1);
    }

    let (bytes, small) = file(10, 4);
    sim.publish(0, 2, small);
    sim.run_for(Duration::from_secs(60));

    for rx in 1..3 {
        let node = &sim.nodes[rx];
        assert!(node
            .events
            .iter()
            .any(|e| matches!(e, SessionEvent::Superseded { old: 1, new: 2 })));
        assert!(node.completed.iter().all(|t| t.version == 2));
        assert_eq!(node.completed.len(), 1);
        assert_eq!(node.completed[0].file_bytes().as_ref(), bytes.as_slice());
    }
}

#[test]
fn test_relay_reaches_receiver_out_of_seeder_range() {
    let config = EngineConfig {
        relay_after_complete: true,
        ..sim_config()
    };
    let mut sim = Simulator::new(3, config);
    sim.partition(0, 2);
    let (bytes, blocks) = file(10, 5);
    sim.publish(0, 1, blocks);
    sim.run_for(Duration::from_secs(180));

    assert_eq!(sim.completed_version(1), Some(1));
    assert_eq!(sim.completed_version(2), Some(1));
    assert_eq!(sim.nodes[2].completed[0].file_bytes().as_ref(), bytes.as_slice());
    assert!(sim.nodes[1].data_sent > 0, "the relay must have minted symbols");
}

#[test]
fn test_receivers_fall_quiet_after_convergence() {
    let mut sim = Simulator::new(4, sim_config());
    let (_, blocks) = file(10, 6);
    sim.publish(0, 1, blocks);
    sim.run_for(Duration::from_secs(120));
    for rx in 1..4 {
        assert_eq!(sim.completed_version(rx), Some(1));
    }

    let before: Vec<u64> = sim.nodes.iter().map(|n| n.control_sent).collect();
    let data_before = sim.nodes[0].data_sent;
    sim.run_for(Duration::from_secs(600));

    for rx in 1..4 {
        assert_eq!(
            sim.nodes[rx].control_sent, before[rx],
            "completed receiver {rx} kept beaconing"
        );
        assert!(!sim.nodes[rx].engine.control_timer().is_running());
    }
    // The seeder keeps announcing at the maximum interval, nothing more.
    let seeder_beacons = sim.nodes[0].control_sent - before[0];
    assert!(seeder_beacons <= 480 / 12 + 1, "seeder sent {seeder_beacons}");
    assert_eq!(sim.nodes[0].data_sent, data_before);
}
