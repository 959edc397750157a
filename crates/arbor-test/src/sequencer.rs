//! In-memory total-order sequencer
//!
//! `TestNetwork` stands in for the ordered broadcast service: it stamps
//! collected local operations with global sequence numbers and delivers
//! them to every replica in the same order, origin included. `collect`
//! and `broadcast` are separate steps so tests can interleave
//! submissions from different replicas before any delivery happens.

use std::collections::VecDeque;

use arbor_core::SequencedOp;

use crate::TestReplica;

/// Simulated ordered broadcast channel
#[derive(Default)]
pub struct TestNetwork {
    next_global: u64,
    queue: VecDeque<SequencedOp>,
}

impl TestNetwork {
    pub fn new() -> Self {
        TestNetwork::default()
    }

    /// Pull every outbound op from `replica` into the global order
    pub fn collect(&mut self, replica: &mut TestReplica) -> usize {
        let origin = replica.tree.replica_id();
        let ops = replica.tree.drain_outbound();
        let count = ops.len();
        for local in ops {
            self.next_global += 1;
            self.queue.push_back(SequencedOp {
                global_seq: self.next_global,
                origin,
                local_seq: Some(local.local_seq),
                op: local.op,
            });
        }
        count
    }

    /// Deliver everything sequenced so far to every replica
    pub fn broadcast(&mut self, replicas: &mut [TestReplica]) -> usize {
        let mut delivered = 0;
        while let Some(sequenced) = self.queue.pop_front() {
            for replica in replicas.iter_mut() {
                replica.tree.process(&sequenced);
            }
            delivered += 1;
        }
        delivered
    }

    /// Alternate collect/broadcast rounds until no replica has traffic
    pub fn converge(&mut self, replicas: &mut [TestReplica]) {
        loop {
            let mut collected = 0;
            for replica in replicas.iter_mut() {
                collected += self.collect(replica);
            }
            if collected == 0 && self.queue.is_empty() {
                break;
            }
            self.broadcast(replicas);
        }
    }

    /// Operations sequenced but not yet delivered
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}
