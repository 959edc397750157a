//! Convergence fuzzing
//!
//! Drives N replicas with randomized mutations and a randomized
//! collection/delivery interleaving, then pumps the network to
//! quiescence and checks that every replica reached identical
//! confirmed state with no pending operations left.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use arbor_core::Value;
use arbor_state::DirectorySnapshot;

use crate::{TestNetwork, TestReplica};

/// Fuzzer configuration
#[derive(Clone, Debug)]
pub struct FuzzerConfig {
    /// Number of replicas
    pub replica_count: usize,
    /// Number of local mutations to generate
    pub op_count: usize,
    /// Probability that a replica's outbound ops are collected right
    /// after a mutation (lower means longer pending queues)
    pub collect_prob: f64,
    /// Probability of a mid-run broadcast round
    pub broadcast_prob: f64,
    /// Random seed
    pub seed: u64,
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        FuzzerConfig {
            replica_count: 3,
            op_count: 400,
            collect_prob: 0.4,
            broadcast_prob: 0.2,
            seed: 42,
        }
    }
}

impl FuzzerConfig {
    /// Light fuzzing for quick checks
    pub fn light() -> Self {
        FuzzerConfig {
            replica_count: 2,
            op_count: 80,
            ..FuzzerConfig::default()
        }
    }

    /// Heavy fuzzing for thorough runs
    pub fn heavy() -> Self {
        FuzzerConfig {
            replica_count: 5,
            op_count: 2000,
            collect_prob: 0.25,
            ..FuzzerConfig::default()
        }
    }
}

/// Outcome of one fuzzing run
#[derive(Debug)]
pub struct FuzzReport {
    pub ops_issued: usize,
    pub final_state: DirectorySnapshot,
}

const KEYS: [&str; 4] = ["alpha", "beta", "gamma", "delta"];
const DIRS: [&str; 2] = ["left", "right"];

/// Run one randomized session and assert convergence
pub fn run_convergence_fuzz(config: &FuzzerConfig) -> FuzzReport {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut network = TestNetwork::new();
    let mut replicas: Vec<TestReplica> = (0..config.replica_count)
        .map(|i| TestReplica::new(i as u64 + 1))
        .collect();

    for _ in 0..config.op_count {
        let idx = rng.gen_range(0..replicas.len());
        mutate_once(&mut rng, &mut replicas[idx]);

        if rng.gen_bool(config.collect_prob) {
            network.collect(&mut replicas[idx]);
        }
        if rng.gen_bool(config.broadcast_prob) {
            network.broadcast(&mut replicas);
        }
    }

    network.converge(&mut replicas);

    let reference = replicas[0].tree.serialize();
    for replica in &replicas[1..] {
        let state = replica.tree.serialize();
        assert_eq!(
            reference.root,
            state.root,
            "replica {} diverged",
            replica.tree.replica_id()
        );
        assert_eq!(replica.tree.pending_ops(), 0);
        assert!(!replica.tree.has_outbound());
    }

    FuzzReport {
        ops_issued: config.op_count,
        final_state: reference,
    }
}

fn mutate_once(rng: &mut StdRng, replica: &mut TestReplica) {
    let root = replica.tree.root();
    // Handles are taken fresh, so local calls cannot go stale here.
    let target = if rng.gen_bool(0.5) {
        root.clone()
    } else {
        let name = DIRS[rng.gen_range(0..DIRS.len())];
        replica
            .tree
            .create_sub_directory(&root, name)
            .expect("root never goes stale")
    };

    match rng.gen_range(0..8) {
        0..=4 => {
            let key = KEYS[rng.gen_range(0..KEYS.len())];
            let value = Value::from(rng.gen_range(0..100) as i64);
            replica.tree.set(&target, key, value).expect("fresh handle");
        }
        5 => {
            let key = KEYS[rng.gen_range(0..KEYS.len())];
            replica.tree.delete(&target, key).expect("fresh handle");
        }
        6 => {
            replica.tree.clear(&target).expect("fresh handle");
        }
        _ => {
            let name = DIRS[rng.gen_range(0..DIRS.len())];
            replica
                .tree
                .delete_sub_directory(&root, name)
                .expect("root never goes stale");
        }
    }
}
