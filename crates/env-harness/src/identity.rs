//! Unique release identities for concurrently running scenarios.
//!
//! Every scenario in a run shares one random seed. Uniqueness inside the
//! seed comes from the slot: parallel node `n` of `total` hands out slots
//! `n, n + total, n + 2 * total, ...`, so two processes of the same run
//! never collide, and within one process an atomic counter keeps
//! concurrently starting scenarios apart.

use common::config::HarnessConfig;
use common::error::Result;
use common::types::ReleaseIdentity;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use tracing::debug;

/// Hands out slot numbers that are disjoint across parallel nodes.
#[derive(Debug)]
pub struct SlotAllocator {
    node: u32,
    total: u32,
    issued: AtomicU32,
}

impl SlotAllocator {
    /// `node` is 1-based and at most `total`.
    pub fn new(node: u32, total: u32) -> Self {
        Self {
            node,
            total: total.max(1),
            issued: AtomicU32::new(0),
        }
    }

    pub fn next_slot(&self) -> u32 {
        let k = self.issued.fetch_add(1, Ordering::Relaxed);
        k.saturating_mul(self.total).saturating_add(self.node)
    }
}

/// Generates [`ReleaseIdentity`] values from a prefix, a seed and slots.
#[derive(Debug)]
pub struct IdentityAllocator {
    prefix: String,
    seed: u64,
    slots: SlotAllocator,
}

impl IdentityAllocator {
    pub fn new(prefix: impl Into<String>, seed: u64, node: u32, total: u32) -> Self {
        Self {
            prefix: prefix.into(),
            seed,
            slots: SlotAllocator::new(node, total),
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(
            config.release_prefix.clone(),
            config.random_seed,
            config.parallel_node,
            config.parallel_total,
        )
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Allocate the next identity.
    ///
    /// # Errors
    ///
    /// `Configuration` if the prefix cannot form a valid release name.
    pub fn allocate(&self) -> Result<ReleaseIdentity> {
        let slot = self.slots.next_slot();
        let identity = ReleaseIdentity::generate(&self.prefix, self.seed, slot)?;
        debug!(target: "env.identity", release = %identity, slot, "Allocated release identity");
        Ok(identity)
    }
}

static PROCESS_ALLOCATOR: OnceLock<IdentityAllocator> = OnceLock::new();

/// The allocator shared by every scenario in this process.
///
/// The first caller's configuration fixes the prefix, seed and node; later
/// configurations are ignored so that slot numbering stays monotonic.
pub fn process_allocator(config: &HarnessConfig) -> &'static IdentityAllocator {
    PROCESS_ALLOCATOR.get_or_init(|| IdentityAllocator::from_config(config))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;

    #[test]
    fn test_single_node_counts_from_one() {
        let slots = SlotAllocator::new(1, 1);
        let issued: Vec<u32> = (0..4).map(|_| slots.next_slot()).collect();
        assert_eq!(issued, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_nodes_interleave_without_overlap() {
        let node1 = SlotAllocator::new(1, 3);
        let node3 = SlotAllocator::new(3, 3);

        let a: Vec<u32> = (0..4).map(|_| node1.next_slot()).collect();
        let b: Vec<u32> = (0..4).map(|_| node3.next_slot()).collect();

        assert_eq!(a, vec![1, 4, 7, 10]);
        assert_eq!(b, vec![3, 6, 9, 12]);
    }

    #[test]
    fn test_identity_uses_prefix_seed_and_slot() {
        let allocator = IdentityAllocator::new("topgun-ew", 4242, 2, 4);

        assert_eq!(allocator.allocate().unwrap().name(), "topgun-ew-4242-2");
        assert_eq!(allocator.allocate().unwrap().name(), "topgun-ew-4242-6");
        assert_eq!(allocator.seed(), 4242);
    }

    #[test]
    fn test_concurrent_allocations_are_distinct() {
        let allocator = Arc::new(IdentityAllocator::new("topgun-ew", 7, 1, 1));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                std::thread::spawn(move || {
                    (0..25)
                        .map(|_| allocator.allocate().unwrap().name().to_string())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut names = HashSet::new();
        for handle in handles {
            for name in handle.join().unwrap() {
                assert!(names.insert(name.clone()), "duplicate identity {name}");
            }
        }
        assert_eq!(names.len(), 200);
    }

    #[test]
    fn test_invalid_prefix_is_configuration_error() {
        let allocator = IdentityAllocator::new("Not_Valid", 1, 1, 1);
        assert!(allocator.allocate().is_err());
    }

    #[test]
    fn test_process_allocator_is_shared() {
        let vars: HashMap<String, String> = [
            ("HARNESS_CHART", "concourse/concourse"),
            ("HARNESS_RANDOM_SEED", "99"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let config = HarnessConfig::from_vars(&vars).unwrap();

        let first = process_allocator(&config);
        let second = process_allocator(&config);

        assert!(std::ptr::eq(first, second));
        assert_ne!(
            first.allocate().unwrap().name(),
            second.allocate().unwrap().name()
        );
    }
}
