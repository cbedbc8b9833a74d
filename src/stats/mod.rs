//! Per-queue receive counters and pool-level reporting

use crate::topology::PoolTier;
use crossbeam_utils::CachePadded;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Received-packet counters, one per rx queue.
///
/// Each counter has a single writer (the core owning the queue) and any
/// number of readers. Counters sit on their own cache lines so cores polling
/// neighbouring queues do not contend.
pub struct RxCounters {
    queues: Box<[CachePadded<AtomicU64>]>,
}

impl RxCounters {
    pub fn new(num_queues: usize) -> Self {
        Self {
            queues: (0..num_queues)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Add a received batch to `queue`. Out-of-range queues are ignored.
    #[inline]
    pub fn add(&self, queue: u16, count: u64) {
        if let Some(counter) = self.queues.get(queue as usize) {
            counter.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn get(&self, queue: u16) -> u64 {
        self.queues
            .get(queue as usize)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> Vec<u64> {
        self.queues
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }

    pub fn total(&self) -> u64 {
        self.queues.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }
}

impl fmt::Debug for RxCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.snapshot()).finish()
    }
}

/// Counters of one pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolCount {
    pub pool: u32,
    pub queues: Vec<u64>,
    pub total: u64,
}

/// Per-pool view of the rx counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolReport {
    pub pools: Vec<PoolCount>,
}

impl PoolReport {
    /// Group `queues_per_pool` consecutive queue counters under each pool
    pub fn aggregate(snapshot: &[u64], tier: PoolTier) -> Self {
        let per_pool = tier.queues_per_pool() as usize;
        let pools = snapshot
            .chunks(per_pool)
            .take(tier.pool_count() as usize)
            .enumerate()
            .map(|(pool, queues)| PoolCount {
                pool: pool as u32,
                queues: queues.to_vec(),
                total: queues.iter().sum(),
            })
            .collect();
        Self { pools }
    }

    pub fn collect(counters: &RxCounters, tier: PoolTier) -> Self {
        Self::aggregate(&counters.snapshot(), tier)
    }

    pub fn total(&self) -> u64 {
        self.pools.iter().map(|p| p.total).sum()
    }
}

impl fmt::Display for PoolReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for pool in &self.pools {
            write!(f, "Pool {}:", pool.pool)?;
            for count in &pool.queues {
                write!(f, " {}", count)?;
            }
            writeln!(f, " (total {})", pool.total)?;
        }
        Ok(())
    }
}
