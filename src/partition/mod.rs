//! Static assignment of receive queues to processing cores
//!
//! Every active lcore gets a contiguous half-open range of receive queues.
//! Ranges are computed once at startup from the lcore's ordinal position in
//! the sorted active-lcore list and never change afterwards, which is what
//! lets the forwarding loop run without any locking.

use crate::{Error, Result};
use std::fmt;
use std::ops::Range;

/// Half-open range of receive queue indices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRange {
    pub start: u16,
    pub end: u16,
}

impl QueueRange {
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, queue: u16) -> bool {
        queue >= self.start && queue < self.end
    }

    pub fn iter(&self) -> Range<u16> {
        self.start..self.end
    }
}

impl fmt::Display for QueueRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}-{}", self.start, self.end - 1)
        }
    }
}

/// Queue range for the core at ordinal `core` out of `num_cores`.
///
/// The first `queues % num_cores` cores get one extra queue.
pub fn queue_range(num_queues: u16, num_cores: u16, core: u16) -> Result<QueueRange> {
    if num_cores == 0 {
        return Err(Error::InvalidConfig("no active cores".to_string()));
    }
    if core >= num_cores {
        return Err(Error::InvalidConfig(format!(
            "core ordinal {} out of range ({} active cores)",
            core, num_cores
        )));
    }

    let base = num_queues / num_cores;
    let remainder = num_queues % num_cores;

    let (start, len) = if core < remainder {
        (core * (base + 1), base + 1)
    } else {
        (core * base + remainder, base)
    };

    Ok(QueueRange {
        start,
        end: start + len,
    })
}

/// What one lcore does for the whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreAssignment {
    /// Position in the active-lcore list; also the tx queue index
    pub ordinal: u16,
    /// CPU the worker is pinned to
    pub lcore_id: usize,
    /// Receive queues polled by this core
    pub queues: QueueRange,
}

impl CoreAssignment {
    pub fn tx_queue(&self) -> u16 {
        self.ordinal
    }
}

/// Plan assignments for a set of active lcores.
///
/// Lcore ids are sorted and deduplicated first so the result does not depend
/// on the order they were enumerated in.
pub fn plan(num_queues: u16, lcores: &[usize]) -> Result<Vec<CoreAssignment>> {
    let mut ids = lcores.to_vec();
    ids.sort_unstable();
    ids.dedup();

    if ids.is_empty() {
        return Err(Error::InvalidConfig("no active cores".to_string()));
    }
    let num_cores = u16::try_from(ids.len())
        .map_err(|_| Error::InvalidConfig(format!("too many cores: {}", ids.len())))?;

    ids.into_iter()
        .enumerate()
        .map(|(ordinal, lcore_id)| {
            let ordinal = ordinal as u16;
            Ok(CoreAssignment {
                ordinal,
                lcore_id,
                queues: queue_range(num_queues, num_cores, ordinal)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_four_queues_three_cores() {
        let r: Vec<_> = (0..3).map(|k| queue_range(4, 3, k).unwrap()).collect();
        assert_eq!(r[0], QueueRange { start: 0, end: 2 });
        assert_eq!(r[1], QueueRange { start: 2, end: 3 });
        assert_eq!(r[2], QueueRange { start: 3, end: 4 });
    }

    #[test]
    fn test_partition_properties() {
        for q in 0..=130u16 {
            for c in 1..=20u16 {
                let mut next = 0;
                let mut total = 0;
                for k in 0..c {
                    let r = queue_range(q, c, k).unwrap();
                    assert_eq!(r.start, next, "gap or overlap at q={} c={} k={}", q, c, k);
                    let expected = if k < q % c { q / c + 1 } else { q / c };
                    assert_eq!(r.len(), expected as usize);
                    next = r.end;
                    total += r.len();
                }
                assert_eq!(next, q);
                assert_eq!(total, q as usize);
            }
        }
    }

    #[test]
    fn test_more_cores_than_queues() {
        let ranges: Vec<_> = (0..12).map(|k| queue_range(8, 12, k).unwrap()).collect();
        assert!(ranges[..8].iter().all(|r| r.len() == 1));
        assert!(ranges[8..].iter().all(|r| r.is_empty()));
        assert_eq!(ranges[9].to_string(), "none");
    }

    #[test]
    fn test_zero_cores_rejected() {
        assert!(queue_range(8, 0, 0).is_err());
        assert!(queue_range(8, 2, 2).is_err());
        assert!(plan(8, &[]).is_err());
    }

    #[test]
    fn test_plan_independent_of_enumeration_order() {
        let a = plan(128, &[6, 2, 4]).unwrap();
        let b = plan(128, &[2, 4, 6, 4]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].lcore_id, 2);
        assert_eq!(a[2].lcore_id, 6);
        assert_eq!(a[2].tx_queue(), 2);
        assert_eq!(a[0].queues.to_string(), "0-42");
    }

    #[test]
    fn test_contains() {
        let r = queue_range(8, 3, 1).unwrap();
        assert!(r.contains(3));
        assert!(!r.contains(6));
        assert_eq!(r.iter().collect::<Vec<_>>(), vec![3, 4, 5]);
    }
}
