//! Per-core forwarding loop
//!
//! Each worker owns a fixed range of rx queues and one tx queue. For every
//! port pair it drains its rx queues on the source port, rewrites the link
//! layer addresses and transmits on the paired port. Buffers the device does
//! not accept are dropped back into the pool straight away.

use crate::{
    ether::{self, EtherAddr},
    memory::Mbuf,
    partition::CoreAssignment,
    poll::{EthDev, MAX_BURST},
    stats::{PoolReport, RxCounters},
    topology::PoolTier,
    Error, Result,
};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Highest port id a port mask can name
pub const MAX_PORTS: usize = 32;

/// Ports selected by the port mask, in mask order.
///
/// Entries naming a port the device layer does not have are kept as `None`
/// so that positional pairing is not shifted by them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSet {
    ports: Vec<Option<u16>>,
}

impl PortSet {
    pub fn from_mask(mask: u32, available: u16) -> Result<Self> {
        if mask == 0 {
            return Err(Error::InvalidConfig("invalid portmask".to_string()));
        }

        let requested = mask.count_ones();
        if requested > available as u32 {
            warn!(
                "Specified port number({}) exceeds total system port number({})",
                requested, available
            );
        }

        let ports: Vec<Option<u16>> = (0..MAX_PORTS as u16)
            .filter(|&bit| mask & (1u32 << bit) != 0)
            .map(|port| {
                if port < available {
                    Some(port)
                } else {
                    warn!(
                        "Specified port ID({}) exceeds max system port ID({})",
                        port,
                        available.saturating_sub(1)
                    );
                    None
                }
            })
            .collect();

        let valid = ports.iter().flatten().count();
        if valid < 2 || valid % 2 != 0 {
            return Err(Error::InvalidConfig(format!(
                "valid port count {} is not even or less than 2",
                valid
            )));
        }

        Ok(Self { ports })
    }

    /// Valid ports, ascending
    pub fn valid_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.ports.iter().flatten().copied()
    }

    pub fn valid_count(&self) -> usize {
        self.valid_ports().count()
    }

    pub fn contains(&self, port: u16) -> bool {
        self.valid_ports().any(|p| p == port)
    }

    /// `(src, dst)` for every position `p` whose partner `p ^ 1` exists and
    /// where both entries are valid.
    pub fn pairs(&self) -> Vec<(u16, u16)> {
        (0..self.ports.len())
            .filter_map(|p| {
                let src = (*self.ports.get(p)?)?;
                let dst = (*self.ports.get(p ^ 1)?)?;
                Some((src, dst))
            })
            .collect()
    }
}

/// State shared read-only by every worker once forwarding starts
pub struct ForwardingContext {
    pairs: Vec<(u16, u16)>,
    port_addrs: Vec<EtherAddr>,
    counters: RxCounters,
    tier: PoolTier,
    burst_size: usize,
}

impl ForwardingContext {
    /// `port_addrs` is indexed by port id.
    pub fn new(
        pairs: Vec<(u16, u16)>,
        port_addrs: Vec<EtherAddr>,
        tier: PoolTier,
        burst_size: usize,
    ) -> Self {
        Self {
            pairs,
            port_addrs,
            counters: RxCounters::new(tier.queue_count() as usize),
            tier,
            burst_size: burst_size.clamp(1, MAX_BURST),
        }
    }

    pub fn pairs(&self) -> &[(u16, u16)] {
        &self.pairs
    }

    pub fn port_addr(&self, port: u16) -> EtherAddr {
        self.port_addrs
            .get(port as usize)
            .copied()
            .unwrap_or(EtherAddr::ZERO)
    }

    pub fn counters(&self) -> &RxCounters {
        &self.counters
    }

    pub fn tier(&self) -> PoolTier {
        self.tier
    }

    pub fn burst_size(&self) -> usize {
        self.burst_size
    }

    pub fn report(&self) -> PoolReport {
        PoolReport::collect(&self.counters, self.tier)
    }
}

/// What one worker did over its lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub rx: u64,
    pub tx: u64,
    pub dropped: u64,
}

/// The forwarding loop of one lcore
pub struct LcoreWorker<D: EthDev + ?Sized> {
    dev: Arc<D>,
    ctx: Arc<ForwardingContext>,
    assignment: CoreAssignment,
    burst: Vec<Mbuf>,
    stats: WorkerStats,
}

impl<D: EthDev + ?Sized> LcoreWorker<D> {
    pub fn new(dev: Arc<D>, ctx: Arc<ForwardingContext>, assignment: CoreAssignment) -> Self {
        let burst = Vec::with_capacity(ctx.burst_size());
        Self {
            dev,
            ctx,
            assignment,
            burst,
            stats: WorkerStats::default(),
        }
    }

    pub fn assignment(&self) -> &CoreAssignment {
        &self.assignment
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// One pass over every pair and every owned queue.
    ///
    /// Returns the number of buffers the devices accepted for transmission.
    pub fn poll_once(&mut self) -> usize {
        let ctx = &*self.ctx;
        let tx_queue = self.assignment.tx_queue();
        let mut forwarded = 0;

        for &(src, dst) in ctx.pairs() {
            let dst_mac = EtherAddr::synthetic(dst);
            let src_mac = ctx.port_addr(dst);

            for queue in self.assignment.queues.iter() {
                let received = self
                    .dev
                    .rx_burst(src, queue, &mut self.burst, ctx.burst_size());
                if received == 0 {
                    continue;
                }
                ctx.counters().add(queue, received as u64);

                for mbuf in self.burst.iter_mut() {
                    ether::rewrite_addrs(mbuf.data_mut(), dst_mac, src_mac);
                }

                let sent = self.dev.tx_burst(dst, tx_queue, &mut self.burst);
                let dropped = self.burst.len();
                self.burst.clear();

                self.stats.rx += received as u64;
                self.stats.tx += sent as u64;
                self.stats.dropped += dropped as u64;
                forwarded += sent;
            }
        }

        forwarded
    }

    /// Poll until `running` is cleared
    pub fn run(&mut self, running: &AtomicBool) -> WorkerStats {
        let a = self.assignment;
        if a.queues.is_empty() {
            info!("lcore {} has nothing to do", a.lcore_id);
            return self.stats;
        }
        info!(
            "core {} (lcore {}) reading queues {}",
            a.ordinal, a.lcore_id, a.queues
        );

        while running.load(Ordering::Relaxed) {
            self.poll_once();
        }

        debug!(
            "lcore {} stopped: rx {} tx {} dropped {}",
            a.lcore_id, self.stats.rx, self.stats.tx, self.stats.dropped
        );
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MbufPool;
    use crate::partition;
    use crate::poll::{port_init, SoftNic, SoftNicConfig};
    use crate::Config;

    #[test]
    fn test_port_set_contiguous_mask() {
        let ports = PortSet::from_mask(0xf, 4).unwrap();
        assert_eq!(ports.valid_ports().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(ports.pairs(), vec![(0, 1), (1, 0), (2, 3), (3, 2)]);
        for (src, dst) in ports.pairs() {
            assert_eq!(dst, src ^ 1);
        }
    }

    #[test]
    fn test_port_set_sparse_mask_pairs_by_position() {
        let ports = PortSet::from_mask(0b1010, 4).unwrap();
        assert_eq!(ports.pairs(), vec![(1, 3), (3, 1)]);
    }

    #[test]
    fn test_port_set_rejects_bad_masks() {
        assert!(PortSet::from_mask(0, 4).is_err());
        assert!(PortSet::from_mask(0x1, 4).is_err());
        assert!(PortSet::from_mask(0x7, 4).is_err());
        // Port 2 and 3 do not exist, leaving one valid port
        assert!(PortSet::from_mask(0xd, 2).is_err());
    }

    #[test]
    fn test_port_set_skips_pairs_with_missing_ports() {
        let ports = PortSet::from_mask(0x3f, 4).unwrap();
        assert_eq!(ports.valid_count(), 4);
        assert!(!ports.contains(4));
        assert_eq!(ports.pairs().len(), 4);
    }

    struct Rig {
        nic: Arc<SoftNic>,
        pool: MbufPool,
        ctx: Arc<ForwardingContext>,
        assignments: Vec<CoreAssignment>,
    }

    fn rig(num_pools: u32, lcores: &[usize], tx_ring: u16) -> Rig {
        let nic = Arc::new(SoftNic::new(SoftNicConfig {
            ports: 2,
            ..SoftNicConfig::default()
        }));
        let config = Config {
            num_pools,
            rx_ring_size: 64,
            tx_ring_size: tx_ring,
            ..Config::default()
        };
        let tier = PoolTier::from_pool_count(num_pools).unwrap();
        let assignments = partition::plan(tier.queue_count(), lcores).unwrap();
        let pool = MbufPool::new("forward_test", 512, 256, 0).unwrap();

        let mut addrs = Vec::new();
        for port in 0..2 {
            addrs.push(port_init(&*nic, port, &config, assignments.len() as u16, &pool).unwrap());
        }
        let pairs = PortSet::from_mask(0x3, 2).unwrap().pairs();
        let ctx = Arc::new(ForwardingContext::new(pairs, addrs, tier, MAX_BURST));
        Rig {
            nic,
            pool,
            ctx,
            assignments,
        }
    }

    fn frame(vlan: u16) -> Vec<u8> {
        ether::build_frame(
            EtherAddr([0xff; 6]),
            EtherAddr([0x00, 0xaa, 0xbb, 0xcc, 0xdd, 0x00]),
            Some(vlan),
            0x0800,
            b"forward me",
        )
    }

    #[test]
    fn test_empty_poll_has_no_side_effects() {
        let r = rig(8, &[0], 64);
        let mut worker = LcoreWorker::new(r.nic.clone(), r.ctx.clone(), r.assignments[0]);

        assert_eq!(worker.poll_once(), 0);
        assert_eq!(r.ctx.counters().total(), 0);
        assert_eq!(r.nic.stats(1).unwrap().opackets, 0);
        assert_eq!(worker.stats(), WorkerStats::default());
    }

    #[test]
    fn test_forward_rewrites_addresses() {
        let r = rig(8, &[0], 64);
        let mut worker = LcoreWorker::new(r.nic.clone(), r.ctx.clone(), r.assignments[0]);

        for _ in 0..3 {
            r.nic.inject(0, &frame(5));
        }
        assert_eq!(worker.poll_once(), 3);
        assert_eq!(r.ctx.counters().get(5), 3);

        let mut wire = Vec::new();
        r.nic.drain_tx(1, &mut wire);
        assert_eq!(wire.len(), 3);
        let port1_mac = r.nic.mac_addr(1).unwrap();
        for m in &wire {
            assert_eq!(ether::dst_addr(m.data()), Some(EtherAddr::synthetic(1)));
            assert_eq!(ether::src_addr(m.data()), Some(port1_mac));
            assert_eq!(ether::vlan_tci(m.data()), Some(5));
        }
    }

    #[test]
    fn test_reverse_direction_uses_port0_address() {
        let r = rig(8, &[0], 64);
        let mut worker = LcoreWorker::new(r.nic.clone(), r.ctx.clone(), r.assignments[0]);

        r.nic.inject(1, &frame(2));
        worker.poll_once();

        let mut wire = Vec::new();
        r.nic.drain_tx(0, &mut wire);
        assert_eq!(wire.len(), 1);
        assert_eq!(ether::dst_addr(wire[0].data()), Some(EtherAddr::synthetic(0)));
        assert_eq!(
            ether::src_addr(wire[0].data()),
            Some(r.nic.mac_addr(0).unwrap())
        );
    }

    #[test]
    fn test_tx_shortfall_frees_remainder() {
        let r = rig(8, &[0], 4);
        let capacity = r.pool.capacity();
        let mut worker = LcoreWorker::new(r.nic.clone(), r.ctx.clone(), r.assignments[0]);

        for _ in 0..10 {
            r.nic.inject(0, &frame(1));
        }
        assert_eq!(worker.poll_once(), 4);
        assert_eq!(worker.stats().dropped, 6);
        assert_eq!(r.ctx.counters().get(1), 10);
        assert_eq!(r.pool.available(), capacity - 4);

        let mut wire = Vec::new();
        r.nic.drain_tx(1, &mut wire);
        drop(wire);
        assert_eq!(r.pool.available(), capacity);
    }

    #[test]
    fn test_worker_only_polls_its_queues() {
        let r = rig(8, &[0, 1], 64);
        let mut first = LcoreWorker::new(r.nic.clone(), r.ctx.clone(), r.assignments[0]);
        let mut second = LcoreWorker::new(r.nic.clone(), r.ctx.clone(), r.assignments[1]);

        r.nic.inject(0, &frame(1));
        r.nic.inject(0, &frame(6));

        assert_eq!(second.poll_once(), 1);
        assert_eq!(r.nic.rx_pending(0, 1), 1);
        assert_eq!(first.poll_once(), 1);

        // Each core transmits on its own tx queue
        assert_eq!(first.assignment().tx_queue(), 0);
        assert_eq!(second.assignment().tx_queue(), 1);
    }

    #[test]
    fn test_run_stops_on_flag() {
        let r = rig(8, &[0], 64);
        let mut worker = LcoreWorker::new(r.nic.clone(), r.ctx.clone(), r.assignments[0]);
        r.nic.inject(0, &frame(3));

        let running = AtomicBool::new(false);
        let stats = worker.run(&running);
        assert_eq!(stats.rx, 0);
        assert_eq!(r.nic.rx_pending(0, 3), 1);
    }

    #[test]
    fn test_idle_core_returns_immediately() {
        let r = rig(8, &(0..10).collect::<Vec<_>>(), 64);
        let idle = r.assignments[9];
        assert!(idle.queues.is_empty());

        let mut worker = LcoreWorker::new(r.nic.clone(), r.ctx.clone(), idle);
        let running = AtomicBool::new(true);
        assert_eq!(worker.run(&running), WorkerStats::default());
    }
}
