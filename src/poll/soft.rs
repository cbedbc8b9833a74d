//! In-process NIC with software VMDq steering
//!
//! Frames handed to [`SoftNic::inject`] are classified the way the hardware
//! would: the 802.1Q VLAN id is looked up in the port's pool map, the first
//! selected pool picks a group of consecutive rx queues and the source MAC
//! picks a queue inside the group. Transmitted mbufs sit in bounded tx rings
//! until the wire side collects them, so a full ring produces the same short
//! `tx_burst` counts a real NIC does.

use super::{DevInfo, EthDev, PortStats, PortStatsSnapshot};
use crate::{
    ether::{self, EtherAddr, VLAN_ID_MASK},
    memory::{Mbuf, MbufPool},
    topology::{PoolTier, PortConf, RxMqMode, RxQueueConf, TxQueueConf, VmdqRxConf},
    Error, Result,
};
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};

/// Soft NIC construction parameters
#[derive(Debug, Clone)]
pub struct SoftNicConfig {
    pub ports: u16,
    pub max_vmdq_pools: u32,
    pub max_rx_queues: u16,
    pub max_tx_queues: u16,
    /// First three octets of every port address
    pub oui: [u8; 3],
}

impl Default for SoftNicConfig {
    fn default() -> Self {
        Self {
            ports: 4,
            max_vmdq_pools: 64,
            max_rx_queues: 128,
            max_tx_queues: 128,
            oui: [0x52, 0x54, 0x00],
        }
    }
}

struct RxRing {
    ring: ArrayQueue<Mbuf>,
    pool: MbufPool,
}

#[derive(Default)]
struct PortSetup {
    conf: Option<PortConf>,
    rx: Vec<Option<RxRing>>,
    tx: Vec<Option<usize>>,
}

struct RunningPort {
    vmdq: VmdqRxConf,
    queues_per_pool: u16,
    rx: Vec<RxRing>,
    tx: Vec<ArrayQueue<Mbuf>>,
}

struct SoftPort {
    mac: EtherAddr,
    setup: Mutex<PortSetup>,
    running: OnceLock<RunningPort>,
    stats: PortStats,
}

/// Software NIC
pub struct SoftNic {
    info: DevInfo,
    ports: Vec<SoftPort>,
}

impl SoftNic {
    pub fn new(config: SoftNicConfig) -> Self {
        let macs = (0..config.ports)
            .map(|p| {
                let [a, b, c] = config.oui;
                let [hi, lo] = p.to_be_bytes();
                EtherAddr([a, b, c, 0x10, hi, lo])
            })
            .collect();
        Self::with_macs(config, macs)
    }

    /// Build a NIC whose ports use the given addresses
    pub fn with_macs(config: SoftNicConfig, macs: Vec<EtherAddr>) -> Self {
        let ports = macs
            .into_iter()
            .take(config.ports as usize)
            .map(|mac| SoftPort {
                mac,
                setup: Mutex::new(PortSetup::default()),
                running: OnceLock::new(),
                stats: PortStats::default(),
            })
            .collect();

        Self {
            info: DevInfo {
                driver_name: "soft_nic".to_string(),
                max_vmdq_pools: config.max_vmdq_pools,
                max_rx_queues: config.max_rx_queues,
                max_tx_queues: config.max_tx_queues,
            },
            ports,
        }
    }

    fn port(&self, port: u16) -> Result<&SoftPort> {
        self.ports.get(port as usize).ok_or_else(|| Error::Device {
            port,
            reason: "no such port".to_string(),
        })
    }

    fn running(&self, port: u16) -> Option<&RunningPort> {
        self.ports.get(port as usize)?.running.get()
    }

    /// Deliver a frame from the wire to `port`.
    ///
    /// Returns the rx queue the frame was steered to, or `None` when it was
    /// dropped (port not started, no pool match, no mbuf, or ring full).
    pub fn inject(&self, port: u16, frame: &[u8]) -> Option<u16> {
        let soft_port = self.ports.get(port as usize)?;
        let running = soft_port.running.get()?;

        let queue = match Self::steer(running, frame) {
            Some(q) => q,
            None => {
                soft_port.stats.imissed.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        let rx = &running.rx[queue as usize];

        let mut mbuf = match rx.pool.alloc() {
            Ok(m) => m,
            Err(_) => {
                soft_port.stats.imissed.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if mbuf.append(frame).is_err() {
            soft_port.stats.imissed.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        mbuf.set_port(port);
        if let Some(tci) = ether::vlan_tci(frame) {
            mbuf.set_vlan_tci(tci);
        }
        mbuf.mark_steered();

        match rx.ring.push(mbuf) {
            Ok(()) => {
                soft_port.stats.ipackets.fetch_add(1, Ordering::Relaxed);
                Some(queue)
            }
            Err(_dropped) => {
                soft_port.stats.imissed.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn steer(running: &RunningPort, frame: &[u8]) -> Option<u16> {
        let vmdq = &running.vmdq;
        let pool = match ether::vlan_tci(frame) {
            Some(tci) => vmdq.pool_for_vlan(tci & VLAN_ID_MASK),
            None => None,
        };
        let pool = match pool {
            Some(p) => p,
            None if vmdq.enable_default_pool => vmdq.default_pool as u32,
            None => return None,
        };

        let qpp = running.queues_per_pool;
        let spread = ether::src_addr(frame).map_or(0, |a| a.0[5] as u16) % qpp;
        let queue = pool as u16 * qpp + spread;
        ((queue as usize) < running.rx.len()).then_some(queue)
    }

    /// Collect everything transmitted on `port`, in tx queue order
    pub fn drain_tx(&self, port: u16, out: &mut Vec<Mbuf>) -> usize {
        let Some(running) = self.running(port) else {
            return 0;
        };
        let before = out.len();
        for ring in &running.tx {
            while let Some(m) = ring.pop() {
                out.push(m);
            }
        }
        out.len() - before
    }

    /// Mbufs waiting in one rx ring
    pub fn rx_pending(&self, port: u16, queue: u16) -> usize {
        self.running(port)
            .and_then(|r| r.rx.get(queue as usize))
            .map_or(0, |rx| rx.ring.len())
    }

    /// Configured rx queue count, once the port is configured
    pub fn rx_queue_count(&self, port: u16) -> Option<u16> {
        let setup = self.ports.get(port as usize)?.setup.lock();
        setup.conf.as_ref().map(|_| setup.rx.len() as u16)
    }

    /// Configured tx queue count, once the port is configured
    pub fn tx_queue_count(&self, port: u16) -> Option<u16> {
        let setup = self.ports.get(port as usize)?.setup.lock();
        setup.conf.as_ref().map(|_| setup.tx.len() as u16)
    }

    pub fn is_started(&self, port: u16) -> bool {
        self.running(port).is_some()
    }

    /// Account frames an external transmitter put on the wire for `port`
    pub fn record_tx(&self, port: u16, sent: usize, failed: bool) {
        let Some(soft_port) = self.ports.get(port as usize) else {
            return;
        };
        soft_port
            .stats
            .opackets
            .fetch_add(sent as u64, Ordering::Relaxed);
        if failed {
            soft_port.stats.oerrors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl EthDev for SoftNic {
    fn port_count(&self) -> u16 {
        self.ports.len() as u16
    }

    fn dev_info(&self, port: u16) -> Result<DevInfo> {
        self.port(port)?;
        Ok(self.info.clone())
    }

    fn configure(
        &self,
        port: u16,
        nb_rx_queues: u16,
        nb_tx_queues: u16,
        conf: &PortConf,
    ) -> Result<()> {
        let soft_port = self.port(port)?;
        let fail = |reason: String| -> Result<()> { Err(Error::Device { port, reason }) };

        if soft_port.running.get().is_some() {
            return fail("port already started".to_string());
        }
        if nb_rx_queues == 0 || nb_rx_queues > self.info.max_rx_queues {
            return fail(format!("invalid rx queue count {}", nb_rx_queues));
        }
        if nb_tx_queues == 0 || nb_tx_queues > self.info.max_tx_queues {
            return fail(format!("invalid tx queue count {}", nb_tx_queues));
        }
        if conf.rx_mq_mode == RxMqMode::VmdqOnly {
            let tier = conf.tier();
            if tier.pool_count() > self.info.max_vmdq_pools {
                return fail(format!(
                    "{} pools exceed device maximum {}",
                    tier.pool_count(),
                    self.info.max_vmdq_pools
                ));
            }
            if nb_rx_queues != tier.queue_count() {
                return fail(format!(
                    "VMDq with {} pools needs {} rx queues, got {}",
                    tier.pool_count(),
                    tier.queue_count(),
                    nb_rx_queues
                ));
            }
        }

        let mut setup = soft_port.setup.lock();
        setup.conf = Some(conf.clone());
        setup.rx = (0..nb_rx_queues).map(|_| None).collect();
        setup.tx = vec![None; nb_tx_queues as usize];
        Ok(())
    }

    fn rx_queue_setup(
        &self,
        port: u16,
        queue: u16,
        nb_desc: u16,
        _conf: &RxQueueConf,
        pool: &MbufPool,
    ) -> Result<()> {
        let soft_port = self.port(port)?;
        let mut setup = soft_port.setup.lock();
        let slot = setup.rx.get_mut(queue as usize).ok_or_else(|| Error::Device {
            port,
            reason: format!("rx queue {} not configured", queue),
        })?;
        if nb_desc == 0 {
            return Err(Error::Device {
                port,
                reason: "rx ring needs at least one descriptor".to_string(),
            });
        }
        *slot = Some(RxRing {
            ring: ArrayQueue::new(nb_desc as usize),
            pool: pool.clone(),
        });
        Ok(())
    }

    fn tx_queue_setup(
        &self,
        port: u16,
        queue: u16,
        nb_desc: u16,
        _conf: &TxQueueConf,
    ) -> Result<()> {
        let soft_port = self.port(port)?;
        let mut setup = soft_port.setup.lock();
        let slot = setup.tx.get_mut(queue as usize).ok_or_else(|| Error::Device {
            port,
            reason: format!("tx queue {} not configured", queue),
        })?;
        if nb_desc == 0 {
            return Err(Error::Device {
                port,
                reason: "tx ring needs at least one descriptor".to_string(),
            });
        }
        *slot = Some(nb_desc as usize);
        Ok(())
    }

    fn start(&self, port: u16) -> Result<()> {
        let soft_port = self.port(port)?;
        let mut setup = soft_port.setup.lock();

        let conf = setup.conf.clone().ok_or_else(|| Error::Device {
            port,
            reason: "start before configure".to_string(),
        })?;
        if let Some(q) = setup.rx.iter().position(Option::is_none) {
            return Err(Error::Device {
                port,
                reason: format!("rx queue {} not set up", q),
            });
        }
        if let Some(q) = setup.tx.iter().position(Option::is_none) {
            return Err(Error::Device {
                port,
                reason: format!("tx queue {} not set up", q),
            });
        }

        let rx: Vec<RxRing> = setup.rx.drain(..).flatten().collect();
        let tx = setup
            .tx
            .iter()
            .flatten()
            .map(|&depth| ArrayQueue::new(depth))
            .collect();
        setup.rx = (0..rx.len()).map(|_| None).collect();

        let tier = conf.tier();
        let running = RunningPort {
            vmdq: conf.vmdq_rx,
            queues_per_pool: tier.queues_per_pool(),
            rx,
            tx,
        };
        soft_port.running.set(running).map_err(|_| Error::Device {
            port,
            reason: "port already started".to_string(),
        })
    }

    fn mac_addr(&self, port: u16) -> Result<EtherAddr> {
        Ok(self.port(port)?.mac)
    }

    fn rx_burst(&self, port: u16, queue: u16, pkts: &mut Vec<Mbuf>, max: usize) -> usize {
        let Some(rx) = self.running(port).and_then(|r| r.rx.get(queue as usize)) else {
            return 0;
        };
        let mut count = 0;
        while count < max {
            match rx.ring.pop() {
                Some(m) => {
                    pkts.push(m);
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    fn tx_burst(&self, port: u16, queue: u16, pkts: &mut Vec<Mbuf>) -> usize {
        let Some(soft_port) = self.ports.get(port as usize) else {
            return 0;
        };
        let Some(ring) = soft_port
            .running
            .get()
            .and_then(|r| r.tx.get(queue as usize))
        else {
            return 0;
        };

        // Only this queue's owning core pushes, so free space can only grow
        // between this check and the pushes below.
        let space = ring.capacity() - ring.len();
        let accepted = space.min(pkts.len());
        for m in pkts.drain(..accepted) {
            if ring.push(m).is_err() {
                soft_port.stats.oerrors.fetch_add(1, Ordering::Relaxed);
            }
        }
        soft_port
            .stats
            .opackets
            .fetch_add(accepted as u64, Ordering::Relaxed);
        accepted
    }

    fn stats(&self, port: u16) -> Option<PortStatsSnapshot> {
        self.ports.get(port as usize).map(|p| p.stats.snapshot())
    }
}

/// Frames moved by one [`TrafficGenerator::step`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStep {
    pub injected: usize,
    pub dropped: usize,
    pub drained: usize,
}

/// Wire side of a [`SoftNic`]: feeds VLAN-tagged frames to the ports and
/// consumes whatever they transmit.
pub struct TrafficGenerator {
    nic: Arc<SoftNic>,
    ports: Vec<u16>,
    vlans: u16,
    seq: u32,
    sink: Vec<Mbuf>,
}

impl TrafficGenerator {
    /// Cycle through VLAN tags `0..pool_map_len` of `tier`
    pub fn new(nic: Arc<SoftNic>, ports: Vec<u16>, tier: PoolTier) -> Self {
        Self {
            nic,
            ports,
            vlans: tier.pool_map_len() as u16,
            seq: 0,
            sink: Vec::new(),
        }
    }

    pub fn step(&mut self, frames_per_port: usize) -> TrafficStep {
        let mut step = TrafficStep::default();

        for &port in &self.ports {
            for _ in 0..frames_per_port {
                let vlans = self.vlans as u32;
                let vlan = (self.seq % vlans) as u16;
                // Spread byte advances once per full VLAN cycle, so every
                // queue of a pool sees traffic
                let [_, hi, mid, lo] = (self.seq / vlans).to_be_bytes();
                let frame = ether::build_frame(
                    EtherAddr([0xff; 6]),
                    EtherAddr([0x02, 0xfe, port as u8, hi, mid, lo]),
                    Some(vlan),
                    0x0800,
                    &self.seq.to_be_bytes(),
                );
                self.seq = self.seq.wrapping_add(1);

                if self.nic.inject(port, &frame).is_some() {
                    step.injected += 1;
                } else {
                    step.dropped += 1;
                }
            }
        }

        for &port in &self.ports {
            step.drained += self.nic.drain_tx(port, &mut self.sink);
        }
        self.sink.clear();
        step
    }
}
