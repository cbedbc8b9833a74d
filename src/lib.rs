//! vmdq-fwd - VMDq pool-steered multi-core L2 forwarder
//!
//! Receive traffic is spread over hardware queues by the VLAN pool map, the
//! queues are statically split across pinned worker cores, and every core
//! forwards between paired ports with in-place address rewriting. Buffers
//! move between pool, device and worker by ownership, so each one has exactly
//! one owner at any time.

pub mod cli;
pub mod ether;
pub mod forward;
pub mod memory;
pub mod partition;
pub mod poll;
pub mod stats;
pub mod topology;
pub mod utils;

// Re-export key components
pub use ether::EtherAddr;
pub use forward::{ForwardingContext, LcoreWorker, PortSet, WorkerStats};
pub use memory::{Mbuf, MbufPool};
pub use partition::{CoreAssignment, QueueRange};
pub use poll::{EthDev, SoftNic, SoftNicConfig};
pub use stats::{PoolReport, RxCounters};
pub use topology::PoolTier;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use utils::cpu::CpuAffinity;

/// Error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Device error on port {port}: {reason}")]
    Device { port: u16, reason: String },

    #[error("Memory allocation failed: {0}")]
    MemoryAllocation(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(#[from] std::num::ParseIntError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("System error: {0}")]
    Nix(#[from] nix::Error),

    #[cfg(feature = "pcap")]
    #[error("PCAP error: {0}")]
    Pcap(#[from] pcap::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Run configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bit `i` enables port `i`
    pub port_mask: u32,

    /// Requested VMDq pools, 8 or 64
    pub num_pools: u32,

    /// Lcores running a forwarding loop
    pub lcores: Vec<usize>,

    /// Pin each worker thread to its lcore
    pub pin_lcores: bool,

    /// Rx descriptors per queue
    pub rx_ring_size: u16,

    /// Tx descriptors per queue
    pub tx_ring_size: u16,

    /// Mbufs reserved per device port
    pub mbufs_per_port: usize,

    /// Per-core mbuf cache hint
    pub mbuf_cache_size: usize,

    /// Data room of each mbuf
    pub mbuf_data_size: usize,

    /// Mbufs requested per rx burst
    pub burst_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port_mask: 0,
            num_pools: topology::MAX_POOL_NUM_1G,
            lcores: vec![0],
            pin_lcores: true,
            rx_ring_size: poll::RX_RING_SIZE,
            tx_ring_size: poll::TX_RING_SIZE,
            mbufs_per_port: memory::NUM_MBUFS_PER_PORT,
            mbuf_cache_size: memory::MBUF_CACHE_SIZE,
            mbuf_data_size: memory::MBUF_DATA_SIZE,
            burst_size: poll::MAX_BURST,
        }
    }
}

impl Config {
    /// Load a configuration file; absent fields keep their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Every check that needs no device
    pub fn validate(&self) -> Result<()> {
        if self.port_mask == 0 {
            return Err(Error::InvalidConfig("invalid portmask".to_string()));
        }
        PoolTier::from_pool_count(self.num_pools)?;
        if self.lcores.is_empty() {
            return Err(Error::InvalidConfig("no lcores enabled".to_string()));
        }
        if self.rx_ring_size == 0 || self.tx_ring_size == 0 {
            return Err(Error::InvalidConfig("ring sizes must be non-zero".to_string()));
        }
        if self.mbufs_per_port == 0 {
            return Err(Error::InvalidConfig("mbufs_per_port must be non-zero".to_string()));
        }
        if self.mbuf_data_size < ether::ETHER_HDR_LEN {
            return Err(Error::InvalidConfig(format!(
                "mbuf data size {} cannot hold an Ethernet header",
                self.mbuf_data_size
            )));
        }
        if self.burst_size == 0 || self.burst_size > poll::MAX_BURST {
            return Err(Error::InvalidConfig(format!(
                "burst size must be between 1 and {}",
                poll::MAX_BURST
            )));
        }
        Ok(())
    }
}

/// Forwarder instance: ports initialized, workers not yet running
pub struct Vmdq<D: EthDev + ?Sized + 'static> {
    config: Config,
    dev: Arc<D>,
    ports: PortSet,
    pool: MbufPool,
    ctx: Arc<ForwardingContext>,
    assignments: Vec<CoreAssignment>,
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<WorkerStats>>,
}

impl<D: EthDev + ?Sized + 'static> Vmdq<D> {
    /// Validate, create the mbuf pool and bring up every enabled port
    pub fn new(config: Config, dev: Arc<D>) -> Result<Self> {
        config.validate()?;
        let tier = PoolTier::from_pool_count(config.num_pools)?;
        debug!("{:?}", config);

        let port_count = dev.port_count();
        let ports = PortSet::from_mask(config.port_mask, port_count)?;
        let assignments = partition::plan(tier.queue_count(), &config.lcores)?;
        let nb_tx_queues = assignments.len() as u16;

        let pool_size = config
            .mbufs_per_port
            .checked_mul(port_count as usize)
            .ok_or_else(|| Error::InvalidConfig("mbuf pool size overflow".to_string()))?;
        let pool = MbufPool::new(
            "MBUF_POOL",
            pool_size,
            config.mbuf_data_size,
            config.mbuf_cache_size,
        )?;

        let mut port_addrs = vec![EtherAddr::ZERO; port_count as usize];
        for port in 0..port_count {
            if !ports.contains(port) {
                info!("Skipping disabled port {}", port);
                continue;
            }
            port_addrs[port as usize] =
                poll::port_init(&*dev, port, &config, nb_tx_queues, &pool)?;
        }

        let ctx = Arc::new(ForwardingContext::new(
            ports.pairs(),
            port_addrs,
            tier,
            config.burst_size,
        ));

        Ok(Self {
            config,
            dev,
            ports,
            pool,
            ctx,
            assignments,
            running: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        })
    }

    /// Spawn one pinned forwarding thread per lcore
    pub fn start(&mut self) -> Result<()> {
        if !self.workers.is_empty() {
            return Err(Error::InvalidConfig("forwarder already started".to_string()));
        }
        self.running.store(true, Ordering::Relaxed);

        for &assignment in &self.assignments {
            let mut worker = LcoreWorker::new(self.dev.clone(), self.ctx.clone(), assignment);
            let running = self.running.clone();
            let pin = self.config.pin_lcores;

            let spawned = thread::Builder::new()
                .name(format!("lcore-{}", assignment.lcore_id))
                .spawn(move || {
                    if pin {
                        let pinned = CpuAffinity::new()
                            .and_then(|a| a.set_thread_affinity(assignment.lcore_id));
                        if let Err(e) = pinned {
                            warn!("lcore {} not pinned: {}", assignment.lcore_id, e);
                        }
                    }
                    worker.run(&running)
                });

            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(e) => {
                    self.stop();
                    return Err(e.into());
                }
            }
        }

        Ok(())
    }

    /// Clear the run flag and join every worker
    pub fn stop(&mut self) -> WorkerStats {
        self.running.store(false, Ordering::Relaxed);

        let mut total = WorkerStats::default();
        for handle in self.workers.drain(..) {
            match handle.join() {
                Ok(stats) => {
                    total.rx += stats.rx;
                    total.tx += stats.tx;
                    total.dropped += stats.dropped;
                }
                Err(_) => error!("forwarding thread panicked"),
            }
        }
        total
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty() && self.running.load(Ordering::Relaxed)
    }

    /// Per-pool rx counters
    pub fn report(&self) -> PoolReport {
        self.ctx.report()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn device(&self) -> &Arc<D> {
        &self.dev
    }

    pub fn ports(&self) -> &PortSet {
        &self.ports
    }

    pub fn pool(&self) -> &MbufPool {
        &self.pool
    }

    pub fn context(&self) -> &Arc<ForwardingContext> {
        &self.ctx
    }

    pub fn assignments(&self) -> &[CoreAssignment] {
        &self.assignments
    }

    pub fn tier(&self) -> PoolTier {
        self.ctx.tier()
    }
}

impl<D: EthDev + ?Sized + 'static> Drop for Vmdq<D> {
    fn drop(&mut self) {
        self.stop();
    }
}
