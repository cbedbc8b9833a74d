//! Poll mode device layer
//!
//! [`EthDev`] is the boundary between the forwarding core and whatever moves
//! frames on and off the wire. Setup calls return errors that are fatal at
//! startup; the burst calls never fail and never block, a short count is the
//! only runtime signal.

use crate::{
    ether::EtherAddr,
    memory::{Mbuf, MbufPool},
    topology::{self, PortConf, RxQueueConf, TxQueueConf},
    Config, Error, Result,
};
use log::info;
use std::sync::atomic::{AtomicU64, Ordering};

pub mod soft;
#[cfg(feature = "pcap")]
pub mod pcap;

pub use soft::{SoftNic, SoftNicConfig, TrafficGenerator, TrafficStep};

/// Maximum number of mbufs moved by one burst call
pub const MAX_BURST: usize = 32;

/// Default rx ring descriptors
pub const RX_RING_SIZE: u16 = 128;

/// Default tx ring descriptors
pub const TX_RING_SIZE: u16 = 512;

/// Static device capabilities
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevInfo {
    pub driver_name: String,
    pub max_vmdq_pools: u32,
    pub max_rx_queues: u16,
    pub max_tx_queues: u16,
}

/// Per-port counters maintained by a device
#[derive(Debug, Default)]
pub struct PortStats {
    pub ipackets: AtomicU64,
    pub opackets: AtomicU64,
    pub imissed: AtomicU64,
    pub oerrors: AtomicU64,
}

impl PortStats {
    pub fn snapshot(&self) -> PortStatsSnapshot {
        PortStatsSnapshot {
            ipackets: self.ipackets.load(Ordering::Relaxed),
            opackets: self.opackets.load(Ordering::Relaxed),
            imissed: self.imissed.load(Ordering::Relaxed),
            oerrors: self.oerrors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStatsSnapshot {
    pub ipackets: u64,
    pub opackets: u64,
    pub imissed: u64,
    pub oerrors: u64,
}

/// Ethernet device layer
pub trait EthDev: Send + Sync {
    /// Number of ports the device layer exposes
    fn port_count(&self) -> u16;

    fn dev_info(&self, port: u16) -> Result<DevInfo>;

    fn configure(&self, port: u16, nb_rx_queues: u16, nb_tx_queues: u16, conf: &PortConf)
        -> Result<()>;

    fn rx_queue_setup(
        &self,
        port: u16,
        queue: u16,
        nb_desc: u16,
        conf: &RxQueueConf,
        pool: &MbufPool,
    ) -> Result<()>;

    fn tx_queue_setup(&self, port: u16, queue: u16, nb_desc: u16, conf: &TxQueueConf)
        -> Result<()>;

    fn start(&self, port: u16) -> Result<()>;

    /// Hardware address of a port
    fn mac_addr(&self, port: u16) -> Result<EtherAddr>;

    /// Append up to `max` received mbufs to `pkts`, returning how many were added.
    fn rx_burst(&self, port: u16, queue: u16, pkts: &mut Vec<Mbuf>, max: usize) -> usize;

    /// Submit `pkts` for transmission.
    ///
    /// The device takes ownership of the first `n` mbufs and removes them from
    /// `pkts`; the rest stay with the caller. Returns `n`.
    fn tx_burst(&self, port: u16, queue: u16, pkts: &mut Vec<Mbuf>) -> usize;

    fn stats(&self, _port: u16) -> Option<PortStatsSnapshot> {
        None
    }
}

/// Bring up one port: validate pools, configure, set up every queue, start,
/// and read back its address.
pub fn port_init<D: EthDev + ?Sized>(
    dev: &D,
    port: u16,
    config: &Config,
    nb_tx_queues: u16,
    pool: &MbufPool,
) -> Result<EtherAddr> {
    if port >= dev.port_count() {
        return Err(Error::Device {
            port,
            reason: format!("port does not exist ({} available)", dev.port_count()),
        });
    }

    let info = dev.dev_info(port)?;
    let tier = topology::validate_num_pools(config.num_pools, info.max_vmdq_pools)?;
    let port_conf = topology::build_port_conf(tier);
    let nb_rx_queues = tier.queue_count();

    dev.configure(port, nb_rx_queues, nb_tx_queues, &port_conf)?;

    let rx_conf = RxQueueConf::default();
    for q in 0..nb_rx_queues {
        dev.rx_queue_setup(port, q, config.rx_ring_size, &rx_conf, pool)?;
    }

    let tx_conf = TxQueueConf::default();
    for q in 0..nb_tx_queues {
        dev.tx_queue_setup(port, q, config.tx_ring_size, &tx_conf)?;
    }

    dev.start(port)?;

    let addr = dev.mac_addr(port)?;
    info!("Port {} MAC: {}", port, addr);
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::PoolTier;

    fn small_config(num_pools: u32) -> Config {
        Config {
            num_pools,
            rx_ring_size: 16,
            tx_ring_size: 16,
            ..Config::default()
        }
    }

    #[test]
    fn test_port_init_soft_nic() {
        let nic = SoftNic::new(SoftNicConfig {
            ports: 2,
            max_vmdq_pools: 64,
            ..SoftNicConfig::default()
        });
        let pool = MbufPool::new("test_port_init", 256, 256, 0).unwrap();

        let addr = port_init(&nic, 0, &small_config(8), 2, &pool).unwrap();
        assert_eq!(addr, nic.mac_addr(0).unwrap());
        assert_eq!(nic.rx_queue_count(0), Some(PoolTier::Pools8.queue_count()));
        assert_eq!(nic.tx_queue_count(0), Some(2));
    }

    #[test]
    fn test_port_init_rejects_pools_above_device_max() {
        let nic = SoftNic::new(SoftNicConfig {
            ports: 2,
            max_vmdq_pools: 8,
            ..SoftNicConfig::default()
        });
        let pool = MbufPool::new("test_port_init_max", 64, 256, 0).unwrap();

        let err = port_init(&nic, 0, &small_config(64), 1, &pool).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert_eq!(nic.rx_queue_count(0), None);
    }

    #[test]
    fn test_port_init_missing_port() {
        let nic = SoftNic::new(SoftNicConfig::default());
        let pool = MbufPool::new("test_port_init_missing", 64, 256, 0).unwrap();
        let err = port_init(&nic, 9, &small_config(8), 1, &pool).unwrap_err();
        assert!(matches!(err, Error::Device { port: 9, .. }));
    }
}
