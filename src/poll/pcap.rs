//! libpcap-backed ports
//!
//! Each port is bound to one network interface. A reader thread per port
//! captures frames and runs them through the same VMDq steering as
//! [`SoftNic`]; transmission injects frames straight onto the interface.
//!
//! Readers only capture inbound frames, so what a port sends is never seen
//! again as received traffic. Every core transmitting on a port shares that
//! port's single send handle; the tx queue index is ignored and sends are
//! serialized by the handle's lock.

use super::{DevInfo, EthDev, PortStatsSnapshot, SoftNic, SoftNicConfig};
use crate::{
    ether::EtherAddr,
    memory::{Mbuf, MbufPool, MBUF_DATA_SIZE},
    topology::{PortConf, RxQueueConf, TxQueueConf},
    Error, Result,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use pcap::{Active, Capture, Device, Direction};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

struct PcapPort {
    iface: String,
    tx: Mutex<Capture<Active>>,
}

/// NIC made of one pcap handle pair per interface
pub struct PcapNic {
    soft: Arc<SoftNic>,
    ports: Vec<PcapPort>,
    running: Arc<AtomicBool>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

fn open_capture(iface: &str, timeout_ms: i32) -> Result<Capture<Active>> {
    let capture = Capture::from_device(iface)?
        .promisc(true)
        .snaplen(MBUF_DATA_SIZE as i32)
        .timeout(timeout_ms)
        .open()?;
    Ok(capture)
}

/// Capture handle that delivers received frames only
fn open_reader(iface: &str) -> Result<Capture<Active>> {
    let capture = open_capture(iface, 1)?;
    capture.direction(Direction::In)?;
    Ok(capture)
}

fn iface_addr(iface: &str, port: u16) -> EtherAddr {
    fs::read_to_string(format!("/sys/class/net/{}/address", iface))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or_else(|| {
            debug!("No hardware address for {}, using a synthetic one", iface);
            EtherAddr::synthetic(port)
        })
}

impl PcapNic {
    /// Bind ports `0..ifaces.len()` to the given interfaces, in order
    pub fn new(ifaces: &[String], max_vmdq_pools: u32) -> Result<Self> {
        let available: Vec<String> = Device::list()?.into_iter().map(|d| d.name).collect();

        let mut ports = Vec::with_capacity(ifaces.len());
        let mut macs = Vec::with_capacity(ifaces.len());
        for (port, iface) in ifaces.iter().enumerate() {
            if !available.iter().any(|name| name == iface) {
                return Err(Error::InvalidConfig(format!("Interface '{}' not found", iface)));
            }
            macs.push(iface_addr(iface, port as u16));
            ports.push(PcapPort {
                iface: iface.clone(),
                tx: Mutex::new(open_capture(iface, 0)?),
            });
        }

        let soft = SoftNic::with_macs(
            SoftNicConfig {
                ports: ports.len() as u16,
                max_vmdq_pools,
                ..SoftNicConfig::default()
            },
            macs,
        );

        Ok(Self {
            soft: Arc::new(soft),
            ports,
            running: Arc::new(AtomicBool::new(true)),
            readers: Mutex::new(Vec::new()),
        })
    }

    fn spawn_reader(&self, port: u16) -> Result<()> {
        let iface = self.ports[port as usize].iface.clone();
        let mut capture = open_reader(&iface)?;
        let soft = self.soft.clone();
        let running = self.running.clone();

        let handle = thread::Builder::new()
            .name(format!("pcap-rx-{}", port))
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    match capture.next_packet() {
                        Ok(packet) => {
                            soft.inject(port, packet.data);
                        }
                        Err(pcap::Error::TimeoutExpired) => continue,
                        Err(e) => {
                            warn!("Capture on {} stopped: {}", iface, e);
                            break;
                        }
                    }
                }
            })?;
        self.readers.lock().push(handle);
        Ok(())
    }

    /// Stop and join all reader threads
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        for handle in self.readers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for PcapNic {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl EthDev for PcapNic {
    fn port_count(&self) -> u16 {
        self.soft.port_count()
    }

    fn dev_info(&self, port: u16) -> Result<DevInfo> {
        let mut info = self.soft.dev_info(port)?;
        info.driver_name = "pcap".to_string();
        Ok(info)
    }

    fn configure(
        &self,
        port: u16,
        nb_rx_queues: u16,
        nb_tx_queues: u16,
        conf: &PortConf,
    ) -> Result<()> {
        self.soft.configure(port, nb_rx_queues, nb_tx_queues, conf)
    }

    fn rx_queue_setup(
        &self,
        port: u16,
        queue: u16,
        nb_desc: u16,
        conf: &RxQueueConf,
        pool: &MbufPool,
    ) -> Result<()> {
        self.soft.rx_queue_setup(port, queue, nb_desc, conf, pool)
    }

    fn tx_queue_setup(
        &self,
        port: u16,
        queue: u16,
        nb_desc: u16,
        conf: &TxQueueConf,
    ) -> Result<()> {
        self.soft.tx_queue_setup(port, queue, nb_desc, conf)
    }

    fn start(&self, port: u16) -> Result<()> {
        self.soft.start(port)?;
        self.spawn_reader(port)?;
        info!("Port {} bound to {}", port, self.ports[port as usize].iface);
        Ok(())
    }

    fn mac_addr(&self, port: u16) -> Result<EtherAddr> {
        self.soft.mac_addr(port)
    }

    fn rx_burst(&self, port: u16, queue: u16, pkts: &mut Vec<Mbuf>, max: usize) -> usize {
        self.soft.rx_burst(port, queue, pkts, max)
    }

    fn tx_burst(&self, port: u16, _queue: u16, pkts: &mut Vec<Mbuf>) -> usize {
        let Some(pcap_port) = self.ports.get(port as usize) else {
            return 0;
        };
        let mut capture = pcap_port.tx.lock();

        let mut sent = 0;
        let mut failed = false;
        for mbuf in pkts.iter() {
            if let Err(e) = capture.sendpacket(mbuf.data()) {
                debug!("Send on {} failed: {}", pcap_port.iface, e);
                failed = true;
                break;
            }
            sent += 1;
        }
        drop(capture);
        self.soft.record_tx(port, sent, failed);

        // sendpacket copies, so accepted buffers can go straight back to the pool
        pkts.drain(..sent);
        sent
    }

    fn stats(&self, port: u16) -> Option<PortStatsSnapshot> {
        self.soft.stats(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ether;
    use crate::topology::{build_port_conf, PoolTier};

    // Needs CAP_NET_RAW and a loopback interface named `lo`.
    #[test]
    #[ignore]
    fn test_loopback_port_counts_sends() {
        let nic = PcapNic::new(&["lo".to_string()], 64).unwrap();
        let pool = MbufPool::new("pcap_lo", 64, 2048, 0).unwrap();
        let tier = PoolTier::Pools8;
        nic.configure(0, tier.queue_count(), 1, &build_port_conf(tier))
            .unwrap();
        for q in 0..tier.queue_count() {
            nic.rx_queue_setup(0, q, 16, &RxQueueConf::default(), &pool)
                .unwrap();
        }
        nic.tx_queue_setup(0, 0, 16, &TxQueueConf::default())
            .unwrap();
        nic.start(0).unwrap();

        let frame = ether::build_frame(
            EtherAddr([0xff; 6]),
            EtherAddr([0x02, 0, 0, 0, 0, 9]),
            Some(1),
            0x0800,
            &[0u8; 46],
        );
        let mut pkts = Vec::new();
        for _ in 0..4 {
            let mut m = pool.alloc().unwrap();
            m.append(&frame).unwrap();
            pkts.push(m);
        }
        assert_eq!(nic.tx_burst(0, 0, &mut pkts), 4);
        assert!(pkts.is_empty());

        let stats = nic.stats(0).unwrap();
        assert_eq!(stats.opackets, 4);
        assert_eq!(stats.oerrors, 0);
        nic.shutdown();
    }

    #[test]
    #[ignore]
    fn test_reader_capture_is_inbound_only() {
        let capture = open_reader("lo").unwrap();
        // Setting the same direction again is accepted once the filter is live
        capture.direction(Direction::In).unwrap();
    }
}
