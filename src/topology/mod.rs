//! VMDq pool topology: tier validation and port configuration building
//!
//! Only two pool layouts are supported by the hardware this targets. A pool
//! count either names one of them exactly or the configuration is rejected;
//! there is no interpolation between tiers.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pool count of the 1G tier (i350, 82580, 82576)
pub const MAX_POOL_NUM_1G: u32 = 8;
/// Pool count of the 10G tier (82599)
pub const MAX_POOL_NUM_10G: u32 = 64;

/// Receive queue count of the 1G tier
pub const MAX_QUEUE_NUM_1G: u16 = 8;
/// Receive queue count of the 10G tier
pub const MAX_QUEUE_NUM_10G: u16 = 128;

/// Pool-map entries of the 1G tier
pub const MAX_POOL_MAP_NUM_1G: usize = 32;
/// Pool-map entries of the 10G tier
pub const MAX_POOL_MAP_NUM_10G: usize = 64;

/// Rx descriptor thresholds
pub const RX_PTHRESH: u8 = 8;
pub const RX_HTHRESH: u8 = 8;
pub const RX_WTHRESH: u8 = 4;

/// Tx descriptor thresholds
pub const TX_PTHRESH: u8 = 36;
pub const TX_HTHRESH: u8 = 0;
pub const TX_WTHRESH: u8 = 0;

/// A hardware-supported pool layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolTier {
    /// 8 pools, 8 queues, 32 map entries
    Pools8,
    /// 64 pools, 128 queues, 64 map entries
    Pools64,
}

impl PoolTier {
    /// Match a requested pool count against the supported tiers.
    ///
    /// This needs no device and is run while the configuration is validated,
    /// so an unsupported count fails before any port is touched.
    pub fn from_pool_count(num_pools: u32) -> Result<Self> {
        match num_pools {
            MAX_POOL_NUM_1G => Ok(PoolTier::Pools8),
            MAX_POOL_NUM_10G => Ok(PoolTier::Pools64),
            _ => Err(Error::InvalidConfig(format!(
                "invalid number of pools: {} (supported: {} or {})",
                num_pools, MAX_POOL_NUM_1G, MAX_POOL_NUM_10G
            ))),
        }
    }

    pub fn pool_count(self) -> u32 {
        match self {
            PoolTier::Pools8 => MAX_POOL_NUM_1G,
            PoolTier::Pools64 => MAX_POOL_NUM_10G,
        }
    }

    pub fn queue_count(self) -> u16 {
        match self {
            PoolTier::Pools8 => MAX_QUEUE_NUM_1G,
            PoolTier::Pools64 => MAX_QUEUE_NUM_10G,
        }
    }

    pub fn pool_map_len(self) -> usize {
        match self {
            PoolTier::Pools8 => MAX_POOL_MAP_NUM_1G,
            PoolTier::Pools64 => MAX_POOL_MAP_NUM_10G,
        }
    }

    /// Consecutive receive queues owned by one pool
    pub fn queues_per_pool(self) -> u16 {
        self.queue_count() / self.pool_count() as u16
    }
}

impl fmt::Display for PoolTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} pools / {} queues / {} map entries",
            self.pool_count(),
            self.queue_count(),
            self.pool_map_len()
        )
    }
}

/// Validate a requested pool count against the device maximum.
///
/// Succeeds only when the count is one of the two tiers and does not exceed
/// what the device reports.
pub fn validate_num_pools(num_pools: u32, max_nb_pools: u32) -> Result<PoolTier> {
    if num_pools > max_nb_pools {
        return Err(Error::InvalidConfig(format!(
            "invalid number of pools: {} exceeds device maximum {}",
            num_pools, max_nb_pools
        )));
    }
    PoolTier::from_pool_count(num_pools)
}

/// VLAN tag to pool bitmask mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMapEntry {
    pub vlan_id: u16,
    pub pools: u64,
}

/// Receive multi-queue mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RxMqMode {
    None,
    VmdqOnly,
}

/// Transmit multi-queue mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxMqMode {
    None,
}

/// VMDq receive configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmdqRxConf {
    pub tier: PoolTier,
    pub enable_default_pool: bool,
    pub default_pool: u8,
    pub pool_map: Vec<PoolMapEntry>,
}

impl VmdqRxConf {
    /// Pool selected for a VLAN tag, if any map entry covers it.
    ///
    /// The lowest set bit of the matching entry wins.
    pub fn pool_for_vlan(&self, vlan_id: u16) -> Option<u32> {
        self.pool_map
            .iter()
            .find(|entry| entry.vlan_id == vlan_id)
            .filter(|entry| entry.pools != 0)
            .map(|entry| entry.pools.trailing_zeros())
    }
}

/// Port-level configuration handed to the device layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConf {
    pub rx_mq_mode: RxMqMode,
    pub tx_mq_mode: TxMqMode,
    pub hw_ip_checksum: bool,
    pub hw_vlan_filter: bool,
    pub jumbo_frame: bool,
    pub vmdq_rx: VmdqRxConf,
}

impl PortConf {
    pub fn tier(&self) -> PoolTier {
        self.vmdq_rx.tier
    }

    pub fn queue_count(&self) -> u16 {
        self.vmdq_rx.tier.queue_count()
    }
}

/// Descriptor prefetch/host/write-back thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingThresholds {
    pub pthresh: u8,
    pub hthresh: u8,
    pub wthresh: u8,
}

/// Receive queue setup parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RxQueueConf {
    pub thresh: RingThresholds,
    pub drop_en: bool,
}

impl Default for RxQueueConf {
    fn default() -> Self {
        Self {
            thresh: RingThresholds {
                pthresh: RX_PTHRESH,
                hthresh: RX_HTHRESH,
                wthresh: RX_WTHRESH,
            },
            drop_en: true,
        }
    }
}

/// Transmit queue setup parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxQueueConf {
    pub thresh: RingThresholds,
}

impl Default for TxQueueConf {
    fn default() -> Self {
        Self {
            thresh: RingThresholds {
                pthresh: TX_PTHRESH,
                hthresh: TX_HTHRESH,
                wthresh: TX_WTHRESH,
            },
        }
    }
}

/// Build the VLAN pool map for a tier.
///
/// Entry `i` carries VLAN tag `i` and selects pool `i mod pool_count`.
pub fn build_pool_map(tier: PoolTier) -> Vec<PoolMapEntry> {
    let pools = tier.pool_count() as usize;
    (0..tier.pool_map_len())
        .map(|i| PoolMapEntry {
            vlan_id: i as u16,
            pools: 1u64 << (i % pools),
        })
        .collect()
}

/// Build the full port configuration for a validated tier
pub fn build_port_conf(tier: PoolTier) -> PortConf {
    PortConf {
        rx_mq_mode: RxMqMode::VmdqOnly,
        tx_mq_mode: TxMqMode::None,
        hw_ip_checksum: false,
        hw_vlan_filter: false,
        jumbo_frame: false,
        vmdq_rx: VmdqRxConf {
            tier,
            enable_default_pool: false,
            default_pool: 0,
            pool_map: build_pool_map(tier),
        },
    }
}
