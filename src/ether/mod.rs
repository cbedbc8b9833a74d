//! Ethernet addressing and in-place header rewriting

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of a MAC address
pub const ETHER_ADDR_LEN: usize = 6;
/// Destination + source + EtherType
pub const ETHER_HDR_LEN: usize = 14;
/// EtherType of an 802.1Q tag
pub const ETHER_TYPE_VLAN: u16 = 0x8100;
/// Lower 12 bits of the TCI
pub const VLAN_ID_MASK: u16 = 0x0fff;

static_assertions::const_assert!(2 * ETHER_ADDR_LEN <= ETHER_HDR_LEN);

/// 48-bit link-layer address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EtherAddr(pub [u8; ETHER_ADDR_LEN]);

impl EtherAddr {
    pub const ZERO: EtherAddr = EtherAddr([0; ETHER_ADDR_LEN]);

    /// Locally administered address `02:00:00:00:00:<port>` used as the
    /// destination of frames forwarded out of `port`.
    pub fn synthetic(port: u16) -> Self {
        EtherAddr([0x02, 0, 0, 0, 0, port as u8])
    }
}

impl fmt::Display for EtherAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for EtherAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut octets = [0u8; ETHER_ADDR_LEN];
        let mut parts = s.trim().split(|c: char| c == ':' || c == '-');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| Error::InvalidConfig(format!("invalid MAC address '{}'", s)))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| Error::InvalidConfig(format!("invalid MAC address '{}'", s)))?;
        }
        if parts.next().is_some() {
            return Err(Error::InvalidConfig(format!("invalid MAC address '{}'", s)));
        }
        Ok(EtherAddr(octets))
    }
}

/// Destination address of a frame, if it is long enough to have one
pub fn dst_addr(frame: &[u8]) -> Option<EtherAddr> {
    frame
        .get(..ETHER_ADDR_LEN)
        .map(|b| EtherAddr([b[0], b[1], b[2], b[3], b[4], b[5]]))
}

/// Source address of a frame, if it is long enough to have one
pub fn src_addr(frame: &[u8]) -> Option<EtherAddr> {
    frame
        .get(ETHER_ADDR_LEN..2 * ETHER_ADDR_LEN)
        .map(|b| EtherAddr([b[0], b[1], b[2], b[3], b[4], b[5]]))
}

/// VLAN TCI of an 802.1Q tagged frame
pub fn vlan_tci(frame: &[u8]) -> Option<u16> {
    let tpid = frame.get(12..14)?;
    if u16::from_be_bytes([tpid[0], tpid[1]]) != ETHER_TYPE_VLAN {
        return None;
    }
    let tci = frame.get(14..16)?;
    Some(u16::from_be_bytes([tci[0], tci[1]]))
}

/// Rewrite both link-layer addresses in place.
///
/// Returns `false` and leaves the frame untouched when it is too short to
/// hold both addresses.
pub fn rewrite_addrs(frame: &mut [u8], dst: EtherAddr, src: EtherAddr) -> bool {
    match frame.get_mut(..2 * ETHER_ADDR_LEN) {
        Some(hdr) => {
            hdr[..ETHER_ADDR_LEN].copy_from_slice(&dst.0);
            hdr[ETHER_ADDR_LEN..].copy_from_slice(&src.0);
            true
        }
        None => false,
    }
}

/// Build an Ethernet frame, optionally 802.1Q tagged, padded to 60 bytes
pub fn build_frame(
    dst: EtherAddr,
    src: EtherAddr,
    vlan_id: Option<u16>,
    ether_type: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ETHER_HDR_LEN + 4 + payload.len());
    frame.extend_from_slice(&dst.0);
    frame.extend_from_slice(&src.0);
    if let Some(id) = vlan_id {
        frame.extend_from_slice(&ETHER_TYPE_VLAN.to_be_bytes());
        frame.extend_from_slice(&(id & VLAN_ID_MASK).to_be_bytes());
    }
    frame.extend_from_slice(&ether_type.to_be_bytes());
    frame.extend_from_slice(payload);
    if frame.len() < 60 {
        frame.resize(60, 0);
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_address() {
        assert_eq!(EtherAddr::synthetic(1).to_string(), "02:00:00:00:00:01");
        assert_eq!(EtherAddr::synthetic(3).0, [0x02, 0, 0, 0, 0, 3]);
        assert_eq!(EtherAddr::synthetic(0).0[0] & 0x02, 0x02);
    }

    #[test]
    fn test_parse_address() {
        let addr: EtherAddr = "52:54:00:ab:cd:EF".parse().unwrap();
        assert_eq!(addr.0, [0x52, 0x54, 0x00, 0xab, 0xcd, 0xef]);
        assert_eq!(addr.to_string(), "52:54:00:ab:cd:ef");
        assert!("52:54:00:ab:cd".parse::<EtherAddr>().is_err());
        assert!("52:54:00:ab:cd:ef:01".parse::<EtherAddr>().is_err());
        assert!("zz:54:00:ab:cd:ef".parse::<EtherAddr>().is_err());
    }

    #[test]
    fn test_rewrite_addrs() {
        let src = EtherAddr([0xaa; 6]);
        let mut frame = build_frame(EtherAddr([0x11; 6]), src, Some(5), 0x0800, b"payload");

        let new_src = EtherAddr([0x52, 0x54, 0, 0, 0, 9]);
        assert!(rewrite_addrs(&mut frame, EtherAddr::synthetic(1), new_src));
        assert_eq!(dst_addr(&frame), Some(EtherAddr::synthetic(1)));
        assert_eq!(src_addr(&frame), Some(new_src));
        assert_eq!(vlan_tci(&frame), Some(5));
        assert_eq!(&frame[18..25], b"payload");
    }

    #[test]
    fn test_rewrite_runt_frame_untouched() {
        let mut runt = vec![0xffu8; 11];
        assert!(!rewrite_addrs(&mut runt, EtherAddr::synthetic(1), EtherAddr::ZERO));
        assert!(runt.iter().all(|&b| b == 0xff));
    }

    #[test]
    fn test_untagged_frame_has_no_vlan() {
        let frame = build_frame(EtherAddr::ZERO, EtherAddr::ZERO, None, 0x0800, &[]);
        assert_eq!(frame.len(), 60);
        assert_eq!(vlan_tci(&frame), None);
    }
}
