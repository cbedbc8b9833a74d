//! Packet buffer pool backed by a huge-page mapping
//!
//! All mbufs of a pool live in one contiguous mapping created at startup.
//! Free slots are tracked in a lock-free MPMC queue so any core can allocate
//! or release concurrently. An [`Mbuf`] is a move-only handle: dropping it
//! returns its slot to the pool, so a buffer can be released at most once.

use crate::{Error, Result};
use crossbeam_queue::ArrayQueue;
use libc::{c_void, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use nix::unistd::{sysconf, SysconfVar};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Data room of one mbuf
pub const MBUF_DATA_SIZE: usize = 2048;

/// Per-core cache size hint passed to pool creation
pub const MBUF_CACHE_SIZE: usize = 64;

/// 128 queues with 512 descriptors each, per port
pub const NUM_MBUFS_PER_PORT: usize = 128 * 512;

/// Page size information
#[derive(Debug, Clone)]
pub struct PageInfo {
    /// Regular page size (usually 4KB)
    pub regular_size: usize,
    /// Huge page size (usually 2MB)
    pub huge_size: usize,
}

impl PageInfo {
    /// Get system page information
    pub fn new() -> Result<Self> {
        let regular_size = sysconf(SysconfVar::PAGE_SIZE)?.unwrap_or(4096) as usize;

        Ok(Self {
            regular_size,
            huge_size: regular_size * 512,
        })
    }
}

/// An anonymous memory mapping, unmapped on drop
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
    huge: bool,
}

impl MappedRegion {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the mapping is backed by huge pages
    pub fn is_huge(&self) -> bool {
        self.huge
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut c_void, self.len);
        }
    }
}

// The mapping is plain memory; access to disjoint slots is coordinated by the pool.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

/// Huge page memory allocator
pub struct HugePageAllocator {
    page_info: PageInfo,
}

impl HugePageAllocator {
    pub fn new() -> Result<Self> {
        Ok(Self {
            page_info: PageInfo::new()?,
        })
    }

    /// Map `size` bytes, preferring huge pages and falling back to regular ones
    pub fn allocate(&self, size: usize) -> Result<MappedRegion> {
        if size == 0 {
            return Err(Error::MemoryAllocation("zero-sized mapping".to_string()));
        }

        #[cfg(all(feature = "hugepages", target_os = "linux"))]
        {
            let len = round_up(size, self.page_info.huge_size);
            if let Some(ptr) = map_anonymous(len, libc::MAP_HUGETLB) {
                return Ok(MappedRegion {
                    ptr,
                    len,
                    huge: true,
                });
            }
        }

        let len = round_up(size, self.page_info.regular_size);
        map_anonymous(len, 0)
            .map(|ptr| MappedRegion {
                ptr,
                len,
                huge: false,
            })
            .ok_or_else(|| {
                Error::MemoryAllocation(format!(
                    "failed to map {} bytes: {}",
                    len,
                    std::io::Error::last_os_error()
                ))
            })
    }
}

fn round_up(size: usize, align: usize) -> usize {
    ((size + align - 1) / align) * align
}

fn map_anonymous(len: usize, extra_flags: libc::c_int) -> Option<NonNull<u8>> {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS | extra_flags,
            -1,
            0,
        )
    };
    if ptr == MAP_FAILED {
        None
    } else {
        NonNull::new(ptr as *mut u8)
    }
}

bitflags::bitflags! {
    /// Receive-side metadata flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketFlags: u32 {
        /// Frame carried an 802.1Q tag; `vlan_tci` is valid
        const RX_VLAN = 0x01;
        /// Frame was steered by the VMDq pool map
        const RX_VMDQ_STEERED = 0x02;
    }
}

struct PoolShared {
    name: String,
    region: MappedRegion,
    elt_size: usize,
    size: usize,
    cache_size: usize,
    free: ArrayQueue<u32>,
    in_use: AtomicUsize,
    peak_usage: AtomicUsize,
    alloc_failures: AtomicUsize,
}

impl PoolShared {
    fn release(&self, slot: u32) {
        let pushed = self.free.push(slot);
        debug_assert!(pushed.is_ok(), "mbuf slot {} released twice", slot);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A single packet buffer.
///
/// Owned by exactly one stage at a time. Dropping it (or calling
/// [`Mbuf::free`]) returns the slot to the pool it came from.
pub struct Mbuf {
    data: NonNull<u8>,
    len: usize,
    port: u16,
    vlan_tci: u16,
    flags: PacketFlags,
    slot: u32,
    pool: Arc<PoolShared>,
}

// The slot behind `data` is exclusively owned by this handle.
unsafe impl Send for Mbuf {}

impl Mbuf {
    /// Packet bytes
    pub fn data(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }

    /// Mutable packet bytes
    pub fn data_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total data room
    pub fn buf_len(&self) -> usize {
        self.pool.elt_size
    }

    /// Append data to the packet
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        if self.len + data.len() > self.buf_len() {
            return Err(Error::MemoryAllocation("Mbuf overflow".to_string()));
        }

        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.data.as_ptr().add(self.len), data.len());
        }
        self.len += data.len();
        Ok(())
    }

    /// Input port
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    pub fn vlan_tci(&self) -> Option<u16> {
        self.flags.contains(PacketFlags::RX_VLAN).then_some(self.vlan_tci)
    }

    pub fn set_vlan_tci(&mut self, tci: u16) {
        self.vlan_tci = tci;
        self.flags.insert(PacketFlags::RX_VLAN);
    }

    pub fn mark_steered(&mut self) {
        self.flags.insert(PacketFlags::RX_VMDQ_STEERED);
    }

    /// Reset metadata and length
    pub fn reset(&mut self) {
        self.len = 0;
        self.port = 0;
        self.vlan_tci = 0;
        self.flags = PacketFlags::empty();
    }

    /// Release the buffer back to its pool
    pub fn free(self) {
        drop(self);
    }
}

impl Drop for Mbuf {
    fn drop(&mut self) {
        self.pool.release(self.slot);
    }
}

impl fmt::Debug for Mbuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mbuf")
            .field("pool", &self.pool.name)
            .field("slot", &self.slot)
            .field("len", &self.len)
            .field("port", &self.port)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Fixed-capacity, fixed-element-size mbuf pool
#[derive(Clone)]
pub struct MbufPool {
    shared: Arc<PoolShared>,
}

impl MbufPool {
    /// Create a pool of `size` mbufs with `elt_size` bytes of data room each.
    ///
    /// `cache_size` is the per-core cache hint; the free list is lock-free so
    /// the hint is recorded but no per-core cache is kept.
    pub fn new(name: &str, size: usize, elt_size: usize, cache_size: usize) -> Result<Self> {
        if size == 0 || elt_size == 0 {
            return Err(Error::InvalidConfig(format!(
                "mbuf pool '{}' needs a non-zero size and element size",
                name
            )));
        }
        let slots = u32::try_from(size).map_err(|_| {
            Error::InvalidConfig(format!("mbuf pool '{}' too large: {}", name, size))
        })?;

        let total = size.checked_mul(elt_size).ok_or_else(|| {
            Error::MemoryAllocation(format!("mbuf pool '{}' size overflow", name))
        })?;
        let region = HugePageAllocator::new()?.allocate(total)?;

        let free = ArrayQueue::new(size);
        for slot in 0..slots {
            let _ = free.push(slot);
        }

        log::debug!(
            "created mbuf pool '{}': {} x {} bytes ({} KiB, huge pages: {})",
            name,
            size,
            elt_size,
            region.len() / 1024,
            region.is_huge()
        );

        Ok(Self {
            shared: Arc::new(PoolShared {
                name: name.to_string(),
                region,
                elt_size,
                size,
                cache_size,
                free,
                in_use: AtomicUsize::new(0),
                peak_usage: AtomicUsize::new(0),
                alloc_failures: AtomicUsize::new(0),
            }),
        })
    }

    /// Allocate an mbuf from the pool
    pub fn alloc(&self) -> Result<Mbuf> {
        let shared = &self.shared;
        let slot = match shared.free.pop() {
            Some(slot) => slot,
            None => {
                shared.alloc_failures.fetch_add(1, Ordering::Relaxed);
                return Err(Error::MemoryAllocation(format!(
                    "Pool '{}' exhausted",
                    shared.name
                )));
            }
        };

        let in_use = shared.in_use.fetch_add(1, Ordering::Relaxed) + 1;
        shared.peak_usage.fetch_max(in_use, Ordering::Relaxed);

        let data = unsafe { shared.region.as_ptr().add(slot as usize * shared.elt_size) };

        Ok(Mbuf {
            // Non-null: offset inside a successful mapping.
            data: unsafe { NonNull::new_unchecked(data) },
            len: 0,
            port: 0,
            vlan_tci: 0,
            flags: PacketFlags::empty(),
            slot,
            pool: Arc::clone(shared),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn capacity(&self) -> usize {
        self.shared.size
    }

    pub fn elt_size(&self) -> usize {
        self.shared.elt_size
    }

    pub fn cache_size(&self) -> usize {
        self.shared.cache_size
    }

    /// Mbufs currently free
    pub fn available(&self) -> usize {
        self.shared.free.len()
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        let available = shared.free.len();
        PoolStats {
            name: shared.name.clone(),
            size: shared.size,
            buf_size: shared.elt_size,
            available,
            in_use: shared.size - available,
            peak_usage: shared.peak_usage.load(Ordering::Relaxed),
            alloc_failures: shared.alloc_failures.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for MbufPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MbufPool")
            .field("name", &self.shared.name)
            .field("size", &self.shared.size)
            .field("available", &self.available())
            .finish()
    }
}

/// Pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub name: String,
    pub size: usize,
    pub buf_size: usize,
    pub available: usize,
    pub in_use: usize,
    pub peak_usage: usize,
    pub alloc_failures: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_page_info() {
        let info = PageInfo::new().unwrap();
        assert!(info.regular_size > 0);
        assert!(info.huge_size > info.regular_size);
    }

    #[test]
    fn test_region_allocation() {
        let allocator = HugePageAllocator::new().unwrap();
        let region = allocator.allocate(1024).unwrap();
        assert!(region.len() >= 1024);
        assert!(allocator.allocate(0).is_err());
    }

    #[test]
    fn test_mbuf_operations() {
        let pool = MbufPool::new("test_ops", 4, 64, 0).unwrap();
        let mut mbuf = pool.alloc().unwrap();

        let test_data = b"Hello, World!";
        mbuf.append(test_data).unwrap();
        assert_eq!(mbuf.data(), test_data);
        mbuf.data_mut()[0] = b'J';
        assert_eq!(&mbuf.data()[..5], b"Jello");

        assert!(mbuf.append(&[0u8; 64]).is_err());

        mbuf.set_vlan_tci(7);
        assert_eq!(mbuf.vlan_tci(), Some(7));
        mbuf.reset();
        assert_eq!(mbuf.len(), 0);
        assert_eq!(mbuf.vlan_tci(), None);
    }

    #[test]
    fn test_mbuf_pool_exhaustion_and_release() {
        let pool = MbufPool::new("test_exhaust", 16, 128, 8).unwrap();
        let held: Vec<_> = (0..16).map(|_| pool.alloc().unwrap()).collect();
        assert_eq!(pool.available(), 0);
        assert!(pool.alloc().is_err());

        drop(held);
        let stats = pool.stats();
        assert_eq!(stats.size, 16);
        assert_eq!(stats.available, 16);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.peak_usage, 16);
        assert_eq!(stats.alloc_failures, 1);
        assert_eq!(pool.cache_size(), 8);
    }

    #[test]
    fn test_slots_do_not_alias() {
        let pool = MbufPool::new("test_alias", 8, 32, 0).unwrap();
        let mut bufs: Vec<_> = (0..8).map(|_| pool.alloc().unwrap()).collect();
        for (i, m) in bufs.iter_mut().enumerate() {
            m.append(&[i as u8; 32]).unwrap();
        }
        for (i, m) in bufs.iter().enumerate() {
            assert!(m.data().iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    fn test_concurrent_alloc_free() {
        let pool = MbufPool::new("test_mt", 64, 64, 0).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        if let Ok(mut m) = pool.alloc() {
                            m.append(b"x").unwrap();
                            m.free();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.available(), 64);
    }
}
