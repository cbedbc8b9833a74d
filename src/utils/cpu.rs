//! Lcore enumeration and thread pinning

use crate::{Error, Result};
use libc::{cpu_set_t, sched_getaffinity};
use nix::unistd::getpid;

/// Highest lcore id a coremask can name
pub const MAX_LCORE: usize = 64;

/// Highest CPU id plus one that a `cpu_set_t` can hold
const CPU_SET_CAPACITY: usize = libc::CPU_SETSIZE as usize;

/// CPU topology information
#[derive(Debug, Clone)]
pub struct CpuTopology {
    /// Number of CPUs this process may use
    pub num_cores: usize,
    /// CPU ids this process may run on, ascending. Ids can be sparse.
    pub allowed: Vec<usize>,
}

impl CpuTopology {
    pub fn new() -> Result<Self> {
        Ok(Self::from_allowed(current_affinity()?))
    }

    /// Topology for an explicit set of allowed CPU ids
    pub fn from_allowed(mut allowed: Vec<usize>) -> Self {
        allowed.sort_unstable();
        allowed.dedup();
        let num_cores = if allowed.is_empty() {
            num_cpus::get()
        } else {
            allowed.len()
        };
        Self { num_cores, allowed }
    }

    /// Lcores a run uses when none are requested: every CPU the process is
    /// allowed on.
    pub fn default_lcores(&self) -> Vec<usize> {
        if self.allowed.is_empty() {
            (0..self.num_cores).collect()
        } else {
            self.allowed.clone()
        }
    }

    pub fn is_allowed(&self, lcore: usize) -> bool {
        self.allowed.contains(&lcore)
    }
}

/// CPU affinity manager
pub struct CpuAffinity {
    topology: CpuTopology,
}

impl CpuAffinity {
    pub fn new() -> Result<Self> {
        Ok(Self::with_topology(CpuTopology::new()?))
    }

    pub fn with_topology(topology: CpuTopology) -> Self {
        Self { topology }
    }

    /// Pin the calling thread to one lcore
    pub fn set_thread_affinity(&self, lcore: usize) -> Result<()> {
        if lcore >= CPU_SET_CAPACITY {
            return Err(Error::InvalidConfig(format!(
                "lcore {} out of range (cpu set holds {})",
                lcore, CPU_SET_CAPACITY
            )));
        }
        if !self.topology.allowed.is_empty() && !self.topology.is_allowed(lcore) {
            return Err(Error::InvalidConfig(format!(
                "lcore {} is not in the process affinity mask {:?}",
                lcore, self.topology.allowed
            )));
        }

        let mut cpu_set: cpu_set_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::CPU_SET(lcore, &mut cpu_set);
        }

        let result = unsafe {
            libc::pthread_setaffinity_np(
                libc::pthread_self(),
                std::mem::size_of::<cpu_set_t>(),
                &cpu_set as *const cpu_set_t,
            )
        };

        if result != 0 {
            return Err(Error::IoError(std::io::Error::from_raw_os_error(result)));
        }

        Ok(())
    }

    pub fn topology(&self) -> &CpuTopology {
        &self.topology
    }
}

fn current_affinity() -> Result<Vec<usize>> {
    let mut cpu_set: cpu_set_t = unsafe { std::mem::zeroed() };

    let result = unsafe {
        sched_getaffinity(
            getpid().as_raw(),
            std::mem::size_of::<cpu_set_t>(),
            &mut cpu_set as *mut cpu_set_t,
        )
    };

    if result != 0 {
        return Err(Error::IoError(std::io::Error::last_os_error()));
    }

    Ok((0..CPU_SET_CAPACITY)
        .filter(|&i| unsafe { libc::CPU_ISSET(i, &cpu_set) })
        .collect())
}

/// Lcore ids named by a coremask, ascending
pub fn lcores_from_mask(mask: u64) -> Vec<usize> {
    (0..MAX_LCORE).filter(|&i| mask & (1u64 << i) != 0).collect()
}

/// Parse a hexadecimal mask with an optional `0x` prefix
pub fn parse_hex_mask(s: &str) -> Result<u64> {
    let digits = s
        .trim()
        .strip_prefix("0x")
        .or_else(|| s.trim().strip_prefix("0X"))
        .unwrap_or_else(|| s.trim());
    if digits.is_empty() {
        return Err(Error::InvalidConfig(format!("invalid mask '{}'", s)));
    }
    Ok(u64::from_str_radix(digits, 16)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_topology() {
        let topology = CpuTopology::new().unwrap();
        assert!(topology.num_cores > 0);
        assert!(!topology.default_lcores().is_empty());
    }

    #[test]
    fn test_pin_to_allowed_core() {
        let affinity = CpuAffinity::new().unwrap();
        let lcore = affinity.topology().default_lcores()[0];
        std::thread::spawn(move || affinity.set_thread_affinity(lcore).unwrap())
            .join()
            .unwrap();
    }

    #[test]
    fn test_sparse_allowed_set() {
        let topology = CpuTopology::from_allowed(vec![3, 2, 3]);
        assert_eq!(topology.num_cores, 2);
        assert_eq!(topology.default_lcores(), vec![2, 3]);
        assert!(topology.is_allowed(3));
        assert!(!topology.is_allowed(0));

        let affinity = CpuAffinity::with_topology(topology);
        let err = affinity.set_thread_affinity(0).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_current_affinity_matches_default_lcores() {
        let topology = CpuTopology::new().unwrap();
        let allowed = current_affinity().unwrap();
        assert!(!allowed.is_empty());
        assert_eq!(topology.default_lcores(), allowed);
    }

    #[test]
    fn test_pin_out_of_range() {
        let affinity = CpuAffinity::new().unwrap();
        assert!(affinity.set_thread_affinity(100_000).is_err());
    }

    #[test]
    fn test_lcores_from_mask() {
        assert_eq!(lcores_from_mask(0x1), vec![0]);
        assert_eq!(lcores_from_mask(0xa), vec![1, 3]);
        assert_eq!(lcores_from_mask(1 << 63), vec![63]);
        assert!(lcores_from_mask(0).is_empty());
    }

    #[test]
    fn test_parse_hex_mask() {
        assert_eq!(parse_hex_mask("f").unwrap(), 0xf);
        assert_eq!(parse_hex_mask("0x3").unwrap(), 3);
        assert_eq!(parse_hex_mask("0XFF").unwrap(), 0xff);
        assert!(parse_hex_mask("0x").is_err());
        assert!(parse_hex_mask("zz").is_err());
    }
}
