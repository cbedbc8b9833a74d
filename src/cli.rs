//! Command line options

use crate::utils::cpu;
use crate::{Config, Error, Result};
use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "vmdq_fwd")]
#[command(about = "Forward VMDq pool-steered traffic between paired ports")]
pub struct Args {
    /// Hexadecimal bitmask of the ports to use
    #[arg(short = 'p', long = "portmask", value_parser = parse_portmask)]
    pub port_mask: Option<u32>,

    /// Number of VMDq pools (8 or 64)
    #[arg(long = "nb-pools")]
    pub nb_pools: Option<u32>,

    /// Hexadecimal bitmask of the lcores running forwarding loops
    #[arg(short = 'c', long = "coremask", value_parser = parse_coremask)]
    pub coremask: Option<u64>,

    /// JSON configuration file; flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Do not pin worker threads
    #[arg(long)]
    pub no_pin: bool,

    /// Ports exposed by the software NIC
    #[arg(long, default_value_t = 4)]
    pub soft_ports: u16,

    /// VMDq pool limit reported by the software NIC
    #[arg(long, default_value_t = 64)]
    pub soft_max_pools: u32,

    /// Feed VLAN-tagged test traffic into the software NIC
    #[arg(long)]
    pub soft_traffic: bool,

    /// Bind ports to these interfaces through libpcap, in port order
    #[arg(long = "iface")]
    pub ifaces: Vec<String>,

    /// Increase log verbosity
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

fn parse_portmask(s: &str) -> std::result::Result<u32, String> {
    let mask = cpu::parse_hex_mask(s).map_err(|e| e.to_string())?;
    u32::try_from(mask).map_err(|_| format!("portmask {} wider than 32 ports", s))
}

fn parse_coremask(s: &str) -> std::result::Result<u64, String> {
    cpu::parse_hex_mask(s).map_err(|e| e.to_string())
}

impl Args {
    /// Merge file, defaults and flags into one configuration.
    ///
    /// `default_lcores` is used when neither the file nor `-c` names any.
    pub fn to_config(&self, default_lcores: &[usize]) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_json_file(path)?,
            None => Config {
                lcores: default_lcores.to_vec(),
                ..Config::default()
            },
        };

        if let Some(mask) = self.port_mask {
            config.port_mask = mask;
        }
        if let Some(pools) = self.nb_pools {
            config.num_pools = pools;
        }
        if let Some(mask) = self.coremask {
            config.lcores = cpu::lcores_from_mask(mask);
            if config.lcores.is_empty() {
                return Err(Error::InvalidConfig("coremask selects no lcores".to_string()));
            }
        }
        if self.no_pin {
            config.pin_lcores = false;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> std::result::Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("vmdq_fwd").chain(args.iter().copied()))
    }

    #[test]
    fn test_parse_portmask_and_pools() {
        let args = parse(&["-p", "0xf", "--nb-pools", "64"]).unwrap();
        assert_eq!(args.port_mask, Some(0xf));
        assert_eq!(args.nb_pools, Some(64));

        let config = args.to_config(&[0]).unwrap();
        assert_eq!(config.port_mask, 0xf);
        assert_eq!(config.num_pools, 64);
        assert_eq!(config.lcores, vec![0]);
    }

    #[test]
    fn test_default_pools_is_8() {
        let config = parse(&["-p", "3"]).unwrap().to_config(&[0, 1]).unwrap();
        assert_eq!(config.num_pools, 8);
        assert_eq!(config.lcores, vec![0, 1]);
    }

    #[test]
    fn test_missing_or_zero_portmask() {
        assert!(parse(&[]).unwrap().to_config(&[0]).is_err());
        assert!(parse(&["-p", "0"]).unwrap().to_config(&[0]).is_err());
    }

    #[test]
    fn test_malformed_arguments() {
        assert!(parse(&["-p", "xyz"]).is_err());
        assert!(parse(&["-p", "1ffffffff"]).is_err());
        assert!(parse(&["-p", "3", "--nb-pools", "eight"]).is_err());
        assert!(parse(&["--bogus"]).is_err());
    }

    #[test]
    fn test_unsupported_pool_count() {
        let err = parse(&["-p", "f", "--nb-pools", "16"])
            .unwrap()
            .to_config(&[0])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_coremask_and_flags() {
        let args = parse(&["-p", "3", "-c", "0x6", "--no-pin", "-vv", "--soft-traffic"]).unwrap();
        assert_eq!(args.verbose, 2);
        assert!(args.soft_traffic);
        let config = args.to_config(&[0]).unwrap();
        assert_eq!(config.lcores, vec![1, 2]);
        assert!(!config.pin_lcores);
        assert!(parse(&["-p", "3", "-c", "0"]).unwrap().to_config(&[0]).is_err());
    }
}
