//! VMDq forwarder
//!
//! Runs until SIGINT/SIGTERM. SIGHUP prints the per-pool rx counters.

use clap::Parser;
use log::info;
use std::io::{self, Write};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use vmdq_fwd::cli::Args;
use vmdq_fwd::poll::{EthDev, SoftNic, SoftNicConfig, TrafficGenerator};
use vmdq_fwd::utils::cpu::CpuTopology;
use vmdq_fwd::utils::logging::{init_logger, level_from_verbosity};
use vmdq_fwd::utils::signals::{block_report_signal, ReportSignalThread};
use vmdq_fwd::{Config, Error, Result, Vmdq};

/// Frames injected per port and tick when generating soft traffic
const SOFT_TRAFFIC_BURST: usize = 64;

fn main() {
    let args = Args::parse();

    if let Err(e) = init_logger(level_from_verbosity(args.verbose)) {
        eprintln!("Warning: could not set up logging: {}", e);
    }

    if let Err(e) = run(args) {
        println!("{}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    // Before any thread exists, so every thread inherits the mask
    block_report_signal()?;

    let topology = CpuTopology::new()?;
    let config = args.to_config(&topology.default_lcores())?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::Relaxed);
    })
    .map_err(|e| Error::IoError(io::Error::new(io::ErrorKind::Other, e)))?;

    if !args.ifaces.is_empty() {
        return run_pcap(&args, config, &running);
    }

    let nic = Arc::new(SoftNic::new(SoftNicConfig {
        ports: args.soft_ports,
        max_vmdq_pools: args.soft_max_pools,
        ..SoftNicConfig::default()
    }));
    let traffic = args.soft_traffic.then(|| nic.clone());
    forward(config, nic, traffic, &running)
}

#[cfg(feature = "pcap")]
fn run_pcap(args: &Args, config: Config, running: &AtomicBool) -> Result<()> {
    let nic = Arc::new(vmdq_fwd::poll::pcap::PcapNic::new(
        &args.ifaces,
        args.soft_max_pools,
    )?);
    forward(config, nic, None, running)
}

#[cfg(not(feature = "pcap"))]
fn run_pcap(_args: &Args, _config: Config, _running: &AtomicBool) -> Result<()> {
    Err(Error::InvalidConfig(
        "--iface needs a build with the pcap feature".to_string(),
    ))
}

fn forward<D: EthDev + ?Sized + 'static>(
    config: Config,
    dev: Arc<D>,
    traffic: Option<Arc<SoftNic>>,
    running: &AtomicBool,
) -> Result<()> {
    let mut vmdq = Vmdq::new(config, dev)?;

    let ctx = vmdq.context().clone();
    let mut reporter = ReportSignalThread::spawn(move || {
        let mut out = io::stdout().lock();
        let _ = write!(out, "\n{}", ctx.report());
        let _ = out.flush();
    })?;

    let mut generator = traffic.map(|nic| {
        TrafficGenerator::new(nic, vmdq.ports().valid_ports().collect(), vmdq.tier())
    });

    vmdq.start()?;

    while running.load(Ordering::Relaxed) {
        match generator.as_mut() {
            Some(gen) => {
                gen.step(SOFT_TRAFFIC_BURST);
                thread::sleep(Duration::from_millis(1));
            }
            None => thread::sleep(Duration::from_millis(100)),
        }
    }

    let totals = vmdq.stop();
    reporter.shutdown()?;
    info!(
        "Stopped: rx {} tx {} dropped {}",
        totals.rx, totals.tx, totals.dropped
    );
    Ok(())
}
