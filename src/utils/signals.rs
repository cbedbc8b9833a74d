//! SIGHUP-triggered reporting
//!
//! SIGHUP is blocked in every thread and consumed synchronously by one
//! dedicated thread with `sigwait`, so the report callback runs as ordinary
//! code instead of inside a signal handler. [`block_report_signal`] must run
//! on the main thread before any other thread is spawned so that the mask is
//! inherited everywhere.

use crate::Result;
use log::debug;
use nix::sys::signal::{kill, SigSet, Signal};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Signal that requests a stats report
pub const REPORT_SIGNAL: Signal = Signal::SIGHUP;

/// Block the report signal in the calling thread
pub fn block_report_signal() -> Result<SigSet> {
    let mut set = SigSet::empty();
    set.add(REPORT_SIGNAL);
    set.thread_block()?;
    Ok(set)
}

/// Thread that runs a callback for every SIGHUP delivered to the process
pub struct ReportSignalThread {
    active: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReportSignalThread {
    pub fn spawn<F>(on_signal: F) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let thread_active = active.clone();

        let handle = thread::Builder::new()
            .name("stats-signal".to_string())
            .spawn(move || {
                let mut set = SigSet::empty();
                set.add(REPORT_SIGNAL);
                loop {
                    match set.wait() {
                        Ok(signal) => {
                            if !thread_active.load(Ordering::Acquire) {
                                break;
                            }
                            on_signal();
                            debug!("Finished handling signal {}", signal as i32);
                        }
                        Err(e) => {
                            debug!("sigwait failed: {}", e);
                            break;
                        }
                    }
                }
            })?;

        Ok(Self {
            active,
            handle: Some(handle),
        })
    }

    /// Stop the thread by waking it with one last signal
    pub fn shutdown(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.active.store(false, Ordering::Release);
        kill(Pid::this(), REPORT_SIGNAL)?;
        let _ = handle.join();
        Ok(())
    }
}

impl Drop for ReportSignalThread {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
