//! Process-level helpers: CPU pinning, logging and signal handling

pub mod cpu;
pub mod logging;
pub mod signals;
