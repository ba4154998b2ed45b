//! simnix: a teaching kernel on a simulated machine.
//!
//! The kernel schedules processes over a multi-level ready queue, pages their address
//! spaces on demand with a second-chance replacement policy, and keeps a hierarchical
//! file system on the simulated disks. Process bodies are ordinary closures that make
//! system calls through the [`Kernel`] they are handed.

/// Kernel subsystems and the simulated hardware they run on
pub mod internal;
pub mod workloads;

pub use internal::hw::{Hardware, MachineConfig, SimMachine};
pub use internal::kernel::{Kernel, KernelConfig, KernelError};
pub use internal::process::{Pid, ProcessEntry, ProcessTarget};
pub use internal::syscall::{ErrorCode, SyscallReturn, SyscallValue, SystemCall};

use std::io::Write;

use conquer_once::spin::OnceCell;
use log::{Level, LevelFilter, Metadata, Record};

/// Writes log records to stderr, tagged with the level and the simulated context
pub struct KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= LOG_LEVEL
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let (tag, color) = match record.level() {
            Level::Error => ("ERROR", "\x1b[91m"),
            Level::Warn => ("WARN", "\x1b[93m"),
            Level::Info => ("INFO", "\x1b[94m"),
            Level::Debug => ("DEBUG", "\x1b[92m"),
            Level::Trace => ("TRACE", "\x1b[96m"),
        };
        let padding = match record.level() {
            Level::Warn | Level::Info => " ",
            _ => "",
        };
        let thread = std::thread::current();
        let context = thread.name().unwrap_or("boot");

        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(
            stderr,
            "[ {}{}\x1b[0m{} ] [{}] {}",
            color,
            tag,
            padding,
            context,
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

#[cfg(feature = "trace_log")]
const LOG_LEVEL: LevelFilter = LevelFilter::Trace;

#[cfg(all(feature = "debug_log", not(feature = "trace_log")))]
const LOG_LEVEL: LevelFilter = LevelFilter::Debug;

#[cfg(all(
    feature = "warn_log",
    not(any(feature = "trace_log", feature = "debug_log"))
))]
const LOG_LEVEL: LevelFilter = LevelFilter::Warn;

#[cfg(all(
    feature = "error_log",
    not(any(feature = "trace_log", feature = "debug_log", feature = "warn_log"))
))]
const LOG_LEVEL: LevelFilter = LevelFilter::Error;

#[cfg(not(any(
    feature = "trace_log",
    feature = "debug_log",
    feature = "warn_log",
    feature = "error_log"
)))]
const LOG_LEVEL: LevelFilter = LevelFilter::Info;

static LOGGER: OnceCell<KernelLogger> = OnceCell::uninit();

/// Install the kernel logger. Later calls do nothing.
pub fn init_logger() {
    if LOGGER.try_init_once(|| KernelLogger).is_err() {
        return;
    }
    if let Ok(logger) = LOGGER.try_get() {
        if log::set_logger(logger).is_ok() {
            log::set_max_level(LOG_LEVEL);
        }
    }
}
