//! The kernel context: every piece of shared kernel state, each behind its own lock.

use core::fmt::Display;
use std::sync::{Arc, Weak};

use log::info;

use crate::internal::{
    disk::DiskBitmap,
    fs::FsError,
    hw::{DeviceError, FaultKind, Hardware, MAX_NUMBER_OF_DISKS, NUMBER_PHYSICAL_PAGES},
    interrupts::Diagnostics,
    memory::{FrameTable, SWAP_TABLE_SIZE, SwapTable},
    process::{NORMAL_PRIORITY, Pid, ProcessEntry, ProcessTable, report_survivors},
    queue::OrderedQueue,
    scheduler::TimerQueue,
    sync::{KernelLock, LockAddress},
};

/// Kernel tunables
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    /// most processes alive at once
    pub max_processes: usize,
    /// schedule reports printed before going quiet
    pub max_schedule_prints: usize,
    /// disk holding swapped-out pages
    pub swap_disk: usize,
    /// open files per process
    pub max_open_files: usize,
    /// entries in the swap table
    pub swap_slots: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_processes: 15,
            max_schedule_prints: 50,
            swap_disk: 0,
            max_open_files: 16,
            swap_slots: SWAP_TABLE_SIZE,
        }
    }
}

/// Errors returned by kernel operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// an argument was rejected
    BadParam(&'static str),
    /// no process has that id
    UnknownProcess(Pid),
    /// the call needs a running process
    NoRunningProcess,
    /// a device refused the command
    Device(DeviceError),
    /// file system failure
    Fs(FsError),
    /// the process hit a fault that cannot be repaired
    Fault(FaultKind),
}

impl Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            KernelError::BadParam(reason) => write!(f, "Bad parameter: {}", reason),
            KernelError::UnknownProcess(pid) => write!(f, "No process with id {}", pid),
            KernelError::NoRunningProcess => write!(f, "No process is running"),
            KernelError::Device(err) => write!(f, "Device error: {}", err),
            KernelError::Fs(err) => write!(f, "File system error: {}", err),
            KernelError::Fault(kind) => write!(f, "Unrecoverable fault: {:?}", kind),
        }
    }
}

impl From<DeviceError> for KernelError {
    fn from(err: DeviceError) -> Self {
        KernelError::Device(err)
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        KernelError::Fs(err)
    }
}

/// The kernel.
///
/// Created with [`Kernel::boot`]; the lead process is started with [`Kernel::run`]. Process
/// bodies receive a `&Kernel` and make their system calls through it.
pub struct Kernel {
    pub(crate) hw: Arc<dyn Hardware>,
    pub(crate) config: KernelConfig,
    pub(crate) me: Weak<Kernel>,
    pub(crate) processes: KernelLock<ProcessTable>,
    pub(crate) timer: KernelLock<TimerQueue>,
    pub(crate) disk_queue: KernelLock<OrderedQueue<Pid>>,
    pub(crate) ready: KernelLock<OrderedQueue<Pid>>,
    pub(crate) frames: KernelLock<FrameTable>,
    pub(crate) swap: KernelLock<SwapTable>,
    pub(crate) bitmaps: KernelLock<Vec<DiskBitmap>>,
    pub(crate) inodes: KernelLock<u8>,
    pub(crate) diagnostics: Diagnostics,
}

impl Kernel {
    /// Build a kernel on top of `hw`
    pub fn boot(hw: Arc<dyn Hardware>, config: KernelConfig) -> Arc<Kernel> {
        info!(
            "booting: {} processor(s), {} frames, {} disks",
            hw.processor_count(),
            NUMBER_PHYSICAL_PAGES,
            MAX_NUMBER_OF_DISKS
        );
        Arc::new_cyclic(|me| Kernel {
            processes: KernelLock::new(
                LockAddress::Pcb,
                hw.clone(),
                ProcessTable::new(config.max_processes),
            ),
            timer: KernelLock::new(LockAddress::Timer, hw.clone(), TimerQueue::new()),
            disk_queue: KernelLock::new(LockAddress::Disk, hw.clone(), OrderedQueue::new("disk")),
            ready: KernelLock::new(LockAddress::Ready, hw.clone(), OrderedQueue::new("ready")),
            frames: KernelLock::new(
                LockAddress::Frames,
                hw.clone(),
                FrameTable::new(NUMBER_PHYSICAL_PAGES),
            ),
            swap: KernelLock::new(LockAddress::Swap, hw.clone(), SwapTable::new(config.swap_slots)),
            bitmaps: KernelLock::new(
                LockAddress::Bitmap,
                hw.clone(),
                (0..MAX_NUMBER_OF_DISKS).map(|_| DiskBitmap::new()).collect(),
            ),
            inodes: KernelLock::new(LockAddress::FileSystem, hw.clone(), 0),
            diagnostics: Diagnostics::new(config.max_schedule_prints),
            me: me.clone(),
            config,
            hw,
        })
    }

    /// Create the lead process and hand it the processor. Returns once the machine halts.
    pub fn run(&self, name: &str, entry: ProcessEntry) -> Result<(), KernelError> {
        let pid = self.create_process(name, NORMAL_PRIORITY, entry)?;
        info!("starting lead process {} ({})", pid, name);
        self.dispatch();
        info!("machine halted at tick {}", self.hw.clock());
        report_survivors(&self.processes.lock());
        Ok(())
    }

    /// Stop the simulation
    pub fn halt(&self) -> ! {
        info!("halting at tick {}", self.hw.clock());
        self.hw.halt()
    }

    /// Current time, in ticks
    pub fn time(&self) -> u64 {
        self.hw.clock()
    }

    /// Run the machine on `count` processors
    pub fn set_processor_count(&self, count: usize) -> Result<(), KernelError> {
        self.hw.set_processor_count(count)?;
        info!("running on {} processor(s)", count);
        Ok(())
    }

    /// The configuration the kernel was booted with
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// The hardware the kernel runs on
    pub fn hardware(&self) -> &Arc<dyn Hardware> {
        &self.hw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::hw::{MAX_NUMBER_OF_PROCESSORS, SimMachine};

    /// test that the processor count reaches the hardware and bad counts are refused
    #[test]
    fn test_set_processor_count() {
        let kernel = Kernel::boot(Arc::new(SimMachine::default()), KernelConfig::default());
        assert_eq!(kernel.hardware().processor_count(), 1);

        kernel.set_processor_count(MAX_NUMBER_OF_PROCESSORS / 2).unwrap();
        assert_eq!(kernel.hardware().processor_count(), MAX_NUMBER_OF_PROCESSORS / 2);
        assert_eq!(
            kernel.set_processor_count(0),
            Err(KernelError::Device(DeviceError::BadParam))
        );
        assert_eq!(
            kernel.set_processor_count(MAX_NUMBER_OF_PROCESSORS + 1),
            Err(KernelError::Device(DeviceError::BadParam))
        );
        assert_eq!(kernel.hardware().processor_count(), MAX_NUMBER_OF_PROCESSORS / 2);
    }

    /// test that the swap table is sized from the configuration
    #[test]
    fn test_swap_slots_from_config() {
        let config = KernelConfig {
            swap_slots: 3,
            ..KernelConfig::default()
        };
        let kernel = Kernel::boot(Arc::new(SimMachine::default()), config);
        assert!(!kernel.swap.lock().is_full());
        assert_eq!(kernel.config().swap_slots, 3);
    }
}
