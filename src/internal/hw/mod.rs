//! The machine the kernel runs on.
//!
//! Everything the kernel knows about the processor, the timer, the disks and physical
//! memory goes through the [`Hardware`] trait. Each call is a synchronous
//! request/response: the kernel asks, the machine answers, and asynchronous events
//! (timer expiry, disk completion) are queued and handed out through
//! [`Hardware::interrupt_info`].

use core::fmt::Display;
use std::sync::Arc;

use bitflags::bitflags;
use spin::Mutex;

/// simulated machine
pub mod sim;

pub use sim::{MachineConfig, SimMachine};

/// Size of a page of memory and of a disk sector, in bytes
pub const PGSIZE: usize = 16;
/// Number of physical frames
pub const NUMBER_PHYSICAL_PAGES: usize = 64;
/// Number of pages in a process address space
pub const NUMBER_VIRTUAL_PAGES: usize = 1024;
/// Number of disk units
pub const MAX_NUMBER_OF_DISKS: usize = 8;
/// Number of addressable sectors on each disk
pub const NUMBER_LOGICAL_SECTORS: usize = 2048;
/// Upper bound for [`Hardware::set_processor_count`]
pub const MAX_NUMBER_OF_PROCESSORS: usize = 8;
/// Number of interlock words available to [`Hardware::read_modify_write`]
pub const NUMBER_OF_INTERLOCKS: usize = 32;

/// Frame-number bits of a page table entry
pub const PTE_FRAME_MASK: u16 = 0x0FFF;

/// One sector of disk, or one page of memory
pub type Sector = [u8; PGSIZE];
/// Disk unit number
pub type DiskId = usize;
/// Handle of an execution context
pub type ContextId = usize;
/// Code run by a context when it is first started
pub type ContextEntry = Box<dyn FnOnce() + Send + 'static>;

bitflags! {
    /// Control bits of a page table entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u16 {
        /// the entry maps a frame
        const VALID = 0x8000;
        /// the page was written since it was mapped
        const MODIFIED = 0x4000;
        /// the page was touched since the bit was last cleared
        const REFERENCED = 0x2000;
    }
}

/// A page table entry: three control bits and a frame number
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageTableEntry(u16);

impl PageTableEntry {
    /// An entry that maps nothing
    pub const INVALID: Self = Self(0);

    /// Build an entry mapping `frame`
    pub fn mapped(frame: usize, flags: PteFlags) -> Self {
        Self(flags.bits() | (frame as u16 & PTE_FRAME_MASK))
    }

    /// Raw bits, as the hardware sees them
    pub fn bits(self) -> u16 {
        self.0
    }

    /// Control bits
    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Whether the entry maps a frame
    pub fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::VALID)
    }

    /// The mapped frame number
    pub fn frame(self) -> usize {
        (self.0 & PTE_FRAME_MASK) as usize
    }

    /// Set control bits
    pub fn insert(&mut self, flags: PteFlags) {
        self.0 |= flags.bits();
    }

    /// Clear control bits
    pub fn remove(&mut self, flags: PteFlags) {
        self.0 &= !flags.bits();
    }
}

/// A page table, shared between the process that owns it and the hardware that
/// translates through it.
#[derive(Debug, Clone)]
pub struct PageTable(Arc<Mutex<Vec<PageTableEntry>>>);

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PageTable {
    /// A page table with every entry invalid
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(vec![PageTableEntry::INVALID; NUMBER_VIRTUAL_PAGES])))
    }

    /// Entry for `page`; pages past the end read as invalid
    pub fn get(&self, page: usize) -> PageTableEntry {
        self.0.lock().get(page).copied().unwrap_or(PageTableEntry::INVALID)
    }

    /// Replace the entry for `page`
    pub fn set(&self, page: usize, entry: PageTableEntry) {
        if let Some(slot) = self.0.lock().get_mut(page) {
            *slot = entry;
        }
    }

    /// Modify the entry for `page` in place
    pub fn update<F: FnOnce(&mut PageTableEntry)>(&self, page: usize, f: F) {
        if let Some(slot) = self.0.lock().get_mut(page) {
            f(slot);
        }
    }

    /// Every valid entry, with its page number
    pub fn valid_pages(&self) -> Vec<(usize, PageTableEntry)> {
        self.0
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_valid())
            .map(|(page, entry)| (page, *entry))
            .collect()
    }

    /// Whether two handles refer to the same table
    pub fn same_table(&self, other: &PageTable) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Errors reported by devices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// no such disk, or other bad argument to the hardware
    BadParam,
    /// disk number out of range
    BadDeviceId,
    /// sector or address out of range
    IllegalAddress,
    /// the disk is still busy with a previous command
    DiskInUse,
    /// a sector was read before it was ever written
    NoPreviousWrite,
}

impl Display for DeviceError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                DeviceError::BadParam => "Bad parameter",
                DeviceError::BadDeviceId => "Bad device id",
                DeviceError::IllegalAddress => "Illegal address",
                DeviceError::DiskInUse => "Disk in use",
                DeviceError::NoPreviousWrite => "Sector was never written",
            }
        )
    }
}

/// State of a disk unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskStatus {
    /// ready for a new command
    Free,
    /// a command is in flight
    InUse,
}

/// The device that raised an interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSource {
    /// the interval timer expired
    Timer,
    /// a disk command completed
    Disk(DiskId),
}

/// A pending interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptInfo {
    /// device that raised it
    pub source: InterruptSource,
    /// completion status of the device operation
    pub status: Result<(), DeviceError>,
}

/// Kind of a fault raised by a memory access or instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// the page is not mapped
    InvalidMemory,
    /// the page table points past physical memory
    InvalidPhysicalMemory,
    /// the processor could not execute the access
    CpuError,
    /// a privileged operation was attempted from a process
    PrivilegedInstruction,
}

/// A fault, with its device-specific status (the page number for
/// [`FaultKind::InvalidMemory`])
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultInfo {
    /// what went wrong
    pub kind: FaultKind,
    /// extra information
    pub status: usize,
}

/// A memory access performed through the current page table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOp {
    /// read a 32-bit word
    Read,
    /// write a 32-bit word
    Write(u32),
}

/// Operation on an interlock word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOp {
    /// set the word if it is clear
    Acquire,
    /// clear the word
    Release,
}

/// The hardware interface
pub trait Hardware: Send + Sync {
    /// Current time, in ticks
    fn clock(&self) -> u64;
    /// Arm the interval timer to fire `delay` ticks from now, replacing any armed timer
    fn start_timer(&self, delay: u64);
    /// Take the next pending interrupt, if any
    fn interrupt_info(&self) -> Option<InterruptInfo>;
    /// Let time pass until something is pending. Returns false when nothing ever will be.
    fn idle(&self) -> bool;

    /// Number of processors in use
    fn processor_count(&self) -> usize;
    /// Change the number of processors in use
    fn set_processor_count(&self, count: usize) -> Result<(), DeviceError>;

    /// Create a context that runs `entry` with `page_table` when first started
    fn init_context(&self, entry: ContextEntry, page_table: PageTable) -> ContextId;
    /// Give the processor to `context`; the caller sleeps until it is started again
    fn start_context(&self, context: ContextId);
    /// The context currently holding the processor
    fn current_context(&self) -> Option<ContextId>;

    /// Start reading `sector` of `disk` into `buf`
    fn disk_read(&self, disk: DiskId, sector: u16, buf: &mut Sector) -> Result<(), DeviceError>;
    /// Start writing `buf` to `sector` of `disk`
    fn disk_write(&self, disk: DiskId, sector: u16, buf: &Sector) -> Result<(), DeviceError>;
    /// Whether `disk` can take a new command
    fn disk_status(&self, disk: DiskId) -> Result<DiskStatus, DeviceError>;
    /// Validate `disk` and return the number of sectors ever written to it
    fn check_disk(&self, disk: DiskId) -> Result<usize, DeviceError>;

    /// Contents of a physical frame
    fn read_physical(&self, frame: usize) -> Sector;
    /// Overwrite a physical frame
    fn write_physical(&self, frame: usize, data: &Sector);
    /// Access a word of memory through the current context's page table
    fn memory_access(&self, address: usize, op: MemoryOp) -> Result<u32, FaultInfo>;

    /// Atomic test-and-set / clear on an interlock word
    fn read_modify_write(&self, address: usize, op: LockOp, wait: bool) -> bool;

    /// Stop the machine
    fn halt(&self) -> !;
    /// Whether the machine has been halted
    fn is_halted(&self) -> bool;
}
