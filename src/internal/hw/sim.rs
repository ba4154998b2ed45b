use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, PoisonError};

use crossbeam_queue::ArrayQueue;
use hashbrown::HashMap;
use log::{error, trace, warn};
use spin::Mutex;

use super::{
    ContextEntry, ContextId, DeviceError, DiskId, DiskStatus, FaultInfo, FaultKind, Hardware,
    InterruptInfo, InterruptSource, LockOp, MAX_NUMBER_OF_DISKS, MAX_NUMBER_OF_PROCESSORS,
    MemoryOp, NUMBER_LOGICAL_SECTORS, NUMBER_OF_INTERLOCKS, NUMBER_PHYSICAL_PAGES,
    NUMBER_VIRTUAL_PAGES, PGSIZE, PageTable, PteFlags, Sector,
};

/// Size of the pending interrupt queue (one timer plus one completion per disk fits easily)
const INTERRUPT_QUEUE_SIZE: usize = 32;

thread_local! {
    static RUNNING_CONTEXT: Cell<Option<ContextId>> = const { Cell::new(None) };
}

/// Tunables of the simulated machine
#[derive(Debug, Clone, Copy)]
pub struct MachineConfig {
    /// ticks between issuing a disk command and its completion interrupt
    pub disk_latency: u64,
    /// processors in use at power-on
    pub processors: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            disk_latency: 2,
            processors: 1,
        }
    }
}

/// A flag a thread can sleep on until someone hands it over
#[derive(Default)]
struct Baton {
    held: std::sync::Mutex<bool>,
    signal: Condvar,
}

impl Baton {
    fn give(&self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        *held = true;
        self.signal.notify_all();
    }

    fn release(&self) {
        *self.held.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    fn wait(&self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while !*held {
            held = self.signal.wait(held).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

#[derive(Default)]
struct PowerState {
    halted: AtomicBool,
    baton: Baton,
    panic: Mutex<Option<Box<dyn Any + Send>>>,
}

impl PowerState {
    fn stop(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.baton.give();
    }
}

struct ContextSlot {
    entry: Option<ContextEntry>,
    page_table: PageTable,
    baton: Arc<Baton>,
}

struct SimDisk {
    sectors: HashMap<u16, Sector>,
    busy_until: u64,
}

impl SimDisk {
    fn is_busy(&self, now: u64) -> bool {
        now < self.busy_until
    }
}

struct PendingEvent {
    at: u64,
    info: InterruptInfo,
}

/// A software model of the machine.
///
/// Each context runs on its own host thread, but only the one holding the processor is
/// ever awake: [`Hardware::start_context`] hands the processor over and puts the caller
/// to sleep. Time only moves in [`Hardware::idle`] (or [`SimMachine::advance`]), which
/// jumps the clock to the next timer deadline or disk completion and queues the
/// corresponding interrupts.
pub struct SimMachine {
    config: MachineConfig,
    clock: AtomicU64,
    timer: Mutex<Option<u64>>,
    events: Mutex<Vec<PendingEvent>>,
    interrupts: ArrayQueue<InterruptInfo>,
    disks: Mutex<Vec<SimDisk>>,
    memory: Mutex<Vec<Sector>>,
    contexts: Mutex<Vec<ContextSlot>>,
    current: Arc<Mutex<Option<ContextId>>>,
    interlocks: Vec<AtomicBool>,
    processors: AtomicUsize,
    power: Arc<PowerState>,
}

impl Default for SimMachine {
    fn default() -> Self {
        Self::new(MachineConfig::default())
    }
}

impl SimMachine {
    /// Power on a machine with blank disks and zeroed memory
    pub fn new(config: MachineConfig) -> Self {
        Self {
            config,
            clock: AtomicU64::new(0),
            timer: Mutex::new(None),
            events: Mutex::new(Vec::new()),
            interrupts: ArrayQueue::new(INTERRUPT_QUEUE_SIZE),
            disks: Mutex::new(
                (0..MAX_NUMBER_OF_DISKS)
                    .map(|_| SimDisk {
                        sectors: HashMap::new(),
                        busy_until: 0,
                    })
                    .collect(),
            ),
            memory: Mutex::new(vec![[0; PGSIZE]; NUMBER_PHYSICAL_PAGES]),
            contexts: Mutex::new(Vec::new()),
            current: Arc::new(Mutex::new(None)),
            interlocks: (0..NUMBER_OF_INTERLOCKS).map(|_| AtomicBool::new(false)).collect(),
            processors: AtomicUsize::new(config.processors.clamp(1, MAX_NUMBER_OF_PROCESSORS)),
            power: Arc::new(PowerState::default()),
        }
    }

    /// Move the clock forward and queue whatever became due
    pub fn advance(&self, ticks: u64) {
        self.clock.fetch_add(ticks, Ordering::SeqCst);
        self.raise_due();
    }

    /// Absolute time the interval timer will fire at, if armed
    pub fn timer_deadline(&self) -> Option<u64> {
        *self.timer.lock()
    }

    /// Number of interrupts waiting to be taken
    pub fn pending_interrupts(&self) -> usize {
        self.interrupts.len()
    }

    /// Peek at a sector of the disk image without going through the device
    pub fn sector(&self, disk: DiskId, sector: u16) -> Option<Sector> {
        self.disks.lock().get(disk)?.sectors.get(&sector).copied()
    }

    fn raise(&self, info: InterruptInfo) {
        trace!("raising {:?}", info);
        if self.interrupts.push(info).is_err() {
            warn!("interrupt queue full, dropping {:?}", info);
        }
    }

    fn raise_due(&self) {
        let now = self.clock();
        {
            let mut timer = self.timer.lock();
            if timer.is_some_and(|deadline| deadline <= now) {
                *timer = None;
                self.raise(InterruptInfo {
                    source: InterruptSource::Timer,
                    status: Ok(()),
                });
            }
        }

        let mut events = self.events.lock();
        let (mut due, pending): (Vec<_>, Vec<_>) =
            events.drain(..).partition(|event| event.at <= now);
        *events = pending;
        due.sort_by_key(|event| event.at);
        for event in due {
            self.raise(event.info);
        }
    }

    fn disk_command(
        &self,
        disk: DiskId,
        sector: u16,
        command: impl FnOnce(&mut SimDisk) -> Result<(), DeviceError>,
    ) -> Result<(), DeviceError> {
        if sector as usize >= NUMBER_LOGICAL_SECTORS {
            return Err(DeviceError::IllegalAddress);
        }
        let now = self.clock();
        let at = now + self.config.disk_latency.max(1);
        let status = {
            let mut disks = self.disks.lock();
            let unit = disks.get_mut(disk).ok_or(DeviceError::BadDeviceId)?;
            if unit.is_busy(now) {
                return Err(DeviceError::DiskInUse);
            }
            unit.busy_until = at;
            command(unit)
        };
        self.events.lock().push(PendingEvent {
            at,
            info: InterruptInfo {
                source: InterruptSource::Disk(disk),
                status,
            },
        });
        Ok(())
    }

    fn wait_for_halt(&self) {
        self.power.baton.wait();
        if let Some(payload) = self.power.panic.lock().take() {
            panic::resume_unwind(payload);
        }
    }
}

impl Hardware for SimMachine {
    fn clock(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    fn start_timer(&self, delay: u64) {
        let deadline = self.clock() + delay;
        trace!("timer armed for {}", deadline);
        *self.timer.lock() = Some(deadline);
        if delay == 0 {
            self.raise_due();
        }
    }

    fn interrupt_info(&self) -> Option<InterruptInfo> {
        self.interrupts.pop()
    }

    fn idle(&self) -> bool {
        if !self.interrupts.is_empty() {
            return true;
        }
        let timer = *self.timer.lock();
        let event = self.events.lock().iter().map(|event| event.at).min();
        let next = match (timer, event) {
            (Some(timer), Some(event)) => Some(timer.min(event)),
            (timer, event) => timer.or(event),
        };
        let Some(at) = next else {
            return false;
        };
        self.clock.fetch_max(at, Ordering::SeqCst);
        self.raise_due();
        true
    }

    fn processor_count(&self) -> usize {
        self.processors.load(Ordering::SeqCst)
    }

    fn set_processor_count(&self, count: usize) -> Result<(), DeviceError> {
        if count == 0 || count > MAX_NUMBER_OF_PROCESSORS {
            return Err(DeviceError::BadParam);
        }
        self.processors.store(count, Ordering::SeqCst);
        Ok(())
    }

    fn init_context(&self, entry: ContextEntry, page_table: PageTable) -> ContextId {
        let mut contexts = self.contexts.lock();
        contexts.push(ContextSlot {
            entry: Some(entry),
            page_table,
            baton: Arc::new(Baton::default()),
        });
        contexts.len() - 1
    }

    fn start_context(&self, context: ContextId) {
        let caller = RUNNING_CONTEXT.with(Cell::get);
        if caller == Some(context) {
            *self.current.lock() = Some(context);
            return;
        }

        let (launch, caller_baton) = {
            let mut contexts = self.contexts.lock();
            let caller_baton = caller
                .and_then(|id| contexts.get(id))
                .map(|slot| slot.baton.clone());
            let Some(slot) = contexts.get_mut(context) else {
                error!("start_context: no context {}", context);
                return;
            };
            *self.current.lock() = Some(context);
            if let Some(baton) = &caller_baton {
                baton.release();
            }
            slot.baton.give();
            (
                slot.entry.take().map(|entry| (entry, slot.baton.clone())),
                caller_baton,
            )
        };

        if let Some((entry, baton)) = launch {
            let power = self.power.clone();
            let current = self.current.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("context-{context}"))
                .spawn(move || {
                    baton.wait();
                    RUNNING_CONTEXT.with(|running| running.set(Some(context)));
                    *current.lock() = Some(context);
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
                        *power.panic.lock() = Some(payload);
                        power.stop();
                    }
                });
            if let Err(err) = spawned {
                error!("could not launch context {}: {}", context, err);
                self.power.stop();
            }
        }

        match caller_baton {
            Some(baton) => {
                baton.wait();
                *self.current.lock() = caller;
            }
            None => self.wait_for_halt(),
        }
    }

    fn current_context(&self) -> Option<ContextId> {
        *self.current.lock()
    }

    fn disk_read(&self, disk: DiskId, sector: u16, buf: &mut Sector) -> Result<(), DeviceError> {
        self.disk_command(disk, sector, |unit| match unit.sectors.get(&sector) {
            Some(data) => {
                *buf = *data;
                Ok(())
            }
            None => {
                *buf = [0; PGSIZE];
                Err(DeviceError::NoPreviousWrite)
            }
        })
    }

    fn disk_write(&self, disk: DiskId, sector: u16, buf: &Sector) -> Result<(), DeviceError> {
        self.disk_command(disk, sector, |unit| {
            unit.sectors.insert(sector, *buf);
            Ok(())
        })
    }

    fn disk_status(&self, disk: DiskId) -> Result<DiskStatus, DeviceError> {
        let now = self.clock();
        let disks = self.disks.lock();
        let unit = disks.get(disk).ok_or(DeviceError::BadDeviceId)?;
        Ok(if unit.is_busy(now) {
            DiskStatus::InUse
        } else {
            DiskStatus::Free
        })
    }

    fn check_disk(&self, disk: DiskId) -> Result<usize, DeviceError> {
        let disks = self.disks.lock();
        let unit = disks.get(disk).ok_or(DeviceError::BadDeviceId)?;
        Ok(unit.sectors.len())
    }

    fn read_physical(&self, frame: usize) -> Sector {
        self.memory.lock().get(frame).copied().unwrap_or([0; PGSIZE])
    }

    fn write_physical(&self, frame: usize, data: &Sector) {
        if let Some(slot) = self.memory.lock().get_mut(frame) {
            *slot = *data;
        }
    }

    fn memory_access(&self, address: usize, op: MemoryOp) -> Result<u32, FaultInfo> {
        let page = address / PGSIZE;
        let offset = address % PGSIZE;
        if page >= NUMBER_VIRTUAL_PAGES {
            return Err(FaultInfo {
                kind: FaultKind::InvalidMemory,
                status: page,
            });
        }
        if offset % 4 != 0 {
            return Err(FaultInfo {
                kind: FaultKind::CpuError,
                status: address,
            });
        }

        let current = *self.current.lock();
        let table = {
            let contexts = self.contexts.lock();
            current
                .and_then(|id| contexts.get(id))
                .map(|slot| slot.page_table.clone())
        };
        let Some(table) = table else {
            return Err(FaultInfo {
                kind: FaultKind::PrivilegedInstruction,
                status: address,
            });
        };

        let entry = table.get(page);
        if !entry.is_valid() {
            return Err(FaultInfo {
                kind: FaultKind::InvalidMemory,
                status: page,
            });
        }
        let frame = entry.frame();
        let mut memory = self.memory.lock();
        let Some(cells) = memory.get_mut(frame) else {
            return Err(FaultInfo {
                kind: FaultKind::InvalidPhysicalMemory,
                status: frame,
            });
        };
        let word = &mut cells[offset..offset + 4];
        let (value, touched) = match op {
            MemoryOp::Read => {
                let mut bytes = [0; 4];
                bytes.copy_from_slice(word);
                (u32::from_le_bytes(bytes), PteFlags::REFERENCED)
            }
            MemoryOp::Write(value) => {
                word.copy_from_slice(&value.to_le_bytes());
                (value, PteFlags::REFERENCED | PteFlags::MODIFIED)
            }
        };
        drop(memory);
        table.update(page, |entry| entry.insert(touched));
        Ok(value)
    }

    fn read_modify_write(&self, address: usize, op: LockOp, wait: bool) -> bool {
        let Some(word) = self.interlocks.get(address) else {
            warn!("read_modify_write: no interlock at {}", address);
            return false;
        };
        match op {
            LockOp::Release => {
                word.store(false, Ordering::Release);
                true
            }
            LockOp::Acquire => loop {
                if word
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return true;
                }
                if !wait {
                    return false;
                }
                core::hint::spin_loop();
                std::thread::yield_now();
            },
        }
    }

    fn halt(&self) -> ! {
        self.power.stop();
        loop {
            std::thread::park();
        }
    }

    fn is_halted(&self) -> bool {
        self.power.halted.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// test that a disk write completes after the configured latency
    #[test]
    fn test_disk_completion_interrupt() {
        let machine = SimMachine::new(MachineConfig {
            disk_latency: 3,
            processors: 1,
        });
        machine.disk_write(2, 7, &[0x5A; PGSIZE]).unwrap();
        assert_eq!(machine.disk_status(2), Ok(DiskStatus::InUse));
        assert_eq!(
            machine.disk_write(2, 8, &[0; PGSIZE]),
            Err(DeviceError::DiskInUse)
        );
        assert!(machine.interrupt_info().is_none());

        assert!(machine.idle());
        assert_eq!(machine.clock(), 3);
        assert_eq!(machine.disk_status(2), Ok(DiskStatus::Free));
        let info = machine.interrupt_info().unwrap();
        assert_eq!(info.source, InterruptSource::Disk(2));
        assert_eq!(info.status, Ok(()));
        assert_eq!(machine.sector(2, 7), Some([0x5A; PGSIZE]));
    }

    /// test that reading an unwritten sector reports it in the completion status
    #[test]
    fn test_read_unwritten_sector() {
        let machine = SimMachine::default();
        let mut buf = [0xFF; PGSIZE];
        machine.disk_read(0, 100, &mut buf).unwrap();
        assert_eq!(buf, [0; PGSIZE]);
        machine.advance(10);
        let info = machine.interrupt_info().unwrap();
        assert_eq!(info.status, Err(DeviceError::NoPreviousWrite));
    }

    /// test that idle jumps to the earliest event
    #[test]
    fn test_idle_orders_events() {
        let machine = SimMachine::default();
        machine.start_timer(10);
        machine.disk_write(0, 1, &[1; PGSIZE]).unwrap();
        assert!(machine.idle());
        assert_eq!(machine.clock(), 2);
        assert_eq!(
            machine.interrupt_info().map(|info| info.source),
            Some(InterruptSource::Disk(0))
        );
        assert!(machine.idle());
        assert_eq!(machine.clock(), 10);
        assert_eq!(
            machine.interrupt_info().map(|info| info.source),
            Some(InterruptSource::Timer)
        );
        assert!(!machine.idle());
    }

    /// test bad device and sector numbers
    #[test]
    fn test_bad_disk_arguments() {
        let machine = SimMachine::default();
        let buf = [0; PGSIZE];
        assert_eq!(
            machine.disk_write(MAX_NUMBER_OF_DISKS, 0, &buf),
            Err(DeviceError::BadDeviceId)
        );
        assert_eq!(
            machine.disk_write(0, NUMBER_LOGICAL_SECTORS as u16, &buf),
            Err(DeviceError::IllegalAddress)
        );
        assert_eq!(machine.check_disk(9), Err(DeviceError::BadDeviceId));
    }

    /// test the interlock words
    #[test]
    fn test_read_modify_write() {
        let machine = SimMachine::default();
        assert!(machine.read_modify_write(3, LockOp::Acquire, false));
        assert!(!machine.read_modify_write(3, LockOp::Acquire, false));
        assert!(machine.read_modify_write(3, LockOp::Release, false));
        assert!(machine.read_modify_write(3, LockOp::Acquire, true));
        assert!(!machine.read_modify_write(NUMBER_OF_INTERLOCKS, LockOp::Acquire, false));
    }

    /// test that memory accesses need a running context
    #[test]
    fn test_memory_access_without_context() {
        let machine = SimMachine::default();
        let fault = machine.memory_access(0, MemoryOp::Read).unwrap_err();
        assert_eq!(fault.kind, FaultKind::PrivilegedInstruction);
        let fault = machine
            .memory_access(NUMBER_VIRTUAL_PAGES * PGSIZE, MemoryOp::Read)
            .unwrap_err();
        assert_eq!(fault.kind, FaultKind::InvalidMemory);
        assert_eq!(fault.status, NUMBER_VIRTUAL_PAGES);
    }
}
