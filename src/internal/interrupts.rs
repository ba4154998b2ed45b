use core::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, error, info, warn};

use crate::internal::{
    hw::{DiskId, FaultInfo, FaultKind, InterruptInfo, InterruptSource},
    kernel::{Kernel, KernelError},
    process::ProcessStatus,
};

/// Interrupts, faults and system calls printed before the handlers go quiet
pub const DIAGNOSTIC_PRINT_LIMIT: usize = 10;

/// Counts occurrences and lets the first `limit` of them through
#[derive(Debug)]
pub struct PrintLimiter {
    seen: AtomicUsize,
    limit: usize,
}

impl PrintLimiter {
    /// A limiter letting `limit` prints through
    pub const fn new(limit: usize) -> Self {
        Self {
            seen: AtomicUsize::new(0),
            limit,
        }
    }

    /// Count one occurrence; true while under the limit
    pub fn allow(&self) -> bool {
        self.seen.fetch_add(1, Ordering::Relaxed) < self.limit
    }

    /// Occurrences so far
    pub fn seen(&self) -> usize {
        self.seen.load(Ordering::Relaxed)
    }
}

/// Print budgets of the diagnostic hooks
#[derive(Debug)]
pub struct Diagnostics {
    /// interrupt handler
    pub interrupts: PrintLimiter,
    /// fault handler
    pub faults: PrintLimiter,
    /// system call entry
    pub syscalls: PrintLimiter,
    /// scheduling reports
    pub schedule: PrintLimiter,
}

impl Diagnostics {
    /// Fresh counters; `schedule_limit` bounds the scheduling reports
    pub fn new(schedule_limit: usize) -> Self {
        Self {
            interrupts: PrintLimiter::new(DIAGNOSTIC_PRINT_LIMIT),
            faults: PrintLimiter::new(DIAGNOSTIC_PRINT_LIMIT),
            syscalls: PrintLimiter::new(DIAGNOSTIC_PRINT_LIMIT),
            schedule: PrintLimiter::new(schedule_limit),
        }
    }
}

impl Kernel {
    /// Handle every pending interrupt
    pub(crate) fn service_interrupts(&self) {
        while let Some(info) = self.hw.interrupt_info() {
            self.interrupt_handler(info);
        }
    }

    fn interrupt_handler(&self, info: InterruptInfo) {
        if self.diagnostics.interrupts.allow() {
            info!("interrupt: {:?} at {}", info.source, self.hw.clock());
        }
        if let Err(err) = info.status {
            warn!("interrupt {:?} reported: {}", info.source, err);
        }
        match info.source {
            InterruptSource::Timer => self.timer_interrupt(),
            InterruptSource::Disk(disk) => self.disk_interrupt(disk),
        }
    }

    /// Move every sleeper whose wake time has passed to the ready queue
    fn timer_interrupt(&self) {
        let now = self.hw.clock();
        let mut woken = Vec::new();
        {
            let mut timer = self.timer.lock();
            while let Some((wake, &pid)) = timer.sleeping.peek() {
                let wake = wake as u64;
                if wake > now {
                    self.hw.start_timer(wake - now);
                    break;
                }
                timer.sleeping.pop_front();
                woken.push(pid);
            }
        }

        for pid in woken {
            let priority = self.processes.lock().get(pid).and_then(|pcb| {
                (pcb.status != ProcessStatus::Suspended).then_some(pcb.priority)
            });
            let Some(priority) = priority else {
                debug!("timer: process {} is gone or suspended", pid);
                continue;
            };
            self.ready.lock().insert(priority, pid);
            debug!("timer: woke process {}", pid);
            self.schedule_report("wake", Some(pid));
        }
    }

    /// Wake the process waiting on `disk`
    fn disk_interrupt(&self, disk: DiskId) {
        let waiter = {
            let mut table = self.processes.lock();
            let mut queue = self.disk_queue.lock();
            let pid = queue.remove_first(|pid| {
                table
                    .get(*pid)
                    .is_some_and(|pcb| pcb.pending_disk == Some(disk))
            });
            pid.and_then(|pid| {
                let pcb = table.get_mut(pid)?;
                pcb.pending_disk = None;
                Some((pid, pcb.priority))
            })
        };

        let Some((pid, priority)) = waiter else {
            debug!("disk {}: completion with nobody waiting", disk);
            return;
        };
        self.ready.lock().insert(priority, pid);
        debug!("disk {}: woke process {}", disk, pid);
        self.schedule_report("disk", Some(pid));
    }

    /// Handle a fault raised by the running process. Invalid memory is repaired by paging;
    /// everything else is reported and handed back.
    pub fn fault_handler(&self, fault: FaultInfo) -> Result<(), KernelError> {
        if self.diagnostics.faults.allow() {
            info!("fault: {:?} status {}", fault.kind, fault.status);
        }
        match fault.kind {
            FaultKind::InvalidMemory => {
                let pid = self.current_pid()?;
                self.resolve_page_fault(pid, fault.status)
            }
            kind => {
                error!("EXCEPTION: {:?} (status {})", kind, fault.status);
                Err(KernelError::Fault(kind))
            }
        }
    }
}
