use core::fmt::Display;

use log::{debug, error, info, warn};

use crate::internal::{
    fs::FsContext,
    hw::{ContextEntry, ContextId, DiskId, PageTable},
    kernel::{Kernel, KernelError},
    queue::OrderedQueue,
};

/// Process identifier
pub type Pid = u32;

/// Code run by a process
pub type ProcessEntry = Box<dyn FnOnce(&Kernel) + Send + 'static>;

/// Best priority a process can have
pub const MOST_FAVORABLE_PRIORITY: i64 = 1;
/// Priority for processes that should run ahead of the crowd
pub const FAVORABLE_PRIORITY: i64 = 10;
/// Default priority
pub const NORMAL_PRIORITY: i64 = 20;
/// Worst priority a process can have
pub const LEAST_FAVORABLE_PRIORITY: i64 = 30;

/// Lifecycle state of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// holds the processor
    Running,
    /// runnable, or waiting on the timer or a disk
    Ready,
    /// taken out of scheduling until resumed
    Suspended,
    /// gone
    Terminated,
}

/// Which process a call targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessTarget {
    /// the caller (`-1`)
    Current,
    /// the caller, then stop the machine (`-2`)
    CurrentAndHalt,
    /// a specific process
    Pid(Pid),
}

impl TryFrom<i64> for ProcessTarget {
    type Error = KernelError;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        match raw {
            -1 => Ok(ProcessTarget::Current),
            -2 => Ok(ProcessTarget::CurrentAndHalt),
            pid => Pid::try_from(pid)
                .map(ProcessTarget::Pid)
                .map_err(|_| KernelError::BadParam("invalid process id")),
        }
    }
}

/// Process control block
pub struct Pcb {
    /// process id
    pub pid: Pid,
    /// unique name
    pub name: String,
    /// lower runs first
    pub priority: i64,
    /// lifecycle state
    pub status: ProcessStatus,
    /// tick the process last asked to be woken at
    pub wake_time: u64,
    /// saved execution context
    pub context: ContextId,
    /// address space
    pub page_table: PageTable,
    /// disk the process is blocked on, if any
    pub pending_disk: Option<DiskId>,
    /// current directory and open files
    pub fs: FsContext,
}

/// Every live process, in creation order. The first one is the lead process.
pub struct ProcessTable {
    pcbs: Vec<Pcb>,
    next_pid: Pid,
    capacity: usize,
    terminated: OrderedQueue<Pid>,
}

impl ProcessTable {
    /// An empty table holding at most `capacity` processes
    pub fn new(capacity: usize) -> Self {
        Self {
            pcbs: Vec::new(),
            next_pid: 1,
            capacity,
            terminated: OrderedQueue::new("terminated"),
        }
    }

    /// Look a process up by id
    pub fn get(&self, pid: Pid) -> Option<&Pcb> {
        self.pcbs.iter().find(|pcb| pcb.pid == pid)
    }

    /// Look a process up by id, mutably
    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        self.pcbs.iter_mut().find(|pcb| pcb.pid == pid)
    }

    /// Look a process up by name
    pub fn by_name(&self, name: &str) -> Option<&Pcb> {
        self.pcbs.iter().find(|pcb| pcb.name == name)
    }

    /// The process owning an execution context
    pub fn by_context(&self, context: ContextId) -> Option<&Pcb> {
        self.pcbs.iter().find(|pcb| pcb.context == context)
    }

    /// The lead process
    pub fn head(&self) -> Option<Pid> {
        self.pcbs.first().map(|pcb| pcb.pid)
    }

    /// Number of live processes
    pub fn len(&self) -> usize {
        self.pcbs.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.pcbs.is_empty()
    }

    /// Whether another process fits
    pub fn is_full(&self) -> bool {
        self.pcbs.len() >= self.capacity
    }

    /// Live processes in creation order
    pub fn iter(&self) -> impl Iterator<Item = &Pcb> {
        self.pcbs.iter()
    }

    /// Ids of terminated processes, oldest first
    pub fn terminated(&self) -> Vec<Pid> {
        self.terminated.to_vec()
    }

    fn allocate_pid(&mut self) -> Pid {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }

    fn insert(&mut self, pcb: Pcb) {
        self.pcbs.push(pcb);
    }

    fn retire(&mut self, pid: Pid) -> Option<Pcb> {
        let at = self.pcbs.iter().position(|pcb| pcb.pid == pid)?;
        let mut pcb = self.pcbs.remove(at);
        pcb.status = ProcessStatus::Terminated;
        self.terminated.push_back(pid);
        Some(pcb)
    }
}

fn check_priority(priority: i64) -> Result<(), KernelError> {
    if (MOST_FAVORABLE_PRIORITY..=LEAST_FAVORABLE_PRIORITY).contains(&priority) {
        Ok(())
    } else {
        Err(KernelError::BadParam("illegal priority"))
    }
}

/// Scheduling state of every process at one instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSnapshot {
    /// when it was taken
    pub time: u64,
    /// process holding the processor
    pub running: Option<Pid>,
    /// ready queue, head first
    pub ready: Vec<Pid>,
    /// timer queue, earliest wake first
    pub timer: Vec<Pid>,
    /// disk queue, oldest first
    pub disk: Vec<Pid>,
    /// suspended processes
    pub suspended: Vec<Pid>,
    /// suspended while sleeping
    pub timer_suspended: Vec<Pid>,
    /// terminated processes
    pub terminated: Vec<Pid>,
}

impl Display for ScheduleSnapshot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "t={} running=", self.time)?;
        match self.running {
            Some(pid) => write!(f, "{}", pid)?,
            None => write!(f, "-")?,
        }
        write!(
            f,
            " ready={:?} timer={:?} disk={:?} suspended={:?} timer-suspended={:?} terminated={:?}",
            self.ready, self.timer, self.disk, self.suspended, self.timer_suspended, self.terminated
        )
    }
}

impl Kernel {
    /// Create a process and make it ready to run
    pub fn create_process(
        &self,
        name: &str,
        priority: i64,
        entry: ProcessEntry,
    ) -> Result<Pid, KernelError> {
        check_priority(priority)?;
        if name.is_empty() {
            return Err(KernelError::BadParam("empty process name"));
        }

        let pid = {
            let mut table = self.processes.lock();
            if table.is_full() {
                return Err(KernelError::BadParam("process table is full"));
            }
            if table.by_name(name).is_some() {
                return Err(KernelError::BadParam("duplicate process name"));
            }
            let pid = table.allocate_pid();
            let page_table = PageTable::new();
            let context = self
                .hw
                .init_context(self.context_entry(entry), page_table.clone());
            table.insert(Pcb {
                pid,
                name: name.to_string(),
                priority,
                status: ProcessStatus::Ready,
                wake_time: 0,
                context,
                page_table,
                pending_disk: None,
                fs: FsContext::default(),
            });
            pid
        };

        self.ready.lock().insert(priority, pid);
        debug!("created process {} ({}) at priority {}", pid, name, priority);
        self.schedule_report("create", Some(pid));
        Ok(pid)
    }

    /// Wrap a process body so that returning from it terminates the process
    fn context_entry(&self, entry: ProcessEntry) -> ContextEntry {
        let kernel = self.me.clone();
        Box::new(move || {
            let Some(kernel) = kernel.upgrade() else {
                return;
            };
            entry(&kernel);
            if let Err(err) = kernel.terminate(ProcessTarget::Current) {
                error!("process exit failed: {}", err);
            }
            kernel.halt();
        })
    }

    /// Id of the process holding the processor
    pub fn current_pid(&self) -> Result<Pid, KernelError> {
        let context = self
            .hw
            .current_context()
            .ok_or(KernelError::NoRunningProcess)?;
        self.processes
            .lock()
            .by_context(context)
            .map(|pcb| pcb.pid)
            .ok_or(KernelError::NoRunningProcess)
    }

    /// Id of the process called `name`; the caller's own id for an empty name
    pub fn get_process_id(&self, name: &str) -> Result<Pid, KernelError> {
        if name.is_empty() {
            return self.current_pid();
        }
        self.processes
            .lock()
            .by_name(name)
            .map(|pcb| pcb.pid)
            .ok_or(KernelError::BadParam("no process with that name"))
    }

    /// Status of a live or terminated process
    pub fn process_status(&self, pid: Pid) -> Option<ProcessStatus> {
        let table = self.processes.lock();
        match table.get(pid) {
            Some(pcb) => Some(pcb.status),
            None if table.terminated.contains(&pid) => Some(ProcessStatus::Terminated),
            None => None,
        }
    }

    /// Priority of a live process
    pub fn priority_of(&self, pid: Pid) -> Option<i64> {
        self.processes.lock().get(pid).map(|pcb| pcb.priority)
    }

    /// Page table of a live process
    pub fn page_table_of(&self, pid: Pid) -> Option<PageTable> {
        self.processes.lock().get(pid).map(|pcb| pcb.page_table.clone())
    }

    /// Number of live processes
    pub fn process_count(&self) -> usize {
        self.processes.lock().len()
    }

    /// Terminate a process. Terminating the lead process, or asking for
    /// [`ProcessTarget::CurrentAndHalt`], stops the machine.
    pub fn terminate(&self, target: ProcessTarget) -> Result<(), KernelError> {
        match target {
            ProcessTarget::CurrentAndHalt => {
                let pid = self.current_pid()?;
                self.retire(pid);
                info!("process {} terminated itself and the machine", pid);
                self.halt();
            }
            ProcessTarget::Current => {
                let pid = self.current_pid()?;
                self.terminate_running(pid)
            }
            ProcessTarget::Pid(pid) => {
                if self.current_pid().ok() == Some(pid) {
                    return self.terminate_running(pid);
                }
                if self.retire(pid).is_none() {
                    return Err(KernelError::UnknownProcess(pid));
                }
                self.schedule_report("terminate", Some(pid));
                Ok(())
            }
        }
    }

    fn terminate_running(&self, pid: Pid) -> Result<(), KernelError> {
        let lead = self.processes.lock().head() == Some(pid);
        self.retire(pid);
        if lead {
            info!("lead process {} terminated", pid);
            self.halt();
        }
        self.schedule_report("terminate", Some(pid));
        self.dispatch();
        Ok(())
    }

    /// Drop a process from the table and from every queue
    fn retire(&self, pid: Pid) -> Option<Pcb> {
        let pcb = self.processes.lock().retire(pid)?;
        self.timer.lock().remove(pid);
        self.disk_queue.lock().remove(&pid);
        self.ready.lock().remove(&pid);
        self.release_memory(pid);
        debug!("process {} ({}) retired", pid, pcb.name);
        Some(pcb)
    }

    /// Take a process out of scheduling
    pub fn suspend(&self, target: ProcessTarget) -> Result<(), KernelError> {
        let pid = match target {
            ProcessTarget::CurrentAndHalt => {
                return Err(KernelError::BadParam("cannot suspend and halt"));
            }
            ProcessTarget::Current => return self.suspend_self(),
            ProcessTarget::Pid(pid) => pid,
        };
        if self.current_pid().ok() == Some(pid) {
            return self.suspend_self();
        }

        {
            let mut table = self.processes.lock();
            let pcb = table.get_mut(pid).ok_or(KernelError::UnknownProcess(pid))?;
            if pcb.status == ProcessStatus::Suspended {
                return Err(KernelError::BadParam("process is already suspended"));
            }
            pcb.status = ProcessStatus::Suspended;
            pcb.pending_disk = None;
        }
        {
            let mut timer = self.timer.lock();
            if timer.sleeping.remove(&pid).is_some() {
                timer.suspended.push_back(pid);
            }
        }
        self.disk_queue.lock().remove(&pid);
        self.ready.lock().remove(&pid);

        debug!("suspended process {}", pid);
        self.schedule_report("suspend", Some(pid));
        Ok(())
    }

    fn suspend_self(&self) -> Result<(), KernelError> {
        let pid = self.current_pid()?;
        if let Some(pcb) = self.processes.lock().get_mut(pid) {
            pcb.status = ProcessStatus::Suspended;
        }
        debug!("process {} suspended itself", pid);
        self.schedule_report("suspend", Some(pid));
        self.dispatch();
        Ok(())
    }

    /// Put a suspended process back into scheduling. A process suspended while asleep goes
    /// back to sleep if its wake time is still ahead.
    pub fn resume(&self, target: ProcessTarget) -> Result<(), KernelError> {
        let ProcessTarget::Pid(pid) = target else {
            return Err(KernelError::BadParam("the caller is not suspended"));
        };

        let (priority, wake_time) = {
            let mut table = self.processes.lock();
            let pcb = table.get_mut(pid).ok_or(KernelError::UnknownProcess(pid))?;
            if pcb.status != ProcessStatus::Suspended {
                return Err(KernelError::BadParam("process is not suspended"));
            }
            pcb.status = ProcessStatus::Ready;
            (pcb.priority, pcb.wake_time)
        };

        let now = self.hw.clock();
        let asleep = {
            let mut timer = self.timer.lock();
            let was_sleeping = timer.suspended.remove(&pid).is_some();
            if was_sleeping && wake_time > now {
                self.enqueue_sleeper(&mut timer, pid, wake_time);
                true
            } else {
                false
            }
        };
        if !asleep {
            self.ready.lock().insert(priority, pid);
        }

        debug!("resumed process {}", pid);
        self.schedule_report("resume", Some(pid));
        Ok(())
    }

    /// Change a process's priority, re-sorting it if it is ready
    pub fn change_priority(&self, target: ProcessTarget, priority: i64) -> Result<(), KernelError> {
        check_priority(priority)?;
        let pid = match target {
            ProcessTarget::Current => self.current_pid()?,
            ProcessTarget::Pid(pid) => pid,
            ProcessTarget::CurrentAndHalt => {
                return Err(KernelError::BadParam("invalid process id"));
            }
        };

        {
            let mut table = self.processes.lock();
            let pcb = table.get_mut(pid).ok_or(KernelError::UnknownProcess(pid))?;
            pcb.priority = priority;
        }
        {
            let mut ready = self.ready.lock();
            if ready.remove(&pid).is_some() {
                ready.insert(priority, pid);
            }
        }

        debug!("process {} now at priority {}", pid, priority);
        self.schedule_report("priority", Some(pid));
        Ok(())
    }

    /// Scheduling state of every process
    pub fn schedule_snapshot(&self) -> ScheduleSnapshot {
        let running = self.current_pid().ok();
        let (suspended, terminated) = {
            let table = self.processes.lock();
            (
                table
                    .iter()
                    .filter(|pcb| pcb.status == ProcessStatus::Suspended)
                    .map(|pcb| pcb.pid)
                    .collect(),
                table.terminated(),
            )
        };
        let (timer, timer_suspended) = {
            let timer = self.timer.lock();
            (timer.sleeping.to_vec(), timer.suspended.to_vec())
        };
        let disk = self.disk_queue.lock().to_vec();
        let ready = self.ready.lock().to_vec();
        ScheduleSnapshot {
            time: self.hw.clock(),
            running,
            ready,
            timer,
            disk,
            suspended,
            timer_suspended,
            terminated,
        }
    }

    /// Print the scheduling state after `action`, while the print budget lasts
    pub(crate) fn schedule_report(&self, action: &str, target: Option<Pid>) {
        if !log::log_enabled!(log::Level::Info) {
            return;
        }
        if !self.diagnostics.schedule.allow() {
            return;
        }
        let snapshot = self.schedule_snapshot();
        match target {
            Some(pid) => info!("{} {}: {}", action, pid, snapshot),
            None => info!("{}: {}", action, snapshot),
        }
    }
}

/// warn about processes that are still alive when the machine stops
pub(crate) fn report_survivors(table: &ProcessTable) {
    for pcb in table.iter() {
        warn!("process {} ({}) still {:?}", pcb.pid, pcb.name, pcb.status);
    }
}
