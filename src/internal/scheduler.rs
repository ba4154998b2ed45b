//! Sleeping and dispatching.
//!
//! The dispatcher is the only place the running context changes. While nothing is ready it
//! idles the processor, which lets simulated time move to the next pending event, and
//! services the interrupts that come out of it.

use log::{debug, error, warn};

use crate::internal::{
    kernel::{Kernel, KernelError},
    process::{Pid, ProcessStatus},
    queue::OrderedQueue,
};

/// Sleeping processes, earliest wake time first, plus the ones suspended while asleep
pub struct TimerQueue {
    /// processes waiting for their wake time
    pub sleeping: OrderedQueue<Pid>,
    /// processes taken off `sleeping` by a suspend
    pub suspended: OrderedQueue<Pid>,
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerQueue {
    /// Two empty lists
    pub fn new() -> Self {
        Self {
            sleeping: OrderedQueue::new("timer"),
            suspended: OrderedQueue::new("timer-suspended"),
        }
    }

    /// Forget `pid` on both lists
    pub fn remove(&mut self, pid: Pid) {
        self.sleeping.remove(&pid);
        self.suspended.remove(&pid);
    }

    /// Earliest wake time, if anyone sleeps
    pub fn next_wake(&self) -> Option<u64> {
        self.sleeping.peek().map(|(wake, _)| wake as u64)
    }
}

impl Kernel {
    /// Put the caller to sleep for `ticks`
    pub fn sleep(&self, ticks: u64) -> Result<(), KernelError> {
        let pid = self.current_pid()?;
        let wake = self.hw.clock() + ticks;
        if let Some(pcb) = self.processes.lock().get_mut(pid) {
            pcb.wake_time = wake;
            pcb.status = ProcessStatus::Ready;
        }
        {
            let mut timer = self.timer.lock();
            self.enqueue_sleeper(&mut timer, pid, wake);
        }
        debug!("process {} sleeps until {}", pid, wake);
        self.schedule_report("sleep", Some(pid));
        self.dispatch();
        Ok(())
    }

    /// Queue `pid` by wake time, re-arming the timer when it lands at the head
    pub(crate) fn enqueue_sleeper(&self, timer: &mut TimerQueue, pid: Pid, wake: u64) {
        timer.sleeping.insert(wake as i64, pid);
        if timer.sleeping.peek().map(|(_, head)| *head) == Some(pid) {
            self.hw.start_timer(wake.saturating_sub(self.hw.clock()));
        }
    }

    /// Give the processor to the most favorable ready process, idling until one exists.
    ///
    /// Returns in the context of the caller once something dispatches it again.
    pub fn dispatch(&self) {
        loop {
            self.service_interrupts();

            let next = self.ready.lock().pop_front();
            let Some(pid) = next else {
                self.idle();
                continue;
            };

            let context = self.processes.lock().get_mut(pid).map(|pcb| {
                pcb.status = ProcessStatus::Running;
                pcb.context
            });
            let Some(context) = context else {
                warn!("dispatch: process {} is on the ready queue but not in the table", pid);
                continue;
            };

            self.schedule_report("dispatch", Some(pid));
            self.hw.start_context(context);
            return;
        }
    }

    /// Wait for the next event; a machine with nothing left to happen is halted
    fn idle(&self) {
        if !self.hw.idle() {
            error!("no runnable process and nothing pending");
            self.halt();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::hw::{Hardware, SimMachine};
    use crate::internal::kernel::KernelConfig;
    use std::sync::Arc;

    /// test that sleepers are ordered by wake time with ties in insertion order
    #[test]
    fn test_enqueue_sleeper_order() {
        let machine = Arc::new(SimMachine::default());
        let kernel = Kernel::boot(machine.clone(), KernelConfig::default());
        {
            let mut timer = kernel.timer.lock();
            kernel.enqueue_sleeper(&mut timer, 1, 5);
            kernel.enqueue_sleeper(&mut timer, 2, 3);
            kernel.enqueue_sleeper(&mut timer, 3, 5);
            assert_eq!(timer.sleeping.to_vec(), vec![2, 1, 3]);
            assert_eq!(timer.next_wake(), Some(3));
        }
        assert_eq!(machine.timer_deadline(), Some(3));
        assert_eq!(machine.clock(), 0);
    }

    /// test that removing a process clears both timer lists
    #[test]
    fn test_timer_queue_remove() {
        let mut timer = TimerQueue::new();
        timer.sleeping.insert(4, 1);
        timer.suspended.push_back(2);
        timer.remove(1);
        timer.remove(2);
        assert!(timer.sleeping.is_empty());
        assert!(timer.suspended.is_empty());
        assert_eq!(timer.next_wake(), None);
    }
}
