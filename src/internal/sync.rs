//! Kernel locks built on the hardware's interlocked read-modify-write.
//!
//! Every shared kernel structure sits behind a [`KernelLock`] bound to one named
//! interlock word. Locks are not reentrant, and acquisition order is up to the caller:
//! the kernel takes them in the order Pcb, Timer, Disk, Ready, Frames, Swap, Bitmap,
//! FileSystem and never holds one across a context switch.

use core::cell::UnsafeCell;
use core::fmt::Display;
use core::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::internal::hw::{Hardware, LockOp};

/// Interlock word protecting each kernel structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum LockAddress {
    /// timer queue and its suspended shadow list
    Timer = 1,
    /// process table
    Pcb = 2,
    /// ready queue
    Ready = 3,
    /// disk queue
    Disk = 5,
    /// physical frame table
    Frames = 6,
    /// swap table
    Swap = 7,
    /// per-disk sector bitmaps
    Bitmap = 8,
    /// inode counter
    FileSystem = 9,
}

/// Returned by [`KernelLock::try_lock`] when the lock is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WouldBlock(pub LockAddress);

impl Display for WouldBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "lock {:?} is held", self.0)
    }
}

/// A mutual exclusion lock whose state lives in a hardware interlock word
pub struct KernelLock<T> {
    address: LockAddress,
    hw: Arc<dyn Hardware>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for KernelLock<T> {}
unsafe impl<T: Send> Sync for KernelLock<T> {}

impl<T> KernelLock<T> {
    /// Bind `data` to the interlock word at `address`
    pub fn new(address: LockAddress, hw: Arc<dyn Hardware>, data: T) -> Self {
        Self {
            address,
            hw,
            data: UnsafeCell::new(data),
        }
    }

    /// Block until the lock is ours
    pub fn lock(&self) -> KernelLockGuard<'_, T> {
        self.hw
            .read_modify_write(self.address as usize, LockOp::Acquire, true);
        KernelLockGuard { lock: self }
    }

    /// Take the lock only if nobody holds it
    pub fn try_lock(&self) -> Result<KernelLockGuard<'_, T>, WouldBlock> {
        if self
            .hw
            .read_modify_write(self.address as usize, LockOp::Acquire, false)
        {
            Ok(KernelLockGuard { lock: self })
        } else {
            Err(WouldBlock(self.address))
        }
    }

    /// The interlock word this lock uses
    pub fn address(&self) -> LockAddress {
        self.address
    }
}

/// Access to the data of a held [`KernelLock`]; dropping it releases the lock
pub struct KernelLockGuard<'a, T> {
    lock: &'a KernelLock<T>,
}

impl<T> Deref for KernelLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for KernelLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for KernelLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock
            .hw
            .read_modify_write(self.lock.address as usize, LockOp::Release, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::hw::SimMachine;

    /// test that a held lock cannot be taken twice
    #[test]
    fn test_try_lock_while_held() {
        let hw: Arc<dyn Hardware> = Arc::new(SimMachine::default());
        let lock = KernelLock::new(LockAddress::Ready, hw, 5);
        let mut guard = lock.lock();
        *guard += 1;
        assert_eq!(lock.try_lock().err(), Some(WouldBlock(LockAddress::Ready)));
        drop(guard);
        assert_eq!(*lock.try_lock().unwrap(), 6);
    }

    /// test that locks on different addresses are independent
    #[test]
    fn test_independent_addresses() {
        let hw: Arc<dyn Hardware> = Arc::new(SimMachine::default());
        let timer = KernelLock::new(LockAddress::Timer, hw.clone(), ());
        let disk = KernelLock::new(LockAddress::Disk, hw, ());
        let _timer = timer.lock();
        assert!(disk.try_lock().is_ok());
    }

    /// test that the lock serializes host threads
    #[test]
    fn test_lock_across_threads() {
        let hw: Arc<dyn Hardware> = Arc::new(SimMachine::default());
        let counter = Arc::new(KernelLock::new(LockAddress::Pcb, hw, 0usize));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(*counter.lock(), 4000);
    }
}
