#![warn(missing_docs)]

/// console module, handles console output
pub mod console;
/// disk module, handles sector io and sector allocation
pub mod disk;
/// fs module, handles file system operations
pub mod fs;
/// hw module, handles the hardware interface and the simulated machine
pub mod hw;
/// interrupts module, handles interrupt and fault handling
pub mod interrupts;
/// kernel module, handles kernel state and boot
pub mod kernel;
/// memory module, handles demand paging
pub mod memory;
/// process module, handles the process table and process lifecycle
pub mod process;
/// queue module, handles ordered queues
pub mod queue;
/// scheduler module, handles sleeping and dispatching
pub mod scheduler;
/// sync module, handles kernel locks
pub mod sync;
/// syscall module, handles system calls
pub mod syscall;
