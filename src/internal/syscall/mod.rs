use core::fmt::Display;

use log::{info, trace, warn};

use crate::internal::{
    fs::DirectoryEntry,
    hw::{DeviceError, Sector},
    kernel::{Kernel, KernelError},
    process::{Pid, ProcessEntry},
};

/// read a word of memory - `mem_read(address)`
pub const MEM_READ: usize = 0x1;
/// write a word of memory - `mem_write(address, value)`
pub const MEM_WRITE: usize = 0x2;
/// get the current time in ticks - `get_time_of_day()`
pub const GET_TIME_OF_DAY: usize = 0x11;
/// sleep for a number of ticks - `sleep(ticks)`
pub const SLEEP: usize = 0x12;
/// get the id of a process by name, `""` for the caller - `get_process_id(name)`
pub const GET_PROCESS_ID: usize = 0x13;
/// create a process - `create_process(name, priority, entry)`
pub const CREATE_PROCESS: usize = 0x14;
/// terminate a process, `-1` for the caller, `-2` for the caller and the machine - `terminate_process(pid)`
pub const TERMINATE_PROCESS: usize = 0x15;
/// suspend a process - `suspend_process(pid)`
pub const SUSPEND_PROCESS: usize = 0x16;
/// resume a suspended process - `resume_process(pid)`
pub const RESUME_PROCESS: usize = 0x17;
/// change the priority of a process - `change_priority(pid, priority)`
pub const CHANGE_PRIORITY: usize = 0x18;
/// read a sector - `physical_disk_read(disk, sector, buf)`
pub const PHYSICAL_DISK_READ: usize = 0x21;
/// write a sector - `physical_disk_write(disk, sector, buf)`
pub const PHYSICAL_DISK_WRITE: usize = 0x22;
/// count the sectors written to a disk - `check_disk(disk)`
pub const CHECK_DISK: usize = 0x23;
/// lay down an empty file system - `format(disk)`
pub const FORMAT: usize = 0x24;
/// change the current directory, `-1` for the caller's disk - `open_dir(disk, name)`
pub const OPEN_DIR: usize = 0x25;
/// open a file in the current directory - `open_file(name)`
pub const OPEN_FILE: usize = 0x26;
/// create a directory in the current directory - `create_dir(name)`
pub const CREATE_DIR: usize = 0x27;
/// create a file in the current directory - `create_file(name)`
pub const CREATE_FILE: usize = 0x28;
/// read a block of an open file - `read_file(inode, block, buf)`
pub const READ_FILE: usize = 0x29;
/// write a block of an open file - `write_file(inode, block, buf)`
pub const WRITE_FILE: usize = 0x2A;
/// close an open file - `close_file(inode)`
pub const CLOSE_FILE: usize = 0x2B;
/// list the current directory - `dir_contents()`
pub const DIR_CONTENTS: usize = 0x2C;

/// Name of system call `n`
pub fn syscall_name(n: usize) -> &'static str {
    match n {
        MEM_READ => "mem_read",
        MEM_WRITE => "mem_write",
        GET_TIME_OF_DAY => "get_time_of_day",
        SLEEP => "sleep",
        GET_PROCESS_ID => "get_process_id",
        CREATE_PROCESS => "create_process",
        TERMINATE_PROCESS => "terminate_process",
        SUSPEND_PROCESS => "suspend_process",
        RESUME_PROCESS => "resume_process",
        CHANGE_PRIORITY => "change_priority",
        PHYSICAL_DISK_READ => "physical_disk_read",
        PHYSICAL_DISK_WRITE => "physical_disk_write",
        CHECK_DISK => "check_disk",
        FORMAT => "format",
        OPEN_DIR => "open_dir",
        OPEN_FILE => "open_file",
        CREATE_DIR => "create_dir",
        CREATE_FILE => "create_file",
        READ_FILE => "read_file",
        WRITE_FILE => "write_file",
        CLOSE_FILE => "close_file",
        DIR_CONTENTS => "dir_contents",
        _ => "<unknown>",
    }
}

/// Status returned by every system call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum ErrorCode {
    /// the call succeeded
    Success = 0,
    /// an argument was rejected
    BadParam = 1,
    /// a sector was read before it was ever written
    NoPreviousWrite = 2,
    /// sector or address out of range
    IllegalAddress = 3,
    /// the disk is busy
    DiskInUse = 4,
    /// disk number out of range
    BadDeviceId = 5,
}

impl From<&KernelError> for ErrorCode {
    fn from(err: &KernelError) -> Self {
        match err {
            KernelError::Device(DeviceError::NoPreviousWrite) => ErrorCode::NoPreviousWrite,
            KernelError::Device(DeviceError::IllegalAddress) => ErrorCode::IllegalAddress,
            KernelError::Device(DeviceError::DiskInUse) => ErrorCode::DiskInUse,
            KernelError::Device(DeviceError::BadDeviceId) => ErrorCode::BadDeviceId,
            _ => ErrorCode::BadParam,
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?} ({})", self, *self as i64)
    }
}

/// A system call with its raw arguments
pub enum SystemCall<'a> {
    /// [`MEM_READ`]
    MemRead {
        /// virtual address
        address: i64,
    },
    /// [`MEM_WRITE`]
    MemWrite {
        /// virtual address
        address: i64,
        /// word to store
        value: u32,
    },
    /// [`GET_TIME_OF_DAY`]
    GetTimeOfDay,
    /// [`SLEEP`]
    Sleep {
        /// ticks to sleep
        ticks: i64,
    },
    /// [`GET_PROCESS_ID`]
    GetProcessId {
        /// process name, empty for the caller
        name: &'a str,
    },
    /// [`CREATE_PROCESS`]
    CreateProcess {
        /// unique name
        name: &'a str,
        /// 1 to 30, lower runs first
        priority: i64,
        /// process body
        entry: ProcessEntry,
    },
    /// [`TERMINATE_PROCESS`]
    TerminateProcess {
        /// target, `-1` or `-2` for the caller
        pid: i64,
    },
    /// [`SUSPEND_PROCESS`]
    SuspendProcess {
        /// target, `-1` for the caller
        pid: i64,
    },
    /// [`RESUME_PROCESS`]
    ResumeProcess {
        /// target
        pid: i64,
    },
    /// [`CHANGE_PRIORITY`]
    ChangePriority {
        /// target, `-1` for the caller
        pid: i64,
        /// new priority
        priority: i64,
    },
    /// [`PHYSICAL_DISK_READ`]
    PhysicalDiskRead {
        /// disk unit
        disk: i64,
        /// sector number
        sector: i64,
        /// receives the sector
        buf: &'a mut Sector,
    },
    /// [`PHYSICAL_DISK_WRITE`]
    PhysicalDiskWrite {
        /// disk unit
        disk: i64,
        /// sector number
        sector: i64,
        /// data to write
        buf: &'a Sector,
    },
    /// [`CHECK_DISK`]
    CheckDisk {
        /// disk unit
        disk: i64,
    },
    /// [`FORMAT`]
    Format {
        /// disk unit
        disk: i64,
    },
    /// [`OPEN_DIR`]
    OpenDir {
        /// disk unit, `-1` for the caller's disk
        disk: i64,
        /// directory name
        name: &'a str,
    },
    /// [`OPEN_FILE`]
    OpenFile {
        /// file name
        name: &'a str,
    },
    /// [`CREATE_DIR`]
    CreateDir {
        /// directory name
        name: &'a str,
    },
    /// [`CREATE_FILE`]
    CreateFile {
        /// file name
        name: &'a str,
    },
    /// [`READ_FILE`]
    ReadFile {
        /// inode of an open file
        inode: i64,
        /// block index
        block: i64,
        /// receives the block
        buf: &'a mut Sector,
    },
    /// [`WRITE_FILE`]
    WriteFile {
        /// inode of an open file
        inode: i64,
        /// block index
        block: i64,
        /// data to write
        buf: &'a Sector,
    },
    /// [`CLOSE_FILE`]
    CloseFile {
        /// inode of an open file
        inode: i64,
    },
    /// [`DIR_CONTENTS`]
    DirContents,
}

impl SystemCall<'_> {
    /// System call number
    pub fn number(&self) -> usize {
        match self {
            SystemCall::MemRead { .. } => MEM_READ,
            SystemCall::MemWrite { .. } => MEM_WRITE,
            SystemCall::GetTimeOfDay => GET_TIME_OF_DAY,
            SystemCall::Sleep { .. } => SLEEP,
            SystemCall::GetProcessId { .. } => GET_PROCESS_ID,
            SystemCall::CreateProcess { .. } => CREATE_PROCESS,
            SystemCall::TerminateProcess { .. } => TERMINATE_PROCESS,
            SystemCall::SuspendProcess { .. } => SUSPEND_PROCESS,
            SystemCall::ResumeProcess { .. } => RESUME_PROCESS,
            SystemCall::ChangePriority { .. } => CHANGE_PRIORITY,
            SystemCall::PhysicalDiskRead { .. } => PHYSICAL_DISK_READ,
            SystemCall::PhysicalDiskWrite { .. } => PHYSICAL_DISK_WRITE,
            SystemCall::CheckDisk { .. } => CHECK_DISK,
            SystemCall::Format { .. } => FORMAT,
            SystemCall::OpenDir { .. } => OPEN_DIR,
            SystemCall::OpenFile { .. } => OPEN_FILE,
            SystemCall::CreateDir { .. } => CREATE_DIR,
            SystemCall::CreateFile { .. } => CREATE_FILE,
            SystemCall::ReadFile { .. } => READ_FILE,
            SystemCall::WriteFile { .. } => WRITE_FILE,
            SystemCall::CloseFile { .. } => CLOSE_FILE,
            SystemCall::DirContents => DIR_CONTENTS,
        }
    }
}

impl Display for SystemCall<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}(", syscall_name(self.number()))?;
        match self {
            SystemCall::MemRead { address } => write!(f, "{:#x}", address)?,
            SystemCall::MemWrite { address, value } => write!(f, "{:#x}, {}", address, value)?,
            SystemCall::Sleep { ticks } => write!(f, "{}", ticks)?,
            SystemCall::GetProcessId { name }
            | SystemCall::OpenFile { name }
            | SystemCall::CreateDir { name }
            | SystemCall::CreateFile { name } => write!(f, "{:?}", name)?,
            SystemCall::CreateProcess { name, priority, .. } => {
                write!(f, "{:?}, {}", name, priority)?
            }
            SystemCall::TerminateProcess { pid }
            | SystemCall::SuspendProcess { pid }
            | SystemCall::ResumeProcess { pid } => write!(f, "{}", pid)?,
            SystemCall::ChangePriority { pid, priority } => write!(f, "{}, {}", pid, priority)?,
            SystemCall::PhysicalDiskRead { disk, sector, .. }
            | SystemCall::PhysicalDiskWrite { disk, sector, .. } => {
                write!(f, "{}, {}", disk, sector)?
            }
            SystemCall::CheckDisk { disk } | SystemCall::Format { disk } => write!(f, "{}", disk)?,
            SystemCall::OpenDir { disk, name } => write!(f, "{}, {:?}", disk, name)?,
            SystemCall::ReadFile { inode, block, .. } | SystemCall::WriteFile { inode, block, .. } => {
                write!(f, "{}, {}", inode, block)?
            }
            SystemCall::CloseFile { inode } => write!(f, "{}", inode)?,
            SystemCall::GetTimeOfDay | SystemCall::DirContents => {}
        }
        write!(f, ")")
    }
}

/// Value produced by a successful system call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyscallValue {
    /// nothing
    None,
    /// a time in ticks
    Time(u64),
    /// a process id
    Pid(Pid),
    /// a word of memory
    Word(u32),
    /// an inode number
    Inode(u8),
    /// a directory listing
    Entries(Vec<DirectoryEntry>),
    /// sectors written to a disk
    SectorsWritten(usize),
}

/// What a system call hands back: a value and a status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyscallReturn {
    /// result, [`SyscallValue::None`] on failure
    pub value: SyscallValue,
    /// [`ErrorCode::Success`] or the reason for failure
    pub status: ErrorCode,
}

impl SyscallReturn {
    /// Whether the call succeeded
    pub fn is_success(&self) -> bool {
        self.status == ErrorCode::Success
    }
}

/// internal syscall module
mod service;

impl Kernel {
    /// Dispatch a system call made by the running process
    pub fn svc(&self, call: SystemCall<'_>) -> SyscallReturn {
        let number = call.number();
        trace!("syscall: {}", call);
        if self.diagnostics.syscalls.allow() {
            info!("SVC {} at {}: {}", number, self.hw.clock(), call);
        }

        match service::handle(self, call) {
            Ok(value) => SyscallReturn {
                value,
                status: ErrorCode::Success,
            },
            Err(err) => {
                warn!("syscall: {} failed: {}", syscall_name(number), err);
                SyscallReturn {
                    value: SyscallValue::None,
                    status: ErrorCode::from(&err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::hw::SimMachine;
    use crate::internal::kernel::KernelConfig;
    use std::sync::Arc;

    /// test the status code of each error class
    #[test]
    fn test_error_codes() {
        assert_eq!(
            ErrorCode::from(&KernelError::BadParam("x")),
            ErrorCode::BadParam
        );
        assert_eq!(
            ErrorCode::from(&KernelError::Device(DeviceError::DiskInUse)),
            ErrorCode::DiskInUse
        );
        assert_eq!(ErrorCode::Success as i64, 0);
        assert_eq!(ErrorCode::BadParam as i64, 1);
    }

    /// test system call names and numbers
    #[test]
    fn test_syscall_names() {
        assert_eq!(syscall_name(SLEEP), "sleep");
        assert_eq!(syscall_name(DIR_CONTENTS), "dir_contents");
        assert_eq!(syscall_name(0xFFF), "<unknown>");
        let call = SystemCall::ChangePriority {
            pid: 3,
            priority: 10,
        };
        assert_eq!(call.number(), CHANGE_PRIORITY);
        assert_eq!(call.to_string(), "change_priority(3, 10)");
    }

    /// test that calls from outside a process fail with a status instead of panicking
    #[test]
    fn test_svc_without_process() {
        let kernel = Kernel::boot(Arc::new(SimMachine::default()), KernelConfig::default());
        let ret = kernel.svc(SystemCall::GetTimeOfDay);
        assert_eq!(ret.value, SyscallValue::Time(0));
        assert!(ret.is_success());

        let ret = kernel.svc(SystemCall::GetProcessId { name: "" });
        assert_eq!(ret.status, ErrorCode::BadParam);

        let ret = kernel.svc(SystemCall::CreateProcess {
            name: "child",
            priority: 31,
            entry: Box::new(|_| {}),
        });
        assert_eq!(ret.status, ErrorCode::BadParam);
        assert_eq!(kernel.process_count(), 0);

        let ret = kernel.svc(SystemCall::CheckDisk { disk: 8 });
        assert_eq!(ret.status, ErrorCode::BadDeviceId);
        let ret = kernel.svc(SystemCall::ResumeProcess { pid: -1 });
        assert_eq!(ret.status, ErrorCode::BadParam);
    }
}
