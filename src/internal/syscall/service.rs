use super::*;

use crate::internal::{hw::DiskId, process::ProcessTarget};
use crate::kprintln;

fn disk_id(disk: i64) -> Result<DiskId, KernelError> {
    DiskId::try_from(disk).map_err(|_| KernelError::Device(DeviceError::BadDeviceId))
}

fn sector(sector: i64) -> Result<u16, KernelError> {
    u16::try_from(sector).map_err(|_| KernelError::Device(DeviceError::IllegalAddress))
}

fn inode(inode: i64) -> Result<u8, KernelError> {
    u8::try_from(inode).map_err(|_| KernelError::BadParam("invalid inode"))
}

fn block(block: i64) -> Result<usize, KernelError> {
    usize::try_from(block).map_err(|_| KernelError::BadParam("invalid block"))
}

fn address(address: i64) -> Result<usize, KernelError> {
    usize::try_from(address).map_err(|_| KernelError::BadParam("invalid address"))
}

/// run a system call (every SVC)
pub fn handle(kernel: &Kernel, call: SystemCall<'_>) -> Result<SyscallValue, KernelError> {
    match call {
        SystemCall::MemRead { address: at } => kernel
            .memory_read(address(at)?)
            .map(SyscallValue::Word),
        SystemCall::MemWrite { address: at, value } => {
            kernel.memory_write(address(at)?, value)?;
            Ok(SyscallValue::None)
        }
        SystemCall::GetTimeOfDay => Ok(SyscallValue::Time(kernel.time())),
        SystemCall::Sleep { ticks } => {
            let ticks = u64::try_from(ticks).map_err(|_| KernelError::BadParam("negative sleep"))?;
            kernel.sleep(ticks)?;
            Ok(SyscallValue::None)
        }
        SystemCall::GetProcessId { name } => kernel.get_process_id(name).map(SyscallValue::Pid),
        SystemCall::CreateProcess {
            name,
            priority,
            entry,
        } => kernel
            .create_process(name, priority, entry)
            .map(SyscallValue::Pid),
        SystemCall::TerminateProcess { pid } => {
            kernel.terminate(ProcessTarget::try_from(pid)?)?;
            Ok(SyscallValue::None)
        }
        SystemCall::SuspendProcess { pid } => {
            kernel.suspend(ProcessTarget::try_from(pid)?)?;
            Ok(SyscallValue::None)
        }
        SystemCall::ResumeProcess { pid } => {
            kernel.resume(ProcessTarget::try_from(pid)?)?;
            Ok(SyscallValue::None)
        }
        SystemCall::ChangePriority { pid, priority } => {
            kernel.change_priority(ProcessTarget::try_from(pid)?, priority)?;
            Ok(SyscallValue::None)
        }
        SystemCall::PhysicalDiskRead {
            disk,
            sector: at,
            buf,
        } => {
            kernel.physical_disk_read(disk_id(disk)?, sector(at)?, buf)?;
            Ok(SyscallValue::None)
        }
        SystemCall::PhysicalDiskWrite {
            disk,
            sector: at,
            buf,
        } => {
            kernel.physical_disk_write(disk_id(disk)?, sector(at)?, buf)?;
            Ok(SyscallValue::None)
        }
        SystemCall::CheckDisk { disk } => kernel
            .check_disk(disk_id(disk)?)
            .map(SyscallValue::SectorsWritten),
        SystemCall::Format { disk } => {
            kernel.format(disk_id(disk)?)?;
            Ok(SyscallValue::None)
        }
        SystemCall::OpenDir { disk, name } => {
            let disk = match disk {
                -1 => None,
                disk => Some(disk_id(disk)?),
            };
            kernel.open_directory(disk, name)?;
            Ok(SyscallValue::None)
        }
        SystemCall::OpenFile { name } => kernel.open_file(name).map(SyscallValue::Inode),
        SystemCall::CreateDir { name } => {
            kernel.create_directory(name)?;
            Ok(SyscallValue::None)
        }
        SystemCall::CreateFile { name } => {
            kernel.create_file(name)?;
            Ok(SyscallValue::None)
        }
        SystemCall::ReadFile {
            inode: file,
            block: at,
            buf,
        } => {
            kernel.read_file(inode(file)?, block(at)?, buf)?;
            Ok(SyscallValue::None)
        }
        SystemCall::WriteFile {
            inode: file,
            block: at,
            buf,
        } => {
            kernel.write_file(inode(file)?, block(at)?, buf)?;
            Ok(SyscallValue::None)
        }
        SystemCall::CloseFile { inode: file } => {
            kernel.close_file(inode(file)?)?;
            Ok(SyscallValue::None)
        }
        SystemCall::DirContents => {
            let entries = kernel.directory_contents()?;
            kprintln!("Inode Name    Type Created  Size");
            for entry in &entries {
                kprintln!("  {}", entry);
            }
            Ok(SyscallValue::Entries(entries))
        }
    }
}
