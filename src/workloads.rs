//! Demo workloads, selectable by name from the command line.
//!
//! Each workload is the body of the lead process. The machine halts when it returns.

use hashbrown::HashMap;
use lazy_static::lazy_static;

use crate::internal::{
    hw::{NUMBER_PHYSICAL_PAGES, PGSIZE, Sector},
    kernel::Kernel,
    process::{FAVORABLE_PRIORITY, LEAST_FAVORABLE_PRIORITY, NORMAL_PRIORITY, ProcessEntry},
    syscall::{SyscallValue, SystemCall},
};
use crate::kprintln;

/// A runnable demo
#[derive(Debug, Clone, Copy)]
pub struct Workload {
    /// one-line summary
    pub description: &'static str,
    /// body of the lead process
    pub entry: fn(&Kernel),
}

lazy_static! {
    /// Every workload, by name
    pub static ref WORKLOADS: HashMap<&'static str, Workload> = {
        let mut workloads = HashMap::new();
        workloads.insert("sample", Workload {
            description: "a few system calls and two sleeping children",
            entry: sample,
        });
        workloads.insert("sleepers", Workload {
            description: "five processes sleeping for different times",
            entry: sleepers,
        });
        workloads.insert("priorities", Workload {
            description: "processes at different priorities competing for the processor",
            entry: priorities,
        });
        workloads.insert("suspend", Workload {
            description: "suspend and resume, including the error cases",
            entry: suspend,
        });
        workloads.insert("disk", Workload {
            description: "physical sector reads and writes on several disks",
            entry: disk,
        });
        workloads.insert("fs", Workload {
            description: "format a disk, build directories and files, list them",
            entry: file_system,
        });
        workloads.insert("paging", Workload {
            description: "two processes touching more pages than there are frames",
            entry: paging,
        });
        workloads
    };
}

/// Names of every workload, sorted
pub fn workload_names() -> Vec<&'static str> {
    let mut names: Vec<_> = WORKLOADS.keys().copied().collect();
    names.sort_unstable();
    names
}

fn spawn(kernel: &Kernel, name: &str, priority: i64, entry: ProcessEntry) -> Option<u32> {
    let ret = kernel.svc(SystemCall::CreateProcess {
        name,
        priority,
        entry,
    });
    match ret.value {
        SyscallValue::Pid(pid) => Some(pid),
        _ => {
            kprintln!("could not create {}: {}", name, ret.status);
            None
        }
    }
}

fn sleep(kernel: &Kernel, ticks: i64) {
    kernel.svc(SystemCall::Sleep { ticks });
}

fn now(kernel: &Kernel) -> u64 {
    match kernel.svc(SystemCall::GetTimeOfDay).value {
        SyscallValue::Time(time) => time,
        _ => 0,
    }
}

/// Sleep until none of `names` is alive
fn wait_for(kernel: &Kernel, names: &[&str]) {
    loop {
        let alive = names
            .iter()
            .any(|name| kernel.svc(SystemCall::GetProcessId { name }).is_success());
        if !alive {
            return;
        }
        sleep(kernel, 20);
    }
}

fn sleeper(ticks: i64) -> ProcessEntry {
    Box::new(move |kernel| {
        let start = now(kernel);
        sleep(kernel, ticks);
        let pid = kernel.current_pid().unwrap_or_default();
        kprintln!(
            "process {} slept {} ticks, woke at {} (asked for {})",
            pid,
            now(kernel) - start,
            now(kernel),
            ticks
        );
    })
}

fn sample(kernel: &Kernel) {
    kprintln!("time is {}", now(kernel));
    if let SyscallValue::Pid(pid) = kernel.svc(SystemCall::GetProcessId { name: "" }).value {
        kprintln!("lead process is {}", pid);
    }
    spawn(kernel, "first", NORMAL_PRIORITY, sleeper(5));
    spawn(kernel, "second", NORMAL_PRIORITY, sleeper(3));
    spawn(kernel, "first", NORMAL_PRIORITY, sleeper(1));
    wait_for(kernel, &["first", "second"]);
    kprintln!("sample done at {}", now(kernel));
}

fn sleepers(kernel: &Kernel) {
    let names = ["s1", "s2", "s3", "s4", "s5"];
    for (n, name) in names.iter().enumerate() {
        spawn(kernel, name, NORMAL_PRIORITY, sleeper(50 - 10 * n as i64));
    }
    wait_for(kernel, &names);
}

fn priorities(kernel: &Kernel) {
    let names = ["fast", "normal", "slow"];
    let levels = [FAVORABLE_PRIORITY, NORMAL_PRIORITY, LEAST_FAVORABLE_PRIORITY];
    for (name, priority) in names.iter().zip(levels) {
        let label = name.to_string();
        spawn(
            kernel,
            name,
            priority,
            Box::new(move |kernel| {
                for round in 0..3 {
                    kprintln!("{} round {} at {}", label, round, now(kernel));
                    sleep(kernel, 10);
                }
            }),
        );
    }
    if let SyscallValue::Pid(slow) = kernel.svc(SystemCall::GetProcessId { name: "slow" }).value {
        kernel.svc(SystemCall::ChangePriority {
            pid: slow as i64,
            priority: 5,
        });
    }
    wait_for(kernel, &names);
}

fn suspend(kernel: &Kernel) {
    let Some(child) = spawn(kernel, "victim", NORMAL_PRIORITY, sleeper(30)) else {
        return;
    };
    let pid = child as i64;
    sleep(kernel, 5);
    kprintln!("suspend: {}", kernel.svc(SystemCall::SuspendProcess { pid }).status);
    kprintln!("suspend again: {}", kernel.svc(SystemCall::SuspendProcess { pid }).status);
    sleep(kernel, 40);
    kprintln!("resume: {}", kernel.svc(SystemCall::ResumeProcess { pid }).status);
    kprintln!("resume again: {}", kernel.svc(SystemCall::ResumeProcess { pid }).status);
    kprintln!("resume self: {}", kernel.svc(SystemCall::ResumeProcess { pid: -1 }).status);
    wait_for(kernel, &["victim"]);
}

fn disk(kernel: &Kernel) {
    for unit in 0..4i64 {
        let mut data: Sector = [0; PGSIZE];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (unit as u8) << 4 | i as u8;
        }
        let sector = 100 + unit * 7;
        kernel.svc(SystemCall::PhysicalDiskWrite {
            disk: unit,
            sector,
            buf: &data,
        });
        let mut back = [0; PGSIZE];
        kernel.svc(SystemCall::PhysicalDiskRead {
            disk: unit,
            sector,
            buf: &mut back,
        });
        kprintln!("disk {} sector {}: match = {}", unit, sector, back == data);
    }
    let ret = kernel.svc(SystemCall::PhysicalDiskWrite {
        disk: 12,
        sector: 0,
        buf: &[0; PGSIZE],
    });
    kprintln!("write to disk 12: {}", ret.status);
    if let SyscallValue::SectorsWritten(count) = kernel.svc(SystemCall::CheckDisk { disk: 0 }).value
    {
        kprintln!("disk 0 has {} sectors written", count);
    }
}

fn file_system(kernel: &Kernel) {
    kernel.svc(SystemCall::Format { disk: 1 });
    kernel.svc(SystemCall::OpenDir {
        disk: 1,
        name: "root",
    });
    kernel.svc(SystemCall::CreateDir { name: "docs" });
    kernel.svc(SystemCall::CreateFile { name: "readme" });
    kernel.svc(SystemCall::OpenDir {
        disk: -1,
        name: "docs",
    });

    let SyscallValue::Inode(inode) = kernel.svc(SystemCall::OpenFile { name: "a" }).value else {
        return;
    };
    for block in [0i64, 9, 70] {
        let data = [block as u8 + 1; PGSIZE];
        kernel.svc(SystemCall::WriteFile {
            inode: inode as i64,
            block,
            buf: &data,
        });
    }
    kernel.svc(SystemCall::CloseFile {
        inode: inode as i64,
    });

    let SyscallValue::Inode(inode) = kernel.svc(SystemCall::OpenFile { name: "a" }).value else {
        return;
    };
    let mut buf = [0; PGSIZE];
    for block in [0i64, 9, 70, 3] {
        let ret = kernel.svc(SystemCall::ReadFile {
            inode: inode as i64,
            block,
            buf: &mut buf,
        });
        kprintln!("block {}: {} first byte {:#04x}", block, ret.status, buf[0]);
    }
    kernel.svc(SystemCall::DirContents);
    kernel.svc(SystemCall::OpenDir {
        disk: -1,
        name: "root",
    });
    kernel.svc(SystemCall::DirContents);
}

fn toucher(pages: usize) -> ProcessEntry {
    Box::new(move |kernel| {
        for page in 0..pages {
            kernel.svc(SystemCall::MemWrite {
                address: (page * PGSIZE) as i64,
                value: page as u32,
            });
        }
        let mut wrong = 0;
        for page in 0..pages {
            let ret = kernel.svc(SystemCall::MemRead {
                address: (page * PGSIZE) as i64,
            });
            if ret.value != SyscallValue::Word(page as u32) {
                wrong += 1;
            }
        }
        kprintln!("{} pages checked, {} wrong", pages, wrong);
    })
}

fn paging(kernel: &Kernel) {
    spawn(kernel, "pager1", NORMAL_PRIORITY, toucher(NUMBER_PHYSICAL_PAGES));
    spawn(kernel, "pager2", NORMAL_PRIORITY, toucher(NUMBER_PHYSICAL_PAGES / 2));
    wait_for(kernel, &["pager1", "pager2"]);
    kprintln!("{} pages on the swap disk", kernel.swapped_pages());
}
