use std::sync::Arc;

use simnix::{
    ErrorCode, Kernel, KernelConfig, KernelError, ProcessTarget, SimMachine, SyscallValue,
    SystemCall, internal::process::ProcessStatus,
};
use spin::Mutex;

fn boot() -> Arc<Kernel> {
    Kernel::boot(Arc::new(SimMachine::default()), KernelConfig::default())
}

type Log = Arc<Mutex<Vec<(&'static str, u64)>>>;

fn record_after_sleep(log: &Log, name: &'static str, ticks: u64) -> simnix::ProcessEntry {
    let log = log.clone();
    Box::new(move |kernel| {
        kernel.sleep(ticks).unwrap();
        log.lock().push((name, kernel.time()));
    })
}

/// test that sleeps of 5 and 3 ticks wake the shorter one first, each on time
#[test]
fn test_sleep_order() {
    let kernel = boot();
    let log: Log = Arc::default();
    let entry_log = log.clone();
    kernel
        .run(
            "lead",
            Box::new(move |kernel| {
                kernel
                    .create_process("five", 20, record_after_sleep(&entry_log, "five", 5))
                    .unwrap();
                kernel
                    .create_process("three", 20, record_after_sleep(&entry_log, "three", 3))
                    .unwrap();
                kernel.sleep(4).unwrap();
                entry_log.lock().push(("lead", kernel.time()));
                kernel.sleep(10).unwrap();
            }),
        )
        .unwrap();

    assert_eq!(
        *log.lock(),
        vec![("three", 3), ("lead", 4), ("five", 5)]
    );
}

/// test that the ready queue runs favorable priorities first, in creation order within one
#[test]
fn test_priority_order() {
    let kernel = boot();
    let log: Log = Arc::default();
    let entry_log = log.clone();
    kernel
        .run(
            "lead",
            Box::new(move |kernel| {
                for (name, priority) in [("low", 30), ("high", 10), ("mid", 20), ("high2", 10)] {
                    let log = entry_log.clone();
                    kernel
                        .create_process(
                            name,
                            priority,
                            Box::new(move |kernel| log.lock().push((name, kernel.time()))),
                        )
                        .unwrap();
                }
                kernel.sleep(5).unwrap();
            }),
        )
        .unwrap();

    let order: Vec<_> = log.lock().iter().map(|(name, _)| *name).collect();
    assert_eq!(order, vec!["high", "high2", "mid", "low"]);
}

/// test that process ids increase and duplicate names are refused through the system call
#[test]
fn test_create_process_syscall() {
    let kernel = boot();
    let pids = Arc::new(Mutex::new(Vec::new()));
    let seen = pids.clone();
    kernel
        .run(
            "lead",
            Box::new(move |kernel| {
                let me = kernel.svc(SystemCall::GetProcessId { name: "" });
                let SyscallValue::Pid(me) = me.value else {
                    panic!("no pid for the lead process");
                };
                seen.lock().push(me);
                for name in ["a", "b", "a"] {
                    let ret = kernel.svc(SystemCall::CreateProcess {
                        name,
                        priority: 20,
                        entry: Box::new(|_| {}),
                    });
                    match ret.value {
                        SyscallValue::Pid(pid) => seen.lock().push(pid),
                        _ => assert_eq!(ret.status, ErrorCode::BadParam),
                    }
                }
                assert_eq!(kernel.process_count(), 3);
                kernel.sleep(1).unwrap();
            }),
        )
        .unwrap();

    let pids = pids.lock();
    assert_eq!(pids.len(), 3);
    assert!(pids.windows(2).all(|pair| pair[0] < pair[1]));
}

/// test that a process suspended while asleep misses its wake-up and runs once resumed
#[test]
fn test_suspend_sleeping_process() {
    let kernel = boot();
    let log: Log = Arc::default();
    let entry_log = log.clone();
    kernel
        .run(
            "lead",
            Box::new(move |kernel| {
                let child = kernel
                    .create_process("child", 20, record_after_sleep(&entry_log, "child", 10))
                    .unwrap();
                kernel.sleep(2).unwrap();

                kernel.suspend(ProcessTarget::Pid(child)).unwrap();
                let snapshot = kernel.schedule_snapshot();
                assert_eq!(snapshot.suspended, vec![child]);
                assert_eq!(snapshot.timer_suspended, vec![child]);
                assert!(!snapshot.ready.contains(&child));
                assert!(!snapshot.timer.contains(&child));
                assert_eq!(
                    kernel.suspend(ProcessTarget::Pid(child)),
                    Err(KernelError::BadParam("process is already suspended"))
                );

                kernel.sleep(20).unwrap();
                assert!(entry_log.lock().is_empty());

                kernel.resume(ProcessTarget::Pid(child)).unwrap();
                let snapshot = kernel.schedule_snapshot();
                assert_eq!(snapshot.ready, vec![child]);
                assert!(snapshot.suspended.is_empty());
                assert!(kernel.resume(ProcessTarget::Pid(child)).is_err());
                kernel.sleep(1).unwrap();
            }),
        )
        .unwrap();

    let log = log.lock();
    assert_eq!(log.len(), 1);
    assert!(log[0].1 >= 22);
}

/// test that resuming a process whose wake time is still ahead puts it back to sleep
#[test]
fn test_resume_restores_sleep() {
    let kernel = boot();
    let log: Log = Arc::default();
    let entry_log = log.clone();
    kernel
        .run(
            "lead",
            Box::new(move |kernel| {
                let child = kernel
                    .create_process("child", 20, record_after_sleep(&entry_log, "child", 50))
                    .unwrap();
                kernel.sleep(2).unwrap();
                kernel.suspend(ProcessTarget::Pid(child)).unwrap();
                kernel.sleep(2).unwrap();
                kernel.resume(ProcessTarget::Pid(child)).unwrap();
                let snapshot = kernel.schedule_snapshot();
                assert_eq!(snapshot.timer, vec![child]);
                assert!(snapshot.ready.is_empty());
                kernel.sleep(100).unwrap();
            }),
        )
        .unwrap();

    assert_eq!(*log.lock(), vec![("child", 50)]);
}

/// test that a process can suspend itself and be resumed by another
#[test]
fn test_self_suspend() {
    let kernel = boot();
    let log: Log = Arc::default();
    let entry_log = log.clone();
    kernel
        .run(
            "lead",
            Box::new(move |kernel| {
                let log = entry_log.clone();
                let child = kernel
                    .create_process(
                        "child",
                        20,
                        Box::new(move |kernel| {
                            kernel.suspend(ProcessTarget::Current).unwrap();
                            log.lock().push(("child", kernel.time()));
                        }),
                    )
                    .unwrap();
                kernel.sleep(3).unwrap();
                assert_eq!(kernel.process_status(child), Some(ProcessStatus::Suspended));
                assert!(entry_log.lock().is_empty());
                kernel.resume(ProcessTarget::Pid(child)).unwrap();
                kernel.sleep(3).unwrap();
                assert_eq!(kernel.process_status(child), Some(ProcessStatus::Terminated));
            }),
        )
        .unwrap();

    assert_eq!(*log.lock(), vec![("child", 3)]);
}

/// test that terminate-and-halt from a child stops the machine
#[test]
fn test_terminate_and_halt() {
    let kernel = boot();
    let lead_done = Arc::new(Mutex::new(false));
    let flag = lead_done.clone();
    kernel
        .run(
            "lead",
            Box::new(move |kernel| {
                kernel
                    .create_process(
                        "stopper",
                        20,
                        Box::new(|kernel| {
                            kernel.sleep(5).unwrap();
                            kernel.terminate(ProcessTarget::CurrentAndHalt).unwrap();
                        }),
                    )
                    .unwrap();
                kernel.sleep(100).unwrap();
                *flag.lock() = true;
            }),
        )
        .unwrap();

    assert!(!*lead_done.lock());
    assert_eq!(kernel.time(), 5);
    let snapshot = kernel.schedule_snapshot();
    assert_eq!(snapshot.terminated, vec![2]);
    assert_eq!(snapshot.timer, vec![1]);
}

/// test terminating another process removes it from every queue
#[test]
fn test_terminate_other() {
    let kernel = boot();
    kernel
        .run(
            "lead",
            Box::new(|kernel| {
                let sleeper = kernel
                    .create_process("sleeper", 20, Box::new(|kernel| kernel.sleep(50).unwrap()))
                    .unwrap();
                kernel.sleep(1).unwrap();
                assert!(kernel.schedule_snapshot().timer.contains(&sleeper));

                let ret = kernel.svc(SystemCall::TerminateProcess {
                    pid: sleeper as i64,
                });
                assert!(ret.is_success());
                let snapshot = kernel.schedule_snapshot();
                assert!(!snapshot.timer.contains(&sleeper));
                assert_eq!(snapshot.terminated, vec![sleeper]);

                let ret = kernel.svc(SystemCall::TerminateProcess {
                    pid: sleeper as i64,
                });
                assert_eq!(ret.status, ErrorCode::BadParam);
            }),
        )
        .unwrap();

    assert_eq!(kernel.process_count(), 0);
}

/// test changing the priority of a ready process re-sorts the ready queue
#[test]
fn test_change_priority_resorts() {
    let kernel = boot();
    let log: Log = Arc::default();
    let entry_log = log.clone();
    kernel
        .run(
            "lead",
            Box::new(move |kernel| {
                let mut pids = Vec::new();
                for name in ["first", "second"] {
                    let log = entry_log.clone();
                    pids.push(
                        kernel
                            .create_process(
                                name,
                                20,
                                Box::new(move |kernel| log.lock().push((name, kernel.time()))),
                            )
                            .unwrap(),
                    );
                }
                let ret = kernel.svc(SystemCall::ChangePriority {
                    pid: pids[1] as i64,
                    priority: 3,
                });
                assert!(ret.is_success());
                let ret = kernel.svc(SystemCall::ChangePriority {
                    pid: pids[0] as i64,
                    priority: 0,
                });
                assert_eq!(ret.status, ErrorCode::BadParam);
                kernel.sleep(1).unwrap();
            }),
        )
        .unwrap();

    let order: Vec<_> = log.lock().iter().map(|(name, _)| *name).collect();
    assert_eq!(order, vec!["second", "first"]);
}

/// test that two processes writing one disk through the system calls wake in issue order
#[test]
fn test_physical_disk_waiters_wake_in_order() {
    let kernel = boot();
    let log: Log = Arc::default();
    let entry_log = log.clone();
    kernel
        .run(
            "lead",
            Box::new(move |kernel| {
                for (name, sector) in [("a", 3i64), ("b", 4i64)] {
                    let log = entry_log.clone();
                    kernel
                        .create_process(
                            name,
                            20,
                            Box::new(move |kernel| {
                                let data = [sector as u8; 16];
                                let ret = kernel.svc(SystemCall::PhysicalDiskWrite {
                                    disk: 1,
                                    sector,
                                    buf: &data,
                                });
                                assert!(ret.is_success());
                                log.lock().push((name, kernel.time()));

                                let mut buf = [0; 16];
                                let ret = kernel.svc(SystemCall::PhysicalDiskRead {
                                    disk: 1,
                                    sector,
                                    buf: &mut buf,
                                });
                                assert!(ret.is_success());
                                assert_eq!(buf, data);
                            }),
                        )
                        .unwrap();
                }
                kernel.sleep(50).unwrap();

                let ret = kernel.svc(SystemCall::CheckDisk { disk: 1 });
                assert_eq!(ret.value, SyscallValue::SectorsWritten(2));
                let ret = kernel.svc(SystemCall::PhysicalDiskWrite {
                    disk: 1,
                    sector: 70_000,
                    buf: &[0; 16],
                });
                assert_ne!(ret.status, ErrorCode::Success);
            }),
        )
        .unwrap();

    assert_eq!(*log.lock(), vec![("a", 2), ("b", 4)]);
}

/// test that suspending a process blocked on a disk cancels its wake-up until resumed
#[test]
fn test_suspend_process_waiting_on_disk() {
    let kernel = boot();
    let log: Log = Arc::default();
    let entry_log = log.clone();
    kernel
        .run(
            "lead",
            Box::new(move |kernel| {
                let log = entry_log.clone();
                let child = kernel
                    .create_process(
                        "io",
                        20,
                        Box::new(move |kernel| {
                            kernel.physical_disk_write(1, 5, &[9; 16]).unwrap();
                            log.lock().push(("io", kernel.time()));
                        }),
                    )
                    .unwrap();
                kernel.sleep(1).unwrap();
                assert_eq!(kernel.schedule_snapshot().disk, vec![child]);

                kernel.suspend(ProcessTarget::Pid(child)).unwrap();
                let snapshot = kernel.schedule_snapshot();
                assert!(snapshot.disk.is_empty());
                assert_eq!(snapshot.suspended, vec![child]);
                entry_log.lock().push(("suspended", kernel.time()));

                kernel.sleep(10).unwrap();
                assert_eq!(kernel.process_status(child), Some(ProcessStatus::Suspended));
                entry_log.lock().push(("resumed", kernel.time()));
                kernel.resume(ProcessTarget::Pid(child)).unwrap();
                kernel.sleep(5).unwrap();
            }),
        )
        .unwrap();

    assert_eq!(
        *log.lock(),
        vec![("suspended", 1), ("resumed", 11), ("io", 11)]
    );
}

/// test that every process sees its own id after each return from the dispatcher
#[test]
fn test_current_pid_follows_dispatch() {
    let kernel = boot();
    let mismatches = Arc::new(Mutex::new(Vec::new()));
    let seen = mismatches.clone();
    kernel
        .run(
            "lead",
            Box::new(move |kernel| {
                for (n, name) in ["w1", "w2", "w3", "w4"].into_iter().enumerate() {
                    let seen = seen.clone();
                    kernel
                        .create_process(
                            name,
                            10 + n as i64,
                            Box::new(move |kernel| {
                                let me = kernel.get_process_id(name).unwrap();
                                for round in 0..12u64 {
                                    kernel.sleep(1 + (round + n as u64) % 3).unwrap();
                                    if kernel.current_pid() != Ok(me) {
                                        seen.lock().push((name, round));
                                    }
                                    kernel
                                        .physical_disk_write(2, n as u16, &[round as u8; 16])
                                        .unwrap();
                                    let ret = kernel.svc(SystemCall::GetProcessId { name: "" });
                                    if ret.value != SyscallValue::Pid(me) {
                                        seen.lock().push((name, round));
                                    }
                                }
                            }),
                        )
                        .unwrap();
                }
                kernel.sleep(500).unwrap();
                assert_eq!(kernel.process_count(), 1);
            }),
        )
        .unwrap();

    assert!(mismatches.lock().is_empty(), "{:?}", mismatches.lock());
}
