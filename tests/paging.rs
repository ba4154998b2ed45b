use std::sync::Arc;

use simnix::{
    ErrorCode, Kernel, KernelConfig, KernelError, SimMachine, SyscallValue, SystemCall,
    internal::hw::{FaultKind, NUMBER_PHYSICAL_PAGES, PGSIZE},
};
use spin::Mutex;

fn boot() -> Arc<Kernel> {
    Kernel::boot(Arc::new(SimMachine::default()), KernelConfig::default())
}

fn address(page: usize) -> usize {
    page * PGSIZE
}

fn touch(kernel: &Kernel, pages: core::ops::Range<usize>, seed: u32) {
    for page in pages {
        kernel
            .memory_write(address(page), seed ^ page as u32)
            .unwrap();
    }
}

fn check(kernel: &Kernel, pages: core::ops::Range<usize>, seed: u32) -> usize {
    pages
        .filter(|page| kernel.memory_read(address(*page)) != Ok(seed ^ *page as u32))
        .count()
}

/// test that a process touching more pages than there are frames reads back every value
#[test]
fn test_pages_survive_eviction() {
    let kernel = boot();
    kernel
        .run(
            "lead",
            Box::new(|kernel| {
                let pages = NUMBER_PHYSICAL_PAGES + 16;
                touch(kernel, 0..pages, 0xBEEF);
                assert!(kernel.swapped_pages() >= 16);
                assert_eq!(check(kernel, 0..pages, 0xBEEF), 0);

                let ret = kernel.svc(SystemCall::MemRead {
                    address: address(pages - 1) as i64,
                });
                assert_eq!(ret.value, SyscallValue::Word(0xBEEF ^ (pages as u32 - 1)));
            }),
        )
        .unwrap();
}

/// test that valid page table entries and bound frames always agree
#[test]
fn test_page_table_matches_frames() {
    let kernel = boot();
    kernel
        .run(
            "lead",
            Box::new(|kernel| {
                touch(kernel, 0..NUMBER_PHYSICAL_PAGES + 8, 7);
                let me = kernel.current_pid().unwrap();
                let table = kernel.page_table_of(me).unwrap();

                let mut mapped: Vec<_> = table
                    .valid_pages()
                    .into_iter()
                    .map(|(page, entry)| (entry.frame(), me, page))
                    .collect();
                mapped.sort_unstable();
                let mut bound = kernel.frame_snapshot();
                bound.sort_unstable();
                assert_eq!(mapped, bound);
                assert_eq!(bound.len(), NUMBER_PHYSICAL_PAGES);
            }),
        )
        .unwrap();
}

/// test that a process short of frames evicts its own pages, not a sleeping process's
#[test]
fn test_eviction_scoped_to_faulting_process() {
    let kernel = boot();
    let results = Arc::new(Mutex::new(Vec::new()));
    let seen = results.clone();
    kernel
        .run(
            "lead",
            Box::new(move |kernel| {
                let a_seen = seen.clone();
                kernel
                    .create_process(
                        "a",
                        20,
                        Box::new(move |kernel| {
                            touch(kernel, 0..40, 0xA);
                            kernel.sleep(1000).unwrap();
                            a_seen.lock().push(("a wrong", check(kernel, 0..40, 0xA)));
                        }),
                    )
                    .unwrap();
                let b_seen = seen.clone();
                kernel
                    .create_process(
                        "b",
                        20,
                        Box::new(move |kernel| {
                            touch(kernel, 0..34, 0xB);
                            b_seen.lock().push(("b wrong", check(kernel, 0..34, 0xB)));

                            let a = kernel.get_process_id("a").unwrap();
                            let a_table = kernel.page_table_of(a).unwrap();
                            b_seen.lock().push(("a valid", a_table.valid_pages().len()));
                        }),
                    )
                    .unwrap();
                kernel.sleep(2000).unwrap();
            }),
        )
        .unwrap();

    assert_eq!(
        *results.lock(),
        vec![("b wrong", 0), ("a valid", 40), ("a wrong", 0)]
    );
}

/// test that terminating a process frees its frames and swap entries
#[test]
fn test_memory_released_on_exit() {
    let kernel = boot();
    kernel
        .run(
            "lead",
            Box::new(|kernel| {
                let child = kernel
                    .create_process(
                        "child",
                        20,
                        Box::new(|kernel| touch(kernel, 0..NUMBER_PHYSICAL_PAGES + 4, 1)),
                    )
                    .unwrap();
                kernel.sleep(500).unwrap();
                assert!(kernel.get_process_id("child").is_err());
                assert!(kernel.frame_snapshot().iter().all(|(_, pid, _)| *pid != child));
                assert_eq!(kernel.swapped_pages(), 0);

                touch(kernel, 0..4, 2);
                assert_eq!(kernel.frame_snapshot().len(), 4);
            }),
        )
        .unwrap();
}

/// test that bad addresses fail the memory calls
#[test]
fn test_bad_addresses() {
    let kernel = boot();
    kernel
        .run(
            "lead",
            Box::new(|kernel| {
                assert_eq!(
                    kernel.memory_read(address(1024)),
                    Err(KernelError::BadParam("page outside the address space"))
                );
                assert_eq!(
                    kernel.memory_write(3, 1),
                    Err(KernelError::Fault(FaultKind::CpuError))
                );
                let ret = kernel.svc(SystemCall::MemWrite {
                    address: -16,
                    value: 1,
                });
                assert_eq!(ret.status, ErrorCode::BadParam);
                assert!(kernel.frame_snapshot().is_empty());
            }),
        )
        .unwrap();
}

/// test that running out of swap slots fails the access without losing any page
#[test]
fn test_swap_table_exhaustion_keeps_pages() {
    let config = KernelConfig {
        swap_slots: 8,
        ..KernelConfig::default()
    };
    let kernel = Kernel::boot(Arc::new(SimMachine::default()), config);
    kernel
        .run(
            "lead",
            Box::new(|kernel| {
                let held = NUMBER_PHYSICAL_PAGES + 8;
                touch(kernel, 0..held, 0x5A);
                assert_eq!(kernel.swapped_pages(), 8);

                assert_eq!(
                    kernel.memory_write(address(held), 1),
                    Err(KernelError::BadParam("swap table is full"))
                );
                let me = kernel.current_pid().unwrap();
                let table = kernel.page_table_of(me).unwrap();
                assert!(!table.get(held).is_valid());
                assert_eq!(kernel.frame_snapshot().len(), NUMBER_PHYSICAL_PAGES);
                assert_eq!(kernel.swapped_pages(), 8);

                assert_eq!(check(kernel, 0..held, 0x5A), 0);
                assert_eq!(kernel.swapped_pages(), 8);
            }),
        )
        .unwrap();
}
