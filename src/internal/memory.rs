//! Demand paging.
//!
//! Physical frames are handed out on first touch. When none is free, a second-chance
//! clock restricted to the faulting process's own frames picks a victim, whose contents go
//! to a swap sector on the swap disk.

use bitflags::bitflags;
use hashbrown::HashMap;
use log::{debug, trace, warn};

use crate::internal::{
    fs::FsError,
    hw::{
        FaultKind, MemoryOp, NUMBER_VIRTUAL_PAGES, PGSIZE, PageTable, PageTableEntry, PteFlags,
        Sector,
    },
    kernel::{Kernel, KernelError},
    process::Pid,
};

/// Entries in the swap table
pub const SWAP_TABLE_SIZE: usize = 500;

/// Attempts at a memory access before giving up on the fault handler
const MEMORY_ACCESS_ATTEMPTS: usize = 4;

bitflags! {
    /// State of a physical frame
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameState: u8 {
        /// the frame is bound to a page
        const IN_USE = 0b001;
        /// second-chance flag
        const REFERENCED = 0b010;
        /// contents are being moved; not a candidate for eviction
        const LOCKED = 0b100;
    }
}

/// Page bound to a frame
#[derive(Debug, Clone)]
pub struct FrameOwner {
    /// owning process
    pub pid: Pid,
    /// logical page
    pub page: usize,
    /// owner's page table
    pub page_table: PageTable,
    /// swap sector the page came from, reused when it is evicted again
    pub swap_sector: Option<u16>,
}

#[derive(Debug, Clone)]
struct Frame {
    owner: Option<FrameOwner>,
    state: FrameState,
}

/// Every physical frame, and the clock hand sweeping them
pub struct FrameTable {
    frames: Vec<Frame>,
    hand: usize,
}

impl FrameTable {
    /// `count` free frames
    pub fn new(count: usize) -> Self {
        Self {
            frames: vec![
                Frame {
                    owner: None,
                    state: FrameState::empty(),
                };
                count
            ],
            hand: 0,
        }
    }

    /// Number of frames
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the table has no frames at all
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Lowest free frame
    pub fn find_free(&self) -> Option<usize> {
        self.frames
            .iter()
            .position(|frame| !frame.state.contains(FrameState::IN_USE))
    }

    /// Bind `frame` to `owner`, pinned until [`FrameTable::unlock`]. Returns the previous owner.
    pub fn bind(&mut self, frame: usize, owner: FrameOwner) -> Option<FrameOwner> {
        let slot = self.frames.get_mut(frame)?;
        slot.state = FrameState::IN_USE | FrameState::REFERENCED | FrameState::LOCKED;
        slot.owner.replace(owner)
    }

    /// Make a pinned frame eligible for eviction again
    pub fn unlock(&mut self, frame: usize) {
        if let Some(slot) = self.frames.get_mut(frame) {
            slot.state.remove(FrameState::LOCKED);
        }
    }

    /// Owner of `frame`
    pub fn owner(&self, frame: usize) -> Option<&FrameOwner> {
        self.frames.get(frame)?.owner.as_ref()
    }

    /// State bits of `frame`
    pub fn state(&self, frame: usize) -> Option<FrameState> {
        self.frames.get(frame).map(|frame| frame.state)
    }

    /// Frame holding `page` of `pid`
    pub fn lookup(&self, pid: Pid, page: usize) -> Option<usize> {
        self.frames.iter().position(|frame| {
            frame
                .owner
                .as_ref()
                .is_some_and(|owner| owner.pid == pid && owner.page == page)
        })
    }

    /// Frames held by `pid`
    pub fn owned_by(&self, pid: Pid) -> Vec<usize> {
        self.frames
            .iter()
            .enumerate()
            .filter(|(_, frame)| frame.owner.as_ref().is_some_and(|owner| owner.pid == pid))
            .map(|(index, _)| index)
            .collect()
    }

    /// Free every frame held by `pid`; returns how many were freed
    pub fn release(&mut self, pid: Pid) -> usize {
        let mut freed = 0;
        for frame in &mut self.frames {
            if frame.owner.as_ref().is_some_and(|owner| owner.pid == pid) {
                frame.owner = None;
                frame.state = FrameState::empty();
                freed += 1;
            }
        }
        freed
    }

    /// (frame, pid, page) for every bound frame
    pub fn snapshot(&self) -> Vec<(usize, Pid, usize)> {
        self.frames
            .iter()
            .enumerate()
            .filter_map(|(index, frame)| {
                frame.owner.as_ref().map(|owner| (index, owner.pid, owner.page))
            })
            .collect()
    }

    /// Pick a frame to evict for `pid` with the second-chance clock.
    ///
    /// Only frames of `pid` are candidates, unless it owns none, in which case any frame is.
    /// A referenced candidate has its flag (and its page's referenced bit) cleared and is
    /// passed over once.
    pub fn select_victim(&mut self, pid: Pid) -> Option<usize> {
        let count = self.frames.len();
        if count == 0 {
            return None;
        }
        let scoped = self.frames.iter().any(|frame| {
            !frame.state.contains(FrameState::LOCKED)
                && frame.owner.as_ref().is_some_and(|owner| owner.pid == pid)
        });

        for _ in 0..2 * count {
            let index = self.hand;
            self.hand = (self.hand + 1) % count;

            let frame = &mut self.frames[index];
            if frame.state.contains(FrameState::LOCKED) {
                continue;
            }
            let Some(owner) = &frame.owner else {
                continue;
            };
            if scoped && owner.pid != pid {
                continue;
            }

            let entry = owner.page_table.get(owner.page);
            if frame.state.contains(FrameState::REFERENCED)
                || entry.flags().contains(PteFlags::REFERENCED)
            {
                frame.state.remove(FrameState::REFERENCED);
                owner
                    .page_table
                    .update(owner.page, |entry| entry.remove(PteFlags::REFERENCED));
                continue;
            }
            return Some(index);
        }
        None
    }
}

/// A page held on the swap disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapEntry {
    /// owning process
    pub pid: Pid,
    /// logical page
    pub page: usize,
    /// sector on the swap disk
    pub sector: u16,
}

/// A page on its way out of its frame
struct Eviction {
    owner: FrameOwner,
    /// page table entry before the page was unmapped
    entry: PageTableEntry,
    contents: Sector,
    sector: u16,
}

/// A frame bound to a faulting page but not filled yet
struct Claim {
    frame: usize,
    victim: Option<Eviction>,
    incoming: Option<SwapEntry>,
}

/// Fixed-capacity swap table with a `(pid, page)` index
pub struct SwapTable {
    entries: Vec<Option<SwapEntry>>,
    index: HashMap<(Pid, usize), usize>,
}

impl SwapTable {
    /// An empty table with `capacity` slots
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: vec![None; capacity],
            index: HashMap::new(),
        }
    }

    /// Entry for `page` of `pid`
    pub fn lookup(&self, pid: Pid, page: usize) -> Option<SwapEntry> {
        let slot = *self.index.get(&(pid, page))?;
        self.entries[slot]
    }

    /// Record `entry`, replacing any entry for the same page. Fails when every slot is used.
    pub fn insert(&mut self, entry: SwapEntry) -> Result<(), KernelError> {
        let key = (entry.pid, entry.page);
        if let Some(&slot) = self.index.get(&key) {
            self.entries[slot] = Some(entry);
            return Ok(());
        }
        let slot = self
            .entries
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::BadParam("swap table is full"))?;
        self.entries[slot] = Some(entry);
        self.index.insert(key, slot);
        Ok(())
    }

    /// Remove and return the entry for `page` of `pid`
    pub fn take(&mut self, pid: Pid, page: usize) -> Option<SwapEntry> {
        let slot = self.index.remove(&(pid, page))?;
        self.entries[slot].take()
    }

    /// Drop every entry of `pid`
    pub fn release(&mut self, pid: Pid) {
        self.index.retain(|&(owner, _), _| owner != pid);
        for entry in &mut self.entries {
            if entry.is_some_and(|entry| entry.pid == pid) {
                *entry = None;
            }
        }
    }

    /// Entries in use
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether no entry is in use
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Whether every slot is in use
    pub fn is_full(&self) -> bool {
        self.index.len() >= self.entries.len()
    }
}

impl Kernel {
    /// Read the word at `address` of the caller's address space
    pub fn memory_read(&self, address: usize) -> Result<u32, KernelError> {
        self.memory_access(address, MemoryOp::Read)
    }

    /// Write `value` at `address` of the caller's address space
    pub fn memory_write(&self, address: usize, value: u32) -> Result<(), KernelError> {
        self.memory_access(address, MemoryOp::Write(value))
            .map(|_| ())
    }

    fn memory_access(&self, address: usize, op: MemoryOp) -> Result<u32, KernelError> {
        for _ in 0..MEMORY_ACCESS_ATTEMPTS {
            match self.hw.memory_access(address, op) {
                Ok(value) => return Ok(value),
                Err(fault) => self.fault_handler(fault)?,
            }
        }
        Err(KernelError::Fault(FaultKind::InvalidMemory))
    }

    /// Map `page` of `pid` to a frame, evicting one of its other pages if memory is full.
    ///
    /// The victim's swap slot and sector are reserved before its mapping is torn down. When
    /// the transfer fails the victim is mapped back and the faulting page keeps its swap entry.
    pub fn resolve_page_fault(&self, pid: Pid, page: usize) -> Result<(), KernelError> {
        if page >= NUMBER_VIRTUAL_PAGES {
            return Err(KernelError::BadParam("page outside the address space"));
        }
        let page_table = self
            .page_table_of(pid)
            .ok_or(KernelError::UnknownProcess(pid))?;
        if page_table.get(page).is_valid() {
            return Ok(());
        }

        let claim = self.claim_frame(pid, page, &page_table)?;
        match self.fill_frame(pid, page, &claim) {
            Ok(()) => {
                page_table.set(
                    page,
                    PageTableEntry::mapped(claim.frame, PteFlags::VALID | PteFlags::REFERENCED),
                );
                self.frames.lock().unlock(claim.frame);
                Ok(())
            }
            Err(err) => {
                self.abandon_claim(claim);
                Err(err)
            }
        }
    }

    /// Bind a frame to `page` of `pid`, unmapping the page it displaces
    fn claim_frame(
        &self,
        pid: Pid,
        page: usize,
        page_table: &PageTable,
    ) -> Result<Claim, KernelError> {
        let mut frames = self.frames.lock();
        let (frame, displaced) = match frames.find_free() {
            Some(frame) => (frame, None),
            None => {
                let frame = frames
                    .select_victim(pid)
                    .ok_or(KernelError::BadParam("no frame can be evicted"))?;
                (frame, frames.owner(frame).cloned())
            }
        };

        let mut swap = self.swap.lock();
        let incoming = swap.take(pid, page);
        let reserved = match displaced {
            Some(owner) => match self.reserve_swap(&mut swap, &owner) {
                Ok(sector) => Some((owner, sector)),
                Err(err) => {
                    if let Some(entry) = incoming {
                        swap.insert(entry)?;
                    }
                    return Err(err);
                }
            },
            None => None,
        };

        frames.bind(
            frame,
            FrameOwner {
                pid,
                page,
                page_table: page_table.clone(),
                swap_sector: incoming.map(|entry| entry.sector),
            },
        );
        let victim = reserved.map(|(owner, sector)| {
            let entry = owner.page_table.get(owner.page);
            owner.page_table.set(owner.page, PageTableEntry::INVALID);
            Eviction {
                contents: self.hw.read_physical(frame),
                owner,
                entry,
                sector,
            }
        });
        Ok(Claim {
            frame,
            victim,
            incoming,
        })
    }

    /// Take a swap slot and sector for `owner`'s page
    fn reserve_swap(&self, swap: &mut SwapTable, owner: &FrameOwner) -> Result<u16, KernelError> {
        if swap.is_full() {
            return Err(KernelError::BadParam("swap table is full"));
        }
        let sector = match owner.swap_sector {
            Some(sector) => sector,
            None => self
                .allocate_sector(self.config.swap_disk)
                .map_err(|err| match err {
                    KernelError::Fs(FsError::DiskFull) => {
                        KernelError::BadParam("swap disk is full")
                    }
                    err => err,
                })?,
        };
        swap.insert(SwapEntry {
            pid: owner.pid,
            page: owner.page,
            sector,
        })?;
        Ok(sector)
    }

    /// Write the victim out and read the faulting page in
    fn fill_frame(&self, pid: Pid, page: usize, claim: &Claim) -> Result<(), KernelError> {
        let disk = self.config.swap_disk;
        if let Some(victim) = &claim.victim {
            self.write_sector(disk, victim.sector, &victim.contents)?;
            debug!(
                "evicted page {} of process {} from frame {} to sector {}",
                victim.owner.page, victim.owner.pid, claim.frame, victim.sector
            );
        }

        let mut contents = [0; PGSIZE];
        if let Some(entry) = claim.incoming {
            self.read_sector(disk, entry.sector, &mut contents)?;
            trace!("page {} of process {} in from sector {}", page, pid, entry.sector);
        }
        self.hw.write_physical(claim.frame, &contents);
        debug!("page {} of process {} in frame {}", page, pid, claim.frame);
        Ok(())
    }

    /// Undo a claim whose transfer failed. The frame still holds the victim's contents, so
    /// the victim is mapped back unless it already faulted its page in elsewhere.
    fn abandon_claim(&self, claim: Claim) {
        let mut frames = self.frames.lock();
        let mut swap = self.swap.lock();
        let restored = claim.victim.and_then(|victim| {
            swap.take(victim.owner.pid, victim.owner.page)?;
            Some(victim)
        });
        if let Some(entry) = claim.incoming {
            if swap.insert(entry).is_err() {
                warn!(
                    "page {} of process {}: swap entry lost",
                    entry.page, entry.pid
                );
            }
        }
        match restored {
            Some(victim) => {
                let Eviction {
                    mut owner,
                    entry,
                    sector,
                    ..
                } = victim;
                owner.swap_sector = Some(sector);
                owner.page_table.set(owner.page, entry);
                debug!(
                    "page {} of process {} stays in frame {}",
                    owner.page, owner.pid, claim.frame
                );
                frames.bind(claim.frame, owner);
                frames.unlock(claim.frame);
            }
            None => frames.release_frame(claim.frame),
        }
    }

    /// Return the frames and swap entries of a terminated process
    pub(crate) fn release_memory(&self, pid: Pid) {
        let freed = self.frames.lock().release(pid);
        self.swap.lock().release(pid);
        if freed > 0 {
            debug!("released {} frames of process {}", freed, pid);
        }
    }

    /// (frame, pid, page) for every bound frame
    pub fn frame_snapshot(&self) -> Vec<(usize, Pid, usize)> {
        self.frames.lock().snapshot()
    }

    /// Number of pages currently held on the swap disk
    pub fn swapped_pages(&self) -> usize {
        self.swap.lock().len()
    }
}

impl FrameTable {
    fn release_frame(&mut self, frame: usize) {
        if let Some(slot) = self.frames.get_mut(frame) {
            slot.owner = None;
            slot.state = FrameState::empty();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(pid: Pid, page: usize, page_table: &PageTable) -> FrameOwner {
        page_table.set(page, PageTableEntry::mapped(0, PteFlags::VALID));
        FrameOwner {
            pid,
            page,
            page_table: page_table.clone(),
            swap_sector: None,
        }
    }

    /// test that the second-chance clock skips referenced frames once
    #[test]
    fn test_second_chance() {
        let table_a = PageTable::new();
        let mut frames = FrameTable::new(4);
        for frame in 0..4 {
            frames.bind(frame, owner(1, frame, &table_a));
            frames.unlock(frame);
        }
        let victim = frames.select_victim(1);
        assert_eq!(victim, Some(0));
        for frame in 1..4 {
            assert!(!frames.state(frame).unwrap().contains(FrameState::REFERENCED));
        }

        table_a.update(1, |entry| entry.insert(PteFlags::REFERENCED));
        assert_eq!(frames.select_victim(1), Some(2));
    }

    /// test that the victim belongs to the faulting process
    #[test]
    fn test_victim_scoped_to_process() {
        let table_a = PageTable::new();
        let table_b = PageTable::new();
        let mut frames = FrameTable::new(4);
        for frame in 0..3 {
            frames.bind(frame, owner(1, frame, &table_a));
            frames.unlock(frame);
        }
        frames.bind(3, owner(2, 0, &table_b));
        frames.unlock(3);
        for _ in 0..5 {
            assert_eq!(frames.select_victim(2), Some(3));
        }
        assert_eq!(frames.owned_by(1), vec![0, 1, 2]);
    }

    /// test that pinned frames are never chosen
    #[test]
    fn test_locked_frames_skipped() {
        let table = PageTable::new();
        let mut frames = FrameTable::new(2);
        frames.bind(0, owner(1, 0, &table));
        frames.bind(1, owner(1, 1, &table));
        assert_eq!(frames.select_victim(1), None);
        frames.unlock(1);
        assert_eq!(frames.select_victim(1), Some(1));
        assert_eq!(frames.lookup(1, 1), Some(1));
        assert_eq!(frames.release(1), 2);
        assert_eq!(frames.find_free(), Some(0));
    }

    /// test the swap table index
    #[test]
    fn test_swap_table() {
        let mut swap = SwapTable::new(2);
        let entry = |pid, page, sector| SwapEntry { pid, page, sector };
        swap.insert(entry(1, 4, 100)).unwrap();
        swap.insert(entry(1, 4, 101)).unwrap();
        assert_eq!(swap.len(), 1);
        swap.insert(entry(2, 4, 102)).unwrap();
        assert!(swap.is_full());
        assert!(swap.insert(entry(3, 0, 103)).is_err());
        assert_eq!(swap.lookup(1, 4).map(|entry| entry.sector), Some(101));
        assert_eq!(swap.take(1, 4).map(|entry| entry.sector), Some(101));
        assert_eq!(swap.lookup(1, 4), None);
        swap.release(2);
        assert!(swap.is_empty());
        swap.insert(entry(3, 0, 103)).unwrap();
    }
}
