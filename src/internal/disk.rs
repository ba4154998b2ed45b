//! Sector I/O and per-disk allocation bitmaps.
//!
//! Disk commands are synchronous for the caller: it waits for the unit to be free, issues
//! the command, then parks on the disk queue until the completion interrupt puts it back
//! on the ready queue.

use bit_field::BitField;
use log::{debug, trace};

use crate::internal::{
    fs::{FsError, ROOT_SECTOR, SUPERBLOCK_SECTOR},
    hw::{DeviceError, DiskId, DiskStatus, MAX_NUMBER_OF_DISKS, NUMBER_LOGICAL_SECTORS, Sector},
    kernel::{Kernel, KernelError},
    process::ProcessStatus,
};

/// Bytes in one disk bitmap
pub const BITMAP_BYTES: usize = NUMBER_LOGICAL_SECTORS / 8;

/// One bit per sector of a disk, set once the sector is handed out. Sectors are never
/// returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskBitmap {
    bits: Vec<u8>,
}

impl Default for DiskBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskBitmap {
    /// A bitmap with only the superblock and root directory sectors taken
    pub fn new() -> Self {
        let mut bitmap = Self {
            bits: vec![0; BITMAP_BYTES],
        };
        bitmap.mark(SUPERBLOCK_SECTOR);
        bitmap.mark(ROOT_SECTOR);
        bitmap
    }

    /// Whether `sector` is allocated
    pub fn is_set(&self, sector: u16) -> bool {
        let sector = sector as usize;
        self.bits
            .get(sector / 8)
            .is_some_and(|byte| byte.get_bit(7 - sector % 8))
    }

    /// Mark `sector` allocated
    pub fn mark(&mut self, sector: u16) {
        let sector = sector as usize;
        if let Some(byte) = self.bits.get_mut(sector / 8) {
            byte.set_bit(7 - sector % 8, true);
        }
    }

    /// Take the lowest free sector
    pub fn allocate(&mut self) -> Option<u16> {
        let byte = self.bits.iter().position(|byte| *byte != 0xFF)?;
        let bit = (0..8).find(|bit| !self.bits[byte].get_bit(7 - bit))?;
        let sector = (byte * 8 + bit) as u16;
        self.mark(sector);
        Some(sector)
    }

    /// Number of allocated sectors
    pub fn used(&self) -> usize {
        self.bits.iter().map(|byte| byte.count_ones() as usize).sum()
    }

    /// Raw bitmap bytes, sector 0 in the high bit of the first byte
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

fn check_disk_id(disk: DiskId) -> Result<(), KernelError> {
    if disk < MAX_NUMBER_OF_DISKS {
        Ok(())
    } else {
        Err(KernelError::Device(DeviceError::BadDeviceId))
    }
}

fn check_sector(sector: u16) -> Result<(), KernelError> {
    if (sector as usize) < NUMBER_LOGICAL_SECTORS {
        Ok(())
    } else {
        Err(KernelError::Device(DeviceError::IllegalAddress))
    }
}

impl Kernel {
    /// Hand out the lowest free sector of `disk`
    pub fn allocate_sector(&self, disk: DiskId) -> Result<u16, KernelError> {
        check_disk_id(disk)?;
        let mut bitmaps = self.bitmaps.lock();
        let sector = bitmaps
            .get_mut(disk)
            .and_then(DiskBitmap::allocate)
            .ok_or(KernelError::Fs(FsError::DiskFull))?;
        trace!("disk {}: allocated sector {}", disk, sector);
        Ok(sector)
    }

    /// Mark `sector` of `disk` as taken
    pub(crate) fn reserve_sector(&self, disk: DiskId, sector: u16) {
        if let Some(bitmap) = self.bitmaps.lock().get_mut(disk) {
            bitmap.mark(sector);
        }
    }

    /// Copy of the allocation bitmap of `disk`
    pub fn bitmap(&self, disk: DiskId) -> Option<DiskBitmap> {
        self.bitmaps.lock().get(disk).cloned()
    }

    /// Read `sector` of `disk`, blocking the caller until the transfer completes
    pub fn read_sector(
        &self,
        disk: DiskId,
        sector: u16,
        buf: &mut Sector,
    ) -> Result<(), KernelError> {
        self.wait_until_free(disk)?;
        self.hw.disk_read(disk, sector, buf)?;
        self.block_on_disk(disk)
    }

    /// Write `sector` of `disk`, blocking the caller until the transfer completes
    pub fn write_sector(&self, disk: DiskId, sector: u16, buf: &Sector) -> Result<(), KernelError> {
        self.wait_until_free(disk)?;
        self.hw.disk_write(disk, sector, buf)?;
        self.block_on_disk(disk)
    }

    /// Read a sector for a process, validating its arguments first
    pub fn physical_disk_read(
        &self,
        disk: DiskId,
        sector: u16,
        buf: &mut Sector,
    ) -> Result<(), KernelError> {
        check_disk_id(disk)?;
        check_sector(sector)?;
        self.read_sector(disk, sector, buf)
    }

    /// Write a sector for a process, validating its arguments first
    pub fn physical_disk_write(
        &self,
        disk: DiskId,
        sector: u16,
        buf: &Sector,
    ) -> Result<(), KernelError> {
        check_disk_id(disk)?;
        check_sector(sector)?;
        self.write_sector(disk, sector, buf)
    }

    /// Number of sectors ever written to `disk`
    pub fn check_disk(&self, disk: DiskId) -> Result<usize, KernelError> {
        check_disk_id(disk)?;
        let written = self.hw.check_disk(disk)?;
        debug!("disk {}: {} sectors written", disk, written);
        Ok(written)
    }

    /// Idle until `disk` can take a command, servicing the interrupts that come in
    fn wait_until_free(&self, disk: DiskId) -> Result<(), KernelError> {
        while self.hw.disk_status(disk)? == DiskStatus::InUse {
            if !self.hw.idle() {
                break;
            }
            self.service_interrupts();
        }
        Ok(())
    }

    /// Park the caller on the disk queue until `disk` completes
    fn block_on_disk(&self, disk: DiskId) -> Result<(), KernelError> {
        let pid = self.current_pid()?;
        if let Some(pcb) = self.processes.lock().get_mut(pid) {
            pcb.pending_disk = Some(disk);
            pcb.status = ProcessStatus::Ready;
        }
        self.disk_queue.lock().push_back(pid);
        self.schedule_report("disk wait", Some(pid));
        self.dispatch();
        Ok(())
    }
}
