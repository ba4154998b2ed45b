/*
 * simnix-fs
 * every disk is an array of 16-byte sectors:
 * - sector 0 holds the superblock (disk id, sizes and locations of the other regions)
 * - sector 1 holds the header of the root directory
 * - every other sector is handed out first-fit from the in-memory bitmap
 *
 * each file or directory is a 16-byte header:
 * - inode (1 byte), name (7 bytes, zero padded)
 * - description (1 byte): parent inode in the top 5 bits, index-tree depth in the next 2,
 *   directory flag in the lowest
 * - creation time (3 bytes LE), index block location (2 bytes LE), size (2 bytes LE)
 *
 * the index block is the root of an 8-way tree of little-endian sector numbers. a tree of
 * depth d has d + 1 levels and addresses 8^(d + 1) leaves. for a file the leaves are data
 * sectors; for a directory they are the sectors holding the headers of its entries. a
 * full tree grows by putting a new root above the old one, so existing leaves keep their
 * position. sector 0 is never a leaf or an index block, so a zero slot is an empty slot.
 */

use core::fmt::Display;

use bit_field::BitField;
use hashbrown::HashMap;
use log::{debug, info, trace};

use crate::internal::{
    disk::BITMAP_BYTES,
    hw::{DiskId, MAX_NUMBER_OF_DISKS, NUMBER_LOGICAL_SECTORS, PGSIZE, Sector},
    kernel::{Kernel, KernelError},
};

/// Longest file or directory name, in bytes
pub const NAME_LENGTH: usize = 7;
/// Slots in an index block
pub const INDEX_SLOTS: usize = 8;
/// Location of the superblock
pub const SUPERBLOCK_SECTOR: u16 = 0;
/// Location of the root directory header
pub const ROOT_SECTOR: u16 = 1;
/// Name of the root directory
pub const ROOT_NAME: &str = "root";
/// Parent inode recorded for the root directory
pub const NO_PARENT: u8 = 31;
/// Deepest index tree
pub const MAX_DEPTH: u8 = 3;
/// Largest number of leaves any index tree can address
pub const MAX_FILE_BLOCKS: usize = capacity(MAX_DEPTH);

/// Leaves addressed by an index tree of `depth`
pub const fn capacity(depth: u8) -> usize {
    INDEX_SLOTS.pow(depth as u32 + 1)
}

/// File system errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// names are 1 to 7 bytes
    InvalidName,
    /// an entry of that name and kind already exists
    FileExists,
    /// no such entry
    FileNotFound,
    /// no free sector left
    DiskFull,
    /// every inode number has been used
    OutOfInodes,
    /// disk id out of range
    InvalidDisk,
    /// the disk holds no file system
    NotFormatted,
    /// the process has not opened a directory
    NoCurrentDirectory,
    /// the inode is not in the open-file table
    NotOpen,
    /// the open-file table is full
    TooManyOpenFiles,
    /// the block is past what an index tree can address
    FileTooLarge,
    /// read past the end of the file
    EndOfFile,
    /// a header could not be decoded
    InvalidHeader,
}

impl Display for FsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                FsError::InvalidName => "Invalid name",
                FsError::FileExists => "File exists",
                FsError::FileNotFound => "File not found",
                FsError::DiskFull => "Disk full",
                FsError::OutOfInodes => "Out of inodes",
                FsError::InvalidDisk => "Invalid disk",
                FsError::NotFormatted => "Disk is not formatted",
                FsError::NoCurrentDirectory => "No current directory",
                FsError::NotOpen => "File is not open",
                FsError::TooManyOpenFiles => "Too many open files",
                FsError::FileTooLarge => "File too large",
                FsError::EndOfFile => "End of file",
                FsError::InvalidHeader => "Invalid header",
            }
        )
    }
}

/// File or directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// holds data blocks
    File,
    /// holds headers of other entries
    Directory,
}

impl FileKind {
    /// Flag printed in directory listings
    pub fn flag(self) -> char {
        match self {
            FileKind::File => 'F',
            FileKind::Directory => 'D',
        }
    }
}

/// Packed description byte of a header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Description(u8);

impl Description {
    /// Pack parent inode (low 5 bits kept), tree depth and kind
    pub fn new(parent: u8, depth: u8, kind: FileKind) -> Self {
        let mut bits = 0u8;
        bits.set_bits(3..8, parent & 0x1F);
        bits.set_bits(1..3, depth & 0x03);
        bits.set_bit(0, kind == FileKind::Directory);
        Self(bits)
    }

    /// Raw byte
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Parent inode, modulo 32
    pub fn parent(self) -> u8 {
        self.0.get_bits(3..8)
    }

    /// Index tree depth
    pub fn depth(self) -> u8 {
        self.0.get_bits(1..3)
    }

    /// File or directory
    pub fn kind(self) -> FileKind {
        if self.0.get_bit(0) {
            FileKind::Directory
        } else {
            FileKind::File
        }
    }

    fn with_depth(self, depth: u8) -> Self {
        Self::new(self.parent(), depth, self.kind())
    }
}

impl From<u8> for Description {
    fn from(bits: u8) -> Self {
        Self(bits)
    }
}

/// Check a name and pad it to [`NAME_LENGTH`] bytes
pub fn encode_name(name: &str) -> Result<[u8; NAME_LENGTH], FsError> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > NAME_LENGTH || bytes.contains(&0) {
        return Err(FsError::InvalidName);
    }
    let mut padded = [0; NAME_LENGTH];
    padded[..bytes.len()].copy_from_slice(bytes);
    Ok(padded)
}

/// A file or directory header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// inode number, never reused
    pub inode: u8,
    /// name, zero padded
    pub name: [u8; NAME_LENGTH],
    /// parent, depth and kind
    pub description: Description,
    /// tick of creation, 24 bits
    pub creation_time: u32,
    /// sector of the index tree root
    pub index_location: u16,
    /// entries of a directory, or one past the highest written block of a file
    pub size: u16,
}

impl FileHeader {
    /// Encode to the on-disk layout
    pub fn encode(&self) -> Sector {
        let mut sector = [0; PGSIZE];
        sector[0] = self.inode;
        sector[1..8].copy_from_slice(&self.name);
        sector[8] = self.description.bits();
        sector[9..12].copy_from_slice(&self.creation_time.to_le_bytes()[..3]);
        sector[12..14].copy_from_slice(&self.index_location.to_le_bytes());
        sector[14..16].copy_from_slice(&self.size.to_le_bytes());
        sector
    }

    /// Decode the on-disk layout
    pub fn decode(bytes: &[u8]) -> Result<Self, FsError> {
        if bytes.len() < PGSIZE {
            return Err(FsError::InvalidHeader);
        }
        let mut time = [0; 4];
        time[..3].copy_from_slice(&bytes[9..12]);
        Ok(Self {
            inode: bytes[0],
            name: bytes[1..8].try_into().map_err(|_| FsError::InvalidHeader)?,
            description: Description(bytes[8]),
            creation_time: u32::from_le_bytes(time),
            index_location: u16::from_le_bytes(
                bytes[12..14].try_into().map_err(|_| FsError::InvalidHeader)?,
            ),
            size: u16::from_le_bytes(
                bytes[14..16].try_into().map_err(|_| FsError::InvalidHeader)?,
            ),
        })
    }

    /// Name without padding
    pub fn name(&self) -> String {
        let end = self
            .name
            .iter()
            .position(|byte| *byte == 0)
            .unwrap_or(NAME_LENGTH);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// File or directory
    pub fn kind(&self) -> FileKind {
        self.description.kind()
    }

    /// Index tree depth
    pub fn depth(&self) -> u8 {
        self.description.depth()
    }

    /// Leaves the index tree can address at its current depth
    pub fn capacity(&self) -> usize {
        capacity(self.depth())
    }
}

/// One index block: eight sector numbers, zero for an empty slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexBlock(pub [u16; INDEX_SLOTS]);

impl IndexBlock {
    /// Encode as eight little-endian words
    pub fn encode(&self) -> Sector {
        let mut sector = [0; PGSIZE];
        for (slot, chunk) in self.0.iter().zip(sector.chunks_exact_mut(2)) {
            chunk.copy_from_slice(&slot.to_le_bytes());
        }
        sector
    }

    /// Decode eight little-endian words
    pub fn decode(sector: &Sector) -> Self {
        let mut slots = [0; INDEX_SLOTS];
        for (slot, chunk) in slots.iter_mut().zip(sector.chunks_exact(2)) {
            *slot = u16::from_le_bytes([chunk[0], chunk[1]]);
        }
        Self(slots)
    }
}

/// Sector 0 of a formatted disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    /// disk the file system lives on
    pub disk_id: u8,
    /// size of the allocation bitmap, in sectors
    pub bitmap_size: u8,
    /// size of the root directory header, in sectors
    pub root_size: u8,
    /// size of the reserved swap area, in sectors
    pub swap_size: u8,
    /// sectors on the disk
    pub disk_length: u16,
    /// first bitmap sector, 0 when the bitmap is kept in memory
    pub bitmap_location: u16,
    /// root directory header sector
    pub root_location: u16,
    /// first swap sector, 0 when swap is allocated through the bitmap
    pub swap_location: u16,
}

impl Superblock {
    /// Superblock written by a format of `disk`
    pub fn new(disk: DiskId) -> Self {
        Self {
            disk_id: disk as u8,
            bitmap_size: (BITMAP_BYTES / PGSIZE) as u8,
            root_size: 1,
            swap_size: 0,
            disk_length: NUMBER_LOGICAL_SECTORS as u16,
            bitmap_location: 0,
            root_location: ROOT_SECTOR,
            swap_location: 0,
        }
    }

    /// Encode to sector 0
    pub fn encode(&self) -> Sector {
        let mut sector = [0; PGSIZE];
        sector[0] = self.disk_id;
        sector[1] = self.bitmap_size;
        sector[2] = self.root_size;
        sector[3] = self.swap_size;
        sector[4..6].copy_from_slice(&self.disk_length.to_le_bytes());
        sector[6..8].copy_from_slice(&self.bitmap_location.to_le_bytes());
        sector[8..10].copy_from_slice(&self.root_location.to_le_bytes());
        sector[10..12].copy_from_slice(&self.swap_location.to_le_bytes());
        sector
    }

    /// Decode sector 0
    pub fn decode(sector: &Sector) -> Result<Self, FsError> {
        let word = |at: usize| -> Result<u16, FsError> {
            Ok(u16::from_le_bytes(
                sector[at..at + 2]
                    .try_into()
                    .map_err(|_| FsError::NotFormatted)?,
            ))
        };
        let superblock = Self {
            disk_id: sector[0],
            bitmap_size: sector[1],
            root_size: sector[2],
            swap_size: sector[3],
            disk_length: word(4)?,
            bitmap_location: word(6)?,
            root_location: word(8)?,
            swap_location: word(10)?,
        };
        if superblock.root_location != ROOT_SECTOR || superblock.disk_length == 0 {
            return Err(FsError::NotFormatted);
        }
        Ok(superblock)
    }
}

/// A file in a process's open-file table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenEntry {
    /// cached header
    pub header: FileHeader,
    /// disk holding it
    pub disk: DiskId,
    /// sector holding its header
    pub sector: u16,
}

/// Per-process file system state
#[derive(Debug, Clone, Default)]
pub struct FsContext {
    /// disk used when none is named
    pub disk: Option<DiskId>,
    /// current directory
    pub cwd: Option<OpenEntry>,
    /// open files by inode
    pub open_files: HashMap<u8, OpenEntry>,
}

/// One line of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// inode number
    pub inode: u8,
    /// name
    pub name: String,
    /// file or directory
    pub kind: FileKind,
    /// tick of creation
    pub creation_time: u32,
    /// entries or blocks
    pub size: u16,
}

impl Display for DirectoryEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:>3} {:<7} {} {:>8} {}",
            self.inode,
            self.name,
            self.kind.flag(),
            self.creation_time,
            self.size
        )
    }
}

impl Kernel {
    fn with_fs<R>(&self, f: impl FnOnce(&mut FsContext) -> R) -> Result<R, KernelError> {
        let pid = self.current_pid()?;
        let mut table = self.processes.lock();
        let pcb = table.get_mut(pid).ok_or(KernelError::UnknownProcess(pid))?;
        Ok(f(&mut pcb.fs))
    }

    fn current_directory_entry(&self) -> Result<OpenEntry, KernelError> {
        self.with_fs(|fs| fs.cwd)?
            .ok_or(KernelError::Fs(FsError::NoCurrentDirectory))
    }

    fn open_entry(&self, inode: u8) -> Result<OpenEntry, KernelError> {
        self.with_fs(|fs| fs.open_files.get(&inode).copied())?
            .ok_or(KernelError::Fs(FsError::NotOpen))
    }

    fn read_header(&self, disk: DiskId, sector: u16) -> Result<FileHeader, KernelError> {
        let mut buf = [0; PGSIZE];
        self.read_sector(disk, sector, &mut buf)?;
        Ok(FileHeader::decode(&buf)?)
    }

    fn write_header(
        &self,
        disk: DiskId,
        sector: u16,
        header: &FileHeader,
    ) -> Result<(), KernelError> {
        self.write_sector(disk, sector, &header.encode())
    }

    fn read_index(&self, disk: DiskId, sector: u16) -> Result<IndexBlock, KernelError> {
        let mut buf = [0; PGSIZE];
        self.read_sector(disk, sector, &mut buf)?;
        Ok(IndexBlock::decode(&buf))
    }

    fn write_index(&self, disk: DiskId, sector: u16, block: &IndexBlock) -> Result<(), KernelError> {
        self.write_sector(disk, sector, &block.encode())
    }

    fn next_inode(&self) -> Result<u8, KernelError> {
        let mut next = self.inodes.lock();
        if *next == u8::MAX {
            return Err(FsError::OutOfInodes.into());
        }
        let inode = *next;
        *next += 1;
        Ok(inode)
    }

    /// Sector of leaf `index` in the tree of `header`. With `grow`, missing index blocks
    /// and the leaf itself are allocated and the tree is deepened as needed; otherwise a
    /// missing leaf is `None`. The caller persists `header` when it changed.
    fn descend(
        &self,
        disk: DiskId,
        header: &mut FileHeader,
        index: usize,
        grow: bool,
    ) -> Result<Option<u16>, KernelError> {
        if index >= MAX_FILE_BLOCKS {
            return Err(FsError::FileTooLarge.into());
        }
        while index >= header.capacity() {
            if !grow {
                return Ok(None);
            }
            let depth = header.depth() + 1;
            let root = self.allocate_sector(disk)?;
            let mut block = IndexBlock::default();
            block.0[0] = header.index_location;
            self.write_index(disk, root, &block)?;
            header.index_location = root;
            header.description = header.description.with_depth(depth);
            debug!("'{}' index tree now {} deep", header.name(), depth);
        }

        let mut block_sector = header.index_location;
        for level in (0..=header.depth() as u32).rev() {
            let slot = (index / INDEX_SLOTS.pow(level)) % INDEX_SLOTS;
            let mut block = self.read_index(disk, block_sector)?;
            let mut next = block.0[slot];
            if next == 0 {
                if !grow {
                    return Ok(None);
                }
                next = self.allocate_sector(disk)?;
                if level > 0 {
                    self.write_index(disk, next, &IndexBlock::default())?;
                }
                block.0[slot] = next;
                self.write_index(disk, block_sector, &block)?;
            }
            if level == 0 {
                trace!("'{}' leaf {} is sector {}", header.name(), index, next);
                return Ok(Some(next));
            }
            block_sector = next;
        }
        Ok(None)
    }

    /// Entries of directory `dir`, with the sectors holding their headers
    fn entries(
        &self,
        disk: DiskId,
        dir: &FileHeader,
    ) -> Result<Vec<(FileHeader, u16)>, KernelError> {
        let mut dir = *dir;
        let mut entries = Vec::with_capacity(dir.size as usize);
        for position in 0..dir.size as usize {
            if let Some(sector) = self.descend(disk, &mut dir, position, false)? {
                entries.push((self.read_header(disk, sector)?, sector));
            }
        }
        Ok(entries)
    }

    fn find_entry(
        &self,
        disk: DiskId,
        dir: &FileHeader,
        name: &[u8; NAME_LENGTH],
        kind: FileKind,
    ) -> Result<Option<(FileHeader, u16)>, KernelError> {
        Ok(self
            .entries(disk, dir)?
            .into_iter()
            .find(|(header, _)| header.name == *name && header.kind() == kind))
    }

    /// Add a new entry to the current directory
    fn create_entry(&self, name: &str, kind: FileKind) -> Result<OpenEntry, KernelError> {
        let name = encode_name(name)?;
        let cwd = self.current_directory_entry()?;
        let disk = cwd.disk;
        let mut dir = self.read_header(disk, cwd.sector)?;
        if self.find_entry(disk, &dir, &name, kind)?.is_some() {
            return Err(FsError::FileExists.into());
        }

        let inode = self.next_inode()?;
        let index_location = self.allocate_sector(disk)?;
        self.write_index(disk, index_location, &IndexBlock::default())?;
        let header = FileHeader {
            inode,
            name,
            description: Description::new(dir.inode, 0, kind),
            creation_time: (self.hw.clock() & 0xFF_FFFF) as u32,
            index_location,
            size: 0,
        };

        let position = dir.size as usize;
        let sector = self
            .descend(disk, &mut dir, position, true)?
            .ok_or(KernelError::Fs(FsError::FileTooLarge))?;
        self.write_header(disk, sector, &header)?;
        dir.size += 1;
        self.write_header(disk, cwd.sector, &dir)?;
        self.with_fs(|fs| {
            if let Some(cached) = fs.cwd.as_mut().filter(|cached| cached.sector == cwd.sector) {
                cached.header = dir;
            }
        })?;

        debug!(
            "created {:?} '{}' inode {} in '{}'",
            kind,
            header.name(),
            inode,
            dir.name()
        );
        Ok(OpenEntry {
            header,
            disk,
            sector,
        })
    }

    /// Find `name` in the current directory, creating it when absent
    fn find_or_create(&self, name: &str, kind: FileKind) -> Result<OpenEntry, KernelError> {
        let encoded = encode_name(name)?;
        let cwd = self.current_directory_entry()?;
        let dir = self.read_header(cwd.disk, cwd.sector)?;
        match self.find_entry(cwd.disk, &dir, &encoded, kind)? {
            Some((header, sector)) => Ok(OpenEntry {
                header,
                disk: cwd.disk,
                sector,
            }),
            None => self.create_entry(name, kind),
        }
    }

    /// Lay down an empty file system on `disk` and make it the caller's disk
    pub fn format(&self, disk: DiskId) -> Result<(), KernelError> {
        if disk >= MAX_NUMBER_OF_DISKS {
            return Err(FsError::InvalidDisk.into());
        }
        self.reserve_sector(disk, SUPERBLOCK_SECTOR);
        self.reserve_sector(disk, ROOT_SECTOR);

        let inode = self.next_inode()?;
        let index_location = self.allocate_sector(disk)?;
        self.write_index(disk, index_location, &IndexBlock::default())?;
        let root = FileHeader {
            inode,
            name: encode_name(ROOT_NAME)?,
            description: Description::new(NO_PARENT, 0, FileKind::Directory),
            creation_time: (self.hw.clock() & 0xFF_FFFF) as u32,
            index_location,
            size: 0,
        };
        self.write_header(disk, ROOT_SECTOR, &root)?;
        self.write_sector(disk, SUPERBLOCK_SECTOR, &Superblock::new(disk).encode())?;
        self.with_fs(|fs| fs.disk = Some(disk))?;

        info!("formatted disk {}, root inode {}", disk, inode);
        Ok(())
    }

    /// Read the superblock of `disk`
    pub fn superblock(&self, disk: DiskId) -> Result<Superblock, KernelError> {
        if disk >= MAX_NUMBER_OF_DISKS {
            return Err(FsError::InvalidDisk.into());
        }
        let mut buf = [0; PGSIZE];
        self.read_sector(disk, SUPERBLOCK_SECTOR, &mut buf)?;
        Ok(Superblock::decode(&buf)?)
    }

    /// Make `name` the caller's current directory. `"root"` opens the root of `disk` (the
    /// caller's disk when `None`); any other name is looked up in the current directory
    /// and created when absent.
    pub fn open_directory(&self, disk: Option<DiskId>, name: &str) -> Result<(), KernelError> {
        let disk = match disk {
            Some(disk) => disk,
            None => self
                .with_fs(|fs| fs.disk)?
                .ok_or(KernelError::Fs(FsError::NotFormatted))?,
        };
        if disk >= MAX_NUMBER_OF_DISKS {
            return Err(FsError::InvalidDisk.into());
        }

        let entry = if name == ROOT_NAME {
            let header = self.read_header(disk, ROOT_SECTOR)?;
            if header.kind() != FileKind::Directory || header.name() != ROOT_NAME {
                return Err(FsError::NotFormatted.into());
            }
            OpenEntry {
                header,
                disk,
                sector: ROOT_SECTOR,
            }
        } else {
            let cwd = self.current_directory_entry()?;
            if cwd.disk != disk {
                return Err(FsError::NoCurrentDirectory.into());
            }
            self.find_or_create(name, FileKind::Directory)?
        };

        self.with_fs(|fs| {
            fs.disk = Some(disk);
            fs.cwd = Some(entry);
        })?;
        debug!("current directory is '{}' on disk {}", entry.header.name(), disk);
        Ok(())
    }

    /// Open `name` in the current directory, creating it when absent; returns its inode
    pub fn open_file(&self, name: &str) -> Result<u8, KernelError> {
        let max = self.config.max_open_files;
        if self.with_fs(|fs| fs.open_files.len())? >= max {
            return Err(FsError::TooManyOpenFiles.into());
        }
        let entry = self.find_or_create(name, FileKind::File)?;
        let inode = entry.header.inode;
        self.with_fs(|fs| fs.open_files.insert(inode, entry))?;
        debug!("opened '{}' as inode {}", entry.header.name(), inode);
        Ok(inode)
    }

    /// Create a directory in the current directory
    pub fn create_directory(&self, name: &str) -> Result<(), KernelError> {
        self.create_entry(name, FileKind::Directory).map(|_| ())
    }

    /// Create a file in the current directory
    pub fn create_file(&self, name: &str) -> Result<(), KernelError> {
        self.create_entry(name, FileKind::File).map(|_| ())
    }

    /// Write `data` to `block` of an open file, growing it as needed
    pub fn write_file(&self, inode: u8, block: usize, data: &Sector) -> Result<(), KernelError> {
        let entry = self.open_entry(inode)?;
        let mut header = self.read_header(entry.disk, entry.sector)?;
        let sector = self
            .descend(entry.disk, &mut header, block, true)?
            .ok_or(KernelError::Fs(FsError::FileTooLarge))?;
        self.write_sector(entry.disk, sector, data)?;

        header.size = header.size.max(block as u16 + 1);
        self.write_header(entry.disk, entry.sector, &header)?;
        self.with_fs(|fs| {
            if let Some(open) = fs.open_files.get_mut(&inode) {
                open.header = header;
            }
        })?;
        Ok(())
    }

    /// Read `block` of an open file; a block that was never written reads as zeros
    pub fn read_file(&self, inode: u8, block: usize, buf: &mut Sector) -> Result<(), KernelError> {
        let entry = self.open_entry(inode)?;
        let mut header = self.read_header(entry.disk, entry.sector)?;
        if block >= header.size as usize {
            return Err(FsError::EndOfFile.into());
        }
        match self.descend(entry.disk, &mut header, block, false)? {
            Some(sector) => self.read_sector(entry.disk, sector, buf),
            None => {
                *buf = [0; PGSIZE];
                Ok(())
            }
        }
    }

    /// Write back the header of an open file and drop it from the open-file table.
    ///
    /// The stored header is merged with the cached one, so growth made through another
    /// process's handle survives.
    pub fn close_file(&self, inode: u8) -> Result<(), KernelError> {
        let entry = self.open_entry(inode)?;
        let mut header = self.read_header(entry.disk, entry.sector)?;
        header.size = header.size.max(entry.header.size);
        self.write_header(entry.disk, entry.sector, &header)?;
        self.with_fs(|fs| fs.open_files.remove(&inode))?;
        debug!("closed inode {}", inode);
        Ok(())
    }

    /// List the current directory
    pub fn directory_contents(&self) -> Result<Vec<DirectoryEntry>, KernelError> {
        let cwd = self.current_directory_entry()?;
        let dir = self.read_header(cwd.disk, cwd.sector)?;
        Ok(self
            .entries(cwd.disk, &dir)?
            .into_iter()
            .map(|(header, _)| DirectoryEntry {
                inode: header.inode,
                name: header.name(),
                kind: header.kind(),
                creation_time: header.creation_time,
                size: header.size,
            })
            .collect())
    }

    /// Header of the caller's current directory, as stored on disk
    pub fn current_directory(&self) -> Result<FileHeader, KernelError> {
        let cwd = self.current_directory_entry()?;
        self.read_header(cwd.disk, cwd.sector)
    }
}
