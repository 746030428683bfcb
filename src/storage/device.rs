//! Raw block device abstraction (spec.md #4.1 "Device").
//!
//! `FileDevice` is a `std::fs::File`-backed implementation, grounded in the
//! teacher's `storage::disk::DiskManager` open/read/write structure but
//! stripped of its priority-queue and direct-I/O scaffolding, which has no
//! counterpart in spec.md (single-mutex, synchronous model). `MemoryDevice`
//! backs the `in-memory` environment flag with a growable arena.

use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Block device contract used by the page cache and blob manager.
///
/// All methods take `&mut self`: every call already runs under the single
/// environment mutex (spec.md #5), so there is no need for interior
/// mutability here.
pub trait Device: Send {
    fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>>;
    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()>;

    /// Allocate `size` contiguous bytes at the end of the device (or from a
    /// freed region of at least that size), returning the offset.
    fn alloc(&mut self, size: usize) -> Result<u64>;

    /// Return a previously allocated region to the free list.
    fn free(&mut self, offset: u64, size: usize);

    fn truncate(&mut self, size: u64) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    fn size(&self) -> u64;
}

/// A free region on the device, kept sorted by offset for adjacency
/// coalescing. Reused across page and blob allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct FreeRegion {
    offset: u64,
    size: u64,
}

#[derive(Debug, Default)]
struct Freelist {
    regions: Vec<FreeRegion>,
}

impl Freelist {
    fn take(&mut self, size: usize) -> Option<u64> {
        let size = size as u64;
        let idx = self.regions.iter().position(|r| r.size >= size)?;
        let region = self.regions.remove(idx);
        if region.size > size {
            self.regions.push(FreeRegion {
                offset: region.offset + size,
                size: region.size - size,
            });
        }
        Some(region.offset)
    }

    fn put(&mut self, offset: u64, size: usize) {
        self.regions.push(FreeRegion {
            offset,
            size: size as u64,
        });
        self.regions.sort_by_key(|r| r.offset);
        // Coalesce adjacent regions.
        let mut merged: Vec<FreeRegion> = Vec::with_capacity(self.regions.len());
        for r in self.regions.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.offset + last.size == r.offset {
                    last.size += r.size;
                    continue;
                }
            }
            merged.push(r);
        }
        self.regions = merged;
    }
}

/// `std::fs::File`-backed device.
pub struct FileDevice {
    file: File,
    path: PathBuf,
    len: u64,
    fsync: bool,
    freelist: Freelist,
}

impl FileDevice {
    pub fn create(path: impl AsRef<Path>, size: u64, fsync: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(size)?;
        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            len: size,
            fsync,
            freelist: Freelist::default(),
        })
    }

    pub fn open(path: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            len,
            fsync,
            freelist: Freelist::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Device for FileDevice {
    fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    fn alloc(&mut self, size: usize) -> Result<u64> {
        if let Some(offset) = self.freelist.take(size) {
            return Ok(offset);
        }
        let offset = self.len;
        self.len += size as u64;
        self.file.set_len(self.len)?;
        Ok(offset)
    }

    fn free(&mut self, offset: u64, size: usize) {
        self.freelist.put(offset, size);
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.file.set_len(size)?;
        self.len = size;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        if self.fsync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.len
    }
}

/// Growable in-memory arena, for `EnvFlags::IN_MEMORY` environments.
#[derive(Debug, Default)]
pub struct MemoryDevice {
    arena: Vec<u8>,
    freelist: Freelist,
}

impl MemoryDevice {
    pub fn new(initial_size: u64) -> Self {
        Self {
            arena: vec![0u8; initial_size as usize],
            freelist: Freelist::default(),
        }
    }
}

impl Device for MemoryDevice {
    fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let start = offset as usize;
        Ok(self.arena[start..start + len].to_vec())
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + bytes.len();
        if end > self.arena.len() {
            self.arena.resize(end, 0);
        }
        self.arena[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn alloc(&mut self, size: usize) -> Result<u64> {
        if let Some(offset) = self.freelist.take(size) {
            return Ok(offset);
        }
        let offset = self.arena.len() as u64;
        self.arena.resize(self.arena.len() + size, 0);
        Ok(offset)
    }

    fn free(&mut self, offset: u64, size: usize) {
        self.freelist.put(offset, size);
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.arena.resize(size as usize, 0);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> u64 {
        self.arena.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_device_roundtrip() {
        let mut dev = MemoryDevice::new(0);
        let off = dev.alloc(128).unwrap();
        dev.write(off, b"hello").unwrap();
        let data = dev.read(off, 5).unwrap();
        assert_eq!(&data, b"hello");
    }

    #[test]
    fn freelist_reuses_freed_regions() {
        let mut dev = MemoryDevice::new(0);
        let a = dev.alloc(64).unwrap();
        let b = dev.alloc(64).unwrap();
        dev.free(a, 64);
        dev.free(b, 64);
        let c = dev.alloc(64).unwrap();
        assert!(c == a || c == b);
    }

    #[test]
    fn file_device_create_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.db");
        {
            let mut dev = FileDevice::create(&path, 4096, false).unwrap();
            dev.write(0, b"persisted").unwrap();
            dev.flush().unwrap();
        }
        let mut dev = FileDevice::open(&path, false).unwrap();
        assert_eq!(dev.read(0, 9).unwrap(), b"persisted");
    }
}
