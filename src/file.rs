//! The byte-addressable, resizable file abstraction. Treated as an external
//! collaborator by the spec; this module provides the trait the rest of the
//! kernel depends on plus two concrete implementations: an in-memory file
//! (ported from the C++ labs' `TestFile`, used throughout the test suite)
//! and an OS-file-backed implementation (ported from the teacher's
//! `SmallFile`, the production path for segment and log files).

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;

use crate::error::{Error, Result};

/// A single block-addressable file. `read_block`/`write_block` never
/// extend the file -- callers must `resize` first.
pub trait BlockFile: Send {
    fn size(&self) -> u64;
    fn resize(&mut self, new_size: u64) -> Result<()>;
    fn read_block(&mut self, offset: u64, len: usize, dst: &mut [u8]) -> Result<()>;
    fn write_block(&mut self, src: &[u8], offset: u64, len: usize) -> Result<()>;
}

/// Opens/creates the named segment files and scratch files an external
/// sort or buffer manager needs.
pub trait FileSystem: Send + Sync {
    fn open_file(&self, name: &str) -> Result<Box<dyn BlockFile>>;
    fn make_temporary_file(&self) -> Result<Box<dyn BlockFile>>;
}

/// A `Vec<u8>`-backed file. Ported from `original_source`'s `TestFile`.
#[derive(Default)]
pub struct InMemoryFile {
    data: Vec<u8>,
}

impl InMemoryFile {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }
}

impl BlockFile for InMemoryFile {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn resize(&mut self, new_size: u64) -> Result<()> {
        self.data.resize(new_size as usize, 0);
        Ok(())
    }

    fn read_block(&mut self, offset: u64, len: usize, dst: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .ok_or_else(|| Error::Precondition("read offset overflow".into()))?;
        if end > self.data.len() {
            return Err(Error::Precondition("read beyond end of file".into()));
        }
        dst[..len].copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_block(&mut self, src: &[u8], offset: u64, len: usize) -> Result<()> {
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .ok_or_else(|| Error::Precondition("write offset overflow".into()))?;
        if end > self.data.len() {
            return Err(Error::Precondition("write beyond end of file".into()));
        }
        self.data[start..end].copy_from_slice(&src[..len]);
        Ok(())
    }
}

/// An in-memory `FileSystem`: every named file is its own `InMemoryFile`,
/// kept alive for the lifetime of the file system (segment files need to
/// survive across `open_file` calls within a test).
pub struct InMemoryFileSystem {
    files: std::sync::Mutex<std::collections::HashMap<String, std::sync::Arc<std::sync::Mutex<InMemoryFile>>>>,
    temp_counter: std::sync::atomic::AtomicU64,
}

impl InMemoryFileSystem {
    pub fn new() -> Self {
        Self {
            files: std::sync::Mutex::new(std::collections::HashMap::new()),
            temp_counter: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

impl Default for InMemoryFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

/// A `BlockFile` that forwards to a shared, named slot in an
/// `InMemoryFileSystem`, so segment files opened multiple times (once per
/// `fix_page` miss) see the same bytes.
struct SharedInMemoryFile {
    inner: std::sync::Arc<std::sync::Mutex<InMemoryFile>>,
}

impl BlockFile for SharedInMemoryFile {
    fn size(&self) -> u64 {
        self.inner.lock().unwrap().size()
    }

    fn resize(&mut self, new_size: u64) -> Result<()> {
        self.inner.lock().unwrap().resize(new_size)
    }

    fn read_block(&mut self, offset: u64, len: usize, dst: &mut [u8]) -> Result<()> {
        self.inner.lock().unwrap().read_block(offset, len, dst)
    }

    fn write_block(&mut self, src: &[u8], offset: u64, len: usize) -> Result<()> {
        self.inner.lock().unwrap().write_block(src, offset, len)
    }
}

impl FileSystem for InMemoryFileSystem {
    fn open_file(&self, name: &str) -> Result<Box<dyn BlockFile>> {
        let mut files = self.files.lock().unwrap();
        let entry = files
            .entry(name.to_string())
            .or_insert_with(|| std::sync::Arc::new(std::sync::Mutex::new(InMemoryFile::new())))
            .clone();
        Ok(Box::new(SharedInMemoryFile { inner: entry }))
    }

    fn make_temporary_file(&self) -> Result<Box<dyn BlockFile>> {
        let id = self.temp_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.open_file(&format!("__tmp_{}", id))
    }
}

/// An `std::fs::File`-backed block file, for production use. Ported from
/// the teacher's `SmallFile`.
pub struct OsFile {
    file: std::fs::File,
}

impl OsFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| Error::Io(e.to_string()))?;
        Ok(Self { file })
    }
}

impl BlockFile for OsFile {
    fn size(&self) -> u64 {
        self.file.metadata().map(|m| m.len()).unwrap_or(0)
    }

    fn resize(&mut self, new_size: u64) -> Result<()> {
        self.file
            .set_len(new_size)
            .map_err(|e| Error::Io(e.to_string()))
    }

    fn read_block(&mut self, offset: u64, len: usize, dst: &mut [u8]) -> Result<()> {
        if offset + len as u64 > self.size() {
            return Err(Error::Precondition("read beyond end of file".into()));
        }
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::Io(e.to_string()))?;
        self.file
            .read_exact(&mut dst[..len])
            .map_err(|e| Error::Io(e.to_string()))
    }

    fn write_block(&mut self, src: &[u8], offset: u64, len: usize) -> Result<()> {
        if offset + len as u64 > self.size() {
            return Err(Error::Precondition("write beyond end of file".into()));
        }
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| Error::Io(e.to_string()))?;
        self.file
            .write_all(&src[..len])
            .map_err(|e| Error::Io(e.to_string()))
    }
}

/// Opens segment/log files under a base directory.
pub struct OsFileSystem {
    base_dir: std::path::PathBuf,
    temp_counter: std::sync::atomic::AtomicU64,
}

impl OsFileSystem {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        debug!("os file system rooted at {:?}", base_dir.as_ref());
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            temp_counter: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

impl FileSystem for OsFileSystem {
    fn open_file(&self, name: &str) -> Result<Box<dyn BlockFile>> {
        Ok(Box::new(OsFile::open(self.base_dir.join(name))?))
    }

    fn make_temporary_file(&self) -> Result<Box<dyn BlockFile>> {
        let id = self.temp_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let name = format!("tmp_{}_{}", std::process::id(), id);
        self.open_file(&name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_past_eof_fails() {
        let mut f = InMemoryFile::new();
        f.resize(4).unwrap();
        let mut dst = [0u8; 8];
        assert!(f.read_block(0, 8, &mut dst).is_err());
    }

    #[test]
    fn write_past_eof_fails() {
        let mut f = InMemoryFile::new();
        f.resize(4).unwrap();
        assert!(f.write_block(&[1, 2, 3, 4, 5], 0, 5).is_err());
    }

    #[test]
    fn round_trips_a_block() {
        let mut f = InMemoryFile::new();
        f.resize(8).unwrap();
        f.write_block(&[1, 2, 3, 4], 2, 4).unwrap();
        let mut dst = [0u8; 4];
        f.read_block(2, 4, &mut dst).unwrap();
        assert_eq!(dst, [1, 2, 3, 4]);
    }

    #[test]
    fn in_memory_file_system_shares_named_files() {
        let fs = InMemoryFileSystem::new();
        {
            let mut f = fs.open_file("0").unwrap();
            f.resize(8).unwrap();
            f.write_block(&[9, 9], 0, 2).unwrap();
        }
        let mut f2 = fs.open_file("0").unwrap();
        let mut dst = [0u8; 2];
        f2.read_block(0, 2, &mut dst).unwrap();
        assert_eq!(dst, [9, 9]);
    }

    #[test]
    fn os_file_system_temporary_files_get_distinct_names() {
        let dir = std::env::temp_dir().join(format!("storage-kernel-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let fs = OsFileSystem::new(&dir);
        let mut a = fs.make_temporary_file().unwrap();
        let mut b = fs.make_temporary_file().unwrap();
        a.resize(8).unwrap();
        a.write_block(&[1, 2, 3, 4], 0, 4).unwrap();
        b.resize(8).unwrap();
        b.write_block(&[5, 6, 7, 8], 0, 4).unwrap();
        let mut dst = [0u8; 4];
        a.read_block(0, 4, &mut dst).unwrap();
        assert_eq!(dst, [1, 2, 3, 4]);
        std::fs::remove_dir_all(&dir).ok();
    }
}
