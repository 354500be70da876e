//! File access for the exec path
//!
//! The loader reads the main binary and its interpreter through
//! [`FileAccess`]: open read-only, query the size, map the contents.
//!
//! - [`HostFiles`]: the host filesystem, mapped with `mmap`
//! - [`MemoryFiles`]: an in-memory table, for images staged by the caller

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::ops::Deref;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;

/// Source of executable images.
pub trait FileAccess {
    type File: OpenFile;

    fn open_read_only(&self, path: &Path) -> io::Result<Self::File>;
}

/// An opened image file.
pub trait OpenFile {
    type Mapping: Deref<Target = [u8]>;

    fn stat_size(&self) -> io::Result<u64>;

    /// Map the first `size` bytes read-only.
    fn map_read_execute(&self, size: u64) -> io::Result<Self::Mapping>;
}

/// Open, stat and map `path` in one step.
pub fn map_file<F: FileAccess + ?Sized>(
    files: &F,
    path: &Path,
) -> io::Result<<F::File as OpenFile>::Mapping> {
    let file = files.open_read_only(path)?;
    let size = file.stat_size()?;
    file.map_read_execute(size)
}

// =============================================================================
// Host filesystem
// =============================================================================

/// Host filesystem access.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostFiles;

impl FileAccess for HostFiles {
    type File = HostFile;

    fn open_read_only(&self, path: &Path) -> io::Result<HostFile> {
        let file = File::open(path)?;
        Ok(HostFile { file })
    }
}

#[derive(Debug)]
pub struct HostFile {
    file: File,
}

impl OpenFile for HostFile {
    type Mapping = MappedFile;

    fn stat_size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn map_read_execute(&self, size: u64) -> io::Result<MappedFile> {
        let len = usize::try_from(size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "file too large to map"))?;
        if len == 0 {
            return Ok(MappedFile { ptr: None, len: 0 });
        }

        let fd = self.file.as_raw_fd();
        let map = |prot| {
            // SAFETY: fresh shared mapping of an open descriptor; checked below.
            unsafe { libc::mmap(core::ptr::null_mut(), len, prot, libc::MAP_SHARED, fd, 0) }
        };

        let mut addr = map(libc::PROT_READ | libc::PROT_EXEC);
        if addr == libc::MAP_FAILED {
            // noexec mounts refuse PROT_EXEC; the loader only reads the bytes.
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EPERM) && err.raw_os_error() != Some(libc::EACCES) {
                return Err(err);
            }
            crate::kdebug!("PROT_EXEC mapping refused ({}), mapping read-only", err);
            addr = map(libc::PROT_READ);
            if addr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(MappedFile {
            ptr: NonNull::new(addr.cast::<u8>()),
            len,
        })
    }
}

/// Read-only host mapping of a file, unmapped on drop.
#[derive(Debug)]
pub struct MappedFile {
    ptr: Option<NonNull<u8>>,
    len: usize,
}

impl Deref for MappedFile {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.ptr {
            // SAFETY: `ptr` maps `len` readable bytes until drop.
            Some(ptr) => unsafe { core::slice::from_raw_parts(ptr.as_ptr(), self.len) },
            None => &[],
        }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr {
            // SAFETY: mapping created by `map_read_execute` with this length.
            unsafe { libc::munmap(ptr.as_ptr().cast(), self.len) };
        }
    }
}

// =============================================================================
// In-memory file table
// =============================================================================

/// Images registered by path, shared without copying.
#[derive(Debug, Default, Clone)]
pub struct MemoryFiles {
    files: HashMap<PathBuf, Arc<[u8]>>,
}

impl MemoryFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, data: impl Into<Arc<[u8]>>) {
        self.files.insert(path.into(), data.into());
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }
}

impl FileAccess for MemoryFiles {
    type File = MemoryFile;

    fn open_read_only(&self, path: &Path) -> io::Result<MemoryFile> {
        self.files
            .get(path)
            .cloned()
            .map(MemoryFile)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{}", path.display())))
    }
}

#[derive(Debug, Clone)]
pub struct MemoryFile(Arc<[u8]>);

impl OpenFile for MemoryFile {
    type Mapping = MemoryMapping;

    fn stat_size(&self) -> io::Result<u64> {
        Ok(self.0.len() as u64)
    }

    fn map_read_execute(&self, size: u64) -> io::Result<MemoryMapping> {
        let len = usize::try_from(size)
            .ok()
            .filter(|&len| len <= self.0.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "mapping past end of file"))?;
        Ok(MemoryMapping {
            data: Arc::clone(&self.0),
            len,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MemoryMapping {
    data: Arc<[u8]>,
    len: usize,
}

impl Deref for MemoryMapping {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data[..self.len]
    }
}
