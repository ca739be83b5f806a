//! Memory-mapped byte regions backing every tier
//!
//! A region is either anonymous memory (in-memory databases) or a file mapped
//! read/write. All multi-byte fields are little-endian and accessed through
//! the typed helpers below, so the rest of the crate never touches raw
//! pointers into the mapping.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{TrieError, TrieResult};

/// A fixed-size read/write mapping.
pub struct Region {
    map: MmapMut,
    /// Backing file, None for anonymous regions
    file: Option<File>,
    /// Path of the backing file (for error context)
    path: Option<PathBuf>,
}

impl Region {
    /// Map `len` bytes of zeroed anonymous memory.
    pub fn anonymous(len: u64) -> TrieResult<Self> {
        let map = MmapMut::map_anon(len as usize).map_err(|e| TrieError::Io {
            path: None,
            kind: e.kind(),
            message: format!("Failed to map {} anonymous bytes: {}", len, e),
        })?;
        Ok(Self { map, file: None, path: None })
    }

    /// Map the file at `path`, creating it with `len` zero bytes if it does not exist.
    ///
    /// Existing files keep their size: growing a region is an offline
    /// operation. Returns the region and whether the file was created.
    pub fn open_file(path: &Path, len: u64) -> TrieResult<(Self, bool)> {
        let created = !path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| TrieError::io_at(path, &e, "Failed to open region file"))?;

        if created {
            file.set_len(len)
                .map_err(|e| TrieError::io_at(path, &e, "Failed to size region file"))?;
        }

        let size = file
            .metadata()
            .map_err(|e| TrieError::io_at(path, &e, "Failed to stat region file"))?
            .len();
        if size == 0 {
            return Err(TrieError::Corrupted {
                path: path.to_path_buf(),
                reason: "region file is empty".into(),
            });
        }

        // SAFETY: the file is opened read/write by this process and the
        // database directory is not shared with other writers; the mapping
        // lives no longer than the File kept alongside it.
        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| TrieError::io_at(path, &e, "Failed to map region file"))?;

        Ok((Self { map, file: Some(file), path: Some(path.to_path_buf()) }, created))
    }

    /// Length of the mapping in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    /// Path used in error messages (`<memory>` for anonymous regions).
    pub fn display_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| PathBuf::from("<memory>"))
    }

    #[inline]
    pub fn bytes(&self, offset: u64, len: usize) -> &[u8] {
        let start = offset as usize;
        &self.map[start..start + len]
    }

    #[inline]
    pub fn bytes_mut(&mut self, offset: u64, len: usize) -> &mut [u8] {
        let start = offset as usize;
        &mut self.map[start..start + len]
    }

    #[inline]
    pub fn read_u16(&self, offset: u64) -> u16 {
        let b = self.bytes(offset, 2);
        u16::from_le_bytes([b[0], b[1]])
    }

    #[inline]
    pub fn write_u16(&mut self, offset: u64, value: u16) {
        self.bytes_mut(offset, 2).copy_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn read_u32(&self, offset: u64) -> u32 {
        let b = self.bytes(offset, 4);
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    #[inline]
    pub fn write_u32(&mut self, offset: u64, value: u32) {
        self.bytes_mut(offset, 4).copy_from_slice(&value.to_le_bytes());
    }

    #[inline]
    pub fn read_u64(&self, offset: u64) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.bytes(offset, 8));
        u64::from_le_bytes(buf)
    }

    #[inline]
    pub fn write_u64(&mut self, offset: u64, value: u64) {
        self.bytes_mut(offset, 8).copy_from_slice(&value.to_le_bytes());
    }

    /// Flush dirty pages to the backing file and make them durable.
    ///
    /// Anonymous regions have nothing to flush.
    pub fn sync(&self) -> TrieResult<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let path = self.display_path();
        self.map
            .flush()
            .map_err(|e| TrieError::io_at(&path, &e, "Failed to flush mapping"))?;
        durable_sync(file).map_err(|e| TrieError::io_at(&path, &e, "durable_sync failed"))
    }
}

/// Ensures file data is on persistent storage before returning.
///
/// - Linux: fdatasync() - data without metadata
/// - macOS/iOS: fcntl(F_FULLFSYNC) - bypasses the drive's volatile cache
/// - Windows: FlushFileBuffers()
/// - Other: File::sync_data()
///
/// Blocks for as long as the device needs; callers must not hold the arena lock
/// across it if they can avoid it.
pub fn durable_sync(file: &File) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor comes from a live File reference.
        let result = unsafe { libc::fdatasync(file.as_raw_fd()) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor comes from a live File reference.
        let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) };
        if result == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::FlushFileBuffers;
        // SAFETY: the handle comes from a live File reference.
        let result = unsafe { FlushFileBuffers(file.as_raw_handle() as *mut _) };
        if result != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", target_os = "windows")))]
    {
        file.sync_data()
    }
}
