use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use memmap2::MmapMut;

use crate::error::Result;

/// Flat byte region the allocator lives in. Implementations must tolerate
/// `grow` relocating the region; nothing outside the region may hold a raw
/// pointer into it across a call to `grow`.
pub trait ByteStore: AsRef<[u8]> + AsMut<[u8]> {
    /// Grows the store so that it holds at least `new_len` bytes.
    fn grow(&mut self, new_len: u64) -> Result<()>;

    /// Flushes dirty bytes to the underlying medium, if there is one.
    fn sync(&self) -> Result<()>;

    /// Number of resize events since the store was opened.
    fn stats(&self) -> u64;
}

/// In-memory store, used by tests and the benchmarks.
#[derive(Debug, Clone, Default)]
pub struct VecStore {
    vec: Vec<u8>,
    resizes: u64,
}

impl VecStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_len(len: usize) -> Self {
        Self {
            vec: vec![0u8; len],
            resizes: 0,
        }
    }
}

impl AsRef<[u8]> for VecStore {
    fn as_ref(&self) -> &[u8] {
        &self.vec
    }
}

impl AsMut<[u8]> for VecStore {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.vec
    }
}

impl ByteStore for VecStore {
    fn grow(&mut self, new_len: u64) -> Result<()> {
        if new_len as usize > self.vec.len() {
            self.resizes += 1;
            self.vec.resize(new_len as usize, 0);
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn stats(&self) -> u64 {
        self.resizes
    }
}

/// A single file mapped read/write shared. Growing unmaps, extends the file
/// and remaps; the kernel is free to hand back a different base address, so
/// the mapping contents must only ever refer to itself by offset.
pub struct MmapFile {
    mmap: MmapMut,
    file: File,
    resizes: u64,
}

impl MmapFile {
    /// Creates (or truncates) the file at `path` with room for
    /// `initial_bytes` and maps it.
    pub fn create<P: AsRef<Path>>(path: P, initial_bytes: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(initial_bytes + 1)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            mmap,
            file,
            resizes: 0,
        })
    }

    /// Maps an existing file read/write.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "file is empty").into());
        }
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            mmap,
            file,
            resizes: 0,
        })
    }
}

impl AsRef<[u8]> for MmapFile {
    fn as_ref(&self) -> &[u8] {
        &self.mmap
    }
}

impl AsMut<[u8]> for MmapFile {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.mmap
    }
}

impl ByteStore for MmapFile {
    fn grow(&mut self, new_len: u64) -> Result<()> {
        let old_len = self.mmap.len();
        log::debug!("growing backing file from {old_len} to {new_len} bytes");
        self.resizes += 1;
        self.mmap.flush()?;

        // Drop the mapping before resizing the file, then remap. The new
        // mapping may land at a different address.
        let mut old_mmap = MmapMut::map_anon(1)?;
        std::mem::swap(&mut self.mmap, &mut old_mmap);
        drop(old_mmap);
        self.file.set_len(new_len)?;
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    fn stats(&self) -> u64 {
        self.resizes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_create_write_reopen() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path();

        let mut store = MmapFile::create(path, 1024).unwrap();
        assert_eq!(store.as_ref().len(), 1025);

        store.as_mut()[0..4].copy_from_slice(b"test");
        store.sync().unwrap();
        drop(store);

        let store = MmapFile::open(path).unwrap();
        assert_eq!(&store.as_ref()[0..4], b"test");
    }

    #[test]
    fn test_grow_preserves_contents() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path();

        let mut store = MmapFile::create(path, 64).unwrap();
        store.as_mut()[60..64].copy_from_slice(b"grow");

        store.grow(4096).unwrap();
        assert_eq!(store.as_ref().len(), 4096);
        assert_eq!(&store.as_ref()[60..64], b"grow");
        assert_eq!(store.stats(), 1);

        // Bytes beyond the old length read as zero after the extension.
        assert!(store.as_ref()[64..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_open_empty_file_is_rejected() {
        let tmp = NamedTempFile::new().unwrap();
        assert!(MmapFile::open(tmp.path()).is_err());
    }

    #[test]
    fn test_vec_store_grow() {
        let mut store = VecStore::with_len(16);
        store.as_mut()[0] = 7;
        store.grow(64).unwrap();
        assert_eq!(store.as_ref().len(), 64);
        assert_eq!(store.as_ref()[0], 7);
        assert_eq!(store.stats(), 1);

        // Shrinking requests are ignored.
        store.grow(8).unwrap();
        assert_eq!(store.as_ref().len(), 64);
        assert_eq!(store.stats(), 1);
    }
}
