use std::io;
use std::mem::size_of;
use std::path::Path;

use bytemuck::{Pod, Zeroable};

use crate::byte_store::{ByteStore, MmapFile};
use crate::error::{DiskMapError, Result};

/// Header at offset 0 of the store.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct HeapHeader {
    /// Offset of the block the next allocation scan starts from.
    next_free: u64,
    /// Size of the region the allocator may use. Kept in the file so a
    /// reopened heap knows how far it had grown.
    size: u64,
}

/// Doubly-linked node stored immediately before the payload it describes.
/// `prev == 0` marks the list head, `next == 0` the tail. On a freed block
/// `next` is repurposed to thread the free list.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct BlockRecord {
    prev: u64,
    next: u64,
}

const HEADER_SIZE: u64 = size_of::<HeapHeader>() as u64;
const BLOCK_RECORD_SIZE: u64 = size_of::<BlockRecord>() as u64;

/// Offset of the first sentinel block record.
const FIRST_BLOCK: u64 = HEADER_SIZE;
/// Offset of the second sentinel, the initial tail.
const SECOND_BLOCK: u64 = FIRST_BLOCK + BLOCK_RECORD_SIZE;

/// Payload offset of the first allocation made in a fresh heap. A root
/// object created before anything else always lands here, which is how a
/// client finds it again after reopening the file.
pub const FIRST_ALLOCATION: u64 = SECOND_BLOCK + BLOCK_RECORD_SIZE;

/// Block allocator over a [`ByteStore`]. All bookkeeping lives inside the
/// store itself; the `Heap` value is only a handle. Every cross-reference is
/// a byte offset from the start of the store, so growing (and remapping) the
/// store never invalidates anything that was written into it.
pub struct Heap<S: ByteStore> {
    store: S,
}

impl<S: ByteStore> Heap<S> {
    /// Initializes a fresh heap in `store`: header plus the two sentinel
    /// blocks. Grows the store first if it cannot hold them.
    pub fn new(mut store: S) -> Result<Self> {
        if (store.as_ref().len() as u64) < FIRST_ALLOCATION {
            store.grow(FIRST_ALLOCATION)?;
        }
        let mut heap = Self { store };
        let size = heap.store.as_ref().len() as u64;
        heap.write(
            0,
            &HeapHeader {
                next_free: SECOND_BLOCK,
                size,
            },
        );
        heap.write(
            FIRST_BLOCK,
            &BlockRecord {
                prev: 0,
                next: SECOND_BLOCK,
            },
        );
        heap.write(
            SECOND_BLOCK,
            &BlockRecord {
                prev: FIRST_BLOCK,
                next: 0,
            },
        );
        Ok(heap)
    }

    /// Reopens a heap previously initialized in `store`.
    pub fn from_existing(store: S) -> Result<Self> {
        let len = store.as_ref().len() as u64;
        if len < FIRST_ALLOCATION {
            return Err(corrupt("store too small to contain a heap"));
        }
        let heap = Self { store };
        let header = heap.header();
        if header.size < FIRST_ALLOCATION || header.size > len {
            return Err(corrupt("heap header size out of bounds"));
        }
        if header.next_free < FIRST_BLOCK || header.next_free + BLOCK_RECORD_SIZE > header.size {
            return Err(corrupt("heap free list head out of bounds"));
        }
        Ok(heap)
    }

    fn header(&self) -> HeapHeader {
        self.read(0)
    }

    /// Size of the region the allocator manages.
    pub fn mapped_size(&self) -> u64 {
        self.header().size
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Flushes the store.
    pub fn sync(&self) -> Result<()> {
        self.store.sync()
    }

    /// Flushes and releases the heap.
    pub fn close(self) -> Result<()> {
        self.store.sync()
    }

    /// Releases the heap without flushing.
    pub fn abandon(self) {
        drop(self);
    }

    pub(crate) fn read<T: Pod>(&self, offset: u64) -> T {
        let start = offset as usize;
        bytemuck::pod_read_unaligned(&self.store.as_ref()[start..start + size_of::<T>()])
    }

    pub(crate) fn write<T: Pod>(&mut self, offset: u64, value: &T) {
        let start = offset as usize;
        self.store.as_mut()[start..start + size_of::<T>()]
            .copy_from_slice(bytemuck::bytes_of(value));
    }

    pub(crate) fn bytes(&self, offset: u64, len: u64) -> &[u8] {
        &self.store.as_ref()[offset as usize..(offset + len) as usize]
    }

    pub(crate) fn bytes_mut(&mut self, offset: u64, len: u64) -> &mut [u8] {
        &mut self.store.as_mut()[offset as usize..(offset + len) as usize]
    }

    /// Interned bytes at `offset`, up to but excluding the NUL terminator.
    pub fn str_at(&self, offset: u64) -> &[u8] {
        let data = self.store.as_ref();
        let start = offset as usize;
        let end = data[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| start + p)
            .unwrap_or(data.len());
        &data[start..end]
    }

    /// Copies `s` into the heap as a NUL-terminated byte sequence and
    /// returns its offset. Keys are never deduplicated here; the hash table
    /// avoids interning twice by looking up first.
    pub fn intern_str(&mut self, s: &str) -> Result<u64> {
        let bytes = s.as_bytes();
        if bytes.contains(&0) {
            return Err(DiskMapError::InvalidKey(
                "key contains an interior NUL byte".into(),
            ));
        }
        let len = bytes.len() as u64 + 1;
        let offset = self.alloc(len)?;
        let dst = self.bytes_mut(offset, len);
        dst[..bytes.len()].copy_from_slice(bytes);
        dst[bytes.len()] = 0;
        Ok(offset)
    }

    fn grow_to(&mut self, new_size: u64) -> Result<()> {
        self.store.grow(new_size)?;
        let mut header = self.header();
        header.size = self.store.as_ref().len() as u64;
        self.write(0, &header);
        Ok(())
    }

    /// Reserves `size` bytes and returns the payload offset. First-fit scan
    /// from the free front; extending past the tail grows the store by 1.5x
    /// rounded up to the next multiple of 256.
    pub fn alloc(&mut self, size: u64) -> Result<u64> {
        let needed = BLOCK_RECORD_SIZE + size;

        let mut chosen = self.header().next_free;
        loop {
            let rec: BlockRecord = self.read(chosen);
            // Freed blocks thread the free list through `next`, so the
            // subtraction can wrap; a wrapped gap is treated as large.
            if rec.next == 0 || rec.next.wrapping_sub(chosen) > needed {
                break;
            }
            chosen = rec.next;
        }

        let prev = self.read::<BlockRecord>(chosen).prev;
        let mut next = self.read::<BlockRecord>(prev).next;

        if self.read::<BlockRecord>(chosen).next == 0 {
            // Tail: carve a new tail record after the requested payload.
            let mut tail = chosen + needed;
            tail = ((tail >> 2) + 1) << 2;
            if tail + BLOCK_RECORD_SIZE >= self.header().size {
                let mut new_size = tail + BLOCK_RECORD_SIZE;
                new_size += new_size / 2;
                new_size = ((new_size >> 8) + 1) << 8;
                self.grow_to(new_size)?;
            }
            let mut rec: BlockRecord = self.read(chosen);
            rec.next = tail;
            self.write(chosen, &rec);
            self.write(tail, &BlockRecord { prev: chosen, next: 0 });
            next = tail;
        }

        let mut header = self.header();
        header.next_free = self.read::<BlockRecord>(chosen).next;
        self.write(0, &header);

        self.write(chosen, &BlockRecord { prev, next });
        let mut prev_rec: BlockRecord = self.read(prev);
        prev_rec.next = chosen;
        self.write(prev, &prev_rec);
        let mut next_rec: BlockRecord = self.read(next);
        next_rec.prev = chosen;
        self.write(next, &next_rec);

        Ok(chosen + BLOCK_RECORD_SIZE)
    }

    /// Returns the allocation at `payload` to the allocator: unlink the
    /// block and push it on the free front. Adjacent free blocks are not
    /// coalesced.
    pub fn free(&mut self, payload: u64) {
        let block = payload - BLOCK_RECORD_SIZE;
        let rec: BlockRecord = self.read(block);
        debug_assert!(rec.next != 0, "cannot free the tail sentinel");

        let mut prev_rec: BlockRecord = self.read(rec.prev);
        prev_rec.next = rec.next;
        self.write(rec.prev, &prev_rec);
        let mut next_rec: BlockRecord = self.read(rec.next);
        next_rec.prev = rec.prev;
        self.write(rec.next, &next_rec);

        let mut header = self.header();
        self.write(
            block,
            &BlockRecord {
                prev: rec.prev,
                next: header.next_free,
            },
        );
        header.next_free = block;
        self.write(0, &header);
    }

    /// Walks the block list and asserts its invariants: offsets strictly
    /// ascending, every record inside the managed region, one tail. Panics
    /// on a corrupt list; intended for tests and debugging.
    pub fn validate_blocks(&self) {
        let size = self.header().size;
        let mut at = FIRST_BLOCK;
        let mut steps = 0u64;
        loop {
            assert!(at + BLOCK_RECORD_SIZE <= size, "block record out of bounds");
            let rec: BlockRecord = self.read(at);
            if rec.next == 0 {
                break;
            }
            assert!(rec.next > at, "block list not in ascending offset order");
            assert_eq!(
                self.read::<BlockRecord>(rec.next).prev,
                at,
                "block list back-link broken"
            );
            at = rec.next;
            steps += 1;
            assert!(steps <= size, "block list does not terminate");
        }
    }
}

impl Heap<MmapFile> {
    /// Creates the file at `path` with room for `initial_bytes` and
    /// initializes a fresh heap in it.
    pub fn create<P: AsRef<Path>>(path: P, initial_bytes: u64) -> Result<Self> {
        Self::new(MmapFile::create(path, initial_bytes)?)
    }

    /// Maps an existing heap file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_existing(MmapFile::open(path)?)
    }
}

fn corrupt(msg: &str) -> DiskMapError {
    io::Error::new(io::ErrorKind::InvalidData, msg).into()
}
