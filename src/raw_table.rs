use bytemuck::{Pod, Zeroable};

use crate::byte_store::ByteStore;
use crate::error::{DiskMapError, Result};
use crate::heap::Heap;

/// Table header, stored as a heap allocation. The single source of truth for
/// the table's state; the in-process [`RawTable`] handle is only its offset.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct TableHeader {
    /// Number of buckets, always a power of two (doubling from 2).
    bucket_count: u64,
    /// Bytes per bucket: slot header plus the value width.
    bucket_size: u64,
    /// Occupied buckets.
    filled: u64,
    /// Largest probe distance any live entry exhibits; lookups stop early
    /// once they have probed further than this.
    max_dist: u64,
    /// Offset of the bucket array allocation.
    buckets: u64,
}

/// Fixed prefix of every bucket: the key's hash (0 means the bucket is
/// empty) and the offset of the interned key bytes.
#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct BucketHead {
    hash: u64,
    key: u64,
}

const TABLE_HEADER_SIZE: u64 = std::mem::size_of::<TableHeader>() as u64;
const BUCKET_HEAD_SIZE: u64 = std::mem::size_of::<BucketHead>() as u64;

const INITIAL_BUCKETS: u64 = 2;

/// FNV-1a over the key bytes including the NUL terminator. 0 is reserved for
/// empty buckets, so a hash of 0 is remapped to 1.
fn fnv1a(key: &[u8]) -> u64 {
    let mut h = 0xcbf2_9ce4_8422_2325u64;
    for &b in key.iter().chain(std::iter::once(&0u8)) {
        h ^= u64::from(b);
        h = h.wrapping_mul(0x100_0000_01b3);
    }
    if h == 0 {
        1
    } else {
        h
    }
}

/// Point-in-time counters for a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    pub bucket_count: u64,
    pub filled: u64,
    pub max_dist: u64,
    pub value_width: u64,
}

/// Robin-Hood open-addressing hash table whose bucket array, header and key
/// strings all live inside a [`Heap`]. The handle is `Copy` and holds only
/// the header offset, so it stays valid across store growth and across
/// process restarts; every operation takes the heap explicitly.
///
/// Each occupied bucket stores an interned key plus `value_width` opaque
/// payload bytes, fixed at creation. Keys behave like a set: inserting an
/// existing key returns its bucket without interning a second copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawTable {
    header: u64,
}

impl RawTable {
    /// Allocates a new table with room for `value_width` payload bytes per
    /// bucket.
    pub fn create<S: ByteStore>(heap: &mut Heap<S>, value_width: u64) -> Result<Self> {
        let header = heap.alloc(TABLE_HEADER_SIZE)?;
        heap.write(
            header,
            &TableHeader {
                bucket_count: INITIAL_BUCKETS,
                bucket_size: BUCKET_HEAD_SIZE + value_width,
                filled: 0,
                max_dist: 0,
                buckets: 0,
            },
        );
        let table = Self { header };

        let hdr: TableHeader = heap.read(header);
        let size = hdr.bucket_count * hdr.bucket_size;
        let buckets = heap.alloc(size)?;
        heap.bytes_mut(buckets, size).fill(0);
        let mut hdr: TableHeader = heap.read(header);
        hdr.buckets = buckets;
        heap.write(header, &hdr);
        Ok(table)
    }

    /// Reconstructs a handle for a table whose header lives at `offset`.
    pub fn from_offset(offset: u64) -> Self {
        Self { header: offset }
    }

    /// Offset of the table header inside the heap.
    pub fn offset(&self) -> u64 {
        self.header
    }

    fn load_header<S: ByteStore>(&self, heap: &Heap<S>) -> TableHeader {
        heap.read(self.header)
    }

    fn bucket_offset(hdr: &TableHeader, idx: u64) -> u64 {
        hdr.buckets + idx * hdr.bucket_size
    }

    pub fn stats<S: ByteStore>(&self, heap: &Heap<S>) -> TableStats {
        let hdr = self.load_header(heap);
        TableStats {
            bucket_count: hdr.bucket_count,
            filled: hdr.filled,
            max_dist: hdr.max_dist,
            value_width: hdr.bucket_size - BUCKET_HEAD_SIZE,
        }
    }

    /// Number of keys in the table.
    pub fn len<S: ByteStore>(&self, heap: &Heap<S>) -> u64 {
        self.load_header(heap).filled
    }

    pub fn is_empty<S: ByteStore>(&self, heap: &Heap<S>) -> bool {
        self.len(heap) == 0
    }

    /// Bucket index holding `key`, or `None`.
    pub fn lookup<S: ByteStore>(&self, heap: &Heap<S>, key: &str) -> Option<u64> {
        let hdr = self.load_header(heap);
        let h = fnv1a(key.as_bytes());
        let mut pos = h % hdr.bucket_count;
        let mut dist = 0u64;
        loop {
            let head: BucketHead = heap.read(Self::bucket_offset(&hdr, pos));
            if head.hash == 0 || dist > hdr.max_dist {
                return None;
            }
            if head.hash == h && heap.str_at(head.key) == key.as_bytes() {
                return Some(pos);
            }
            pos += 1;
            if pos == hdr.bucket_count {
                pos = 0;
            }
            dist += 1;
        }
    }

    /// Inserts `key`, interning it if it is new, and returns the bucket
    /// index it landed in. Inserting an existing key is a no-op that returns
    /// its current bucket.
    ///
    /// The returned index is only stable until an insert triggers a rehash;
    /// callers that write into the value region must do so before mutating
    /// the table again.
    pub fn insert_str<S: ByteStore>(&self, heap: &mut Heap<S>, key: &str) -> Result<u64> {
        if let Some(idx) = self.lookup(heap, key) {
            return Ok(idx);
        }
        let interned = heap.intern_str(key)?;
        self.insert_interned(heap, interned)
    }

    /// Robin-Hood insert of an already interned key. Rehashes first when the
    /// table is at its load bound, so the new entry is always recorded in
    /// the array it will stay in.
    fn insert_interned<S: ByteStore>(&self, heap: &mut Heap<S>, key: u64) -> Result<u64> {
        let hdr = self.load_header(heap);
        let bound = (hdr.bucket_count * 9 / 10).min(hdr.bucket_count - 1);
        if hdr.filled >= bound {
            self.grow_buckets(heap)?;
        }

        let mut hdr = self.load_header(heap);
        hdr.filled += 1;

        let bucket_size = hdr.bucket_size as usize;
        let mut carry = vec![0u8; bucket_size];
        let head = BucketHead {
            hash: fnv1a(heap.str_at(key)),
            key,
        };
        carry[..BUCKET_HEAD_SIZE as usize].copy_from_slice(bytemuck::bytes_of(&head));

        let mut pos = head.hash % hdr.bucket_count;
        let mut dist = 0u64;
        let mut landed: Option<u64> = None;
        loop {
            let offset = Self::bucket_offset(&hdr, pos);
            let existing: BucketHead = heap.read(offset);
            if existing.hash == 0 {
                heap.bytes_mut(offset, hdr.bucket_size).copy_from_slice(&carry);
                hdr.max_dist = hdr.max_dist.max(dist);
                let landed = landed.unwrap_or(pos);
                heap.write(self.header, &hdr);
                return Ok(landed);
            }
            let existing_dist = pos.wrapping_sub(existing.hash) % hdr.bucket_count;
            if dist > existing_dist {
                // Steal from the rich: the in-flight slot (hash, key offset
                // and value bytes) trades places with the occupant.
                heap.bytes_mut(offset, hdr.bucket_size).swap_with_slice(&mut carry);
                hdr.max_dist = hdr.max_dist.max(dist);
                if landed.is_none() {
                    landed = Some(pos);
                }
                dist = existing_dist;
            }
            pos += 1;
            if pos == hdr.bucket_count {
                pos = 0;
            }
            dist += 1;
        }
    }

    /// Doubles the bucket array and reinserts every live entry into it,
    /// values included. The old array is handed back to the allocator.
    fn grow_buckets<S: ByteStore>(&self, heap: &mut Heap<S>) -> Result<()> {
        let old = self.load_header(heap);
        let new_count = old.bucket_count * 2;
        log::trace!("rehash: {} -> {} buckets", old.bucket_count, new_count);

        let size = new_count * old.bucket_size;
        let buckets = heap.alloc(size)?;
        heap.bytes_mut(buckets, size).fill(0);

        let mut hdr = self.load_header(heap);
        hdr.bucket_count = new_count;
        hdr.filled = 0;
        hdr.max_dist = 0;
        hdr.buckets = buckets;
        heap.write(self.header, &hdr);

        let mut scratch = vec![0u8; old.bucket_size as usize];
        for i in 0..old.bucket_count {
            let offset = old.buckets + i * old.bucket_size;
            scratch.copy_from_slice(heap.bytes(offset, old.bucket_size));
            let head: BucketHead =
                bytemuck::pod_read_unaligned(&scratch[..BUCKET_HEAD_SIZE as usize]);
            if head.hash != 0 {
                let idx = self.insert_interned(heap, head.key)?;
                self.value_at_mut(heap, idx)
                    .copy_from_slice(&scratch[BUCKET_HEAD_SIZE as usize..]);
            }
        }
        heap.free(old.buckets);
        Ok(())
    }

    /// Payload bytes of the bucket at `idx`. The borrow ends at the next
    /// heap or table call; keep offsets, not slices.
    pub fn value_at<'h, S: ByteStore>(&self, heap: &'h Heap<S>, idx: u64) -> &'h [u8] {
        let hdr = self.load_header(heap);
        heap.bytes(
            Self::bucket_offset(&hdr, idx) + BUCKET_HEAD_SIZE,
            hdr.bucket_size - BUCKET_HEAD_SIZE,
        )
    }

    /// Mutable payload bytes of the bucket at `idx`.
    pub fn value_at_mut<'h, S: ByteStore>(&self, heap: &'h mut Heap<S>, idx: u64) -> &'h mut [u8] {
        let hdr = self.load_header(heap);
        heap.bytes_mut(
            Self::bucket_offset(&hdr, idx) + BUCKET_HEAD_SIZE,
            hdr.bucket_size - BUCKET_HEAD_SIZE,
        )
    }

    /// Writes `bytes` into the value region of the bucket at `idx`.
    pub fn write_value<S: ByteStore>(
        &self,
        heap: &mut Heap<S>,
        idx: u64,
        bytes: &[u8],
    ) -> Result<()> {
        let width = self.stats(heap).value_width;
        if bytes.len() as u64 > width {
            return Err(DiskMapError::ValueTooWide {
                width,
                got: bytes.len() as u64,
            });
        }
        self.value_at_mut(heap, idx)[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Indices of occupied buckets, in ascending order. The iterator borrows
    /// the heap, so the table cannot change underneath it.
    pub fn occupied<'h, S: ByteStore>(&self, heap: &'h Heap<S>) -> Occupied<'h, S> {
        Occupied {
            heap,
            header: self.load_header(heap),
            next: 0,
        }
    }

    /// The interned keys, in bucket order.
    pub fn keys<'h, S: ByteStore>(&self, heap: &'h Heap<S>) -> Keys<'h, S> {
        Keys {
            inner: self.occupied(heap),
        }
    }

    /// `(key, value bytes)` pairs, in bucket order.
    pub fn entries<'h, S: ByteStore>(&self, heap: &'h Heap<S>) -> Entries<'h, S> {
        Entries {
            inner: self.occupied(heap),
        }
    }
}

pub struct Occupied<'h, S: ByteStore> {
    heap: &'h Heap<S>,
    header: TableHeader,
    next: u64,
}

impl<S: ByteStore> Iterator for Occupied<'_, S> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        while self.next < self.header.bucket_count {
            let idx = self.next;
            self.next += 1;
            let head: BucketHead = self.heap.read(RawTable::bucket_offset(&self.header, idx));
            if head.hash != 0 {
                return Some(idx);
            }
        }
        None
    }
}

pub struct Keys<'h, S: ByteStore> {
    inner: Occupied<'h, S>,
}

impl<'h, S: ByteStore> Iterator for Keys<'h, S> {
    type Item = &'h [u8];

    fn next(&mut self) -> Option<&'h [u8]> {
        let idx = self.inner.next()?;
        let head: BucketHead = self
            .inner
            .heap
            .read(RawTable::bucket_offset(&self.inner.header, idx));
        Some(self.inner.heap.str_at(head.key))
    }
}

pub struct Entries<'h, S: ByteStore> {
    inner: Occupied<'h, S>,
}

impl<'h, S: ByteStore> Iterator for Entries<'h, S> {
    type Item = (&'h [u8], &'h [u8]);

    fn next(&mut self) -> Option<(&'h [u8], &'h [u8])> {
        let idx = self.inner.next()?;
        let hdr = &self.inner.header;
        let offset = RawTable::bucket_offset(hdr, idx);
        let head: BucketHead = self.inner.heap.read(offset);
        let key = self.inner.heap.str_at(head.key);
        let value = self
            .inner
            .heap
            .bytes(offset + BUCKET_HEAD_SIZE, hdr.bucket_size - BUCKET_HEAD_SIZE);
        Some((key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_store::VecStore;
    use crate::heap::{Heap, FIRST_ALLOCATION};
    use proptest::prelude::*;
    use std::collections::HashSet;
    use tempfile::NamedTempFile;

    fn fresh() -> Heap<VecStore> {
        Heap::new(VecStore::with_len(420)).unwrap()
    }

    /// Every occupied bucket has a nonzero hash and a probe distance within
    /// `max_dist`, and the load bound holds at rest.
    fn check_invariants<S: ByteStore>(table: &RawTable, heap: &Heap<S>) {
        let hdr = table.load_header(heap);
        let mut occupied = 0;
        for idx in table.occupied(heap) {
            let head: BucketHead = heap.read(RawTable::bucket_offset(&hdr, idx));
            assert_ne!(head.hash, 0);
            let dist = idx.wrapping_sub(head.hash) % hdr.bucket_count;
            assert!(
                dist <= hdr.max_dist,
                "bucket {idx} probes {dist}, max_dist {}",
                hdr.max_dist
            );
            occupied += 1;
        }
        assert_eq!(occupied, hdr.filled);
        let bound = (hdr.bucket_count * 9 / 10).min(hdr.bucket_count - 1);
        assert!(hdr.filled <= bound);
    }

    #[test]
    fn test_hash_never_zero() {
        assert_ne!(fnv1a(b""), 0);
        assert_ne!(fnv1a(b"key0"), 0);
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut heap = fresh();
        let table = RawTable::create(&mut heap, 0).unwrap();

        let idx = table.insert_str(&mut heap, "hello").unwrap();
        assert_eq!(table.lookup(&heap, "hello"), Some(idx));
        assert_eq!(table.lookup(&heap, "world"), None);
        assert_eq!(table.len(&heap), 1);
        check_invariants(&table, &heap);
    }

    #[test]
    fn test_duplicate_insert_does_not_allocate() {
        let mut heap = fresh();
        let table = RawTable::create(&mut heap, 0).unwrap();

        let first = table.insert_str(&mut heap, "twice").unwrap();
        let size_before = heap.mapped_size();
        let stats_before = table.stats(&heap);
        let hdr = table.load_header(&heap);
        let key_before = heap.read::<BucketHead>(RawTable::bucket_offset(&hdr, first)).key;

        let second = table.insert_str(&mut heap, "twice").unwrap();
        assert_eq!(second, first);
        assert_eq!(table.stats(&heap), stats_before);
        assert_eq!(heap.mapped_size(), size_before);
        let key_after = heap.read::<BucketHead>(RawTable::bucket_offset(&hdr, first)).key;
        assert_eq!(key_after, key_before);
    }

    #[test]
    fn test_bulk_insert_all_found() {
        let mut heap = fresh();
        let table = RawTable::create(&mut heap, 0).unwrap();

        let n = 10_000u64;
        for i in 0..n {
            table.insert_str(&mut heap, &format!("key{i}")).unwrap();
        }
        assert_eq!(table.len(&heap), n);
        for i in 0..n {
            assert!(
                table.lookup(&heap, &format!("key{i}")).is_some(),
                "key{i} not found"
            );
        }
        check_invariants(&table, &heap);
        heap.validate_blocks();
    }

    // Five million formatted keys. Slow; run with
    // `cargo test --release -- --ignored`.
    #[test]
    #[ignore]
    fn test_bulk_insert_full_scale() {
        let mut heap = fresh();
        let table = RawTable::create(&mut heap, 0).unwrap();

        let n = 5_000_000u64;
        for i in 0..n {
            table.insert_str(&mut heap, &format!("key{i}")).unwrap();
        }
        assert_eq!(table.len(&heap), n);
        for i in 0..n {
            assert!(table.lookup(&heap, &format!("key{i}")).is_some());
        }
    }

    #[test]
    fn test_values_survive_rehash() {
        let mut heap = fresh();
        let table = RawTable::create(&mut heap, 8).unwrap();

        // Enough keys to force several rehashes, each carrying its payload.
        for i in 0u64..100 {
            let idx = table.insert_str(&mut heap, &format!("key{i}")).unwrap();
            table.write_value(&mut heap, idx, bytemuck::bytes_of(&i)).unwrap();
        }
        for i in 0u64..100 {
            let idx = table.lookup(&heap, &format!("key{i}")).unwrap();
            let got: u64 = bytemuck::pod_read_unaligned(table.value_at(&heap, idx));
            assert_eq!(got, i);
        }
        check_invariants(&table, &heap);
    }

    #[test]
    fn test_write_value_too_wide() {
        let mut heap = fresh();
        let table = RawTable::create(&mut heap, 4).unwrap();
        let idx = table.insert_str(&mut heap, "k").unwrap();
        assert!(table.write_value(&mut heap, idx, &[0u8; 5]).is_err());
        assert!(table.write_value(&mut heap, idx, &[1, 2, 3, 4]).is_ok());
    }

    #[test]
    fn test_interior_nul_key_rejected() {
        let mut heap = fresh();
        let table = RawTable::create(&mut heap, 0).unwrap();
        assert!(table.insert_str(&mut heap, "a\0b").is_err());
        assert_eq!(table.len(&heap), 0);
    }

    #[test]
    fn test_keys_iterate_in_bucket_order() {
        let mut heap = fresh();
        let table = RawTable::create(&mut heap, 0).unwrap();
        for key in ["one", "two", "three"] {
            table.insert_str(&mut heap, key).unwrap();
        }
        let seen: HashSet<Vec<u8>> = table.keys(&heap).map(|k| k.to_vec()).collect();
        let expected: HashSet<Vec<u8>> = ["one", "two", "three"]
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect();
        assert_eq!(seen, expected);

        let indices: Vec<u64> = table.occupied(&heap).collect();
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        assert_eq!(indices, sorted);
    }

    #[test]
    fn test_persistence_round_trip() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();

        {
            let mut heap = Heap::create(&path, 420).unwrap();
            let table = RawTable::create(&mut heap, 0).unwrap();
            assert_eq!(table.offset(), FIRST_ALLOCATION);
            for i in 0..500 {
                table.insert_str(&mut heap, &format!("key{i}")).unwrap();
            }
            heap.close().unwrap();
        }
        {
            let heap = Heap::load_from(&path).unwrap();
            let table = RawTable::from_offset(FIRST_ALLOCATION);
            assert_eq!(table.len(&heap), 500);
            for i in 0..500 {
                assert!(table.lookup(&heap, &format!("key{i}")).is_some());
            }
            check_invariants(&table, &heap);
        }
    }

    proptest! {
        #[test]
        fn prop_inserted_keys_are_found(keys in prop::collection::hash_set("[a-z0-9]{1,16}", 1..200)) {
            let mut heap = fresh();
            let table = RawTable::create(&mut heap, 0).unwrap();
            for key in &keys {
                table.insert_str(&mut heap, key).unwrap();
            }
            prop_assert_eq!(table.len(&heap), keys.len() as u64);
            for key in &keys {
                prop_assert!(table.lookup(&heap, key).is_some());
            }
            check_invariants(&table, &heap);
        }
    }
}
