use std::mem::size_of;

use crate::byte_store::ByteStore;
use crate::error::Result;
use crate::heap::Heap;
use crate::raw_table::{Entries, Keys, RawTable};

/// Width of the outer table's payload: the offset of the nested table.
const OFFSET_WIDTH: u64 = size_of::<u64>() as u64;

/// Maps interned string keys to sets of strings. An outer [`RawTable`] whose
/// per-bucket payload is the header offset of a nested, value-less table
/// holding that key's values. Like `RawTable`, the handle is `Copy` and all
/// state lives in the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiMap {
    table: RawTable,
}

impl MultiMap {
    pub fn create<S: ByteStore>(heap: &mut Heap<S>) -> Result<Self> {
        Ok(Self {
            table: RawTable::create(heap, OFFSET_WIDTH)?,
        })
    }

    /// Reconstructs a handle for a multi-map whose outer table header lives
    /// at `offset`.
    pub fn from_offset(offset: u64) -> Self {
        Self {
            table: RawTable::from_offset(offset),
        }
    }

    pub fn offset(&self) -> u64 {
        self.table.offset()
    }

    /// Number of distinct keys.
    pub fn len<S: ByteStore>(&self, heap: &Heap<S>) -> u64 {
        self.table.len(heap)
    }

    pub fn is_empty<S: ByteStore>(&self, heap: &Heap<S>) -> bool {
        self.table.is_empty(heap)
    }

    fn nested_at<S: ByteStore>(&self, heap: &Heap<S>, idx: u64) -> RawTable {
        let offset: u64 = bytemuck::pod_read_unaligned(self.table.value_at(heap, idx));
        RawTable::from_offset(offset)
    }

    /// Adds `value` to the set stored under `key`. The nested table is
    /// created on the key's first insert; its header offset is written into
    /// the outer bucket before anything else can move it.
    pub fn insert<S: ByteStore>(&self, heap: &mut Heap<S>, key: &str, value: &str) -> Result<()> {
        let nested = match self.table.lookup(heap, key) {
            Some(idx) => self.nested_at(heap, idx),
            None => {
                let idx = self.table.insert_str(heap, key)?;
                let nested = RawTable::create(heap, 0)?;
                self.table
                    .write_value(heap, idx, bytemuck::bytes_of(&nested.offset()))?;
                nested
            }
        };
        nested.insert_str(heap, value)?;
        Ok(())
    }

    /// Iterator over the values stored under `key`, or `None` if the key is
    /// absent.
    pub fn values<'h, S: ByteStore>(&self, heap: &'h Heap<S>, key: &str) -> Option<Keys<'h, S>> {
        let idx = self.table.lookup(heap, key)?;
        Some(self.nested_at(heap, idx).keys(heap))
    }

    /// Iterator over `(key, nested value table)` pairs.
    pub fn iter<'h, S: ByteStore>(&self, heap: &'h Heap<S>) -> Groups<'h, S> {
        Groups {
            inner: self.table.entries(heap),
        }
    }
}

/// Yields each key alongside the table holding its value set.
pub struct Groups<'h, S: ByteStore> {
    inner: Entries<'h, S>,
}

impl<'h, S: ByteStore> Iterator for Groups<'h, S> {
    type Item = (&'h [u8], RawTable);

    fn next(&mut self) -> Option<(&'h [u8], RawTable)> {
        let (key, value) = self.inner.next()?;
        let offset: u64 = bytemuck::pod_read_unaligned(value);
        Some((key, RawTable::from_offset(offset)))
    }
}
