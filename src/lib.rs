pub mod byte_store;
mod error;
pub mod heap;
pub mod multi_map;
pub mod raw_table;

pub use byte_store::{ByteStore, MmapFile, VecStore};
pub use error::{DiskMapError, Result};
pub use heap::{Heap, FIRST_ALLOCATION};
pub use multi_map::{Groups, MultiMap};
pub use raw_table::{Entries, Keys, Occupied, RawTable, TableStats};
