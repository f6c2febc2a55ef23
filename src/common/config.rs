use std::time::Duration;

use crate::common::types::{PageId, TxnId};

/// Page size in bytes
pub const PAGE_SIZE: usize = 4096;

/// Default number of frames in the buffer pool
pub const BUFFER_POOL_SIZE: usize = 64;

/// K parameter of the LRU-K replacement policy
pub const LRUK_REPLACER_K: usize = 2;

/// Capacity of an extendible hash table bucket
pub const BUCKET_SIZE: usize = 4;

/// Default maximum number of key/value slots in a B+ tree leaf page
pub const LEAF_PAGE_SIZE: usize = 128;

/// Default maximum number of children in a B+ tree internal page
pub const INTERNAL_PAGE_SIZE: usize = 128;

/// How often the lock manager's background detector looks for deadlocks
pub const CYCLE_DETECTION_INTERVAL: Duration = Duration::from_millis(50);

/// Sentinel for "no page"
pub const INVALID_PAGE_ID: PageId = -1;

/// The index header page lives at a fixed, reserved page id
pub const HEADER_PAGE_ID: PageId = 0;

/// Sentinel for "no transaction"
pub const INVALID_TXN_ID: TxnId = -1;
