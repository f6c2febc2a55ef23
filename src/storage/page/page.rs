use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

use crate::common::config::{INVALID_PAGE_ID, PAGE_SIZE};
use crate::common::types::PageId;

/// A fixed-size page of data. The `RwLock` wrapping every shared page is the
/// page latch: readers crab with shared guards, writers with exclusive ones.
/// Pin counts and dirty flags are frame metadata and live in the buffer pool.
pub struct Page {
    pub page_id: PageId,
    pub data: [u8; PAGE_SIZE],
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            data: [0; PAGE_SIZE],
        }
    }

    /// Zero the payload and drop the identity, returning the page to its
    /// fresh state
    pub fn reset(&mut self) {
        self.page_id = INVALID_PAGE_ID;
        self.data.fill(0);
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(INVALID_PAGE_ID)
    }
}

/// Shared handle to a latched page
pub type PagePtr = Arc<RwLock<Page>>;

/// Owned shared latch guard; may outlive the scope that acquired it, which
/// latch crabbing requires
pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, Page>;

/// Owned exclusive latch guard
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, Page>;
