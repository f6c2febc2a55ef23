use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::common::config::{BUCKET_SIZE, INVALID_PAGE_ID, PAGE_SIZE};
use crate::common::types::{FrameId, PageId};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::lru_k_replacer::LruKReplacer;
use crate::storage::disk::DiskManager;
use crate::storage::hash::ExtendibleHashTable;
use crate::storage::page::{Page, PagePtr};

/// A buffer pool slot. The page's `RwLock` is the page latch and guards the
/// payload; pin count and dirty flag are bookkeeping owned by the pool's
/// global mutex.
struct Frame {
    page: PagePtr,
    pin_count: u32,
    is_dirty: bool,
}

struct PoolState {
    frames: Vec<Frame>,
    /// page_id -> frame_id for every resident page
    page_table: ExtendibleHashTable<PageId, FrameId>,
    replacer: LruKReplacer,
    free_list: VecDeque<FrameId>,
}

/// The page cache. Mediates all page access between clients and the disk
/// manager: bounded set of frames, pin discipline, dirty write-back, LRU-K
/// eviction, page id allocation.
///
/// One global mutex serializes every operation, including the synchronous
/// disk I/O done while claiming a victim frame. Page latches are never
/// acquired while waiting on this mutex going the other way, so the mutex
/// stays a leaf lock.
pub struct BufferPoolManager {
    pool_size: usize,
    disk_manager: Arc<DiskManager>,
    state: Mutex<PoolState>,
}

impl BufferPoolManager {
    pub fn new(
        pool_size: usize,
        replacer_k: usize,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        Ok(Self::with_disk_manager(pool_size, replacer_k, disk_manager))
    }

    pub fn with_disk_manager(
        pool_size: usize,
        replacer_k: usize,
        disk_manager: Arc<DiskManager>,
    ) -> Self {
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);
        for frame_id in 0..pool_size {
            frames.push(Frame {
                page: Arc::new(RwLock::new(Page::default())),
                pin_count: 0,
                is_dirty: false,
            });
            free_list.push_back(frame_id);
        }

        Self {
            pool_size,
            disk_manager,
            state: Mutex::new(PoolState {
                frames,
                page_table: ExtendibleHashTable::new(BUCKET_SIZE),
                replacer: LruKReplacer::new(pool_size, replacer_k),
                free_list,
            }),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Pin count of a resident page; `None` when the page is not in the pool
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let state = self.state.lock();
        let frame_id = state.page_table.find(&page_id)?;
        Some(state.frames[frame_id].pin_count)
    }

    /// Allocate a fresh page, claim a frame for it and return it pinned
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let mut state = self.state.lock();
        let frame_id = self.claim_frame(&mut state)?;
        let page_id = self.disk_manager.allocate_page();

        let frame = &mut state.frames[frame_id];
        {
            let mut page = frame.page.write();
            page.reset();
            page.page_id = page_id;
        }
        frame.pin_count = 1;
        frame.is_dirty = false;

        state.replacer.record_access(frame_id);
        state.replacer.set_evictable(frame_id, false);
        state.page_table.insert(page_id, frame_id);

        Ok((state.frames[frame_id].page.clone(), page_id))
    }

    /// Return the requested page pinned, reading it from disk when it is
    /// not resident
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id < 0 {
            return Err(BufferPoolError::PageNotFound(page_id));
        }

        let mut state = self.state.lock();
        if let Some(frame_id) = state.page_table.find(&page_id) {
            state.frames[frame_id].pin_count += 1;
            state.replacer.record_access(frame_id);
            state.replacer.set_evictable(frame_id, false);
            return Ok(state.frames[frame_id].page.clone());
        }

        let frame_id = self.claim_frame(&mut state)?;
        let mut buf = [0u8; PAGE_SIZE];
        self.disk_manager.read_page(page_id, &mut buf)?;

        let frame = &mut state.frames[frame_id];
        {
            let mut page = frame.page.write();
            page.page_id = page_id;
            page.data = buf;
        }
        frame.pin_count = 1;
        frame.is_dirty = false;

        state.replacer.record_access(frame_id);
        state.replacer.set_evictable(frame_id, false);
        state.page_table.insert(page_id, frame_id);

        Ok(state.frames[frame_id].page.clone())
    }

    /// Drop one pin on a page, folding `is_dirty` into its dirty flag. The
    /// frame becomes evictable when the last pin goes away.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();
        let frame_id = match state.page_table.find(&page_id) {
            Some(id) => id,
            None => {
                debug!("unpin of non-resident page {}", page_id);
                return Err(BufferPoolError::PageNotFound(page_id));
            }
        };

        let frame = &mut state.frames[frame_id];
        if frame.pin_count == 0 {
            debug!("unpin of unpinned page {}", page_id);
            return Err(BufferPoolError::PageNotPinned(page_id));
        }
        frame.pin_count -= 1;
        if is_dirty {
            frame.is_dirty = true;
        }
        if frame.pin_count == 0 {
            state.replacer.set_evictable(frame_id, true);
        }
        Ok(())
    }

    /// Write a resident page to disk unconditionally and clear its dirty flag
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();
        let frame_id = state
            .page_table
            .find(&page_id)
            .ok_or(BufferPoolError::PageNotFound(page_id))?;

        let data = state.frames[frame_id].page.read().data;
        self.disk_manager.write_page(page_id, &data)?;
        state.frames[frame_id].is_dirty = false;
        Ok(())
    }

    /// Flush every resident page
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();
        for frame_id in 0..self.pool_size {
            let page_id = state.frames[frame_id].page.read().page_id;
            if page_id == INVALID_PAGE_ID {
                continue;
            }
            let data = state.frames[frame_id].page.read().data;
            self.disk_manager.write_page(page_id, &data)?;
            state.frames[frame_id].is_dirty = false;
        }
        Ok(())
    }

    /// Drop a page from the pool and release its id. Deleting a page that
    /// is not resident succeeds; deleting a pinned page fails.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        let mut state = self.state.lock();
        let frame_id = match state.page_table.find(&page_id) {
            Some(id) => id,
            None => return Ok(()),
        };

        if state.frames[frame_id].pin_count > 0 {
            debug!("delete of pinned page {}", page_id);
            return Err(BufferPoolError::PagePinned(page_id));
        }

        state.replacer.remove(frame_id)?;
        state.page_table.remove(&page_id);
        state.frames[frame_id].page.write().reset();
        state.frames[frame_id].is_dirty = false;
        state.free_list.push_back(frame_id);
        self.disk_manager.deallocate_page(page_id);
        Ok(())
    }

    /// Take a frame from the free list, or evict a victim: a dirty victim is
    /// written back before the frame is handed out, and its page-table entry
    /// is erased before the caller installs a new one
    fn claim_frame(&self, state: &mut PoolState) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = state.replacer.evict().ok_or(BufferPoolError::NoFreeFrames)?;
        let (old_page_id, data) = {
            let page = state.frames[frame_id].page.read();
            (page.page_id, page.data)
        };
        if state.frames[frame_id].is_dirty {
            self.disk_manager.write_page(old_page_id, &data)?;
            state.frames[frame_id].is_dirty = false;
        }
        if old_page_id != INVALID_PAGE_ID {
            state.page_table.remove(&old_page_id);
        }
        Ok(frame_id)
    }
}
