use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::common::config::{HEADER_PAGE_ID, PAGE_SIZE};
use crate::common::types::PageId;

#[derive(Error, Debug)]
pub enum DiskManagerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),
}

/// DiskManager handles the actual page I/O against the single backing file.
/// Pages live at `page_id * PAGE_SIZE`; page 0 is reserved for the index
/// header page, so `allocate_page` hands out ids from 1 upwards.
pub struct DiskManager {
    db_file: Mutex<File>,
    next_page_id: AtomicI32,
}

impl DiskManager {
    /// Open (or create) the database file at `db_path`
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, DiskManagerError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path)?;

        let pages_on_disk = (file.metadata()?.len() / PAGE_SIZE as u64) as PageId;
        let next_page_id = pages_on_disk.max(HEADER_PAGE_ID + 1);

        Ok(Self {
            db_file: Mutex::new(file),
            next_page_id: AtomicI32::new(next_page_id),
        })
    }

    /// Read a page into `buf`. Reading a page that was never written yields
    /// a zeroed page, matching the state a fresh allocation would see.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<(), DiskManagerError> {
        if page_id < 0 {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        let offset = page_id as u64 * PAGE_SIZE as u64;
        let mut file = self.db_file.lock();

        let file_size = file.metadata()?.len();
        if offset >= file_size {
            buf.fill(0);
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Write a page's payload to its slot in the file
    pub fn write_page(&self, page_id: PageId, buf: &[u8; PAGE_SIZE]) -> Result<(), DiskManagerError> {
        if page_id < 0 {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        let offset = page_id as u64 * PAGE_SIZE as u64;
        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        file.flush()?;
        Ok(())
    }

    /// Hand out the next page id; ids are monotonic and never reused
    pub fn allocate_page(&self) -> PageId {
        self.next_page_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Release a page id. Ids are not recycled, so this only exists to keep
    /// the allocation interface symmetric.
    pub fn deallocate_page(&self, _page_id: PageId) {}
}
