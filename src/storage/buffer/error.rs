use thiserror::Error;

use crate::common::types::{FrameId, PageId};
use crate::storage::disk::DiskManagerError;

#[derive(Error, Debug)]
pub enum BufferPoolError {
    #[error("Page {0} not resident")]
    PageNotFound(PageId),

    #[error("Page {0} is pinned")]
    PagePinned(PageId),

    #[error("Page {0} is not pinned")]
    PageNotPinned(PageId),

    #[error("No free frames available and no frame is evictable")]
    NoFreeFrames,

    #[error("Frame {0} is not evictable")]
    FrameNotEvictable(FrameId),

    #[error("Disk manager error: {0}")]
    DiskManager(#[from] DiskManagerError),
}
