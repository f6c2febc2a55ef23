use serde::{Deserialize, Serialize};

/// Page ID type; negative values are sentinels
pub type PageId = i32;

/// Buffer pool frame ID type, always in `[0, pool_size)`
pub type FrameId = usize;

/// Transaction ID type
pub type TxnId = i32;

/// Table object ID type
pub type TableOid = u32;

/// Record identifier: the page a record lives on plus its slot within it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rid {
    pub page_id: PageId,
    pub slot: u32,
}

impl Rid {
    pub fn new(page_id: PageId, slot: u32) -> Self {
        Self { page_id, slot }
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.page_id, self.slot)
    }
}
