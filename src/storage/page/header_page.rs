use byteorder::{ByteOrder, LittleEndian};

use crate::common::config::PAGE_SIZE;
use crate::common::types::PageId;

/// Byte length of a record's name field; longer names are rejected
pub const MAX_NAME_LEN: usize = 32;

const RECORD_SIZE: usize = MAX_NAME_LEN + 4;
const COUNT_SIZE: usize = 4;
const MAX_RECORDS: usize = (PAGE_SIZE - COUNT_SIZE) / RECORD_SIZE;

/// Codec for the sentinel header page (page id 0), which records one
/// `(index_name, root_page_id)` entry per index stored in the file. The tree
/// rewrites its entry on every root change so that an index can be reopened
/// by name.
#[derive(Debug, Default)]
pub struct HeaderPage {
    records: Vec<(String, PageId)>,
}

impl HeaderPage {
    pub fn from_bytes(data: &[u8]) -> Self {
        let count = (LittleEndian::read_u32(&data[0..4]) as usize).min(MAX_RECORDS);
        let mut records = Vec::with_capacity(count);
        for i in 0..count {
            let off = COUNT_SIZE + i * RECORD_SIZE;
            let name_bytes = &data[off..off + MAX_NAME_LEN];
            let len = name_bytes.iter().position(|&b| b == 0).unwrap_or(MAX_NAME_LEN);
            let name = String::from_utf8_lossy(&name_bytes[..len]).into_owned();
            let root = LittleEndian::read_i32(&data[off + MAX_NAME_LEN..off + RECORD_SIZE]);
            records.push((name, root));
        }
        Self { records }
    }

    pub fn write_to(&self, data: &mut [u8]) {
        LittleEndian::write_u32(&mut data[0..4], self.records.len() as u32);
        for (i, (name, root)) in self.records.iter().enumerate() {
            let off = COUNT_SIZE + i * RECORD_SIZE;
            data[off..off + MAX_NAME_LEN].fill(0);
            data[off..off + name.len()].copy_from_slice(name.as_bytes());
            LittleEndian::write_i32(&mut data[off + MAX_NAME_LEN..off + RECORD_SIZE], *root);
        }
    }

    pub fn get_record(&self, name: &str) -> Option<PageId> {
        self.records
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, root)| root)
    }

    /// False when the name is taken, too long, or the page is full
    pub fn insert_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        if name.len() > MAX_NAME_LEN
            || self.records.len() >= MAX_RECORDS
            || self.get_record(name).is_some()
        {
            return false;
        }
        self.records.push((name.to_string(), root_page_id));
        true
    }

    /// False when no record with this name exists
    pub fn update_record(&mut self, name: &str, root_page_id: PageId) -> bool {
        match self.records.iter_mut().find(|(n, _)| n == name) {
            Some(record) => {
                record.1 = root_page_id;
                true
            }
            None => false,
        }
    }
}
