use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::config::PAGE_SIZE;
use crate::common::types::{PageId, Rid};
use crate::index::btree::error::BTreeError;
use crate::index::btree::node::{BTreeNode, NodeContents};

// Fixed page header, stable across versions:
//   [0]      page type (1 = leaf, 2 = internal)
//   [1..3]   size        (leaf: key count, internal: child count)
//   [3..5]   max_size
//   [5..9]   parent_page_id
//   [9..13]  page_id
//   [13..17] next_page_id (leaf pages only)
// Entries follow the header: leaves as (key_len, key, rid page id, rid slot),
// internal pages as child0 then (key_len, key, child) per separator. Keys
// are length-prefixed bincode.
const PAGE_TYPE_LEAF: u8 = 1;
const PAGE_TYPE_INTERNAL: u8 = 2;

const PARENT_OFFSET: usize = 5;
const LEAF_HEADER_SIZE: usize = 17;
const INTERNAL_HEADER_SIZE: usize = 13;

/// Serialize a node into a page buffer
pub fn encode<K>(node: &BTreeNode<K>, data: &mut [u8]) -> Result<(), BTreeError>
where
    K: Serialize + Clone + Ord,
{
    data.fill(0);
    LittleEndian::write_u16(&mut data[3..5], node.max_size as u16);
    LittleEndian::write_i32(&mut data[5..9], node.parent_page_id);
    LittleEndian::write_i32(&mut data[9..13], node.page_id);

    match &node.contents {
        NodeContents::Leaf { keys, values, next_page_id } => {
            data[0] = PAGE_TYPE_LEAF;
            LittleEndian::write_u16(&mut data[1..3], keys.len() as u16);
            LittleEndian::write_i32(&mut data[13..17], *next_page_id);

            let mut offset = LEAF_HEADER_SIZE;
            for (key, rid) in keys.iter().zip(values) {
                offset = write_key(data, offset, key)?;
                ensure_room(offset, 8)?;
                LittleEndian::write_i32(&mut data[offset..offset + 4], rid.page_id);
                LittleEndian::write_u32(&mut data[offset + 4..offset + 8], rid.slot);
                offset += 8;
            }
        }
        NodeContents::Internal { keys, children } => {
            data[0] = PAGE_TYPE_INTERNAL;
            LittleEndian::write_u16(&mut data[1..3], children.len() as u16);

            let mut offset = INTERNAL_HEADER_SIZE;
            ensure_room(offset, 4)?;
            LittleEndian::write_i32(&mut data[offset..offset + 4], children[0]);
            offset += 4;
            for (key, child) in keys.iter().zip(&children[1..]) {
                offset = write_key(data, offset, key)?;
                ensure_room(offset, 4)?;
                LittleEndian::write_i32(&mut data[offset..offset + 4], *child);
                offset += 4;
            }
        }
    }
    Ok(())
}

/// Reconstruct a node from a page buffer
pub fn decode<K>(data: &[u8]) -> Result<BTreeNode<K>, BTreeError>
where
    K: DeserializeOwned + Clone + Ord,
{
    let size = LittleEndian::read_u16(&data[1..3]) as usize;
    let max_size = LittleEndian::read_u16(&data[3..5]) as usize;
    let parent_page_id = LittleEndian::read_i32(&data[5..9]);
    let page_id = LittleEndian::read_i32(&data[9..13]);

    let contents = match data[0] {
        PAGE_TYPE_LEAF => {
            let next_page_id = LittleEndian::read_i32(&data[13..17]);
            let mut keys = Vec::with_capacity(size);
            let mut values = Vec::with_capacity(size);
            let mut offset = LEAF_HEADER_SIZE;
            for _ in 0..size {
                let (key, next) = read_key(data, offset)?;
                offset = next;
                let rid_page = LittleEndian::read_i32(&data[offset..offset + 4]);
                let rid_slot = LittleEndian::read_u32(&data[offset + 4..offset + 8]);
                offset += 8;
                keys.push(key);
                values.push(Rid::new(rid_page, rid_slot));
            }
            NodeContents::Leaf { keys, values, next_page_id }
        }
        PAGE_TYPE_INTERNAL => {
            if size == 0 {
                return Err(BTreeError::InvalidPageFormat);
            }
            let mut keys = Vec::with_capacity(size - 1);
            let mut children = Vec::with_capacity(size);
            let mut offset = INTERNAL_HEADER_SIZE;
            children.push(LittleEndian::read_i32(&data[offset..offset + 4]));
            offset += 4;
            for _ in 1..size {
                let (key, next) = read_key(data, offset)?;
                offset = next;
                keys.push(key);
                children.push(LittleEndian::read_i32(&data[offset..offset + 4]));
                offset += 4;
            }
            NodeContents::Internal { keys, children }
        }
        _ => return Err(BTreeError::InvalidPageFormat),
    };

    Ok(BTreeNode {
        page_id,
        parent_page_id,
        max_size,
        contents,
    })
}

/// Patch only the parent pointer in an encoded page. Reparenting moved
/// children touches nothing else, so the page need not be re-encoded.
pub fn write_parent_page_id(data: &mut [u8], parent_page_id: PageId) {
    LittleEndian::write_i32(&mut data[PARENT_OFFSET..PARENT_OFFSET + 4], parent_page_id);
}

fn write_key<K: Serialize>(data: &mut [u8], offset: usize, key: &K) -> Result<usize, BTreeError> {
    let bytes = bincode::serialize(key)
        .map_err(|e| BTreeError::SerializationError(e.to_string()))?;
    ensure_room(offset, 2 + bytes.len())?;
    LittleEndian::write_u16(&mut data[offset..offset + 2], bytes.len() as u16);
    data[offset + 2..offset + 2 + bytes.len()].copy_from_slice(&bytes);
    Ok(offset + 2 + bytes.len())
}

fn read_key<K: DeserializeOwned>(data: &[u8], offset: usize) -> Result<(K, usize), BTreeError> {
    if offset + 2 > data.len() {
        return Err(BTreeError::InvalidPageFormat);
    }
    let len = LittleEndian::read_u16(&data[offset..offset + 2]) as usize;
    if offset + 2 + len > data.len() {
        return Err(BTreeError::InvalidPageFormat);
    }
    let key = bincode::deserialize(&data[offset + 2..offset + 2 + len])
        .map_err(|e| BTreeError::DeserializationError(e.to_string()))?;
    Ok((key, offset + 2 + len))
}

fn ensure_room(offset: usize, len: usize) -> Result<(), BTreeError> {
    if offset + len > PAGE_SIZE {
        return Err(BTreeError::NodeTooLarge);
    }
    Ok(())
}
