use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::config::INVALID_PAGE_ID;
use crate::common::types::Rid;
use crate::index::btree::codec;
use crate::index::btree::node::BTreeNode;
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::PageReadGuard;

/// The iterator's cursor: a pinned, read-latched leaf and an index into it
pub(crate) struct LeafPosition<K> {
    pub(crate) guard: PageReadGuard,
    pub(crate) node: BTreeNode<K>,
    pub(crate) index: usize,
}

/// Forward scan over the leaf chain in ascending key order.
///
/// The current leaf stays pinned and read-latched while the iterator sits
/// on it. Stepping past its last slot releases it and latches the next
/// sibling hand over hand; exhaustion and `Drop` release whatever is held.
pub struct BPlusTreeIterator<K> {
    buffer_pool: Arc<BufferPoolManager>,
    position: Option<LeafPosition<K>>,
}

impl<K> BPlusTreeIterator<K>
where
    K: Clone + Ord + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub(crate) fn new(buffer_pool: Arc<BufferPoolManager>, position: LeafPosition<K>) -> Self {
        Self {
            buffer_pool,
            position: Some(position),
        }
    }

    pub(crate) fn empty(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            buffer_pool,
            position: None,
        }
    }

    fn release_current(&mut self) {
        if let Some(position) = self.position.take() {
            let page_id = position.node.page_id;
            drop(position.guard);
            let _ = self.buffer_pool.unpin_page(page_id, false);
        }
    }
}

impl<K> Iterator for BPlusTreeIterator<K>
where
    K: Clone + Ord + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Item = (K, Rid);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let position = self.position.as_mut()?;
            if position.index < position.node.size() {
                let entry = position.node.leaf_entry_at(position.index);
                position.index += 1;
                return Some(entry);
            }

            let next_id = position.node.next_page_id();
            self.release_current();
            if next_id == INVALID_PAGE_ID {
                return None;
            }

            let page = self.buffer_pool.fetch_page(next_id).ok()?;
            let guard = page.read_arc();
            let node = codec::decode::<K>(&guard.data).ok()?;
            self.position = Some(LeafPosition { guard, node, index: 0 });
        }
    }
}

impl<K> Drop for BPlusTreeIterator<K> {
    fn drop(&mut self) {
        if let Some(position) = self.position.take() {
            let page_id = position.node.page_id;
            drop(position.guard);
            let _ = self.buffer_pool.unpin_page(page_id, false);
        }
    }
}
