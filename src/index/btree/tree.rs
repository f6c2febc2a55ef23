use std::marker::PhantomData;
use std::sync::Arc;

use log::debug;
use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::{RawRwLock, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::config::{HEADER_PAGE_ID, INVALID_PAGE_ID};
use crate::common::types::{PageId, Rid};
use crate::index::btree::codec;
use crate::index::btree::error::BTreeError;
use crate::index::btree::iterator::{BPlusTreeIterator, LeafPosition};
use crate::index::btree::node::{BTreeNode, NodeContents};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::{HeaderPage, PageReadGuard, PageWriteGuard};

type RootIdGuard = ArcRwLockWriteGuard<RawRwLock, PageId>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum WriteOp {
    Insert,
    Delete,
}

/// One write-latched page on the descent path, with its decoded image.
/// The image is written back into the page right before the latch drops,
/// and only when the operation actually changed it.
struct PathEntry<K> {
    guard: PageWriteGuard,
    node: BTreeNode<K>,
    dirty: bool,
}

/// Operation-scoped latch set for a mutating descent: the root-id latch
/// plus every ancestor still latched, root end first. Pages that the
/// operation logically deleted are removed once their latches drop.
struct WriteContext<K> {
    root_guard: Option<RootIdGuard>,
    path: Vec<PathEntry<K>>,
    deleted: Vec<PageId>,
}

/// Concurrent B+ tree index with unique keys, backed by buffer pool pages.
///
/// Descents crab latches root to leaf: readers hold at most a parent/child
/// pair of shared latches, writers keep the exclusively latched path until
/// the freshly latched child is safe, then release every ancestor. The
/// `root_page_id` latch fences root replacement (first insert, root split,
/// root collapse) against concurrent descents, and the header page at page
/// id 0 persists `index_name -> root_page_id` across reopens.
pub struct BPlusTree<K> {
    index_name: String,
    buffer_pool: Arc<BufferPoolManager>,
    root_page_id: Arc<RwLock<PageId>>,
    leaf_max_size: usize,
    internal_max_size: usize,
    _key: PhantomData<K>,
}

impl<K> BPlusTree<K>
where
    K: Clone + Ord + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Open the index `index_name`, creating its header record on first use.
    /// An index that was written before is reopened at its recorded root.
    pub fn new(
        index_name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        assert!(leaf_max_size >= 2, "leaf pages need at least two slots");
        assert!(internal_max_size >= 3, "internal pages need at least three children");
        let index_name = index_name.into();

        let page = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        let mut known = true;
        let root_page_id = {
            let mut guard = page.write();
            let mut header = HeaderPage::from_bytes(&guard.data);
            match header.get_record(&index_name) {
                Some(root) => root,
                None => {
                    known = false;
                    if !header.insert_record(&index_name, INVALID_PAGE_ID) {
                        drop(guard);
                        buffer_pool.unpin_page(HEADER_PAGE_ID, false)?;
                        return Err(BTreeError::HeaderFull(index_name));
                    }
                    header.write_to(&mut guard.data);
                    INVALID_PAGE_ID
                }
            }
        };
        buffer_pool.unpin_page(HEADER_PAGE_ID, !known)?;

        Ok(Self {
            index_name,
            buffer_pool,
            root_page_id: Arc::new(RwLock::new(root_page_id)),
            leaf_max_size,
            internal_max_size,
            _key: PhantomData,
        })
    }

    pub fn is_empty(&self) -> bool {
        *self.root_page_id.read() == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        *self.root_page_id.read()
    }

    /// Insert a key/record pair. Returns `Ok(false)` when the key already
    /// exists; the tree is left unchanged in that case.
    pub fn insert(&self, key: K, rid: Rid) -> Result<bool, BTreeError> {
        let root_guard = self.root_page_id.write_arc();
        let root_id = *root_guard;
        let mut ctx = WriteContext {
            root_guard: Some(root_guard),
            path: Vec::new(),
            deleted: Vec::new(),
        };

        if root_id == INVALID_PAGE_ID {
            self.start_new_tree(&mut ctx, key, rid)?;
            return self.finish(ctx).map(|_| true);
        }

        self.descend_for_write(&mut ctx, root_id, &key, WriteOp::Insert)?;

        let leaf = ctx.path.last_mut().expect("descent reached no leaf");
        if !leaf.node.leaf_insert(key, rid) {
            self.finish(ctx)?;
            return Ok(false);
        }
        leaf.dirty = true;

        if leaf.node.size() >= self.leaf_max_size {
            self.split_and_propagate(&mut ctx)?;
        }
        self.finish(ctx).map(|_| true)
    }

    /// Remove a key; removing an absent key is a no-op
    pub fn remove(&self, key: &K) -> Result<(), BTreeError> {
        let root_guard = self.root_page_id.write_arc();
        let root_id = *root_guard;
        let mut ctx = WriteContext {
            root_guard: Some(root_guard),
            path: Vec::new(),
            deleted: Vec::new(),
        };

        if root_id == INVALID_PAGE_ID {
            return Ok(());
        }

        self.descend_for_write(&mut ctx, root_id, key, WriteOp::Delete)?;

        let leaf = ctx.path.last_mut().expect("descent reached no leaf");
        if !leaf.node.leaf_remove(key) {
            return self.finish(ctx);
        }
        leaf.dirty = true;

        self.rebalance_after_remove(&mut ctx)?;
        self.finish(ctx)
    }

    /// Point lookup; unique keys make the result empty or a single record
    pub fn get_value(&self, key: &K) -> Result<Vec<Rid>, BTreeError> {
        match self.find_leaf_shared(Some(key))? {
            None => Ok(Vec::new()),
            Some((guard, node)) => {
                let result = node.leaf_lookup(key).into_iter().collect();
                let page_id = node.page_id;
                drop(guard);
                self.buffer_pool.unpin_page(page_id, false)?;
                Ok(result)
            }
        }
    }

    /// Forward iterator over every key, ascending
    pub fn iter(&self) -> Result<BPlusTreeIterator<K>, BTreeError> {
        match self.find_leaf_shared(None)? {
            None => Ok(BPlusTreeIterator::empty(self.buffer_pool.clone())),
            Some((guard, node)) => Ok(BPlusTreeIterator::new(
                self.buffer_pool.clone(),
                LeafPosition { guard, node, index: 0 },
            )),
        }
    }

    /// Iterator positioned at `key`; empty when the key is absent
    pub fn iter_from(&self, key: &K) -> Result<BPlusTreeIterator<K>, BTreeError> {
        match self.find_leaf_shared(Some(key))? {
            None => Ok(BPlusTreeIterator::empty(self.buffer_pool.clone())),
            Some((guard, node)) => match node.leaf_position_of(key) {
                Some(index) => Ok(BPlusTreeIterator::new(
                    self.buffer_pool.clone(),
                    LeafPosition { guard, node, index },
                )),
                None => {
                    let page_id = node.page_id;
                    drop(guard);
                    self.buffer_pool.unpin_page(page_id, false)?;
                    Ok(BPlusTreeIterator::empty(self.buffer_pool.clone()))
                }
            },
        }
    }

    /// Shared-latch descent to the leaf owning `key`, or to the leftmost
    /// leaf when no key is given. Returns the leaf pinned and read-latched;
    /// `None` when the tree is empty.
    fn find_leaf_shared(
        &self,
        key: Option<&K>,
    ) -> Result<Option<(PageReadGuard, BTreeNode<K>)>, BTreeError> {
        let root_guard = self.root_page_id.read_arc();
        let root_id = *root_guard;
        if root_id == INVALID_PAGE_ID {
            return Ok(None);
        }

        let page = self.buffer_pool.fetch_page(root_id)?;
        let mut guard = page.read_arc();
        drop(root_guard);
        let mut node = codec::decode::<K>(&guard.data)?;

        while !node.is_leaf() {
            let child_id = match key {
                Some(key) => node.child_at(node.child_index_for(key)),
                None => node.child_at(0),
            };
            debug_assert!(child_id != INVALID_PAGE_ID, "descent hit an invalid child");

            let child_page = self.buffer_pool.fetch_page(child_id)?;
            let child_guard = child_page.read_arc();
            let parent_id = node.page_id;
            drop(guard);
            self.buffer_pool.unpin_page(parent_id, false)?;

            guard = child_guard;
            node = codec::decode::<K>(&guard.data)?;
        }
        Ok(Some((guard, node)))
    }

    /// Exclusive-latch descent. Ancestors (and the root-id latch) are
    /// released as soon as the newly latched child cannot propagate a
    /// structural change up to them.
    fn descend_for_write(
        &self,
        ctx: &mut WriteContext<K>,
        root_id: PageId,
        key: &K,
        op: WriteOp,
    ) -> Result<(), BTreeError> {
        let mut page_id = root_id;
        loop {
            let page = self.buffer_pool.fetch_page(page_id)?;
            let guard = page.write_arc();
            let node = codec::decode::<K>(&guard.data)?;

            let safe = match op {
                WriteOp::Insert => node.is_insert_safe(),
                WriteOp::Delete => node.is_delete_safe(),
            };
            if safe {
                self.release_ancestors(ctx)?;
            }

            let next = match &node.contents {
                NodeContents::Leaf { .. } => None,
                NodeContents::Internal { .. } => {
                    Some(node.child_at(node.child_index_for(key)))
                }
            };
            ctx.path.push(PathEntry { guard, node, dirty: false });

            match next {
                None => return Ok(()),
                Some(child_id) => {
                    debug_assert!(child_id != INVALID_PAGE_ID, "descent hit an invalid child");
                    page_id = child_id;
                }
            }
        }
    }

    /// First insert into an empty tree: a fresh leaf becomes the root
    fn start_new_tree(&self, ctx: &mut WriteContext<K>, key: K, rid: Rid) -> Result<(), BTreeError> {
        let (page, page_id) = self.buffer_pool.new_page()?;
        {
            let mut guard = page.write();
            let mut root = BTreeNode::new_leaf(page_id, INVALID_PAGE_ID, self.leaf_max_size);
            root.leaf_insert(key, rid);
            codec::encode(&root, &mut guard.data)?;
        }
        self.buffer_pool.unpin_page(page_id, true)?;

        self.set_root(ctx, page_id)?;
        debug!("index '{}' rooted at page {}", self.index_name, page_id);
        Ok(())
    }

    /// Split the overflowed tail of the latched path, inserting risen keys
    /// upward until a parent absorbs the split or the root itself splits
    fn split_and_propagate(&self, ctx: &mut WriteContext<K>) -> Result<(), BTreeError> {
        let mut level = ctx.path.len() - 1;
        loop {
            let (new_page, new_page_id) = self.buffer_pool.new_page()?;
            let mut new_guard = new_page.write_arc();

            let entry = &mut ctx.path[level];
            entry.dirty = true;
            let (mut new_node, risen) = if entry.node.is_leaf() {
                entry.node.split_leaf(new_page_id)
            } else {
                entry.node.split_internal(new_page_id)
            };
            let old_page_id = entry.node.page_id;
            let old_is_root = entry.node.is_root();
            let moved_children: Vec<PageId> = if new_node.is_leaf() {
                Vec::new()
            } else {
                new_node.children().to_vec()
            };

            if old_is_root {
                // The old root and its new sibling go under a fresh root
                let (root_page, root_id) = self.buffer_pool.new_page()?;
                {
                    let mut root_guard = root_page.write();
                    let root = BTreeNode {
                        page_id: root_id,
                        parent_page_id: INVALID_PAGE_ID,
                        max_size: self.internal_max_size,
                        contents: NodeContents::Internal {
                            keys: vec![risen],
                            children: vec![old_page_id, new_page_id],
                        },
                    };
                    codec::encode(&root, &mut root_guard.data)?;
                }
                self.buffer_pool.unpin_page(root_id, true)?;

                ctx.path[level].node.parent_page_id = root_id;
                new_node.parent_page_id = root_id;
                codec::encode(&new_node, &mut new_guard.data)?;
                drop(new_guard);
                self.buffer_pool.unpin_page(new_page_id, true)?;
                for child in moved_children {
                    self.reparent(ctx, child, new_page_id)?;
                }

                self.set_root(ctx, root_id)?;
                debug!("index '{}' grew a new root {}", self.index_name, root_id);
                return Ok(());
            }

            debug_assert!(level > 0, "unsafe non-root node with released parent");
            let parent_id = ctx.path[level - 1].node.page_id;
            new_node.parent_page_id = parent_id;
            codec::encode(&new_node, &mut new_guard.data)?;
            drop(new_guard);
            self.buffer_pool.unpin_page(new_page_id, true)?;
            for child in moved_children {
                self.reparent(ctx, child, new_page_id)?;
            }

            let parent = &mut ctx.path[level - 1];
            parent.node.insert_child(risen, new_page_id);
            parent.dirty = true;
            if parent.node.size() <= self.internal_max_size {
                return Ok(());
            }
            level -= 1;
        }
    }

    /// Walk back up the latched path fixing underflow: redistribute from a
    /// sibling above its minimum, otherwise coalesce and recurse on the
    /// parent. The root collapses when it empties (leaf) or keeps a single
    /// child (internal).
    fn rebalance_after_remove(&self, ctx: &mut WriteContext<K>) -> Result<(), BTreeError> {
        let mut level = ctx.path.len() - 1;
        loop {
            let node = &ctx.path[level].node;

            if node.is_root() {
                if node.is_leaf() && node.size() == 0 {
                    let old_root = node.page_id;
                    ctx.deleted.push(old_root);
                    self.set_root(ctx, INVALID_PAGE_ID)?;
                    debug!("index '{}' is now empty", self.index_name);
                } else if !node.is_leaf() && node.size() == 1 {
                    let old_root = node.page_id;
                    let promoted = node.child_at(0);
                    ctx.deleted.push(old_root);
                    self.reparent(ctx, promoted, INVALID_PAGE_ID)?;
                    self.set_root(ctx, promoted)?;
                    debug!("index '{}' collapsed root into page {}", self.index_name, promoted);
                }
                return Ok(());
            }

            if node.size() >= node.min_size() {
                return Ok(());
            }
            debug_assert!(level > 0, "underflowing non-root node with released parent");

            let node_page_id = node.page_id;
            let parent_node = &ctx.path[level - 1].node;
            let index = parent_node
                .position_of_child(node_page_id)
                .expect("page missing from its parent");
            let from_left = index > 0;
            let sibling_index = if from_left { index - 1 } else { index + 1 };
            let sibling_id = parent_node.child_at(sibling_index);

            let sibling_page = self.buffer_pool.fetch_page(sibling_id)?;
            let mut sibling_guard = sibling_page.write_arc();
            let mut sibling = codec::decode::<K>(&sibling_guard.data)?;

            if sibling.size() > sibling.min_size() {
                self.redistribute(ctx, level, &mut sibling, index, from_left)?;
                codec::encode(&sibling, &mut sibling_guard.data)?;
                drop(sibling_guard);
                self.buffer_pool.unpin_page(sibling_id, true)?;
                return Ok(());
            }

            if from_left {
                // This node drains into its left sibling and dies
                let separator = ctx.path[level - 1].node.separator_at(index - 1);
                let moved = {
                    let entry = &mut ctx.path[level];
                    if entry.node.is_leaf() {
                        sibling.leaf_merge_from_right(&mut entry.node);
                        Vec::new()
                    } else {
                        sibling.internal_merge_from_right(&mut entry.node, separator)
                    }
                };
                ctx.deleted.push(node_page_id);
                for child in moved {
                    self.reparent(ctx, child, sibling_id)?;
                }
                codec::encode(&sibling, &mut sibling_guard.data)?;
                drop(sibling_guard);
                self.buffer_pool.unpin_page(sibling_id, true)?;

                let parent = &mut ctx.path[level - 1];
                parent.node.remove_child_at(index);
                parent.dirty = true;
            } else {
                // The right sibling drains into this node and dies
                let separator = ctx.path[level - 1].node.separator_at(0);
                let moved = {
                    let entry = &mut ctx.path[level];
                    entry.dirty = true;
                    if entry.node.is_leaf() {
                        entry.node.leaf_merge_from_right(&mut sibling);
                        Vec::new()
                    } else {
                        entry.node.internal_merge_from_right(&mut sibling, separator)
                    }
                };
                for child in moved {
                    self.reparent(ctx, child, node_page_id)?;
                }
                drop(sibling_guard);
                self.buffer_pool.unpin_page(sibling_id, false)?;
                self.buffer_pool.delete_page(sibling_id)?;

                let parent = &mut ctx.path[level - 1];
                parent.node.remove_child_at(sibling_index);
                parent.dirty = true;
            }
            level -= 1;
        }
    }

    /// Move one entry from `sibling` into the underflowed node at `level`,
    /// rotating the parent separator
    fn redistribute(
        &self,
        ctx: &mut WriteContext<K>,
        level: usize,
        sibling: &mut BTreeNode<K>,
        index: usize,
        from_left: bool,
    ) -> Result<(), BTreeError> {
        let separator_index = if from_left { index - 1 } else { index };
        let old_separator = ctx.path[level - 1].node.separator_at(separator_index);
        let node_page_id = ctx.path[level].node.page_id;

        let (new_separator, moved_child) = {
            let entry = &mut ctx.path[level];
            if entry.node.is_leaf() {
                let sep = if from_left {
                    entry.node.leaf_borrow_from_left(sibling)
                } else {
                    entry.node.leaf_borrow_from_right(sibling)
                };
                (sep, None)
            } else {
                let (sep, child) = if from_left {
                    entry.node.internal_borrow_from_left(sibling, old_separator)
                } else {
                    entry.node.internal_borrow_from_right(sibling, old_separator)
                };
                (sep, Some(child))
            }
        };
        ctx.path[level].dirty = true;

        let parent = &mut ctx.path[level - 1];
        parent.node.set_separator_at(separator_index, new_separator);
        parent.dirty = true;

        if let Some(child) = moved_child {
            self.reparent(ctx, child, node_page_id)?;
        }
        Ok(())
    }

    /// Point a child's parent pointer at `parent_id`. A child still on the
    /// latched path is patched in its decoded image (its page bytes get
    /// rewritten at release); any other child gets a header-only byte patch.
    fn reparent(
        &self,
        ctx: &mut WriteContext<K>,
        child_id: PageId,
        parent_id: PageId,
    ) -> Result<(), BTreeError> {
        if let Some(entry) = ctx.path.iter_mut().find(|e| e.node.page_id == child_id) {
            entry.node.parent_page_id = parent_id;
            if !ctx.deleted.contains(&child_id) {
                entry.dirty = true;
            }
            return Ok(());
        }
        let page = self.buffer_pool.fetch_page(child_id)?;
        {
            let mut guard = page.write();
            codec::write_parent_page_id(&mut guard.data, parent_id);
        }
        self.buffer_pool.unpin_page(child_id, true)?;
        Ok(())
    }

    /// Swing the root pointer and persist it in the header page. Callers
    /// hold the root-id latch exclusively.
    fn set_root(&self, ctx: &mut WriteContext<K>, root_id: PageId) -> Result<(), BTreeError> {
        **ctx.root_guard.as_mut().expect("root latch released early") = root_id;
        self.update_header(root_id)
    }

    fn update_header(&self, root_page_id: PageId) -> Result<(), BTreeError> {
        let page = self.buffer_pool.fetch_page(HEADER_PAGE_ID)?;
        {
            let mut guard = page.write();
            let mut header = HeaderPage::from_bytes(&guard.data);
            if !header.update_record(&self.index_name, root_page_id) {
                header.insert_record(&self.index_name, root_page_id);
            }
            header.write_to(&mut guard.data);
        }
        self.buffer_pool.unpin_page(HEADER_PAGE_ID, true)?;
        Ok(())
    }

    /// Release everything latched so far: the root-id latch and the whole
    /// path. Only legal during descent, before anything was modified.
    fn release_ancestors(&self, ctx: &mut WriteContext<K>) -> Result<(), BTreeError> {
        ctx.root_guard = None;
        for entry in ctx.path.drain(..) {
            debug_assert!(!entry.dirty, "releasing a modified ancestor");
            let page_id = entry.node.page_id;
            drop(entry.guard);
            self.buffer_pool.unpin_page(page_id, false)?;
        }
        Ok(())
    }

    /// Unwind the operation: write every modified image back into its page,
    /// release latches root end first, unpin, and drop the pages the
    /// operation deleted
    fn finish(&self, mut ctx: WriteContext<K>) -> Result<(), BTreeError> {
        ctx.root_guard = None;
        for mut entry in ctx.path.drain(..) {
            let page_id = entry.node.page_id;
            let deleted = ctx.deleted.contains(&page_id);
            let dirty = entry.dirty && !deleted;
            if dirty {
                codec::encode(&entry.node, &mut entry.guard.data)?;
            }
            drop(entry.guard);
            self.buffer_pool.unpin_page(page_id, dirty)?;
            if deleted {
                self.buffer_pool.delete_page(page_id)?;
            }
        }
        Ok(())
    }
}
