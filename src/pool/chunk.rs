use std::fmt;

#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;

use super::arena::PooledBuf;
use super::handle::Handle;
use super::subpage::{SubpageId, SubpagePools};

/// Stable index of a chunk within its owning arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ChunkId(pub(crate) u32);

/// One contiguous backing region of `page_size << max_order` bytes, carved
/// into runs of pages by a buddy tree and into sub-page cells by per-leaf
/// subpages.
///
/// The tree is a complete binary tree stored 1-indexed in a flat byte array
/// (`memory_map`), heap style: node `id` has children `2*id` and `2*id + 1`.
/// `memory_map[id]` is the shallowest depth at which the subtree rooted at
/// `id` still has a free node:
///
/// - `memory_map[id] == depth_map[id]` — subtree wholly free
/// - `depth_map[id] < memory_map[id] <= max_order` — partially allocated;
///   requests fitting depth `memory_map[id]` or deeper can still succeed
/// - `memory_map[id] == max_order + 1` — fully allocated (`unusable`)
///
/// The backing memory `M` is opaque to the allocator; it is only stored so
/// the owner can reach it through [`Chunk::memory`].
pub(crate) struct Chunk<M> {
    memory: M,
    /// Byte offset of usable space within `memory` (alignment slack).
    base_offset: usize,

    memory_map: Box<[u8]>,
    depth_map: Box<[u8]>,
    /// One lazily created slab node per leaf page, memoized across reuse.
    subpages: Box<[Option<SubpageId>]>,

    subpage_overflow_mask: usize,
    page_size: usize,
    page_shifts: u32,
    max_order: u32,
    chunk_size: usize,
    log2_chunk_size: u32,
    max_subpage_allocs: usize,
    unusable: u8,

    free_bytes: usize,

    /// Reusable buffer descriptors, LIFO. Bounded by the arena config.
    buf_cache: Vec<Box<PooledBuf>>,

    /// Tree nodes currently allocated (as a run or a subpage leaf).
    /// Double frees and frees of never-allocated handles trip on this.
    #[cfg(debug_assertions)]
    live_nodes: FixedBitSet,
}

impl<M> Chunk<M> {
    pub(crate) fn new(memory: M, page_size: usize, max_order: u32, base_offset: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());
        debug_assert!(max_order < 30, "max_order must be < 30, got {max_order}");

        let page_shifts = page_size.trailing_zeros();
        let chunk_size = page_size << max_order;
        let max_subpage_allocs = 1usize << max_order;

        // Node ids run [1, 2^(max_order+1)); slot 0 is unused.
        let mut memory_map = vec![0u8; max_subpage_allocs << 1].into_boxed_slice();
        let mut id = 1;
        for d in 0..=max_order {
            for _ in 0..(1usize << d) {
                memory_map[id] = d as u8;
                id += 1;
            }
        }
        let depth_map = memory_map.clone();

        Chunk {
            memory,
            base_offset,
            memory_map,
            depth_map,
            subpages: vec![None; max_subpage_allocs].into_boxed_slice(),
            subpage_overflow_mask: !(page_size - 1),
            page_size,
            page_shifts,
            max_order,
            chunk_size,
            log2_chunk_size: log2(chunk_size),
            max_subpage_allocs,
            unusable: (max_order + 1) as u8,
            free_bytes: chunk_size,
            buf_cache: Vec::new(),
            #[cfg(debug_assertions)]
            live_nodes: FixedBitSet::with_capacity(max_subpage_allocs << 1),
        }
    }

    #[inline]
    pub(crate) fn memory(&self) -> &M {
        &self.memory
    }

    #[inline]
    pub(crate) fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    #[inline]
    pub(crate) fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    pub(crate) fn usage(&self) -> usize {
        if self.free_bytes == 0 {
            return 100;
        }
        let free_percentage = self.free_bytes * 100 / self.chunk_size;
        if free_percentage == 0 {
            return 99;
        }
        100 - free_percentage
    }

    /// Reserve space for `norm_capacity` bytes (a power of two). Returns
    /// `None` when this chunk cannot satisfy the request; the caller is free
    /// to try another chunk.
    pub(crate) fn allocate(
        &mut self,
        pools: &mut SubpagePools,
        chunk_id: ChunkId,
        norm_capacity: usize,
    ) -> Option<Handle> {
        if norm_capacity & self.subpage_overflow_mask != 0 {
            self.allocate_run(norm_capacity)
        } else {
            self.allocate_subpage(pools, chunk_id, norm_capacity)
        }
    }

    /// Allocate a run of pages (>= 1) at the depth whose node size equals
    /// `norm_capacity`.
    fn allocate_run(&mut self, norm_capacity: usize) -> Option<Handle> {
        let d = self.max_order - (log2(norm_capacity) - self.page_shifts);
        let id = self.allocate_node(d)?;
        self.free_bytes -= self.run_length(id);
        Some(Handle::from_run(id))
    }

    /// Carve one cell of `elem_size` out of a leaf page, reserving a fresh
    /// leaf from the tree and (re)initializing its subpage slot.
    fn allocate_subpage(
        &mut self,
        pools: &mut SubpagePools,
        chunk_id: ChunkId,
        elem_size: usize,
    ) -> Option<Handle> {
        // Subpages are only carved from leaves.
        let id = self.allocate_node(self.max_order)?;
        self.free_bytes -= self.page_size;

        let subpage_idx = self.subpage_idx(id) as usize;
        let node_id = match self.subpages[subpage_idx] {
            Some(node_id) => node_id,
            None => {
                let node_id = pools.acquire_node(chunk_id, id, self.run_offset(id));
                self.subpages[subpage_idx] = Some(node_id);
                node_id
            }
        };
        pools.init(node_id, elem_size);

        match pools.allocate_cell(node_id) {
            Some(bitmap_idx) => Some(Handle::from_subpage(id, bitmap_idx)),
            None => {
                // Unreachable once init'd (a fresh subpage has free cells),
                // but a failure here must not leak the leaf.
                pools.surrender(node_id);
                self.free_bytes += self.page_size;
                self.free_node(id);
                None
            }
        }
    }

    /// Locate and reserve the leftmost free node at depth `d`.
    fn allocate_node(&mut self, d: u32) -> Option<u32> {
        let mut id: u32 = 1;
        // All ones except the low d bits; `id & initial` is nonzero exactly
        // for ids at depth >= d.
        let initial = !((1u32 << d) - 1);
        let mut val = self.value(id);
        if u32::from(val) > d {
            return None;
        }
        while u32::from(val) < d || id & initial == 0 {
            id <<= 1;
            val = self.value(id);
            if u32::from(val) > d {
                // Left subtree can't fit it; the sibling can.
                id ^= 1;
                val = self.value(id);
            }
        }
        debug_assert!(
            u32::from(val) == d && id & initial == 1 << d,
            "val = {val}, id & initial = {}, d = {d}",
            id & initial
        );
        self.set_value(id, self.unusable);
        #[cfg(debug_assertions)]
        self.live_nodes.insert(id as usize);
        self.update_parents_alloc(id);
        Some(id)
    }

    /// After reserving `id`, every ancestor becomes the min of its children.
    fn update_parents_alloc(&mut self, mut id: u32) {
        while id > 1 {
            let parent = id >> 1;
            let val = self.value(id).min(self.value(id ^ 1));
            self.set_value(parent, val);
            id = parent;
        }
    }

    /// After restoring `id`, ancestors collapse back to "wholly free" when
    /// both children sit at the child layer's depth, else take the min.
    fn update_parents_free(&mut self, mut id: u32) {
        let mut log_child = self.depth(id) + 1;
        while id > 1 {
            let parent = id >> 1;
            let val1 = self.value(id);
            let val2 = self.value(id ^ 1);
            log_child -= 1;

            if val1 == log_child && val2 == log_child {
                self.set_value(parent, log_child - 1);
            } else {
                self.set_value(parent, val1.min(val2));
            }
            id = parent;
        }
    }

    /// Release the allocation named by `handle`. A subpage cell free that
    /// leaves its subpage alive keeps the leaf page reserved; everything
    /// else restores the tree node and the free-byte count.
    pub(crate) fn free(&mut self, pools: &mut SubpagePools, handle: Handle) {
        let memory_map_idx = handle.memory_map_idx();

        if handle.is_subpage() {
            let subpage_idx = self.subpage_idx(memory_map_idx) as usize;
            let node_id = self.subpages[subpage_idx].expect("freeing into an absent subpage");
            debug_assert!(pools.node(node_id).do_not_destroy, "freeing into a dead subpage");
            if pools.free_cell(node_id, handle.bitmap_idx()) {
                return;
            }
        }
        self.free_bytes += self.run_length(memory_map_idx);
        self.free_node(memory_map_idx);
    }

    fn free_node(&mut self, id: u32) {
        #[cfg(debug_assertions)]
        {
            assert!(
                self.live_nodes.contains(id as usize),
                "double free or foreign handle: node {id}"
            );
            assert_eq!(self.value(id), self.unusable, "freeing a node that is not allocated");
            self.live_nodes.set(id as usize, false);
        }
        self.set_value(id, self.depth(id));
        self.update_parents_free(id);
    }

    /// Fill `buf` with the placement of `handle`.
    pub(crate) fn init_buf(
        &self,
        pools: &SubpagePools,
        buf: &mut PooledBuf,
        chunk_id: ChunkId,
        handle: Handle,
        req_capacity: usize,
    ) {
        let memory_map_idx = handle.memory_map_idx();
        buf.chunk = chunk_id;
        buf.handle = handle;
        buf.length = req_capacity;
        if handle.is_subpage() {
            let node_id =
                self.subpages[self.subpage_idx(memory_map_idx) as usize].expect("absent subpage");
            let sp = pools.node(node_id);
            debug_assert!(sp.do_not_destroy);
            debug_assert!(req_capacity <= sp.elem_size);
            buf.offset = self.run_offset(memory_map_idx)
                + handle.bitmap_idx() as usize * sp.elem_size
                + self.base_offset;
            buf.max_length = sp.elem_size;
        } else {
            debug_assert_eq!(self.value(memory_map_idx), self.unusable);
            buf.offset = self.run_offset(memory_map_idx) + self.base_offset;
            buf.max_length = self.run_length(memory_map_idx);
        }
    }

    /// Park a spent buffer descriptor for reuse, LIFO, up to `max_cached`.
    pub(crate) fn cache_buf(&mut self, buf: Box<PooledBuf>, max_cached: usize) {
        if self.buf_cache.len() < max_cached {
            self.buf_cache.push(buf);
        }
    }

    pub(crate) fn pop_cached_buf(&mut self) -> Option<Box<PooledBuf>> {
        self.buf_cache.pop()
    }

    /// Slab ids of all memoized subpage slots, for recycling when the chunk
    /// is released.
    pub(crate) fn take_subpage_nodes(&mut self) -> Vec<SubpageId> {
        self.subpages.iter_mut().filter_map(|slot| slot.take()).collect()
    }

    #[cfg(test)]
    pub(crate) fn subpage_node(&self, subpage_idx: usize) -> Option<SubpageId> {
        self.subpages[subpage_idx]
    }

    #[inline]
    fn value(&self, id: u32) -> u8 {
        self.memory_map[id as usize]
    }

    #[inline]
    fn set_value(&mut self, id: u32, val: u8) {
        self.memory_map[id as usize] = val;
    }

    #[inline]
    fn depth(&self, id: u32) -> u8 {
        self.depth_map[id as usize]
    }

    /// Bytes covered by node `id`.
    #[inline]
    fn run_length(&self, id: u32) -> usize {
        1 << (self.log2_chunk_size - u32::from(self.depth(id)))
    }

    /// Byte offset of node `id`'s run from the start of the chunk.
    #[inline]
    fn run_offset(&self, id: u32) -> usize {
        let shift = id ^ (1 << u32::from(self.depth(id)));
        shift as usize * self.run_length(id)
    }

    /// Strip the leaf-level high bit: leaf id -> slot in `[0, 2^max_order)`.
    #[inline]
    fn subpage_idx(&self, memory_map_idx: u32) -> u32 {
        memory_map_idx ^ self.max_subpage_allocs as u32
    }

    pub(crate) fn metrics(&self) -> ChunkMetrics {
        ChunkMetrics {
            usage: self.usage(),
            free_bytes: self.free_bytes,
            chunk_size: self.chunk_size,
        }
    }

    /// Whether the tree is back to its pristine state.
    #[cfg(test)]
    pub(crate) fn is_pristine(&self) -> bool {
        self.memory_map == self.depth_map && self.free_bytes == self.chunk_size
    }
}

impl<M> fmt::Display for Chunk<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Chunk({}%, {}/{})",
            self.usage(),
            self.chunk_size - self.free_bytes,
            self.chunk_size
        )
    }
}

/// Metric view of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMetrics {
    /// Percentage of the chunk in use: 100 only when fully allocated, 99
    /// when nearly so but some bytes remain.
    pub usage: usize,
    pub free_bytes: usize,
    pub chunk_size: usize,
}

/// Position of the highest set bit (0-based).
#[inline]
fn log2(val: usize) -> u32 {
    usize::BITS - 1 - val.leading_zeros()
}
