use std::fmt;

use super::chunk::ChunkId;
use super::handle::Handle;

/// Smallest cell size a subpage will be carved into.
pub(crate) const MIN_ELEM_SIZE: usize = 16;

/// Index of a subpage node in the arena-owned slab.
///
/// The first `num_classes` slots of the slab are the size-class sentinel
/// heads; real subpage nodes follow. Ids are stable for the life of the
/// arena, which is what lets chunks and list links refer to nodes without
/// owning them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct SubpageId(pub(crate) u32);

/// One leaf page subdivided into `max_num_elems` equal cells, tracked by a
/// bitmap. Nodes double as size-class list sentinels when `chunk` is `None`.
///
/// The bitmap is sized once for the worst case (`page_size / MIN_ELEM_SIZE`
/// cells) so that re-initializing the node at a different element size never
/// reallocates; only the first `bitmap_length` words are meaningful.
pub(crate) struct Subpage {
    /// Owning chunk, `None` for sentinel heads.
    pub(crate) chunk: Option<ChunkId>,
    pub(crate) memory_map_idx: u32,
    pub(crate) run_offset: usize,
    pub(crate) page_size: usize,
    bitmap: Box<[u64]>,

    pub(crate) prev: Option<SubpageId>,
    pub(crate) next: Option<SubpageId>,

    pub(crate) do_not_destroy: bool,
    pub(crate) elem_size: usize,
    pub(crate) max_num_elems: usize,
    bitmap_length: usize,
    next_avail: Option<u32>,
    pub(crate) num_avail: usize,
}

impl Subpage {
    fn new_head(id: SubpageId, page_size: usize) -> Self {
        Subpage {
            chunk: None,
            memory_map_idx: 0,
            run_offset: 0,
            page_size,
            bitmap: Vec::new().into_boxed_slice(),
            prev: Some(id),
            next: Some(id),
            do_not_destroy: true,
            elem_size: 0,
            max_num_elems: 0,
            bitmap_length: 0,
            next_avail: None,
            num_avail: 0,
        }
    }

    fn new_node(chunk: ChunkId, memory_map_idx: u32, run_offset: usize, page_size: usize) -> Self {
        Subpage {
            chunk: Some(chunk),
            memory_map_idx,
            run_offset,
            page_size,
            // Worst case: MIN_ELEM_SIZE cells, 64 per word.
            bitmap: vec![0u64; page_size / MIN_ELEM_SIZE / 64].into_boxed_slice(),
            prev: None,
            next: None,
            do_not_destroy: false,
            elem_size: 0,
            max_num_elems: 0,
            bitmap_length: 0,
            next_avail: None,
            num_avail: 0,
        }
    }

    /// Pop the cached hint, or scan the bitmap for the lowest clear bit.
    fn take_next_avail(&mut self) -> Option<u32> {
        if let Some(idx) = self.next_avail.take() {
            return Some(idx);
        }
        self.find_next_avail()
    }

    fn find_next_avail(&self) -> Option<u32> {
        for (i, &bits) in self.bitmap[..self.bitmap_length].iter().enumerate() {
            if bits != u64::MAX {
                if let Some(idx) = self.find_next_avail_in_word(i, bits) {
                    return Some(idx);
                }
            }
        }
        None
    }

    fn find_next_avail_in_word(&self, word: usize, bits: u64) -> Option<u32> {
        let base = (word as u32) << 6;
        let bit = bits.trailing_ones();
        let idx = base + bit;
        // Bits past max_num_elems in the last word are dead space.
        if (idx as usize) < self.max_num_elems {
            Some(idx)
        } else {
            None
        }
    }

    /// Number of currently allocated cells, from the bitmap itself.
    #[cfg(test)]
    pub(crate) fn bitmap_popcount(&self) -> usize {
        self.bitmap[..self.bitmap_length]
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum()
    }
}

impl fmt::Display for Subpage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.do_not_destroy || self.chunk.is_none() {
            return write!(f, "({}: not in use)", self.memory_map_idx);
        }
        write!(
            f,
            "({}: {}/{}, offset: {}, length: {}, elemSize: {})",
            self.memory_map_idx,
            self.max_num_elems - self.num_avail,
            self.max_num_elems,
            self.run_offset,
            self.page_size,
            self.elem_size,
        )
    }
}

/// Metric view of one subpage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubpageMetrics {
    pub max_num_elems: usize,
    pub num_avail: usize,
    pub elem_size: usize,
    pub page_size: usize,
}

/// Arena-owned storage for every subpage node plus the per-size-class
/// circular lists threaded through them.
///
/// Size classes are the powers of two in `[MIN_ELEM_SIZE, page_size / 2]`;
/// class `c` holds subpages of element size `MIN_ELEM_SIZE << c`. Each class
/// owns a sentinel head that self-loops when the class is empty, so insert
/// and remove never branch on list emptiness.
pub(crate) struct SubpagePools {
    nodes: Vec<Subpage>,
    /// Slab ids of nodes whose chunk was released, available for reuse.
    free_nodes: Vec<SubpageId>,
    num_classes: usize,
    page_size: usize,
}

impl SubpagePools {
    pub(crate) fn new(page_size: usize) -> Self {
        debug_assert!(page_size.is_power_of_two() && page_size > MIN_ELEM_SIZE);
        let num_classes = (page_size.trailing_zeros() - MIN_ELEM_SIZE.trailing_zeros()) as usize;
        let nodes = (0..num_classes)
            .map(|c| Subpage::new_head(SubpageId(c as u32), page_size))
            .collect();
        SubpagePools {
            nodes,
            free_nodes: Vec::new(),
            num_classes,
            page_size,
        }
    }

    #[inline]
    pub(crate) fn class_of(elem_size: usize) -> usize {
        debug_assert!(elem_size.is_power_of_two() && elem_size >= MIN_ELEM_SIZE);
        (elem_size.trailing_zeros() - MIN_ELEM_SIZE.trailing_zeros()) as usize
    }

    #[inline]
    fn head_of(&self, elem_size: usize) -> SubpageId {
        let class = Self::class_of(elem_size);
        debug_assert!(class < self.num_classes);
        SubpageId(class as u32)
    }

    #[inline]
    pub(crate) fn node(&self, id: SubpageId) -> &Subpage {
        &self.nodes[id.0 as usize]
    }

    #[inline]
    pub(crate) fn node_mut(&mut self, id: SubpageId) -> &mut Subpage {
        &mut self.nodes[id.0 as usize]
    }

    /// Obtain a slab node for the leaf at `memory_map_idx`, reusing a node
    /// recycled from a released chunk when one is available. The node is
    /// returned unlinked and uninitialized; callers follow up with `init`.
    pub(crate) fn acquire_node(
        &mut self,
        chunk: ChunkId,
        memory_map_idx: u32,
        run_offset: usize,
    ) -> SubpageId {
        if let Some(id) = self.free_nodes.pop() {
            let sp = self.node_mut(id);
            sp.chunk = Some(chunk);
            sp.memory_map_idx = memory_map_idx;
            sp.run_offset = run_offset;
            id
        } else {
            let id = SubpageId(self.nodes.len() as u32);
            self.nodes
                .push(Subpage::new_node(chunk, memory_map_idx, run_offset, self.page_size));
            id
        }
    }

    /// Return the slab nodes of a released chunk for reuse. The bitmap
    /// storage is kept so reuse never reallocates.
    pub(crate) fn recycle_nodes(&mut self, ids: impl IntoIterator<Item = SubpageId>) {
        for id in ids {
            let sp = self.node_mut(id);
            debug_assert!(sp.prev.is_none() && sp.next.is_none());
            sp.chunk = None;
            sp.do_not_destroy = false;
            sp.num_avail = 0;
            self.free_nodes.push(id);
        }
    }

    /// First initialization or reuse of a node for a new element size.
    /// Links the node at the front of its size class.
    pub(crate) fn init(&mut self, id: SubpageId, elem_size: usize) {
        let head = self.head_of(elem_size);
        let sp = self.node_mut(id);
        sp.do_not_destroy = true;
        sp.elem_size = elem_size;
        sp.max_num_elems = sp.page_size / elem_size;
        sp.num_avail = sp.max_num_elems;
        sp.next_avail = Some(0);
        sp.bitmap_length = sp.max_num_elems.div_ceil(64);
        let len = sp.bitmap_length;
        sp.bitmap[..len].fill(0);
        self.add_to_pool(head, id);
    }

    /// Reserve one cell. Returns the bitmap index, or `None` when the node
    /// is exhausted or no longer pooled. An exhausted node is unlinked so
    /// the arena fast path never lands on it.
    pub(crate) fn allocate_cell(&mut self, id: SubpageId) -> Option<u32> {
        let sp = self.node_mut(id);
        if sp.num_avail == 0 || !sp.do_not_destroy {
            return None;
        }

        let bitmap_idx = sp.take_next_avail()?;
        let q = (bitmap_idx >> 6) as usize;
        let r = bitmap_idx & 63;
        debug_assert_eq!(sp.bitmap[q] >> r & 1, 0, "cell {bitmap_idx} already allocated");
        sp.bitmap[q] |= 1u64 << r;
        sp.num_avail -= 1;

        if sp.num_avail == 0 {
            self.remove_from_pool(id);
        }
        Some(bitmap_idx)
    }

    /// Release one cell.
    ///
    /// Returns `true` while the subpage must stay alive (it still has
    /// allocated cells, or it is the last warm subpage of its class and is
    /// retained to amortize the next allocation). Returns `false` when the
    /// node was unlinked and its leaf page should go back to the buddy tree.
    pub(crate) fn free_cell(&mut self, id: SubpageId, bitmap_idx: u32) -> bool {
        let head = self.head_of(self.node(id).elem_size);
        let sp = self.node_mut(id);

        let q = (bitmap_idx >> 6) as usize;
        let r = bitmap_idx & 63;
        debug_assert_ne!(sp.bitmap[q] >> r & 1, 0, "double free of cell {bitmap_idx}");
        sp.bitmap[q] ^= 1u64 << r;
        sp.next_avail = Some(bitmap_idx);

        if sp.num_avail == 0 {
            // Was exhausted and unlinked; the freed cell makes it pooled again.
            sp.num_avail = 1;
            self.add_to_pool(head, id);
            return true;
        }

        sp.num_avail += 1;
        if sp.num_avail != sp.max_num_elems {
            return true;
        }

        // Fully free. Keep the last subpage of the class warm.
        if sp.prev == sp.next {
            return true;
        }
        sp.do_not_destroy = false;
        self.remove_from_pool(id);
        false
    }

    /// Mark a node dead and unlink it if pooled. Rollback path for a leaf
    /// reservation whose cell allocation failed.
    pub(crate) fn surrender(&mut self, id: SubpageId) {
        if self.node(id).prev.is_some() {
            self.remove_from_pool(id);
        }
        self.node_mut(id).do_not_destroy = false;
    }

    /// Fast path: serve a cell from any warm subpage of the class, without
    /// touching a buddy tree. Returns the node id and the encoded handle.
    pub(crate) fn pool_allocate(&mut self, elem_size: usize) -> Option<(SubpageId, Handle)> {
        let head = self.head_of(elem_size);
        let candidate = self.node(head).next.expect("sentinel is always linked");
        if candidate == head {
            return None;
        }
        debug_assert!(self.node(candidate).do_not_destroy);
        debug_assert_eq!(self.node(candidate).elem_size, elem_size);
        let memory_map_idx = self.node(candidate).memory_map_idx;
        let bitmap_idx = self
            .allocate_cell(candidate)
            .expect("pooled subpage had no free cell");
        Some((candidate, Handle::from_subpage(memory_map_idx, bitmap_idx)))
    }

    fn add_to_pool(&mut self, head: SubpageId, id: SubpageId) {
        debug_assert_ne!(head, id);
        debug_assert!(self.node(id).prev.is_none() && self.node(id).next.is_none());
        let old_next = self.node(head).next.expect("sentinel is always linked");
        {
            let sp = self.node_mut(id);
            sp.prev = Some(head);
            sp.next = Some(old_next);
        }
        self.node_mut(old_next).prev = Some(id);
        self.node_mut(head).next = Some(id);
    }

    fn remove_from_pool(&mut self, id: SubpageId) {
        let sp = self.node(id);
        let (prev, next) = (
            sp.prev.expect("unlinking an unlinked subpage"),
            sp.next.expect("unlinking an unlinked subpage"),
        );
        self.node_mut(prev).next = Some(next);
        self.node_mut(next).prev = Some(prev);
        let sp = self.node_mut(id);
        sp.prev = None;
        sp.next = None;
    }

    /// Ids of every node currently linked into the class serving
    /// `elem_size`, front of the list first.
    pub(crate) fn pooled_nodes(&self, elem_size: usize) -> Vec<SubpageId> {
        let head = self.head_of(elem_size);
        let mut out = Vec::new();
        let mut cur = self.node(head).next.expect("sentinel is always linked");
        while cur != head {
            out.push(cur);
            cur = self.node(cur).next.expect("pooled node is linked");
        }
        out
    }

    pub(crate) fn metrics(&self, id: SubpageId) -> SubpageMetrics {
        let sp = self.node(id);
        SubpageMetrics {
            max_num_elems: sp.max_num_elems,
            num_avail: sp.num_avail,
            elem_size: sp.elem_size,
            page_size: sp.page_size,
        }
    }
}
