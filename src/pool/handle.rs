/// Opaque token naming one live allocation within a chunk.
///
/// Bit layout of the inner `u64`:
/// ```text
///   [63]     always 0
///   [62]     subpage marker — 1 iff this names a cell inside a leaf page
///   [61..32] bitmap index   (30 bits) — cell index within the leaf's bitmap
///   [31..0]  memory map index (32 bits) — node id in the chunk's buddy tree
/// ```
///
/// A run handle is just the node id with all upper bits clear. The marker bit
/// is what keeps the two encodings disjoint: a subpage cell with bitmap index
/// zero would otherwise collide with the run encoding of the same leaf.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

const SUBPAGE_MARKER: u64 = 1 << 62;
const BITMAP_IDX_MASK: u64 = 0x3FFF_FFFF;

impl Handle {
    /// Handle for a run of one or more pages rooted at tree node `memory_map_idx`.
    #[inline]
    pub(crate) fn from_run(memory_map_idx: u32) -> Self {
        Handle(u64::from(memory_map_idx))
    }

    /// Handle for cell `bitmap_idx` of the subpage at leaf `memory_map_idx`.
    #[inline]
    pub(crate) fn from_subpage(memory_map_idx: u32, bitmap_idx: u32) -> Self {
        debug_assert!(u64::from(bitmap_idx) <= BITMAP_IDX_MASK);
        Handle(SUBPAGE_MARKER | u64::from(bitmap_idx) << 32 | u64::from(memory_map_idx))
    }

    #[inline]
    pub(crate) fn memory_map_idx(self) -> u32 {
        self.0 as u32
    }

    #[inline]
    pub(crate) fn bitmap_idx(self) -> u32 {
        ((self.0 >> 32) & BITMAP_IDX_MASK) as u32
    }

    #[inline]
    pub(crate) fn is_subpage(self) -> bool {
        self.0 & SUBPAGE_MARKER != 0
    }

    /// Raw token value, for logging and diagnostics.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_subpage() {
            write!(
                f,
                "Handle(subpage: node {}, cell {})",
                self.memory_map_idx(),
                self.bitmap_idx()
            )
        } else {
            write!(f, "Handle(run: node {})", self.memory_map_idx())
        }
    }
}
