use std::io;

/// Backing storage for one chunk. The allocator core never reads or writes
/// the region; it only needs the length for validation and hands the region
/// back out through `Arena::with_chunk_memory`.
pub trait Region {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Region for Box<[u8]> {
    fn len(&self) -> usize {
        (**self).len()
    }
}

/// Produces chunk-sized backing regions on arena growth.
pub trait MemorySource {
    type Region: Region;

    /// Reserve a fresh region of exactly `chunk_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an `io::Error` when the underlying reservation fails; the
    /// arena surfaces it unchanged.
    fn reserve(&self, chunk_size: usize) -> io::Result<Self::Region>;
}

/// Chunks backed by zero-filled heap allocations.
#[derive(Default, Clone, Copy, Debug)]
pub struct HeapSource;

impl MemorySource for HeapSource {
    type Region = Box<[u8]>;

    fn reserve(&self, chunk_size: usize) -> io::Result<Self::Region> {
        Ok(vec![0u8; chunk_size].into_boxed_slice())
    }
}

/// Chunks backed by anonymous memory mappings. Pages are physically
/// committed on first touch, so mostly-empty chunks stay cheap.
#[cfg(all(unix, not(any(loom, miri))))]
pub use mmap::{MmapRegion, MmapSource};

#[cfg(all(unix, not(any(loom, miri))))]
mod mmap {
    use super::{io, MemorySource, Region};
    use std::ptr::NonNull;

    #[derive(Default, Clone, Copy, Debug)]
    pub struct MmapSource;

    pub struct MmapRegion {
        ptr: NonNull<u8>,
        len: usize,
    }

    // Safety: MmapRegion owns the mapping exclusively.
    unsafe impl Send for MmapRegion {}
    // Safety: the region exposes no interior mutability through &self.
    unsafe impl Sync for MmapRegion {}

    impl MmapRegion {
        #[must_use]
        pub fn as_ptr(&self) -> *const u8 {
            self.ptr.as_ptr()
        }

        #[must_use]
        pub fn as_mut_ptr(&mut self) -> *mut u8 {
            self.ptr.as_ptr()
        }
    }

    impl Region for MmapRegion {
        fn len(&self) -> usize {
            self.len
        }
    }

    impl Drop for MmapRegion {
        fn drop(&mut self) {
            // Safety: ptr/len came from a successful mmap and are unmapped
            // exactly once, here.
            unsafe {
                libc::munmap(self.ptr.as_ptr().cast(), self.len);
            }
        }
    }

    impl MemorySource for MmapSource {
        type Region = MmapRegion;

        fn reserve(&self, chunk_size: usize) -> io::Result<MmapRegion> {
            // Safety: FFI call to mmap; an anonymous private mapping with no
            // file descriptor.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    chunk_size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }

            NonNull::new(ptr.cast::<u8>())
                .map(|ptr| MmapRegion { ptr, len: chunk_size })
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Other, "mmap returned null for chunk region")
                })
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_heap_source_reserves_zeroed_region() {
        let region = HeapSource.reserve(64 * 1024).unwrap();
        assert_eq!(Region::len(&region), 64 * 1024);
        assert!(region.iter().all(|&b| b == 0));
    }

    #[cfg(all(unix, not(miri)))]
    #[test]
    fn test_mmap_source_region_is_writable() {
        let mut region = MmapSource.reserve(128 * 1024).unwrap();
        assert_eq!(region.len(), 128 * 1024);
        // Safety: offsets are within the mapping.
        unsafe {
            region.as_mut_ptr().write(0xAB);
            region.as_mut_ptr().add(128 * 1024 - 1).write(0xCD);
            assert_eq!(region.as_ptr().read(), 0xAB);
            assert_eq!(region.as_ptr().add(128 * 1024 - 1).read(), 0xCD);
        }
    }
}
