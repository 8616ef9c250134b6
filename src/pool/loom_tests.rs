/// Loom-based concurrency tests.
///
/// Run w/ `RUSTFLAGS="--cfg loom" cargo test --lib --release`
///
/// Exercise the arena mutex under every thread interleaving loom can
/// explore.
///
/// # Design notes
///
/// Loom exhaustively enumerates thread interleavings, so:
///   - Thread counts kept to 2 (state space is exponential).
///   - One allocation per thread.
///   - Tiny chunk geometry (two 1 KiB leaves) keeps setup cheap per run.
///   - GlobalPool is NOT tested directly bc its OnceLock static does not
///     reset between loom iterations; everything it exercises (the arena
///     mutex) is reachable through instance-based Arena tests.
#[cfg(loom)]
mod tests {
    use crate::pool::arena::{Arena, ArenaConfig};
    use crate::pool::source::HeapSource;
    use crate::sync::thread;
    use crate::sync::Arc;

    fn tiny_config() -> ArenaConfig {
        // Two 1 KiB leaves; 16 B cells give 64 per subpage.
        ArenaConfig {
            page_size: 1024,
            max_order: 1,
            max_cached_bufs_per_chunk: 4,
        }
    }

    #[test]
    fn loom_alloc_free_pairs_close_accounting() {
        loom::model(|| {
            let arena = Arc::new(Arena::new(HeapSource, tiny_config()).unwrap());
            let joins: Vec<_> = (0..2)
                .map(|_| {
                    let arena = arena.clone();
                    thread::spawn(move || {
                        let buf = arena.allocate(16).unwrap();
                        arena.free(buf);
                    })
                })
                .collect();
            for j in joins {
                j.join().unwrap();
            }

            // Whatever the interleaving, only the warm subpage leaf stays
            // reserved afterwards.
            let metrics = arena.chunk_metrics();
            assert_eq!(metrics.len(), 1);
            assert_eq!(metrics[0].chunk_size - metrics[0].free_bytes, 1024);
        });
    }

    #[test]
    fn loom_concurrent_allocations_hold_disjoint_ranges() {
        loom::model(|| {
            let arena = Arc::new(Arena::new(HeapSource, tiny_config()).unwrap());
            let joins: Vec<_> = (0..2)
                .map(|_| {
                    let arena = arena.clone();
                    thread::spawn(move || arena.allocate(16).unwrap())
                })
                .collect();
            let bufs: Vec<_> = joins.into_iter().map(|j| j.join().unwrap()).collect();

            assert!(
                bufs[0].chunk() != bufs[1].chunk()
                    || bufs[0].offset() + bufs[0].max_length() <= bufs[1].offset()
                    || bufs[1].offset() + bufs[1].max_length() <= bufs[0].offset(),
                "allocations overlap"
            );
            for buf in bufs {
                arena.free(buf);
            }
        });
    }
}
