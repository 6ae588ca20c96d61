//! Parallel query execution
//!
//! In multi-threaded mode `count()` fans tile scanning out to a worker
//! pool fed through the TaskQueue. The producer walks the tile index on
//! the calling thread, applying tile-level filter verdicts; workers decode
//! and test features. The first error wins and stops the producer; workers
//! drain whatever was already queued.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::features::{FeatureIter, Features, TileCandidates};
use crate::taskqueue::TaskQueue;

/// Worker pool size: one per core, bounded to keep contention sane.
fn worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(8)
}

pub(crate) fn parallel_count(features: &Features) -> Result<u64> {
    let queue: TaskQueue<(crate::tile::Tile, crate::store::PageNum, bool)> = TaskQueue::new(64);
    let total = AtomicU64::new(0);
    let failure: Mutex<Option<Error>> = Mutex::new(None);
    let workers = worker_count();
    debug!(workers, "parallel count");

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                queue.process(|(tile, page, skip_filter)| {
                    match count_tile(features, tile, page, skip_filter) {
                        Ok(n) => {
                            total.fetch_add(n, Ordering::Relaxed);
                        }
                        Err(e) => {
                            let mut slot = failure.lock();
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                        }
                    }
                });
            });
        }

        for candidate in TileCandidates::new(features) {
            if failure.lock().is_some() {
                break;
            }
            match candidate {
                Ok(task) => {
                    if !queue.submit(task) {
                        break;
                    }
                }
                Err(e) => {
                    let mut slot = failure.lock();
                    if slot.is_none() {
                        *slot = Some(e);
                    }
                    break;
                }
            }
        }
        queue.shutdown();
    });

    match failure.into_inner() {
        Some(e) => Err(e),
        None => Ok(total.load(Ordering::Relaxed)),
    }
}

fn count_tile(
    features: &Features,
    tile: crate::tile::Tile,
    page: crate::store::PageNum,
    skip_filter: bool,
) -> Result<u64> {
    let mut n = 0u64;
    for feature in FeatureIter::single_tile(features, tile, page, skip_filter)? {
        feature?;
        n += 1;
    }
    Ok(n)
}
