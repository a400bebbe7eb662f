//! Fixed-size block allocator (`§3`, `§5`): "the memory pool serves
//! fixed-size blocks and is the only dynamic-memory facility used at runtime
//! ... no allocation occurs on hot paths."
//!
//! Grounded on the original `rt_mempool_*` family: blocks are carved out of
//! one backing allocation up front, and a free-list of indices (not raw
//! pointers — there is nothing to validate a foreign pointer against in safe
//! Rust) tracks availability. `§9`: "a freed pointer must have come from
//! this pool and a panic path otherwise" is realized here as a pool-identity
//! check on every explicit `free`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

struct PoolState {
    free_list: Vec<usize>,
    blocks: Vec<Vec<u8>>,
}

pub struct MemPool {
    id: u64,
    block_size: usize,
    state: Mutex<PoolState>,
}

/// A block checked out of a [`MemPool`]. Must be returned via
/// [`MemPool::free`]; dropping it without freeing leaks the slot (matching
/// the source, which has no destructor discipline either).
pub struct PoolBlock {
    pool_id: u64,
    index: usize,
    pub data: Vec<u8>,
}

impl MemPool {
    /// Creates a pool of `block_count` blocks, each at least `block_size`
    /// bytes, rounded up to a 64-byte cache line as the original does.
    pub fn new(block_size: usize, block_count: usize) -> Self {
        let aligned = (block_size + 63) & !63;
        let blocks = (0..block_count).map(|_| vec![0u8; aligned]).collect();
        MemPool {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            block_size: aligned,
            state: Mutex::new(PoolState {
                free_list: (0..block_count).collect(),
                blocks,
            }),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn available(&self) -> usize {
        self.state.lock().unwrap().free_list.len()
    }

    /// Checks out a block, or `None` if the pool is exhausted.
    pub fn alloc(&self) -> Option<PoolBlock> {
        let mut state = self.state.lock().unwrap();
        let index = state.free_list.pop()?;
        let data = std::mem::take(&mut state.blocks[index]);
        Some(PoolBlock {
            pool_id: self.id,
            index,
            data,
        })
    }

    /// Returns `block` to this pool.
    ///
    /// # Panics
    ///
    /// Panics if `block` did not come from this pool. There is no silent
    /// acceptance of a foreign block (`§9`).
    pub fn free(&self, mut block: PoolBlock) {
        assert_eq!(
            block.pool_id, self.id,
            "attempted to free a block into a pool that did not allocate it"
        );
        let mut state = self.state.lock().unwrap();
        block.data.iter_mut().for_each(|b| *b = 0);
        state.blocks[block.index] = std::mem::take(&mut block.data);
        state.free_list.push(block.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_free_round_trip() {
        let pool = MemPool::new(64, 4);
        assert_eq!(pool.available(), 4);
        let block = pool.alloc().unwrap();
        assert_eq!(pool.available(), 3);
        pool.free(block);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn exhausted_pool_returns_none() {
        let pool = MemPool::new(8, 1);
        let _block = pool.alloc().unwrap();
        assert!(pool.alloc().is_none());
    }

    #[test]
    #[should_panic(expected = "did not allocate it")]
    fn freeing_foreign_block_panics() {
        let a = MemPool::new(8, 1);
        let b = MemPool::new(8, 1);
        let block = a.alloc().unwrap();
        b.free(block);
    }
}
