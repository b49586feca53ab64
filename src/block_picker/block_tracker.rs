use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::Bitfield;
use crate::metainfo::BlockId;

/// Records which blocks of the file this node currently holds.
///
/// Shared between the exchange server (readers) and every download worker (readers and
/// writers). A single reader/writer lock guards the whole structure: mutations happen at most
/// once per block, reads happen on every request. Blocks are only ever added, never removed, and
/// the held count is kept next to the bitfield so completion is a constant time check.
#[derive(Debug)]
pub struct BlockTracker {
    total_blocks: usize,
    state: RwLock<HeldBlocks>,
}

#[derive(Debug)]
struct HeldBlocks {
    bitfield: Bitfield,
    held: usize,
}

impl HeldBlocks {
    fn is_complete(&self, total_blocks: usize) -> bool {
        self.held == total_blocks
    }
}

impl BlockTracker {
    pub fn new(total_blocks: usize) -> Self {
        let mut bitfield = Bitfield::new();
        bitfield.resize(total_blocks, false);

        Self {
            total_blocks,
            state: RwLock::new(HeldBlocks { bitfield, held: 0 }),
        }
    }

    // bitfield and count are updated together with nothing fallible in between, so the state
    // behind a poisoned lock is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, HeldBlocks> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HeldBlocks> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// marks a block as held. marking a held block again, or an id outside the file, is a no-op.
    /// returns whether the block was newly added.
    pub fn mark_available(&self, block_id: BlockId) -> bool {
        let mut state = self.write();

        let newly_held = match state.bitfield.get(block_id).as_deref() {
            Some(held) => !*held,
            None => return false,
        };

        if newly_held {
            state.bitfield.set(block_id, true);
            state.held += 1;
        }
        newly_held
    }

    pub fn mark_all_available(&self) {
        let mut state = self.write();
        state.bitfield.fill(true);
        state.held = self.total_blocks;
    }

    pub fn is_available(&self, block_id: BlockId) -> bool {
        self.read()
            .bitfield
            .get(block_id)
            .is_some_and(|held| *held)
    }

    /// snapshot of the held block ids, in ascending order.
    pub fn available_ids(&self) -> Vec<BlockId> {
        self.read().bitfield.iter_ones().collect()
    }

    pub fn available_count(&self) -> usize {
        self.read().held
    }

    pub fn missing_count(&self) -> usize {
        self.total_blocks - self.available_count()
    }

    /// fraction of blocks held, in `[0, 1]`. an empty file reports 0.
    pub fn progress(&self) -> f64 {
        if self.total_blocks == 0 {
            return 0.0;
        }
        self.available_count() as f64 / self.total_blocks as f64
    }

    /// lowest numbered block that is not held yet.
    ///
    /// there is no reservation: concurrent callers may well be handed the same id and fetch the
    /// block twice. marking is idempotent so the only cost is the extra transfer.
    pub fn next_missing_block(&self) -> Option<BlockId> {
        self.read().bitfield.first_zero()
    }

    pub fn is_complete(&self) -> bool {
        self.read().is_complete(self.total_blocks)
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }
}
