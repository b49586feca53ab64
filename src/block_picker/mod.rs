mod block_tracker;

use bitvec::{order::Msb0, vec::BitVec};

pub use block_tracker::BlockTracker;

type Bitfield = BitVec<u8, Msb0>;
