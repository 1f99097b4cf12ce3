//! Data storage and persistence
//!
//! The UTXO index lives next to the blocks in the same sled store. The
//! memory pool, block-transit queue and orphan buffer are in-memory node
//! state.

pub mod memory_pool;
pub mod orphan_blocks;
pub mod utxo_set;

pub use memory_pool::{BlockInTransit, MemoryPool};
pub use orphan_blocks::{OrphanBlocks, MAX_ORPHAN_BLOCKS, ORPHAN_BLOCK_TIMEOUT};
pub use utxo_set::{IndexedOutput, SpendableOutputs, UTXOSet};
