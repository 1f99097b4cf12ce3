//! Core blockchain functionality
//!
//! Blocks, transactions, the persisted chain and the proof-of-work puzzle.

pub mod block;
pub mod blockchain;
pub mod proof_of_work;
pub mod transaction;

pub use block::Block;
pub use blockchain::{Blockchain, BlockchainIterator};
pub use proof_of_work::{ProofOfWork, DIFFICULTY};
pub use transaction::{add_values, TXInput, TXOutput, Transaction, TxKind, SUBSIDY};
