//! # Ledger Chain
//!
//! A small proof-of-work ledger: blocks chained by hash, value moved with
//! unspent transaction outputs, and nodes that keep each other in sync over
//! plain TCP.
//!
//! ## How the code is organized
//! - `core/`: blocks, transactions, the persisted chain and mining
//! - `storage/`: the UTXO index, the memory pool and the block-transit queue
//! - `wallet/`: key pairs, addresses and the wallet file
//! - `network/`: wire messages, known peers and the node server
//! - `config/`: node configuration from `node.toml` and the environment
//! - `utils/`: hashing, signatures, base58 and the storage codec
//! - `cli/`: command-line parsing
//!
//! ## Where to start
//! 1. `main.rs` for the CLI commands
//! 2. `core/blockchain.rs` for how blocks are stored and the tip chosen
//! 3. `core/transaction.rs` for signing and verification
//! 4. `storage/utxo_set.rs` for balances and spendable outputs
//! 5. `network/server.rs` for the sync protocol

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod network;
pub mod storage;
pub mod utils;
pub mod wallet;

pub use cli::{Command, Opt};
pub use config::Config;
pub use core::{Block, Blockchain, ProofOfWork, TXInput, TXOutput, Transaction, TxKind};
pub use error::{BlockchainError, Result};
pub use network::{send_tx, Node, Nodes, Server, ServerHandle};
pub use storage::{BlockInTransit, MemoryPool, OrphanBlocks, UTXOSet};
pub use utils::{
    base58_decode, base58_encode, ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify,
    new_key_pair, ripemd160_digest, sha256_digest,
};
pub use wallet::{
    address_to_pub_key_hash, convert_address, hash_pub_key, validate_address, Wallet, Wallets,
    ADDRESS_CHECK_SUM_LEN,
};
