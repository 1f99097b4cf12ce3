use crate::core::Block;
use crate::error::{BlockchainError, Result};
use crate::utils::sha256_digest;
use data_encoding::HEXLOWER;
use log::{debug, info};
use num_bigint::BigUint;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, Ordering};

/// Number of leading zero bits a block hash must have. Fixed for the
/// lifetime of the chain; there is no retargeting.
pub const DIFFICULTY: u32 = 12;

const MAX_NONCE: i64 = i64::MAX;

/// 2^(256 - DIFFICULTY)
static TARGET: Lazy<BigUint> = Lazy::new(|| BigUint::from(1u8) << (256 - DIFFICULTY));

pub struct ProofOfWork<'a> {
    block: &'a Block,
    tx_hash: Vec<u8>,
}

impl<'a> ProofOfWork<'a> {
    pub fn new_proof_of_work(block: &'a Block) -> ProofOfWork<'a> {
        ProofOfWork {
            tx_hash: block.hash_transactions(),
            block,
        }
    }

    pub fn target() -> &'static BigUint {
        &TARGET
    }

    /// Check the stored nonce reproduces the stored hash and that the hash
    /// meets the target. Uses the same acceptance test as [`run`](Self::run).
    pub fn validate(block: &Block) -> bool {
        let pow = ProofOfWork::new_proof_of_work(block);
        let hash = sha256_digest(pow.prepare_data(block.get_nonce()).as_slice());
        hash.as_slice() == block.get_hash() && meets_target(hash.as_slice())
    }

    /// prev_hash ‖ hash_transactions ‖ nonce ‖ difficulty, integers as
    /// 8-byte big-endian.
    fn prepare_data(&self, nonce: i64) -> Vec<u8> {
        let pre_block_hash = self.block.get_pre_block_hash();
        let mut data_bytes = Vec::with_capacity(pre_block_hash.len() + self.tx_hash.len() + 16);
        data_bytes.extend(pre_block_hash);
        data_bytes.extend(self.tx_hash.as_slice());
        data_bytes.extend(nonce.to_be_bytes());
        data_bytes.extend((DIFFICULTY as i64).to_be_bytes());
        data_bytes
    }

    /// Search nonces from zero upward until one meets the target.
    pub fn run(&self) -> Result<(i64, Vec<u8>)> {
        self.run_with_signal(&AtomicBool::new(false))
    }

    /// Like [`run`](Self::run), but gives up with a `Mining` error as soon
    /// as `stop` is raised. The flag is checked between attempts.
    pub fn run_with_signal(&self, stop: &AtomicBool) -> Result<(i64, Vec<u8>)> {
        let mut nonce = 0;
        debug!("Mining block on top of {}", HEXLOWER.encode(self.block.get_pre_block_hash()));
        while nonce < MAX_NONCE {
            if stop.load(Ordering::Relaxed) {
                return Err(BlockchainError::Mining(format!(
                    "Mining stopped after {nonce} attempts"
                )));
            }
            let hash = sha256_digest(self.prepare_data(nonce).as_slice());
            if meets_target(hash.as_slice()) {
                info!("Found nonce {nonce}: {}", HEXLOWER.encode(hash.as_slice()));
                return Ok((nonce, hash));
            }
            nonce += 1;
        }
        Err(BlockchainError::Mining(
            "Nonce space exhausted without meeting the target".to_string(),
        ))
    }
}

fn meets_target(hash: &[u8]) -> bool {
    BigUint::from_bytes_be(hash) < *TARGET
}
