use crate::core::{ProofOfWork, Transaction};
use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize, sha256_digest};
use data_encoding::HEXLOWER;
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicBool;

/// A mined block. Fields are private so a block cannot change after its
/// hash has been found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Block {
    pre_block_hash: Vec<u8>,
    hash: Vec<u8>,
    transactions: Vec<Transaction>,
    nonce: i64,
}

impl Block {
    /// Mine a block holding `transactions` on top of `pre_block_hash`.
    /// Never returns a block without a valid nonce.
    pub fn new_block(transactions: &[Transaction], pre_block_hash: Vec<u8>) -> Result<Block> {
        Self::new_block_with_signal(transactions, pre_block_hash, &AtomicBool::new(false))
    }

    /// Same as [`new_block`](Self::new_block) but abandons the search with
    /// a `Mining` error once `stop` is raised.
    pub fn new_block_with_signal(
        transactions: &[Transaction],
        pre_block_hash: Vec<u8>,
        stop: &AtomicBool,
    ) -> Result<Block> {
        if transactions.is_empty() {
            return Err(BlockchainError::InvalidBlock(
                "Block must contain at least one transaction".to_string(),
            ));
        }

        let mut block = Block {
            pre_block_hash,
            hash: vec![],
            transactions: transactions.to_vec(),
            nonce: 0,
        };

        let (nonce, hash) = ProofOfWork::new_proof_of_work(&block).run_with_signal(stop)?;
        block.nonce = nonce;
        block.hash = hash;
        info!(
            "Proof-of-work completed for block {} ({} transactions)",
            block.get_hash_hex(),
            block.transactions.len()
        );

        Ok(block)
    }

    pub fn generate_genesis_block(coinbase: &Transaction) -> Result<Block> {
        Block::new_block(std::slice::from_ref(coinbase), vec![])
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Block> {
        deserialize::<Block>(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn get_transactions(&self) -> &[Transaction] {
        self.transactions.as_slice()
    }

    pub fn get_pre_block_hash(&self) -> &[u8] {
        self.pre_block_hash.as_slice()
    }

    pub fn get_hash(&self) -> &[u8] {
        self.hash.as_slice()
    }

    pub fn get_hash_hex(&self) -> String {
        HEXLOWER.encode(self.hash.as_slice())
    }

    pub fn get_nonce(&self) -> i64 {
        self.nonce
    }

    pub fn is_genesis(&self) -> bool {
        self.pre_block_hash.is_empty()
    }

    /// SHA-256 over the concatenated transaction ids, in block order.
    pub fn hash_transactions(&self) -> Vec<u8> {
        let mut txhashs = vec![];
        for transaction in &self.transactions {
            txhashs.extend(transaction.get_id());
        }
        sha256_digest(txhashs.as_slice())
    }

    #[cfg(test)]
    pub(crate) fn with_nonce_for_test(&self, nonce: i64) -> Block {
        Block {
            nonce,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;

    fn coinbase() -> Transaction {
        Transaction::new_coinbase_tx(&Wallet::new().unwrap().get_address(), "").unwrap()
    }

    #[test]
    fn test_empty_block_is_rejected() {
        let err = Block::new_block(&[], vec![]).unwrap_err();
        assert!(matches!(err, BlockchainError::InvalidBlock(_)));
    }

    #[test]
    fn test_genesis_block_has_empty_prev_hash() {
        let genesis = Block::generate_genesis_block(&coinbase()).unwrap();
        assert!(genesis.is_genesis());
        assert_eq!(genesis.get_hash().len(), 32);
        assert!(ProofOfWork::validate(&genesis));
    }

    #[test]
    fn test_hash_transactions_is_order_sensitive() {
        let a = coinbase();
        let b = coinbase();
        let ab = Block::new_block(&[a.clone(), b.clone()], vec![1]).unwrap();
        let ba = Block::new_block(&[b, a], vec![1]).unwrap();
        assert_ne!(ab.hash_transactions(), ba.hash_transactions());
    }

    #[test]
    fn test_serialized_block_keeps_its_proof() {
        let block = Block::new_block(&[coinbase()], vec![7; 32]).unwrap();
        let decoded = Block::deserialize(&block.serialize().unwrap()).unwrap();
        assert_eq!(decoded, block);
        assert!(ProofOfWork::validate(&decoded));
    }
}
