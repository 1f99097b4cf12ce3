// The chain itself: blocks stored under their hash in one sled keyspace,
// plus a single mutable pointer ("lh") to the tip. Everything else about the
// chain is derived by walking prev_hash links backward from the tip.

use crate::core::{Block, ProofOfWork, TXOutput, Transaction, SUBSIDY};
use crate::error::{BlockchainError, Result};
use data_encoding::HEXLOWER;
use log::{info, warn};
use sled::transaction::{abort, ConflictableTransactionResult};
use sled::Db;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};

const TIP_BLOCK_HASH_KEY: &[u8] = b"lh";
const GENESIS_COINBASE_DATA: &str = "First Transaction from Genesis";

#[derive(Clone)]
pub struct Blockchain {
    db: Db,
    db_path: PathBuf,
    // Serializes writers so the best-height comparison and the tip update
    // happen against the same chain state. UTXO index rebuilds hold it too,
    // so an index is always derived from a tip that is still current.
    write_lock: Arc<Mutex<()>>,
}

impl Blockchain {
    /// Create a new chain at `db_path` whose genesis coinbase pays
    /// `genesis_address`. Fails if a chain already exists there.
    pub fn create_blockchain_with_path<P: AsRef<Path>>(
        genesis_address: &str,
        db_path: P,
    ) -> Result<Blockchain> {
        let blockchain = Self::open_or_empty_with_path(db_path)?;
        if !blockchain.get_tip_hash()?.is_empty() {
            return Err(BlockchainError::InvalidInput(format!(
                "Blockchain already exists at {}",
                blockchain.db_path.display()
            )));
        }

        info!("Creating genesis block for address: {genesis_address}");
        let coinbase_tx = Transaction::new_coinbase_tx(genesis_address, GENESIS_COINBASE_DATA)?;
        let genesis = Block::generate_genesis_block(&coinbase_tx)?;
        blockchain.commit_block(&genesis, true)?;
        info!("Genesis block {} created", genesis.get_hash_hex());

        Ok(blockchain)
    }

    /// Open an existing chain. `NotFound` if the store holds no blocks.
    pub fn open_with_path<P: AsRef<Path>>(db_path: P) -> Result<Blockchain> {
        let blockchain = Self::open_or_empty_with_path(db_path)?;
        if blockchain.get_tip_hash()?.is_empty() {
            return Err(BlockchainError::NotFound(format!(
                "No existing blockchain found at {}. Create one first.",
                blockchain.db_path.display()
            )));
        }
        Ok(blockchain)
    }

    /// Open the store, which may hold no blocks yet. Nodes that download
    /// their chain from peers start from here.
    pub fn open_or_empty_with_path<P: AsRef<Path>>(db_path: P) -> Result<Blockchain> {
        let path = db_path.as_ref().to_path_buf();
        let db = sled::open(&path)
            .map_err(|e| BlockchainError::Database(format!("Failed to open database: {e}")))?;
        Ok(Blockchain {
            db,
            db_path: path,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn get_db(&self) -> &Db {
        &self.db
    }

    pub fn get_db_path(&self) -> &PathBuf {
        &self.db_path
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Hash of the tip block; empty when the store holds no chain.
    pub fn get_tip_hash(&self) -> Result<Vec<u8>> {
        Ok(self
            .db
            .get(TIP_BLOCK_HASH_KEY)?
            .map(|v| v.to_vec())
            .unwrap_or_default())
    }

    // Persist a block and, if asked, move the tip to it, as one unit.
    fn commit_block(&self, block: &Block, make_tip: bool) -> Result<()> {
        let block_data = block.serialize()?;
        self.db
            .transaction(|tx_db| -> ConflictableTransactionResult<(), BlockchainError> {
                tx_db.insert(block.get_hash(), block_data.as_slice())?;
                if make_tip {
                    tx_db.insert(TIP_BLOCK_HASH_KEY, block.get_hash())?;
                }
                Ok(())
            })?;
        Ok(())
    }

    pub(crate) fn lock_writes(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| BlockchainError::Database("Chain write lock poisoned".to_string()))
    }

    /// Append a new block holding `transactions` on top of the current tip.
    pub fn mine_block(&self, transactions: &[Transaction]) -> Result<Block> {
        self.mine_block_with_signal(transactions, &AtomicBool::new(false))
    }

    /// Verify the transactions, mine a block on top of the tip and persist
    /// block plus tip pointer atomically. Mining stops early when `stop`
    /// is raised.
    pub fn mine_block_with_signal(
        &self,
        transactions: &[Transaction],
        stop: &AtomicBool,
    ) -> Result<Block> {
        for transaction in transactions {
            if !self.verify_transaction(transaction)? {
                return Err(BlockchainError::Transaction(format!(
                    "Invalid transaction {}",
                    HEXLOWER.encode(transaction.get_id())
                )));
            }
        }
        Self::check_for_double_spending(transactions)?;
        Self::check_block_reward(transactions)?;

        let tip_hash = self.get_tip_hash()?;
        if tip_hash.is_empty() {
            return Err(BlockchainError::InvalidInput(
                "Cannot mine on an empty store; create or sync a chain first".to_string(),
            ));
        }

        let block = Block::new_block_with_signal(transactions, tip_hash.clone(), stop)?;
        let block_data = block.serialize()?;

        let _guard = self.lock_writes()?;
        self.db.transaction(|tx_db| {
            let current = tx_db.get(TIP_BLOCK_HASH_KEY)?;
            if current.as_deref() != Some(tip_hash.as_slice()) {
                return abort(BlockchainError::InvalidBlock(
                    "Chain tip moved while mining".to_string(),
                ));
            }
            tx_db.insert(block.get_hash(), block_data.as_slice())?;
            tx_db.insert(TIP_BLOCK_HASH_KEY, block.get_hash())?;
            Ok(())
        })?;

        info!(
            "Successfully mined block {} with {} transactions",
            block.get_hash_hex(),
            transactions.len()
        );
        Ok(block)
    }

    /// Store a block received from a peer.
    ///
    /// The block must carry a valid proof of work and its parent must
    /// already be stored (a genesis block has no parent). It becomes the tip
    /// only if that makes the chain longer. Returns `false` if the block was
    /// already known.
    pub fn add_block(&self, block: &Block) -> Result<bool> {
        if !ProofOfWork::validate(block) {
            return Err(BlockchainError::InvalidBlock(format!(
                "Proof of work does not hold for {}",
                block.get_hash_hex()
            )));
        }

        let _guard = self.lock_writes()?;
        if self.has_block(block.get_hash())? {
            return Ok(false);
        }

        let height = if block.is_genesis() {
            0
        } else {
            self.get_block_height(block.get_pre_block_hash())? + 1
        };

        Self::check_for_double_spending(block.get_transactions())?;
        Self::check_block_reward(block.get_transactions())?;
        if !block.is_genesis() {
            for transaction in block.get_transactions() {
                let prev_txs =
                    self.find_prev_transactions(transaction, block.get_pre_block_hash())?;
                if !Self::verify_against(transaction, &prev_txs)? {
                    return Err(BlockchainError::InvalidBlock(format!(
                        "Block {} carries invalid transaction {}",
                        block.get_hash_hex(),
                        HEXLOWER.encode(transaction.get_id())
                    )));
                }
            }
        }

        let best_height = self.get_best_height()?;
        let make_tip = height > best_height;
        self.commit_block(block, make_tip)?;

        if make_tip {
            info!("Block {} is the new tip at height {height}", block.get_hash_hex());
        } else {
            info!(
                "Stored block {} at height {height} (best height stays {best_height})",
                block.get_hash_hex()
            );
        }
        Ok(true)
    }

    /// Walk from the current tip back to genesis. Each call starts a fresh
    /// walk.
    pub fn iterator(&self) -> Result<BlockchainIterator> {
        Ok(BlockchainIterator::new(self.get_tip_hash()?, self.db.clone()))
    }

    fn iterator_from(&self, block_hash: &[u8]) -> BlockchainIterator {
        BlockchainIterator::new(block_hash.to_vec(), self.db.clone())
    }

    pub fn has_block(&self, block_hash: &[u8]) -> Result<bool> {
        Ok(self.db.contains_key(block_hash)?)
    }

    pub fn get_block(&self, block_hash: &[u8]) -> Result<Block> {
        let block_bytes = self.db.get(block_hash)?.ok_or_else(|| {
            BlockchainError::NotFound(format!("Block {}", HEXLOWER.encode(block_hash)))
        })?;
        Block::deserialize(block_bytes.as_ref())
    }

    /// Hashes of every block on the main chain, tip first.
    pub fn get_block_hashes(&self) -> Result<Vec<Vec<u8>>> {
        let mut blocks = vec![];
        for block in self.iterator()? {
            blocks.push(block?.get_hash().to_vec());
        }
        Ok(blocks)
    }

    /// Number of blocks between `block_hash` and genesis.
    pub fn get_block_height(&self, block_hash: &[u8]) -> Result<i64> {
        let mut count = 0i64;
        for block in self.iterator_from(block_hash) {
            block?;
            count += 1;
        }
        Ok(count - 1)
    }

    /// Height of the tip; -1 when the store holds no chain.
    pub fn get_best_height(&self) -> Result<i64> {
        let tip_hash = self.get_tip_hash()?;
        if tip_hash.is_empty() {
            return Ok(-1);
        }
        self.get_block_height(&tip_hash)
    }

    pub fn find_transaction(&self, txid: &[u8]) -> Result<Option<Transaction>> {
        for block in self.iterator()? {
            for transaction in block?.get_transactions() {
                if txid.eq(transaction.get_id()) {
                    return Ok(Some(transaction.clone()));
                }
            }
        }
        Ok(None)
    }

    /// Collect the transactions `transaction` spends from, searching the
    /// chain backward from `from`. Ids that cannot be found are simply
    /// absent from the map.
    fn find_prev_transactions(
        &self,
        transaction: &Transaction,
        from: &[u8],
    ) -> Result<HashMap<String, Transaction>> {
        let mut wanted: HashSet<String> = transaction
            .get_vin()
            .iter()
            .map(|vin| HEXLOWER.encode(vin.get_txid()))
            .collect();
        let mut prev_txs = HashMap::new();
        if wanted.is_empty() || from.is_empty() {
            return Ok(prev_txs);
        }

        for block in self.iterator_from(from) {
            for tx in block?.get_transactions() {
                let txid_hex = HEXLOWER.encode(tx.get_id());
                if wanted.remove(&txid_hex) {
                    prev_txs.insert(txid_hex, tx.clone());
                }
            }
            if wanted.is_empty() {
                break;
            }
        }
        Ok(prev_txs)
    }

    pub fn sign_transaction(&self, transaction: &mut Transaction, pkcs8: &[u8]) -> Result<()> {
        let prev_txs = self.find_prev_transactions(transaction, &self.get_tip_hash()?)?;
        transaction.sign(pkcs8, &prev_txs)
    }

    /// Verify `transaction` against the outputs it spends on the main chain.
    pub fn verify_transaction(&self, transaction: &Transaction) -> Result<bool> {
        if transaction.is_coinbase() {
            return Ok(true);
        }
        let prev_txs = self.find_prev_transactions(transaction, &self.get_tip_hash()?)?;
        Self::verify_against(transaction, &prev_txs)
    }

    // Signatures hold and the transaction creates no more than it spends.
    fn verify_against(
        transaction: &Transaction,
        prev_txs: &HashMap<String, Transaction>,
    ) -> Result<bool> {
        if transaction.is_coinbase() {
            return Ok(true);
        }
        if !transaction.verify(prev_txs)? {
            return Ok(false);
        }
        let spent = transaction.input_value(prev_txs)?;
        let created = transaction.output_value()?;
        if created > spent {
            warn!(
                "Transaction {} creates {created} from {spent}",
                HEXLOWER.encode(transaction.get_id())
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Every output on the main chain that no input spends, keyed by hex
    /// txid and paired with its index in the owning transaction.
    pub fn find_utxo(&self) -> Result<HashMap<String, Vec<(usize, TXOutput)>>> {
        let mut utxo: HashMap<String, Vec<(usize, TXOutput)>> = HashMap::new();
        let mut spent_txos: HashMap<String, HashSet<usize>> = HashMap::new();

        for block in self.iterator()? {
            let block = block?;
            // Spenders come after what they spend, within a block as well as
            // across blocks, so walk transactions back to front.
            for tx in block.get_transactions().iter().rev() {
                let txid_hex = HEXLOWER.encode(tx.get_id());
                let spent = spent_txos.get(txid_hex.as_str());
                for (idx, out) in tx.get_vout().iter().enumerate() {
                    if spent.is_some_and(|outs| outs.contains(&idx)) {
                        continue;
                    }
                    utxo.entry(txid_hex.clone())
                        .or_default()
                        .push((idx, out.clone()));
                }

                for txin in tx.get_vin() {
                    spent_txos
                        .entry(HEXLOWER.encode(txin.get_txid()))
                        .or_default()
                        .insert(txin.get_vout());
                }
            }
        }
        Ok(utxo)
    }

    // A block mints at most one reward, and exactly SUBSIDY of it.
    fn check_block_reward(transactions: &[Transaction]) -> Result<()> {
        let mut coinbases = transactions.iter().filter(|tx| tx.is_coinbase());
        if let Some(coinbase) = coinbases.next() {
            let reward = coinbase.output_value()?;
            if reward != SUBSIDY {
                return Err(BlockchainError::InvalidBlock(format!(
                    "Coinbase {} pays {reward}, the reward is {SUBSIDY}",
                    HEXLOWER.encode(coinbase.get_id())
                )));
            }
        }
        if coinbases.next().is_some() {
            return Err(BlockchainError::InvalidBlock(
                "Block carries more than one coinbase".to_string(),
            ));
        }
        Ok(())
    }

    // The same output must not be spent twice inside one block.
    fn check_for_double_spending(transactions: &[Transaction]) -> Result<()> {
        let mut spent_outputs: HashSet<(Vec<u8>, usize)> = HashSet::new();

        for (tx_index, transaction) in transactions.iter().enumerate() {
            for input in transaction.get_vin() {
                let output_reference = (input.get_txid().to_vec(), input.get_vout());
                if !spent_outputs.insert(output_reference) {
                    warn!("Double spend inside block at transaction {tx_index}");
                    return Err(BlockchainError::Transaction(format!(
                        "Double-spending detected in transaction {}: output {}:{} already spent in this block",
                        tx_index,
                        HEXLOWER.encode(input.get_txid()),
                        input.get_vout()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Lazy backward walk over blocks. A missing link ends the walk with a
/// `NotFound` error.
pub struct BlockchainIterator {
    db: Db,
    current_hash: Vec<u8>,
}

impl BlockchainIterator {
    fn new(tip_hash: Vec<u8>, db: Db) -> BlockchainIterator {
        BlockchainIterator {
            current_hash: tip_hash,
            db,
        }
    }
}

impl Iterator for BlockchainIterator {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_hash.is_empty() {
            return None;
        }
        let hash = std::mem::take(&mut self.current_hash);
        let block = match self.db.get(&hash) {
            Ok(Some(data)) => Block::deserialize(data.as_ref()),
            Ok(None) => Err(BlockchainError::NotFound(format!(
                "Block {}",
                HEXLOWER.encode(&hash)
            ))),
            Err(e) => Err(e.into()),
        };
        if let Ok(block) = &block {
            self.current_hash = block.get_pre_block_hash().to_vec();
        }
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::Wallet;
    use tempfile::tempdir;

    #[test]
    fn test_create_then_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chain");
        let address = Wallet::new().unwrap().get_address();

        let tip = {
            let chain = Blockchain::create_blockchain_with_path(&address, &path).unwrap();
            assert_eq!(chain.get_best_height().unwrap(), 0);
            chain.get_tip_hash().unwrap()
        };

        {
            let reopened = Blockchain::open_with_path(&path).unwrap();
            assert_eq!(reopened.get_tip_hash().unwrap(), tip);
        }
        assert!(matches!(
            Blockchain::create_blockchain_with_path(&address, &path),
            Err(BlockchainError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_open_missing_chain_is_not_found() {
        let dir = tempdir().unwrap();
        let err = Blockchain::open_with_path(dir.path().join("none")).err().unwrap();
        assert!(err.is_not_found());

        let empty = Blockchain::open_or_empty_with_path(dir.path().join("empty")).unwrap();
        assert_eq!(empty.get_best_height().unwrap(), -1);
        assert_eq!(empty.iterator().unwrap().count(), 0);
    }

    #[test]
    fn test_iteration_ends_at_genesis() {
        let dir = tempdir().unwrap();
        let address = Wallet::new().unwrap().get_address();
        let chain = Blockchain::create_blockchain_with_path(&address, dir.path()).unwrap();
        for _ in 0..3 {
            let coinbase = Transaction::new_coinbase_tx(&address, "").unwrap();
            chain.mine_block(&[coinbase]).unwrap();
        }

        let blocks: Vec<Block> = chain.iterator().unwrap().map(|b| b.unwrap()).collect();
        assert_eq!(blocks.len(), 4);
        assert!(blocks.last().unwrap().is_genesis());
        assert!(blocks[..3].iter().all(|b| !b.is_genesis()));
        for pair in blocks.windows(2) {
            assert_eq!(pair[0].get_pre_block_hash(), pair[1].get_hash());
        }
        assert_eq!(chain.get_best_height().unwrap(), 3);

        // A second walk starts over from the tip.
        assert_eq!(chain.iterator().unwrap().count(), 4);
        assert_eq!(chain.get_block_hashes().unwrap()[0], chain.get_tip_hash().unwrap());
    }

    #[test]
    fn test_get_block_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let address = Wallet::new().unwrap().get_address();
        let chain = Blockchain::create_blockchain_with_path(&address, dir.path()).unwrap();
        assert!(chain.get_block(&[9; 32]).unwrap_err().is_not_found());
    }

    #[test]
    fn test_add_block_requires_parent_and_pow() {
        let dir = tempdir().unwrap();
        let address = Wallet::new().unwrap().get_address();
        let chain = Blockchain::create_blockchain_with_path(&address, dir.path()).unwrap();

        let coinbase = Transaction::new_coinbase_tx(&address, "").unwrap();
        let orphan = Block::new_block(&[coinbase.clone()], vec![1; 32]).unwrap();
        assert!(chain.add_block(&orphan).unwrap_err().is_not_found());

        let child = Block::new_block(&[coinbase], chain.get_tip_hash().unwrap()).unwrap();
        let forged = child.with_nonce_for_test(child.get_nonce() + 1);
        assert!(matches!(
            chain.add_block(&forged),
            Err(BlockchainError::InvalidBlock(_))
        ));

        assert!(chain.add_block(&child).unwrap());
        assert!(!chain.add_block(&child).unwrap());
        assert_eq!(chain.get_tip_hash().unwrap(), child.get_hash());
    }

    #[test]
    fn test_shorter_branch_does_not_move_tip() {
        let dir = tempdir().unwrap();
        let address = Wallet::new().unwrap().get_address();
        let chain = Blockchain::create_blockchain_with_path(&address, dir.path()).unwrap();
        let genesis_hash = chain.get_tip_hash().unwrap();

        chain
            .mine_block(&[Transaction::new_coinbase_tx(&address, "").unwrap()])
            .unwrap();
        let tip = chain.get_tip_hash().unwrap();

        // Same height as the tip: equal height never wins.
        let rival = Block::new_block(
            &[Transaction::new_coinbase_tx(&address, "").unwrap()],
            genesis_hash,
        )
        .unwrap();
        assert!(chain.add_block(&rival).unwrap());
        assert_eq!(chain.get_tip_hash().unwrap(), tip);
        assert!(chain.has_block(rival.get_hash()).unwrap());
    }

    #[test]
    fn test_mining_rejects_double_spend_in_block() {
        let dir = tempdir().unwrap();
        let alice = Wallet::new().unwrap();
        let chain =
            Blockchain::create_blockchain_with_path(&alice.get_address(), dir.path()).unwrap();
        let utxo_set = crate::storage::UTXOSet::new(chain.clone());
        utxo_set.reindex().unwrap();

        let bob = Wallet::new().unwrap().get_address();
        let first = Transaction::new_utxo_transaction(&alice, &bob, 10, &utxo_set).unwrap();
        let second = Transaction::new_utxo_transaction(&alice, &bob, 20, &utxo_set).unwrap();

        let err = chain.mine_block(&[first, second]).unwrap_err();
        assert!(matches!(err, BlockchainError::Transaction(_)));
        assert_eq!(chain.get_best_height().unwrap(), 0);
    }

    #[test]
    fn test_block_reward_must_be_the_subsidy() {
        let dir = tempdir().unwrap();
        let address = Wallet::new().unwrap().get_address();
        let chain = Blockchain::create_blockchain_with_path(&address, dir.path()).unwrap();
        let tip = chain.get_tip_hash().unwrap();

        let inflated = Block::new_block(
            &[Transaction::coinbase_paying_for_test(&address, u64::MAX)],
            tip.clone(),
        )
        .unwrap();
        assert!(matches!(
            chain.add_block(&inflated),
            Err(BlockchainError::InvalidBlock(_))
        ));

        let doubled = Block::new_block(
            &[
                Transaction::new_coinbase_tx(&address, "").unwrap(),
                Transaction::new_coinbase_tx(&address, "").unwrap(),
            ],
            tip.clone(),
        )
        .unwrap();
        assert!(matches!(
            chain.add_block(&doubled),
            Err(BlockchainError::InvalidBlock(_))
        ));

        assert!(chain
            .mine_block(&[Transaction::coinbase_paying_for_test(&address, SUBSIDY + 1)])
            .is_err());
        assert_eq!(chain.get_tip_hash().unwrap(), tip);
        assert!(!chain.has_block(inflated.get_hash()).unwrap());
    }

    #[test]
    fn test_spend_creating_value_is_rejected() {
        let dir = tempdir().unwrap();
        let alice = Wallet::new().unwrap();
        let chain =
            Blockchain::create_blockchain_with_path(&alice.get_address(), dir.path()).unwrap();
        let genesis = chain.get_block(&chain.get_tip_hash().unwrap()).unwrap();
        let funding = genesis.get_transactions()[0].get_id().to_vec();

        let bob = Wallet::new().unwrap().get_address();
        let mut tx = Transaction::unsigned_for_test(
            alice.get_public_key(),
            vec![crate::core::TXInput::new(&funding, 0)],
            vec![TXOutput::new(SUBSIDY * 2, &bob).unwrap()],
        );
        chain.sign_transaction(&mut tx, alice.get_pkcs8()).unwrap();

        // Correctly signed, but pays out twice what it spends.
        let prev_txs = chain
            .find_prev_transactions(&tx, &chain.get_tip_hash().unwrap())
            .unwrap();
        assert!(tx.verify(&prev_txs).unwrap());
        assert!(!chain.verify_transaction(&tx).unwrap());

        let block = Block::new_block(&[tx], chain.get_tip_hash().unwrap()).unwrap();
        assert!(matches!(
            chain.add_block(&block),
            Err(BlockchainError::InvalidBlock(_))
        ));
        assert_eq!(chain.get_best_height().unwrap(), 0);
    }
}
