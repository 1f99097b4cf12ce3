use crate::core::{add_values, Block, Blockchain, TXOutput};
use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use data_encoding::HEXLOWER;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sled::transaction::abort;
use sled::Batch;
use std::collections::HashMap;

/// Index entries share the block store's keyspace under this prefix.
const UTXO_PREFIX: &[u8] = b"utxo-";

/// Upper bound on deletions per atomic batch during a reindex.
const REINDEX_DELETE_CHUNK: usize = 100_000;

/// An unspent output together with its index in the transaction that
/// created it. The index must survive partial spends, so it is stored
/// rather than implied by list position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct IndexedOutput {
    pub vout: usize,
    pub output: TXOutput,
}

/// ( K -> txid_hex, V => vouts chosen for spending )
pub type SpendableOutputs = HashMap<String, Vec<usize>>;

fn utxo_key(txid: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(UTXO_PREFIX.len() + txid.len());
    key.extend_from_slice(UTXO_PREFIX);
    key.extend_from_slice(txid);
    key
}

/// Derived view of every unspent output on the main chain. It can always be
/// rebuilt from the blocks with [`reindex`](UTXOSet::reindex).
pub struct UTXOSet {
    blockchain: Blockchain,
}

impl UTXOSet {
    pub fn new(blockchain: Blockchain) -> UTXOSet {
        UTXOSet { blockchain }
    }

    pub fn get_blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    // Decoded index entries as (txid, outputs).
    fn entries(&self) -> impl Iterator<Item = Result<(Vec<u8>, Vec<IndexedOutput>)>> {
        self.blockchain
            .get_db()
            .scan_prefix(UTXO_PREFIX)
            .map(|item| {
                let (k, v) = item?;
                let outs: Vec<IndexedOutput> = deserialize(v.as_ref())?;
                Ok((k[UTXO_PREFIX.len()..].to_vec(), outs))
            })
    }

    /// Pick outputs owned by `pub_key_hash` until `amount` is covered.
    /// Returns the accumulated value, which is below `amount` only when the
    /// owner cannot afford it.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: u64,
    ) -> Result<(u64, SpendableOutputs)> {
        let mut unspent_outputs: SpendableOutputs = HashMap::new();
        let mut accumulated = 0;

        'scan: for entry in self.entries() {
            let (txid, outs) = entry?;
            let txid_hex = HEXLOWER.encode(txid.as_slice());
            for indexed in outs {
                if accumulated >= amount {
                    break 'scan;
                }
                if indexed.output.is_locked_with_key(pub_key_hash) {
                    accumulated = add_values(accumulated, indexed.output.get_value())?;
                    unspent_outputs
                        .entry(txid_hex.clone())
                        .or_default()
                        .push(indexed.vout);
                }
            }
        }
        Ok((accumulated, unspent_outputs))
    }

    pub fn find_utxo(&self, pub_key_hash: &[u8]) -> Result<Vec<TXOutput>> {
        let mut utxos = vec![];
        for entry in self.entries() {
            let (_, outs) = entry?;
            utxos.extend(
                outs.into_iter()
                    .map(|indexed| indexed.output)
                    .filter(|out| out.is_locked_with_key(pub_key_hash)),
            );
        }
        Ok(utxos)
    }

    pub fn get_balance(&self, pub_key_hash: &[u8]) -> Result<u64> {
        self.find_utxo(pub_key_hash)?
            .iter()
            .try_fold(0, |total, out| add_values(total, out.get_value()))
    }

    /// Whether output `vout` of `txid` is still in the index.
    pub fn is_unspent(&self, txid: &[u8], vout: usize) -> Result<bool> {
        match self.blockchain.get_db().get(utxo_key(txid))? {
            Some(bytes) => {
                let outs: Vec<IndexedOutput> = deserialize(bytes.as_ref())?;
                Ok(outs.iter().any(|indexed| indexed.vout == vout))
            }
            None => Ok(false),
        }
    }

    /// Number of transactions with at least one unspent output.
    pub fn count_transactions(&self) -> Result<u64> {
        let mut counter = 0;
        for item in self.blockchain.get_db().scan_prefix(UTXO_PREFIX).keys() {
            item?;
            counter += 1;
        }
        Ok(counter)
    }

    /// Throw the index away and rebuild it from a full chain scan.
    ///
    /// Stale entries are deleted in batches of at most
    /// `REINDEX_DELETE_CHUNK` keys. The last of those batches also carries
    /// the rebuilt entries, so an index of ordinary size is swapped in one
    /// atomic step and readers never observe it empty.
    ///
    /// The chain's write lock is held from the scan to the last batch, so
    /// neither a new block nor another rebuild can interleave.
    pub fn reindex(&self) -> Result<()> {
        let _guard = self.blockchain.lock_writes()?;
        let db = self.blockchain.get_db();
        let utxo_map = self.blockchain.find_utxo()?;

        let mut fresh = HashMap::with_capacity(utxo_map.len());
        for (txid_hex, outs) in &utxo_map {
            let txid = HEXLOWER.decode(txid_hex.as_bytes()).map_err(|e| {
                BlockchainError::Serialization(format!("Failed to decode transaction ID: {e}"))
            })?;
            let entry: Vec<IndexedOutput> = outs
                .iter()
                .map(|(vout, output)| IndexedOutput {
                    vout: *vout,
                    output: output.clone(),
                })
                .collect();
            fresh.insert(utxo_key(&txid), serialize(&entry)?);
        }

        let mut stale_keys = vec![];
        for key in db.scan_prefix(UTXO_PREFIX).keys() {
            let key = key?;
            if !fresh.contains_key(key.as_ref()) {
                stale_keys.push(key);
            }
        }

        let mut chunks = stale_keys.chunks(REINDEX_DELETE_CHUNK).peekable();
        let mut batch = Batch::default();
        while let Some(chunk) = chunks.next() {
            for key in chunk {
                batch.remove(key.clone());
            }
            if chunks.peek().is_some() {
                db.apply_batch(std::mem::take(&mut batch))?;
            }
        }
        debug!("Removing {} stale UTXO index entries", stale_keys.len());

        for (key, value) in fresh {
            batch.insert(key, value);
        }
        db.apply_batch(batch)?;

        info!("UTXO index rebuilt: {} transactions", utxo_map.len());
        Ok(())
    }

    /// Apply one newly appended block to the index. All changes land in a
    /// single sled transaction; an input whose output is not indexed aborts
    /// the whole update and leaves the index as it was.
    pub fn update(&self, block: &Block) -> Result<()> {
        let _guard = self.blockchain.lock_writes()?;
        let db = self.blockchain.get_db();
        db.transaction(|tx_db| {
            for tx in block.get_transactions() {
                for vin in tx.get_vin() {
                    let key = utxo_key(vin.get_txid());
                    let outs_bytes = match tx_db.get(&key)? {
                        Some(bytes) => bytes,
                        None => {
                            return abort(BlockchainError::NotFound(format!(
                                "UTXO entry for {}",
                                HEXLOWER.encode(vin.get_txid())
                            )))
                        }
                    };
                    let outs: Vec<IndexedOutput> = match deserialize(outs_bytes.as_ref()) {
                        Ok(outs) => outs,
                        Err(e) => return abort(e),
                    };

                    if !outs.iter().any(|indexed| indexed.vout == vin.get_vout()) {
                        return abort(BlockchainError::NotFound(format!(
                            "Unspent output {}:{}",
                            HEXLOWER.encode(vin.get_txid()),
                            vin.get_vout()
                        )));
                    }
                    let updated_outs: Vec<IndexedOutput> = outs
                        .into_iter()
                        .filter(|indexed| indexed.vout != vin.get_vout())
                        .collect();

                    if updated_outs.is_empty() {
                        tx_db.remove(key)?;
                    } else {
                        let bytes = match serialize(&updated_outs) {
                            Ok(bytes) => bytes,
                            Err(e) => return abort(e),
                        };
                        tx_db.insert(key, bytes)?;
                    }
                }

                let new_outputs: Vec<IndexedOutput> = tx
                    .get_vout()
                    .iter()
                    .enumerate()
                    .map(|(vout, output)| IndexedOutput {
                        vout,
                        output: output.clone(),
                    })
                    .collect();
                let bytes = match serialize(&new_outputs) {
                    Ok(bytes) => bytes,
                    Err(e) => return abort(e),
                };
                tx_db.insert(utxo_key(tx.get_id()), bytes)?;
            }
            Ok(())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Transaction;
    use crate::wallet::Wallet;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn index_snapshot(utxo_set: &UTXOSet) -> BTreeSet<(Vec<u8>, usize, u64)> {
        let mut snapshot = BTreeSet::new();
        for entry in utxo_set.entries() {
            let (txid, outs) = entry.unwrap();
            for indexed in outs {
                snapshot.insert((txid.clone(), indexed.vout, indexed.output.get_value()));
            }
        }
        snapshot
    }

    #[test]
    fn test_genesis_index() {
        let dir = tempdir().unwrap();
        let alice = Wallet::new().unwrap();
        let chain =
            Blockchain::create_blockchain_with_path(&alice.get_address(), dir.path()).unwrap();
        let utxo_set = UTXOSet::new(chain);
        utxo_set.reindex().unwrap();

        assert_eq!(utxo_set.count_transactions().unwrap(), 1);
        assert_eq!(utxo_set.get_balance(&alice.get_pub_key_hash()).unwrap(), 100);
        // Reindexing twice gives the same index.
        let before = index_snapshot(&utxo_set);
        utxo_set.reindex().unwrap();
        assert_eq!(index_snapshot(&utxo_set), before);
    }

    #[test]
    fn test_update_removes_spent_and_adds_new() {
        let dir = tempdir().unwrap();
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();
        let chain =
            Blockchain::create_blockchain_with_path(&alice.get_address(), dir.path()).unwrap();
        let utxo_set = UTXOSet::new(chain.clone());
        utxo_set.reindex().unwrap();
        let genesis_coinbase = chain.iterator().unwrap().next().unwrap().unwrap()
            .get_transactions()[0]
            .clone();

        let tx = Transaction::new_utxo_transaction(&alice, &bob.get_address(), 30, &utxo_set)
            .unwrap();
        let block = chain.mine_block(&[tx.clone()]).unwrap();
        utxo_set.update(&block).unwrap();

        let snapshot = index_snapshot(&utxo_set);
        assert!(!snapshot.iter().any(|(txid, _, _)| txid == genesis_coinbase.get_id()));
        assert!(snapshot.contains(&(tx.get_id().to_vec(), 0, 30)));
        assert!(snapshot.contains(&(tx.get_id().to_vec(), 1, 70)));
        assert_eq!(utxo_set.get_balance(&alice.get_pub_key_hash()).unwrap(), 70);
        assert_eq!(utxo_set.get_balance(&bob.get_pub_key_hash()).unwrap(), 30);
    }

    #[test]
    fn test_reindex_matches_incremental_updates() {
        let dir = tempdir().unwrap();
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();
        let chain =
            Blockchain::create_blockchain_with_path(&alice.get_address(), dir.path()).unwrap();
        let utxo_set = UTXOSet::new(chain.clone());
        utxo_set.reindex().unwrap();

        // Spend only the payment output of the first transfer, so the change
        // output stays indexed under its original position.
        let first = Transaction::new_utxo_transaction(&alice, &bob.get_address(), 40, &utxo_set)
            .unwrap();
        let block = chain.mine_block(&[first]).unwrap();
        utxo_set.update(&block).unwrap();

        let second = Transaction::new_utxo_transaction(&bob, &alice.get_address(), 15, &utxo_set)
            .unwrap();
        let reward = Transaction::new_coinbase_tx(&bob.get_address(), "").unwrap();
        let block = chain.mine_block(&[reward, second]).unwrap();
        utxo_set.update(&block).unwrap();

        let incremental = index_snapshot(&utxo_set);
        utxo_set.reindex().unwrap();
        assert_eq!(index_snapshot(&utxo_set), incremental);

        assert_eq!(utxo_set.get_balance(&alice.get_pub_key_hash()).unwrap(), 75);
        assert_eq!(utxo_set.get_balance(&bob.get_pub_key_hash()).unwrap(), 125);
    }

    #[test]
    fn test_update_with_unknown_input_leaves_index_untouched() {
        let dir = tempdir().unwrap();
        let alice = Wallet::new().unwrap();
        let chain =
            Blockchain::create_blockchain_with_path(&alice.get_address(), dir.path()).unwrap();
        let utxo_set = UTXOSet::new(chain.clone());
        utxo_set.reindex().unwrap();

        let tx = Transaction::new_utxo_transaction(&alice, &alice.get_address(), 10, &utxo_set)
            .unwrap();
        let block = chain.mine_block(&[tx]).unwrap();
        utxo_set.update(&block).unwrap();
        let before = index_snapshot(&utxo_set);

        // Applying the same block again finds its inputs already spent.
        let err = utxo_set.update(&block).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(index_snapshot(&utxo_set), before);
    }

    #[test]
    fn test_spendable_outputs_stop_at_amount() {
        let dir = tempdir().unwrap();
        let alice = Wallet::new().unwrap();
        let chain =
            Blockchain::create_blockchain_with_path(&alice.get_address(), dir.path()).unwrap();
        for _ in 0..3 {
            let reward = Transaction::new_coinbase_tx(&alice.get_address(), "").unwrap();
            chain.mine_block(&[reward]).unwrap();
        }
        let utxo_set = UTXOSet::new(chain);
        utxo_set.reindex().unwrap();

        let pkh = alice.get_pub_key_hash();
        let (accumulated, outputs) = utxo_set.find_spendable_outputs(&pkh, 150).unwrap();
        assert_eq!(accumulated, 200);
        let picked: usize = outputs.values().map(|v| v.len()).sum();
        assert_eq!(picked, 2);

        let (accumulated, _) = utxo_set.find_spendable_outputs(&pkh, 1000).unwrap();
        assert_eq!(accumulated, 400);
        for vouts in outputs.values() {
            let unique: BTreeSet<_> = vouts.iter().collect();
            assert_eq!(unique.len(), vouts.len());
        }
    }

    #[test]
    fn test_overflowing_balance_is_an_error() {
        let dir = tempdir().unwrap();
        let alice = Wallet::new().unwrap();
        let chain =
            Blockchain::create_blockchain_with_path(&alice.get_address(), dir.path()).unwrap();
        let utxo_set = UTXOSet::new(chain.clone());
        utxo_set.reindex().unwrap();

        // An index entry no valid block could produce.
        let huge = IndexedOutput {
            vout: 0,
            output: TXOutput::new(u64::MAX, &alice.get_address()).unwrap(),
        };
        chain
            .get_db()
            .insert(utxo_key(&[0xab; 32]), serialize(&vec![huge]).unwrap())
            .unwrap();

        let pkh = alice.get_pub_key_hash();
        assert!(matches!(
            utxo_set.get_balance(&pkh),
            Err(BlockchainError::Transaction(_))
        ));
        assert!(utxo_set.find_spendable_outputs(&pkh, u64::MAX).is_err());
    }

    #[test]
    fn test_concurrent_reindexes_track_the_tip() {
        let dir = tempdir().unwrap();
        let alice = Wallet::new().unwrap();
        let bob = Wallet::new().unwrap();
        let chain =
            Blockchain::create_blockchain_with_path(&alice.get_address(), dir.path()).unwrap();
        UTXOSet::new(chain.clone()).reindex().unwrap();

        let done = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let rebuilders: Vec<_> = (0..3)
            .map(|_| {
                let utxo_set = UTXOSet::new(chain.clone());
                let done = done.clone();
                std::thread::spawn(move || {
                    while !done.load(std::sync::atomic::Ordering::SeqCst) {
                        utxo_set.reindex().unwrap();
                    }
                })
            })
            .collect();

        let utxo_set = UTXOSet::new(chain.clone());
        for amount in 1..=5 {
            let tx = Transaction::new_utxo_transaction(&alice, &bob.get_address(), amount, &utxo_set)
                .unwrap();
            chain.mine_block(&[tx]).unwrap();
            utxo_set.reindex().unwrap();
        }
        done.store(true, std::sync::atomic::Ordering::SeqCst);
        for rebuilder in rebuilders {
            rebuilder.join().unwrap();
        }

        let mut expected = BTreeSet::new();
        for (txid_hex, outs) in chain.find_utxo().unwrap() {
            let txid = HEXLOWER.decode(txid_hex.as_bytes()).unwrap();
            for (vout, output) in outs {
                expected.insert((txid.clone(), vout, output.get_value()));
            }
        }
        assert_eq!(index_snapshot(&utxo_set), expected);
        assert_eq!(utxo_set.get_balance(&bob.get_pub_key_hash()).unwrap(), 15);
        assert_eq!(utxo_set.get_balance(&alice.get_pub_key_hash()).unwrap(), 85);
    }
}
