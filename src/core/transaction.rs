// Transactions move value with the UTXO model: a standard transaction
// consumes outputs of earlier transactions and creates new ones, a coinbase
// transaction mints the block reward out of nothing.
//
// Authorization is reduced to public-key-hash matching. An output is locked
// to a pub_key_hash and an input unlocks it by carrying a public key that
// hashes to it plus an ECDSA signature over a per-input transaction digest.

use crate::error::{BlockchainError, Result};
use crate::storage::UTXOSet;
use crate::utils::{
    deserialize, ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify, serialize,
    sha256_digest,
};
use crate::wallet::{address_to_pub_key_hash, convert_address, hash_pub_key, Wallet};
use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Reward paid by every coinbase transaction.
pub const SUBSIDY: u64 = 100;

/// Add two amounts, failing instead of wrapping when the total does not
/// fit in a `u64`.
pub fn add_values(total: u64, value: u64) -> Result<u64> {
    total.checked_add(value).ok_or_else(|| {
        BlockchainError::Transaction(format!("Value overflow adding {value} to {total}"))
    })
}

/// A reference to an output of an earlier transaction, plus the proof
/// that the spender owns it.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct TXInput {
    txid: Vec<u8>,
    vout: usize,
    signature: Vec<u8>,
    pub_key: Vec<u8>,
}

impl TXInput {
    pub fn new(txid: &[u8], vout: usize) -> TXInput {
        TXInput {
            txid: txid.to_vec(),
            vout,
            signature: vec![],
            pub_key: vec![],
        }
    }

    pub fn get_txid(&self) -> &[u8] {
        self.txid.as_slice()
    }

    pub fn get_vout(&self) -> usize {
        self.vout
    }

    pub fn get_signature(&self) -> &[u8] {
        self.signature.as_slice()
    }

    pub fn get_pub_key(&self) -> &[u8] {
        self.pub_key.as_slice()
    }

    /// Whether the key carried by this input hashes to `pub_key_hash`.
    pub fn uses_key(&self, pub_key_hash: &[u8]) -> bool {
        hash_pub_key(self.pub_key.as_slice()).eq(pub_key_hash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TXOutput {
    value: u64,
    pub_key_hash: Vec<u8>,
}

impl TXOutput {
    /// Create an output of `value` locked to `address`.
    pub fn new(value: u64, address: &str) -> Result<TXOutput> {
        let mut output = TXOutput {
            value,
            pub_key_hash: vec![],
        };
        output.lock(address)?;
        Ok(output)
    }

    pub fn get_value(&self) -> u64 {
        self.value
    }

    pub fn get_pub_key_hash(&self) -> &[u8] {
        self.pub_key_hash.as_slice()
    }

    fn lock(&mut self, address: &str) -> Result<()> {
        self.pub_key_hash = address_to_pub_key_hash(address)?;
        Ok(())
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash.eq(pub_key_hash)
    }
}

/// The two shapes a transaction can take.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum TxKind {
    /// Mints `output.value` new coins; consumes nothing.
    Coinbase { memo: Vec<u8>, output: TXOutput },
    Standard {
        vin: Vec<TXInput>,
        vout: Vec<TXOutput>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Transaction {
    id: Vec<u8>,
    kind: TxKind,
}

impl Transaction {
    /// Coinbase paying [`SUBSIDY`] to `to`. An empty memo is replaced with
    /// random bytes so two rewards to the same address get distinct ids.
    pub fn new_coinbase_tx(to: &str, memo: &str) -> Result<Transaction> {
        let output = TXOutput::new(SUBSIDY, to)?;
        let memo = if memo.is_empty() {
            Uuid::new_v4().as_bytes().to_vec()
        } else {
            memo.as_bytes().to_vec()
        };

        let mut tx = Transaction {
            id: vec![],
            kind: TxKind::Coinbase { memo, output },
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }

    /// Build and sign a payment of `amount` from `wallet` to `to`, spending
    /// outputs found in the UTXO set. Leftover value goes back to the
    /// wallet as a change output.
    pub fn new_utxo_transaction(
        wallet: &Wallet,
        to: &str,
        amount: u64,
        utxo_set: &UTXOSet,
    ) -> Result<Transaction> {
        if amount == 0 {
            return Err(BlockchainError::Transaction(
                "Amount must be positive".to_string(),
            ));
        }
        // Fail on a bad recipient before touching the index.
        let payment = TXOutput::new(amount, to)?;

        let pub_key_hash = wallet.get_pub_key_hash();
        let (accumulated, valid_outputs) =
            utxo_set.find_spendable_outputs(pub_key_hash.as_slice(), amount)?;

        if accumulated < amount {
            return Err(BlockchainError::InsufficientFunds {
                required: amount,
                available: accumulated,
            });
        }

        let mut txids: Vec<&String> = valid_outputs.keys().collect();
        txids.sort();

        let mut inputs = vec![];
        for txid_hex in txids {
            let txid = HEXLOWER.decode(txid_hex.as_bytes()).map_err(|e| {
                BlockchainError::Serialization(format!("Invalid transaction ID: {e}"))
            })?;
            for out in &valid_outputs[txid_hex] {
                inputs.push(TXInput {
                    txid: txid.clone(),
                    vout: *out,
                    signature: vec![],
                    pub_key: wallet.get_public_key().to_vec(),
                });
            }
        }

        let mut outputs = vec![payment];
        if accumulated > amount {
            let change_address = convert_address(pub_key_hash.as_slice());
            outputs.push(TXOutput::new(accumulated - amount, &change_address)?);
        }

        let mut tx = Transaction {
            id: vec![],
            kind: TxKind::Standard {
                vin: inputs,
                vout: outputs,
            },
        };
        tx.id = tx.hash()?;

        utxo_set
            .get_blockchain()
            .sign_transaction(&mut tx, wallet.get_pkcs8())?;
        Ok(tx)
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self.kind, TxKind::Coinbase { .. })
    }

    /// SHA-256 of the transaction encoded with an empty id. This is the only
    /// way an id is ever assigned.
    pub fn hash(&self) -> Result<Vec<u8>> {
        let tx_copy = Transaction {
            id: vec![],
            kind: self.kind.clone(),
        };
        Ok(sha256_digest(tx_copy.serialize()?.as_slice()))
    }

    /// Copy with every signature and public key cleared.
    fn trimmed_copy(&self) -> Transaction {
        let kind = match &self.kind {
            TxKind::Coinbase { .. } => self.kind.clone(),
            TxKind::Standard { vin, vout } => TxKind::Standard {
                vin: vin
                    .iter()
                    .map(|input| TXInput::new(input.get_txid(), input.get_vout()))
                    .collect(),
                vout: vout.clone(),
            },
        };
        Transaction {
            id: self.id.clone(),
            kind,
        }
    }

    /// Digest signed for input `idx`: the trimmed copy with that input's
    /// public key slot holding the referenced output's pub_key_hash.
    fn input_digest(&self, idx: usize, referenced: &TXOutput) -> Result<Vec<u8>> {
        let mut tx_copy = self.trimmed_copy();
        if let TxKind::Standard { vin, .. } = &mut tx_copy.kind {
            vin[idx].pub_key = referenced.pub_key_hash.clone();
        }
        tx_copy.hash()
    }

    /// Sign every input independently. `prev_txs` maps hex txid to the
    /// transactions the inputs reference; a missing one is caller misuse.
    pub fn sign(&mut self, pkcs8: &[u8], prev_txs: &HashMap<String, Transaction>) -> Result<()> {
        let inputs = match &self.kind {
            TxKind::Coinbase { .. } => return Ok(()),
            TxKind::Standard { vin, .. } => vin.clone(),
        };

        let mut signatures = Vec::with_capacity(inputs.len());
        for (idx, vin) in inputs.iter().enumerate() {
            let txid_hex = HEXLOWER.encode(vin.get_txid());
            let prev_tx = prev_txs.get(&txid_hex).ok_or_else(|| {
                BlockchainError::InvalidInput(format!(
                    "Previous transaction {txid_hex} is not available for signing"
                ))
            })?;
            let referenced = prev_tx.get_vout().get(vin.vout).ok_or_else(|| {
                BlockchainError::InvalidInput(format!(
                    "Output {} does not exist in transaction {txid_hex}",
                    vin.vout
                ))
            })?;

            let digest = self.input_digest(idx, referenced)?;
            signatures.push(ecdsa_p256_sha256_sign_digest(pkcs8, digest.as_slice())?);
        }

        if let TxKind::Standard { vin, .. } = &mut self.kind {
            for (input, signature) in vin.iter_mut().zip(signatures) {
                input.signature = signature;
            }
        }
        Ok(())
    }

    /// Check every input's signature against the output it spends.
    ///
    /// Returns `Ok(false)` for a forged or malformed input and
    /// `Err(NotFound)` when a referenced transaction is missing from
    /// `prev_txs`.
    pub fn verify(&self, prev_txs: &HashMap<String, Transaction>) -> Result<bool> {
        let inputs = match &self.kind {
            TxKind::Coinbase { .. } => return Ok(true),
            TxKind::Standard { vin, .. } => vin,
        };
        if inputs.is_empty() {
            return Ok(false);
        }

        for (idx, vin) in inputs.iter().enumerate() {
            let txid_hex = HEXLOWER.encode(vin.get_txid());
            let prev_tx = prev_txs.get(&txid_hex).ok_or_else(|| {
                BlockchainError::NotFound(format!("Previous transaction {txid_hex}"))
            })?;
            let referenced = match prev_tx.get_vout().get(vin.vout) {
                Some(out) => out,
                None => {
                    log::warn!("Input {idx} references missing output {txid_hex}:{}", vin.vout);
                    return Ok(false);
                }
            };

            if !vin.uses_key(referenced.get_pub_key_hash()) {
                return Ok(false);
            }

            let digest = self.input_digest(idx, referenced)?;
            if !ecdsa_p256_sha256_sign_verify(
                vin.pub_key.as_slice(),
                vin.signature.as_slice(),
                digest.as_slice(),
            ) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Sum of the values this transaction creates.
    pub fn output_value(&self) -> Result<u64> {
        self.get_vout()
            .iter()
            .try_fold(0, |total, out| add_values(total, out.get_value()))
    }

    /// Sum of the values of the outputs this transaction spends, looked up
    /// in `prev_txs`. Zero for a coinbase.
    pub fn input_value(&self, prev_txs: &HashMap<String, Transaction>) -> Result<u64> {
        let mut total = 0;
        for vin in self.get_vin() {
            let txid_hex = HEXLOWER.encode(vin.get_txid());
            let referenced = prev_txs
                .get(&txid_hex)
                .and_then(|tx| tx.get_vout().get(vin.vout))
                .ok_or_else(|| {
                    BlockchainError::NotFound(format!("Output {txid_hex}:{}", vin.vout))
                })?;
            total = add_values(total, referenced.get_value())?;
        }
        Ok(total)
    }

    pub fn get_id(&self) -> &[u8] {
        self.id.as_slice()
    }

    pub fn get_kind(&self) -> &TxKind {
        &self.kind
    }

    /// Inputs of a standard transaction; empty for a coinbase.
    pub fn get_vin(&self) -> &[TXInput] {
        match &self.kind {
            TxKind::Coinbase { .. } => &[],
            TxKind::Standard { vin, .. } => vin.as_slice(),
        }
    }

    pub fn get_vout(&self) -> &[TXOutput] {
        match &self.kind {
            TxKind::Coinbase { output, .. } => std::slice::from_ref(output),
            TxKind::Standard { vout, .. } => vout.as_slice(),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Transaction> {
        deserialize(bytes)
    }

    #[cfg(test)]
    pub(crate) fn coinbase_paying_for_test(to: &str, value: u64) -> Transaction {
        let mut tx = Transaction {
            id: vec![],
            kind: TxKind::Coinbase {
                memo: Uuid::new_v4().as_bytes().to_vec(),
                output: TXOutput::new(value, to).unwrap(),
            },
        };
        tx.id = tx.hash().unwrap();
        tx
    }

    #[cfg(test)]
    pub(crate) fn unsigned_for_test(
        pub_key: &[u8],
        mut vin: Vec<TXInput>,
        vout: Vec<TXOutput>,
    ) -> Transaction {
        for input in &mut vin {
            input.pub_key = pub_key.to_vec();
        }
        let mut tx = Transaction {
            id: vec![],
            kind: TxKind::Standard { vin, vout },
        };
        tx.id = tx.hash().unwrap();
        tx
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Transaction {}:", HEXLOWER.encode(&self.id))?;
        if let TxKind::Coinbase { memo, .. } = &self.kind {
            writeln!(f, "     Coinbase memo: {}", HEXLOWER.encode(memo))?;
        }
        for (i, input) in self.get_vin().iter().enumerate() {
            writeln!(f, "     Input {i}:")?;
            writeln!(f, "       TXID:      {}", HEXLOWER.encode(&input.txid))?;
            writeln!(f, "       Out:       {}", input.vout)?;
            writeln!(f, "       Signature: {}", HEXLOWER.encode(&input.signature))?;
            writeln!(f, "       PubKey:    {}", HEXLOWER.encode(&input.pub_key))?;
        }
        for (i, output) in self.get_vout().iter().enumerate() {
            writeln!(f, "     Output {i}:")?;
            writeln!(f, "       Value:  {}", output.value)?;
            write!(f, "       Script: {}", HEXLOWER.encode(&output.pub_key_hash))?;
            if i + 1 < self.get_vout().len() {
                writeln!(f)?;
            }
        }
        Ok(())
    }
}
