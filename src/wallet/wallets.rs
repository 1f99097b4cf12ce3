use crate::error::{BlockchainError, Result};
use crate::utils::{deserialize, serialize};
use crate::wallet::Wallet;
use log::info;
use std::collections::HashMap;
use std::env::current_dir;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const WALLET_FILE: &str = "wallet.dat";

/// Address -> wallet, persisted as one bincode file.
pub struct Wallets {
    wallets: HashMap<String, Wallet>,
    path: PathBuf,
}

impl Wallets {
    /// Load `wallet.dat` from the working directory.
    pub fn new() -> Result<Wallets> {
        Self::load_from(current_dir()?.join(WALLET_FILE))
    }

    /// Load a wallet file, starting empty if it does not exist yet.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Wallets> {
        let path = path.as_ref().to_path_buf();
        let wallets = if path.exists() {
            let buf = fs::read(&path)?;
            deserialize(&buf[..]).map_err(|e| {
                BlockchainError::Wallet(format!("Corrupt wallet file {}: {e}", path.display()))
            })?
        } else {
            HashMap::new()
        };
        Ok(Wallets { wallets, path })
    }

    pub fn create_wallet(&mut self) -> Result<String> {
        let wallet = Wallet::new()?;
        let address = wallet.get_address();
        self.wallets.insert(address.clone(), wallet);
        self.save_to_file()?;
        info!("Created wallet {address}");
        Ok(address)
    }

    pub fn get_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.wallets.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn get_wallet(&self, address: &str) -> Option<&Wallet> {
        self.wallets.get(address)
    }

    fn save_to_file(&self) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&self.path)?;
        let mut writer = BufWriter::new(file);
        let wallets_bytes = serialize(&self.wallets)?;
        writer.write_all(wallets_bytes.as_slice())?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_wallets_persist_between_loads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(WALLET_FILE);

        let mut wallets = Wallets::load_from(&path).unwrap();
        let first = wallets.create_wallet().unwrap();
        let second = wallets.create_wallet().unwrap();
        assert_ne!(first, second);

        let reloaded = Wallets::load_from(&path).unwrap();
        assert_eq!(reloaded.get_addresses().len(), 2);
        let wallet = reloaded.get_wallet(&first).unwrap();
        assert_eq!(wallet.get_address(), first);
        assert!(reloaded.get_wallet("unknown").is_none());
    }
}
