use crate::error::{BlockchainError, Result};
use log::debug;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CENTRAL_NODE: &str = "127.0.0.1:3000";
pub const DEFAULT_TRANSACTION_THRESHOLD: usize = 2;
pub const CONFIG_FILE: &str = "node.toml";

const DEFAULT_NODE_ID: &str = "3000";
const DEFAULT_DATA_DIR: &str = "./data";

const NODE_ADDRESS_KEY: &str = "NODE_ADDRESS";
const NODE_ID_KEY: &str = "NODE_ID";
const CENTRAL_NODE_KEY: &str = "CENTRAL_NODE";
const MINING_ADDRESS_KEY: &str = "MINING_ADDRESS";
const DATA_DIR_KEY: &str = "DATA_DIR";
const TRANSACTION_THRESHOLD_KEY: &str = "TRANSACTION_THRESHOLD";

/// Everything a node needs to know about itself and the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    node_addr: String,
    central_node: String,
    mining_addr: Option<String>,
    data_dir: PathBuf,
    transaction_threshold: usize,
}

// Layout of the optional node.toml. Every key may be left out.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    node_addr: Option<String>,
    node_id: Option<String>,
    central_node: Option<String>,
    mining_addr: Option<String>,
    data_dir: Option<PathBuf>,
    transaction_threshold: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Config::new(
            format!("127.0.0.1:{DEFAULT_NODE_ID}"),
            DEFAULT_CENTRAL_NODE.to_string(),
        )
    }
}

impl Config {
    pub fn new(node_addr: String, central_node: String) -> Config {
        Config {
            node_addr,
            central_node,
            mining_addr: None,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            transaction_threshold: DEFAULT_TRANSACTION_THRESHOLD,
        }
    }

    /// Defaults, then `node.toml` from the working directory if present,
    /// then environment variables.
    pub fn load() -> Result<Config> {
        let file = Path::new(CONFIG_FILE);
        let file = if file.exists() { Some(file) } else { None };
        Self::from_sources(file, |key| env::var(key).ok())
    }

    /// Build a config from an optional TOML file and a variable lookup.
    /// Values found through `lookup` win over the file.
    pub fn from_sources<F>(file: Option<&Path>, lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file_config = match file {
            Some(path) => {
                let text = fs::read_to_string(path)?;
                debug!("Loading node configuration from {}", path.display());
                toml::from_str::<FileConfig>(&text).map_err(|e| {
                    BlockchainError::Config(format!("Invalid {}: {e}", path.display()))
                })?
            }
            None => FileConfig::default(),
        };

        let node_id = lookup(NODE_ID_KEY).or(file_config.node_id);
        let node_addr = lookup(NODE_ADDRESS_KEY)
            .or_else(|| node_id.map(|id| format!("127.0.0.1:{id}")))
            .or(file_config.node_addr)
            .unwrap_or_else(|| format!("127.0.0.1:{DEFAULT_NODE_ID}"));
        let central_node = lookup(CENTRAL_NODE_KEY)
            .or(file_config.central_node)
            .unwrap_or_else(|| DEFAULT_CENTRAL_NODE.to_string());

        let mut config = Config::new(node_addr, central_node);
        config.mining_addr = lookup(MINING_ADDRESS_KEY).or(file_config.mining_addr);
        if let Some(dir) = lookup(DATA_DIR_KEY)
            .map(PathBuf::from)
            .or(file_config.data_dir)
        {
            config.data_dir = dir;
        }
        if let Some(raw) = lookup(TRANSACTION_THRESHOLD_KEY) {
            config.transaction_threshold = raw.parse().map_err(|_| {
                BlockchainError::Config(format!(
                    "{TRANSACTION_THRESHOLD_KEY} must be a number, got {raw}"
                ))
            })?;
        } else if let Some(threshold) = file_config.transaction_threshold {
            config.transaction_threshold = threshold;
        }
        if config.transaction_threshold == 0 {
            return Err(BlockchainError::Config(
                "transaction_threshold must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }

    pub fn with_mining_addr(mut self, addr: Option<String>) -> Config {
        self.mining_addr = addr;
        self
    }

    pub fn with_data_dir<P: Into<PathBuf>>(mut self, dir: P) -> Config {
        self.data_dir = dir.into();
        self
    }

    pub fn with_transaction_threshold(mut self, threshold: usize) -> Config {
        self.transaction_threshold = threshold.max(1);
        self
    }

    pub fn get_node_addr(&self) -> &str {
        &self.node_addr
    }

    /// Record the address the listener actually bound to. A node configured
    /// as the central node stays central.
    pub fn set_node_addr(&mut self, addr: String) {
        if self.is_central_node() {
            self.central_node = addr.clone();
        }
        self.node_addr = addr;
    }

    pub fn get_central_node(&self) -> &str {
        &self.central_node
    }

    pub fn is_central_node(&self) -> bool {
        self.node_addr == self.central_node
    }

    pub fn get_mining_addr(&self) -> Option<&str> {
        self.mining_addr.as_deref()
    }

    pub fn is_miner(&self) -> bool {
        self.mining_addr.is_some()
    }

    pub fn get_transaction_threshold(&self) -> usize {
        self.transaction_threshold
    }

    pub fn get_data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Port part of the node address, e.g. "127.0.0.1:3001" -> "3001".
    /// Several nodes on one machine keep their files apart by it.
    pub fn node_id(&self) -> &str {
        self.node_addr
            .rsplit(':')
            .next()
            .filter(|id| !id.is_empty())
            .unwrap_or(DEFAULT_NODE_ID)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(format!("blocks_{}", self.node_id()))
    }

    pub fn wallet_path(&self) -> PathBuf {
        self.data_dir.join(format!("wallet_{}.dat", self.node_id()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_sources(None, env_of(&[])).unwrap();
        assert_eq!(config.get_node_addr(), "127.0.0.1:3000");
        assert_eq!(config.get_central_node(), DEFAULT_CENTRAL_NODE);
        assert!(config.is_central_node());
        assert!(!config.is_miner());
        assert_eq!(config.get_transaction_threshold(), 2);
        assert_eq!(config.db_path(), PathBuf::from("./data/blocks_3000"));
    }

    #[test]
    fn test_node_id_sets_address_and_paths() {
        let config = Config::from_sources(None, env_of(&[("NODE_ID", "3001")])).unwrap();
        assert_eq!(config.get_node_addr(), "127.0.0.1:3001");
        assert!(!config.is_central_node());
        assert_eq!(config.node_id(), "3001");
        assert_eq!(config.wallet_path(), PathBuf::from("./data/wallet_3001.dat"));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "node_addr = \"10.0.0.5:4000\"\nmining_addr = \"from-file\"\ntransaction_threshold = 5"
        )
        .unwrap();

        let config = Config::from_sources(
            Some(file.path()),
            env_of(&[("MINING_ADDRESS", "from-env"), ("DATA_DIR", "/tmp/ledger")]),
        )
        .unwrap();
        assert_eq!(config.get_node_addr(), "10.0.0.5:4000");
        assert_eq!(config.get_mining_addr(), Some("from-env"));
        assert_eq!(config.get_transaction_threshold(), 5);
        assert_eq!(config.get_data_dir(), Path::new("/tmp/ledger"));
    }

    #[test]
    fn test_bad_values_are_config_errors() {
        let err = Config::from_sources(None, env_of(&[("TRANSACTION_THRESHOLD", "many")]))
            .unwrap_err();
        assert!(matches!(err, BlockchainError::Config(_)));

        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "no_such_key = 1").unwrap();
        let err = Config::from_sources(Some(file.path()), env_of(&[])).unwrap_err();
        assert!(matches!(err, BlockchainError::Config(_)));
    }
}
