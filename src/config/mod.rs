//! Configuration management
//!
//! Node addresses, mining settings and on-disk locations, assembled from
//! defaults, an optional `node.toml` and environment variables.

pub mod settings;

pub use settings::{Config, CONFIG_FILE, DEFAULT_CENTRAL_NODE, DEFAULT_TRANSACTION_THRESHOLD};
