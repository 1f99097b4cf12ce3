// Wire format shared by every peer: a 12-byte ASCII command tag padded with
// NUL bytes, followed by the JSON-encoded payload. One message per
// connection; the sender closes its write half and the receiver reads to
// EOF.

use crate::error::{BlockchainError, Result};
use serde::{Deserialize, Serialize};

pub const COMMAND_LENGTH: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Tx,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionPayload {
    pub version: i64,
    pub best_height: i64,
    pub addr_from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrPayload {
    pub addr_list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvPayload {
    pub addr_from: String,
    #[serde(rename = "type")]
    pub op_type: OpType,
    pub items: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlocksPayload {
    pub addr_from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDataPayload {
    pub addr_from: String,
    #[serde(rename = "type")]
    pub op_type: OpType,
    pub id: Vec<u8>,
}

/// `block` holds the bincode encoding of a [`Block`](crate::core::Block).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPayload {
    pub addr_from: String,
    pub block: Vec<u8>,
}

/// `transaction` holds the bincode encoding of a
/// [`Transaction`](crate::core::Transaction).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPayload {
    pub addr_from: String,
    pub transaction: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Package {
    Version(VersionPayload),
    Addr(AddrPayload),
    Inv(InvPayload),
    GetBlocks(GetBlocksPayload),
    GetData(GetDataPayload),
    Block(BlockPayload),
    Tx(TxPayload),
}

impl Package {
    pub fn command(&self) -> &'static str {
        match self {
            Package::Version(_) => "version",
            Package::Addr(_) => "addr",
            Package::Inv(_) => "inv",
            Package::GetBlocks(_) => "getblocks",
            Package::GetData(_) => "getdata",
            Package::Block(_) => "block",
            Package::Tx(_) => "tx",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = match self {
            Package::Version(p) => serde_json::to_vec(p)?,
            Package::Addr(p) => serde_json::to_vec(p)?,
            Package::Inv(p) => serde_json::to_vec(p)?,
            Package::GetBlocks(p) => serde_json::to_vec(p)?,
            Package::GetData(p) => serde_json::to_vec(p)?,
            Package::Block(p) => serde_json::to_vec(p)?,
            Package::Tx(p) => serde_json::to_vec(p)?,
        };
        let mut bytes = command_to_bytes(self.command());
        bytes.extend(payload);
        Ok(bytes)
    }

    /// Parse one complete message. An unrecognised tag is a `Network`
    /// error naming the tag.
    pub fn decode(bytes: &[u8]) -> Result<Package> {
        if bytes.len() < COMMAND_LENGTH {
            return Err(BlockchainError::Network(format!(
                "Message of {} bytes is shorter than its command tag",
                bytes.len()
            )));
        }
        let (tag, payload) = bytes.split_at(COMMAND_LENGTH);
        let package = match bytes_to_command(tag).as_str() {
            "version" => Package::Version(serde_json::from_slice(payload)?),
            "addr" => Package::Addr(serde_json::from_slice(payload)?),
            "inv" => Package::Inv(serde_json::from_slice(payload)?),
            "getblocks" => Package::GetBlocks(serde_json::from_slice(payload)?),
            "getdata" => Package::GetData(serde_json::from_slice(payload)?),
            "block" => Package::Block(serde_json::from_slice(payload)?),
            "tx" => Package::Tx(serde_json::from_slice(payload)?),
            unknown => {
                return Err(BlockchainError::Network(format!(
                    "Unknown command: {unknown:?}"
                )))
            }
        };
        Ok(package)
    }
}

fn command_to_bytes(command: &str) -> Vec<u8> {
    let mut bytes = vec![0u8; COMMAND_LENGTH];
    for (slot, byte) in bytes.iter_mut().zip(command.bytes()) {
        *slot = byte;
    }
    bytes
}

fn bytes_to_command(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
