use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

/// Unique identifier for nodes (delegates, validators, shard members)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

/// Identifier of a shard, either `shard-<index>` or the single `default` shard
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardId(pub String);

/// Opaque identifier handed back once a transaction is confirmed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub String);

impl NodeId {
    pub fn new(id: &str) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl ShardId {
    const DEFAULT: &'static str = "default";
    const PREFIX: &'static str = "shard-";

    /// Shard handed out when sharding is disabled
    pub fn default_shard() -> Self {
        Self(Self::DEFAULT.to_string())
    }

    pub fn indexed(index: usize) -> Self {
        Self(format!("{}{}", Self::PREFIX, index))
    }

    /// Numeric index for `shard-<n>` identifiers, `None` for the default shard
    pub fn index(&self) -> Option<usize> {
        self.0.strip_prefix(Self::PREFIX)?.parse().ok()
    }

    pub fn is_default(&self) -> bool {
        self.0 == Self::DEFAULT
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Consensus flavour; selects the finality-latency profile and whether
/// delegate elections run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusType {
    Poa,
    Pos,
    Pbft,
    Dpos,
    Hybrid,
}

impl ConsensusType {
    /// Delegate elections only run for the delegated flavours
    pub fn runs_elections(&self) -> bool {
        matches!(self, ConsensusType::Dpos | ConsensusType::Hybrid)
    }
}

impl fmt::Display for ConsensusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsensusType::Poa => "poa",
            ConsensusType::Pos => "pos",
            ConsensusType::Pbft => "pbft",
            ConsensusType::Dpos => "dpos",
            ConsensusType::Hybrid => "hybrid",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for ConsensusType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "poa" => Ok(ConsensusType::Poa),
            "pos" => Ok(ConsensusType::Pos),
            "pbft" => Ok(ConsensusType::Pbft),
            "dpos" => Ok(ConsensusType::Dpos),
            "hybrid" => Ok(ConsensusType::Hybrid),
            other => Err(EngineError::Config(format!("Unknown consensus type: {}", other))),
        }
    }
}

/// Transaction as supplied by the transaction-submission layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_id: String,
    pub timestamp: DateTime<Utc>,
    pub tx_type: String,
    pub payload: serde_json::Value,
    pub sender: String,
    pub signature: String,
    #[serde(default)]
    pub shard_id: Option<ShardId>,
}

impl Transaction {
    pub fn new(tx_type: &str, sender: &str, payload: serde_json::Value) -> Self {
        let timestamp = Utc::now();
        Self {
            tx_id: format!(
                "tx_{}_{}",
                tx_type,
                timestamp.timestamp_nanos_opt().unwrap_or_default()
            ),
            timestamp,
            tx_type: tx_type.to_string(),
            payload,
            sender: sender.to_string(),
            signature: String::new(),
            shard_id: None,
        }
    }
}

/// Block header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub prev_hash: String,
    pub merkle_root: String,
    pub timestamp: DateTime<Utc>,
    pub producer: NodeId,
    pub shard_id: ShardId,
    pub difficulty: u32,
}

/// Block proposed for validation.
///
/// `signatures` maps validator id to an opaque signature string produced by
/// the external signing collaborator; the engine only counts and compares them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub shard_id: ShardId,
    #[serde(default)]
    pub cross_shard_refs: Vec<String>,
    #[serde(default)]
    pub signatures: BTreeMap<NodeId, String>,
}

impl Block {
    /// Empty block at `height` produced by `producer` on `shard_id`
    pub fn new(height: u64, prev_hash: &str, producer: NodeId, shard_id: ShardId) -> Self {
        Self {
            header: BlockHeader {
                height,
                prev_hash: prev_hash.to_string(),
                merkle_root: String::new(),
                timestamp: Utc::now(),
                producer,
                shard_id: shard_id.clone(),
                difficulty: 0,
            },
            transactions: Vec::new(),
            shard_id,
            cross_shard_refs: Vec::new(),
            signatures: BTreeMap::new(),
        }
    }

    pub fn with_transactions(mut self, transactions: Vec<Transaction>) -> Self {
        self.transactions = transactions;
        self
    }

    pub fn with_signature(mut self, validator: NodeId, signature: &str) -> Self {
        self.signatures.insert(validator, signature.to_string());
        self
    }

    /// Hex SHA-256 over the header fields and transaction ids. Used as the
    /// block identity for locked/valid block bookkeeping.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.header.height.to_be_bytes());
        hasher.update(self.header.prev_hash.as_bytes());
        hasher.update(self.header.merkle_root.as_bytes());
        hasher.update(self.header.timestamp.timestamp_millis().to_be_bytes());
        hasher.update(self.header.producer.0.as_bytes());
        hasher.update(self.header.shard_id.0.as_bytes());
        hasher.update(self.header.difficulty.to_be_bytes());
        for tx in &self.transactions {
            hasher.update(tx.tx_id.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Validators that attached a signature
    pub fn signers(&self) -> impl Iterator<Item = &NodeId> {
        self.signatures.keys()
    }

    /// Size of the JSON encoding, used for block-size metrics
    pub fn encoded_size(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(0)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block(height={}, shard={}, txs={}, sigs={})",
            self.header.height,
            self.shard_id,
            self.transactions.len(),
            self.signatures.len()
        )
    }
}
