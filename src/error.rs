//! Error taxonomy shared by the scanner, signer and their collaborators.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The requested block is not (yet) available from the RPC node. The poll
    /// loop treats this as "retry the same height later", never as fatal.
    #[error("block {0} not available")]
    UnavailableBlock(u64),

    /// Transport-level RPC failure, including per-call timeouts.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// Token contract is not on the configured whitelist. Events referencing
    /// such tokens are ignored, not failed.
    #[error("token {0} is not whitelisted")]
    NotWhitelisted(String),

    /// Adversarial or malformed event sequence within a single transaction,
    /// e.g. two Deposit events disagreeing on recipient or memo.
    #[error("invalid event sequence: {0}")]
    InvalidEventSequence(String),

    /// Local or remote signing failure that is not attributable to specific
    /// signing-party members.
    #[error("signing error: {0}")]
    Signing(String),

    /// Remote threshold signing failed with blame attached. The blame has
    /// already been reported to the ledger when this surfaces.
    #[error("keysign failed, blamed nodes {nodes:?}: {reason}")]
    KeysignBlame { nodes: Vec<String>, reason: String },

    /// Key-value store access failure.
    #[error("store error: {0}")]
    Store(String),

    /// Invalid configuration detected at construction time. The only variant
    /// that is allowed to terminate startup.
    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub fn rpc(e: impl std::fmt::Display) -> Self {
        Error::Rpc(e.to_string())
    }

    pub fn store(e: impl std::fmt::Display) -> Self {
        Error::Store(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
