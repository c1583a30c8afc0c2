//! Structured payout memos.
//!
//! The ledger attaches a memo to every payout and to vault-management
//! operations; the scanner and signer use the parsed kind to decide which
//! router events are legitimate and which call payload to build.

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Memo {
    /// `OUT:<txid>` - payout for an inbound transaction.
    Outbound { tx_id: String },
    /// `REFUND:<txid>` - inbound returned to sender.
    Refund { tx_id: String },
    /// `MIGRATE:<height>` - funds moving to a newer vault.
    Migrate { height: u64 },
    /// `VAULT+:<height>` - funding an auxiliary vault.
    VaultFund { height: u64 },
    /// `VAULT-:<height>` - auxiliary vault returning assets.
    VaultReturn { height: u64 },
    /// `RAGNAROK:<height>` - final payout during chain retirement.
    Ragnarok { height: u64 },
}

impl Memo {
    /// Parse a memo string. The kind token is case-insensitive.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (kind, rest) = raw
            .split_once(':')
            .ok_or_else(|| Error::InvalidEventSequence(format!("malformed memo: {raw}")))?;
        let rest = rest.trim();
        if rest.is_empty() {
            return Err(Error::InvalidEventSequence(format!(
                "memo missing argument: {raw}"
            )));
        }
        match kind.to_uppercase().as_str() {
            "OUT" => Ok(Memo::Outbound {
                tx_id: rest.to_string(),
            }),
            "REFUND" => Ok(Memo::Refund {
                tx_id: rest.to_string(),
            }),
            "MIGRATE" => Ok(Memo::Migrate {
                height: parse_height(raw, rest)?,
            }),
            "VAULT+" => Ok(Memo::VaultFund {
                height: parse_height(raw, rest)?,
            }),
            "VAULT-" => Ok(Memo::VaultReturn {
                height: parse_height(raw, rest)?,
            }),
            "RAGNAROK" => Ok(Memo::Ragnarok {
                height: parse_height(raw, rest)?,
            }),
            _ => Err(Error::InvalidEventSequence(format!(
                "unknown memo kind: {raw}"
            ))),
        }
    }

    /// True for memos that pay out to an external party.
    pub fn is_outbound(&self) -> bool {
        matches!(
            self,
            Memo::Outbound { .. } | Memo::Refund { .. } | Memo::Ragnarok { .. }
        )
    }

    pub fn is_migrate(&self) -> bool {
        matches!(self, Memo::Migrate { .. })
    }

    pub fn is_vault_fund(&self) -> bool {
        matches!(self, Memo::VaultFund { .. })
    }

    pub fn is_vault_return(&self) -> bool {
        matches!(self, Memo::VaultReturn { .. })
    }
}

fn parse_height(raw: &str, rest: &str) -> Result<u64> {
    rest.parse::<u64>()
        .map_err(|_| Error::InvalidEventSequence(format!("memo height not numeric: {raw}")))
}

impl std::fmt::Display for Memo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Memo::Outbound { tx_id } => write!(f, "OUT:{tx_id}"),
            Memo::Refund { tx_id } => write!(f, "REFUND:{tx_id}"),
            Memo::Migrate { height } => write!(f, "MIGRATE:{height}"),
            Memo::VaultFund { height } => write!(f, "VAULT+:{height}"),
            Memo::VaultReturn { height } => write!(f, "VAULT-:{height}"),
            Memo::Ragnarok { height } => write!(f, "RAGNAROK:{height}"),
        }
    }
}
