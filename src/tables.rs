//! Core domain types shared across the validator and the processor
//!
//! Tables are minted on-chain and addressed by an unbounded numeric id.
//! Privileges gate row mutations and are persisted in the system ACL table
//! as single-letter abbreviations.

use std::fmt;
use std::str::FromStr;

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use primitive_types::{H160 as Address, H256 as Hash};

/// A supported EVM chain identifier.
pub type ChainId = i64;

/// Errors constructing domain values from their wire representations.
#[derive(Error, Debug)]
pub enum TypeError {
    #[error("invalid table id: {0}")]
    InvalidTableId(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("unsupported privilege: {0}")]
    UnsupportedPrivilege(String),
}

/// Identifier of a table minted by the on-chain registry.
///
/// Ids are unbounded non-negative integers. The decimal form is used in the
/// registry; the SQL-bound form (`t0x` plus at least 16 zero-padded hex
/// digits) names the materialized relation in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(U256);

impl TableId {
    pub fn new(id: impl Into<U256>) -> Self {
        TableId(id.into())
    }

    /// The relation name bound into canonical SQL sent to the store.
    pub fn sql_name(&self) -> String {
        format!("t0x{:0>16}", format!("{:x}", self.0))
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TableId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(TypeError::InvalidTableId(s.to_string()));
        }
        U256::from_dec_str(s)
            .map(TableId)
            .map_err(|_| TypeError::InvalidTableId(s.to_string()))
    }
}

impl From<u64> for TableId {
    fn from(id: u64) -> Self {
        TableId(U256::from(id))
    }
}

/// Parse a 20-byte EVM address from its 0x-prefixed hex form.
pub fn parse_address(s: &str) -> Result<Address, TypeError> {
    let hex_part = s.strip_prefix("0x").unwrap_or(s);
    let bytes =
        hex::decode(hex_part).map_err(|_| TypeError::InvalidAddress(s.to_string()))?;
    if bytes.len() != 20 {
        return Err(TypeError::InvalidAddress(s.to_string()));
    }
    Ok(Address::from_slice(&bytes))
}

/// Canonical lowercase 0x-prefixed hex form of an address.
///
/// This is the form persisted in the registry and ACL tables; lookups must
/// use it so that string comparison matches byte equality.
pub fn address_hex(addr: &Address) -> String {
    format!("0x{}", hex::encode(addr.as_bytes()))
}

/// A row-mutation privilege.
///
/// Each privilege has a single-letter abbreviation used by the system ACL
/// table and a disjoint bitfield used in code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Privilege {
    /// Allows INSERT. Abbreviation `a`.
    Insert,
    /// Allows UPDATE. Abbreviation `w`.
    Update,
    /// Allows DELETE. Abbreviation `d`.
    Delete,
}

impl Privilege {
    pub fn abbreviation(&self) -> &'static str {
        match self {
            Privilege::Insert => "a",
            Privilege::Update => "w",
            Privilege::Delete => "d",
        }
    }

    pub fn bitfield(&self) -> u8 {
        match self {
            Privilege::Insert => 0b001,
            Privilege::Update => 0b010,
            Privilege::Delete => 0b100,
        }
    }

    /// Parse from the SQL keyword form (`insert`, `update`, `delete`).
    pub fn from_sql_string(s: &str) -> Result<Self, TypeError> {
        match s.to_lowercase().as_str() {
            "insert" => Ok(Privilege::Insert),
            "update" => Ok(Privilege::Update),
            "delete" => Ok(Privilege::Delete),
            _ => Err(TypeError::UnsupportedPrivilege(s.to_string())),
        }
    }

    /// Parse from the stored abbreviation (`a`, `w`, `d`).
    pub fn from_abbreviation(s: &str) -> Result<Self, TypeError> {
        match s {
            "a" => Ok(Privilege::Insert),
            "w" => Ok(Privilege::Update),
            "d" => Ok(Privilege::Delete),
            _ => Err(TypeError::UnsupportedPrivilege(s.to_string())),
        }
    }

    pub fn to_sql_string(&self) -> &'static str {
        match self {
            Privilege::Insert => "insert",
            Privilege::Update => "update",
            Privilege::Delete => "delete",
        }
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_sql_string())
    }
}

/// An ordered set of privileges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Privileges(Vec<Privilege>);

impl Privileges {
    pub fn new(privs: Vec<Privilege>) -> Self {
        Privileges(privs)
    }

    /// The full set granted to a table owner at creation time.
    pub fn owner_defaults() -> Self {
        Privileges(vec![Privilege::Insert, Privilege::Update, Privilege::Delete])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Privilege> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, p: Privilege) -> bool {
        self.0.contains(&p)
    }

    /// Add a privilege, keeping the set free of duplicates.
    pub fn insert(&mut self, p: Privilege) {
        if !self.contains(p) {
            self.0.push(p);
        }
    }

    /// Remove a privilege if present.
    pub fn remove(&mut self, p: Privilege) {
        self.0.retain(|x| *x != p);
    }

    /// Check whether this set allows an operation.
    ///
    /// Operations outside the operation-to-privilege map need no row-level
    /// privilege and always pass. Denials carry the privilege that would
    /// allow the operation.
    pub fn can_execute(&self, op: Operation) -> Result<(), Privilege> {
        let Some(required) = op.required_privilege() else {
            return Ok(());
        };
        if self.contains(required) {
            Ok(())
        } else {
            Err(required)
        }
    }

    /// The comma-separated abbreviation form persisted by the store layer.
    pub fn to_abbreviations(&self) -> String {
        self.0
            .iter()
            .map(|p| p.abbreviation())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parse the stored comma-separated abbreviation form.
    pub fn from_abbreviations(s: &str) -> Result<Self, TypeError> {
        let mut privs = Privileges::default();
        for part in s.split(',').filter(|p| !p.is_empty()) {
            privs.insert(Privilege::from_abbreviation(part.trim())?);
        }
        Ok(privs)
    }
}

impl FromIterator<Privilege> for Privileges {
    fn from_iter<T: IntoIterator<Item = Privilege>>(iter: T) -> Self {
        let mut privs = Privileges::default();
        for p in iter {
            privs.insert(p);
        }
        privs
    }
}

/// The kind of operation a validated statement performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Select,
    Insert,
    Update,
    Delete,
    Grant,
    Revoke,
    Create,
}

impl Operation {
    /// The row-level privilege an operation needs, if any.
    pub fn required_privilege(&self) -> Option<Privilege> {
        match self {
            Operation::Insert => Some(Privilege::Insert),
            Operation::Update => Some(Privilege::Update),
            Operation::Delete => Some(Privilege::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Select => "select",
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Grant => "grant",
            Operation::Revoke => "revoke",
            Operation::Create => "create",
        };
        f.write_str(s)
    }
}

/// Event processing receipt persisted after every batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub chain_id: ChainId,
    pub txn_hash: String,
    pub block_number: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_id: Option<String>,
    /// Empty on success; otherwise a human-readable failure kind.
    pub error: String,
    /// Index of the failing event within the transaction.
    pub error_event_idx: i64,
}

impl Receipt {
    pub fn success(
        chain_id: ChainId,
        txn_hash: &str,
        block_number: i64,
        table_id: Option<TableId>,
    ) -> Self {
        Receipt {
            chain_id,
            txn_hash: txn_hash.to_string(),
            block_number,
            table_id: table_id.map(|id| id.to_string()),
            error: String::new(),
            error_event_idx: 0,
        }
    }

    pub fn failure(
        chain_id: ChainId,
        txn_hash: &str,
        block_number: i64,
        error: String,
        error_event_idx: i64,
    ) -> Self {
        Receipt {
            chain_id,
            txn_hash: txn_hash.to_string(),
            block_number,
            table_id: None,
            error,
            error_event_idx,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }
}
