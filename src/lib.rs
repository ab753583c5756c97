//! mesa - validator node for a multi-chain decentralized table database
//!
//! Users publish table-lifecycle and row-mutation intents as events on EVM
//! chains; the node validates their embedded SQL against a restricted
//! deterministic subset and materializes the effects in a local SQLite
//! store. Read queries run directly against the materialized store.
//!
//! The two core components:
//! - `parsing`: the SQL validator and canonicalizer
//! - `txn`: the serialized batch engine with ACL and row-cap enforcement

pub mod acl;
pub mod chain;
pub mod config;
pub mod parsing;
pub mod service;
pub mod store;
pub mod tables;
pub mod txn;
