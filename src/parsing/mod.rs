//! SQL validation layer
//!
//! This module provides:
//! - `QueryValidator`: parses user SQL and enforces the deterministic subset
//! - `CreateStmt` / `WriteStmt` / `GrantStmt`: validated statements that can
//!   re-emit canonical SQL bound to a minted table id
//!
//! The validator is pure and reentrant; it never touches the store.

pub mod validator;

use sqlparser::ast::{self as ast, ObjectName, Statement, TableFactor};
use thiserror::Error;

use crate::tables::{Address, Operation, Privileges, TableId};

pub use validator::QueryValidator;

/// Validation errors. These are user-visible and stable: clients correct
/// their input based on the kind and its context.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParsingError {
    #[error("invalid syntax: {msg}")]
    InvalidSyntax { msg: String },

    #[error("the statement is empty")]
    EmptyStatement,

    #[error("the query contains more than one statement")]
    NoSingleStatement,

    #[error("the query isn't a top-level UPDATE, INSERT or DELETE")]
    NoTopLevelUpdateInsertDelete,

    #[error("the query isn't a top-level CREATE TABLE")]
    NoTopLevelCreate,

    #[error("the query contains a JOIN or sub-query")]
    JoinOrSubquery,

    #[error("the query contains a RETURNING clause")]
    ReturningClause,

    #[error("the query references a system table")]
    SystemTableReferencing,

    #[error("the query contains a non-deterministic function")]
    NonDeterministicFunction,

    #[error("the query contains a FOR UPDATE or FOR SHARE clause")]
    NoForUpdateOrShare,

    #[error("disallowed column type: {column_type}")]
    InvalidColumnType { column_type: String },

    #[error("queries are referencing two distinct tables: {ref1} {ref2}")]
    MultiTableReference { ref1: String, ref2: String },

    #[error("unsupported privilege in GRANT/REVOKE: {privilege}")]
    UnsupportedPrivilege { privilege: String },

    #[error("GRANT/REVOKE must target exactly one table")]
    UnsupportedGrantObject,

    #[error("role isn't a valid address: {role}")]
    InvalidRole { role: String },
}

/// Classification of a validated run-SQL payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Read,
    Write,
}

/// Result of `QueryValidator::validate_run_sql`.
#[derive(Debug, Clone)]
pub enum ValidatedQuery {
    /// A single read statement, executed verbatim against the store.
    Read(ReadStmt),
    /// One or more mutating statements, all referencing the same table.
    Mutations(Vec<MutatingStmt>),
}

impl ValidatedQuery {
    pub fn query_type(&self) -> QueryType {
        match self {
            ValidatedQuery::Read(_) => QueryType::Read,
            ValidatedQuery::Mutations(_) => QueryType::Write,
        }
    }
}

/// A validated read statement. No rewrite is needed for reads, so the
/// canonical SQL is the verbatim input.
#[derive(Debug, Clone)]
pub struct ReadStmt {
    raw_query: String,
}

impl ReadStmt {
    pub(crate) fn new(raw_query: impl Into<String>) -> Self {
        ReadStmt {
            raw_query: raw_query.into(),
        }
    }

    pub fn raw_query(&self) -> &str {
        &self.raw_query
    }
}

/// A validated row mutation.
///
/// Holds the validated AST so the relation can be rewritten to the stored
/// name at execution time, plus the deparsed canonical form produced at
/// validation time.
#[derive(Debug, Clone)]
pub struct WriteStmt {
    statement: Statement,
    raw_query: String,
    table_name: String,
    operation: Operation,
}

impl WriteStmt {
    pub(crate) fn new(statement: Statement, table_name: String, operation: Operation) -> Self {
        let raw_query = statement.to_string();
        WriteStmt {
            statement,
            raw_query,
            table_name,
            operation,
        }
    }

    /// The canonical SQL deparsed at validation time. Still references the
    /// user-chosen table name.
    pub fn raw_query(&self) -> &str {
        &self.raw_query
    }

    /// The single user table this statement references.
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    /// Re-emit the statement with its relation bound to the stored name of
    /// `id`. This is the only form that may reach the store engine.
    pub fn desugared_query(&self, id: TableId) -> String {
        let mut statement = self.statement.clone();
        rewrite_relation(&mut statement, &id.sql_name());
        statement.to_string()
    }
}

/// A validated GRANT or REVOKE of mutation privileges on one table.
#[derive(Debug, Clone)]
pub struct GrantStmt {
    table_name: String,
    roles: Vec<Address>,
    privileges: Privileges,
    operation: Operation,
}

impl GrantStmt {
    pub(crate) fn new(
        table_name: String,
        roles: Vec<Address>,
        privileges: Privileges,
        operation: Operation,
    ) -> Self {
        GrantStmt {
            table_name,
            roles,
            privileges,
            operation,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn roles(&self) -> &[Address] {
        &self.roles
    }

    pub fn privileges(&self) -> &Privileges {
        &self.privileges
    }

    /// `Operation::Grant` or `Operation::Revoke`.
    pub fn operation(&self) -> Operation {
        self.operation
    }
}

/// A member of a mutating batch.
#[derive(Debug, Clone)]
pub enum MutatingStmt {
    Write(WriteStmt),
    Grant(GrantStmt),
}

impl MutatingStmt {
    /// The user table the statement references; doubles as the name-prefix
    /// hint checked against the registry.
    pub fn table_name(&self) -> &str {
        match self {
            MutatingStmt::Write(w) => w.table_name(),
            MutatingStmt::Grant(g) => g.table_name(),
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            MutatingStmt::Write(w) => w.operation(),
            MutatingStmt::Grant(g) => g.operation(),
        }
    }
}

/// A validated CREATE TABLE plus its deterministic structure hash.
///
/// The AST is cloned before every bind so the hash stays a faithful
/// description of the validated structure across repeated binds.
#[derive(Debug, Clone)]
pub struct CreateStmt {
    create: ast::CreateTable,
    structure_hash: String,
    name_prefix: String,
}

impl CreateStmt {
    pub(crate) fn new(
        create: ast::CreateTable,
        structure_hash: String,
        name_prefix: String,
    ) -> Self {
        CreateStmt {
            create,
            structure_hash,
            name_prefix,
        }
    }

    /// Hex SHA-256 over `col:type` pairs in declaration order.
    pub fn structure_hash(&self) -> &str {
        &self.structure_hash
    }

    /// The user-supplied relation name, stored only in the registry.
    pub fn name_prefix(&self) -> &str {
        &self.name_prefix
    }

    /// Deparse the statement with the relation renamed to the stored name
    /// of `id`.
    pub fn bound_query(&self, id: TableId) -> String {
        let mut create = self.create.clone();
        create.name = single_name(&id.sql_name());
        Statement::CreateTable(create).to_string()
    }
}

fn single_name(name: &str) -> ObjectName {
    ObjectName(vec![ast::Ident::new(name)])
}

/// Point the statement's target relation at `name`. Only the three write
/// statement kinds carry a rewritable relation.
fn rewrite_relation(statement: &mut Statement, name: &str) {
    match statement {
        Statement::Insert(insert) => {
            insert.table_name = single_name(name);
        }
        Statement::Update { table, .. } => {
            if let TableFactor::Table { name: relation, .. } = &mut table.relation {
                *relation = single_name(name);
            }
        }
        Statement::Delete(delete) => {
            let tables = match &mut delete.from {
                ast::FromTable::WithFromKeyword(tables) => tables,
                ast::FromTable::WithoutKeyword(tables) => tables,
            };
            if let Some(table) = tables.first_mut() {
                if let TableFactor::Table { name: relation, .. } = &mut table.relation {
                    *relation = single_name(name);
                }
            }
        }
        _ => {}
    }
}
