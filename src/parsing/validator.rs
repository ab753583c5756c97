//! Parser-driven policy filter for user SQL
//!
//! Every statement is parsed with the PostgreSQL grammar and walked
//! explicitly over the node kinds the policy cares about. Anything outside
//! the deterministic subset is rejected before it can reach the store.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlparser::ast::{self as ast, Expr, SetExpr, Statement, TableFactor};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::tables::{parse_address, Operation, Privilege, Privileges};

use super::{
    CreateStmt, GrantStmt, MutatingStmt, ParsingError, ReadStmt, ValidatedQuery, WriteStmt,
};

/// Functions whose value depends on execution context. Detection happens on
/// the parsed function name, so it is case-insensitive by construction.
const NON_DETERMINISTIC_FUNCTIONS: &[&str] = &[
    "current_timestamp",
    "current_time",
    "current_date",
    "localtime",
    "localtimestamp",
    "now",
    "current_user",
    "current_role",
    "current_catalog",
    "current_schema",
    "session_user",
    "user",
];

/// System tables that are blocked by exact name regardless of the
/// configured prefix.
const RESERVED_TABLES: &[&str] = &["registry", "system_acl"];

/// A group of interchangeable names for one accepted column type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedType {
    pub names: Vec<String>,
}

impl AcceptedType {
    fn group(names: &[&str]) -> Self {
        AcceptedType {
            names: names.iter().map(|n| n.to_string()).collect(),
        }
    }
}

/// The default column-type allow-list for CREATE TABLE.
pub fn accepted_types() -> Vec<AcceptedType> {
    vec![
        AcceptedType::group(&["int", "integer", "int4"]),
        AcceptedType::group(&["int2", "smallint"]),
        AcceptedType::group(&["int8", "bigint"]),
        AcceptedType::group(&["text"]),
        AcceptedType::group(&["varchar", "character varying"]),
        AcceptedType::group(&["bpchar", "char", "character"]),
        AcceptedType::group(&["date"]),
        AcceptedType::group(&["bool", "boolean"]),
        AcceptedType::group(&["float4", "real"]),
        AcceptedType::group(&["float8", "double precision"]),
        AcceptedType::group(&["numeric", "decimal"]),
        AcceptedType::group(&["timestamp", "timestamp without time zone"]),
        AcceptedType::group(&["timestamptz", "timestamp with time zone"]),
        AcceptedType::group(&["uuid"]),
    ]
}

/// Enforces the deterministic SQL subset.
///
/// The validator is stateless apart from configuration and is safe to share
/// across any number of concurrent callers.
pub struct QueryValidator {
    system_table_prefix: String,
    accepted_type_names: Vec<String>,
}

impl QueryValidator {
    /// Create a validator with the default accepted column types.
    pub fn new(system_table_prefix: impl Into<String>) -> Self {
        Self::with_accepted_types(system_table_prefix, &accepted_types())
    }

    /// Create a validator with an explicit column-type allow-list. The
    /// groups are flattened since membership is all that matters.
    pub fn with_accepted_types(
        system_table_prefix: impl Into<String>,
        types: &[AcceptedType],
    ) -> Self {
        let accepted_type_names = types
            .iter()
            .flat_map(|t| t.names.iter().cloned())
            .collect();
        QueryValidator {
            system_table_prefix: system_table_prefix.into(),
            accepted_type_names,
        }
    }

    /// Validate a CREATE TABLE statement emitted by the on-chain registry.
    pub fn validate_create_table(&self, query: &str) -> Result<CreateStmt, ParsingError> {
        let mut statements = parse(query)?;
        if statements.is_empty() {
            return Err(ParsingError::EmptyStatement);
        }
        if statements.len() > 1 {
            return Err(ParsingError::NoSingleStatement);
        }

        let Statement::CreateTable(create) = statements.remove(0) else {
            return Err(ParsingError::NoTopLevelCreate);
        };

        let columns = self.check_create_column_types(&create)?;
        let hash = structure_hash(&columns);
        let name_prefix = relation_name(&create.name);
        Ok(CreateStmt::new(create, hash, name_prefix))
    }

    /// Validate a user-submitted payload, classifying it as a single read
    /// or a batch of mutations against one table.
    pub fn validate_run_sql(&self, query: &str) -> Result<ValidatedQuery, ParsingError> {
        let statements = parse(query)?;
        if statements.is_empty() {
            return Err(ParsingError::EmptyStatement);
        }

        if let Statement::Query(select) = &statements[0] {
            if statements.len() > 1 {
                return Err(ParsingError::NoSingleStatement);
            }
            self.validate_read_query(select)?;
            return Ok(ValidatedQuery::Read(ReadStmt::new(query)));
        }

        let mut mutations = Vec::with_capacity(statements.len());
        let mut target: Option<String> = None;
        for statement in statements {
            let is_grant = matches!(
                statement,
                Statement::Grant { .. } | Statement::Revoke { .. }
            );
            let mutation = if is_grant {
                MutatingStmt::Grant(self.validate_grant_statement(&statement)?)
            } else {
                let (table, operation) = self.validate_write_statement(&statement)?;
                MutatingStmt::Write(WriteStmt::new(statement, table, operation))
            };

            // All statements in a batch must agree on the referenced table.
            match &target {
                None => target = Some(mutation.table_name().to_string()),
                Some(first) if first != mutation.table_name() => {
                    return Err(ParsingError::MultiTableReference {
                        ref1: first.clone(),
                        ref2: mutation.table_name().to_string(),
                    });
                }
                Some(_) => {}
            }
            mutations.push(mutation);
        }

        Ok(ValidatedQuery::Mutations(mutations))
    }

    fn validate_write_statement(
        &self,
        statement: &Statement,
    ) -> Result<(String, Operation), ParsingError> {
        let operation = match statement {
            Statement::Insert(_) => Operation::Insert,
            Statement::Update { .. } => Operation::Update,
            Statement::Delete(_) => Operation::Delete,
            _ => return Err(ParsingError::NoTopLevelUpdateInsertDelete),
        };

        check_no_join_or_subquery(statement)?;
        check_no_returning(statement)?;
        self.check_no_system_table_refs(statement)?;
        check_no_nondeterministic_functions(statement)?;

        let table = referenced_table(statement)?;
        Ok((table, operation))
    }

    fn validate_grant_statement(&self, statement: &Statement) -> Result<GrantStmt, ParsingError> {
        let (privileges, objects, grantees, operation) = match statement {
            Statement::Grant {
                privileges,
                objects,
                grantees,
                ..
            } => (privileges, objects, grantees, Operation::Grant),
            Statement::Revoke {
                privileges,
                objects,
                grantees,
                ..
            } => (privileges, objects, grantees, Operation::Revoke),
            _ => return Err(ParsingError::NoTopLevelUpdateInsertDelete),
        };

        let ast::GrantObjects::Tables(names) = objects else {
            return Err(ParsingError::UnsupportedGrantObject);
        };
        if names.len() != 1 {
            return Err(ParsingError::UnsupportedGrantObject);
        }
        let table = relation_name(&names[0]);
        self.ensure_not_system_table(&table)?;

        let privileges = grant_privileges(privileges)?;
        let roles = grantees
            .iter()
            .map(|grantee| {
                parse_address(&grantee.value).map_err(|_| ParsingError::InvalidRole {
                    role: grantee.value.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(GrantStmt::new(table, roles, privileges, operation))
    }

    fn validate_read_query(&self, query: &ast::Query) -> Result<(), ParsingError> {
        if !query.locks.is_empty() {
            return Err(ParsingError::NoForUpdateOrShare);
        }

        // Every relation reachable through FROM, joins and derived tables
        // must stay outside the system namespace.
        self.check_query_system_refs(query)?;

        if let SetExpr::Select(select) = query.body.as_ref() {
            if let Some(selection) = &select.selection {
                walk_expr(selection, &mut reject_subqueries)?;
            }
            for item in &select.projection {
                match item {
                    ast::SelectItem::UnnamedExpr(expr)
                    | ast::SelectItem::ExprWithAlias { expr, .. } => {
                        walk_expr(expr, &mut reject_subqueries)?;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn check_create_column_types(
        &self,
        create: &ast::CreateTable,
    ) -> Result<Vec<(String, String)>, ParsingError> {
        let mut columns = Vec::with_capacity(create.columns.len());
        for column in &create.columns {
            let type_name = normalize_type_name(&column.data_type);
            if !self.accepted_type_names.contains(&type_name) {
                return Err(ParsingError::InvalidColumnType {
                    column_type: type_name,
                });
            }
            columns.push((column.name.value.clone(), type_name));
        }
        Ok(columns)
    }

    /// Block references to the registry, the system ACL table, and any
    /// relation under the configured system prefix.
    fn ensure_not_system_table(&self, name: &str) -> Result<(), ParsingError> {
        let lowered = name.to_lowercase();
        if RESERVED_TABLES.contains(&lowered.as_str())
            || lowered.starts_with(&self.system_table_prefix)
        {
            return Err(ParsingError::SystemTableReferencing);
        }
        Ok(())
    }

    fn check_no_system_table_refs(&self, statement: &Statement) -> Result<(), ParsingError> {
        match statement {
            Statement::Insert(insert) => {
                self.ensure_not_system_table(&relation_name(&insert.table_name))?;
                if let Some(source) = &insert.source {
                    self.check_query_system_refs(source)?;
                }
                Ok(())
            }
            Statement::Update { table, from, .. } => {
                self.check_table_with_joins(table)?;
                if let Some(from) = from {
                    self.check_table_with_joins(from)?;
                }
                Ok(())
            }
            Statement::Delete(delete) => {
                let tables = match &delete.from {
                    ast::FromTable::WithFromKeyword(tables) => tables,
                    ast::FromTable::WithoutKeyword(tables) => tables,
                };
                for table in tables {
                    self.check_table_with_joins(table)?;
                }
                if let Some(using) = &delete.using {
                    for table in using {
                        self.check_table_with_joins(table)?;
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn check_table_with_joins(&self, table: &ast::TableWithJoins) -> Result<(), ParsingError> {
        self.check_table_factor(&table.relation)?;
        for join in &table.joins {
            self.check_table_factor(&join.relation)?;
        }
        Ok(())
    }

    fn check_table_factor(&self, factor: &TableFactor) -> Result<(), ParsingError> {
        match factor {
            TableFactor::Table { name, .. } => self.ensure_not_system_table(&relation_name(name)),
            TableFactor::Derived { subquery, .. } => self.check_query_system_refs(subquery),
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => self.check_table_with_joins(table_with_joins),
            _ => Ok(()),
        }
    }

    fn check_query_system_refs(&self, query: &ast::Query) -> Result<(), ParsingError> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.check_query_system_refs(&cte.query)?;
            }
        }
        self.check_set_expr_system_refs(&query.body)
    }

    fn check_set_expr_system_refs(&self, body: &SetExpr) -> Result<(), ParsingError> {
        match body {
            SetExpr::Select(select) => {
                for table in &select.from {
                    self.check_table_with_joins(table)?;
                }
                Ok(())
            }
            SetExpr::Query(query) => self.check_query_system_refs(query),
            SetExpr::SetOperation { left, right, .. } => {
                self.check_set_expr_system_refs(left)?;
                self.check_set_expr_system_refs(right)
            }
            _ => Ok(()),
        }
    }
}

fn parse(query: &str) -> Result<Vec<Statement>, ParsingError> {
    Parser::parse_sql(&PostgreSqlDialect {}, query).map_err(|e| ParsingError::InvalidSyntax {
        msg: e.to_string(),
    })
}

/// Pre-order walk applying `check` to every expression node the policy
/// cares about. Node kinds outside the descent set are left alone; the
/// call sites reject the dangerous ones before walking.
fn walk_expr<F>(expr: &Expr, check: &mut F) -> Result<(), ParsingError>
where
    F: FnMut(&Expr) -> Result<(), ParsingError>,
{
    check(expr)?;
    match expr {
        Expr::BinaryOp { left, right, .. } => {
            walk_expr(left, check)?;
            walk_expr(right, check)
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => walk_expr(expr, check),
        Expr::IsNull(expr) | Expr::IsNotNull(expr) => walk_expr(expr, check),
        Expr::Cast { expr, .. } => walk_expr(expr, check),
        Expr::InList { expr, list, .. } => {
            walk_expr(expr, check)?;
            for item in list {
                walk_expr(item, check)?;
            }
            Ok(())
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            walk_expr(expr, check)?;
            walk_expr(low, check)?;
            walk_expr(high, check)
        }
        Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
            walk_expr(expr, check)?;
            walk_expr(pattern, check)
        }
        Expr::Tuple(items) => {
            for item in items {
                walk_expr(item, check)?;
            }
            Ok(())
        }
        Expr::Function(function) => match &function.args {
            ast::FunctionArguments::List(list) => {
                for arg in &list.args {
                    let arg_expr = match arg {
                        ast::FunctionArg::Named { arg, .. } => arg,
                        ast::FunctionArg::Unnamed(arg) => arg,
                        _ => continue,
                    };
                    if let ast::FunctionArgExpr::Expr(expr) = arg_expr {
                        walk_expr(expr, check)?;
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        },
        _ => Ok(()),
    }
}

fn reject_subqueries(expr: &Expr) -> Result<(), ParsingError> {
    match expr {
        Expr::Subquery(_) | Expr::Exists { .. } | Expr::InSubquery { .. } => {
            Err(ParsingError::JoinOrSubquery)
        }
        Expr::Function(function) => match &function.args {
            // A subquery can hide inside a function argument position.
            ast::FunctionArguments::Subquery(_) => Err(ParsingError::JoinOrSubquery),
            _ => Ok(()),
        },
        _ => Ok(()),
    }
}

fn check_no_join_or_subquery(statement: &Statement) -> Result<(), ParsingError> {
    match statement {
        Statement::Insert(insert) => {
            // Only an explicit VALUES list may feed an insert; any SELECT
            // source is a subquery.
            if let Some(source) = &insert.source {
                let SetExpr::Values(values) = source.body.as_ref() else {
                    return Err(ParsingError::JoinOrSubquery);
                };
                for row in &values.rows {
                    for expr in row {
                        walk_expr(expr, &mut reject_subqueries)?;
                    }
                }
            }
            Ok(())
        }
        Statement::Update {
            table,
            assignments,
            from,
            selection,
            ..
        } => {
            if from.is_some() || !table.joins.is_empty() {
                return Err(ParsingError::JoinOrSubquery);
            }
            for assignment in assignments {
                walk_expr(&assignment.value, &mut reject_subqueries)?;
            }
            if let Some(selection) = selection {
                walk_expr(selection, &mut reject_subqueries)?;
            }
            Ok(())
        }
        Statement::Delete(delete) => {
            if delete.using.is_some() {
                return Err(ParsingError::JoinOrSubquery);
            }
            if let Some(selection) = &delete.selection {
                walk_expr(selection, &mut reject_subqueries)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn check_no_returning(statement: &Statement) -> Result<(), ParsingError> {
    let returning = match statement {
        Statement::Insert(insert) => &insert.returning,
        Statement::Update { returning, .. } => returning,
        Statement::Delete(delete) => &delete.returning,
        _ => return Ok(()),
    };
    match returning {
        Some(list) if !list.is_empty() => Err(ParsingError::ReturningClause),
        _ => Ok(()),
    }
}

fn check_no_nondeterministic_functions(statement: &Statement) -> Result<(), ParsingError> {
    match statement {
        Statement::Insert(insert) => {
            if let Some(source) = &insert.source {
                if let SetExpr::Values(values) = source.body.as_ref() {
                    for row in &values.rows {
                        for expr in row {
                            walk_expr(expr, &mut reject_nondeterministic)?;
                        }
                    }
                }
            }
            Ok(())
        }
        Statement::Update {
            assignments,
            selection,
            ..
        } => {
            for assignment in assignments {
                walk_expr(&assignment.value, &mut reject_nondeterministic)?;
            }
            if let Some(selection) = selection {
                walk_expr(selection, &mut reject_nondeterministic)?;
            }
            Ok(())
        }
        Statement::Delete(delete) => {
            if let Some(selection) = &delete.selection {
                walk_expr(selection, &mut reject_nondeterministic)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn reject_nondeterministic(expr: &Expr) -> Result<(), ParsingError> {
    if let Expr::Function(function) = expr {
        let name = function
            .name
            .0
            .last()
            .map(|ident| ident.value.to_lowercase())
            .unwrap_or_default();
        if NON_DETERMINISTIC_FUNCTIONS.contains(&name.as_str()) {
            return Err(ParsingError::NonDeterministicFunction);
        }
    }
    Ok(())
}

fn referenced_table(statement: &Statement) -> Result<String, ParsingError> {
    match statement {
        Statement::Insert(insert) => Ok(relation_name(&insert.table_name)),
        Statement::Update { table, .. } => match &table.relation {
            TableFactor::Table { name, .. } => Ok(relation_name(name)),
            _ => Err(ParsingError::JoinOrSubquery),
        },
        Statement::Delete(delete) => {
            let tables = match &delete.from {
                ast::FromTable::WithFromKeyword(tables) => tables,
                ast::FromTable::WithoutKeyword(tables) => tables,
            };
            match tables.first().map(|t| &t.relation) {
                Some(TableFactor::Table { name, .. }) => Ok(relation_name(name)),
                _ => Err(ParsingError::NoTopLevelUpdateInsertDelete),
            }
        }
        _ => Err(ParsingError::NoTopLevelUpdateInsertDelete),
    }
}

fn relation_name(name: &ast::ObjectName) -> String {
    name.0
        .last()
        .map(|ident| ident.value.clone())
        .unwrap_or_default()
}

/// The lowercase type name with any length/precision arguments stripped,
/// e.g. `VARCHAR(10)` -> `varchar`.
fn normalize_type_name(data_type: &ast::DataType) -> String {
    let rendered = data_type.to_string().to_lowercase();
    match rendered.split_once('(') {
        Some((name, _)) => name.trim().to_string(),
        None => rendered,
    }
}

fn grant_privileges(privileges: &ast::Privileges) -> Result<Privileges, ParsingError> {
    let ast::Privileges::Actions(actions) = privileges else {
        return Err(ParsingError::UnsupportedPrivilege {
            privilege: "ALL".to_string(),
        });
    };
    actions
        .iter()
        .map(|action| match action {
            ast::Action::Insert { .. } => Ok(Privilege::Insert),
            ast::Action::Update { .. } => Ok(Privilege::Update),
            ast::Action::Delete => Ok(Privilege::Delete),
            other => Err(ParsingError::UnsupportedPrivilege {
                privilege: other.to_string(),
            }),
        })
        .collect()
}

fn structure_hash(columns: &[(String, String)]) -> String {
    let rendered = columns
        .iter()
        .map(|(name, type_name)| format!("{}:{}", name, type_name))
        .collect::<Vec<_>>()
        .join(",");
    let mut hasher = Sha256::new();
    hasher.update(rendered.as_bytes());
    hex::encode(hasher.finalize())
}
