//! Transaction processor integration tests against an in-memory store.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;

use mesa::acl::{AclError, RegistryAcl};
use mesa::parsing::{MutatingStmt, QueryValidator, ValidatedQuery};
use mesa::store;
use mesa::tables::{parse_address, Address, Privilege, TableId};
use mesa::txn::{TxnError, TxnProcessor};

const OWNER: &str = "0xd43c59d5694ec111eb9e986c233200b14249558d";
const OTHER: &str = "0x2222222222222222222222222222222222222222";

async fn setup(max_row_count: usize) -> (SqlitePool, TxnProcessor, QueryValidator) {
    let pool = store::connect_in_memory().await.unwrap();
    store::migrate(&pool).await.unwrap();
    let processor = TxnProcessor::new(pool.clone(), max_row_count, Arc::new(RegistryAcl));
    (pool, processor, QueryValidator::new("system_"))
}

fn addr(s: &str) -> Address {
    parse_address(s).unwrap()
}

fn mutations(validator: &QueryValidator, query: &str) -> Vec<MutatingStmt> {
    match validator.validate_run_sql(query).unwrap() {
        ValidatedQuery::Mutations(stmts) => stmts,
        other => panic!("expected mutations, got {:?}", other.query_type()),
    }
}

async fn mint_table(
    processor: &TxnProcessor,
    validator: &QueryValidator,
    id: u64,
    owner: &str,
    query: &str,
) {
    let create = validator.validate_create_table(query).unwrap();
    let mut batch = processor.open_batch().await.unwrap();
    batch
        .insert_table(TableId::from(id), &addr(owner), "", &create)
        .await
        .unwrap();
    batch.commit().await.unwrap();
}

async fn row_count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT count(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_insert_table_registers_and_creates() {
    let (pool, processor, validator) = setup(0).await;
    let create = validator
        .validate_create_table("create table foo (a int, b text)")
        .unwrap();

    let mut batch = processor.open_batch().await.unwrap();
    batch
        .insert_table(TableId::from(1), &addr(OWNER), "a test table", &create)
        .await
        .unwrap();
    batch.commit().await.unwrap();

    let (name, controller, structure, description): (String, String, String, String) =
        sqlx::query_as("SELECT name, controller, structure, description FROM registry WHERE id = '1'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(name, "foo");
    assert_eq!(controller, OWNER);
    assert_eq!(structure, create.structure_hash());
    assert_eq!(description, "a test table");

    let privileges: String = sqlx::query_scalar(
        "SELECT privileges FROM system_acl WHERE table_id = '1' AND controller = ?1",
    )
    .bind(OWNER)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(privileges, "a,w,d");

    // The stored relation exists under the bound name and is empty.
    assert_eq!(row_count(&pool, "t0x0000000000000001").await, 0);
}

#[tokio::test]
async fn test_insert_table_failure_rolls_back_savepoint() {
    let (pool, processor, validator) = setup(0).await;
    let create = validator
        .validate_create_table("create table foo (a int)")
        .unwrap();

    let mut batch = processor.open_batch().await.unwrap();
    batch
        .insert_table(TableId::from(1), &addr(OWNER), "", &create)
        .await
        .unwrap();
    // Same id again: the registry primary key rejects it, the savepoint
    // rolls back, and the batch stays usable.
    let err = batch
        .insert_table(TableId::from(1), &addr(OWNER), "", &create)
        .await
        .unwrap_err();
    assert!(matches!(err, TxnError::Store(_)));
    batch.commit().await.unwrap();

    assert_eq!(row_count(&pool, "registry").await, 1);
}

#[tokio::test]
async fn test_exec_write_queries_applies_in_order() {
    let (pool, processor, validator) = setup(0).await;
    mint_table(&processor, &validator, 1, OWNER, "create table foo (a int, b text)").await;

    let stmts = mutations(
        &validator,
        "insert into foo values (1, 'one'); update foo set b='uno' where a=1;",
    );
    let mut batch = processor.open_batch().await.unwrap();
    batch
        .exec_write_queries(&addr(OWNER), TableId::from(1), &stmts)
        .await
        .unwrap();
    batch.commit().await.unwrap();

    let b: String = sqlx::query_scalar("SELECT b FROM t0x0000000000000001 WHERE a = 1")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(b, "uno");
}

#[tokio::test]
async fn test_empty_batch_is_a_noop() {
    let (_pool, processor, _validator) = setup(0).await;
    // No table lookup happens, so even a bogus table id passes.
    let mut batch = processor.open_batch().await.unwrap();
    batch
        .exec_write_queries(&addr(OWNER), TableId::from(999), &[])
        .await
        .unwrap();
    batch.close().await.unwrap();
}

#[tokio::test]
async fn test_unknown_table_id() {
    let (_pool, processor, validator) = setup(0).await;
    let stmts = mutations(&validator, "insert into foo values (1)");
    let mut batch = processor.open_batch().await.unwrap();
    let err = batch
        .exec_write_queries(&addr(OWNER), TableId::from(7), &stmts)
        .await
        .unwrap_err();
    assert!(matches!(err, TxnError::UnknownTable));
    batch.close().await.unwrap();
}

#[tokio::test]
async fn test_name_prefix_mismatch() {
    let (_pool, processor, validator) = setup(0).await;
    mint_table(&processor, &validator, 1, OWNER, "create table foo (a int)").await;

    let stmts = mutations(&validator, "insert into bar values (1)");
    let mut batch = processor.open_batch().await.unwrap();
    let err = batch
        .exec_write_queries(&addr(OWNER), TableId::from(1), &stmts)
        .await
        .unwrap_err();
    match err {
        TxnError::NamePrefixMismatch { expected, got } => {
            assert_eq!(expected, "foo");
            assert_eq!(got, "bar");
        }
        other => panic!("unexpected error: {other}"),
    }
    batch.close().await.unwrap();
}

#[tokio::test]
async fn test_write_requires_privilege() {
    let (pool, processor, validator) = setup(0).await;
    mint_table(&processor, &validator, 1, OWNER, "create table foo (a int)").await;

    let stmts = mutations(&validator, "insert into foo values (1)");
    let mut batch = processor.open_batch().await.unwrap();
    let err = batch
        .exec_write_queries(&addr(OTHER), TableId::from(1), &stmts)
        .await
        .unwrap_err();
    match err {
        TxnError::Acl(AclError::Denied { required, .. }) => {
            assert_eq!(required, Privilege::Insert);
        }
        other => panic!("unexpected error: {other}"),
    }
    batch.close().await.unwrap();

    assert_eq!(row_count(&pool, "t0x0000000000000001").await, 0);
}

#[tokio::test]
async fn test_grant_allows_other_writer_within_same_batch() {
    let (pool, processor, validator) = setup(0).await;
    mint_table(&processor, &validator, 1, OWNER, "create table foo (a int)").await;

    let grant = mutations(
        &validator,
        &format!("grant insert, update on foo to \"{OTHER}\""),
    );
    let insert = mutations(&validator, "insert into foo values (42)");

    // The grant is visible to a later statement set in the same batch.
    let mut batch = processor.open_batch().await.unwrap();
    batch
        .exec_write_queries(&addr(OWNER), TableId::from(1), &grant)
        .await
        .unwrap();
    batch
        .exec_write_queries(&addr(OTHER), TableId::from(1), &insert)
        .await
        .unwrap();
    batch.commit().await.unwrap();

    assert_eq!(row_count(&pool, "t0x0000000000000001").await, 1);

    let privileges: String = sqlx::query_scalar(
        "SELECT privileges FROM system_acl WHERE table_id = '1' AND controller = ?1",
    )
    .bind(OTHER)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(privileges, "a,w");
}

#[tokio::test]
async fn test_grant_is_idempotent() {
    let (pool, processor, validator) = setup(0).await;
    mint_table(&processor, &validator, 1, OWNER, "create table foo (a int)").await;

    let grant = mutations(&validator, &format!("grant insert on foo to \"{OTHER}\""));
    for _ in 0..2 {
        let mut batch = processor.open_batch().await.unwrap();
        batch
            .exec_write_queries(&addr(OWNER), TableId::from(1), &grant)
            .await
            .unwrap();
        batch.commit().await.unwrap();
    }

    let privileges: String = sqlx::query_scalar(
        "SELECT privileges FROM system_acl WHERE table_id = '1' AND controller = ?1",
    )
    .bind(OTHER)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(privileges, "a");
}

#[tokio::test]
async fn test_revoke_removes_privilege() {
    let (_pool, processor, validator) = setup(0).await;
    mint_table(&processor, &validator, 1, OWNER, "create table foo (a int)").await;

    let grant = mutations(
        &validator,
        &format!("grant insert, delete on foo to \"{OTHER}\""),
    );
    let revoke = mutations(&validator, &format!("revoke insert on foo from \"{OTHER}\""));
    let insert = mutations(&validator, "insert into foo values (1)");

    let mut batch = processor.open_batch().await.unwrap();
    batch
        .exec_write_queries(&addr(OWNER), TableId::from(1), &grant)
        .await
        .unwrap();
    batch
        .exec_write_queries(&addr(OWNER), TableId::from(1), &revoke)
        .await
        .unwrap();
    let err = batch
        .exec_write_queries(&addr(OTHER), TableId::from(1), &insert)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TxnError::Acl(AclError::Denied {
            required: Privilege::Insert,
            ..
        })
    ));
    batch.close().await.unwrap();
}

#[tokio::test]
async fn test_non_owner_cannot_grant() {
    let (_pool, processor, validator) = setup(0).await;
    mint_table(&processor, &validator, 1, OWNER, "create table foo (a int)").await;

    let grant = mutations(&validator, &format!("grant insert on foo to \"{OTHER}\""));
    let mut batch = processor.open_batch().await.unwrap();
    let err = batch
        .exec_write_queries(&addr(OTHER), TableId::from(1), &grant)
        .await
        .unwrap_err();
    assert!(matches!(err, TxnError::Acl(AclError::NotOwner)));
    batch.close().await.unwrap();
}

#[tokio::test]
async fn test_row_cap_breach_leaves_table_unchanged() {
    let (pool, processor, validator) = setup(10).await;
    mint_table(&processor, &validator, 1, OWNER, "create table foo (a int)").await;

    // Fill to nine rows, one short of the cap.
    let fill = mutations(
        &validator,
        "insert into foo values (1),(2),(3),(4),(5),(6),(7),(8),(9)",
    );
    let mut batch = processor.open_batch().await.unwrap();
    batch
        .exec_write_queries(&addr(OWNER), TableId::from(1), &fill)
        .await
        .unwrap();
    batch.commit().await.unwrap();
    assert_eq!(row_count(&pool, "t0x0000000000000001").await, 9);

    // A two-row insert would land at eleven.
    let two_more = mutations(&validator, "insert into foo values (10),(11)");
    let mut batch = processor.open_batch().await.unwrap();
    let err = batch
        .exec_write_queries(&addr(OWNER), TableId::from(1), &two_more)
        .await
        .unwrap_err();
    match err {
        TxnError::RowCountExceeded { before, after } => {
            assert_eq!(before, 9);
            assert_eq!(after, 11);
        }
        other => panic!("unexpected error: {other}"),
    }
    batch.close().await.unwrap();

    assert_eq!(row_count(&pool, "t0x0000000000000001").await, 9);
}

#[tokio::test]
async fn test_row_cap_disabled_when_zero() {
    let (pool, processor, validator) = setup(0).await;
    mint_table(&processor, &validator, 1, OWNER, "create table foo (a int)").await;

    let stmts = mutations(
        &validator,
        "insert into foo values (1),(2),(3),(4),(5),(6),(7),(8),(9),(10),(11),(12)",
    );
    let mut batch = processor.open_batch().await.unwrap();
    batch
        .exec_write_queries(&addr(OWNER), TableId::from(1), &stmts)
        .await
        .unwrap();
    batch.commit().await.unwrap();

    assert_eq!(row_count(&pool, "t0x0000000000000001").await, 12);
}

#[tokio::test]
async fn test_close_without_commit_rolls_back() {
    let (pool, processor, validator) = setup(0).await;
    mint_table(&processor, &validator, 1, OWNER, "create table foo (a int)").await;

    let stmts = mutations(&validator, "insert into foo values (1)");
    let mut batch = processor.open_batch().await.unwrap();
    batch
        .exec_write_queries(&addr(OWNER), TableId::from(1), &stmts)
        .await
        .unwrap();
    batch.close().await.unwrap();

    assert_eq!(row_count(&pool, "t0x0000000000000001").await, 0);
}

#[tokio::test]
async fn test_single_batch_in_flight() {
    let (_pool, processor, _validator) = setup(0).await;

    let batch = processor.open_batch().await.unwrap();
    // A second open blocks until the first batch terminates.
    let waited = tokio::time::timeout(Duration::from_millis(50), processor.open_batch()).await;
    assert!(waited.is_err());

    batch.close().await.unwrap();
    let second = processor.open_batch().await.unwrap();
    second.close().await.unwrap();
}

#[tokio::test]
async fn test_processor_close_waits_for_batch() {
    let (_pool, processor, _validator) = setup(0).await;

    let batch = processor.open_batch().await.unwrap();
    // Close waits for the in-flight batch; a caller with a deadline races
    // it against a timeout.
    let waited = tokio::time::timeout(Duration::from_millis(50), processor.close()).await;
    assert!(waited.is_err());

    batch.close().await.unwrap();
    processor.close().await;

    let err = processor.open_batch().await.unwrap_err();
    assert!(matches!(err, TxnError::Closed));
}
