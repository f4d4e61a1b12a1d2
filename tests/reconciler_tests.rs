mod common;

use chrono::Utc;
use serial_test::serial;
use wallet_engine::gateway::TransferResult;
use wallet_engine::models::{ReconciliationStatus, TransactionStatus};
use wallet_engine::repositories::{ReconciliationRepository, TransactionRepository};
use wallet_engine::workers::{execute_due_withdrawals, reconcile_withdrawals};

/// Drives a due withdrawal into UNKNOWN through the executor, returning the
/// transaction id. Leaves the wallet debited and one PENDING task behind.
async fn setup_unknown_withdrawal(
    pool: &sqlx::PgPool,
    gateway: &common::ScriptedGateway,
    wallet_id: i64,
    amount: i64,
) -> i64 {
    let tx_id = common::insert_due_withdrawal(pool, wallet_id, amount, 1).await;
    gateway.push_transfer_error("bank connection lost");

    let settings = common::test_settings();
    let summary = execute_due_withdrawals(pool, gateway, &settings, 10, Utc::now())
        .await
        .expect("executor run");
    assert_eq!(summary.unknown, 1);

    tx_id
}

#[tokio::test]
#[serial]
async fn reconciles_unknown_to_success_without_touching_balance() {
    let pool = common::setup_test_db().await;
    common::cleanup_test_data(&pool).await;

    let wallet = common::create_wallet_with_balance(&pool, 1_000).await;
    let gateway = common::ScriptedGateway::new();
    let tx_id = setup_unknown_withdrawal(&pool, &gateway, wallet.id, 200).await;
    assert_eq!(common::wallet_balance(&pool, wallet.id).await, 800);

    gateway.push_status(TransferResult::succeeded("bank-R"));

    let settings = common::test_settings();
    let summary = reconcile_withdrawals(&pool, &gateway, &settings, 10, Utc::now())
        .await
        .expect("reconciler run");

    assert_eq!(summary.resolved_success, 1);
    assert_eq!(summary.resolved_failure, 0);
    assert_eq!(summary.pending, 0);

    // The transfer really happened: debit stands.
    assert_eq!(common::wallet_balance(&pool, wallet.id).await, 800);

    let tx = TransactionRepository::new(pool.clone())
        .find_by_id(tx_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Succeeded);
    assert_eq!(tx.bank_reference.as_deref(), Some("bank-R"));

    let task = ReconciliationRepository::new(pool.clone())
        .find_by_transaction(tx_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, ReconciliationStatus::Resolved);
    assert_eq!(task.reason, "RECONCILED_SUCCESS");

    common::cleanup_test_data(&pool).await;
}

#[tokio::test]
#[serial]
async fn reconciles_unknown_to_failure_with_refund() {
    let pool = common::setup_test_db().await;
    common::cleanup_test_data(&pool).await;

    let wallet = common::create_wallet_with_balance(&pool, 1_000).await;
    let gateway = common::ScriptedGateway::new();
    let tx_id = setup_unknown_withdrawal(&pool, &gateway, wallet.id, 200).await;

    gateway.push_status(TransferResult::final_failure("never_received", None));

    let settings = common::test_settings();
    let summary = reconcile_withdrawals(&pool, &gateway, &settings, 10, Utc::now())
        .await
        .expect("reconciler run");

    assert_eq!(summary.resolved_failure, 1);

    // The transfer never happened: money comes back.
    assert_eq!(common::wallet_balance(&pool, wallet.id).await, 1_000);

    let tx = TransactionRepository::new(pool.clone())
        .find_by_id(tx_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Failed);
    assert_eq!(tx.failure_reason.as_deref(), Some("never_received"));

    let task = ReconciliationRepository::new(pool.clone())
        .find_by_transaction(tx_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, ReconciliationStatus::Resolved);
    assert_eq!(task.reason, "RECONCILED_FINAL_FAILURE");

    common::cleanup_test_data(&pool).await;
}

#[tokio::test]
#[serial]
async fn still_ambiguous_answers_leave_the_task_pending() {
    let pool = common::setup_test_db().await;
    common::cleanup_test_data(&pool).await;

    let wallet = common::create_wallet_with_balance(&pool, 1_000).await;
    let gateway = common::ScriptedGateway::new();
    let tx_id = setup_unknown_withdrawal(&pool, &gateway, wallet.id, 200).await;

    gateway.push_status(TransferResult::unknown("still_processing"));

    let settings = common::test_settings();
    let summary = reconcile_withdrawals(&pool, &gateway, &settings, 10, Utc::now())
        .await
        .expect("reconciler run");

    assert_eq!(summary.pending, 1);
    assert_eq!(summary.resolved_success + summary.resolved_failure, 0);

    // No refund while the outcome is ambiguous.
    assert_eq!(common::wallet_balance(&pool, wallet.id).await, 800);

    let task = ReconciliationRepository::new(pool.clone())
        .find_by_transaction(tx_id)
        .await
        .unwrap()
        .unwrap();
    assert!(task.is_pending());

    common::cleanup_test_data(&pool).await;
}

#[tokio::test]
#[serial]
async fn missing_status_endpoint_keeps_tasks_pending() {
    let pool = common::setup_test_db().await;
    common::cleanup_test_data(&pool).await;

    let wallet = common::create_wallet_with_balance(&pool, 1_000).await;
    let gateway = common::ScriptedGateway::without_status_endpoint();
    setup_unknown_withdrawal(&pool, &gateway, wallet.id, 200).await;

    let settings = common::test_settings();
    let summary = reconcile_withdrawals(&pool, &gateway, &settings, 10, Utc::now())
        .await
        .expect("reconciler run");

    assert_eq!(summary.pending, 1);
    assert_eq!(common::wallet_balance(&pool, wallet.id).await, 800);

    common::cleanup_test_data(&pool).await;
}

#[tokio::test]
#[serial]
async fn times_out_stuck_processing_rows() {
    let pool = common::setup_test_db().await;
    common::cleanup_test_data(&pool).await;

    let wallet = common::create_wallet_with_balance(&pool, 1_000).await;
    let tx_id =
        common::insert_processing_withdrawal(&pool, wallet.id, 300, "stuck-key", 400).await;

    // Status endpoint still ambiguous; phase A must mark the row anyway.
    let gateway = common::ScriptedGateway::new();
    gateway.push_status(TransferResult::unknown("no_answer"));

    let settings = common::test_settings();
    let summary = reconcile_withdrawals(&pool, &gateway, &settings, 10, Utc::now())
        .await
        .expect("reconciler run");

    assert_eq!(summary.stale_marked_unknown, 1);

    let tx = TransactionRepository::new(pool.clone())
        .find_by_id(tx_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Unknown);

    let task = ReconciliationRepository::new(pool.clone())
        .find_by_transaction(tx_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.reason, "PROCESSING_TIMEOUT_RECONCILIATION_REQUIRED");

    common::cleanup_test_data(&pool).await;
}

#[tokio::test]
#[serial]
async fn processing_rows_within_timeout_are_not_swept() {
    let pool = common::setup_test_db().await;
    common::cleanup_test_data(&pool).await;

    let wallet = common::create_wallet_with_balance(&pool, 1_000).await;
    common::insert_processing_withdrawal(&pool, wallet.id, 300, "live-key", 100).await;

    let gateway = common::ScriptedGateway::new();
    let settings = common::test_settings();
    // timeout is 300s, the row is only 100s old
    let summary = reconcile_withdrawals(&pool, &gateway, &settings, 10, Utc::now())
        .await
        .expect("reconciler run");

    assert_eq!(summary.stale_marked_unknown, 0);

    common::cleanup_test_data(&pool).await;
}

#[tokio::test]
#[serial]
async fn tasks_for_already_final_transactions_resolve_without_bank_calls() {
    let pool = common::setup_test_db().await;
    common::cleanup_test_data(&pool).await;

    let wallet = common::create_wallet_with_balance(&pool, 1_000).await;

    // A task left behind for a row another worker already settled.
    let tx_id = common::insert_due_withdrawal(&pool, wallet.id, 100, 1).await;
    sqlx::query(
        "UPDATE transactions SET status = 'SUCCEEDED', idempotency_key = 'late-key' WHERE id = $1",
    )
    .bind(tx_id)
    .execute(&pool)
    .await
    .expect("force succeed");
    sqlx::query(
        "INSERT INTO withdrawal_reconciliation_tasks (transaction_id, reason) VALUES ($1, 'UNKNOWN_TRANSFER_OUTCOME')",
    )
    .bind(tx_id)
    .execute(&pool)
    .await
    .expect("insert task");

    let gateway = common::ScriptedGateway::new();
    let settings = common::test_settings();
    let summary = reconcile_withdrawals(&pool, &gateway, &settings, 10, Utc::now())
        .await
        .expect("reconciler run");

    assert_eq!(summary.resolved, 1);

    let task = ReconciliationRepository::new(pool.clone())
        .find_by_transaction(tx_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, ReconciliationStatus::Resolved);
    assert_eq!(task.reason, "ALREADY_SUCCEEDED");

    common::cleanup_test_data(&pool).await;
}

#[tokio::test]
#[serial]
async fn resolved_tasks_are_ignored() {
    let pool = common::setup_test_db().await;
    common::cleanup_test_data(&pool).await;

    let wallet = common::create_wallet_with_balance(&pool, 1_000).await;
    let gateway = common::ScriptedGateway::new();
    let tx_id = setup_unknown_withdrawal(&pool, &gateway, wallet.id, 200).await;

    gateway.push_status(TransferResult::succeeded("bank-R2"));
    let settings = common::test_settings();
    reconcile_withdrawals(&pool, &gateway, &settings, 10, Utc::now())
        .await
        .expect("first reconciler run");

    // Second run finds no pending work and must not query the bank again.
    let summary = reconcile_withdrawals(&pool, &gateway, &settings, 10, Utc::now())
        .await
        .expect("second reconciler run");
    assert_eq!(
        summary.resolved_success + summary.resolved_failure + summary.resolved + summary.pending,
        0
    );

    let tx = TransactionRepository::new(pool.clone())
        .find_by_id(tx_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Succeeded);

    common::cleanup_test_data(&pool).await;
}
