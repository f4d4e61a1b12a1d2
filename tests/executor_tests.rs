mod common;

use chrono::Utc;
use serial_test::serial;
use wallet_engine::gateway::TransferResult;
use wallet_engine::models::{ReconciliationStatus, TransactionStatus};
use wallet_engine::repositories::{ReconciliationRepository, TransactionRepository};
use wallet_engine::workers::execute_due_withdrawals;

#[tokio::test]
#[serial]
async fn happy_path_debits_and_settles() {
    let pool = common::setup_test_db().await;
    common::cleanup_test_data(&pool).await;

    let wallet = common::create_wallet_with_balance(&pool, 1_000).await;
    let tx_id = common::insert_due_withdrawal(&pool, wallet.id, 300, 1).await;

    let gateway = common::ScriptedGateway::new();
    gateway.push_transfer(TransferResult::succeeded("bank-1"));

    let settings = common::test_settings();
    let summary = execute_due_withdrawals(&pool, &gateway, &settings, 10, Utc::now())
        .await
        .expect("executor run");

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.insufficient_funds, 0);
    assert_eq!(summary.unknown, 0);

    assert_eq!(common::wallet_balance(&pool, wallet.id).await, 700);

    let tx = TransactionRepository::new(pool.clone())
        .find_by_id(tx_id)
        .await
        .expect("find tx")
        .expect("tx exists");
    assert_eq!(tx.status, TransactionStatus::Succeeded);
    assert_eq!(tx.bank_reference.as_deref(), Some("bank-1"));
    assert_eq!(tx.external_reference.as_deref(), Some("bank-1"));
    assert!(tx.failure_reason.is_none());
    assert!(tx.idempotency_key.is_some());

    common::cleanup_test_data(&pool).await;
}

#[tokio::test]
#[serial]
async fn insufficient_funds_fails_without_bank_call() {
    let pool = common::setup_test_db().await;
    common::cleanup_test_data(&pool).await;

    let wallet = common::create_wallet_with_balance(&pool, 100).await;
    let tx_id = common::insert_due_withdrawal(&pool, wallet.id, 150, 1).await;

    let gateway = common::ScriptedGateway::new();

    let settings = common::test_settings();
    let summary = execute_due_withdrawals(&pool, &gateway, &settings, 10, Utc::now())
        .await
        .expect("executor run");

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.insufficient_funds, 1);
    assert_eq!(summary.succeeded, 0);

    // Never debited, never sent to the bank.
    assert_eq!(common::wallet_balance(&pool, wallet.id).await, 100);
    assert_eq!(gateway.transfer_call_count(), 0);

    let tx = TransactionRepository::new(pool.clone())
        .find_by_id(tx_id)
        .await
        .expect("find tx")
        .expect("tx exists");
    assert_eq!(tx.status, TransactionStatus::Failed);
    assert_eq!(tx.failure_reason.as_deref(), Some("INSUFFICIENT_FUNDS"));

    common::cleanup_test_data(&pool).await;
}

#[tokio::test]
#[serial]
async fn final_failure_refunds_the_debit() {
    let pool = common::setup_test_db().await;
    common::cleanup_test_data(&pool).await;

    let wallet = common::create_wallet_with_balance(&pool, 900).await;
    let tx_id = common::insert_due_withdrawal(&pool, wallet.id, 400, 1).await;

    let gateway = common::ScriptedGateway::new();
    gateway.push_transfer(TransferResult::final_failure("bank_rejected", None));

    let settings = common::test_settings();
    let summary = execute_due_withdrawals(&pool, &gateway, &settings, 10, Utc::now())
        .await
        .expect("executor run");

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.insufficient_funds, 0);

    assert_eq!(common::wallet_balance(&pool, wallet.id).await, 900);

    let tx = TransactionRepository::new(pool.clone())
        .find_by_id(tx_id)
        .await
        .expect("find tx")
        .expect("tx exists");
    assert_eq!(tx.status, TransactionStatus::Failed);
    assert_eq!(tx.failure_reason.as_deref(), Some("bank_rejected"));

    // No reconciliation task for a definitive failure.
    let task = ReconciliationRepository::new(pool.clone())
        .find_by_transaction(tx_id)
        .await
        .expect("query task");
    assert!(task.is_none());

    common::cleanup_test_data(&pool).await;
}

#[tokio::test]
#[serial]
async fn gateway_error_keeps_debit_and_queues_reconciliation() {
    let pool = common::setup_test_db().await;
    common::cleanup_test_data(&pool).await;

    let wallet = common::create_wallet_with_balance(&pool, 1_000).await;
    let tx_id = common::insert_due_withdrawal(&pool, wallet.id, 200, 1).await;

    let gateway = common::ScriptedGateway::new();
    gateway.push_transfer_error("connection reset by bank");

    let settings = common::test_settings();
    let summary = execute_due_withdrawals(&pool, &gateway, &settings, 10, Utc::now())
        .await
        .expect("executor run");

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.unknown, 1);
    assert_eq!(summary.reconciliation_queued, 1);
    assert_eq!(summary.failed, 0);

    // The debit stands: no refund until reconciliation says otherwise.
    assert_eq!(common::wallet_balance(&pool, wallet.id).await, 800);

    let tx = TransactionRepository::new(pool.clone())
        .find_by_id(tx_id)
        .await
        .expect("find tx")
        .expect("tx exists");
    assert_eq!(tx.status, TransactionStatus::Unknown);
    assert!(tx
        .failure_reason
        .as_deref()
        .expect("failure reason set")
        .starts_with("gateway_exception:"));

    let task = ReconciliationRepository::new(pool.clone())
        .find_by_transaction(tx_id)
        .await
        .expect("query task")
        .expect("task exists");
    assert_eq!(task.status, ReconciliationStatus::Pending);

    common::cleanup_test_data(&pool).await;
}

#[tokio::test]
#[serial]
async fn unknown_outcome_records_bank_reason() {
    let pool = common::setup_test_db().await;
    common::cleanup_test_data(&pool).await;

    let wallet = common::create_wallet_with_balance(&pool, 500).await;
    let tx_id = common::insert_due_withdrawal(&pool, wallet.id, 100, 1).await;

    let gateway = common::ScriptedGateway::new();
    gateway.push_transfer(TransferResult::unknown("network_error"));

    let settings = common::test_settings();
    execute_due_withdrawals(&pool, &gateway, &settings, 10, Utc::now())
        .await
        .expect("executor run");

    let task = ReconciliationRepository::new(pool.clone())
        .find_by_transaction(tx_id)
        .await
        .expect("query task")
        .expect("task exists");
    assert_eq!(task.reason, "network_error");
    assert!(task.is_pending());

    common::cleanup_test_data(&pool).await;
}

#[tokio::test]
#[serial]
async fn due_items_drain_oldest_first_up_to_limit() {
    let pool = common::setup_test_db().await;
    common::cleanup_test_data(&pool).await;

    let wallet = common::create_wallet_with_balance(&pool, 1_000).await;
    let first = common::insert_due_withdrawal(&pool, wallet.id, 100, 30).await;
    let second = common::insert_due_withdrawal(&pool, wallet.id, 100, 20).await;
    let third = common::insert_due_withdrawal(&pool, wallet.id, 100, 10).await;

    let gateway = common::ScriptedGateway::new();
    gateway.push_transfer(TransferResult::succeeded("bank-a"));
    gateway.push_transfer(TransferResult::succeeded("bank-b"));

    let settings = common::test_settings();
    let summary = execute_due_withdrawals(&pool, &gateway, &settings, 2, Utc::now())
        .await
        .expect("executor run");

    assert_eq!(summary.processed, 2);
    assert_eq!(summary.succeeded, 2);

    let repo = TransactionRepository::new(pool.clone());
    let oldest = repo.find_by_id(first).await.unwrap().unwrap();
    let middle = repo.find_by_id(second).await.unwrap().unwrap();
    let newest = repo.find_by_id(third).await.unwrap().unwrap();
    assert_eq!(oldest.status, TransactionStatus::Succeeded);
    assert_eq!(middle.status, TransactionStatus::Succeeded);
    assert_eq!(newest.status, TransactionStatus::Scheduled);

    common::cleanup_test_data(&pool).await;
}

#[tokio::test]
#[serial]
async fn zero_limit_processes_nothing() {
    let pool = common::setup_test_db().await;
    common::cleanup_test_data(&pool).await;

    let wallet = common::create_wallet_with_balance(&pool, 1_000).await;
    common::insert_due_withdrawal(&pool, wallet.id, 100, 1).await;

    let gateway = common::ScriptedGateway::new();
    let settings = common::test_settings();
    let summary = execute_due_withdrawals(&pool, &gateway, &settings, 0, Utc::now())
        .await
        .expect("executor run");

    assert_eq!(summary.processed, 0);
    assert_eq!(gateway.transfer_call_count(), 0);

    common::cleanup_test_data(&pool).await;
}

#[tokio::test]
#[serial]
async fn execute_at_exactly_now_is_due() {
    let pool = common::setup_test_db().await;
    common::cleanup_test_data(&pool).await;

    let wallet = common::create_wallet_with_balance(&pool, 1_000).await;
    let tx_id = common::insert_due_withdrawal(&pool, wallet.id, 100, 0).await;

    let gateway = common::ScriptedGateway::new();
    gateway.push_transfer(TransferResult::succeeded("bank-now"));

    let settings = common::test_settings();
    // `now` well past the row's execute_at; the filter is inclusive.
    let summary = execute_due_withdrawals(&pool, &gateway, &settings, 10, Utc::now())
        .await
        .expect("executor run");
    assert_eq!(summary.succeeded, 1);

    let tx = TransactionRepository::new(pool.clone())
        .find_by_id(tx_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Succeeded);

    common::cleanup_test_data(&pool).await;
}

#[tokio::test]
#[serial]
async fn stale_processing_is_retried_with_same_key_when_bank_is_idempotent() {
    let pool = common::setup_test_db().await;
    common::cleanup_test_data(&pool).await;

    let wallet = common::create_wallet_with_balance(&pool, 1_000).await;
    let tx_id =
        common::insert_processing_withdrawal(&pool, wallet.id, 300, "stale-key-1", 120).await;

    let gateway = common::ScriptedGateway::new();
    gateway.push_transfer(TransferResult::succeeded("bank-retry"));

    let settings = common::test_settings();
    let summary = execute_due_withdrawals(&pool, &gateway, &settings, 10, Utc::now())
        .await
        .expect("executor run");

    assert_eq!(summary.succeeded, 1);
    // Same key as the original attempt: the bank deduplicates.
    assert_eq!(gateway.transfer_keys(), vec!["stale-key-1".to_string()]);

    let tx = TransactionRepository::new(pool.clone())
        .find_by_id(tx_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Succeeded);
    // Already debited at the original claim; no second debit.
    assert_eq!(common::wallet_balance(&pool, wallet.id).await, 700);

    common::cleanup_test_data(&pool).await;
}

#[tokio::test]
#[serial]
async fn stale_processing_goes_to_reconciliation_when_bank_is_not_idempotent() {
    let pool = common::setup_test_db().await;
    common::cleanup_test_data(&pool).await;

    let wallet = common::create_wallet_with_balance(&pool, 1_000).await;
    let tx_id =
        common::insert_processing_withdrawal(&pool, wallet.id, 300, "stale-key-2", 120).await;

    let gateway = common::ScriptedGateway::new();

    let mut settings = common::test_settings();
    settings.bank.honors_idempotency = false;

    let summary = execute_due_withdrawals(&pool, &gateway, &settings, 10, Utc::now())
        .await
        .expect("executor run");

    assert_eq!(summary.unknown, 1);
    assert_eq!(summary.reconciliation_queued, 1);
    // A retry could double-pay: the bank must not be called.
    assert_eq!(gateway.transfer_call_count(), 0);

    let tx = TransactionRepository::new(pool.clone())
        .find_by_id(tx_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::Unknown);

    let task = ReconciliationRepository::new(pool.clone())
        .find_by_transaction(tx_id)
        .await
        .expect("query task")
        .expect("task exists");
    assert_eq!(task.reason, "STALE_PROCESSING_WITHOUT_BANK_IDEMPOTENCY");

    // Debit stands until reconciliation resolves the outcome.
    assert_eq!(common::wallet_balance(&pool, wallet.id).await, 700);

    common::cleanup_test_data(&pool).await;
}

#[tokio::test]
#[serial]
async fn fresh_processing_rows_are_left_alone() {
    let pool = common::setup_test_db().await;
    common::cleanup_test_data(&pool).await;

    let wallet = common::create_wallet_with_balance(&pool, 1_000).await;
    common::insert_processing_withdrawal(&pool, wallet.id, 300, "fresh-key", 0).await;

    let gateway = common::ScriptedGateway::new();
    let settings = common::test_settings();
    let summary = execute_due_withdrawals(&pool, &gateway, &settings, 10, Utc::now())
        .await
        .expect("executor run");

    assert_eq!(summary.processed, 0);
    assert_eq!(gateway.transfer_call_count(), 0);

    common::cleanup_test_data(&pool).await;
}

#[tokio::test]
#[serial]
async fn concurrent_workers_never_overdraw() {
    let pool = common::setup_test_db().await;
    common::cleanup_test_data(&pool).await;

    let wallet = common::create_wallet_with_balance(&pool, 100).await;
    common::insert_due_withdrawal(&pool, wallet.id, 80, 2).await;
    common::insert_due_withdrawal(&pool, wallet.id, 80, 1).await;

    // One success script shared across both workers: a second transfer call
    // would mean a double debit and panics the test.
    let gateway = common::ScriptedGateway::new();
    gateway.push_transfer(TransferResult::succeeded("bank-c1"));

    let settings = common::test_settings();
    let now = Utc::now();
    let (a, b) = tokio::join!(
        execute_due_withdrawals(&pool, &gateway, &settings, 2, now),
        execute_due_withdrawals(&pool, &gateway, &settings, 2, now),
    );
    let a = a.expect("worker a");
    let b = b.expect("worker b");

    assert_eq!(a.succeeded + b.succeeded, 1);
    assert_eq!(a.insufficient_funds + b.insufficient_funds, 1);
    assert_eq!(common::wallet_balance(&pool, wallet.id).await, 20);

    common::cleanup_test_data(&pool).await;
}
