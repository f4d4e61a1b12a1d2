mod common;

use serial_test::serial;
use wallet_engine::error::AppError;
use wallet_engine::idempotency;
use wallet_engine::repositories::TransactionRepository;

#[tokio::test]
#[serial]
async fn ensure_key_installs_once_and_stays_stable() {
    let pool = common::setup_test_db().await;
    common::cleanup_test_data(&pool).await;

    let wallet = common::create_wallet_with_balance(&pool, 1_000).await;
    let tx_id = common::insert_due_withdrawal(&pool, wallet.id, 100, 1).await;
    let repo = TransactionRepository::new(pool.clone());

    let tx = repo.find_by_id(tx_id).await.unwrap().unwrap();
    assert!(tx.idempotency_key.is_none());

    let mut uow = pool.begin().await.expect("begin");
    let first = idempotency::ensure_withdrawal_key(&mut uow, &tx)
        .await
        .expect("ensure key");
    uow.commit().await.expect("commit");

    assert_eq!(first.len(), 32);

    // Re-running against the refreshed row returns the installed key.
    let tx = repo.find_by_id(tx_id).await.unwrap().unwrap();
    assert_eq!(tx.idempotency_key.as_deref(), Some(first.as_str()));

    let mut uow = pool.begin().await.expect("begin");
    let second = idempotency::ensure_withdrawal_key(&mut uow, &tx)
        .await
        .expect("ensure key again");
    uow.commit().await.expect("commit");

    assert_eq!(first, second);

    common::cleanup_test_data(&pool).await;
}

#[tokio::test]
#[serial]
async fn ensure_key_adopts_a_concurrently_installed_key() {
    let pool = common::setup_test_db().await;
    common::cleanup_test_data(&pool).await;

    let wallet = common::create_wallet_with_balance(&pool, 1_000).await;
    let tx_id = common::insert_due_withdrawal(&pool, wallet.id, 100, 1).await;
    let repo = TransactionRepository::new(pool.clone());

    // Stale in-memory row: no key yet.
    let stale_tx = repo.find_by_id(tx_id).await.unwrap().unwrap();

    // Another worker installs a key meanwhile.
    sqlx::query("UPDATE transactions SET idempotency_key = 'winner-key' WHERE id = $1")
        .bind(tx_id)
        .execute(&pool)
        .await
        .expect("install racing key");

    let mut uow = pool.begin().await.expect("begin");
    let key = idempotency::ensure_withdrawal_key(&mut uow, &stale_tx)
        .await
        .expect("ensure key");
    uow.commit().await.expect("commit");

    assert_eq!(key, "winner-key");

    common::cleanup_test_data(&pool).await;
}

#[tokio::test]
#[serial]
async fn ensure_key_rejects_deposits() {
    let pool = common::setup_test_db().await;
    common::cleanup_test_data(&pool).await;

    let wallet = common::create_wallet_with_balance(&pool, 0).await;
    let outcome = wallet_engine::services::WalletService::new(pool.clone())
        .deposit(wallet.id, 100, None)
        .await
        .expect("deposit");

    let mut uow = pool.begin().await.expect("begin");
    let result = idempotency::ensure_withdrawal_key(&mut uow, &outcome.transaction).await;
    assert!(matches!(result, Err(AppError::Validation(_))));

    common::cleanup_test_data(&pool).await;
}
