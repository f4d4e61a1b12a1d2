use rand::RngCore;
use sqlx::PgConnection;

use crate::error::{AppError, Result};
use crate::models::Transaction;
use crate::repositories::transaction_repository;

const MAX_KEY_ATTEMPTS: u32 = 3;

/// Produces a 32-character lowercase hex key. 128 random bits make
/// collisions negligible, and the unique index catches the rest.
pub fn generate_key() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Guarantees a withdrawal carries a bank idempotency key before any bank
/// call, and that repeat calls observe the same key. The key is installed
/// with a conditional update so a concurrent writer cannot overwrite it;
/// losing the race means adopting the winner's key.
pub async fn ensure_withdrawal_key(conn: &mut PgConnection, tx: &Transaction) -> Result<String> {
    if !tx.is_withdrawal() {
        return Err(AppError::Validation(
            "idempotency key is only used for withdrawal transactions".to_string(),
        ));
    }

    if let Some(key) = &tx.idempotency_key {
        return Ok(key.clone());
    }

    for _ in 0..MAX_KEY_ATTEMPTS {
        let candidate = generate_key();
        if transaction_repository::key_exists(conn, &candidate).await? {
            continue;
        }

        if transaction_repository::install_idempotency_key(conn, tx.id, &candidate).await? {
            return Ok(candidate);
        }

        // Lost the install race; another worker set a key for this row.
        if let Some(existing) = transaction_repository::fetch_idempotency_key(conn, tx.id).await? {
            return Ok(existing);
        }
    }

    Err(AppError::Internal(
        "failed to generate a unique idempotency key".to_string(),
    ))
}

/// Validates a client-supplied dedup key: present means non-empty after
/// trimming.
pub fn normalize_client_key(key: &str) -> Result<String> {
    let normalized = key.trim();
    if normalized.is_empty() {
        return Err(AppError::Validation(
            "idempotency_key cannot be empty".to_string(),
        ));
    }
    Ok(normalized.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_32_hex_chars() {
        for _ in 0..20 {
            let key = generate_key();
            assert_eq!(key.len(), 32);
            assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn generated_keys_do_not_repeat() {
        let a = generate_key();
        let b = generate_key();
        assert_ne!(a, b);
    }

    #[test]
    fn client_key_is_trimmed() {
        assert_eq!(normalize_client_key("  abc  ").unwrap(), "abc");
    }

    #[test]
    fn blank_client_key_is_rejected() {
        assert!(normalize_client_key("   ").is_err());
        assert!(normalize_client_key("").is_err());
    }
}
