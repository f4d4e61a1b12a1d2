use serde::Deserialize;

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub database: DatabaseSettings,
    pub bank: BankSettings,
    pub worker: WorkerSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationSettings {
    pub port: u16,
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub pool_size: u32,
    /// Claim queries use FOR UPDATE SKIP LOCKED when true, FOR UPDATE NOWAIT
    /// otherwise (lock-not-available then surfaces as a retryable error).
    pub claim_skip_locked: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BankSettings {
    pub base_url: String,
    pub timeout_seconds: f64,
    pub retry_max_attempts: u32,
    pub retry_base_delay: f64,
    pub retry_max_delay: f64,
    /// Zero disables outbound rate limiting entirely.
    pub max_rps: f64,
    pub rate_limit_key: String,
    pub rate_limit_backend_url: String,
    pub status_url_template: Option<String>,
    /// Whether the bank deduplicates transfers by idempotency key. Governs
    /// stale-PROCESSING recovery: retry when true, reconcile when false.
    pub honors_idempotency: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    pub processing_stale_seconds: i64,
    pub processing_timeout_seconds: i64,
    pub lock_contention_max_retries: u32,
    pub lock_contention_backoff_seconds: f64,
    pub loop_interval: f64,
    pub startup_jitter_max: f64,
    pub loop_jitter_max: f64,
}

impl Settings {
    pub fn new() -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects configurations that would make the workers or the gateway
    /// misbehave silently. Called once at startup.
    pub fn validate(&self) -> Result<()> {
        if self.database.pool_size == 0 {
            return Err(invalid("database.pool_size must be greater than zero"));
        }
        if self.bank.base_url.trim().is_empty() {
            return Err(invalid("bank.base_url must not be empty"));
        }
        if self.bank.timeout_seconds <= 0.0 {
            return Err(invalid("bank.timeout_seconds must be greater than zero"));
        }
        if self.bank.retry_max_attempts == 0 {
            return Err(invalid("bank.retry_max_attempts must be greater than zero"));
        }
        if self.bank.retry_base_delay < 0.0 || self.bank.retry_max_delay < 0.0 {
            return Err(invalid("bank retry delays must be >= 0"));
        }
        if self.bank.max_rps < 0.0 {
            return Err(invalid("bank.max_rps must be >= 0"));
        }
        if self.worker.processing_stale_seconds <= 0 {
            return Err(invalid(
                "worker.processing_stale_seconds must be greater than zero",
            ));
        }
        if self.worker.processing_timeout_seconds <= 0 {
            return Err(invalid(
                "worker.processing_timeout_seconds must be greater than zero",
            ));
        }
        if self.worker.lock_contention_backoff_seconds < 0.0 {
            return Err(invalid("worker.lock_contention_backoff_seconds must be >= 0"));
        }
        if self.worker.loop_interval <= 0.0 {
            return Err(invalid("worker.loop_interval must be greater than zero"));
        }
        if self.worker.startup_jitter_max < 0.0 || self.worker.loop_jitter_max < 0.0 {
            return Err(invalid("worker jitter values must be >= 0"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> AppError {
    AppError::Validation(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_settings() -> Settings {
        Settings {
            application: ApplicationSettings {
                port: 8000,
                log_level: "info".to_string(),
            },
            database: DatabaseSettings {
                url: "postgres://localhost/wallet_engine".to_string(),
                pool_size: 5,
                claim_skip_locked: true,
            },
            bank: BankSettings {
                base_url: "http://127.0.0.1:8010".to_string(),
                timeout_seconds: 3.0,
                retry_max_attempts: 3,
                retry_base_delay: 0.1,
                retry_max_delay: 2.0,
                max_rps: 0.0,
                rate_limit_key: "bank:bucket".to_string(),
                rate_limit_backend_url: "redis://127.0.0.1:6379".to_string(),
                status_url_template: None,
                honors_idempotency: true,
            },
            worker: WorkerSettings {
                processing_stale_seconds: 30,
                processing_timeout_seconds: 300,
                lock_contention_max_retries: 20,
                lock_contention_backoff_seconds: 0.05,
                loop_interval: 2.0,
                startup_jitter_max: 0.0,
                loop_jitter_max: 0.0,
            },
        }
    }

    #[test]
    fn accepts_valid_settings() {
        assert!(valid_settings().validate().is_ok());
    }

    #[test]
    fn rejects_zero_timeout() {
        let mut settings = valid_settings();
        settings.bank.timeout_seconds = 0.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_zero_retry_attempts() {
        let mut settings = valid_settings();
        settings.bank.retry_max_attempts = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_negative_max_rps() {
        let mut settings = valid_settings();
        settings.bank.max_rps = -1.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_non_positive_stale_seconds() {
        let mut settings = valid_settings();
        settings.worker.processing_stale_seconds = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_non_positive_loop_interval() {
        let mut settings = valid_settings();
        settings.worker.loop_interval = 0.0;
        assert!(settings.validate().is_err());
    }
}
