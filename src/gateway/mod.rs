pub mod client;
pub mod rate_limiter;
pub mod retry;

pub use client::{HttpBankGateway, TransferGateway, TransferOutcome, TransferResult};
pub use rate_limiter::{
    build_rate_limiter, AcquireResult, NoopRateLimiter, RateLimiter, RateLimiterUnavailable,
    RedisTokenBucketRateLimiter,
};
pub use retry::{full_jitter_delay, parse_retry_after_seconds};
