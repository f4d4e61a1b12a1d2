use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::config::BankSettings;

// Atomic token bucket with capacity 1.0, refilled at `rate` tokens/sec.
// Returns {allowed, wait_seconds}; the wait is serialized as a string so
// fractional seconds survive the Lua-to-protocol integer conversion.
const TOKEN_BUCKET_LUA: &str = r#"
local key = KEYS[1]
local now_ms = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local capacity = 1.0

local tokens = tonumber(redis.call("HGET", key, "tokens"))
local ts_ms = tonumber(redis.call("HGET", key, "ts_ms"))

if tokens == nil then
  tokens = capacity
end
if ts_ms == nil then
  ts_ms = now_ms
end

local elapsed = math.max(0, now_ms - ts_ms) / 1000.0
tokens = math.min(capacity, tokens + elapsed * rate)

if tokens >= cost then
  tokens = tokens - cost
  redis.call("HSET", key, "tokens", tokens, "ts_ms", now_ms)
  return {1, "0"}
end

local wait_seconds = (cost - tokens) / rate
redis.call("HSET", key, "tokens", tokens, "ts_ms", now_ms)
return {0, tostring(wait_seconds)}
"#;

/// Raised when the limiter backend cannot answer; the gateway treats this
/// as fail-open and proceeds without limiting.
#[derive(Debug, Error)]
#[error("rate limiter unavailable: {0}")]
pub struct RateLimiterUnavailable(pub String);

/// Outcome of a successful token acquisition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquireResult {
    /// Total time spent waiting for tokens.
    pub wait_seconds: f64,
    /// Number of sleep rounds before a token was granted.
    pub wait_events: u32,
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Blocks until `cost` tokens are available.
    async fn acquire(&self, cost: f64) -> Result<AcquireResult, RateLimiterUnavailable>;
}

/// Limiter used when outbound rate limiting is disabled.
pub struct NoopRateLimiter;

#[async_trait]
impl RateLimiter for NoopRateLimiter {
    async fn acquire(&self, _cost: f64) -> Result<AcquireResult, RateLimiterUnavailable> {
        Ok(AcquireResult {
            wait_seconds: 0.0,
            wait_events: 0,
        })
    }
}

/// Token-bucket limiter shared across worker processes through redis.
pub struct RedisTokenBucketRateLimiter {
    client: redis::Client,
    key: String,
    max_rps: f64,
    script: redis::Script,
}

impl RedisTokenBucketRateLimiter {
    pub fn new(client: redis::Client, key: String, max_rps: f64) -> Self {
        debug_assert!(max_rps > 0.0);
        Self {
            client,
            key,
            max_rps,
            script: redis::Script::new(TOKEN_BUCKET_LUA),
        }
    }
}

#[async_trait]
impl RateLimiter for RedisTokenBucketRateLimiter {
    async fn acquire(&self, cost: f64) -> Result<AcquireResult, RateLimiterUnavailable> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RateLimiterUnavailable(e.to_string()))?;

        let mut wait_total = 0.0;
        let mut wait_events = 0u32;

        loop {
            let now_ms = Utc::now().timestamp_millis();
            let (allowed, wait_seconds): (i64, f64) = self
                .script
                .key(&self.key)
                .arg(now_ms)
                .arg(self.max_rps)
                .arg(cost)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| RateLimiterUnavailable(e.to_string()))?;

            let wait_seconds = wait_seconds.max(0.0);
            if allowed == 1 {
                return Ok(AcquireResult {
                    wait_seconds: wait_total,
                    wait_events,
                });
            }

            wait_events += 1;
            wait_total += wait_seconds;
            if wait_seconds > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(wait_seconds)).await;
            }
        }
    }
}

/// Builds the limiter configured for the bank gateway. A zero `max_rps`
/// disables limiting, and an unreachable backend degrades to no-op with a
/// warning; limiter trouble must never fail a transfer.
pub async fn build_rate_limiter(bank: &BankSettings) -> Box<dyn RateLimiter> {
    if bank.max_rps <= 0.0 {
        return Box::new(NoopRateLimiter);
    }

    let client = match redis::Client::open(bank.rate_limit_backend_url.as_str()) {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!(
                event = "rate_limiter_disabled",
                reason = "invalid_backend_url",
                error = %e,
                "rate limiter backend misconfigured, proceeding without limiting"
            );
            return Box::new(NoopRateLimiter);
        }
    };

    match client.get_multiplexed_async_connection().await {
        Ok(mut conn) => {
            let ping: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
            if let Err(e) = ping {
                tracing::warn!(
                    event = "rate_limiter_disabled",
                    reason = "backend_unavailable",
                    error = %e,
                    "rate limiter backend not responding, proceeding without limiting"
                );
                return Box::new(NoopRateLimiter);
            }
        }
        Err(e) => {
            tracing::warn!(
                event = "rate_limiter_disabled",
                reason = "backend_unavailable",
                error = %e,
                "rate limiter backend unreachable, proceeding without limiting"
            );
            return Box::new(NoopRateLimiter);
        }
    }

    Box::new(RedisTokenBucketRateLimiter::new(
        client,
        bank.rate_limit_key.clone(),
        bank.max_rps,
    ))
}
