use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::BankSettings;
use crate::error::Result;
use crate::gateway::rate_limiter::RateLimiter;
use crate::gateway::retry::{full_jitter_delay, parse_retry_after_seconds};

/// Classified outcome of a bank call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Success,
    /// The bank definitively rejected the transfer; the debit must be
    /// refunded.
    FinalFailure,
    /// The real execution state cannot be inferred; no refund until
    /// reconciliation resolves it.
    Unknown,
}

#[derive(Debug, Clone)]
pub struct TransferResult {
    pub outcome: TransferOutcome,
    pub reference: Option<String>,
    pub error_reason: Option<String>,
    pub retry_after_seconds: Option<f64>,
}

impl TransferResult {
    pub fn succeeded(reference: impl Into<String>) -> Self {
        Self {
            outcome: TransferOutcome::Success,
            reference: Some(reference.into()),
            error_reason: None,
            retry_after_seconds: None,
        }
    }

    pub fn final_failure(
        error_reason: impl Into<String>,
        retry_after_seconds: Option<f64>,
    ) -> Self {
        Self {
            outcome: TransferOutcome::FinalFailure,
            reference: None,
            error_reason: Some(error_reason.into()),
            retry_after_seconds,
        }
    }

    pub fn unknown(error_reason: impl Into<String>) -> Self {
        Self {
            outcome: TransferOutcome::Unknown,
            reference: None,
            error_reason: Some(error_reason.into()),
            retry_after_seconds: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == TransferOutcome::Success
    }

    pub fn is_final_failure(&self) -> bool {
        self.outcome == TransferOutcome::FinalFailure
    }

    pub fn is_unknown(&self) -> bool {
        self.outcome == TransferOutcome::Unknown
    }
}

/// Outbound port to the bank transfer API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransferGateway: Send + Sync {
    /// Executes (or re-executes, deduplicated by `idempotency_key`) a
    /// transfer and classifies the response.
    async fn transfer(
        &self,
        idempotency_key: &str,
        wallet_owner_ref: &str,
        amount: i64,
        transfer_id: i64,
    ) -> Result<TransferResult>;

    /// Queries the current state of a previously attempted transfer.
    async fn query_transfer_status<'a>(
        &self,
        idempotency_key: &str,
        transfer_id: i64,
        reference: Option<&'a str>,
    ) -> Result<TransferResult>;

    /// Whether a status endpoint is configured for reconciliation queries.
    fn can_query_status(&self) -> bool;
}

/// Reqwest-backed gateway with retries, full-jitter backoff and shared
/// rate limiting.
pub struct HttpBankGateway {
    http: reqwest::Client,
    base_url: String,
    max_attempts: u32,
    base_delay: f64,
    max_delay: f64,
    status_url_template: Option<String>,
    limiter: Box<dyn RateLimiter>,
}

impl HttpBankGateway {
    pub fn new(settings: &BankSettings, limiter: Box<dyn RateLimiter>) -> Result<Self> {
        let timeout = Duration::from_secs_f64(settings.timeout_seconds);
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            max_attempts: settings.retry_max_attempts.max(1),
            base_delay: settings.retry_base_delay,
            max_delay: settings.retry_max_delay,
            status_url_template: settings
                .status_url_template
                .as_ref()
                .filter(|t| !t.trim().is_empty())
                .cloned(),
            limiter,
        })
    }

    /// Takes one token before each attempt. Limiter failures are logged and
    /// swallowed: the transfer must proceed either way.
    async fn acquire_rate_limit(&self, idempotency_key: &str, transfer_id: i64) {
        match self.limiter.acquire(1.0).await {
            Ok(result) => {
                let wait_ms = (result.wait_seconds * 1000.0) as i64;
                if wait_ms > 0 {
                    tracing::warn!(
                        event = "bank_rate_limit_wait",
                        transfer_id,
                        idempotency_key,
                        limiter_wait_ms = wait_ms,
                        "waited for outbound rate limit"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    event = "bank_rate_limit_unavailable",
                    transfer_id,
                    idempotency_key,
                    error = %e,
                    "rate limiter unavailable, proceeding without limiting"
                );
            }
        }
    }

    fn compute_retry_delay(&self, attempt: u32, retry_after_seconds: Option<f64>) -> f64 {
        let backoff = full_jitter_delay(attempt, self.base_delay, self.max_delay);
        match retry_after_seconds {
            Some(retry_after) => backoff.max(retry_after),
            None => backoff,
        }
    }

    fn status_url(&self, idempotency_key: &str, reference: Option<&str>) -> Option<String> {
        self.status_url_template.as_ref().map(|template| {
            template
                .replace("{idempotency_key}", idempotency_key)
                .replace("{reference}", reference.unwrap_or(""))
        })
    }
}

#[async_trait]
impl TransferGateway for HttpBankGateway {
    async fn transfer(
        &self,
        idempotency_key: &str,
        wallet_owner_ref: &str,
        amount: i64,
        transfer_id: i64,
    ) -> Result<TransferResult> {
        tracing::info!(
            event = "bank_transfer_request",
            transfer_id,
            idempotency_key,
            wallet_owner_ref,
            amount,
            "sending transfer to bank"
        );

        let url = format!("{}/", self.base_url);
        let payload = serde_json::json!({
            "idempotency_key": idempotency_key,
            "wallet_owner_ref": wallet_owner_ref,
            "amount": amount,
        });

        for attempt in 1..=self.max_attempts {
            self.acquire_rate_limit(idempotency_key, transfer_id).await;

            let response = self
                .http
                .post(&url)
                .header("X-Idempotency-Key", idempotency_key)
                .json(&payload)
                .send()
                .await;

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    if attempt < self.max_attempts {
                        let delay = self.compute_retry_delay(attempt, None);
                        tracing::warn!(
                            event = "bank_transfer_retry",
                            transfer_id,
                            idempotency_key,
                            reason = "network_error",
                            attempt,
                            delay_ms = (delay * 1000.0) as i64,
                            error = %e,
                            "transfer attempt failed, retrying"
                        );
                        sleep_seconds(delay).await;
                        continue;
                    }
                    tracing::warn!(
                        event = "bank_transfer_unknown",
                        transfer_id,
                        idempotency_key,
                        reason = "network_error",
                        "network retries exhausted"
                    );
                    return Ok(TransferResult::unknown("network_error"));
                }
            };

            let http_status = response.status().as_u16();
            tracing::info!(
                event = "bank_transfer_http_response",
                transfer_id,
                idempotency_key,
                http_status,
                "bank responded"
            );

            if http_status == 429 {
                let retry_after = parse_retry_after_seconds(
                    response
                        .headers()
                        .get("Retry-After")
                        .and_then(|v| v.to_str().ok()),
                );
                if attempt < self.max_attempts {
                    let delay = self.compute_retry_delay(attempt, retry_after);
                    tracing::warn!(
                        event = "bank_transfer_retry",
                        transfer_id,
                        idempotency_key,
                        reason = "rate_limited",
                        attempt,
                        retry_after_seconds = retry_after,
                        delay_ms = (delay * 1000.0) as i64,
                        "bank rate limited, retrying"
                    );
                    sleep_seconds(delay).await;
                    continue;
                }
                return Ok(TransferResult::final_failure("rate_limited", retry_after));
            }

            let body = match response.bytes().await {
                Ok(body) => body,
                Err(e) => {
                    if attempt < self.max_attempts {
                        let delay = self.compute_retry_delay(attempt, None);
                        tracing::warn!(
                            event = "bank_transfer_retry",
                            transfer_id,
                            idempotency_key,
                            reason = "network_error",
                            attempt,
                            error = %e,
                            "response body read failed, retrying"
                        );
                        sleep_seconds(delay).await;
                        continue;
                    }
                    return Ok(TransferResult::unknown("network_error"));
                }
            };

            let result = classify_response(http_status, &body, idempotency_key);
            match result.outcome {
                TransferOutcome::Success => tracing::info!(
                    event = "bank_transfer_success",
                    transfer_id,
                    idempotency_key,
                    reference = result.reference.as_deref(),
                    "transfer succeeded"
                ),
                TransferOutcome::FinalFailure => tracing::warn!(
                    event = "bank_transfer_failed",
                    transfer_id,
                    idempotency_key,
                    reason = result.error_reason.as_deref(),
                    "transfer rejected by bank"
                ),
                TransferOutcome::Unknown => tracing::warn!(
                    event = "bank_transfer_unknown",
                    transfer_id,
                    idempotency_key,
                    reason = result.error_reason.as_deref(),
                    "transfer outcome ambiguous"
                ),
            }
            return Ok(result);
        }

        Ok(TransferResult::unknown("retry_exhausted"))
    }

    async fn query_transfer_status<'a>(
        &self,
        idempotency_key: &str,
        transfer_id: i64,
        reference: Option<&'a str>,
    ) -> Result<TransferResult> {
        let Some(url) = self.status_url(idempotency_key, reference) else {
            return Ok(TransferResult::unknown("status_endpoint_not_configured"));
        };

        for attempt in 1..=self.max_attempts {
            self.acquire_rate_limit(idempotency_key, transfer_id).await;

            let response = self
                .http
                .get(&url)
                .header("X-Idempotency-Key", idempotency_key)
                .send()
                .await;

            let response = match response {
                Ok(response) => response,
                Err(_) => {
                    if attempt < self.max_attempts {
                        sleep_seconds(self.compute_retry_delay(attempt, None)).await;
                        continue;
                    }
                    return Ok(TransferResult::unknown("status_query_network_error"));
                }
            };

            let http_status = response.status().as_u16();
            if http_status == 429 {
                let retry_after = parse_retry_after_seconds(
                    response
                        .headers()
                        .get("Retry-After")
                        .and_then(|v| v.to_str().ok()),
                );
                if attempt < self.max_attempts {
                    sleep_seconds(self.compute_retry_delay(attempt, retry_after)).await;
                    continue;
                }
                return Ok(TransferResult::unknown("status_query_rate_limited"));
            }

            let body = match response.bytes().await {
                Ok(body) => body,
                Err(_) => {
                    if attempt < self.max_attempts {
                        sleep_seconds(self.compute_retry_delay(attempt, None)).await;
                        continue;
                    }
                    return Ok(TransferResult::unknown("status_query_network_error"));
                }
            };

            return Ok(classify_response(
                http_status,
                &body,
                reference.unwrap_or(idempotency_key),
            ));
        }

        Ok(TransferResult::unknown("status_query_retry_exhausted"))
    }

    fn can_query_status(&self) -> bool {
        self.status_url_template.is_some()
    }
}

async fn sleep_seconds(seconds: f64) {
    if seconds > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
    }
}

/// Classifies a single non-429 bank response.
///
/// SUCCESS requires a 2xx HTTP status, a body status of 200 and a body state
/// of "success"; an HTTP 5xx is ambiguous (UNKNOWN), everything else is a
/// definitive rejection (FINAL_FAILURE). A body that is not JSON is UNKNOWN:
/// the call may well have been executed.
pub fn classify_response(http_status: u16, body: &[u8], fallback_reference: &str) -> TransferResult {
    let Ok(body_json) = serde_json::from_slice::<Value>(body) else {
        return TransferResult::unknown(format!("invalid_json_response_http_{http_status}"));
    };

    let normalized_status = normalize_body_status(&body_json, http_status);
    let body_state = body_json.get("data").and_then(Value::as_str);
    let http_success = (200..300).contains(&http_status);

    if http_success && normalized_status == 200 && body_state == Some("success") {
        let reference = ["reference", "bank_reference", "transfer_id"]
            .iter()
            .find_map(|field| non_empty_string(body_json.get(field)))
            .unwrap_or_else(|| fallback_reference.to_string());
        return TransferResult::succeeded(reference);
    }

    let failure_reason = non_empty_string(body_json.get("error_reason"))
        .or_else(|| body_state.filter(|s| !s.is_empty()).map(str::to_string))
        .unwrap_or_else(|| format!("upstream_status_{normalized_status}"));

    if http_status >= 500 {
        TransferResult::unknown(failure_reason)
    } else {
        TransferResult::final_failure(failure_reason, None)
    }
}

// The body "status" may be a number, a numeric string, or junk; junk falls
// back to the HTTP status.
fn normalize_body_status(body: &Value, http_status: u16) -> i64 {
    match body.get("status") {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(i64::from(http_status)),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(i64::from(http_status)),
        _ => i64::from(http_status),
    }
}

fn non_empty_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}
