use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs the Prometheus recorder and registers metric descriptions.
/// Must be called once per process, before any counter is touched.
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    describe_counter!(
        "wallet_withdrawals_finalized_total",
        "Withdrawals finalized by the executor, labeled by outcome"
    );
    describe_counter!(
        "wallet_reconciliation_tasks_queued_total",
        "Reconciliation tasks opened for ambiguous withdrawals"
    );
    describe_counter!(
        "wallet_reconciliation_tasks_resolved_total",
        "Reconciliation tasks resolved, labeled by resolution"
    );

    handle
}

pub fn record_withdrawal_finalized(outcome: &str) {
    counter!("wallet_withdrawals_finalized_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn record_reconciliation_queued() {
    counter!("wallet_reconciliation_tasks_queued_total").increment(1);
}

pub fn record_reconciliation_resolved(resolution: &str) {
    counter!("wallet_reconciliation_tasks_resolved_total", "resolution" => resolution.to_string())
        .increment(1);
}
