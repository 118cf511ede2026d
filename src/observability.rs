use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub requests: u64,
    pub quota_rejected: u64,
    pub no_channel: u64,
    pub upstream_failures: u64,
    pub tasks_created: u64,
    pub settlements: u64,
    pub releases: u64,
    pub refunds: u64,
    pub payments_confirmed: u64,
    pub payments_rejected: u64,
}

/// Process-wide counters shared by the relay, ledger and payment paths.
#[derive(Debug, Default)]
pub struct Observability {
    requests: AtomicU64,
    quota_rejected: AtomicU64,
    no_channel: AtomicU64,
    upstream_failures: AtomicU64,
    tasks_created: AtomicU64,
    settlements: AtomicU64,
    releases: AtomicU64,
    refunds: AtomicU64,
    payments_confirmed: AtomicU64,
    payments_rejected: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Observability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        bump(&self.requests);
    }

    pub fn record_quota_rejected(&self) {
        bump(&self.quota_rejected);
    }

    pub fn record_no_channel(&self) {
        bump(&self.no_channel);
    }

    pub fn record_upstream_failure(&self) {
        bump(&self.upstream_failures);
    }

    pub fn record_task_created(&self) {
        bump(&self.tasks_created);
    }

    pub fn record_settlement(&self) {
        bump(&self.settlements);
    }

    pub fn record_release(&self) {
        bump(&self.releases);
    }

    pub fn record_refund(&self) {
        bump(&self.refunds);
    }

    pub fn record_payment_confirmed(&self) {
        bump(&self.payments_confirmed);
    }

    pub fn record_payment_rejected(&self) {
        bump(&self.payments_rejected);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ObservabilitySnapshot {
            requests: load(&self.requests),
            quota_rejected: load(&self.quota_rejected),
            no_channel: load(&self.no_channel),
            upstream_failures: load(&self.upstream_failures),
            tasks_created: load(&self.tasks_created),
            settlements: load(&self.settlements),
            releases: load(&self.releases),
            refunds: load(&self.refunds),
            payments_confirmed: load(&self.payments_confirmed),
            payments_rejected: load(&self.payments_rejected),
        }
    }
}
