//! Centralized cache key construction and TTL policy.
//!
//! Cache keys encode a small protocol shared by every gateway process: the
//! sync and chain checkers publish verified node sets under session-scoped
//! keys, the metrics recorder feeds service-log hashes the cherry-picker
//! reads back, and probe locks elect a single prober fleet-wide. Keeping all
//! constructors and TTLs in one module keeps that protocol auditable.

use std::time::Duration;

/// TTL for cached application and load balancer records.
pub const RECORD_TTL: Duration = Duration::from_secs(60);

/// TTL for per-(chain, node) service-log hashes. Refreshed on every update.
pub const SERVICE_LOG_TTL: Duration = Duration::from_secs(60);

/// TTL for verified (in-sync / chain-checked) node sets.
pub const VERIFIED_SET_TTL: Duration = Duration::from_secs(300);

/// TTL for probe locks. A crashed prober is re-elected after this expires.
pub const PROBE_LOCK_TTL: Duration = Duration::from_secs(60);

/// Service-log hash field: successful relay count.
pub const FIELD_SUCCESS: &str = "success_count";
/// Service-log hash field: failed relay count.
pub const FIELD_FAILURE: &str = "failure_count";
/// Service-log hash field: sum of elapsed relay times, in microseconds.
pub const FIELD_ELAPSED_SUM: &str = "elapsed_sum";
/// Service-log hash field: number of elapsed-time samples.
pub const FIELD_ELAPSED_COUNT: &str = "elapsed_count";

/// Key for a cached application record.
#[must_use]
pub fn application(app_id: &str) -> String {
    format!("app-{app_id}")
}

/// Key for a cached load balancer record.
#[must_use]
pub fn load_balancer(lb_id: &str) -> String {
    format!("lb-{lb_id}")
}

/// Key for the per-(chain, node) service-log hash consumed by the picker.
#[must_use]
pub fn service_log(chain_id: &str, node_public_key: &str) -> String {
    format!("service-{chain_id}-{node_public_key}")
}

/// Key for the cached in-sync node set of one session.
#[must_use]
pub fn synced_nodes(chain_id: &str, session_fingerprint: &str) -> String {
    format!("{chain_id}-{session_fingerprint}")
}

/// Key for the cached chain-id-verified node set of one session.
#[must_use]
pub fn chain_checked_nodes(chain_id: &str, session_fingerprint: &str) -> String {
    format!("{chain_id}-chain-{session_fingerprint}")
}

/// Key for the probe lock guarding the verified set at `key`.
#[must_use]
pub fn probe_lock(key: &str) -> String {
    format!("lock-{key}")
}
