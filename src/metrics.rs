//! Prometheus metrics for provisioning, sessions and the control channel
//!
//! All metrics live in the default registry. `gather_text()` renders them in
//! the text exposition format.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter_vec, Encoder, Histogram, IntCounterVec, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Provisioning
    // ─────────────────────────────────────────────────────────────────────────────

    /// Bytes downloaded per artifact.
    ///
    /// Labels:
    /// - artifact: "hypervisor", "disk_image", "kernel", "initrd", "firmware_code", "firmware_vars"
    pub static ref DOWNLOAD_BYTES: IntCounterVec = register_int_counter_vec!(
        "sandvisor_download_bytes_total",
        "Bytes downloaded while provisioning runtime artifacts",
        &["artifact"]
    ).expect("failed to register DOWNLOAD_BYTES metric");

    /// Time for a full ensure_ready() pass that had work to do
    pub static ref PROVISION_DURATION: Histogram = register_histogram!(
        "sandvisor_provision_duration_seconds",
        "Time spent provisioning the hypervisor runtime",
        vec![0.1, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    ).expect("failed to register PROVISION_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // VM Lifecycle
    // ─────────────────────────────────────────────────────────────────────────────

    /// Time from spawn request to a running hypervisor process
    pub static ref VM_LAUNCH_DURATION: Histogram = register_histogram!(
        "sandvisor_vm_launch_duration_seconds",
        "Time to spawn the hypervisor for a session",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    ).expect("failed to register VM_LAUNCH_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Control Channel
    // ─────────────────────────────────────────────────────────────────────────────

    /// Permission exchanges by outcome.
    ///
    /// Labels:
    /// - side: "host" or "guest"
    /// - outcome: "allow", "deny", "timeout", "aborted"
    pub static ref PERMISSION_DECISIONS: IntCounterVec = register_int_counter_vec!(
        "sandvisor_permission_decisions_total",
        "Permission requests by resolution",
        &["side", "outcome"]
    ).expect("failed to register PERMISSION_DECISIONS metric");

    /// File transfers by direction and outcome.
    ///
    /// Labels:
    /// - direction: "inbound_sync", "push", "outbound_sync"
    /// - outcome: "written", "abandoned", "expired", "rejected", "skipped"
    pub static ref FILE_TRANSFERS: IntCounterVec = register_int_counter_vec!(
        "sandvisor_file_transfers_total",
        "File transfers over the control channel",
        &["direction", "outcome"]
    ).expect("failed to register FILE_TRANSFERS metric");

    /// Requests handled by the guest daemon.
    ///
    /// Labels:
    /// - outcome: "success", "error", "duplicate"
    pub static ref DAEMON_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "sandvisor_daemon_requests_total",
        "Agent requests processed by the guest daemon",
        &["outcome"]
    ).expect("failed to register DAEMON_REQUESTS metric");

    /// Tool calls seen by the guest tool gate.
    ///
    /// Labels:
    /// - decision: "allow", "deny", "confirm_delete", "confirm_boundary", "ask_user", "blocked"
    pub static ref TOOL_GATE_DECISIONS: IntCounterVec = register_int_counter_vec!(
        "sandvisor_tool_gate_decisions_total",
        "Tool calls by safety-policy classification",
        &["decision"]
    ).expect("failed to register TOOL_GATE_DECISIONS metric");
}

/// Render every registered metric in the Prometheus text format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!(error = %e, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_registered_metric() {
        PERMISSION_DECISIONS.with_label_values(&["host", "deny"]).inc();
        let text = gather_text();
        assert!(text.contains("sandvisor_permission_decisions_total"));
    }
}
