//! Alert predicates
//!
//! Threshold checks evaluated against incoming metrics, plus the
//! connectivity alerts raised on deregistration. Deduplication against
//! unresolved alerts happens at the call site.

use uruflow_core::id::generate_id;
use uruflow_core::time::now_millis;
use uruflow_core::types::{Alert, AlertSeverity, WorkerId};

/// CPU usage thresholds: warning above 80%, critical above 90%
pub fn check_cpu(worker_id: &WorkerId, worker_name: &str, cpu_percent: f64) -> Option<Alert> {
    if cpu_percent > 90.0 {
        return Some(new_alert(
            worker_id,
            worker_name,
            "high_cpu",
            "CPU usage above 90%",
            AlertSeverity::Critical,
        ));
    }
    if cpu_percent > 80.0 {
        return Some(new_alert(
            worker_id,
            worker_name,
            "high_cpu",
            "CPU usage above 80%",
            AlertSeverity::Warning,
        ));
    }
    None
}

/// Memory usage thresholds: warning above 90%, critical above 95%
pub fn check_memory(worker_id: &WorkerId, worker_name: &str, memory_percent: f64) -> Option<Alert> {
    if memory_percent > 95.0 {
        return Some(new_alert(
            worker_id,
            worker_name,
            "high_memory",
            "Memory usage above 95%",
            AlertSeverity::Critical,
        ));
    }
    if memory_percent > 90.0 {
        return Some(new_alert(
            worker_id,
            worker_name,
            "high_memory",
            "Memory usage above 90%",
            AlertSeverity::Warning,
        ));
    }
    None
}

/// Disk usage thresholds: warning above 85%, critical above 95%
pub fn check_disk(worker_id: &WorkerId, worker_name: &str, disk_percent: f64) -> Option<Alert> {
    if disk_percent > 95.0 {
        return Some(new_alert(
            worker_id,
            worker_name,
            "high_disk",
            "Disk usage above 95%",
            AlertSeverity::Critical,
        ));
    }
    if disk_percent > 85.0 {
        return Some(new_alert(
            worker_id,
            worker_name,
            "high_disk",
            "Disk usage above 85%",
            AlertSeverity::Warning,
        ));
    }
    None
}

/// A managed container is no longer running
pub fn container_down(worker_id: &WorkerId, worker_name: &str, container_name: &str) -> Alert {
    new_alert(
        worker_id,
        worker_name,
        "container_down",
        &format!("Container {container_name} is not running"),
        AlertSeverity::Critical,
    )
}

/// A worker session was deregistered
pub fn worker_offline(worker_id: &WorkerId, worker_name: &str) -> Alert {
    new_alert(
        worker_id,
        worker_name,
        "agent_offline",
        &format!("Worker {worker_name} is offline"),
        AlertSeverity::Critical,
    )
}

fn new_alert(
    worker_id: &WorkerId,
    worker_name: &str,
    kind: &str,
    message: &str,
    severity: AlertSeverity,
) -> Alert {
    Alert {
        id: generate_id(),
        worker_id: worker_id.clone(),
        worker_name: worker_name.to_string(),
        kind: kind.to_string(),
        message: message.to_string(),
        severity,
        resolved: false,
        created_at: now_millis(),
        resolved_at: None,
    }
}
