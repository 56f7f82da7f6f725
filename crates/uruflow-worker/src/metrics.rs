//! System metrics collection

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use uruflow_protocol::message::SystemMetrics;

/// Metrics collection failures
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("metrics collection failed: {0}")]
    Collect(String),
}

/// A snapshot of host-level metrics
#[derive(Debug, Clone, Default)]
pub struct SystemSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub disk_percent: f64,
    pub disk_used: u64,
    pub disk_total: u64,
    pub load_avg: [f64; 3],
    /// Seconds since boot
    pub uptime: i64,
}

impl From<SystemSnapshot> for SystemMetrics {
    fn from(s: SystemSnapshot) -> Self {
        Self {
            cpu_percent: s.cpu_percent,
            memory_percent: s.memory_percent,
            memory_used: s.memory_used,
            memory_total: s.memory_total,
            disk_percent: s.disk_percent,
            disk_used: s.disk_used,
            disk_total: s.disk_total,
            load_avg: s.load_avg,
            uptime: s.uptime,
        }
    }
}

/// Source of host metrics for the periodic push
#[async_trait]
pub trait SystemProbe: Send + Sync {
    async fn collect(&self) -> Result<SystemSnapshot, ProbeError>;
}

/// Probe backed by the `sysinfo` crate
pub struct SysinfoProbe {
    system: Mutex<sysinfo::System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SystemProbe for SysinfoProbe {
    async fn collect(&self) -> Result<SystemSnapshot, ProbeError> {
        let mut snapshot = SystemSnapshot::default();

        {
            let mut system = self.system.lock().await;
            system.refresh_cpu_usage();
            system.refresh_memory();

            // CPU usage is a delta against the previous refresh; the very
            // first collection reports 0.
            snapshot.cpu_percent = system.global_cpu_usage() as f64;
            snapshot.memory_used = system.used_memory();
            snapshot.memory_total = system.total_memory();
            if snapshot.memory_total > 0 {
                snapshot.memory_percent =
                    snapshot.memory_used as f64 / snapshot.memory_total as f64 * 100.0;
            }
        }

        let disks = sysinfo::Disks::new_with_refreshed_list();
        let root = disks
            .list()
            .iter()
            .find(|d| d.mount_point() == std::path::Path::new("/"))
            .or_else(|| disks.list().first());
        if let Some(disk) = root {
            snapshot.disk_total = disk.total_space();
            snapshot.disk_used = disk.total_space().saturating_sub(disk.available_space());
            if snapshot.disk_total > 0 {
                snapshot.disk_percent =
                    snapshot.disk_used as f64 / snapshot.disk_total as f64 * 100.0;
            }
        }

        let load = sysinfo::System::load_average();
        snapshot.load_avg = [load.one, load.five, load.fifteen];
        snapshot.uptime = sysinfo::System::uptime() as i64;

        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collect_produces_plausible_values() {
        let probe = SysinfoProbe::new();
        let snapshot = probe.collect().await.unwrap();

        assert!(snapshot.memory_total > 0);
        assert!(snapshot.memory_used <= snapshot.memory_total);
        assert!((0.0..=100.0).contains(&snapshot.memory_percent));
        assert!(snapshot.uptime >= 0);
    }

    #[test]
    fn test_snapshot_to_wire_metrics() {
        let snapshot = SystemSnapshot {
            cpu_percent: 12.5,
            memory_percent: 50.0,
            memory_used: 8,
            memory_total: 16,
            load_avg: [0.5, 0.4, 0.3],
            ..Default::default()
        };
        let wire: SystemMetrics = snapshot.into();
        assert_eq!(wire.cpu_percent, 12.5);
        assert_eq!(wire.load_avg, [0.5, 0.4, 0.3]);
    }
}
