//! Point-in-time status of a queue and its worker.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use deferq_queue::{PartitionDepths, QueueStore};
use serde::Serialize;

use crate::heartbeat::Heartbeat;
use crate::lease::WorkerLease;
use crate::process::is_process_running;

/// Lease holder as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub alive: bool,
}

/// Everything `deferq status` reports.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub base_dir: PathBuf,
    pub worker: Option<WorkerStatus>,
    pub heartbeat: Option<Heartbeat>,
    pub heartbeat_age_secs: Option<u64>,
    pub depths: PartitionDepths,
    pub counters: BTreeMap<&'static str, u64>,
}

impl StatusReport {
    /// Read-only snapshot; never modifies the lease or heartbeat.
    pub fn collect(store: &QueueStore) -> Self {
        let layout = store.layout();
        let worker = WorkerLease::new(layout.lease_file())
            .holder()
            .map(|record| WorkerStatus {
                pid: record.pid,
                acquired_at: record.acquired_at,
                alive: is_process_running(record.pid),
            });
        let heartbeat = Heartbeat::read(&layout.heartbeat_file());
        let heartbeat_age_secs = heartbeat.as_ref().map(|hb| hb.age().as_secs());

        Self {
            base_dir: layout.base().to_path_buf(),
            worker,
            heartbeat,
            heartbeat_age_secs,
            depths: store.depths(),
            counters: store.counters().snapshot(),
        }
    }

    /// A worker holds the lease and its process exists.
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| w.alive)
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Base directory: {}", self.base_dir.display())?;

        match &self.worker {
            Some(w) if w.alive => writeln!(
                f,
                "Worker: RUNNING (PID: {}, since {})",
                w.pid,
                w.acquired_at.to_rfc3339()
            )?,
            Some(w) => writeln!(f, "Worker: STALE LEASE (PID {} is gone)", w.pid)?,
            None => writeln!(f, "Worker: NOT RUNNING")?,
        }

        match (&self.heartbeat, self.heartbeat_age_secs) {
            (Some(hb), Some(age)) => writeln!(
                f,
                "Heartbeat: {}s ago (pid {}, iteration {}, pending {}, in-flight {})",
                age, hb.pid, hb.iteration, hb.queue_depth, hb.in_flight
            )?,
            _ => writeln!(f, "Heartbeat: none")?,
        }

        let d = &self.depths;
        writeln!(
            f,
            "Queue: pending={} in-flight={} completed={} failed={} quarantine={}",
            d.pending, d.in_flight, d.completed, d.failed, d.quarantine
        )?;

        let counters: Vec<String> = self
            .counters
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        write!(f, "Counters: {}", counters.join(" "))
    }
}
