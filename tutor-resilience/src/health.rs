//! Health probes for the four stateful dependencies plus host resources
//! (`spec.md` §4.7): measure, compare to a threshold, and return a status
//! plus the issues that produced it, with literal two-absolute-threshold
//! semantics (warn at 80% of capacity, critical at 90%).

use std::sync::Arc;
use sysinfo::{Disks, System};
use tutor_inference::InferenceEngine;
use tutor_storage::{MetadataStore, VectorStore};

/// The outcome of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProbeStatus {
    Ok,
    Warn,
    Critical,
}

/// One named probe's result and, for warn/critical, a human-readable reason.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub name: &'static str,
    pub status: ProbeStatus,
    pub detail: Option<String>,
}

/// All probes run in one pass (`spec.md` §4.7's five checks: InferenceEngine,
/// VectorStore, MetadataStore, disk, RAM).
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub probes: Vec<ProbeResult>,
}

impl HealthReport {
    /// The worst status across all probes, for a single ok/warn/critical
    /// summary.
    #[must_use]
    pub fn overall(&self) -> ProbeStatus {
        self.probes
            .iter()
            .map(|p| p.status)
            .max()
            .unwrap_or(ProbeStatus::Ok)
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.overall() == ProbeStatus::Ok
    }

    #[must_use]
    pub fn probe(&self, name: &str) -> Option<&ProbeResult> {
        self.probes.iter().find(|p| p.name == name)
    }
}

const WARN_FRACTION: f32 = 0.8;
const CRITICAL_FRACTION: f32 = 0.9;

fn classify(used_fraction: f32) -> ProbeStatus {
    if used_fraction >= CRITICAL_FRACTION {
        ProbeStatus::Critical
    } else if used_fraction >= WARN_FRACTION {
        ProbeStatus::Warn
    } else {
        ProbeStatus::Ok
    }
}

/// Runs the five probes `spec.md` §4.7 names against the node's live
/// dependencies.
pub struct HealthChecker {
    inference: Arc<dyn InferenceEngine>,
    vector_store: Arc<dyn VectorStore>,
    metadata_store: Arc<MetadataStore>,
    /// The filesystem path backups and the databases live under, for the
    /// disk-usage probe.
    data_dir: std::path::PathBuf,
}

impl HealthChecker {
    #[must_use]
    pub fn new(
        inference: Arc<dyn InferenceEngine>,
        vector_store: Arc<dyn VectorStore>,
        metadata_store: Arc<MetadataStore>,
        data_dir: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            inference,
            vector_store,
            metadata_store,
            data_dir: data_dir.into(),
        }
    }

    /// Runs every probe. No single probe's failure stops the others from
    /// running.
    pub async fn check_all(&self) -> HealthReport {
        HealthReport {
            probes: vec![
                self.probe_inference().await,
                self.probe_vector_store().await,
                self.probe_metadata_store().await,
                self.probe_disk(),
                self.probe_ram(),
            ],
        }
    }

    async fn probe_inference(&self) -> ProbeResult {
        let healthy = self.inference.health().await;
        ProbeResult {
            name: "inference_engine",
            status: if healthy { ProbeStatus::Ok } else { ProbeStatus::Critical },
            detail: (!healthy).then(|| format!("model {} reported unhealthy", self.inference.model_id())),
        }
    }

    async fn probe_vector_store(&self) -> ProbeResult {
        match self.vector_store.health_check().await {
            Ok(()) => ProbeResult {
                name: "vector_store",
                status: ProbeStatus::Ok,
                detail: None,
            },
            Err(e) => ProbeResult {
                name: "vector_store",
                status: ProbeStatus::Critical,
                detail: Some(e.to_string()),
            },
        }
    }

    async fn probe_metadata_store(&self) -> ProbeResult {
        match self.metadata_store.health_check().await {
            Ok(()) => ProbeResult {
                name: "metadata_store",
                status: ProbeStatus::Ok,
                detail: None,
            },
            Err(e) => ProbeResult {
                name: "metadata_store",
                status: ProbeStatus::Critical,
                detail: Some(e.to_string()),
            },
        }
    }

    fn probe_disk(&self) -> ProbeResult {
        let disks = Disks::new_with_refreshed_list();
        let Some(disk) = disks
            .iter()
            .filter(|d| self.data_dir.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
        else {
            return ProbeResult {
                name: "disk",
                status: ProbeStatus::Ok,
                detail: Some("no matching mount point found; skipped".into()),
            };
        };
        let total = disk.total_space();
        let used = total.saturating_sub(disk.available_space());
        #[allow(clippy::cast_precision_loss)]
        let fraction = if total == 0 { 0.0 } else { used as f32 / total as f32 };
        let status = classify(fraction);
        ProbeResult {
            name: "disk",
            detail: (status != ProbeStatus::Ok).then(|| format!("{:.1}% of disk used", fraction * 100.0)),
            status,
        }
    }

    fn probe_ram(&self) -> ProbeResult {
        let mut system = System::new();
        system.refresh_memory();
        let total = system.total_memory();
        let used = system.used_memory();
        #[allow(clippy::cast_precision_loss)]
        let fraction = if total == 0 { 0.0 } else { used as f32 / total as f32 };
        let status = classify(fraction);
        ProbeResult {
            name: "ram",
            detail: (status != ProbeStatus::Ok).then(|| format!("{:.1}% of RAM used", fraction * 100.0)),
            status,
        }
    }
}
