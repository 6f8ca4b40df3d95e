//! Traffic accounting: periodic collection from each provider's
//! `pmacct` counters, reset-segmented aggregation, and the three-tier
//! limiter (spec §4.H).

pub mod aggregate;
pub mod limiter;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{error, info, warn};

use crate::context::{Clock, ShutdownContext};
use crate::db::models::PmacctTrafficRecord;
use crate::db::Storage;
use crate::error::TransportError;
use crate::registry::Registry;
use crate::transport::ssh::SshSession;

pub use limiter::Limiter;

const COLLECTION_INTERVAL: Duration = Duration::from_secs(5 * 60);
const LIMIT_EVAL_INTERVAL: Duration = Duration::from_secs(60);
/// How often the retention janitor sweeps (spec §4.H retention).
const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
/// Raw `pmacct_traffic_records` rows older than this are no longer needed —
/// every tier's monthly usage only ever looks back 30 days.
const RETENTION_DAYS: i64 = 90;

/// One class entry from `pmacct -s -O json -c class`: per-interface byte
/// counters tagged by class name, which this accounting layout sets to the
/// instance name (`pmacctd`'s `aggregate=class` mode with a
/// `pre_tag_map` assigning one class per veth/VMID).
#[derive(Debug, Deserialize)]
struct PmacctClassEntry {
    class: String,
    bytes: i64,
    #[serde(default)]
    packets: i64,
}

/// Parses one sample of `pmacct -s` JSON output, returning `(instance_name,
/// cumulative_bytes)` pairs summed by class across however many flow rows
/// pmacct reported for that class this poll.
fn parse_pmacct_json(raw: &str) -> Vec<(String, i64)> {
    let entries: Vec<PmacctClassEntry> = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "failed to parse pmacct output");
            return Vec::new();
        }
    };
    let mut totals: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
    for entry in entries {
        if entry.packets == 0 && entry.bytes == 0 {
            continue;
        }
        *totals.entry(entry.class).or_insert(0) += entry.bytes;
    }
    totals.into_iter().collect()
}

pub struct Collector {
    storage: Arc<dyn Storage>,
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
    shutdown: ShutdownContext,
    limiter: Arc<Limiter>,
}

impl Collector {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<Registry>,
        clock: Arc<dyn Clock>,
        shutdown: ShutdownContext,
        limiter: Arc<Limiter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            registry,
            clock,
            shutdown,
            limiter,
        })
    }

    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run().await })
    }

    async fn run(self: Arc<Self>) {
        let mut collection_tick = tokio::time::interval(COLLECTION_INTERVAL);
        let mut limit_tick = tokio::time::interval(LIMIT_EVAL_INTERVAL);
        let mut retention_tick = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = collection_tick.tick() => {
                    if let Err(e) = self.collect_all().await {
                        error!(error = %e, "traffic collection pass failed");
                    }
                }
                _ = limit_tick.tick() => {
                    match self.limiter.evaluate(self.clock.now()).await {
                        Ok(n) if n > 0 => tracing::info!(stops_enqueued = n, "traffic limiter enqueued stops"),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "traffic limit evaluation failed"),
                    }
                }
                _ = retention_tick.tick() => self.run_retention_sweep().await,
            }
        }
    }

    /// Prunes raw traffic rows past the retention window (spec §4.H).
    async fn run_retention_sweep(&self) {
        let cutoff = self.clock.now() - chrono::Duration::days(RETENTION_DAYS);
        match self.storage.delete_traffic_records_older_than(cutoff).await {
            Ok(deleted) if deleted > 0 => info!(deleted, "pruned traffic records past retention window"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "traffic retention sweep failed"),
        }
    }

    async fn collect_all(&self) -> Result<(), crate::error::StorageError> {
        for provider in self.storage.list_providers().await? {
            if !provider.enable_traffic_control {
                continue;
            }
            if let Err(e) = self.collect_provider(provider.id).await {
                warn!(provider_id = ?provider.id, error = %e, "failed to collect traffic for provider");
            }
        }
        Ok(())
    }

    async fn collect_provider(&self, provider_id: fleet_utils::ProviderId) -> Result<(), crate::error::AdapterError> {
        let Some(adapter) = self.registry.get(provider_id) else {
            return Ok(());
        };
        let session = self.session_for(provider_id).await?;
        let raw = session.exec("pmacct -s -O json -c class 2>/dev/null").await?;
        if !raw.success() {
            return Ok(());
        }
        let samples = parse_pmacct_json(&raw.stdout);
        let instances = adapter.list_instances().await?;
        let now = self.clock.now();
        for summary in instances {
            let Some((_, bytes)) = samples.iter().find(|(name, _)| *name == summary.name) else {
                continue;
            };
            if let Ok(Some(instance)) = self
                .storage
                .find_instance_by_name(provider_id, &summary.name)
                .await
            {
                let record = PmacctTrafficRecord::new(instance.id, provider_id, instance.user_id, now, *bytes, 0);
                self.storage.insert_traffic_record(record).await?;
            }
        }
        Ok(())
    }

    async fn session_for(&self, provider_id: fleet_utils::ProviderId) -> Result<SshSession, TransportError> {
        let provider = self
            .storage
            .get_provider(provider_id)
            .await
            .map_err(|e| TransportError::SshSession(e.to_string()))?;
        // Reuses the same pooled connection an adapter or health check would
        // dial for this host (spec §4.B grounding note): the pool key is the
        // credential tuple, not the caller.
        self.registry
            .ssh_pool()
            .acquire(crate::transport::ssh::SshCredentials {
                host: provider.endpoint.split(':').next().unwrap_or(&provider.endpoint),
                port: provider.ssh_port,
                username: &provider.username,
                password: provider.password.as_deref(),
                private_key: provider.ssh_private_key.as_deref(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pmacct_class_json_summing_by_class() {
        let raw = r#"[
            {"class": "ct01", "bytes": 1000, "packets": 10},
            {"class": "ct01", "bytes": 500, "packets": 5},
            {"class": "ct02", "bytes": 2000, "packets": 20}
        ]"#;
        let mut samples = parse_pmacct_json(raw);
        samples.sort();
        assert_eq!(samples, vec![("ct01".to_string(), 1500), ("ct02".to_string(), 2000)]);
    }

    #[test]
    fn malformed_output_yields_empty_without_panicking() {
        assert!(parse_pmacct_json("not json").is_empty());
    }
}
