//! Three-tier traffic limiter (spec §4.H): provider, then user, then
//! instance, evaluated in that precedence order on a fixed period and
//! opportunistically after each sync.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleet_utils::{retry_with_backoff, InstanceId, ProviderId, TaskId, UserId};
use tracing::{info, warn};

use crate::db::models::{Instance, Provider, TaskType, TrafficLimitReason};
use crate::db::Storage;
use crate::error::StorageError;
use crate::tasks::TaskEngine;

use super::aggregate::{aggregate_segments, SegmentedUsage};

/// Generates a process-unique task id. Storage's `insert_task` is an
/// upsert keyed by id rather than an auto-increment, so anything that
/// enqueues a task outside the API layer needs its own id source; a
/// counter seeded from wall-clock nanoseconds keeps ids roughly
/// time-ordered without a round-trip to storage.
fn fresh_task_id() -> TaskId {
    static COUNTER: AtomicI64 = AtomicI64::new(1);
    let base = Utc::now().timestamp_millis();
    let offset = COUNTER.fetch_add(1, Ordering::Relaxed);
    TaskId(base.wrapping_mul(1000).wrapping_add(offset))
}

pub struct Limiter {
    storage: Arc<dyn Storage>,
    tasks: Arc<TaskEngine>,
}

impl Limiter {
    pub fn new(storage: Arc<dyn Storage>, tasks: Arc<TaskEngine>) -> Self {
        Self { storage, tasks }
    }

    /// One evaluation pass over every provider, applying the three tiers
    /// highest-precedence first. Returns the number of stop tasks enqueued.
    pub async fn evaluate(&self, now: DateTime<Utc>) -> Result<u32, StorageError> {
        let mut enqueued = 0;
        for provider in self.storage.list_providers().await? {
            enqueued += self.evaluate_provider(&provider, now).await?;
        }
        Ok(enqueued)
    }

    async fn monthly_usage_mb(&self, instance_id: InstanceId, provider: &Provider, now: DateTime<Utc>) -> Result<f64, StorageError> {
        let from = now - chrono::Duration::days(30);
        let records = self.storage.list_traffic_records(instance_id, from, now).await?;
        let usage: SegmentedUsage = aggregate_segments(&records);
        Ok(usage.total_mb(provider.traffic_count_mode, provider.traffic_multiplier))
    }

    /// Sums monthly usage across every instance a user owns, the same way
    /// the provider tier sums across a provider's instances — `used_traffic_mb`
    /// is never written by the sync pass, so it can't be read here (spec §4.H).
    async fn user_monthly_usage_mb(&self, user_id: UserId, now: DateTime<Utc>) -> Result<f64, StorageError> {
        let instances = self.storage.list_instances_by_user(user_id, false).await?;
        let mut total = 0.0;
        for instance in instances {
            let provider = self.storage.get_provider(instance.provider_id).await?;
            total += self.monthly_usage_mb(instance.id, &provider, now).await?;
        }
        Ok(total)
    }

    async fn evaluate_provider(&self, provider: &Provider, now: DateTime<Utc>) -> Result<u32, StorageError> {
        let instances = self.storage.list_instances_by_provider(provider.id, false).await?;
        let mut enqueued = 0;

        let mut provider_usage_mb = 0.0;
        for instance in &instances {
            provider_usage_mb += self.monthly_usage_mb(instance.id, provider, now).await?;
        }

        let provider_over = provider.enable_traffic_control
            && provider.max_traffic_mb > 0.0
            && provider_usage_mb >= provider.max_traffic_mb;

        if provider_over != provider.traffic_limited {
            let mut updated = provider.clone();
            updated.traffic_limited = provider_over;
            self.storage.update_provider(updated).await?;
            info!(provider = %provider.name, limited = provider_over, "provider traffic limit state changed");
        }

        if !provider.enable_traffic_control {
            self.clear_instance_limits_for_disabled_provider(provider.id).await?;
        }

        for instance in instances {
            enqueued += self
                .evaluate_instance(instance, provider, provider_over, now)
                .await?;
        }
        Ok(enqueued)
    }

    async fn evaluate_instance(
        &self,
        mut instance: Instance,
        provider: &Provider,
        provider_over: bool,
        now: DateTime<Utc>,
    ) -> Result<u32, StorageError> {
        let mut enqueued = 0;
        let usage_mb = self.monthly_usage_mb(instance.id, provider, now).await?;

        if provider_over {
            if instance.traffic_limit_reason != Some(TrafficLimitReason::Provider) {
                instance.traffic_limit_reason = Some(TrafficLimitReason::Provider);
                instance.traffic_limited = true;
                self.storage.update_instance(instance.clone()).await?;
                self.enqueue_stop(&instance, provider).await?;
                enqueued += 1;
            }
            return Ok(enqueued);
        }
        if !provider_over && instance.traffic_limit_reason == Some(TrafficLimitReason::Provider) {
            instance.traffic_limit_reason = None;
            instance.traffic_limited = false;
            self.storage.update_instance(instance.clone()).await?;
        }

        let user = self.storage.get_user(instance.user_id).await?;
        let user_usage_mb = self.user_monthly_usage_mb(instance.user_id, now).await?;
        let user_over = user.total_traffic_mb > 0.0 && user_usage_mb >= user.total_traffic_mb;
        if user_over {
            if instance.traffic_limit_reason.is_none() {
                instance.traffic_limit_reason = Some(TrafficLimitReason::User);
                instance.traffic_limited = true;
                self.storage.update_instance(instance.clone()).await?;
                self.enqueue_stop(&instance, provider).await?;
                enqueued += 1;
            }
            return Ok(enqueued);
        }
        if instance.traffic_limit_reason == Some(TrafficLimitReason::User) {
            instance.traffic_limit_reason = None;
            instance.traffic_limited = false;
            self.storage.update_instance(instance.clone()).await?;
        }

        let instance_over =
            provider.enable_traffic_control && instance.max_traffic_mb > 0.0 && usage_mb >= instance.max_traffic_mb;
        if instance_over && instance.traffic_limit_reason.is_none() {
            instance.traffic_limit_reason = Some(TrafficLimitReason::Instance);
            instance.traffic_limited = true;
            self.storage.update_instance(instance.clone()).await?;
            self.enqueue_stop(&instance, provider).await?;
            enqueued += 1;
        } else if !instance_over && instance.traffic_limit_reason == Some(TrafficLimitReason::Instance) {
            instance.traffic_limit_reason = None;
            instance.traffic_limited = false;
            self.storage.update_instance(instance.clone()).await?;
        }
        Ok(enqueued)
    }

    /// Immediately unlimits any instance-reason-limited instance on a
    /// provider that just had traffic control turned off (spec §4.H).
    pub async fn clear_instance_limits_for_disabled_provider(&self, provider_id: ProviderId) -> Result<(), StorageError> {
        for mut instance in self.storage.list_instances_by_provider(provider_id, false).await? {
            if instance.traffic_limit_reason == Some(TrafficLimitReason::Instance) {
                instance.traffic_limit_reason = None;
                instance.traffic_limited = false;
                self.storage.update_instance(instance).await?;
            }
        }
        Ok(())
    }

    /// Frozen providers refuse new tasks (spec §9 open question:
    /// "provider freeze refuses new tasks only") — tasks already queued or
    /// running are left alone, so this is enforced here, at the point a
    /// brand-new task would be created, rather than at dispatch time.
    async fn enqueue_stop(&self, instance: &Instance, provider: &Provider) -> Result<(), StorageError> {
        if provider.is_frozen {
            warn!(instance = %instance.name, "provider is frozen, not enqueuing stop task");
            return Ok(());
        }
        let task = crate::db::models::Task::new(
            fresh_task_id(),
            instance.user_id,
            provider.id,
            Some(instance.id),
            TaskType::Stop,
            serde_json::json!({}),
            60,
            false,
            Utc::now(),
        );
        retry_with_backoff(|| self.storage.insert_task(task.clone())).await?;
        self.tasks.trigger();
        warn!(instance = %instance.name, "traffic limit exceeded, stop enqueued");
        Ok(())
    }
}
