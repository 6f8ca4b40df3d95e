//! Persistence capability consumed by the rest of the crate.
//!
//! Spec §9 calls for components to take a narrow `DB` capability interface
//! rather than reach for a package-level connection handle. [`Storage`] is
//! that interface: every component depends on `Arc<dyn Storage>`, never on
//! [`pg::PgStorage`] directly. [`memory::InMemoryStorage`] is the test
//! double used by the whole test suite; `pg::PgStorage` is the production
//! diesel/Postgres-backed implementation, grounded on `storage_controller`'s
//! own `diesel + r2d2` persistence stack.

pub mod memory;
pub mod models;
pub mod pg;
pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_utils::{InstanceId, PortId, ProviderId, TaskId, UserId};

use crate::error::StorageError;
use models::*;

pub type StorageResult<T> = Result<T, StorageError>;

/// Everything every other component needs from the relational store. Kept
/// deliberately narrow and free of SQL leakage (no query builders in the
/// signature) so `InMemoryStorage` can implement it exactly.
#[async_trait]
pub trait Storage: Send + Sync {
    // -- providers --
    async fn list_providers(&self) -> StorageResult<Vec<Provider>>;
    async fn get_provider(&self, id: ProviderId) -> StorageResult<Provider>;
    async fn get_provider_by_name(&self, name: &str) -> StorageResult<Provider>;
    async fn update_provider(&self, provider: Provider) -> StorageResult<()>;
    async fn delete_provider(&self, id: ProviderId) -> StorageResult<()>;

    // -- instances --
    async fn get_instance(&self, id: InstanceId) -> StorageResult<Instance>;
    async fn find_instance_by_name(
        &self,
        provider_id: ProviderId,
        name: &str,
    ) -> StorageResult<Option<Instance>>;
    async fn list_instances_by_provider(
        &self,
        provider_id: ProviderId,
        include_deleted: bool,
    ) -> StorageResult<Vec<Instance>>;
    async fn list_instances_by_user(
        &self,
        user_id: UserId,
        include_deleted: bool,
    ) -> StorageResult<Vec<Instance>>;
    async fn insert_instance(&self, instance: Instance) -> StorageResult<()>;
    async fn update_instance(&self, instance: Instance) -> StorageResult<()>;
    async fn soft_delete_instance(&self, id: InstanceId, at: DateTime<Utc>) -> StorageResult<()>;

    // -- ports --
    async fn list_ports(&self, instance_id: InstanceId) -> StorageResult<Vec<Port>>;
    async fn upsert_port(&self, port: Port) -> StorageResult<()>;
    async fn delete_port(&self, id: PortId) -> StorageResult<()>;

    // -- tasks --
    async fn insert_task(&self, task: Task) -> StorageResult<()>;
    async fn get_task(&self, id: TaskId) -> StorageResult<Task>;
    async fn update_task(&self, task: Task) -> StorageResult<()>;
    /// Pending tasks ordered by `created_at` ascending (spec §4.G).
    async fn list_pending_tasks(&self) -> StorageResult<Vec<Task>>;
    async fn list_running_tasks(&self) -> StorageResult<Vec<Task>>;

    // -- traffic --
    async fn insert_traffic_record(&self, record: PmacctTrafficRecord) -> StorageResult<()>;
    /// Raw rows for one instance within `[from, to]`, ordered by timestamp
    /// ascending (ingestion order, per spec §5 ordering guarantee).
    async fn list_traffic_records(
        &self,
        instance_id: InstanceId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<PmacctTrafficRecord>>;
    async fn delete_traffic_records_older_than(&self, cutoff: DateTime<Utc>) -> StorageResult<u64>;

    // -- users --
    async fn get_user(&self, id: UserId) -> StorageResult<User>;
    async fn update_user(&self, user: User) -> StorageResult<()>;

    // -- config reload (§4.K) --
    async fn get_config_settings(&self) -> StorageResult<serde_json::Value>;
}
