//! In-memory [`Storage`] double used by the whole test suite (unit tests and
//! the `tests/scenarios.rs` integration scenarios) so none of them need a
//! live Postgres instance. Mirrors the locking style `storage_controller`
//! uses for its in-memory scheduler state: one `Mutex` per table, never held
//! across an `.await`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_utils::{InstanceId, PortId, ProviderId, TaskId, UserId};

use crate::error::StorageError;

use super::models::*;
use super::{Storage, StorageResult};

#[derive(Default)]
struct Tables {
    providers: HashMap<ProviderId, Provider>,
    instances: HashMap<InstanceId, Instance>,
    ports: HashMap<PortId, Port>,
    tasks: HashMap<TaskId, Task>,
    traffic: Vec<PmacctTrafficRecord>,
    users: HashMap<UserId, User>,
    config: serde_json::Value,
}

/// A plain `Mutex<Tables>`, not `RwLock`: the tables are small and every
/// access is brief, so a single writer lock keeps this double simple and
/// free of the torn-read hazards a reader/writer split would invite.
pub struct InMemoryStorage {
    tables: Mutex<Tables>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self {
            tables: Mutex::new(Tables {
                config: serde_json::json!({}),
                ..Default::default()
            }),
        }
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: seed a provider row directly, bypassing the trait.
    pub fn seed_provider(&self, provider: Provider) {
        self.tables.lock().unwrap().providers.insert(provider.id, provider);
    }

    pub fn seed_instance(&self, instance: Instance) {
        self.tables.lock().unwrap().instances.insert(instance.id, instance);
    }

    pub fn seed_user(&self, user: User) {
        self.tables.lock().unwrap().users.insert(user.id, user);
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn list_providers(&self) -> StorageResult<Vec<Provider>> {
        let t = self.tables.lock().unwrap();
        let mut v: Vec<Provider> = t.providers.values().cloned().collect();
        v.sort_by_key(|p| p.id);
        Ok(v)
    }

    async fn get_provider(&self, id: ProviderId) -> StorageResult<Provider> {
        self.tables
            .lock()
            .unwrap()
            .providers
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn get_provider_by_name(&self, name: &str) -> StorageResult<Provider> {
        self.tables
            .lock()
            .unwrap()
            .providers
            .values()
            .find(|p| p.name == name)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn update_provider(&self, provider: Provider) -> StorageResult<()> {
        self.tables.lock().unwrap().providers.insert(provider.id, provider);
        Ok(())
    }

    async fn delete_provider(&self, id: ProviderId) -> StorageResult<()> {
        self.tables.lock().unwrap().providers.remove(&id);
        Ok(())
    }

    async fn get_instance(&self, id: InstanceId) -> StorageResult<Instance> {
        self.tables
            .lock()
            .unwrap()
            .instances
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn find_instance_by_name(
        &self,
        provider_id: ProviderId,
        name: &str,
    ) -> StorageResult<Option<Instance>> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .instances
            .values()
            .find(|i| i.provider_id == provider_id && i.name == name && !i.is_deleted())
            .cloned())
    }

    async fn list_instances_by_provider(
        &self,
        provider_id: ProviderId,
        include_deleted: bool,
    ) -> StorageResult<Vec<Instance>> {
        let t = self.tables.lock().unwrap();
        let mut v: Vec<Instance> = t
            .instances
            .values()
            .filter(|i| i.provider_id == provider_id && (include_deleted || !i.is_deleted()))
            .cloned()
            .collect();
        v.sort_by_key(|i| i.id);
        Ok(v)
    }

    async fn list_instances_by_user(
        &self,
        user_id: UserId,
        include_deleted: bool,
    ) -> StorageResult<Vec<Instance>> {
        let t = self.tables.lock().unwrap();
        let mut v: Vec<Instance> = t
            .instances
            .values()
            .filter(|i| i.user_id == user_id && (include_deleted || !i.is_deleted()))
            .cloned()
            .collect();
        v.sort_by_key(|i| i.id);
        Ok(v)
    }

    async fn insert_instance(&self, instance: Instance) -> StorageResult<()> {
        self.tables.lock().unwrap().instances.insert(instance.id, instance);
        Ok(())
    }

    async fn update_instance(&self, instance: Instance) -> StorageResult<()> {
        self.tables.lock().unwrap().instances.insert(instance.id, instance);
        Ok(())
    }

    async fn soft_delete_instance(&self, id: InstanceId, at: DateTime<Utc>) -> StorageResult<()> {
        let mut t = self.tables.lock().unwrap();
        let instance = t.instances.get_mut(&id).ok_or(StorageError::NotFound)?;
        instance.deleted_at = Some(at);
        instance.status = InstanceStatus::Deleted;
        Ok(())
    }

    async fn list_ports(&self, instance_id: InstanceId) -> StorageResult<Vec<Port>> {
        let t = self.tables.lock().unwrap();
        let mut v: Vec<Port> = t
            .ports
            .values()
            .filter(|p| p.instance_id == instance_id && p.active)
            .cloned()
            .collect();
        v.sort_by_key(|p| p.id);
        Ok(v)
    }

    async fn upsert_port(&self, port: Port) -> StorageResult<()> {
        self.tables.lock().unwrap().ports.insert(port.id, port);
        Ok(())
    }

    async fn delete_port(&self, id: PortId) -> StorageResult<()> {
        let mut t = self.tables.lock().unwrap();
        if let Some(p) = t.ports.get_mut(&id) {
            p.active = false;
        }
        Ok(())
    }

    async fn insert_task(&self, task: Task) -> StorageResult<()> {
        self.tables.lock().unwrap().tasks.insert(task.id, task);
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> StorageResult<Task> {
        self.tables
            .lock()
            .unwrap()
            .tasks
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn update_task(&self, task: Task) -> StorageResult<()> {
        self.tables.lock().unwrap().tasks.insert(task.id, task);
        Ok(())
    }

    async fn list_pending_tasks(&self) -> StorageResult<Vec<Task>> {
        let t = self.tables.lock().unwrap();
        let mut v: Vec<Task> = t
            .tasks
            .values()
            .filter(|task| task.status == TaskStatus::Pending)
            .cloned()
            .collect();
        v.sort_by_key(|task| task.created_at);
        Ok(v)
    }

    async fn list_running_tasks(&self) -> StorageResult<Vec<Task>> {
        let t = self.tables.lock().unwrap();
        Ok(t.tasks
            .values()
            .filter(|task| task.status == TaskStatus::Running)
            .cloned()
            .collect())
    }

    async fn insert_traffic_record(&self, record: PmacctTrafficRecord) -> StorageResult<()> {
        self.tables.lock().unwrap().traffic.push(record);
        Ok(())
    }

    async fn list_traffic_records(
        &self,
        instance_id: InstanceId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<PmacctTrafficRecord>> {
        let t = self.tables.lock().unwrap();
        let mut v: Vec<PmacctTrafficRecord> = t
            .traffic
            .iter()
            .filter(|r| r.instance_id == instance_id && r.timestamp >= from && r.timestamp <= to)
            .cloned()
            .collect();
        v.sort_by_key(|r| r.timestamp);
        Ok(v)
    }

    async fn delete_traffic_records_older_than(&self, cutoff: DateTime<Utc>) -> StorageResult<u64> {
        let mut t = self.tables.lock().unwrap();
        let before = t.traffic.len();
        t.traffic.retain(|r| r.timestamp >= cutoff);
        Ok((before - t.traffic.len()) as u64)
    }

    async fn get_user(&self, id: UserId) -> StorageResult<User> {
        self.tables
            .lock()
            .unwrap()
            .users
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn update_user(&self, user: User) -> StorageResult<()> {
        self.tables.lock().unwrap().users.insert(user.id, user);
        Ok(())
    }

    async fn get_config_settings(&self) -> StorageResult<serde_json::Value> {
        Ok(self.tables.lock().unwrap().config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_fixture(id: i64) -> Provider {
        Provider {
            id: ProviderId(id),
            name: format!("host-{id}"),
            provider_type: ProviderType::Lxd,
            uuid: "uuid".into(),
            hostname: None,
            endpoint: "https://127.0.0.1:8443".into(),
            ssh_port: 22,
            username: "root".into(),
            password: None,
            ssh_private_key: None,
            api_token: None,
            api_token_id: None,
            cert_path: None,
            key_path: None,
            cert_content: None,
            key_content: None,
            network_type: NetworkType::Nat,
            execution_rule: ExecutionRule::ApiFirst,
            container_enabled: true,
            vm_enabled: true,
            container_budget: ResourceBudget {
                cpu: None,
                memory_mb: None,
                disk_mb: None,
            },
            vm_budget: ResourceBudget {
                cpu: None,
                memory_mb: None,
                disk_mb: None,
            },
            container_defaults: ContainerDefaults::default(),
            status: ProviderStatus::Active,
            is_frozen: false,
            expires_at: None,
            last_health_result: None,
            enable_traffic_control: false,
            max_traffic_mb: 0.0,
            traffic_count_mode: TrafficCountMode::Both,
            traffic_multiplier: 1.0,
            traffic_limited: false,
            traffic_reset_at: None,
        }
    }

    #[tokio::test]
    async fn providers_round_trip() {
        let store = InMemoryStorage::new();
        store.update_provider(provider_fixture(1)).await.unwrap();
        let fetched = store.get_provider(ProviderId(1)).await.unwrap();
        assert_eq!(fetched.name, "host-1");
        assert_eq!(
            store.get_provider_by_name("host-1").await.unwrap().id,
            ProviderId(1)
        );
    }

    #[tokio::test]
    async fn pending_tasks_are_ordered_by_creation() {
        let store = InMemoryStorage::new();
        let base = Utc::now();
        let later = Task::new(
            TaskId(2),
            UserId(1),
            ProviderId(1),
            None,
            TaskType::Start,
            serde_json::json!({}),
            30,
            false,
            base + chrono::Duration::seconds(5),
        );
        let earlier = Task::new(
            TaskId(1),
            UserId(1),
            ProviderId(1),
            None,
            TaskType::Start,
            serde_json::json!({}),
            30,
            false,
            base,
        );
        store.insert_task(later).await.unwrap();
        store.insert_task(earlier).await.unwrap();
        let pending = store.list_pending_tasks().await.unwrap();
        assert_eq!(pending[0].id, TaskId(1));
        assert_eq!(pending[1].id, TaskId(2));
    }

    #[tokio::test]
    async fn soft_deleted_instances_are_excluded_by_default() {
        let store = InMemoryStorage::new();
        let mut instance = Instance {
            id: InstanceId(1),
            name: "box".into(),
            provider_id: ProviderId(1),
            user_id: UserId(1),
            kind: InstanceKind::Container,
            status: InstanceStatus::Running,
            image: "ubuntu/22.04".into(),
            cpu: 1,
            memory_mb: 512,
            disk_mb: 5000,
            private_ip: None,
            public_ip: None,
            ipv6_address: None,
            max_traffic_mb: 0.0,
            traffic_limited: false,
            traffic_limit_reason: None,
            password: None,
            deleted_at: None,
        };
        store.insert_instance(instance.clone()).await.unwrap();
        store
            .soft_delete_instance(InstanceId(1), Utc::now())
            .await
            .unwrap();
        instance.deleted_at = Some(Utc::now());
        assert!(store
            .find_instance_by_name(ProviderId(1), "box")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .list_instances_by_provider(ProviderId(1), true)
            .await
            .unwrap()[0]
            .is_deleted());
    }
}
