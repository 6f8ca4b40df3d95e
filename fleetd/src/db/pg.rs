//! Diesel + r2d2-backed [`Storage`] implementation, mirroring
//! `storage_controller`'s own persistence stack (diesel with the
//! `postgres`/`r2d2`/`chrono`/`serde_json` features, migrations embedded and
//! run at startup).
//!
//! The core does not open additional raw connections beyond this pool (spec
//! §5, "Shared resources / Database").

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use crate::error::StorageError;

use super::models::*;
use super::schema;
use super::{Storage, StorageResult};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

type PgPool = Pool<ConnectionManager<PgConnection>>;
type PgConn = PooledConnection<ConnectionManager<PgConnection>>;

pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn connect(database_url: &str) -> anyhow::Result<Self> {
        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder().max_size(16).build(manager)?;
        let mut conn = pool.get()?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow::anyhow!("running migrations: {e}"))?;
        Ok(Self { pool })
    }

    fn conn(&self) -> StorageResult<PgConn> {
        self.pool
            .get()
            .map_err(|e| StorageError::Backend(e.to_string()))
    }
}

fn backend_err(e: diesel::result::Error) -> StorageError {
    match e {
        diesel::result::Error::NotFound => StorageError::NotFound,
        other => StorageError::Backend(other.to_string()),
    }
}

fn parse_enum<T: FromStr>(s: &str, what: &str) -> StorageResult<T> {
    T::from_str(s).map_err(|_| StorageError::Backend(format!("invalid {what}: {s}")))
}

#[derive(Queryable)]
struct ProviderRow {
    id: i64,
    name: String,
    provider_type: String,
    uuid: String,
    hostname: Option<String>,
    endpoint: String,
    ssh_port: i32,
    username: String,
    password: Option<String>,
    ssh_private_key: Option<String>,
    api_token: Option<String>,
    api_token_id: Option<String>,
    cert_path: Option<String>,
    key_path: Option<String>,
    cert_content: Option<String>,
    key_content: Option<String>,
    network_type: String,
    execution_rule: String,
    container_enabled: bool,
    vm_enabled: bool,
    container_budget: serde_json::Value,
    vm_budget: serde_json::Value,
    container_defaults: serde_json::Value,
    status: String,
    is_frozen: bool,
    expires_at: Option<DateTime<Utc>>,
    last_health_result: Option<String>,
    enable_traffic_control: bool,
    max_traffic_mb: f64,
    traffic_count_mode: String,
    traffic_multiplier: f64,
    traffic_limited: bool,
    traffic_reset_at: Option<DateTime<Utc>>,
}

impl ProviderRow {
    fn into_model(self) -> StorageResult<Provider> {
        Ok(Provider {
            id: self.id.into(),
            name: self.name,
            provider_type: parse_enum(&self.provider_type, "provider_type")?,
            uuid: self.uuid,
            hostname: self.hostname,
            endpoint: self.endpoint,
            ssh_port: self.ssh_port as u16,
            username: self.username,
            password: self.password,
            ssh_private_key: self.ssh_private_key,
            api_token: self.api_token,
            api_token_id: self.api_token_id,
            cert_path: self.cert_path,
            key_path: self.key_path,
            cert_content: self.cert_content,
            key_content: self.key_content,
            network_type: parse_enum(&self.network_type, "network_type")?,
            execution_rule: parse_enum(&self.execution_rule, "execution_rule")?,
            container_enabled: self.container_enabled,
            vm_enabled: self.vm_enabled,
            container_budget: serde_json::from_value(self.container_budget)
                .map_err(|e| StorageError::Backend(e.to_string()))?,
            vm_budget: serde_json::from_value(self.vm_budget)
                .map_err(|e| StorageError::Backend(e.to_string()))?,
            container_defaults: serde_json::from_value(self.container_defaults)
                .map_err(|e| StorageError::Backend(e.to_string()))?,
            status: parse_enum(&self.status, "status")?,
            is_frozen: self.is_frozen,
            expires_at: self.expires_at,
            last_health_result: self.last_health_result,
            enable_traffic_control: self.enable_traffic_control,
            max_traffic_mb: self.max_traffic_mb,
            traffic_count_mode: parse_enum(&self.traffic_count_mode, "traffic_count_mode")?,
            traffic_multiplier: self.traffic_multiplier,
            traffic_limited: self.traffic_limited,
            traffic_reset_at: self.traffic_reset_at,
        })
    }
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = schema::providers)]
struct ProviderChangeset {
    id: i64,
    name: String,
    provider_type: String,
    uuid: String,
    hostname: Option<String>,
    endpoint: String,
    ssh_port: i32,
    username: String,
    password: Option<String>,
    ssh_private_key: Option<String>,
    api_token: Option<String>,
    api_token_id: Option<String>,
    cert_path: Option<String>,
    key_path: Option<String>,
    cert_content: Option<String>,
    key_content: Option<String>,
    network_type: String,
    execution_rule: String,
    container_enabled: bool,
    vm_enabled: bool,
    container_budget: serde_json::Value,
    vm_budget: serde_json::Value,
    container_defaults: serde_json::Value,
    status: String,
    is_frozen: bool,
    expires_at: Option<DateTime<Utc>>,
    last_health_result: Option<String>,
    enable_traffic_control: bool,
    max_traffic_mb: f64,
    traffic_count_mode: String,
    traffic_multiplier: f64,
    traffic_limited: bool,
    traffic_reset_at: Option<DateTime<Utc>>,
}

impl From<Provider> for ProviderChangeset {
    fn from(p: Provider) -> Self {
        Self {
            id: p.id.0,
            name: p.name,
            provider_type: p.provider_type.to_string(),
            uuid: p.uuid,
            hostname: p.hostname,
            endpoint: p.endpoint,
            ssh_port: p.ssh_port as i32,
            username: p.username,
            password: p.password,
            ssh_private_key: p.ssh_private_key,
            api_token: p.api_token,
            api_token_id: p.api_token_id,
            cert_path: p.cert_path,
            key_path: p.key_path,
            cert_content: p.cert_content,
            key_content: p.key_content,
            network_type: p.network_type.to_string(),
            execution_rule: p.execution_rule.to_string(),
            container_enabled: p.container_enabled,
            vm_enabled: p.vm_enabled,
            container_budget: serde_json::to_value(&p.container_budget).unwrap(),
            vm_budget: serde_json::to_value(&p.vm_budget).unwrap(),
            container_defaults: serde_json::to_value(&p.container_defaults).unwrap(),
            status: p.status.to_string(),
            is_frozen: p.is_frozen,
            expires_at: p.expires_at,
            last_health_result: p.last_health_result,
            enable_traffic_control: p.enable_traffic_control,
            max_traffic_mb: p.max_traffic_mb,
            traffic_count_mode: p.traffic_count_mode.to_string(),
            traffic_multiplier: p.traffic_multiplier,
            traffic_limited: p.traffic_limited,
            traffic_reset_at: p.traffic_reset_at,
        }
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn list_providers(&self) -> StorageResult<Vec<Provider>> {
        use schema::providers::dsl::*;
        let mut conn = self.conn()?;
        let rows = providers
            .load::<ProviderRow>(&mut conn)
            .map_err(backend_err)?;
        rows.into_iter().map(ProviderRow::into_model).collect()
    }

    async fn get_provider(&self, provider_id: fleet_utils::ProviderId) -> StorageResult<Provider> {
        use schema::providers::dsl::*;
        let mut conn = self.conn()?;
        let row = providers
            .filter(id.eq(provider_id.0))
            .first::<ProviderRow>(&mut conn)
            .map_err(backend_err)?;
        row.into_model()
    }

    async fn get_provider_by_name(&self, provider_name: &str) -> StorageResult<Provider> {
        use schema::providers::dsl::*;
        let mut conn = self.conn()?;
        let row = providers
            .filter(name.eq(provider_name))
            .first::<ProviderRow>(&mut conn)
            .map_err(backend_err)?;
        row.into_model()
    }

    async fn update_provider(&self, provider: Provider) -> StorageResult<()> {
        use schema::providers::dsl::*;
        let mut conn = self.conn()?;
        let changeset: ProviderChangeset = provider.into();
        diesel::insert_into(providers)
            .values(&changeset)
            .on_conflict(id)
            .do_update()
            .set(&changeset)
            .execute(&mut conn)
            .map_err(backend_err)?;
        Ok(())
    }

    async fn delete_provider(&self, provider_id: fleet_utils::ProviderId) -> StorageResult<()> {
        use schema::providers::dsl::*;
        let mut conn = self.conn()?;
        diesel::delete(providers.filter(id.eq(provider_id.0)))
            .execute(&mut conn)
            .map_err(backend_err)?;
        Ok(())
    }

    async fn get_instance(&self, instance_id: fleet_utils::InstanceId) -> StorageResult<Instance> {
        use schema::instances::dsl::*;
        let mut conn = self.conn()?;
        let row: InstanceRow = instances
            .filter(id.eq(instance_id.0))
            .first(&mut conn)
            .map_err(backend_err)?;
        row.into_model()
    }

    async fn find_instance_by_name(
        &self,
        pid: fleet_utils::ProviderId,
        instance_name: &str,
    ) -> StorageResult<Option<Instance>> {
        use schema::instances::dsl::*;
        let mut conn = self.conn()?;
        let row: Option<InstanceRow> = instances
            .filter(provider_id.eq(pid.0))
            .filter(name.eq(instance_name))
            .filter(deleted_at.is_null())
            .first(&mut conn)
            .optional()
            .map_err(backend_err)?;
        row.map(InstanceRow::into_model).transpose()
    }

    async fn list_instances_by_provider(
        &self,
        pid: fleet_utils::ProviderId,
        include_deleted: bool,
    ) -> StorageResult<Vec<Instance>> {
        use schema::instances::dsl::*;
        let mut conn = self.conn()?;
        let mut query = instances.filter(provider_id.eq(pid.0)).into_boxed();
        if !include_deleted {
            query = query.filter(deleted_at.is_null());
        }
        let rows: Vec<InstanceRow> = query.load(&mut conn).map_err(backend_err)?;
        rows.into_iter().map(InstanceRow::into_model).collect()
    }

    async fn list_instances_by_user(
        &self,
        uid: fleet_utils::UserId,
        include_deleted: bool,
    ) -> StorageResult<Vec<Instance>> {
        use schema::instances::dsl::*;
        let mut conn = self.conn()?;
        let mut query = instances.filter(user_id.eq(uid.0)).into_boxed();
        if !include_deleted {
            query = query.filter(deleted_at.is_null());
        }
        let rows: Vec<InstanceRow> = query.load(&mut conn).map_err(backend_err)?;
        rows.into_iter().map(InstanceRow::into_model).collect()
    }

    async fn insert_instance(&self, instance: Instance) -> StorageResult<()> {
        self.update_instance(instance).await
    }

    async fn update_instance(&self, instance: Instance) -> StorageResult<()> {
        use schema::instances::dsl::*;
        let mut conn = self.conn()?;
        let changeset: InstanceChangeset = instance.into();
        diesel::insert_into(instances)
            .values(&changeset)
            .on_conflict(id)
            .do_update()
            .set(&changeset)
            .execute(&mut conn)
            .map_err(backend_err)?;
        Ok(())
    }

    async fn soft_delete_instance(
        &self,
        instance_id: fleet_utils::InstanceId,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        use schema::instances::dsl::*;
        let mut conn = self.conn()?;
        diesel::update(instances.filter(id.eq(instance_id.0)))
            .set((deleted_at.eq(Some(at)), status.eq("deleted")))
            .execute(&mut conn)
            .map_err(backend_err)?;
        Ok(())
    }

    async fn list_ports(&self, iid: fleet_utils::InstanceId) -> StorageResult<Vec<Port>> {
        use schema::ports::dsl::*;
        let mut conn = self.conn()?;
        let rows: Vec<PortRow> = ports
            .filter(instance_id.eq(iid.0))
            .filter(active.eq(true))
            .load(&mut conn)
            .map_err(backend_err)?;
        rows.into_iter().map(PortRow::into_model).collect()
    }

    async fn upsert_port(&self, port: Port) -> StorageResult<()> {
        use schema::ports::dsl::*;
        let mut conn = self.conn()?;
        let changeset: PortChangeset = port.into();
        diesel::insert_into(ports)
            .values(&changeset)
            .on_conflict(id)
            .do_update()
            .set(&changeset)
            .execute(&mut conn)
            .map_err(backend_err)?;
        Ok(())
    }

    async fn delete_port(&self, port_id: fleet_utils::PortId) -> StorageResult<()> {
        use schema::ports::dsl::*;
        let mut conn = self.conn()?;
        diesel::update(ports.filter(id.eq(port_id.0)))
            .set(active.eq(false))
            .execute(&mut conn)
            .map_err(backend_err)?;
        Ok(())
    }

    async fn insert_task(&self, task: Task) -> StorageResult<()> {
        self.update_task(task).await
    }

    async fn get_task(&self, task_id: fleet_utils::TaskId) -> StorageResult<Task> {
        use schema::tasks::dsl::*;
        let mut conn = self.conn()?;
        let row: TaskRow = tasks
            .filter(id.eq(task_id.0))
            .first(&mut conn)
            .map_err(backend_err)?;
        row.into_model()
    }

    async fn update_task(&self, task: Task) -> StorageResult<()> {
        use schema::tasks::dsl::*;
        let mut conn = self.conn()?;
        let changeset: TaskChangeset = task.into();
        diesel::insert_into(tasks)
            .values(&changeset)
            .on_conflict(id)
            .do_update()
            .set(&changeset)
            .execute(&mut conn)
            .map_err(backend_err)?;
        Ok(())
    }

    async fn list_pending_tasks(&self) -> StorageResult<Vec<Task>> {
        use schema::tasks::dsl::*;
        let mut conn = self.conn()?;
        let rows: Vec<TaskRow> = tasks
            .filter(status.eq("pending"))
            .order(created_at.asc())
            .load(&mut conn)
            .map_err(backend_err)?;
        rows.into_iter().map(TaskRow::into_model).collect()
    }

    async fn list_running_tasks(&self) -> StorageResult<Vec<Task>> {
        use schema::tasks::dsl::*;
        let mut conn = self.conn()?;
        let rows: Vec<TaskRow> = tasks
            .filter(status.eq("running"))
            .load(&mut conn)
            .map_err(backend_err)?;
        rows.into_iter().map(TaskRow::into_model).collect()
    }

    async fn insert_traffic_record(&self, record: PmacctTrafficRecord) -> StorageResult<()> {
        use schema::pmacct_traffic_records::dsl::*;
        let mut conn = self.conn()?;
        let ts = record.timestamp;
        diesel::insert_into(pmacct_traffic_records)
            .values((
                instance_id.eq(record.instance_id.0),
                provider_id.eq(record.provider_id.0),
                user_id.eq(record.user_id.0),
                timestamp.eq(ts),
                year.eq(ts.year()),
                month.eq(ts.month() as i32),
                day.eq(ts.day() as i32),
                hour.eq(ts.hour() as i32),
                minute.eq(ts.minute() as i32),
                rx_bytes.eq(record.rx_bytes),
                tx_bytes.eq(record.tx_bytes),
                total_bytes.eq(record.total_bytes),
            ))
            .execute(&mut conn)
            .map_err(backend_err)?;
        Ok(())
    }

    async fn list_traffic_records(
        &self,
        iid: fleet_utils::InstanceId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<PmacctTrafficRecord>> {
        use schema::pmacct_traffic_records::dsl::*;
        let mut conn = self.conn()?;
        let rows: Vec<(i64, i64, i64, DateTime<Utc>, i64, i64, i64)> = pmacct_traffic_records
            .filter(instance_id.eq(iid.0))
            .filter(timestamp.ge(from))
            .filter(timestamp.le(to))
            .order(timestamp.asc())
            .select((
                instance_id,
                provider_id,
                user_id,
                timestamp,
                rx_bytes,
                tx_bytes,
                total_bytes,
            ))
            .load(&mut conn)
            .map_err(backend_err)?;
        Ok(rows
            .into_iter()
            .map(
                |(inst, prov, user, ts, rx, tx, total)| PmacctTrafficRecord {
                    instance_id: inst.into(),
                    provider_id: prov.into(),
                    user_id: user.into(),
                    timestamp: ts,
                    rx_bytes: rx,
                    tx_bytes: tx,
                    total_bytes: total,
                },
            )
            .collect())
    }

    async fn delete_traffic_records_older_than(&self, cutoff: DateTime<Utc>) -> StorageResult<u64> {
        use schema::pmacct_traffic_records::dsl::*;
        let mut conn = self.conn()?;
        let n = diesel::delete(pmacct_traffic_records.filter(timestamp.lt(cutoff)))
            .execute(&mut conn)
            .map_err(backend_err)?;
        Ok(n as u64)
    }

    async fn get_user(&self, uid: fleet_utils::UserId) -> StorageResult<User> {
        use schema::users::dsl::*;
        let mut conn = self.conn()?;
        let row: UserRow = users
            .filter(id.eq(uid.0))
            .first(&mut conn)
            .map_err(backend_err)?;
        Ok(row.into_model())
    }

    async fn update_user(&self, user: User) -> StorageResult<()> {
        use schema::users::dsl::*;
        let mut conn = self.conn()?;
        let changeset: UserChangeset = user.into();
        diesel::insert_into(users)
            .values(&changeset)
            .on_conflict(id)
            .do_update()
            .set(&changeset)
            .execute(&mut conn)
            .map_err(backend_err)?;
        Ok(())
    }

    async fn get_config_settings(&self) -> StorageResult<serde_json::Value> {
        use schema::config_settings::dsl::*;
        let mut conn = self.conn()?;
        let rows: Vec<(String, String, serde_json::Value)> = config_settings
            .select((scope, key, value_json))
            .load(&mut conn)
            .map_err(backend_err)?;
        let mut map = serde_json::Map::new();
        for (s, k, v) in rows {
            map.entry(s)
                .or_insert_with(|| serde_json::Value::Object(Default::default()))
                .as_object_mut()
                .expect("scope entries are always objects")
                .insert(k, v);
        }
        Ok(serde_json::Value::Object(map))
    }
}

#[derive(Queryable)]
struct InstanceRow {
    id: i64,
    name: String,
    provider_id: i64,
    user_id: i64,
    kind: String,
    status: String,
    image: String,
    cpu: i32,
    memory_mb: i64,
    disk_mb: i64,
    private_ip: Option<String>,
    public_ip: Option<String>,
    ipv6_address: Option<String>,
    max_traffic_mb: f64,
    traffic_limited: bool,
    traffic_limit_reason: Option<String>,
    password: Option<String>,
    deleted_at: Option<DateTime<Utc>>,
}

impl InstanceRow {
    fn into_model(self) -> StorageResult<Instance> {
        Ok(Instance {
            id: self.id.into(),
            name: self.name,
            provider_id: self.provider_id.into(),
            user_id: self.user_id.into(),
            kind: parse_enum(&self.kind, "instance kind")?,
            status: parse_enum(&self.status, "instance status")?,
            image: self.image,
            cpu: self.cpu as u32,
            memory_mb: self.memory_mb as u64,
            disk_mb: self.disk_mb as u64,
            private_ip: self.private_ip,
            public_ip: self.public_ip,
            ipv6_address: self.ipv6_address,
            max_traffic_mb: self.max_traffic_mb,
            traffic_limited: self.traffic_limited,
            traffic_limit_reason: self
                .traffic_limit_reason
                .map(|s| parse_enum(&s, "traffic limit reason"))
                .transpose()?,
            password: self.password,
            deleted_at: self.deleted_at,
        })
    }
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = schema::instances)]
struct InstanceChangeset {
    id: i64,
    name: String,
    provider_id: i64,
    user_id: i64,
    kind: String,
    status: String,
    image: String,
    cpu: i32,
    memory_mb: i64,
    disk_mb: i64,
    private_ip: Option<String>,
    public_ip: Option<String>,
    ipv6_address: Option<String>,
    max_traffic_mb: f64,
    traffic_limited: bool,
    traffic_limit_reason: Option<String>,
    password: Option<String>,
    deleted_at: Option<DateTime<Utc>>,
}

impl From<Instance> for InstanceChangeset {
    fn from(i: Instance) -> Self {
        Self {
            id: i.id.0,
            name: i.name,
            provider_id: i.provider_id.0,
            user_id: i.user_id.0,
            kind: i.kind.to_string(),
            status: i.status.to_string(),
            image: i.image,
            cpu: i.cpu as i32,
            memory_mb: i.memory_mb as i64,
            disk_mb: i.disk_mb as i64,
            private_ip: i.private_ip,
            public_ip: i.public_ip,
            ipv6_address: i.ipv6_address,
            max_traffic_mb: i.max_traffic_mb,
            traffic_limited: i.traffic_limited,
            traffic_limit_reason: i.traffic_limit_reason.map(|r| r.to_string()),
            password: i.password,
            deleted_at: i.deleted_at,
        }
    }
}

#[derive(Queryable)]
struct PortRow {
    id: i64,
    instance_id: i64,
    host_port: i32,
    guest_port: i32,
    protocol: String,
    mapping_method: String,
    is_ssh: bool,
    active: bool,
}

impl PortRow {
    fn into_model(self) -> StorageResult<Port> {
        Ok(Port {
            id: self.id.into(),
            instance_id: self.instance_id.into(),
            host_port: self.host_port as u16,
            guest_port: self.guest_port as u16,
            protocol: parse_enum(&self.protocol, "protocol")?,
            mapping_method: parse_enum(&self.mapping_method, "mapping method")?,
            is_ssh: self.is_ssh,
            active: self.active,
        })
    }
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = schema::ports)]
struct PortChangeset {
    id: i64,
    instance_id: i64,
    host_port: i32,
    guest_port: i32,
    protocol: String,
    mapping_method: String,
    is_ssh: bool,
    active: bool,
}

impl From<Port> for PortChangeset {
    fn from(p: Port) -> Self {
        Self {
            id: p.id.0,
            instance_id: p.instance_id.0,
            host_port: p.host_port as i32,
            guest_port: p.guest_port as i32,
            protocol: p.protocol.to_string(),
            mapping_method: p.mapping_method.to_string(),
            is_ssh: p.is_ssh,
            active: p.active,
        }
    }
}

#[derive(Queryable)]
struct TaskRow {
    id: i64,
    user_id: i64,
    provider_id: i64,
    instance_id: Option<i64>,
    task_type: String,
    status: String,
    progress: i16,
    status_message: String,
    task_data: serde_json::Value,
    timeout_seconds: i64,
    is_force_stoppable: bool,
    can_force_stop: bool,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TaskRow {
    fn into_model(self) -> StorageResult<Task> {
        Ok(Task {
            id: self.id.into(),
            user_id: self.user_id.into(),
            provider_id: self.provider_id.into(),
            instance_id: self.instance_id.map(Into::into),
            task_type: parse_enum(&self.task_type, "task type")?,
            status: parse_enum(&self.status, "task status")?,
            progress: self.progress as u8,
            status_message: self.status_message,
            task_data: self.task_data,
            timeout_seconds: self.timeout_seconds as u64,
            is_force_stoppable: self.is_force_stoppable,
            can_force_stop: self.can_force_stop,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = schema::tasks)]
struct TaskChangeset {
    id: i64,
    user_id: i64,
    provider_id: i64,
    instance_id: Option<i64>,
    task_type: String,
    status: String,
    progress: i16,
    status_message: String,
    task_data: serde_json::Value,
    timeout_seconds: i64,
    is_force_stoppable: bool,
    can_force_stop: bool,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl From<Task> for TaskChangeset {
    fn from(t: Task) -> Self {
        Self {
            id: t.id.0,
            user_id: t.user_id.0,
            provider_id: t.provider_id.0,
            instance_id: t.instance_id.map(|i| i.0),
            task_type: t.task_type.to_string(),
            status: t.status.to_string(),
            progress: t.progress as i16,
            status_message: t.status_message,
            task_data: t.task_data,
            timeout_seconds: t.timeout_seconds as i64,
            is_force_stoppable: t.is_force_stoppable,
            can_force_stop: t.can_force_stop,
            created_at: t.created_at,
            started_at: t.started_at,
            finished_at: t.finished_at,
        }
    }
}

#[derive(Queryable)]
struct UserRow {
    id: i64,
    level: i32,
    total_traffic_mb: f64,
    used_traffic_mb: f64,
    traffic_limited: bool,
    traffic_reset_at: Option<DateTime<Utc>>,
}

impl UserRow {
    fn into_model(self) -> User {
        User {
            id: self.id.into(),
            level: self.level,
            total_traffic_mb: self.total_traffic_mb,
            used_traffic_mb: self.used_traffic_mb,
            traffic_limited: self.traffic_limited,
            traffic_reset_at: self.traffic_reset_at,
        }
    }
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = schema::users)]
struct UserChangeset {
    id: i64,
    level: i32,
    total_traffic_mb: f64,
    used_traffic_mb: f64,
    traffic_limited: bool,
    traffic_reset_at: Option<DateTime<Utc>>,
}

impl From<User> for UserChangeset {
    fn from(u: User) -> Self {
        Self {
            id: u.id.0,
            level: u.level,
            total_traffic_mb: u.total_traffic_mb,
            used_traffic_mb: u.used_traffic_mb,
            traffic_limited: u.traffic_limited,
            traffic_reset_at: u.traffic_reset_at,
        }
    }
}
