//! The data model of spec §3, as plain serde-able structs. Kept
//! storage-agnostic: the diesel schema (`db::schema`) maps these onto
//! tables, but the types here are what every other component actually
//! passes around.

use chrono::{DateTime, Utc};
use fleet_utils::{InstanceId, PortId, ProviderId, TaskId, UserId};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Lxd,
    Incus,
    Proxmox,
    Docker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    Nat,
    DedicatedIpv4,
    DedicatedIpv4Ipv6,
    Ipv6Only,
}

impl NetworkType {
    /// Network types under which IPv4 port mapping is skipped entirely
    /// (spec §4.E "Network-type gating").
    pub fn skips_ipv4_port_mapping(&self) -> bool {
        matches!(
            self,
            NetworkType::DedicatedIpv4 | NetworkType::DedicatedIpv4Ipv6 | NetworkType::Ipv6Only
        )
    }

    pub fn wants_ipv6(&self) -> bool {
        matches!(self, NetworkType::DedicatedIpv4Ipv6 | NetworkType::Ipv6Only)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionRule {
    ApiOnly,
    ApiFirst,
    SshOnly,
    SshFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Active,
    Partial,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InstanceKind {
    Container,
    Vm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Creating,
    Running,
    Stopped,
    Deleting,
    Deleted,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TrafficCountMode {
    Both,
    In,
    Out,
}

/// The precedence-respecting reason an instance is currently traffic
/// limited (spec §3 invariants, §4.H three-tier enforcement). The empty
/// string of the source's schema is modeled as `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TrafficLimitReason {
    Instance,
    User,
    Provider,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MappingMethod {
    DeviceProxy,
    Iptables,
    Native,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Create,
    Start,
    Stop,
    Restart,
    ResetPassword,
    Delete,
    Configure,
    MonitorAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `next` is a legal successor of `self` under the state machine
    /// `pending -> running -> {succeeded, failed, cancelled}` (spec §8
    /// invariant 3, §4.G).
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceBudget {
    pub cpu: Option<u32>,
    pub memory_mb: Option<u64>,
    pub disk_mb: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerDefaults {
    pub privileged: Option<bool>,
    pub allow_nesting: Option<bool>,
    pub memory_swap: Option<bool>,
    pub cpu_allowance: Option<String>,
    pub max_processes: Option<u32>,
    pub disk_io_limit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: ProviderId,
    pub name: String,
    pub provider_type: ProviderType,
    pub uuid: String,
    pub hostname: Option<String>,

    pub endpoint: String,
    pub ssh_port: u16,
    pub username: String,
    pub password: Option<String>,
    pub ssh_private_key: Option<String>,
    pub api_token: Option<String>,
    pub api_token_id: Option<String>,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    pub cert_content: Option<String>,
    pub key_content: Option<String>,

    pub network_type: NetworkType,
    pub execution_rule: ExecutionRule,

    pub container_enabled: bool,
    pub vm_enabled: bool,
    pub container_budget: ResourceBudget,
    pub vm_budget: ResourceBudget,
    pub container_defaults: ContainerDefaults,

    pub status: ProviderStatus,
    pub is_frozen: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_health_result: Option<String>,

    pub enable_traffic_control: bool,
    pub max_traffic_mb: f64,
    pub traffic_count_mode: TrafficCountMode,
    pub traffic_multiplier: f64,
    pub traffic_limited: bool,
    pub traffic_reset_at: Option<DateTime<Utc>>,
}

impl Provider {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }

    /// Whether the registry should have a live adapter for this row (spec §3
    /// invariant: "every running adapter has status=active and not
    /// expired").
    pub fn should_be_registered(&self, now: DateTime<Utc>) -> bool {
        self.status == ProviderStatus::Active && !self.is_expired(now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    pub provider_id: ProviderId,
    pub user_id: UserId,

    pub kind: InstanceKind,
    pub status: InstanceStatus,
    pub image: String,
    pub cpu: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,

    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
    pub ipv6_address: Option<String>,

    pub max_traffic_mb: f64,
    pub traffic_limited: bool,
    pub traffic_limit_reason: Option<TrafficLimitReason>,

    pub password: Option<String>,

    pub deleted_at: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub id: PortId,
    pub instance_id: InstanceId,
    pub host_port: u16,
    pub guest_port: u16,
    pub protocol: Protocol,
    pub mapping_method: MappingMethod,
    pub is_ssh: bool,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub user_id: UserId,
    pub provider_id: ProviderId,
    pub instance_id: Option<InstanceId>,
    pub task_type: TaskType,

    pub status: TaskStatus,
    pub progress: u8,
    pub status_message: String,
    pub task_data: serde_json::Value,

    pub timeout_seconds: u64,
    pub is_force_stoppable: bool,
    pub can_force_stop: bool,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        id: TaskId,
        user_id: UserId,
        provider_id: ProviderId,
        instance_id: Option<InstanceId>,
        task_type: TaskType,
        task_data: serde_json::Value,
        timeout_seconds: u64,
        is_force_stoppable: bool,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user_id,
            provider_id,
            instance_id,
            task_type,
            status: TaskStatus::Pending,
            progress: 0,
            status_message: String::new(),
            task_data,
            timeout_seconds,
            is_force_stoppable,
            can_force_stop: false,
            created_at,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn has_timed_out(&self, now: DateTime<Utc>) -> bool {
        match self.started_at {
            Some(started) => {
                let elapsed = now.signed_duration_since(started);
                elapsed.num_seconds() >= self.timeout_seconds as i64
            }
            None => false,
        }
    }
}

/// A raw, immutable append-only sample of the remote counter agent (spec
/// §3, §4.H).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PmacctTrafficRecord {
    pub instance_id: InstanceId,
    pub provider_id: ProviderId,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub rx_bytes: i64,
    pub tx_bytes: i64,
    pub total_bytes: i64,
}

impl PmacctTrafficRecord {
    pub fn new(
        instance_id: InstanceId,
        provider_id: ProviderId,
        user_id: UserId,
        timestamp: DateTime<Utc>,
        rx_bytes: i64,
        tx_bytes: i64,
    ) -> Self {
        Self {
            instance_id,
            provider_id,
            user_id,
            timestamp,
            rx_bytes,
            tx_bytes,
            total_bytes: rx_bytes + tx_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub level: i32,
    pub total_traffic_mb: f64,
    pub used_traffic_mb: f64,
    pub traffic_limited: bool,
    pub traffic_reset_at: Option<DateTime<Utc>>,
}

/// A single point of a gap-filled historical traffic series (spec §4.H,
/// "Historical views").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficHistoryPoint {
    pub record_time: DateTime<Utc>,
    pub traffic_in_mb: f64,
    pub traffic_out_mb: f64,
    pub total_mb: f64,
}
