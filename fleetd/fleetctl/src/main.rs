//! Administrative CLI for the fleet control plane, modeled on
//! `storcon_cli`'s shape: a thin `clap::Parser` wrapper that opens the
//! database directly (there is no HTTP API in front of `fleetd` yet) and
//! prints `comfy_table` tables.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::Table;
use fleet_utils::{InstanceId, ProviderId, TaskId};
use fleetd::db::models::{
    ContainerDefaults, ExecutionRule, NetworkType, Provider, ProviderStatus, ProviderType,
    ResourceBudget, Task, TaskType, TrafficCountMode,
};
use fleetd::db::pg::PgStorage;
use fleetd::db::Storage;
use fleetd::traffic::aggregate::bucketed_increments;

#[derive(Parser)]
#[command(name = "fleetctl", version, about = "Administrative CLI for the fleet control plane")]
struct Cli {
    /// Database connection string. Falls back to `FLEETCTL_DB_URL`.
    #[arg(long, env = "FLEETCTL_DB_URL")]
    db_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Provider inventory management.
    Provider {
        #[command(subcommand)]
        action: ProviderAction,
    },
    /// Instance inspection and control.
    Instance {
        #[command(subcommand)]
        action: InstanceAction,
    },
    /// Task queue inspection.
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
}

#[derive(Subcommand)]
enum ProviderAction {
    /// Register a new provider host.
    Add {
        #[arg(long)]
        name: String,
        #[arg(long, value_enum)]
        provider_type: CliProviderType,
        #[arg(long)]
        endpoint: String,
        #[arg(long, default_value_t = 22)]
        ssh_port: u16,
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// List registered providers.
    List,
    /// Print the last stored health report for a provider.
    Health {
        #[arg(long)]
        id: i64,
    },
}

#[derive(clap::ValueEnum, Clone, Copy)]
enum CliProviderType {
    Lxd,
    Incus,
    Proxmox,
    Docker,
}

impl From<CliProviderType> for ProviderType {
    fn from(v: CliProviderType) -> Self {
        match v {
            CliProviderType::Lxd => ProviderType::Lxd,
            CliProviderType::Incus => ProviderType::Incus,
            CliProviderType::Proxmox => ProviderType::Proxmox,
            CliProviderType::Docker => ProviderType::Docker,
        }
    }
}

#[derive(Subcommand)]
enum InstanceAction {
    /// List instances on a provider.
    List {
        #[arg(long)]
        provider_id: i64,
        /// Include soft-deleted rows.
        #[arg(long)]
        include_deleted: bool,
    },
    /// Enqueue a stop task for an instance.
    Stop {
        #[arg(long)]
        instance_id: i64,
    },
    /// Print historical traffic usage as fixed-width buckets.
    Usage {
        #[arg(long)]
        instance_id: i64,
        /// How many days back to report.
        #[arg(long, default_value_t = 7)]
        days: i64,
        /// Bucket width in hours.
        #[arg(long, default_value_t = 24)]
        bucket_hours: i64,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Show a task's current state.
    Show {
        #[arg(long)]
        id: i64,
    },
    /// List pending and running tasks.
    Queue,
}

fn fresh_id() -> i64 {
    static COUNTER: AtomicI64 = AtomicI64::new(1);
    let base = chrono::Utc::now().timestamp_millis();
    let offset = COUNTER.fetch_add(1, Ordering::Relaxed);
    base.wrapping_mul(1000).wrapping_add(offset)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage: Arc<dyn Storage> =
        Arc::new(PgStorage::connect(&cli.db_url).context("connecting to database")?);

    match cli.command {
        Command::Provider { action } => provider_command(&*storage, action).await,
        Command::Instance { action } => instance_command(&*storage, action).await,
        Command::Task { action } => task_command(&*storage, action).await,
    }
}

async fn provider_command(storage: &dyn Storage, action: ProviderAction) -> Result<()> {
    match action {
        ProviderAction::Add {
            name,
            provider_type,
            endpoint,
            ssh_port,
            username,
            password,
        } => {
            let provider = Provider {
                id: ProviderId(fresh_id()),
                name,
                provider_type: provider_type.into(),
                uuid: uuid::Uuid::new_v4().to_string(),
                hostname: None,
                endpoint,
                ssh_port,
                username,
                password,
                ssh_private_key: None,
                api_token: None,
                api_token_id: None,
                cert_path: None,
                key_path: None,
                cert_content: None,
                key_content: None,
                network_type: NetworkType::Nat,
                execution_rule: ExecutionRule::SshFirst,
                container_enabled: true,
                vm_enabled: true,
                container_budget: ResourceBudget { cpu: None, memory_mb: None, disk_mb: None },
                vm_budget: ResourceBudget { cpu: None, memory_mb: None, disk_mb: None },
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
            };
            let id = provider.id;
            storage.update_provider(provider).await?;
            println!("provider {id} registered");
            Ok(())
        }
        ProviderAction::List => {
            let providers = storage.list_providers().await?;
            let mut table = Table::new();
            table.set_header(vec!["id", "name", "type", "status", "endpoint", "frozen"]);
            for p in providers {
                table.add_row(vec![
                    p.id.to_string(),
                    p.name,
                    p.provider_type.to_string(),
                    p.status.to_string(),
                    p.endpoint,
                    p.is_frozen.to_string(),
                ]);
            }
            println!("{table}");
            Ok(())
        }
        ProviderAction::Health { id } => {
            let provider = storage.get_provider(ProviderId(id)).await?;
            match provider.last_health_result {
                Some(raw) => println!("{raw}"),
                None => println!("no health report recorded yet"),
            }
            Ok(())
        }
    }
}

async fn instance_command(storage: &dyn Storage, action: InstanceAction) -> Result<()> {
    match action {
        InstanceAction::List { provider_id, include_deleted } => {
            let instances = storage
                .list_instances_by_provider(ProviderId(provider_id), include_deleted)
                .await?;
            let mut table = Table::new();
            table.set_header(vec!["id", "name", "kind", "status", "cpu", "memory_mb", "private_ip"]);
            for i in instances {
                table.add_row(vec![
                    i.id.to_string(),
                    i.name,
                    i.kind.to_string(),
                    i.status.to_string(),
                    i.cpu.to_string(),
                    i.memory_mb.to_string(),
                    i.private_ip.unwrap_or_default(),
                ]);
            }
            println!("{table}");
            Ok(())
        }
        InstanceAction::Stop { instance_id } => {
            let instance = storage.get_instance(fleet_utils::InstanceId(instance_id)).await?;
            let provider = storage.get_provider(instance.provider_id).await?;
            if provider.is_frozen {
                println!("provider {} is frozen, refusing to enqueue a new task", provider.id);
                return Ok(());
            }
            let task = Task::new(
                TaskId(fresh_id()),
                instance.user_id,
                instance.provider_id,
                Some(instance.id),
                TaskType::Stop,
                serde_json::json!({}),
                60,
                false,
                chrono::Utc::now(),
            );
            let id = task.id;
            storage.insert_task(task).await?;
            println!("stop task {id} enqueued for instance {instance_id}");
            Ok(())
        }
        InstanceAction::Usage { instance_id, days, bucket_hours } => {
            let to = chrono::Utc::now();
            let from = to - chrono::Duration::days(days);
            let records = storage
                .list_traffic_records(fleet_utils::InstanceId(instance_id), from, to)
                .await?;
            let buckets = bucketed_increments(&records, from, to, chrono::Duration::hours(bucket_hours));
            let mut table = Table::new();
            table.set_header(vec!["bucket_start", "rx_mb", "tx_mb"]);
            for (start, usage) in buckets {
                table.add_row(vec![
                    start.to_rfc3339(),
                    format!("{:.2}", usage.total_mb(TrafficCountMode::In, 1.0)),
                    format!("{:.2}", usage.total_mb(TrafficCountMode::Out, 1.0)),
                ]);
            }
            println!("{table}");
            Ok(())
        }
    }
}

async fn task_command(storage: &dyn Storage, action: TaskAction) -> Result<()> {
    match action {
        TaskAction::Show { id } => {
            let task = storage.get_task(TaskId(id)).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
            Ok(())
        }
        TaskAction::Queue => {
            let mut pending = storage.list_pending_tasks().await?;
            let running = storage.list_running_tasks().await?;
            if pending.is_empty() && running.is_empty() {
                println!("queue is empty");
                return Ok(());
            }
            pending.extend(running);
            let mut table = Table::new();
            table.set_header(vec!["id", "type", "status", "progress", "instance_id"]);
            for t in pending {
                table.add_row(vec![
                    t.id.to_string(),
                    t.task_type.to_string(),
                    t.status.to_string(),
                    t.progress.to_string(),
                    t.instance_id.map(|i| i.to_string()).unwrap_or_default(),
                ]);
            }
            println!("{table}");
            Ok(())
        }
    }
}

