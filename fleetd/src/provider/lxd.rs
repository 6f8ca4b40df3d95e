//! LXD adapter, and the shared `lxc`/`incus` implementation that
//! `incus.rs` also constructs (spec §9 "adapter polymorphism": LXD and
//! Incus diverge only in CLI binary name, so they share one struct rather
//! than duplicating ~all of it).
//!
//! Mutating operations are driven over SSH by shelling out to the host
//! CLI; `api_available` is `false` for every operation, so `execution_rule
//! = api_only` legitimately fails with "no api implementation" (the
//! dispatch contract in spec §4.C), while `api_first`/`ssh_first`/`ssh_only`
//! all resolve to the SSH path. The HTTPS client is still used by the
//! health checker's API probe (`health.rs`).

use std::sync::Arc;

use async_trait::async_trait;
use fleet_utils::ProviderId;
use tokio_util::sync::CancellationToken;

use crate::db::models::{ExecutionRule, Instance, InstanceKind, InstanceStatus, NetworkType};
use crate::error::AdapterError;
use crate::transport::ssh::{SshCredentials, SshSession};
use crate::transport::{HttpsTransports, SshPool};

use super::format::convert_memory_format;
use super::{
    generate_password, require_ssh, CreateInstanceRequest, InstanceLocks, InstanceSummary,
    ProgressReporter, ProviderAdapter, PROGRESS_CHECKPOINTS,
};

const STATE_WAIT_INTERVAL_SECS: u64 = 3;
const STATE_WAIT_CAP_SECS: u64 = 50;
const VM_AGENT_POLL_INTERVAL_SECS: u64 = 5;
const VM_AGENT_POLL_CAP_SECS: u64 = 120;

pub struct LxcLikeAdapter {
    provider: crate::db::models::Provider,
    cli: &'static str,
    ssh_pool: Arc<SshPool>,
    https: Arc<HttpsTransports>,
    locks: Arc<InstanceLocks>,
    shutdown: CancellationToken,
}

impl LxcLikeAdapter {
    pub fn new(
        provider: crate::db::models::Provider,
        cli: &'static str,
        ssh_pool: Arc<SshPool>,
        https: Arc<HttpsTransports>,
        locks: Arc<InstanceLocks>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            provider,
            cli,
            ssh_pool,
            https,
            locks,
            shutdown,
        }
    }

    fn credentials(&self) -> SshCredentials<'_> {
        SshCredentials {
            host: self.provider.endpoint.split(':').next().unwrap_or(&self.provider.endpoint),
            port: self.provider.ssh_port,
            username: &self.provider.username,
            password: self.provider.password.as_deref(),
            private_key: self.provider.ssh_private_key.as_deref(),
        }
    }

    async fn session(&self) -> Result<SshSession, AdapterError> {
        Ok(self.ssh_pool.acquire(self.credentials()).await?)
    }

    async fn run(&self, session: &SshSession, cmd: &str) -> Result<String, AdapterError> {
        let out = session.exec(cmd).await?;
        if !out.success() {
            return Err(AdapterError::Internal(format!("{cmd}: {}", out.stderr)));
        }
        Ok(out.stdout)
    }

    /// Applies the container parameter-composition table of spec §4.C.
    async fn apply_container_config(
        &self,
        session: &SshSession,
        name: &str,
        req: &CreateInstanceRequest,
    ) -> Result<(), AdapterError> {
        let defaults = &self.provider.container_defaults;
        let mut sets = vec![
            "security.nesting=true".to_string(),
            "limits.memory.swap=true".to_string(),
            "limits.memory.swap.priority=1".to_string(),
            "limits.cpu.priority=0".to_string(),
        ];

        if let Some(cpu) = req.cpu {
            sets.push(format!("limits.cpu={cpu}"));
        }
        if let Some(memory) = &req.memory {
            sets.push(format!("limits.memory={}", convert_memory_format(memory)));
        }
        if let Some(privileged) = defaults.privileged {
            sets.push(format!("security.privileged={privileged}"));
        }
        if let Some(nesting) = defaults.allow_nesting {
            sets.push(format!("security.nesting={nesting}"));
        }
        if let Some(swap) = defaults.memory_swap {
            sets.push(format!("limits.memory.swap={swap}"));
        }
        match &defaults.cpu_allowance {
            Some(allowance) if allowance != "100%" => {
                sets.push(format!("limits.cpu.allowance={allowance}"));
                sets.push("limits.cpu.priority=0".to_string());
            }
            _ => {
                sets.push("limits.cpu.allowance=50%".to_string());
                sets.push("limits.cpu.allowance=25ms/100ms".to_string());
            }
        }
        if let Some(max_processes) = defaults.max_processes {
            if max_processes > 0 {
                sets.push(format!("limits.processes={max_processes}"));
            }
        }

        for kv in sets {
            let cmd = format!("{} config set {name} {kv}", self.cli);
            self.run(session, &cmd).await?;
        }

        let disk_io = defaults.disk_io_limit.clone().unwrap_or_else(|| "5000iops".to_string());
        let (key, value) = if disk_io.ends_with("iops") {
            ("limits.read", disk_io.clone())
        } else {
            ("limits.read", disk_io.clone())
        };
        let cmd = format!("{} config device set {name} root {key} {value}", self.cli);
        self.run(session, &cmd).await?;
        let cmd = format!("{} config device set {name} root limits.write {disk_io}", self.cli);
        self.run(session, &cmd).await?;

        Ok(())
    }

    async fn apply_vm_config(&self, session: &SshSession, name: &str, req: &CreateInstanceRequest) -> Result<(), AdapterError> {
        let info = self.run(session, &format!("{} info", self.cli)).await?;
        if !info.contains("driver:") || !info.to_lowercase().contains("qemu") {
            return Err(AdapterError::Validation("host does not have the qemu VM driver available".into()));
        }
        let mut sets = vec![
            "security.secureboot=false".to_string(),
            "limits.memory.swap=true".to_string(),
            "limits.cpu.priority=0".to_string(),
        ];
        if let Some(cpu) = req.cpu {
            sets.push(format!("limits.cpu={cpu}"));
        }
        if let Some(memory) = &req.memory {
            sets.push(format!("limits.memory={}", convert_memory_format(memory)));
        }
        for kv in sets {
            let cmd = format!("{} config set {name} {kv}", self.cli);
            self.run(session, &cmd).await?;
        }
        Ok(())
    }

    async fn wait_for_state(&self, session: &SshSession, name: &str, state: &str) -> Result<(), AdapterError> {
        let mut waited = 0;
        loop {
            let out = self.run(session, &format!("{} list {name} --format csv -c s", self.cli)).await?;
            if out.trim().eq_ignore_ascii_case(state) {
                return Ok(());
            }
            if waited >= STATE_WAIT_CAP_SECS {
                return Err(AdapterError::Timeout);
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(AdapterError::Cancelled),
                _ = tokio::time::sleep(std::time::Duration::from_secs(STATE_WAIT_INTERVAL_SECS)) => {}
            }
            waited += STATE_WAIT_INTERVAL_SECS;
        }
    }

    async fn wait_for_vm_agent(&self, session: &SshSession, name: &str) -> Result<(), AdapterError> {
        let mut waited = 0;
        loop {
            let out = session.exec(&format!("{} exec {name} -- echo agent-ready", self.cli)).await?;
            if out.success() && out.stdout.trim() == "agent-ready" {
                return Ok(());
            }
            if waited >= VM_AGENT_POLL_CAP_SECS {
                return Err(AdapterError::Timeout);
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(AdapterError::Cancelled),
                _ = tokio::time::sleep(std::time::Duration::from_secs(VM_AGENT_POLL_INTERVAL_SECS)) => {}
            }
            waited += VM_AGENT_POLL_INTERVAL_SECS;
        }
    }
}

#[async_trait]
impl ProviderAdapter for LxcLikeAdapter {
    fn provider_id(&self) -> ProviderId {
        self.provider.id
    }

    async fn list_instances(&self) -> Result<Vec<InstanceSummary>, AdapterError> {
        let session = self.session().await?;
        let out = self.run(&session, &format!("{} list --format json", self.cli)).await;
        let raw = match out {
            Ok(json) => json,
            Err(_) => self.run(&session, &format!("{} list --format csv -c ns4", self.cli)).await?,
        };

        if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&raw) {
            if let Some(items) = parsed.as_array() {
                return Ok(items
                    .iter()
                    .filter_map(|item| {
                        let name = item.get("name")?.as_str()?.to_string();
                        let status = item.get("status")?.as_str().unwrap_or("").to_lowercase();
                        let kind = if item.get("type").and_then(|t| t.as_str()) == Some("virtual-machine") {
                            InstanceKind::Vm
                        } else {
                            InstanceKind::Container
                        };
                        Some(InstanceSummary {
                            name,
                            status: parse_status(&status),
                            kind,
                            ipv4: None,
                            ipv6: None,
                        })
                    })
                    .collect());
            }
        }

        Ok(raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| {
                let mut cols = line.split(',');
                let name = cols.next().unwrap_or_default().to_string();
                let status = cols.next().unwrap_or_default().to_lowercase();
                InstanceSummary {
                    name,
                    status: parse_status(&status),
                    kind: InstanceKind::Container,
                    ipv4: None,
                    ipv6: None,
                }
            })
            .collect())
    }

    async fn create_instance(
        &self,
        mut instance: Instance,
        req: CreateInstanceRequest,
        progress: &dyn ProgressReporter,
    ) -> Result<Instance, AdapterError> {
        let _guard = self.locks.acquire(&req.name).await;
        let session = self.session().await?;
        let checkpoints = PROGRESS_CHECKPOINTS;
        let mut cp = checkpoints.iter();

        progress.report(*cp.next().unwrap_or(&5), "validating name").await;
        if !is_valid_instance_name(&req.name) {
            return Err(AdapterError::Validation(format!("invalid instance name: {}", req.name)));
        }

        progress.report(*cp.next().unwrap_or(&10), "checking for existing instance").await;
        let existing = self.run(&session, &format!("{} list {} --format csv -c n", self.cli, req.name)).await?;
        if existing.lines().any(|l| l.trim() == req.name) {
            return Err(AdapterError::AlreadyInState);
        }

        progress.report(*cp.next().unwrap_or(&15), "importing image").await;
        let vm_flag = if req.kind == InstanceKind::Vm { " --vm" } else { "" };
        self.run(&session, &format!("{} init {} {}{vm_flag}", self.cli, req.image, req.name)).await?;

        progress.report(*cp.next().unwrap_or(&25), "applying configuration").await;
        match req.kind {
            InstanceKind::Container => self.apply_container_config(&session, &req.name, &req).await?,
            InstanceKind::Vm => self.apply_vm_config(&session, &req.name, &req).await?,
        }

        progress.report(*cp.next().unwrap_or(&40), "starting instance").await;
        self.run(&session, &format!("{} start {}", self.cli, req.name)).await?;

        progress.report(*cp.next().unwrap_or(&50), "waiting for running state").await;
        self.wait_for_state(&session, &req.name, "running").await?;
        if req.kind == InstanceKind::Vm {
            self.wait_for_vm_agent(&session, &req.name).await?;
        }

        progress.report(*cp.next().unwrap_or(&65), "configuring networking").await;
        let ipv4 = self.get_instance_ipv4(&req.name).await.ok().flatten();

        let mut ipv6 = None;
        if self.provider.network_type.wants_ipv6() {
            progress.report(*cp.next().unwrap_or(&75), "configuring ipv6").await;
            require_ssh(self.provider.execution_rule)?;
            super::ipv6::ensure_sipcalc(&session).await?;
            ipv6 = Some(
                super::ipv6::configure_network_device(&session, self.cli, &req.name, "2001:db8:1::")
                    .await?,
            );
        }

        if !self.provider.network_type.skips_ipv4_port_mapping() && !req.ports.is_empty() {
            progress.report(*cp.next().unwrap_or(&80), "applying port mappings").await;
            require_ssh(self.provider.execution_rule)?;
            if let Some(guest_ip) = ipv4.as_deref() {
                let host_ip = self.credentials().host.to_string();
                super::ports::apply_port_mappings(&session, self.cli, &req.name, &host_ip, guest_ip, &req.ports).await?;
            }
        }

        progress.report(*cp.next().unwrap_or(&90), "setting root password").await;
        let password = generate_password();
        self.set_instance_password(&req.name, &password).await?;

        progress.report(100, "done").await;

        instance.status = InstanceStatus::Running;
        instance.private_ip = ipv4.clone();
        instance.public_ip = ipv4;
        instance.ipv6_address = ipv6;
        instance.password = Some(password);
        Ok(instance)
    }

    async fn start_instance(&self, name: &str) -> Result<(), AdapterError> {
        let _guard = self.locks.acquire(name).await;
        let session = self.session().await?;
        let out = session.exec(&format!("{} start {name}", self.cli)).await?;
        if out.success() || out.stderr.to_lowercase().contains("already running") {
            Ok(())
        } else {
            Err(AdapterError::Internal(out.stderr))
        }
    }

    async fn stop_instance(&self, name: &str) -> Result<(), AdapterError> {
        let _guard = self.locks.acquire(name).await;
        let session = self.session().await?;
        let out = session.exec(&format!("{} stop {name}", self.cli)).await?;
        if out.success() || out.stderr.to_lowercase().contains("already stopped") {
            Ok(())
        } else {
            Err(AdapterError::Internal(out.stderr))
        }
    }

    async fn restart_instance(&self, name: &str) -> Result<(), AdapterError> {
        let _guard = self.locks.acquire(name).await;
        let session = self.session().await?;
        let out = session.exec(&format!("{} restart {name}", self.cli)).await?;
        if out.success() {
            Ok(())
        } else {
            Err(AdapterError::Internal(out.stderr))
        }
    }

    async fn delete_instance(&self, name: &str) -> Result<(), AdapterError> {
        let _guard = self.locks.acquire(name).await;
        let session = self.session().await?;
        let _ = session.exec(&format!("{} stop {name} --force", self.cli)).await;
        let out = session.exec(&format!("{} delete {name} --force", self.cli)).await?;
        if out.success() || out.stderr.to_lowercase().contains("not found") {
            Ok(())
        } else {
            Err(AdapterError::Internal(out.stderr))
        }
    }

    async fn set_instance_password(&self, name: &str, password: &str) -> Result<(), AdapterError> {
        require_ssh(self.provider.execution_rule)?;
        let session = self.session().await?;
        let cmd = format!(
            "{} exec {name} -- bash -c \"echo 'root:{password}' | chpasswd\"; history -c",
            self.cli
        );
        self.run(&session, &cmd).await?;
        Ok(())
    }

    async fn reset_instance_password(&self, name: &str) -> Result<String, AdapterError> {
        let password = generate_password();
        self.set_instance_password(name, &password).await?;
        Ok(password)
    }

    async fn get_instance_ipv4(&self, name: &str) -> Result<Option<String>, AdapterError> {
        let session = self.session().await?;
        let out = self
            .run(&session, &format!("{} list {name} -c 4 --format csv", self.cli))
            .await?;
        Ok(out.lines().next().map(|l| l.split_whitespace().next().unwrap_or("").to_string()).filter(|s| !s.is_empty()))
    }

    async fn get_instance_ipv6(&self, name: &str) -> Result<Option<String>, AdapterError> {
        let session = self.session().await?;
        let out = self
            .run(&session, &format!("{} list {name} -c 6 --format csv", self.cli))
            .await?;
        Ok(out.lines().next().map(|l| l.split_whitespace().next().unwrap_or("").to_string()).filter(|s| !s.is_empty()))
    }
}

fn parse_status(raw: &str) -> InstanceStatus {
    match raw {
        "running" => InstanceStatus::Running,
        "stopped" => InstanceStatus::Stopped,
        _ => InstanceStatus::Failed,
    }
}

/// Hypervisor-specific naming rules: lowercase alphanumerics and hyphens,
/// must not start or end with a hyphen, 1-63 chars.
fn is_valid_instance_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_instance_names() {
        assert!(is_valid_instance_name("web-01"));
        assert!(!is_valid_instance_name("-web"));
        assert!(!is_valid_instance_name("Web"));
        assert!(!is_valid_instance_name(""));
    }
}
