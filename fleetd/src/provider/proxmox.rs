//! Proxmox VE adapter. Containers are driven through `pct`, VMs through
//! `qm`; both take a numeric VMID rather than a name, so on this provider
//! the instance "name" the rest of the system uses for addressing is the
//! decimal VMID (the caller is responsible for allocating one per
//! instance — `fleetctl`/the create task picks the next free id).

use std::sync::Arc;

use async_trait::async_trait;
use fleet_utils::ProviderId;
use tokio_util::sync::CancellationToken;

use crate::db::models::{Instance, InstanceKind, InstanceStatus};
use crate::error::AdapterError;
use crate::transport::ssh::{SshCredentials, SshSession};
use crate::transport::{https::proxmox_auth_header, HttpsTransports, SshPool};

use super::format::convert_memory_format;
use super::{
    generate_password, require_ssh, CreateInstanceRequest, InstanceLocks, InstanceSummary,
    ProgressReporter, ProviderAdapter, PROGRESS_CHECKPOINTS,
};

/// Proxmox has no LXD-style routed NIC device, so it gets the other IPv6
/// provisioning method from spec §4.F: a host-side address DNAT'd to the
/// container's ULA, both deterministically derived under these two
/// prefixes (mirrors `lxd.rs`'s own hardcoded container prefix).
const IPV6_CONTAINER_PREFIX: &str = "2001:db8:1::";
const IPV6_MAPPED_PREFIX: &str = "2001:db8:2::";

pub struct ProxmoxAdapter {
    provider: crate::db::models::Provider,
    ssh_pool: Arc<SshPool>,
    https: Arc<HttpsTransports>,
    locks: Arc<InstanceLocks>,
    shutdown: CancellationToken,
}

impl ProxmoxAdapter {
    pub fn new(
        provider: crate::db::models::Provider,
        ssh_pool: Arc<SshPool>,
        https: Arc<HttpsTransports>,
        locks: Arc<InstanceLocks>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            provider,
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

    fn cli(kind: InstanceKind) -> &'static str {
        match kind {
            InstanceKind::Container => "pct",
            InstanceKind::Vm => "qm",
        }
    }

    async fn run(&self, session: &SshSession, cmd: &str) -> Result<String, AdapterError> {
        let out = session.exec(cmd).await?;
        if !out.success() {
            return Err(AdapterError::Internal(format!("{cmd}: {}", out.stderr)));
        }
        Ok(out.stdout)
    }

    fn auth_header(&self) -> Result<String, AdapterError> {
        match (&self.provider.api_token_id, &self.provider.api_token) {
            (Some(id), Some(secret)) => Ok(proxmox_auth_header(id, secret)),
            _ => Err(AdapterError::Validation("proxmox provider missing api token".into())),
        }
    }
}

#[async_trait]
impl ProviderAdapter for ProxmoxAdapter {
    fn provider_id(&self) -> ProviderId {
        self.provider.id
    }

    async fn list_instances(&self) -> Result<Vec<InstanceSummary>, AdapterError> {
        let session = self.session().await?;
        let mut out = Vec::new();
        for (cli, kind) in [("pct", InstanceKind::Container), ("qm", InstanceKind::Vm)] {
            let raw = self.run(&session, &format!("{cli} list")).await.unwrap_or_default();
            for line in raw.lines().skip(1) {
                let cols: Vec<&str> = line.split_whitespace().collect();
                if cols.len() < 2 {
                    continue;
                }
                out.push(InstanceSummary {
                    name: cols[0].to_string(),
                    status: if cols[1].eq_ignore_ascii_case("running") {
                        InstanceStatus::Running
                    } else {
                        InstanceStatus::Stopped
                    },
                    kind,
                    ipv4: None,
                    ipv6: None,
                });
            }
        }
        Ok(out)
    }

    async fn create_instance(
        &self,
        mut instance: Instance,
        req: CreateInstanceRequest,
        progress: &dyn ProgressReporter,
    ) -> Result<Instance, AdapterError> {
        let _guard = self.locks.acquire(&req.name).await;
        let session = self.session().await?;
        let cli = Self::cli(req.kind);
        let mut cp = PROGRESS_CHECKPOINTS.iter();

        progress.report(*cp.next().unwrap_or(&5), "validating vmid").await;
        if req.name.parse::<u32>().is_err() {
            return Err(AdapterError::Validation("proxmox instance name must be a numeric vmid".into()));
        }

        progress.report(*cp.next().unwrap_or(&15), "checking for existing vmid").await;
        let existing = session.exec(&format!("{cli} config {}", req.name)).await?;
        if existing.success() {
            return Err(AdapterError::AlreadyInState);
        }

        progress.report(*cp.next().unwrap_or(&25), "creating").await;
        let memory_mib = req
            .memory
            .as_deref()
            .map(convert_memory_format)
            .and_then(|m| m.trim_end_matches("MiB").trim_end_matches("GiB").parse::<u64>().ok())
            .unwrap_or(512);
        let cpu = req.cpu.unwrap_or(1);
        match req.kind {
            InstanceKind::Container => {
                self.run(
                    &session,
                    &format!(
                        "pct create {} {} --hostname {} --memory {memory_mib} --cores {cpu}",
                        req.name, req.image, req.name
                    ),
                )
                .await?;
            }
            InstanceKind::Vm => {
                self.run(
                    &session,
                    &format!(
                        "qm create {} --name {} --memory {memory_mib} --cores {cpu} --ostype l26",
                        req.name, req.name
                    ),
                )
                .await?;
            }
        }

        progress.report(*cp.next().unwrap_or(&50), "starting").await;
        self.run(&session, &format!("{cli} start {}", req.name)).await?;

        progress.report(*cp.next().unwrap_or(&70), "waiting for running state").await;
        let mut waited = 0;
        loop {
            let status = self.run(&session, &format!("{cli} status {}", req.name)).await?;
            if status.contains("running") {
                break;
            }
            if waited >= 50 {
                return Err(AdapterError::Timeout);
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(AdapterError::Cancelled),
                _ = tokio::time::sleep(std::time::Duration::from_secs(3)) => {}
            }
            waited += 3;
        }

        progress.report(*cp.next().unwrap_or(&90), "setting root password").await;
        let password = generate_password();
        self.set_instance_password(&req.name, &password).await?;

        let ip = self.get_instance_ipv4(&req.name).await.ok().flatten();

        if !self.provider.network_type.skips_ipv4_port_mapping() && !req.ports.is_empty() {
            require_ssh(self.provider.execution_rule)?;
            if let Some(guest_ip) = ip.as_deref() {
                let host_ip = self.credentials().host.to_string();
                super::ports::apply_port_mappings(&session, cli, &req.name, &host_ip, guest_ip, &req.ports).await?;
            }
        }

        let mut ipv6 = None;
        if self.provider.network_type.wants_ipv6() {
            require_ssh(self.provider.execution_rule)?;
            super::ipv6::ensure_sipcalc(&session).await?;
            let container_ipv6 = super::ipv6::derive_container_address(IPV6_CONTAINER_PREFIX, &req.name);
            let mapped_ipv6 = super::ipv6::derive_container_address(IPV6_MAPPED_PREFIX, &req.name);
            super::ipv6::configure_iptables(&session, &mapped_ipv6, &container_ipv6).await?;
            ipv6 = Some(mapped_ipv6);
        }

        progress.report(100, "done").await;
        instance.status = InstanceStatus::Running;
        instance.password = Some(password);
        instance.private_ip = ip.clone();
        instance.public_ip = ip;
        instance.ipv6_address = ipv6;
        Ok(instance)
    }

    async fn start_instance(&self, name: &str) -> Result<(), AdapterError> {
        let _guard = self.locks.acquire(name).await;
        let session = self.session().await?;
        for cli in ["pct", "qm"] {
            let out = session.exec(&format!("{cli} start {name}")).await?;
            if out.success() || out.stderr.to_lowercase().contains("already running") {
                return Ok(());
            }
        }
        Err(AdapterError::Internal(format!("failed to start {name}")))
    }

    async fn stop_instance(&self, name: &str) -> Result<(), AdapterError> {
        let _guard = self.locks.acquire(name).await;
        let session = self.session().await?;
        for cli in ["pct", "qm"] {
            let out = session.exec(&format!("{cli} stop {name}")).await?;
            if out.success() || out.stderr.to_lowercase().contains("already stopped") {
                return Ok(());
            }
        }
        Err(AdapterError::Internal(format!("failed to stop {name}")))
    }

    async fn restart_instance(&self, name: &str) -> Result<(), AdapterError> {
        let _guard = self.locks.acquire(name).await;
        let session = self.session().await?;
        for cli in ["pct", "qm"] {
            let out = session.exec(&format!("{cli} reboot {name}")).await?;
            if out.success() {
                return Ok(());
            }
        }
        Err(AdapterError::Internal(format!("failed to restart {name}")))
    }

    async fn delete_instance(&self, name: &str) -> Result<(), AdapterError> {
        let _guard = self.locks.acquire(name).await;
        let session = self.session().await?;
        for cli in ["pct", "qm"] {
            let _ = session.exec(&format!("{cli} stop {name}")).await;
            let out = session.exec(&format!("{cli} destroy {name}")).await?;
            if out.success() || out.stderr.to_lowercase().contains("does not exist") {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn set_instance_password(&self, name: &str, password: &str) -> Result<(), AdapterError> {
        require_ssh(self.provider.execution_rule)?;
        let session = self.session().await?;
        for cli in ["pct", "qm"] {
            let cmd = format!("{cli} exec {name} -- bash -c \"echo 'root:{password}' | chpasswd\"; history -c");
            let out = session.exec(&cmd).await?;
            if out.success() {
                return Ok(());
            }
        }
        Err(AdapterError::Internal(format!("failed to set password for {name}")))
    }

    async fn reset_instance_password(&self, name: &str) -> Result<String, AdapterError> {
        let password = generate_password();
        self.set_instance_password(name, &password).await?;
        Ok(password)
    }

    async fn get_instance_ipv4(&self, name: &str) -> Result<Option<String>, AdapterError> {
        let session = self.session().await?;
        let out = session
            .exec(&format!("pct exec {name} -- hostname -I 2>/dev/null || qm guest cmd {name} network-get-interfaces"))
            .await?;
        Ok(out
            .stdout
            .split_whitespace()
            .find(|s| s.parse::<std::net::Ipv4Addr>().is_ok())
            .map(|s| s.to_string()))
    }

    async fn get_instance_ipv6(&self, _name: &str) -> Result<Option<String>, AdapterError> {
        Ok(None)
    }
}
