//! Docker adapter. Docker exposes a real REST API (unlike LXD/Incus, which
//! have none, and unlike Proxmox's token-gated API this uses a local Unix
//! or TCP socket with no auth), so `list_instances` goes through
//! [`bollard`] when the execution rule allows it and falls through to `docker
//! ...` over SSH otherwise; every mutating operation uses SSH, matching the
//! health checker's default of leaving the API probe disabled for Docker
//! (spec §4.B) — the daemon socket is treated as a read path, not something
//! this adapter authenticates mutations against.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::Docker;
use fleet_utils::ProviderId;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::db::models::{ExecutionRule, Instance, InstanceKind, InstanceStatus, MappingMethod, Port};
use crate::error::{AdapterError, TransportError};
use crate::transport::ssh::{SshCredentials, SshSession};
use crate::transport::{HttpsTransports, SshPool};

use super::{
    dispatch, generate_password, require_ssh, CreateInstanceRequest, InstanceLocks,
    InstanceSummary, ProgressReporter, ProviderAdapter, PROGRESS_CHECKPOINTS,
};

/// Docker has no LXD-style routed NIC device either, so it gets the same
/// DNAT-based IPv6 method as Proxmox (spec §4.F).
const IPV6_CONTAINER_PREFIX: &str = "2001:db8:1::";
const IPV6_MAPPED_PREFIX: &str = "2001:db8:2::";

pub struct DockerAdapter {
    provider: crate::db::models::Provider,
    ssh_pool: Arc<SshPool>,
    #[allow(dead_code)] // kept for parity with the other adapters; the probe owns the HTTPS client.
    https: Arc<HttpsTransports>,
    locks: Arc<InstanceLocks>,
    shutdown: CancellationToken,
}

impl DockerAdapter {
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

    fn docker_client(&self) -> Result<Docker, AdapterError> {
        let host = self.provider.endpoint.split(':').next().unwrap_or(&self.provider.endpoint);
        Docker::connect_with_http(&format!("http://{host}:2375"), 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| AdapterError::Transport(TransportError::Https(e.to_string())))
    }

    async fn list_via_api(&self) -> Result<Vec<InstanceSummary>, AdapterError> {
        let docker = self.docker_client()?;
        let containers = docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
            .map_err(|e| AdapterError::Transport(TransportError::Https(e.to_string())))?;
        Ok(containers
            .into_iter()
            .map(|c| InstanceSummary {
                name: c
                    .names
                    .and_then(|n| n.into_iter().next())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                status: if c.state.as_deref() == Some("running") {
                    InstanceStatus::Running
                } else {
                    InstanceStatus::Stopped
                },
                kind: InstanceKind::Container,
                ipv4: None,
                ipv6: None,
            })
            .collect())
    }

    async fn list_via_ssh(&self) -> Result<Vec<InstanceSummary>, AdapterError> {
        let session = self.session().await?;
        let out = session
            .exec("docker ps -a --format '{{.Names}}\t{{.State}}'")
            .await?;
        if !out.success() {
            return Err(AdapterError::Internal(out.stderr));
        }
        Ok(out
            .stdout
            .lines()
            .filter_map(|line| {
                let mut cols = line.splitn(2, '\t');
                let name = cols.next()?.to_string();
                let state = cols.next().unwrap_or("");
                Some(InstanceSummary {
                    name,
                    status: if state.eq_ignore_ascii_case("running") {
                        InstanceStatus::Running
                    } else {
                        InstanceStatus::Stopped
                    },
                    kind: InstanceKind::Container,
                    ipv4: None,
                    ipv6: None,
                })
            })
            .collect())
    }

    async fn run(&self, session: &SshSession, cmd: &str) -> Result<String, AdapterError> {
        let out = session.exec(cmd).await?;
        if !out.success() {
            return Err(AdapterError::Internal(format!("{cmd}: {}", out.stderr)));
        }
        Ok(out.stdout)
    }
}

#[async_trait]
impl ProviderAdapter for DockerAdapter {
    fn provider_id(&self) -> ProviderId {
        self.provider.id
    }

    async fn list_instances(&self) -> Result<Vec<InstanceSummary>, AdapterError> {
        dispatch(
            self.provider.execution_rule,
            true,
            || self.list_via_api(),
            || self.list_via_ssh(),
        )
        .await
    }

    async fn create_instance(
        &self,
        mut instance: Instance,
        req: CreateInstanceRequest,
        progress: &dyn ProgressReporter,
    ) -> Result<Instance, AdapterError> {
        if self.provider.execution_rule == ExecutionRule::ApiOnly {
            // Docker's API can create containers, but this adapter doesn't
            // implement that path yet; api_only providers can't create
            // instances through it until that's added.
            return Err(AdapterError::RuleForbidden(
                "create_instance requires ssh on this provider".into(),
            ));
        }
        let _guard = self.locks.acquire(&req.name).await;
        let session = self.session().await?;
        let mut cp = PROGRESS_CHECKPOINTS.iter();

        progress.report(*cp.next().unwrap_or(&5), "checking for existing container").await;
        let existing = session.exec(&format!("docker inspect {}", req.name)).await?;
        if existing.success() {
            return Err(AdapterError::AlreadyInState);
        }

        progress.report(*cp.next().unwrap_or(&20), "pulling image").await;
        self.run(&session, &format!("docker pull {}", req.image)).await?;

        progress.report(*cp.next().unwrap_or(&40), "creating and starting container").await;
        let mut run_cmd = format!("docker run -d --name {} ", req.name);
        if let Some(memory) = &req.memory {
            run_cmd.push_str(&format!("--memory {memory} "));
        }
        if let Some(cpu) = req.cpu {
            run_cmd.push_str(&format!("--cpus {cpu} "));
        }
        for flag in super::ports::native_port_flags(&req.ports) {
            run_cmd.push_str(&flag);
            run_cmd.push(' ');
        }
        run_cmd.push_str(&req.image);
        self.run(&session, &run_cmd).await?;

        progress.report(*cp.next().unwrap_or(&70), "waiting for running state").await;
        let mut waited = 0;
        loop {
            let state = session
                .exec(&format!("docker inspect -f '{{{{.State.Running}}}}' {}", req.name))
                .await?;
            if state.stdout.trim() == "true" {
                break;
            }
            if waited >= 50 {
                return Err(AdapterError::Timeout);
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(AdapterError::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(3)) => {}
            }
            waited += 3;
        }

        progress.report(*cp.next().unwrap_or(&90), "resolving address").await;
        let ip = self.get_instance_ipv4(&req.name).await?;

        if req.ports.iter().any(|p| p.active && p.mapping_method == MappingMethod::DeviceProxy) {
            warn!(instance = %req.name, "device_proxy port mapping configured on a docker provider, which has no such backend; these ports are not applied");
        }

        let iptables_ports: Vec<Port> = req
            .ports
            .iter()
            .filter(|p| p.active && p.mapping_method == MappingMethod::Iptables)
            .cloned()
            .collect();
        if !self.provider.network_type.skips_ipv4_port_mapping() && !iptables_ports.is_empty() {
            require_ssh(self.provider.execution_rule)?;
            if let Some(guest_ip) = ip.as_deref() {
                let host_ip = self.credentials().host.to_string();
                let plans = super::ports::compact_plans(&iptables_ports);
                super::ports::apply_iptables(&session, &host_ip, guest_ip, &plans).await?;
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
        instance.private_ip = ip.clone();
        instance.public_ip = ip;
        instance.ipv6_address = ipv6;
        // Docker containers are reached via exposed port mappings, not a
        // login shell, so there's no OS-level password to generate here.
        Ok(instance)
    }

    async fn start_instance(&self, name: &str) -> Result<(), AdapterError> {
        let _guard = self.locks.acquire(name).await;
        let session = self.session().await?;
        let out = session.exec(&format!("docker start {name}")).await?;
        if out.success() {
            Ok(())
        } else {
            Err(AdapterError::Internal(out.stderr))
        }
    }

    async fn stop_instance(&self, name: &str) -> Result<(), AdapterError> {
        let _guard = self.locks.acquire(name).await;
        let session = self.session().await?;
        let out = session.exec(&format!("docker stop {name}")).await?;
        if out.success() {
            Ok(())
        } else {
            Err(AdapterError::Internal(out.stderr))
        }
    }

    async fn restart_instance(&self, name: &str) -> Result<(), AdapterError> {
        let _guard = self.locks.acquire(name).await;
        let session = self.session().await?;
        let out = session.exec(&format!("docker restart {name}")).await?;
        if out.success() {
            Ok(())
        } else {
            Err(AdapterError::Internal(out.stderr))
        }
    }

    async fn delete_instance(&self, name: &str) -> Result<(), AdapterError> {
        let _guard = self.locks.acquire(name).await;
        let session = self.session().await?;
        let out = session.exec(&format!("docker rm -f {name}")).await?;
        if out.success() || out.stderr.to_lowercase().contains("no such container") {
            Ok(())
        } else {
            Err(AdapterError::Internal(out.stderr))
        }
    }

    async fn set_instance_password(&self, name: &str, password: &str) -> Result<(), AdapterError> {
        require_ssh(self.provider.execution_rule)?;
        let session = self.session().await?;
        let cmd = format!("docker exec {name} sh -c \"echo 'root:{password}' | chpasswd\"; history -c");
        let out = session.exec(&cmd).await?;
        if out.success() {
            Ok(())
        } else {
            Err(AdapterError::Internal(out.stderr))
        }
    }

    async fn reset_instance_password(&self, name: &str) -> Result<String, AdapterError> {
        let password = generate_password();
        self.set_instance_password(name, &password).await?;
        Ok(password)
    }

    async fn get_instance_ipv4(&self, name: &str) -> Result<Option<String>, AdapterError> {
        let session = self.session().await?;
        let out = session
            .exec(&format!(
                "docker inspect -f '{{{{range .NetworkSettings.Networks}}}}{{{{.IPAddress}}}}{{{{end}}}}' {name}"
            ))
            .await?;
        let ip = out.stdout.trim();
        Ok(if ip.is_empty() { None } else { Some(ip.to_string()) })
    }

    async fn get_instance_ipv6(&self, name: &str) -> Result<Option<String>, AdapterError> {
        let session = self.session().await?;
        let out = session
            .exec(&format!(
                "docker inspect -f '{{{{range .NetworkSettings.Networks}}}}{{{{.GlobalIPv6Address}}}}{{{{end}}}}' {name}"
            ))
            .await?;
        let ip = out.stdout.trim();
        Ok(if ip.is_empty() { None } else { Some(ip.to_string()) })
    }
}
