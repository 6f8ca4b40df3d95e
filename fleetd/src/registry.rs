//! Provider registry (spec §4.D): owns one live [`ProviderAdapter`] per
//! registered provider, rebuilt from storage on a refresh and consulted by
//! every other component that needs to reach a host. A provider is
//! registered only while `should_be_registered` holds (active status, not
//! expired); everything else is treated as absent.

use std::collections::HashMap;
use std::sync::Arc;

use fleet_utils::{Classify, ErrorKind, ProviderId};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::context::{Clock, ShutdownContext};
use crate::db::models::{Provider, ProviderType};
use crate::db::Storage;
use crate::error::AdapterError;
use crate::provider::{docker, incus, lxd, proxmox, InstanceLocks, ProviderAdapter};
use crate::transport::{HttpsTransports, SshPool};

pub struct Registry {
    storage: Arc<dyn Storage>,
    ssh_pool: Arc<SshPool>,
    https: Arc<HttpsTransports>,
    clock: Arc<dyn Clock>,
    shutdown: ShutdownContext,
    adapters: RwLock<HashMap<ProviderId, Arc<dyn ProviderAdapter>>>,
}

impl Registry {
    pub fn new(
        storage: Arc<dyn Storage>,
        ssh_pool: Arc<SshPool>,
        https: Arc<HttpsTransports>,
        clock: Arc<dyn Clock>,
        shutdown: ShutdownContext,
    ) -> Self {
        Self {
            storage,
            ssh_pool,
            https,
            clock,
            shutdown,
            adapters: RwLock::new(HashMap::new()),
        }
    }

    fn build_adapter(&self, provider: Provider) -> Arc<dyn ProviderAdapter> {
        let locks = Arc::new(InstanceLocks::new());
        let shutdown = self.shutdown.child_token();
        match provider.provider_type {
            ProviderType::Lxd => Arc::new(lxd::LxcLikeAdapter::new(
                provider,
                "lxc",
                self.ssh_pool.clone(),
                self.https.clone(),
                locks,
                shutdown,
            )),
            ProviderType::Incus => Arc::new(incus::build(
                provider,
                self.ssh_pool.clone(),
                self.https.clone(),
                locks,
                shutdown,
            )),
            ProviderType::Proxmox => Arc::new(proxmox::ProxmoxAdapter::new(
                provider,
                self.ssh_pool.clone(),
                self.https.clone(),
                locks,
                shutdown,
            )),
            ProviderType::Docker => Arc::new(docker::DockerAdapter::new(
                provider,
                self.ssh_pool.clone(),
                self.https.clone(),
                locks,
                shutdown,
            )),
        }
    }

    /// Reloads the live adapter set from storage. Providers that are no
    /// longer `should_be_registered` are dropped (their SSH/HTTPS entries
    /// are left to the pool's own idle sweep, not closed eagerly — a
    /// freeze is meant to be temporary).
    pub async fn refresh(&self) -> Result<(), AdapterError> {
        let providers = self.storage.list_providers().await?;
        let now = self.clock.now();
        let mut next = HashMap::new();
        for provider in providers {
            if !provider.should_be_registered(now) {
                continue;
            }
            let id = provider.id;
            next.insert(id, self.build_adapter(provider));
        }
        let count = next.len();
        *self.adapters.write() = next;
        info!(count, "provider registry refreshed");
        Ok(())
    }

    pub fn get(&self, id: ProviderId) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.read().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<dyn ProviderAdapter>> {
        self.adapters.read().values().cloned().collect()
    }

    /// Shares the pool backing every adapter's SSH connections, for
    /// components (the traffic collector) that need to dial a provider's
    /// host directly rather than through an adapter operation.
    pub fn ssh_pool(&self) -> Arc<SshPool> {
        self.ssh_pool.clone()
    }

    /// Looks up a provider by name via storage, then returns its adapter if
    /// registered. Used by the CLI/API surface where providers are
    /// addressed by name rather than id.
    pub async fn get_by_name(&self, name: &str) -> Result<Option<Arc<dyn ProviderAdapter>>, AdapterError> {
        match self.storage.get_provider_by_name(name).await {
            Ok(provider) => Ok(self.get(provider.id)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SystemClock;
    use crate::db::memory::InMemoryStorage;
    use crate::db::models::{
        ContainerDefaults, ExecutionRule, NetworkType, ProviderStatus, ResourceBudget,
        TrafficCountMode,
    };
    use std::time::Duration;

    fn test_pools() -> (Arc<SshPool>, Arc<HttpsTransports>) {
        (
            Arc::new(SshPool::new(Duration::from_secs(300), Duration::from_secs(10))),
            Arc::new(HttpsTransports::new()),
        )
    }

    fn provider_fixture(id: i64, name: &str, status: ProviderStatus) -> Provider {
        Provider {
            id: ProviderId(id),
            name: name.into(),
            provider_type: ProviderType::Lxd,
            uuid: "uuid".into(),
            hostname: None,
            endpoint: "127.0.0.1".into(),
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
            execution_rule: ExecutionRule::SshOnly,
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
            status,
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
    async fn only_active_unexpired_providers_are_registered() {
        let storage = Arc::new(InMemoryStorage::new());
        let active = provider_fixture(1, "active-host", ProviderStatus::Active);
        storage.seed_provider(active.clone());
        let inactive = provider_fixture(2, "inactive-host", ProviderStatus::Inactive);
        storage.seed_provider(inactive.clone());

        let (ssh_pool, https) = test_pools();
        let registry = Registry::new(storage, ssh_pool, https, Arc::new(SystemClock), ShutdownContext::new());
        registry.refresh().await.unwrap();

        assert!(registry.get(active.id).is_some());
        assert!(registry.get(inactive.id).is_none());
    }
}
