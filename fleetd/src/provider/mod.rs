//! Provider adapters (spec §4.C): a uniform instance-operation surface over
//! dual transports, implementing the per-provider *execution rule*. The
//! four hypervisor adapters share a contract but diverge in command syntax;
//! LXD and Incus additionally share almost all of that syntax, so they
//! share one implementation (`lxd::LxcLikeAdapter`) parameterized by CLI
//! name, per spec §9's "adapter polymorphism" design note (composition, not
//! inheritance).

pub mod docker;
pub mod format;
pub mod incus;
pub mod ipv6;
pub mod lxd;
pub mod ports;
pub mod proxmox;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use fleet_utils::{Classify, ErrorKind, ProviderId};
use rand::Rng;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::db::models::{ExecutionRule, Instance, InstanceKind, InstanceStatus, Port};
use crate::error::AdapterError;

/// Progress checkpoints reported during `create_instance` (spec §4.C).
pub const PROGRESS_CHECKPOINTS: &[u8] = &[
    5, 10, 15, 25, 30, 40, 45, 50, 55, 60, 65, 70, 75, 80, 85, 90, 95, 100,
];

#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, progress: u8, message: &str);
}

/// A reporter that drops every update; used by callers that don't need
/// progress (health checks invoking list, tests).
pub struct NullProgress;

#[async_trait]
impl ProgressReporter for NullProgress {
    async fn report(&self, _progress: u8, _message: &str) {}
}

#[derive(Debug, Clone)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub kind: InstanceKind,
    pub image: String,
    pub cpu: Option<u32>,
    pub memory: Option<String>,
    pub disk: Option<String>,
    /// The instance's configured port mappings, applied after the instance
    /// is running (spec §4.C, §4.E). Empty for an instance with no ports
    /// configured yet.
    pub ports: Vec<Port>,
}

#[derive(Debug, Clone)]
pub struct InstanceSummary {
    pub name: String,
    pub status: InstanceStatus,
    pub kind: InstanceKind,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
}

/// The uniform operation surface every hypervisor adapter exposes (spec
/// §4.C). Implementations internally apply the execution rule via
/// [`dispatch`].
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_id(&self) -> ProviderId;

    async fn list_instances(&self) -> Result<Vec<InstanceSummary>, AdapterError>;

    /// `instance` is the row the task engine already inserted in `creating`
    /// state (spec §3 lifecycle); this returns it updated with whatever the
    /// remote host reports (ips, status, password) for the caller to
    /// persist.
    async fn create_instance(
        &self,
        instance: Instance,
        req: CreateInstanceRequest,
        progress: &dyn ProgressReporter,
    ) -> Result<Instance, AdapterError>;

    /// Idempotent on "already running" (spec §4.C).
    async fn start_instance(&self, name: &str) -> Result<(), AdapterError>;
    /// Idempotent on "already stopped".
    async fn stop_instance(&self, name: &str) -> Result<(), AdapterError>;
    async fn restart_instance(&self, name: &str) -> Result<(), AdapterError>;
    /// Treats "not found" as success.
    async fn delete_instance(&self, name: &str) -> Result<(), AdapterError>;

    async fn set_instance_password(&self, name: &str, password: &str) -> Result<(), AdapterError>;
    async fn reset_instance_password(&self, name: &str) -> Result<String, AdapterError>;

    async fn get_instance_ipv4(&self, name: &str) -> Result<Option<String>, AdapterError>;
    async fn get_instance_ipv6(&self, name: &str) -> Result<Option<String>, AdapterError>;
}

/// Generates a password meeting the "≥8 chars, mixed-case alphanumeric"
/// rule (spec §4.C `reset_instance_password`).
pub fn generate_password() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnpqrstuvwxyz23456789";
    let mut rng = rand::thread_rng();
    (0..16).map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char).collect()
}

/// Runs `api_call`/`ssh_call` according to `rule` (spec §4.C dispatch
/// table). Only a transport-kind failure triggers fallback; auth,
/// validation, rule-forbidden and similar errors propagate immediately.
pub async fn dispatch<T, ApiFut, SshFut>(
    rule: ExecutionRule,
    api_available: bool,
    api_call: impl FnOnce() -> ApiFut,
    ssh_call: impl FnOnce() -> SshFut,
) -> Result<T, AdapterError>
where
    ApiFut: std::future::Future<Output = Result<T, AdapterError>>,
    SshFut: std::future::Future<Output = Result<T, AdapterError>>,
{
    match rule {
        ExecutionRule::ApiOnly => {
            if !api_available {
                return Err(AdapterError::RuleForbidden("no api implementation for this operation".into()));
            }
            api_call().await
        }
        ExecutionRule::ApiFirst => {
            if api_available {
                match api_call().await {
                    Ok(v) => Ok(v),
                    Err(e) if should_fallback(&e) => ssh_call().await,
                    Err(e) => Err(e),
                }
            } else {
                ssh_call().await
            }
        }
        ExecutionRule::SshOnly => ssh_call().await,
        ExecutionRule::SshFirst => match ssh_call().await {
            Ok(v) => Ok(v),
            Err(e) if api_available && should_fallback(&e) => api_call().await,
            Err(e) => Err(e),
        },
    }
}

fn should_fallback(err: &AdapterError) -> bool {
    matches!(err.kind(), ErrorKind::Transport)
}

/// Operations that must use SSH regardless of `execution_rule` — password
/// reset, IPv6 setup scripts, port mapping (spec §4.C). Fails with
/// `rule-forbidden` if the provider is `api_only`, since that setting means
/// SSH must never be used on this host.
pub fn require_ssh(rule: ExecutionRule) -> Result<(), AdapterError> {
    if rule == ExecutionRule::ApiOnly {
        Err(AdapterError::RuleForbidden(
            "operation requires ssh but execution_rule is api_only".into(),
        ))
    } else {
        Ok(())
    }
}

/// Per-instance non-reentrant mutator lock (spec §4.C, §5, §8 invariant 5):
/// at most one worker holds an instance's lock at a time; reads are
/// lock-free. Keyed by instance name rather than `InstanceId` — this map is
/// scoped to one adapter (one provider), and `ProviderAdapter`'s mutating
/// operations are themselves keyed by name (names are unique per provider,
/// spec §3 invariant).
#[derive(Default)]
pub struct InstanceLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, name: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn generated_password_is_mixed_case_alphanumeric_and_long_enough() {
        let pw = generate_password();
        assert!(pw.len() >= 8);
        assert!(pw.chars().any(|c| c.is_ascii_uppercase()));
        assert!(pw.chars().any(|c| c.is_ascii_lowercase()));
    }

    #[tokio::test]
    async fn instance_locks_serialize_same_instance() {
        let locks = Arc::new(InstanceLocks::new());
        let guard = locks.acquire("ct01").await;
        let locks2 = locks.clone();
        let handle = tokio::spawn(async move {
            let _guard = locks2.acquire("ct01").await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        drop(guard);
        handle.await.unwrap();
    }

    /// A 503-shaped failure: `Internal` classifies as `ErrorKind::Transport`
    /// (see `AdapterError`'s `Classify` impl), so it's the one kind that
    /// should ever trigger a same-call SSH fallback.
    fn transport_failure() -> AdapterError {
        AdapterError::Internal("503".into())
    }

    #[tokio::test]
    async fn api_only_never_calls_ssh_even_on_failure() {
        let ssh_calls = Arc::new(AtomicUsize::new(0));
        let calls = ssh_calls.clone();
        let result: Result<u8, AdapterError> = dispatch(
            ExecutionRule::ApiOnly,
            true,
            || async { Err(transport_failure()) },
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(0)
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(ssh_calls.load(Ordering::SeqCst), 0, "api_only must not fall back to ssh");
    }

    #[tokio::test]
    async fn api_only_without_an_api_implementation_is_rule_forbidden() {
        let result: Result<u8, AdapterError> =
            dispatch(ExecutionRule::ApiOnly, false, || async { Ok(1) }, || async { Ok(2) }).await;
        assert!(matches!(result, Err(AdapterError::RuleForbidden(_))));
    }

    #[tokio::test]
    async fn api_first_falls_back_to_ssh_once_on_transport_error() {
        let api_calls = Arc::new(AtomicUsize::new(0));
        let ssh_calls = Arc::new(AtomicUsize::new(0));
        let (a, s) = (api_calls.clone(), ssh_calls.clone());
        let result: Result<u8, AdapterError> = dispatch(
            ExecutionRule::ApiFirst,
            true,
            || async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(transport_failure())
            },
            || async move {
                s.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(api_calls.load(Ordering::SeqCst), 1);
        assert_eq!(ssh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn api_first_does_not_fall_back_on_a_non_transport_error() {
        let ssh_calls = Arc::new(AtomicUsize::new(0));
        let calls = ssh_calls.clone();
        let result: Result<u8, AdapterError> = dispatch(
            ExecutionRule::ApiFirst,
            true,
            || async { Err(AdapterError::NotFound) },
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(0)
            },
        )
        .await;
        assert!(matches!(result, Err(AdapterError::NotFound)));
        assert_eq!(ssh_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ssh_only_ignores_api_availability() {
        let ssh_calls = Arc::new(AtomicUsize::new(0));
        let calls = ssh_calls.clone();
        let result: Result<u8, AdapterError> = dispatch(
            ExecutionRule::SshOnly,
            true,
            || async { Err(transport_failure()) },
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            },
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(ssh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ssh_first_falls_back_to_api_on_transport_error() {
        let api_calls = Arc::new(AtomicUsize::new(0));
        let calls = api_calls.clone();
        let result: Result<u8, AdapterError> = dispatch(
            ExecutionRule::SshFirst,
            true,
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(9)
            },
            || async { Err(transport_failure()) },
        )
        .await;
        assert_eq!(result.unwrap(), 9);
        assert_eq!(api_calls.load(Ordering::SeqCst), 1);
    }
}
