//! Incus adapter. Incus forked from LXD and kept the same command surface,
//! so this is a thin constructor over [`super::lxd::LxcLikeAdapter`] with
//! `cli = "incus"` rather than a parallel implementation (spec §9 "adapter
//! polymorphism").

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::db::models::Provider;
use crate::transport::{HttpsTransports, SshPool};

use super::lxd::LxcLikeAdapter;
use super::InstanceLocks;

pub fn build(
    provider: Provider,
    ssh_pool: Arc<SshPool>,
    https: Arc<HttpsTransports>,
    locks: Arc<InstanceLocks>,
    shutdown: CancellationToken,
) -> LxcLikeAdapter {
    LxcLikeAdapter::new(provider, "incus", ssh_pool, https, locks, shutdown)
}
