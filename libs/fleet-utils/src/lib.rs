//! Shared, dependency-light building blocks used by every `fleetd`
//! component: identifiers, the cross-component error-kind taxonomy, tracing
//! setup and a couple of hashing helpers.
//!
//! Grounded on the teacher's `libs/utils` crate, which plays the same role
//! (id types, logging, small shared helpers) for neon's storage stack.

pub mod error;
pub mod fingerprint;
pub mod ids;
pub mod logging;
pub mod retry;

pub use error::{Classify, ErrorKind};
pub use ids::{InstanceId, PortId, ProviderId, TaskId, UserId};
pub use retry::retry_with_backoff;
