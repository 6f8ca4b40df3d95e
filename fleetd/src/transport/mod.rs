//! Pooled transport clients (spec §4.A). Two pools, both process-wide: the
//! [`ssh::SshPool`] and the [`https::HttpsTransports`] manager. Both are
//! owned by `AppContext` (spec §9, "Pool key identity" / "Global mutable
//! state") and handed to provider adapters rather than reached for as
//! globals.

pub mod https;
pub mod ssh;

pub use https::HttpsTransports;
pub use ssh::{RemoteCommandOutput, SshPool};
