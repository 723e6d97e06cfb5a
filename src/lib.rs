// ============================================================================
// cachesync Library
// ============================================================================

//! Keeps a central cache store synchronized with an ERP, a hotel operations system and a
//! CRM.
//!
//! Notifications from the hotel system arrive through the [`protocol`] front end, are
//! resolved to cache identities by the [`identity`] resolver and written with the
//! [`upsert`] engine. The [`sync`] scheduler drains the changed records to the CRM one at a
//! time, oldest change first.

pub mod cache;
pub mod config;
pub mod core;
pub mod fields;
pub mod identity;
pub mod protocol;
pub mod store;
pub mod sync;
pub mod upsert;

// Re-export main types for convenience
pub use config::ServerConfig;
pub use core::{ErrorKind, Result, SyncError, Value};
pub use fields::{Field, Record, SyncContext, System};
pub use identity::{IdentityResolver, Resolution};
pub use protocol::{Dispatcher, HandlerRegistry, ProtocolServer, ReloadableRoutes};
pub use store::{CacheStore, MemoryStore, StoreConnection};
pub use sync::{Downstream, Downstreams, SyncPass, SyncScheduler};
pub use upsert::{NamedLocks, Upsert};
