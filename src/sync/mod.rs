//! Background sync of dirty cache records to the downstream systems.
//!
//! [`SyncScheduler`] owns the single-flight timer, [`SyncPass`] drains the dirty records
//! and the [`Downstream`] trait is the seam to the CRM and hotel transports.

pub mod clock;
pub mod downstream;
pub mod lock;
pub mod notify;
pub mod pass;
pub mod scheduler;
pub mod sink;

pub use clock::{Clock, ManualClock, SystemClock};
pub use downstream::{Downstream, Downstreams, Identity, RecordKind};
pub use lock::{Grant, LockGuard, SyncLock};
pub use notify::{LogNotifier, Notifier};
pub use pass::{PassOutcome, PassRunner, SyncPass};
pub use scheduler::SyncScheduler;
pub use sink::JsonLinesSink;
