pub mod batch;
pub mod engine;
pub mod locks;

pub use batch::{BatchItem, BatchPolicy, BatchReport, BatchWriter, write_all};
pub use engine::{Upsert, UpsertAction, UpsertOutcome, upsert};
pub use locks::NamedLocks;
