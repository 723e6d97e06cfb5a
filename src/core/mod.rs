pub mod error;
pub mod types;
pub mod value;

pub use error::{ErrorKind, Result, SyncError};
pub use types::{Column, ColumnValues, DataType, Row, Schema};
pub use value::Value;
