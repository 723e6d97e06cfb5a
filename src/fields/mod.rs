pub mod aspect;
pub mod converters;
pub mod ext_refs;
pub mod field;
pub mod path;
pub mod record;

pub use aspect::{Action, AspectKey, Direction, SyncContext, System};
pub use ext_refs::{ExtRef, ExtRefs};
pub use field::{Calculator, Converter, Field, FieldValue, Validator};
pub use path::FieldPath;
pub use record::{Record, Records};
