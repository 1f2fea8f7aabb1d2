pub mod clock;
pub mod error;
pub mod types;
pub mod value;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DbError, ErrorKind, Result};
pub use types::{BaseSchema, DbObject, FieldDef};
pub use value::{BaseId, FieldId, FieldKind, Invid, Value};
