pub mod catalog;
pub mod memory;
pub mod persistence;

pub use catalog::{
    Catalog, FIRST_USER_BASE, PERSONA_BASE, SUPERGASH, SUPERGASH_LABEL, USER_BASE, persona_fields,
    user_fields,
};
pub use memory::{DanglingRef, ObjectStore, StoreImage};
pub use persistence::{DumpManager, DumpMetadata};
