pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod files;
pub mod listen;
pub mod query;
pub mod queue;
pub mod reference;
pub mod snapshot;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{Config, JournalMode, Synchronous};
pub use document::{server_timestamp, DocumentSnapshot, QueryDocumentSnapshot, QuerySnapshot};
pub use error::{DocError, Result};
pub use files::StoredFile;
pub use listen::{ChangeKind, DocumentChange, ListenerRegistration, Scope};
pub use query::{
    limit, limit_to_last, order_by, query, where_field, Constraint, Direction, Query,
    QuerySource, WhereOp,
};
pub use reference::{CollectionGroupRef, CollectionRef, DocumentRef};
pub use snapshot::BackupRow;
pub use store::{Database, WriteBatch};
