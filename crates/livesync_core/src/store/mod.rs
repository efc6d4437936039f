//! Reference persistence adapter.
//!
//! # Responsibility
//! - Back `EntityResolver`, `SnapshotSource` and `AuthorizationOracle` with
//!   SQLite tables.
//!
//! # See also
//! - `db` for connection bootstrap and migrations.

pub mod access;
pub mod entity_store;

pub use access::{SqliteAccessOracle, DEFAULT_TENANT_TYPE};
pub use entity_store::{EntityLink, SqliteEntityStore, StoreError, StoreResult};
