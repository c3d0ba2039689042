//! driftline-adapters — concrete storage backends implementing
//! [`driftline_core::BackendAdapter`].
//!
//! `sql` is a real `rusqlite` connection with dynamic schema evolution;
//! `doc` is a JSON-lines file store standing in for a document database
//! (spec's non-goals scope concrete storage engines out beyond the adapter
//! contract itself).

pub mod doc;
pub mod sql;

pub use doc::{DocAdapterError, DocumentAdapter};
pub use sql::{SqlAdapterError, SqliteAdapter};
