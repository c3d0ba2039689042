//! Backend adapter contract (spec §4.7, §6.3).
//!
//! `driftline-core` depends on nothing but this trait; the concrete
//! relational and document adapters live in `driftline-adapters` and
//! implement it there, so the pipeline can be handed a `&dyn BackendAdapter`
//! (or a `Box<dyn BackendAdapter>`) without the core crate ever knowing
//! about rusqlite or the document store's file format.

use serde_json::{Map, Value};

use crate::pipeline::PendingColumn;

/// A storage backend the pipeline can dispatch a split record to.
///
/// Implementors own their own connection/handle and are responsible for
/// their own error recovery; `insert` failures are expected to be logged
/// and swallowed by the caller rather than aborting ingestion (spec §7,
/// "Backend write failure").
pub trait BackendAdapter: Send + Sync {
    /// Human-readable name used in logs (e.g. `"sql"`, `"doc"`).
    fn name(&self) -> &str;

    /// Evolve the backend's schema so `column.canonical_key` can be
    /// written, if the backend has a schema to evolve at all (spec §4.6
    /// step 5 / §4.7 — document backends are typically a no-op here).
    fn ensure_column(&self, column: &PendingColumn) -> anyhow::Result<()>;

    /// Persist one projected record.
    fn insert(&self, record: &Map<String, Value>) -> anyhow::Result<()>;

    /// Flush and release any held resources. Called once at shutdown.
    fn close(&self) -> anyhow::Result<()>;
}
