//! driftline — autonomous schema-on-read ingestion pipeline.
//!
//! Wires the pieces exposed by `driftline-core` (detection, normalization,
//! the metadata store, and placement), `driftline-feed` (the upstream
//! record stream client), and `driftline-adapters` (the SQL and document
//! backends) into the two entry points the binary exposes: `ingest` and
//! `stats`.
//!
//! # Architecture
//!
//! ```text
//! RecordStream ──► Pipeline ──► split(sql, doc) ──► SqliteAdapter
//!                     │                         └──► DocumentAdapter
//!                     ▼
//!              MetadataStore (persisted, checkpointed)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use driftline_adapters::{DocumentAdapter, SqliteAdapter};
use driftline_core::adapter::BackendAdapter;
use driftline_core::config::Config;
use driftline_core::{MetadataStore, Pipeline, PlacementEngine};
use driftline_feed::{ConsumeConfig, RecordStream};

/// Totals reported back to the CLI after an `ingest` run.
#[derive(Debug, Clone, Default)]
pub struct IngestSummary {
    pub total_processed: u64,
    pub sql_inserts: u64,
    pub doc_inserts: u64,
    pub errors: u64,
}

/// Build the store and both adapters from config, run the feed to
/// completion, and report final counters (spec §6, original source's
/// `consume_continuous` final-statistics block).
pub async fn run_ingest(config: Config) -> anyhow::Result<IngestSummary> {
    let store = MetadataStore::open(&config.store.metadata_file, config.store.checkpoint_every);
    let placement_config = config.placement.clone().into_placement_config();
    let pipeline = Arc::new(Pipeline::with_placement_config(
        store,
        std::process::id(),
        placement_config,
    ));

    let sql_adapter = match SqliteAdapter::open(&config.backends.sql.db_path) {
        Ok(adapter) => Some(adapter),
        Err(err) => {
            tracing::warn!(error = %err, path = %config.backends.sql.db_path, "sql backend unavailable at startup, disabling for this run");
            None
        }
    };
    let doc_adapter = match DocumentAdapter::open(&config.backends.doc.data_dir) {
        Ok(adapter) => Some(adapter),
        Err(err) => {
            tracing::warn!(error = %err, path = %config.backends.doc.data_dir, "document backend unavailable at startup, disabling for this run");
            None
        }
    };
    if sql_adapter.is_none() && doc_adapter.is_none() {
        anyhow::bail!("no backend adapters are available: both sql and document backends failed to open");
    }

    let stream = RecordStream::with_timeout(
        &config.upstream.url,
        Duration::from_secs(config.upstream.batch_timeout_secs),
    );

    tracing::info!(url = %config.upstream.url, "probing upstream record server");
    stream.probe().await?;

    let consume_config = ConsumeConfig {
        batch_size: config.upstream.batch_size,
        total_batches: config.upstream.total_batches,
        delay: Duration::from_millis(config.upstream.delay_ms),
        batch_timeout: Duration::from_secs(config.upstream.batch_timeout_secs),
    };

    let mut summary = IngestSummary::default();
    let pipeline_for_closure = Arc::clone(&pipeline);
    let mut sql_inserts = 0u64;
    let mut doc_inserts = 0u64;
    let mut errors = 0u64;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_signal = Arc::clone(&stop);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, stopping after the current batch");
            stop_for_signal.store(true, Ordering::Relaxed);
        }
    });

    stream
        .consume_continuous(&consume_config, &stop, |record| {
            let Some(object) = record.as_object() else {
                tracing::warn!("skipping non-object record from upstream");
                errors += 1;
                return;
            };

            let outcome = pipeline_for_closure.ingest_record(object);

            if let Some(adapter) = sql_adapter.as_ref() {
                for column in &outcome.pending_columns {
                    if let Err(err) = adapter.ensure_column(column) {
                        tracing::warn!(error = %err, column = %column.canonical_key, "column evolution failed");
                    }
                }
            }

            if !outcome.split.sql_record.is_empty() {
                if let Some(adapter) = sql_adapter.as_ref() {
                    match adapter.insert(&outcome.split.sql_record) {
                        Ok(()) => sql_inserts += 1,
                        Err(err) => {
                            tracing::warn!(error = %err, "sql insert failed");
                            errors += 1;
                        }
                    }
                }
            }
            if !outcome.split.doc_record.is_empty() {
                if let Some(adapter) = doc_adapter.as_ref() {
                    match adapter.insert(&outcome.split.doc_record) {
                        Ok(()) => doc_inserts += 1,
                        Err(err) => {
                            tracing::warn!(error = %err, "document insert failed");
                            errors += 1;
                        }
                    }
                }
            }
        })
        .await;

    summary.total_processed = pipeline.store().total_records();
    summary.sql_inserts = sql_inserts;
    summary.doc_inserts = doc_inserts;
    summary.errors = errors;

    if let Some(adapter) = sql_adapter {
        adapter.close()?;
    }
    if let Some(adapter) = doc_adapter {
        adapter.close()?;
    }
    pipeline.store().save()?;

    Ok(summary)
}

/// Print the accumulated metadata statistics without ingesting anything
/// further (spec §6, original source's `get_statistics` / placement
/// summary supplement).
pub fn print_stats(config: &Config) -> anyhow::Result<()> {
    let store = MetadataStore::open(&config.store.metadata_file, config.store.checkpoint_every);
    let counters = store.global_counters();
    let placement_config = config.placement.clone().into_placement_config();
    let engine = PlacementEngine::with_config(&store, placement_config);
    let summary = engine.summary();

    println!("=== driftline statistics ===");
    println!("total records processed : {}", counters.total_records);
    println!("unique fields discovered: {}", store.field_count());
    println!("normalization rules     : {}", store.normalization_rule_count());
    println!("placement decisions     : {}", store.placement_decision_count());
    println!("  -> sql   : {}", summary.sql_fields.len());
    println!("  -> doc   : {}", summary.doc_fields.len());
    println!("  -> both  : {}", summary.both_fields.len());
    Ok(())
}
