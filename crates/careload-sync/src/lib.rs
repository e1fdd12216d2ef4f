//! Load pipeline orchestration: per-entity read, normalize, archive and store sync.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use careload_core::{
    Entity, EntityOutcome, LoadError, LoadMode, NotifyError, RunResults, RunStamp, StoreError,
    Table,
};
use careload_storage::{
    notifier_for_topic, BatchWriter, FileTableStore, HttpClientConfig, Item, LocalObjectStore,
    Notifier, ObjectStore, TableStore,
};
use careload_transform::{read_table, transform, write_table};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "careload-sync";

pub const FULL_LOAD_SUBJECT: &str = "Full Load Summary";
pub const DELTA_LOAD_SUBJECT: &str = "Delta Load Completed";

/// Identifiers a job is invoked with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTargets {
    pub source_bucket: String,
    pub target_bucket: String,
    pub environment: String,
    pub topic: String,
}

#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub targets: JobTargets,
    pub data_dir: PathBuf,
    pub tables_dir: PathBuf,
    pub outbox_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl LoadConfig {
    pub fn from_env() -> Result<Self> {
        Self::resolve(|name| std::env::var(name).ok())
    }

    /// Builds a config from a variable lookup (environment, CLI flags, or both layered).
    pub fn resolve<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .with_context(|| format!("{name} must be set"))
        };
        Ok(Self {
            targets: JobTargets {
                source_bucket: required("SOURCE_BUCKET")?,
                target_bucket: required("TARGET_BUCKET")?,
                environment: required("ENVIRONMENT")?,
                topic: required("SNS_TOPIC_ARN")?,
            },
            data_dir: lookup("CARELOAD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            tables_dir: lookup("CARELOAD_TABLES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./tables")),
            outbox_dir: lookup("CARELOAD_OUTBOX_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./outbox")),
            user_agent: lookup("CARELOAD_USER_AGENT")
                .unwrap_or_else(|| "careload/0.1".to_string()),
            http_timeout_secs: lookup("CARELOAD_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: LoadMode,
    pub environment: String,
    pub run_stamp: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: RunResults,
    pub total_records: usize,
    pub successful_entities: usize,
    pub entity_count: usize,
}

/// Operation counts from one store synchronization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub deleted: usize,
    pub written: usize,
    pub round_trips: usize,
}

/// Converts one table row into a store item: non-null cells as text, nulls omitted.
pub fn row_to_item(
    table: &Table,
    row: usize,
    table_name: &str,
    key_attr: &str,
) -> Result<Item, StoreError> {
    let cells = table.rows().get(row).map(Vec::as_slice).unwrap_or_default();
    let item: Item = table
        .columns()
        .iter()
        .zip(cells)
        .filter_map(|(column, cell)| cell.as_ref().map(|v| (column.clone(), v.clone())))
        .collect();

    match item.get(key_attr) {
        Some(key) if !key.trim().is_empty() => Ok(item),
        _ => Err(StoreError::MissingKey {
            table: table_name.to_string(),
            key_attr: key_attr.to_string(),
            row: row + 1,
        }),
    }
}

fn table_items(table: &Table, table_name: &str, key_attr: &str) -> Result<Vec<Item>, StoreError> {
    (0..table.len())
        .map(|row| row_to_item(table, row, table_name, key_attr))
        .collect()
}

/// Replaces the table contents: delete every scanned key, then insert every row.
///
/// Rows are converted before anything is deleted so a keyless row cannot empty the table.
/// Batches are not atomic; a store failure part-way leaves a partially replaced table.
pub async fn sync_full_replace(
    store: &dyn TableStore,
    table_name: &str,
    key_attr: &str,
    table: &Table,
) -> Result<SyncReport, StoreError> {
    let items = table_items(table, table_name, key_attr)?;
    let existing = store.scan_keys(table_name, key_attr).await?;

    let mut deletes = BatchWriter::new(store, table_name, key_attr);
    for key in existing {
        deletes.delete(key).await?;
    }
    let (deleted, delete_trips) = deletes.finish().await?;

    let mut puts = BatchWriter::new(store, table_name, key_attr);
    for item in items {
        puts.put(item).await?;
    }
    let (written, put_trips) = puts.finish().await?;

    Ok(SyncReport {
        deleted,
        written,
        round_trips: delete_trips + put_trips,
    })
}

/// Overwrites each row by key; keys absent from `table` are left untouched.
pub async fn sync_upsert(
    store: &dyn TableStore,
    table_name: &str,
    key_attr: &str,
    table: &Table,
) -> Result<SyncReport, StoreError> {
    let items = table_items(table, table_name, key_attr)?;
    let mut puts = BatchWriter::new(store, table_name, key_attr);
    for item in items {
        puts.put(item).await?;
    }
    let (written, round_trips) = puts.finish().await?;
    Ok(SyncReport {
        deleted: 0,
        written,
        round_trips,
    })
}

pub fn full_load_message(results: &RunResults, stamp: &RunStamp) -> String {
    let mut lines = vec!["Full Load Completed".to_string(), String::new()];
    for (entity, outcome) in results.iter() {
        lines.push(format!("{}: {}", entity.name().to_uppercase(), outcome));
    }
    lines.push(String::new());
    lines.push(format!("Total Records: {}", results.total_records()));
    lines.push(format!(
        "Successful: {}/{}",
        results.successful(),
        Entity::ALL.len()
    ));
    lines.push(format!("Completed: {}", stamp.formatted()));
    lines.join("\n")
}

pub fn delta_load_message(results: &RunResults) -> Result<String, NotifyError> {
    serde_json::to_string(results).map_err(|err| NotifyError::Serialize(err.to_string()))
}

pub struct LoadPipeline {
    targets: JobTargets,
    objects: Box<dyn ObjectStore>,
    tables: Box<dyn TableStore>,
    notifier: Box<dyn Notifier>,
}

impl LoadPipeline {
    pub fn new(
        targets: JobTargets,
        objects: Box<dyn ObjectStore>,
        tables: Box<dyn TableStore>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        Self {
            targets,
            objects,
            tables,
            notifier,
        }
    }

    /// Wires the filesystem-backed object store and table store plus the topic's notifier.
    pub fn from_config(config: &LoadConfig) -> Result<Self> {
        let notifier = notifier_for_topic(
            &config.targets.topic,
            config.outbox_dir.clone(),
            HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
            },
        )
        .context("building notifier")?;
        Ok(Self::new(
            config.targets.clone(),
            Box::new(LocalObjectStore::new(config.data_dir.clone())),
            Box::new(FileTableStore::new(config.tables_dir.clone())),
            notifier,
        ))
    }

    pub async fn run(&self, mode: LoadMode) -> Result<RunSummary, LoadError> {
        self.run_with_stamp(mode, RunStamp::now()).await
    }

    /// Loads every entity in order, then publishes the summary.
    ///
    /// Entity failures are recorded, never returned. Only a failed publish is an error.
    pub async fn run_with_stamp(
        &self,
        mode: LoadMode,
        stamp: RunStamp,
    ) -> Result<RunSummary, LoadError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, %mode, environment = %self.targets.environment, "starting load");

        let mut results = RunResults::new();
        for entity in Entity::ALL {
            let span = info_span!("load_entity", %run_id, entity = entity.name(), mode = mode.label());
            let outcome = self.process_entity(mode, entity, &stamp).instrument(span).await;
            results.record(entity, outcome);
        }

        info!(
            %run_id,
            successful = results.successful(),
            total_records = results.total_records(),
            failed = ?results.failed_entities(),
            "load finished"
        );

        let (subject, message) = match mode {
            LoadMode::Full => (FULL_LOAD_SUBJECT, full_load_message(&results, &stamp)),
            LoadMode::Delta => (DELTA_LOAD_SUBJECT, delta_load_message(&results)?),
        };
        self.notifier
            .publish(&self.targets.topic, subject, &message)
            .await?;

        Ok(RunSummary {
            run_id,
            mode,
            environment: self.targets.environment.clone(),
            run_stamp: stamp.formatted(),
            started_at,
            finished_at: Utc::now(),
            total_records: results.total_records(),
            successful_entities: results.successful(),
            entity_count: Entity::ALL.len(),
            results,
        })
    }

    /// Runs one entity and converts any failure into [`EntityOutcome::Failed`].
    pub async fn process_entity(
        &self,
        mode: LoadMode,
        entity: Entity,
        stamp: &RunStamp,
    ) -> EntityOutcome {
        info!("processing {}", entity.name().to_uppercase());
        match self.load_entity(mode, entity, stamp).await {
            Ok(records) => {
                info!(records, "{} loaded", entity.name().to_uppercase());
                EntityOutcome::Loaded(records)
            }
            Err(err) => {
                error!(error = %err, "{} FAILED", entity.name().to_uppercase());
                EntityOutcome::Failed(err.to_string())
            }
        }
    }

    async fn load_entity(
        &self,
        mode: LoadMode,
        entity: Entity,
        stamp: &RunStamp,
    ) -> Result<usize, LoadError> {
        let source_key = mode.source_key(entity);
        info!(bucket = %self.targets.source_bucket, key = %source_key, "reading source file");
        let bytes = self
            .objects
            .get(&self.targets.source_bucket, &source_key)
            .await?;
        let table = read_table(&source_key, &bytes)?;

        if mode == LoadMode::Delta && table.is_empty() {
            info!("no delta data found");
            return Ok(0);
        }

        let table = transform(entity, mode, table, stamp)?;

        let archive_key = mode.archive_key(entity);
        let csv = write_table(&archive_key, &table).map_err(LoadError::Archive)?;
        let stored = self
            .objects
            .put(&self.targets.target_bucket, &archive_key, &csv)
            .await
            .map_err(LoadError::Archive)?;
        info!(
            key = %stored.key,
            bytes = stored.byte_size,
            sha256 = %stored.content_hash,
            "archived processed file"
        );

        let table_name = entity.table_name(&self.targets.environment);
        let key_attr = entity.primary_key();
        let report = match mode {
            LoadMode::Full => {
                sync_full_replace(self.tables.as_ref(), &table_name, key_attr, &table).await?
            }
            LoadMode::Delta => {
                sync_upsert(self.tables.as_ref(), &table_name, key_attr, &table).await?
            }
        };
        info!(
            table = %table_name,
            deleted = report.deleted,
            written = report.written,
            round_trips = report.round_trips,
            "synchronized table"
        );

        Ok(table.len())
    }
}
