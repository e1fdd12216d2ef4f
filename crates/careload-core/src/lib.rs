//! Core domain model, run bookkeeping and error taxonomy for careload.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

pub const CRATE_NAME: &str = "careload-core";

/// Actor recorded in the audit columns of every loaded row.
pub const ETL_ACTOR: &str = "ETL_USER";

/// Marker published in place of a record count when an entity fails.
pub const FAILED_MARKER: &str = "FAILED";

/// The fixed, closed set of healthcare record types, in processing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    Patients,
    Doctors,
    Appointments,
    Treatments,
    Billing,
}

impl Entity {
    pub const ALL: [Entity; 5] = [
        Entity::Patients,
        Entity::Doctors,
        Entity::Appointments,
        Entity::Treatments,
        Entity::Billing,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Entity::Patients => "patients",
            Entity::Doctors => "doctors",
            Entity::Appointments => "appointments",
            Entity::Treatments => "treatments",
            Entity::Billing => "billing",
        }
    }

    pub fn primary_key(self) -> &'static str {
        match self {
            Entity::Patients => "patient_id",
            Entity::Doctors => "doctor_id",
            Entity::Appointments => "appointment_id",
            Entity::Treatments => "treatment_id",
            Entity::Billing => "bill_id",
        }
    }

    /// Per-environment table name, e.g. `healthcare_patients_dev`.
    pub fn table_name(self, environment: &str) -> String {
        format!("healthcare_{}_{}", self.name(), environment)
    }

    pub fn source_file(self, mode: LoadMode) -> String {
        match mode {
            LoadMode::Full => format!("{}.csv", self.name()),
            LoadMode::Delta => format!("delta_{}.csv", self.name()),
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    Full,
    Delta,
}

impl LoadMode {
    pub fn label(self) -> &'static str {
        match self {
            LoadMode::Full => "full_load",
            LoadMode::Delta => "delta_load",
        }
    }

    pub fn raw_prefix(self) -> String {
        format!("raw/{}", self.label())
    }

    pub fn processed_prefix(self) -> String {
        format!("processed/{}", self.label())
    }

    /// Object key of an entity's input file inside the source bucket.
    pub fn source_key(self, entity: Entity) -> String {
        format!("{}/{}", self.raw_prefix(), entity.source_file(self))
    }

    /// Object key of an entity's normalized output inside the target bucket.
    pub fn archive_key(self, entity: Entity) -> String {
        format!(
            "{}/{}/{}.csv",
            self.processed_prefix(),
            entity.name(),
            entity.name()
        )
    }

    /// `(timestamp column, actor column)` stamped onto every row.
    pub fn audit_columns(self) -> (&'static str, &'static str) {
        match self {
            LoadMode::Full => ("created_date", "created_by"),
            LoadMode::Delta => ("updated_date", "updated_by"),
        }
    }
}

impl fmt::Display for LoadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Run-wide audit timestamp, captured once when a job starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStamp {
    at: DateTime<Utc>,
}

impl RunStamp {
    pub const FORMAT: &'static str = "%Y-%m-%d %H:%M:%S";

    pub fn now() -> Self {
        Self { at: Utc::now() }
    }

    pub fn at(at: DateTime<Utc>) -> Self {
        Self { at }
    }

    pub fn instant(&self) -> DateTime<Utc> {
        self.at
    }

    pub fn formatted(&self) -> String {
        self.at.format(Self::FORMAT).to_string()
    }
}

/// In-memory tabular record set. Cells are text or null; column order follows the source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Appends a row. Short rows are padded with nulls and long rows truncated to the header width.
    pub fn push_row(&mut self, mut row: Vec<Option<String>>) {
        row.resize(self.columns.len(), None);
        self.rows.push(row);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Option<String>>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }

    /// Rewrites every cell of `column` through `f`, which receives the 1-based data row number.
    pub fn try_map_column<F>(&mut self, column: &str, mut f: F) -> Result<(), FormatError>
    where
        F: FnMut(usize, Option<&str>) -> Result<Option<String>, FormatError>,
    {
        let idx = self
            .column_index(column)
            .ok_or_else(|| FormatError::MissingColumn {
                column: column.to_string(),
            })?;
        for (i, row) in self.rows.iter_mut().enumerate() {
            let next = f(i + 1, row[idx].as_deref())?;
            row[idx] = next;
        }
        Ok(())
    }

    /// Sets `column` to `value` on every row, appending the column when absent.
    pub fn set_constant(&mut self, column: &str, value: &str) {
        let idx = match self.column_index(column) {
            Some(idx) => idx,
            None => {
                self.columns.push(column.to_string());
                for row in &mut self.rows {
                    row.push(None);
                }
                self.columns.len() - 1
            }
        };
        for row in &mut self.rows {
            row[idx] = Some(value.to_string());
        }
    }
}

/// Result of loading one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityOutcome {
    Loaded(usize),
    Failed(String),
}

impl EntityOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, EntityOutcome::Failed(_))
    }

    pub fn records(&self) -> Option<usize> {
        match self {
            EntityOutcome::Loaded(n) => Some(*n),
            EntityOutcome::Failed(_) => None,
        }
    }
}

impl fmt::Display for EntityOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityOutcome::Loaded(n) => write!(f, "{n}"),
            EntityOutcome::Failed(_) => f.write_str(FAILED_MARKER),
        }
    }
}

impl Serialize for EntityOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            EntityOutcome::Loaded(n) => serializer.serialize_u64(*n as u64),
            EntityOutcome::Failed(_) => serializer.serialize_str(FAILED_MARKER),
        }
    }
}

/// Per-entity outcomes of one run, kept in processing order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResults {
    entries: Vec<(Entity, EntityOutcome)>,
}

impl RunResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an outcome. A second record for the same entity replaces the first.
    pub fn record(&mut self, entity: Entity, outcome: EntityOutcome) {
        match self.entries.iter_mut().find(|(e, _)| *e == entity) {
            Some(slot) => slot.1 = outcome,
            None => self.entries.push((entity, outcome)),
        }
    }

    pub fn get(&self, entity: Entity) -> Option<&EntityOutcome> {
        self.entries
            .iter()
            .find(|(e, _)| *e == entity)
            .map(|(_, outcome)| outcome)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Entity, EntityOutcome)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn successful(&self) -> usize {
        self.entries.iter().filter(|(_, o)| !o.is_failed()).count()
    }

    pub fn total_records(&self) -> usize {
        self.entries.iter().filter_map(|(_, o)| o.records()).sum()
    }

    pub fn failed_entities(&self) -> Vec<Entity> {
        self.entries
            .iter()
            .filter(|(_, o)| o.is_failed())
            .map(|(e, _)| *e)
            .collect()
    }
}

impl Serialize for RunResults {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (entity, outcome) in &self.entries {
            map.serialize_entry(entity.name(), outcome)?;
        }
        map.end()
    }
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("object {key} not found in {location}")]
    NotFound { location: String, key: String },
    #[error("i/o error on {location}/{key}: {source}")]
    Io {
        location: String,
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed file {key}: {reason}")]
    Malformed { key: String, reason: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("missing column {column}")]
    MissingColumn { column: String },
    #[error("column {column} row {row}: unparseable date {value:?}")]
    InvalidDate {
        column: String,
        row: usize,
        value: String,
    },
    #[error("column {column} row {row}: not a number {value:?}")]
    InvalidNumber {
        column: String,
        row: usize,
        value: String,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table {table}: row {row} has no value for key attribute {key_attr}")]
    MissingKey {
        table: String,
        key_attr: String,
        row: usize,
    },
    #[error("table {table}: i/o error: {source}")]
    Io {
        table: String,
        #[source]
        source: std::io::Error,
    },
    #[error("table {table}: corrupt document: {reason}")]
    Corrupt { table: String, reason: String },
    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification outbox i/o error for topic {topic}: {source}")]
    Io {
        topic: String,
        #[source]
        source: std::io::Error,
    },
    #[error("notification request to {topic} failed: {reason}")]
    Http { topic: String, reason: String },
    #[error("serializing notification: {0}")]
    Serialize(String),
}

/// Everything that can go wrong while loading; per-entity variants are isolated by the pipeline.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("retrieval failed: {0}")]
    Retrieval(#[from] RetrievalError),
    #[error("format error: {0}")]
    Format(#[from] FormatError),
    #[error("archive write failed: {0}")]
    Archive(#[source] RetrievalError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("notification failed: {0}")]
    Notify(#[from] NotifyError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(v: &str) -> Option<String> {
        Some(v.to_string())
    }

    #[test]
    fn entity_naming_follows_layout_convention() {
        assert_eq!(Entity::Patients.table_name("dev"), "healthcare_patients_dev");
        assert_eq!(Entity::Billing.primary_key(), "bill_id");
        assert_eq!(
            LoadMode::Full.source_key(Entity::Doctors),
            "raw/full_load/doctors.csv"
        );
        assert_eq!(
            LoadMode::Delta.source_key(Entity::Doctors),
            "raw/delta_load/delta_doctors.csv"
        );
        assert_eq!(
            LoadMode::Delta.archive_key(Entity::Treatments),
            "processed/delta_load/treatments/treatments.csv"
        );
    }

    #[test]
    fn set_constant_appends_or_overwrites() {
        let mut table = Table::new(vec!["id".into(), "created_by".into()]);
        table.push_row(vec![cell("1"), cell("someone")]);
        table.push_row(vec![cell("2")]);

        table.set_constant("created_by", ETL_ACTOR);
        table.set_constant("created_date", "2026-01-01 00:00:00");

        assert_eq!(table.columns(), ["id", "created_by", "created_date"]);
        assert_eq!(table.value(0, "created_by"), Some(ETL_ACTOR));
        assert_eq!(table.value(1, "created_by"), Some(ETL_ACTOR));
        assert_eq!(table.value(1, "created_date"), Some("2026-01-01 00:00:00"));
    }

    #[test]
    fn try_map_column_reports_missing_column() {
        let mut table = Table::new(vec!["id".into()]);
        let err = table
            .try_map_column("email", |_, v| Ok(v.map(str::to_string)))
            .unwrap_err();
        assert_eq!(
            err,
            FormatError::MissingColumn {
                column: "email".into()
            }
        );
    }

    #[test]
    fn results_serialize_in_processing_order() {
        let mut results = RunResults::new();
        results.record(Entity::Patients, EntityOutcome::Loaded(3));
        results.record(Entity::Doctors, EntityOutcome::Failed("boom".into()));
        results.record(Entity::Appointments, EntityOutcome::Loaded(0));

        let json = serde_json::to_string(&results).unwrap();
        assert_eq!(json, r#"{"patients":3,"doctors":"FAILED","appointments":0}"#);
        assert_eq!(results.successful(), 2);
        assert_eq!(results.total_records(), 3);
        assert_eq!(results.failed_entities(), vec![Entity::Doctors]);
    }

    #[test]
    fn run_stamp_renders_second_precision() {
        let at = DateTime::parse_from_rfc3339("2026-02-24T12:00:05.250Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(RunStamp::at(at).formatted(), "2026-02-24 12:00:05");
    }
}
