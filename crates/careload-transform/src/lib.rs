//! CSV codec and per-entity normalization rules.

use careload_core::{Entity, FormatError, LoadMode, RetrievalError, RunStamp, Table, ETL_ACTOR};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use tracing::debug;

pub const CRATE_NAME: &str = "careload-transform";

/// Sentinel written into missing categorical values that have a fill policy.
pub const UNKNOWN: &str = "UNKNOWN";

/// Parses CSV bytes (header row required) into a table. Empty cells become nulls.
///
/// Rows shorter than the header are padded with nulls; longer rows are malformed.
pub fn read_table(key: &str, bytes: &[u8]) -> Result<Table, RetrievalError> {
    let malformed = |reason: String| RetrievalError::Malformed {
        key: key.to_string(),
        reason,
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);

    let headers = reader
        .headers()
        .map_err(|err| malformed(err.to_string()))?
        .iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    for (i, name) in headers.iter().enumerate() {
        if headers[..i].contains(name) {
            return Err(malformed(format!("duplicate column {name:?}")));
        }
    }

    let width = headers.len();
    let mut table = Table::new(headers);
    for record in reader.records() {
        let record = record.map_err(|err| malformed(err.to_string()))?;
        if record.len() > width {
            let line = record.position().map(|p| p.line()).unwrap_or_default();
            return Err(malformed(format!(
                "line {line} has {} fields, header has {width}",
                record.len()
            )));
        }
        table.push_row(
            record
                .iter()
                .map(|cell| (!cell.is_empty()).then(|| cell.to_string()))
                .collect(),
        );
    }
    Ok(table)
}

/// Renders a table as CSV with a header row; nulls are written as empty cells.
pub fn write_table(key: &str, table: &Table) -> Result<Vec<u8>, RetrievalError> {
    let malformed = |reason: String| RetrievalError::Malformed {
        key: key.to_string(),
        reason,
    };

    let mut writer = csv::Writer::from_writer(Vec::new());
    if !table.columns().is_empty() {
        writer
            .write_record(table.columns())
            .map_err(|err| malformed(err.to_string()))?;
    }
    for row in table.rows() {
        writer
            .write_record(row.iter().map(|cell| cell.as_deref().unwrap_or("")))
            .map_err(|err| malformed(err.to_string()))?;
    }
    writer
        .into_inner()
        .map_err(|err| malformed(err.to_string()))
}

/// Normalization applied to every cell of one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellRule {
    Strip,
    Upper,
    Lower,
    /// Fill null/blank with [`UNKNOWN`], then uppercase.
    UpperOrUnknown,
    IsoDate,
    Integer,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnRule {
    pub column: &'static str,
    pub rule: CellRule,
}

const fn rule(column: &'static str, rule: CellRule) -> ColumnRule {
    ColumnRule { column, rule }
}

const PATIENTS_FULL: &[ColumnRule] = &[
    rule("first_name", CellRule::Strip),
    rule("last_name", CellRule::Strip),
    rule("gender", CellRule::UpperOrUnknown),
    rule("email", CellRule::Lower),
    rule("insurance_provider", CellRule::Upper),
    rule("date_of_birth", CellRule::IsoDate),
    rule("registration_date", CellRule::IsoDate),
];

const PATIENTS_DELTA: &[ColumnRule] = &[
    rule("first_name", CellRule::Strip),
    rule("last_name", CellRule::Strip),
    rule("gender", CellRule::UpperOrUnknown),
    rule("email", CellRule::Lower),
    rule("insurance_provider", CellRule::Upper),
];

const DOCTORS_FULL: &[ColumnRule] = &[
    rule("specialization", CellRule::Upper),
    rule("email", CellRule::Lower),
    rule("years_experience", CellRule::Integer),
];

const DOCTORS_DELTA: &[ColumnRule] = &[
    rule("specialization", CellRule::Upper),
    rule("email", CellRule::Lower),
];

// Appointments normalize identically in both modes.
const APPOINTMENTS: &[ColumnRule] = &[
    rule("appointment_date", CellRule::IsoDate),
    rule("status", CellRule::Upper),
];

const TREATMENTS_FULL: &[ColumnRule] = &[
    rule("treatment_type", CellRule::Upper),
    rule("treatment_date", CellRule::IsoDate),
    rule("cost", CellRule::Float),
];

const TREATMENTS_DELTA: &[ColumnRule] = &[rule("treatment_type", CellRule::Upper)];

const BILLING_FULL: &[ColumnRule] = &[
    rule("bill_date", CellRule::IsoDate),
    rule("payment_method", CellRule::Upper),
    rule("payment_status", CellRule::Upper),
    rule("amount", CellRule::Float),
];

const BILLING_DELTA: &[ColumnRule] = &[
    rule("payment_method", CellRule::Upper),
    rule("payment_status", CellRule::Upper),
];

pub fn column_rules(entity: Entity, mode: LoadMode) -> &'static [ColumnRule] {
    match (entity, mode) {
        (Entity::Patients, LoadMode::Full) => PATIENTS_FULL,
        (Entity::Patients, LoadMode::Delta) => PATIENTS_DELTA,
        (Entity::Doctors, LoadMode::Full) => DOCTORS_FULL,
        (Entity::Doctors, LoadMode::Delta) => DOCTORS_DELTA,
        (Entity::Appointments, _) => APPOINTMENTS,
        (Entity::Treatments, LoadMode::Full) => TREATMENTS_FULL,
        (Entity::Treatments, LoadMode::Delta) => TREATMENTS_DELTA,
        (Entity::Billing, LoadMode::Full) => BILLING_FULL,
        (Entity::Billing, LoadMode::Delta) => BILLING_DELTA,
    }
}

/// Normalizes `table` for `entity` under `mode` and stamps the mode's audit columns.
pub fn transform(
    entity: Entity,
    mode: LoadMode,
    mut table: Table,
    stamp: &RunStamp,
) -> Result<Table, FormatError> {
    for column_rule in column_rules(entity, mode) {
        apply_rule(&mut table, column_rule)?;
    }

    let (date_column, actor_column) = mode.audit_columns();
    table.set_constant(date_column, &stamp.formatted());
    table.set_constant(actor_column, ETL_ACTOR);

    debug!(%entity, %mode, rows = table.len(), "normalized table");
    Ok(table)
}

fn apply_rule(table: &mut Table, column_rule: &ColumnRule) -> Result<(), FormatError> {
    let column = column_rule.column;
    match column_rule.rule {
        CellRule::Strip => table.try_map_column(column, |_, v| Ok(v.map(|s| s.trim().to_string()))),
        CellRule::Upper => table.try_map_column(column, |_, v| Ok(v.map(str::to_uppercase))),
        CellRule::Lower => table.try_map_column(column, |_, v| Ok(v.map(str::to_lowercase))),
        CellRule::UpperOrUnknown => table.try_map_column(column, |_, v| {
            Ok(Some(match v {
                Some(s) if !s.trim().is_empty() => s.to_uppercase(),
                _ => UNKNOWN.to_string(),
            }))
        }),
        CellRule::IsoDate => table.try_map_column(column, |row, v| {
            let Some(raw) = v else {
                return Ok(None);
            };
            parse_date(raw)
                .map(|d| Some(d.format("%Y-%m-%d").to_string()))
                .ok_or_else(|| FormatError::InvalidDate {
                    column: column.to_string(),
                    row,
                    value: raw.to_string(),
                })
        }),
        CellRule::Integer => table.try_map_column(column, |row, v| {
            v.and_then(coerce_integer)
                .map(Some)
                .ok_or_else(|| FormatError::InvalidNumber {
                    column: column.to_string(),
                    row,
                    value: v.unwrap_or_default().to_string(),
                })
        }),
        CellRule::Float => table.try_map_column(column, |row, v| {
            let Some(raw) = v else {
                return Ok(None);
            };
            coerce_float(raw)
                .map(Some)
                .ok_or_else(|| FormatError::InvalidNumber {
                    column: column.to_string(),
                    row,
                    value: raw.to_string(),
                })
        }),
    }
}

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%Y.%m.%d",
    "%m/%d/%Y",
    "%m-%d-%Y",
    "%m.%d.%Y",
    "%d-%b-%Y",
    "%d %b %Y",
    "%d %B %Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%Y%m%d",
];

const TIME_FORMATS: &[&str] = &["%H:%M:%S", "%H:%M:%S%.f", "%H:%M"];

/// Parses the date formats seen in source extracts, with or without a trailing time.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.date_naive());
    }
    if let Some(date) = DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
    {
        return Some(date);
    }
    for date_fmt in DATE_FORMATS {
        for sep in [" ", "T"] {
            for time_fmt in TIME_FORMATS {
                let fmt = format!("{date_fmt}{sep}{time_fmt}");
                if let Ok(dt) = NaiveDateTime::parse_from_str(s, &fmt) {
                    return Some(dt.date());
                }
            }
        }
    }
    None
}

/// Integer literal as-is; finite float literal truncated toward zero.
pub fn coerce_integer(raw: &str) -> Option<String> {
    let s = raw.trim();
    if let Ok(n) = s.parse::<i64>() {
        return Some(n.to_string());
    }
    let f = s.parse::<f64>().ok().filter(|f| f.is_finite())?;
    let truncated = f.trunc();
    if truncated < i64::MIN as f64 || truncated > i64::MAX as f64 {
        return None;
    }
    Some((truncated as i64).to_string())
}

/// Canonical float text, the shortest round-trip digits in one of three shapes:
/// integral values below 1e16 keep one decimal (`150.0`), magnitudes at or above 1e16 or
/// below 1e-4 use a signed two-digit exponent (`1e+16`, `1.5e-05`), everything else is
/// plain decimal (`99.95`).
pub fn coerce_float(raw: &str) -> Option<String> {
    let f = raw.trim().parse::<f64>().ok().filter(|f| f.is_finite())?;
    let magnitude = f.abs();
    if magnitude != 0.0 && !(1e-4..1e16).contains(&magnitude) {
        return Some(exponent_form(f));
    }
    if f.fract() == 0.0 {
        Some(format!("{f:.1}"))
    } else {
        Some(format!("{f}"))
    }
}

fn exponent_form(f: f64) -> String {
    let rendered = format!("{f:e}");
    match rendered.split_once('e') {
        Some((mantissa, exp)) => {
            let exp: i32 = exp.parse().unwrap_or_default();
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exp.abs())
        }
        None => rendered,
    }
}
