//! Column schema resolution and batch conformance
//!
//! A table's schema is resolved exactly once, from its first non-empty batch
//! plus whatever the source declares (header names, `CREATE TABLE` types).
//! Every batch, the first included, is then conformed to that frozen schema:
//! values are coerced to the column type or the batch is rejected with
//! `ExportError::SchemaConflict`.
//!
//! # Inference policy
//!
//! Per column, every value of the first batch is classified into its
//! narrowest type and the classifications are unified:
//!
//! - integer < decimal < float for numeric text
//! - date < timestamp
//! - anything else mixed, or unparseable, is string
//!
//! Null markers (`NULL`, `\N`, empty) never disqualify a stricter type.
//! Integer-looking text with a leading zero (`007`) stays string.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::collections::HashSet;
use tracing::warn;

use crate::error::{ExportError, Result};
use crate::model::{RowBatch, Value};

/// Largest precision an Arrow `Decimal128` can carry
pub const MAX_DECIMAL_PRECISION: u8 = 38;

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

const TIMESTAMP_TZ_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"];

// ============================================================================
// Column Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Boolean,
    Integer,
    Float,
    Decimal { precision: u8, scale: u8 },
    Date,
    Timestamp,
    String,
}

impl ColumnType {
    /// Map a declared SQL column type (from a `CREATE TABLE` body) to a
    /// column type. Returns `None` when the declaration says nothing useful.
    pub fn from_sql(declared: &str) -> Option<ColumnType> {
        let lower = declared.trim().to_ascii_lowercase();
        let base_end = lower
            .find(|c: char| c == '(' || c.is_whitespace())
            .unwrap_or(lower.len());
        let base = &lower[..base_end];
        let args: Vec<u32> = lower[base_end..]
            .trim_start()
            .strip_prefix('(')
            .and_then(|rest| rest.split_once(')'))
            .map(|(inner, _)| {
                inner
                    .split(',')
                    .filter_map(|a| a.trim().parse().ok())
                    .collect()
            })
            .unwrap_or_default();
        let unsigned = lower.contains("unsigned");

        match base {
            "bool" | "boolean" => Some(ColumnType::Boolean),
            "tinyint" if args.first() == Some(&1) => Some(ColumnType::Boolean),
            "bit" if args.is_empty() || args.first() == Some(&1) => Some(ColumnType::Boolean),
            "bigint" | "int8" | "bigserial" if unsigned => Some(ColumnType::Decimal {
                precision: 20,
                scale: 0,
            }),
            "int" | "integer" | "tinyint" | "smallint" | "mediumint" | "bigint" | "int2"
            | "int4" | "int8" | "serial" | "smallserial" | "bigserial" => Some(ColumnType::Integer),
            "decimal" | "numeric" | "dec" | "fixed" => match args.as_slice() {
                [p] if *p >= 1 && *p <= MAX_DECIMAL_PRECISION as u32 => Some(ColumnType::Decimal {
                    precision: *p as u8,
                    scale: 0,
                }),
                [p, s] if *p >= 1 && *p <= MAX_DECIMAL_PRECISION as u32 && s <= p => {
                    Some(ColumnType::Decimal {
                        precision: *p as u8,
                        scale: *s as u8,
                    })
                },
                _ => None,
            },
            "float" | "double" | "real" | "float4" | "float8" => Some(ColumnType::Float),
            "date" => Some(ColumnType::Date),
            "datetime" | "timestamp" | "timestamptz" => Some(ColumnType::Timestamp),
            "char" | "varchar" | "character" | "nchar" | "nvarchar" | "text" | "tinytext"
            | "mediumtext" | "longtext" | "clob" | "enum" | "set" | "json" | "jsonb" | "uuid" => {
                Some(ColumnType::String)
            },
            _ => None,
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnType::Boolean => f.write_str("boolean"),
            ColumnType::Integer => f.write_str("integer"),
            ColumnType::Float => f.write_str("float"),
            ColumnType::Decimal { precision, scale } => {
                write!(f, "decimal({},{})", precision, scale)
            },
            ColumnType::Date => f.write_str("date"),
            ColumnType::Timestamp => f.write_str("timestamp"),
            ColumnType::String => f.write_str("string"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub data_type: ColumnType,
}

/// Declared metadata a source can offer before inference
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaHints {
    /// Column names (header row, dump column list, query result columns)
    pub names: Option<Vec<String>>,
    /// Declared types by position; `None` entries are inferred
    pub declared_types: Option<Vec<Option<ColumnType>>>,
    /// Hints come from metadata that may not match the data (a dump's
    /// `CREATE TABLE`). A width mismatch drops them instead of failing.
    pub advisory: bool,
}

impl SchemaHints {
    pub fn with_names(names: Vec<String>) -> Self {
        Self {
            names: Some(names),
            ..Self::default()
        }
    }

    pub fn declared(names: Vec<String>, declared_types: Vec<Option<ColumnType>>) -> Self {
        Self {
            names: Some(names),
            declared_types: Some(declared_types),
            advisory: true,
        }
    }

    pub fn advisory(mut self) -> Self {
        self.advisory = true;
        self
    }

    fn declared_width(&self) -> Option<usize> {
        self.names
            .as_ref()
            .map(Vec::len)
            .or_else(|| self.declared_types.as_ref().map(Vec::len))
    }
}

// ============================================================================
// Frozen Schema
// ============================================================================

/// Ordered, frozen column set for one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSchema {
    columns: Vec<Column>,
}

impl ColumnSchema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Coerce every value of `batch` to its column type
    ///
    /// `first_row` is the table-wide index of the batch's first row and is
    /// only used to locate conflicts in error messages.
    pub fn conform(&self, batch: RowBatch, first_row: u64) -> Result<RowBatch> {
        let mut conformed = RowBatch::with_capacity(batch.len());

        for (offset, row) in batch.into_rows().into_iter().enumerate() {
            let row_number = first_row + offset as u64;
            if row.len() != self.columns.len() {
                return Err(ExportError::SchemaConflict {
                    column: "*".to_string(),
                    row: row_number,
                    detail: format!(
                        "expected {} columns, found {}",
                        self.columns.len(),
                        row.len()
                    ),
                });
            }

            let mut out = Vec::with_capacity(row.len());
            for (value, column) in row.into_iter().zip(&self.columns) {
                match coerce(&value, column.data_type) {
                    Some(v) => out.push(v),
                    None => {
                        return Err(ExportError::SchemaConflict {
                            column: column.name.clone(),
                            row: row_number,
                            detail: format!("value '{}' is not {}", value, column.data_type),
                        })
                    },
                }
            }
            conformed.push(out);
        }

        Ok(conformed)
    }
}

// ============================================================================
// Resolver
// ============================================================================

pub struct SchemaResolver;

impl SchemaResolver {
    /// Derive the frozen schema for a table from its first batch
    ///
    /// The resulting schema always has as many columns as the batch's rows.
    /// Resolution is deterministic: the same batch and hints give the same
    /// schema.
    pub fn resolve(first_batch: &RowBatch, hints: &SchemaHints) -> Result<ColumnSchema> {
        let width = match first_batch.rows().first() {
            Some(row) => row.len(),
            None => hints.names.as_ref().map(Vec::len).unwrap_or(0),
        };

        if width == 0 {
            return Err(ExportError::SchemaConflict {
                column: "*".to_string(),
                row: 0,
                detail: "first batch has no columns".to_string(),
            });
        }

        for (index, row) in first_batch.rows().iter().enumerate() {
            if row.len() != width {
                return Err(ExportError::SchemaConflict {
                    column: "*".to_string(),
                    row: index as u64,
                    detail: format!("expected {} columns, found {}", width, row.len()),
                });
            }
        }

        let ignored = SchemaHints::default();
        let hints = match hints.declared_width() {
            Some(declared) if declared != width => {
                if !hints.advisory {
                    return Err(ExportError::SchemaConflict {
                        column: "*".to_string(),
                        row: 0,
                        detail: format!(
                            "source declares {} columns but rows have {}",
                            declared, width
                        ),
                    });
                }
                warn!(
                    declared,
                    width, "Declared columns do not match the rows, inferring instead"
                );
                &ignored
            },
            _ => hints,
        };

        let names = normalize_names(hints.names.as_deref().unwrap_or(&[]), width);
        let columns = names
            .into_iter()
            .enumerate()
            .map(|(index, name)| {
                let declared = hints
                    .declared_types
                    .as_ref()
                    .and_then(|types| types.get(index).copied().flatten());
                let data_type = resolve_column(first_batch, index, &name, declared);
                Column { name, data_type }
            })
            .collect();

        Ok(ColumnSchema::new(columns))
    }
}

fn resolve_column(
    batch: &RowBatch,
    index: usize,
    name: &str,
    declared: Option<ColumnType>,
) -> ColumnType {
    if let Some(declared) = declared {
        if batch
            .column(index)
            .all(|value| coerce(value, declared).is_some())
        {
            return declared;
        }
        warn!(
            column = %name,
            declared = %declared,
            "Values do not match declared type, inferring instead"
        );
    }

    infer_column(batch.column(index))
}

/// Infer a column type from its values
pub fn infer_column<'a>(values: impl Iterator<Item = &'a Value>) -> ColumnType {
    let mut unified: Option<ColumnType> = None;
    let mut max_int_digits: u32 = 0;

    for value in values {
        let Some(observed) = classify(value) else {
            continue;
        };
        max_int_digits = max_int_digits.max(observed.int_digits);
        unified = Some(match unified {
            None => observed.data_type,
            Some(current) => unify(current, observed.data_type),
        });
        if unified == Some(ColumnType::String) {
            break;
        }
    }

    match unified {
        None => ColumnType::String,
        Some(ColumnType::Decimal { scale, .. }) => {
            let precision = (max_int_digits + scale as u32).max(1);
            if precision > MAX_DECIMAL_PRECISION as u32 {
                ColumnType::Float
            } else {
                ColumnType::Decimal {
                    precision: precision as u8,
                    scale,
                }
            }
        },
        Some(other) => other,
    }
}

struct Observed {
    data_type: ColumnType,
    int_digits: u32,
}

fn classify(value: &Value) -> Option<Observed> {
    let observed = |data_type| Observed {
        data_type,
        int_digits: 0,
    };

    match value {
        Value::Null => None,
        Value::Bool(_) => Some(observed(ColumnType::Boolean)),
        Value::Int(i) => Some(Observed {
            data_type: ColumnType::Integer,
            int_digits: digit_count(i.unsigned_abs() as u128),
        }),
        Value::Float(_) => Some(observed(ColumnType::Float)),
        Value::Decimal(d) => Some(Observed {
            data_type: ColumnType::Decimal {
                precision: MAX_DECIMAL_PRECISION,
                scale: 0,
            },
            int_digits: digit_count(d.unsigned_abs()),
        }),
        Value::Date(_) => Some(observed(ColumnType::Date)),
        Value::Timestamp(_) => Some(observed(ColumnType::Timestamp)),
        Value::Text(s) => classify_text(s),
    }
}

fn classify_text(raw: &str) -> Option<Observed> {
    let text = raw.trim();
    if is_null_marker(text) {
        return None;
    }

    let string = Observed {
        data_type: ColumnType::String,
        int_digits: 0,
    };

    if text.eq_ignore_ascii_case("true") || text.eq_ignore_ascii_case("false") {
        return Some(Observed {
            data_type: ColumnType::Boolean,
            int_digits: 0,
        });
    }

    if let Some(number) = PlainNumber::parse(text) {
        if number.has_leading_zero() {
            return Some(string);
        }
        let int_digits = number.significant_int_digits().len() as u32;
        let data_type = if !number.has_point && text.parse::<i64>().is_ok() {
            ColumnType::Integer
        } else {
            ColumnType::Decimal {
                precision: MAX_DECIMAL_PRECISION,
                scale: number.frac.len().min(u8::MAX as usize) as u8,
            }
        };
        return Some(Observed {
            data_type,
            int_digits,
        });
    }

    if parse_float_text(text).is_some() {
        return Some(Observed {
            data_type: ColumnType::Float,
            int_digits: 0,
        });
    }

    if parse_date(text).is_some() {
        return Some(Observed {
            data_type: ColumnType::Date,
            int_digits: 0,
        });
    }

    if parse_timestamp(text).is_some() {
        return Some(Observed {
            data_type: ColumnType::Timestamp,
            int_digits: 0,
        });
    }

    Some(string)
}

/// Least general type able to hold both inputs; string beats everything
fn unify(a: ColumnType, b: ColumnType) -> ColumnType {
    use ColumnType::*;

    match (a, b) {
        (x, y) if x == y => x,
        (Integer, Float) | (Float, Integer) => Float,
        (Decimal { .. }, Float) | (Float, Decimal { .. }) => Float,
        (Integer, d @ Decimal { .. }) | (d @ Decimal { .. }, Integer) => d,
        (Decimal { scale: s1, .. }, Decimal { scale: s2, .. }) => Decimal {
            precision: MAX_DECIMAL_PRECISION,
            scale: s1.max(s2),
        },
        (Date, Timestamp) | (Timestamp, Date) => Timestamp,
        _ => String,
    }
}

fn normalize_names(declared: &[String], width: usize) -> Vec<String> {
    let mut seen = HashSet::new();

    (0..width)
        .map(|index| {
            let base = declared
                .get(index)
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| format!("column_{}", index + 1));

            let mut name = base.clone();
            let mut suffix = 2;
            while !seen.insert(name.to_lowercase()) {
                name = format!("{}_{}", base, suffix);
                suffix += 1;
            }
            name
        })
        .collect()
}

// ============================================================================
// Value Coercion
// ============================================================================

pub fn is_null_marker(text: &str) -> bool {
    text.is_empty() || text.eq_ignore_ascii_case("null") || text == "\\N"
}

/// Coerce a value into the canonical variant for `target`
///
/// Returns `None` when the value cannot be represented without loss.
pub fn coerce(value: &Value, target: ColumnType) -> Option<Value> {
    if let Value::Text(s) = value {
        if target != ColumnType::String && is_null_marker(s.trim()) {
            return Some(Value::Null);
        }
    }

    match (target, value) {
        (_, Value::Null) => Some(Value::Null),

        (ColumnType::String, Value::Text(s)) => Some(Value::Text(s.clone())),
        (ColumnType::String, other) => Some(Value::Text(other.to_string())),

        (ColumnType::Boolean, Value::Bool(b)) => Some(Value::Bool(*b)),
        (ColumnType::Boolean, Value::Int(0)) => Some(Value::Bool(false)),
        (ColumnType::Boolean, Value::Int(1)) => Some(Value::Bool(true)),
        (ColumnType::Boolean, Value::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "1" => Some(Value::Bool(true)),
            "false" | "f" | "0" => Some(Value::Bool(false)),
            _ => None,
        },

        (ColumnType::Integer, Value::Int(i)) => Some(Value::Int(*i)),
        (ColumnType::Integer, Value::Text(s)) => s.trim().parse().ok().map(Value::Int),

        (ColumnType::Float, Value::Float(x)) => Some(Value::Float(*x)),
        (ColumnType::Float, Value::Int(i)) => Some(Value::Float(*i as f64)),
        (ColumnType::Float, Value::Text(s)) => parse_float_text(s.trim()).map(Value::Float),

        (ColumnType::Decimal { precision, scale }, Value::Decimal(d)) if scale == 0 => {
            (digit_count(d.unsigned_abs()) <= precision as u32).then_some(Value::Decimal(*d))
        },
        (ColumnType::Decimal { precision, scale }, Value::Int(i)) => {
            parse_scaled_decimal(&i.to_string(), precision, scale).map(Value::Decimal)
        },
        (ColumnType::Decimal { precision, scale }, Value::Float(x)) if x.is_finite() => {
            parse_scaled_decimal(&x.to_string(), precision, scale).map(Value::Decimal)
        },
        (ColumnType::Decimal { precision, scale }, Value::Text(s)) => {
            parse_scaled_decimal(s.trim(), precision, scale).map(Value::Decimal)
        },

        (ColumnType::Date, Value::Date(d)) => Some(Value::Date(*d)),
        (ColumnType::Date, Value::Text(s)) => parse_date(s.trim()).map(Value::Date),

        (ColumnType::Timestamp, Value::Timestamp(ts)) => Some(Value::Timestamp(*ts)),
        (ColumnType::Timestamp, Value::Date(d)) => d.and_hms_opt(0, 0, 0).map(Value::Timestamp),
        (ColumnType::Timestamp, Value::Text(s)) => {
            let text = s.trim();
            parse_timestamp(text)
                .or_else(|| parse_date(text).and_then(|d| d.and_hms_opt(0, 0, 0)))
                .map(Value::Timestamp)
        },

        _ => None,
    }
}

/// Fixed-point numeric text: optional sign, digits, optional fraction
struct PlainNumber<'a> {
    negative: bool,
    int: &'a str,
    frac: &'a str,
    has_point: bool,
}

impl<'a> PlainNumber<'a> {
    fn parse(text: &'a str) -> Option<Self> {
        let (negative, body) = match text.as_bytes().first()? {
            b'-' => (true, &text[1..]),
            b'+' => (false, &text[1..]),
            _ => (false, text),
        };
        let (int, frac, has_point) = match body.split_once('.') {
            Some((i, f)) => (i, f, true),
            None => (body, "", false),
        };

        if int.is_empty() && frac.is_empty() {
            return None;
        }
        if !int.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        Some(Self {
            negative,
            int,
            frac,
            has_point,
        })
    }

    fn has_leading_zero(&self) -> bool {
        self.int.len() > 1 && self.int.starts_with('0')
    }

    fn significant_int_digits(&self) -> &'a str {
        self.int.trim_start_matches('0')
    }
}

fn parse_scaled_decimal(text: &str, precision: u8, scale: u8) -> Option<i128> {
    let number = PlainNumber::parse(text)?;
    let frac = number.frac.trim_end_matches('0');
    let int = number.significant_int_digits();

    if frac.len() > scale as usize || int.len() + scale as usize > precision as usize {
        return None;
    }

    let mut digits = String::with_capacity(int.len() + scale as usize);
    digits.push_str(int);
    digits.push_str(frac);
    for _ in frac.len()..scale as usize {
        digits.push('0');
    }

    let unscaled: i128 = if digits.is_empty() {
        0
    } else {
        digits.parse().ok()?
    };
    Some(if number.negative { -unscaled } else { unscaled })
}

fn parse_float_text(text: &str) -> Option<f64> {
    let plausible = text.bytes().any(|b| b.is_ascii_digit())
        && text
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.' | b'e' | b'E'));
    if !plausible {
        return None;
    }
    text.parse().ok()
}

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").ok()
}

pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.naive_utc())
        })
        .or_else(|| {
            TIMESTAMP_TZ_FORMATS
                .iter()
                .find_map(|fmt| DateTime::parse_from_str(text, fmt).ok())
                .map(|dt| dt.naive_utc())
        })
}

fn digit_count(mut n: u128) -> u32 {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}
