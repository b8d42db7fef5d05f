// ABOUTME: Dialect-neutral SQL values and their cross-dialect comparison rules
// ABOUTME: Also renders datums as SQL literals and as CSV export fields

use crate::dbconn::Dialect;
use crate::error::MoltError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// One decoded column value.
///
/// Values the decoders do not understand natively (intervals, enums, arrays,
/// network types) are selected as text, which yields Postgres-style
/// renderings on both sides of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
    Json(serde_json::Value),
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    /// Short type-family name used in error messages.
    pub fn family(&self) -> &'static str {
        match self {
            Datum::Null => "null",
            Datum::Bool(_) => "bool",
            Datum::Int(_) => "int",
            Datum::Float(_) => "float",
            Datum::Decimal(_) => "decimal",
            Datum::Text(_) => "string",
            Datum::Bytes(_) => "bytes",
            Datum::Uuid(_) => "uuid",
            Datum::Timestamp(_) => "timestamp",
            Datum::TimestampTz(_) => "timestamptz",
            Datum::Date(_) => "date",
            Datum::Time(_) => "time",
            Datum::Json(_) => "json",
        }
    }

    /// Compare two datums under a fixed UTC context.
    ///
    /// NULL sorts first. Bool against int compares the int as a bool, uuid
    /// against string parses the string, numeric families compare by value
    /// and timestamps compare as UTC instants. Any other pairing is an error.
    pub fn compare(&self, other: &Datum) -> Result<Ordering, MoltError> {
        use Datum::*;

        let ord = match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,

            (Bool(a), Bool(b)) => a.cmp(b),
            (Bool(a), Int(b)) => a.cmp(&(*b != 0)),
            (Int(a), Bool(b)) => (*a != 0).cmp(b),

            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => compare_floats(*a, *b),
            (Int(a), Float(b)) => compare_floats(*a as f64, *b),
            (Float(a), Int(b)) => compare_floats(*a, *b as f64),
            (Decimal(a), Decimal(b)) => a.cmp(b),
            (Int(a), Decimal(b)) => rust_decimal::Decimal::from(*a).cmp(b),
            (Decimal(a), Int(b)) => a.cmp(&rust_decimal::Decimal::from(*b)),
            (Float(a), Decimal(b)) => compare_floats(*a, b.to_f64().unwrap_or(f64::NAN)),
            (Decimal(a), Float(b)) => compare_floats(a.to_f64().unwrap_or(f64::NAN), *b),

            (Text(a), Text(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Bytes(a), Bytes(b)) => a.cmp(b),

            (Uuid(a), Uuid(b)) => a.cmp(b),
            (Uuid(a), Text(b)) => a.cmp(&parse_uuid(b, self, other)?),
            (Text(a), Uuid(b)) => parse_uuid(a, self, other)?.cmp(b),

            (Timestamp(a), Timestamp(b)) => a.cmp(b),
            (TimestampTz(a), TimestampTz(b)) => a.cmp(b),
            (Timestamp(a), TimestampTz(b)) => a.and_utc().cmp(b),
            (TimestampTz(a), Timestamp(b)) => a.cmp(&b.and_utc()),
            (Date(a), Date(b)) => a.cmp(b),
            (Time(a), Time(b)) => a.cmp(b),

            (Json(a), Json(b)) => a.to_string().cmp(&b.to_string()),
            (Json(a), Text(b)) => a.to_string().cmp(&canonical_json(b, self, other)?),
            (Text(a), Json(b)) => canonical_json(a, self, other)?.cmp(&b.to_string()),

            _ => return Err(incomparable(self, other)),
        };
        Ok(ord)
    }

    /// Render as a SQL literal for the given dialect.
    pub fn to_sql_literal(&self, dialect: Dialect) -> String {
        match self {
            Datum::Null => "NULL".to_string(),
            Datum::Bool(b) => b.to_string(),
            Datum::Int(i) => i.to_string(),
            Datum::Float(f) if f.is_finite() => format!("{:?}", f),
            Datum::Float(f) => dialect.quote_literal(&f.to_string()),
            Datum::Decimal(d) => d.to_string(),
            Datum::Text(s) => dialect.quote_literal(s),
            Datum::Bytes(b) => match dialect {
                Dialect::MySql => format!("X'{}'", hex(b)),
                Dialect::Postgres | Dialect::CockroachDb => format!("'\\x{}'", hex(b)),
            },
            Datum::Uuid(u) => dialect.quote_literal(&u.to_string()),
            Datum::Timestamp(_)
            | Datum::TimestampTz(_)
            | Datum::Date(_)
            | Datum::Time(_)
            | Datum::Json(_) => dialect.quote_literal(&self.to_string()),
        }
    }

    /// Render as a field of a Postgres-compatible CSV file.
    ///
    /// NULL becomes the empty field, which is what COPY and IMPORT read back
    /// as NULL.
    pub fn to_csv_field(&self) -> String {
        match self {
            Datum::Null => String::new(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Null => f.write_str("NULL"),
            Datum::Bool(b) => write!(f, "{}", b),
            Datum::Int(i) => write!(f, "{}", i),
            Datum::Float(v) if v.is_nan() => f.write_str("NaN"),
            Datum::Float(v) if v.is_infinite() && *v > 0.0 => f.write_str("Infinity"),
            Datum::Float(v) if v.is_infinite() => f.write_str("-Infinity"),
            Datum::Float(v) => write!(f, "{}", v),
            Datum::Decimal(d) => write!(f, "{}", d),
            Datum::Text(s) => f.write_str(s),
            Datum::Bytes(b) => write!(f, "\\x{}", hex(b)),
            Datum::Uuid(u) => write!(f, "{}", u),
            Datum::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.f")),
            Datum::TimestampTz(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.f+00:00")),
            Datum::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Datum::Time(t) => write!(f, "{}", t.format("%H:%M:%S%.f")),
            Datum::Json(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for Datum {
    fn from(v: i64) -> Self {
        Datum::Int(v)
    }
}

impl From<&str> for Datum {
    fn from(v: &str) -> Self {
        Datum::Text(v.to_string())
    }
}

impl From<Uuid> for Datum {
    fn from(v: Uuid) -> Self {
        Datum::Uuid(v)
    }
}

/// Compare two row prefixes column by column.
pub fn compare_rows(a: &[Datum], b: &[Datum]) -> Result<Ordering, MoltError> {
    for (x, y) in a.iter().zip(b.iter()) {
        match x.compare(y)? {
            Ordering::Equal => continue,
            ord => return Ok(ord),
        }
    }
    Ok(a.len().cmp(&b.len()))
}

/// Quote a string as a single-quoted literal for a Postgres-wire session.
pub fn quote_literal(s: &str) -> String {
    Dialect::Postgres.quote_literal(s)
}

fn compare_floats(a: f64, b: f64) -> Ordering {
    // NaN sorts after every other value and equals itself, as in Postgres.
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn parse_uuid(s: &str, left: &Datum, right: &Datum) -> Result<Uuid, MoltError> {
    Uuid::parse_str(s.trim()).map_err(|_| incomparable(left, right))
}

fn canonical_json(s: &str, left: &Datum, right: &Datum) -> Result<String, MoltError> {
    serde_json::from_str::<serde_json::Value>(s)
        .map(|v| v.to_string())
        .map_err(|_| incomparable(left, right))
}

fn incomparable(left: &Datum, right: &Datum) -> MoltError {
    MoltError::Incomparable {
        left: left.family().to_string(),
        right: right.family().to_string(),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
