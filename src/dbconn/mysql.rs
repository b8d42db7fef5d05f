// ABOUTME: MySQL source connection built on SQLx
// ABOUTME: Decodes MySQL result columns into dialect-neutral datums

use super::{Conn, Dialect, Row};
use crate::datum::Datum;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::mysql::{MySqlConnection, MySqlRow};
use sqlx::{Column, Connection, Row as _, TypeInfo, ValueRef};
use std::sync::Arc;
use tokio::sync::Mutex;

/// A single MySQL session.
///
/// The session is held behind a mutex rather than a pool so that a
/// `START TRANSACTION WITH CONSISTENT SNAPSHOT` issued on it stays in effect
/// for every later query.
pub struct MySqlConn {
    id: String,
    url: String,
    conn: Mutex<MySqlConnection>,
}

impl MySqlConn {
    pub async fn connect(id: &str, url: &str) -> Result<Self> {
        let conn = MySqlConnection::connect(url)
            .await
            .with_context(|| format!("Failed to connect to {} MySQL database", id))?;
        tracing::debug!(conn = id, "connected to MySQL");
        Ok(Self {
            id: id.to_string(),
            url: url.to_string(),
            conn: Mutex::new(conn),
        })
    }

    /// Pin this session to a consistent snapshot for the rest of its life.
    pub async fn begin_consistent_snapshot(&self) -> Result<()> {
        self.execute("START TRANSACTION WITH CONSISTENT SNAPSHOT")
            .await
            .context("Failed to start consistent snapshot")?;
        Ok(())
    }
}

#[async_trait]
impl Conn for MySqlConn {
    fn id(&self) -> &str {
        &self.id
    }

    fn dialect(&self) -> Dialect {
        Dialect::MySql
    }

    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        let mut conn = self.conn.lock().await;
        let rows: Vec<MySqlRow> = sqlx::query(sql).fetch_all(&mut *conn).await?;
        rows.iter()
            .map(|row| (0..row.len()).map(|idx| decode_column(row, idx)).collect())
            .collect()
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        let mut conn = self.conn.lock().await;
        let result = sqlx::query(sql).execute(&mut *conn).await?;
        Ok(result.rows_affected())
    }

    async fn clone_conn(&self) -> Result<Arc<dyn Conn>> {
        Ok(Arc::new(MySqlConn::connect(&self.id, &self.url).await?))
    }

    fn as_mysql(&self) -> Option<&MySqlConn> {
        Some(self)
    }
}

/// Decode one column, driven by the column type MySQL reports for the result.
fn decode_column(row: &MySqlRow, idx: usize) -> Result<Datum> {
    if row.try_get_raw(idx)?.is_null() {
        return Ok(Datum::Null);
    }

    let type_name = row.columns()[idx].type_info().name().to_ascii_uppercase();
    let datum = match type_name.as_str() {
        "BOOLEAN" => Datum::Bool(row.try_get::<bool, _>(idx)?),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            Datum::Int(row.try_get::<i64, _>(idx)?)
        }
        "TINYINT UNSIGNED" | "SMALLINT UNSIGNED" | "MEDIUMINT UNSIGNED" | "INT UNSIGNED"
        | "BIGINT UNSIGNED" => {
            let v = row.try_get::<u64, _>(idx)?;
            match i64::try_from(v) {
                Ok(v) => Datum::Int(v),
                Err(_) => Datum::Decimal(rust_decimal::Decimal::from(v)),
            }
        }
        "FLOAT" => Datum::Float(row.try_get::<f32, _>(idx)?.into()),
        "DOUBLE" => Datum::Float(row.try_get::<f64, _>(idx)?),
        "DECIMAL" => Datum::Decimal(row.try_get::<rust_decimal::Decimal, _>(idx)?),
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" => {
            Datum::Bytes(row.try_get::<Vec<u8>, _>(idx)?)
        }
        "DATE" => Datum::Date(row.try_get::<chrono::NaiveDate, _>(idx)?),
        "TIME" => Datum::Time(row.try_get::<chrono::NaiveTime, _>(idx)?),
        "DATETIME" => Datum::Timestamp(row.try_get::<chrono::NaiveDateTime, _>(idx)?),
        "TIMESTAMP" => {
            Datum::TimestampTz(row.try_get::<chrono::DateTime<chrono::Utc>, _>(idx)?)
        }
        "JSON" => Datum::Json(row.try_get::<serde_json::Value, _>(idx)?),
        _ => Datum::Text(row.try_get::<String, _>(idx)?),
    };
    Ok(datum)
}
