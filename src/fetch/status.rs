// ABOUTME: Run status and exception bookkeeping tables on the target
// ABOUTME: Exception rows double as continuation tokens for resuming failed tables

use crate::dbtable::TableName;
use crate::error::MoltError;
use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;
use tokio_postgres::Client;
use uuid::Uuid;

pub const STATUS_IN_PROGRESS: &str = "IN PROGRESS";
pub const STATUS_FAILED: &str = "FAILED";
pub const STATUS_SUCCEEDED: &str = "SUCCEEDED";

pub const STAGE_SCHEMA_CREATION: &str = "schema_creation";
pub const STAGE_DATA_LOAD: &str = "data_load";

const DEFAULT_NUM_TOKENS: i64 = 10;

/// undefined_object; never worth a continuation token.
const EXCLUDED_SQL_STATE: &str = "42704";

const CREATE_STATUS_TABLE: &str = "CREATE TABLE IF NOT EXISTS _molt_fetch_status (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    name STRING,
    status STRING,
    started_at TIMESTAMP,
    finished_at TIMESTAMP,
    source_dialect STRING
)";

const CREATE_EXCEPTION_TABLE: &str = "CREATE TABLE IF NOT EXISTS _molt_fetch_exception (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    fetch_id UUID NOT NULL REFERENCES _molt_fetch_status (id),
    table_name STRING,
    schema_name STRING,
    message STRING,
    sql_state STRING,
    file_name STRING,
    command STRING,
    stage STRING,
    time TIMESTAMP,
    INDEX(fetch_id, sql_state)
)";

const EXCEPTION_COLUMNS: &str =
    "id, fetch_id, table_name, schema_name, message, sql_state, file_name, command, stage, time";

pub async fn create_status_and_exception_tables(client: &Client) -> Result<()> {
    client
        .batch_execute(CREATE_STATUS_TABLE)
        .await
        .context("Failed to create _molt_fetch_status")?;
    client
        .batch_execute(CREATE_EXCEPTION_TABLE)
        .await
        .context("Failed to create _molt_fetch_exception")?;
    Ok(())
}

/// One fetch run.
#[derive(Debug, Clone, Default)]
pub struct FetchStatus {
    pub id: Uuid,
    pub name: String,
    pub status: String,
    pub started_at: Option<NaiveDateTime>,
    pub finished_at: Option<NaiveDateTime>,
    pub source_dialect: String,
}

impl FetchStatus {
    pub fn new(name: impl Into<String>, source_dialect: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_dialect: source_dialect.into(),
            ..Default::default()
        }
    }

    pub async fn create_entry(&mut self, client: &Client) -> Result<()> {
        let started_at = Utc::now().naive_utc();
        let row = client
            .query_one(
                "INSERT INTO _molt_fetch_status (name, status, started_at, source_dialect) \
                 VALUES ($1, $2, $3, $4) RETURNING id, status",
                &[&self.name, &STATUS_IN_PROGRESS, &started_at, &self.source_dialect],
            )
            .await
            .context("Failed to create fetch status entry")?;
        self.id = row.try_get(0)?;
        self.status = row.try_get(1)?;
        self.started_at = Some(started_at);
        Ok(())
    }

    pub async fn mark_successful(&mut self, client: &Client) -> Result<()> {
        self.mark_complete(client, STATUS_SUCCEEDED).await
    }

    pub async fn mark_failed(&mut self, client: &Client) -> Result<()> {
        self.mark_complete(client, STATUS_FAILED).await
    }

    async fn mark_complete(&mut self, client: &Client, status: &str) -> Result<()> {
        let finished_at = Utc::now().naive_utc();
        client
            .execute(
                "UPDATE _molt_fetch_status SET status = $1, finished_at = $2 WHERE id = $3",
                &[&status, &finished_at, &self.id],
            )
            .await
            .with_context(|| format!("Failed to mark fetch {} as {}", self.id, status))?;
        self.status = status.to_string();
        self.finished_at = Some(finished_at);
        Ok(())
    }
}

/// A recorded failure for one table; its id is the continuation token.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExceptionLog {
    pub id: Uuid,
    pub fetch_id: Uuid,
    pub table: String,
    pub schema: String,
    pub message: String,
    pub sql_state: String,
    pub file_name: String,
    pub command: String,
    pub stage: String,
    pub time: Option<NaiveDateTime>,
}

impl ExceptionLog {
    /// `schema.table`, the key used to match tokens to tables.
    pub fn table_key(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    fn from_row(row: &tokio_postgres::Row) -> Result<Self> {
        let text = |idx: usize| -> Result<String> {
            Ok(row.try_get::<_, Option<String>>(idx)?.unwrap_or_default())
        };
        Ok(Self {
            id: row.try_get(0)?,
            fetch_id: row.try_get(1)?,
            table: text(2)?,
            schema: text(3)?,
            message: text(4)?,
            sql_state: text(5)?,
            file_name: text(6)?,
            command: text(7)?,
            stage: text(8)?,
            time: row.try_get(9)?,
        })
    }

    /// Insert this entry. A preset `time` is kept, otherwise now is used.
    pub async fn create_entry(&mut self, client: &Client, stage: &str) -> Result<()> {
        let time = self.time.unwrap_or_else(|| Utc::now().naive_utc());
        let sql_state = non_empty(&self.sql_state);
        let file_name = non_empty(&self.file_name);
        let row = client
            .query_one(
                "INSERT INTO _molt_fetch_exception \
                 (fetch_id, table_name, schema_name, message, sql_state, file_name, command, stage, time) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING id, stage",
                &[
                    &self.fetch_id,
                    &self.table,
                    &self.schema,
                    &self.message,
                    &sql_state,
                    &file_name,
                    &self.command,
                    &stage,
                    &time,
                ],
            )
            .await
            .context("Failed to create exception entry")?;
        self.id = row.try_get(0)?;
        self.stage = row.try_get::<_, Option<String>>(1)?.unwrap_or_default();
        self.time = Some(time);
        Ok(())
    }

    pub async fn update_entry(
        &mut self,
        client: &Client,
        message: &str,
        sql_state: &str,
        file_name: &str,
    ) -> Result<()> {
        let time = Utc::now().naive_utc();
        client
            .execute(
                "UPDATE _molt_fetch_exception \
                 SET message = $1, sql_state = $2, file_name = $3, time = $4 WHERE id = $5",
                &[&message, &sql_state, &file_name, &time, &self.id],
            )
            .await
            .with_context(|| format!("Failed to update exception {}", self.id))?;
        self.message = message.to_string();
        self.sql_state = sql_state.to_string();
        self.file_name = file_name.to_string();
        self.time = Some(time);
        Ok(())
    }

    /// Remove the entry once its table has been loaded on a resumed run.
    pub async fn delete_entry(&self, client: &Client) -> Result<()> {
        client
            .execute("DELETE FROM _molt_fetch_exception WHERE id = $1", &[&self.id])
            .await
            .with_context(|| format!("Failed to delete exception {}", self.id))?;
        Ok(())
    }
}

fn non_empty(s: &str) -> Option<&str> {
    (!s.trim().is_empty()).then_some(s)
}

/// Clear every continuation token; done at the start of a fresh run.
pub async fn delete_all_exception_logs(client: &Client) -> Result<()> {
    client
        .batch_execute("TRUNCATE _molt_fetch_exception")
        .await
        .context("Failed to clear exception logs")?;
    Ok(())
}

pub async fn get_exception_log_by_token(client: &Client, token: &str) -> Result<ExceptionLog> {
    let id = Uuid::parse_str(token)
        .map_err(|_| MoltError::Continuation(format!("invalid continuation token {}", token)))?;
    let row = client
        .query_opt(
            &format!(
                "SELECT {} FROM _molt_fetch_exception WHERE id = $1",
                EXCEPTION_COLUMNS
            ),
            &[&id],
        )
        .await
        .context("Failed to look up continuation token")?
        .ok_or_else(|| {
            MoltError::Continuation(format!("no exception logs for continuation-token {}", token))
        })?;
    ExceptionLog::from_row(&row)
}

/// The most recently named tokens, `num_results` of them (10 when zero).
pub async fn get_all_exception_logs(client: &Client, num_results: i64) -> Result<Vec<ExceptionLog>> {
    let limit = if num_results <= 0 {
        DEFAULT_NUM_TOKENS
    } else {
        num_results
    };
    let rows = client
        .query(
            "SELECT id, fetch_id, table_name, schema_name, file_name, time \
             FROM _molt_fetch_exception ORDER BY table_name DESC LIMIT $1",
            &[&limit],
        )
        .await
        .context("Failed to list continuation tokens")?;
    rows.iter()
        .map(|row| {
            Ok(ExceptionLog {
                id: row.try_get(0)?,
                fetch_id: row.try_get(1)?,
                table: row.try_get::<_, Option<String>>(2)?.unwrap_or_default(),
                schema: row.try_get::<_, Option<String>>(3)?.unwrap_or_default(),
                file_name: row.try_get::<_, Option<String>>(4)?.unwrap_or_default(),
                time: row.try_get(5)?,
                ..Default::default()
            })
        })
        .collect()
}

/// Latest exception per table for a run.
pub async fn get_all_exception_logs_by_fetch_id(
    client: &Client,
    fetch_id: Uuid,
) -> Result<Vec<ExceptionLog>> {
    let rows = client
        .query(
            &format!(
                "SELECT DISTINCT ON (schema_name, table_name) {} \
                 FROM _molt_fetch_exception WHERE fetch_id = $1 \
                 ORDER BY schema_name, table_name, time DESC",
                EXCEPTION_COLUMNS
            ),
            &[&fetch_id],
        )
        .await
        .with_context(|| format!("Failed to load exception logs for fetch {}", fetch_id))?;
    rows.iter().map(ExceptionLog::from_row).collect()
}

/// Index exception logs by `schema.table`.
pub fn table_to_exception_log(
    logs: Vec<ExceptionLog>,
) -> std::collections::HashMap<String, ExceptionLog> {
    logs.into_iter().map(|e| (e.table_key(), e)).collect()
}

/// Find a chunk file name inside an error message.
pub fn extract_file_name_from_err(msg: &str) -> String {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"part_\d{8}(\.csv|\.tar\.gz)").ok())
        .as_ref()
        .and_then(|re| re.find(msg))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

/// The parts of a database error worth persisting.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportableError {
    pub message: String,
    pub sql_state: String,
    pub file_name: String,
    pub command: String,
}

/// Pull a SQLSTATE-bearing failure out of an error chain.
///
/// Only database errors are reportable; anything else (I/O, cancellation,
/// assertions) is left for the caller to surface.
pub fn reportable(err: &anyhow::Error) -> Option<ReportableError> {
    for cause in err.chain() {
        if let Some(MoltError::Import {
            file,
            sql_state: Some(state),
            command,
            message,
        }) = cause.downcast_ref::<MoltError>()
        {
            return Some(ReportableError {
                message: message.clone(),
                sql_state: state.clone(),
                file_name: file.clone(),
                command: command.clone(),
            });
        }
        if let Some(db) = cause
            .downcast_ref::<tokio_postgres::Error>()
            .and_then(|e| e.as_db_error())
        {
            return Some(ReportableError {
                message: format!("{}; {}", db.message(), db.detail().unwrap_or_default()),
                sql_state: db.code().code().to_string(),
                file_name: String::new(),
                command: String::new(),
            });
        }
    }
    None
}

/// Records failures of one table against the run's exception table.
///
/// On a fresh run the first report creates the token. On a resumed run the
/// existing token is updated in place.
pub struct ExceptionTracker {
    fetch_id: Uuid,
    table: TableName,
    existing: Option<ExceptionLog>,
}

impl ExceptionTracker {
    pub fn new(fetch_id: Uuid, table: TableName, existing: Option<ExceptionLog>) -> Self {
        Self {
            fetch_id,
            table,
            existing,
        }
    }

    pub fn existing(&self) -> Option<&ExceptionLog> {
        self.existing.as_ref()
    }

    /// Persist `err` when it is a reportable database error, then hand it back.
    pub async fn maybe_report(
        &mut self,
        client: &Client,
        err: anyhow::Error,
        file_name: &str,
        stage: &str,
    ) -> anyhow::Error {
        let Some(mut details) = reportable(&err) else {
            return err;
        };
        if details.sql_state == EXCLUDED_SQL_STATE {
            return err;
        }
        if !file_name.is_empty() {
            details.file_name = file_name.to_string();
        }
        if details.file_name.is_empty() {
            details.file_name = extract_file_name_from_err(&details.message);
        }

        let table = self.table.safe_string();
        match self.existing.as_mut() {
            Some(existing) => {
                if let Err(e) = existing
                    .update_entry(client, &details.message, &details.sql_state, &details.file_name)
                    .await
                {
                    tracing::error!(table = %table, "{:#}", e);
                    return err;
                }
                tracing::info!(
                    table = %table,
                    continuation_token = %existing.id,
                    "updated continuation token"
                );
            }
            None => {
                let mut log = ExceptionLog {
                    fetch_id: self.fetch_id,
                    table: self.table.table.clone(),
                    schema: self.table.schema.clone(),
                    message: details.message,
                    sql_state: details.sql_state,
                    file_name: details.file_name,
                    command: details.command,
                    time: Some(Utc::now().naive_utc()),
                    ..Default::default()
                };
                if let Err(e) = log.create_entry(client, stage).await {
                    tracing::error!(table = %table, "{:#}", e);
                    return err;
                }
                tracing::info!(
                    table = %table,
                    continuation_token = %log.id,
                    "created continuation token"
                );
                self.existing = Some(log);
            }
        }
        err
    }
}

/// Render tokens as an aligned text table with a caption.
pub fn format_token_table(logs: &[ExceptionLog]) -> String {
    let headers = ["ID", "FETCH ID", "TABLE NAME", "FILE NAME"];
    let rows: Vec<[String; 4]> = logs
        .iter()
        .map(|l| {
            [
                l.id.to_string(),
                l.fetch_id.to_string(),
                l.table_key(),
                l.file_name.clone(),
            ]
        })
        .collect();

    let mut widths = headers.map(str::len);
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row.iter()) {
            *w = (*w).max(cell.len());
        }
    }

    let line = |cells: &[&str]| -> String {
        cells
            .iter()
            .zip(widths.iter())
            .map(|(c, w)| format!(" {:<width$} ", c, width = *w))
            .collect::<Vec<_>>()
            .join("|")
            .trim_end()
            .to_string()
    };
    let separator = widths
        .iter()
        .map(|w| "-".repeat(w + 2))
        .collect::<Vec<_>>()
        .join("+");

    let mut out = Vec::with_capacity(rows.len() + 3);
    out.push(line(&headers));
    out.push(separator);
    for row in &rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        out.push(line(&cells));
    }
    out.push("Continuation Tokens.".to_string());
    out.join("\n")
}

/// Render tokens as pretty-printed JSON, one object per token.
pub fn format_token_json(logs: &[ExceptionLog]) -> Result<String> {
    serde_json::to_string_pretty(logs).context("Failed to encode continuation tokens")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_file_name_from_err() {
        let found = "error importing data: ERROR: http://192.168.0.207:9005/public.employees/part_00000001.csv: \
                     error parsing row 1: expected 9 fields, got 16 (SQLSTATE XXUUU)";
        assert_eq!(extract_file_name_from_err(found), "part_00000001.csv");

        let gz = "s3://bucket/public.t/part_00000042.tar.gz?AWS_ACCESS_KEY_ID=a: bad row";
        assert_eq!(extract_file_name_from_err(gz), "part_00000042.tar.gz");

        let missing = "error importing data: ERROR: http://192.168.0.207:9005/public.employees: \
                       error parsing row 1 (SQLSTATE XXUUU)";
        assert_eq!(extract_file_name_from_err(missing), "");
        assert_eq!(extract_file_name_from_err(""), "");
    }

    #[test]
    fn test_reportable_import_error() {
        let err = anyhow::Error::new(MoltError::Import {
            file: "part_00000006.csv".to_string(),
            sql_state: Some("22P02".to_string()),
            command: "IMPORT INTO \"public\".\"users\" ...".to_string(),
            message: "could not parse; row 4".to_string(),
        })
        .context("error importing data");

        let details = reportable(&err).unwrap();
        assert_eq!(details.sql_state, "22P02");
        assert_eq!(details.file_name, "part_00000006.csv");
        assert_eq!(details.message, "could not parse; row 4");
    }

    #[test]
    fn test_non_database_errors_are_not_reportable() {
        let err = anyhow::anyhow!("connection reset").context("error importing data");
        assert!(reportable(&err).is_none());

        let no_state = anyhow::Error::new(MoltError::Import {
            file: "part_00000001.csv".to_string(),
            sql_state: None,
            command: String::new(),
            message: "io".to_string(),
        });
        assert!(reportable(&no_state).is_none());
    }

    #[test]
    fn test_table_mapping_uses_schema_and_table() {
        let logs = vec![
            ExceptionLog {
                schema: "public".to_string(),
                table: "users".to_string(),
                ..Default::default()
            },
            ExceptionLog {
                schema: "sales".to_string(),
                table: "orders".to_string(),
                file_name: "part_00000003.csv".to_string(),
                ..Default::default()
            },
        ];
        let mapping = table_to_exception_log(logs);
        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping["sales.orders"].file_name, "part_00000003.csv");
        assert!(mapping.contains_key("public.users"));
    }

    #[test]
    fn test_token_table_layout() {
        let logs = vec![ExceptionLog {
            id: Uuid::nil(),
            fetch_id: Uuid::nil(),
            schema: "public".to_string(),
            table: "users".to_string(),
            file_name: "part_00000002.csv".to_string(),
            ..Default::default()
        }];
        let out = format_token_table(&logs);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with(" ID "));
        assert!(lines[0].contains("| FETCH ID "));
        assert!(lines[0].ends_with("| FILE NAME"));
        assert!(lines[2].contains("public.users"));
        assert!(lines[2].ends_with("part_00000002.csv"));
        assert_eq!(lines[3], "Continuation Tokens.");
    }

    #[test]
    fn test_token_json() {
        let logs = vec![ExceptionLog {
            schema: "public".to_string(),
            table: "users".to_string(),
            ..Default::default()
        }];
        let json: serde_json::Value = serde_json::from_str(&format_token_json(&logs).unwrap()).unwrap();
        assert_eq!(json[0]["table"], "users");
        assert_eq!(json[0]["id"], Uuid::nil().to_string());
    }

    // NOTE: This test requires a real CockroachDB instance
    #[tokio::test]
    #[ignore]
    async fn test_exception_lifecycle() {
        let url = std::env::var("TEST_TARGET_URL")
            .expect("TEST_TARGET_URL must be set for integration tests");
        let client = crate::dbconn::postgres::connect(&url).await.unwrap();
        create_status_and_exception_tables(&client).await.unwrap();

        let mut status = FetchStatus::new("run 1", "PostgreSQL");
        status.create_entry(&client).await.unwrap();
        assert_ne!(status.id, Uuid::nil());
        assert_eq!(status.status, STATUS_IN_PROGRESS);

        let mut log = ExceptionLog {
            fetch_id: status.id,
            table: "employees".to_string(),
            schema: "public".to_string(),
            message: "this all failed".to_string(),
            sql_state: "1000".to_string(),
            file_name: "part_00000001.csv".to_string(),
            ..Default::default()
        };
        log.create_entry(&client, STAGE_DATA_LOAD).await.unwrap();
        assert_eq!(log.stage, STAGE_DATA_LOAD);

        log.update_entry(&client, "later", "22P02", "part_00000002.csv")
            .await
            .unwrap();
        let found = get_exception_log_by_token(&client, &log.id.to_string())
            .await
            .unwrap();
        assert_eq!(found.file_name, "part_00000002.csv");

        let by_run = get_all_exception_logs_by_fetch_id(&client, status.id)
            .await
            .unwrap();
        assert_eq!(by_run.len(), 1);

        log.delete_entry(&client).await.unwrap();
        status.mark_successful(&client).await.unwrap();
        assert_eq!(status.status, STATUS_SUCCEEDED);
    }

    // NOTE: This test requires a real CockroachDB instance
    #[tokio::test]
    #[ignore]
    async fn test_exception_requires_valid_fetch_id() {
        let url = std::env::var("TEST_TARGET_URL")
            .expect("TEST_TARGET_URL must be set for integration tests");
        let client = crate::dbconn::postgres::connect(&url).await.unwrap();
        create_status_and_exception_tables(&client).await.unwrap();

        let mut log = ExceptionLog {
            fetch_id: Uuid::nil(),
            table: "employees".to_string(),
            schema: "public".to_string(),
            ..Default::default()
        };
        let err = log.create_entry(&client, STAGE_DATA_LOAD).await.unwrap_err();
        assert_eq!(crate::error::sql_state(&err).as_deref(), Some("23503"));
    }
}
