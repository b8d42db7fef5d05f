// ABOUTME: Offline tests of the export pipeline and row verifier through the public API
// ABOUTME: Uses a scripted export source, a local store in a temp dir and in-memory row streams

use anyhow::Result;
use async_trait::async_trait;
use molt::datum::Datum;
use molt::dbtable::{TableName, TableShard, VerifiedTable};
use molt::fetch::blobstore::{BlobStore, LocalStore, Resource};
use molt::fetch::export::{export_table, ExportSettings, FetchTestingKnobs};
use molt::fetch::source::{ExportSource, SourceConn};
use molt::rowiterator::RowBuffer;
use molt::verify::inconsistency::{ReportableObject, RowStats};
use molt::verify::listener::DefaultListener;
use molt::verify::reporter::{fix_statement, Reporter};
use molt::verify::rowverify::verify_rows;
use std::io::{Read, Write};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

fn accounts_table() -> VerifiedTable {
    VerifiedTable {
        name: TableName::new("public", "accounts"),
        columns: vec!["region".into(), "id".into(), "owner".into()],
        pk_columns: vec!["region".into(), "id".into()],
        source_types: vec!["text".into(), "bigint".into(), "text".into()],
        target_types: vec!["text".into(), "bigint".into(), "text".into()],
    }
}

struct CountingSource {
    rows: usize,
}

struct CountingConn {
    rows: usize,
}

#[async_trait]
impl ExportSource for CountingSource {
    fn cdc_cursor(&self) -> &str {
        "0/16B3748"
    }

    async fn conn(&self) -> Result<Box<dyn SourceConn>> {
        Ok(Box::new(CountingConn { rows: self.rows }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl SourceConn for CountingConn {
    async fn export(&mut self, writer: &mut (dyn Write + Send), _shard: &TableShard) -> Result<()> {
        for i in 1..=self.rows {
            writeln!(writer, "eu,{},owner{}", i, i)?;
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_export_to_local_store_then_resume_listing() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalStore::new(dir.path(), None, None).await.unwrap());
    let table = accounts_table();

    let result = export_table(
        &ExportSettings {
            flush_size: 1024 * 1024,
            flush_rows: 10,
            gzip: false,
        },
        Arc::new(CountingSource { rows: 25 }),
        store.clone(),
        TableShard::whole(table.clone()),
        Arc::new(AtomicUsize::new(0)),
        &FetchTestingKnobs::default(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(result.num_rows, 25);
    assert_eq!(result.resources.len(), 3);
    assert!(dir
        .path()
        .join("public.accounts")
        .join("part_00000003.csv")
        .exists());

    // A failed load of the second file resumes from there.
    let resumed = store
        .list_from_continuation_point(&table, "part_00000002.csv")
        .await
        .unwrap();
    let rows: Vec<usize> = resumed.iter().map(|r| r.rows()).collect();
    assert_eq!(rows, vec![10, 5]);
    assert!(resumed.iter().all(|r| r.has_header()));

    let mut reader = resumed[0].reader().await.unwrap();
    let content = tokio::task::spawn_blocking(move || {
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        out
    })
    .await
    .unwrap();
    assert!(content.starts_with("10\neu,11,owner11\n"));
    assert!(content.ends_with("eu,20,owner20\n"));

    let missing = store
        .list_from_continuation_point(&table, "part_00000009.csv")
        .await;
    assert!(missing.is_err());
}

#[derive(Default)]
struct Collected(Mutex<Vec<ReportableObject>>);

#[async_trait]
impl Reporter for Collected {
    async fn report(&self, obj: &ReportableObject) {
        self.0.lock().unwrap().push(obj.clone());
    }
}

fn account(region: &str, id: i64, owner: &str) -> Vec<Datum> {
    vec![
        Datum::Text(region.into()),
        Datum::Int(id),
        Datum::Text(owner.into()),
    ]
}

#[tokio::test]
async fn test_verify_composite_keys_and_fix_statements() {
    let table = accounts_table();
    let truth = vec![
        account("eu", 1, "ann"),
        account("eu", 2, "bob"),
        account("us", 1, "cat"),
        account("us", 3, "dan"),
    ];
    let target = vec![
        account("eu", 1, "ann"),
        account("eu", 2, "rob"),
        account("us", 2, "eve"),
        account("us", 3, "dan"),
    ];

    let reporter = Arc::new(Collected::default());
    let mut evl = DefaultListener::new(
        reporter.clone(),
        RowStats::for_table(&table.name),
        "public.accounts (shard 1/1)".into(),
    );
    verify_rows(
        &mut RowBuffer::new(truth),
        &mut RowBuffer::new(target),
        &table,
        &mut evl,
    )
    .await
    .unwrap();

    let stats = evl.into_stats();
    assert_eq!(stats.schema, "public");
    assert_eq!(stats.table, "accounts");
    assert_eq!(
        stats.to_string(),
        "truth rows seen: 4, success: 2, missing: 1, mismatch: 1, extraneous: 1, live_retry: 0"
    );

    let reports = reporter.0.lock().unwrap().clone();
    let sql: Vec<String> = reports
        .iter()
        .filter_map(|r| fix_statement(molt::dbconn::Dialect::CockroachDb, r))
        .map(|(_, _, _, sql)| sql)
        .collect();
    assert_eq!(
        sql,
        vec![
            "UPSERT INTO \"public\".\"accounts\" (\"region\", \"id\", \"owner\") VALUES ('eu', 2, 'bob')",
            "UPSERT INTO \"public\".\"accounts\" (\"region\", \"id\", \"owner\") VALUES ('us', 1, 'cat')",
            "DELETE FROM \"public\".\"accounts\" WHERE \"region\" = 'us' AND \"id\" = 2",
        ]
    );
}
