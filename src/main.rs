// ABOUTME: CLI entry point for molt
// ABOUTME: Parses commands, layers flags over the config file and routes to handlers

use clap::{Args, Parser, Subcommand};
use molt::commands;
use molt::config::{CompressionKind, FetchConfig, FileConfig, LiveReverifySettings, StoreConfig, VerifyConfig};

#[derive(Parser)]
#[command(name = "molt")]
#[command(about = "Bulk data movement and row-level verification between databases", long_about = None)]
#[command(version)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct FilterArgs {
    /// Regex of schemas to include
    #[arg(long)]
    schema_filter: Option<String>,
    /// Regex of tables to include
    #[arg(long)]
    table_filter: Option<String>,
    /// Path to a TOML file with [fetch] and [verify] sections
    #[arg(long = "config")]
    config_path: Option<String>,
}

impl FilterArgs {
    fn file_config(&self) -> anyhow::Result<FileConfig> {
        match &self.config_path {
            Some(path) => FileConfig::load(path),
            None => Ok(FileConfig::default()),
        }
    }
}

#[derive(Args, Clone)]
struct FetchArgs {
    #[arg(long)]
    source: String,
    #[arg(long)]
    target: String,
    /// Stage chunks in a bucket: s3://bucket/prefix or gs://bucket/prefix
    #[arg(long, conflicts_with_all = ["local_path", "direct_copy"])]
    bucket_path: Option<String>,
    /// Stage chunks in a local directory served over HTTP
    #[arg(long, conflicts_with = "direct_copy")]
    local_path: Option<String>,
    /// Address the local file server listens on
    #[arg(long, requires = "local_path")]
    local_path_listen_addr: Option<String>,
    /// Address the target uses to reach the local file server
    #[arg(long, requires = "local_path")]
    local_path_crdb_access_addr: Option<String>,
    /// Skip staging and COPY rows straight into the target
    #[arg(long)]
    direct_copy: bool,
    /// Load with COPY so target tables stay online
    #[arg(long)]
    live: bool,
    #[arg(long, value_enum)]
    compression: Option<CompressionKind>,
    /// Bytes per chunk
    #[arg(long)]
    flush_size: Option<usize>,
    /// Rows per chunk
    #[arg(long)]
    flush_rows: Option<usize>,
    /// Tables moved at once
    #[arg(long)]
    table_concurrency: Option<usize>,
    /// Delete staged files once their table has loaded
    #[arg(long)]
    cleanup: bool,
    /// Truncate target tables before loading
    #[arg(long)]
    truncate: bool,
    /// Resume the fetch with this id
    #[arg(long)]
    fetch_id: Option<String>,
    /// Resume a single table from this token
    #[arg(long, requires = "fetch_id")]
    continuation_token: Option<String>,
    /// File to resume from, e.g. part_00000004.csv
    #[arg(long, requires = "continuation_token")]
    continuation_file_name: Option<String>,
    #[command(flatten)]
    filters: FilterArgs,
}

impl FetchArgs {
    fn into_config(self) -> anyhow::Result<FetchConfig> {
        let mut cfg = self.filters.file_config()?.fetch;
        if let Some(bucket_path) = &self.bucket_path {
            cfg.store = Some(StoreConfig::from_bucket_path(bucket_path)?);
        } else if let Some(path) = self.local_path {
            cfg.store = Some(StoreConfig::Local {
                path,
                listen_addr: self.local_path_listen_addr,
                access_addr: self.local_path_crdb_access_addr,
            });
        } else if self.direct_copy {
            cfg.store = Some(StoreConfig::Direct);
        }
        cfg.live |= self.live;
        cfg.cleanup |= self.cleanup;
        cfg.truncate |= self.truncate;
        if let Some(compression) = self.compression {
            cfg.compression = compression;
        }
        if self.flush_size.is_some() {
            cfg.flush_size = self.flush_size;
        }
        if let Some(rows) = self.flush_rows {
            cfg.flush_rows = rows;
        }
        if let Some(concurrency) = self.table_concurrency {
            cfg.concurrency = concurrency;
        }
        if self.fetch_id.is_some() {
            cfg.continuation.fetch_id = self.fetch_id;
        }
        if self.continuation_token.is_some() {
            cfg.continuation.token = self.continuation_token;
        }
        if self.continuation_file_name.is_some() {
            cfg.continuation.file_name = self.continuation_file_name;
        }
        if let Some(schema) = self.filters.schema_filter {
            cfg.filter.schema = schema;
        }
        if let Some(table) = self.filters.table_filter {
            cfg.filter.table = table;
        }
        Ok(cfg)
    }
}

#[derive(Args, Clone)]
struct VerifyArgs {
    #[arg(long)]
    source: String,
    #[arg(long)]
    target: String,
    /// Shards verified at once
    #[arg(long)]
    concurrency: Option<usize>,
    /// Rows read per query
    #[arg(long)]
    rows_per_batch: Option<usize>,
    /// Shards per table
    #[arg(long)]
    table_splits: Option<usize>,
    /// Recheck inconsistent rows for a while before reporting them
    #[arg(long)]
    live: bool,
    /// Rewrite the target to match the source
    #[arg(long)]
    fix: bool,
    #[command(flatten)]
    filters: FilterArgs,
}

impl VerifyArgs {
    fn into_config(self) -> anyhow::Result<VerifyConfig> {
        let mut cfg = self.filters.file_config()?.verify;
        if let Some(concurrency) = self.concurrency {
            cfg.concurrency = concurrency;
        }
        if let Some(rows) = self.rows_per_batch {
            cfg.rows_per_batch = rows;
        }
        if let Some(splits) = self.table_splits {
            cfg.table_splits = splits;
        }
        if self.live && cfg.live.is_none() {
            cfg.live = Some(LiveReverifySettings::default());
        }
        cfg.fix |= self.fix;
        if let Some(schema) = self.filters.schema_filter {
            cfg.filter.schema = schema;
        }
        if let Some(table) = self.filters.table_filter {
            cfg.filter.table = table;
        }
        Ok(cfg)
    }
}

#[derive(Subcommand)]
enum TokenCommands {
    /// List continuation tokens of tables that failed to load
    List {
        #[arg(long)]
        target: String,
        /// Maximum number of tokens to show (0 for the default)
        #[arg(long, default_value_t = 0)]
        num_results: i64,
        /// Print as JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum Commands {
    /// Move table data from source to target through a data store
    Fetch(FetchArgs),
    /// Compare source and target row by row
    Verify(VerifyArgs),
    /// Inspect continuation tokens left by failed fetches
    Tokens {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

fn init_logging(json: bool) {
    // Default to INFO level if RUST_LOG not set
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match cli.command {
        Commands::Fetch(args) => {
            let source = args.source.clone();
            let target = args.target.clone();
            let cfg = args.into_config()?;
            commands::fetch(&source, &target, cfg).await
        }
        Commands::Verify(args) => {
            let source = args.source.clone();
            let target = args.target.clone();
            let cfg = args.into_config()?;
            commands::verify(&source, &target, cfg).await
        }
        Commands::Tokens {
            command:
                TokenCommands::List {
                    target,
                    num_results,
                    json,
                },
        } => commands::tokens_list(&target, num_results, json).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_fetch_flags_build_config() {
        let cli = Cli::parse_from([
            "molt",
            "fetch",
            "--source",
            "postgres://src",
            "--target",
            "postgres://tgt",
            "--bucket-path",
            "s3://exports/run1",
            "--flush-rows",
            "5000",
            "--table-concurrency",
            "8",
            "--compression",
            "none",
            "--table-filter",
            "users|orders",
        ]);
        let Commands::Fetch(args) = cli.command else {
            panic!("expected fetch");
        };
        let cfg = args.into_config().unwrap();
        assert_eq!(cfg.flush_rows, 5000);
        assert_eq!(cfg.concurrency, 8);
        assert!(!cfg.gzip());
        assert_eq!(cfg.filter.table, "users|orders");
        match cfg.store {
            Some(StoreConfig::S3(s3)) => {
                assert_eq!(s3.bucket, "exports");
                assert_eq!(s3.path, "run1");
            }
            other => panic!("unexpected store {:?}", other),
        }
    }

    #[test]
    fn test_store_flags_conflict() {
        let result = Cli::try_parse_from([
            "molt",
            "fetch",
            "--source",
            "postgres://src",
            "--target",
            "postgres://tgt",
            "--bucket-path",
            "s3://exports",
            "--direct-copy",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_verify_flags_build_config() {
        let cli = Cli::parse_from([
            "molt",
            "verify",
            "--source",
            "postgres://src",
            "--target",
            "postgres://tgt",
            "--live",
            "--table-splits",
            "4",
        ]);
        let Commands::Verify(args) = cli.command else {
            panic!("expected verify");
        };
        let cfg = args.into_config().unwrap();
        assert_eq!(cfg.table_splits, 4);
        assert_eq!(cfg.live, Some(LiveReverifySettings::default()));
        assert!(!cfg.fix);
    }
}
