// ABOUTME: Tokens command implementation - lists continuation tokens of failed tables
// ABOUTME: Reads the exception log kept on the target by fetch

use crate::dbconn::connect;
use crate::fetch::list_tokens;
use anyhow::{Context, Result};

/// Print the continuation tokens recorded on the target, newest first.
pub async fn tokens_list(target_url: &str, num_results: i64, json: bool) -> Result<()> {
    let target = connect("target", target_url)
        .await
        .context("Failed to connect to target database")?;
    let out = list_tokens(target.as_ref(), num_results, json).await?;
    println!("{}", out);
    Ok(())
}
