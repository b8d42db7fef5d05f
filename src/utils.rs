// ABOUTME: Shared helpers for retries and chunk file naming
// ABOUTME: Chunk names follow part_<8 digits>.<ext> so they sort in write order

use anyhow::Result;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

/// Retry a function with exponential backoff
///
/// Executes an async operation with automatic retry on failure. Each retry doubles
/// the delay.
///
/// # Arguments
///
/// * `operation` - Async function to retry (FnMut returning Future\<Output = Result\<T\>\>)
/// * `max_retries` - Maximum number of retry attempts (0 = no retries, just initial attempt)
/// * `initial_delay` - Delay before first retry (doubles each subsequent retry)
///
/// # Examples
///
/// ```no_run
/// # use anyhow::Result;
/// # use std::time::Duration;
/// # use molt::utils::retry_with_backoff;
/// # async fn example() -> Result<()> {
/// let result = retry_with_backoff(
///     || async { Ok("success") },
///     3,  // Try up to 3 times
///     Duration::from_secs(1)  // Start with 1s delay
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    max_retries: u32,
    initial_delay: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = initial_delay;
    let mut last_error = None;

    for attempt in 0..=max_retries {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt < max_retries {
                    tracing::warn!(
                        "Operation failed (attempt {}/{}), retrying in {:?}: {:#}",
                        attempt + 1,
                        max_retries + 1,
                        delay,
                        e
                    );
                    last_error = Some(e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                } else {
                    last_error = Some(e);
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Operation failed after retries")))
}

/// File name of the `idx`-th chunk of a table, e.g. `part_00000003.csv`.
pub fn chunk_file_name(idx: usize, ext: &str) -> String {
    format!("part_{:08}.{}", idx, ext)
}

fn file_convention() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^part_\d{8}\.(csv|tar\.gz)$").ok())
        .as_ref()
}

/// Whether a bare file name is one this tool writes.
pub fn matches_file_convention(name: &str) -> bool {
    file_convention().is_some_and(|re| re.is_match(name))
}

/// Pull the chunk file name out of a URL or key.
///
/// Query strings are dropped first so credentials never end up in logs.
/// Returns an empty string when the last path segment does not follow the
/// chunk naming convention.
pub fn extract_file_name(location: &str) -> String {
    let path = location.split('?').next().unwrap_or_default();
    let last = path.rsplit('/').next().unwrap_or_default();
    if matches_file_convention(last) {
        last.to_string()
    } else {
        String::new()
    }
}
