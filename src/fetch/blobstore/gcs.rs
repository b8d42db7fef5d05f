// ABOUTME: Google Cloud Storage bucket client over the JSON API
// ABOUTME: Import URLs embed the base64 service-account credentials for the target

use super::cloud::{Bucket, ListPage, ObjectInfo, NUM_ROWS_KEY};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GcsSettings {
    pub bucket: String,
    /// Key prefix under which table folders are created.
    pub path: String,
    /// OAuth2 bearer token for API calls. Falls back to `GOOGLE_OAUTH_ACCESS_TOKEN`.
    pub access_token: Option<String>,
    /// Service account JSON handed to the target for IMPORT.
    /// Falls back to `GOOGLE_APPLICATION_CREDENTIALS`.
    pub credentials_file: Option<PathBuf>,
    pub endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectResource>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectResource {
    name: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl ObjectResource {
    fn rows(&self) -> Option<usize> {
        let raw = self.metadata.get(NUM_ROWS_KEY)?;
        match raw.parse() {
            Ok(rows) => Some(rows),
            Err(_) => {
                tracing::warn!(key = %self.name, value = %raw, "unparseable row count metadata");
                None
            }
        }
    }
}

pub struct GcsBucket {
    client: Client,
    endpoint: String,
    bucket: String,
    token: String,
    credentials_json: Option<Vec<u8>>,
}

impl GcsBucket {
    pub fn new(settings: &GcsSettings) -> Result<Self> {
        let token = settings
            .access_token
            .clone()
            .or_else(|| std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN").ok())
            .ok_or_else(|| {
                anyhow!(
                    "No GCS access token configured.\n\
                     Set gcs.access_token or GOOGLE_OAUTH_ACCESS_TOKEN \
                     (e.g. from `gcloud auth print-access-token`)"
                )
            })?;

        let creds_path = settings
            .credentials_file
            .clone()
            .or_else(|| std::env::var_os("GOOGLE_APPLICATION_CREDENTIALS").map(PathBuf::from));
        let credentials_json = match creds_path {
            Some(path) => Some(
                std::fs::read(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?,
            ),
            None => None,
        };

        Ok(Self {
            client: Client::new(),
            endpoint: settings
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            bucket: settings.bucket.clone(),
            token,
            credentials_json,
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint)
            .with_context(|| format!("Invalid GCS endpoint {}", self.endpoint))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("GCS endpoint {} cannot be a base URL", self.endpoint))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn object_url(&self, key: &str) -> Result<Url> {
        self.url(&["storage", "v1", "b", &self.bucket, "o", key])
    }
}

#[async_trait]
impl Bucket for GcsBucket {
    fn name(&self) -> &str {
        &self.bucket
    }

    async fn put_file(&self, key: &str, path: &Path, rows: usize) -> Result<()> {
        let body = tokio::fs::read(path)
            .await
            .context("Failed to read spooled chunk")?;
        let upload = self.url(&["upload", "storage", "v1", "b", &self.bucket, "o"])?;
        self.client
            .post(upload)
            .bearer_auth(&self.token)
            .query(&[("uploadType", "media"), ("name", key)])
            .body(body)
            .send()
            .await
            .context("Failed to upload to GCS")?
            .error_for_status()
            .context("GCS rejected upload")?;

        // Metadata is set after the upload completes.
        let metadata = HashMap::from([(NUM_ROWS_KEY, rows.to_string())]);
        self.client
            .patch(self.object_url(key)?)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "metadata": metadata }))
            .send()
            .await
            .context("Failed to update GCS object metadata")?
            .error_for_status()
            .context("GCS rejected metadata update")?;
        Ok(())
    }

    async fn list_page(
        &self,
        prefix: &str,
        start_at: &str,
        token: Option<String>,
    ) -> Result<ListPage> {
        let mut request = self
            .client
            .get(self.url(&["storage", "v1", "b", &self.bucket, "o"])?)
            .bearer_auth(&self.token)
            .query(&[("prefix", prefix), ("startOffset", start_at)]);
        if let Some(token) = &token {
            request = request.query(&[("pageToken", token.as_str())]);
        }
        let list: ObjectList = request
            .send()
            .await
            .context("Failed to list GCS objects")?
            .error_for_status()
            .context("GCS rejected list request")?
            .json()
            .await
            .context("Failed to decode GCS listing")?;
        Ok(list_page_from(list))
    }

    async fn row_count(&self, key: &str) -> Result<usize> {
        let object: ObjectResource = self
            .client
            .get(self.object_url(key)?)
            .bearer_auth(&self.token)
            .send()
            .await
            .with_context(|| format!("Failed to get metadata from GCS: {}", key))?
            .error_for_status()?
            .json()
            .await?;
        object
            .rows()
            .ok_or_else(|| anyhow!("{} has no {} metadata", key, NUM_ROWS_KEY))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let bytes = self
            .client
            .get(self.object_url(key)?)
            .bearer_auth(&self.token)
            .query(&[("alt", "media")])
            .send()
            .await
            .with_context(|| format!("Failed to download from GCS: {}", key))?
            .error_for_status()?
            .bytes()
            .await
            .context("Failed to read GCS response body")?;
        Ok(bytes.to_vec())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.client
                .delete(self.object_url(key)?)
                .bearer_auth(&self.token)
                .send()
                .await
                .with_context(|| format!("Failed to delete from GCS: {}", key))?
                .error_for_status()?;
        }
        Ok(())
    }

    fn import_url(&self, key: &str) -> Result<String> {
        Ok(gcs_import_url(
            &self.bucket,
            key,
            self.credentials_json.as_deref(),
        ))
    }

    fn telemetry_name(&self) -> &'static str {
        "gcp"
    }

    fn batch_deletes(&self) -> bool {
        false
    }
}

fn list_page_from(list: ObjectList) -> ListPage {
    ListPage {
        objects: list
            .items
            .iter()
            .map(|o| ObjectInfo {
                key: o.name.clone(),
                rows: o.rows(),
            })
            .collect(),
        next_token: list.next_page_token,
    }
}

fn gcs_import_url(bucket: &str, key: &str, credentials_json: Option<&[u8]>) -> String {
    match credentials_json {
        Some(json) => format!(
            "gs://{}/{}?CREDENTIALS={}",
            bucket,
            key,
            base64::engine::general_purpose::STANDARD.encode(json)
        ),
        None => format!("gs://{}/{}?AUTH=implicit", bucket, key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_url_embeds_credentials() {
        assert_eq!(
            gcs_import_url("nangs", "asdf/ghjk.csv", Some(br#"{"a":"b"}"#)),
            "gs://nangs/asdf/ghjk.csv?CREDENTIALS=eyJhIjoiYiJ9"
        );
        assert_eq!(
            gcs_import_url("nangs", "asdf/ghjk.csv", None),
            "gs://nangs/asdf/ghjk.csv?AUTH=implicit"
        );
    }

    #[test]
    fn test_listing_decodes_row_metadata() {
        let list: ObjectList = serde_json::from_str(
            r#"{
                "items": [
                    {"name": "public.users/part_00000001.csv", "metadata": {"numrows": "40"}},
                    {"name": "public.users/part_00000002.csv", "metadata": {"numrows": "x"}},
                    {"name": "public.users/part_00000003.csv"}
                ],
                "nextPageToken": "abc"
            }"#,
        )
        .unwrap();
        let page = list_page_from(list);
        assert_eq!(page.next_token.as_deref(), Some("abc"));
        assert_eq!(
            page.objects.iter().map(|o| o.rows).collect::<Vec<_>>(),
            vec![Some(40), None, None]
        );
    }

    #[test]
    fn test_last_page_has_no_token() {
        let list: ObjectList = serde_json::from_str(r#"{"kind": "storage#objects"}"#).unwrap();
        let page = list_page_from(list);
        assert!(page.objects.is_empty());
        assert!(page.next_token.is_none());
    }

    #[test]
    fn test_object_urls_escape_keys() {
        let bucket = GcsBucket::new(&GcsSettings {
            bucket: "nangs".to_string(),
            access_token: Some("tok".to_string()),
            endpoint: Some("http://localhost:4443".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            bucket
                .object_url("run/public.users/part_00000001.csv")
                .unwrap()
                .as_str(),
            "http://localhost:4443/storage/v1/b/nangs/o/run%2Fpublic.users%2Fpart_00000001.csv"
        );
    }
}
