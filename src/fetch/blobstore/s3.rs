// ABOUTME: Amazon S3 bucket client for the cloud blob store
// ABOUTME: Import URLs carry the resolved access keys so the target can read the chunks

use super::cloud::{Bucket, ListPage, ObjectInfo, NUM_ROWS_KEY};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_credential_types::provider::ProvideCredentials;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    types::{Delete, ObjectIdentifier},
    Client,
};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, instrument};

/// Where and how to reach the bucket.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct S3Settings {
    pub bucket: String,
    /// Key prefix under which table folders are created.
    pub path: String,
    pub region: Option<String>,
    /// Custom endpoint, e.g. a MinIO server.
    pub endpoint: Option<String>,
    pub path_style: bool,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub session_token: Option<String>,
}

pub struct S3Bucket {
    client: Client,
    bucket: String,
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
}

impl S3Bucket {
    /// Build a client, falling back to the default AWS credential chain when
    /// no keys are configured.
    pub async fn new(settings: &S3Settings) -> Result<Self> {
        let (access_key, secret_key, session_token) =
            match (&settings.access_key, &settings.secret_key) {
                (Some(access), Some(secret)) => {
                    (access.clone(), secret.clone(), settings.session_token.clone())
                }
                _ => {
                    let sdk = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
                    let provider = sdk
                        .credentials_provider()
                        .ok_or_else(|| anyhow!("No AWS credentials configured"))?;
                    let creds = provider
                        .provide_credentials()
                        .await
                        .context("Failed to resolve AWS credentials")?;
                    (
                        creds.access_key_id().to_string(),
                        creds.secret_access_key().to_string(),
                        creds.session_token().map(str::to_string),
                    )
                }
            };

        let credentials = Credentials::new(
            &access_key,
            &secret_key,
            session_token.clone(),
            None,
            "molt-fetch",
        );
        let region = settings
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let mut builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(region))
            .force_path_style(settings.path_style);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        debug!(bucket = %settings.bucket, "S3 client initialized");
        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: settings.bucket.clone(),
            access_key,
            secret_key,
            session_token,
        })
    }
}

#[async_trait]
impl Bucket for S3Bucket {
    fn name(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip(self, path))]
    async fn put_file(&self, key: &str, path: &Path, rows: usize) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .context("Failed to open spooled chunk")?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .metadata(NUM_ROWS_KEY, rows.to_string())
            .body(body)
            .send()
            .await
            .context("Failed to upload to S3")?;
        Ok(())
    }

    async fn list_page(
        &self,
        prefix: &str,
        _start_at: &str,
        token: Option<String>,
    ) -> Result<ListPage> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .set_continuation_token(token)
            .send()
            .await
            .context("Failed to list S3 objects")?;

        let objects = response
            .contents()
            .iter()
            .filter_map(|obj| obj.key())
            .map(|key| ObjectInfo {
                key: key.to_string(),
                rows: None,
            })
            .collect();
        let next_token = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(str::to_string)
        } else {
            None
        };
        Ok(ListPage {
            objects,
            next_token,
        })
    }

    async fn row_count(&self, key: &str) -> Result<usize> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to get metadata from S3: {}", key))?;
        let raw = head
            .metadata()
            .and_then(|m| m.get(NUM_ROWS_KEY))
            .ok_or_else(|| anyhow!("{} has no {} metadata", key, NUM_ROWS_KEY))?;
        raw.parse()
            .with_context(|| format!("Invalid {} metadata on {}: {}", NUM_ROWS_KEY, key, raw))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to download from S3: {}", key))?;
        Ok(response
            .body
            .collect()
            .await
            .context("Failed to read S3 response body")?
            .into_bytes()
            .to_vec())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let objects = keys
            .iter()
            .map(|k| ObjectIdentifier::builder().key(k).build())
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to build delete request")?;
        let delete = Delete::builder()
            .set_objects(Some(objects))
            .quiet(true)
            .build()
            .context("Failed to build delete request")?;
        self.client
            .delete_objects()
            .bucket(&self.bucket)
            .delete(delete)
            .send()
            .await
            .context("Failed to delete S3 objects")?;
        Ok(())
    }

    fn import_url(&self, key: &str) -> Result<String> {
        s3_import_url(
            &self.bucket,
            key,
            &self.access_key,
            &self.secret_key,
            self.session_token.as_deref(),
        )
    }

    fn telemetry_name(&self) -> &'static str {
        "s3"
    }

    fn batch_deletes(&self) -> bool {
        true
    }
}

fn s3_import_url(
    bucket: &str,
    key: &str,
    access_key: &str,
    secret_key: &str,
    session_token: Option<&str>,
) -> Result<String> {
    let mut url = reqwest::Url::parse(&format!("s3://{}/{}", bucket, key))
        .with_context(|| format!("Invalid S3 location {}/{}", bucket, key))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("AWS_ACCESS_KEY_ID", access_key);
        query.append_pair("AWS_SECRET_ACCESS_KEY", secret_key);
        if let Some(token) = session_token {
            query.append_pair("AWS_SESSION_TOKEN", token);
        }
    }
    Ok(url.to_string())
}
