// ABOUTME: Local-directory blob store with an optional HTTP file server for IMPORT
// ABOUTME: Each chunk starts with a row-count line so resumes can recover counts from disk

use super::{
    decoded_reader, is_gzip_key, BlobStore, ChunkUpload, Resource, TestingKnobs,
};
use crate::dbtable::VerifiedTable;
use crate::error::MoltError;
use crate::utils::{chunk_file_name, matches_file_convention};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use axum::Router;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;

pub struct LocalStore {
    base_path: PathBuf,
    access_addr: Option<String>,
    listen_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl LocalStore {
    /// Create the base directory and, when `listen_addr` is set, start serving it.
    ///
    /// Without an explicit `access_addr` the target reaches the server through
    /// this host's first non-loopback IPv4 address on the bound port.
    pub async fn new(
        base_path: impl Into<PathBuf>,
        listen_addr: Option<&str>,
        access_addr: Option<&str>,
    ) -> Result<Self> {
        let base_path = base_path.into();
        tokio::fs::create_dir_all(&base_path)
            .await
            .with_context(|| format!("Failed to create {}", base_path.display()))?;

        let shutdown = CancellationToken::new();
        let Some(listen) = listen_addr else {
            return Ok(Self {
                base_path,
                access_addr: access_addr.map(str::to_string),
                listen_addr: None,
                shutdown,
                server: Mutex::new(None),
            });
        };

        let listener = tokio::net::TcpListener::bind(listen)
            .await
            .with_context(|| format!("Failed to bind file server to {}", listen))?;
        let bound = listener.local_addr()?;
        let access = match access_addr {
            Some(addr) => addr.to_string(),
            None => {
                let ip = local_ip().context("Cannot find a non-loopback IPv4 address")?;
                SocketAddr::new(ip, bound.port()).to_string()
            }
        };

        let app = Router::new().fallback_service(ServeDir::new(&base_path));
        let token = shutdown.clone();
        tracing::info!(listen_addr = %bound, access_addr = %access, "starting file server");
        let server = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            match result {
                Ok(()) => tracing::info!("file server shut down"),
                Err(e) => tracing::error!("file server failed: {}", e),
            }
        });

        Ok(Self {
            base_path,
            access_addr: Some(access),
            listen_addr: Some(bound),
            shutdown,
            server: Mutex::new(Some(server)),
        })
    }

    /// Address the file server is bound to, if one was started.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    fn resource(&self, path: PathBuf, rows: usize) -> Arc<dyn Resource> {
        let key = path
            .strip_prefix(&self.base_path)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        Arc::new(LocalResource {
            path,
            key,
            rows,
            access_addr: self.access_addr.clone(),
        })
    }
}

impl Drop for LocalStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// First non-loopback IPv4 address of this host.
///
/// Connecting a UDP socket sends nothing; it only asks the kernel which local
/// address routes outward.
fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (ip.is_ipv4() && !ip.is_loopback() && !ip.is_unspecified()).then_some(ip)
}

fn write_chunk(path: &Path, rows: usize, mut reader: impl Read) -> Result<()> {
    let mut file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    if is_gzip_key(&path.to_string_lossy()) {
        // The header is its own gzip member; the chunk bytes are already gzip.
        let mut gz = GzEncoder::new(&mut file, flate2::Compression::default());
        writeln!(gz, "{}", rows)?;
        gz.finish()?;
    } else {
        writeln!(file, "{}", rows)?;
    }
    std::io::copy(&mut reader, &mut file).context("error reading chunk")?;
    file.flush()?;
    Ok(())
}

fn read_row_count(path: &Path) -> Result<usize> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(decoded_reader(&path.to_string_lossy(), file));
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        bail!("empty file");
    }
    line.trim()
        .parse()
        .with_context(|| format!("invalid row count line {:?}", line.trim()))
}

#[async_trait]
impl BlobStore for LocalStore {
    async fn create_from_reader(
        &self,
        upload: ChunkUpload,
        knobs: &TestingKnobs,
    ) -> Result<Option<Arc<dyn Resource>>> {
        let ChunkUpload {
            reader,
            table,
            index,
            ext,
            rows,
        } = upload;
        let dir = self.base_path.join(table.name.safe_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        knobs.check_before_read()?;

        let path = dir.join(chunk_file_name(index, ext));
        tracing::debug!(path = %path.display(), "creating file");
        let rows = rows.await.context("chunk row count was never reported")?;

        let target = path.clone();
        tokio::task::spawn_blocking(move || write_chunk(&target, rows, reader))
            .await
            .context("chunk writing task failed")??;
        knobs.check_after_read()?;

        tracing::debug!(path = %path.display(), rows, "wrote file");
        Ok(Some(self.resource(path, rows)))
    }

    fn can_be_target(&self) -> bool {
        true
    }

    fn default_flush_batch_size(&self) -> usize {
        128 * 1024 * 1024
    }

    fn telemetry_name(&self) -> &'static str {
        "local"
    }

    async fn cleanup(&self) -> Result<()> {
        self.shutdown.cancel();
        let server = self
            .server
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(server) = server {
            server.await.context("file server task failed")?;
        }
        Ok(())
    }

    async fn list_from_continuation_point(
        &self,
        table: &VerifiedTable,
        file_name: &str,
    ) -> Result<Vec<Arc<dyn Resource>>> {
        let dir = self.base_path.join(table.name.safe_string());
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to read {}", dir.display()))?;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.as_str() >= file_name && matches_file_convention(&name) {
                names.push(name);
            }
        }
        names.sort();

        if names.is_empty() {
            return Err(MoltError::Continuation(format!(
                "no files for {} at or after {}",
                table.name, file_name
            ))
            .into());
        }

        let mut resources = Vec::with_capacity(names.len());
        for name in names {
            let path = dir.join(&name);
            // A bad header only loses the count; the data is still loadable.
            let rows = read_row_count(&path).unwrap_or_else(|e| {
                tracing::error!(path = %path.display(), "failed to detect number of rows: {:#}", e);
                0
            });
            resources.push(self.resource(path, rows));
        }
        Ok(resources)
    }
}

pub struct LocalResource {
    path: PathBuf,
    key: String,
    rows: usize,
    access_addr: Option<String>,
}

#[async_trait]
impl Resource for LocalResource {
    fn key(&self) -> &str {
        &self.key
    }

    fn rows(&self) -> usize {
        self.rows
    }

    fn import_url(&self) -> Result<String> {
        match &self.access_addr {
            Some(addr) => Ok(format!("http://{}/{}", addr, self.key)),
            None => bail!("cannot IMPORT from a local path unless the file server is enabled"),
        }
    }

    fn has_header(&self) -> bool {
        true
    }

    async fn reader(&self) -> Result<Box<dyn Read + Send>> {
        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        Ok(decoded_reader(&self.key, file))
    }

    async fn mark_for_cleanup(&self) -> Result<()> {
        tracing::debug!("removing {}", self.path.display());
        tokio::fs::remove_file(&self.path)
            .await
            .with_context(|| format!("Failed to remove {}", self.path.display()))
    }
}
