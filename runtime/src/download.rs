//! Model file acquisition.

use crate::error::DownloadError;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Progress callback for downloads: `(downloaded, total)`. `total` is 0
/// when the server did not send a length.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Fetches a model file to a local path.
#[async_trait]
pub trait DownloadProvider: Send + Sync {
    /// Download `url` to `destination`. On success the file is complete;
    /// on failure nothing is left at `destination`.
    async fn download(
        &self,
        url: &str,
        destination: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<(), DownloadError>;
}

/// Streams over HTTP(S) into `<destination>.part`, renamed into place once
/// complete.
pub struct HttpDownloadProvider {
    client: Client,
}

impl Default for HttpDownloadProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpDownloadProvider {
    pub fn new() -> Self {
        let client = Client::builder()
            .user_agent(concat!("llmbridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self { client }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn fetch(
        &self,
        url: &str,
        partial: &Path,
        progress: Option<&ProgressCallback>,
    ) -> Result<u64, DownloadError> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let total_size = response.content_length().unwrap_or(0);
        let mut file = tokio::fs::File::create(partial).await?;
        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            if let Some(callback) = progress {
                callback(downloaded, total_size);
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(downloaded)
    }
}

/// `<destination>.part`
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

#[async_trait]
impl DownloadProvider for HttpDownloadProvider {
    async fn download(
        &self,
        url: &str,
        destination: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<(), DownloadError> {
        let parent = destination
            .parent()
            .ok_or_else(|| DownloadError::InvalidDestination(destination.to_path_buf()))?;
        tokio::fs::create_dir_all(parent).await?;

        let partial = partial_path(destination);
        info!("Downloading {} to {}", url, destination.display());

        match self.fetch(url, &partial, progress.as_ref()).await {
            Ok(bytes) => {
                tokio::fs::rename(&partial, destination).await?;
                info!("Downloaded {} ({} bytes)", url, bytes);
                Ok(())
            }
            Err(e) => {
                warn!("Download of {} failed: {}", url, e);
                if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                    debug!("No partial file to remove: {}", cleanup);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_path_appends_suffix() {
        let path = Path::new("/data/Models/abc123");
        assert_eq!(partial_path(path), PathBuf::from("/data/Models/abc123.part"));
    }

    #[tokio::test]
    async fn test_unreachable_host_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("Models").join("model");

        let provider = HttpDownloadProvider::new();
        let result = provider
            .download("http://127.0.0.1:9/model.gguf", &destination, None)
            .await;

        assert!(result.is_err());
        assert!(!destination.exists());
        assert!(!partial_path(&destination).exists());
    }
}
