use crate::error::PlateError;
use futures::StreamExt;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

// Some image hosts refuse requests that don't look like a browser.
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/58.0.3029.110 Safari/537.3";

/// A downloaded image on local disk. The file is deleted when this is dropped.
#[derive(Debug)]
pub struct TempImage {
    file: Option<NamedTempFile>,
    path: PathBuf,
}

impl TempImage {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempImage {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            match file.close() {
                Ok(()) => info!("Temporary image file deleted: {}", self.path.display()),
                Err(e) => warn!(
                    "Failed to delete temporary image {}: {}",
                    self.path.display(),
                    e
                ),
            }
        }
    }
}

pub struct ImageFetcher {
    client: reqwest::Client,
    temp_dir: PathBuf,
}

impl ImageFetcher {
    pub fn new(temp_dir: PathBuf) -> Result<Self, failure::Error> {
        let client = reqwest::Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .build()?;
        Ok(ImageFetcher { client, temp_dir })
    }

    pub async fn fetch(&self, url: &str, request_id: Uuid) -> Result<TempImage, PlateError> {
        let file = tempfile::Builder::new()
            .prefix(&format!("plate-{}-", request_id.simple()))
            .suffix(".jpg")
            .tempfile_in(&self.temp_dir)
            .map_err(|e| download_error(url, e))?;
        // On any error below `file` is dropped, which removes the partial download.
        self.download_into(url, &file).await?;
        let path = file.path().to_path_buf();
        info!("Image downloaded to: {}", path.display());
        Ok(TempImage {
            file: Some(file),
            path,
        })
    }

    async fn download_into(&self, url: &str, file: &NamedTempFile) -> Result<(), PlateError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| download_error(url, e))?;
        debug!("Downloading {} ({:?} bytes)", url, response.content_length());

        let reopened = file.reopen().map_err(|e| download_error(url, e))?;
        let mut out = tokio::fs::File::from_std(reopened);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| download_error(url, e))?;
            out.write_all(&chunk)
                .await
                .map_err(|e| download_error(url, e))?;
        }
        out.flush().await.map_err(|e| download_error(url, e))?;
        Ok(())
    }
}

fn download_error(url: &str, e: impl std::fmt::Display) -> PlateError {
    PlateError::Download(format!("Failed to download image from {}: {}", url, e))
}
