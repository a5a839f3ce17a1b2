use std::path::Path;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::ArchiveConfig;
use crate::error::TrackerError;
use crate::version::Channel;

/// Downloadable build output kinds, each with its own URL priority chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Engine,
    DebugSymbols,
    PackagingTool,
    Editor,
}

/// Downloads artifacts from the archive server, trying channel-prefixed
/// paths before content-hash-only fallbacks.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    archive: ArchiveConfig,
}

impl Fetcher {
    pub fn new(archive: ArchiveConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            archive,
        }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Candidate URLs for an artifact, highest priority first.
    pub fn build_urls(
        &self,
        kind: ArtifactKind,
        sha1: &str,
        channel: Channel,
        platform: Option<&str>,
        filename: Option<&str>,
    ) -> Vec<String> {
        match kind {
            ArtifactKind::Engine => self.engine_urls(
                sha1,
                channel,
                platform.unwrap_or_default(),
                filename.unwrap_or_default(),
            ),
            ArtifactKind::DebugSymbols => {
                let symbol_file = format!("{}.dSYM.zip", filename.unwrap_or_default());
                self.engine_urls(sha1, channel, platform.unwrap_or_default(), &symbol_file)
            }
            ArtifactKind::PackagingTool => self.packaging_tool_urls(sha1, channel),
            ArtifactKind::Editor => self.editor_urls(sha1, channel, filename.unwrap_or_default()),
        }
    }

    fn engine_urls(
        &self,
        sha1: &str,
        channel: Channel,
        platform: &str,
        filename: &str,
    ) -> Vec<String> {
        let root = self.archive.base();
        let mut bases = Vec::new();
        if channel.has_url_prefix() {
            bases.push(format!("{}/{}/{}", root, channel, sha1));
        }
        bases.push(format!("{}/{}", root, sha1));
        bases
            .into_iter()
            .map(|base| format!("{}/engine/{}/{}", base, platform, filename))
            .collect()
    }

    fn packaging_tool_urls(&self, sha1: &str, channel: Channel) -> Vec<String> {
        let root = self.archive.base();
        if channel.has_url_prefix() {
            vec![
                format!("{}/{}/{}/packer/packer.jar", root, channel, sha1),
                format!("{}/{}/{}/{}/packer/packer.jar", root, channel, sha1, channel),
                format!("{}/{}/packer/packer.jar", root, sha1),
            ]
        } else {
            vec![
                format!("{}/stable/{}/packer/packer.jar", root, sha1),
                format!("{}/{}/packer/packer.jar", root, sha1),
            ]
        }
    }

    fn editor_urls(&self, sha1: &str, channel: Channel, filename: &str) -> Vec<String> {
        let root = self.archive.base();
        // Stable editors still publish under the historical editor-alpha
        // path; channel builds try their prefixed layouts first.
        if channel.has_url_prefix() {
            vec![
                format!("{}/{}/{}/{}/editor2/{}", root, channel, sha1, channel, filename),
                format!("{}/{}/{}/editor2/{}", root, channel, sha1, filename),
                format!("{}/{}/editor-alpha/editor2/{}", root, sha1, filename),
            ]
        } else {
            vec![format!("{}/{}/editor-alpha/editor2/{}", root, sha1, filename)]
        }
    }

    /// Tries each candidate URL in order, streaming the first hit to
    /// `dest`.
    ///
    /// A 404 advances the chain; any other HTTP error or transport failure
    /// aborts the whole attempt. Fallback is reserved for "not found", not
    /// for general network trouble. An exhausted chain returns `Ok(false)`.
    pub async fn download_with_fallback(
        &self,
        urls: &[String],
        dest: &Path,
    ) -> Result<bool, TrackerError> {
        for url in urls {
            debug!("Downloading from {}", url);
            let response =
                self.client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| TrackerError::Network {
                        url: url.clone(),
                        reason: e.to_string(),
                    })?;

            let status = response.status();
            if status == reqwest::StatusCode::NOT_FOUND {
                debug!("Not found at {}, trying next candidate", url);
                continue;
            }
            if !status.is_success() {
                return Err(TrackerError::Network {
                    url: url.clone(),
                    reason: format!("HTTP {}", status.as_u16()),
                });
            }

            self.write_body(response, dest, url).await?;
            info!("Downloaded {} to {}", url, dest.display());
            return Ok(true);
        }
        warn!("All {} candidate URLs exhausted", urls.len());
        Ok(false)
    }

    /// A truncated file must not survive a failed transfer; the
    /// destination is removed before the error propagates.
    async fn write_body(
        &self,
        response: reqwest::Response,
        dest: &Path,
        url: &str,
    ) -> Result<(), TrackerError> {
        let result = self.stream_to_file(response, dest, url).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(dest).await;
        }
        result
    }

    async fn stream_to_file(
        &self,
        mut response: reqwest::Response,
        dest: &Path,
        url: &str,
    ) -> Result<(), TrackerError> {
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| TrackerError::io(dest, e))?;
        while let Some(chunk) = response.chunk().await.map_err(|e| TrackerError::Network {
            url: url.to_string(),
            reason: e.to_string(),
        })? {
            file.write_all(&chunk)
                .await
                .map_err(|e| TrackerError::io(dest, e))?;
        }
        file.flush().await.map_err(|e| TrackerError::io(dest, e))?;
        Ok(())
    }

    /// Size probe without a download: the Content-Length of a GET response,
    /// or `None` on 404.
    pub async fn fetch_content_length(&self, url: &str) -> Result<Option<u64>, TrackerError> {
        let response =
            self.client
                .get(url)
                .send()
                .await
                .map_err(|e| TrackerError::Network {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(TrackerError::Network {
                url: url.to_string(),
                reason: format!("HTTP {}", status.as_u16()),
            });
        }
        Ok(response.content_length())
    }
}

/// Extracts a ZIP archive into `dest_dir`. Corrupt archives surface as
/// `MalformedArchive`.
pub fn extract_zip(archive_path: &Path, dest_dir: &Path) -> Result<(), TrackerError> {
    let file = std::fs::File::open(archive_path).map_err(|e| TrackerError::io(archive_path, e))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| TrackerError::MalformedArchive {
            path: archive_path.to_path_buf(),
            reason: e.to_string(),
        })?;
    archive
        .extract(dest_dir)
        .map_err(|e| TrackerError::MalformedArchive {
            path: archive_path.to_path_buf(),
            reason: e.to_string(),
        })
}
