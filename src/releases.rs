use std::collections::HashSet;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::ArchiveConfig;
use crate::error::TrackerError;
use crate::version::{Channel, Version};

/// One published release. Identity is the full version string, channel
/// suffix included ("1.4.0-beta" and "1.4.0" are distinct entries).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub version: String,
    pub sha1: String,
}

impl Release {
    pub fn new(version: &str, sha1: &str) -> Self {
        Self {
            version: version.to_string(),
            sha1: sha1.to_string(),
        }
    }

    pub fn channel(&self) -> Channel {
        Channel::of_version(&self.version)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseList {
    pub releases: Vec<Release>,
}

/// Result of merging channel discoveries into the persisted list.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// Whether the list mutated and should be persisted (and reports rerun).
    pub changed: bool,
    /// Versions that must be (re)measured: new entries plus entries whose
    /// content hash moved under an existing version string.
    pub forced: HashSet<String>,
}

impl ReleaseList {
    pub fn load(path: &Path) -> Result<ReleaseList, TrackerError> {
        let raw = std::fs::read_to_string(path).map_err(|e| TrackerError::io(path, e))?;
        serde_json::from_str(&raw).map_err(|e| TrackerError::MalformedReleaseFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Writes the list as pretty JSON via a side-by-side temp file and a
    /// rename, so the canonical file is never left partially written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut tmp = match dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new_in(".")?,
        };
        let body = serde_json::to_string_pretty(self)?;
        tmp.write_all(body.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)
            .with_context(|| format!("replacing {}", path.display()))?;
        debug!("Wrote {} releases to {}", self.releases.len(), path.display());
        Ok(())
    }

    pub fn contains_version(&self, version: &str) -> bool {
        self.releases.iter().any(|r| r.version == version)
    }

    pub fn sha1_for(&self, version: &str) -> Option<&str> {
        self.releases
            .iter()
            .find(|r| r.version == version)
            .map(|r| r.sha1.as_str())
    }

    /// Highest release by version order. Entries with unparseable version
    /// strings are skipped.
    pub fn latest(&self) -> Option<&Release> {
        self.releases
            .iter()
            .filter_map(|r| Version::parse(&r.version).ok().map(|v| (v, r)))
            .max_by_key(|(v, _)| *v)
            .map(|(_, r)| r)
    }

    /// Folds channel discoveries into the list.
    ///
    /// New versions are appended and forced; an existing version whose sha1
    /// moved is updated in place and forced; alpha/beta entries whose
    /// numeric triple matches a stable entry are dropped as superseded.
    pub fn merge(&mut self, discovered: &[Release]) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        for found in discovered {
            match self.releases.iter_mut().find(|r| r.version == found.version) {
                Some(existing) => {
                    if existing.sha1 != found.sha1 {
                        info!(
                            "Release {} moved ({} -> {}), forcing re-measurement",
                            found.version, existing.sha1, found.sha1
                        );
                        existing.sha1 = found.sha1.clone();
                        outcome.changed = true;
                        outcome.forced.insert(found.version.clone());
                    }
                }
                None => {
                    info!("Discovered new release {} ({})", found.version, found.sha1);
                    self.releases.push(found.clone());
                    outcome.changed = true;
                    outcome.forced.insert(found.version.clone());
                }
            }
        }

        // A pre-release is superseded once a stable entry with the same
        // numeric triple exists.
        let stable_triples: HashSet<(u32, u32, u32)> = self
            .releases
            .iter()
            .filter_map(|r| Version::parse(&r.version).ok())
            .filter(|v| v.channel == Channel::Stable)
            .map(|v| v.triple())
            .collect();

        let before = self.releases.len();
        self.releases.retain(|r| {
            let superseded = Version::parse(&r.version)
                .map(|v| v.channel != Channel::Stable && stable_triples.contains(&v.triple()))
                .unwrap_or(false);
            if superseded {
                info!("Dropping superseded pre-release {}", r.version);
                outcome.forced.remove(&r.version);
            }
            !superseded
        });
        if self.releases.len() != before {
            outcome.changed = true;
        }

        outcome
    }
}

/// Queries the "latest" metadata endpoint for a channel.
pub async fn query_latest(
    client: &reqwest::Client,
    archive: &ArchiveConfig,
    channel: Channel,
) -> Result<Release, TrackerError> {
    let url = format!("{}/{}/info.json", archive.base(), channel);
    debug!("Querying latest {} release from {}", channel, url);

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| TrackerError::Network {
            url: url.clone(),
            reason: e.to_string(),
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(TrackerError::ChannelUnavailable {
            channel: channel.to_string(),
            status: status.as_u16(),
        });
    }

    response
        .json::<Release>()
        .await
        .map_err(|e| TrackerError::Network {
            url,
            reason: format!("invalid latest payload: {}", e),
        })
}

/// Queries every channel, tolerating individual channel outages.
pub async fn query_all_channels(
    client: &reqwest::Client,
    archive: &ArchiveConfig,
) -> Vec<Release> {
    let mut discovered = Vec::new();
    for channel in [Channel::Stable, Channel::Beta, Channel::Alpha] {
        match query_latest(client, archive, channel).await {
            Ok(release) => discovered.push(release),
            Err(e) => warn!("Skipping {} channel: {}", channel, e),
        }
    }
    discovered
}
