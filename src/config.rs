use std::path::PathBuf;

use anyhow::{anyhow, Result};
use url::Url;

pub const DEFAULT_ARCHIVE_URL: &str = "http://d.meridianengine.com/archive";

/// Location of the remote artifact archive.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub root: Url,
}

impl ArchiveConfig {
    pub fn new(root: Url) -> Self {
        Self { root }
    }

    /// Reads the archive root from the environment, falling back to the
    /// public archive. `SIZETRACKER_ARCHIVE_URL` overrides.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let raw = std::env::var("SIZETRACKER_ARCHIVE_URL")
            .unwrap_or_else(|_| DEFAULT_ARCHIVE_URL.to_string());
        let root = Url::parse(&raw).map_err(|e| anyhow!("invalid archive url {}: {}", raw, e))?;
        Ok(Self { root })
    }

    /// Archive root without a trailing slash, ready for path concatenation.
    pub fn base(&self) -> String {
        self.root.as_str().trim_end_matches('/').to_string()
    }
}

/// One engine platform to measure: archive platform name plus the artifact
/// filename published for it.
#[derive(Debug, Clone)]
pub struct PlatformSpec {
    pub platform: String,
    pub filename: String,
    /// Apple platforms ship a dSYM bundle the analyzer needs for symbols.
    pub needs_debug_symbols: bool,
}

impl PlatformSpec {
    pub fn new(platform: &str, filename: &str, needs_debug_symbols: bool) -> Self {
        Self {
            platform: platform.to_string(),
            filename: filename.to_string(),
            needs_debug_symbols,
        }
    }
}

/// Full configuration for a tracker run. All tables are explicit values
/// passed into the components; nothing reads module-level state.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub archive: ArchiveConfig,
    /// Engine binaries analyzed with the symbol analyzer.
    pub engine_platforms: Vec<PlatformSpec>,
    /// Editor bundles, downloaded as ZIP and analyzed as a file tree.
    pub editor_platforms: Vec<PlatformSpec>,
    /// Legacy engine platforms probed by Content-Length for the size report.
    pub legacy_engine_platforms: Vec<PlatformSpec>,
    /// Report column name for the packaging tool jar.
    pub packaging_tool_platform: String,
    /// Oldest release the analysis batch will touch.
    pub min_version: String,
    /// Root directory for per-platform analysis CSVs and the index.
    pub data_dir: PathBuf,
    pub releases_path: PathBuf,
    /// External size analyzer binary name or path.
    pub analyzer_bin: String,
    /// Version floor applied to the small trend graph.
    pub graph_floor: Option<String>,
}

impl TrackerConfig {
    /// The standard production configuration.
    pub fn standard(archive: ArchiveConfig) -> Self {
        Self {
            archive,
            engine_platforms: vec![
                PlatformSpec::new("arm64-android", "libmengine_release.so", false),
                PlatformSpec::new("armv7-android", "libmengine_release.so", false),
                PlatformSpec::new("arm64-ios", "mengine_release", true),
                PlatformSpec::new("x86_64-macos", "mengine_release", true),
                PlatformSpec::new("arm64-macos", "mengine_release", true),
            ],
            editor_platforms: vec![
                PlatformSpec::new("win32", "Meridian-x86_64-win32.zip", false),
                PlatformSpec::new("x86_64-linux", "Meridian-x86_64-linux.zip", false),
                PlatformSpec::new("x86_64-macos", "Meridian-x86_64-macos.zip", false),
                PlatformSpec::new("arm64-macos", "Meridian-arm64-macos.zip", false),
            ],
            legacy_engine_platforms: vec![
                PlatformSpec::new("arm64-ios", "mengine_release", false),
                PlatformSpec::new("armv7-android", "mengine_release.apk", false),
                PlatformSpec::new("arm64-android", "mengine_release.apk", false),
                PlatformSpec::new("js-web", "mengine_release.js", false),
                PlatformSpec::new("wasm-web", "mengine_release.wasm", false),
                PlatformSpec::new("x86_64-linux", "mengine_release", false),
                PlatformSpec::new("x86_64-win32", "mengine_release.exe", false),
                PlatformSpec::new("x86_64-macos", "mengine_release", false),
            ],
            packaging_tool_platform: "packer.jar".to_string(),
            min_version: "1.9.0".to_string(),
            data_dir: PathBuf::from("size-analyzer"),
            releases_path: PathBuf::from("releases.json"),
            analyzer_bin: "bloaty".to_string(),
            graph_floor: Some("1.2.155".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_base_trims_trailing_slash() {
        let archive = ArchiveConfig::new(Url::parse("http://archive.test/archive/").unwrap());
        assert_eq!(archive.base(), "http://archive.test/archive");
    }

    #[test]
    fn standard_config_has_unique_report_columns() {
        let config =
            TrackerConfig::standard(ArchiveConfig::new(Url::parse(DEFAULT_ARCHIVE_URL).unwrap()));
        let mut names: Vec<&str> = config
            .legacy_engine_platforms
            .iter()
            .map(|p| p.platform.as_str())
            .collect();
        names.sort();
        let before = names.len();
        names.dedup();
        assert_eq!(before, names.len());
    }
}
