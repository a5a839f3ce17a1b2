use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info, warn};

use crate::analyzer::{analyze_archive_entries, analyze_bundle_tree, write_entries_csv};
use crate::analyzer::{BundleGroupRules, SizeAnalyzer};
use crate::config::{PlatformSpec, TrackerConfig};
use crate::fetcher::{extract_zip, ArtifactKind, Fetcher};
use crate::graph;
use crate::releases::{query_all_channels, Release, ReleaseList};
use crate::report::{cleanup_stale_analyses, AnalysisIndex, Report, VersionEntry};
use crate::symbols;
use crate::version::Version;

/// Downloaded and extracted artifacts for one unit of work. Everything
/// tracked is removed when the workspace drops, on success and failure
/// alike, to bound disk usage across a long batch.
#[derive(Debug, Default)]
struct Workspace {
    paths: Vec<PathBuf>,
}

impl Workspace {
    fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            if !path.exists() {
                continue;
            }
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => debug!("Cleaned up {}", path.display()),
                Err(e) => warn!("Failed to clean up {}: {}", path.display(), e),
            }
        }
    }
}

/// Inserts the version before the filename's extension, so downloads for
/// different versions never collide in a platform directory.
fn versioned_filename(filename: &str, version: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, ext)) => format!("{}_{}.{}", stem, version, ext),
        None => format!("{}_{}", filename, version),
    }
}

/// Sequential batch driver: one version on one platform at a time, every
/// network call and subprocess awaited to completion before the next.
/// Failures are local to their (version, platform) unit; the loop logs
/// them and continues.
pub struct Tracker {
    config: TrackerConfig,
    fetcher: Fetcher,
    analyzer: SizeAnalyzer,
}

impl Tracker {
    pub fn new(config: TrackerConfig) -> Self {
        let fetcher = Fetcher::new(config.archive.clone());
        let analyzer = SizeAnalyzer::new(&config.analyzer_bin);
        Self {
            config,
            fetcher,
            analyzer,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Loads the persisted release list as-is. A missing or malformed
    /// release file is a configuration error and aborts the run.
    pub fn load_releases(&self) -> Result<ReleaseList> {
        let path = &self.config.releases_path;
        ReleaseList::load(path)
            .with_context(|| format!("loading release file {}", path.display()))
    }

    /// Loads the persisted release list, folds in the channel "latest"
    /// discoveries, and persists atomically when anything changed.
    pub async fn refresh_releases(&self) -> Result<(ReleaseList, HashSet<String>)> {
        let mut releases = self.load_releases()?;

        let discovered = query_all_channels(self.fetcher.client(), &self.config.archive).await;
        let outcome = releases.merge(&discovered);
        if outcome.changed {
            releases.save(&self.config.releases_path)?;
        }
        Ok((releases, outcome.forced))
    }

    /// Releases at or above the configured minimum, oldest first. Invalid
    /// version strings are logged and skipped.
    fn filtered_releases<'a>(&self, releases: &'a ReleaseList) -> Vec<&'a Release> {
        let min = match Version::parse(&self.config.min_version) {
            Ok(v) => v,
            Err(e) => {
                warn!("Invalid minimum version in config: {}", e);
                return Vec::new();
            }
        };
        let mut filtered: Vec<(Version, &Release)> = releases
            .releases
            .iter()
            .filter_map(|r| match Version::parse(&r.version) {
                Ok(v) if v >= min => Some((v, r)),
                Ok(_) => None,
                Err(e) => {
                    warn!("Skipping release with invalid version: {}", e);
                    None
                }
            })
            .collect();
        filtered.sort_by_key(|(v, _)| *v);
        filtered.into_iter().map(|(_, r)| r).collect()
    }

    /// Full analysis batch over every platform table and every release at
    /// or above the minimum version. Rebuilds the analysis index from the
    /// CSVs actually on disk when done.
    pub async fn run_batch(&self, releases: &ReleaseList, forced: &HashSet<String>) -> Result<()> {
        let index_path = self.config.data_dir.join("analysis_index.json");
        let index = AnalysisIndex::load_or_default(&index_path)?;
        let mut new_index = AnalysisIndex::default();

        let filtered = self.filtered_releases(releases);
        info!(
            "Found {} releases at or above {}",
            filtered.len(),
            self.config.min_version
        );

        let sha1_by_version: HashMap<&str, &str> = releases
            .releases
            .iter()
            .map(|r| (r.version.as_str(), r.sha1.as_str()))
            .collect();
        let released_versions: HashSet<String> = releases
            .releases
            .iter()
            .map(|r| r.version.clone())
            .collect();

        for spec in &self.config.engine_platforms {
            info!("=== Processing platform {} ===", spec.platform);
            let platform_dir = self.config.data_dir.join(&spec.platform);
            std::fs::create_dir_all(&platform_dir)?;

            for &release in &filtered {
                let csv_path = platform_dir.join(format!("{}.csv", release.version));
                if self.analysis_is_current(&index, &spec.platform, release, &csv_path, forced) {
                    debug!("Analysis already exists: {}", csv_path.display());
                    continue;
                }
                match self
                    .analyze_engine_release(spec, release, &platform_dir, &csv_path)
                    .await
                {
                    Ok(true) => info!("Analyzed {} for {}", release.version, spec.platform),
                    Ok(false) => warn!(
                        "Skipping {} for {}: artifact unavailable",
                        release.version, spec.platform
                    ),
                    Err(e) => warn!(
                        "Skipping {} for {}: {}",
                        release.version, spec.platform, e
                    ),
                }
            }

            self.finish_platform(
                &mut new_index,
                &spec.platform,
                &platform_dir,
                &released_versions,
                &sha1_by_version,
            );
        }

        {
            let platform = self.config.packaging_tool_platform.clone();
            info!("=== Processing platform {} ===", platform);
            let platform_dir = self.config.data_dir.join(&platform);
            std::fs::create_dir_all(&platform_dir)?;

            for &release in &filtered {
                let csv_path = platform_dir.join(format!("{}.csv", release.version));
                if self.analysis_is_current(&index, &platform, release, &csv_path, forced) {
                    debug!("Analysis already exists: {}", csv_path.display());
                    continue;
                }
                match self
                    .analyze_packaging_tool_release(release, &platform_dir, &csv_path)
                    .await
                {
                    Ok(true) => info!("Analyzed {} for {}", release.version, platform),
                    Ok(false) => warn!(
                        "Skipping {} for {}: artifact unavailable",
                        release.version, platform
                    ),
                    Err(e) => warn!("Skipping {} for {}: {}", release.version, platform, e),
                }
            }

            self.finish_platform(
                &mut new_index,
                &platform,
                &platform_dir,
                &released_versions,
                &sha1_by_version,
            );
        }

        for spec in &self.config.editor_platforms {
            let platform = format!("editor-{}", spec.platform);
            info!("=== Processing platform {} ===", platform);
            let platform_dir = self.config.data_dir.join(&platform);
            std::fs::create_dir_all(&platform_dir)?;

            for &release in &filtered {
                let csv_path = platform_dir.join(format!("{}.csv", release.version));
                if self.analysis_is_current(&index, &platform, release, &csv_path, forced) {
                    debug!("Analysis already exists: {}", csv_path.display());
                    continue;
                }
                match self
                    .analyze_editor_release(spec, release, &platform_dir, &csv_path)
                    .await
                {
                    Ok(true) => info!("Analyzed editor {} for {}", release.version, spec.platform),
                    Ok(false) => warn!(
                        "Skipping editor {} for {}: artifact unavailable",
                        release.version, spec.platform
                    ),
                    Err(e) => warn!(
                        "Skipping editor {} for {}: {}",
                        release.version, spec.platform, e
                    ),
                }
            }

            self.finish_platform(
                &mut new_index,
                &platform,
                &platform_dir,
                &released_versions,
                &sha1_by_version,
            );
        }

        new_index.save(&index_path)?;
        info!(
            "Analysis index updated with {} platforms",
            new_index.platforms.len()
        );
        Ok(())
    }

    fn analysis_is_current(
        &self,
        index: &AnalysisIndex,
        platform: &str,
        release: &Release,
        csv_path: &Path,
        forced: &HashSet<String>,
    ) -> bool {
        csv_path.exists()
            && !forced.contains(&release.version)
            && !index.is_stale(platform, &release.version, &release.sha1)
    }

    /// Prunes analyses for vanished versions and records what is actually
    /// on disk for this platform in the fresh index.
    fn finish_platform(
        &self,
        new_index: &mut AnalysisIndex,
        platform: &str,
        platform_dir: &Path,
        released_versions: &HashSet<String>,
        sha1_by_version: &HashMap<&str, &str>,
    ) {
        cleanup_stale_analyses(platform_dir, released_versions);

        let mut entries = Vec::new();
        if let Ok(dir) = std::fs::read_dir(platform_dir) {
            for entry in dir.filter_map(|e| e.ok()) {
                let path = entry.path();
                if !path.extension().map(|e| e == "csv").unwrap_or(false) {
                    continue;
                }
                let version = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                if !released_versions.contains(&version) {
                    continue;
                }
                let sha1 = sha1_by_version
                    .get(version.as_str())
                    .copied()
                    .unwrap_or("unknown");
                entries.push(VersionEntry {
                    version,
                    sha1: sha1.to_string(),
                });
            }
        }
        info!("Finished {}: {} versions", platform, entries.len());
        new_index.set_platform(platform, entries);
    }

    /// Downloads and analyzes one engine binary, plus its debug-symbol
    /// bundle on platforms that need one, writing the compressed symbol
    /// CSV on success.
    async fn analyze_engine_release(
        &self,
        spec: &PlatformSpec,
        release: &Release,
        platform_dir: &Path,
        csv_path: &Path,
    ) -> Result<bool> {
        let channel = release.channel();
        let mut workspace = Workspace::default();

        let binary_path = platform_dir.join(versioned_filename(&spec.filename, &release.version));
        let urls = self.fetcher.build_urls(
            ArtifactKind::Engine,
            &release.sha1,
            channel,
            Some(&spec.platform),
            Some(&spec.filename),
        );
        if !self.fetcher.download_with_fallback(&urls, &binary_path).await? {
            return Ok(false);
        }
        workspace.track(binary_path.clone());

        let mut debug_file = None;
        if spec.needs_debug_symbols {
            let dsym_zip =
                platform_dir.join(format!("{}_{}.dSYM.zip", spec.filename, release.version));
            let urls = self.fetcher.build_urls(
                ArtifactKind::DebugSymbols,
                &release.sha1,
                channel,
                Some(&spec.platform),
                Some(&spec.filename),
            );
            if !self.fetcher.download_with_fallback(&urls, &dsym_zip).await? {
                return Ok(false);
            }
            workspace.track(dsym_zip.clone());

            let extract_dir = platform_dir.join(format!("dsym_{}", release.version));
            extract_zip(&dsym_zip, &extract_dir)?;
            workspace.track(extract_dir.clone());

            // Fixed layout of an extracted dSYM bundle.
            let dwarf = extract_dir
                .join("src")
                .join(format!("{}.dSYM", spec.filename))
                .join("Contents/Resources/DWARF")
                .join(&spec.filename);
            if !dwarf.exists() {
                warn!("DWARF file not found in dSYM for {}", release.version);
                return Ok(false);
            }
            debug_file = Some(dwarf);
        }

        let rows = self
            .analyzer
            .run_symbol_analysis(&binary_path, debug_file.as_deref())?;
        let groups = symbols::compress(&rows);
        symbols::write_groups_csv(csv_path, &groups)?;
        Ok(true)
    }

    /// Downloads the packaging tool jar and writes its entry listing.
    async fn analyze_packaging_tool_release(
        &self,
        release: &Release,
        platform_dir: &Path,
        csv_path: &Path,
    ) -> Result<bool> {
        let mut workspace = Workspace::default();
        let jar_path = platform_dir.join(format!("packer_{}.jar", release.version));

        let urls = self.fetcher.build_urls(
            ArtifactKind::PackagingTool,
            &release.sha1,
            release.channel(),
            None,
            None,
        );
        if !self.fetcher.download_with_fallback(&urls, &jar_path).await? {
            return Ok(false);
        }
        workspace.track(jar_path.clone());

        let entries = analyze_archive_entries(&jar_path)?;
        write_entries_csv(csv_path, &entries)?;
        Ok(true)
    }

    /// Downloads and extracts an editor bundle, then writes the grouped
    /// tree listing.
    async fn analyze_editor_release(
        &self,
        spec: &PlatformSpec,
        release: &Release,
        platform_dir: &Path,
        csv_path: &Path,
    ) -> Result<bool> {
        let mut workspace = Workspace::default();
        let archive_path =
            platform_dir.join(format!("editor_{}_{}.zip", release.version, spec.platform));

        let urls = self.fetcher.build_urls(
            ArtifactKind::Editor,
            &release.sha1,
            release.channel(),
            Some(&spec.platform),
            Some(&spec.filename),
        );
        if !self
            .fetcher
            .download_with_fallback(&urls, &archive_path)
            .await?
        {
            return Ok(false);
        }
        workspace.track(archive_path.clone());

        let extract_dir = platform_dir.join(format!("extracted_{}", release.version));
        extract_zip(&archive_path, &extract_dir)?;
        workspace.track(extract_dir.clone());

        let entries = analyze_bundle_tree(&extract_dir, &BundleGroupRules::default())?;
        write_entries_csv(csv_path, &entries)?;
        Ok(true)
    }

    /// Single-shot run against the latest release for one platform family.
    pub async fn run_test_mode(&self, target: &str, releases: &ReleaseList) -> Result<()> {
        let latest = releases
            .latest()
            .ok_or_else(|| anyhow!("no valid releases found"))?
            .clone();
        info!(
            "Test mode {}: latest version {} ({})",
            target, latest.version, latest.sha1
        );

        let engine_spec = |platform: &str| {
            self.config
                .engine_platforms
                .iter()
                .find(|s| s.platform == platform)
                .cloned()
                .ok_or_else(|| anyhow!("platform {} not configured", platform))
        };

        match target {
            "ios" | "android" | "macos" => {
                let platform = match target {
                    "ios" => "arm64-ios",
                    "android" => "arm64-android",
                    _ => "arm64-macos",
                };
                let spec = engine_spec(platform)?;
                let platform_dir = self.config.data_dir.join(&spec.platform);
                std::fs::create_dir_all(&platform_dir)?;
                let csv_path = platform_dir.join(format!("{}.csv", latest.version));
                if self
                    .analyze_engine_release(&spec, &latest, &platform_dir, &csv_path)
                    .await?
                {
                    info!("Test completed: {}", csv_path.display());
                } else {
                    warn!("Test failed for {}", platform);
                }
            }
            "packer" => {
                let platform_dir = self
                    .config
                    .data_dir
                    .join(&self.config.packaging_tool_platform);
                std::fs::create_dir_all(&platform_dir)?;
                let csv_path = platform_dir.join(format!("{}.csv", latest.version));
                if self
                    .analyze_packaging_tool_release(&latest, &platform_dir, &csv_path)
                    .await?
                {
                    info!("Test completed: {}", csv_path.display());
                } else {
                    warn!("Test failed for packaging tool");
                }
            }
            "editor" => {
                let spec = self
                    .config
                    .editor_platforms
                    .first()
                    .cloned()
                    .ok_or_else(|| anyhow!("no editor platforms configured"))?;
                let platform_dir = self
                    .config
                    .data_dir
                    .join(format!("editor-{}", spec.platform));
                std::fs::create_dir_all(&platform_dir)?;
                let csv_path = platform_dir.join(format!("{}.csv", latest.version));
                if self
                    .analyze_editor_release(&spec, &latest, &platform_dir, &csv_path)
                    .await?
                {
                    info!("Test completed: {}", csv_path.display());
                } else {
                    warn!("Test failed for editor {}", spec.platform);
                }
            }
            other => {
                return Err(anyhow!(
                    "unknown test platform {} (available: ios, android, packer, editor, macos)",
                    other
                ));
            }
        }
        Ok(())
    }

    /// Updates the legacy engine-size report by probing artifact sizes
    /// with Content-Length requests. Returns whether the report changed.
    pub async fn update_size_report(
        &self,
        releases: &ReleaseList,
        forced: &HashSet<String>,
        report_path: &Path,
    ) -> Result<bool> {
        let platform_names: Vec<String> = self
            .config
            .legacy_engine_platforms
            .iter()
            .map(|p| p.platform.clone())
            .collect();

        let mut report = if report_path.exists() {
            Report::load(report_path)?
        } else {
            Report::new(&platform_names)
        };

        // Probe sizes up front; reconcile itself stays synchronous. A cell
        // needs probing when its version is new or forced, or when it is
        // still unmeasured from an earlier run.
        let mut measured: HashMap<(String, String), u64> = HashMap::new();
        for release in &releases.releases {
            let measure_all = !report.contains_version(&release.version)
                || forced.contains(&release.version);
            let mut logged = false;
            for spec in &self.config.legacy_engine_platforms {
                if !measure_all && report.get(&spec.platform, &release.version).is_some() {
                    continue;
                }
                if !logged {
                    info!("Measuring engine sizes for {}", release.version);
                    logged = true;
                }
                match self.probe_engine_size(&release.sha1, spec).await {
                    Ok(Some(size)) => {
                        measured.insert((spec.platform.clone(), release.version.clone()), size);
                    }
                    Ok(None) => debug!(
                        "No artifact for {} on {}",
                        release.version, spec.platform
                    ),
                    Err(e) => warn!(
                        "Probe failed for {} on {}: {}",
                        release.version, spec.platform, e
                    ),
                }
            }
        }

        let changed = report.reconcile(&releases.releases, &platform_names, forced, |p, r| {
            measured.get(&(p.to_string(), r.version.clone())).copied()
        });
        if changed {
            report.write(report_path)?;
        }
        Ok(changed)
    }

    /// Stripped binaries moved under a `stripped/` segment partway through
    /// history; fall back to the unstripped path when absent or empty.
    async fn probe_engine_size(
        &self,
        sha1: &str,
        spec: &PlatformSpec,
    ) -> Result<Option<u64>> {
        let base = self.config.archive.base();
        let stripped = format!(
            "{}/{}/engine/{}/stripped/{}",
            base, sha1, spec.platform, spec.filename
        );
        if let Some(size) = self.fetcher.fetch_content_length(&stripped).await? {
            if size > 0 {
                return Ok(Some(size));
            }
        }
        let plain = format!("{}/{}/engine/{}/{}", base, sha1, spec.platform, spec.filename);
        Ok(self
            .fetcher
            .fetch_content_length(&plain)
            .await?
            .filter(|s| *s > 0))
    }

    /// Renders the full-history and floored trend graphs for a report.
    pub fn render_graphs(&self, report: &Report, out_dir: &Path) -> Result<()> {
        graph::render(report, &out_dir.join("size.png"), None)?;
        if let Some(floor) = &self.config.graph_floor {
            graph::render(report, &out_dir.join("size_small.png"), Some(floor))?;
        }
        Ok(())
    }
}
