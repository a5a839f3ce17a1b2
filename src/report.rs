use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::releases::Release;
use crate::version::compare_version_strings;

/// Tabular size report: rows are release versions, columns are platforms.
///
/// Cells are `Option<u64>` in memory; the CSV format writes unmeasured
/// cells as `0`, so a loaded `0` comes back as `None`. A genuinely
/// zero-byte artifact is indistinguishable on disk — an ambiguity inherited
/// from the format.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    pub versions: Vec<String>,
    pub platforms: Vec<String>,
    sizes: HashMap<String, HashMap<String, u64>>,
}

impl Report {
    pub fn new(platforms: &[String]) -> Self {
        Self {
            versions: Vec::new(),
            platforms: platforms.to_vec(),
            sizes: HashMap::new(),
        }
    }

    /// Parses a `VERSION,<platform>,...` CSV.
    pub fn load(path: &Path) -> Result<Report> {
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("opening report {}", path.display()))?;

        let headers = reader.headers()?.clone();
        let mut columns = headers.iter();
        if columns.next() != Some("VERSION") {
            return Err(anyhow!(
                "report {} does not start with a VERSION column",
                path.display()
            ));
        }
        let platforms: Vec<String> = columns.map(|c| c.to_string()).collect();

        let mut report = Report::new(&platforms);
        for record in reader.records() {
            let record = record?;
            let version = record
                .get(0)
                .ok_or_else(|| anyhow!("empty row in {}", path.display()))?
                .to_string();
            for (platform, cell) in platforms.iter().zip(record.iter().skip(1)) {
                let size: u64 = cell.trim().parse().unwrap_or(0);
                if size > 0 {
                    report.set(platform, &version, size);
                }
            }
            report.versions.push(version);
        }
        Ok(report)
    }

    pub fn get(&self, platform: &str, version: &str) -> Option<u64> {
        self.sizes.get(platform).and_then(|col| col.get(version)).copied()
    }

    pub fn set(&mut self, platform: &str, version: &str, size: u64) {
        self.sizes
            .entry(platform.to_string())
            .or_default()
            .insert(version.to_string(), size);
    }

    pub fn clear(&mut self, platform: &str, version: &str) {
        if let Some(col) = self.sizes.get_mut(platform) {
            col.remove(version);
        }
    }

    pub fn contains_version(&self, version: &str) -> bool {
        self.versions.iter().any(|v| v == version)
    }

    /// Reconciles the report against the current release list.
    ///
    /// Removes versions no longer released and platforms no longer
    /// supported, adds columns for new platforms, measures rows for new
    /// versions and re-measures forced ones via `measure`. Cells of
    /// existing rows that are still unmeasured are retried on every run
    /// until a measurement lands. Returns whether anything changed;
    /// reconciling a fully measured, unchanged world is a no-op.
    pub fn reconcile<F>(
        &mut self,
        releases: &[Release],
        supported_platforms: &[String],
        forced: &HashSet<String>,
        mut measure: F,
    ) -> bool
    where
        F: FnMut(&str, &Release) -> Option<u64>,
    {
        let mut changed = false;

        // (a) drop versions that left the release list, across every column.
        let released: HashSet<&str> = releases.iter().map(|r| r.version.as_str()).collect();
        let before = self.versions.len();
        let sizes = &mut self.sizes;
        self.versions.retain(|v| {
            let keep = released.contains(v.as_str());
            if !keep {
                info!("Dropping stale version {} from report", v);
                for col in sizes.values_mut() {
                    col.remove(v);
                }
            }
            keep
        });
        changed |= self.versions.len() != before;

        // (b) drop unsupported platform columns.
        let supported: HashSet<&str> = supported_platforms.iter().map(|p| p.as_str()).collect();
        let cols_before = self.platforms.len();
        let sizes = &mut self.sizes;
        self.platforms.retain(|p| {
            let keep = supported.contains(p.as_str());
            if !keep {
                info!("Dropping unsupported platform column {}", p);
                sizes.remove(p);
            }
            keep
        });
        changed |= self.platforms.len() != cols_before;

        // (c) add empty columns for newly supported platforms.
        for platform in supported_platforms {
            if !self.platforms.iter().any(|p| p == platform) {
                debug!("Adding platform column {}", platform);
                self.platforms.push(platform.clone());
                changed = true;
            }
        }

        // (d)+(e) measure new and forced versions in full; for other
        // existing rows, retry only the cells still unmeasured.
        for release in releases {
            let is_new = !self.contains_version(&release.version);
            let measure_all = is_new || forced.contains(&release.version);
            let platforms = self.platforms.clone();
            for platform in &platforms {
                let previous = self.get(platform, &release.version);
                if !measure_all && previous.is_some() {
                    continue;
                }
                match measure(platform, release) {
                    Some(size) => {
                        self.set(platform, &release.version, size);
                        changed |= previous != Some(size);
                    }
                    // A failed measurement stays unmeasured so a later run
                    // retries it.
                    None => {
                        self.clear(platform, &release.version);
                        changed |= previous.is_some();
                    }
                }
            }
            if is_new {
                self.versions.push(release.version.clone());
                changed = true;
            }
        }

        changed
    }

    /// Serializes the report with versions in release order, atomically.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut versions = self.versions.clone();
        versions.sort_by(|a, b| compare_version_strings(a, b));

        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut tmp = match dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new_in(".")?,
        };
        {
            let mut writer = csv::Writer::from_writer(&mut tmp);
            let mut header = vec!["VERSION".to_string()];
            header.extend(self.platforms.iter().cloned());
            writer.write_record(&header)?;

            for version in &versions {
                let mut row = vec![version.clone()];
                for platform in &self.platforms {
                    row.push(self.get(platform, version).unwrap_or(0).to_string());
                }
                writer.write_record(&row)?;
            }
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path)
            .with_context(|| format!("replacing {}", path.display()))?;
        debug!("Wrote report {} ({} versions)", path.display(), versions.len());
        Ok(())
    }
}

/// Per-platform catalogue of generated analyses, keyed by version with the
/// content hash measured at analysis time. Detects stale analyses when a
/// release's hash moves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisIndex {
    pub platforms: BTreeMap<String, PlatformVersions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformVersions {
    pub versions: Vec<VersionEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub version: String,
    pub sha1: String,
}

impl AnalysisIndex {
    /// Loads the index, or starts empty when the file does not exist yet.
    pub fn load_or_default(path: &Path) -> Result<AnalysisIndex> {
        if !path.exists() {
            return Ok(AnalysisIndex::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading index {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing index {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
            let mut tmp = NamedTempFile::new_in(parent)?;
            tmp.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
            tmp.persist(path)
                .with_context(|| format!("replacing {}", path.display()))?;
        } else {
            let mut tmp = NamedTempFile::new_in(".")?;
            tmp.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
            tmp.persist(path)
                .with_context(|| format!("replacing {}", path.display()))?;
        }
        Ok(())
    }

    pub fn sha1_for(&self, platform: &str, version: &str) -> Option<&str> {
        self.platforms
            .get(platform)?
            .versions
            .iter()
            .find(|v| v.version == version)
            .map(|v| v.sha1.as_str())
    }

    /// Whether the existing analysis for (platform, version) was made from
    /// a different content hash and must be redone.
    pub fn is_stale(&self, platform: &str, version: &str, current_sha1: &str) -> bool {
        match self.sha1_for(platform, version) {
            Some(recorded) => recorded != current_sha1,
            None => false,
        }
    }

    /// Replaces a platform's catalogue, sorted by version order.
    pub fn set_platform(&mut self, platform: &str, mut entries: Vec<VersionEntry>) {
        entries.sort_by(|a, b| compare_version_strings(&a.version, &b.version));
        self.platforms
            .insert(platform.to_string(), PlatformVersions { versions: entries });
    }
}

/// Removes per-version analysis CSVs whose version left the release list.
pub fn cleanup_stale_analyses(directory: &Path, allowed_versions: &HashSet<String>) {
    let Ok(entries) = std::fs::read_dir(directory) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().map(|e| e == "csv").unwrap_or(false) {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            if !allowed_versions.contains(&stem) {
                match std::fs::remove_file(&path) {
                    Ok(()) => info!("Removed stale analysis {}", path.display()),
                    Err(e) => warn!("Failed to remove stale analysis {}: {}", path.display(), e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn releases(entries: &[(&str, &str)]) -> Vec<Release> {
        entries.iter().map(|(v, s)| Release::new(v, s)).collect()
    }

    fn platforms(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn reconcile_measures_new_versions() {
        let mut report = Report::new(&platforms(&["arm64-ios", "arm64-android"]));
        let rels = releases(&[("1.9.0", "aaa")]);
        let changed = report.reconcile(&rels, &report.platforms.clone(), &HashSet::new(), |p, r| {
            assert_eq!(r.version, "1.9.0");
            if p == "arm64-ios" {
                Some(1000)
            } else {
                None
            }
        });
        assert!(changed);
        assert_eq!(report.get("arm64-ios", "1.9.0"), Some(1000));
        assert_eq!(report.get("arm64-android", "1.9.0"), None);
        assert!(report.contains_version("1.9.0"));
    }

    #[test]
    fn reconcile_is_idempotent_for_unchanged_world() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");
        let cols = platforms(&["arm64-ios"]);
        let rels = releases(&[("1.9.0", "aaa"), ("1.9.1", "bbb")]);

        let mut report = Report::new(&cols);
        report.reconcile(&rels, &cols, &HashSet::new(), |_, _| Some(42));
        report.write(&path).unwrap();
        let first = std::fs::read(&path).unwrap();

        let mut reloaded = Report::load(&path).unwrap();
        let changed = reloaded.reconcile(&rels, &cols, &HashSet::new(), |_, _| {
            panic!("nothing should be measured")
        });
        assert!(!changed);
        reloaded.write(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), first);
    }

    #[test]
    fn reconcile_removes_dropped_version_everywhere() {
        let cols = platforms(&["a", "b"]);
        let mut report = Report::new(&cols);
        let initial = releases(&[("1.2.0", "x"), ("1.3.0", "y")]);
        report.reconcile(&initial, &cols, &HashSet::new(), |_, _| Some(7));

        let remaining = releases(&[("1.3.0", "y")]);
        let changed = report.reconcile(&remaining, &cols, &HashSet::new(), |_, _| Some(7));
        assert!(changed);
        assert!(!report.contains_version("1.2.0"));
        assert_eq!(report.get("a", "1.2.0"), None);
        assert_eq!(report.get("b", "1.2.0"), None);
        assert_eq!(report.get("a", "1.3.0"), Some(7));
    }

    #[test]
    fn reconcile_adjusts_platform_columns() {
        let mut report = Report::new(&platforms(&["old", "kept"]));
        let rels = releases(&[("1.9.0", "aaa")]);
        report.reconcile(&rels, &platforms(&["old", "kept"]), &HashSet::new(), |_, _| Some(1));

        let changed = report.reconcile(&rels, &platforms(&["kept", "new"]), &HashSet::new(), |_, _| {
            Some(2)
        });
        assert!(changed);
        assert_eq!(report.platforms, platforms(&["kept", "new"]));
        assert_eq!(report.get("old", "1.9.0"), None);
        // The new column starts unmeasured, so existing versions get
        // measured for it; already measured cells are left alone.
        assert_eq!(report.get("new", "1.9.0"), Some(2));
        assert_eq!(report.get("kept", "1.9.0"), Some(1));
    }

    #[test]
    fn reconcile_remeasures_forced_versions() {
        let cols = platforms(&["a"]);
        let mut report = Report::new(&cols);
        let rels = releases(&[("1.9.0", "aaa")]);
        report.reconcile(&rels, &cols, &HashSet::new(), |_, _| Some(100));

        let forced: HashSet<String> = ["1.9.0".to_string()].into_iter().collect();
        let changed = report.reconcile(&rels, &cols, &forced, |_, _| Some(250));
        assert!(changed);
        assert_eq!(report.get("a", "1.9.0"), Some(250));
    }

    #[test]
    fn unmeasured_cells_are_retried_on_later_runs() {
        let cols = platforms(&["a", "b"]);
        let mut report = Report::new(&cols);
        let rels = releases(&[("1.9.0", "aaa")]);
        report.reconcile(&rels, &cols, &HashSet::new(), |p, _| {
            if p == "a" {
                Some(10)
            } else {
                None
            }
        });
        assert_eq!(report.get("b", "1.9.0"), None);

        // Artifact still missing: the cell is re-attempted but the report
        // does not count as changed.
        let changed = report.reconcile(&rels, &cols, &HashSet::new(), |p, _| {
            assert_eq!(p, "b");
            None
        });
        assert!(!changed);

        // The artifact finally appeared.
        let changed = report.reconcile(&rels, &cols, &HashSet::new(), |p, _| {
            assert_eq!(p, "b");
            Some(20)
        });
        assert!(changed);
        assert_eq!(report.get("a", "1.9.0"), Some(10));
        assert_eq!(report.get("b", "1.9.0"), Some(20));
    }

    #[test]
    fn forced_measurement_failure_reverts_to_unmeasured() {
        let cols = platforms(&["a"]);
        let mut report = Report::new(&cols);
        let rels = releases(&[("1.9.0", "aaa")]);
        report.reconcile(&rels, &cols, &HashSet::new(), |_, _| Some(100));

        let forced: HashSet<String> = ["1.9.0".to_string()].into_iter().collect();
        report.reconcile(&rels, &cols, &forced, |_, _| None);
        assert_eq!(report.get("a", "1.9.0"), None);
    }

    #[test]
    fn write_sorts_versions_and_zero_fills() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");
        let mut report = Report::new(&platforms(&["p"]));
        report.versions = vec!["1.10.0".into(), "1.9.0".into(), "1.10.0-beta".into()];
        report.set("p", "1.9.0", 5);

        report.write(&path).unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines[0], "VERSION,p");
        assert_eq!(lines[1], "1.9.0,5");
        assert_eq!(lines[2], "1.10.0-beta,0");
        assert_eq!(lines[3], "1.10.0,0");
    }

    #[test]
    fn load_treats_zero_as_unmeasured() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");
        std::fs::write(&path, "VERSION,p\n1.9.0,0\n1.9.1,77\n").unwrap();
        let report = Report::load(&path).unwrap();
        assert_eq!(report.get("p", "1.9.0"), None);
        assert_eq!(report.get("p", "1.9.1"), Some(77));
    }

    #[test]
    fn load_rejects_missing_version_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");
        std::fs::write(&path, "NOPE,p\n1.9.0,1\n").unwrap();
        assert!(Report::load(&path).is_err());
    }

    #[test]
    fn index_detects_hash_drift() {
        let mut index = AnalysisIndex::default();
        index.set_platform(
            "arm64-ios",
            vec![VersionEntry {
                version: "1.9.0".into(),
                sha1: "aaa".into(),
            }],
        );
        assert!(!index.is_stale("arm64-ios", "1.9.0", "aaa"));
        assert!(index.is_stale("arm64-ios", "1.9.0", "bbb"));
        // Unknown analyses are not stale, just absent.
        assert!(!index.is_stale("arm64-ios", "1.9.1", "ccc"));
    }

    #[test]
    fn index_round_trips_sorted_by_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data/analysis_index.json");
        let mut index = AnalysisIndex::default();
        index.set_platform(
            "packer.jar",
            vec![
                VersionEntry {
                    version: "1.10.0".into(),
                    sha1: "b".into(),
                },
                VersionEntry {
                    version: "1.9.0".into(),
                    sha1: "a".into(),
                },
            ],
        );
        index.save(&path).unwrap();

        let loaded = AnalysisIndex::load_or_default(&path).unwrap();
        let versions: Vec<&str> = loaded.platforms["packer.jar"]
            .versions
            .iter()
            .map(|v| v.version.as_str())
            .collect();
        assert_eq!(versions, vec!["1.9.0", "1.10.0"]);
    }

    #[test]
    fn stale_analysis_files_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("1.9.0.csv"), "x").unwrap();
        std::fs::write(dir.path().join("0.0.1.csv"), "x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

        let allowed: HashSet<String> = ["1.9.0".to_string()].into_iter().collect();
        cleanup_stale_analyses(dir.path(), &allowed);

        assert!(dir.path().join("1.9.0.csv").exists());
        assert!(!dir.path().join("0.0.1.csv").exists());
        assert!(dir.path().join("notes.txt").exists());
    }
}
