use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::TrackerError;

/// One raw symbol row from the size analyzer's CSV output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolRow {
    pub name: String,
    pub vmsize: u64,
    pub filesize: u64,
}

/// One entry of an archive or bundle tree listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub filename: String,
    pub compressed: u64,
    pub uncompressed: u64,
}

/// Wraps the external binary-size analyzer (bloaty) invoked as a
/// subprocess.
#[derive(Debug, Clone)]
pub struct SizeAnalyzer {
    bin: String,
}

impl SizeAnalyzer {
    pub fn new(bin: &str) -> Self {
        Self {
            bin: bin.to_string(),
        }
    }

    /// Runs a symbol-level breakdown of `binary`, optionally against a
    /// separate debug file (the DWARF inside a dSYM bundle on Apple
    /// platforms). Non-zero exit is a hard failure for this artifact.
    pub fn run_symbol_analysis(
        &self,
        binary: &Path,
        debug_file: Option<&Path>,
    ) -> Result<Vec<SymbolRow>, TrackerError> {
        info!("Running {} symbol analysis on {}", self.bin, binary.display());

        let mut command = Command::new(&self.bin);
        command.args(["-d", "shortsymbols", "--demangle=full", "-n", "0"]);
        if let Some(debug_file) = debug_file {
            debug!("Using debug file {}", debug_file.display());
            command.arg("--debug-file").arg(debug_file);
        }
        command.arg(binary).arg("--csv");

        let output = command.output().map_err(|e| TrackerError::io(binary, e))?;
        if !output.status.success() {
            return Err(TrackerError::AnalyzerFailure {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        parse_symbol_rows(output.stdout.as_slice())
    }
}

/// Parses the analyzer's `shortsymbols,vmsize,filesize` CSV. Size cells
/// that are not plain integers (the analyzer emits placeholders for some
/// sections) count as zero.
pub fn parse_symbol_rows<R: Read>(reader: R) -> Result<Vec<SymbolRow>, TrackerError> {
    #[derive(Debug, Deserialize)]
    struct RawRow {
        shortsymbols: String,
        vmsize: String,
        filesize: String,
    }

    let mut rows = Vec::new();
    let mut csv_reader = csv::Reader::from_reader(reader);
    for record in csv_reader.deserialize::<RawRow>() {
        let record = record.map_err(|e| TrackerError::AnalyzerFailure {
            status: 0,
            stderr: format!("unparseable analyzer output: {}", e),
        })?;
        rows.push(SymbolRow {
            name: record.shortsymbols,
            vmsize: record.vmsize.parse().unwrap_or(0),
            filesize: record.filesize.parse().unwrap_or(0),
        });
    }
    Ok(rows)
}

/// Enumerates every non-directory entry of a ZIP archive with its
/// compressed and uncompressed byte counts, largest first.
pub fn analyze_archive_entries(archive_path: &Path) -> Result<Vec<ArchiveEntry>, TrackerError> {
    let file = std::fs::File::open(archive_path).map_err(|e| TrackerError::io(archive_path, e))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| TrackerError::MalformedArchive {
        path: archive_path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut entries = Vec::new();
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|e| TrackerError::MalformedArchive {
                path: archive_path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if entry.is_dir() {
            continue;
        }
        entries.push(ArchiveEntry {
            filename: entry.name().to_string(),
            compressed: entry.compressed_size(),
            uncompressed: entry.size(),
        });
    }

    entries.sort_by(|a, b| b.uncompressed.cmp(&a.uncompressed));
    info!(
        "Enumerated {} entries in {}",
        entries.len(),
        archive_path.display()
    );
    Ok(entries)
}

/// Structural grouping rules for bundle trees. Files under recognized
/// library namespaces inside the main jar collapse into one row per
/// namespace, and the bundled runtime package collapses into a single
/// aggregate, keeping the listing human-scannable.
#[derive(Debug, Clone)]
pub struct BundleGroupRules {
    /// Jar entry prefixes grouped as `<prefix>*.*`.
    pub library_prefixes: Vec<String>,
    /// Jar entry prefix whose `.class` files group by outer class name.
    pub class_prefix: String,
    /// Path fragment marking bundled runtime files (grouped as one row).
    pub runtime_package_marker: String,
    /// Name of the aggregate row for the bundled runtime.
    pub runtime_package_label: String,
}

impl Default for BundleGroupRules {
    fn default() -> Self {
        let prefixes = [
            "clojure/",
            "cljfx/",
            "cognitect/",
            "javafx/",
            "javassist/",
            "jogamp/",
            "schema/",
            "reitit/",
            "welcome/",
            "META-INF/",
            "internal/graph/",
            "com/ibm/",
            "com/sun/",
            "com/jogamp/",
            "com/google/protobuf/",
            "com/meridian/",
            "com/amazonaws/",
            "com/fasterxml/jackson/",
            "com/github/benmanes/caffeine/",
            "com/jcraft/",
            "ch/qos/",
            "org/apache/commons/",
            "org/apache/http/",
            "org/antlr/",
            "org/eclipse/jgit/",
            "org/eclipse/jetty/",
            "org/joda/",
            "org/luaj/",
            "org/checkerframework/",
            "org/yaml/snakeyaml/",
            "org/snakeyaml/engine/",
            "org/stringtemplate/",
            "org/jsoup/",
            "org/commonmark/",
            "org/msgpack/",
            "org/jdom2/",
        ];
        Self {
            library_prefixes: prefixes.iter().map(|p| p.to_string()).collect(),
            class_prefix: "editor/".to_string(),
            runtime_package_marker: "packages/jdk-".to_string(),
            runtime_package_label: "JDK".to_string(),
        }
    }
}

impl BundleGroupRules {
    /// Grouped name for a jar entry, or the entry's own name.
    fn group_jar_entry(&self, name: &str) -> String {
        if let Some(class_path) = name.strip_prefix(self.class_prefix.as_str()) {
            if class_path.ends_with(".class") {
                let outer = match class_path.split_once('$') {
                    Some((outer, _)) => outer,
                    None => class_path.trim_end_matches(".class"),
                };
                return format!("{}{}", self.class_prefix, outer);
            }
        }
        for prefix in &self.library_prefixes {
            if name.starts_with(prefix.as_str()) {
                return format!("{}*.*", prefix);
            }
        }
        name.to_string()
    }

    fn is_runtime_package(&self, relative_path: &str) -> bool {
        relative_path.contains(self.runtime_package_marker.as_str())
    }
}

/// Analyzes an extracted bundle directory: the largest jar is expanded
/// entry by entry (grouped per `rules`), every other regular file is one
/// row, and the bundled runtime collapses into a single aggregate row.
/// Output is sorted largest-uncompressed first.
pub fn analyze_bundle_tree(
    directory: &Path,
    rules: &BundleGroupRules,
) -> Result<Vec<ArchiveEntry>, TrackerError> {
    let mut aggregated: HashMap<String, ArchiveEntry> = HashMap::new();
    let mut runtime_total = 0u64;

    let main_jar = find_main_jar(directory);
    if let Some(jar) = &main_jar {
        debug!("Expanding main jar {}", jar.display());
        match analyze_archive_entries(jar) {
            Ok(entries) => {
                for entry in entries {
                    let group = rules.group_jar_entry(&entry.filename);
                    let slot = aggregated.entry(group.clone()).or_insert(ArchiveEntry {
                        filename: group,
                        compressed: 0,
                        uncompressed: 0,
                    });
                    slot.compressed += entry.compressed;
                    slot.uncompressed += entry.uncompressed;
                }
            }
            Err(e) => warn!("Could not analyze jar {}: {}", jar.display(), e),
        }
    }

    for entry in WalkDir::new(directory).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        if path.extension().map(|e| e == "jar").unwrap_or(false) {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        let relative = path
            .strip_prefix(directory)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");

        if rules.is_runtime_package(&relative) {
            runtime_total += size;
            continue;
        }
        let slot = aggregated.entry(relative.clone()).or_insert(ArchiveEntry {
            filename: relative,
            compressed: 0,
            uncompressed: 0,
        });
        // Plain files on disk have no separate compressed size.
        slot.compressed += size;
        slot.uncompressed += size;
    }

    if runtime_total > 0 {
        aggregated.insert(
            rules.runtime_package_label.clone(),
            ArchiveEntry {
                filename: rules.runtime_package_label.clone(),
                compressed: runtime_total,
                uncompressed: runtime_total,
            },
        );
    }

    let mut entries: Vec<ArchiveEntry> = aggregated.into_values().collect();
    entries.sort_by(|a, b| {
        b.uncompressed
            .cmp(&a.uncompressed)
            .then_with(|| a.filename.cmp(&b.filename))
    });
    info!(
        "Bundle analysis of {}: {} rows (runtime grouped: {} bytes)",
        directory.display(),
        entries.len(),
        runtime_total
    );
    Ok(entries)
}

fn find_main_jar(directory: &Path) -> Option<PathBuf> {
    WalkDir::new(directory)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().map(|x| x == "jar").unwrap_or(false))
        .max_by_key(|e| e.metadata().map(|m| m.len()).unwrap_or(0))
        .map(|e| e.into_path())
}

/// Total byte size of every regular file under `directory`. Used for
/// packaged-bundle outputs where only the final footprint matters.
pub fn directory_size(directory: &Path) -> u64 {
    WalkDir::new(directory)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Writes archive/bundle entries as a `filename,compressed,uncompressed`
/// CSV.
pub fn write_entries_csv(path: &Path, entries: &[ArchiveEntry]) -> Result<(), TrackerError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| TrackerError::io(parent, e))?;
    }
    let mut writer = csv::Writer::from_path(path).map_err(|e| TrackerError::AnalyzerFailure {
        status: 0,
        stderr: format!("cannot write {}: {}", path.display(), e),
    })?;
    writer
        .write_record(["filename", "compressed", "uncompressed"])
        .and_then(|_| {
            for entry in entries {
                writer.write_record([
                    entry.filename.as_str(),
                    &entry.compressed.to_string(),
                    &entry.uncompressed.to_string(),
                ])?;
            }
            writer.flush().map_err(csv::Error::from)
        })
        .map_err(|e| TrackerError::AnalyzerFailure {
            status: 0,
            stderr: format!("cannot write {}: {}", path.display(), e),
        })
}
