use std::collections::HashMap;
use std::path::Path;

use tracing::info;

use crate::analyzer::SymbolRow;
use crate::error::TrackerError;

/// Aggregate of all symbols sharing a group key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolGroup {
    pub name: String,
    pub vmsize: u64,
    pub filesize: u64,
    pub members: u64,
}

/// Group key for a symbol name. Two ordered heuristics, first match wins:
///
/// 1. a namespace separator (`::`) groups by the text before it;
/// 2. a first pair of non-adjacent underscores with non-empty middle text
///    groups as `_<middle>_* (library)`;
///
/// otherwise the symbol stays its own group. Returns the key and whether a
/// rule matched.
pub fn group_symbol(name: &str) -> (String, bool) {
    if let Some(idx) = name.find("::") {
        return (name[..idx].to_string(), true);
    }

    let underscores: Vec<usize> = name
        .char_indices()
        .filter(|(_, c)| *c == '_')
        .map(|(i, _)| i)
        .collect();
    for pair in underscores.windows(2) {
        let (first, second) = (pair[0], pair[1]);
        if second - first > 1 {
            let middle = &name[first + 1..second];
            return (format!("_{}_* (library)", middle), true);
        }
    }

    (name.to_string(), false)
}

/// Folds raw symbol rows into grouped aggregates, summing both size fields
/// and the member count, sorted descending by vmsize. A cheap classifier
/// that reduces tens of thousands of linker symbols to a reviewable table.
pub fn compress(rows: &[SymbolRow]) -> Vec<SymbolGroup> {
    let mut groups: HashMap<String, SymbolGroup> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for row in rows {
        let (key, _) = group_symbol(&row.name);
        let group = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            SymbolGroup {
                name: key,
                vmsize: 0,
                filesize: 0,
                members: 0,
            }
        });
        group.vmsize += row.vmsize;
        group.filesize += row.filesize;
        group.members += 1;
    }

    // First-seen order as the tie-breaker keeps the output stable.
    let mut result: Vec<SymbolGroup> = order
        .into_iter()
        .map(|key| groups.remove(&key).expect("group recorded in order"))
        .collect();
    result.sort_by(|a, b| b.vmsize.cmp(&a.vmsize));

    let grouped = result.iter().filter(|g| g.members > 1).count();
    info!(
        "Symbol compression: {} groups ({} grouped, {} individual)",
        result.len(),
        grouped,
        result.len() - grouped
    );
    result
}

/// Writes grouped symbols as a `symbol_group_name,vmsize,filesize` CSV.
pub fn write_groups_csv(path: &Path, groups: &[SymbolGroup]) -> Result<(), TrackerError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| TrackerError::io(parent, e))?;
    }
    let map_err = |e: csv::Error| TrackerError::AnalyzerFailure {
        status: 0,
        stderr: format!("cannot write {}: {}", path.display(), e),
    };

    let mut writer = csv::Writer::from_path(path).map_err(map_err)?;
    writer
        .write_record(["symbol_group_name", "vmsize", "filesize"])
        .map_err(map_err)?;
    for group in groups {
        writer
            .write_record([
                group.name.as_str(),
                &group.vmsize.to_string(),
                &group.filesize.to_string(),
            ])
            .map_err(map_err)?;
    }
    writer.flush().map_err(|e| TrackerError::io(path, e))?;
    Ok(())
}
