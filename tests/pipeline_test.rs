use std::collections::HashSet;

use sizetracker_rs::graph;
use sizetracker_rs::releases::{Release, ReleaseList};
use sizetracker_rs::report::{AnalysisIndex, Report, VersionEntry};

/// End-to-end report pipeline without the network: discover releases,
/// reconcile measurements into the report, persist it, reload it and render
/// the trend graph from the reloaded copy.
#[test]
fn release_discovery_through_graph_rendering() {
    let dir = tempfile::tempdir().unwrap();
    let releases_path = dir.path().join("releases.json");
    let report_path = dir.path().join("size.csv");

    // Seed the persisted release list.
    let mut releases = ReleaseList {
        releases: vec![
            Release::new("1.9.0", "aaa111"),
            Release::new("1.9.1-beta", "bbb222"),
        ],
    };
    releases.save(&releases_path).unwrap();

    // A later run discovers the stable 1.9.1 and a fresh alpha. The beta is
    // superseded by the stable entry with the same triple.
    let mut releases = ReleaseList::load(&releases_path).unwrap();
    let outcome = releases.merge(&[
        Release::new("1.9.1", "ccc333"),
        Release::new("1.10.0-alpha", "ddd444"),
    ]);
    assert!(outcome.changed);
    assert!(!releases.contains_version("1.9.1-beta"));
    releases.save(&releases_path).unwrap();

    // Measure every release on two platforms, with one platform missing a
    // build for the alpha.
    let platforms = vec!["arm64-ios".to_string(), "arm64-android".to_string()];
    let mut report = Report::new(&platforms);
    let changed = report.reconcile(&releases.releases, &platforms, &outcome.forced, |p, r| {
        if p == "arm64-android" && r.version == "1.10.0-alpha" {
            return None;
        }
        let base: u64 = match r.version.as_str() {
            "1.9.0" => 10,
            "1.9.1" => 11,
            _ => 12,
        };
        Some(base * 1024 * 1024)
    });
    assert!(changed);
    report.write(&report_path).unwrap();

    // The written report loads back identically, unmeasured cell included.
    let reloaded = Report::load(&report_path).unwrap();
    assert_eq!(reloaded.get("arm64-ios", "1.9.0"), Some(10 * 1024 * 1024));
    assert_eq!(reloaded.get("arm64-android", "1.10.0-alpha"), None);
    assert!(!reloaded.contains_version("1.9.1-beta"));

    // Reconciling the unchanged world only retries the one cell that is
    // still unmeasured, and stays a no-op while it keeps failing.
    let mut again = Report::load(&report_path).unwrap();
    let changed = again.reconcile(&releases.releases, &platforms, &HashSet::new(), |p, r| {
        assert_eq!((p, r.version.as_str()), ("arm64-android", "1.10.0-alpha"));
        None
    });
    assert!(!changed);

    let graph_path = dir.path().join("size.png");
    graph::render(&reloaded, &graph_path, None).unwrap();
    let bytes = std::fs::read(&graph_path).unwrap();
    assert_eq!(&bytes[1..4], b"PNG");
}

/// A release whose content hash moves forces re-measurement downstream and
/// invalidates the recorded analysis.
#[test]
fn moved_release_hash_forces_remeasurement() {
    let platforms = vec!["x86_64-linux".to_string()];
    let mut releases = ReleaseList {
        releases: vec![Release::new("1.9.0", "aaa111")],
    };
    let mut report = Report::new(&platforms);
    report.reconcile(&releases.releases, &platforms, &HashSet::new(), |_, _| {
        Some(100)
    });

    let mut index = AnalysisIndex::default();
    index.set_platform(
        "x86_64-linux",
        vec![VersionEntry {
            version: "1.9.0".to_string(),
            sha1: "aaa111".to_string(),
        }],
    );

    // The archive republishes 1.9.0 under a new hash.
    let outcome = releases.merge(&[Release::new("1.9.0", "eee555")]);
    assert!(outcome.forced.contains("1.9.0"));
    assert!(index.is_stale("x86_64-linux", "1.9.0", "eee555"));

    let changed = report.reconcile(&releases.releases, &platforms, &outcome.forced, |_, _| {
        Some(250)
    });
    assert!(changed);
    assert_eq!(report.get("x86_64-linux", "1.9.0"), Some(250));
}
