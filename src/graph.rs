use std::path::Path;

use anyhow::{anyhow, bail, Result};
use chrono::Local;
use plotters::prelude::*;
use tracing::info;

use crate::report::Report;
use crate::version::{compare_version_strings, Version};

/// One distinct marker glyph per platform series.
const MARKERS: [char; 12] = ['.', 'o', '8', 's', '+', 'x', 'D', '*', 'p', 'P', '<', '^'];

const MB: u64 = 1024 * 1024;
/// Above this measured range the gridline interval coarsens tenfold.
const COARSE_RANGE: u64 = 200 * MB;

/// The version floor only applies to entries from the legacy version
/// scheme. Historical rows outside that scheme are always kept. Delete
/// this predicate (and the branch on it) once pre-1.3 data ages out of the
/// reports.
pub fn legacy_floor_applies(version: &str) -> bool {
    version.starts_with("1.2.")
}

/// Report rows to plot, in release order, honoring the floor carve-out.
pub fn select_versions(report: &Report, floor_version: Option<&str>) -> Result<Vec<String>> {
    let mut versions = report.versions.clone();
    versions.sort_by(|a, b| compare_version_strings(a, b));

    let Some(floor) = floor_version else {
        return Ok(versions);
    };
    let floor = Version::parse(floor)?;
    Ok(versions
        .into_iter()
        .filter(|v| {
            if !legacy_floor_applies(v) {
                return true;
            }
            Version::parse(v).map(|pv| pv >= floor).unwrap_or(true)
        })
        .collect())
}

/// Renders one line per platform across versions into a PNG trend chart.
pub fn render(report: &Report, out: &Path, floor_version: Option<&str>) -> Result<()> {
    info!("Rendering {}", out.display());

    if report.platforms.len() > MARKERS.len() {
        bail!(
            "{} platforms but only {} distinct markers",
            report.platforms.len(),
            MARKERS.len()
        );
    }

    let versions = select_versions(report, floor_version)?;
    if versions.is_empty() {
        bail!("report has no versions to plot");
    }

    let max_size = report
        .platforms
        .iter()
        .flat_map(|p| versions.iter().filter_map(|v| report.get(p, v)))
        .max()
        .unwrap_or(MB);
    let interval = if max_size > COARSE_RANGE { 20 * MB } else { 2 * MB };
    let y_max = (max_size + interval - 1) / interval * interval + interval;

    let root = BitMapBackend::new(out, (2000, 1000)).into_drawing_area();
    root.fill(&WHITE).map_err(|e| anyhow!("fill: {}", e))?;

    let x_max = (versions.len() as f64 - 1.0).max(1.0);
    let mut chart = ChartBuilder::on(&root)
        .margin(30)
        .x_label_area_size(140)
        .y_label_area_size(90)
        .build_cartesian_2d(0f64..x_max, 0f64..y_max as f64)
        .map_err(|e| anyhow!("chart layout: {}", e))?;

    let label_versions = versions.clone();
    chart
        .configure_mesh()
        .x_labels(versions.len())
        .x_label_formatter(&move |x| {
            let idx = x.round() as usize;
            label_versions.get(idx).cloned().unwrap_or_default()
        })
        .x_label_style(
            ("sans-serif", 12)
                .into_font()
                .transform(FontTransform::Rotate270),
        )
        .y_labels((y_max / interval) as usize + 1)
        .y_label_formatter(&|y| format!("{} mb", (*y as u64) / MB))
        .x_desc("VERSION")
        .y_desc("SIZE")
        .draw()
        .map_err(|e| anyhow!("mesh: {}", e))?;

    for (series_idx, platform) in report.platforms.iter().enumerate() {
        let glyph = MARKERS[series_idx];
        let color = Palette99::pick(series_idx).to_rgba();

        let points: Vec<(f64, f64)> = versions
            .iter()
            .enumerate()
            .filter_map(|(i, v)| report.get(platform, v).map(|s| (i as f64, s as f64)))
            .collect();

        // Unmeasured cells are gaps: draw each contiguous run separately
        // instead of bridging across them.
        let mut runs: Vec<Vec<(f64, f64)>> = Vec::new();
        for point in &points {
            match runs.last_mut() {
                Some(run) if run.last().map(|p| p.0 + 1.0 == point.0).unwrap_or(false) => {
                    run.push(*point)
                }
                _ => runs.push(vec![*point]),
            }
        }

        for (run_idx, run) in runs.iter().enumerate() {
            let series = chart
                .draw_series(LineSeries::new(run.clone(), color.stroke_width(2)))
                .map_err(|e| anyhow!("series {}: {}", platform, e))?;
            if run_idx == 0 {
                series.label(platform.clone()).legend(move |(x, y)| {
                    PathElement::new(vec![(x, y), (x + 20, y)], color.stroke_width(2))
                });
            }
        }

        chart
            .draw_series(points.iter().map(|(x, y)| {
                Text::new(
                    glyph.to_string(),
                    (*x, *y),
                    ("sans-serif", 16).into_font().color(&color),
                )
            }))
            .map_err(|e| anyhow!("markers {}: {}", platform, e))?;
    }

    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperLeft)
        .background_style(RGBColor(230, 230, 230).filled())
        .border_style(&BLACK)
        .draw()
        .map_err(|e| anyhow!("legend: {}", e))?;

    root.draw(&Text::new(
        Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        (40, 10),
        ("sans-serif", 16),
    ))
    .map_err(|e| anyhow!("timestamp: {}", e))?;

    root.present().map_err(|e| anyhow!("writing {}: {}", out.display(), e))?;
    info!("Rendering {} - ok", out.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report_with(versions: &[&str], platform: &str, size: u64) -> Report {
        let mut report = Report::new(&[platform.to_string()]);
        for v in versions {
            report.versions.push(v.to_string());
            report.set(platform, v, size);
        }
        report
    }

    #[test]
    fn floor_only_applies_to_legacy_prefix() {
        let report = report_with(&["1.2.100", "1.2.160", "1.1.0", "1.9.0"], "p", MB);
        let kept = select_versions(&report, Some("1.2.155")).unwrap();
        // 1.2.100 is below the floor; 1.1.0 predates the legacy scheme and
        // is exempt from it.
        assert_eq!(kept, vec!["1.1.0", "1.2.160", "1.9.0"]);
    }

    #[test]
    fn no_floor_keeps_everything_sorted() {
        let report = report_with(&["1.9.1", "1.2.100", "1.9.0"], "p", MB);
        let kept = select_versions(&report, None).unwrap();
        assert_eq!(kept, vec!["1.2.100", "1.9.0", "1.9.1"]);
    }

    #[test]
    fn render_writes_a_png() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("size.png");
        let mut report = Report::new(&["arm64-ios".to_string(), "arm64-android".to_string()]);
        for (i, v) in ["1.9.0", "1.9.1", "1.10.0"].iter().enumerate() {
            report.versions.push(v.to_string());
            report.set("arm64-ios", v, (i as u64 + 1) * MB);
            // Leave a gap on android at 1.9.1.
            if *v != "1.9.1" {
                report.set("arm64-android", v, (i as u64 + 2) * MB);
            }
        }

        render(&report, &out, None).unwrap();
        let bytes = std::fs::read(&out).unwrap();
        assert!(bytes.len() > 1000);
        assert_eq!(&bytes[1..4], b"PNG");
    }

    #[test]
    fn render_rejects_too_many_platforms() {
        let platforms: Vec<String> = (0..13).map(|i| format!("platform-{}", i)).collect();
        let mut report = Report::new(&platforms);
        report.versions.push("1.9.0".to_string());
        let dir = tempfile::tempdir().unwrap();
        assert!(render(&report, &dir.path().join("x.png"), None).is_err());
    }
}
