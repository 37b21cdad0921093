//! Per-run identity: info directory layout, `latest` symlink, and cumulative/self timing
//! aggregation.

use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, SystemTime},
};

use tracing::instrument;

use crate::{
    cache::ArtifactCacheStats,
    error::{BuildError, Result},
    workunit::WorkUnit,
};

/// Accrues named timings and renders them sorted by duration, descending, as
/// `"%(timing).3f %(label)s"` lines, matching the persisted-state format.
#[derive(Debug, Default)]
pub struct AggregatedTimings {
    // path -> (total duration, is_tool)
    timings: Mutex<BTreeMap<String, (Duration, bool)>>,
}

impl AggregatedTimings {
    pub fn add_timing(&self, path: &str, duration: Duration, is_tool: bool) {
        let mut timings = self.timings.lock().unwrap();
        let entry = timings.entry(path.to_string()).or_insert((Duration::ZERO, is_tool));
        entry.0 += duration;
        entry.1 = entry.1 || is_tool;
    }

    pub fn render(&self) -> String {
        let timings = self.timings.lock().unwrap();
        let mut rows: Vec<(&String, &(Duration, bool))> = timings.iter().collect();
        rows.sort_by(|a, b| b.1 .0.partial_cmp(&a.1 .0).unwrap());
        rows.into_iter()
            .map(|(label, (duration, _))| format!("{:.3} {}", duration.as_secs_f64(), label))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn run_id(now: SystemTime) -> String {
    let duration = now.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();
    let days = secs / 86_400;
    let (y, m, d) = civil_from_days(days as i64);
    let rem = secs % 86_400;
    let (hh, mm, ss) = (rem / 3600, (rem % 3600) / 60, rem % 60);
    format!("pants_run_{y:04}_{m:02}_{d:02}_{hh:02}_{mm:02}_{ss:02}_{millis:03}")
}

/// Civil calendar date from a day count since the Unix epoch (Howard Hinnant's algorithm),
/// avoiding a chrono dependency for a single formatting need.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

/// Owns one run's persisted state directory and the root work unit wrapping the whole run.
pub struct RunTracker {
    pub info_dir: PathBuf,
    pub run_dir: PathBuf,
    pub cumulative_timings: AggregatedTimings,
    pub self_timings: AggregatedTimings,
    pub artifact_cache_stats: ArtifactCacheStats,
    root: Mutex<Option<WorkUnit>>,
    info_lines: Mutex<Vec<String>>,
}

impl RunTracker {
    #[instrument(level = "debug", skip(info_dir))]
    pub fn new(info_dir: impl Into<PathBuf>) -> Result<Self> {
        let info_dir = info_dir.into();
        fs::create_dir_all(&info_dir)?;
        let run_dir = info_dir.join(run_id(SystemTime::now()));
        fs::create_dir_all(&run_dir)?;
        fs::create_dir_all(run_dir.join("tool_outputs"))?;

        let tracker = Self {
            info_dir,
            run_dir,
            cumulative_timings: AggregatedTimings::default(),
            self_timings: AggregatedTimings::default(),
            artifact_cache_stats: ArtifactCacheStats::default(),
            root: Mutex::new(None),
            info_lines: Mutex::new(Vec::new()),
        };
        tracker.touch_info_file()?;
        tracker.relink_latest()?;
        *tracker.root.lock().unwrap() = Some(WorkUnit::root("all"));
        Ok(tracker)
    }

    pub fn root_workunit(&self) -> WorkUnit {
        self.root.lock().unwrap().clone().expect("run tracker always constructs a root unit")
    }

    fn touch_info_file(&self) -> Result<()> {
        fs::File::create(self.run_dir.join("info")).map_err(BuildError::Io)?;
        Ok(())
    }

    fn relink_latest(&self) -> Result<()> {
        let latest = self.info_dir.join("latest");
        let _ = fs::remove_file(&latest);
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(&self.run_dir, &latest).map_err(BuildError::Io)?;
        }
        #[cfg(not(unix))]
        {
            fs::write(&latest, self.run_dir.to_string_lossy().as_bytes()).map_err(BuildError::Io)?;
        }
        Ok(())
    }

    /// Appends a `key:value` line to the info file. `:` is forbidden in `key` since it is the
    /// field separator.
    pub fn record_info(&self, key: &str, value: &str) -> Result<()> {
        if key.contains(':') {
            return Err(BuildError::Render(format!("info key {key:?} may not contain ':'")));
        }
        let mut lines = self.info_lines.lock().unwrap();
        lines.push(format!("{key}:{value}"));
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(self.run_dir.join("info"))
            .map_err(BuildError::Io)?;
        writeln!(file, "{key}:{value}").map_err(BuildError::Io)?;
        Ok(())
    }

    /// Writes the final `cumulative_timings`, `self_timings`, and `artifact_cache_stats` files.
    /// Called during an orderly shutdown regardless of whether the run succeeded, failed, or
    /// was aborted, so timings and stats are never lost to an interrupt.
    pub fn close(&self) -> Result<()> {
        fs::write(self.run_dir.join("cumulative_timings"), self.cumulative_timings.render())
            .map_err(BuildError::Io)?;
        fs::write(self.run_dir.join("self_timings"), self.self_timings.render())
            .map_err(BuildError::Io)?;
        fs::write(
            self.run_dir.join("artifact_cache_stats"),
            self.artifact_cache_stats.render(),
        )
        .map_err(BuildError::Io)?;
        Ok(())
    }

    pub fn tool_output_path(&self, unit: &WorkUnit, label: &str) -> PathBuf {
        self.run_dir.join("tool_outputs").join(format!("{}.{}", unit.id(), label))
    }
}

/// Exit code mapping: 0 success, 1 failure, 2 usage error, 130 for an aborted/interrupted run.
pub fn exit_code(outcome: crate::workunit::Outcome) -> i32 {
    match outcome {
        crate::workunit::Outcome::Success | crate::workunit::Outcome::Warning => 0,
        crate::workunit::Outcome::Aborted => 130,
        crate::workunit::Outcome::Failure | crate::workunit::Outcome::Unknown => 1,
    }
}
