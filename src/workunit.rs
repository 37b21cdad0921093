//! A hierarchical, timed scope used for reporting and timing aggregation.
//!
//! A [`WorkUnit`] can be subdivided into further work units; the concept is deliberately
//! decoupled from any particular phase/goal/task hierarchy. One run might have a single root
//! unit subdivided into per-phase units, each subdivided into per-task units, each further
//! subdivided if finer-grained timing is useful.

use std::{
    collections::BTreeMap,
    io::Write,
    sync::{Arc, Mutex, Weak},
    time::{Duration, Instant, SystemTime},
};

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

/// Outcome of a work unit. Ordered so that a lower value is "worse"; setting an outcome can only
/// ever move it down, and the move propagates to the parent by taking the minimum of the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum Outcome {
    Aborted = 0,
    Failure = 1,
    Warning = 2,
    Success = 3,
    Unknown = 4,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Aborted => "ABORTED",
            Outcome::Failure => "FAILURE",
            Outcome::Warning => "WARNING",
            Outcome::Success => "SUCCESS",
            Outcome::Unknown => "UNKNOWN",
        }
    }
}

/// Labels a reporter can use to decide how to display a unit. A unit may carry more than one,
/// e.g. `TOOL` and `COMPILER` and `NAILGUN` together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum Label {
    Setup,
    Phase,
    Goal,
    Group,
    Tool,
    MultiTool,
    Compiler,
    Test,
    Jvm,
    Nailgun,
    Run,
    Repl,
}

static VALID_OUTPUT_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\w+$").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum WorkUnitError {
    #[error("invalid output name: {0:?}")]
    InvalidOutputName(String),
}

/// In-memory output buffer for one named stream (`stdout`, `stderr`, ...) of a work unit.
///
/// The source system backs this with a file so a concurrently-running reporter can tail new
/// bytes; here the same read/append contract is provided over an in-memory buffer guarded by a
/// mutex, which is sufficient since the report bus and the work unit live in the same process.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    data: Mutex<Vec<u8>>,
    read_cursor: Mutex<usize>,
    closed: Mutex<bool>,
}

impl OutputBuffer {
    pub fn write(&self, bytes: &[u8]) {
        self.data.lock().unwrap().extend_from_slice(bytes);
    }

    /// Returns any bytes appended since the last call, in FIFO order.
    pub fn read_new(&self) -> Vec<u8> {
        let data = self.data.lock().unwrap();
        let mut cursor = self.read_cursor.lock().unwrap();
        let new = data[*cursor..].to_vec();
        *cursor = data.len();
        new
    }

    pub fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }
}

impl Write for &OutputBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        OutputBuffer::write(self, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct Inner {
    name: String,
    labels: std::collections::BTreeSet<Label>,
    cmd: String,
    id: Uuid,
    parent: Option<Weak<Inner>>,
    children: Mutex<Vec<WorkUnit>>,
    outcome: Mutex<Outcome>,
    start: Mutex<Option<Instant>>,
    end: Mutex<Option<Instant>>,
    outputs: Mutex<BTreeMap<String, Arc<OutputBuffer>>>,
}

/// A handle to a work unit node. Cheaply cloneable; clones refer to the same underlying node.
#[derive(Clone)]
pub struct WorkUnit(Arc<Inner>);

impl WorkUnit {
    pub fn root(name: impl Into<String>) -> Self {
        Self::new_impl(None, name.into(), std::collections::BTreeSet::new(), String::new())
    }

    pub fn child(&self, name: impl Into<String>, labels: impl IntoIterator<Item = Label>) -> Self {
        self.child_with_cmd(name, labels, String::new())
    }

    pub fn child_with_cmd(
        &self,
        name: impl Into<String>,
        labels: impl IntoIterator<Item = Label>,
        cmd: impl Into<String>,
    ) -> Self {
        let child =
            Self::new_impl(Some(self.clone()), name.into(), labels.into_iter().collect(), cmd.into());
        self.0.children.lock().unwrap().push(child.clone());
        child
    }

    fn new_impl(
        parent: Option<WorkUnit>,
        name: String,
        labels: std::collections::BTreeSet<Label>,
        cmd: String,
    ) -> Self {
        WorkUnit(Arc::new(Inner {
            name,
            labels,
            cmd,
            id: Uuid::new_v4(),
            parent: parent.map(|p| Arc::downgrade(&p.0)),
            children: Mutex::new(Vec::new()),
            outcome: Mutex::new(Outcome::Unknown),
            start: Mutex::new(None),
            end: Mutex::new(None),
            outputs: Mutex::new(BTreeMap::new()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn id(&self) -> Uuid {
        self.0.id
    }

    pub fn has_label(&self, label: Label) -> bool {
        self.0.labels.contains(&label)
    }

    pub fn start(&self) {
        *self.0.start.lock().unwrap() = Some(Instant::now());
    }

    /// Ends the unit, closes every output buffer, and reports this unit's timings under its path:
    /// `cumulative` is fed `self.duration()`, `self_timings` is fed `self.self_time()`. Two
    /// distinct callbacks rather than one called twice, so a run tracker can route each into its
    /// own aggregate (`cumulative_timings` vs. `self_timings`).
    pub fn end(
        &self,
        cumulative: &mut dyn FnMut(&str, Duration, bool),
        self_timings: &mut dyn FnMut(&str, Duration, bool),
    ) {
        let now = Instant::now();
        *self.0.end.lock().unwrap() = Some(now);
        for output in self.0.outputs.lock().unwrap().values() {
            output.close();
        }
        {
            let mut outcome = self.0.outcome.lock().unwrap();
            if *outcome == Outcome::Unknown {
                *outcome = Outcome::Success;
            }
        }
        let is_tool = self.has_label(Label::Tool);
        let path = self.path();
        cumulative(&path, self.duration(), is_tool);
        self_timings(&path, self.self_time(), is_tool);
    }

    pub fn outcome(&self) -> Outcome {
        *self.0.outcome.lock().unwrap()
    }

    /// Sets the outcome if it is worse (lower) than the current one, then propagates the same
    /// rule to the parent. No-op if `outcome` is not worse than the current value.
    pub fn set_outcome(&self, outcome: Outcome) {
        let mut current = self.0.outcome.lock().unwrap();
        if outcome < *current {
            *current = outcome;
            drop(current);
            if let Some(parent) = self.0.parent.as_ref().and_then(Weak::upgrade) {
                WorkUnit(parent).set_outcome(outcome);
            }
        }
    }

    pub fn output(&self, name: &str) -> Result<Arc<OutputBuffer>, WorkUnitError> {
        if !VALID_OUTPUT_NAME.is_match(name) {
            return Err(WorkUnitError::InvalidOutputName(name.to_string()));
        }
        let mut outputs = self.0.outputs.lock().unwrap();
        Ok(outputs.entry(name.to_string()).or_insert_with(|| Arc::new(OutputBuffer::default())).clone())
    }

    pub fn outputs(&self) -> BTreeMap<String, Arc<OutputBuffer>> {
        self.0.outputs.lock().unwrap().clone()
    }

    pub fn ancestors(&self) -> Vec<WorkUnit> {
        let mut out = vec![self.clone()];
        let mut current = self.0.parent.as_ref().and_then(Weak::upgrade).map(WorkUnit);
        while let Some(unit) = current {
            out.push(unit.clone());
            current = unit.0.parent.as_ref().and_then(Weak::upgrade).map(WorkUnit);
        }
        out
    }

    pub fn path(&self) -> String {
        let mut names: Vec<&str> = self.ancestors().iter().map(|w| w.0.name.as_str()).collect();
        let names: Vec<String> = {
            names.reverse();
            names.into_iter().map(str::to_string).collect()
        };
        names.join(":")
    }

    pub fn duration(&self) -> Duration {
        let start = self.0.start.lock().unwrap().unwrap_or_else(Instant::now);
        let end = self.0.end.lock().unwrap().unwrap_or_else(Instant::now);
        end.saturating_duration_since(start)
    }

    /// Duration spent in this unit outside of any of its children.
    pub fn self_time(&self) -> Duration {
        let children_total: Duration =
            self.0.children.lock().unwrap().iter().map(|c| c.duration()).sum();
        self.duration().saturating_sub(children_total)
    }

    /// Non-leaf time: zero for leaves, `self_time()` otherwise. Assumes major work happens in
    /// leaf units.
    pub fn unaccounted_time(&self) -> Duration {
        if self.0.children.lock().unwrap().is_empty() {
            Duration::ZERO
        } else {
            self.self_time()
        }
    }

    pub fn children(&self) -> Vec<WorkUnit> {
        self.0.children.lock().unwrap().clone()
    }

    /// A serializable point-in-time snapshot, standing in for the `to_dict()` projection a
    /// template-based reporter would consume.
    pub fn snapshot(&self) -> WorkUnitSnapshot {
        WorkUnitSnapshot {
            name: self.0.name.clone(),
            cmd: self.0.cmd.clone(),
            id: self.0.id,
            outcome: self.outcome(),
            path: self.path(),
            duration: self.duration(),
            parent: self
                .0
                .parent
                .as_ref()
                .and_then(Weak::upgrade)
                .map(|p| Box::new(WorkUnit(p).snapshot())),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkUnitSnapshot {
    pub name: String,
    pub cmd: String,
    pub id: Uuid,
    pub outcome: Outcome,
    pub path: String,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub parent: Option<Box<WorkUnitSnapshot>>,
}

mod duration_secs {
    use super::Duration;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

pub fn now_wall_clock() -> SystemTime {
    SystemTime::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration as StdDuration;

    #[test]
    fn outcome_is_monotonic_and_propagates() {
        let root = WorkUnit::root("all");
        let child = root.child("compile", [Label::Goal]);
        child.set_outcome(Outcome::Failure);
        assert_eq!(child.outcome(), Outcome::Failure);
        assert_eq!(root.outcome(), Outcome::Failure);

        // Setting a better outcome afterwards must not regress the recorded failure.
        child.set_outcome(Outcome::Success);
        assert_eq!(child.outcome(), Outcome::Failure);
    }

    #[test]
    fn path_joins_names_root_to_self() {
        let root = WorkUnit::root("all");
        let phase = root.child("compile", []);
        let goal = phase.child("zinc", []);
        assert_eq!(goal.path(), "all:compile:zinc");
    }

    #[test]
    fn rejects_invalid_output_names() {
        let root = WorkUnit::root("all");
        assert!(root.output("not valid!").is_err());
        assert!(root.output("stdout").is_ok());
    }

    #[test]
    fn two_units_preserve_fifo_order_per_label() {
        let root = WorkUnit::root("all");
        let a = root.child("a", []);
        let b = root.child("b", []);
        let buf_a = a.output("stdout").unwrap();
        let buf_b = b.output("stdout").unwrap();

        let ha = thread::spawn(move || {
            buf_a.write(b"one\n");
            thread::sleep(StdDuration::from_millis(1));
            buf_a.write(b"two\n");
        });
        let hb = thread::spawn(move || {
            buf_b.write(b"one\n");
            thread::sleep(StdDuration::from_millis(1));
            buf_b.write(b"two\n");
        });
        ha.join().unwrap();
        hb.join().unwrap();

        let buf_a = a.output("stdout").unwrap();
        assert_eq!(buf_a.read_new(), b"one\ntwo\n");
    }
}
