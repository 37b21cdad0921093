//! Periodic multiplexed flush of work-unit output streams to one or more [`Reporter`] sinks.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use tracing::trace;

use crate::workunit::WorkUnit;

/// A single element of a report message: either a bare string, or a `(text, detail)` pair where
/// `detail` is optional richer context a GUI reporter may expand interactively.
#[derive(Debug, Clone)]
pub enum MessageElement {
    Text(String),
    TextWithDetail(String, String),
}

impl MessageElement {
    pub fn text(&self) -> &str {
        match self {
            MessageElement::Text(t) | MessageElement::TextWithDetail(t, _) => t,
        }
    }
}

/// Subscriber to the report bus. Every method has a default no-op body so a reporter can
/// implement only what it cares about, matching the narrow-interface spirit of the original
/// console/HTML reporters.
pub trait Reporter: Send + Sync {
    fn open(&self) {}
    fn close(&self) {}
    fn start_workunit(&self, _unit: &WorkUnit) {}
    fn end_workunit(&self, _unit: &WorkUnit) {}
    fn handle_output(&self, _unit: &WorkUnit, _label: &str, _bytes: &[u8]) {}
    fn handle_message(&self, _unit: &WorkUnit, _elements: &[MessageElement]) {}
    fn handle_log(&self, _unit: &WorkUnit, _level: tracing::Level, _message: &str) {}
}

/// Plain-text console reporter: writes output bytes to stdout as they arrive and emits one line
/// for messages and log records. Always emits at least `text()`, matching the contract plain
/// reporters must uphold for `MessageElement::TextWithDetail`.
#[derive(Default)]
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn handle_output(&self, unit: &WorkUnit, label: &str, bytes: &[u8]) {
        print!("[{}:{}] {}", unit.path(), label, String::from_utf8_lossy(bytes));
    }

    fn handle_message(&self, unit: &WorkUnit, elements: &[MessageElement]) {
        for element in elements {
            println!("[{}] {}", unit.path(), element.text());
        }
    }
}

struct OpenUnit {
    unit: WorkUnit,
    buffers: Vec<(String, Arc<crate::workunit::OutputBuffer>)>,
}

/// One bus per run. Owns a background emitter thread that wakes roughly every 100ms, drains
/// newly-appended bytes from each currently-open unit's output buffers, and dispatches them to
/// every registered reporter.
pub struct ReportBus {
    reporters: Mutex<Vec<Arc<dyn Reporter>>>,
    open_units: Mutex<Vec<OpenUnit>>,
    running: Arc<AtomicBool>,
    emitter: Mutex<Option<JoinHandle<()>>>,
}

impl ReportBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            reporters: Mutex::new(Vec::new()),
            open_units: Mutex::new(Vec::new()),
            running: Arc::new(AtomicBool::new(false)),
            emitter: Mutex::new(None),
        })
    }

    pub fn add_reporter(&self, reporter: Arc<dyn Reporter>) {
        reporter.open();
        self.reporters.lock().unwrap().push(reporter);
    }

    pub fn start_workunit(self: &Arc<Self>, unit: WorkUnit) {
        unit.start();
        for reporter in self.reporters.lock().unwrap().iter() {
            reporter.start_workunit(&unit);
        }
        self.open_units.lock().unwrap().push(OpenUnit { unit, buffers: Vec::new() });
    }

    pub fn end_workunit(&self, unit: &WorkUnit, timings: &mut dyn FnMut(&str, Duration, bool)) {
        self.flush_once();
        unit.end(timings);
        for reporter in self.reporters.lock().unwrap().iter() {
            reporter.end_workunit(unit);
        }
        self.open_units.lock().unwrap().retain(|o| o.unit.id() != unit.id());
    }

    /// Spawns the background emitter. Idempotent.
    pub fn spawn_emitter(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let bus = self.clone();
        let running = self.running.clone();
        let handle = std::thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                bus.flush_once();
                std::thread::sleep(Duration::from_millis(100));
            }
        });
        *self.emitter.lock().unwrap() = Some(handle);
    }

    fn flush_once(&self) {
        let mut open_units = self.open_units.lock().unwrap();
        let reporters = self.reporters.lock().unwrap();
        for open in open_units.iter_mut() {
            for (label, buffer) in open.unit.outputs() {
                let bytes = buffer.read_new();
                if bytes.is_empty() {
                    continue;
                }
                trace!(unit = %open.unit.path(), %label, len = bytes.len(), "flushing output");
                for reporter in reporters.iter() {
                    reporter.handle_output(&open.unit, &label, &bytes);
                }
                if !open.buffers.iter().any(|(l, _)| l == &label) {
                    open.buffers.push((label.clone(), buffer.clone()));
                }
            }
        }
    }

    /// Stops the emitter thread, flushes once more under the lock, then closes every reporter.
    pub fn close(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            if let Some(handle) = self.emitter.lock().unwrap().take() {
                let _ = handle.join();
            }
        }
        self.flush_once();
        for reporter in self.reporters.lock().unwrap().iter() {
            reporter.close();
        }
    }
}
