//! Rebuild run progress from the run log
//!
//! The run log is append-only and may hold several runs. [`RunStatus`] keeps
//! the latest one: a `PLAN` marker arriving after any other kind starts over.

use std::fs::File;
use std::io::{BufRead, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::catalogue::Phase;
use crate::error::{ProvisionError, Result};
use crate::orchestrator::StepStatus;
use crate::runlog::{EventKind, StepEvent, parse_marker};

/// Last known state of one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepProgress {
    pub id: String,
    pub phase: Option<Phase>,
    pub status: StepStatus,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub detail: String,
}

impl StepProgress {
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        Some(self.finished? - self.started?)
    }
}

/// Step states of the most recent run in a log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStatus {
    pub steps: Vec<StepProgress>,
    /// Set once the `COMPLETE` marker has been seen
    pub finished: bool,
    pub summary: Option<String>,
    last: Option<EventKind>,
}

impl RunStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay every marker found in `reader`, ignoring other lines
    pub fn from_reader(reader: impl BufRead) -> std::io::Result<Self> {
        let mut status = Self::new();
        for line in reader.split(b'\n') {
            let line = line?;
            if let Some(event) = parse_marker(&String::from_utf8_lossy(&line)) {
                status.apply(&event);
            }
        }
        Ok(status)
    }

    /// Read a whole log file; a missing file is an empty status
    pub fn from_path(path: &Path) -> Result<Self> {
        match File::open(path) {
            Ok(file) => Self::from_reader(std::io::BufReader::new(file))
                .map_err(|e| ProvisionError::io("Monitor.Read", path, e)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(ProvisionError::io("Monitor.Open", path, e)),
        }
    }

    pub fn apply(&mut self, event: &StepEvent) {
        if event.kind == EventKind::Plan && self.last.is_some_and(|k| k != EventKind::Plan) {
            *self = Self::new();
        }
        self.last = Some(event.kind);

        if event.kind == EventKind::Complete {
            self.finished = true;
            self.summary = Some(event.detail.clone());
            return;
        }

        let step = self.entry(&event.step, event.phase);
        match event.kind {
            EventKind::Plan => step.status = StepStatus::Pending,
            EventKind::Start => {
                step.status = StepStatus::Running;
                step.started = Some(event.at);
            }
            EventKind::Done => step.status = StepStatus::Completed,
            EventKind::Skip => step.status = StepStatus::Skipped,
            EventKind::Fail => step.status = StepStatus::Failed,
            EventKind::NotRun => step.status = StepStatus::NotRun,
            EventKind::Complete => {}
        }
        if matches!(event.kind, EventKind::Done | EventKind::Fail) {
            step.finished = Some(event.at);
        }
        if event.kind != EventKind::Plan {
            step.detail.clone_from(&event.detail);
        }
    }

    fn entry(&mut self, id: &str, phase: Option<Phase>) -> &mut StepProgress {
        let index = match self.steps.iter().position(|s| s.id == id) {
            Some(index) => index,
            None => {
                // Truncated log: the PLAN line for this step is gone
                self.steps.push(StepProgress {
                    id: id.to_string(),
                    phase,
                    status: StepStatus::Pending,
                    started: None,
                    finished: None,
                    detail: String::new(),
                });
                self.steps.len() - 1
            }
        };
        &mut self.steps[index]
    }

    pub fn step(&self, id: &str) -> Option<&StepProgress> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn current(&self) -> Option<&StepProgress> {
        self.steps.iter().find(|s| s.status == StepStatus::Running)
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && !self.finished
    }
}

/// Follows a growing run log on a background thread
#[derive(Debug)]
pub struct LogWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LogWatcher {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(250);

    /// Start tailing `path`, publishing into `status`.
    ///
    /// The file need not exist yet. A file that shrinks is treated as a new
    /// log and read from the start.
    pub fn spawn(
        path: impl Into<PathBuf>,
        status: Arc<RwLock<RunStatus>>,
        interval: Duration,
    ) -> Result<Self> {
        let path = path.into();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread_path = path.clone();

        let handle = thread::Builder::new()
            .name("sprout-log-watcher".into())
            .spawn(move || {
                let mut tail = Tail::new(thread_path);
                while !flag.load(Ordering::Relaxed) {
                    match tail.poll() {
                        Ok(Some(update)) => publish(&status, update),
                        Ok(None) => {}
                        Err(e) => tracing::debug!(error = %e, "log watcher read failed"),
                    }
                    thread::sleep(interval);
                }
            })
            .map_err(|e| ProvisionError::io("Monitor.Spawn", &path, e))?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::warn!("log watcher thread panicked");
        }
    }
}

impl Drop for LogWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum Update {
    Events(Vec<StepEvent>),
    Reset(Vec<StepEvent>),
}

fn publish(status: &RwLock<RunStatus>, update: Update) {
    let mut status = status.write().unwrap_or_else(PoisonError::into_inner);
    let events = match update {
        Update::Events(events) => events,
        Update::Reset(events) => {
            *status = RunStatus::new();
            events
        }
    };
    for event in &events {
        status.apply(event);
    }
}

/// Incremental reader holding back an unterminated last line
struct Tail {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
}

impl Tail {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            partial: Vec::new(),
        }
    }

    fn poll(&mut self) -> std::io::Result<Option<Update>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let len = file.metadata()?.len();
        let truncated = len < self.offset;
        if truncated {
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Ok(truncated.then(|| Update::Reset(Vec::new())));
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut chunk = Vec::new();
        let read = file.read_to_end(&mut chunk)?;
        self.offset += read as u64;
        self.partial.extend_from_slice(&chunk);

        let mut events = Vec::new();
        while let Some(end) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=end).collect();
            if let Some(event) = parse_marker(&String::from_utf8_lossy(&line)) {
                events.push(event);
            }
        }

        Ok(Some(if truncated {
            Update::Reset(events)
        } else {
            Update::Events(events)
        }))
    }
}
