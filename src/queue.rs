//! Interactive job queue
//!
//! Holds the list of files an interactive client wants processed and drives
//! them through a [`RemovalService`] on a dedicated worker thread, strictly
//! in submission order. Every change is announced on an event channel so a
//! single consumer (a UI loop, the CLI's render task) can mirror the state
//! without touching the queue's lock.
//!
//! Item lifecycle:
//!
//! ```text
//! pending ──► processing ──► done
//!    ▲             │
//!    └── retry ─── error
//! ```

use crate::{
    codec::ImageCodec,
    config::OutputFormat,
    error::{BgRemovalError, Result},
    service::{base_name, RemovalService, RESULT_PREFIX},
    tracing_config::spans,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use tempfile::TempDir;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Status of one queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Done,
    Error,
}

impl JobStatus {
    /// Whether the state machine allows `self -> next`
    #[must_use]
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Done)
                | (Self::Processing, Self::Error)
                | (Self::Error, Self::Pending)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Done => write!(f, "done"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One file in the queue
#[derive(Debug, Clone, Serialize)]
pub struct JobItem {
    pub id: Uuid,
    pub source: PathBuf,
    pub status: JobStatus,
    /// Processed PNG, set once the item is done
    pub result: Option<PathBuf>,
    /// Cause of the last failure
    pub error: Option<String>,
    pub added_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobItem {
    fn new(source: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            source,
            status: JobStatus::Pending,
            result: None,
            error: None,
            added_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Display name of the source file
    #[must_use]
    pub fn name(&self) -> String {
        self.source
            .file_name()
            .map_or_else(|| self.source.display().to_string(), |n| n.to_string_lossy().into_owned())
    }

    fn transition(&mut self, to: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(BgRemovalError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

/// Aggregate progress: done items over all items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueProgress {
    pub done: usize,
    pub total: usize,
}

impl QueueProgress {
    /// `done / total`; an empty queue reports 0
    #[must_use]
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.done as f64 / self.total as f64
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.done == self.total
    }
}

impl fmt::Display for QueueProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} Ready", self.done, self.total)
    }
}

/// Change notifications, delivered in the order they happened
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// A run picked up `pending` items
    RunStarted { pending: usize },
    /// An item changed status
    StatusChanged {
        id: Uuid,
        status: JobStatus,
        error: Option<String>,
    },
    /// Progress after an item finished
    Progress(QueueProgress),
    /// The worker found nothing left to do
    RunFinished(QueueProgress),
}

#[derive(Debug, Default)]
struct QueueState {
    items: Vec<JobItem>,
    running: bool,
}

impl QueueState {
    fn progress(&self) -> QueueProgress {
        QueueProgress {
            done: self.items.iter().filter(|i| i.status == JobStatus::Done).count(),
            total: self.items.len(),
        }
    }

    fn find_mut(&mut self, id: Uuid) -> Result<&mut JobItem> {
        self.items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(BgRemovalError::JobNotFound(id))
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.running {
            Err(BgRemovalError::QueueBusy)
        } else {
            Ok(())
        }
    }
}

/// Where processed files are written
#[derive(Debug)]
enum OutputDir {
    Scratch(TempDir),
    Fixed(PathBuf),
}

impl OutputDir {
    fn path(&self) -> &Path {
        match self {
            Self::Scratch(dir) => dir.path(),
            Self::Fixed(dir) => dir,
        }
    }
}

struct Shared {
    state: Mutex<QueueState>,
    events: mpsc::UnboundedSender<QueueEvent>,
    service: RemovalService,
    output: OutputDir,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| BgRemovalError::internal("Queue state poisoned"))
    }

    fn emit(&self, event: QueueEvent) {
        // A dropped receiver only means nobody is watching.
        let _ = self.events.send(event);
    }
}

/// Ordered job queue backed by one worker thread per run
#[derive(Clone)]
pub struct JobQueue {
    shared: Arc<Shared>,
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("output", &self.shared.output)
            .finish_non_exhaustive()
    }
}

/// Handle to a started run
#[derive(Debug)]
pub struct RunHandle {
    worker: JoinHandle<()>,
}

impl RunHandle {
    /// Block until the worker exits
    ///
    /// # Errors
    /// The worker thread panicked.
    pub fn join(self) -> Result<()> {
        self.worker
            .join()
            .map_err(|_| BgRemovalError::internal("Queue worker panicked"))
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }
}

impl JobQueue {
    /// Queue writing results into a private scratch directory
    ///
    /// # Errors
    /// The scratch directory cannot be created.
    pub fn new(service: RemovalService) -> Result<(Self, mpsc::UnboundedReceiver<QueueEvent>)> {
        let scratch = tempfile::Builder::new().prefix("nobg-queue-").tempdir()?;
        Ok(Self::build(service, OutputDir::Scratch(scratch)))
    }

    /// Queue writing results into `dir`
    ///
    /// # Errors
    /// `dir` cannot be created.
    pub fn with_output_dir<P: Into<PathBuf>>(
        service: RemovalService,
        dir: P,
    ) -> Result<(Self, mpsc::UnboundedReceiver<QueueEvent>)> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| BgRemovalError::file_io_error("create output directory", &dir, &e))?;
        Ok(Self::build(service, OutputDir::Fixed(dir)))
    }

    fn build(
        service: RemovalService,
        output: OutputDir,
    ) -> (Self, mpsc::UnboundedReceiver<QueueEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let queue = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                events,
                service,
                output,
            }),
        };
        (queue, receiver)
    }

    /// Directory results are written to
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        self.shared.output.path()
    }

    /// Append files as `pending`, skipping paths already queued
    ///
    /// Returns the ids of the newly added items.
    ///
    /// # Errors
    /// `QueueBusy` during a run.
    pub fn add_files<I, P>(&self, paths: I) -> Result<Vec<Uuid>>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut state = self.shared.lock()?;
        state.ensure_idle()?;

        let mut added = Vec::new();
        for path in paths {
            let path = path.into();
            if state.items.iter().any(|i| i.source == path) {
                tracing::debug!(path = %path.display(), "Already queued");
                continue;
            }
            let item = JobItem::new(path);
            added.push(item.id);
            state.items.push(item);
        }
        Ok(added)
    }

    /// Remove one item
    ///
    /// `pending` and `error` items can be removed at any time. A `processing`
    /// item cannot be removed; `done` items only while no run is active.
    ///
    /// # Errors
    /// - `JobNotFound`
    /// - `QueueBusy` for an item the running worker owns or has finished
    pub fn remove(&self, id: Uuid) -> Result<JobItem> {
        let mut state = self.shared.lock()?;
        let index = state
            .items
            .iter()
            .position(|i| i.id == id)
            .ok_or(BgRemovalError::JobNotFound(id))?;

        match state.items[index].status {
            JobStatus::Pending | JobStatus::Error => {},
            JobStatus::Processing => return Err(BgRemovalError::QueueBusy),
            JobStatus::Done => state.ensure_idle()?,
        }
        let item = state.items.remove(index);
        drop(state);

        if let Some(result) = &item.result {
            if let Err(e) = std::fs::remove_file(result) {
                tracing::debug!(path = %result.display(), "Could not delete result: {e}");
            }
        }
        Ok(item)
    }

    /// Remove every item
    ///
    /// # Errors
    /// `QueueBusy` during a run.
    pub fn clear(&self) -> Result<usize> {
        let mut state = self.shared.lock()?;
        state.ensure_idle()?;
        let removed = std::mem::take(&mut state.items);
        drop(state);

        for result in removed.iter().filter_map(|i| i.result.as_ref()) {
            let _ = std::fs::remove_file(result);
        }
        Ok(removed.len())
    }

    /// Move every `error` item back to `pending`
    ///
    /// # Errors
    /// `QueueBusy` during a run.
    pub fn retry_failed(&self) -> Result<usize> {
        let mut state = self.shared.lock()?;
        state.ensure_idle()?;
        let mut retried = Vec::new();
        for item in state.items.iter_mut().filter(|i| i.status == JobStatus::Error) {
            item.transition(JobStatus::Pending)?;
            item.error = None;
            item.finished_at = None;
            retried.push(item.id);
        }
        for id in &retried {
            self.shared.emit(QueueEvent::StatusChanged {
                id: *id,
                status: JobStatus::Pending,
                error: None,
            });
        }
        Ok(retried.len())
    }

    /// Move one `error` item back to `pending`
    ///
    /// # Errors
    /// - `QueueBusy` during a run
    /// - `JobNotFound`
    /// - `InvalidTransition` when the item is not in `error`
    pub fn retry(&self, id: Uuid) -> Result<()> {
        let mut state = self.shared.lock()?;
        state.ensure_idle()?;
        let item = state.find_mut(id)?;
        item.transition(JobStatus::Pending)?;
        item.error = None;
        item.finished_at = None;
        self.shared.emit(QueueEvent::StatusChanged {
            id,
            status: JobStatus::Pending,
            error: None,
        });
        Ok(())
    }

    /// Start a worker that processes every `pending` item in order
    ///
    /// # Errors
    /// - `QueueBusy` when a run is already active
    /// - The worker thread cannot be spawned
    pub fn start(&self) -> Result<RunHandle> {
        let pending = {
            let mut state = self.shared.lock()?;
            state.ensure_idle()?;
            state.running = true;
            state
                .items
                .iter()
                .filter(|i| i.status == JobStatus::Pending)
                .count()
        };
        self.shared.emit(QueueEvent::RunStarted { pending });

        let shared = Arc::clone(&self.shared);
        let worker = std::thread::Builder::new()
            .name("nobg-queue".to_string())
            .spawn(move || run_worker(&shared));

        match worker {
            Ok(worker) => Ok(RunHandle { worker }),
            Err(e) => {
                if let Ok(mut state) = self.shared.lock() {
                    state.running = false;
                }
                Err(BgRemovalError::internal(format!("Failed to spawn queue worker: {e}")))
            },
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.lock().is_ok_and(|s| s.running)
    }

    /// Current aggregate progress
    pub fn progress(&self) -> Result<QueueProgress> {
        Ok(self.shared.lock()?.progress())
    }

    /// Copy of every item in submission order
    pub fn snapshot(&self) -> Result<Vec<JobItem>> {
        Ok(self.shared.lock()?.items.clone())
    }

    /// Copy of one item
    pub fn get(&self, id: Uuid) -> Result<JobItem> {
        let mut state = self.shared.lock()?;
        state.find_mut(id).map(|item| item.clone())
    }

    /// Copy every `done` result into `dir`
    ///
    /// Returns the written paths in queue order.
    ///
    /// # Errors
    /// Filesystem failures.
    pub fn export<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<PathBuf>> {
        let dir = dir.as_ref();
        let results: Vec<PathBuf> = self
            .snapshot()?
            .into_iter()
            .filter(|i| i.status == JobStatus::Done)
            .filter_map(|i| i.result)
            .collect();

        std::fs::create_dir_all(dir)
            .map_err(|e| BgRemovalError::file_io_error("create export directory", dir, &e))?;
        let mut written = Vec::with_capacity(results.len());
        for result in results {
            let Some(file_name) = result.file_name() else {
                continue;
            };
            let target = dir.join(file_name);
            std::fs::copy(&result, &target)
                .map_err(|e| BgRemovalError::file_io_error("export result", &result, &e))?;
            written.push(target);
        }
        tracing::info!(count = written.len(), dir = %dir.display(), "Exported results");
        Ok(written)
    }
}

/// Claim the first pending item, flipping it to `processing`
fn claim_next(shared: &Shared) -> Result<Option<(Uuid, PathBuf, PathBuf)>> {
    let mut state = shared.lock()?;
    let taken: Vec<PathBuf> = state.items.iter().filter_map(|i| i.result.clone()).collect();
    let Some(item) = state.items.iter_mut().find(|i| i.status == JobStatus::Pending) else {
        return Ok(None);
    };
    item.transition(JobStatus::Processing)?;

    let dest = unique_result_path(shared.output.path(), &base_name(&item.name()), &taken);
    shared.emit(QueueEvent::StatusChanged {
        id: item.id,
        status: JobStatus::Processing,
        error: None,
    });
    Ok(Some((item.id, item.source.clone(), dest)))
}

fn unique_result_path(dir: &Path, stem: &str, taken: &[PathBuf]) -> PathBuf {
    let mut candidate = dir.join(format!("{RESULT_PREFIX}{stem}.png"));
    let mut n = 1;
    while taken.contains(&candidate) {
        candidate = dir.join(format!("{RESULT_PREFIX}{stem}_{n}.png"));
        n += 1;
    }
    candidate
}

fn process_item(service: &RemovalService, source: &Path, dest: &Path) -> Result<()> {
    let name = source.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    let _enter = spans::queue_item(&name).entered();
    let bytes = std::fs::read(source)
        .map_err(|e| BgRemovalError::file_io_error("read input", source, &e))?;
    let image = ImageCodec::decode(&bytes)?;
    let result = service.remove_one_blocking(&image, false)?;
    result.save(dest, OutputFormat::Png)
}

fn run_worker(shared: &Shared) {
    let span = tracing::info_span!("queue_run");
    let _enter = span.enter();

    loop {
        let (id, source, dest) = match claim_next(shared) {
            Ok(Some(next)) => next,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("Queue worker stopped: {e}");
                break;
            },
        };

        let outcome = process_item(&shared.service, &source, &dest);
        let Ok(mut state) = shared.lock() else {
            tracing::error!("Queue state poisoned, stopping worker");
            break;
        };
        let Ok(item) = state.find_mut(id) else {
            continue;
        };

        let (status, error) = match outcome {
            Ok(()) => {
                item.result = Some(dest);
                (JobStatus::Done, None)
            },
            Err(e) => {
                tracing::warn!(source = %source.display(), "Processing failed: {e}");
                (JobStatus::Error, Some(e.to_string()))
            },
        };
        if let Err(e) = item.transition(status) {
            tracing::error!("{e}");
            continue;
        }
        item.error.clone_from(&error);
        item.finished_at = Some(Utc::now());

        let progress = state.progress();
        drop(state);
        shared.emit(QueueEvent::StatusChanged { id, status, error });
        shared.emit(QueueEvent::Progress(progress));
    }

    let progress = match shared.lock() {
        Ok(mut state) => {
            state.running = false;
            state.progress()
        },
        Err(_) => QueueProgress { done: 0, total: 0 },
    };
    tracing::info!("Queue run finished: {progress}");
    shared.emit(QueueEvent::RunFinished(progress));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        use JobStatus::*;
        let allowed = [
            (Pending, Processing),
            (Processing, Done),
            (Processing, Error),
            (Error, Pending),
        ];
        for from in [Pending, Processing, Done, Error] {
            for to in [Pending, Processing, Done, Error] {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_item_transition_errors() {
        let mut item = JobItem::new(PathBuf::from("a.png"));
        let err = item.transition(JobStatus::Done).unwrap_err();
        assert!(matches!(
            err,
            BgRemovalError::InvalidTransition {
                from: JobStatus::Pending,
                to: JobStatus::Done
            }
        ));
        item.transition(JobStatus::Processing).unwrap();
        item.transition(JobStatus::Error).unwrap();
        item.transition(JobStatus::Pending).unwrap();
        assert_eq!(item.status, JobStatus::Pending);
    }

    #[test]
    fn test_progress_text() {
        let progress = QueueProgress { done: 2, total: 5 };
        assert_eq!(progress.to_string(), "2/5 Ready");
        assert!((progress.fraction() - 0.4).abs() < f64::EPSILON);
        assert!(!progress.is_complete());
        assert_eq!(QueueProgress { done: 0, total: 0 }.fraction(), 0.0);
        assert!(QueueProgress { done: 3, total: 3 }.is_complete());
    }

    #[test]
    fn test_unique_result_path() {
        let dir = Path::new("/out");
        let taken = vec![dir.join("no_bg_cat.png"), dir.join("no_bg_cat_1.png")];
        assert_eq!(unique_result_path(dir, "dog", &taken), dir.join("no_bg_dog.png"));
        assert_eq!(unique_result_path(dir, "cat", &taken), dir.join("no_bg_cat_2.png"));
    }
}
