//! Local batch queue: sequential processing, progress, retry and export

mod common;

use nobg::backends::test_utils::{png_bytes, MockBehavior};
use nobg::{BgRemovalError, JobQueue, JobStatus, QueueEvent, QueueProgress, RemovalService};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

fn write_inputs(dir: &TempDir, names: &[&str]) -> Vec<PathBuf> {
    names
        .iter()
        .map(|name| {
            let path = dir.path().join(name);
            fs::write(&path, png_bytes(40, 40)).unwrap();
            path
        })
        .collect()
}

fn drain(events: &mut UnboundedReceiver<QueueEvent>) -> Vec<QueueEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn test_queue_processes_in_submission_order() {
    let (_model, _provider, handle) = common::loaded(MockBehavior::default()).await;
    let inputs = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    let files = write_inputs(&inputs, &["b.png", "a.png", "c.png"]);

    let (queue, mut events) =
        JobQueue::with_output_dir(RemovalService::new(handle), output.path()).unwrap();
    let ids = queue.add_files(files.clone()).unwrap();
    assert_eq!(ids.len(), 3);
    assert_eq!(queue.progress().unwrap(), QueueProgress { done: 0, total: 3 });

    queue.start().unwrap().join().unwrap();
    assert!(!queue.is_running());

    let items = queue.snapshot().unwrap();
    assert!(items.iter().all(|item| item.status == JobStatus::Done));
    let results: Vec<String> = items
        .iter()
        .map(|item| {
            let path = item.result.as_ref().unwrap();
            assert!(path.starts_with(output.path()));
            path.file_name().unwrap().to_string_lossy().to_string()
        })
        .collect();
    assert_eq!(results, vec!["no_bg_b.png", "no_bg_a.png", "no_bg_c.png"]);

    let result = image::open(items[0].result.as_ref().unwrap()).unwrap();
    assert!(result.color().has_alpha());
    assert_eq!(queue.progress().unwrap().to_string(), "3/3 Ready");

    // Each item goes processing -> done before the next one starts
    let processing_order: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            QueueEvent::StatusChanged { id, status, .. } => Some((id, status)),
            _ => None,
        })
        .collect();
    let expected: Vec<_> = ids
        .iter()
        .flat_map(|id| [(*id, JobStatus::Processing), (*id, JobStatus::Done)])
        .collect();
    assert_eq!(processing_order, expected);
}

#[tokio::test]
async fn test_failed_items_can_be_retried() {
    let (_model, _provider, handle) = common::loaded(MockBehavior::default()).await;
    let inputs = TempDir::new().unwrap();
    let mut files = write_inputs(&inputs, &["good.png"]);
    let broken = inputs.path().join("broken.png");
    fs::write(&broken, b"definitely not a png").unwrap();
    files.push(broken.clone());

    let (queue, mut events) = JobQueue::new(RemovalService::new(handle)).unwrap();
    let ids = queue.add_files(files).unwrap();
    queue.start().unwrap().join().unwrap();

    let failed = queue.get(ids[1]).unwrap();
    assert_eq!(failed.status, JobStatus::Error);
    assert!(failed.error.is_some());
    assert_eq!(queue.progress().unwrap(), QueueProgress { done: 1, total: 2 });

    let events = drain(&mut events);
    assert!(matches!(events.first(), Some(QueueEvent::RunStarted { pending: 2 })));
    assert_eq!(
        events.last(),
        Some(&QueueEvent::RunFinished(QueueProgress { done: 1, total: 2 }))
    );

    // Done items cannot go back to pending
    assert!(matches!(
        queue.retry(ids[0]),
        Err(BgRemovalError::InvalidTransition { .. })
    ));

    fs::write(&broken, png_bytes(16, 16)).unwrap();
    assert_eq!(queue.retry_failed().unwrap(), 1);
    assert_eq!(queue.get(ids[1]).unwrap().status, JobStatus::Pending);

    queue.start().unwrap().join().unwrap();
    assert_eq!(queue.get(ids[1]).unwrap().status, JobStatus::Done);
    assert!(queue.progress().unwrap().is_complete());
}

#[tokio::test]
async fn test_export_and_removal_rules() {
    let (_model, _provider, handle) = common::loaded(MockBehavior::default()).await;
    let inputs = TempDir::new().unwrap();
    let files = write_inputs(&inputs, &["one.png", "two.png"]);

    let (queue, _events) = JobQueue::new(RemovalService::new(handle)).unwrap();
    let ids = queue.add_files(files.clone()).unwrap();
    assert!(queue.add_files(files).unwrap().is_empty(), "duplicates are skipped");

    queue.start().unwrap().join().unwrap();

    let export = TempDir::new().unwrap();
    let written = queue.export(export.path().join("results")).unwrap();
    assert_eq!(written.len(), 2);
    assert!(written.iter().all(|path| path.is_file()));

    let removed = queue.remove(ids[0]).unwrap();
    assert_eq!(removed.status, JobStatus::Done);
    assert!(!removed.result.unwrap().exists());
    assert_eq!(queue.progress().unwrap(), QueueProgress { done: 1, total: 1 });

    assert!(matches!(
        queue.remove(ids[0]),
        Err(BgRemovalError::JobNotFound(_))
    ));
    assert_eq!(queue.clear().unwrap(), 1);
    assert_eq!(queue.progress().unwrap().fraction(), 0.0);
}

#[tokio::test]
async fn test_queue_rejects_changes_during_run() {
    let (_model, _provider, handle) = common::loaded(MockBehavior {
        infer_delay: std::time::Duration::from_millis(150),
        ..MockBehavior::default()
    })
    .await;
    let inputs = TempDir::new().unwrap();
    let files = write_inputs(&inputs, &["slow1.png", "slow2.png"]);

    let (queue, _events) = JobQueue::new(RemovalService::new(handle)).unwrap();
    let ids = queue.add_files(files).unwrap();
    let run = queue.start().unwrap();

    assert!(queue.is_running());
    assert!(matches!(queue.start(), Err(BgRemovalError::QueueBusy)));
    assert!(matches!(queue.clear(), Err(BgRemovalError::QueueBusy)));
    assert!(matches!(
        queue.add_files([inputs.path().join("late.png")]),
        Err(BgRemovalError::QueueBusy)
    ));

    // The second item is still waiting and may be dropped
    let pending = queue.remove(ids[1]).unwrap();
    assert_eq!(pending.status, JobStatus::Pending);

    run.join().unwrap();
    assert_eq!(queue.progress().unwrap(), QueueProgress { done: 1, total: 1 });
}

fn progress_updates(events: &[QueueEvent]) -> Vec<QueueProgress> {
    events
        .iter()
        .filter_map(|event| match event {
            QueueEvent::Progress(progress) => Some(*progress),
            _ => None,
        })
        .collect()
}

fn assert_monotonic(updates: &[QueueProgress]) {
    for progress in updates {
        let fraction = progress.fraction();
        assert!((0.0..=1.0).contains(&fraction), "{progress:?} out of range");
        assert_eq!(fraction == 1.0, progress.is_complete(), "{progress:?}");
    }
    for pair in updates.windows(2) {
        assert!(
            pair[1].fraction() >= pair[0].fraction(),
            "progress went from {} to {}",
            pair[0],
            pair[1]
        );
    }
}

#[tokio::test]
async fn test_progress_only_moves_forward() {
    let (_model, _provider, handle) = common::loaded(MockBehavior {
        infer_delay: std::time::Duration::from_millis(60),
        ..MockBehavior::default()
    })
    .await;
    let inputs = TempDir::new().unwrap();
    let mut files = write_inputs(&inputs, &["p1.png", "p2.png"]);
    let broken = inputs.path().join("p3.png");
    fs::write(&broken, b"truncated").unwrap();
    files.push(broken.clone());
    files.extend(write_inputs(&inputs, &["p4.png", "p5.png"]));

    let (queue, mut events) = JobQueue::new(RemovalService::new(handle)).unwrap();
    let ids = queue.add_files(files).unwrap();
    let run = queue.start().unwrap();

    // Dropping a waiting item mid-run shrinks the total
    assert_eq!(queue.remove(ids[4]).unwrap().status, JobStatus::Pending);
    run.join().unwrap();

    let first_run = drain(&mut events);
    let updates = progress_updates(&first_run);
    assert_eq!(updates.len(), 4);
    assert_monotonic(&updates);
    assert!(updates.iter().all(|p| p.fraction() < 1.0));
    assert_eq!(
        first_run.last(),
        Some(&QueueEvent::RunFinished(QueueProgress { done: 3, total: 4 }))
    );

    fs::write(&broken, png_bytes(16, 16)).unwrap();
    assert_eq!(queue.retry_failed().unwrap(), 1);
    queue.start().unwrap().join().unwrap();

    let updates = progress_updates(&drain(&mut events));
    assert_monotonic(&updates);
    assert_eq!(updates.last(), Some(&QueueProgress { done: 4, total: 4 }));
    assert_eq!(updates.last().map(QueueProgress::fraction), Some(1.0));
}

#[tokio::test]
async fn test_inference_failures_mark_items_error() {
    let (_model, _provider, handle) = common::loaded(MockBehavior {
        fail_infer: true,
        ..MockBehavior::default()
    })
    .await;
    let inputs = TempDir::new().unwrap();
    let files = write_inputs(&inputs, &["x.png", "y.png"]);

    let (queue, mut events) = JobQueue::new(RemovalService::new(handle)).unwrap();
    queue.add_files(files).unwrap();
    queue.start().unwrap().join().unwrap();

    let items = queue.snapshot().unwrap();
    assert!(items.iter().all(|item| item.status == JobStatus::Error));
    assert!(items.iter().all(|item| item.result.is_none()));
    assert!(items
        .iter()
        .all(|item| item.error.as_deref().is_some_and(|e| e.contains("Mock inference failed"))));

    let progress = queue.progress().unwrap();
    assert_eq!(progress, QueueProgress { done: 0, total: 2 });
    assert!(!progress.is_complete());
    assert_monotonic(&progress_updates(&drain(&mut events)));
}
