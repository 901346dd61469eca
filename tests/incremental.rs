//! Incremental candidate selection across consecutive runs.

mod common;

use std::time::Duration;

use chrono::Local;
use filetime::FileTime;
use tokio::time::timeout;

use keepd::config::AppConfig;
use keepd::core::{JobKind, JobState};

use common::{TestRig, manager_over, rig, rig_with};

async fn run(rig: &TestRig, name: &str) {
    timeout(Duration::from_secs(5), rig.manager.execute_and_wait(name))
        .await
        .expect("run timed out")
        .expect("run failed");
}

async fn todays_entries(rig: &TestRig) -> usize {
    rig.manager
        .logs()
        .read_day(Local::now().date_naive())
        .await
        .len()
}

#[tokio::test]
async fn test_first_incremental_run_copies_every_file() {
    let rig = rig();
    let source = rig.dir("source");
    let target = rig.root.path().join("target");
    rig.write("source/a.txt", b"one");
    rig.write("source/sub/b.txt", b"two");

    rig.manager
        .create("docs", &source, &target, JobKind::Incremental)
        .await
        .unwrap();
    run(&rig, "docs").await;

    assert_eq!(std::fs::read(target.join("a.txt")).unwrap(), b"one");
    assert_eq!(std::fs::read(target.join("sub/b.txt")).unwrap(), b"two");
    assert_eq!(todays_entries(&rig).await, 2);
}

#[tokio::test]
async fn test_unchanged_files_are_skipped_on_the_next_run() {
    let rig = rig();
    let source = rig.dir("source");
    let target = rig.root.path().join("target");
    rig.write("source/a.txt", b"one");
    rig.write("source/b.txt", b"two");

    rig.manager
        .create("docs", &source, &target, JobKind::Incremental)
        .await
        .unwrap();
    run(&rig, "docs").await;
    assert_eq!(todays_entries(&rig).await, 2);

    run(&rig, "docs").await;
    assert_eq!(todays_entries(&rig).await, 2, "unchanged files were copied again");

    let status = rig.manager.status().get("docs").await.unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.total_files, 0);
    assert_eq!(status.progress, 100);
}

#[tokio::test]
async fn test_unchanged_priority_files_are_not_recopied() {
    let rig = rig_with(AppConfig {
        priority_extensions: vec!["pdf".to_string()],
        ..AppConfig::default()
    });
    let source = rig.dir("source");
    let target = rig.root.path().join("target");
    rig.write("source/report.pdf", b"contract");
    rig.write("source/notes.bin", b"plain");

    rig.manager
        .create("docs", &source, &target, JobKind::Incremental)
        .await
        .unwrap();
    run(&rig, "docs").await;
    assert_eq!(todays_entries(&rig).await, 2);

    // Nothing changed, so the mid-run recheck must not rediscover the
    // priority file the selection already skipped.
    run(&rig, "docs").await;
    assert_eq!(
        todays_entries(&rig).await,
        2,
        "unchanged priority files were copied again"
    );
}

#[tokio::test]
async fn test_modified_files_are_copied_again() {
    let rig = rig();
    let source = rig.dir("source");
    let target = rig.root.path().join("target");
    rig.write("source/a.txt", b"old");
    rig.write("source/b.txt", b"steady");

    rig.manager
        .create("docs", &source, &target, JobKind::Incremental)
        .await
        .unwrap();
    run(&rig, "docs").await;
    assert_eq!(std::fs::read(target.join("a.txt")).unwrap(), b"old");

    // Rewrite with an mtime safely past the recorded run time.
    let rewritten = rig.write("source/a.txt", b"new");
    let future = FileTime::from_unix_time(FileTime::now().unix_seconds() + 5, 0);
    filetime::set_file_mtime(&rewritten, future).unwrap();

    run(&rig, "docs").await;
    assert_eq!(std::fs::read(target.join("a.txt")).unwrap(), b"new");
    assert_eq!(todays_entries(&rig).await, 3);
}

#[tokio::test]
async fn test_files_missing_from_the_target_are_copied_again() {
    let rig = rig();
    let source = rig.dir("source");
    let target = rig.root.path().join("target");
    rig.write("source/a.txt", b"one");
    rig.write("source/b.txt", b"two");

    rig.manager
        .create("docs", &source, &target, JobKind::Incremental)
        .await
        .unwrap();
    run(&rig, "docs").await;

    std::fs::remove_file(target.join("a.txt")).unwrap();
    run(&rig, "docs").await;

    assert_eq!(std::fs::read(target.join("a.txt")).unwrap(), b"one");
    // Only the missing file was re-copied.
    assert_eq!(todays_entries(&rig).await, 3);
}

#[tokio::test]
async fn test_incremental_history_survives_a_daemon_restart() {
    let rig = rig();
    let source = rig.dir("source");
    let target = rig.root.path().join("target");
    rig.write("source/a.txt", b"one");
    rig.write("source/b.txt", b"two");

    rig.manager
        .create("docs", &source, &target, JobKind::Incremental)
        .await
        .unwrap();
    run(&rig, "docs").await;

    // A fresh manager over the same data directory, as after a restart.
    let restarted = manager_over(&rig);
    restarted
        .create("docs", &source, &target, JobKind::Incremental)
        .await
        .unwrap();
    timeout(Duration::from_secs(5), restarted.execute_and_wait("docs"))
        .await
        .expect("run timed out")
        .expect("run failed");

    assert_eq!(todays_entries(&rig).await, 2, "restart lost the last-run history");
}

#[tokio::test]
async fn test_deleting_a_job_discards_its_history() {
    let rig = rig();
    let source = rig.dir("source");
    let target = rig.root.path().join("target");
    rig.write("source/a.txt", b"one");
    rig.write("source/b.txt", b"two");

    rig.manager
        .create("docs", &source, &target, JobKind::Incremental)
        .await
        .unwrap();
    run(&rig, "docs").await;
    rig.manager.delete("docs").await.unwrap();

    rig.manager
        .create("docs", &source, &target, JobKind::Incremental)
        .await
        .unwrap();
    run(&rig, "docs").await;

    // With the status entry gone the second run starts from scratch.
    assert_eq!(todays_entries(&rig).await, 4);
}
