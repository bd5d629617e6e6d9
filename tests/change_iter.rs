mod utils;

use dirwatch::*;
use std::fs::{self, File};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use utils::wait_for;

const TIMEOUT: Duration = Duration::from_secs(5);

fn iter_options() -> DirOptions {
    DirOptions::INCLUDE_CREATED_EVENTS | DirOptions::INCLUDE_MODIFIED_EVENTS
}

fn fast() -> ChangeIterConfig {
    ChangeIterConfig::default().with_latency(Duration::ZERO)
}

#[test]
fn requires_an_event_selection() {
    let dir = tempfile::tempdir().unwrap();
    let err = changed_directory_iterator(dir.path(), DirOptions::empty(), fast()).unwrap_err();
    assert!(matches!(err.kind, ErrorKind::InvalidArgument(_)));

    let err = changed_directory_iterator(
        dir.path(),
        DirOptions::SKIP_HIDDEN_DESCENDANTS,
        ChangeIterConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(err.kind, ErrorKind::InvalidArgument(_)));
}

#[test]
fn created_paths_are_queued() {
    let dir = tempfile::tempdir().unwrap();
    let iter = changed_directory_iterator(dir.path(), iter_options(), fast()).unwrap();
    assert!(iter.registration().is_live());
    assert!(iter == iter.registration());

    let p = dir.path().join("a");
    File::create(&p).unwrap();

    assert!(wait_for(TIMEOUT, || iter.next() == Some(p.clone())));
    assert_eq!(iter.next(), None);
    assert!(!iter.at_end());
}

#[test]
fn repeated_modifications_queue_the_path_once() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("f");
    File::create(&p).unwrap();

    let config = ChangeIterConfig::default().with_latency(Duration::from_millis(200));
    let iter = changed_directory_iterator(dir.path(), iter_options(), config).unwrap();

    // All three writes land inside one latency window.
    for i in 0..3 {
        let mut f = fs::OpenOptions::new().append(true).open(&p).unwrap();
        writeln!(f, "change {i}").unwrap();
        f.sync_all().unwrap();
        std::thread::sleep(Duration::from_millis(30));
    }

    let mut drained = Vec::new();
    assert!(wait_for(TIMEOUT, || {
        drained = iter.extract();
        !drained.is_empty()
    }));
    assert_eq!(drained.iter().filter(|q| *q == &p).count(), 1);
}

#[test]
fn extract_drains_everything_in_insertion_order() {
    let dir = tempfile::tempdir().unwrap();
    let iter = changed_directory_iterator(dir.path(), iter_options(), fast()).unwrap();

    let a = dir.path().join("a");
    let b = dir.path().join("b");
    File::create(&a).unwrap();
    File::create(&b).unwrap();

    let mut drained = Vec::new();
    assert!(wait_for(TIMEOUT, || {
        drained.extend(iter.extract());
        drained.contains(&a) && drained.contains(&b)
    }));
    let pos_a = drained.iter().position(|p| p == &a).unwrap();
    let pos_b = drained.iter().position(|p| p == &b).unwrap();
    assert!(pos_a < pos_b);
    assert!(iter.extract().is_empty());
}

#[test]
fn on_change_reports_activity() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let config = ChangeIterConfig::default()
        .with_latency(Duration::ZERO)
        .with_on_change(move |_reg| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
    let iter = changed_directory_iterator(dir.path(), iter_options(), config).unwrap();

    File::create(dir.path().join("a")).unwrap();
    assert!(wait_for(TIMEOUT, || calls.load(Ordering::SeqCst) > 0));
    assert_eq!(iter.next(), Some(dir.path().join("a")));
}

#[test]
fn regular_filter_drops_directories() {
    let dir = tempfile::tempdir().unwrap();
    let config = fast().with_filter(ChangeIterConfig::is_regular_filter);
    let iter = changed_directory_iterator(dir.path(), iter_options(), config).unwrap();

    fs::create_dir(dir.path().join("subdir")).unwrap();
    let f = dir.path().join("file");
    File::create(&f).unwrap();

    assert!(wait_for(TIMEOUT, || iter.next() == Some(f.clone())));
    // The directory creation was filtered out.
    assert_eq!(iter.next(), None);
}

#[test]
fn root_removal_terminates_the_iterator() {
    let parent = tempfile::tempdir().unwrap();
    let root = parent.path().join("X");
    fs::create_dir(&root).unwrap();

    let iter = changed_directory_iterator(&root, iter_options(), fast()).unwrap();
    assert!(!iter.at_end());

    fs::remove_dir(&root).unwrap();

    // The cancel bypasses all filters, flips done and stops the registration.
    assert!(wait_for(TIMEOUT, || iter.at_end()));
    assert!(wait_for(TIMEOUT, || !iter.registration().is_live()));
    assert_eq!(iter.next(), None);
}

#[test]
fn dropping_the_iterator_stops_the_monitor() {
    let dir = tempfile::tempdir().unwrap();
    let iter = changed_directory_iterator(dir.path(), iter_options(), fast()).unwrap();
    let reg = iter.registration();
    assert!(reg.is_live());
    drop(iter);
    assert!(wait_for(TIMEOUT, || !reg.is_live()));
}
