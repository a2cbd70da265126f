use std::{fs, thread::sleep, time::Duration};

use serial_test::serial;
use tempfile::tempdir;

#[test]
#[serial]
fn writes_log_file_and_tolerates_reinit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("logs").join("update_lock.log");

    update_lock::logging::init(true, Some(path.as_path()));
    tracing::info!("reconciler started");

    sleep(Duration::from_millis(100));

    assert!(path.exists(), "log file was not created");
    let contents = fs::read_to_string(&path).unwrap();
    assert!(contents.contains("reconciler started"));

    // A second initialisation keeps the first subscriber.
    update_lock::logging::init(false, None);
    tracing::info!("still logging");
    sleep(Duration::from_millis(100));
    let contents = fs::read_to_string(&path).unwrap();
    assert!(contents.contains("still logging"));
}
