use tempfile::tempdir;
use update_lock::supervision::{HeartbeatFile, InstanceGuard, SupervisionHandle};

#[test]
fn second_instance_handle_is_refused() {
    let first = InstanceGuard::acquire("update-lock-test-single").unwrap();
    assert!(first.is_some());
    assert!(InstanceGuard::acquire("update-lock-test-single").unwrap().is_none());

    drop(first);
    assert!(InstanceGuard::acquire("update-lock-test-single").unwrap().is_some());
}

#[test]
fn failing_watcher_spawn_fails_setup() {
    let dir = tempdir().unwrap();
    let file = HeartbeatFile::new(dir.path().join("hb.json"));
    let result = SupervisionHandle::start_with(
        file,
        Box::new(|| -> std::io::Result<std::process::Child> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no exe"))
        }),
    );
    assert!(result.is_err());
}

#[cfg(unix)]
mod with_processes {
    use super::*;
    use std::process::Command;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread::sleep;
    use std::time::Duration;
    use update_lock::supervision::{Heartbeat, WatcherSpawner};

    fn shell(script: &'static str, spawned: Arc<AtomicUsize>) -> WatcherSpawner {
        Box::new(move || {
            spawned.fetch_add(1, Ordering::SeqCst);
            Command::new("sh").arg("-c").arg(script).spawn()
        })
    }

    #[test]
    fn heartbeat_is_written_for_this_process() {
        let dir = tempdir().unwrap();
        let spawned = Arc::new(AtomicUsize::new(0));
        let handle = SupervisionHandle::start_with(
            HeartbeatFile::new(dir.path().join("hb.json")),
            shell("sleep 2", spawned.clone()),
        )
        .unwrap();

        let first = handle.heartbeat_file().read().unwrap();
        assert_eq!(first.pid, std::process::id());
        assert!(!first.cancelled);

        sleep(Duration::from_millis(20));
        handle.set_alive();
        let second = handle.heartbeat_file().read().unwrap();
        assert!(second.last_alive >= first.last_alive);
        // The watcher is still running, nothing is respawned.
        assert_eq!(spawned.load(Ordering::SeqCst), 1);
        assert_eq!(handle.watchers_spawned(), 1);
    }

    #[test]
    fn dead_watcher_is_respawned_until_cancelled() {
        let dir = tempdir().unwrap();
        let spawned = Arc::new(AtomicUsize::new(0));
        let handle = SupervisionHandle::start_with(
            HeartbeatFile::new(dir.path().join("hb.json")),
            shell("exit 0", spawned.clone()),
        )
        .unwrap();

        sleep(Duration::from_millis(300));
        handle.set_alive();
        assert_eq!(handle.watchers_spawned(), 2);

        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(handle.heartbeat_file().read().unwrap().cancelled);

        sleep(Duration::from_millis(300));
        handle.set_alive();
        assert_eq!(handle.watchers_spawned(), 2);
        assert!(handle.heartbeat_file().read().unwrap().cancelled);
    }
}
