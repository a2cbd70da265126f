use std::time::Duration;
use update_lock::hooks::{HookRegistry, PostUnlockHook, DEFENDER_HOOK_NAME};

struct NamedHook;

impl PostUnlockHook for NamedHook {
    fn name(&self) -> &str {
        "named"
    }

    fn is_due(&self) -> bool {
        false
    }

    fn run(&self, _timeout: Duration) -> anyhow::Result<()> {
        Ok(())
    }
}

#[test]
fn builtin_registry_knows_the_defender_hook() {
    let registry = HookRegistry::with_builtin();
    assert_eq!(registry.names().collect::<Vec<_>>(), vec![DEFENDER_HOOK_NAME]);

    let hooks = registry.resolve(&["defender", "unknown"]);
    assert_eq!(hooks.len(), 1);
    assert_eq!(hooks[0].name(), DEFENDER_HOOK_NAME);
}

#[test]
fn registered_hooks_resolve_in_requested_order() {
    let mut registry = HookRegistry::with_builtin();
    registry.register("named", || -> Box<dyn PostUnlockHook> { Box::new(NamedHook) });

    let names: Vec<String> = registry
        .resolve(&["named", "defender"])
        .iter()
        .map(|h| h.name().to_string())
        .collect();
    assert_eq!(names, vec!["named", "defender"]);
    assert!(registry.resolve::<&str>(&[]).is_empty());
}

#[cfg(unix)]
#[test]
fn slow_child_is_killed_at_the_deadline() {
    use std::process::Command;
    use std::time::Instant;
    use update_lock::hooks::wait_bounded;

    let mut child = Command::new("sleep").arg("5").spawn().unwrap();
    let started = Instant::now();
    let status = wait_bounded(&mut child, Duration::from_millis(200)).unwrap();
    assert!(status.is_none());
    assert!(started.elapsed() < Duration::from_secs(3));

    let mut child = Command::new("true").spawn().unwrap();
    let status = wait_bounded(&mut child, Duration::from_secs(5)).unwrap();
    assert!(status.map(|s| s.success()).unwrap_or(false));

    let mut child = Command::new("true").spawn().unwrap();
    let status = wait_bounded(&mut child, Duration::MAX).unwrap();
    assert!(status.map(|s| s.success()).unwrap_or(false));
}
