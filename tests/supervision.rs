mod common;

use common::{wait_for, wait_for_state, Fixture, RecordingPlatform};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use rlinit::{Init, ServiceState};
use std::sync::Arc;
use std::time::Duration;

async fn pid_of(init: &Init, name: &str) -> u32 {
    init.supervisor()
        .registry()
        .get(name)
        .await
        .and_then(|svc| svc.instance.pid)
        .expect("service has no process")
}

fn kill_process(pid: u32) {
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_always_respawns_until_budget_exhausted() {
    let fx = Fixture::new();
    fx.set_runlevel("2");
    fx.service(2, "a", "NAME=a\nCMD=exec sleep 30\nRESTART=always\n");

    let poll = Duration::from_millis(100);
    let mut config = fx.config();
    config.poll_interval = poll;
    let init = fx.init_with(config, Arc::new(RecordingPlatform::default()));
    init.boot().await;
    assert!(wait_for_state(&init, "a", ServiceState::Running).await);

    // Each exit is noticed within one polling interval
    let window = 2 * poll + Duration::from_millis(150);
    let registry = init.supervisor().registry();
    for attempt in 1..=5u32 {
        let old = pid_of(&init, "a").await;
        kill_process(old);

        let respawned = wait_for(window, || async move {
            registry.get("a").await.is_some_and(|svc| {
                svc.state() == ServiceState::Running
                    && svc.instance.respawn_count == attempt
                    && svc.instance.pid != Some(old)
            })
        })
        .await;
        assert!(respawned, "attempt {} did not respawn", attempt);
    }

    kill_process(pid_of(&init, "a").await);
    assert!(wait_for_state(&init, "a", ServiceState::Stopped).await);

    // A few more polling intervals: nothing else happens
    tokio::time::sleep(Duration::from_millis(300)).await;
    let svc = registry.get("a").await.unwrap();
    assert_eq!(svc.state(), ServiceState::Stopped);
    assert_eq!(svc.instance.respawn_count, 5);
    assert_eq!(svc.instance.pid, None);

    init.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_never_policy_stays_stopped() {
    let fx = Fixture::new();
    fx.set_runlevel("2");
    fx.service(2, "once", "NAME=once\nCMD=exec sleep 30\n");

    let init = fx.init(Arc::new(RecordingPlatform::default()));
    init.boot().await;
    assert!(wait_for_state(&init, "once", ServiceState::Running).await);

    kill_process(pid_of(&init, "once").await);
    assert!(wait_for_state(&init, "once", ServiceState::Stopped).await);

    // A later bring-up scan does not relaunch it either
    let report = init.orchestrator().bring_up(2).await;
    assert!(report.started.is_empty());

    tokio::time::sleep(Duration::from_millis(200)).await;
    let svc = init.supervisor().registry().get("once").await.unwrap();
    assert_eq!(svc.state(), ServiceState::Stopped);
    assert_eq!(svc.instance.respawn_count, 0);

    init.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_on_failure_restarts_only_failures() {
    let fx = Fixture::new();
    fx.set_runlevel("2");
    fx.service(2, "clean", "NAME=clean\nCMD=exit 0\nRESTART=on-failure\n");
    fx.service(2, "crash", "NAME=crash\nCMD=exit 1\nRESTART=on-failure\n");

    let init = fx.init(Arc::new(RecordingPlatform::default()));
    init.boot().await;

    let registry = init.supervisor().registry();
    let exhausted = wait_for(Duration::from_secs(5), || async move {
        registry.get("crash").await.is_some_and(|svc| {
            svc.state() == ServiceState::Stopped && svc.instance.respawn_count == 5
        })
    })
    .await;
    assert!(exhausted);

    assert!(wait_for_state(&init, "clean", ServiceState::Stopped).await);
    let clean = registry.get("clean").await.unwrap();
    assert_eq!(clean.instance.respawn_count, 0);
    assert_eq!(clean.instance.last_exit.map(|e| e.code), Some(Some(0)));

    init.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stopped_during_shutdown_is_not_restarted() {
    let fx = Fixture::new();
    fx.set_runlevel("2");
    fx.service(2, "daemon", "NAME=daemon\nCMD=exec sleep 30\nRESTART=always\n");

    let platform = Arc::new(RecordingPlatform::default());
    let init = fx.init(Arc::clone(&platform));
    init.boot().await;
    assert!(wait_for_state(&init, "daemon", ServiceState::Running).await);

    let report = init.shutdown().await;
    assert_eq!(report.stopped, vec!["daemon".to_string()]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let svc = init.supervisor().registry().get("daemon").await.unwrap();
    assert_eq!(svc.state(), ServiceState::Stopped);
    assert_eq!(svc.instance.respawn_count, 0);
}
