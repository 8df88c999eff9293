mod common;

use common::{wait_for_state, Fixture, RecordingPlatform};
use rlinit::ServiceState;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_poweroff_stops_everything_once() {
    let fx = Fixture::new();
    fx.set_runlevel("2");
    fx.service(2, "one", "NAME=one\nCMD=exec sleep 30\nRESTART=always\n");
    fx.service(2, "two", "NAME=two\nCMD=exec sleep 30\nRESTART=on-failure\n");

    let platform = Arc::new(RecordingPlatform::default());
    let init = fx.init(Arc::clone(&platform));
    init.boot().await;
    assert!(wait_for_state(&init, "one", ServiceState::Running).await);
    assert!(wait_for_state(&init, "two", ServiceState::Running).await);

    let report = init.shutdown().await;
    assert_eq!(report.stopped, vec!["one".to_string(), "two".to_string()]);
    assert!(report.powered_off);
    assert_eq!(platform.power_offs(), 1);
    assert_eq!(platform.releases(), 1);
    assert!(init.supervisor().registry().running().await.is_empty());

    // Nothing left to terminate and power-off is not repeated
    let again = init.shutdown().await;
    assert!(again.stopped.is_empty());
    assert!(!again.powered_off);
    assert_eq!(platform.power_offs(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_timeout_escalates_to_kill() {
    let fx = Fixture::new();
    fx.set_runlevel("2");
    fx.service(
        2,
        "stubborn",
        "NAME=stubborn\nCMD=trap '' TERM; while true; do sleep 1; done\n",
    );

    let mut config = fx.config();
    config.stop_timeout = Some(Duration::from_millis(300));
    let init = fx.init_with(config, Arc::new(RecordingPlatform::default()));
    init.boot().await;
    assert!(wait_for_state(&init, "stubborn", ServiceState::Running).await);

    let report = tokio::time::timeout(Duration::from_secs(5), init.shutdown())
        .await
        .expect("shutdown stalled");
    assert_eq!(report.stopped, vec!["stubborn".to_string()]);
    assert_eq!(
        init.supervisor().registry().state("stubborn").await,
        Some(ServiceState::Stopped)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_during_respawn_leaves_nothing_running() {
    for _ in 0..3 {
        let fx = Fixture::new();
        fx.set_runlevel("2");
        for i in 0..40 {
            fx.service(
                2,
                &format!("crash{:02}", i),
                &format!("NAME=crash{:02}\nCMD=exit 1\nRESTART=always\n", i),
            );
        }

        let mut config = fx.config();
        config.poll_interval = Duration::from_millis(2);
        config.max_respawn = 1_000_000;
        let init = fx.init_with(config, Arc::new(RecordingPlatform::default()));
        init.boot().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(30), init.shutdown())
            .await
            .expect("shutdown stalled");

        // Give a late respawn the chance to show up
        tokio::time::sleep(Duration::from_millis(50)).await;
        let registry = init.supervisor().registry();
        assert!(registry.running().await.is_empty());
        for svc in registry.snapshot().await {
            assert!(
                matches!(svc.state(), ServiceState::Stopped | ServiceState::Failed),
                "{} left {}",
                svc.name(),
                svc.state()
            );
            assert_eq!(svc.instance.pid, None);
        }
    }
}
