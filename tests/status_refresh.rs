mod common;

use common::{answer_basic, fast_settings, rig, rig_with};
use meshlink::registry::{ConnectionStatus, RecordStore};
use meshlink::transport::{OpenOptions, ProbeOutcome};
use std::time::Duration;

#[tokio::test]
async fn probes_skip_active_records() {
    let mut rig = rig();
    let live = rig.add("live");
    let idle = rig.add("idle");
    let manager = rig.manager.clone();
    let connecting =
        tokio::spawn(async move { manager.connect(live.id, OpenOptions::default()).await });
    let mut device = rig.next_device().await;
    answer_basic(&mut device, 77).await;
    assert!(connecting.await.unwrap().unwrap());

    rig.transport.set_probe_outcome(ProbeOutcome::Unreachable);
    rig.manager.refresh_statuses(&rig.manager.records()).await;
    assert_eq!(rig.transport.probes(), 1);
    assert_eq!(rig.status(live.id), ConnectionStatus::Connected);
    assert_eq!(rig.status(idle.id), ConnectionStatus::Disconnected);

    rig.transport.set_probe_outcome(ProbeOutcome::Reachable);
    rig.manager.refresh_statuses(&rig.manager.records()).await;
    assert_eq!(rig.status(live.id), ConnectionStatus::Connected);
    assert_eq!(rig.status(idle.id), ConnectionStatus::Online);
    assert!(!device.is_closed());
}

#[tokio::test]
async fn probe_result_arriving_after_connect_is_dropped() {
    let mut rig = rig();
    let record = rig.add("race");
    rig.transport.set_probe_outcome(ProbeOutcome::Unreachable);
    rig.transport.set_probe_delay(Duration::from_millis(200));

    let refresh = {
        let manager = rig.manager.clone();
        let records = manager.records();
        tokio::spawn(async move { manager.refresh_statuses(&records).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let manager = rig.manager.clone();
    let connecting =
        tokio::spawn(async move { manager.connect(record.id, OpenOptions::default()).await });
    let mut device = rig.next_device().await;
    answer_basic(&mut device, 8).await;
    assert!(connecting.await.unwrap().unwrap());

    refresh.await.unwrap();
    assert_eq!(rig.status(record.id), ConnectionStatus::Connected);
}

#[tokio::test]
async fn inconclusive_and_slow_probes_leave_status_alone() {
    let mut settings = fast_settings();
    settings.probe_timeout = Duration::from_millis(100);
    let rig = rig_with(settings);
    let record = rig.add("fog");

    rig.transport.set_probe_outcome(ProbeOutcome::Reachable);
    rig.manager.refresh_statuses(&rig.manager.records()).await;
    assert_eq!(rig.status(record.id), ConnectionStatus::Online);

    rig.transport
        .set_probe_outcome(ProbeOutcome::Inconclusive("no permission".into()));
    rig.manager.refresh_statuses(&rig.manager.records()).await;
    assert_eq!(rig.status(record.id), ConnectionStatus::Online);

    rig.transport.set_probe_outcome(ProbeOutcome::Unreachable);
    rig.transport.set_probe_delay(Duration::from_secs(2));
    let started = tokio::time::Instant::now();
    rig.manager.refresh_statuses(&rig.manager.records()).await;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(rig.status(record.id), ConnectionStatus::Online);
}

#[tokio::test]
async fn probe_replaces_error_but_keeps_the_message() {
    let rig = rig();
    let record = rig.add("flaky");
    rig.transport
        .fail_next_open(meshlink::error::TransportError::Closed);
    assert!(!rig
        .manager
        .connect(record.id, OpenOptions::default())
        .await
        .unwrap());
    assert_eq!(rig.status(record.id), ConnectionStatus::Error);

    rig.manager.refresh_statuses(&rig.manager.records()).await;
    let rec = rig.manager.record(record.id).unwrap();
    assert_eq!(rec.status, ConnectionStatus::Online);
    assert!(rec.error.is_some());
}

#[tokio::test]
async fn sync_demotes_records_without_a_session() {
    let rig = rig();
    let ghost = rig.add("ghost");
    rig.store
        .update(ghost.id, &mut |r| {
            r.status = ConnectionStatus::Configured;
            r.live_session_id = Some(uuid::Uuid::new_v4());
        })
        .unwrap();

    rig.manager.sync_statuses(&rig.manager.records(), None).await;
    let rec = rig.manager.record(ghost.id).unwrap();
    assert_eq!(rec.status, ConnectionStatus::Disconnected);
    assert!(rec.live_session_id.is_none());
    assert_eq!(rig.transport.opens(), 0);
}

#[tokio::test]
async fn sync_keeps_a_session_that_is_really_live() {
    let mut rig = rig();
    let live = rig.add("live");
    let manager = rig.manager.clone();
    let connecting =
        tokio::spawn(async move { manager.connect(live.id, OpenOptions::default()).await });
    let mut device = rig.next_device().await;
    answer_basic(&mut device, 2).await;
    assert!(connecting.await.unwrap().unwrap());

    rig.manager
        .sync_statuses(&rig.manager.records(), Some(live.id))
        .await;
    assert_eq!(rig.status(live.id), ConnectionStatus::Connected);

    // Not naming it only warns; the real session wins
    rig.manager.sync_statuses(&rig.manager.records(), None).await;
    assert_eq!(rig.status(live.id), ConnectionStatus::Connected);
    assert!(!device.is_closed());
}
