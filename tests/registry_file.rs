mod common;

use common::{answer_basic, fast_settings, network, WAIT};
use meshlink::manager::ConnectionManager;
use meshlink::registry::{ConnectionStatus, JsonRecordStore, RecordStore, TransportKind};
use meshlink::transport::memory::MemoryTransport;
use meshlink::transport::{OpenOptions, TransportSet};
use std::sync::Arc;

#[tokio::test]
async fn records_survive_a_restart_as_disconnected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data").join("connections.json");
    let (transport, mut devices) = MemoryTransport::new(TransportKind::Network);

    let id = {
        let store = Arc::new(JsonRecordStore::open(&path).unwrap());
        let manager = ConnectionManager::new(
            store,
            TransportSet::new().with(Arc::new(transport.clone())),
            fast_settings(),
        );
        let record = manager.add_record("base", network("10.1.1.9")).unwrap();
        manager.set_default(record.id).await.unwrap();
        let connecting = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect(record.id, OpenOptions::default()).await })
        };
        let mut device = tokio::time::timeout(WAIT, devices.recv())
            .await
            .unwrap()
            .unwrap();
        answer_basic(&mut device, 0x1234).await;
        assert!(connecting.await.unwrap().unwrap());

        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(on_disk.contains("\"connected\""));
        assert!(!on_disk.contains("live_session_id"));
        // Simulates a crash: nothing gets to write `disconnected`
        record.id
    };

    let reopened = JsonRecordStore::open(&path).unwrap();
    let record = reopened.get(id).unwrap();
    assert_eq!(record.status, ConnectionStatus::Disconnected);
    assert!(record.live_session_id.is_none());
    assert!(record.is_default);
    assert_eq!(record.node_num, Some(0x1234));
    assert!(record.last_connected_at.is_some());
}

#[tokio::test]
async fn removal_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("connections.json");
    let (transport, _devices) = MemoryTransport::new(TransportKind::Network);
    let manager = ConnectionManager::new(
        Arc::new(JsonRecordStore::open(&path).unwrap()),
        TransportSet::new().with(Arc::new(transport)),
        fast_settings(),
    );
    let keep = manager.add_record("keep", network("a.local")).unwrap();
    let drop = manager.add_record("drop", network("b.local")).unwrap();
    manager.remove(drop.id).await.unwrap();

    let ids: Vec<_> = JsonRecordStore::open(&path)
        .unwrap()
        .list()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![keep.id]);
}

#[tokio::test]
async fn disconnect_sticks_when_the_registry_cannot_be_written() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let path = data.join("connections.json");
    let (transport, mut devices) = MemoryTransport::new(TransportKind::Network);
    let manager = ConnectionManager::new(
        Arc::new(JsonRecordStore::open(&path).unwrap()),
        TransportSet::new().with(Arc::new(transport)),
        fast_settings(),
    );
    let record = manager.add_record("cellar", network("10.1.1.10")).unwrap();
    let connecting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect(record.id, OpenOptions::default()).await })
    };
    let mut device = tokio::time::timeout(WAIT, devices.recv())
        .await
        .unwrap()
        .unwrap();
    answer_basic(&mut device, 0x77).await;
    assert!(connecting.await.unwrap().unwrap());

    std::fs::remove_dir_all(&data).unwrap();
    std::fs::write(&data, "in the way").unwrap();

    tokio_test::assert_ok!(manager.disconnect(record.id).await);
    let rec = manager.record(record.id).unwrap();
    assert_eq!(rec.status, ConnectionStatus::Disconnected);
    assert!(rec.live_session_id.is_none());
    assert!(rec.is_consistent());
    assert!(manager.live_summary(record.id).await.unwrap().is_none());
    tokio::time::timeout(WAIT, device.closed()).await.unwrap();
}
