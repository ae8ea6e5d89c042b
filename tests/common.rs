//! Test utilities & fixtures.
//! A manager wired to an in-memory registry and one scriptable in-memory transport.
#![allow(dead_code)] // each test binary uses a different subset

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use meshlink::manager::{ConnectionManager, ManagerSettings};
use meshlink::protocol::HandshakeStage;
use meshlink::registry::{
    ConnectionRecord, ConnectionStatus, Endpoint, MemoryRecordStore, RecordId, TransportKind,
};
use meshlink::transport::memory::{MemoryDevice, MemoryTransport};
use meshlink::transport::TransportSet;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct Rig {
    pub manager: ConnectionManager,
    pub store: Arc<MemoryRecordStore>,
    pub transport: MemoryTransport,
    pub devices: mpsc::UnboundedReceiver<MemoryDevice>,
}

/// Short timers so failure paths finish quickly.
pub fn fast_settings() -> ManagerSettings {
    ManagerSettings {
        keepalive_interval: Duration::from_secs(60),
        handshake_timeout: Duration::from_secs(3),
        want_config_retry: Duration::from_secs(1),
        close_timeout: Duration::from_millis(500),
        probe_timeout: Duration::from_millis(500),
    }
}

pub fn rig() -> Rig {
    rig_with(fast_settings())
}

pub fn rig_with(settings: ManagerSettings) -> Rig {
    let (transport, devices) = MemoryTransport::new(TransportKind::Network);
    let store = Arc::new(MemoryRecordStore::new());
    let manager = ConnectionManager::new(
        store.clone(),
        TransportSet::new().with(Arc::new(transport.clone())),
        settings,
    );
    Rig {
        manager,
        store,
        transport,
        devices,
    }
}

pub fn network(host: &str) -> Endpoint {
    Endpoint::Network {
        host: host.to_string(),
        tls: false,
    }
}

impl Rig {
    pub fn add(&self, name: &str) -> ConnectionRecord {
        self.manager
            .add_record(name, network(&format!("{}.mesh", name)))
            .unwrap()
    }

    pub fn status(&self, id: RecordId) -> ConnectionStatus {
        self.manager.record(id).unwrap().status
    }

    pub async fn next_device(&mut self) -> MemoryDevice {
        tokio::time::timeout(WAIT, self.devices.recv())
            .await
            .expect("no device opened in time")
            .expect("transport dropped")
    }

    pub async fn wait_for(&self, id: RecordId, status: ConnectionStatus) {
        wait_for(&self.manager, id, status).await
    }
}

/// Polls until the record reaches `status`.
pub async fn wait_for(manager: &ConnectionManager, id: RecordId, status: ConnectionStatus) {
    let manager = manager.clone();
    tokio::time::timeout(WAIT, async move {
        loop {
            if manager.record(id).map(|r| r.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("record never reached {}", status));
}

/// Plays the device side of stage 1: wait for the basic request, report identity, complete.
pub async fn answer_basic(device: &mut MemoryDevice, node_num: u32) {
    let id = tokio::time::timeout(WAIT, device.next_want_config())
        .await
        .expect("no want_config in time")
        .expect("link closed");
    assert_eq!(id, HandshakeStage::Basic.config_id());
    device.identity(node_num);
    device.config_fragment(vec![0x08, 0x01]);
    device.complete_stage(HandshakeStage::Basic);
}

/// Waits for the full-sync request and completes it.
pub async fn answer_full_sync(device: &mut MemoryDevice) {
    let id = tokio::time::timeout(WAIT, device.next_want_config())
        .await
        .expect("no full-sync request in time")
        .expect("link closed");
    assert_eq!(id, HandshakeStage::FullSync.config_id());
    device.complete_stage(HandshakeStage::FullSync);
}

/// Every record satisfies the live-session binding rule.
pub fn assert_consistent(manager: &ConnectionManager) {
    for record in manager.records() {
        assert!(
            record.is_consistent(),
            "{} is {} with session {:?}",
            record.name,
            record.status,
            record.live_session_id
        );
    }
}
