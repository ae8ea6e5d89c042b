mod common;

use common::{fast_settings, wait_for, WAIT};
use meshlink::manager::ConnectionManager;
use meshlink::protocol::proto::{from_radio, to_radio, FromRadio, MyNodeInfo, ToRadio};
use meshlink::protocol::HandshakeStage;
use meshlink::registry::{ConnectionStatus, Endpoint, MemoryRecordStore};
use meshlink::transport::framer::{encode_frame, StreamFramer};
use meshlink::transport::serial::{
    PortDescriptor, PortOpenError, PortOpener, SerialIo, SerialSettings, SerialTransport,
};
use meshlink::transport::{LinkEvent, OpenOptions, Transport, TransportSet};
use prost::Message;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const PORT: &str = "/dev/ttyACM0";

/// A radio behind a serial line that answers both handshake stages.
#[derive(Default)]
struct RadioState {
    framer: StreamFramer,
    pending: VecDeque<u8>,
}

#[derive(Clone, Default)]
struct SimRadio {
    state: Arc<Mutex<RadioState>>,
}

impl SimRadio {
    fn answer(state: &mut RadioState, msg: FromRadio) {
        if let Some(frame) = encode_frame(&msg.encode_to_vec()) {
            state.pending.extend(frame);
        }
    }
}

impl Read for SimRadio {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.pending.is_empty() {
                let n = buf.len().min(state.pending.len());
                for (slot, byte) in buf.iter_mut().zip(state.pending.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
        }
        std::thread::sleep(Duration::from_millis(5));
        Err(io::Error::new(io::ErrorKind::TimedOut, "timeout"))
    }
}

impl Write for SimRadio {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        state.framer.push(buf);
        while let Some(frame) = state.framer.next_frame() {
            let Ok(msg) = ToRadio::decode(frame.as_ref()) else {
                continue;
            };
            if let Some(to_radio::PayloadVariant::WantConfigId(id)) = msg.payload_variant {
                if id == HandshakeStage::Basic.config_id() {
                    Self::answer(
                        &mut state,
                        FromRadio::with(from_radio::PayloadVariant::MyInfo(MyNodeInfo {
                            my_node_num: 0x5e71a1,
                        })),
                    );
                }
                Self::answer(
                    &mut state,
                    FromRadio::with(from_radio::PayloadVariant::ConfigCompleteId(id)),
                );
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialIo for SimRadio {
    fn try_clone_io(&self) -> io::Result<Box<dyn SerialIo>> {
        Ok(Box::new(self.clone()))
    }
}

#[derive(Default)]
struct SimOpener {
    opens: AtomicUsize,
    failures: Mutex<VecDeque<PortOpenError>>,
}

impl PortOpener for SimOpener {
    fn open(&self, _: &str, _: u32, _: Duration) -> Result<Box<dyn SerialIo>, PortOpenError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(Box::new(SimRadio::default()))
    }

    fn available(&self) -> Vec<PortDescriptor> {
        vec![PortDescriptor {
            path: PORT.to_string(),
            vendor_id: Some(0x10c4),
            product_id: Some(0xea60),
            product: Some("CP2102".to_string()),
        }]
    }
}

fn settings() -> SerialSettings {
    SerialSettings {
        baud_rate: 115200,
        reopen_delay: Duration::from_millis(10),
        release_timeout: Duration::from_millis(500),
        read_timeout: Duration::from_millis(5),
    }
}

fn serial(path: &str) -> Endpoint {
    Endpoint::Serial {
        path: path.to_string(),
        vendor_id: None,
        product_id: None,
        baud_rate: None,
    }
}

fn manager_with(opener: Arc<SimOpener>) -> ConnectionManager {
    let transport = SerialTransport::new(opener, settings());
    ConnectionManager::new(
        Arc::new(MemoryRecordStore::new()),
        TransportSet::new().with(Arc::new(transport)),
        fast_settings(),
    )
}

#[tokio::test]
async fn second_record_on_the_same_port_evicts_the_first() {
    let opener = Arc::new(SimOpener::default());
    let manager = manager_with(opener.clone());
    let first = manager.add_record("desk", serial(PORT)).unwrap();
    let second = manager.add_record("desk again", serial(PORT)).unwrap();

    assert!(manager
        .connect(first.id, OpenOptions::default())
        .await
        .unwrap());
    assert_eq!(manager.record(first.id).unwrap().node_num, Some(0x5e71a1));

    assert!(tokio::time::timeout(WAIT, manager.connect(second.id, OpenOptions::default()))
        .await
        .unwrap()
        .unwrap());
    wait_for(&manager, first.id, ConnectionStatus::Disconnected).await;
    assert!(manager.record(second.id).unwrap().status.is_established());
    assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
    manager.shutdown().await;
}

#[tokio::test]
async fn port_locked_by_another_program_is_an_exclusive_access_error() {
    let opener = Arc::new(SimOpener::default());
    opener.failures.lock().unwrap().extend([
        PortOpenError::Locked("Device or resource busy".into()),
        PortOpenError::Locked("Device or resource busy".into()),
    ]);
    let manager = manager_with(opener.clone());
    let record = manager.add_record("busy", serial(PORT)).unwrap();

    assert!(!manager
        .connect(record.id, OpenOptions::default())
        .await
        .unwrap());
    let rec = manager.record(record.id).unwrap();
    assert_eq!(rec.status, ConnectionStatus::Error);
    assert!(rec
        .error
        .unwrap()
        .contains("locked by another application"));
    assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn a_single_lock_is_retried() {
    let opener = Arc::new(SimOpener::default());
    opener
        .failures
        .lock()
        .unwrap()
        .push_back(PortOpenError::Locked("busy".into()));
    let manager = manager_with(opener.clone());
    let record = manager.add_record("retry", serial(PORT)).unwrap();

    assert!(manager
        .connect(record.id, OpenOptions::default())
        .await
        .unwrap());
    assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
    manager.shutdown().await;
}

#[tokio::test]
async fn evicted_handle_reports_link_loss_and_releases_its_streams() {
    let opener = Arc::new(SimOpener::default());
    let transport = SerialTransport::new(opener, settings());
    let mut first = transport
        .open(&serial(PORT), &OpenOptions::default())
        .await
        .unwrap();
    let mut first_events = first.take_events().unwrap();
    assert_eq!(transport.active_streams(PORT), 2);

    let mut second = transport
        .open(&serial(PORT), &OpenOptions::default())
        .await
        .unwrap();
    let lost = tokio::time::timeout(WAIT, first_events.recv())
        .await
        .unwrap()
        .unwrap();
    match lost {
        LinkEvent::Lost(reason) => assert!(reason.contains("reopened")),
        other => panic!("expected link loss, got {:?}", other),
    }
    assert_eq!(transport.active_streams(PORT), 2);

    first.close().await;
    second.close().await;
    assert_eq!(transport.active_streams(PORT), 0);
}

#[tokio::test]
async fn probe_reports_only_exposed_ports() {
    let transport = SerialTransport::new(Arc::new(SimOpener::default()), settings());
    assert_eq!(
        transport.probe(&serial(PORT)).await,
        meshlink::transport::ProbeOutcome::Reachable
    );
    assert_eq!(
        transport.probe(&serial("/dev/ttyUSB9")).await,
        meshlink::transport::ProbeOutcome::Unreachable
    );
}
