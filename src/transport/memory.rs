//! In-process transport with a scriptable device on the other end.
//!
//! Every successful `open` yields a [`MemoryDevice`] on the channel returned by
//! [`MemoryTransport::new`]. The device sees each `ToRadio` the client writes and can answer
//! with `FromRadio` frames, complete handshake stages or drop the link. Opens can be held
//! back or made to fail, which is how the lifecycle tests race commands against an attempt
//! that is still in flight.

use async_trait::async_trait;
use bytes::Bytes;
use log::debug;
use prost::Message;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use super::{
    mismatch, shutdown_requested, wait_shutdown, LinkEnds, LinkEvent, OpenOptions, ProbeOutcome,
    Transport, TransportHandle,
};
use crate::error::TransportError;
use crate::protocol::proto::{from_radio, FromRadio, MyNodeInfo, ToRadio};
use crate::protocol::HandshakeStage;
use crate::registry::{Endpoint, TransportKind};

struct Controls {
    opens: AtomicUsize,
    probes: AtomicUsize,
    fail_writes: AtomicBool,
    open_failures: Mutex<VecDeque<TransportError>>,
    probe_outcome: Mutex<ProbeOutcome>,
    probe_delay: Mutex<Duration>,
    gate: watch::Sender<bool>,
}

/// A [`Transport`] whose devices live in the same process.
#[derive(Clone)]
pub struct MemoryTransport {
    kind: TransportKind,
    controls: Arc<Controls>,
    devices: mpsc::UnboundedSender<MemoryDevice>,
}

impl MemoryTransport {
    /// Creates a transport for `kind` and the stream of devices it will open.
    pub fn new(kind: TransportKind) -> (Self, mpsc::UnboundedReceiver<MemoryDevice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (gate, _) = watch::channel(false);
        let transport = Self {
            kind,
            controls: Arc::new(Controls {
                opens: AtomicUsize::new(0),
                probes: AtomicUsize::new(0),
                fail_writes: AtomicBool::new(false),
                open_failures: Mutex::new(VecDeque::new()),
                probe_outcome: Mutex::new(ProbeOutcome::Reachable),
                probe_delay: Mutex::new(Duration::ZERO),
                gate,
            }),
            devices: tx,
        };
        (transport, rx)
    }

    /// Number of `open` calls that got past the gate.
    pub fn opens(&self) -> usize {
        self.controls.opens.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.controls.probes.load(Ordering::SeqCst)
    }

    /// Makes the next `open` fail with `err`. Queued failures are consumed in order.
    pub fn fail_next_open(&self, err: TransportError) {
        lock(&self.controls.open_failures).push_back(err);
    }

    /// Blocks subsequent opens until [`release_opens`](Self::release_opens).
    pub fn hold_opens(&self) {
        let _ = self.controls.gate.send_replace(true);
    }

    pub fn release_opens(&self) {
        let _ = self.controls.gate.send_replace(false);
    }

    /// Acknowledge every write with an error from now on.
    pub fn fail_writes(&self, fail: bool) {
        self.controls.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_probe_outcome(&self, outcome: ProbeOutcome) {
        *lock(&self.controls.probe_outcome) = outcome;
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        *lock(&self.controls.probe_delay) = delay;
    }

    async fn pass_gate(&self) {
        let mut gate = self.controls.gate.subscribe();
        while *gate.borrow_and_update() {
            if gate.changed().await.is_err() {
                return;
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn open(
        &self,
        endpoint: &Endpoint,
        _options: &OpenOptions,
    ) -> Result<TransportHandle, TransportError> {
        if endpoint.kind() != self.kind {
            return Err(mismatch(self.kind, endpoint));
        }
        self.pass_gate().await;
        self.controls.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = lock(&self.controls.open_failures).pop_front() {
            return Err(err);
        }

        let label = endpoint.to_string();
        let (mut handle, ends) = TransportHandle::pair(self.kind, label.clone());
        let LinkEnds {
            mut outbound,
            inbound,
            mut shutdown,
        } = ends;
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let device = MemoryDevice {
            label,
            requests: req_rx,
            inbound,
            shutdown: shutdown.clone(),
        };

        let controls = Arc::clone(&self.controls);
        handle.attach(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = wait_shutdown(&mut shutdown) => break,
                    frame = outbound.recv() => {
                        let Some(frame) = frame else { break };
                        if controls.fail_writes.load(Ordering::SeqCst) {
                            frame.acknowledge(Err(TransportError::Io(std::io::Error::new(
                                std::io::ErrorKind::BrokenPipe,
                                "simulated write failure",
                            ))));
                            continue;
                        }
                        let result = req_tx
                            .send(frame.bytes.clone())
                            .map_err(|_| TransportError::Closed);
                        frame.acknowledge(result);
                    }
                }
            }
        }));

        if self.devices.send(device).is_err() {
            debug!("memory device for {} has no observer", handle.label());
        }
        Ok(handle)
    }

    async fn probe(&self, _endpoint: &Endpoint) -> ProbeOutcome {
        self.controls.probes.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.controls.probe_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        lock(&self.controls.probe_outcome).clone()
    }
}

/// The device end of one opened memory link.
pub struct MemoryDevice {
    label: String,
    requests: mpsc::UnboundedReceiver<Bytes>,
    inbound: mpsc::UnboundedSender<LinkEvent>,
    shutdown: watch::Receiver<bool>,
}

impl MemoryDevice {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Next decodable `ToRadio` written by the client; `None` once the link is gone.
    pub async fn next_request(&mut self) -> Option<ToRadio> {
        loop {
            let bytes = self.requests.recv().await?;
            match ToRadio::decode(bytes.as_ref()) {
                Ok(msg) => return Some(msg),
                Err(e) => debug!("memory device ignoring undecodable frame: {}", e),
            }
        }
    }

    /// Already written requests, without waiting.
    pub fn try_next_request(&mut self) -> Option<ToRadio> {
        while let Ok(bytes) = self.requests.try_recv() {
            if let Ok(msg) = ToRadio::decode(bytes.as_ref()) {
                return Some(msg);
            }
        }
        None
    }

    /// Waits for the next `want_config_id` request, skipping anything else.
    pub async fn next_want_config(&mut self) -> Option<u32> {
        use crate::protocol::proto::to_radio::PayloadVariant;
        loop {
            if let Some(PayloadVariant::WantConfigId(id)) = self.next_request().await?.payload_variant
            {
                return Some(id);
            }
        }
    }

    pub fn send(&self, msg: FromRadio) -> bool {
        self.inbound
            .send(LinkEvent::Frame(Bytes::from(msg.encode_to_vec())))
            .is_ok()
    }

    /// Writes raw bytes as a frame, whether or not they decode.
    pub fn send_raw(&self, bytes: impl Into<Bytes>) -> bool {
        self.inbound.send(LinkEvent::Frame(bytes.into())).is_ok()
    }

    pub fn identity(&self, node_num: u32) -> bool {
        self.send(FromRadio::with(from_radio::PayloadVariant::MyInfo(
            MyNodeInfo {
                my_node_num: node_num,
            },
        )))
    }

    pub fn config_fragment(&self, payload: Vec<u8>) -> bool {
        self.send(FromRadio::with(from_radio::PayloadVariant::Config(payload)))
    }

    pub fn complete_stage(&self, stage: HandshakeStage) -> bool {
        self.send(FromRadio::with(
            from_radio::PayloadVariant::ConfigCompleteId(stage.config_id()),
        ))
    }

    pub fn reboot(&self) -> bool {
        self.send(FromRadio::with(from_radio::PayloadVariant::Rebooted(true)))
    }

    /// Simulates the medium going away.
    pub fn drop_link(&self, reason: &str) -> bool {
        self.inbound.send(LinkEvent::Lost(reason.to_string())).is_ok()
    }

    /// True once the client closed or dropped the handle.
    pub fn is_closed(&self) -> bool {
        shutdown_requested(&self.shutdown)
    }

    /// Resolves once the client closed or dropped the handle.
    pub async fn closed(&mut self) {
        wait_shutdown(&mut self.shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::Network {
            host: "radio.test".into(),
            tls: false,
        }
    }

    #[tokio::test]
    async fn writes_reach_the_device() {
        let (transport, mut devices) = MemoryTransport::new(TransportKind::Network);
        let handle = transport
            .open(&endpoint(), &OpenOptions::default())
            .await
            .unwrap();
        let mut device = devices.recv().await.unwrap();
        handle
            .sender()
            .send(Bytes::from(ToRadio::want_config(7).encode_to_vec()))
            .await
            .unwrap();
        assert_eq!(device.next_want_config().await, Some(7));
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test]
    async fn queued_failure_is_returned_once() {
        let (transport, _devices) = MemoryTransport::new(TransportKind::Network);
        transport.fail_next_open(TransportError::Closed);
        assert!(transport
            .open(&endpoint(), &OpenOptions::default())
            .await
            .is_err());
        assert!(transport
            .open(&endpoint(), &OpenOptions::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn wrong_endpoint_kind_is_rejected() {
        let (transport, _devices) = MemoryTransport::new(TransportKind::Serial);
        let err = transport
            .open(&endpoint(), &OpenOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::EndpointMismatch { .. }));
        assert_eq!(transport.opens(), 0);
    }

    #[tokio::test]
    async fn device_sees_close() {
        let (transport, mut devices) = MemoryTransport::new(TransportKind::Network);
        let mut handle = transport
            .open(&endpoint(), &OpenOptions::default())
            .await
            .unwrap();
        let device = devices.recv().await.unwrap();
        assert!(!device.is_closed());
        handle.close().await;
        assert!(device.is_closed());
    }
}
