//! # Transport Adapters
//!
//! Every medium that can reach a Meshtastic radio is exposed through one contract:
//!
//! - [`Transport::open`] resolves the endpoint, performs medium-specific authorization
//!   (certificate trust, peripheral pairing, port exclusivity) and yields a
//!   [`TransportHandle`];
//! - [`TransportHandle::close`] releases the medium, idempotently;
//! - [`LinkEvent::Lost`] on the handle's event stream is the involuntary disconnect signal;
//! - [`Transport::probe`] is a passive reachability check that never opens a session.
//!
//! A handle moves whole protobuf payloads. Stream framing (serial), HTTP request/response
//! (network) and characteristic reads/writes (wireless) are each adapter's business.
//!
//! ```text
//!   ProtocolSession ──FrameSender──▶ outbound ──▶ adapter I/O tasks ──▶ device
//!   ProtocolSession ◀──LinkEvent──── inbound  ◀── adapter I/O tasks ◀── device
//! ```

pub mod framer;
pub mod memory;
#[cfg(feature = "network")]
pub mod network;
pub mod serial;
pub mod wireless;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::TransportError;
use crate::metrics;
use crate::registry::{Endpoint, TransportKind};

/// Per-attempt options supplied by the caller of `connect`.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Whether a user-facing authorization prompt (pairing dialog, port picker) may be shown.
    /// When false only previously authorized endpoints are attempted.
    pub allow_prompt: bool,
}

/// Result of a passive probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The device answered or the platform already grants access to it.
    Reachable,
    /// The device is definitely not there.
    Unreachable,
    /// Could not tell; the caller leaves the status unchanged.
    Inconclusive(String),
}

/// Asynchronous notifications from an open link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// One complete protobuf payload from the device.
    Frame(Bytes),
    /// The medium went away (unplugged, out of range, device stopped answering).
    Lost(String),
}

/// Outbound payload with an optional write acknowledgement.
#[derive(Debug)]
pub struct OutboundFrame {
    pub bytes: Bytes,
    pub ack: Option<oneshot::Sender<Result<(), TransportError>>>,
}

impl OutboundFrame {
    /// Completes the acknowledgement, if anyone is waiting for it.
    pub fn acknowledge(self, result: Result<(), TransportError>) {
        if let Some(ack) = self.ack {
            let _ = ack.send(result);
        }
    }
}

/// Adapter-side ends of a link, handed to the adapter's I/O tasks.
pub struct LinkEnds {
    pub outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    pub inbound: mpsc::UnboundedSender<LinkEvent>,
    pub shutdown: watch::Receiver<bool>,
}

/// Cloneable writer for a link.
#[derive(Clone, Debug)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

impl FrameSender {
    /// Queues `bytes` and waits for the adapter to report the write.
    pub async fn send(&self, bytes: Bytes) -> Result<(), TransportError> {
        self.queue(bytes)?.wait().await
    }

    /// Queues `bytes`; the returned [`PendingWrite`] resolves once the adapter wrote them.
    pub fn queue(&self, bytes: Bytes) -> Result<PendingWrite, TransportError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(OutboundFrame {
                bytes,
                ack: Some(ack_tx),
            })
            .map_err(|_| TransportError::Closed)?;
        Ok(PendingWrite { rx: ack_rx })
    }

    /// Queues `bytes` without waiting for the write.
    pub fn send_nowait(&self, bytes: Bytes) -> Result<(), TransportError> {
        self.tx
            .send(OutboundFrame { bytes, ack: None })
            .map_err(|_| TransportError::Closed)
    }
}

/// Acknowledgement of a queued write.
#[derive(Debug)]
pub struct PendingWrite {
    rx: oneshot::Receiver<Result<(), TransportError>>,
}

impl PendingWrite {
    pub async fn wait(self) -> Result<(), TransportError> {
        self.rx.await.map_err(|_| TransportError::Closed)?
    }
}

/// An open link to a device, exclusively owned by whoever opened it.
///
/// Dropping a handle signals its I/O tasks to stop; [`close`](Self::close) additionally
/// waits (bounded) for them to finish so the medium is free for the next open.
pub struct TransportHandle {
    kind: TransportKind,
    label: String,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    close_grace: Duration,
    closed: bool,
}

impl TransportHandle {
    /// Creates a handle and the adapter-side ends that feed it.
    pub fn pair(kind: TransportKind, label: impl Into<String>) -> (Self, LinkEnds) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        metrics::inc_transports_opened();
        (
            Self {
                kind,
                label: label.into(),
                outbound: out_tx,
                events: Some(in_rx),
                shutdown: shutdown_tx,
                tasks: Vec::new(),
                close_grace: Duration::from_secs(2),
                closed: false,
            },
            LinkEnds {
                outbound: out_rx,
                inbound: in_tx,
                shutdown: shutdown_rx,
            },
        )
    }

    /// Registers an adapter I/O task to be joined on close.
    pub fn attach(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Human-readable description of what is open (port path, host, peripheral).
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn sender(&self) -> FrameSender {
        FrameSender {
            tx: self.outbound.clone(),
        }
    }

    /// Takes the inbound event stream; there is exactly one consumer.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        self.events.take()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stops the adapter tasks and releases the medium. Closing twice is a no-op.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            match tokio::time::timeout(self.close_grace, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("{} I/O task ended abnormally: {}", self.kind, e),
                Err(_) => warn!(
                    "{} link {} did not stop within {:?}",
                    self.kind, self.label, self.close_grace
                ),
            }
        }
        metrics::inc_transports_closed();
        debug!("Closed {} link {}", self.kind, self.label);
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.shutdown.send(true);
            metrics::inc_transports_closed();
        }
    }
}

/// True once the handle asked its tasks to stop or was dropped.
pub fn shutdown_requested(rx: &watch::Receiver<bool>) -> bool {
    rx.has_changed().is_err() || *rx.borrow()
}

/// Resolves when shutdown is requested or the handle is gone.
pub async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Capability interface implemented by each medium.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Opens a link to `endpoint`. Authorization prompts happen only if `options.allow_prompt`.
    async fn open(
        &self,
        endpoint: &Endpoint,
        options: &OpenOptions,
    ) -> Result<TransportHandle, TransportError>;

    /// Passive reachability check; must not disturb the device or open a session.
    async fn probe(&self, endpoint: &Endpoint) -> ProbeOutcome;
}

/// The adapters available to a manager, keyed by medium.
#[derive(Clone, Default)]
pub struct TransportSet {
    adapters: HashMap<TransportKind, Arc<dyn Transport>>,
}

impl TransportSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `transport` for its kind, replacing any previous adapter.
    pub fn with(mut self, transport: Arc<dyn Transport>) -> Self {
        self.adapters.insert(transport.kind(), transport);
        self
    }

    pub fn get(&self, kind: TransportKind) -> Result<Arc<dyn Transport>, TransportError> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or(TransportError::Unavailable(kind))
    }

    pub fn kinds(&self) -> Vec<TransportKind> {
        self.adapters.keys().copied().collect()
    }
}

/// The adapters this build supports, configured from `config`. Wireless needs a platform
/// backend and is registered as unavailable.
pub fn system_transports(config: &Config) -> Result<TransportSet, TransportError> {
    let set = TransportSet::new().with(Arc::new(wireless::WirelessTransport::unsupported()));
    #[cfg(feature = "serial")]
    let set = set.with(Arc::new(serial::SerialTransport::system(
        serial::SerialSettings::from(&config.serial),
    )));
    #[cfg(feature = "network")]
    let set = set.with(Arc::new(network::NetworkTransport::new(
        network::NetworkSettings::from_config(config),
    )?));
    debug!("Transports available: {:?}", set.kinds());
    Ok(set)
}

pub(crate) fn mismatch(expected: TransportKind, endpoint: &Endpoint) -> TransportError {
    TransportError::EndpointMismatch {
        expected,
        endpoint: endpoint.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_is_idempotent_and_stops_tasks() {
        let (mut handle, ends) = TransportHandle::pair(TransportKind::Serial, "test");
        let LinkEnds {
            mut shutdown,
            outbound,
            ..
        } = ends;
        drop(outbound);
        let task = tokio::spawn(async move {
            wait_shutdown(&mut shutdown).await;
        });
        handle.attach(task);
        handle.close().await;
        assert!(handle.is_closed());
        handle.close().await;
        assert!(handle.sender().send(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn drop_signals_shutdown() {
        let (handle, ends) = TransportHandle::pair(TransportKind::Network, "test");
        assert!(!shutdown_requested(&ends.shutdown));
        drop(handle);
        assert!(shutdown_requested(&ends.shutdown));
    }

    #[test]
    fn missing_adapter_is_unavailable() {
        let set = TransportSet::new();
        assert!(matches!(
            set.get(TransportKind::Wireless),
            Err(TransportError::Unavailable(TransportKind::Wireless))
        ));
    }
}
