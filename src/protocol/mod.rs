//! # Protocol Session
//!
//! Runs the Meshtastic client API on top of an open [`TransportHandle`]:
//!
//! 1. request the **basic** configuration stream (`want_config_id` = [`HandshakeStage::Basic`]);
//! 2. when the device echoes that id in `config_complete_id`, report stage-1 complete and
//!    request the **full sync** stream (node database, channels);
//! 3. when the second id is echoed, report stage-2 complete;
//! 4. from then on, forward application packets.
//!
//! An unanswered stage request is re-sent on a fixed cadence. Everything the device sends
//! becomes a [`SessionEvent`] on a single channel, so the consumer observes events in
//! wire order. The session knows nothing about records or statuses.

pub mod proto;

use bytes::Bytes;
use log::{debug, trace, warn};
use prost::Message;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::error::TransportError;
use crate::logutil::hex_snippet;
use crate::registry::RecordId;
use crate::transport::{FrameSender, LinkEvent, PendingWrite, TransportHandle};
use proto::{from_radio::PayloadVariant, FromRadio, ToRadio};

/// The two sequential milestones of the configuration handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeStage {
    /// Device identity and basic settings loaded.
    Basic,
    /// Full node/peer database synchronized.
    FullSync,
}

const BASIC_CONFIG_ID: u32 = 69420;
const FULL_SYNC_CONFIG_ID: u32 = 69421;

impl HandshakeStage {
    /// The `want_config_id` nonce that selects this stage's stream.
    pub fn config_id(self) -> u32 {
        match self {
            HandshakeStage::Basic => BASIC_CONFIG_ID,
            HandshakeStage::FullSync => FULL_SYNC_CONFIG_ID,
        }
    }

    pub fn from_config_id(id: u32) -> Option<Self> {
        match id {
            BASIC_CONFIG_ID => Some(HandshakeStage::Basic),
            FULL_SYNC_CONFIG_ID => Some(HandshakeStage::FullSync),
            _ => None,
        }
    }

    fn next(self) -> Option<Self> {
        match self {
            HandshakeStage::Basic => Some(HandshakeStage::FullSync),
            HandshakeStage::FullSync => None,
        }
    }
}

/// Which part of the configuration stream a fragment belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFragment {
    Config,
    ModuleConfig,
    Channel,
    NodeInfo,
    Metadata,
}

/// Typed notifications from a running session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The device reported its own node number.
    Identity { node_num: u32 },
    ConfigFragment(ConfigFragment),
    HandshakeStageComplete(HandshakeStage),
    /// An application packet (still encoded).
    Packet(Bytes),
    /// A handshake request could not be written.
    HandshakeFailed(String),
    /// The link is gone; no further events follow.
    LinkLost(String),
}

/// Timing knobs for the handshake driver.
#[derive(Debug, Clone)]
pub struct SessionTuning {
    /// Re-send period for an unanswered `want_config_id`.
    pub want_config_retry: Duration,
    /// How long `close` waits for the disconnect notice to be written.
    pub disconnect_grace: Duration,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            want_config_retry: Duration::from_secs(7),
            disconnect_grace: Duration::from_millis(300),
        }
    }
}

/// Cloneable outbound half of a session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    sender: FrameSender,
}

impl SessionHandle {
    /// Sends an encoded mesh packet; resolves when the transport reports the write.
    pub async fn send_application_packet(&self, packet: Bytes) -> Result<(), TransportError> {
        self.queue_application_packet(packet)?.wait().await
    }

    /// Queues an encoded mesh packet without waiting for the write.
    pub fn queue_application_packet(&self, packet: Bytes) -> Result<PendingWrite, TransportError> {
        let msg = ToRadio::packet(packet.to_vec());
        self.sender.queue(Bytes::from(msg.encode_to_vec()))
    }

    /// Sends a heartbeat with a fresh nonce and returns the nonce.
    pub async fn send_heartbeat(&self) -> Result<u32, TransportError> {
        let (nonce, pending) = self.queue_heartbeat()?;
        pending.wait().await?;
        Ok(nonce)
    }

    /// Queues a heartbeat; the nonce identifies it in device logs.
    pub fn queue_heartbeat(&self) -> Result<(u32, PendingWrite), TransportError> {
        let nonce: u32 = rand::random();
        let msg = ToRadio::heartbeat(nonce);
        let pending = self.sender.queue(Bytes::from(msg.encode_to_vec()))?;
        Ok((nonce, pending))
    }
}

/// A protocol session bound to one transport handle.
pub struct ProtocolSession {
    record_id: RecordId,
    transport: TransportHandle,
    handle: SessionHandle,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    reader: Option<JoinHandle<()>>,
    tuning: SessionTuning,
}

impl ProtocolSession {
    /// Takes ownership of `transport` and starts the handshake.
    pub fn start(
        record_id: RecordId,
        mut transport: TransportHandle,
        tuning: SessionTuning,
    ) -> Result<Self, TransportError> {
        let link = transport.take_events().ok_or(TransportError::Closed)?;
        let handle = SessionHandle {
            sender: transport.sender(),
        };
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let driver = HandshakeDriver {
            record_id,
            sender: transport.sender(),
            events: events_tx,
            awaiting: Some(HandshakeStage::Basic),
        };
        let reader = tokio::spawn(driver.run(link, tuning.want_config_retry));
        debug!(
            "Protocol session for {} started over {} link {}",
            record_id,
            transport.kind(),
            transport.label()
        );
        Ok(Self {
            record_id,
            transport,
            handle,
            events: Some(events_rx),
            reader: Some(reader),
            tuning,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// The event stream; there is exactly one consumer.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.take()
    }

    /// Tells the device we are leaving, stops the reader and closes the transport.
    /// Safe to call more than once.
    pub async fn close(&mut self) {
        if self.transport.is_closed() {
            return;
        }
        let notice = Bytes::from(ToRadio::disconnect().encode_to_vec());
        match tokio::time::timeout(self.tuning.disconnect_grace, self.handle.sender.send(notice))
            .await
        {
            Ok(Ok(())) => trace!("Sent disconnect notice for {}", self.record_id),
            Ok(Err(e)) => debug!("Disconnect notice for {} not sent: {}", self.record_id, e),
            Err(_) => debug!("Disconnect notice for {} timed out", self.record_id),
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.transport.close().await;
    }
}

impl Drop for ProtocolSession {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

struct HandshakeDriver {
    record_id: RecordId,
    sender: FrameSender,
    events: mpsc::UnboundedSender<SessionEvent>,
    awaiting: Option<HandshakeStage>,
}

impl HandshakeDriver {
    async fn run(mut self, mut link: mpsc::UnboundedReceiver<LinkEvent>, retry: Duration) {
        self.request(HandshakeStage::Basic);
        let mut resend = interval_at(Instant::now() + retry, retry);
        resend.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = link.recv() => match event {
                    Some(LinkEvent::Frame(bytes)) => {
                        if !self.on_frame(&bytes) {
                            break;
                        }
                    }
                    Some(LinkEvent::Lost(reason)) => {
                        self.emit(SessionEvent::LinkLost(reason));
                        break;
                    }
                    None => {
                        self.emit(SessionEvent::LinkLost("link closed".to_string()));
                        break;
                    }
                },
                _ = resend.tick() => {
                    if let Some(stage) = self.awaiting {
                        debug!(
                            "Resending want_config_id={} for {}",
                            stage.config_id(),
                            self.record_id
                        );
                        self.request(stage);
                    }
                }
                _ = self.events.closed() => break,
            }
        }
        trace!("Protocol reader for {} finished", self.record_id);
    }

    fn request(&self, stage: HandshakeStage) {
        let msg = ToRadio::want_config(stage.config_id());
        if let Err(e) = self.sender.send_nowait(Bytes::from(msg.encode_to_vec())) {
            self.emit(SessionEvent::HandshakeFailed(format!(
                "could not request {:?} configuration: {}",
                stage, e
            )));
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Handles one frame; returns false when the session is over.
    fn on_frame(&mut self, bytes: &Bytes) -> bool {
        let msg = match FromRadio::decode(bytes.as_ref()) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    "Undecodable FromRadio for {} ({}): {}",
                    self.record_id,
                    e,
                    hex_snippet(bytes, 32)
                );
                return true;
            }
        };
        let Some(variant) = msg.payload_variant else {
            trace!("FromRadio id={} without payload", msg.id);
            return true;
        };
        match variant {
            PayloadVariant::MyInfo(info) => self.emit(SessionEvent::Identity {
                node_num: info.my_node_num,
            }),
            PayloadVariant::ConfigCompleteId(id) => self.on_config_complete(id),
            PayloadVariant::Packet(p) => self.emit(SessionEvent::Packet(Bytes::from(p))),
            PayloadVariant::Config(_) => self.fragment(ConfigFragment::Config),
            PayloadVariant::ModuleConfig(_) => self.fragment(ConfigFragment::ModuleConfig),
            PayloadVariant::Channel(_) => self.fragment(ConfigFragment::Channel),
            PayloadVariant::NodeInfo(_) => self.fragment(ConfigFragment::NodeInfo),
            PayloadVariant::Metadata(_) => self.fragment(ConfigFragment::Metadata),
            PayloadVariant::Rebooted(_) => {
                self.emit(SessionEvent::LinkLost("device rebooted".to_string()));
                return false;
            }
            PayloadVariant::LogRecord(raw) => {
                trace!("Device log record ({} bytes)", raw.len())
            }
            PayloadVariant::ClientNotification(raw) => {
                debug!("Device notification ({} bytes)", raw.len())
            }
        }
        true
    }

    fn fragment(&self, kind: ConfigFragment) {
        if self.awaiting.is_some() {
            self.emit(SessionEvent::ConfigFragment(kind));
        }
    }

    fn on_config_complete(&mut self, id: u32) {
        match HandshakeStage::from_config_id(id) {
            Some(stage) if self.awaiting == Some(stage) => {
                self.emit(SessionEvent::HandshakeStageComplete(stage));
                self.awaiting = stage.next();
                if let Some(next) = self.awaiting {
                    self.request(next);
                }
            }
            Some(stage) => debug!(
                "Ignoring out-of-order {:?} completion for {} (awaiting {:?})",
                stage, self.record_id, self.awaiting
            ),
            None => debug!(
                "Ignoring config_complete_id={} for {} (not ours)",
                id, self.record_id
            ),
        }
    }
}
