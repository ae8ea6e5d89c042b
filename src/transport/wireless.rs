//! Bluetooth LE transport.
//!
//! The platform GATT stack is reached through a [`PeripheralBackend`]. Builds without one
//! report the medium as unavailable. A device exposes one service with three
//! characteristics:
//!
//! - `ToRadio` (write): one protobuf per write;
//! - `FromRadio` (read): one protobuf per read, empty once drained;
//! - `FromNum` (notify): ticks whenever new `FromRadio` data is queued.
//!
//! Reads are drained once right after connecting (the handshake answer may already be
//! queued) and again on every `FromNum` notification.

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{
    mismatch, wait_shutdown, LinkEnds, LinkEvent, OpenOptions, ProbeOutcome, Transport,
    TransportHandle,
};
use crate::error::TransportError;
use crate::logutil::escape_log;
use crate::registry::{Endpoint, TransportKind};

pub const SERVICE_UUID: &str = "6ba1b218-15a8-461f-9fa8-5dcae273eafd";
pub const TORADIO_UUID: &str = "f75c76d2-129e-4dad-a1dd-7866124401e7";
pub const FROMRADIO_UUID: &str = "2c55e69e-4993-11ed-b878-0242ac120002";
pub const FROMNUM_UUID: &str = "ed9da18c-a800-4f66-a670-aa7547e34453";

/// A peripheral the platform knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralInfo {
    pub id: String,
    pub name: Option<String>,
}

/// Asynchronous notices from a connected peripheral.
#[derive(Debug, Clone)]
pub enum GattNotice {
    /// `FromNum` notified: `FromRadio` has data.
    FromNum(u32),
    Disconnected(String),
}

/// Characteristic access on a connected peripheral.
#[async_trait]
pub trait GattLink: Send + Sync {
    async fn write_to_radio(&self, payload: Bytes) -> Result<(), TransportError>;
    /// One `FromRadio` read; `None` when the queue is empty.
    async fn read_from_radio(&self) -> Result<Option<Bytes>, TransportError>;
    async fn disconnect(&self);
}

pub struct PeripheralConnection {
    pub link: Arc<dyn GattLink>,
    pub notices: mpsc::UnboundedReceiver<GattNotice>,
}

/// The platform's Bluetooth LE stack.
#[async_trait]
pub trait PeripheralBackend: Send + Sync {
    /// Peripherals this application was already granted access to; never prompts.
    async fn authorized_peripherals(&self) -> Vec<PeripheralInfo>;

    /// Shows the platform pairing/chooser prompt filtered to the mesh service.
    async fn request_peripheral(&self, service_uuid: &str) -> Option<PeripheralInfo>;

    /// Connects GATT and subscribes to `FromNum`.
    async fn connect(&self, peripheral: &PeripheralInfo)
        -> Result<PeripheralConnection, TransportError>;
}

/// Wireless implementation of [`Transport`].
#[derive(Default)]
pub struct WirelessTransport {
    backend: Option<Arc<dyn PeripheralBackend>>,
}

impl WirelessTransport {
    /// Without a backend every open fails with [`TransportError::Unavailable`].
    pub fn unsupported() -> Self {
        Self { backend: None }
    }

    pub fn new(backend: Arc<dyn PeripheralBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    async fn find_authorized(
        backend: &Arc<dyn PeripheralBackend>,
        peripheral_id: &str,
    ) -> Option<PeripheralInfo> {
        backend
            .authorized_peripherals()
            .await
            .into_iter()
            .find(|p| p.id == peripheral_id)
    }
}

#[async_trait]
impl Transport for WirelessTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Wireless
    }

    async fn open(
        &self,
        endpoint: &Endpoint,
        options: &OpenOptions,
    ) -> Result<TransportHandle, TransportError> {
        let Endpoint::Wireless { peripheral_id, .. } = endpoint else {
            return Err(mismatch(TransportKind::Wireless, endpoint));
        };
        let backend = self
            .backend
            .as_ref()
            .ok_or(TransportError::Unavailable(TransportKind::Wireless))?;

        let peripheral = match Self::find_authorized(backend, peripheral_id).await {
            Some(p) => p,
            None if options.allow_prompt => {
                info!("Requesting pairing for {}", escape_log(&endpoint.to_string()));
                match backend.request_peripheral(SERVICE_UUID).await {
                    Some(p) if p.id == *peripheral_id => p,
                    Some(other) => {
                        warn!(
                            "Operator picked {} instead of {}",
                            escape_log(&other.id),
                            escape_log(peripheral_id)
                        );
                        return Err(TransportError::AuthorizationRequired {
                            endpoint: endpoint.to_string(),
                        });
                    }
                    None => {
                        return Err(TransportError::AuthorizationRequired {
                            endpoint: endpoint.to_string(),
                        })
                    }
                }
            }
            None => {
                return Err(TransportError::AuthorizationRequired {
                    endpoint: endpoint.to_string(),
                })
            }
        };

        let PeripheralConnection { link, mut notices } = backend.connect(&peripheral).await?;
        let label = peripheral.name.clone().unwrap_or_else(|| peripheral.id.clone());
        info!("Connected to peripheral {}", escape_log(&label));

        let (mut handle, ends) = TransportHandle::pair(TransportKind::Wireless, label.clone());
        let LinkEnds {
            mut outbound,
            inbound,
            mut shutdown,
        } = ends;

        let io_link = Arc::clone(&link);
        handle.attach(tokio::spawn(async move {
            // Anything the radio queued before the first notification
            let mut drained = drain(io_link.as_ref(), &inbound).await;
            loop {
                if let Err(reason) = drained {
                    let _ = inbound.send(LinkEvent::Lost(reason));
                    break;
                }
                tokio::select! {
                    _ = wait_shutdown(&mut shutdown) => break,
                    notice = notices.recv() => match notice {
                        Some(GattNotice::FromNum(n)) => {
                            debug!("FromNum {} on {}", n, label);
                        }
                        Some(GattNotice::Disconnected(reason)) => {
                            let _ = inbound.send(LinkEvent::Lost(reason));
                            break;
                        }
                        None => {
                            let _ = inbound.send(LinkEvent::Lost("peripheral went away".to_string()));
                            break;
                        }
                    },
                    frame = outbound.recv() => {
                        let Some(frame) = frame else { break };
                        let result = io_link.write_to_radio(frame.bytes.clone()).await;
                        frame.acknowledge(result);
                    }
                }
                // A notification or a write usually means there is something to read
                drained = drain(io_link.as_ref(), &inbound).await;
            }
            io_link.disconnect().await;
        }));
        Ok(handle)
    }

    async fn probe(&self, endpoint: &Endpoint) -> ProbeOutcome {
        let Endpoint::Wireless { peripheral_id, .. } = endpoint else {
            return ProbeOutcome::Inconclusive("not a wireless endpoint".to_string());
        };
        let Some(backend) = self.backend.as_ref() else {
            return ProbeOutcome::Inconclusive("wireless is not available".to_string());
        };
        if Self::find_authorized(backend, peripheral_id).await.is_some() {
            ProbeOutcome::Reachable
        } else {
            ProbeOutcome::Unreachable
        }
    }
}

/// Reads `FromRadio` until empty.
async fn drain(
    link: &dyn GattLink,
    inbound: &mpsc::UnboundedSender<LinkEvent>,
) -> Result<(), String> {
    loop {
        match link.read_from_radio().await {
            Ok(Some(frame)) => {
                if inbound.send(LinkEvent::Frame(frame)).is_err() {
                    return Ok(());
                }
            }
            Ok(None) => return Ok(()),
            Err(e) => return Err(format!("FromRadio read failed: {}", e)),
        }
    }
}
