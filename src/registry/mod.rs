//! # Connection Registry
//!
//! Durable records describing each logical device connection: which medium it uses,
//! how to reach the device, and the last lifecycle status the manager wrote.
//!
//! The manager is the only writer of the lifecycle fields (`status`, `error`,
//! `last_connected_at`, `live_session_id`); user commands write identity fields
//! (`name`, `endpoint`, `is_default`). Both paths are serialized per record by the
//! manager before they reach a [`RecordStore`].
//!
//! ## Persistence
//!
//! ```json
//! [
//!   {
//!     "id": "8d3c7c1e-...",
//!     "name": "Rooftop node",
//!     "endpoint": { "kind": "network", "host": "meshtastic.local", "tls": true },
//!     "status": "disconnected",
//!     "is_default": true
//!   }
//! ]
//! ```
//!
//! `live_session_id` is never written to disk. Records are hydrated with any active
//! status forced back to `disconnected` until the manager reconciles them.

mod file;

pub use file::JsonRecordStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::RegistryError;

/// Stable identifier of a connection record.
pub type RecordId = Uuid;

/// Identifier of one bound live session; a fresh one is minted per connect attempt.
pub type SessionId = Uuid;

/// Physical medium used to reach the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Network,
    Wireless,
    Serial,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Network => "network",
            TransportKind::Wireless => "wireless",
            TransportKind::Serial => "serial",
        })
    }
}

/// Transport-specific addressing of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Endpoint {
    /// Host name or address of a device running the HTTP API.
    Network {
        host: String,
        #[serde(default)]
        tls: bool,
    },
    /// A previously paired Bluetooth LE peripheral.
    Wireless {
        peripheral_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// A USB/UART serial device. `path` may be empty when the port is found by USB ids.
    Serial {
        #[serde(default)]
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        vendor_id: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        product_id: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        baud_rate: Option<u32>,
    },
}

impl Endpoint {
    pub fn kind(&self) -> TransportKind {
        match self {
            Endpoint::Network { .. } => TransportKind::Network,
            Endpoint::Wireless { .. } => TransportKind::Wireless,
            Endpoint::Serial { .. } => TransportKind::Serial,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Network { host, .. } => f.write_str(host),
            Endpoint::Wireless {
                name: Some(name), ..
            } => f.write_str(name),
            Endpoint::Wireless { peripheral_id, .. } => f.write_str(peripheral_id),
            Endpoint::Serial {
                path,
                vendor_id,
                product_id,
                ..
            } => {
                if !path.is_empty() {
                    f.write_str(path)
                } else {
                    match (vendor_id, product_id) {
                        (Some(v), Some(p)) => write!(f, "usb {:04x}:{:04x}", v, p),
                        _ => f.write_str("serial device"),
                    }
                }
            }
        }
    }
}

/// Lifecycle status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    /// Passive probe found the device reachable; no session exists.
    Online,
    Connecting,
    Configuring,
    Connected,
    Configured,
    Error,
}

impl ConnectionStatus {
    /// True for the states that require a bound live session.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connecting
                | ConnectionStatus::Configuring
                | ConnectionStatus::Connected
                | ConnectionStatus::Configured
        )
    }

    /// Stage-1 of the handshake has completed.
    pub fn is_established(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connected | ConnectionStatus::Configured
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Online => "online",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Configuring => "configuring",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Configured => "configured",
            ConnectionStatus::Error => "error",
        })
    }
}

/// Identity and durable state of one logical connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: RecordId,
    pub name: String,
    pub endpoint: Endpoint,
    #[serde(default)]
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Device node number reported during the last handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_num: Option<u32>,
    /// Present iff `status.is_active()`; never persisted.
    #[serde(skip)]
    pub live_session_id: Option<SessionId>,
}

impl ConnectionRecord {
    pub fn new(name: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            endpoint,
            status: ConnectionStatus::Disconnected,
            error: None,
            is_default: false,
            last_connected_at: None,
            node_num: None,
            live_session_id: None,
        }
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.endpoint.kind()
    }

    /// Checks the live-session invariant: a session is bound iff the status is active.
    pub fn is_consistent(&self) -> bool {
        self.live_session_id.is_some() == self.status.is_active()
    }

    /// Forces a non-active status, used when hydrating from disk.
    pub(crate) fn hydrate(&mut self) {
        self.live_session_id = None;
        if self.status.is_active() || self.status == ConnectionStatus::Online {
            self.status = ConnectionStatus::Disconnected;
        }
    }
}

/// Persisted record store. Implementations serialize their own internal access;
/// per-record ordering is the manager's responsibility.
pub trait RecordStore: Send + Sync {
    fn list(&self) -> Vec<ConnectionRecord>;

    fn get(&self, id: RecordId) -> Option<ConnectionRecord>;

    fn insert(&self, record: ConnectionRecord) -> Result<(), RegistryError>;

    /// Applies `apply` to the record and persists it, returning the updated copy.
    fn update(
        &self,
        id: RecordId,
        apply: &mut dyn FnMut(&mut ConnectionRecord),
    ) -> Result<ConnectionRecord, RegistryError>;

    /// Like [`update`](Self::update), but a change that cannot be persisted is kept in
    /// memory anyway and reaches disk with the next successful write. Only for changes a
    /// reload would reproduce, such as dropping to a non-active status.
    fn update_retained(
        &self,
        id: RecordId,
        apply: &mut dyn FnMut(&mut ConnectionRecord),
    ) -> Result<ConnectionRecord, RegistryError> {
        self.update(id, apply)
    }

    /// Deletes the record; returns whether it existed.
    fn remove(&self, id: RecordId) -> Result<bool, RegistryError>;

    /// Marks `id` as the default and clears the flag on every other record.
    fn set_default(&self, id: RecordId) -> Result<(), RegistryError>;
}

/// Shared record operations over a plain vector; both stores delegate here.
pub(crate) fn apply_update(
    records: &mut [ConnectionRecord],
    id: RecordId,
    apply: &mut dyn FnMut(&mut ConnectionRecord),
) -> Result<ConnectionRecord, RegistryError> {
    let record = records
        .iter_mut()
        .find(|r| r.id == id)
        .ok_or(RegistryError::NotFound(id))?;
    apply(record);
    Ok(record.clone())
}

pub(crate) fn apply_default(
    records: &mut [ConnectionRecord],
    id: RecordId,
) -> Result<(), RegistryError> {
    if !records.iter().any(|r| r.id == id) {
        return Err(RegistryError::NotFound(id));
    }
    for record in records.iter_mut() {
        record.is_default = record.id == id;
    }
    Ok(())
}

/// Volatile store; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<Vec<ConnectionRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store, applying the same hydration rules as a file load.
    pub fn with_records(records: Vec<ConnectionRecord>) -> Self {
        let records = records
            .into_iter()
            .map(|mut r| {
                r.hydrate();
                r
            })
            .collect();
        Self {
            records: Mutex::new(records),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ConnectionRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RecordStore for MemoryRecordStore {
    fn list(&self) -> Vec<ConnectionRecord> {
        self.lock().clone()
    }

    fn get(&self, id: RecordId) -> Option<ConnectionRecord> {
        self.lock().iter().find(|r| r.id == id).cloned()
    }

    fn insert(&self, record: ConnectionRecord) -> Result<(), RegistryError> {
        let mut records = self.lock();
        if records.iter().any(|r| r.id == record.id) {
            return Err(RegistryError::Duplicate(record.id));
        }
        records.push(record);
        Ok(())
    }

    fn update(
        &self,
        id: RecordId,
        apply: &mut dyn FnMut(&mut ConnectionRecord),
    ) -> Result<ConnectionRecord, RegistryError> {
        apply_update(&mut self.lock(), id, apply)
    }

    fn remove(&self, id: RecordId) -> Result<bool, RegistryError> {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|r| r.id != id);
        Ok(records.len() != before)
    }

    fn set_default(&self, id: RecordId) -> Result<(), RegistryError> {
        apply_default(&mut self.lock(), id)
    }
}
