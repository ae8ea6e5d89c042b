//! # Connection Lifecycle Manager
//!
//! Maps each connection record to its live resources and drives the record through
//! `connecting → configuring → connected → configured` (or `error`/`disconnected`).
//!
//! ## Concurrency
//!
//! Every record gets its own worker task with its own command queue (see `worker`).
//! Commands for different records never wait on each other; commands for the same record
//! are applied strictly in order, together with the session events and timer ticks of
//! that record's live session. Passive probes run concurrently and only their results go
//! through the record's queue, where they are discarded if a session became active
//! meanwhile.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshlink::manager::{ConnectionManager, ManagerSettings};
//! use meshlink::registry::{Endpoint, MemoryRecordStore};
//! use meshlink::transport::{OpenOptions, TransportSet};
//!
//! # async fn demo(transports: TransportSet) -> anyhow::Result<()> {
//! let manager = ConnectionManager::new(
//!     Arc::new(MemoryRecordStore::new()),
//!     transports,
//!     ManagerSettings::default(),
//! );
//! let record = manager.add_record(
//!     "Rooftop",
//!     Endpoint::Network { host: "meshtastic.local".into(), tls: true },
//! )?;
//! let _sub = manager.subscribe(|| println!("status changed"));
//! if manager.connect(record.id, OpenOptions::default()).await? {
//!     println!("connected");
//! }
//! # Ok(())
//! # }
//! ```

mod live;
mod observer;
mod worker;

pub use live::LiveSummary;
pub use observer::Subscription;

use bytes::Bytes;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use crate::config::ManagerConfig;
use crate::error::ConnectionError;
use crate::protocol::SessionTuning;
use crate::registry::{ConnectionRecord, Endpoint, RecordId, RecordStore};
use crate::transport::{OpenOptions, ProbeOutcome, TransportSet};
use observer::Observers;
use worker::{Command, Worker};

/// Timing used by the manager and its sessions.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub keepalive_interval: Duration,
    /// Bound on reaching `connected` once the transport is open.
    pub handshake_timeout: Duration,
    pub want_config_retry: Duration,
    pub close_timeout: Duration,
    pub probe_timeout: Duration,
}

impl ManagerSettings {
    pub fn from_config(cfg: &ManagerConfig) -> Self {
        Self {
            keepalive_interval: Duration::from_secs(cfg.keepalive_interval_secs.max(1)),
            handshake_timeout: Duration::from_secs(cfg.handshake_timeout_secs),
            want_config_retry: Duration::from_secs(cfg.want_config_retry_secs.max(1)),
            close_timeout: Duration::from_millis(cfg.close_timeout_ms),
            probe_timeout: Duration::from_millis(cfg.probe_timeout_ms),
        }
    }

    pub(crate) fn session_tuning(&self) -> SessionTuning {
        SessionTuning {
            want_config_retry: self.want_config_retry,
            ..SessionTuning::default()
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self::from_config(&ManagerConfig::default())
    }
}

/// State every worker reads.
pub(crate) struct Shared {
    pub(crate) store: Arc<dyn RecordStore>,
    pub(crate) transports: TransportSet,
    pub(crate) settings: ManagerSettings,
    pub(crate) observers: Observers,
}

/// Handle to the connection manager. Cheap to clone; all clones drive the same records.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
    workers: Arc<Mutex<HashMap<RecordId, mpsc::UnboundedSender<Command>>>>,
}

impl ConnectionManager {
    pub fn new(
        store: Arc<dyn RecordStore>,
        transports: TransportSet,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                transports,
                settings,
                observers: Observers::default(),
            }),
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.shared.settings
    }

    fn lock_workers(&self) -> MutexGuard<'_, HashMap<RecordId, mpsc::UnboundedSender<Command>>> {
        self.workers.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn worker(&self, id: RecordId) -> mpsc::UnboundedSender<Command> {
        let mut workers = self.lock_workers();
        if let Some(tx) = workers.get(&id) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        workers.retain(|_, tx| !tx.is_closed());
        let tx = Worker::spawn(id, Arc::clone(&self.shared));
        workers.insert(id, tx.clone());
        tx
    }

    fn has_worker(&self, id: RecordId) -> bool {
        self.lock_workers()
            .get(&id)
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    fn forget(&self, id: RecordId, tx: &mpsc::UnboundedSender<Command>) {
        let mut workers = self.lock_workers();
        if workers.get(&id).map(|t| t.same_channel(tx)).unwrap_or(false) {
            workers.remove(&id);
        }
    }

    /// Number of record workers still running.
    pub fn active_workers(&self) -> usize {
        let mut workers = self.lock_workers();
        workers.retain(|_, tx| !tx.is_closed());
        workers.len()
    }

    /// Delivers a command to the record's worker and waits for its answer. A worker that
    /// exited (after a removal) is replaced once. Unknown records never get a worker.
    async fn request<T, F>(&self, id: RecordId, make: F) -> Result<T, ConnectionError>
    where
        F: Fn(oneshot::Sender<Result<T, ConnectionError>>) -> Command,
    {
        for _ in 0..2 {
            if self.shared.store.get(id).is_none() && !self.has_worker(id) {
                return Err(ConnectionError::RecordNotFound(id));
            }
            let tx = self.worker(id);
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx.send(make(reply_tx)).is_err() {
                self.forget(id, &tx);
                continue;
            }
            match reply_rx.await {
                Ok(result) => return result,
                Err(_) => self.forget(id, &tx),
            }
        }
        Err(ConnectionError::ManagerStopped)
    }

    /// Starts (or joins) a connection attempt. Resolves `true` once the record reaches
    /// `connected`, `false` if the attempt ends in `error` or `disconnected` first.
    pub async fn connect(
        &self,
        id: RecordId,
        options: OpenOptions,
    ) -> Result<bool, ConnectionError> {
        self.request(id, |reply| Command::Connect {
            options: options.clone(),
            reply,
        })
        .await
    }

    /// Tears down any live session and leaves the record `disconnected`. Idempotent.
    pub async fn disconnect(&self, id: RecordId) -> Result<(), ConnectionError> {
        self.request(id, |reply| Command::Disconnect { reply }).await
    }

    /// Disconnects, then deletes the record.
    pub async fn remove(&self, id: RecordId) -> Result<(), ConnectionError> {
        let result = self.request(id, |reply| Command::Remove { reply }).await;
        let stale = self.lock_workers().get(&id).cloned();
        if let Some(tx) = stale.filter(|tx| tx.is_closed()) {
            self.forget(id, &tx);
        }
        result
    }

    /// Marks the record as the default. No transport effect.
    pub async fn set_default(&self, id: RecordId) -> Result<(), ConnectionError> {
        self.request(id, |reply| Command::SetDefault { reply }).await
    }

    pub async fn rename(
        &self,
        id: RecordId,
        name: impl Into<String>,
    ) -> Result<ConnectionRecord, ConnectionError> {
        let name = name.into();
        self.request(id, |reply| Command::Rename {
            name: name.clone(),
            reply,
        })
        .await
    }

    /// Creates and persists a new `disconnected` record.
    pub fn add_record(
        &self,
        name: impl Into<String>,
        endpoint: Endpoint,
    ) -> Result<ConnectionRecord, ConnectionError> {
        let record = ConnectionRecord::new(name, endpoint);
        self.shared.store.insert(record.clone())?;
        info!("Added connection {} ({})", record.id, record.endpoint);
        self.shared.observers.notify();
        Ok(record)
    }

    pub fn records(&self) -> Vec<ConnectionRecord> {
        self.shared.store.list()
    }

    pub fn record(&self, id: RecordId) -> Option<ConnectionRecord> {
        self.shared.store.get(id)
    }

    /// Sends an encoded mesh packet over the record's session; resolves on the write ack.
    pub async fn send_packet(&self, id: RecordId, packet: Bytes) -> Result<(), ConnectionError> {
        self.request(id, |reply| Command::SendPacket {
            packet: packet.clone(),
            reply,
        })
        .await
    }

    /// The record's live resources, if a session is bound.
    pub async fn live_summary(&self, id: RecordId) -> Result<Option<LiveSummary>, ConnectionError> {
        self.request(id, |reply| Command::Inspect { reply }).await
    }

    /// Probes every idle record in `records` concurrently and records `online` or
    /// `disconnected`. Records with an active status are skipped; inconclusive probes
    /// leave the status alone.
    pub async fn refresh_statuses(&self, records: &[ConnectionRecord]) {
        let mut probes = JoinSet::new();
        for record in records {
            let Some(current) = self.shared.store.get(record.id) else {
                continue;
            };
            if current.status.is_active() {
                debug!("Skipping probe of {}: {}", current.id, current.status);
                continue;
            }
            let transport = match self.shared.transports.get(current.transport_kind()) {
                Ok(t) => t,
                Err(e) => {
                    debug!("Skipping probe of {}: {}", current.id, e);
                    continue;
                }
            };
            let manager = self.clone();
            let limit = self.shared.settings.probe_timeout;
            probes.spawn(async move {
                let outcome = match tokio::time::timeout(limit, transport.probe(&current.endpoint))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => ProbeOutcome::Inconclusive(format!("no answer within {:?}", limit)),
                };
                debug!("Probe of {}: {:?}", current.id, outcome);
                if let Err(e) = manager
                    .request(current.id, |reply| Command::Probed {
                        outcome: outcome.clone(),
                        reply,
                    })
                    .await
                {
                    debug!("Probe result for {} not applied: {}", current.id, e);
                }
            });
        }
        while let Some(joined) = probes.join_next().await {
            if let Err(e) = joined {
                warn!("Probe task failed: {}", e);
            }
        }
    }

    /// Reconciles stored statuses with the sessions this manager really holds: any record
    /// claiming an active status without a live session is demoted to `disconnected`.
    /// `active_id` names the record the caller believes is live.
    pub async fn sync_statuses(&self, records: &[ConnectionRecord], active_id: Option<RecordId>) {
        for record in records {
            let designated = active_id == Some(record.id);
            if let Err(e) = self
                .request(record.id, |reply| Command::Reconcile { designated, reply })
                .await
            {
                debug!("Could not reconcile {}: {}", record.id, e);
            }
        }
    }

    /// Registers a change listener; it runs after every status or registry mutation.
    pub fn subscribe(&self, listener: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.shared.observers.subscribe(Arc::new(listener))
    }

    /// Disconnects every live record and stops all workers.
    pub async fn shutdown(&self) {
        let workers: Vec<_> = self.lock_workers().drain().collect();
        for (id, tx) in workers {
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx.send(Command::Shutdown { reply: reply_tx }).is_ok() {
                let _ = reply_rx.await;
            }
            debug!("Worker for {} shut down", id);
        }
    }
}
