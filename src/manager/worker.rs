//! Per-record actor.
//!
//! One worker task owns everything live about one record and applies every transition
//! for it, one command at a time. User commands, transport open results, session events
//! and timer ticks all arrive as [`Command`]s on the same queue, so they are applied in
//! arrival order and never concurrently. Asynchronous results carry the session id they
//! were started for; anything tagged with a session that is no longer bound is dropped.
//!
//! ```text
//!  disconnected/online/error ──connect──▶ connecting ──opened──▶ configuring
//!        ▲                                   │                       │ stage 1
//!        │ disconnect / link lost            │ open failed           ▼
//!        └───────────────────────────── error ◀── watchdog ──── connected ──stage 2──▶ configured
//! ```

use bytes::Bytes;
use chrono::Utc;
use log::{debug, info, trace, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use uuid::Uuid;

use super::live::{LiveSession, LiveSummary, LiveTask};
use super::Shared;
use crate::error::{ConnectionError, RegistryError, TransportError};
use crate::logutil::escape_log;
use crate::metrics;
use crate::protocol::{HandshakeStage, ProtocolSession, SessionEvent};
use crate::registry::{ConnectionRecord, ConnectionStatus, RecordId, SessionId};
use crate::transport::{OpenOptions, ProbeOutcome, TransportHandle};

type Reply<T> = oneshot::Sender<Result<T, ConnectionError>>;

pub(crate) enum Command {
    Connect {
        options: OpenOptions,
        reply: Reply<bool>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    Remove {
        reply: Reply<()>,
    },
    Rename {
        name: String,
        reply: Reply<ConnectionRecord>,
    },
    SetDefault {
        reply: Reply<()>,
    },
    SendPacket {
        packet: Bytes,
        reply: Reply<()>,
    },
    Probed {
        outcome: ProbeOutcome,
        reply: Reply<()>,
    },
    Reconcile {
        designated: bool,
        reply: Reply<()>,
    },
    Inspect {
        reply: Reply<Option<LiveSummary>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
    Opened {
        session_id: SessionId,
        result: Result<TransportHandle, TransportError>,
    },
    Session {
        session_id: SessionId,
        event: SessionEvent,
    },
    HandshakeTimeout {
        session_id: SessionId,
    },
    KeepAliveDue {
        session_id: SessionId,
    },
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// A transport open that has not reported back yet.
struct Attempt {
    session_id: SessionId,
    task: JoinHandle<()>,
}

pub(crate) struct Worker {
    id: RecordId,
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Command>,
    rx: mpsc::UnboundedReceiver<Command>,
    attempt: Option<Attempt>,
    live: Option<LiveSession>,
    waiters: Vec<Reply<bool>>,
}

impl Worker {
    /// Starts the worker for `id` and returns its queue.
    pub(crate) fn spawn(id: RecordId, shared: Arc<Shared>) -> mpsc::UnboundedSender<Command> {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            id,
            shared,
            tx: tx.clone(),
            rx,
            attempt: None,
            live: None,
            waiters: Vec::new(),
        };
        tokio::spawn(worker.run());
        tx
    }

    async fn run(mut self) {
        trace!("Worker for {} started", self.id);
        while let Some(command) = self.rx.recv().await {
            if self.handle(command).await == Flow::Exit {
                break;
            }
            // The record is gone and nothing live is left to release
            if self.shared.store.get(self.id).is_none() && self.exit_if_idle() == Flow::Exit {
                break;
            }
        }
        trace!("Worker for {} stopped", self.id);
    }

    async fn handle(&mut self, command: Command) -> Flow {
        match command {
            Command::Connect { options, reply } => return self.on_connect(options, reply),
            Command::Disconnect { reply } => {
                if self.shared.store.get(self.id).is_none() {
                    let _ = reply.send(Err(ConnectionError::RecordNotFound(self.id)));
                    return self.exit_if_idle();
                }
                let result = self.teardown(ConnectionStatus::Disconnected, None).await;
                let _ = reply.send(result.map(|_| ()).map_err(Into::into));
            }
            Command::Remove { reply } => {
                if self.shared.store.get(self.id).is_none() {
                    let _ = reply.send(Err(ConnectionError::RecordNotFound(self.id)));
                    return self.exit_if_idle();
                }
                let _ = self.teardown(ConnectionStatus::Disconnected, None).await;
                let result = match self.shared.store.remove(self.id) {
                    Ok(true) => {
                        info!("Removed connection {}", self.id);
                        self.shared.observers.notify();
                        Ok(())
                    }
                    Ok(false) => Err(ConnectionError::RecordNotFound(self.id)),
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
                return Flow::Exit;
            }
            Command::Rename { name, reply } => {
                let result = self.write(|r| r.name = name.clone());
                let _ = reply.send(result.map_err(|e| self.not_found(e)));
            }
            Command::SetDefault { reply } => {
                let result = self.shared.store.set_default(self.id);
                if result.is_ok() {
                    self.shared.observers.notify();
                }
                let _ = reply.send(result.map_err(|e| self.not_found(e)));
            }
            Command::SendPacket { packet, reply } => self.on_send_packet(packet, reply),
            Command::Probed { outcome, reply } => {
                self.on_probed(outcome);
                let _ = reply.send(Ok(()));
            }
            Command::Reconcile { designated, reply } => {
                self.on_reconcile(designated);
                let _ = reply.send(Ok(()));
            }
            Command::Inspect { reply } => {
                let _ = reply.send(Ok(self.live.as_ref().map(LiveSession::summary)));
            }
            Command::Shutdown { reply } => {
                if self.live.is_some() || self.attempt.is_some() {
                    let _ = self.teardown(ConnectionStatus::Disconnected, None).await;
                }
                let _ = reply.send(Ok(()));
                return Flow::Exit;
            }
            Command::Opened { session_id, result } => self.on_opened(session_id, result).await,
            Command::Session { session_id, event } => {
                if self.current_session() != Some(session_id) {
                    debug!("Ignoring {:?} from stale session {}", event, session_id);
                } else {
                    self.on_session_event(event).await;
                }
            }
            Command::HandshakeTimeout { session_id } => {
                if self.current_session() == Some(session_id) && !self.status().is_established() {
                    metrics::inc_handshake_timeouts();
                    metrics::inc_connect_failed();
                    let err = ConnectionError::HandshakeFailed(format!(
                        "device did not finish basic configuration within {:?}",
                        self.shared.settings.handshake_timeout
                    ));
                    warn!("Connection {}: {}", self.id, err);
                    let _ = self
                        .teardown(ConnectionStatus::Error, Some(err.to_string()))
                        .await;
                }
            }
            Command::KeepAliveDue { session_id } => {
                if self.current_session() == Some(session_id) && self.status().is_established() {
                    self.send_keepalive();
                }
            }
        }
        Flow::Continue
    }

    fn on_connect(&mut self, options: OpenOptions, reply: Reply<bool>) -> Flow {
        let Some(record) = self.shared.store.get(self.id) else {
            let _ = reply.send(Err(ConnectionError::RecordNotFound(self.id)));
            return self.exit_if_idle();
        };
        if self.live.is_some() && record.status.is_established() {
            let _ = reply.send(Ok(true));
            return Flow::Continue;
        }
        if self.attempt.is_some() || self.live.is_some() {
            debug!("Connect for {} joins the attempt in flight", self.id);
            self.waiters.push(reply);
            return Flow::Continue;
        }

        metrics::inc_connect_attempts();
        let session_id = Uuid::new_v4();
        if let Err(e) = self.transition(ConnectionStatus::Connecting, |r| {
            r.error = None;
            r.live_session_id = Some(session_id);
        }) {
            let _ = reply.send(Err(e.into()));
            return Flow::Continue;
        }
        self.waiters.push(reply);

        let transport = self.shared.transports.get(record.transport_kind());
        let endpoint = record.endpoint.clone();
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            let result = match transport {
                Ok(transport) => transport.open(&endpoint, &options).await,
                Err(e) => Err(e),
            };
            let _ = tx.send(Command::Opened { session_id, result });
        });
        self.attempt = Some(Attempt { session_id, task });
        Flow::Continue
    }

    async fn on_opened(
        &mut self,
        session_id: SessionId,
        result: Result<TransportHandle, TransportError>,
    ) {
        if self.attempt.as_ref().map(|a| a.session_id) != Some(session_id) {
            if let Ok(mut handle) = result {
                debug!("Closing link opened for abandoned session {}", session_id);
                tokio::spawn(async move { handle.close().await });
            }
            return;
        }
        self.attempt = None;

        let handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                metrics::inc_connect_failed();
                warn!("Connection {} failed to open: {}", self.id, e);
                let _ = self
                    .teardown(ConnectionStatus::Error, Some(e.to_string()))
                    .await;
                return;
            }
        };
        let mut session =
            match ProtocolSession::start(self.id, handle, self.shared.settings.session_tuning()) {
                Ok(session) => session,
                Err(e) => {
                    metrics::inc_connect_failed();
                    let err = ConnectionError::HandshakeFailed(e.to_string());
                    let _ = self
                        .teardown(ConnectionStatus::Error, Some(err.to_string()))
                        .await;
                    return;
                }
            };

        let events = session.take_events();
        let mut live = LiveSession::new(session_id, session);
        if let Some(mut events) = events {
            let tx = self.tx.clone();
            live.track(
                LiveTask::EventForwarder,
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        if tx.send(Command::Session { session_id, event }).is_err() {
                            break;
                        }
                    }
                }),
            );
        }
        let tx = self.tx.clone();
        let limit = self.shared.settings.handshake_timeout;
        live.track(
            LiveTask::HandshakeWatchdog,
            tokio::spawn(async move {
                sleep(limit).await;
                let _ = tx.send(Command::HandshakeTimeout { session_id });
            }),
        );
        self.live = Some(live);
        let _ = self.transition(ConnectionStatus::Configuring, |_| {});
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Identity { node_num } => {
                debug!("Connection {} is node !{:08x}", self.id, node_num);
                let _ = self.write(|r| r.node_num = Some(node_num));
            }
            SessionEvent::ConfigFragment(kind) => trace!("{:?} fragment for {}", kind, self.id),
            SessionEvent::HandshakeStageComplete(HandshakeStage::Basic) => {
                if self.status() == ConnectionStatus::Configuring {
                    self.on_connected();
                } else {
                    debug!("Basic stage complete for {} in {}", self.id, self.status());
                }
            }
            SessionEvent::HandshakeStageComplete(HandshakeStage::FullSync) => {
                if self.status() == ConnectionStatus::Connected {
                    let _ = self.transition(ConnectionStatus::Configured, |_| {});
                } else {
                    debug!(
                        "Ignoring full-sync completion for {} in {}",
                        self.id,
                        self.status()
                    );
                }
            }
            SessionEvent::Packet(packet) => {
                trace!("Packet of {} bytes from {}", packet.len(), self.id)
            }
            SessionEvent::HandshakeFailed(reason) => {
                metrics::inc_connect_failed();
                let err = ConnectionError::HandshakeFailed(reason);
                warn!("Connection {}: {}", self.id, err);
                let _ = self
                    .teardown(ConnectionStatus::Error, Some(err.to_string()))
                    .await;
            }
            SessionEvent::LinkLost(reason) => {
                metrics::inc_link_losses();
                info!(
                    "Connection {} lost its link: {}",
                    self.id,
                    escape_log(&reason)
                );
                let _ = self.teardown(ConnectionStatus::Disconnected, None).await;
            }
        }
    }

    fn on_connected(&mut self) {
        let Some(live) = self.live.as_mut() else {
            return;
        };
        live.cancel(LiveTask::HandshakeWatchdog);
        let session_id = live.session_id;
        if self
            .transition(ConnectionStatus::Connected, |r| {
                r.last_connected_at = Some(Utc::now());
            })
            .is_err()
        {
            return;
        }
        metrics::inc_connect_established();
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(true));
        }

        self.send_keepalive();
        let tx = self.tx.clone();
        let period = self.shared.settings.keepalive_interval;
        if let Some(live) = self.live.as_mut() {
            live.track(
                LiveTask::KeepAlive,
                tokio::spawn(async move {
                    let mut ticks = interval_at(Instant::now() + period, period);
                    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticks.tick().await;
                        if tx.send(Command::KeepAliveDue { session_id }).is_err() {
                            break;
                        }
                    }
                }),
            );
        }
    }

    /// Queues a heartbeat now; the write result is only logged and counted.
    fn send_keepalive(&self) {
        let Some(live) = self.live.as_ref() else {
            return;
        };
        let id = self.id;
        match live.handle().queue_heartbeat() {
            Ok((nonce, pending)) => {
                tokio::spawn(async move {
                    match pending.wait().await {
                        Ok(()) => {
                            metrics::inc_keepalive_sent();
                            trace!("Keep-alive {:08x} sent for {}", nonce, id);
                        }
                        Err(e) => {
                            metrics::inc_keepalive_failed();
                            warn!(
                                "Connection {}: {}",
                                id,
                                ConnectionError::KeepAliveFailed(e.to_string())
                            );
                        }
                    }
                });
            }
            Err(e) => {
                metrics::inc_keepalive_failed();
                warn!(
                    "Connection {}: {}",
                    id,
                    ConnectionError::KeepAliveFailed(e.to_string())
                );
            }
        }
    }

    fn on_send_packet(&self, packet: Bytes, reply: Reply<()>) {
        let live = match self.live.as_ref() {
            Some(live) if self.status().is_established() => live,
            _ => {
                let _ = reply.send(Err(ConnectionError::NotConnected(self.id)));
                return;
            }
        };
        match live.handle().queue_application_packet(packet) {
            Ok(pending) => {
                tokio::spawn(async move {
                    let _ = reply.send(pending.wait().await.map_err(Into::into));
                });
            }
            Err(e) => {
                let _ = reply.send(Err(e.into()));
            }
        }
    }

    fn on_probed(&self, outcome: ProbeOutcome) {
        let Some(record) = self.shared.store.get(self.id) else {
            return;
        };
        if record.status.is_active() || self.live.is_some() || self.attempt.is_some() {
            debug!("Probe result for {} dropped; a session is active", self.id);
            return;
        }
        let target = match outcome {
            ProbeOutcome::Reachable => ConnectionStatus::Online,
            ProbeOutcome::Unreachable => ConnectionStatus::Disconnected,
            ProbeOutcome::Inconclusive(reason) => {
                debug!("Probe for {} inconclusive: {}", self.id, escape_log(&reason));
                return;
            }
        };
        if record.status != target {
            let _ = self.transition(target, |_| {});
        }
    }

    fn on_reconcile(&self, designated: bool) {
        let Some(record) = self.shared.store.get(self.id) else {
            return;
        };
        let really_live = self.live.is_some() || self.attempt.is_some();
        if record.status.is_active() && !really_live {
            info!(
                "Connection {} claimed {} without a live session; demoting",
                self.id, record.status
            );
            let _ = self.transition(ConnectionStatus::Disconnected, |_| {});
        } else if really_live && !designated {
            warn!(
                "Connection {} holds a live session but was not named as the active one",
                self.id
            );
        }
    }

    /// Releases every live resource, then records `target`. Safe to call when nothing is
    /// bound; pending connect callers are answered `false`.
    async fn teardown(
        &mut self,
        target: ConnectionStatus,
        error: Option<String>,
    ) -> Result<Option<ConnectionRecord>, RegistryError> {
        if let Some(attempt) = self.attempt.take() {
            attempt.task.abort();
            debug!("Abandoned open for session {}", attempt.session_id);
        }
        if let Some(live) = self.live.take() {
            live.shutdown(self.shared.settings.close_timeout).await;
        }
        let needs_write = match self.shared.store.get(self.id) {
            Some(r) => r.status != target || error.is_some() || r.live_session_id.is_some(),
            None => false,
        };
        let result = if needs_write {
            self.transition(target, |r| {
                if let Some(message) = &error {
                    r.error = Some(message.clone());
                }
            })
            .map(Some)
        } else {
            Ok(None)
        };
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(false));
        }
        result
    }

    /// Writes `to` (clearing the session binding for non-active states), logs the change
    /// and notifies observers.
    fn transition(
        &self,
        to: ConnectionStatus,
        extra: impl Fn(&mut ConnectionRecord),
    ) -> Result<ConnectionRecord, RegistryError> {
        let mut from = to;
        let mut apply = |r: &mut ConnectionRecord| {
            from = r.status;
            r.status = to;
            if !to.is_active() {
                r.live_session_id = None;
            }
            extra(r);
        };
        // Leaving the active states must stick even when the registry cannot be written
        let result = if to.is_active() {
            self.write(&mut apply)
        } else {
            self.settle(&mut apply)
        };
        if let Ok(record) = &result {
            if from != to {
                info!(
                    "{} [{}]: {} -> {}",
                    escape_log(&record.name),
                    short_id(&self.id),
                    from,
                    to
                );
            }
            debug_assert!(record.is_consistent());
        }
        result
    }

    fn write(
        &self,
        mut apply: impl FnMut(&mut ConnectionRecord),
    ) -> Result<ConnectionRecord, RegistryError> {
        let result = self.shared.store.update(self.id, &mut apply);
        match &result {
            Ok(_) => self.shared.observers.notify(),
            Err(e) => warn!("Could not update connection {}: {}", self.id, e),
        }
        result
    }

    fn settle(
        &self,
        apply: &mut dyn FnMut(&mut ConnectionRecord),
    ) -> Result<ConnectionRecord, RegistryError> {
        let result = self.shared.store.update_retained(self.id, apply);
        match &result {
            Ok(_) => self.shared.observers.notify(),
            Err(e) => warn!("Could not update connection {}: {}", self.id, e),
        }
        result
    }

    fn status(&self) -> ConnectionStatus {
        self.shared
            .store
            .get(self.id)
            .map(|r| r.status)
            .unwrap_or_default()
    }

    fn current_session(&self) -> Option<SessionId> {
        self.live.as_ref().map(|l| l.session_id)
    }

    fn not_found(&self, err: RegistryError) -> ConnectionError {
        match err {
            RegistryError::NotFound(_) => ConnectionError::RecordNotFound(self.id),
            other => other.into(),
        }
    }

    fn exit_if_idle(&self) -> Flow {
        if self.live.is_none() && self.attempt.is_none() {
            Flow::Exit
        } else {
            Flow::Continue
        }
    }
}

fn short_id(id: &RecordId) -> String {
    id.to_string().chars().take(8).collect()
}
