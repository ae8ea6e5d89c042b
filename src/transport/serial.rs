//! Serial (USB/UART) transport.
//!
//! Ports are opened through a [`PortOpener`] so the exclusivity rules can be exercised
//! without hardware; [`SystemPortOpener`] is the `serialport` backed implementation.
//!
//! Exclusive access: every open port is tracked by a lease counting its live reader and
//! writer streams. Opening a path that still has active streams evicts the previous
//! holder (its link reports [`LinkEvent::Lost`]), waits for the streams to wind down and
//! pauses briefly before reopening. A port held by another process surfaces as
//! [`TransportError::ExclusiveAccess`] after one retry.

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};

use super::framer::{encode_frame, StreamFramer, MAX_ENCODE_LEN};
use super::{
    mismatch, shutdown_requested, wait_shutdown, LinkEnds, LinkEvent, OpenOptions,
    OutboundFrame, ProbeOutcome, Transport, TransportHandle,
};
use crate::config::SerialConfig;
use crate::error::TransportError;
use crate::logutil::{escape_log, hex_snippet};
use crate::registry::{Endpoint, TransportKind};

/// A bidirectional byte stream to a serial device.
pub trait SerialIo: Read + Write + Send {
    /// A second handle on the same port, used to read and write from different threads.
    fn try_clone_io(&self) -> io::Result<Box<dyn SerialIo>>;
}

/// Why a port could not be opened.
#[derive(Debug, Error)]
pub enum PortOpenError {
    #[error("port is locked: {0}")]
    Locked(String),
    #[error("port not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Other(String),
}

/// An enumerated serial port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    pub path: String,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub product: Option<String>,
}

/// Platform access to serial ports. Both calls may block.
pub trait PortOpener: Send + Sync {
    fn open(
        &self,
        path: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Box<dyn SerialIo>, PortOpenError>;

    /// Ports the platform currently exposes to this process.
    fn available(&self) -> Vec<PortDescriptor>;
}

/// User-facing port selection, consulted only when prompting is allowed.
#[async_trait]
pub trait PortPicker: Send + Sync {
    async fn pick(&self, candidates: &[PortDescriptor]) -> Option<PortDescriptor>;
}

/// Timing and line settings for the serial adapter.
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub reopen_delay: Duration,
    pub release_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self::from(&SerialConfig::default())
    }
}

impl From<&SerialConfig> for SerialSettings {
    fn from(cfg: &SerialConfig) -> Self {
        Self {
            baud_rate: cfg.baud_rate,
            reopen_delay: Duration::from_millis(cfg.reopen_delay_ms),
            release_timeout: Duration::from_millis(cfg.release_timeout_ms),
            read_timeout: Duration::from_millis(cfg.read_timeout_ms),
        }
    }
}

struct PortLease {
    evict: watch::Sender<bool>,
    active_streams: AtomicUsize,
}

impl PortLease {
    fn new() -> Arc<Self> {
        let (evict, _) = watch::channel(false);
        Arc::new(Self {
            evict,
            active_streams: AtomicUsize::new(0),
        })
    }

    fn active(&self) -> usize {
        self.active_streams.load(Ordering::SeqCst)
    }

    fn stream(self: &Arc<Self>) -> StreamGuard {
        self.active_streams.fetch_add(1, Ordering::SeqCst);
        StreamGuard(Arc::clone(self))
    }
}

/// Keeps a lease's stream count up while a reader or writer runs.
struct StreamGuard(Arc<PortLease>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.active_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Serial implementation of [`Transport`].
pub struct SerialTransport {
    opener: Arc<dyn PortOpener>,
    picker: Option<Arc<dyn PortPicker>>,
    settings: SerialSettings,
    leases: Mutex<HashMap<String, Arc<PortLease>>>,
}

impl SerialTransport {
    pub fn new(opener: Arc<dyn PortOpener>, settings: SerialSettings) -> Self {
        Self {
            opener,
            picker: None,
            settings,
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// Uses the operating system's serial ports.
    #[cfg(feature = "serial")]
    pub fn system(settings: SerialSettings) -> Self {
        Self::new(Arc::new(SystemPortOpener), settings)
    }

    pub fn with_picker(mut self, picker: Arc<dyn PortPicker>) -> Self {
        self.picker = Some(picker);
        self
    }

    /// Number of live reader/writer streams on `path` held by this process.
    pub fn active_streams(&self, path: &str) -> usize {
        self.lease_for(path).map(|l| l.active()).unwrap_or(0)
    }

    fn lease_for(&self, path: &str) -> Option<Arc<PortLease>> {
        self.leases
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(path)
            .cloned()
    }

    async fn available(&self) -> Vec<PortDescriptor> {
        let opener = Arc::clone(&self.opener);
        tokio::task::spawn_blocking(move || opener.available())
            .await
            .unwrap_or_default()
    }

    async fn resolve_path(
        &self,
        endpoint: &Endpoint,
        path: &str,
        vendor_id: Option<u16>,
        product_id: Option<u16>,
        options: &OpenOptions,
    ) -> Result<String, TransportError> {
        if !path.is_empty() {
            return Ok(path.to_string());
        }
        let ports = self.available().await;
        if let (Some(vid), Some(pid)) = (vendor_id, product_id) {
            if let Some(port) = ports
                .iter()
                .find(|p| p.vendor_id == Some(vid) && p.product_id == Some(pid))
            {
                debug!("Matched usb {:04x}:{:04x} to {}", vid, pid, port.path);
                return Ok(port.path.clone());
            }
        }
        match (&self.picker, options.allow_prompt) {
            (Some(picker), true) => match picker.pick(&ports).await {
                Some(port) => {
                    info!("Operator selected serial port {}", escape_log(&port.path));
                    Ok(port.path)
                }
                None => Err(TransportError::AuthorizationRequired {
                    endpoint: endpoint.to_string(),
                }),
            },
            _ => Err(TransportError::AuthorizationRequired {
                endpoint: endpoint.to_string(),
            }),
        }
    }

    /// Evicts an in-process holder of `path` and waits for its streams to stop.
    async fn release_existing(&self, path: &str) {
        let Some(lease) = self.lease_for(path) else {
            return;
        };
        if lease.active() == 0 {
            return;
        }
        info!(
            "Serial port {} is already open with {} active stream(s); closing it first",
            path,
            lease.active()
        );
        let _ = lease.evict.send_replace(true);
        let deadline = Instant::now() + self.settings.release_timeout;
        while lease.active() > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(20)).await;
        }
        if lease.active() > 0 {
            warn!("Serial port {} streams did not stop in time", path);
        }
        sleep(self.settings.reopen_delay).await;
    }

    async fn open_port(&self, path: &str, baud: u32) -> Result<Box<dyn SerialIo>, PortOpenError> {
        let opener = Arc::clone(&self.opener);
        let owned = path.to_string();
        let timeout = self.settings.read_timeout;
        tokio::task::spawn_blocking(move || opener.open(&owned, baud, timeout))
            .await
            .map_err(|e| PortOpenError::Other(e.to_string()))?
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    async fn open(
        &self,
        endpoint: &Endpoint,
        options: &OpenOptions,
    ) -> Result<TransportHandle, TransportError> {
        let Endpoint::Serial {
            path,
            vendor_id,
            product_id,
            baud_rate,
        } = endpoint
        else {
            return Err(mismatch(TransportKind::Serial, endpoint));
        };
        let path = self
            .resolve_path(endpoint, path, *vendor_id, *product_id, options)
            .await?;
        let baud = baud_rate.unwrap_or(self.settings.baud_rate);

        self.release_existing(&path).await;

        let io = match self.open_port(&path, baud).await {
            Err(PortOpenError::Locked(first)) => {
                debug!("Serial port {} locked ({}); retrying once", path, first);
                sleep(self.settings.reopen_delay).await;
                match self.open_port(&path, baud).await {
                    Ok(io) => io,
                    Err(PortOpenError::Locked(_)) => {
                        return Err(TransportError::ExclusiveAccess {
                            port: path.clone(),
                        })
                    }
                    Err(e) => return Err(open_failure(&path, e)),
                }
            }
            Err(e) => return Err(open_failure(&path, e)),
            Ok(io) => io,
        };
        let reader = io.try_clone_io().map_err(TransportError::Io)?;
        info!("Opened serial port {} at {} baud", path, baud);

        let lease = PortLease::new();
        self.leases
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(path.clone(), Arc::clone(&lease));

        let (mut handle, ends) = TransportHandle::pair(TransportKind::Serial, path.clone());
        let LinkEnds {
            outbound,
            inbound,
            shutdown,
        } = ends;

        let read_guard = lease.stream();
        let evicted = lease.evict.subscribe();
        let reader_shutdown = shutdown.clone();
        let label = path.clone();
        handle.attach(tokio::task::spawn_blocking(move || {
            read_loop(reader, inbound, reader_shutdown, evicted, &label);
            drop(read_guard);
        }));

        let write_guard = lease.stream();
        let writer = Arc::new(Mutex::new(io));
        handle.attach(tokio::spawn(async move {
            write_loop(writer, outbound, shutdown, lease.evict.subscribe()).await;
            drop(write_guard);
        }));

        Ok(handle.with_close_grace(self.settings.release_timeout))
    }

    async fn probe(&self, endpoint: &Endpoint) -> ProbeOutcome {
        let Endpoint::Serial {
            path,
            vendor_id,
            product_id,
            ..
        } = endpoint
        else {
            return ProbeOutcome::Inconclusive("not a serial endpoint".to_string());
        };
        let ports = self.available().await;
        let granted = if !path.is_empty() {
            ports.iter().any(|p| &p.path == path)
        } else {
            match (vendor_id, product_id) {
                (Some(v), Some(p)) => ports
                    .iter()
                    .any(|d| d.vendor_id == Some(*v) && d.product_id == Some(*p)),
                _ => return ProbeOutcome::Inconclusive("no port selected yet".to_string()),
            }
        };
        if granted {
            ProbeOutcome::Reachable
        } else {
            ProbeOutcome::Unreachable
        }
    }
}

fn open_failure(path: &str, err: PortOpenError) -> TransportError {
    TransportError::Unreachable {
        endpoint: path.to_string(),
        reason: err.to_string(),
    }
}

fn read_loop(
    mut reader: Box<dyn SerialIo>,
    inbound: mpsc::UnboundedSender<LinkEvent>,
    shutdown: watch::Receiver<bool>,
    evicted: watch::Receiver<bool>,
    label: &str,
) {
    let mut framer = StreamFramer::new();
    let mut buf = [0u8; 1024];
    loop {
        if shutdown_requested(&shutdown) {
            break;
        }
        if *evicted.borrow() {
            let _ = inbound.send(LinkEvent::Lost(
                "serial port was reopened by another connection".to_string(),
            ));
            break;
        }
        match reader.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                trace!("RAW {} bytes from {}: {}", n, label, hex_snippet(&buf[..n], 64));
                framer.push(&buf[..n]);
                while let Some(frame) = framer.next_frame() {
                    if inbound.send(LinkEvent::Frame(frame)).is_err() {
                        return;
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                if !shutdown_requested(&shutdown) {
                    warn!("Serial read error on {}: {}", label, e);
                    let _ = inbound.send(LinkEvent::Lost(format!("serial read failed: {}", e)));
                }
                break;
            }
        }
    }
    debug!("Serial reader for {} stopped", label);
}

async fn write_loop(
    writer: Arc<Mutex<Box<dyn SerialIo>>>,
    mut outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    mut shutdown: watch::Receiver<bool>,
    mut evicted: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = wait_shutdown(&mut shutdown) => break,
            _ = wait_shutdown(&mut evicted) => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let Some(encoded) = encode_frame(&frame.bytes) else {
            let len = frame.bytes.len();
            frame.acknowledge(Err(TransportError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "payload of {} bytes exceeds the {} byte serial limit",
                    len, MAX_ENCODE_LEN
                ),
            ))));
            continue;
        };
        let port = Arc::clone(&writer);
        let result = tokio::task::spawn_blocking(move || {
            let mut port = port.lock().unwrap_or_else(|p| p.into_inner());
            port.write_all(&encoded)?;
            port.flush()
        })
        .await
        .unwrap_or_else(|e| Err(io::Error::new(io::ErrorKind::Other, e.to_string())));
        frame.acknowledge(result.map_err(TransportError::Io));
    }
}

/// Operating system serial ports via the `serialport` crate.
#[cfg(feature = "serial")]
pub struct SystemPortOpener;

#[cfg(feature = "serial")]
struct SystemPort(Box<dyn serialport::SerialPort>);

#[cfg(feature = "serial")]
impl Read for SystemPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

#[cfg(feature = "serial")]
impl Write for SystemPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

#[cfg(feature = "serial")]
impl SerialIo for SystemPort {
    fn try_clone_io(&self) -> io::Result<Box<dyn SerialIo>> {
        let clone = self
            .0
            .try_clone()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(Box::new(SystemPort(clone)))
    }
}

#[cfg(feature = "serial")]
impl PortOpener for SystemPortOpener {
    fn open(
        &self,
        path: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Box<dyn SerialIo>, PortOpenError> {
        let builder = serialport::new(path, baud_rate)
            .timeout(read_timeout)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None);
        let mut port = builder.open().map_err(classify_open_error)?;
        // ESP32 boards need DTR/RTS asserted to come out of reset
        let _ = port.write_data_terminal_ready(true);
        let _ = port.write_request_to_send(true);
        std::thread::sleep(Duration::from_millis(150));
        let _ = port.clear(serialport::ClearBuffer::Input);
        Ok(Box::new(SystemPort(port)))
    }

    fn available(&self) -> Vec<PortDescriptor> {
        match serialport::available_ports() {
            Ok(ports) => ports
                .into_iter()
                .map(|p| match p.port_type {
                    serialport::SerialPortType::UsbPort(usb) => PortDescriptor {
                        path: p.port_name,
                        vendor_id: Some(usb.vid),
                        product_id: Some(usb.pid),
                        product: usb.product,
                    },
                    _ => PortDescriptor {
                        path: p.port_name,
                        vendor_id: None,
                        product_id: None,
                        product: None,
                    },
                })
                .collect(),
            Err(e) => {
                warn!("Could not enumerate serial ports: {}", e);
                Vec::new()
            }
        }
    }
}

#[cfg(feature = "serial")]
fn classify_open_error(err: serialport::Error) -> PortOpenError {
    let text = err.to_string();
    let lower = text.to_lowercase();
    if matches!(err.kind(), serialport::ErrorKind::NoDevice)
        || matches!(err.kind(), serialport::ErrorKind::Io(io::ErrorKind::NotFound))
    {
        return PortOpenError::NotFound(text);
    }
    let locked = ["busy", "in use", "access is denied", "locked"]
        .iter()
        .any(|needle| lower.contains(needle));
    if locked {
        PortOpenError::Locked(text)
    } else {
        PortOpenError::Other(text)
    }
}
