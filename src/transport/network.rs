//! Network transport over the device's HTTP API.
//!
//! - liveness: `GET /json/report`, bounded by the probe timeout, before anything else;
//! - inbound: `GET /api/v1/fromradio?all=false` returns one `FromRadio` per call and an
//!   empty body once drained, so the poller drains on every tick;
//! - outbound: `PUT /api/v1/toradio` with an `application/x-protobuf` body.
//!
//! There is no connection to lose, so the link is reported lost after a run of failed polls.
//! TLS failures caused by the device's self-signed certificate are reported separately from
//! plain unreachability because the operator's fix is different.

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::error::Error as StdError;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};

use super::{
    mismatch, shutdown_requested, wait_shutdown, LinkEnds, LinkEvent, OpenOptions,
    OutboundFrame, ProbeOutcome, Transport, TransportHandle,
};
use crate::config::Config;
use crate::error::TransportError;
use crate::registry::{Endpoint, TransportKind};

const PROTOBUF: &str = "application/x-protobuf";

#[derive(Debug, Clone)]
pub struct NetworkSettings {
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub max_consecutive_failures: u32,
    pub accept_invalid_certs: bool,
    /// Bound on the liveness check made by `open` and `probe`.
    pub probe_timeout: Duration,
}

impl NetworkSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            poll_interval: Duration::from_millis(cfg.network.poll_interval_ms),
            request_timeout: Duration::from_millis(cfg.network.request_timeout_ms),
            max_consecutive_failures: cfg.network.max_consecutive_failures.max(1),
            accept_invalid_certs: cfg.network.accept_invalid_certs,
            probe_timeout: Duration::from_millis(cfg.manager.probe_timeout_ms),
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct NetworkTransport {
    client: reqwest::Client,
    settings: NetworkSettings,
}

impl NetworkTransport {
    pub fn new(settings: NetworkSettings) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .build()
            .map_err(|e| {
                TransportError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
            })?;
        Ok(Self { client, settings })
    }

    async fn liveness(&self, base: &str, host: &str) -> Result<(), TransportError> {
        let url = format!("{}/json/report", base);
        match timeout(self.settings.probe_timeout, self.client.get(&url).send()).await {
            Err(_) => Err(TransportError::Unreachable {
                endpoint: host.to_string(),
                reason: format!("no answer within {:?}", self.settings.probe_timeout),
            }),
            Ok(Err(e)) => Err(classify(&e, host)),
            Ok(Ok(resp)) if resp.status().is_success() => Ok(()),
            Ok(Ok(resp)) => Err(TransportError::Unreachable {
                endpoint: host.to_string(),
                reason: format!("HTTP status {}", resp.status()),
            }),
        }
    }
}

/// `http://host` or `https://host`, unless the host already carries a scheme.
pub fn base_url(host: &str, tls: bool) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else if tls {
        format!("https://{}", host)
    } else {
        format!("http://{}", host)
    }
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

fn is_certificate_problem(chain: &str) -> bool {
    let lower = chain.to_lowercase();
    ["certificate", "unknownissuer", "self signed", "self-signed"]
        .iter()
        .any(|needle| lower.contains(needle))
}

fn classify(err: &reqwest::Error, host: &str) -> TransportError {
    let chain = error_chain(err);
    if is_certificate_problem(&chain) {
        return TransportError::UntrustedCertificate {
            endpoint: host.to_string(),
        };
    }
    let reason = if err.is_timeout() {
        "request timed out".to_string()
    } else {
        chain
    };
    TransportError::Unreachable {
        endpoint: host.to_string(),
        reason,
    }
}

#[async_trait]
impl Transport for NetworkTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Network
    }

    async fn open(
        &self,
        endpoint: &Endpoint,
        _options: &OpenOptions,
    ) -> Result<TransportHandle, TransportError> {
        let Endpoint::Network { host, tls } = endpoint else {
            return Err(mismatch(TransportKind::Network, endpoint));
        };
        let base = base_url(host, *tls);
        self.liveness(&base, host).await?;
        info!("Device at {} answered; starting HTTP link", base);

        let (mut handle, ends) = TransportHandle::pair(TransportKind::Network, host.clone());
        let LinkEnds {
            outbound,
            inbound,
            shutdown,
        } = ends;

        handle.attach(tokio::spawn(poll_loop(
            self.client.clone(),
            format!("{}/api/v1/fromradio?all=false", base),
            host.clone(),
            self.settings.clone(),
            inbound,
            shutdown.clone(),
        )));
        handle.attach(tokio::spawn(write_loop(
            self.client.clone(),
            format!("{}/api/v1/toradio", base),
            host.clone(),
            outbound,
            shutdown,
        )));
        Ok(handle)
    }

    async fn probe(&self, endpoint: &Endpoint) -> ProbeOutcome {
        let Endpoint::Network { host, tls } = endpoint else {
            return ProbeOutcome::Inconclusive("not a network endpoint".to_string());
        };
        match self.liveness(&base_url(host, *tls), host).await {
            Ok(()) => ProbeOutcome::Reachable,
            Err(TransportError::Unreachable { .. }) => ProbeOutcome::Unreachable,
            Err(other) => ProbeOutcome::Inconclusive(other.to_string()),
        }
    }
}

async fn fetch(client: &reqwest::Client, url: &str) -> Result<Option<Bytes>, reqwest::Error> {
    let resp = client
        .get(url)
        .header(ACCEPT, PROTOBUF)
        .send()
        .await?
        .error_for_status()?;
    let body = resp.bytes().await?;
    Ok(if body.is_empty() { None } else { Some(body) })
}

async fn poll_loop(
    client: reqwest::Client,
    url: String,
    host: String,
    settings: NetworkSettings,
    inbound: mpsc::UnboundedSender<LinkEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures = 0u32;
    loop {
        tokio::select! {
            _ = wait_shutdown(&mut shutdown) => return,
            _ = sleep(settings.poll_interval) => {}
        }
        // Drain everything queued on the device
        loop {
            let result = tokio::select! {
                _ = wait_shutdown(&mut shutdown) => return,
                r = fetch(&client, &url) => r,
            };
            match result {
                Ok(Some(frame)) => {
                    failures = 0;
                    if inbound.send(LinkEvent::Frame(frame)).is_err() || shutdown_requested(&shutdown)
                    {
                        return;
                    }
                }
                Ok(None) => {
                    failures = 0;
                    break;
                }
                Err(e) => {
                    failures += 1;
                    let err = classify(&e, &host);
                    warn!(
                        "Poll {} of {} failed for {}: {}",
                        failures, settings.max_consecutive_failures, host, err
                    );
                    if failures >= settings.max_consecutive_failures {
                        let _ = inbound.send(LinkEvent::Lost(format!(
                            "device stopped answering: {}",
                            err
                        )));
                        return;
                    }
                    break;
                }
            }
        }
    }
}

async fn write_loop(
    client: reqwest::Client,
    url: String,
    host: String,
    mut outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = wait_shutdown(&mut shutdown) => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let result = client
            .put(&url)
            .header(CONTENT_TYPE, PROTOBUF)
            .body(frame.bytes.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status());
        match result {
            Ok(_) => frame.acknowledge(Ok(())),
            Err(e) => {
                let err = classify(&e, &host);
                debug!("PUT toradio to {} failed: {}", host, err);
                frame.acknowledge(Err(err));
            }
        }
    }
}
