//! Error taxonomy shared by transports, the record registry and the connection manager.
//!
//! Every message is written for the operator: the remedy for an untrusted certificate,
//! an unreachable host and a locked serial port differ, so the text says which one it is.

use thiserror::Error;
use uuid::Uuid;

use crate::registry::TransportKind;

/// Failures raised by a transport adapter while opening, probing or using a link.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The medium is not supported by this build or platform.
    #[error("{0} transport is not available on this system")]
    Unavailable(TransportKind),

    /// Liveness probe or open failed.
    #[error("device at {endpoint} is unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },

    /// TLS handshake failed because the device certificate is not trusted.
    #[error("certificate for {endpoint} is not trusted; open https://{endpoint} in a browser and accept the certificate, then retry")]
    UntrustedCertificate { endpoint: String },

    /// The medium needs a user prompt but prompting was not allowed.
    #[error("{endpoint} has not been authorized yet; reconnect with prompting allowed to pair or select it")]
    AuthorizationRequired { endpoint: String },

    /// Serial port held by another process.
    #[error("serial port {port} is locked by another application; close any program using it and retry")]
    ExclusiveAccess { port: String },

    /// The record's endpoint does not belong to the adapter it was handed to.
    #[error("endpoint {endpoint} cannot be opened by the {expected} transport")]
    EndpointMismatch {
        expected: TransportKind,
        endpoint: String,
    },

    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The link was closed before the operation completed.
    #[error("link closed")]
    Closed,
}

/// Failures of the persisted connection registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry file is corrupt: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection {0} not found")]
    NotFound(Uuid),

    #[error("connection {0} already exists")]
    Duplicate(Uuid),
}

/// Errors surfaced by [`crate::manager::ConnectionManager`] commands.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Protocol-level failure after the transport opened.
    #[error("device configuration failed: {0}")]
    HandshakeFailed(String),

    /// Non-fatal; logged and counted, never turned into a state transition.
    #[error("keep-alive failed: {0}")]
    KeepAliveFailed(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("connection {0} not found")]
    RecordNotFound(Uuid),

    /// The record has no live session to carry the request.
    #[error("connection {0} is not connected")]
    NotConnected(Uuid),

    #[error("connection manager has stopped")]
    ManagerStopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_distinguish_remedies() {
        let unreachable = TransportError::Unreachable {
            endpoint: "meshtastic.local".into(),
            reason: "connection refused".into(),
        };
        let cert = TransportError::UntrustedCertificate {
            endpoint: "meshtastic.local".into(),
        };
        let locked = TransportError::ExclusiveAccess {
            port: "/dev/ttyUSB0".into(),
        };
        assert!(unreachable.to_string().contains("unreachable"));
        assert!(cert.to_string().contains("certificate"));
        assert!(!cert.to_string().contains("unreachable"));
        assert!(locked.to_string().contains("locked by another application"));
    }

    #[test]
    fn transport_error_converts_into_connection_error() {
        let err: ConnectionError = TransportError::Unavailable(TransportKind::Wireless).into();
        assert_eq!(
            err.to_string(),
            "wireless transport is not available on this system"
        );
    }
}
